use thiserror::Error;

use crate::iterator::CaseHandle;
use crate::scene::ScenePort;

/// Failure raised by an observer; aborts the transition that triggered it.
#[derive(Debug, Error)]
#[error("observer failed: {0}")]
pub struct ObserverError(pub String);

/// Hook into case lifecycle transitions, for host-side concerns such as
/// screenshot capture or annotation panels. Observers run in registration
/// order; an error from one aborts the transition and is reported to the
/// caller.
pub trait CaseObserver {
    /// A case has been fully materialized in the scene.
    fn on_case_loaded(
        &mut self,
        scene: &mut dyn ScenePort,
        case: &CaseHandle,
    ) -> Result<(), ObserverError>;

    /// The current case is about to be saved and torn down. The scene still
    /// contains all its nodes.
    fn on_case_about_to_close(
        &mut self,
        scene: &mut dyn ScenePort,
        case: &CaseHandle,
    ) -> Result<(), ObserverError>;
}
