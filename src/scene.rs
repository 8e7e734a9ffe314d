use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SceneError {
    #[error("failed to load {path}: {reason}")]
    LoadFailed { path: PathBuf, reason: String },

    #[error("failed to save node to {path}: {reason}")]
    SaveFailed { path: PathBuf, reason: String },

    #[error("node {0:?} is not present in the scene")]
    UnknownNode(NodeId),

    #[error("representation conversion failed: {0}")]
    ConversionFailed(String),

    #[error("operation not supported by this backend: {0}")]
    Unsupported(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Opaque handle to a node owned by the host scene. The iterator never holds
/// pixel buffers, only identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Volume,
    LabelVolume,
    Segmentation,
}

/// Abstraction over the host application's scene graph.
///
/// The host scene is a global singleton in the real viewer; injecting it
/// behind this trait keeps the iterator core testable without the host. The
/// port is the actual owner of node resources, the crate only tracks
/// [`NodeId`]s. All methods run on the host's UI thread; there is no locking.
pub trait ScenePort {
    /// Load a volume file and add it to the scene.
    fn load_volume(&mut self, path: &Path) -> Result<NodeId, SceneError>;

    /// Load an ordered DICOM series file list as a single volume.
    fn load_series(&mut self, description: &str, files: &[PathBuf]) -> Result<NodeId, SceneError>;

    /// Load a region label volume file.
    fn load_label_volume(&mut self, path: &Path) -> Result<NodeId, SceneError>;

    /// Load a segmentation-format mask file.
    fn load_segmentation(&mut self, path: &Path) -> Result<NodeId, SceneError>;

    /// Create an empty segmentation geometrically aligned with `reference`.
    fn new_segmentation(&mut self, name: &str, reference: NodeId) -> Result<NodeId, SceneError>;

    /// Convert a label volume into a new segmentation node. The label node is
    /// left in the scene; callers remove it once the import succeeded.
    fn import_labelmap(
        &mut self,
        label: NodeId,
        reference: Option<NodeId>,
    ) -> Result<NodeId, SceneError>;

    /// Convert a segmentation into a new label volume node.
    fn export_labelmap(&mut self, segmentation: NodeId) -> Result<NodeId, SceneError>;

    /// Write a node to disk at `path`.
    fn save_node(&mut self, node: NodeId, path: &Path) -> Result<(), SceneError>;

    fn remove_node(&mut self, node: NodeId);

    /// Clear the whole scene and reinitialize it.
    fn clear(&mut self);

    /// Enumerate nodes of one kind, in scene order.
    fn nodes_by_kind(&self, kind: NodeKind) -> Vec<NodeId>;

    fn node_name(&self, node: NodeId) -> Option<String>;

    fn set_node_name(&mut self, node: NodeId, name: &str);

    /// The storage filename the node was read from or last written to, if any.
    fn node_file(&self, node: NodeId) -> Option<PathBuf>;

    fn set_node_file(&mut self, node: NodeId, path: &Path);

    /// Name of the host tool module currently active, if any.
    fn selected_module(&self) -> Option<&str>;

    fn select_module(&mut self, module: &str);

    fn deselect_module(&mut self);

    /// Bind the active editor to an image and an optional mask.
    fn bind_editor(&mut self, image: NodeId, mask: Option<NodeId>);

    /// Cooperative yield so the host can repaint during preload loops.
    fn process_pending_events(&mut self) {}
}
