//! # case-iterator
//!
//! Case-by-case batch iteration over medical imaging studies, for reviewing
//! and editing segmentations one case at a time inside a host viewer.
//!
//! A batch is a table with one row per case. Columns name the main image,
//! an optional main mask and any number of additional images and masks;
//! image references are either local file paths or DICOM series UIDs
//! resolved against an indexed [`DicomDatabase`]. The [`CaseIterator`]
//! materializes exactly one case at a time into the host scene, and the
//! [`BatchController`] steps through the batch, times each case and writes
//! the saved mask path and editing time back into the table.
//!
//! The host viewer is reached through two small traits: [`ScenePort`] for
//! scene and storage operations, and [`SegmentationBackend`] for whichever
//! generation of segmentation editor the host runs. Both have in-memory
//! implementations in the test suite, so the whole iteration logic is
//! testable without a host.
//!
//! # Examples
//!
//! ```no_run
//! # use case_iterator::{
//! #     BatchController, BatchSettings, CaseIterator, CaseTable, ColumnMap,
//! #     CsvTableSource, SegmentEditorBackend,
//! # };
//! # fn scene() -> Box<dyn case_iterator::ScenePort> { unimplemented!() }
//! let table = CaseTable::from_csv("batch.csv").expect("readable batch table");
//! let source = CsvTableSource::new(table, ColumnMap::default())
//!     .expect("configured columns present in the table");
//! let iterator = CaseIterator::new(Box::new(source), Box::new(SegmentEditorBackend), scene());
//!
//! let mut controller = BatchController::new(iterator, BatchSettings::default());
//! controller.start(1).expect("batch starts at the first case");
//! controller.next_case().expect("step to the second case");
//! ```
//!
//! [`DicomDatabase`]: dicom_source::DicomDatabase

pub mod backend;
pub mod config;
pub mod controller;
pub mod dicom_source;
pub mod events;
pub mod iterator;
pub mod prefs;
pub mod scene;
pub mod source;
pub mod table;

#[cfg(test)]
pub mod test_helpers;

pub use backend::{LabelmapBackend, SegmentEditorBackend, SegmentationBackend};
pub use config::{AutoSave, BatchSettings, ColumnMap};
pub use controller::{BatchController, BatchEvent, ControllerError};
pub use dicom_source::{DicomDatabase, DicomTableSource, SeriesImportPlugin};
pub use events::{CaseObserver, ObserverError};
pub use iterator::{CaseHandle, CaseIterator, IteratorError};
pub use prefs::UserPreferences;
pub use scene::{NodeId, NodeKind, SceneError, ScenePort};
pub use source::{CaseDefinition, CaseSource, CsvTableSource, ImageRef, SourceError};
pub use table::{CaseTable, TableError};
