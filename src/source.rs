use std::path::{Path, PathBuf};

use log::debug;
use thiserror::Error;

use crate::config::{ColumnMap, ConfigError, RootSpec, detect_patient_column, resolve_root};
use crate::table::CaseTable;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("case index {index} is out of range ({count} cases)")]
    OutOfRange { index: usize, count: usize },

    #[error("row {row}: no value in mandatory image column \"{column}\"")]
    MissingImage { row: usize, column: String },

    #[error("series {uid} has no files")]
    EmptySeries { uid: String },

    #[error("no import plugin matched series {uid} with sufficient confidence")]
    NoConfidentImporter { uid: String },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Reference to the main image of a case: either a single local file or an
/// ordered DICOM series file list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageRef {
    File(PathBuf),
    Series {
        description: String,
        files: Vec<PathBuf>,
    },
}

/// Resolved file references for one case, produced by a [`CaseSource`].
/// Sources know nothing about scene nodes; materialization is the
/// iterator's job.
#[derive(Debug, Clone)]
pub struct CaseDefinition {
    pub index: usize,
    /// Patient/ID display name, when the table has one.
    pub label: Option<String>,
    pub image: ImageRef,
    pub mask: Option<PathBuf>,
    pub additional_images: Vec<ImageRef>,
    pub additional_masks: Vec<PathBuf>,
}

/// Abstracts "a table of N cases" over its concrete input source: local file
/// paths or DICOM series lookups.
pub trait CaseSource {
    fn case_count(&self) -> usize;

    /// Resolve the file references for one case. Fails for an out-of-range
    /// index or a blank mandatory image cell; optional roles resolve to
    /// nothing silently.
    fn definition(&self, index: usize) -> Result<CaseDefinition, SourceError>;

    fn table(&self) -> &CaseTable;

    /// Mutable table access for output-column augmentation.
    fn table_mut(&mut self) -> &mut CaseTable;

    /// Whether the scene should be closed entirely before loading `next`.
    /// Returning false keeps images loaded and prunes only mask nodes, for
    /// evaluating several masks against the same image.
    fn should_close(&self, _next: usize) -> bool {
        true
    }
}

/// Local-file variant: each row holds paths relative to a per-case or
/// global root directory.
pub struct CsvTableSource {
    table: CaseTable,
    columns: ColumnMap,
    root: RootSpec,
    patient_column: Option<String>,
}

impl CsvTableSource {
    /// Validates the column map against the table (fail fast) and resolves
    /// the root specification once for the whole batch.
    pub fn new(table: CaseTable, columns: ColumnMap) -> Result<Self, SourceError> {
        columns.validate(&table)?;
        let root = resolve_root(columns.root.as_deref(), &table);
        let patient_column = detect_patient_column(&table);
        Ok(CsvTableSource {
            table,
            columns,
            root,
            patient_column,
        })
    }

    /// Resolve a filename from the table into an absolute path.
    ///
    /// Precedence: an absolute filename is returned as-is; otherwise it is
    /// joined with the per-case root (returned directly if that result is
    /// absolute); otherwise it is joined with the table's own directory and
    /// normalized to an absolute path.
    pub fn build_path(&self, filename: &str, case_root: Option<&Path>) -> Option<PathBuf> {
        if filename.is_empty() {
            return None;
        }

        let path = Path::new(filename);
        if path.is_absolute() {
            return Some(path.to_path_buf());
        }

        let mut joined = PathBuf::from(filename);
        if let Some(root) = case_root {
            joined = root.join(joined);
            if joined.is_absolute() {
                return Some(joined);
            }
        }

        if let Some(dir) = self.table.source_dir() {
            joined = dir.join(joined);
        }

        Some(std::path::absolute(&joined).unwrap_or(joined))
    }

    /// The per-case root for a row, following the batch's [`RootSpec`].
    fn case_root(&self, index: usize) -> Option<PathBuf> {
        match &self.root {
            RootSpec::Column(column) => self
                .table
                .get(index, column)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            RootSpec::Directory(dir) => Some(dir.clone()),
            RootSpec::None => None,
        }
    }

    fn cell(&self, index: usize, column: &str) -> Option<&str> {
        self.table.get(index, column).filter(|v| !v.is_empty())
    }
}

impl CaseSource for CsvTableSource {
    fn case_count(&self) -> usize {
        self.table.row_count()
    }

    fn definition(&self, index: usize) -> Result<CaseDefinition, SourceError> {
        let count = self.case_count();
        if index >= count {
            return Err(SourceError::OutOfRange { index, count });
        }

        let label = self
            .patient_column
            .as_deref()
            .and_then(|c| self.cell(index, c))
            .map(str::to_string);

        let case_root = self.case_root(index);
        let root = case_root.as_deref();

        let image = self
            .cell(index, &self.columns.image)
            .and_then(|value| self.build_path(value, root))
            .map(ImageRef::File)
            .ok_or_else(|| SourceError::MissingImage {
                row: index + 1,
                column: self.columns.image.clone(),
            })?;

        let mask = self
            .columns
            .mask
            .as_deref()
            .and_then(|c| self.cell(index, c))
            .and_then(|v| self.build_path(v, root));

        let mut additional_images = Vec::new();
        for column in &self.columns.additional_images {
            match self.cell(index, column).and_then(|v| self.build_path(v, root)) {
                Some(path) => additional_images.push(ImageRef::File(path)),
                None => debug!("Row {}: no value for additional image column {column}", index + 1),
            }
        }

        let mut additional_masks = Vec::new();
        for column in &self.columns.additional_masks {
            match self.cell(index, column).and_then(|v| self.build_path(v, root)) {
                Some(path) => additional_masks.push(path),
                None => debug!("Row {}: no value for additional mask column {column}", index + 1),
            }
        }

        Ok(CaseDefinition {
            index,
            label,
            image,
            mask,
            additional_images,
            additional_masks,
        })
    }

    fn table(&self) -> &CaseTable {
        &self.table
    }

    fn table_mut(&mut self) -> &mut CaseTable {
        &mut self.table
    }
}
