use std::path::{Path, PathBuf};

use log::warn;
use thiserror::Error;

use crate::table::CaseTable;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no image column configured, cannot start batch")]
    NoImageColumn,

    #[error("unable to find column \"{column}\" (role {role})")]
    MissingColumn { role: &'static str, column: String },
}

/// Maps logical case roles to column names in the batch table.
///
/// Resolved and validated once at batch start: a configured column that is
/// missing from the table fails the whole batch start, while an empty *value*
/// in a row is a soft per-case skip. The `root` entry is special: it may name
/// a column, or be a directory literal (see [`RootSpec`]).
#[derive(Debug, Clone)]
pub struct ColumnMap {
    pub root: Option<String>,
    pub image: String,
    pub mask: Option<String>,
    pub additional_images: Vec<String>,
    pub additional_masks: Vec<String>,
}

impl Default for ColumnMap {
    fn default() -> Self {
        ColumnMap {
            root: Some("path".to_string()),
            image: "image".to_string(),
            mask: Some("mask".to_string()),
            additional_images: Vec::new(),
            additional_masks: Vec::new(),
        }
    }
}

impl ColumnMap {
    /// Fail-fast validation against the table header. The root entry is
    /// exempt because it may be a directory literal instead of a column name.
    pub fn validate(&self, table: &CaseTable) -> Result<(), ConfigError> {
        if self.image.is_empty() {
            return Err(ConfigError::NoImageColumn);
        }
        Self::check(table, "image", &self.image)?;
        if let Some(mask) = &self.mask {
            Self::check(table, "mask", mask)?;
        }
        for column in &self.additional_images {
            Self::check(table, "additionalImages", column)?;
        }
        for column in &self.additional_masks {
            Self::check(table, "additionalMasks", column)?;
        }
        Ok(())
    }

    fn check(table: &CaseTable, role: &'static str, column: &str) -> Result<(), ConfigError> {
        if table.has_column(column) {
            Ok(())
        } else {
            Err(ConfigError::MissingColumn {
                role,
                column: column.to_string(),
            })
        }
    }
}

/// How the case root directory is obtained for each row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootSpec {
    /// A table column holds the per-case root.
    Column(String),
    /// One directory for the whole batch.
    Directory(PathBuf),
    None,
}

/// Resolve the configured root entry. Precedence: a column of that name in
/// the table, then an absolute directory literal, then a directory relative
/// to the table's own location.
pub fn resolve_root(root: Option<&str>, table: &CaseTable) -> RootSpec {
    let Some(root) = root.filter(|r| !r.is_empty()) else {
        return RootSpec::None;
    };

    if table.has_column(root) {
        return RootSpec::Column(root.to_string());
    }

    let literal = Path::new(root);
    if literal.is_absolute() && literal.is_dir() {
        return RootSpec::Directory(literal.to_path_buf());
    }

    if let Some(dir) = table.source_dir() {
        let joined = dir.join(literal);
        if joined.is_dir() {
            return RootSpec::Directory(joined);
        }
    }

    warn!("Root \"{root}\" is neither a column nor a directory, ignoring");
    RootSpec::None
}

/// Column used for case display names: `patient`, or `ID` as fallback.
pub fn detect_patient_column(table: &CaseTable) -> Option<String> {
    ["patient", "ID"]
        .into_iter()
        .find(|c| table.has_column(c))
        .map(str::to_string)
}

/// When the output table is written back to its file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AutoSave {
    #[default]
    Off,
    EachCase,
    BatchEnd,
}

/// Per-batch behavior flags, fixed when the batch starts.
#[derive(Debug, Clone)]
pub struct BatchSettings {
    /// Human annotator name, appended to saved mask filenames and output
    /// column names.
    pub reader: Option<String>,
    /// Persist masks that were part of the original load set on case close.
    pub save_loaded_masks: bool,
    /// Persist masks the user created from scratch on case close.
    pub save_new_masks: bool,
    /// Switch the host into the segmentation editor when a case is loaded.
    pub auto_redirect: bool,
    /// Record per-case editing time into a timing column.
    pub keep_time: bool,
    pub auto_save: AutoSave,
}

impl Default for BatchSettings {
    fn default() -> Self {
        BatchSettings {
            reader: None,
            save_loaded_masks: false,
            save_new_masks: true,
            auto_redirect: true,
            keep_time: false,
            auto_save: AutoSave::Off,
        }
    }
}

impl BatchSettings {
    /// Output column name with the reader suffix, e.g. `mask-out_alice`.
    pub fn output_column(&self, base: &str) -> String {
        match self.reader.as_deref() {
            Some(reader) if !reader.is_empty() => format!("{base}_{reader}"),
            _ => base.to_string(),
        }
    }
}
