use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use log::{debug, info};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TableError {
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(
        "column \"{column}\" (row {row}): different non-blank values on disk and in memory, \
         cannot store table without losing data"
    )]
    Conflict { column: String, row: usize },

    #[error("table has no backing file")]
    NoBackingFile,
}

/// An ordered table of case rows, mapping column names to string values.
///
/// The number of rows is fixed once a batch starts; only output columns may
/// be added afterwards. An empty cell means "this case has no value for this
/// role".
#[derive(Debug, Clone)]
pub struct CaseTable {
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
    source: Option<PathBuf>,
    loaded_mtime: Option<SystemTime>,
}

impl CaseTable {
    /// Read a table from a CSV file with one header row. The file's location
    /// and modification time are remembered: the location anchors relative
    /// paths, the time drives the merge-on-save check.
    pub fn from_csv(path: impl AsRef<Path>) -> Result<Self, TableError> {
        let path = path.as_ref();
        let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;

        let columns: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            let mut row: Vec<String> = record.iter().map(str::to_string).collect();
            row.resize(columns.len(), String::new());
            rows.push(row);
        }

        let loaded_mtime = fs::metadata(path).and_then(|m| m.modified()).ok();
        info!("Loaded table with {} cases from {}", rows.len(), path.display());

        Ok(CaseTable {
            columns,
            rows,
            source: Some(path.to_path_buf()),
            loaded_mtime,
        })
    }

    /// Build a table that did not originate from a file. Such a table has no
    /// source directory and cannot be saved.
    pub fn from_rows(columns: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        let width = columns.len();
        let mut rows = rows;
        for row in &mut rows {
            row.resize(width, String::new());
        }
        CaseTable {
            columns,
            rows,
            source: None,
            loaded_mtime: None,
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Raw string for a cell, or `None` if the column does not exist.
    pub fn get(&self, row: usize, column: &str) -> Option<&str> {
        let col = self.column_index(column)?;
        self.rows.get(row).map(|r| r[col].as_str())
    }

    /// Add an output column if it is not present yet.
    pub fn add_column(&mut self, name: &str) {
        if self.has_column(name) {
            return;
        }
        self.columns.push(name.to_string());
        for row in &mut self.rows {
            row.push(String::new());
        }
    }

    /// Write a cell value; the column must exist.
    pub fn set(&mut self, row: usize, column: &str, value: &str) {
        if let Some(col) = self.column_index(column)
            && let Some(r) = self.rows.get_mut(row)
        {
            r[col] = value.to_string();
        }
    }

    pub fn has_backing_file(&self) -> bool {
        self.source.is_some()
    }

    /// Directory containing the backing file, used to anchor relative paths.
    pub fn source_dir(&self) -> Option<&Path> {
        self.source.as_deref().and_then(Path::parent)
    }

    /// Store the table back to its backing file.
    ///
    /// If the file on disk changed since it was loaded, the disk contents are
    /// merged in first: a blank in-memory cell may be filled from disk, but a
    /// mismatch between two non-blank values aborts the save. This is
    /// deliberately not auto-resolved to avoid silent data loss.
    pub fn save(&mut self) -> Result<(), TableError> {
        let path = self.source.clone().ok_or(TableError::NoBackingFile)?;

        if let Ok(mtime) = fs::metadata(&path).and_then(|m| m.modified())
            && self.loaded_mtime.is_none_or(|loaded| loaded < mtime)
        {
            info!("Table was changed since loading, merging current table");
            self.merge_from_disk(&path)?;
        }

        let mut writer = csv::Writer::from_path(&path)?;
        writer.write_record(&self.columns)?;
        for row in &self.rows {
            writer.write_record(row)?;
        }
        writer.flush()?;

        self.loaded_mtime = fs::metadata(&path).and_then(|m| m.modified()).ok();
        info!("Table stored at {}", path.display());
        Ok(())
    }

    fn merge_from_disk(&mut self, path: &Path) -> Result<(), TableError> {
        let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
        let disk_columns: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();

        for column in &disk_columns {
            if !self.has_column(column) {
                debug!("Adding column \"{column}\" found on disk");
                self.columns.push(column.clone());
                for row in &mut self.rows {
                    row.push(String::new());
                }
            }
        }

        for (row_idx, record) in reader.records().enumerate() {
            let record = record?;
            if row_idx >= self.rows.len() {
                break;
            }
            for (column, disk_value) in disk_columns.iter().zip(record.iter()) {
                let Some(col) = self.column_index(column) else {
                    continue;
                };
                let current = &self.rows[row_idx][col];
                if current.is_empty() && !disk_value.is_empty() {
                    self.rows[row_idx][col] = disk_value.to_string();
                } else if !current.is_empty() && !disk_value.is_empty() && current != disk_value {
                    return Err(TableError::Conflict {
                        column: column.clone(),
                        row: row_idx + 1,
                    });
                }
            }
        }
        Ok(())
    }
}
