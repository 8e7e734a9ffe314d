use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use dicom::object::open_file;
use dicom_dictionary_std::tags;
use log::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::ColumnMap;
use crate::source::{CaseDefinition, CaseSource, ImageRef, SourceError};
use crate::table::CaseTable;

/// Minimum confidence a plugin must exceed (strictly) to claim a series.
pub const CONFIDENCE_THRESHOLD: f32 = 0.1;

/// A loader strategy for one kind of DICOM series. Plugins are consulted in
/// priority order; each reports how confident it is that it can interpret
/// the series.
pub trait SeriesImportPlugin {
    fn name(&self) -> &'static str;

    /// Confidence in `[0, 1]` that this plugin should load the given files.
    fn examine(&self, files: &[PathBuf]) -> f32;
}

/// Pick the importer for a series: highest confidence wins, ties go to the
/// earlier (higher priority) plugin, and nothing below the threshold is
/// ever selected.
pub fn select_plugin<'a>(
    plugins: &'a [Box<dyn SeriesImportPlugin>],
    files: &[PathBuf],
) -> Option<&'a dyn SeriesImportPlugin> {
    let mut best: Option<(&'a dyn SeriesImportPlugin, f32)> = None;
    for plugin in plugins {
        let confidence = plugin.examine(files);
        debug!("Plugin {} reports confidence {confidence}", plugin.name());
        let to_beat = best.map(|(_, c)| c).unwrap_or(CONFIDENCE_THRESHOLD);
        if confidence > to_beat {
            best = Some((plugin.as_ref(), confidence));
        }
    }
    best.map(|(plugin, _)| plugin)
}

/// Importer for 4D acquisitions carrying multiple temporal positions.
#[derive(Debug, Default)]
pub struct MultiVolumePlugin;

impl SeriesImportPlugin for MultiVolumePlugin {
    fn name(&self) -> &'static str {
        "MultiVolume"
    }

    fn examine(&self, files: &[PathBuf]) -> f32 {
        let Some(first) = files.first() else {
            return 0.0;
        };
        let Ok(object) = open_file(first) else {
            return 0.0;
        };
        let temporal_positions = object
            .element(tags::NUMBER_OF_TEMPORAL_POSITIONS)
            .ok()
            .and_then(|e| e.to_int::<i32>().ok())
            .unwrap_or(1);
        if temporal_positions > 1 { 0.9 } else { 0.0 }
    }
}

/// Fallback importer for plain scalar volumes.
#[derive(Debug, Default)]
pub struct ScalarVolumePlugin;

impl SeriesImportPlugin for ScalarVolumePlugin {
    fn name(&self) -> &'static str {
        "ScalarVolume"
    }

    fn examine(&self, files: &[PathBuf]) -> f32 {
        if files.is_empty() { 0.0 } else { 0.5 }
    }
}

/// Metadata index over a directory tree of DICOM files.
///
/// Only header tags are read during indexing; pixel data stays on disk until
/// the host loads a series. Files the DICOM parser rejects are skipped with
/// a warning so one stray file never blocks a whole import.
#[derive(Debug, Default)]
pub struct DicomDatabase {
    series_files: BTreeMap<String, Vec<(i32, PathBuf)>>,
    series_study: BTreeMap<String, String>,
    series_description: BTreeMap<String, String>,
    study_patient: BTreeMap<String, String>,
    patient_name: BTreeMap<String, String>,
}

/// DICOM string values are space padded to even length.
fn trimmed(value: &str) -> String {
    value
        .trim_matches(|c: char| c.is_whitespace() || c == '\0')
        .to_string()
}

impl DicomDatabase {
    /// Index all DICOM files under `root`, recursively.
    pub fn index_directory(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} is not a directory", root.display()),
            ));
        }

        let mut database = DicomDatabase::default();
        let mut indexed = 0usize;
        for entry in WalkDir::new(root) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("Skipping unreadable entry: {err}");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            if database.index_file(entry.path()) {
                indexed += 1;
            }
        }

        info!(
            "Indexed {indexed} DICOM files in {} series under {}",
            database.series_files.len(),
            root.display()
        );
        Ok(database)
    }

    /// Read one file's header and record it. Returns false for files the
    /// parser rejects.
    fn index_file(&mut self, path: &Path) -> bool {
        let object = match open_file(path) {
            Ok(object) => object,
            Err(err) => {
                debug!("Not a DICOM file, skipping {}: {err}", path.display());
                return false;
            }
        };

        let string_tag = |tag| {
            object
                .element(tag)
                .ok()
                .and_then(|e| e.to_str().ok())
                .map(|v| trimmed(&v))
        };

        let Some(series) = string_tag(tags::SERIES_INSTANCE_UID).filter(|v| !v.is_empty()) else {
            warn!("File {} has no series UID, skipping", path.display());
            return false;
        };
        let instance = object
            .element(tags::INSTANCE_NUMBER)
            .ok()
            .and_then(|e| e.to_int::<i32>().ok())
            .unwrap_or(0);

        self.series_files
            .entry(series.clone())
            .or_default()
            .push((instance, path.to_path_buf()));

        if let Some(study) = string_tag(tags::STUDY_INSTANCE_UID) {
            if let Some(patient) = string_tag(tags::PATIENT_ID) {
                if let Some(name) = string_tag(tags::PATIENT_NAME) {
                    self.patient_name.entry(patient.clone()).or_insert(name);
                }
                self.study_patient.entry(study.clone()).or_insert(patient);
            }
            self.series_study.entry(series.clone()).or_insert(study);
        }
        if let Some(description) = string_tag(tags::SERIES_DESCRIPTION) {
            self.series_description.entry(series).or_insert(description);
        }
        true
    }

    /// Files of a series in instance-number order. Empty for unknown series.
    pub fn files_for_series(&self, series: &str) -> Vec<PathBuf> {
        let Some(files) = self.series_files.get(series) else {
            return Vec::new();
        };
        let mut files = files.clone();
        files.sort_by_key(|(instance, _)| *instance);
        files.into_iter().map(|(_, path)| path).collect()
    }

    pub fn study_for_series(&self, series: &str) -> Option<&str> {
        self.series_study.get(series).map(String::as_str)
    }

    pub fn description_for_series(&self, series: &str) -> Option<&str> {
        self.series_description.get(series).map(String::as_str)
    }

    pub fn patient_for_study(&self, study: &str) -> Option<&str> {
        self.study_patient.get(study).map(String::as_str)
    }

    pub fn name_for_patient(&self, patient: &str) -> Option<&str> {
        self.patient_name.get(patient).map(String::as_str)
    }

    /// Display name for the patient a series belongs to, when the chain of
    /// metadata is complete.
    pub fn patient_label(&self, series: &str) -> Option<&str> {
        let study = self.study_for_series(series)?;
        let patient = self.patient_for_study(study)?;
        self.name_for_patient(patient)
    }

    #[cfg(test)]
    pub(crate) fn insert_series(
        &mut self,
        series: &str,
        study: &str,
        patient: &str,
        name: &str,
        description: &str,
        files: Vec<(i32, PathBuf)>,
    ) {
        self.series_files.insert(series.to_string(), files);
        self.series_study
            .insert(series.to_string(), study.to_string());
        self.series_description
            .insert(series.to_string(), description.to_string());
        self.study_patient
            .insert(study.to_string(), patient.to_string());
        self.patient_name
            .insert(patient.to_string(), name.to_string());
    }
}

/// DICOM variant of a case source: image columns hold series instance UIDs
/// resolved against an indexed database, while mask columns still hold local
/// file paths relative to the table's directory.
pub struct DicomTableSource {
    table: CaseTable,
    columns: ColumnMap,
    database: DicomDatabase,
    plugins: Vec<Box<dyn SeriesImportPlugin>>,
}

impl DicomTableSource {
    /// Uses the standard plugin stack: multi-volume first, scalar fallback.
    pub fn new(
        table: CaseTable,
        columns: ColumnMap,
        database: DicomDatabase,
    ) -> Result<Self, SourceError> {
        Self::with_plugins(
            table,
            columns,
            database,
            vec![Box::new(MultiVolumePlugin), Box::new(ScalarVolumePlugin)],
        )
    }

    pub fn with_plugins(
        table: CaseTable,
        columns: ColumnMap,
        database: DicomDatabase,
        plugins: Vec<Box<dyn SeriesImportPlugin>>,
    ) -> Result<Self, SourceError> {
        columns.validate(&table)?;
        Ok(DicomTableSource {
            table,
            columns,
            database,
            plugins,
        })
    }

    fn cell(&self, index: usize, column: &str) -> Option<&str> {
        self.table.get(index, column).filter(|v| !v.is_empty())
    }

    /// Resolve a series UID to an importable file list.
    fn series_ref(&self, uid: &str) -> Result<ImageRef, SourceError> {
        let files = self.database.files_for_series(uid);
        if files.is_empty() {
            return Err(SourceError::EmptySeries {
                uid: uid.to_string(),
            });
        }
        if select_plugin(&self.plugins, &files).is_none() {
            return Err(SourceError::NoConfidentImporter {
                uid: uid.to_string(),
            });
        }
        let description = self
            .database
            .description_for_series(uid)
            .unwrap_or(uid)
            .to_string();
        Ok(ImageRef::Series { description, files })
    }

    /// Mask paths come from the local filesystem, anchored at the table.
    fn mask_path(&self, filename: &str) -> Option<PathBuf> {
        if filename.is_empty() {
            return None;
        }
        let path = Path::new(filename);
        if path.is_absolute() {
            return Some(path.to_path_buf());
        }
        let joined = match self.table.source_dir() {
            Some(dir) => dir.join(path),
            None => path.to_path_buf(),
        };
        Some(std::path::absolute(&joined).unwrap_or(joined))
    }
}

impl CaseSource for DicomTableSource {
    fn case_count(&self) -> usize {
        self.table.row_count()
    }

    fn definition(&self, index: usize) -> Result<CaseDefinition, SourceError> {
        let count = self.case_count();
        if index >= count {
            return Err(SourceError::OutOfRange { index, count });
        }

        let image_uid =
            self.cell(index, &self.columns.image)
                .ok_or_else(|| SourceError::MissingImage {
                    row: index + 1,
                    column: self.columns.image.clone(),
                })?;
        let image = self.series_ref(image_uid)?;
        let label = self.database.patient_label(image_uid).map(str::to_string);

        let mask = self
            .columns
            .mask
            .as_deref()
            .and_then(|c| self.cell(index, c))
            .and_then(|v| self.mask_path(v));

        // Secondary series are best-effort: a broken one costs a warning,
        // not the case.
        let mut additional_images = Vec::new();
        for column in &self.columns.additional_images {
            let Some(uid) = self.cell(index, column) else {
                continue;
            };
            match self.series_ref(uid) {
                Ok(image_ref) => additional_images.push(image_ref),
                Err(err) => warn!("Row {}: {err}, skipping", index + 1),
            }
        }

        let mut additional_masks = Vec::new();
        for column in &self.columns.additional_masks {
            if let Some(path) = self.cell(index, column).and_then(|v| self.mask_path(v)) {
                additional_masks.push(path);
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

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedConfidence(&'static str, f32);

    impl SeriesImportPlugin for FixedConfidence {
        fn name(&self) -> &'static str {
            self.0
        }

        fn examine(&self, _files: &[PathBuf]) -> f32 {
            self.1
        }
    }

    fn files() -> Vec<PathBuf> {
        vec![PathBuf::from("/dicom/a.dcm")]
    }

    #[test]
    fn selection_requires_confidence_above_threshold() {
        let plugins: Vec<Box<dyn SeriesImportPlugin>> = vec![
            Box::new(FixedConfidence("low", 0.05)),
            Box::new(FixedConfidence("at-threshold", CONFIDENCE_THRESHOLD)),
        ];
        assert!(select_plugin(&plugins, &files()).is_none());
    }

    #[test]
    fn highest_confidence_wins() {
        let plugins: Vec<Box<dyn SeriesImportPlugin>> = vec![
            Box::new(FixedConfidence("weak", 0.4)),
            Box::new(FixedConfidence("strong", 0.9)),
        ];
        let plugin = select_plugin(&plugins, &files()).unwrap();
        assert_eq!(plugin.name(), "strong");
    }

    #[test]
    fn ties_go_to_the_higher_priority_plugin() {
        let plugins: Vec<Box<dyn SeriesImportPlugin>> = vec![
            Box::new(FixedConfidence("first", 0.5)),
            Box::new(FixedConfidence("second", 0.5)),
        ];
        let plugin = select_plugin(&plugins, &files()).unwrap();
        assert_eq!(plugin.name(), "first");
    }

    #[test]
    fn scalar_plugin_accepts_any_nonempty_series() {
        let plugin = ScalarVolumePlugin;
        assert_eq!(plugin.examine(&files()), 0.5);
        assert_eq!(plugin.examine(&[]), 0.0);
    }

    #[test]
    fn database_orders_files_by_instance_number() {
        let mut database = DicomDatabase::default();
        database.insert_series(
            "1.2.3",
            "study-1",
            "pat-1",
            "Doe^John",
            "T2 ax",
            vec![
                (3, PathBuf::from("/d/c.dcm")),
                (1, PathBuf::from("/d/a.dcm")),
                (2, PathBuf::from("/d/b.dcm")),
            ],
        );

        assert_eq!(
            database.files_for_series("1.2.3"),
            vec![
                PathBuf::from("/d/a.dcm"),
                PathBuf::from("/d/b.dcm"),
                PathBuf::from("/d/c.dcm"),
            ]
        );
        assert_eq!(database.patient_label("1.2.3"), Some("Doe^John"));
        assert_eq!(database.description_for_series("1.2.3"), Some("T2 ax"));
        assert!(database.files_for_series("9.9.9").is_empty());
    }

    #[test]
    fn empty_series_fails_the_case() {
        let table = CaseTable::from_rows(
            vec!["image".into()],
            vec![vec!["1.2.3".into()]],
        );
        let source = DicomTableSource::with_plugins(
            table,
            ColumnMap {
                root: None,
                mask: None,
                ..ColumnMap::default()
            },
            DicomDatabase::default(),
            vec![Box::new(FixedConfidence("any", 0.9))],
        )
        .unwrap();

        assert!(matches!(
            source.definition(0),
            Err(SourceError::EmptySeries { .. })
        ));
    }

    #[test]
    fn unclaimed_main_series_fails_the_case() {
        let mut database = DicomDatabase::default();
        database.insert_series(
            "1.2.3",
            "study-1",
            "pat-1",
            "Doe^John",
            "T2 ax",
            vec![(1, PathBuf::from("/d/a.dcm"))],
        );
        let table = CaseTable::from_rows(
            vec!["image".into()],
            vec![vec!["1.2.3".into()]],
        );
        let source = DicomTableSource::with_plugins(
            table,
            ColumnMap {
                root: None,
                mask: None,
                ..ColumnMap::default()
            },
            database,
            vec![Box::new(FixedConfidence("timid", 0.05))],
        )
        .unwrap();

        assert!(matches!(
            source.definition(0),
            Err(SourceError::NoConfidentImporter { .. })
        ));
    }

    #[test]
    fn resolved_case_carries_series_and_patient_label() {
        let mut database = DicomDatabase::default();
        database.insert_series(
            "1.2.3",
            "study-1",
            "pat-1",
            "Doe^John",
            "T2 ax",
            vec![(2, PathBuf::from("/d/b.dcm")), (1, PathBuf::from("/d/a.dcm"))],
        );
        let table = CaseTable::from_rows(
            vec!["image".into(), "mask".into()],
            vec![vec!["1.2.3".into(), "/masks/m.seg.nrrd".into()]],
        );
        let source = DicomTableSource::with_plugins(
            table,
            ColumnMap {
                root: None,
                ..ColumnMap::default()
            },
            database,
            vec![Box::new(FixedConfidence("any", 0.9))],
        )
        .unwrap();

        let definition = source.definition(0).unwrap();
        assert_eq!(definition.label.as_deref(), Some("Doe^John"));
        assert_eq!(definition.mask, Some(PathBuf::from("/masks/m.seg.nrrd")));
        match definition.image {
            ImageRef::Series { description, files } => {
                assert_eq!(description, "T2 ax");
                assert_eq!(files[0], PathBuf::from("/d/a.dcm"));
            }
            ImageRef::File(_) => panic!("expected a series reference"),
        }
    }
}
