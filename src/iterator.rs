use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};
use thiserror::Error;

use crate::backend::SegmentationBackend;
use crate::events::{CaseObserver, ObserverError};
use crate::scene::{NodeId, NodeKind, SceneError, ScenePort};
use crate::source::{CaseSource, ImageRef, SourceError};

#[derive(Debug, Error)]
pub enum IteratorError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("main image file {0} does not exist")]
    MissingImageFile(PathBuf),

    #[error("failed to load main image {path}: {source}")]
    MainImage { path: PathBuf, source: SceneError },

    #[error("a case is still loaded, close it before loading another")]
    CaseStillLoaded,

    #[error("no case is loaded")]
    NoCaseLoaded,

    #[error(transparent)]
    Scene(#[from] SceneError),

    #[error(transparent)]
    Observer(#[from] ObserverError),
}

/// Scene nodes belonging to the currently materialized case.
#[derive(Debug, Clone)]
pub struct CaseHandle {
    pub index: usize,
    pub image: NodeId,
    /// Main mask, when the case brought one.
    pub mask: Option<NodeId>,
    pub additional_images: Vec<NodeId>,
    pub additional_masks: Vec<NodeId>,
    /// Directory of the main image, fallback target for saved masks.
    pub case_folder: PathBuf,
}

impl CaseHandle {
    /// All mask nodes that were part of the original load set, as opposed to
    /// masks the user created afterwards.
    pub fn loaded_masks(&self) -> Vec<NodeId> {
        self.mask
            .into_iter()
            .chain(self.additional_masks.iter().copied())
            .collect()
    }
}

/// Materializes one case at a time into the host scene.
///
/// The iterator owns its ports and enforces the core ordering rule: the
/// current case is always closed before another one is loaded. It has no
/// notion of position or direction; stepping lives in the batch controller.
pub struct CaseIterator {
    source: Box<dyn CaseSource>,
    backend: Box<dyn SegmentationBackend>,
    scene: Box<dyn ScenePort>,
    observers: Vec<Box<dyn CaseObserver>>,
    reader: Option<String>,
    auto_redirect: bool,
    current: Option<CaseHandle>,
}

impl CaseIterator {
    pub fn new(
        source: Box<dyn CaseSource>,
        backend: Box<dyn SegmentationBackend>,
        scene: Box<dyn ScenePort>,
    ) -> Self {
        CaseIterator {
            source,
            backend,
            scene,
            observers: Vec::new(),
            reader: None,
            auto_redirect: true,
            current: None,
        }
    }

    /// Annotator name appended to saved mask filenames.
    pub fn with_reader(mut self, reader: Option<String>) -> Self {
        self.reader = reader.filter(|r| !r.is_empty());
        self
    }

    /// Whether loading a case switches the host into the editor module.
    pub fn with_auto_redirect(mut self, auto_redirect: bool) -> Self {
        self.auto_redirect = auto_redirect;
        self
    }

    pub fn add_observer(&mut self, observer: Box<dyn CaseObserver>) {
        self.observers.push(observer);
    }

    pub fn current(&self) -> Option<&CaseHandle> {
        self.current.as_ref()
    }

    pub fn source(&self) -> &dyn CaseSource {
        self.source.as_ref()
    }

    pub fn source_mut(&mut self) -> &mut dyn CaseSource {
        self.source.as_mut()
    }

    pub fn scene_mut(&mut self) -> &mut dyn ScenePort {
        self.scene.as_mut()
    }

    /// Load case `index` into the scene. The main image is mandatory; masks
    /// and additional images are best-effort. On any failure the scene is
    /// cleared again so no half-loaded case lingers.
    pub fn load_case(&mut self, index: usize) -> Result<&CaseHandle, IteratorError> {
        if self.current.is_some() {
            return Err(IteratorError::CaseStillLoaded);
        }

        let handle = match self.materialize(index) {
            Ok(handle) => handle,
            Err(err) => {
                self.scene.clear();
                return Err(err);
            }
        };

        for observer in &mut self.observers {
            if let Err(err) = observer.on_case_loaded(&mut *self.scene, &handle) {
                self.scene.clear();
                return Err(err.into());
            }
        }

        // Installed last: a handle only ever refers to a complete case.
        Ok(self.current.insert(handle))
    }

    fn materialize(&mut self, index: usize) -> Result<CaseHandle, IteratorError> {
        let definition = self.source.definition(index)?;
        if let Some(label) = &definition.label {
            info!("Loading case {} (patient {label})", index + 1);
        } else {
            info!("Loading case {}", index + 1);
        }

        let (image, case_folder) = self.load_image(&definition.image)?;

        let mut additional_images = Vec::new();
        for image_ref in &definition.additional_images {
            match self.load_image(image_ref) {
                Ok((node, _)) => additional_images.push(node),
                Err(err) => warn!("Skipping additional image: {err}"),
            }
        }

        let mask = definition
            .mask
            .as_deref()
            .and_then(|path| self.backend.load_mask(&mut *self.scene, path, Some(image)));

        let mut additional_masks = Vec::new();
        for path in &definition.additional_masks {
            if let Some(node) = self.backend.load_mask(&mut *self.scene, path, None) {
                additional_masks.push(node);
            }
        }

        if self.auto_redirect {
            self.backend.enter_module(&mut *self.scene, image, mask);
        }

        Ok(CaseHandle {
            index,
            image,
            mask,
            additional_images,
            additional_masks,
            case_folder,
        })
    }

    /// A volume still in the scene for this reference, left over from a
    /// close that kept the scene. Files match on their storage path, series
    /// on the node name the series loader assigned.
    fn loaded_volume_for(&self, image_ref: &ImageRef) -> Option<NodeId> {
        self.scene
            .nodes_by_kind(NodeKind::Volume)
            .into_iter()
            .find(|node| match image_ref {
                ImageRef::File(path) => {
                    self.scene.node_file(*node).as_deref() == Some(path.as_path())
                }
                ImageRef::Series { description, .. } => {
                    self.scene.node_file(*node).is_none()
                        && self.scene.node_name(*node).as_deref() == Some(description.as_str())
                }
            })
    }

    /// Load one image reference, returning the node and the directory it
    /// came from. A volume kept in the scene by the previous close is
    /// reused instead of being loaded a second time.
    fn load_image(&mut self, image_ref: &ImageRef) -> Result<(NodeId, PathBuf), IteratorError> {
        if let Some(node) = self.loaded_volume_for(image_ref) {
            let folder = match image_ref {
                ImageRef::File(path) => path.parent().map(Path::to_path_buf),
                ImageRef::Series { files, .. } => files
                    .first()
                    .and_then(|f| f.parent())
                    .map(Path::to_path_buf),
            };
            return Ok((node, folder.unwrap_or_default()));
        }
        match image_ref {
            ImageRef::File(path) => {
                if !path.is_file() {
                    return Err(IteratorError::MissingImageFile(path.clone()));
                }
                let node = self.scene.load_volume(path).map_err(|source| {
                    IteratorError::MainImage {
                        path: path.clone(),
                        source,
                    }
                })?;
                if let Some(stem) = path.file_stem() {
                    self.scene.set_node_name(node, &stem.to_string_lossy());
                }
                let folder = path.parent().map(Path::to_path_buf).unwrap_or_default();
                Ok((node, folder))
            }
            ImageRef::Series { description, files } => {
                let node = self.scene.load_series(description, files).map_err(|source| {
                    IteratorError::MainImage {
                        path: files.first().cloned().unwrap_or_default(),
                        source,
                    }
                })?;
                let folder = files
                    .first()
                    .and_then(|f| f.parent())
                    .map(Path::to_path_buf)
                    .unwrap_or_default();
                Ok((node, folder))
            }
        }
    }

    /// Close the current case: notify observers, persist masks according to
    /// the flags, leave the editor module and tear the scene down. With
    /// `should_close` false only mask nodes are removed, keeping the images
    /// around for the next case.
    ///
    /// Returns the path of the saved main mask, when one was saved. A no-op
    /// when nothing is loaded.
    pub fn close_case(
        &mut self,
        save_loaded: bool,
        save_new: bool,
        should_close: bool,
    ) -> Result<Option<PathBuf>, IteratorError> {
        if let Some(handle) = &self.current {
            for observer in &mut self.observers {
                observer.on_case_about_to_close(&mut *self.scene, handle)?;
            }
        }
        let Some(handle) = self.current.take() else {
            return Ok(None);
        };

        let loaded = handle.loaded_masks();
        let all_masks = self.backend.mask_nodes(self.scene.as_ref());
        let new_masks: Vec<NodeId> = all_masks
            .iter()
            .copied()
            .filter(|node| !loaded.contains(node))
            .collect();

        let mut main_mask_path: Option<PathBuf> = None;
        let record = |node: NodeId, path: PathBuf, main: &mut Option<PathBuf>| {
            // The case's own mask wins; otherwise the first saved mask is
            // reported in the output column.
            if Some(node) == handle.mask || main.is_none() {
                *main = Some(path);
            }
        };

        if save_loaded {
            for node in &loaded {
                if let Some(path) = self.try_save(*node, &handle.case_folder, true) {
                    record(*node, path, &mut main_mask_path);
                }
            }
        }
        if save_new {
            for node in &new_masks {
                if let Some(path) = self.try_save(*node, &handle.case_folder, false) {
                    record(*node, path, &mut main_mask_path);
                }
            }
        }

        self.backend.exit_module(&mut *self.scene);

        if should_close {
            self.scene.clear();
        } else {
            for node in all_masks {
                self.scene.remove_node(node);
            }
        }

        Ok(main_mask_path)
    }

    /// Persist one mask node on demand, without closing the case.
    pub fn save_mask(&mut self, node: NodeId, overwrite: bool) -> Result<PathBuf, IteratorError> {
        let case_folder = self
            .current
            .as_ref()
            .map(|handle| handle.case_folder.clone())
            .ok_or(IteratorError::NoCaseLoaded)?;
        Ok(self.save_node(node, &case_folder, overwrite)?)
    }

    fn try_save(&mut self, node: NodeId, case_folder: &Path, overwrite: bool) -> Option<PathBuf> {
        match self.save_node(node, case_folder, overwrite) {
            Ok(path) => Some(path),
            Err(err) => {
                warn!("Failed to save mask node: {err}");
                None
            }
        }
    }

    /// Write a mask node to disk. The target is the node's own storage
    /// directory when it has one (updating the mask in place), the case
    /// folder otherwise. Without `overwrite`, an existing file gets the
    /// smallest free `(n)` suffix instead of being replaced.
    fn save_node(
        &mut self,
        node: NodeId,
        case_folder: &Path,
        overwrite: bool,
    ) -> Result<PathBuf, SceneError> {
        let name = self
            .scene
            .node_name(node)
            .ok_or(SceneError::UnknownNode(node))?;
        let base = match self.reader.as_deref() {
            Some(reader) => format!("{name}_{reader}"),
            None => name.clone(),
        };
        let extension = self.backend.mask_extension();

        let target_dir = self
            .scene
            .node_file(node)
            .and_then(|file| file.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| case_folder.to_path_buf());
        if !target_dir.is_dir() {
            fs::create_dir_all(&target_dir)?;
        }

        let mut path = target_dir.join(format!("{base}{extension}"));
        if !overwrite {
            let mut n = 1u32;
            while path.exists() {
                path = target_dir.join(format!("{base}({n}){extension}"));
                n += 1;
            }
        }

        self.scene.save_node(node, &path)?;
        self.scene.set_node_file(node, &path);
        info!("Saved mask {name} to {}", path.display());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SegmentEditorBackend;
    use crate::config::ColumnMap;
    use crate::scene::NodeKind;
    use crate::source::CsvTableSource;
    use crate::table::CaseTable;
    use crate::test_helpers::MemoryScene;

    fn fixture(rows: Vec<Vec<String>>) -> CaseIterator {
        let table = CaseTable::from_rows(vec!["image".into(), "mask".into()], rows);
        let source = CsvTableSource::new(
            table,
            ColumnMap {
                root: None,
                ..ColumnMap::default()
            },
        )
        .unwrap();
        CaseIterator::new(
            Box::new(source),
            Box::new(SegmentEditorBackend),
            Box::new(MemoryScene::new()),
        )
    }

    fn case_row(dir: &Path, image: &str, mask: Option<&str>) -> Vec<String> {
        let image_path = dir.join(image);
        fs::write(&image_path, b"").unwrap();
        let mask_value = match mask {
            Some(mask) => {
                let mask_path = dir.join(mask);
                fs::write(&mask_path, b"").unwrap();
                mask_path.display().to_string()
            }
            None => String::new(),
        };
        vec![image_path.display().to_string(), mask_value]
    }

    #[test]
    fn at_most_one_case_is_materialized() {
        let dir = tempfile::tempdir().unwrap();
        let rows = vec![
            case_row(dir.path(), "im1.nrrd", None),
            case_row(dir.path(), "im2.nrrd", None),
        ];
        let mut iterator = fixture(rows);

        iterator.load_case(0).unwrap();
        assert!(matches!(
            iterator.load_case(1),
            Err(IteratorError::CaseStillLoaded)
        ));
        assert_eq!(iterator.current().unwrap().index, 0);

        iterator.close_case(false, false, true).unwrap();
        assert!(iterator.current().is_none());
        iterator.load_case(1).unwrap();
        assert_eq!(iterator.current().unwrap().index, 1);
    }

    #[test]
    fn missing_main_image_fails_without_installing_a_case() {
        let dir = tempfile::tempdir().unwrap();
        let rows = vec![vec![
            dir.path().join("gone.nrrd").display().to_string(),
            String::new(),
        ]];
        let mut iterator = fixture(rows);

        assert!(matches!(
            iterator.load_case(0),
            Err(IteratorError::MissingImageFile(_))
        ));
        assert!(iterator.current().is_none());
    }

    #[test]
    fn loaded_case_carries_mask_and_folder() {
        let dir = tempfile::tempdir().unwrap();
        let rows = vec![case_row(dir.path(), "im1.nrrd", Some("ma1.seg.nrrd"))];
        let mut iterator = fixture(rows);

        let handle = iterator.load_case(0).unwrap();
        assert!(handle.mask.is_some());
        assert_eq!(handle.case_folder, dir.path());
        assert_eq!(handle.loaded_masks().len(), 1);
    }

    #[test]
    fn new_masks_are_saved_into_the_case_folder() {
        let dir = tempfile::tempdir().unwrap();
        let rows = vec![case_row(dir.path(), "im1.nrrd", Some("ma1.seg.nrrd"))];
        let mut iterator = fixture(rows);

        let image = iterator.load_case(0).unwrap().image;
        let backend = SegmentEditorBackend;
        backend
            .new_mask(iterator.scene_mut(), image, Some("fresh"))
            .unwrap();

        let main = iterator.close_case(false, true, true).unwrap();
        assert_eq!(main, Some(dir.path().join("fresh.seg.nrrd")));
        assert!(dir.path().join("fresh.seg.nrrd").is_file());
    }

    #[test]
    fn loaded_masks_are_updated_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let rows = vec![case_row(dir.path(), "im1.nrrd", Some("ma1.seg.nrrd"))];
        let mut iterator = fixture(rows);

        iterator.load_case(0).unwrap();
        let main = iterator.close_case(true, false, true).unwrap();
        assert_eq!(main, Some(dir.path().join("ma1.seg.nrrd")));
    }

    #[test]
    fn name_collisions_get_the_smallest_free_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let rows = vec![case_row(dir.path(), "im1.nrrd", Some("ma1.seg.nrrd"))];
        fs::write(dir.path().join("ma1(1).seg.nrrd"), b"").unwrap();
        let mut iterator = fixture(rows);

        iterator.load_case(0).unwrap();
        let mask = iterator.current().unwrap().mask.unwrap();
        let path = iterator.save_mask(mask, false).unwrap();
        assert_eq!(path, dir.path().join("ma1(2).seg.nrrd"));
        assert!(path.is_file());

        // A second save never clobbers the first.
        let again = iterator.save_mask(mask, false).unwrap();
        assert_eq!(again, dir.path().join("ma1(3).seg.nrrd"));
    }

    #[test]
    fn reader_suffix_lands_in_the_filename() {
        let dir = tempfile::tempdir().unwrap();
        let rows = vec![case_row(dir.path(), "im1.nrrd", Some("ma1.seg.nrrd"))];
        let mut iterator = fixture(rows).with_reader(Some("alice".into()));

        iterator.load_case(0).unwrap();
        let main = iterator.close_case(true, false, true).unwrap();
        assert_eq!(main, Some(dir.path().join("ma1_alice.seg.nrrd")));
    }

    #[test]
    fn kept_scene_reuses_the_loaded_image() {
        let dir = tempfile::tempdir().unwrap();
        let rows = vec![case_row(dir.path(), "im1.nrrd", Some("ma1.seg.nrrd"))];
        let mut iterator = fixture(rows);

        let first = iterator.load_case(0).unwrap().image;
        iterator.close_case(false, false, false).unwrap();
        let handle = iterator.load_case(0).unwrap();

        // Same node, no duplicate volume; only the mask was reloaded.
        assert_eq!(handle.image, first);
        assert!(handle.mask.is_some());
        let scene = iterator.scene_mut();
        assert_eq!(scene.nodes_by_kind(NodeKind::Volume).len(), 1);
        assert_eq!(scene.nodes_by_kind(NodeKind::Segmentation).len(), 1);
    }

    #[test]
    fn keeping_the_scene_prunes_only_mask_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let rows = vec![case_row(dir.path(), "im1.nrrd", Some("ma1.seg.nrrd"))];
        let mut iterator = fixture(rows);

        iterator.load_case(0).unwrap();
        iterator.close_case(false, false, false).unwrap();

        let scene = iterator.scene_mut();
        assert_eq!(scene.nodes_by_kind(NodeKind::Volume).len(), 1);
        assert!(scene.nodes_by_kind(NodeKind::Segmentation).is_empty());
    }
}
