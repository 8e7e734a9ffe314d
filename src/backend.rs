use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::scene::{NodeId, NodeKind, SceneError, ScenePort};

/// Isolates the two incompatible generations of the host's segmentation
/// editor behind one surface, so the iterator never branches on which is
/// active. The backend is chosen once at batch configuration time.
pub trait SegmentationBackend {
    /// Host module name this backend drives.
    fn module_name(&self) -> &'static str;

    /// Switch the host into this backend's editor and bind it to the given
    /// image and mask. Idempotent: entering while already active only
    /// rebinds the targets.
    fn enter_module(&self, scene: &mut dyn ScenePort, image: NodeId, mask: Option<NodeId>) {
        if scene.selected_module() != Some(self.module_name()) {
            scene.select_module(self.module_name());
        }
        scene.bind_editor(image, mask);
    }

    /// Leave the editor if this backend's module is the active one.
    fn exit_module(&self, scene: &mut dyn ScenePort) {
        if scene.selected_module() == Some(self.module_name()) {
            scene.deselect_module();
        }
    }

    /// Load an existing mask file, normalizing it to this backend's canonical
    /// representation. An absent or unreadable file is a warning, never an
    /// error: the case proceeds without that mask.
    fn load_mask(
        &self,
        scene: &mut dyn ScenePort,
        path: &Path,
        ref_image: Option<NodeId>,
    ) -> Option<NodeId>;

    /// Create a fresh empty mask geometrically aligned with `ref_image`.
    fn new_mask(
        &self,
        scene: &mut dyn ScenePort,
        ref_image: NodeId,
        name: Option<&str>,
    ) -> Result<NodeId, SceneError>;

    /// Canonical on-disk suffix for this backend's mask format.
    fn mask_extension(&self) -> &'static str;

    /// All mask-type nodes currently in the scene, used to detect masks the
    /// user created from scratch.
    fn mask_nodes(&self, scene: &dyn ScenePort) -> Vec<NodeId>;
}

/// `file.seg.nrrd` and friends carry a `.seg` infix before the extension.
fn is_segmentation_file(path: &Path) -> bool {
    path.file_stem()
        .map(|stem| Path::new(stem).extension() == Some("seg".as_ref()))
        .unwrap_or(false)
}

/// Node name for a loaded mask: the file stem, with a `.seg` infix stripped.
fn mask_node_name(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    stem.strip_suffix(".seg").map(str::to_string).unwrap_or(stem)
}

/// Backend for the legacy editor generation: masks are region label volumes
/// stored as plain `.nrrd` files. Segmentation-format input is converted to
/// a label volume on load.
#[derive(Debug, Default)]
pub struct LabelmapBackend;

impl SegmentationBackend for LabelmapBackend {
    fn module_name(&self) -> &'static str {
        "Editor"
    }

    fn load_mask(
        &self,
        scene: &mut dyn ScenePort,
        path: &Path,
        _ref_image: Option<NodeId>,
    ) -> Option<NodeId> {
        if !path.is_file() {
            warn!("Segmentation file {} does not exist, skipping...", path.display());
            return None;
        }

        let node = if is_segmentation_file(path) {
            debug!("Loading segmentation and converting to labelmap");
            let seg = match scene.load_segmentation(path) {
                Ok(node) => node,
                Err(err) => {
                    warn!("Failed to load {}: {err}", path.display());
                    return None;
                }
            };
            let label = match scene.export_labelmap(seg) {
                Ok(node) => node,
                Err(err) => {
                    warn!("Failed to convert {}: {err}", path.display());
                    scene.remove_node(seg);
                    return None;
                }
            };
            scene.remove_node(seg);
            // Future saves of the converted node land next to the source.
            let storage = path.with_file_name(format!("{}.nrrd", mask_node_name(path)));
            scene.set_node_file(label, &storage);
            Some(label)
        } else {
            debug!("Loading labelmap");
            match scene.load_label_volume(path) {
                Ok(node) => Some(node),
                Err(err) => {
                    warn!("Failed to load {}: {err}", path.display());
                    None
                }
            }
        }?;

        scene.set_node_name(node, &mask_node_name(path));
        Some(node)
    }

    fn new_mask(
        &self,
        _scene: &mut dyn ScenePort,
        _ref_image: NodeId,
        _name: Option<&str>,
    ) -> Result<NodeId, SceneError> {
        // The legacy editor has no way to create an empty labelmap from the
        // iterator side; users add masks through the editor itself.
        Err(SceneError::Unsupported("new_mask on the labelmap backend"))
    }

    fn mask_extension(&self) -> &'static str {
        ".nrrd"
    }

    fn mask_nodes(&self, scene: &dyn ScenePort) -> Vec<NodeId> {
        scene.nodes_by_kind(NodeKind::LabelVolume)
    }
}

/// Backend for the current editor generation: masks are segmentation nodes
/// stored as `.seg.nrrd`. Plain label volumes are imported into a fresh
/// segmentation aligned with the reference image.
#[derive(Debug, Default)]
pub struct SegmentEditorBackend;

impl SegmentationBackend for SegmentEditorBackend {
    fn module_name(&self) -> &'static str {
        "SegmentEditor"
    }

    fn load_mask(
        &self,
        scene: &mut dyn ScenePort,
        path: &Path,
        ref_image: Option<NodeId>,
    ) -> Option<NodeId> {
        if !path.is_file() {
            warn!("Segmentation file {} does not exist, skipping...", path.display());
            return None;
        }

        let node = if is_segmentation_file(path) {
            debug!("Loading segmentation");
            match scene.load_segmentation(path) {
                Ok(node) => Some(node),
                Err(err) => {
                    warn!("Failed to load {}: {err}", path.display());
                    None
                }
            }
        } else {
            debug!("Loading labelmap and converting to segmentation");
            let label = match scene.load_label_volume(path) {
                Ok(node) => node,
                Err(err) => {
                    warn!("Failed to load {}: {err}", path.display());
                    return None;
                }
            };
            let seg = match scene.import_labelmap(label, ref_image) {
                Ok(node) => node,
                Err(err) => {
                    warn!("Failed to convert {}: {err}", path.display());
                    scene.remove_node(label);
                    return None;
                }
            };
            scene.remove_node(label);
            scene.set_node_file(seg, &segmentation_storage_path(path));
            Some(seg)
        }?;

        scene.set_node_name(node, &mask_node_name(path));
        Some(node)
    }

    fn new_mask(
        &self,
        scene: &mut dyn ScenePort,
        ref_image: NodeId,
        name: Option<&str>,
    ) -> Result<NodeId, SceneError> {
        let name = match name {
            Some(name) => name.to_string(),
            None => {
                let base = scene
                    .node_name(ref_image)
                    .ok_or(SceneError::UnknownNode(ref_image))?;
                format!("{base}_segmentation")
            }
        };
        scene.new_segmentation(&name, ref_image)
    }

    fn mask_extension(&self) -> &'static str {
        ".seg.nrrd"
    }

    fn mask_nodes(&self, scene: &dyn ScenePort) -> Vec<NodeId> {
        scene.nodes_by_kind(NodeKind::Segmentation)
    }
}

/// Storage path for a labelmap imported as a segmentation: `a/b.nrrd`
/// becomes `a/b.seg.nrrd`.
fn segmentation_storage_path(path: &Path) -> PathBuf {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => path.with_extension(format!("seg.{ext}")),
        None => path.with_extension("seg"),
    }
}
