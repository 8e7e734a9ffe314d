//! In-memory stand-in for the host scene, shared by the unit tests.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::scene::{NodeId, NodeKind, SceneError, ScenePort};

/// Route log output into the test harness. Safe to call from every test;
/// only the first call installs the logger.
pub fn init_test_logging() {
    let _ = simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Debug)
        .init();
}

#[derive(Debug, Clone)]
struct SceneNode {
    kind: NodeKind,
    name: String,
    file: Option<PathBuf>,
}

/// A [`ScenePort`] that tracks nodes in memory. Saving writes empty marker
/// files so filename collision handling runs against the real filesystem.
#[derive(Debug, Default)]
pub struct MemoryScene {
    nodes: BTreeMap<NodeId, SceneNode>,
    next_id: u64,
    selected: Option<String>,
    module_switches: usize,
    bound: Option<(NodeId, Option<NodeId>)>,
}

impl MemoryScene {
    pub fn new() -> Self {
        MemoryScene::default()
    }

    fn add(&mut self, kind: NodeKind, name: &str, file: Option<&Path>) -> NodeId {
        self.next_id += 1;
        let id = NodeId(self.next_id);
        self.nodes.insert(
            id,
            SceneNode {
                kind,
                name: name.to_string(),
                file: file.map(Path::to_path_buf),
            },
        );
        id
    }

    pub fn add_volume_for_test(&mut self, name: &str, file: Option<&Path>) -> NodeId {
        self.add(NodeKind::Volume, name, file)
    }

    pub fn module_switches(&self) -> usize {
        self.module_switches
    }

    pub fn bound_editor(&self) -> Option<(NodeId, Option<NodeId>)> {
        self.bound
    }

    fn load_file(&mut self, kind: NodeKind, path: &Path) -> Result<NodeId, SceneError> {
        if !path.is_file() {
            return Err(SceneError::LoadFailed {
                path: path.to_path_buf(),
                reason: "no such file".to_string(),
            });
        }
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(self.add(kind, &name, Some(path)))
    }

    fn require(&self, node: NodeId) -> Result<&SceneNode, SceneError> {
        self.nodes.get(&node).ok_or(SceneError::UnknownNode(node))
    }
}

impl ScenePort for MemoryScene {
    fn load_volume(&mut self, path: &Path) -> Result<NodeId, SceneError> {
        self.load_file(NodeKind::Volume, path)
    }

    fn load_series(&mut self, description: &str, files: &[PathBuf]) -> Result<NodeId, SceneError> {
        if files.is_empty() {
            return Err(SceneError::LoadFailed {
                path: PathBuf::new(),
                reason: "series has no files".to_string(),
            });
        }
        Ok(self.add(NodeKind::Volume, description, None))
    }

    fn load_label_volume(&mut self, path: &Path) -> Result<NodeId, SceneError> {
        self.load_file(NodeKind::LabelVolume, path)
    }

    fn load_segmentation(&mut self, path: &Path) -> Result<NodeId, SceneError> {
        self.load_file(NodeKind::Segmentation, path)
    }

    fn new_segmentation(&mut self, name: &str, reference: NodeId) -> Result<NodeId, SceneError> {
        self.require(reference)?;
        Ok(self.add(NodeKind::Segmentation, name, None))
    }

    fn import_labelmap(
        &mut self,
        label: NodeId,
        reference: Option<NodeId>,
    ) -> Result<NodeId, SceneError> {
        let name = self.require(label)?.name.clone();
        if let Some(reference) = reference {
            self.require(reference)?;
        }
        Ok(self.add(NodeKind::Segmentation, &name, None))
    }

    fn export_labelmap(&mut self, segmentation: NodeId) -> Result<NodeId, SceneError> {
        let name = self.require(segmentation)?.name.clone();
        Ok(self.add(NodeKind::LabelVolume, &name, None))
    }

    fn save_node(&mut self, node: NodeId, path: &Path) -> Result<(), SceneError> {
        self.require(node)?;
        fs::write(path, b"")?;
        Ok(())
    }

    fn remove_node(&mut self, node: NodeId) {
        self.nodes.remove(&node);
    }

    fn clear(&mut self) {
        self.nodes.clear();
        self.bound = None;
    }

    fn nodes_by_kind(&self, kind: NodeKind) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.kind == kind)
            .map(|(id, _)| *id)
            .collect()
    }

    fn node_name(&self, node: NodeId) -> Option<String> {
        self.nodes.get(&node).map(|n| n.name.clone())
    }

    fn set_node_name(&mut self, node: NodeId, name: &str) {
        if let Some(n) = self.nodes.get_mut(&node) {
            n.name = name.to_string();
        }
    }

    fn node_file(&self, node: NodeId) -> Option<PathBuf> {
        self.nodes.get(&node).and_then(|n| n.file.clone())
    }

    fn set_node_file(&mut self, node: NodeId, path: &Path) {
        if let Some(n) = self.nodes.get_mut(&node) {
            n.file = Some(path.to_path_buf());
        }
    }

    fn selected_module(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    fn select_module(&mut self, module: &str) {
        self.selected = Some(module.to_string());
        self.module_switches += 1;
    }

    fn deselect_module(&mut self) {
        self.selected = None;
    }

    fn bind_editor(&mut self, image: NodeId, mask: Option<NodeId>) {
        self.bound = Some((image, mask));
    }
}
