use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strum::Display;
use tracing::debug;

use crate::dataset::AtlasDataset;

/// Kind of an ontology node, as an explicit tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(tag = "type", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NodeKind {
    Root,
    Structure { id: i32 },
}

/// One node of the ontology hierarchy. Children keep insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OntologyNode {
    pub label: String,
    pub kind: NodeKind,
    pub children: Vec<OntologyNode>,
}

impl OntologyNode {
    fn new(label: String, kind: NodeKind) -> Self {
        Self {
            label,
            kind,
            children: Vec::new(),
        }
    }
}

/// Path to a node as child indices from the root
pub type NodePath = Vec<usize>;

/// The reconstructed structure hierarchy, immutable after construction.
/// Rebuilding is a full replace from a dataset snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OntologyTree {
    root: OntologyNode,
    id_to_path: BTreeMap<i32, NodePath>,
}

impl OntologyTree {
    /// Reconstruct the hierarchy from every structure's ancestry path.
    ///
    /// Structures are visited in ascending graph order (ties broken by id),
    /// walking each path from the root and appending a child the first time an
    /// ancestor name is seen, so sibling order is deterministic for a fixed
    /// dataset. Ancestor ids absent from the dataset resolve to synthesized
    /// Unknown names. Structures with an empty or self-only ancestry path are
    /// not represented in the hierarchy.
    pub fn build(dataset: &AtlasDataset) -> Self {
        let mut root = OntologyNode::new("Ontology".to_string(), NodeKind::Root);
        let mut id_to_path: BTreeMap<i32, NodePath> = BTreeMap::new();

        let mut entries = dataset.entries();
        entries.sort_by_key(|entry| (entry.record().graph_order, entry.record().id));

        for entry in entries {
            let record = entry.record();
            if record.ancestry_path.len() <= 1 {
                debug!(id = record.id, "degenerate ancestry path, structure not placed in hierarchy");
                continue;
            }

            let mut path = NodePath::new();
            let mut node = &mut root;
            for &ancestor in &record.ancestry_path {
                let label = dataset.get_or_default(ancestor).record().name.clone();
                let index = match node.children.iter().position(|c| c.label == label) {
                    Some(index) => index,
                    None => {
                        node.children
                            .push(OntologyNode::new(label, NodeKind::Structure { id: ancestor }));
                        node.children.len() - 1
                    }
                };
                path.push(index);
                node = &mut node.children[index];
            }
            id_to_path.insert(record.id, path);
        }

        Self { root, id_to_path }
    }

    pub fn root(&self) -> &OntologyNode {
        &self.root
    }

    /// Ids of every structure placed in the hierarchy
    pub fn ids(&self) -> Vec<i32> {
        self.id_to_path.keys().copied().collect()
    }

    pub fn path_for_id(&self, id: i32) -> Option<&NodePath> {
        self.id_to_path.get(&id)
    }

    pub fn node_at(&self, path: &[usize]) -> Option<&OntologyNode> {
        let mut node = &self.root;
        for &index in path {
            node = node.children.get(index)?;
        }
        Some(node)
    }

    /// The structure id whose deepest node sits at `path`, if any
    pub fn id_at(&self, path: &[usize]) -> Option<i32> {
        self.id_to_path
            .iter()
            .find(|(_, p)| p.as_slice() == path)
            .map(|(&id, _)| id)
    }

    /// Ids of all structures at or below `path`
    pub fn descendant_ids(&self, path: &[usize]) -> Vec<i32> {
        self.id_to_path
            .iter()
            .filter(|(_, p)| p.len() >= path.len() && p[..path.len()] == *path)
            .map(|(&id, _)| id)
            .collect()
    }

    /// Labels along `path`, starting at the root label
    pub fn labels_for(&self, path: &[usize]) -> Option<Vec<&str>> {
        let mut labels = vec![self.root.label.as_str()];
        let mut node = &self.root;
        for &index in path {
            node = node.children.get(index)?;
            labels.push(node.label.as_str());
        }
        Some(labels)
    }

    /// Paths of all indexed structures whose label chain contains `text`,
    /// case-insensitively
    pub fn paths_containing(&self, text: &str) -> Vec<NodePath> {
        let needle = text.to_lowercase();
        self.id_to_path
            .values()
            .filter(|path| {
                self.labels_for(path)
                    .map(|labels| labels.join(", ").to_lowercase().contains(&needle))
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }
}
