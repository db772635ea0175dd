use std::{
    fs::File,
    io::{self, BufReader, BufWriter, Write},
    path::Path,
};

use hashbrown::{HashMap, HashSet};
use serde::{Deserialize, Serialize};

use crate::alloc::{Node, RawAllocator, Ta};

/// One node of a [`TreeGraph`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphNode {
    pub size: usize,
    pub name: Option<String>,
    /// In sibling order
    pub children: Vec<Node>,
}

/// A detached copy of the shape of (part of) a [`Ta`]: which nodes exist, how
/// big they are, and who owns whom. Useful for dumping a tree to disk and
/// looking at it later.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TreeGraph {
    pub(crate) graph: HashMap<Node, GraphNode>,
}

#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum TreeGraphFromFileError {
    #[error(transparent)]
    IoError(#[from] io::Error),
    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),
}

impl TreeGraph {
    /// Record `root` and everything below it. This is O(subtree size).
    pub fn from_subtree<A: RawAllocator>(ta: &Ta<A>, root: Node) -> Self {
        let mut graph = Self::default();
        let mut stack = vec![root];
        while let Some(node) = stack.pop() {
            let children: Vec<Node> = ta.children(node).collect();
            stack.extend(children.iter().copied());
            graph.graph.insert(
                node,
                GraphNode {
                    size: ta.get_size(node),
                    name: ta.debug_name(node).map(str::to_owned),
                    children,
                },
            );
        }
        graph
    }

    /// Record every tree in `ta`
    pub fn from_arena<A: RawAllocator>(ta: &Ta<A>) -> Self {
        let mut graph = Self::default();
        for root in ta.roots() {
            graph.graph.extend(Self::from_subtree(ta, root).graph);
        }
        graph
    }

    pub fn get(&self, node: Node) -> Option<&GraphNode> {
        self.graph.get(&node)
    }

    pub fn len(&self) -> usize {
        self.graph.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.is_empty()
    }

    /// Nodes that are nobody's child in this graph. O(N + E)
    pub fn roots(&self) -> HashSet<Node> {
        let mut result = HashSet::from_iter(self.graph.keys().copied());
        for node in self.graph.values() {
            for child in &node.children {
                result.remove(child);
            }
        }
        result
    }

    /// Sum of the sizes of `node` and everything below it
    pub fn subtree_size(&self, node: Node) -> usize {
        let mut total = 0;
        let mut stack = vec![node];
        while let Some(node) = stack.pop() {
            if let Some(entry) = self.graph.get(&node) {
                total += entry.size;
                stack.extend(entry.children.iter().copied());
            }
        }
        total
    }

    pub fn kv_pairs(&self) -> Vec<(&Node, &GraphNode)> {
        let mut pairs: Vec<_> = self.graph.iter().collect();
        pairs.sort_by_key(|(node, _)| **node);
        pairs
    }

    pub fn write_to_file<P>(&self, path: P) -> io::Result<()>
    where
        P: AsRef<Path>,
    {
        let mut file = BufWriter::new(File::create(path)?);
        serde_json::to_writer(&mut file, &self.kv_pairs())?;
        file.flush()
    }

    pub fn from_file<P>(path: P) -> Result<Self, TreeGraphFromFileError>
    where
        P: AsRef<Path>,
    {
        let file = BufReader::new(File::open(path)?);
        let kv_pairs: Vec<(Node, GraphNode)> = serde_json::from_reader(file)?;
        Ok(Self {
            graph: HashMap::from_iter(kv_pairs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_shape_and_sizes() {
        let mut ta = Ta::new();
        let root = ta.alloc_size(None, 4).unwrap();
        let a = ta.alloc_size(root, 8).unwrap();
        let b = ta.strdup(root, "xy").unwrap();
        let c = ta.alloc_size(a, 16).unwrap();
        let elsewhere = ta.new_context(None).unwrap();

        let graph = TreeGraph::from_subtree(&ta, root);
        assert_eq!(graph.len(), 4);
        assert_eq!(graph.get(root).unwrap().children, [a, b]);
        assert_eq!(graph.get(a).unwrap().children, [c]);
        assert_eq!(graph.subtree_size(root), 4 + 8 + 3 + 16);
        assert_eq!(graph.roots(), HashSet::from_iter([root]));
        assert!(graph.get(elsewhere).is_none());

        let everything = TreeGraph::from_arena(&ta);
        assert_eq!(everything.len(), 5);
        assert_eq!(everything.roots(), HashSet::from_iter([root, elsewhere]));
    }

    #[test]
    fn survives_a_trip_through_json() {
        let mut ta = Ta::new();
        let root = ta.new_context(None).unwrap();
        for i in 0..5 {
            ta.alloc_size(root, i).unwrap();
        }
        let graph = TreeGraph::from_arena(&ta);
        let path = std::env::temp_dir().join(format!("hta-graph-{}.json", std::process::id()));
        graph.write_to_file(&path).unwrap();
        let loaded = TreeGraph::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(loaded, graph);
    }
}
