mod logical;

pub use logical::{GraphNode, TreeGraph, TreeGraphFromFileError};
