use thiserror::Error;

use crate::alloc::Node;

/// The only ways a fallible operation on a [`Ta`](crate::Ta) can fail. Both
/// come down to "the memory could not be obtained".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// The system allocator could not satisfy a request for `size` bytes.
    #[error("out of memory (requested {size} bytes)")]
    OutOfMemory { size: usize },
    /// `element_size * count` does not fit in a `usize`.
    #[error("array size overflow ({count} elements of {element_size} bytes)")]
    SizeOverflow { element_size: usize, count: usize },
}

/// An inconsistency found by [`Ta::verify()`](crate::Ta::verify). Seeing one
/// of these means the tree is corrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TreeError {
    #[error("{node:?} links to released node {target:?}")]
    DanglingLink { node: Node, target: Node },
    #[error("{child:?} is listed under {listed_under:?} but records parent {recorded:?}")]
    ParentMismatch {
        child: Node,
        listed_under: Node,
        recorded: Option<Node>,
    },
    #[error("sibling links around {node:?} are not symmetric")]
    BrokenSiblings { node: Node },
    #[error("{node:?} is its own ancestor")]
    Cycle { node: Node },
    #[error("reached {reached} nodes from the roots but {live} are live")]
    Unreachable { reached: usize, live: usize },
}
