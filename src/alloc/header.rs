//! Per-node bookkeeping.
//!
//! Each node of a [`Ta`] is one slot in the arena's slot table:
//!
//! ```plaintext
//!  slots[index]                         block (from the RawAllocator)
//! +------------------------+           +---------------------------+
//! | generation             |           |                           |
//! | NodeHeader             |           |  size bytes, user data    |
//! |   block  --------------+---------> |                           |
//! |   size                 |           +---------------------------+
//! |   parent               |
//! |   first/last child     |  intrusive, doubly linked sibling list
//! |   prev/next sibling    |
//! |   destructor           |
//! |   name, tracked, ...   |
//! +------------------------+
//! ```
//!
//! A [`Node`] handle is `(index, generation)`. Links between headers are
//! handles too, so a block that moves on resize only changes `block` and
//! nothing that points at the node has to be fixed up.

use std::{borrow::Cow, ptr::NonNull};

use serde::{Deserialize, Serialize};

use super::{raw::RawAllocator, tree::Ta};

/// Handle to a node of a [`Ta`]. Copyable and stable for the lifetime of the
/// node, including across [`Ta::realloc_size()`]. Once the node is released
/// the handle is stale and every use of it panics.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Node {
    pub(crate) index: usize,
    pub(crate) generation: u32,
}

impl Node {
    pub const fn index(self) -> usize {
        self.index
    }

    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Node({}v{})", self.index, self.generation)
    }
}

/// Run once when the node it is attached to is released, before any of the
/// node's children are.
pub type Destructor<A> = Box<dyn FnOnce(&mut Ta<A>, Node)>;

pub(crate) struct NodeHeader<A: RawAllocator> {
    pub(crate) block: NonNull<u8>,
    /// Usable bytes; the block itself is `block_size(size)`
    pub(crate) size: usize,
    pub(crate) parent: Option<Node>,
    pub(crate) first_child: Option<Node>,
    pub(crate) last_child: Option<Node>,
    pub(crate) prev: Option<Node>,
    pub(crate) next: Option<Node>,
    pub(crate) destructor: Option<Destructor<A>>,
    /// Only ever set while leak tracking is on
    pub(crate) name: Option<Cow<'static, str>>,
    /// Whether the leak registry holds a record for this node
    pub(crate) tracked: bool,
    pub(crate) is_string: bool,
}

impl<A: RawAllocator> NodeHeader<A> {
    pub(crate) const fn new(block: NonNull<u8>, size: usize) -> Self {
        Self {
            block,
            size,
            parent: None,
            first_child: None,
            last_child: None,
            prev: None,
            next: None,
            destructor: None,
            name: None,
            tracked: false,
            is_string: false,
        }
    }
}

pub(crate) struct Slot<A: RawAllocator> {
    /// Bumped every time the slot is vacated, so old handles stop matching
    pub(crate) generation: u32,
    pub(crate) header: Option<NodeHeader<A>>,
}

impl<A: RawAllocator> Slot<A> {
    pub(crate) fn get(&self, node: Node) -> Option<&NodeHeader<A>> {
        match &self.header {
            Some(header) if self.generation == node.generation => Some(header),
            _ => None,
        }
    }

    pub(crate) fn get_mut(&mut self, node: Node) -> Option<&mut NodeHeader<A>> {
        match &mut self.header {
            Some(header) if self.generation == node.generation => Some(header),
            _ => None,
        }
    }
}
