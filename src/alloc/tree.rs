//! The ownership tree and the core allocate / resize / release operations.

use std::{
    borrow::Cow,
    ffi::CStr,
    mem,
    panic::Location,
    ptr::NonNull,
    slice,
    sync::atomic::{AtomicUsize, Ordering},
};

use log::trace;

use crate::{
    alloc::{
        header::{Node, NodeHeader, Slot},
        leak,
        manual::Malloc,
        raw::RawAllocator,
    },
    error::{AllocError, TreeError},
    util::{
        assert::fits_block_align,
        hint::cold,
        num::{block_size, calc_array_size},
    },
};

static NEXT_ARENA_ID: AtomicUsize = AtomicUsize::new(1);

#[cold]
#[track_caller]
fn stale(node: Node) -> ! {
    panic!("use of a released node: {node:?}")
}

/// An arena of ownership trees.
///
/// Every allocation is a [`Node`] with an optional parent. Freeing a node
/// first runs its destructor, then frees all of its children (recursively),
/// then gives its memory back to `A`. Nodes without a parent are roots; an
/// arena can hold any number of them.
///
/// A `Ta` does no locking and is neither `Send` nor `Sync`. Use one per thread.
pub struct Ta<A: RawAllocator = Malloc> {
    id: usize,
    slots: Vec<Slot<A>>,
    /// Indices of empty slots, always with room for every slot
    vacant: Vec<usize>,
    live: usize,
    allocator: A,
}

impl Ta<Malloc> {
    pub fn new() -> Self {
        Self::with_allocator(Malloc)
    }
}

impl Default for Ta<Malloc> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: RawAllocator> Ta<A> {
    pub fn with_allocator(allocator: A) -> Self {
        Self {
            id: NEXT_ARENA_ID.fetch_add(1, Ordering::Relaxed),
            slots: Vec::new(),
            vacant: Vec::new(),
            live: 0,
            allocator,
        }
    }

    /// Process-unique id of this arena, as it appears in leak reports
    pub const fn id(&self) -> usize {
        self.id
    }

    /// Number of live nodes
    pub const fn len(&self) -> usize {
        self.live
    }

    pub const fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub const fn allocator(&self) -> &A {
        &self.allocator
    }

    pub fn allocator_mut(&mut self) -> &mut A {
        &mut self.allocator
    }

    /// Whether `node` is a live node of this arena
    pub fn contains(&self, node: Node) -> bool {
        self.try_header(node).is_some()
    }

    pub(crate) fn try_header(&self, node: Node) -> Option<&NodeHeader<A>> {
        self.slots.get(node.index)?.get(node)
    }

    #[track_caller]
    pub(crate) fn header(&self, node: Node) -> &NodeHeader<A> {
        match self.try_header(node) {
            Some(header) => header,
            None => stale(node),
        }
    }

    #[track_caller]
    pub(crate) fn header_mut(&mut self, node: Node) -> &mut NodeHeader<A> {
        match self.slots.get_mut(node.index).and_then(|slot| slot.get_mut(node)) {
            Some(header) => header,
            None => stale(node),
        }
    }

    pub(crate) fn live_nodes(&self) -> impl Iterator<Item = (Node, &NodeHeader<A>)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            let header = slot.header.as_ref()?;
            Some((
                Node {
                    index,
                    generation: slot.generation,
                },
                header,
            ))
        })
    }

    /// Allocate `size` uninitialized bytes as the last child of `parent`, or
    /// as a new root if `parent` is `None`.
    #[track_caller]
    pub fn alloc_size(
        &mut self,
        parent: impl Into<Option<Node>>,
        size: usize,
    ) -> Result<Node, AllocError> {
        let parent = parent.into();
        self.reserve_slot(parent)?;
        let block = self.allocator.allocate(block_size(size))?;
        Ok(self.insert(parent, block, size, Location::caller()))
    }

    /// Like [`Self::alloc_size()`], but the bytes are zeroed.
    #[track_caller]
    pub fn zalloc_size(
        &mut self,
        parent: impl Into<Option<Node>>,
        size: usize,
    ) -> Result<Node, AllocError> {
        let parent = parent.into();
        self.reserve_slot(parent)?;
        let block = self.allocator.allocate_zeroed(block_size(size))?;
        Ok(self.insert(parent, block, size, Location::caller()))
    }

    /// An empty node that exists only to own other nodes.
    #[track_caller]
    pub fn new_context(&mut self, parent: impl Into<Option<Node>>) -> Result<Node, AllocError> {
        self.zalloc_size(parent, 0)
    }

    /// Make sure `insert()` cannot fail, before anything is allocated.
    fn reserve_slot(&mut self, parent: Option<Node>) -> Result<(), AllocError> {
        if let Some(parent) = parent {
            self.header(parent);
        }
        if !self.vacant.is_empty() {
            return Ok(());
        }
        let grow = || AllocError::OutOfMemory {
            size: mem::size_of::<Slot<A>>(),
        };
        self.slots.try_reserve(1).map_err(|_| cold(grow))?;
        // `vacant` must be able to take back every slot without allocating,
        // so that freeing never needs memory
        let missing = self.slots.len() + 1 - self.vacant.len();
        self.vacant.try_reserve(missing).map_err(|_| cold(grow))
    }

    fn insert(
        &mut self,
        parent: Option<Node>,
        block: NonNull<u8>,
        size: usize,
        site: &'static Location<'static>,
    ) -> Node {
        let header = NodeHeader::new(block, size);
        let node = match self.vacant.pop() {
            Some(index) => {
                let slot = &mut self.slots[index];
                slot.header = Some(header);
                Node {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    header: Some(header),
                });
                Node {
                    index: self.slots.len() - 1,
                    generation: 0,
                }
            }
        };
        self.live += 1;
        self.link(node, parent);
        if leak::is_enabled() {
            let name = format!("{}:{}", site.file(), site.line());
            self.track(node, Cow::Owned(name));
        }
        trace!("alloc {node:?} ({size} bytes) under {parent:?}");
        node
    }

    /// Resize `node` to `size` bytes, keeping the first `min(old, new)` bytes.
    /// The memory may move, but the handle, parent, children and destructor
    /// stay as they are. On failure nothing changes.
    #[track_caller]
    pub fn realloc_size(&mut self, node: Node, size: usize) -> Result<Node, AllocError> {
        let header = self.header(node);
        let (block, old_size) = (header.block, header.size);
        // SAFETY: `block` is the live block of `node`, allocated by
        // `self.allocator` with `block_size(old_size)` bytes
        let block = unsafe {
            self.allocator
                .reallocate(block, block_size(old_size), block_size(size))
        }?;
        let header = self.header_mut(node);
        header.block = block;
        header.size = size;
        if header.tracked {
            leak::resize(self.id, node, size);
        }
        trace!("realloc {node:?} {old_size} -> {size} bytes");
        Ok(node)
    }

    /// [`Self::realloc_size()`] for `Some(node)`, and a fresh
    /// [`Self::alloc_size()`] under `parent` for `None`. `parent` is ignored
    /// when resizing.
    #[track_caller]
    pub fn realloc_or_alloc(
        &mut self,
        parent: impl Into<Option<Node>>,
        node: Option<Node>,
        size: usize,
    ) -> Result<Node, AllocError> {
        match node {
            Some(node) => self.realloc_size(node, size),
            None => self.alloc_size(parent, size),
        }
    }

    /// Usable size of `node` in bytes
    #[track_caller]
    pub fn get_size(&self, node: Node) -> usize {
        self.header(node).size
    }

    #[track_caller]
    pub fn bytes(&self, node: Node) -> &[u8] {
        let header = self.header(node);
        // SAFETY: `block` is live for `size` bytes and only reachable through
        // this arena, which we borrow
        unsafe { slice::from_raw_parts(header.block.as_ptr(), header.size) }
    }

    #[track_caller]
    pub fn bytes_mut(&mut self, node: Node) -> &mut [u8] {
        let header = self.header(node);
        // SAFETY: as in `bytes()`, and we borrow the arena mutably
        unsafe { slice::from_raw_parts_mut(header.block.as_ptr(), header.size) }
    }

    /// Raw pointer to the start of `node`'s memory. It is only valid until the
    /// node is resized or freed.
    #[track_caller]
    pub fn as_ptr<T>(&self, node: Node) -> *mut T {
        self.header(node).block.as_ptr().cast()
    }

    /// The NUL-terminated text at the start of `node`, if it has a terminator
    #[track_caller]
    pub fn c_str(&self, node: Node) -> Option<&CStr> {
        CStr::from_bytes_until_nul(self.bytes(node)).ok()
    }

    /// Free `node` and everything below it:
    ///
    /// 1. `node`'s destructor runs, with its children still intact
    /// 2. every child is freed the same way, in sibling order
    /// 3. `node`'s memory is returned and it leaves the leak registry
    ///
    /// `None` is a no-op. Destructors may free other nodes, including nodes of
    /// this subtree that have not been reached yet.
    #[track_caller]
    pub fn free(&mut self, node: impl Into<Option<Node>>) {
        let Some(node) = node.into() else {
            return;
        };
        self.header(node);
        self.run_destructor(node);
        self.release_subtree(node);
    }

    /// Free every child of `node`, leaving `node` itself alone.
    #[track_caller]
    pub fn free_children(&mut self, node: Node) {
        while let Some(child) = self.header(node).first_child {
            self.free(child);
        }
    }

    fn run_destructor(&mut self, node: Node) {
        let Some(header) = self.slots.get_mut(node.index).and_then(|s| s.get_mut(node)) else {
            return;
        };
        let destructor = header.destructor.take();
        if let Some(destructor) = destructor {
            trace!("destructor of {node:?}");
            destructor(self, node);
        }
    }

    /// Steps 2 and 3 of `free()`, without recursion so that deep trees cannot
    /// blow the stack. Every node on `stack` has had its destructor run.
    fn release_subtree(&mut self, root: Node) {
        let mut stack = vec![root];
        while let Some(&top) = stack.last() {
            let Some(header) = self.try_header(top) else {
                // a destructor got here first
                stack.pop();
                continue;
            };
            let first_child = header.first_child;
            match first_child {
                Some(child) => {
                    self.run_destructor(child);
                    stack.push(child);
                }
                None => {
                    stack.pop();
                    self.remove(top);
                }
            }
        }
    }

    /// Deallocate a childless node and vacate its slot.
    fn remove(&mut self, node: Node) {
        self.unlink(node);
        let slot = &mut self.slots[node.index];
        let Some(header) = slot.header.take() else {
            return;
        };
        debug_assert!(header.first_child.is_none());
        slot.generation = slot.generation.wrapping_add(1);
        // capacity was reserved when the slot was created
        self.vacant.push(node.index);
        self.live -= 1;
        if header.tracked {
            leak::untrack(self.id, node);
        }
        trace!("free {node:?} ({} bytes)", header.size);
        // SAFETY: the block belongs to the node we just removed, and it has
        // `block_size(size)` bytes
        unsafe {
            self.allocator
                .deallocate(header.block, block_size(header.size))
        };
    }

    /// Append `node` to `parent`'s children. `node` must be detached.
    fn link(&mut self, node: Node, parent: Option<Node>) {
        let Some(parent) = parent else {
            return;
        };
        let last = self.header(parent).last_child;
        let header = self.header_mut(node);
        header.parent = Some(parent);
        header.prev = last;
        header.next = None;
        match last {
            Some(last) => self.header_mut(last).next = Some(node),
            None => self.header_mut(parent).first_child = Some(node),
        }
        self.header_mut(parent).last_child = Some(node);
    }

    /// Take `node` out of its parent's children, making it a root.
    fn unlink(&mut self, node: Node) {
        let header = self.header_mut(node);
        let (parent, prev, next) = (header.parent.take(), header.prev.take(), header.next.take());
        let Some(parent) = parent else {
            return;
        };
        match prev {
            Some(prev) => self.header_mut(prev).next = next,
            None => self.header_mut(parent).first_child = next,
        }
        match next {
            Some(next) => self.header_mut(next).prev = prev,
            None => self.header_mut(parent).last_child = prev,
        }
    }

    /// Move `node`, with its whole subtree, under `parent` (or make it a root).
    /// `parent` must not be `node` or one of its descendants; debug builds
    /// check this.
    #[track_caller]
    pub fn set_parent(&mut self, node: Node, parent: impl Into<Option<Node>>) {
        let parent = parent.into();
        self.header(node);
        if let Some(parent) = parent {
            self.header(parent);
            debug_assert!(
                !self.is_ancestor_or_self(node, parent),
                "making {parent:?} the parent of {node:?} would create a cycle"
            );
        }
        self.unlink(node);
        self.link(node, parent);
        trace!("reparent {node:?} under {parent:?}");
    }

    /// [`Self::set_parent()`] with the argument order of an allocation, handing
    /// `node` back.
    #[track_caller]
    pub fn steal(&mut self, parent: impl Into<Option<Node>>, node: Node) -> Node {
        self.set_parent(node, parent);
        node
    }

    #[track_caller]
    pub fn find_parent(&self, node: Node) -> Option<Node> {
        self.header(node).parent
    }

    /// Whether `ancestor` is `node` or one of its ancestors
    fn is_ancestor_or_self(&self, ancestor: Node, node: Node) -> bool {
        let mut cursor = Some(node);
        while let Some(current) = cursor {
            if current == ancestor {
                return true;
            }
            cursor = self.header(current).parent;
        }
        false
    }

    /// Set the function that runs when `node` is freed, replacing any previous
    /// one. It receives the arena and the node, whose children are still
    /// alive at that point.
    #[track_caller]
    pub fn set_destructor<F>(&mut self, node: Node, destructor: F)
    where
        F: FnOnce(&mut Ta<A>, Node) + 'static,
    {
        self.header_mut(node).destructor = Some(Box::new(destructor));
    }

    /// Remove `node`'s destructor. Returns whether it had one.
    #[track_caller]
    pub fn clear_destructor(&mut self, node: Node) -> bool {
        self.header_mut(node).destructor.take().is_some()
    }

    /// `node`'s children, in sibling order.
    #[track_caller]
    pub fn children(&self, node: Node) -> Children<'_, A> {
        Children {
            ta: self,
            next: self.header(node).first_child,
        }
    }

    /// Every node without a parent
    pub fn roots(&self) -> impl Iterator<Item = Node> + '_ {
        self.live_nodes()
            .filter(|(_, header)| header.parent.is_none())
            .map(|(node, _)| node)
    }

    /// Check that every parent/child and sibling link in the arena agrees
    /// with its counterpart, and that there are no cycles. This walks the
    /// whole arena and is meant for tests and debugging.
    pub fn verify(&self) -> Result<(), TreeError> {
        let mut reached = 0usize;
        for (node, header) in self.live_nodes() {
            let mut cursor = header.parent;
            let mut depth = 0usize;
            while let Some(ancestor) = cursor {
                if ancestor == node || depth > self.live {
                    return Err(TreeError::Cycle { node });
                }
                cursor = self
                    .try_header(ancestor)
                    .ok_or(TreeError::DanglingLink {
                        node,
                        target: ancestor,
                    })?
                    .parent;
                depth += 1;
            }
            if header.parent.is_none() {
                reached += 1;
            }

            let mut prev = None;
            let mut cursor = header.first_child;
            let mut count = 0usize;
            while let Some(child) = cursor {
                let child_header = self.try_header(child).ok_or(TreeError::DanglingLink {
                    node,
                    target: child,
                })?;
                if child_header.parent != Some(node) {
                    return Err(TreeError::ParentMismatch {
                        child,
                        listed_under: node,
                        recorded: child_header.parent,
                    });
                }
                count += 1;
                if child_header.prev != prev || count > self.live {
                    return Err(TreeError::BrokenSiblings { node: child });
                }
                prev = Some(child);
                cursor = child_header.next;
            }
            if header.last_child != prev {
                return Err(TreeError::BrokenSiblings { node });
            }
            reached += count;
        }
        if reached != self.live {
            return Err(TreeError::Unreachable {
                reached,
                live: self.live,
            });
        }
        Ok(())
    }
}

/// Typed shorthands. These only pick sizes; the memory is still untyped and
/// reading it is up to the caller (see [`Ta::as_ptr()`]).
impl<A: RawAllocator> Ta<A> {
    fn check_align<T>() {
        assert!(
            fits_block_align(mem::align_of::<T>()),
            "{} needs more alignment than blocks have",
            tynm::type_name::<T>()
        );
    }

    fn name_after<T>(&mut self, node: Node) {
        if leak::is_enabled() {
            self.set_debug_name(node, tynm::type_name::<T>());
        }
    }

    /// Room for one uninitialized `T`
    #[track_caller]
    pub fn alloc<T>(&mut self, parent: impl Into<Option<Node>>) -> Result<Node, AllocError> {
        Self::check_align::<T>();
        let node = self.alloc_size(parent, mem::size_of::<T>())?;
        self.name_after::<T>(node);
        Ok(node)
    }

    /// Room for one zeroed `T`
    #[track_caller]
    pub fn zalloc<T>(&mut self, parent: impl Into<Option<Node>>) -> Result<Node, AllocError> {
        Self::check_align::<T>();
        let node = self.zalloc_size(parent, mem::size_of::<T>())?;
        self.name_after::<T>(node);
        Ok(node)
    }

    #[track_caller]
    pub fn alloc_array_size(
        &mut self,
        parent: impl Into<Option<Node>>,
        element_size: usize,
        count: usize,
    ) -> Result<Node, AllocError> {
        let size = calc_array_size(element_size, count)?;
        self.alloc_size(parent, size)
    }

    #[track_caller]
    pub fn alloc_array<T>(
        &mut self,
        parent: impl Into<Option<Node>>,
        count: usize,
    ) -> Result<Node, AllocError> {
        Self::check_align::<T>();
        let node = self.alloc_array_size(parent, mem::size_of::<T>(), count)?;
        self.name_after::<T>(node);
        Ok(node)
    }

    #[track_caller]
    pub fn zalloc_array<T>(
        &mut self,
        parent: impl Into<Option<Node>>,
        count: usize,
    ) -> Result<Node, AllocError> {
        Self::check_align::<T>();
        let size = calc_array_size(mem::size_of::<T>(), count)?;
        let node = self.zalloc_size(parent, size)?;
        self.name_after::<T>(node);
        Ok(node)
    }

    /// Resize `node` to hold `count` values of `T`
    #[track_caller]
    pub fn realloc_array<T>(&mut self, node: Node, count: usize) -> Result<Node, AllocError> {
        Self::check_align::<T>();
        let size = calc_array_size(mem::size_of::<T>(), count)?;
        self.realloc_size(node, size)
    }
}

impl<A: RawAllocator> Drop for Ta<A> {
    /// Returns the memory of every node still alive without running any
    /// destructors, like the process exiting would. Tracked nodes stay in the
    /// leak registry, since nobody freed them.
    fn drop(&mut self) {
        let mut leaked = 0usize;
        for slot in &mut self.slots {
            let Some(header) = slot.header.take() else {
                continue;
            };
            leaked += 1;
            // SAFETY: each live header owns its block, of `block_size(size)`
            // bytes, and we never touch it again
            unsafe {
                self.allocator
                    .deallocate(header.block, block_size(header.size))
            };
        }
        if leaked > 0 {
            log::debug!("arena {} dropped with {leaked} live nodes", self.id);
        }
    }
}

pub struct Children<'a, A: RawAllocator> {
    ta: &'a Ta<A>,
    next: Option<Node>,
}

impl<A: RawAllocator> Iterator for Children<'_, A> {
    type Item = Node;

    fn next(&mut self) -> Option<Node> {
        let node = self.next?;
        self.next = self.ta.header(node).next;
        Some(node)
    }
}
