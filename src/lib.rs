//! # hta - hierarchical talloc-style allocation
//!
//! Every allocation made through a [`Ta`] is a [`Node`] in an ownership tree.
//! Freeing a node frees everything below it, so the lifetime of a whole web of
//! buffers, strings and state can hang off a single root:
//!
//! ```text
//!   root (context)
//!   ├── decoder state ── destructor: close the stream
//!   │   ├── frame buffer
//!   │   └── "filter=scale:640:480"
//!   └── option strings
//!       └── ...
//!
//!   ta.free(root)  =>  destructor, then every descendant, then root
//! ```
//!
//! ## Crate Structure
//!
//! ```text
//!   hta
//!   ├── alloc
//!   │   ├── tree      - Ta: allocate / resize / free / reparent
//!   │   ├── header    - Node handles and per-node bookkeeping
//!   │   ├── strings   - memdup, strdup, asprintf and the append family
//!   │   ├── leak      - opt-in global registry of live allocations
//!   │   ├── oom       - fail-fast `or_abort()`
//!   │   ├── raw       - RawAllocator seam, Limited, SystemAlloc
//!   │   ├── manual    - libc malloc backend
//!   │   └── dlmalloc  - private dlmalloc heap backend
//!   ├── graph         - serializable snapshots of trees
//!   ├── config        - environment-driven setup
//!   └── util          - overflow-checked sizing and small helpers
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use hta::{OrAbort, Ta};
//!
//! let mut ta = Ta::new();
//! let ctx = ta.new_context(None).or_abort();
//! let greeting = ta.strdup(ctx, "hello").or_abort();
//! ta.strdup_append(greeting, ", world").or_abort();
//! assert_eq!(ta.c_str(greeting).unwrap().to_str(), Ok("hello, world"));
//!
//! ta.set_destructor(ctx, |_, _| println!("ctx is going away"));
//! ta.free(ctx);
//! assert!(!ta.contains(greeting));
//! ```
//!
//! ## Safety
//!
//! Handles are generational: using a [`Node`] after it was freed panics
//! instead of touching freed memory. What the crate cannot check for you is
//! typed access through [`Ta::as_ptr()`], which is as unsafe as any raw
//! pointer.

pub mod alloc;
pub mod config;
pub mod error;
pub mod graph;
pub mod util;

pub use alloc::{
    enable_leak_report, leak_report, oom, print_leak_report, AppendTarget, Malloc, Node, OrAbort,
    RawAllocator, Ta,
};
pub use config::{Backend, Config};
pub use error::{AllocError, TreeError};
pub use util::num::calc_array_size;
