pub mod dlmalloc;
pub mod header;
pub mod leak;
pub mod manual;
pub mod oom;
pub mod raw;
pub mod strings;
pub mod tree;

pub use dlmalloc::DlMalloc;
pub use header::{Destructor, Node};
pub use leak::{
    enable_leak_report, is_enabled, leak_report, print_leak_report, registry_len, LeakReport,
    LeakedBlock,
};
pub use manual::Malloc;
pub use oom::{oom, OrAbort};
pub use raw::{Limited, RawAllocator, SystemAlloc, BLOCK_ALIGN};
pub use strings::AppendTarget;
pub use tree::{Children, Ta};
