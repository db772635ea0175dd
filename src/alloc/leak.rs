//! Opt-in, process-wide record of live allocations, for finding leaks.
//!
//! Nothing here exists until [`enable_leak_report()`] is called. From then on
//! every node allocated by any [`Ta`] is recorded together with a name (by
//! default the `file:line` that allocated it) and dropped from the record when
//! it is freed. Whatever is left is a leak as far as we can tell, and can be
//! listed with [`leak_report()`]. Enabling also arranges for the report to be
//! printed when the process exits.

use std::{
    borrow::Cow,
    fmt,
    fs::File,
    io::{self, Write},
    path::Path,
    sync::{Mutex, MutexGuard, Once},
};

use hashbrown::HashMap;
use log::warn;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::alloc::{header::Node, raw::RawAllocator, tree::Ta};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct LeakKey {
    arena: usize,
    node: Node,
}

#[derive(Debug)]
struct LeakRecord {
    name: Option<Cow<'static, str>>,
    size: usize,
    is_string: bool,
}

type Registry = Mutex<HashMap<LeakKey, LeakRecord>>;

static REGISTRY: OnceCell<Registry> = OnceCell::new();
static EXIT_HOOK: Once = Once::new();

fn registry() -> Option<MutexGuard<'static, HashMap<LeakKey, LeakRecord>>> {
    let registry = REGISTRY.get()?;
    // A panic while holding the lock can't leave a map half-updated in any
    // way we care about, so poisoning is ignored
    Some(registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
}

extern "C" fn report_at_exit() {
    print_leak_report();
}

/// Start recording allocations. Calling this again does nothing; there is no
/// way to stop.
pub fn enable_leak_report() {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()));
    EXIT_HOOK.call_once(|| {
        // SAFETY: `report_at_exit` is a plain `extern "C" fn()` that only
        // touches statics which live until the very end of the process
        if unsafe { libc::atexit(report_at_exit) } != 0 {
            warn!("could not register the exit-time leak report");
        }
    });
}

pub fn is_enabled() -> bool {
    REGISTRY.get().is_some()
}

/// Number of records, or `None` if tracking was never enabled
pub fn registry_len() -> Option<usize> {
    registry().map(|registry| registry.len())
}

pub(crate) fn resize(arena: usize, node: Node, size: usize) {
    if let Some(mut registry) = registry() {
        if let Some(record) = registry.get_mut(&LeakKey { arena, node }) {
            record.size = size;
        }
    }
}

pub(crate) fn untrack(arena: usize, node: Node) {
    if let Some(mut registry) = registry() {
        registry.remove(&LeakKey { arena, node });
    }
}

/// One block in a [`LeakReport`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeakedBlock {
    pub arena: usize,
    pub node: Node,
    pub size: usize,
    pub name: Option<String>,
    /// The text of the block, for blocks marked with
    /// [`Ta::mark_as_string()`], when the report was made by the arena that
    /// owns it
    pub content: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeakReport {
    pub blocks: Vec<LeakedBlock>,
}

impl LeakReport {
    fn from_blocks(mut blocks: Vec<LeakedBlock>) -> Self {
        blocks.sort_by_key(|block| (block.arena, block.node));
        Self { blocks }
    }

    pub fn total_size(&self) -> usize {
        self.blocks.iter().map(|block| block.size).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Only the blocks of arena `arena`
    pub fn for_arena(self, arena: usize) -> Self {
        Self {
            blocks: self
                .blocks
                .into_iter()
                .filter(|block| block.arena == arena)
                .collect(),
        }
    }

    pub fn write_to_file<P>(&self, path: P) -> io::Result<()>
    where
        P: AsRef<Path>,
    {
        let mut file = File::create(path)?;
        serde_json::to_writer_pretty(&mut file, self)?;
        file.flush()
    }
}

impl fmt::Display for LeakReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Blocks not freed:")?;
        for block in &self.blocks {
            let label = block
                .content
                .as_deref()
                .map(|text| format!("{text:?}"))
                .or_else(|| block.name.clone())
                .unwrap_or_else(|| "-".to_owned());
            writeln!(
                f,
                "  {:<20} arena {} {:?} {}",
                block.size, block.arena, block.node, label
            )?;
        }
        write!(
            f,
            "Total leaked memory: {} bytes in {} blocks.",
            self.total_size(),
            self.blocks.len()
        )
    }
}

/// Every block still recorded, across all arenas. Empty if tracking is off.
pub fn leak_report() -> LeakReport {
    let Some(registry) = registry() else {
        return LeakReport::default();
    };
    LeakReport::from_blocks(
        registry
            .iter()
            .map(|(key, record)| LeakedBlock {
                arena: key.arena,
                node: key.node,
                size: record.size,
                name: record.name.as_deref().map(str::to_owned),
                content: record.is_string.then(|| "<string>".to_owned()),
            })
            .collect(),
    )
}

/// Log [`leak_report()`] as warnings, if there is anything to report.
pub fn print_leak_report() {
    let report = leak_report();
    if report.is_empty() {
        return;
    }
    for line in report.to_string().lines() {
        warn!("{line}");
    }
}

impl<A: RawAllocator> Ta<A> {
    pub(crate) fn track(&mut self, node: Node, name: Cow<'static, str>) {
        let Some(mut registry) = registry() else {
            return;
        };
        let id = self.id();
        let header = self.header_mut(node);
        header.name = Some(name.clone());
        header.tracked = true;
        registry.insert(
            LeakKey { arena: id, node },
            LeakRecord {
                name: Some(name),
                size: header.size,
                is_string: header.is_string,
            },
        );
    }

    /// Name `node` for leak reports. Does nothing unless tracking is enabled.
    #[track_caller]
    pub fn set_debug_name(&mut self, node: Node, name: impl Into<Cow<'static, str>>) -> Node {
        if !is_enabled() {
            self.header(node);
            return node;
        }
        let name = name.into();
        if self.header(node).tracked {
            if let Some(mut registry) = registry() {
                if let Some(record) = registry.get_mut(&LeakKey {
                    arena: self.id(),
                    node,
                }) {
                    record.name = Some(name.clone());
                }
            }
            self.header_mut(node).name = Some(name);
        } else {
            // allocated before tracking was turned on
            self.track(node, name);
        }
        node
    }

    /// The name given to `node`, if tracking is enabled
    #[track_caller]
    pub fn debug_name(&self, node: Node) -> Option<&str> {
        self.header(node).name.as_deref()
    }

    /// Have leak reports show `node`'s text rather than its name. Does nothing
    /// unless tracking is enabled.
    #[track_caller]
    pub fn mark_as_string(&mut self, node: Node) -> Node {
        if !is_enabled() {
            self.header(node);
            return node;
        }
        let id = self.id();
        let header = self.header_mut(node);
        header.is_string = true;
        if header.tracked {
            if let Some(mut registry) = registry() {
                if let Some(record) = registry.get_mut(&LeakKey { arena: id, node }) {
                    record.is_string = true;
                }
            }
        }
        node
    }

    /// The tracked blocks of this arena that are still alive, with the text
    /// of string-marked blocks filled in.
    pub fn leak_report(&self) -> LeakReport {
        if !is_enabled() {
            return LeakReport::default();
        }
        LeakReport::from_blocks(
            self.live_nodes()
                .filter(|(_, header)| header.tracked)
                .map(|(node, header)| LeakedBlock {
                    arena: self.id(),
                    node,
                    size: header.size,
                    name: header.name.as_deref().map(str::to_owned),
                    content: header.is_string.then(|| {
                        let bytes = self.bytes(node);
                        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
                        String::from_utf8_lossy(&bytes[..end]).into_owned()
                    }),
                })
                .collect(),
        )
    }
}
