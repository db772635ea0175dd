//! Byte and string helpers. None of these touch the tree directly: they are
//! plain allocations and resizes with some copying on top, and they fail only
//! when those do.
//!
//! Appending comes in two flavours that differ in where they think the
//! destination ends:
//!
//! - *string* appends (`strdup_append()`, ...) stop at the first NUL byte
//! - *buffer* appends (`strdup_append_buffer()`, ...) take the last byte of
//!   the node to be its terminator and write over it, so embedded NULs
//!   survive
//!
//! Both leave the destination NUL-terminated. A destination is only ever
//! grown, never shrunk. See [`AppendTarget`] for appending to nothing.

use std::{
    ffi::CStr,
    fmt::{self, Write},
};

use crate::{
    alloc::{header::Node, raw::RawAllocator, tree::Ta},
    error::AllocError,
};

/// `fmt::Write` that only counts
struct Counter(usize);

impl Write for Counter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0 += s.len();
        Ok(())
    }
}

/// `fmt::Write` into a fixed slice, failing if it does not fit
struct SliceWriter<'a> {
    buf: &'a mut [u8],
    at: usize,
}

impl Write for SliceWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let end = self.at + s.len();
        let dst = self.buf.get_mut(self.at..end).ok_or(fmt::Error)?;
        dst.copy_from_slice(s.as_bytes());
        self.at = end;
        Ok(())
    }
}

#[cold]
fn format_failed() -> ! {
    panic!("a formatting trait implementation returned an error")
}

fn formatted_len(args: fmt::Arguments<'_>) -> usize {
    let mut counter = Counter(0);
    if counter.write_fmt(args).is_err() {
        format_failed();
    }
    counter.0
}

/// Format `args` into exactly `buf`, which was sized by `formatted_len()`
fn format_into(buf: &mut [u8], args: fmt::Arguments<'_>) {
    let mut writer = SliceWriter { buf, at: 0 };
    if writer.write_fmt(args).is_err() || writer.at != writer.buf.len() {
        format_failed();
    }
}

/// Length of the text at the start of `bytes`, at most `n`
fn strnlen(bytes: &[u8], n: usize) -> usize {
    let bytes = &bytes[..n.min(bytes.len())];
    bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len())
}

impl<A: RawAllocator> Ta<A> {
    /// Copy `bytes` into a new node
    #[track_caller]
    pub fn memdup(
        &mut self,
        parent: impl Into<Option<Node>>,
        bytes: &[u8],
    ) -> Result<Node, AllocError> {
        let node = self.alloc_size(parent, bytes.len())?;
        self.bytes_mut(node).copy_from_slice(bytes);
        Ok(node)
    }

    /// Copy `s` (up to any NUL in it) plus a terminator into a new node
    #[track_caller]
    pub fn strdup(&mut self, parent: impl Into<Option<Node>>, s: &str) -> Result<Node, AllocError> {
        self.strndup(parent, s.as_bytes(), s.len())
    }

    /// Copy `s` including its terminator into a new node
    #[track_caller]
    pub fn strdup_cstr(
        &mut self,
        parent: impl Into<Option<Node>>,
        s: &CStr,
    ) -> Result<Node, AllocError> {
        self.memdup(parent, s.to_bytes_with_nul())
    }

    /// Copy at most `n` bytes of the text in `s`, stopping early at a NUL, and
    /// terminate the copy.
    #[track_caller]
    pub fn strndup(
        &mut self,
        parent: impl Into<Option<Node>>,
        s: &[u8],
        n: usize,
    ) -> Result<Node, AllocError> {
        let len = strnlen(s, n);
        let node = self.alloc_size(parent, len + 1)?;
        let dst = self.bytes_mut(node);
        dst[..len].copy_from_slice(&s[..len]);
        dst[len] = 0;
        Ok(node)
    }

    /// Format into a new node sized exactly for the output plus terminator.
    /// See also [`ta_asprintf!`](crate::ta_asprintf).
    ///
    /// # Panics
    ///
    /// If a formatting trait implementation returns an error, like
    /// [`format!`] does.
    #[track_caller]
    pub fn asprintf(
        &mut self,
        parent: impl Into<Option<Node>>,
        args: fmt::Arguments<'_>,
    ) -> Result<Node, AllocError> {
        let len = formatted_len(args);
        let node = self.alloc_size(parent, len + 1)?;
        let dst = self.bytes_mut(node);
        format_into(&mut dst[..len], args);
        dst[len] = 0;
        Ok(node)
    }

    fn string_len(&self, node: Node) -> usize {
        let bytes = self.bytes(node);
        strnlen(bytes, bytes.len())
    }

    /// Everything but the last byte, which is taken to be the terminator
    fn buffer_len(&self, node: Node) -> usize {
        self.get_size(node).saturating_sub(1)
    }

    /// Make room for `extra` bytes at `at` plus a terminator, and return the
    /// `extra` bytes. The node only ever grows; bytes past the new terminator
    /// are left as they were. `dst` is untouched if this fails.
    fn grow_at(&mut self, dst: Node, at: usize, extra: usize) -> Result<&mut [u8], AllocError> {
        let end = at
            .checked_add(extra)
            .and_then(|end| end.checked_add(1))
            .ok_or(AllocError::OutOfMemory { size: usize::MAX })?;
        if self.get_size(dst) < end {
            self.realloc_size(dst, end)?;
        }
        let bytes = self.bytes_mut(dst);
        bytes[end - 1] = 0;
        Ok(&mut bytes[at..end - 1])
    }

    #[track_caller]
    fn append_with(
        &mut self,
        mut dst: impl AppendTarget,
        len: fn(&Self, Node) -> usize,
        s: &[u8],
    ) -> Result<(), AllocError> {
        match dst.node() {
            Some(node) => {
                self.header(node);
                let at = len(self, node);
                self.grow_at(node, at, s.len())?.copy_from_slice(s);
            }
            None => dst.replace(self.strndup(None, s, s.len())?),
        }
        Ok(())
    }

    #[track_caller]
    fn append_fmt_with(
        &mut self,
        mut dst: impl AppendTarget,
        len: fn(&Self, Node) -> usize,
        args: fmt::Arguments<'_>,
    ) -> Result<(), AllocError> {
        match dst.node() {
            Some(node) => {
                self.header(node);
                let at = len(self, node);
                let extra = formatted_len(args);
                format_into(self.grow_at(node, at, extra)?, args);
            }
            None => dst.replace(self.asprintf(None, args)?),
        }
        Ok(())
    }

    /// Append the text of `s` to the text in `dst`
    #[track_caller]
    pub fn strdup_append(&mut self, dst: impl AppendTarget, s: &str) -> Result<(), AllocError> {
        self.strndup_append(dst, s.as_bytes(), s.len())
    }

    /// Append the text of `s` after all but the last byte of `dst`
    #[track_caller]
    pub fn strdup_append_buffer(
        &mut self,
        dst: impl AppendTarget,
        s: &str,
    ) -> Result<(), AllocError> {
        self.strndup_append_buffer(dst, s.as_bytes(), s.len())
    }

    /// Append at most `n` bytes of the text in `s` to the text in `dst`
    #[track_caller]
    pub fn strndup_append(
        &mut self,
        dst: impl AppendTarget,
        s: &[u8],
        n: usize,
    ) -> Result<(), AllocError> {
        self.append_with(dst, Self::string_len, &s[..strnlen(s, n)])
    }

    /// Append at most `n` bytes of the text in `s` after all but the last
    /// byte of `dst`
    #[track_caller]
    pub fn strndup_append_buffer(
        &mut self,
        dst: impl AppendTarget,
        s: &[u8],
        n: usize,
    ) -> Result<(), AllocError> {
        self.append_with(dst, Self::buffer_len, &s[..strnlen(s, n)])
    }

    /// Format onto the end of the text in `dst`
    #[track_caller]
    pub fn asprintf_append(
        &mut self,
        dst: impl AppendTarget,
        args: fmt::Arguments<'_>,
    ) -> Result<(), AllocError> {
        self.append_fmt_with(dst, Self::string_len, args)
    }

    /// Format after all but the last byte of `dst`
    #[track_caller]
    pub fn asprintf_append_buffer(
        &mut self,
        dst: impl AppendTarget,
        args: fmt::Arguments<'_>,
    ) -> Result<(), AllocError> {
        self.append_fmt_with(dst, Self::buffer_len, args)
    }
}

/// Where an append goes: an existing [`Node`], or a `&mut Option<Node>` that
/// may still be empty. Appending to `None` allocates a new root string holding
/// just the appended text and stores it in the option, so text can be built
/// up from nothing:
///
/// ```
/// use hta::{Node, Ta};
///
/// let mut ta = Ta::new();
/// let mut line: Option<Node> = None;
/// for word in ["a", "b", "c"] {
///     ta.strdup_append(&mut line, word).unwrap();
/// }
/// let line = line.unwrap();
/// assert_eq!(ta.bytes(line), b"abc\0");
/// assert_eq!(ta.find_parent(line), None);
/// ```
pub trait AppendTarget {
    fn node(&self) -> Option<Node>;

    fn replace(&mut self, node: Node);
}

impl AppendTarget for Node {
    fn node(&self) -> Option<Node> {
        Some(*self)
    }

    fn replace(&mut self, node: Node) {
        *self = node;
    }
}

impl AppendTarget for &mut Option<Node> {
    fn node(&self) -> Option<Node> {
        **self
    }

    fn replace(&mut self, node: Node) {
        **self = Some(node);
    }
}

/// `ta_asprintf!(ta, parent, "fmt", args...)`: [`Ta::asprintf()`] with
/// `format!`-style arguments.
#[macro_export]
macro_rules! ta_asprintf {
    ($ta:expr, $parent:expr, $($arg:tt)*) => {
        $ta.asprintf($parent, ::std::format_args!($($arg)*))
    };
}

/// `ta_asprintf_append!(ta, dst, "fmt", args...)`: [`Ta::asprintf_append()`]
#[macro_export]
macro_rules! ta_asprintf_append {
    ($ta:expr, $dst:expr, $($arg:tt)*) => {
        $ta.asprintf_append($dst, ::std::format_args!($($arg)*))
    };
}

/// `ta_asprintf_append_buffer!(ta, dst, "fmt", args...)`:
/// [`Ta::asprintf_append_buffer()`]
#[macro_export]
macro_rules! ta_asprintf_append_buffer {
    ($ta:expr, $dst:expr, $($arg:tt)*) => {
        $ta.asprintf_append_buffer($dst, ::std::format_args!($($arg)*))
    };
}
