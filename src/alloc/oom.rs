//! Fail-fast versions of every fallible operation.
//!
//! Rather than an `x`-prefixed twin of each function, anything returning
//! `Result<T, AllocError>` gets [`OrAbort::or_abort()`]:
//!
//! ```no_run
//! use hta::{OrAbort, Ta};
//!
//! let mut ta = Ta::new();
//! let root = ta.new_context(None).or_abort();
//! let name = ta.strdup(root, "never fails").or_abort();
//! ta.strdup_append(name, ", or the process is gone").or_abort();
//! ```

use std::{panic::Location, process};

use log::error;

use crate::error::AllocError;

/// Terminate the process because of `err`. There is no unwinding, so no
/// destructor of any kind runs.
#[cold]
#[track_caller]
pub fn oom(err: AllocError) -> ! {
    error!("{}: {err}, aborting", Location::caller());
    process::abort()
}

pub trait OrAbort<T> {
    /// The success value, or [`oom()`]
    fn or_abort(self) -> T;
}

impl<T> OrAbort<T> for Result<T, AllocError> {
    #[track_caller]
    fn or_abort(self) -> T {
        match self {
            Ok(value) => value,
            Err(err) => oom(err),
        }
    }
}
