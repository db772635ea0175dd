//! Environment-driven setup.
//!
//! | variable           | meaning                                      |
//! |--------------------|----------------------------------------------|
//! | `HTA_LEAK_REPORT`  | `1`/`true`/`yes`/`on` enables leak tracking  |
//! | `HTA_MEMORY_LIMIT` | byte cap on everything the arena allocates   |
//! | `HTA_BACKEND`      | `malloc` (default) or `dlmalloc`             |
//!
//! Unset or unparsable variables keep their defaults; the latter are logged.

use std::{env, str::FromStr};

use log::warn;

use crate::alloc::{enable_leak_report, DlMalloc, Limited, Malloc, SystemAlloc, Ta};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Backend {
    #[default]
    Malloc,
    DlMalloc,
}

impl FromStr for Backend {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s.to_lowercase().as_str() {
            "malloc" | "libc" | "system" => Ok(Backend::Malloc),
            "dlmalloc" | "dl" => Ok(Backend::DlMalloc),
            _ => Err(()),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Config {
    pub leak_report: bool,
    pub memory_limit: Option<usize>,
    pub backend: Backend,
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(value) = parse_env("HTA_LEAK_REPORT", parse_bool) {
            config.leak_report = value;
        }
        if let Some(value) = parse_env("HTA_MEMORY_LIMIT", |s| s.parse().ok()) {
            config.memory_limit = Some(value);
        }
        if let Some(value) = parse_env("HTA_BACKEND", |s| s.parse().ok()) {
            config.backend = value;
        }
        config
    }

    /// An arena set up as described. Turns leak tracking on if asked to,
    /// which affects every arena in the process.
    pub fn build(&self) -> Ta<Limited<SystemAlloc>> {
        if self.leak_report {
            enable_leak_report();
        }
        let system = match self.backend {
            Backend::Malloc => SystemAlloc::Malloc(Malloc),
            Backend::DlMalloc => SystemAlloc::DlMalloc(DlMalloc::new()),
        };
        Ta::with_allocator(Limited::new(
            system,
            self.memory_limit.unwrap_or(usize::MAX),
        ))
    }

    /// Install `env_logger`, driven by `RUST_LOG`, unless a logger is already
    /// installed.
    pub fn init_logging() {
        let _ = env_logger::Builder::from_env(env_logger::Env::default()).try_init();
    }
}

fn parse_env<T>(name: &str, parse: impl FnOnce(&str) -> Option<T>) -> Option<T> {
    let raw = env::var(name).ok()?;
    let value = parse(raw.trim());
    if value.is_none() {
        warn!("ignoring {name}={raw:?}");
    }
    value
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_backends_and_flags() {
        assert_eq!("DLMalloc".parse::<Backend>(), Ok(Backend::DlMalloc));
        assert_eq!("libc".parse::<Backend>(), Ok(Backend::Malloc));
        assert_eq!("jemalloc".parse::<Backend>(), Err(()));
        assert_eq!(parse_bool("On"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn build_applies_limit_and_backend() {
        let config = Config {
            leak_report: false,
            memory_limit: Some(32),
            backend: Backend::DlMalloc,
        };
        let mut ta = config.build();
        assert!(matches!(ta.allocator().inner(), SystemAlloc::DlMalloc(_)));
        let node = ta.alloc_size(None, 32).unwrap();
        assert!(ta.alloc_size(None, 1).is_err());
        ta.free(node);
        assert_eq!(ta.allocator().used(), 0);
    }
}
