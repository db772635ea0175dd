//! `or_abort()` has to take the whole process down, so each case re-runs this
//! test binary as a child that does the failing call, and the parent looks at
//! how the child died.

use std::{env, process::Command};

use hta::{alloc::Limited, ta_asprintf, Config, Malloc, OrAbort, Ta};

const CHILD_ENV: &str = "HTA_FAIL_FAST_CHILD";

fn run_child_case(case: &str) {
    let mut ta = Ta::with_allocator(Limited::new(Malloc, 16));
    let small = ta.strdup(None, "1234").or_abort();
    match case {
        "alloc" => {
            ta.alloc_size(None, 64).or_abort();
        }
        "realloc" => {
            ta.realloc_size(small, 64).or_abort();
        }
        "append" => ta.strdup_append(small, "this is far too long").or_abort(),
        "asprintf" => {
            ta_asprintf!(ta, small, "{:>40}", "padded").or_abort();
        }
        "array" => {
            ta.alloc_array::<u64>(None, usize::MAX / 4).or_abort();
        }
        _ => unreachable!("unknown case {case}"),
    }
}

#[test]
fn or_abort_terminates_the_process() {
    if let Ok(case) = env::var(CHILD_ENV) {
        Config::init_logging();
        run_child_case(&case);
        // still alive: report it to the parent with a clean exit
        std::process::exit(0);
    }

    let exe = env::current_exe().unwrap();
    for case in ["alloc", "realloc", "append", "asprintf", "array"] {
        let output = Command::new(&exe)
            .args(["--exact", "or_abort_terminates_the_process", "--test-threads=1"])
            .env(CHILD_ENV, case)
            .output()
            .unwrap();
        assert!(!output.status.success(), "{case}: child survived");
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            assert_eq!(output.status.signal(), Some(libc::SIGABRT), "{case}");
        }
    }
}

#[test]
fn or_abort_is_transparent_on_success() {
    let mut ta = Ta::new();
    let root = ta.new_context(None).or_abort();
    let s = ta.strdup(root, "fine").or_abort();
    ta.strdup_append_buffer(s, "!").or_abort();
    assert_eq!(ta.bytes(s), b"fine!\0");
}
