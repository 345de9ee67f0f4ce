//! Category-based debug logging.
//!
//! Every message belongs to a category. Categories are individually switched on and off, either
//! by pattern (see [`activate_flog_categories_by_pattern`]) or through the `PIPELINE_DEBUG`
//! environment variable read by [`crate::config`]. Output goes to a raw file descriptor, stderr
//! unless redirected with [`set_flog_file_fd`].

use libc::c_int;
use std::os::fd::BorrowedFd;
use std::sync::atomic::{AtomicI32, Ordering};

#[rustfmt::skip::macros(categories)]
pub mod categories {
    use std::sync::atomic::AtomicBool;

    pub struct category_t {
        pub name: &'static str,
        pub description: &'static str,
        pub enabled: AtomicBool,
    }

    /// Declare a static category named $var, optionally enabled by default.
    macro_rules! declare_category {
        (
            ($var:ident, $name:literal, $description:literal, $enabled:expr)
        ) => {
            pub static $var: category_t = category_t {
                name: $name,
                description: $description,
                enabled: AtomicBool::new($enabled),
            };
        };
        (
            ($var:ident, $name:literal, $description:literal)
        ) => {
            declare_category!(($var, $name, $description, false));
        };
    }

    macro_rules! category_name {
        (($var:ident, $name:literal, $description:literal, $enabled:expr)) => {
            $var
        };
        (($var:ident, $name:literal, $description:literal)) => {
            $var
        };
    }

    macro_rules! categories {
        (
            $($cats:tt);*
            $(;)?
        ) => {
            $(
                declare_category!($cats);
            )*

            /// Every category, in declaration order.
            pub fn all_categories() -> Vec<&'static category_t> {
                vec![
                    $(
                        & category_name!($cats),
                    )*
                ]
            }
        };
    }

    categories!(
        (error, "error", "Serious unexpected errors (on by default)", true);

        (warning, "warning", "Warnings (on by default)", true);

        (exec, "exec", "Programs that could not be executed (on by default)", true);

        (exec_fork, "exec-fork", "Calls to fork()");

        (exec_job_exec, "exec-job-exec", "Pipelines being started");

        (exec_job_status, "exec-job-status", "Pipeline stages changing status");

        (proc_reap_external, "proc-reap-external", "Reaping pipeline stages");

        (signal_guard, "signal-guard", "Signal disposition changes");

        (pipe, "pipe", "Creating and closing pipeline descriptors");

        (reader, "reader", "Reading captured output");

        (config, "config", "Configuration read from the environment");
    );
}

/// FLOG formats values with Display. Debug-only types can opt in by implementing
/// FloggableDebug: `impl FloggableDebug for MyType {}`.
pub trait FloggableDisplay {
    fn to_flog_str(&self) -> String;
}

impl<T: std::fmt::Display> FloggableDisplay for T {
    fn to_flog_str(&self) -> String {
        self.to_string()
    }
}

pub trait FloggableDebug: std::fmt::Debug {
    fn to_flog_str(&self) -> String {
        format!("{:?}", self)
    }
}

/// Write one complete message to the flog fd.
pub fn flog_impl(s: &str) {
    let fd = get_flog_file_fd();
    if fd < 0 {
        return;
    }
    // Safety: the flog fd is kept open for the life of the process once installed.
    let fd = unsafe { BorrowedFd::borrow_raw(fd) };
    let mut remaining = s.as_bytes();
    while !remaining.is_empty() {
        match nix::unistd::write(fd, remaining) {
            Ok(0) => break,
            Ok(amt) => remaining = &remaining[amt..],
            Err(nix::Error::EINTR) => continue,
            Err(_) => break,
        }
    }
}

/// The entry point for flogging. Arguments are space separated and a newline is appended.
#[macro_export]
macro_rules! FLOG {
    ($category:ident, $($elem:expr),+ $(,)*) => {
        if $crate::flog::categories::$category.enabled.load(std::sync::atomic::Ordering::Relaxed) {
            #[allow(unused_imports)]
            use $crate::flog::{FloggableDisplay, FloggableDebug};
            let mut line = String::from($crate::flog::categories::$category.name);
            line.push(':');
            $(
                line.push(' ');
                line.push_str(&$elem.to_flog_str());
            )+
            // One write per message, so concurrent writers don't interleave mid-line.
            line.push('\n');
            $crate::flog::flog_impl(&line);
        }
    };
}

#[macro_export]
macro_rules! should_flog {
    ($category:ident) => {
        $crate::flog::categories::$category
            .enabled
            .load(std::sync::atomic::Ordering::Relaxed)
    };
}

pub use {should_flog, FLOG};

/// Match `s` against a glob supporting `*` and `?`.
fn wildcard_match(s: &str, pattern: &str) -> bool {
    let s: Vec<char> = s.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();
    let (mut si, mut pi) = (0, 0);
    // Where to resume after the most recent star: (pattern index, string index).
    let mut backtrack: Option<(usize, usize)> = None;
    while si < s.len() {
        if pi < pattern.len() && (pattern[pi] == '?' || pattern[pi] == s[si]) {
            si += 1;
            pi += 1;
        } else if pi < pattern.len() && pattern[pi] == '*' {
            backtrack = Some((pi, si));
            pi += 1;
        } else if let Some((star_pi, star_si)) = backtrack {
            pi = star_pi + 1;
            si = star_si + 1;
            backtrack = Some((star_pi, star_si + 1));
        } else {
            return false;
        }
    }
    pattern[pi..].iter().all(|&c| c == '*')
}

/// For each category, if its name matches the wildcard, set its enabled to the given sense.
fn apply_one_wildcard(wc: &str, sense: bool) {
    let mut match_found = false;
    for cat in categories::all_categories() {
        if wildcard_match(cat.name, wc) {
            cat.enabled.store(sense, Ordering::Relaxed);
            match_found = true;
        }
    }
    if !match_found {
        FLOG!(warning, "Failed to match debug category:", wc);
    }
}

/// Set the active flog categories according to a comma separated list of wildcards.
/// A leading `-` disables the matching categories instead.
pub fn activate_flog_categories_by_pattern(pattern: &str) {
    // Normalize underscores to dashes, allowing the user to be sloppy.
    let pattern = pattern.replace('_', "-");
    for s in pattern.split(',').filter(|s| !s.is_empty()) {
        match s.strip_prefix('-') {
            Some(negated) => apply_one_wildcard(negated, false),
            None => apply_one_wildcard(s, true),
        }
    }
}

/// The flog output fd. Defaults to stderr. A value < 0 disables flog.
static FLOG_FD: AtomicI32 = AtomicI32::new(libc::STDERR_FILENO);

pub fn set_flog_file_fd(fd: c_int) {
    FLOG_FD.store(fd, Ordering::Relaxed);
}

#[inline]
pub fn get_flog_file_fd() -> c_int {
    FLOG_FD.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::categories;
    use super::{activate_flog_categories_by_pattern, wildcard_match};
    use crate::tests::prelude::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match("exec-fork", "exec-fork"));
        assert!(wildcard_match("exec-fork", "exec-*"));
        assert!(wildcard_match("exec-fork", "*fork"));
        assert!(wildcard_match("exec-fork", "e?ec-*k"));
        assert!(wildcard_match("exec-fork", "*"));
        assert!(wildcard_match("", "*"));
        assert!(!wildcard_match("exec-fork", "exec"));
        assert!(!wildcard_match("exec", "exec-*"));
        assert!(!wildcard_match("reader", "r?"));
    }

    #[test]
    #[serial]
    fn test_activate_by_pattern() {
        let was = categories::pipe.enabled.load(Ordering::Relaxed);

        activate_flog_categories_by_pattern("pipe,proc_reap*");
        assert!(categories::pipe.enabled.load(Ordering::Relaxed));
        assert!(categories::proc_reap_external.enabled.load(Ordering::Relaxed));

        activate_flog_categories_by_pattern("-pipe,-proc-reap-external");
        assert!(!categories::pipe.enabled.load(Ordering::Relaxed));
        assert!(!categories::proc_reap_external.enabled.load(Ordering::Relaxed));

        categories::pipe.enabled.store(was, Ordering::Relaxed);
    }

    #[test]
    fn test_categories_are_named_uniquely() {
        let mut names: Vec<_> = categories::all_categories()
            .iter()
            .map(|c| c.name)
            .collect();
        let count = names.len();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), count);
    }
}
