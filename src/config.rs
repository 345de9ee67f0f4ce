//! Debug settings taken from the environment.
//!
//! `PIPELINE_DEBUG` is a comma separated list of flog category patterns to enable, for example
//! `PIPELINE_DEBUG='exec-*,-exec-fork'`. `PIPELINE_DEBUG_OUTPUT` names a file the log is appended
//! to instead of stderr.

use crate::error::{Error, Result};
use crate::fds::open_cloexec;
use crate::flog::{activate_flog_categories_by_pattern, set_flog_file_fd};
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use std::env;
use std::os::fd::IntoRawFd;
use std::path::PathBuf;
use std::sync::Once;

pub const DEBUG_VAR: &str = "PIPELINE_DEBUG";
pub const DEBUG_OUTPUT_VAR: &str = "PIPELINE_DEBUG_OUTPUT";

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Config {
    /// Flog category patterns to enable.
    pub debug_categories: Option<String>,
    /// File to write the log to.
    pub debug_output: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Self {
        Config {
            debug_categories: env::var(DEBUG_VAR).ok().filter(|s| !s.is_empty()),
            debug_output: env::var_os(DEBUG_OUTPUT_VAR)
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
        }
    }

    /// Enable the requested categories and redirect the log.
    pub fn apply(&self) -> Result<()> {
        if let Some(categories) = &self.debug_categories {
            activate_flog_categories_by_pattern(categories);
        }
        if let Some(path) = &self.debug_output {
            let fd = open_cloexec(
                path,
                OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_APPEND,
                Mode::from_bits_truncate(0o644),
            )
            .map_err(|err| {
                FLOG!(warning, "Could not open debug output", path.display(), ":", err);
                Error::resource("open debug output", err)
            })?;
            // The log fd lives for the rest of the process.
            set_flog_file_fd(fd.into_raw_fd());
        }
        FLOG!(config, "Applied", format!("{:?}", self));
        Ok(())
    }
}

static INIT: Once = Once::new();

/// Read and apply the environment configuration, once per process. Called on the first pipeline
/// start; calling it earlier makes the settings cover everything.
pub fn init() {
    INIT.call_once(|| {
        if let Err(err) = Config::from_env().apply() {
            FLOG!(warning, "Ignoring debug configuration:", err);
        }
    });
}
