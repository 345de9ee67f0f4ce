//! The error type shared by every fallible pipeline operation.
//!
//! A program exiting non-zero is not an error: that is reported as a [`ProcStatus`].
//!
//! [`ProcStatus`]: crate::proc::ProcStatus

use crate::proc::Pid;
use errno::Errno;
use std::fmt;
use std::io;

#[derive(Debug)]
pub enum Error {
    /// A pipeline or one of its commands was modified after it started.
    Config(&'static str),

    /// The operation does not make sense in the pipeline's current state, e.g. reading output
    /// that was never captured.
    State(&'static str),

    /// The child could not set up its descriptors or exec the program. Reported by the child
    /// itself over a private pipe before it exits.
    Spawn { program: String, errno: Errno },

    /// Reading or writing captured data failed. End of stream is never reported this way.
    Io(io::Error),

    /// A pipe, file, descriptor or process could not be created (or signalled) while managing
    /// the pipeline.
    Resource { op: &'static str, errno: Errno },

    /// Reaping a stage failed. This only happens if someone else reaped our child.
    Wait { pid: Pid, errno: Errno },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub(crate) fn resource(op: &'static str, err: nix::Error) -> Self {
        Error::Resource {
            op,
            errno: nix_errno(err),
        }
    }

    /// The OS error code carried by this error, if any.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Error::Spawn { errno, .. } | Error::Resource { errno, .. } | Error::Wait { errno, .. } => {
                Some(*errno)
            }
            Error::Io(err) => err.raw_os_error().map(Errno),
            Error::Config(_) | Error::State(_) => None,
        }
    }
}

/// Convert nix's errno representation to ours.
pub(crate) fn nix_errno(err: nix::Error) -> Errno {
    Errno(err as i32)
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(what) => write!(f, "cannot reconfigure a started pipeline: {what}"),
            Error::State(what) => f.write_str(what),
            Error::Spawn { program, errno } => {
                write!(f, "failed to execute process '{program}': {errno}")
            }
            Error::Io(err) => write!(f, "I/O error: {err}"),
            Error::Resource { op, errno } => write!(f, "{op}: {errno}"),
            Error::Wait { pid, errno } => write!(f, "waitpid({pid}): {errno}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}
