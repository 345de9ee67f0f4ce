//! Process ids, exit statuses, and reaping.

use crate::signal::Signal;
use errno::Errno;
use libc::{EXIT_SUCCESS, WEXITSTATUS, WIFEXITED, WIFSIGNALED, WNOHANG, WTERMSIG};
use std::fmt;
use std::num::NonZeroU32;

/// A type-safe equivalent to [`libc::pid_t`].
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash)]
pub struct Pid(NonZeroU32);

impl Pid {
    /// Wrap a pid returned by the OS. Returns None for zero or negative values.
    #[inline(always)]
    pub fn new(pid: i32) -> Option<Self> {
        u32::try_from(pid).ok().and_then(NonZeroU32::new).map(Pid)
    }
    #[inline(always)]
    pub fn get(&self) -> i32 {
        self.0.get() as i32
    }
    #[inline(always)]
    pub fn as_pid_t(&self) -> libc::pid_t {
        #[allow(clippy::useless_conversion)]
        self.get().into()
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.get(), f)
    }
}

/// How a stage terminated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProcStatus {
    /// The program called exit() with this code.
    Exited(u8),
    /// The program was killed by this signal.
    Signaled(Signal),
}

impl Default for ProcStatus {
    fn default() -> Self {
        ProcStatus::Exited(0)
    }
}

impl ProcStatus {
    /// Construct from a status returned from a waitpid call.
    /// Returns None for stopped or continued notifications, which we never ask for.
    pub fn from_waitpid(status: i32) -> Option<ProcStatus> {
        if WIFEXITED(status) {
            // WEXITSTATUS is the low 8 bits of the code passed to exit().
            Some(ProcStatus::Exited(WEXITSTATUS(status) as u8))
        } else if WIFSIGNALED(status) {
            Some(ProcStatus::Signaled(Signal::new(WTERMSIG(status))))
        } else {
            None
        }
    }

    /// Return if this status represents success.
    pub fn is_success(&self) -> bool {
        matches!(self, ProcStatus::Exited(code) if i32::from(*code) == EXIT_SUCCESS)
    }

    /// The exit code, if the program exited normally.
    pub fn exit_code(&self) -> Option<u8> {
        match self {
            ProcStatus::Exited(code) => Some(*code),
            ProcStatus::Signaled(_) => None,
        }
    }

    /// The terminating signal, if the program was killed.
    pub fn signal(&self) -> Option<Signal> {
        match self {
            ProcStatus::Exited(_) => None,
            ProcStatus::Signaled(sig) => Some(*sig),
        }
    }

    /// A single number the way shells report it: the exit code, or 128 plus the signal number.
    pub fn status_value(&self) -> i32 {
        match self {
            ProcStatus::Exited(code) => i32::from(*code),
            ProcStatus::Signaled(sig) => 128 + sig.code(),
        }
    }
}

impl fmt::Display for ProcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcStatus::Exited(code) => write!(f, "exited with status {code}"),
            ProcStatus::Signaled(sig) => write!(f, "killed by {} ({})", sig.name(), sig.desc()),
        }
    }
}

/// Block until `pid` terminates, retrying if interrupted.
pub(crate) fn waitpid_blocking(pid: Pid) -> Result<ProcStatus, Errno> {
    loop {
        let mut status: libc::c_int = 0;
        let ret = unsafe { libc::waitpid(pid.as_pid_t(), &mut status, 0) };
        if ret < 0 {
            let err = errno::errno();
            if err.0 == libc::EINTR {
                continue;
            }
            FLOG!(warning, "waitpid", pid, "failed:", err);
            return Err(err);
        }
        if let Some(status) = ProcStatus::from_waitpid(status) {
            FLOG!(proc_reap_external, "Reaped", pid, status);
            return Ok(status);
        }
    }
}

/// Reap `pid` if it has terminated, without blocking.
pub(crate) fn waitpid_nohang(pid: Pid) -> Result<Option<ProcStatus>, Errno> {
    loop {
        let mut status: libc::c_int = 0;
        let ret = unsafe { libc::waitpid(pid.as_pid_t(), &mut status, WNOHANG) };
        if ret < 0 {
            let err = errno::errno();
            if err.0 == libc::EINTR {
                continue;
            }
            return Err(err);
        }
        if ret == 0 {
            return Ok(None);
        }
        let status = ProcStatus::from_waitpid(status);
        if let Some(status) = status {
            FLOG!(proc_reap_external, "Reaped", pid, status);
        }
        return Ok(status);
    }
}
