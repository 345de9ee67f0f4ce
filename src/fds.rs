//! Descriptors created on behalf of a pipeline.
//!
//! Everything here is close-on-exec and lives at or above [`FIRST_HIGH_FD`]. A stage only ever
//! receives descriptors through an explicit dup2 onto 0, 1 or 2, so nothing we hold can leak
//! into a child (including children of other pipelines started concurrently) and mask end of
//! stream on a pipe.

use cfg_if::cfg_if;
use nix::fcntl::{FcntlArg, FdFlag, OFlag};
use nix::sys::stat::Mode;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;

/// The first "high fd", outside the range a program expects to inherit meaningfully.
pub const FIRST_HIGH_FD: RawFd = 10;

/// Helper type returned from make_autoclose_pipes.
pub struct AutoClosePipes {
    /// Read end of the pipe.
    pub read: OwnedFd,

    /// Write end of the pipe.
    pub write: OwnedFd,
}

/// Construct a pair of connected pipes, set to close-on-exec.
pub fn make_autoclose_pipes() -> nix::Result<AutoClosePipes> {
    cfg_if! {
        if #[cfg(any(
            target_os = "linux",
            target_os = "android",
            target_os = "freebsd",
            target_os = "dragonfly",
            target_os = "netbsd",
            target_os = "openbsd",
            target_os = "illumos",
        ))] {
            let (read, write) = nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(|err| {
                FLOG!(warning, "pipe2 failed:", err);
                err
            })?;
            let already_cloexec = true;
        } else {
            // No pipe2 here, so there is a window where a concurrent fork may inherit these.
            let (read, write) = nix::unistd::pipe().map_err(|err| {
                FLOG!(warning, "pipe failed:", err);
                err
            })?;
            let already_cloexec = false;
        }
    }

    let read = heightenize_fd(read, already_cloexec)?;
    let write = heightenize_fd(write, already_cloexec)?;
    FLOG!(pipe, "Created pipe", read.as_raw_fd(), "->", write.as_raw_fd());
    Ok(AutoClosePipes { read, write })
}

/// If the given fd is in the "user range", move it to a new fd in the "high range".
/// The result always has CLOEXEC set. On failure the input fd is closed.
fn heightenize_fd(fd: OwnedFd, input_has_cloexec: bool) -> nix::Result<OwnedFd> {
    if fd.as_raw_fd() >= FIRST_HIGH_FD {
        if !input_has_cloexec {
            set_cloexec(fd.as_fd(), true)?;
        }
        return Ok(fd);
    }
    // Dropping the low fd closes it.
    dup_cloexec(fd.as_fd())
}

/// Duplicate `fd` into the high range with CLOEXEC set. The original is left alone, which is
/// how caller-supplied descriptors are taken over: the caller keeps ownership of theirs.
pub fn dup_cloexec(fd: BorrowedFd<'_>) -> nix::Result<OwnedFd> {
    let newfd = nix::fcntl::fcntl(fd, FcntlArg::F_DUPFD_CLOEXEC(FIRST_HIGH_FD))?;
    // Safety: fcntl just handed us this descriptor and nobody else knows about it.
    Ok(unsafe { OwnedFd::from_raw_fd(newfd) })
}

/// Set or clear FD_CLOEXEC, preserving other descriptor flags.
pub fn set_cloexec(fd: BorrowedFd<'_>, should_set: bool) -> nix::Result<()> {
    let flags = FdFlag::from_bits_truncate(nix::fcntl::fcntl(fd, FcntlArg::F_GETFD)?);
    let mut new_flags = flags;
    new_flags.set(FdFlag::FD_CLOEXEC, should_set);
    if new_flags != flags {
        nix::fcntl::fcntl(fd, FcntlArg::F_SETFD(new_flags))?;
    }
    Ok(())
}

/// Return whether FD_CLOEXEC is set on `fd`.
pub fn is_cloexec(fd: BorrowedFd<'_>) -> nix::Result<bool> {
    let flags = FdFlag::from_bits_truncate(nix::fcntl::fcntl(fd, FcntlArg::F_GETFD)?);
    Ok(flags.contains(FdFlag::FD_CLOEXEC))
}

/// open() with the close-on-exec flag set atomically, retrying on EINTR, and the result moved
/// into the high range.
pub fn open_cloexec(path: &Path, flags: OFlag, mode: Mode) -> nix::Result<OwnedFd> {
    let fd = loop {
        match nix::fcntl::open(path, flags | OFlag::O_CLOEXEC, mode) {
            Err(nix::Error::EINTR) => continue,
            res => break res?,
        }
    };
    heightenize_fd(fd, true)
}

/// read() retrying on EINTR until `buf` is full or end of file. Returns the number of bytes read.
pub fn read_fully(fd: BorrowedFd<'_>, buf: &mut [u8]) -> nix::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match nix::unistd::read(fd, &mut buf[filled..]) {
            Ok(0) => break,
            Ok(amt) => filled += amt,
            Err(nix::Error::EINTR) => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}
