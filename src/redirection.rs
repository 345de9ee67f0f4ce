//! Where a stage's standard streams go, and the dup2 plan that wires them up in the child.

use crate::fds::{dup_cloexec, open_cloexec};
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

/// One of a child's standard streams.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Stream {
    Stdin,
    Stdout,
    Stderr,
}

impl Stream {
    /// The descriptor number the child sees this stream on.
    pub fn fileno(self) -> RawFd {
        match self {
            Stream::Stdin => libc::STDIN_FILENO,
            Stream::Stdout => libc::STDOUT_FILENO,
            Stream::Stderr => libc::STDERR_FILENO,
        }
    }

    fn file_mode(self) -> RedirectionMode {
        match self {
            Stream::Stdin => RedirectionMode::Input,
            Stream::Stdout | Stream::Stderr => RedirectionMode::Overwrite,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RedirectionMode {
    Overwrite, // > file.txt
    Append,    // >> file.txt
    Input,     // < file.txt
}

impl RedirectionMode {
    /// The open flags for this redirection mode.
    pub fn oflags(self) -> OFlag {
        match self {
            RedirectionMode::Append => OFlag::O_CREAT | OFlag::O_APPEND | OFlag::O_WRONLY,
            RedirectionMode::Overwrite => OFlag::O_CREAT | OFlag::O_WRONLY | OFlag::O_TRUNC,
            RedirectionMode::Input => OFlag::O_RDONLY,
        }
    }
}

/// A command's own redirection of one of its streams.
///
/// Anything other than `Inherit` wins over the pipe endpoint a pipeline would otherwise connect
/// to that stream, as `echo alpha | cat < beta.txt` reads beta.txt in a shell.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum Redirect {
    /// Use whatever the pipeline assigns, or the parent's stream.
    #[default]
    Inherit,
    /// The null device.
    Null,
    /// Read from (stdin) or truncate and write to (stdout, stderr) a file.
    File(PathBuf),
    /// Append to a file.
    Append(PathBuf),
    /// A descriptor owned by the caller. It is duplicated at spawn time; the caller's copy is
    /// never closed.
    Fd(RawFd),
}

impl Redirect {
    /// Open the parent-side source for this redirection of `stream`.
    /// Returns None for `Inherit`.
    pub(crate) fn open(&self, stream: Stream) -> nix::Result<Option<OwnedFd>> {
        let fd = match self {
            Redirect::Inherit => return Ok(None),
            Redirect::Null => {
                let flags = match stream {
                    Stream::Stdin => OFlag::O_RDONLY,
                    Stream::Stdout | Stream::Stderr => OFlag::O_WRONLY,
                };
                open_cloexec(Path::new("/dev/null"), flags, Mode::empty())?
            }
            Redirect::File(path) => open_file(path, stream.file_mode())?,
            Redirect::Append(path) => open_file(path, RedirectionMode::Append)?,
            Redirect::Fd(fd) => {
                if *fd < 0 {
                    return Err(nix::Error::EBADF);
                }
                // Safety: only borrowed for the duration of the dup.
                dup_cloexec(unsafe { BorrowedFd::borrow_raw(*fd) })?
            }
        };
        Ok(Some(fd))
    }
}

fn open_file(path: &Path, mode: RedirectionMode) -> nix::Result<OwnedFd> {
    // 0666 before umask, like a shell's `>`.
    let perms = Mode::from_bits_truncate(0o666);
    open_cloexec(path, mode.oflags(), perms)
}

/// What a pipeline does with its overall input or output.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum Want {
    /// The first stage reads our stdin, or the last stage writes our stdout.
    #[default]
    Inherit,
    /// Connect a pipe whose other end stays with the caller after start.
    Capture,
    /// Read from, or truncate and write to, a file.
    File(PathBuf),
    /// A descriptor owned by the caller; duplicated at start.
    Fd(RawFd),
}

impl Want {
    /// The equivalent per-command redirection, for everything but `Capture`.
    pub(crate) fn as_redirect(&self) -> Option<Redirect> {
        match self {
            Want::Inherit => Some(Redirect::Inherit),
            Want::Capture => None,
            Want::File(path) => Some(Redirect::File(path.clone())),
            Want::Fd(fd) => Some(Redirect::Fd(*fd)),
        }
    }
}

/// A type that represents the action dup2(src, target).
/// None of the fds here are considered 'owned'.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Dup2Action {
    pub src: RawFd,
    pub target: RawFd,
}

/// The sequence of dup2 calls a child makes before exec.
#[derive(Debug, Default)]
pub struct Dup2List {
    actions: Vec<Dup2Action>,
}

impl Dup2List {
    pub fn new() -> Self {
        Default::default()
    }

    /// Build the plan for a stage whose streams come from the given sources.
    /// A `None` source leaves the stream as inherited from the parent.
    pub fn for_streams(
        stdin: Option<&OwnedFd>,
        stdout: Option<&OwnedFd>,
        stderr: Option<&OwnedFd>,
    ) -> Self {
        let mut result = Self::new();
        for (stream, src) in [
            (Stream::Stdin, stdin),
            (Stream::Stdout, stdout),
            (Stream::Stderr, stderr),
        ] {
            if let Some(src) = src {
                result.add_dup2(src.as_raw_fd(), stream.fileno());
            }
        }
        result
    }

    pub fn get_actions(&self) -> &[Dup2Action] {
        &self.actions
    }

    /// Append a dup2 action.
    pub fn add_dup2(&mut self, src: RawFd, target: RawFd) {
        assert!(src >= 0 && target >= 0, "Invalid fd in add_dup2");
        // Our sources all live in the high fd range, so a source can never be clobbered by an
        // earlier action's target.
        self.actions.push(Dup2Action { src, target });
    }
}
