//! Launching one stage: fork, wire up descriptors in the child, exec, and find out from the parent
//! side whether that worked.

use crate::command::{c_envp, c_paths, Command};
use crate::error::{Error, Result};
use crate::fds::{make_autoclose_pipes, read_fully};
use crate::fork_exec::postfork::{
    child_setup_process, execute_fork, exit_code_from_exec_error, exit_without_destructors,
    report_child_failure, safe_launch_process, safe_report_exec_error,
};
use crate::fork_exec::{decode_child_report, ChildPhase, CHILD_REPORT_LEN};
use crate::null_terminated_array::OwningNullTerminatedArray;
use crate::proc::{waitpid_blocking, Pid};
use crate::redirection::{Dup2List, Stream};
use crate::signal::SavedDisposition;
use errno::Errno;
use std::ffi::CString;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Number of calls to fork() that succeeded.
static FORK_COUNT: AtomicUsize = AtomicUsize::new(0);

/// The descriptors the pipeline assigns to a stage. `None` means inherit ours.
/// They are closed in the parent once the child has them.
#[derive(Debug, Default)]
pub(crate) struct StageIo {
    pub stdin: Option<OwnedFd>,
    pub stdout: Option<OwnedFd>,
    pub stderr: Option<OwnedFd>,
}

impl StageIo {
    fn slot(&mut self, stream: Stream) -> &mut Option<OwnedFd> {
        match stream {
            Stream::Stdin => &mut self.stdin,
            Stream::Stdout => &mut self.stdout,
            Stream::Stderr => &mut self.stderr,
        }
    }
}

fn spawn_error(cmd: &Command, errno: i32) -> Error {
    Error::Spawn {
        program: cmd.program().to_owned(),
        errno: Errno(errno),
    }
}

/// Everything the child needs, built before fork so the child never allocates.
struct ExecImage {
    actual_cmd: CString,
    argv: OwningNullTerminatedArray,
    envp: OwningNullTerminatedArray,
    candidates: OwningNullTerminatedArray,
}

impl ExecImage {
    fn new(cmd: &Command) -> Result<Self> {
        let invalid = || spawn_error(cmd, libc::EINVAL);
        let actual_cmd = CString::new(cmd.program()).map_err(|_| invalid())?;
        let argv = cmd.c_argv().ok_or_else(invalid)?;
        let env = cmd.child_environment();
        let candidates = c_paths(cmd.exec_candidates(&env)).ok_or_else(invalid)?;
        let envp = c_envp(env).ok_or_else(invalid)?;
        Ok(ExecImage {
            actual_cmd,
            argv: OwningNullTerminatedArray::new(argv),
            envp: OwningNullTerminatedArray::new(envp),
            candidates: OwningNullTerminatedArray::new(candidates),
        })
    }
}

/// Spawn `cmd` with the given descriptors. The command's own redirections take precedence over
/// the ones in `io`. `dispositions` are reinstated in the child before exec.
///
/// Returns once the child has either exec'd (its end of the back-channel closes) or reported
/// why it could not, in which case it has been reaped and a Spawn error is returned.
pub(crate) fn launch_process(
    cmd: &Command,
    mut io: StageIo,
    dispositions: &[SavedDisposition],
) -> Result<Pid> {
    for stream in [Stream::Stdin, Stream::Stdout, Stream::Stderr] {
        let opened = cmd
            .redirection(stream)
            .open(stream)
            .map_err(|err| Error::resource("open", err))?;
        if let Some(fd) = opened {
            // Replacing a pipe end closes it; the neighbouring stage then sees EOF or EPIPE.
            *io.slot(stream) = Some(fd);
        }
    }

    let image = ExecImage::new(cmd)?;
    if should_flog!(exec_fork) {
        let tried: Vec<_> = image
            .candidates
            .iter()
            .map(|path| path.to_string_lossy().into_owned())
            .collect();
        FLOG!(exec_fork, "Will try", tried.join(" "));
    }
    let dup2s = Dup2List::for_streams(io.stdin.as_ref(), io.stdout.as_ref(), io.stderr.as_ref());
    let report = make_autoclose_pipes().map_err(|err| Error::resource("pipe", err))?;
    let report_fd = report.write.as_raw_fd();
    let nice = cmd.nice();

    let fork_res = execute_fork().map_err(|errno| Error::Resource { op: "fork", errno })?;
    if fork_res == 0 {
        // Child. Nothing here may allocate.
        if let Err((phase, err)) = child_setup_process(&dup2s, dispositions, nice) {
            report_child_failure(report_fd, phase, err);
            exit_without_destructors(exit_code_from_exec_error(err));
        }
        let err = safe_launch_process(&image.candidates, &image.argv, &image.envp);
        safe_report_exec_error(err, &image.actual_cmd, &image.argv);
        report_child_failure(report_fd, ChildPhase::Exec, err);
        exit_without_destructors(exit_code_from_exec_error(err));
    }

    let Some(pid) = Pid::new(fork_res) else {
        return Err(Error::Resource {
            op: "fork",
            errno: Errno(libc::ECHILD),
        });
    };
    // Our copies of the child's descriptors, and the write end of the back-channel, must be
    // closed for the read below to see EOF once the child execs.
    drop(report.write);
    drop(io);

    let count = FORK_COUNT.fetch_add(1, Ordering::Relaxed) + 1;
    FLOG!(exec_fork, "Fork #", count, "pid", pid, ":", cmd);

    let mut buf = [0u8; CHILD_REPORT_LEN];
    match read_fully(report.read.as_fd(), &mut buf) {
        Ok(0) => Ok(pid),
        Ok(CHILD_REPORT_LEN) => {
            let (phase, err) = decode_child_report(&buf);
            reap_failed_child(pid);
            FLOG!(
                exec_fork,
                "Could not",
                phase.map_or("start", ChildPhase::describe),
                "'",
                cmd.program(),
                "':",
                Errno(err)
            );
            Err(spawn_error(cmd, err))
        }
        Ok(_) => {
            // The child died halfway through its report.
            reap_failed_child(pid);
            Err(Error::Resource {
                op: "read child report",
                errno: Errno(libc::EIO),
            })
        }
        Err(err) => {
            unsafe { libc::kill(pid.as_pid_t(), libc::SIGKILL) };
            reap_failed_child(pid);
            Err(Error::resource("read child report", err))
        }
    }
}

fn reap_failed_child(pid: Pid) {
    if let Err(err) = waitpid_blocking(pid) {
        FLOG!(warning, "Could not reap failed child", pid, ":", err);
    }
}

/// Number of successful forks since the process started.
pub fn fork_count() -> usize {
    FORK_COUNT.load(Ordering::Relaxed)
}
