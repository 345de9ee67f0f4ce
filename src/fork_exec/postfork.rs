// The stuff that happens after fork.
// Everything called in the child must be async-signal safe.
// That means no locking, no allocating, no freeing memory, etc!
use super::flog_safe::FLOG_SAFE;
use super::{encode_child_report, ChildPhase, PATH_BSHELL};
use crate::null_terminated_array::OwningNullTerminatedArray;
use crate::redirection::Dup2List;
use crate::signal::SavedDisposition;
use errno::{errno, set_errno, Errno};
use libc::{c_char, pid_t};
use std::ffi::CStr;
use std::time::Duration;

/// The number of times to try to call fork() before giving up.
const FORK_LAPS: usize = 5;

/// The number of nanoseconds to sleep between attempts to call fork().
const FORK_SLEEP_TIME: Duration = Duration::from_nanos(1000000);

/// Exit codes for a child that never reached the program, as shells use them.
const STATUS_CMD_UNKNOWN: i32 = 127;
const STATUS_NOT_EXECUTABLE: i32 = 126;

/// This function is a wrapper around fork. If the fork calls fails with EAGAIN, it is retried
/// FORK_LAPS times, with a very slight delay between each lap. Called in the parent.
pub fn execute_fork() -> Result<pid_t, Errno> {
    let mut err = Errno(0);
    for i in 0..FORK_LAPS {
        let pid = unsafe { libc::fork() };
        if pid >= 0 {
            return Ok(pid);
        }
        err = errno();
        if err.0 != libc::EAGAIN {
            break;
        }
        // Don't sleep on the final lap
        if i != FORK_LAPS - 1 {
            std::thread::sleep(FORK_SLEEP_TIME);
        }
    }

    match err.0 {
        libc::EAGAIN => FLOG!(
            error,
            "fork: Out of resources. Check RLIMIT_NPROC and pid_max."
        ),
        libc::ENOMEM => FLOG!(error, "fork: Out of memory."),
        _ => FLOG!(error, "fork failed:", err),
    }
    Err(err)
}

/// Set up redirections, signal dispositions and niceness in the child process.
/// On failure, returns the phase that failed and the errno.
pub fn child_setup_process(
    dup2s: &Dup2List,
    dispositions: &[SavedDisposition],
    nice: i32,
) -> Result<(), (ChildPhase, i32)> {
    // Note we are called in a forked child.
    for act in dup2s.get_actions() {
        // dup2 clears CLOEXEC on the target, which is what lets it survive exec.
        if unsafe { libc::dup2(act.src, act.target) } < 0 {
            let err = errno().0;
            FLOG_SAFE!(
                warning,
                "failed to set up file descriptors in child_setup_process: dup2 ",
                act.src,
                " -> ",
                act.target
            );
            return Err((ChildPhase::Redirect, err));
        }
    }

    // Put back what the pipeline's guards replaced, so that the program starts with the
    // dispositions our caller had.
    for disposition in dispositions {
        let err = disposition.restore();
        if err != 0 {
            return Err((ChildPhase::Signals, err));
        }
    }

    if nice != 0 {
        // nice() may legitimately return -1, so errno is the only failure indicator.
        set_errno(Errno(0));
        let ret = unsafe { libc::nice(nice) };
        if ret == -1 && errno().0 != 0 {
            // Not fatal: the program still runs, just not at the requested priority.
            FLOG_SAFE!(warning, "nice(", nice, ") failed with errno ", errno().0);
        }
    }
    Ok(())
}

/// Return true if either there is no NUL byte, or there is a line containing a lowercase letter
/// before the first NUL byte.
fn is_thompson_shell_payload(p: &[u8]) -> bool {
    if !p.contains(&b'\0') {
        return true;
    };
    let mut haslower = false;
    for c in p {
        if c.is_ascii_lowercase() || *c == b'$' || *c == b'`' {
            haslower = true;
        }
        if haslower && *c == b'\n' {
            return true;
        }
    }
    false
}

/// Check the beginning of a file to see if it's safe to hand to /bin/sh when execve() returns
/// ENOEXEC. Binary files usually start with uppercase magic (PNG, MZ, ...), so require a line
/// with a lowercase letter before any NUL byte.
/// Called after fork: must not allocate.
pub fn is_thompson_shell_script(path: &CStr) -> bool {
    let saved = errno();
    let mut res = false;
    let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDONLY | libc::O_NOCTTY | libc::O_CLOEXEC) };
    if fd >= 0 {
        let mut buf = [b'\0'; 256];
        let got = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if got >= 0 && is_thompson_shell_payload(&buf[..got as usize]) {
            res = true;
        }
        unsafe { libc::close(fd) };
    }
    set_errno(saved);
    res
}

/// Try each candidate path in turn, like execvp(). Only returns if none could be executed; the
/// result is the errno to report.
/// Called in a forked child! Do not allocate memory, etc.
pub fn safe_launch_process(
    candidates: &OwningNullTerminatedArray,
    argv: &OwningNullTerminatedArray,
    envp: &OwningNullTerminatedArray,
) -> i32 {
    let mut result = libc::ENOENT;
    let mut saw_eacces = false;
    for path in candidates.iter() {
        unsafe { libc::execve(path.as_ptr(), argv.get(), envp.get()) };
        let err = errno().0;
        match err {
            libc::ENOEXEC => {
                // The shebang wasn't introduced until UNIX Seventh Edition, so if
                // the kernel won't run the binary we hand it off to the interpreter.
                if is_thompson_shell_script(path) {
                    exec_with_bshell(path, argv, envp);
                }
                return libc::ENOEXEC;
            }
            libc::EACCES => {
                // Keep looking, but report this if nothing better turns up.
                saw_eacces = true;
            }
            libc::ENOENT | libc::ENOTDIR | libc::ENODEV | libc::ETIMEDOUT | libc::ESTALE => {
                result = err;
            }
            _ => return err,
        }
    }
    if saw_eacces {
        libc::EACCES
    } else {
        result
    }
}

/// Run `path` as a script under /bin/sh. Returns only on failure.
fn exec_with_bshell(
    path: &CStr,
    argv: &OwningNullTerminatedArray,
    envp: &OwningNullTerminatedArray,
) {
    // We must not allocate memory, so only 128 args are supported.
    const MAXARGS: usize = 128;
    let argv = argv.as_ptr_slice();
    if argv.is_empty() || argv.len() > MAXARGS {
        return;
    }
    // +1 for /bin/sh, +1 for terminating nullptr
    let mut argv2: [*const c_char; 1 + MAXARGS + 1] = [std::ptr::null(); 1 + MAXARGS + 1];
    let bshell = PATH_BSHELL.as_ptr() as *const c_char;
    argv2[0] = bshell;
    argv2[1..argv.len() + 1].copy_from_slice(argv);
    // The script should be named by its full path, not what we would pass as argv0.
    argv2[1] = path.as_ptr();
    unsafe {
        libc::execve(bshell, argv2.as_ptr(), envp.get());
    }
}

/// Send the failure to the parent over the back-channel. If that fails too, log it here.
pub fn report_child_failure(fd: i32, phase: ChildPhase, err: i32) {
    let buf = encode_child_report(phase, err);
    let mut written = 0;
    while written < buf.len() {
        let amt = unsafe {
            libc::write(
                fd,
                buf[written..].as_ptr().cast(),
                buf.len() - written,
            )
        };
        if amt < 0 {
            if errno().0 == libc::EINTR {
                continue;
            }
            FLOG_SAFE!(
                error,
                "could not report child failure, errno ",
                errno().0
            );
            return;
        }
        written += amt as usize;
    }
}

/// Describe why `actual_cmd` could not be executed, on the flog fd.
pub fn safe_report_exec_error(err: i32, actual_cmd: &CStr, argv: &OwningNullTerminatedArray) {
    match err {
        libc::E2BIG => {
            let sz = argv.iter().map(|s| s.to_bytes().len()).sum::<usize>();
            FLOG_SAFE!(
                exec,
                "Failed to execute process '",
                actual_cmd,
                "': the total size of the argument list and environment exceeds the OS limit (arguments alone are ",
                sz,
                " bytes)."
            );
        }
        libc::ENOEXEC => {
            FLOG_SAFE!(
                exec,
                "Failed to execute process '",
                actual_cmd,
                "': the file could not be run by the operating system."
            );
        }
        libc::ENOENT => {
            FLOG_SAFE!(
                exec,
                "Failed to execute process '",
                actual_cmd,
                "': The file does not exist or could not be executed."
            );
        }
        libc::EACCES => {
            if unsafe { libc::access(actual_cmd.as_ptr(), libc::X_OK) } == 0 {
                FLOG_SAFE!(
                    exec,
                    "Failed to execute process '",
                    actual_cmd,
                    "': The file exists and is executable. Check the interpreter or linker?"
                );
            } else {
                FLOG_SAFE!(
                    exec,
                    "Failed to execute process '",
                    actual_cmd,
                    "': The file could not be accessed."
                );
            }
        }
        libc::ENOMEM => {
            FLOG_SAFE!(exec, "Out of memory");
        }
        libc::ETXTBSY => {
            FLOG_SAFE!(
                exec,
                "Failed to execute process '",
                actual_cmd,
                "': File is currently open for writing.",
            );
        }
        libc::ELOOP => {
            FLOG_SAFE!(
                exec,
                "Failed to execute process '",
                actual_cmd,
                "': Too many layers of symbolic links. Maybe a loop?"
            );
        }
        libc::EISDIR => {
            FLOG_SAFE!(
                exec,
                "Failed to execute process '",
                actual_cmd,
                "': File is a directory."
            );
        }
        libc::ENOTDIR => {
            FLOG_SAFE!(
                exec,
                "Failed to execute process '",
                actual_cmd,
                "': A path component is not a directory."
            );
        }
        libc::EMFILE | libc::ENFILE => {
            FLOG_SAFE!(
                exec,
                "Failed to execute process '",
                actual_cmd,
                "': Too many open files."
            );
        }
        libc::ENAMETOOLONG => {
            FLOG_SAFE!(
                exec,
                "Failed to execute process '",
                actual_cmd,
                "': Name is too long."
            );
        }
        libc::EPERM => {
            FLOG_SAFE!(
                exec,
                "Failed to execute process '",
                actual_cmd,
                "': No permission. \
                Either suid/sgid is forbidden or you lack capabilities."
            );
        }
        err => {
            FLOG_SAFE!(
                exec,
                "Failed to execute process '",
                actual_cmd,
                "', unknown error number ",
                err,
            );
        }
    }
}

/// The exit status of a child that failed before or at exec.
pub fn exit_code_from_exec_error(err: i32) -> i32 {
    match err {
        libc::ENOENT | libc::ENOTDIR => STATUS_CMD_UNKNOWN,
        libc::EACCES | libc::ENOEXEC => STATUS_NOT_EXECUTABLE,
        _ => STATUS_CMD_UNKNOWN,
    }
}

/// Leave the forked child immediately, without running atexit handlers or flushing stdio
/// buffers inherited from the parent.
pub fn exit_without_destructors(code: libc::c_int) -> ! {
    unsafe { libc::_exit(code) };
}
