use crate::command::Command;
use crate::error::Error;
use crate::exec::fork_count;
use crate::pipeline::{Pipeline, PipelineState, StageState};
use crate::proc::ProcStatus;
use crate::redirection::{Redirect, Stream, Want};
use crate::signal::{active_guards, signal_disposition, Signal};
use crate::tests::prelude::*;
use std::io::{ErrorKind, Read, Write};
use std::path::PathBuf;

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("pipeline-test-{}-{}", std::process::id(), name))
}

#[test]
#[serial]
fn test_missing_program_fails_start() {
    test_init();
    let mut p = Pipeline::new();
    p.append(Command::with_args("echo", ["foo"])).unwrap();
    p.append(Command::new("pipeline-test-no-such-program"))
        .unwrap();
    p.set_want_out(Want::Capture).unwrap();
    match p.start() {
        Err(Error::Spawn { program, errno }) => {
            assert_eq!(program, "pipeline-test-no-such-program");
            assert_eq!(errno.0, libc::ENOENT);
        }
        other => panic!("unexpected result {:?}", other),
    }
    // The first stage was killed and reaped, and nothing is left to wait for.
    assert_eq!(p.state(), PipelineState::Finished);
    assert!(matches!(p.stage_state(0), Some(StageState::Reaped(_))));
    assert_eq!(p.stage_state(1), Some(StageState::Pending));
    assert!(matches!(p.wait(), Err(Error::State(_))));
    assert!(matches!(p.read_line(), Err(Error::State(_))));
    assert_eq!(active_guards(Signal::SIGPIPE), 0);
}

#[test]
#[serial]
fn test_zero_stages() {
    test_init();
    let mut p = Pipeline::new();
    assert_eq!(p.run().unwrap(), ProcStatus::Exited(0));

    let mut p = Pipeline::new();
    p.set_want_out(Want::Capture).unwrap();
    p.start().unwrap();
    assert_eq!(p.read_line().unwrap(), None);
    assert!(p.wait_all().unwrap().is_empty());
}

#[test]
#[serial]
fn test_lifecycle_errors() {
    test_init();
    let mut p = Pipeline::from(Command::new("true"));
    p.start().unwrap();
    assert_eq!(p.state(), PipelineState::Running);
    assert!(matches!(p.start(), Err(Error::State(_))));
    assert!(matches!(
        p.append(Command::new("cat")),
        Err(Error::Config(_))
    ));
    assert!(matches!(p.set_want_out(Want::Capture), Err(Error::Config(_))));
    assert!(matches!(p.command_mut(0), Err(Error::Config(_))));
    assert!(matches!(p.read_line(), Err(Error::State(_))));
    assert!(matches!(p.input(), Err(Error::State(_))));
    assert!(p.wait().unwrap().is_success());
    assert_eq!(p.state(), PipelineState::Finished);
    assert!(matches!(p.wait(), Err(Error::State(_))));
    assert!(matches!(p.kill(Signal::SIGTERM), Err(Error::State(_))));
}

#[test]
#[serial]
fn test_kill() {
    test_init();
    let mut p = Pipeline::from(Command::with_args("sleep", ["10"]));
    p.start().unwrap();
    assert!(matches!(p.stage_state(0), Some(StageState::Running(_))));
    p.kill(Signal::SIGTERM).unwrap();
    let status = p.wait().unwrap();
    assert_eq!(status, ProcStatus::Signaled(Signal::SIGTERM));
    assert_eq!(status.status_value(), 128 + libc::SIGTERM);
    assert_eq!(
        p.stage_state(0),
        Some(StageState::Reaped(ProcStatus::Signaled(Signal::SIGTERM)))
    );
}

#[test]
#[serial]
fn test_input_and_output_captured() {
    test_init();
    let mut p = Pipeline::from(Command::new("cat"));
    p.set_want_in(Want::Capture).unwrap();
    p.set_want_out(Want::Capture).unwrap();
    p.start().unwrap();
    p.input().unwrap().write_all(b"hello\nworld\n").unwrap();
    p.close_input();
    assert!(matches!(p.input(), Err(Error::State(_))));
    assert_eq!(p.read_line().unwrap().as_deref(), Some(b"hello\n".as_slice()));
    assert_eq!(p.read(3).unwrap(), b"wor".to_vec());
    assert_eq!(p.peek(10).unwrap(), b"ld\n".as_slice());
    assert_eq!(p.peek_size().unwrap(), 3);
    assert_eq!(p.peek_skip(2).unwrap(), 2);
    assert_eq!(p.read_line().unwrap().as_deref(), Some(b"\n".as_slice()));
    assert_eq!(p.read_line().unwrap(), None);
    assert!(p.wait().unwrap().is_success());
}

#[test]
#[serial]
fn test_writing_to_a_gone_stage_fails_with_epipe() {
    test_init();
    let mut p = Pipeline::from(Command::new("true"));
    p.set_want_in(Want::Capture).unwrap();
    p.start().unwrap();
    assert_eq!(active_guards(Signal::SIGPIPE), 1);

    let chunk = [b'x'; 4096];
    let mut broke = false;
    for _ in 0..10_000 {
        if let Err(err) = p.input().unwrap().write_all(&chunk) {
            assert_eq!(err.kind(), ErrorKind::BrokenPipe);
            broke = true;
            break;
        }
    }
    assert!(broke);
    assert!(p.wait().unwrap().is_success());
    assert_eq!(active_guards(Signal::SIGPIPE), 0);
}

#[test]
#[serial]
fn test_files_as_input_and_output() {
    test_init();
    let src = temp_path("in");
    let dst = temp_path("out");
    std::fs::write(&src, "b\na\nc\n").unwrap();
    let _ = std::fs::remove_file(&dst);

    let mut p = Pipeline::from(Command::new("sort"));
    p.set_want_in(Want::File(src.clone())).unwrap();
    p.set_want_out(Want::File(dst.clone())).unwrap();
    assert!(p.run().unwrap().is_success());
    assert_eq!(std::fs::read_to_string(&dst).unwrap(), "a\nb\nc\n");

    // Append adds to what is there.
    let mut echo = Command::with_args("echo", ["d"]);
    echo.set_redirection(Stream::Stdout, Redirect::Append(dst.clone()));
    let mut p = Pipeline::from(echo);
    assert!(p.run().unwrap().is_success());
    assert_eq!(std::fs::read_to_string(&dst).unwrap(), "a\nb\nc\nd\n");

    let _ = std::fs::remove_file(&src);
    let _ = std::fs::remove_file(&dst);
}

#[test]
#[serial]
fn test_missing_input_file() {
    test_init();
    let mut p = Pipeline::from(Command::new("cat"));
    p.set_want_in(Want::File(temp_path("does-not-exist")))
        .unwrap();
    let err = p.start().unwrap_err();
    assert!(matches!(err, Error::Resource { op: "open", .. }));
    assert_eq!(err.errno().map(|e| e.0), Some(libc::ENOENT));
    assert_eq!(p.state(), PipelineState::Finished);
}

#[test]
#[serial]
fn test_three_stages_and_all_statuses() {
    test_init();
    let forks = fork_count();
    let mut p = Pipeline::new();
    p.append(Command::with_args("printf", ["c\\nb\\na\\n"]))
        .unwrap();
    p.append(Command::new("sort")).unwrap();
    p.append(Command::with_args("sh", ["-c", "cat; exit 4"]))
        .unwrap();
    p.set_want_out(Want::Capture).unwrap();
    p.start().unwrap();
    assert_eq!(fork_count(), forks + 3);

    let mut out = vec![];
    while let Some(line) = p.read_line().unwrap() {
        out.extend(line);
    }
    assert_eq!(out, b"a\nb\nc\n");
    assert_eq!(
        p.wait_all().unwrap(),
        vec![
            ProcStatus::Exited(0),
            ProcStatus::Exited(0),
            ProcStatus::Exited(4)
        ]
    );
    assert_eq!(
        p.statuses(),
        &[
            Some(ProcStatus::Exited(0)),
            Some(ProcStatus::Exited(0)),
            Some(ProcStatus::Exited(4))
        ]
    );
}

#[test]
#[serial]
fn test_aggregate_ignores_earlier_failures() {
    test_init();
    let mut p = Pipeline::new();
    p.append(Command::new("false")).unwrap();
    p.append(Command::new("true")).unwrap();
    assert!(p.run().unwrap().is_success());
    assert_eq!(p.statuses()[0], Some(ProcStatus::Exited(1)));
}

#[test]
#[serial]
fn test_no_descriptors_leak() {
    test_init();
    let before = open_fd_count();
    for _ in 0..3 {
        let mut p = Pipeline::new();
        p.append(Command::with_args("echo", ["foo"])).unwrap();
        p.append(Command::new("cat")).unwrap();
        p.append(Command::new("cat")).unwrap();
        p.set_want_in(Want::Capture).unwrap();
        p.set_want_out(Want::Capture).unwrap();
        p.start().unwrap();
        p.close_input();
        assert_eq!(p.read_line().unwrap().as_deref(), Some(b"foo\n".as_slice()));
        p.wait().unwrap();
    }
    // A failed start must not leak either.
    let mut p = Pipeline::new();
    p.append(Command::new("cat")).unwrap();
    p.append(Command::new("pipeline-test-no-such-program"))
        .unwrap();
    p.set_want_out(Want::Capture).unwrap();
    assert!(p.start().is_err());
    assert_eq!(open_fd_count(), before);
}

#[test]
#[serial]
fn test_drop_waits() {
    test_init();
    let path = temp_path("dropped");
    let _ = std::fs::remove_file(&path);
    {
        let mut p = Pipeline::from(Command::with_args("sh", ["-c", "sleep 0.2; echo done"]));
        p.set_want_out(Want::File(path.clone())).unwrap();
        p.start().unwrap();
    }
    // The stage has been reaped, so its output is complete.
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "done\n");
    assert_eq!(active_guards(Signal::SIGPIPE), 0);
    let _ = std::fs::remove_file(&path);
}

#[test]
#[serial]
fn test_early_wait_kills_writer_with_sigpipe() {
    test_init();
    let mut p = Pipeline::from(Command::with_args("yes", ["spam"]));
    p.set_want_out(Want::Capture).unwrap();
    p.start().unwrap();
    assert_eq!(p.read_line().unwrap().as_deref(), Some(b"spam\n".as_slice()));
    assert_eq!(p.wait().unwrap(), ProcStatus::Signaled(Signal::SIGPIPE));
}

#[test]
#[serial]
fn test_try_wait() {
    test_init();
    let mut p = Pipeline::from(Command::with_args("sh", ["-c", "echo hi; exit 2"]));
    p.set_want_out(Want::Capture).unwrap();
    p.start().unwrap();
    let status = loop {
        if let Some(status) = p.try_wait().unwrap() {
            break status;
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
    };
    assert_eq!(status, ProcStatus::Exited(2));
    assert_eq!(p.state(), PipelineState::Finished);
    // Output written before exit is still there.
    assert_eq!(p.read_line().unwrap().as_deref(), Some(b"hi\n".as_slice()));
    assert!(matches!(p.try_wait(), Err(Error::State(_))));
}

#[test]
#[serial]
fn test_ignore_signals() {
    test_init();
    let before = signal_disposition(Signal::SIGINT).unwrap();
    let mut p = Pipeline::from(Command::with_args("sleep", ["10"]));
    p.set_ignore_signals(true).unwrap();
    p.start().unwrap();
    assert_eq!(signal_disposition(Signal::SIGINT).unwrap(), libc::SIG_IGN);
    assert_eq!(signal_disposition(Signal::SIGQUIT).unwrap(), libc::SIG_IGN);
    if before == libc::SIG_DFL {
        // The stage got our old disposition back, so SIGINT still reaches it.
        p.kill(Signal::SIGINT).unwrap();
        assert_eq!(p.wait().unwrap(), ProcStatus::Signaled(Signal::SIGINT));
    } else {
        p.kill(Signal::SIGKILL).unwrap();
        p.wait().unwrap();
    }
    assert_eq!(signal_disposition(Signal::SIGINT).unwrap(), before);
}

#[test]
#[serial]
fn test_command_redirection_wins() {
    test_init();
    let path = temp_path("stage-out");
    let _ = std::fs::remove_file(&path);
    let mut p = Pipeline::new();
    let mut echo = Command::with_args("echo", ["to file"]);
    echo.set_redirection(Stream::Stdout, Redirect::File(path.clone()));
    p.append(echo).unwrap();
    p.append(Command::with_args("echo", ["to pipe"])).unwrap();
    let mut cmd = Command::with_args("sh", ["-c", "echo oops >&2"]);
    cmd.discard_err();
    p.append(cmd).unwrap();
    p.set_want_out(Want::Capture).unwrap();
    p.start().unwrap();
    let mut rest = vec![];
    p.reader().unwrap().get_mut().read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());
    assert!(p.wait().unwrap().is_success());
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "to file\n");
    let _ = std::fs::remove_file(&path);
}

#[test]
#[serial]
fn test_output_fd() {
    test_init();
    let mut p = Pipeline::from(Command::with_args("echo", ["raw"]));
    assert!(matches!(p.output_fd(), Err(Error::State(_))));
    p.set_want_out(Want::Capture).unwrap();
    p.start().unwrap();
    let fd = p.output_fd().unwrap().try_clone_to_owned().unwrap();
    let mut out = String::new();
    std::fs::File::from(fd).read_to_string(&mut out).unwrap();
    assert_eq!(out, "raw\n");
    p.wait().unwrap();
}

#[test]
#[serial]
fn test_try_wait_failure_still_reaps_everything() {
    test_init();
    let mut p = Pipeline::new();
    p.append(Command::new("true")).unwrap();
    p.append(Command::with_args("sleep", ["1"])).unwrap();
    p.start().unwrap();

    // Someone else reaps the first stage behind our back.
    let first = p.command(0).unwrap().pid().unwrap();
    let mut status = 0;
    assert_eq!(
        unsafe { libc::waitpid(first.as_pid_t(), &mut status, 0) },
        first.as_pid_t()
    );

    match p.try_wait() {
        Err(Error::Wait { pid, errno }) => {
            assert_eq!(pid, first);
            assert_eq!(errno.0, libc::ECHILD);
        }
        other => panic!("unexpected result {:?}", other),
    }
    assert_eq!(p.state(), PipelineState::Finished);
    assert!(p.commands().iter().all(|cmd| cmd.pid().is_none()));
    assert_eq!(
        p.stage_state(1),
        Some(StageState::Reaped(ProcStatus::Exited(0)))
    );
    assert_eq!(active_guards(Signal::SIGPIPE), 0);
}

#[test]
#[serial]
fn test_concurrent_pipelines_share_the_sigpipe_guard() {
    test_init();
    let before = signal_disposition(Signal::SIGPIPE).unwrap();
    let mut first = Pipeline::from(Command::with_args("sleep", ["1"]));
    let mut second = Pipeline::from(Command::new("true"));
    first.start().unwrap();
    second.start().unwrap();
    assert_eq!(active_guards(Signal::SIGPIPE), 2);
    assert_eq!(signal_disposition(Signal::SIGPIPE).unwrap(), libc::SIG_IGN);

    assert!(second.wait().unwrap().is_success());
    // Still ignored: the first pipeline is running.
    assert_eq!(active_guards(Signal::SIGPIPE), 1);
    assert_eq!(signal_disposition(Signal::SIGPIPE).unwrap(), libc::SIG_IGN);

    assert!(first.wait().unwrap().is_success());
    assert_eq!(active_guards(Signal::SIGPIPE), 0);
    assert_eq!(signal_disposition(Signal::SIGPIPE).unwrap(), before);
}
