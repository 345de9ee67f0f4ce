//! A sequence of commands, each one's stdout feeding the next one's stdin.

use crate::command::Command;
use crate::config;
use crate::error::{Error, Result};
use crate::exec::{launch_process, StageIo};
use crate::fds::make_autoclose_pipes;
use crate::proc::{waitpid_blocking, waitpid_nohang, Pid, ProcStatus};
use crate::reader::LineReader;
use crate::redirection::{Stream, Want};
use crate::signal::{acquire_guards, child_dispositions, DispositionGuard, Signal};
use std::fmt;
use std::fs::File;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

/// Where a pipeline is in its life. It only moves forward.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PipelineState {
    Unstarted,
    Running,
    Finished,
}

/// Where one stage is in its life.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StageState {
    /// Not spawned (yet, or ever, if start failed first).
    Pending,
    /// Spawned and not yet reaped. It may have exited already.
    Running(Pid),
    Reaped(ProcStatus),
}

/// The status of a whole pipeline: that of its last stage, like a shell without `pipefail`.
/// A pipeline with no stages succeeds.
pub fn aggregate_status(statuses: &[ProcStatus]) -> ProcStatus {
    statuses.last().copied().unwrap_or_default()
}

/// A chain of processes connected by pipes.
///
/// Build it, [`start`](Pipeline::start) it, optionally feed its input or read its output, then
/// [`wait`](Pipeline::wait) for it. Dropping a pipeline that is still running waits for it.
///
/// Waiting closes the captured input and output, so read everything you want first. A stage still
/// writing to the closed output is then killed by SIGPIPE, which is not treated as unexpected.
pub struct Pipeline {
    commands: Vec<Command>,
    want_in: Want,
    want_out: Want,
    ignore_signals: bool,
    state: PipelineState,
    /// One entry per stage, set when the stage is reaped.
    statuses: Vec<Option<ProcStatus>>,
    /// Our end of the first stage's stdin, with want_in = Capture.
    input: Option<File>,
    /// Our end of the last stage's stdout, with want_out = Capture.
    reader: Option<LineReader<File>>,
    /// Held while running.
    guards: Vec<DispositionGuard>,
    /// The last signal sent through kill(), so deaths by it are expected.
    killed_with: Option<Signal>,
}

impl Pipeline {
    pub fn new() -> Self {
        Pipeline {
            commands: vec![],
            want_in: Want::Inherit,
            want_out: Want::Inherit,
            ignore_signals: false,
            state: PipelineState::Unstarted,
            statuses: vec![],
            input: None,
            reader: None,
            guards: vec![],
            killed_with: None,
        }
    }

    pub fn from_commands(commands: impl IntoIterator<Item = Command>) -> Self {
        let mut pipeline = Pipeline::new();
        pipeline.commands.extend(commands);
        pipeline
    }

    fn check_unstarted(&self, what: &'static str) -> Result<()> {
        match self.state {
            PipelineState::Unstarted => Ok(()),
            _ => Err(Error::Config(what)),
        }
    }

    /// Add a stage at the end. Returns its index.
    pub fn append(&mut self, command: Command) -> Result<usize> {
        self.check_unstarted("append")?;
        self.commands.push(command);
        Ok(self.commands.len() - 1)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn command(&self, idx: usize) -> Option<&Command> {
        self.commands.get(idx)
    }

    /// Change a stage before start.
    pub fn command_mut(&mut self, idx: usize) -> Result<&mut Command> {
        self.check_unstarted("command")?;
        self.commands
            .get_mut(idx)
            .ok_or(Error::State("no such stage"))
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Where the first stage reads from.
    pub fn set_want_in(&mut self, want: Want) -> Result<()> {
        self.check_unstarted("input")?;
        self.want_in = want;
        Ok(())
    }

    /// Where the last stage writes to.
    pub fn set_want_out(&mut self, want: Want) -> Result<()> {
        self.check_unstarted("output")?;
        self.want_out = want;
        Ok(())
    }

    pub fn want_in(&self) -> &Want {
        &self.want_in
    }

    pub fn want_out(&self) -> &Want {
        &self.want_out
    }

    /// Ignore SIGINT and SIGQUIT in this process while the pipeline runs, so that an interrupt
    /// from the terminal only reaches the stages. The stages themselves get the dispositions we
    /// had before.
    pub fn set_ignore_signals(&mut self, ignore: bool) -> Result<()> {
        self.check_unstarted("signals")?;
        self.ignore_signals = ignore;
        Ok(())
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Spawn every stage. On failure, every stage already spawned is killed and reaped, every
    /// descriptor is closed, and the pipeline is finished.
    pub fn start(&mut self) -> Result<()> {
        if self.state != PipelineState::Unstarted {
            return Err(Error::State("pipeline already started"));
        }
        config::init();
        FLOG!(exec_job_exec, "Starting pipeline:", self);

        // Nothing can be changed from here on, whether or not we succeed.
        self.state = PipelineState::Finished;
        self.statuses = vec![None; self.commands.len()];
        self.guards = acquire_guards(self.ignore_signals).map_err(|errno| Error::Resource {
            op: "sigaction",
            errno,
        })?;

        match self.launch_all() {
            Ok(()) => {
                self.state = PipelineState::Running;
                Ok(())
            }
            Err(err) => {
                FLOG!(exec_job_exec, "Aborting pipeline:", err);
                self.abort_launched();
                Err(err)
            }
        }
    }

    /// Open the overall input or output for `stream`. For Capture, the parent's end is stored
    /// and the child's end returned.
    fn open_want(&mut self, stream: Stream) -> Result<Option<OwnedFd>> {
        let want = match stream {
            Stream::Stdin => &self.want_in,
            _ => &self.want_out,
        };
        if let Some(redirect) = want.as_redirect() {
            return redirect
                .open(stream)
                .map_err(|err| Error::resource("open", err));
        }
        let pipes = make_autoclose_pipes().map_err(|err| Error::resource("pipe", err))?;
        match stream {
            Stream::Stdin => {
                self.input = Some(File::from(pipes.write));
                Ok(Some(pipes.read))
            }
            _ => {
                self.reader = Some(LineReader::new(File::from(pipes.read)));
                Ok(Some(pipes.write))
            }
        }
    }

    fn launch_all(&mut self) -> Result<()> {
        let dispositions = child_dispositions(&self.guards);

        // We hold at most three pipe ends at a time: the one the current stage reads from
        // (courtesy of the previous stage), the one it writes to, and the one the next stage
        // will read from. Anything still held when we bail out is closed on return.
        let mut pipe_next_read = self.open_want(Stream::Stdin)?;
        let mut last_out = self.open_want(Stream::Stdout)?;

        let count = self.commands.len();
        for i in 0..count {
            let mut io = StageIo {
                stdin: pipe_next_read.take(),
                ..Default::default()
            };
            if i + 1 < count {
                let pipes = make_autoclose_pipes().map_err(|err| Error::resource("pipe", err))?;
                pipe_next_read = Some(pipes.read);
                io.stdout = Some(pipes.write);
            } else {
                io.stdout = last_out.take();
            }
            // launch_process closes our copies of the child's ends.
            let pid = launch_process(&self.commands[i], io, &dispositions)?;
            FLOG!(exec_job_status, "Stage", i, "is pid", pid);
            self.commands[i].set_pid(Some(pid));
        }
        Ok(())
    }

    /// Kill and reap whatever a failed start spawned, and let go of everything else.
    fn abort_launched(&mut self) {
        self.input = None;
        self.reader = None;
        for i in 0..self.commands.len() {
            let Some(pid) = self.commands[i].pid() else {
                continue;
            };
            unsafe { libc::kill(pid.as_pid_t(), libc::SIGKILL) };
            match waitpid_blocking(pid) {
                Ok(status) => self.statuses[i] = Some(status),
                Err(err) => FLOG!(warning, "Could not reap aborted stage", pid, ":", err),
            }
            self.commands[i].set_pid(None);
        }
        self.guards.clear();
    }

    /// start() then wait().
    pub fn run(&mut self) -> Result<ProcStatus> {
        self.start()?;
        self.wait()
    }

    /// Wait for every stage and return the status of the last one.
    pub fn wait(&mut self) -> Result<ProcStatus> {
        let statuses = self.wait_all()?;
        Ok(aggregate_status(&statuses))
    }

    /// Wait for every stage and return all their statuses, in stage order.
    pub fn wait_all(&mut self) -> Result<Vec<ProcStatus>> {
        match self.state {
            PipelineState::Unstarted => return Err(Error::State("pipeline not started")),
            PipelineState::Finished => return Err(Error::State("pipeline already finished")),
            PipelineState::Running => (),
        }
        // Close our ends first: a stage may be waiting for EOF on its input, or for room in its
        // output.
        self.input = None;
        self.reader = None;

        let first_err = self.reap_blocking();
        self.finish();
        if let Some(err) = first_err {
            return Err(err);
        }
        Ok(self.statuses.iter().map(|s| s.unwrap_or_default()).collect())
    }

    /// Reap the stages that have already exited, without blocking. Returns the overall status
    /// once every stage has been reaped. Captured output stays readable afterwards.
    ///
    /// If reaping a stage fails, the others are waited for (blocking) before the error is
    /// returned, and the pipeline is finished.
    pub fn try_wait(&mut self) -> Result<Option<ProcStatus>> {
        match self.state {
            PipelineState::Unstarted => return Err(Error::State("pipeline not started")),
            PipelineState::Finished => return Err(Error::State("pipeline already finished")),
            PipelineState::Running => (),
        }
        for i in 0..self.commands.len() {
            let Some(pid) = self.commands[i].pid() else {
                continue;
            };
            match waitpid_nohang(pid) {
                Ok(Some(status)) => self.record(i, status),
                Ok(None) => (),
                Err(errno) => {
                    // Give up on non-blocking, but nothing may be left unreaped.
                    self.commands[i].set_pid(None);
                    self.input = None;
                    self.reader = None;
                    self.reap_blocking();
                    self.finish();
                    return Err(Error::Wait { pid, errno });
                }
            }
        }
        if self.commands.iter().any(|cmd| cmd.pid().is_some()) {
            return Ok(None);
        }
        // Nobody is left to read what we'd write.
        self.input = None;
        self.finish();
        let statuses: Vec<ProcStatus> = self.statuses.iter().map(|s| s.unwrap_or_default()).collect();
        Ok(Some(aggregate_status(&statuses)))
    }

    /// Block until every stage not yet reaped is. Returns the first waitpid failure; the stage
    /// it concerns is forgotten.
    fn reap_blocking(&mut self) -> Option<Error> {
        let mut first_err = None;
        for i in 0..self.commands.len() {
            let Some(pid) = self.commands[i].pid() else {
                continue;
            };
            match waitpid_blocking(pid) {
                Ok(status) => self.record(i, status),
                Err(errno) => {
                    self.commands[i].set_pid(None);
                    first_err.get_or_insert(Error::Wait { pid, errno });
                }
            }
        }
        first_err
    }

    fn record(&mut self, idx: usize, status: ProcStatus) {
        let cmd = &mut self.commands[idx];
        FLOG!(exec_job_status, "Stage", idx, "'", cmd.program(), "'", status);
        if let ProcStatus::Signaled(sig) = status {
            // Dying of SIGPIPE is how a stage learns its reader went away, and SIGINT came from
            // the terminal or the caller.
            let expected = sig == Signal::SIGPIPE
                || sig == Signal::SIGINT
                || Some(sig) == self.killed_with;
            if !expected {
                FLOG!(warning, cmd.program(), ":", sig.desc());
            }
        }
        cmd.set_pid(None);
        self.statuses[idx] = Some(status);
    }

    fn finish(&mut self) {
        self.guards.clear();
        self.state = PipelineState::Finished;
    }

    /// The statuses of reaped stages, in stage order.
    pub fn statuses(&self) -> &[Option<ProcStatus>] {
        &self.statuses
    }

    pub fn stage_state(&self, idx: usize) -> Option<StageState> {
        let cmd = self.commands.get(idx)?;
        if let Some(Some(status)) = self.statuses.get(idx) {
            return Some(StageState::Reaped(*status));
        }
        Some(match cmd.pid() {
            Some(pid) => StageState::Running(pid),
            None => StageState::Pending,
        })
    }

    /// Send `signal` to every stage not yet reaped.
    pub fn kill(&mut self, signal: Signal) -> Result<()> {
        if self.state != PipelineState::Running {
            return Err(Error::State("pipeline not running"));
        }
        self.killed_with = Some(signal);
        let mut result = Ok(());
        for cmd in &self.commands {
            let Some(pid) = cmd.pid() else {
                continue;
            };
            FLOG!(exec_job_status, "Sending", signal, "to", pid);
            if unsafe { libc::kill(pid.as_pid_t(), signal.code()) } < 0 && result.is_ok() {
                result = Err(Error::Resource {
                    op: "kill",
                    errno: errno::errno(),
                });
            }
        }
        result
    }

    /// Our end of the first stage's stdin. Dropping the pipeline's copy (close_input) sends EOF.
    pub fn input(&mut self) -> Result<&mut File> {
        if self.state == PipelineState::Unstarted {
            return Err(Error::State("pipeline not started"));
        }
        if self.want_in != Want::Capture {
            return Err(Error::State("input not captured"));
        }
        self.input
            .as_mut()
            .ok_or(Error::State("input already closed"))
    }

    /// Close our end of the first stage's stdin, so it sees end of file.
    pub fn close_input(&mut self) {
        if self.input.take().is_some() {
            FLOG!(pipe, "Closed pipeline input");
        }
    }

    /// The reader over the last stage's stdout.
    pub fn reader(&mut self) -> Result<&mut LineReader<File>> {
        if self.state == PipelineState::Unstarted {
            return Err(Error::State("pipeline not started"));
        }
        if self.want_out != Want::Capture {
            return Err(Error::State("output not captured"));
        }
        self.reader
            .as_mut()
            .ok_or(Error::State("output already closed"))
    }

    /// The descriptor the last stage's output arrives on. Anything already buffered by the
    /// reader will not be seen through it.
    pub fn output_fd(&mut self) -> Result<BorrowedFd<'_>> {
        Ok(self.reader()?.get_ref().as_fd())
    }

    pub fn read_line(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.reader()?.read_line()?)
    }

    pub fn peek_line(&mut self) -> Result<Option<&[u8]>> {
        Ok(self.reader()?.peek_line()?)
    }

    pub fn read(&mut self, n: usize) -> Result<Vec<u8>> {
        Ok(self.reader()?.read(n)?)
    }

    pub fn peek(&mut self, n: usize) -> Result<&[u8]> {
        Ok(self.reader()?.peek(n)?)
    }

    pub fn peek_size(&mut self) -> Result<usize> {
        Ok(self.reader()?.peek_size())
    }

    pub fn peek_skip(&mut self, n: usize) -> Result<usize> {
        Ok(self.reader()?.peek_skip(n))
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Pipeline::new()
    }
}

impl From<Command> for Pipeline {
    fn from(command: Command) -> Self {
        Pipeline::from_commands([command])
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, cmd) in self.commands.iter().enumerate() {
            if i > 0 {
                f.write_str(" | ")?;
            }
            write!(f, "{cmd}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("commands", &self.commands)
            .field("want_in", &self.want_in)
            .field("want_out", &self.want_out)
            .field("state", &self.state)
            .field("statuses", &self.statuses)
            .finish()
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if self.state == PipelineState::Running {
            FLOG!(exec_job_status, "Waiting for pipeline being dropped:", self);
            if let Err(err) = self.wait_all() {
                FLOG!(warning, "Error waiting for pipeline:", err);
            }
        }
    }
}
