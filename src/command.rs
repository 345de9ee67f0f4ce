//! One program to run as a pipeline stage.

use crate::fork_exec::DEFAULT_PATH;
use crate::proc::Pid;
use crate::redirection::{Redirect, Stream};
use std::ffi::{CString, OsStr, OsString};
use std::fmt;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::Path;

/// A change to the environment a command inherits. Applied in order to a copy of our own
/// environment when the command is spawned.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum EnvOp {
    Set(OsString, OsString),
    Unset(OsString),
    /// Start from an empty environment.
    Clear,
}

/// A program, its arguments, and how it should be run.
///
/// Configure a command, then hand it to a [`Pipeline`](crate::Pipeline). Once the pipeline has
/// started, its commands can no longer be changed.
pub struct Command {
    program: String,
    args: Vec<String>,
    env: Vec<EnvOp>,
    stdin: Redirect,
    stdout: Redirect,
    stderr: Redirect,
    nice: i32,
    /// Set from spawn until the stage is reaped.
    pid: Option<Pid>,
}

impl Command {
    /// A command running `program` with no arguments. `program` is looked up in `PATH` unless it
    /// contains a slash.
    pub fn new(program: impl Into<String>) -> Self {
        Command {
            program: program.into(),
            args: vec![],
            env: vec![],
            stdin: Redirect::Inherit,
            stdout: Redirect::Inherit,
            stderr: Redirect::Inherit,
            nice: 0,
            pid: None,
        }
    }

    pub fn with_args<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd
    }

    pub fn arg(&mut self, arg: impl Into<String>) -> &mut Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set `name` to `value` in the child's environment.
    pub fn setenv(&mut self, name: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> &mut Self {
        self.env.push(EnvOp::Set(
            name.as_ref().to_owned(),
            value.as_ref().to_owned(),
        ));
        self
    }

    /// Remove `name` from the child's environment.
    pub fn unsetenv(&mut self, name: impl AsRef<OsStr>) -> &mut Self {
        self.env.push(EnvOp::Unset(name.as_ref().to_owned()));
        self
    }

    /// Drop everything set so far, including the inherited environment.
    pub fn clearenv(&mut self) -> &mut Self {
        self.env.push(EnvOp::Clear);
        self
    }

    pub fn set_redirection(&mut self, stream: Stream, target: Redirect) -> &mut Self {
        *self.redirection_mut(stream) = target;
        self
    }

    pub fn redirection(&self, stream: Stream) -> &Redirect {
        match stream {
            Stream::Stdin => &self.stdin,
            Stream::Stdout => &self.stdout,
            Stream::Stderr => &self.stderr,
        }
    }

    fn redirection_mut(&mut self, stream: Stream) -> &mut Redirect {
        match stream {
            Stream::Stdin => &mut self.stdin,
            Stream::Stdout => &mut self.stdout,
            Stream::Stderr => &mut self.stderr,
        }
    }

    /// Send stderr to /dev/null.
    pub fn discard_err(&mut self) -> &mut Self {
        self.set_redirection(Stream::Stderr, Redirect::Null)
    }

    /// Adjust the child's niceness by `inc` before exec.
    pub fn set_nice(&mut self, inc: i32) -> &mut Self {
        self.nice = inc;
        self
    }

    pub fn nice(&self) -> i32 {
        self.nice
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// The arguments after argv[0].
    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn env_ops(&self) -> &[EnvOp] {
        &self.env
    }

    /// What the program sees as argv[0]: the last component of the program name.
    pub fn argv0(&self) -> &str {
        match self.program.rfind('/') {
            Some(idx) if idx + 1 < self.program.len() => &self.program[idx + 1..],
            _ => &self.program,
        }
    }

    /// The process id, while the command is running or exited but not yet reaped.
    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    pub(crate) fn set_pid(&mut self, pid: Option<Pid>) {
        self.pid = pid;
    }

    /// Our environment with this command's changes applied.
    pub(crate) fn child_environment(&self) -> Vec<(OsString, OsString)> {
        let mut vars: Vec<(OsString, OsString)> = std::env::vars_os().collect();
        for op in &self.env {
            match op {
                EnvOp::Set(name, value) => match vars.iter_mut().find(|(k, _)| k == name) {
                    Some(entry) => entry.1 = value.clone(),
                    None => vars.push((name.clone(), value.clone())),
                },
                EnvOp::Unset(name) => vars.retain(|(k, _)| k != name),
                EnvOp::Clear => vars.clear(),
            }
        }
        vars
    }

    /// The paths to try exec'ing, in order. A program with a slash is used as is; otherwise each
    /// directory of the child's `PATH` is tried, an empty entry meaning the current directory.
    pub(crate) fn exec_candidates(&self, env: &[(OsString, OsString)]) -> Vec<OsString> {
        if self.program.contains('/') {
            return vec![OsString::from(&self.program)];
        }
        let path = env
            .iter()
            .find(|(k, _)| k == "PATH")
            .map_or(OsStr::new(DEFAULT_PATH), |(_, v)| v.as_os_str());
        path.as_bytes()
            .split(|&b| b == b':')
            .map(|dir| {
                let dir = if dir.is_empty() { b".".as_slice() } else { dir };
                Path::new(OsStr::from_bytes(dir))
                    .join(&self.program)
                    .into_os_string()
            })
            .collect()
    }

    /// argv as C strings. Fails if an argument contains a NUL byte.
    pub(crate) fn c_argv(&self) -> Option<Vec<CString>> {
        std::iter::once(self.argv0())
            .chain(self.args.iter().map(String::as_str))
            .map(|s| CString::new(s).ok())
            .collect()
    }
}

/// `NAME=value` strings for envp. Fails if anything contains a NUL byte.
pub(crate) fn c_envp(vars: Vec<(OsString, OsString)>) -> Option<Vec<CString>> {
    vars.into_iter()
        .map(|(k, v)| {
            let mut entry = k.into_vec();
            entry.push(b'=');
            entry.extend_from_slice(v.as_bytes());
            CString::new(entry).ok()
        })
        .collect()
}

pub(crate) fn c_paths(paths: Vec<OsString>) -> Option<Vec<CString>> {
    paths
        .into_iter()
        .map(|p| CString::new(p.into_vec()).ok())
        .collect()
}

/// Copies the configuration. The copy has never been spawned.
impl Clone for Command {
    fn clone(&self) -> Self {
        Command {
            program: self.program.clone(),
            args: self.args.clone(),
            env: self.env.clone(),
            stdin: self.stdin.clone(),
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
            nice: self.nice,
            pid: None,
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("env", &self.env)
            .field("pid", &self.pid)
            .finish()
    }
}

/// Whether `s` can be shown without quotes.
fn is_plain(s: &[u8]) -> bool {
    !s.is_empty()
        && s.iter().all(|&c| {
            c.is_ascii_alphanumeric() || b"@%+=:,./-_".contains(&c)
        })
}

/// Write `s` single-quoted if it needs quoting.
fn write_quoted(f: &mut fmt::Formatter<'_>, s: &[u8]) -> fmt::Result {
    let s = String::from_utf8_lossy(s);
    if is_plain(s.as_bytes()) {
        return f.write_str(&s);
    }
    f.write_str("'")?;
    for (i, piece) in s.split('\'').enumerate() {
        if i > 0 {
            f.write_str("'\\''")?;
        }
        f.write_str(piece)?;
    }
    f.write_str("'")
}

fn write_redirect(f: &mut fmt::Formatter<'_>, stream: Stream, target: &Redirect) -> fmt::Result {
    let (op, append_op) = match stream {
        Stream::Stdin => ("<", "<"),
        Stream::Stdout => (">", ">>"),
        Stream::Stderr => ("2>", "2>>"),
    };
    match target {
        Redirect::Inherit => Ok(()),
        Redirect::Null => write!(f, " {op}/dev/null"),
        Redirect::File(path) => {
            write!(f, " {op}")?;
            write_quoted(f, path.as_os_str().as_bytes())
        }
        Redirect::Append(path) => {
            write!(f, " {append_op}")?;
            write_quoted(f, path.as_os_str().as_bytes())
        }
        Redirect::Fd(fd) => write!(f, " {op}&{fd}"),
    }
}

/// Renders like a shell command line: `env` changes first, then the program and its arguments,
/// then any redirections.
impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let needs_env = self
            .env
            .iter()
            .any(|op| !matches!(op, EnvOp::Set(..)));
        if needs_env {
            f.write_str("env ")?;
        }
        for op in &self.env {
            match op {
                EnvOp::Set(name, value) => {
                    write_quoted(f, name.as_bytes())?;
                    f.write_str("=")?;
                    write_quoted(f, value.as_bytes())?;
                }
                EnvOp::Unset(name) => {
                    f.write_str("-u ")?;
                    write_quoted(f, name.as_bytes())?;
                }
                EnvOp::Clear => f.write_str("-i")?,
            }
            f.write_str(" ")?;
        }
        write_quoted(f, self.program.as_bytes())?;
        for arg in &self.args {
            f.write_str(" ")?;
            write_quoted(f, arg.as_bytes())?;
        }
        write_redirect(f, Stream::Stdin, &self.stdin)?;
        write_redirect(f, Stream::Stdout, &self.stdout)?;
        write_redirect(f, Stream::Stderr, &self.stderr)
    }
}

#[cfg(test)]
mod tests {
    use super::{c_envp, Command, EnvOp};
    use crate::proc::Pid;
    use crate::redirection::{Redirect, Stream};
    use crate::tests::prelude::*;
    use std::ffi::OsString;
    use std::path::PathBuf;

    fn env_of(pairs: &[(&str, &str)]) -> Vec<(OsString, OsString)> {
        pairs
            .iter()
            .map(|(k, v)| (OsString::from(k), OsString::from(v)))
            .collect()
    }

    #[test]
    fn test_argv() {
        let cmd = Command::with_args("/usr/bin/sed", ["-e", "s/foo/bar/"]);
        assert_eq!(cmd.program(), "/usr/bin/sed");
        assert_eq!(cmd.argv0(), "sed");
        let argv = cmd.c_argv().unwrap();
        let argv: Vec<_> = argv.iter().map(|s| s.to_str().unwrap()).collect();
        assert_eq!(argv, vec!["sed", "-e", "s/foo/bar/"]);

        let mut cmd = Command::new("echo");
        cmd.arg("nul\0byte");
        assert!(cmd.c_argv().is_none());
    }

    #[test]
    fn test_exec_candidates() {
        let cmd = Command::new("./script");
        assert_eq!(cmd.exec_candidates(&[]), vec![OsString::from("./script")]);

        let cmd = Command::new("ls");
        let env = env_of(&[("PATH", "/opt/bin::/usr/bin")]);
        assert_eq!(
            cmd.exec_candidates(&env),
            vec![
                OsString::from("/opt/bin/ls"),
                OsString::from("./ls"),
                OsString::from("/usr/bin/ls"),
            ]
        );

        // No PATH at all.
        assert_eq!(
            cmd.exec_candidates(&[]),
            vec![OsString::from("/bin/ls"), OsString::from("/usr/bin/ls")]
        );
    }

    #[test]
    #[serial]
    fn test_child_environment() {
        test_init();
        std::env::set_var("PIPELINE_TEST_AMBIENT", "ambient");
        std::env::remove_var("PIPELINE_TEST_NEW");

        let mut cmd = Command::new("env");
        cmd.setenv("PIPELINE_TEST_NEW", "1")
            .setenv("PIPELINE_TEST_NEW", "2")
            .unsetenv("PIPELINE_TEST_AMBIENT");
        let env = cmd.child_environment();
        let lookup = |name: &str| {
            env.iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.to_str().unwrap().to_owned())
        };
        assert_eq!(lookup("PIPELINE_TEST_NEW").as_deref(), Some("2"));
        assert_eq!(lookup("PIPELINE_TEST_AMBIENT"), None);
        // The ambient environment is untouched.
        assert_eq!(
            std::env::var("PIPELINE_TEST_AMBIENT").as_deref(),
            Ok("ambient")
        );
        assert!(std::env::var_os("PIPELINE_TEST_NEW").is_none());

        let mut cmd = Command::new("env");
        cmd.setenv("BEFORE", "x").clearenv().setenv("AFTER", "y");
        assert_eq!(cmd.child_environment(), env_of(&[("AFTER", "y")]));

        std::env::remove_var("PIPELINE_TEST_AMBIENT");
    }

    #[test]
    fn test_envp() {
        let envp = c_envp(env_of(&[("A", "1"), ("B", "x=y")])).unwrap();
        let envp: Vec<_> = envp.iter().map(|s| s.to_str().unwrap()).collect();
        assert_eq!(envp, vec!["A=1", "B=x=y"]);
    }

    #[test]
    fn test_display() {
        let mut cmd = Command::with_args("sed", ["-e", "s/foo/bar baz/"]);
        assert_eq!(cmd.to_string(), "sed -e 's/foo/bar baz/'");

        cmd.setenv("LANG", "C");
        assert_eq!(cmd.to_string(), "LANG=C sed -e 's/foo/bar baz/'");

        let mut cmd = Command::with_args("printf", ["it's", ""]);
        cmd.unsetenv("HOME").discard_err();
        assert_eq!(
            cmd.to_string(),
            "env -u HOME printf 'it'\\''s' '' 2>/dev/null"
        );

        let mut cmd = Command::new("cat");
        cmd.set_redirection(Stream::Stdin, Redirect::File(PathBuf::from("in.txt")))
            .set_redirection(Stream::Stdout, Redirect::Append(PathBuf::from("out.txt")));
        assert_eq!(cmd.to_string(), "cat <in.txt >>out.txt");
    }

    #[test]
    fn test_clone_drops_pid() {
        let mut cmd = Command::new("true");
        cmd.set_nice(5).setenv("X", "1");
        cmd.set_pid(Pid::new(4242));
        let copy = cmd.clone();
        assert_eq!(copy.pid(), None);
        assert_eq!(copy.nice(), 5);
        assert_eq!(copy.env_ops(), &[EnvOp::Set("X".into(), "1".into())]);
        assert_eq!(cmd.pid(), Pid::new(4242));
    }
}
