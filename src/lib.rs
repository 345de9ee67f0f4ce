//! Run chains of programs connected by pipes, like a shell pipeline, from Rust.
//!
//! ```no_run
//! use pipeline::{Command, Pipeline, Want};
//!
//! let mut p = Pipeline::new();
//! p.append(Command::with_args("echo", ["foo"])).unwrap();
//! p.append(Command::with_args("sed", ["-e", "s/foo/bar/"])).unwrap();
//! p.set_want_out(Want::Capture).unwrap();
//! p.start().unwrap();
//! assert_eq!(p.read_line().unwrap().as_deref(), Some(b"bar\n".as_slice()));
//! assert!(p.wait().unwrap().is_success());
//! ```
//!
//! While any pipeline runs, SIGPIPE is ignored in this process, so writing to a stage that has
//! gone away fails with EPIPE instead of killing us. Every descriptor the crate creates is
//! close-on-exec, so concurrently started pipelines never hold each other's pipes open.
#![allow(non_camel_case_types)]
#![allow(non_upper_case_globals)]
#![allow(unknown_lints)]
#![allow(clippy::bool_assert_comparison)]
#![allow(clippy::comparison_chain)]
#![allow(clippy::derivable_impls)]
#![allow(clippy::new_without_default)]
#![allow(clippy::uninlined_format_args)]

#[macro_use]
pub mod flog;

pub mod command;
pub mod config;
pub mod error;
pub mod exec;
pub mod fds;
pub mod fork_exec;
pub mod null_terminated_array;
pub mod pipeline;
pub mod proc;
pub mod reader;
pub mod redirection;
pub mod signal;

#[cfg(test)]
mod tests;

pub use command::{Command, EnvOp};
pub use error::{Error, Result};
pub use pipeline::{aggregate_status, Pipeline, PipelineState, StageState};
pub use proc::{Pid, ProcStatus};
pub use reader::LineReader;
pub use redirection::{Redirect, Stream, Want};
pub use signal::{DispositionGuard, Signal};
