//! Signal names, and the process-wide guard that keeps pipe writes from killing the caller.
//!
//! While any pipeline is running, SIGPIPE is ignored so that a write to a pipe whose reader has
//! exited fails with EPIPE instead of terminating us. Pipelines can additionally ask for SIGINT
//! and SIGQUIT to be ignored, so that ^C reaches only the children. Dispositions are
//! reference counted: the first guard installs SIG_IGN, the last one restores what was there
//! before.

use errno::Errno;
use std::fmt;
use std::num::NonZeroI32;
use std::sync::{Mutex, PoisonError};

/// Struct describing an entry for the lookup table used to convert between signal names and signal
/// ids, etc.
struct LookupEntry {
    signal: Signal,
    name: &'static str,
    desc: &'static str,
}

impl LookupEntry {
    const fn new(signal: i32, name: &'static str, desc: &'static str) -> Self {
        Self {
            signal: Signal::new(signal),
            name,
            desc,
        }
    }
}

// Lookup table used to convert between signal names and signal ids, etc.
#[rustfmt::skip]
const SIGNAL_TABLE : &[LookupEntry] = &[
    LookupEntry::new(libc::SIGHUP,    "SIGHUP", "Terminal hung up"),
    LookupEntry::new(libc::SIGINT,    "SIGINT", "Quit request from job control (^C)"),
    LookupEntry::new(libc::SIGQUIT,   "SIGQUIT", "Quit request from job control with core dump (^\\)"),
    LookupEntry::new(libc::SIGILL,    "SIGILL", "Illegal instruction"),
    LookupEntry::new(libc::SIGTRAP,   "SIGTRAP", "Trace or breakpoint trap"),
    LookupEntry::new(libc::SIGABRT,   "SIGABRT", "Abort"),
    LookupEntry::new(libc::SIGBUS,    "SIGBUS", "Misaligned address error"),
    LookupEntry::new(libc::SIGFPE,    "SIGFPE", "Floating point exception"),
    LookupEntry::new(libc::SIGKILL,   "SIGKILL", "Forced quit"),
    LookupEntry::new(libc::SIGUSR1,   "SIGUSR1", "User defined signal 1"),
    LookupEntry::new(libc::SIGUSR2,   "SIGUSR2", "User defined signal 2"),
    LookupEntry::new(libc::SIGSEGV,   "SIGSEGV", "Address boundary error"),
    LookupEntry::new(libc::SIGPIPE,   "SIGPIPE", "Broken pipe"),
    LookupEntry::new(libc::SIGALRM,   "SIGALRM", "Timer expired"),
    LookupEntry::new(libc::SIGTERM,   "SIGTERM", "Polite quit request"),
    LookupEntry::new(libc::SIGCHLD,   "SIGCHLD", "Child process status changed"),
    LookupEntry::new(libc::SIGCONT,   "SIGCONT", "Continue previously stopped process"),
    LookupEntry::new(libc::SIGSTOP,   "SIGSTOP", "Forced stop"),
    LookupEntry::new(libc::SIGTSTP,   "SIGTSTP", "Stop request from job control (^Z)"),
    LookupEntry::new(libc::SIGTTIN,   "SIGTTIN", "Stop from terminal input"),
    LookupEntry::new(libc::SIGTTOU,   "SIGTTOU", "Stop from terminal output"),
    LookupEntry::new(libc::SIGURG,    "SIGURG", "Urgent socket condition"),
    LookupEntry::new(libc::SIGXCPU,   "SIGXCPU", "CPU time limit exceeded"),
    LookupEntry::new(libc::SIGXFSZ,   "SIGXFSZ", "File size limit exceeded"),
    LookupEntry::new(libc::SIGVTALRM, "SIGVTALRM", "Virtual timer expired"),
    LookupEntry::new(libc::SIGPROF,   "SIGPROF", "Profiling timer expired"),
    LookupEntry::new(libc::SIGWINCH,  "SIGWINCH", "Window size change"),
    LookupEntry::new(libc::SIGIO,     "SIGIO", "I/O on asynchronous file descriptor is possible"),
    LookupEntry::new(libc::SIGSYS,    "SIGSYS", "Bad system call"),

    #[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd", target_os = "dragonfly"))]
    LookupEntry::new(libc::SIGEMT,    "SIGEMT", "Unused signal"),

    #[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd", target_os = "dragonfly"))]
    LookupEntry::new(libc::SIGINFO,   "SIGINFO", "Information request"),

    #[cfg(target_os = "linux")]
    LookupEntry::new(libc::SIGSTKFLT, "SIGSTKFLT", "Stack fault"),

    #[cfg(target_os = "linux")]
    LookupEntry::new(libc::SIGPWR,    "SIGPWR", "Power failure"),
];

#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord, Hash)]
/// A wrapper around the system signal code.
pub struct Signal(NonZeroI32);

impl Signal {
    pub const SIGPIPE: Signal = Signal::new(libc::SIGPIPE);
    pub const SIGINT: Signal = Signal::new(libc::SIGINT);
    pub const SIGQUIT: Signal = Signal::new(libc::SIGQUIT);
    pub const SIGTERM: Signal = Signal::new(libc::SIGTERM);
    pub const SIGKILL: Signal = Signal::new(libc::SIGKILL);

    /// Creates a new `Signal` to represent the passed system signal code `sig`.
    /// Panics if `sig` is zero.
    pub const fn new(sig: i32) -> Self {
        match NonZeroI32::new(sig) {
            None => panic!("Invalid zero signal value!"),
            Some(result) => Signal(result),
        }
    }

    /// Return the LookupEntry for ourself.
    fn get_lookup_entry(&self) -> Option<&'static LookupEntry> {
        SIGNAL_TABLE
            .iter()
            .find(|entry| entry.signal == self.code())
    }

    /// Get the name of a signal, like "SIGPIPE".
    pub fn name(&self) -> &'static str {
        match self.get_lookup_entry() {
            Some(entry) => entry.name,
            None => "Unknown",
        }
    }

    /// Returns a description of the specified signal.
    pub fn desc(&self) -> &'static str {
        match self.get_lookup_entry() {
            Some(entry) => entry.desc,
            None => "Unknown",
        }
    }

    pub fn code(&self) -> i32 {
        self.0.into()
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get_lookup_entry() {
            Some(entry) => f.write_str(entry.name),
            None => write!(f, "signal {}", self.code()),
        }
    }
}

// Allow signals to be compared against i32.
impl PartialEq<i32> for Signal {
    fn eq(&self, other: &i32) -> bool {
        self.code() == *other
    }
}

impl From<Signal> for i32 {
    fn from(value: Signal) -> Self {
        value.code()
    }
}

/// Wrapper around sigaction that reports failure as an Errno.
fn sigaction(
    sig: Signal,
    act: &libc::sigaction,
    oact: Option<&mut libc::sigaction>,
) -> Result<(), Errno> {
    let oact = match oact {
        Some(oact) => oact as *mut libc::sigaction,
        None => std::ptr::null_mut(),
    };
    if unsafe { libc::sigaction(sig.code(), act, oact) } == 0 {
        Ok(())
    } else {
        Err(errno::errno())
    }
}

fn simple_action(handler: libc::sighandler_t) -> libc::sigaction {
    let mut act: libc::sigaction = unsafe { std::mem::zeroed() };
    unsafe { libc::sigemptyset(&mut act.sa_mask) };
    act.sa_flags = 0;
    act.sa_sigaction = handler;
    act
}

/// Return the handler currently installed for `sig` (SIG_DFL, SIG_IGN, or a function address).
pub fn signal_disposition(sig: Signal) -> Result<libc::sighandler_t, Errno> {
    let mut oact: libc::sigaction = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::sigaction(sig.code(), std::ptr::null(), &mut oact) };
    if ret == 0 {
        Ok(oact.sa_sigaction)
    } else {
        Err(errno::errno())
    }
}

/// One managed signal: how many guards hold it, and what to put back when the last one goes.
struct Slot {
    signal: Signal,
    count: usize,
    saved: libc::sigaction,
}

static SLOTS: Mutex<Vec<Slot>> = Mutex::new(Vec::new());

/// A disposition to reinstate in a forked child before exec, so that programs start with the
/// dispositions our caller had rather than the ones a guard installed.
#[derive(Clone, Copy)]
pub struct SavedDisposition {
    signal: Signal,
    action: libc::sigaction,
}

impl SavedDisposition {
    /// The default action for `signal`.
    pub fn default_for(signal: Signal) -> Self {
        SavedDisposition {
            signal,
            action: simple_action(libc::SIG_DFL),
        }
    }

    /// Reinstall this disposition. Async-signal safe. Returns 0 or the errno value.
    pub fn restore(&self) -> i32 {
        if unsafe { libc::sigaction(self.signal.code(), &self.action, std::ptr::null_mut()) } == 0
        {
            0
        } else {
            errno::errno().0
        }
    }

    pub fn signal(&self) -> Signal {
        self.signal
    }

    /// Whether the saved disposition was "ignore".
    pub fn was_ignored(&self) -> bool {
        self.action.sa_sigaction == libc::SIG_IGN
    }
}

/// Holds one reference on "ignore `signal`". Dropping it releases the reference.
pub struct DispositionGuard {
    prior: SavedDisposition,
}

impl DispositionGuard {
    /// Take a reference on ignoring `signal`, installing SIG_IGN if nobody else holds one.
    pub fn ignore(signal: Signal) -> Result<Self, Errno> {
        let mut slots = SLOTS.lock().unwrap_or_else(PoisonError::into_inner);
        let idx = match slots.iter().position(|slot| slot.signal == signal) {
            Some(idx) => idx,
            None => {
                slots.push(Slot {
                    signal,
                    count: 0,
                    saved: unsafe { std::mem::zeroed() },
                });
                slots.len() - 1
            }
        };
        let slot = &mut slots[idx];
        if slot.count == 0 {
            let mut saved: libc::sigaction = unsafe { std::mem::zeroed() };
            sigaction(signal, &simple_action(libc::SIG_IGN), Some(&mut saved)).map_err(|err| {
                FLOG!(warning, "Could not ignore", signal, ":", err);
                err
            })?;
            slot.saved = saved;
            FLOG!(signal_guard, "Ignoring", signal);
        }
        slot.count += 1;
        Ok(DispositionGuard {
            prior: SavedDisposition {
                signal,
                action: slot.saved,
            },
        })
    }

    pub fn signal(&self) -> Signal {
        self.prior.signal
    }

    /// The disposition that was in place before the first guard on this signal.
    pub fn prior(&self) -> SavedDisposition {
        self.prior
    }
}

impl Drop for DispositionGuard {
    fn drop(&mut self) {
        let signal = self.prior.signal;
        let mut slots = SLOTS.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(slot) = slots.iter_mut().find(|slot| slot.signal == signal) else {
            return;
        };
        slot.count -= 1;
        if slot.count == 0 {
            match sigaction(signal, &slot.saved, None) {
                Ok(()) => FLOG!(signal_guard, "Restored disposition of", signal),
                Err(err) => FLOG!(warning, "Could not restore", signal, ":", err),
            }
        }
    }
}

impl fmt::Debug for DispositionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispositionGuard")
            .field("signal", &self.prior.signal)
            .finish()
    }
}

/// The number of live guards on `signal`.
pub fn active_guards(signal: Signal) -> usize {
    let slots = SLOTS.lock().unwrap_or_else(PoisonError::into_inner);
    slots
        .iter()
        .find(|slot| slot.signal == signal)
        .map_or(0, |slot| slot.count)
}

/// The guards a pipeline holds while running.
pub(crate) fn acquire_guards(ignore_interrupts: bool) -> Result<Vec<DispositionGuard>, Errno> {
    let mut signals = vec![Signal::SIGPIPE];
    if ignore_interrupts {
        signals.extend([Signal::SIGINT, Signal::SIGQUIT]);
    }
    // Guards acquired before a failure are released as the Vec drops.
    signals.into_iter().map(DispositionGuard::ignore).collect()
}

/// What a pipeline's stages get before exec. SIGPIPE is always reset to its default, even if this
/// process ignored it before any guard (the Rust runtime does), so a writer whose reader has gone
/// away dies quietly the way it would under a shell. The others get their prior dispositions.
pub(crate) fn child_dispositions(guards: &[DispositionGuard]) -> Vec<SavedDisposition> {
    guards
        .iter()
        .map(|guard| {
            if guard.signal() == Signal::SIGPIPE {
                SavedDisposition::default_for(Signal::SIGPIPE)
            } else {
                guard.prior()
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{
        acquire_guards, active_guards, child_dispositions, signal_disposition, DispositionGuard,
        Signal,
    };
    use crate::tests::prelude::*;

    #[test]
    fn test_signal_name() {
        let sig = Signal::new(libc::SIGINT);
        assert_eq!(sig.name(), "SIGINT");
        assert_eq!(sig.to_string(), "SIGINT");
        assert_eq!(Signal::SIGPIPE.desc(), "Broken pipe");
        assert_eq!(Signal::new(1000).name(), "Unknown");
        assert_eq!(Signal::new(1000).to_string(), "signal 1000");
    }

    #[test]
    #[serial]
    fn test_guards_nest_and_restore() {
        test_init();
        let sig = Signal::new(libc::SIGUSR2);
        assert_eq!(signal_disposition(sig).unwrap(), libc::SIG_DFL);
        assert_eq!(active_guards(sig), 0);

        let outer = DispositionGuard::ignore(sig).unwrap();
        assert_eq!(signal_disposition(sig).unwrap(), libc::SIG_IGN);
        assert!(!outer.prior().was_ignored());

        let inner = DispositionGuard::ignore(sig).unwrap();
        assert_eq!(active_guards(sig), 2);
        assert!(!inner.prior().was_ignored());

        drop(outer);
        assert_eq!(active_guards(sig), 1);
        assert_eq!(signal_disposition(sig).unwrap(), libc::SIG_IGN);

        drop(inner);
        assert_eq!(active_guards(sig), 0);
        assert_eq!(signal_disposition(sig).unwrap(), libc::SIG_DFL);
    }

    #[test]
    #[serial]
    fn test_guard_restores_existing_ignore() {
        test_init();
        let sig = Signal::new(libc::SIGUSR1);
        unsafe { libc::signal(sig.code(), libc::SIG_IGN) };

        let outer = DispositionGuard::ignore(sig).unwrap();
        assert!(outer.prior().was_ignored());
        {
            let inner = DispositionGuard::ignore(sig).unwrap();
            assert_eq!(inner.signal(), sig);
            assert!(inner.prior().was_ignored());
        }
        assert_eq!(active_guards(sig), 1);
        drop(outer);
        assert_eq!(active_guards(sig), 0);
        // The last guard puts back "ignored", not the default.
        assert_eq!(signal_disposition(sig).unwrap(), libc::SIG_IGN);

        unsafe { libc::signal(sig.code(), libc::SIG_DFL) };
        assert_eq!(signal_disposition(sig).unwrap(), libc::SIG_DFL);
    }

    #[test]
    #[serial]
    fn test_children_get_default_sigpipe() {
        test_init();
        let guards = acquire_guards(true).unwrap();
        let dispositions = child_dispositions(&guards);
        let signals: Vec<Signal> = dispositions.iter().map(|d| d.signal()).collect();
        assert_eq!(signals, [Signal::SIGPIPE, Signal::SIGINT, Signal::SIGQUIT]);
        assert!(!dispositions[0].was_ignored());
        assert_eq!(dispositions[1].was_ignored(), guards[1].prior().was_ignored());
        drop(guards);
        assert_eq!(active_guards(Signal::SIGPIPE), 0);
    }
}
