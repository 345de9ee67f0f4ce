// A module concerned with the exec side of fork/exec: the async-signal safe code which happens
// in between fork and exec, and the report the child sends home when that fails.

pub mod flog_safe;
pub mod postfork;

// Bravely define _PATH_BSHELL. On practice it's /bin/sh everywhere, except on Android.
#[cfg(not(target_os = "android"))]
pub static PATH_BSHELL: &[u8] = b"/bin/sh\0";

#[cfg(target_os = "android")]
pub static PATH_BSHELL: &[u8] = b"/system/bin/sh\0";

/// Where `PATH` lookup starts from when the child environment has no `PATH` at all.
pub const DEFAULT_PATH: &str = "/bin:/usr/bin";

/// The step a child was performing when it gave up.
#[repr(i32)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChildPhase {
    /// Moving descriptors onto 0, 1 and 2.
    Redirect = 1,
    /// Reinstating signal dispositions.
    Signals = 2,
    /// execve itself.
    Exec = 3,
}

impl ChildPhase {
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            1 => Some(ChildPhase::Redirect),
            2 => Some(ChildPhase::Signals),
            3 => Some(ChildPhase::Exec),
            _ => None,
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            ChildPhase::Redirect => "redirect",
            ChildPhase::Signals => "signal setup",
            ChildPhase::Exec => "exec",
        }
    }
}

/// The report a failed child writes to its back-channel pipe: the phase, then the errno, each a
/// native-endian i32.
pub const CHILD_REPORT_LEN: usize = 8;

pub fn encode_child_report(phase: ChildPhase, err: i32) -> [u8; CHILD_REPORT_LEN] {
    let mut buf = [0u8; CHILD_REPORT_LEN];
    buf[..4].copy_from_slice(&(phase as i32).to_ne_bytes());
    buf[4..].copy_from_slice(&err.to_ne_bytes());
    buf
}

pub fn decode_child_report(buf: &[u8; CHILD_REPORT_LEN]) -> (Option<ChildPhase>, i32) {
    let mut phase = [0u8; 4];
    let mut err = [0u8; 4];
    phase.copy_from_slice(&buf[..4]);
    err.copy_from_slice(&buf[4..]);
    (
        ChildPhase::from_raw(i32::from_ne_bytes(phase)),
        i32::from_ne_bytes(err),
    )
}
