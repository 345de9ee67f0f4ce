//! Logging usable between fork() and exec(): no allocation, no locks, no formatting machinery.

use std::ffi::CStr;

/// Scratch space for rendering an integer; 20 digits plus a sign covers any i64 or u64.
pub type DigitBuffer = [u8; 24];

fn format_int(buf: &mut DigitBuffer, mut val: u64, neg: bool) -> &[u8] {
    let mut cursor = buf.len();
    loop {
        cursor -= 1;
        buf[cursor] = b'0' + (val % 10) as u8;
        val /= 10;
        if val == 0 {
            break;
        }
    }
    if neg {
        cursor -= 1;
        buf[cursor] = b'-';
    }
    &buf[cursor..]
}

/// Values FLOG_SAFE can print. Implementations must not panic or allocate.
pub trait SafeDisplay {
    fn safe_bytes<'a>(&'a self, buf: &'a mut DigitBuffer) -> &'a [u8];
}

impl SafeDisplay for &str {
    fn safe_bytes<'a>(&'a self, _buf: &'a mut DigitBuffer) -> &'a [u8] {
        self.as_bytes()
    }
}

impl SafeDisplay for &CStr {
    fn safe_bytes<'a>(&'a self, _buf: &'a mut DigitBuffer) -> &'a [u8] {
        self.to_bytes()
    }
}

impl SafeDisplay for i32 {
    fn safe_bytes<'a>(&'a self, buf: &'a mut DigitBuffer) -> &'a [u8] {
        format_int(buf, u64::from(self.unsigned_abs()), *self < 0)
    }
}

impl SafeDisplay for i64 {
    fn safe_bytes<'a>(&'a self, buf: &'a mut DigitBuffer) -> &'a [u8] {
        format_int(buf, self.unsigned_abs(), *self < 0)
    }
}

impl SafeDisplay for usize {
    fn safe_bytes<'a>(&'a self, buf: &'a mut DigitBuffer) -> &'a [u8] {
        format_int(buf, *self as u64, false)
    }
}

/// Write one piece of a message. Short writes and errors are ignored: there is nobody to tell.
pub fn write_safe(fd: i32, s: impl SafeDisplay) {
    if fd < 0 {
        return;
    }
    let mut buf: DigitBuffer = [0; 24];
    let bytes = s.safe_bytes(&mut buf);
    unsafe {
        let _ = libc::write(fd, bytes.as_ptr().cast(), bytes.len());
    }
}

/// Variant of FLOG for the forked child. Pieces are NOT space separated; put spaces in literals.
macro_rules! FLOG_SAFE {
    ($category:ident, $($elem:expr),+ $(,)*) => {
        if crate::flog::categories::$category
            .enabled
            .load(std::sync::atomic::Ordering::Relaxed)
        {
            #[allow(unused_imports)]
            use crate::fork_exec::flog_safe::{write_safe, SafeDisplay};
            let fd = crate::flog::get_flog_file_fd();
            write_safe(fd, crate::flog::categories::$category.name);
            write_safe(fd, ": ");
            $(
                write_safe(fd, $elem);
            )+
            write_safe(fd, "\n");
        }
    };
}

pub(crate) use FLOG_SAFE;
