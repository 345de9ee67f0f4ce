use std::ffi::{c_char, CStr, CString};
use std::ptr;

/// A container which exposes a null-terminated array of pointers to strings that it owns, as
/// consumed by exec for argv and envp. Everything is allocated up front so the array can be used
/// after fork.
pub struct OwningNullTerminatedArray {
    // The pointers point into the heap buffers of these strings, which don't move when the Vec
    // does.
    strings: Box<[CString]>,
    pointers: Box<[*const c_char]>,
}

impl OwningNullTerminatedArray {
    /// Construct, taking ownership of a list of strings.
    pub fn new(strs: Vec<CString>) -> Self {
        let strings = strs.into_boxed_slice();
        let mut pointers = Vec::with_capacity(strings.len() + 1);
        pointers.extend(strings.iter().map(|s| s.as_ptr()));
        pointers.push(ptr::null());
        OwningNullTerminatedArray {
            strings,
            pointers: pointers.into_boxed_slice(),
        }
    }

    /// Return the list of pointers, appropriate for envp or argv.
    pub fn get(&self) -> *const *const c_char {
        self.pointers.as_ptr()
    }

    /// The pointers without the terminator.
    pub fn as_ptr_slice(&self) -> &[*const c_char] {
        &self.pointers[..self.strings.len()]
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CStr> {
        self.strings.iter().map(|s| s.as_c_str())
    }
}

/// Safety: the pointers only ever refer to our own immutable strings.
unsafe impl Send for OwningNullTerminatedArray {}
unsafe impl Sync for OwningNullTerminatedArray {}
