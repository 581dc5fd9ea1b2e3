// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A `malloc`'d run of `c_int`s, released with `free` on drop.
//!
//! Allocation goes through libc rather than the Rust allocator so the
//! sanitizer runtimes see the same `malloc`/`free` pair a C program would.

use std::mem;
use std::ops::Range;

use libc::{c_int, c_void};

pub struct RawBuffer {
    ptr: *mut c_int,
    len: usize,
}

impl RawBuffer {
    /// Room for exactly `len` elements, left uninitialized.
    pub fn uninit(len: usize) -> Self {
        let size = len * mem::size_of::<c_int>();
        let ptr = unsafe { libc::malloc(size) }.cast::<c_int>();
        log::debug!("malloc({size}) = {ptr:p}");

        Self { ptr, len }
    }

    pub fn zeroed(len: usize) -> Self {
        let buffer = Self::uninit(len);
        unsafe { libc::memset(buffer.ptr.cast::<c_void>(), 0, buffer.size()) };
        buffer
    }

    pub fn as_ptr(&self) -> *const c_int {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size of the block in bytes.
    pub fn size(&self) -> usize {
        self.len * mem::size_of::<c_int>()
    }

    /// Addresses granted by the allocator, `[start, end)`.
    pub fn extent(&self) -> Range<usize> {
        let start = self.ptr as usize;
        start..start + self.size()
    }

    /// Pointer to element `index`. Not bounds checked.
    pub fn element(&self, index: usize) -> *const c_int {
        self.ptr.wrapping_add(index)
    }

    /// Pointer `bytes` past the start, reinterpreted as a `c_int` pointer
    /// regardless of alignment.
    pub fn byte_offset(&self, bytes: usize) -> *const c_int {
        self.ptr.cast::<u8>().wrapping_add(bytes).cast::<c_int>()
    }
}

impl Drop for RawBuffer {
    fn drop(&mut self) {
        log::debug!("free({:p})", self.ptr);
        unsafe { libc::free(self.ptr.cast::<c_void>()) };
    }
}
