// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! AddressSanitizer examples: a heap read past the end of its block, and two
//! stack addresses that outlive their storage.
//!
//! Each takes a `read` callback that receives the bad pointer. The examples
//! themselves only hand out the address; dereferencing it is the caller's
//! (unsafe) business, which lets tests inspect the address without touching
//! the memory.

use std::hint::black_box;
use std::ops::Range;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use libc::c_int;

use crate::buffer::RawBuffer;

/// Passes `read` a pointer one element past a block sized for exactly one
/// `c_int`. Returns the block's extent with the result of `read`.
pub fn out_of_bounds_heap<R>(read: impl FnOnce(*const c_int) -> R) -> (Range<usize>, R) {
    let array = RawBuffer::uninit(1);
    let past_end = array.element(1);
    log::debug!("block {:#x?}, reading {past_end:p}", array.extent());

    let value = read(past_end);
    (array.extent(), value)
}

// Outlives every frame that stores into it.
static ESCAPED: AtomicPtr<c_int> = AtomicPtr::new(ptr::null_mut());

#[inline(never)]
fn set_pointer_with_escaped_data() -> usize {
    let mut internal_array: [c_int; 1] = [0];
    let array = black_box(internal_array.as_mut_ptr());
    ESCAPED.store(array, Ordering::Relaxed);
    log::debug!("frame-local array at {array:p}");

    array as usize
}

/// Passes `read` the address of an array local to a frame that has already
/// returned. Returns the address the callee stored with the result of `read`.
pub fn use_after_return<R>(read: impl FnOnce(*const c_int) -> R) -> (usize, R) {
    let assigned = set_pointer_with_escaped_data();
    let array = ESCAPED.load(Ordering::Relaxed);

    (assigned, read(array))
}

/// Passes `read` the address of an array declared in an inner block that
/// has already ended. Returns the address taken inside the block with the
/// result of `read`.
pub fn use_after_scope<R>(read: impl FnOnce(*const c_int) -> R) -> (usize, R) {
    let array: *const c_int;
    let assigned: usize;
    {
        let internal_array: [c_int; 1] = [0];
        array = black_box(internal_array.as_ptr());
        assigned = array as usize;
    }
    log::debug!("block-local array at {array:p}");

    (assigned, read(array))
}
