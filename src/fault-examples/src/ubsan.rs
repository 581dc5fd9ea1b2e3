// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A misaligned `c_int` load.
//!
//! Platform sensitive: x86 and most aarch64 configurations load unaligned
//! integers without complaint, so the raw fault is silent there. Rust debug
//! builds check alignment on every raw pointer dereference and abort with
//! "misaligned pointer dereference"; UBSan's `-fsanitize=alignment` reports
//! the same load in C.

use libc::c_int;

use crate::buffer::RawBuffer;

pub const ELEMENTS: usize = 10;

/// A pointer one byte past the start of `buffer`, typed as `c_int`.
pub fn misaligned(buffer: &RawBuffer) -> *const c_int {
    buffer.byte_offset(1)
}

/// Reads the first element of a zeroed buffer twice: once aligned, once
/// through a pointer one byte off.
///
/// # Safety
///
/// Never safe: the second load violates `c_int` alignment.
pub unsafe fn dereferencing_misaligned_pointer() -> (c_int, c_int) {
    let array = RawBuffer::zeroed(ELEMENTS);

    let aligned = unsafe { *array.as_ptr() };

    let mis_array = misaligned(&array);
    log::debug!("aligned {:p}, misaligned {mis_array:p}", array.as_ptr());
    let misaligned_value = unsafe { *mis_array };

    (aligned, misaligned_value)
}
