// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! ThreadSanitizer examples. Each spawns exactly one thread that writes a
//! location the main thread also touches, with nothing ordering the two.

use std::collections::BTreeMap;
use std::thread;

use libc::c_int;

pub type Map = BTreeMap<String, String>;

/// A raw pointer smuggled across a thread boundary.
struct Shared<T>(*mut T);

// The whole point is that nothing makes this sound.
unsafe impl<T> Send for Shared<T> {}

impl<T> Shared<T> {
    // Closures must capture the wrapper, not the raw pointer field.
    fn get(&self) -> *mut T {
        self.0
    }
}

#[inline(never)]
fn threadfunc(p: Shared<c_int>) {
    unsafe { *p.get() = 1 };
}

/// Reads an `int` while a second thread writes it.
///
/// # Safety
///
/// Never safe: the read races with the write.
pub unsafe fn data_race() -> c_int {
    let mut val: c_int = 0;
    let p: *mut c_int = &mut val;
    log::debug!("shared int at {p:p}");

    let shared = Shared(p);
    let t = thread::spawn(move || threadfunc(shared));

    let foo = unsafe { *p };

    let _ = t.join();
    foo
}

#[inline(never)]
fn insert_foo(m: Shared<Map>) {
    let m = unsafe { &mut *m.get() };
    m.insert("foo".to_string(), "bar".to_string());
}

/// Looks up (inserting a default) `"foo"` in a map while a second thread
/// inserts into it.
///
/// # Safety
///
/// Never safe: both threads mutate the map, and the tree may be observed
/// mid-rebalance.
pub unsafe fn data_race_map() -> String {
    let mut m = Map::new();
    let p: *mut Map = &mut m;
    log::debug!("shared map at {p:p}");

    let shared = Shared(p);
    let t = thread::spawn(move || insert_foo(shared));

    let foo = unsafe { (*p).entry("foo".to_string()).or_default().clone() };

    let _ = t.join();
    foo
}
