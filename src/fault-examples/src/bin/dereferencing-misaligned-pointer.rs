// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use fault_examples::Example;

fn main() {
    env_logger::init();

    // arguments are accepted and ignored
    let line = unsafe { Example::DereferencingMisalignedPointer.run() };
    println!("{line}");
}
