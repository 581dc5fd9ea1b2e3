// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Programs that each commit exactly one memory-safety or concurrency fault,
//! for exercising dynamic analysis tools.
//!
//! Every example goes through `unsafe` on purpose; safe Rust rejects all of
//! these patterns. Build each binary with its detector, for example:
//!
//! ```text
//! RUSTFLAGS=-Zsanitizer=address cargo +nightly run \
//!     --target x86_64-unknown-linux-gnu --bin use-after-scope
//! ```
//!
//! `use-after-return` also needs `ASAN_OPTIONS=detect_stack_use_after_return=1`.
//! The misaligned example needs no sanitizer in a debug build.

use std::fmt;
use std::str::FromStr;

use sanitizer_report::{Expected, FaultCategory};
use thiserror::Error;

pub mod asan;
pub mod buffer;
pub mod tsan;
pub mod ubsan;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Example {
    OutOfBoundsHeap,
    UseAfterReturn,
    UseAfterScope,
    DataRace,
    DataRaceMap,
    DereferencingMisalignedPointer,
}

#[derive(Debug, Error)]
#[error("unknown example: {0}")]
pub struct UnknownExample(String);

impl Example {
    pub fn all() -> &'static [Example] {
        &[
            Self::OutOfBoundsHeap,
            Self::UseAfterReturn,
            Self::UseAfterScope,
            Self::DataRace,
            Self::DataRaceMap,
            Self::DereferencingMisalignedPointer,
        ]
    }

    /// Name of the binary that runs this example.
    pub fn name(&self) -> &'static str {
        match self {
            Self::OutOfBoundsHeap => "out-of-bounds-heap",
            Self::UseAfterReturn => "use-after-return",
            Self::UseAfterScope => "use-after-scope",
            Self::DataRace => "data-race",
            Self::DataRaceMap => "data-race-map",
            Self::DereferencingMisalignedPointer => "dereferencing-misaligned-pointer",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::OutOfBoundsHeap => "reads one element past a single-element heap block",
            Self::UseAfterReturn => "reads a frame-local array after its frame returned",
            Self::UseAfterScope => "reads a block-local array after its block ended",
            Self::DataRace => "reads an int while another thread writes it",
            Self::DataRaceMap => "reads a map while another thread inserts into it",
            Self::DereferencingMisalignedPointer => "loads an int from an odd address",
        }
    }

    pub fn category(&self) -> FaultCategory {
        match self {
            Self::OutOfBoundsHeap => FaultCategory::HeapBufferOverflow,
            Self::UseAfterReturn => FaultCategory::StackUseAfterReturn,
            Self::UseAfterScope => FaultCategory::StackUseAfterScope,
            Self::DataRace | Self::DataRaceMap => FaultCategory::DataRace,
            Self::DereferencingMisalignedPointer => FaultCategory::MisalignedAccess,
        }
    }

    /// What the matching detector should report when this example runs.
    pub fn expected(&self) -> Expected {
        let expected = Expected::from_category(self.category());
        match self {
            // every field of the tree the two threads touch is its own race
            Self::DataRaceMap => expected.repeated(),
            _ => expected,
        }
    }

    /// Commits the fault and returns the line the program prints.
    ///
    /// # Safety
    ///
    /// Never safe. Each example exists to perform undefined behavior.
    pub unsafe fn run(&self) -> String {
        match self {
            Self::OutOfBoundsHeap => {
                let (_, val) = asan::out_of_bounds_heap(|array| unsafe { *array });
                format!("val: {val}")
            }
            Self::UseAfterReturn => {
                let (_, val) = asan::use_after_return(|array| unsafe { *array });
                format!("val: {val}")
            }
            Self::UseAfterScope => {
                let (_, val) = asan::use_after_scope(|array| unsafe { *array });
                format!("val: {val}")
            }
            Self::DataRace => {
                let foo = unsafe { tsan::data_race() };
                format!("foo={foo}")
            }
            Self::DataRaceMap => {
                let foo = unsafe { tsan::data_race_map() };
                format!("foo={foo}")
            }
            Self::DereferencingMisalignedPointer => {
                let (aligned, misaligned) = unsafe { ubsan::dereferencing_misaligned_pointer() };
                format!("aligned: {aligned} misaligned: {misaligned}")
            }
        }
    }
}

impl fmt::Display for Example {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Example {
    type Err = UnknownExample;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::all()
            .iter()
            .find(|example| example.name() == s)
            .copied()
            .ok_or_else(|| UnknownExample(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sanitizer_report::Sanitizer;
    use std::collections::HashSet;

    #[test]
    fn names_are_unique_and_parse_back() {
        let names: HashSet<_> = Example::all().iter().map(Example::name).collect();
        assert_eq!(Example::all().len(), names.len());

        for example in Example::all() {
            assert_eq!(*example, example.name().parse::<Example>().unwrap());
        }
    }

    #[test]
    fn unknown_names_are_rejected() {
        let err = "use-after-free".parse::<Example>().unwrap_err();
        assert_eq!("unknown example: use-after-free", err.to_string());
    }

    #[test]
    fn detectors_match_fault_family() {
        assert_eq!(
            vec![Sanitizer::Address],
            Example::UseAfterScope.expected().detectors
        );
        assert_eq!(vec![Sanitizer::Thread], Example::DataRace.expected().detectors);
        assert_eq!(
            vec![Sanitizer::UndefinedBehavior, Sanitizer::RustRuntime],
            Example::DereferencingMisalignedPointer.expected().detectors
        );
    }

    #[test]
    fn only_the_map_race_may_repeat() {
        let repeated: Vec<_> = Example::all()
            .iter()
            .filter(|example| example.expected().repeated)
            .copied()
            .collect();
        assert_eq!(vec![Example::DataRaceMap], repeated);
    }
}
