// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::ops::Range;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{parse_dec, parse_hex, ReportError};
use crate::{get_call_stack_file_name, AccessKind, CrashLogSummary, StackEntry};

// ThreadSanitizer frames carry no leading pc:
//   "#0 threadfunc(int*) /src/tsan/data_race.cpp:4:27 (data_race+0xd0a1b)"
//   "#2 <null> <null> (libc.so.6+0x94ac2)"
const FRAME: &str = r"^#(?P<frame>\d+) (?P<func>.+?) (?:(?P<file>\S+?):(?P<line>\d+)(?::(?P<col>\d+))?|<null>) \((?P<module>[^()]+?)\+0x(?P<offset>[0-9a-fA-F]+)\)(?:\s*\(BuildId:[^)]*\))?$";

/// One side of a reported race.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaceAccess {
    pub kind: AccessKind,
    pub size: u64,
    pub address: u64,
    pub thread: String,
    #[serde(default)]
    pub previous: bool,
}

pub(crate) fn parse_tsan_call_stack(text: &str) -> Result<Vec<StackEntry>, ReportError> {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    let re = REGEX.get_or_init(|| Regex::new(FRAME).expect("tsan frame regex failed to compile"));

    let mut stack = vec![];
    for line in text.lines() {
        let line = line.trim();
        let captures = match re.captures(line) {
            Some(captures) => captures,
            None if !stack.is_empty() => break,
            None => continue,
        };

        let function_name = match &captures["func"] {
            "<null>" => None,
            func => Some(func.to_string()),
        };
        let source_file_path = captures.name("file").map(|x| x.as_str().to_string());
        let source_file_line = captures
            .name("line")
            .map(|x| parse_dec(line, x.as_str()))
            .transpose()?;
        let source_file_column = captures
            .name("col")
            .map(|x| parse_dec(line, x.as_str()))
            .transpose()?;

        stack.push(StackEntry {
            line: line.to_string(),
            address: None,
            function_name,
            function_offset: None,
            source_file_name: source_file_path.as_deref().map(get_call_stack_file_name),
            source_file_path,
            source_file_line,
            source_file_column,
            module_path: Some(captures["module"].to_string()),
            module_offset: Some(parse_hex(line, &captures["offset"])?),
        });
    }

    Ok(stack)
}

pub(crate) fn parse_race_accesses(text: &str) -> Vec<RaceAccess> {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    let re = REGEX.get_or_init(|| {
        Regex::new(
            r"(?m)^\s*(?P<previous>Previous )?(?P<kind>(?i:read|write)) of size (?P<size>\d+) at 0x(?P<address>[0-9a-fA-F]+) by (?P<thread>main thread|thread T\d+)",
        )
        .expect("tsan access regex")
    });

    re.captures_iter(text)
        .filter_map(|captures| {
            let kind = if captures["kind"].eq_ignore_ascii_case("write") {
                AccessKind::Write
            } else {
                AccessKind::Read
            };

            Some(RaceAccess {
                kind,
                size: captures["size"].parse().ok()?,
                address: u64::from_str_radix(&captures["address"], 16).ok()?,
                thread: captures["thread"].to_string(),
                previous: captures.name("previous").is_some(),
            })
        })
        .collect()
}

impl RaceAccess {
    /// Bytes touched, `[address, address + size)`.
    pub fn span(&self) -> Range<u64> {
        self.address..self.address.saturating_add(self.size)
    }

    pub fn overlaps(&self, other: &RaceAccess) -> bool {
        let (a, b) = (self.span(), other.span());
        a.start < b.end && b.start < a.end
    }
}

/// Two overlapping accesses from different threads, at least one a write.
///
/// The two sides need not start at the same address: a narrow read inside a
/// wider write is reported against the write's address.
pub fn is_conflicting_pair(accesses: &[RaceAccess]) -> bool {
    match accesses {
        [current, previous] => {
            current.overlaps(previous)
                && current.thread != previous.thread
                && (current.kind == AccessKind::Write || previous.kind == AccessKind::Write)
        }
        _ => false,
    }
}

pub(crate) fn parse_summary(text: &str) -> Option<CrashLogSummary> {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    let re = REGEX.get_or_init(|| {
        Regex::new(r"WARNING: (?P<summary>(?P<sanitizer>ThreadSanitizer): (?P<fault_type>data race|[^(\n]+?))\s*(?:\(pid=\d+\))?\r?$")
            .expect("tsan warning regex")
    });

    let captures = text.lines().find_map(|line| re.captures(line))?;
    Some(CrashLogSummary {
        summary: captures.name("summary")?.as_str().trim().to_string(),
        sanitizer: captures.name("sanitizer")?.as_str().to_string(),
        fault_type: captures.name("fault_type")?.as_str().trim().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const RACE: &str = "\
WARNING: ThreadSanitizer: data race (pid=4029)
  Write of size 4 at 0x7ffd4a8d3b9c by thread T1:
    #0 fault_examples::tsan::data_race::{{closure}} /work/src/fault-examples/src/tsan.rs:33:18 (data-race+0xd0a1b)
    #1 std::sys_common::backtrace::__rust_begin_short_backtrace /rustc/library/std/src/sys_common/backtrace.rs:155:18 (data-race+0xd0c02)
    #2 <null> <null> (libc.so.6+0x94ac2)

  Previous read of size 4 at 0x7ffd4a8d3b9c by main thread:
    #0 fault_examples::tsan::data_race /work/src/fault-examples/src/tsan.rs:36:16 (data-race+0xd0b2e)
";

    #[test]
    fn parses_both_accesses() {
        let accesses = parse_race_accesses(RACE);
        assert_eq!(
            vec![
                RaceAccess {
                    kind: AccessKind::Write,
                    size: 4,
                    address: 0x7ffd4a8d3b9c,
                    thread: "thread T1".to_string(),
                    previous: false,
                },
                RaceAccess {
                    kind: AccessKind::Read,
                    size: 4,
                    address: 0x7ffd4a8d3b9c,
                    thread: "main thread".to_string(),
                    previous: true,
                },
            ],
            accesses
        );
        assert!(is_conflicting_pair(&accesses));
    }

    #[test]
    fn same_thread_is_not_a_race() {
        let mut accesses = parse_race_accesses(RACE);
        accesses[1].thread = "thread T1".to_string();
        assert!(!is_conflicting_pair(&accesses));
    }

    #[test]
    fn two_reads_are_not_a_race() {
        let mut accesses = parse_race_accesses(RACE);
        accesses[0].kind = AccessKind::Read;
        assert!(!is_conflicting_pair(&accesses));
    }

    #[test]
    fn narrow_read_inside_wider_write_is_a_race() {
        let text = "\
  Read of size 2 at 0x72540000021a by main thread:
  Previous write of size 8 at 0x725400000218 by thread T1:
";
        let accesses = parse_race_accesses(text);
        assert_eq!(2, accesses.len());
        assert!(accesses[0].overlaps(&accesses[1]));
        assert!(is_conflicting_pair(&accesses));
    }

    #[test]
    fn adjacent_accesses_do_not_overlap() {
        let text = "\
  Write of size 8 at 0x725400000218 by thread T1:
  Previous read of size 2 at 0x725400000220 by main thread:
";
        let accesses = parse_race_accesses(text);
        assert_eq!(0x725400000218..0x725400000220, accesses[0].span());
        assert!(!is_conflicting_pair(&accesses));
    }

    #[test]
    fn module_names_may_contain_plus() -> anyhow::Result<()> {
        let text = "\
    #5 std::thread::_State_impl<std::thread::_Invoker<std::tuple<void (*)(int*), int*> > >::_M_run() /usr/include/c++/12/bits/std_thread.h:210 (data_race+0x140e)
    #6 <null> <null> (libstdc++.so.6+0xd44a2)
";
        let stack = parse_tsan_call_stack(text)?;
        assert_eq!(2, stack.len());
        assert_eq!(Some(210), stack[0].source_file_line);
        assert_eq!(None, stack[0].source_file_column);
        assert_eq!(Some("libstdc++.so.6"), stack[1].module_path.as_deref());
        assert_eq!(Some(0xd44a2), stack[1].module_offset);
        Ok(())
    }

    #[test]
    fn parses_first_access_stack() -> anyhow::Result<()> {
        let stack = parse_tsan_call_stack(RACE)?;
        assert_eq!(3, stack.len());
        assert_eq!(
            Some("fault_examples::tsan::data_race::{{closure}}"),
            stack[0].function_name.as_deref()
        );
        assert_eq!(Some("tsan.rs"), stack[0].source_file_name.as_deref());
        assert_eq!(Some(33), stack[0].source_file_line);
        assert_eq!(Some(18), stack[0].source_file_column);
        assert_eq!(None, stack[2].function_name);
        assert_eq!(Some("libc.so.6"), stack[2].module_path.as_deref());
        Ok(())
    }

    #[test]
    fn parses_warning_header() {
        let summary = parse_summary(RACE).expect("summary");
        assert_eq!("ThreadSanitizer", summary.sanitizer);
        assert_eq!("data race", summary.fault_type);
        assert_eq!("ThreadSanitizer: data race", summary.summary);
    }
}
