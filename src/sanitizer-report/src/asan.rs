// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::error::{parse_dec, parse_hex, ReportError};
use crate::{get_call_stack_file_name, AccessKind, CrashLogSummary, StackEntry};

const BASE: &str = r"\s*#(?P<frame>\d+)\s+0x(?P<address>[0-9a-fA-F]+)\s";
const SUFFIX: &str = r"\s*(?:\(BuildId:[^)]*\))?";
const ENTRIES: &[&str] = &[
    // "in module::func(char *args) (/path/to/bin+0x123)"
    // "in symbol+0x123 (/path/to/bin+0x123)"
    r"in (?P<func_1>[^+]+)(\+0x(?P<function_offset_1>[0-9a-fA-F]+))? \((?P<module_path_1>[^+]+)\+0x(?P<module_offset_1>[0-9a-fA-F]+)\)",
    // "in crate::module::func::h0123 /path/src/lib.rs:16:17"
    r"in (?P<func_2>.*) (?P<file_path_1>[^ ]+):(?P<file_line_1>\d+):(?P<file_col_1>\d+)",
    // "in foo /path:16"
    r"in (?P<func_3>.*) (?P<file_path_2>[^ ]+):(?P<file_line_2>\d+)",
    // "  (/path/to/bin+0x123)"
    r" \((?P<module_path_2>.*)\+0x(?P<module_offset_2>[0-9a-fA-F]+)\)",
    // "in </path/to/bin>+0x123"
    r"in <(?P<module_path_3>[^>]+)>\+0x(?P<module_offset_3>[0-9a-fA-F]+)",
    // "in libc.so.6"
    r"in (?P<module_path_4>[a-z0-9.]+)",
    // "in _start"
    // "in _start+0x12345"
    r"in (?P<func_4>[^+]+)(\+0x(?P<module_offset_4>[0-9a-fA-F]+))?",
];

fn first<'t>(captures: &Captures<'t>, names: &[&str]) -> Option<&'t str> {
    names
        .iter()
        .find_map(|name| captures.name(name))
        .map(|x| x.as_str())
}

pub(crate) fn parse_asan_call_stack(text: &str) -> Result<Vec<StackEntry>, ReportError> {
    static FRAME: OnceLock<Regex> = OnceLock::new();
    let frame = FRAME.get_or_init(|| {
        let pattern = format!("^{BASE}(?:{}){SUFFIX}$", ENTRIES.join("|"));
        Regex::new(&pattern).expect("asan frame regex failed to compile")
    });

    let mut stack = vec![];

    for line in text.lines() {
        let line = line.trim();
        let captures = match frame.captures(line) {
            Some(captures) => captures,
            // only the first stack is the faulting access; later stacks
            // describe the allocation or the owning frame
            None if !stack.is_empty() => break,
            None => continue,
        };

        let line = captures[0].to_string();
        let address = Some(parse_hex(&line, &captures["address"])?);

        let function_name = first(&captures, &["func_1", "func_2", "func_3", "func_4"])
            .map(ToString::to_string);

        let source_file_path =
            first(&captures, &["file_path_1", "file_path_2"]).map(ToString::to_string);
        let source_file_name = source_file_path
            .as_deref()
            .map(get_call_stack_file_name);

        let source_file_line = first(&captures, &["file_line_1", "file_line_2"])
            .map(|x| parse_dec(&line, x))
            .transpose()?;
        let source_file_column = first(&captures, &["file_col_1"])
            .map(|x| parse_dec(&line, x))
            .transpose()?;
        let function_offset = first(&captures, &["function_offset_1"])
            .map(|x| parse_hex(&line, x))
            .transpose()?;

        let module_path = first(
            &captures,
            &[
                "module_path_1",
                "module_path_2",
                "module_path_3",
                "module_path_4",
            ],
        )
        .map(ToString::to_string);

        let module_offset = first(
            &captures,
            &[
                "module_offset_1",
                "module_offset_2",
                "module_offset_3",
                "module_offset_4",
            ],
        )
        .map(|x| parse_hex(&line, x))
        .transpose()?;

        stack.push(StackEntry {
            line,
            address,
            function_name,
            function_offset,
            source_file_name,
            source_file_path,
            source_file_line,
            source_file_column,
            module_path,
            module_offset,
        });
    }

    Ok(stack)
}

pub(crate) fn parse_scariness(text: &str) -> Option<(u32, String)> {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    let re = REGEX.get_or_init(|| {
        Regex::new(r"(?m)^SCARINESS: (\d+) \(([^\)]+)\)\r?$").expect("scariness regex")
    });
    let captures = re.captures(text)?;
    let score = captures.get(1)?.as_str().parse::<u32>().ok()?;
    let description = captures.get(2)?.as_str().trim();

    Some((score, description.into()))
}

/// A bad heap access and the region ASan says it falls next to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutOfBounds {
    pub kind: AccessKind,
    pub size: u64,
    pub address: u64,
    pub region_start: u64,
    pub region_end: u64,
}

impl OutOfBounds {
    pub fn is_outside_region(&self) -> bool {
        self.address < self.region_start || self.address >= self.region_end
    }
}

pub(crate) fn parse_out_of_bounds(text: &str) -> Option<OutOfBounds> {
    static ACCESS: OnceLock<Regex> = OnceLock::new();
    static REGION: OnceLock<Regex> = OnceLock::new();

    let access = ACCESS.get_or_init(|| {
        Regex::new(r"(?m)^(?P<kind>READ|WRITE) of size (?P<size>\d+) at 0x(?P<address>[0-9a-fA-F]+)")
            .expect("asan access regex")
    });
    let region = REGION.get_or_init(|| {
        Regex::new(
            r"is located \d+ bytes (?:after|before|inside of|to the right of|to the left of) \d+-byte region \[0x(?P<start>[0-9a-fA-F]+),0x(?P<end>[0-9a-fA-F]+)\)",
        )
        .expect("asan region regex")
    });

    let access = access.captures(text)?;
    let region = region.captures(text)?;

    let kind = match &access["kind"] {
        "WRITE" => AccessKind::Write,
        _ => AccessKind::Read,
    };

    Some(OutOfBounds {
        kind,
        size: access["size"].parse().ok()?,
        address: u64::from_str_radix(&access["address"], 16).ok()?,
        region_start: u64::from_str_radix(&region["start"], 16).ok()?,
        region_end: u64::from_str_radix(&region["end"], 16).ok()?,
    })
}

pub(crate) fn parse_asan_runtime_error(text: &str) -> Option<CrashLogSummary> {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    let re = REGEX.get_or_init(|| {
        Regex::new(r"==\d+==((\w+) (CHECK failed): [^ \n]+)").expect("check failure regex")
    });
    let captures = re.captures(text)?;
    Some(CrashLogSummary {
        summary: captures.get(1)?.as_str().trim().to_string(),
        sanitizer: captures.get(2)?.as_str().trim().to_string(),
        fault_type: captures.get(3)?.as_str().trim().to_string(),
    })
}

const FAULT_TYPE_LIST: &str = "ABRT|FPE|SEGV|\
    access-violation|deadly signal|use-of-uninitialized-value|\
    stack-overflow|stack-buffer-underflow|stack-buffer-overflow|\
    stack-use-after-return|stack-use-after-scope|\
    attempting free on address which was not malloc\\(\\)-ed|\
    heap-use-after-free|heap-buffer-overflow|\
    unknown-crash";

const FAULT_TYPE: &str = const_format::formatcp!(r"(?P<fault_type>{FAULT_TYPE_LIST})");

pub(crate) fn parse_asan_abort_error(text: &str) -> Option<CrashLogSummary> {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    let re = REGEX.get_or_init(|| {
        let pattern = const_format::formatcp!(
            r"==\d+==\s*(?:ERROR|WARNING): (?P<summary>(?P<sanitizer>\w+Sanitizer): {FAULT_TYPE}[^\n]*)"
        );
        Regex::new(pattern).expect("asan error regex")
    });
    let captures = re.captures(text)?;
    Some(CrashLogSummary {
        summary: captures.name("summary")?.as_str().trim().to_string(),
        sanitizer: captures.name("sanitizer")?.as_str().trim().to_string(),
        fault_type: captures.name("fault_type")?.as_str().trim().to_string(),
    })
}

pub(crate) fn parse_summary_base(text: &str) -> Option<CrashLogSummary> {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    let re = REGEX.get_or_init(|| {
        Regex::new(r"SUMMARY: ((\w+): (data race|deadly signal|odr-violation|[^ \n]+).*)")
            .expect("summary regex")
    });
    let captures = re.captures(text)?;
    Some(CrashLogSummary {
        summary: captures.get(1)?.as_str().trim().to_string(),
        sanitizer: captures.get(2)?.as_str().trim().to_string(),
        fault_type: captures.get(3)?.as_str().trim().to_string(),
    })
}

pub(crate) fn parse_summary(text: &str) -> Option<CrashLogSummary> {
    [
        parse_summary_base,
        parse_asan_abort_error,
        parse_asan_runtime_error,
    ]
    .iter()
    .find_map(|f| f(text))
}
