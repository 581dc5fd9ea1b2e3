// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! UndefinedBehaviorSanitizer runtime errors and Rust runtime panics.
//!
//! Debug builds of Rust check pointer alignment on every raw dereference and
//! report a violation as a non-unwinding panic, so that panic is classified
//! the same as UBSan's misaligned load.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{parse_dec, ReportError};
use crate::{get_call_stack_file_name, CrashLogSummary, StackEntry};

pub(crate) const MISALIGNED_FAULT_TYPE: &str = "misaligned-pointer-use";
pub(crate) const PANIC_FAULT_TYPE: &str = "panic";
pub(crate) const RUST_RUNTIME: &str = "rust";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Misalignment {
    pub address: u64,
    pub alignment: u64,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
}

impl Misalignment {
    pub fn is_misaligned(&self) -> bool {
        self.alignment != 0 && self.address % self.alignment != 0
    }
}

// "/src/ubsan/x.c:14:28: runtime error: load of misaligned address 0x602000000011 for type 'int', which requires 4 byte alignment"
fn runtime_error() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(
            r"(?m)^(?P<file>\S+?):(?P<line>\d+):(?P<col>\d+): runtime error: (?P<message>[^\r\n]+)",
        )
        .expect("ubsan runtime error regex")
    })
}

// "thread 'main' panicked at src/ubsan.rs:40:23:\nmisaligned pointer dereference: address must be a multiple of 0x4 but is 0x5581d1c0db41"
// newer toolchains add the thread id: "thread 'main' (6165) panicked at ..."
fn rust_panic() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(
            r"thread '(?P<thread>[^']*)'(?: \((?P<tid>\d+)\))? panicked at (?P<file>\S+?):(?P<line>\d+):(?P<col>\d+):\r?\n(?P<message>[^\r\n]*)",
        )
        .expect("rust panic regex")
    })
}

fn misaligned_dereference() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(
            r"misaligned pointer dereference: address must be a multiple of 0x(?P<alignment>[0-9a-fA-F]+) but is 0x(?P<address>[0-9a-fA-F]+)",
        )
        .expect("rust misaligned dereference regex")
    })
}

fn misaligned_load() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(
            r"(?:load of|store to|member access within) misaligned address 0x(?P<address>[0-9a-fA-F]+) for type '(?P<type_name>[^']+)', which requires (?P<alignment>\d+) byte alignment",
        )
        .expect("ubsan misaligned regex")
    })
}

pub(crate) fn parse_summary(text: &str) -> Option<CrashLogSummary> {
    if let Some(captures) = rust_panic().captures(text) {
        let message = captures["message"].trim();
        let fault_type = if misaligned_dereference().is_match(message) {
            MISALIGNED_FAULT_TYPE
        } else {
            PANIC_FAULT_TYPE
        };

        return Some(CrashLogSummary {
            summary: message.to_string(),
            sanitizer: RUST_RUNTIME.to_string(),
            fault_type: fault_type.to_string(),
        });
    }

    let captures = runtime_error().captures(text)?;
    let message = captures["message"].trim();

    // without `report_error_type=1` the SUMMARY line only says
    // "undefined-behavior", so the category comes from the message
    let fault_type = if misaligned_load().is_match(message) {
        MISALIGNED_FAULT_TYPE.to_string()
    } else {
        message.to_string()
    };

    Some(CrashLogSummary {
        summary: format!("UndefinedBehaviorSanitizer: {message}"),
        sanitizer: "UndefinedBehaviorSanitizer".to_string(),
        fault_type,
    })
}

pub(crate) fn parse_misalignment(text: &str) -> Option<Misalignment> {
    if let Some(captures) = misaligned_dereference().captures(text) {
        return Some(Misalignment {
            address: u64::from_str_radix(&captures["address"], 16).ok()?,
            alignment: u64::from_str_radix(&captures["alignment"], 16).ok()?,
            type_name: None,
        });
    }

    let captures = misaligned_load().captures(text)?;
    Some(Misalignment {
        address: u64::from_str_radix(&captures["address"], 16).ok()?,
        alignment: captures["alignment"].parse().ok()?,
        type_name: Some(captures["type_name"].to_string()),
    })
}

/// The source location of the error line, as a single-frame stack.
///
/// Only used when the report has no sanitizer-format stack of its own.
pub(crate) fn parse_error_location(text: &str) -> Result<Vec<StackEntry>, ReportError> {
    let captures = match rust_panic()
        .captures(text)
        .or_else(|| runtime_error().captures(text))
    {
        Some(captures) => captures,
        None => return Ok(vec![]),
    };

    let line = format!(
        "{}:{}:{}",
        &captures["file"], &captures["line"], &captures["col"]
    );
    let source_file_path = captures["file"].to_string();

    Ok(vec![StackEntry {
        source_file_name: Some(get_call_stack_file_name(&source_file_path)),
        source_file_line: Some(parse_dec(&line, &captures["line"])?),
        source_file_column: Some(parse_dec(&line, &captures["col"])?),
        source_file_path: Some(source_file_path),
        line,
        ..Default::default()
    }])
}
