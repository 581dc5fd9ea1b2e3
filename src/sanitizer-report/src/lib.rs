// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Parsing and classification of dynamic-analysis reports.
//!
//! Understands AddressSanitizer, ThreadSanitizer and
//! UndefinedBehaviorSanitizer output, plus the Rust runtime's misaligned
//! dereference panic, and maps each report to a [`FaultCategory`].

use std::fmt::Write;
use std::sync::OnceLock;

use regex::RegexSet;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

mod asan;
mod classify;
mod error;
mod tsan;
mod ubsan;

pub use asan::OutOfBounds;
pub use classify::{parse_findings, verify, Expected, FaultCategory, Finding, Sanitizer};
pub use error::ReportError;
pub use tsan::{is_conflicting_pair, RaceAccess};
pub use ubsan::Misalignment;

pub type Result<T, E = ReportError> = std::result::Result<T, E>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessKind {
    Read,
    Write,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackEntry {
    pub line: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_offset: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file_line: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file_column: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_offset: Option<u64>,
}

impl StackEntry {
    fn function_line_entry(&self) -> Option<String> {
        let mut result = String::new();
        if let Some(function_name) = &self.function_name {
            result.push_str(&function_without_args(function_without_hash(function_name)));
        }

        if let Some(source_file_name) = &self.source_file_name {
            if !result.is_empty() {
                result.push(' ');
            }
            result.push_str(source_file_name);
            if let Some(line) = self.source_file_line {
                let _ = write!(result, ":{line}");
            }
        }

        (!result.is_empty()).then_some(result)
    }

    pub fn crash_site(&self) -> String {
        let mut result = String::new();

        if let Some(source_file_path) = &self.source_file_path {
            result.push_str(source_file_path);
            if let Some(line) = self.source_file_line {
                let _ = write!(result, ":{line}");
                if let Some(column) = self.source_file_column {
                    let _ = write!(result, ":{column}");
                }
            }
        } else if let Some(module_path) = &self.module_path {
            result.push('(');
            result.push_str(module_path);
            if let Some(module_offset) = self.module_offset {
                let _ = write!(result, "+{module_offset:#x}");
            }
            result.push(')');
        }

        if let Some(function_name) = &self.function_name {
            if !result.is_empty() {
                result.push(' ');
            }
            result.push_str("in ");
            result.push_str(function_name);
        }

        result
    }
}

/// Details of the faulting access, when the detector reports them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AccessDetails {
    OutOfBounds(OutOfBounds),
    Race { accesses: Vec<RaceAccess> },
    Misaligned(Misalignment),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashLog {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    pub sanitizer: String,
    pub summary: String,
    pub fault_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub call_stack: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub full_stack_details: Vec<StackEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub full_stack_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub minimized_stack_details: Vec<StackEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub minimized_stack: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub minimized_stack_function_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub minimized_stack_function_lines: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scariness_score: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scariness_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access: Option<AccessDetails>,
}

pub(crate) struct CrashLogSummary {
    summary: String,
    sanitizer: String,
    fault_type: String,
}

// Frames belonging to the detector runtime, libc startup, or the Rust
// runtime never point at the fault itself.
const STACK_FILTER: &[&str] = &[
    r"^__(?:asan|tsan|ubsan|sanitizer|interceptor)_",
    r"^__libc_start",
    r"^_start$",
    r"^start_thread$",
    r"^clone3?$",
    r"^(?:malloc|calloc|free|memset|memcpy|memcmp|bcmp)$",
    r"^std::rt::",
    r"^std::sys(?:_common)?::",
    r"^std::panicking::",
    r"^std::panic::",
    r"^<?std::thread::",
    r"^core::ops::function::",
    r"^<.+ as core::ops::function::",
    r"^core::panicking::",
    r"^<alloc::boxed::Box<",
    r"^__rust_",
    r"libclang_rt\.",
    r"/libc\.so",
    r"^libc\.so",
    r"libpthread",
    r"ld-linux",
];

fn stack_filter() -> &'static RegexSet {
    static FILTER: OnceLock<RegexSet> = OnceLock::new();
    FILTER.get_or_init(|| RegexSet::new(STACK_FILTER).expect("stack filter failed to compile"))
}

fn is_runtime_frame(entry: &StackEntry, filter: &RegexSet) -> bool {
    let by_name = entry
        .function_name
        .as_deref()
        .map_or(false, |name| filter.is_match(name));
    let by_module = entry.function_name.is_none()
        && entry
            .module_path
            .as_deref()
            .map_or(false, |path| filter.is_match(path));

    by_name || by_module
}

/// Trims the argument list off a symbol, treating `<...>` sections as
/// opaque so `Box<dyn Fn()>` style generics survive.
fn function_without_args(func: &str) -> String {
    let mut angle_depth = 0usize;
    for (ix, c) in func.char_indices() {
        match c {
            '<' => angle_depth += 1,
            '>' => angle_depth = angle_depth.saturating_sub(1),
            '(' if angle_depth == 0 => return func[..ix].trim().to_string(),
            _ => continue,
        }
    }

    func.to_string()
}

// Rust symbols carry a trailing `::h<16 hex digits>` disambiguator that
// changes between builds.
fn function_without_hash(func: &str) -> &str {
    match func.rsplit_once("::h") {
        Some((name, hash)) if hash.len() == 16 && hash.chars().all(|c| c.is_ascii_hexdigit()) => {
            name
        }
        _ => func,
    }
}

impl CrashLog {
    pub fn new(
        text: Option<String>,
        sanitizer: String,
        fault_type: String,
        scariness_score: Option<u32>,
        scariness_description: Option<String>,
        access: Option<AccessDetails>,
        stack: Vec<StackEntry>,
    ) -> Self {
        let filter = stack_filter();
        let minimized_stack_details: Vec<StackEntry> = stack
            .iter()
            .filter(|x| !is_runtime_frame(x, filter))
            .cloned()
            .collect();

        let crash_site = minimized_stack_details
            .first()
            .or_else(|| stack.first())
            .map(StackEntry::crash_site)
            .unwrap_or_else(|| "(crash site unavailable)".to_string());

        // mimics the detector's own "SUMMARY: <sanitizer>: <type> <frame>"
        // but anchored on the top minimized frame
        let summary = format!("{sanitizer}: {fault_type} {crash_site}");

        Self {
            text,
            sanitizer,
            summary,
            fault_type,
            call_stack: stack_lines(&stack),
            full_stack_names: stack_names(&stack),
            minimized_stack: stack_lines(&minimized_stack_details),
            minimized_stack_function_names: stack_names(&minimized_stack_details),
            minimized_stack_function_lines: stack_function_lines(&minimized_stack_details),
            minimized_stack_details,
            full_stack_details: stack,
            scariness_score,
            scariness_description,
            access,
        }
    }

    pub fn parse(text: String) -> Result<Self> {
        let summary = parse_summary(&text)?;
        log::debug!("parsed summary: {}", summary.summary);

        let stack = parse_call_stack(&text)?;
        let (scariness_score, scariness_description) = asan::parse_scariness(&text).unzip();
        let access = parse_access(&text);

        Ok(Self::new(
            Some(text),
            summary.sanitizer,
            summary.fault_type,
            scariness_score,
            scariness_description,
            access,
            stack,
        ))
    }

    pub fn call_stack_sha256(&self) -> String {
        digest_iter(&self.call_stack, None)
    }

    pub fn minimized_stack_sha256(&self, depth: Option<usize>) -> String {
        digest_iter(&self.minimized_stack, depth)
    }

    pub fn minimized_stack_function_names_sha256(&self, depth: Option<usize>) -> String {
        digest_iter(&self.minimized_stack_function_names, depth)
    }

    pub fn minimized_stack_function_lines_sha256(&self, depth: Option<usize>) -> String {
        digest_iter(&self.minimized_stack_function_lines, depth)
    }
}

fn stack_lines(stack: &[StackEntry]) -> Vec<String> {
    stack.iter().map(|x| x.line.clone()).collect()
}

fn stack_names(stack: &[StackEntry]) -> Vec<String> {
    stack
        .iter()
        .filter_map(|x| x.function_name.as_deref())
        .map(|x| function_without_args(function_without_hash(x)))
        .collect()
}

fn stack_function_lines(stack: &[StackEntry]) -> Vec<String> {
    stack.iter().filter_map(|x| x.function_line_entry()).collect()
}

fn parse_summary(text: &str) -> Result<CrashLogSummary> {
    // the UBSan/Rust check goes first: UBSan's own SUMMARY line is too
    // generic to classify
    ubsan::parse_summary(text)
        .or_else(|| asan::parse_summary(text))
        .or_else(|| tsan::parse_summary(text))
        .ok_or(ReportError::UnrecognizedSummary)
}

fn parse_access(text: &str) -> Option<AccessDetails> {
    let accesses = tsan::parse_race_accesses(text);
    if !accesses.is_empty() {
        return Some(AccessDetails::Race { accesses });
    }

    asan::parse_out_of_bounds(text)
        .map(AccessDetails::OutOfBounds)
        .or_else(|| ubsan::parse_misalignment(text).map(AccessDetails::Misaligned))
}

pub fn parse_call_stack(text: &str) -> Result<Vec<StackEntry>> {
    let stack = asan::parse_asan_call_stack(text)?;
    if !stack.is_empty() {
        return Ok(stack);
    }

    let stack = tsan::parse_tsan_call_stack(text)?;
    if !stack.is_empty() {
        return Ok(stack);
    }

    ubsan::parse_error_location(text)
}

// Can't use Path's split: reports may come from another OS.
pub(crate) fn get_call_stack_file_name(file_path: &str) -> String {
    file_path
        .rsplit_once('/')
        .or_else(|| file_path.rsplit_once('\\'))
        .map_or(file_path, |(_, name)| name)
        .to_string()
}

pub fn digest_iter(
    data: impl IntoIterator<Item = impl AsRef<[u8]>>,
    depth: Option<usize>,
) -> String {
    let mut ctx = Sha256::new();
    let frames = data.into_iter().take(depth.unwrap_or(usize::MAX));
    for frame in frames {
        ctx.update(frame);
    }

    hex::encode(ctx.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn check_cpp_signature() {
        let full_name = "std::map<std::string, std::string>::operator[](std::string&&)";
        assert_eq!(
            "std::map<std::string, std::string>::operator[]",
            function_without_args(full_name)
        );
    }

    #[test]
    fn strips_rust_symbol_hash() {
        assert_eq!(
            "fault_examples::asan::use_after_scope",
            function_without_hash("fault_examples::asan::use_after_scope::h5b1e2f0c6a7d8e9f")
        );
        assert_eq!(
            "fault_examples::hash::hello",
            function_without_hash("fault_examples::hash::hello")
        );
    }

    #[test]
    fn file_names_from_either_separator() {
        assert_eq!("asan.rs", get_call_stack_file_name("/work/src/asan.rs"));
        assert_eq!("asan.c", get_call_stack_file_name(r"C:\work\asan.c"));
        assert_eq!("asan.c", get_call_stack_file_name("asan.c"));
    }

    #[test]
    fn runtime_frames_are_minimized_away() {
        let stack = vec![
            StackEntry {
                line: "#0".to_string(),
                function_name: Some("__asan_report_load4".to_string()),
                ..Default::default()
            },
            StackEntry {
                line: "#1".to_string(),
                function_name: Some("fault_examples::asan::use_after_return::h0123456789abcdef".to_string()),
                source_file_path: Some("/work/src/asan.rs".to_string()),
                source_file_name: Some("asan.rs".to_string()),
                source_file_line: Some(70),
                ..Default::default()
            },
            StackEntry {
                line: "#2".to_string(),
                function_name: Some("std::rt::lang_start_internal".to_string()),
                ..Default::default()
            },
        ];

        let log = CrashLog::new(
            None,
            "AddressSanitizer".to_string(),
            "stack-use-after-return".to_string(),
            None,
            None,
            None,
            stack,
        );

        assert_eq!(vec!["#1".to_string()], log.minimized_stack);
        assert_eq!(
            vec!["fault_examples::asan::use_after_return".to_string()],
            log.minimized_stack_function_names
        );
        assert_eq!(
            vec!["fault_examples::asan::use_after_return asan.rs:70".to_string()],
            log.minimized_stack_function_lines
        );
        assert_eq!(
            "AddressSanitizer: stack-use-after-return /work/src/asan.rs:70 in fault_examples::asan::use_after_return::h0123456789abcdef",
            log.summary
        );
    }

    #[test]
    fn qualified_fn_trait_shims_are_runtime_frames() {
        let frame = |name: &str| StackEntry {
            line: name.to_string(),
            function_name: Some(name.to_string()),
            ..Default::default()
        };

        for name in [
            "<fn() as core::ops::function::FnOnce<()>>::call_once",
            "<&dyn core::ops::function::Fn<(), Output = i32> + core::marker::Sync + core::panic::unwind_safe::RefUnwindSafe as core::ops::function::FnOnce<()>>::call_once",
        ] {
            assert!(is_runtime_frame(&frame(name), stack_filter()), "{name}");
        }

        for name in [
            "<fault_examples::Example>::run::{closure#0}",
            "fault_examples::asan::out_of_bounds_heap::<i32, <fault_examples::Example>::run::{closure#0}>",
        ] {
            assert!(!is_runtime_frame(&frame(name), stack_filter()), "{name}");
        }
    }

    #[test]
    fn runtime_only_stack_uses_top_frame_as_crash_site() {
        let stack = vec![
            StackEntry {
                line: "#0".to_string(),
                function_name: Some("__tsan_write4".to_string()),
                module_path: Some("/work/target/debug/data-race".to_string()),
                module_offset: Some(0x1234),
                ..Default::default()
            },
            StackEntry {
                line: "#1".to_string(),
                module_path: Some("/lib/x86_64-linux-gnu/libc.so.6".to_string()),
                ..Default::default()
            },
        ];
        assert!(stack.iter().all(|x| is_runtime_frame(x, stack_filter())));

        let log = CrashLog::new(
            None,
            "ThreadSanitizer".to_string(),
            "data race".to_string(),
            None,
            None,
            None,
            stack,
        );
        assert!(log.minimized_stack.is_empty());
        assert_eq!(
            "ThreadSanitizer: data race (/work/target/debug/data-race+0x1234) in __tsan_write4",
            log.summary
        );
    }

    #[test]
    fn unrecognized_text_is_an_error() {
        let result = CrashLog::parse("hello world\n".to_string());
        assert!(matches!(result, Err(ReportError::UnrecognizedSummary)));
    }

    #[test]
    fn digest_depth_limits_frames() {
        let frames = ["a", "b", "c"];
        assert_eq!(digest_iter(frames, Some(2)), digest_iter(["a", "b"], None));
        assert_ne!(digest_iter(frames, Some(2)), digest_iter(frames, None));
    }
}
