// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::HashSet;
use std::fmt;
use std::iter;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::tsan::is_conflicting_pair;
use crate::{digest_iter, AccessDetails, CrashLog, Misalignment, RaceAccess, ReportError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Sanitizer {
    Address,
    Leak,
    Thread,
    UndefinedBehavior,
    RustRuntime,
    Unknown,
}

impl Sanitizer {
    pub fn from_report_name(name: &str) -> Self {
        match name {
            "AddressSanitizer" => Self::Address,
            "LeakSanitizer" => Self::Leak,
            "ThreadSanitizer" => Self::Thread,
            "UndefinedBehaviorSanitizer" => Self::UndefinedBehavior,
            crate::ubsan::RUST_RUNTIME => Self::RustRuntime,
            _ => Self::Unknown,
        }
    }

    pub fn report_name(&self) -> &'static str {
        match self {
            Self::Address => "AddressSanitizer",
            Self::Leak => "LeakSanitizer",
            Self::Thread => "ThreadSanitizer",
            Self::UndefinedBehavior => "UndefinedBehaviorSanitizer",
            Self::RustRuntime => "Rust runtime",
            Self::Unknown => "unknown detector",
        }
    }
}

impl fmt::Display for Sanitizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.report_name())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FaultCategory {
    HeapBufferOverflow,
    StackUseAfterReturn,
    StackUseAfterScope,
    DataRace,
    MisalignedAccess,
    Other(String),
}

impl FaultCategory {
    pub fn from_fault_type(fault_type: &str) -> Self {
        match fault_type {
            "heap-buffer-overflow" => Self::HeapBufferOverflow,
            "stack-use-after-return" => Self::StackUseAfterReturn,
            "stack-use-after-scope" => Self::StackUseAfterScope,
            "data race" => Self::DataRace,
            crate::ubsan::MISALIGNED_FAULT_TYPE => Self::MisalignedAccess,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::HeapBufferOverflow => "heap-buffer-overflow",
            Self::StackUseAfterReturn => "stack-use-after-return",
            Self::StackUseAfterScope => "stack-use-after-scope",
            Self::DataRace => "data race",
            Self::MisalignedAccess => crate::ubsan::MISALIGNED_FAULT_TYPE,
            Self::Other(other) => other,
        }
    }

    /// Detectors that report this category.
    pub fn detectors(&self) -> &'static [Sanitizer] {
        match self {
            Self::HeapBufferOverflow | Self::StackUseAfterReturn | Self::StackUseAfterScope => {
                &[Sanitizer::Address]
            }
            Self::DataRace => &[Sanitizer::Thread],
            Self::MisalignedAccess => &[Sanitizer::UndefinedBehavior, Sanitizer::RustRuntime],
            Self::Other(_) => &[],
        }
    }
}

impl fmt::Display for FaultCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The finding a fault example should produce under its detector.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expected {
    pub category: FaultCategory,
    pub detectors: Vec<Sanitizer>,
    /// The fault may legitimately be reported more than once, e.g. a race
    /// on a container touches several of its fields.
    #[serde(default)]
    pub repeated: bool,
}

impl Expected {
    pub fn new(category: FaultCategory, detectors: &[Sanitizer]) -> Self {
        Self {
            category,
            detectors: detectors.to_vec(),
            repeated: false,
        }
    }

    pub fn from_category(category: FaultCategory) -> Self {
        let detectors = category.detectors();
        Self::new(category, detectors)
    }

    pub fn repeated(mut self) -> Self {
        self.repeated = true;
        self
    }
}

impl fmt::Display for Expected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let detectors: Vec<_> = self.detectors.iter().map(Sanitizer::report_name).collect();
        write!(f, "{} from {}", self.category, detectors.join(" or "))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub sanitizer: Sanitizer,
    pub category: FaultCategory,
    pub log: CrashLog,
}

impl Finding {
    pub fn from_log(log: CrashLog) -> Self {
        Self {
            sanitizer: Sanitizer::from_report_name(&log.sanitizer),
            category: FaultCategory::from_fault_type(&log.fault_type),
            log,
        }
    }

    /// Identifies repeated reports of the same fault at the same site.
    pub fn fingerprint(&self) -> String {
        let kind = [self.log.sanitizer.as_str(), self.log.fault_type.as_str()];
        let frames = self
            .log
            .minimized_stack_function_lines
            .iter()
            .map(String::as_str);

        digest_iter(kind.into_iter().chain(frames), None)
    }

    pub fn race_accesses(&self) -> Option<&[RaceAccess]> {
        match &self.log.access {
            Some(AccessDetails::Race { accesses }) => Some(accesses.as_slice()),
            _ => None,
        }
    }

    pub fn misalignment(&self) -> Option<&Misalignment> {
        match &self.log.access {
            Some(AccessDetails::Misaligned(misalignment)) => Some(misalignment),
            _ => None,
        }
    }

    pub fn is_conflicting_race(&self) -> bool {
        self.race_accesses().map_or(false, is_conflicting_pair)
    }

    /// Category and detector match, and any access details the detector
    /// printed agree with the category.
    pub fn confirms(&self, expected: &Expected) -> bool {
        if self.category != expected.category || !expected.detectors.contains(&self.sanitizer) {
            return false;
        }

        match &self.log.access {
            Some(AccessDetails::Race { accesses }) => is_conflicting_pair(accesses),
            Some(AccessDetails::OutOfBounds(oob)) => oob.is_outside_region(),
            Some(AccessDetails::Misaligned(misalignment)) => misalignment.is_misaligned(),
            None => true,
        }
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.sanitizer, self.category)
    }
}

fn report_start() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(
            r"(?m)^(?:==\d+==\s*(?:ERROR|WARNING): \w+Sanitizer|WARNING: ThreadSanitizer:|\S+:\d+:\d+: runtime error:|thread '[^']*'(?: \(\d+\))? panicked at )",
        )
        .expect("report start regex")
    })
}

/// Splits detector output into individual reports and classifies each.
///
/// Identical reports are collapsed. Blocks that look like a report but
/// can't be parsed are skipped with a warning.
pub fn parse_findings(text: &str) -> Vec<Finding> {
    let starts: Vec<usize> = report_start().find_iter(text).map(|m| m.start()).collect();
    let ends = starts.iter().skip(1).copied().chain(iter::once(text.len()));

    let mut seen = HashSet::new();
    let mut findings = vec![];

    for (start, end) in starts.iter().copied().zip(ends) {
        let block = &text[start..end];
        match CrashLog::parse(block.to_string()) {
            Ok(crash_log) => {
                let finding = Finding::from_log(crash_log);
                if seen.insert(finding.fingerprint()) {
                    log::debug!("finding: {finding}");
                    findings.push(finding);
                } else {
                    log::debug!("duplicate finding: {finding}");
                }
            }
            Err(err) => log::warn!("skipping unparseable report at offset {start}: {err}"),
        }
    }

    findings
}

/// Checks that detector output holds exactly the expected finding and
/// nothing unrelated.
pub fn verify(text: &str, expected: &Expected) -> Result<Finding> {
    let mut findings = parse_findings(text);

    let unexpected = |found: &Finding| ReportError::UnexpectedFinding {
        expected: expected.clone(),
        found: found.to_string(),
    };

    match findings.len() {
        0 => Err(ReportError::NoFindings),
        1 => {
            let finding = findings.remove(0);
            if finding.confirms(expected) {
                Ok(finding)
            } else {
                Err(unexpected(&finding))
            }
        }
        _ if expected.repeated => match findings.iter().find(|x| !x.confirms(expected)) {
            Some(bad) => Err(unexpected(bad)),
            None => Ok(findings.remove(0)),
        },
        count => {
            let found: Vec<_> = findings.iter().map(ToString::to_string).collect();
            Err(ReportError::TooManyFindings {
                count,
                found: found.join(", "),
            })
        }
    }
}
