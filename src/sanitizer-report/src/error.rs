// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::num::ParseIntError;

use thiserror::Error;

use crate::Expected;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("unable to parse crash log summary")]
    UnrecognizedSummary,

    #[error("invalid number `{value}` in line `{line}`")]
    InvalidNumber {
        line: String,
        value: String,
        #[source]
        source: ParseIntError,
    },

    #[error("detector output contains no findings")]
    NoFindings,

    #[error("expected exactly one finding, found {count}: {found}")]
    TooManyFindings { count: usize, found: String },

    #[error("expected {expected}, found {found}")]
    UnexpectedFinding { expected: Expected, found: String },
}

pub(crate) fn parse_hex(line: &str, value: &str) -> Result<u64, ReportError> {
    u64::from_str_radix(value, 16).map_err(|source| ReportError::InvalidNumber {
        line: line.to_string(),
        value: value.to_string(),
        source,
    })
}

pub(crate) fn parse_dec(line: &str, value: &str) -> Result<u64, ReportError> {
    value.parse().map_err(|source| ReportError::InvalidNumber {
        line: line.to_string(),
        value: value.to_string(),
        source,
    })
}
