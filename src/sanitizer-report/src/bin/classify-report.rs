// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use sanitizer_report::{parse_findings, verify, Expected, FaultCategory, Sanitizer};

#[derive(Parser, Debug)]
#[command(about = "Parse and classify sanitizer reports")]
struct Opt {
    /// Files holding captured detector output
    #[arg(required = true, num_args = 1..)]
    reports: Vec<PathBuf>,

    /// Fail unless each file holds exactly one finding of this category
    #[arg(long, value_enum)]
    expect: Option<CategoryArg>,

    /// Detectors allowed to report the expected finding [default: the
    /// category's usual detectors]
    #[arg(long, value_enum, value_delimiter = ',', requires = "expect")]
    detector: Vec<DetectorArg>,

    /// Accept several distinct findings as long as all match
    #[arg(long, requires = "expect")]
    repeated: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, clap::ValueEnum)]
enum CategoryArg {
    HeapBufferOverflow,
    StackUseAfterReturn,
    StackUseAfterScope,
    DataRace,
    MisalignedAccess,
}

impl From<CategoryArg> for FaultCategory {
    fn from(arg: CategoryArg) -> Self {
        match arg {
            CategoryArg::HeapBufferOverflow => FaultCategory::HeapBufferOverflow,
            CategoryArg::StackUseAfterReturn => FaultCategory::StackUseAfterReturn,
            CategoryArg::StackUseAfterScope => FaultCategory::StackUseAfterScope,
            CategoryArg::DataRace => FaultCategory::DataRace,
            CategoryArg::MisalignedAccess => FaultCategory::MisalignedAccess,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, clap::ValueEnum)]
enum DetectorArg {
    Address,
    Thread,
    UndefinedBehavior,
    RustRuntime,
}

impl From<DetectorArg> for Sanitizer {
    fn from(arg: DetectorArg) -> Self {
        match arg {
            DetectorArg::Address => Sanitizer::Address,
            DetectorArg::Thread => Sanitizer::Thread,
            DetectorArg::UndefinedBehavior => Sanitizer::UndefinedBehavior,
            DetectorArg::RustRuntime => Sanitizer::RustRuntime,
        }
    }
}

impl Opt {
    fn expected(&self) -> Option<Expected> {
        let category = FaultCategory::from(self.expect?);

        let mut expected = if self.detector.is_empty() {
            Expected::from_category(category)
        } else {
            let detectors: Vec<Sanitizer> = self.detector.iter().copied().map(Into::into).collect();
            Expected::new(category, &detectors)
        };

        if self.repeated {
            expected = expected.repeated();
        }

        Some(expected)
    }
}

fn main() -> Result<()> {
    let opt = Opt::parse();

    env_logger::init();

    let expected = opt.expected();

    for path in &opt.reports {
        let data = fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?
            .replace("\r\n", "\n");

        eprintln!("{}", path.display());

        match &expected {
            Some(expected) => {
                let finding = verify(&data, expected)
                    .with_context(|| format!("verifying {}", path.display()))?;
                log::info!("{}: {finding}", path.display());
                println!("{}", serde_json::to_string_pretty(&finding)?);
            }
            None => {
                let findings = parse_findings(&data);
                log::info!("{}: {} finding(s)", path.display(), findings.len());
                println!("{}", serde_json::to_string_pretty(&findings)?);
            }
        }
    }

    Ok(())
}
