#![forbid(unsafe_code)]

//! End-to-end orchestration: discover case files, probe the toolchain once,
//! gate every case, then fetch, process and validate the ones that run.

pub mod config;
pub mod orchestrator;
pub mod report;

pub use config::{DEFAULT_DATA_HOST, HarnessConfig, default_cache_path};
pub use orchestrator::Harness;
pub use report::{
    CaseReport, SUITE_REPORT_SCHEMA_VERSION, SuiteReport, append_run_log, emit_suite_json,
    emit_suite_markdown,
};

use rh_cache::{FetchAttemptError, FetchError};
use rh_pipeline::ProcessError;
use rh_probe::ProbeError;
use rh_spec::SpecParseError;
use rh_validate::ValidationError;
use std::path::PathBuf;

/// Failure of a single case. Never aborts the rest of the run.
#[derive(Debug)]
pub enum CaseError {
    Spec(SpecParseError),
    Fetch(FetchError),
    Process(ProcessError),
    Validation(ValidationError),
    Scratch {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for CaseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spec(err) => write!(f, "malformed case file: {err}"),
            Self::Fetch(err) => write!(f, "fetch failed: {err}"),
            Self::Process(err) => write!(f, "process failed: {err}"),
            Self::Validation(err) => write!(f, "validation failed: {err}"),
            Self::Scratch { path, source } => {
                write!(f, "scratch directory {} unusable: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for CaseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Spec(err) => Some(err),
            Self::Fetch(err) => Some(err),
            Self::Process(err) => Some(err),
            Self::Validation(err) => Some(err),
            Self::Scratch { source, .. } => Some(source),
        }
    }
}

impl From<SpecParseError> for CaseError {
    fn from(value: SpecParseError) -> Self {
        Self::Spec(value)
    }
}

impl From<FetchError> for CaseError {
    fn from(value: FetchError) -> Self {
        Self::Fetch(value)
    }
}

impl From<ProcessError> for CaseError {
    fn from(value: ProcessError) -> Self {
        Self::Process(value)
    }
}

impl From<ValidationError> for CaseError {
    fn from(value: ValidationError) -> Self {
        Self::Validation(value)
    }
}

/// Run-level failure: nothing executes once one of these is raised.
#[derive(Debug)]
pub enum HarnessError {
    Probe(ProbeError),
    CasesNotFound { root: PathBuf },
    HttpClient(FetchAttemptError),
    Report {
        path: PathBuf,
        source: std::io::Error,
    },
    Serialize(serde_json::Error),
}

impl std::fmt::Display for HarnessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Probe(err) => write!(f, "capability probe failed: {err}"),
            Self::CasesNotFound { root } => {
                write!(f, "case directory {} does not exist", root.display())
            }
            Self::HttpClient(err) => write!(f, "failed to build http client: {err}"),
            Self::Report { path, source } => {
                write!(f, "failed to write report {}: {source}", path.display())
            }
            Self::Serialize(err) => write!(f, "failed to serialize report: {err}"),
        }
    }
}

impl std::error::Error for HarnessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Probe(err) => Some(err),
            Self::HttpClient(err) => Some(err),
            Self::Report { source, .. } => Some(source),
            Self::Serialize(err) => Some(err),
            Self::CasesNotFound { .. } => None,
        }
    }
}

impl From<ProbeError> for HarnessError {
    fn from(value: ProbeError) -> Self {
        Self::Probe(value)
    }
}

impl From<serde_json::Error> for HarnessError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialize(value)
    }
}
