#![forbid(unsafe_code)]

/// Shell stand-ins for the external toolchain, for tests only.
#[cfg(any(test, feature = "fakes"))]
pub mod fake_tools;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const CASE_LOG_SCHEMA_VERSION: &str = "reconharness.case-log.v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseResult {
    Pass,
    Fail,
    Skip,
}

impl CaseResult {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Skip => "skip",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseLogEnv {
    pub harness_version: String,
    pub os: String,
    pub arch: String,
    pub timestamp_unix_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CasePhaseTimings {
    pub fetch_ms: u64,
    pub prepare_ms: u64,
    pub execute_ms: u64,
    pub validate_ms: u64,
}

/// One line of the run log: the outcome of a single case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseLogV1 {
    pub schema_version: String,
    pub case_id: String,
    /// Digest of the case definition, so a log line can be matched to the
    /// exact revision of the case file that produced it.
    pub fixture_id: String,
    pub env: CaseLogEnv,
    pub artifact_refs: Vec<String>,
    pub result: CaseResult,
    pub duration_ms: u64,
    pub details: Option<String>,
    pub phase_timings: CasePhaseTimings,
}

impl CaseLogV1 {
    #[must_use]
    pub fn new(case_id: impl Into<String>, fixture_id: impl Into<String>, result: CaseResult) -> Self {
        Self {
            schema_version: CASE_LOG_SCHEMA_VERSION.to_owned(),
            case_id: case_id.into(),
            fixture_id: fixture_id.into(),
            env: capture_env(),
            artifact_refs: Vec::new(),
            result,
            duration_ms: 0,
            details: None,
            phase_timings: CasePhaseTimings::default(),
        }
    }

    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

#[must_use]
pub fn capture_env() -> CaseLogEnv {
    CaseLogEnv {
        harness_version: env!("CARGO_PKG_VERSION").to_owned(),
        os: std::env::consts::OS.to_owned(),
        arch: std::env::consts::ARCH.to_owned(),
        timestamp_unix_ms: now_unix_ms_u64(),
    }
}

pub fn fixture_id_from_json<T: Serialize>(fixture: &T) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(fixture)?;
    let digest = Sha256::digest(&bytes);
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

/// Milliseconds in `duration`, saturating.
#[must_use]
pub fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[must_use]
pub fn property_test_case_count() -> u32 {
    if let Ok(raw) = std::env::var("RH_PROPTEST_CASES")
        && let Ok(parsed) = raw.parse::<u32>()
        && parsed > 0
    {
        return parsed;
    }

    if std::env::var_os("CI").is_some() {
        1024
    } else {
        256
    }
}

fn now_unix_ms_u64() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|duration| u64::try_from(duration.as_millis()).ok())
        .unwrap_or(0)
}
