use rh_gate::SkipReason;
use rh_test_utils::{CaseLogV1, CaseResult};
use rh_validate::ComparisonMetrics;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;

pub const SUITE_REPORT_SCHEMA_VERSION: &str = "reconharness.suite-report.v1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseReport {
    pub case_id: String,
    pub result: CaseResult,
    /// Skip reason or failure description.
    pub details: Option<String>,
    pub skip: Option<SkipReason>,
    /// One entry per validation that ran, in declaration order.
    pub metrics: Vec<ComparisonMetrics>,
    pub log: CaseLogV1,
}

impl CaseReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.result == CaseResult::Pass
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteReport {
    pub schema_version: String,
    pub total_cases: usize,
    pub passed_cases: usize,
    pub failed_cases: usize,
    pub skipped_cases: usize,
    pub cases: Vec<CaseReport>,
}

impl SuiteReport {
    #[must_use]
    pub fn from_cases(cases: Vec<CaseReport>) -> Self {
        let count = |result| cases.iter().filter(|case| case.result == result).count();
        Self {
            schema_version: SUITE_REPORT_SCHEMA_VERSION.to_owned(),
            total_cases: cases.len(),
            passed_cases: count(CaseResult::Pass),
            failed_cases: count(CaseResult::Fail),
            skipped_cases: count(CaseResult::Skip),
            cases,
        }
    }

    /// No case failed. Skipped cases do not count against the run.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed_cases == 0
    }

    #[must_use]
    pub fn case(&self, case_id: &str) -> Option<&CaseReport> {
        self.cases.iter().find(|case| case.case_id == case_id)
    }
}

pub fn emit_suite_json(report: &SuiteReport) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(report)
}

#[must_use]
pub fn emit_suite_markdown(report: &SuiteReport) -> String {
    let mut out = String::new();
    out.push_str("# End-to-End Suite Report\n\n");
    out.push_str("| Metric | Value |\n");
    out.push_str("|---|---|\n");
    out.push_str(&format!("| Schema | `{}` |\n", report.schema_version));
    out.push_str(&format!("| Total Cases | {} |\n", report.total_cases));
    out.push_str(&format!("| Passed | {} |\n", report.passed_cases));
    out.push_str(&format!("| Failed | {} |\n", report.failed_cases));
    out.push_str(&format!("| Skipped | {} |\n\n", report.skipped_cases));

    out.push_str("| Case ID | Result | Duration (ms) | Details |\n");
    out.push_str("|---|---|---|---|\n");
    for case in &report.cases {
        out.push_str(&format!(
            "| {} | {} | {} | {} |\n",
            case.case_id,
            case.result.as_str(),
            case.log.duration_ms,
            markdown_cell(case.details.as_deref().unwrap_or(""))
        ));
    }

    out
}

/// First line of `text`, with table delimiters escaped.
fn markdown_cell(text: &str) -> String {
    text.lines().next().unwrap_or("").replace('|', "\\|")
}

/// Append one JSON line per case to `path`.
pub fn append_run_log(path: &Path, cases: &[CaseReport]) -> std::io::Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    for case in cases {
        let line = case.log.to_json_line().map_err(std::io::Error::other)?;
        file.write_all(line.as_bytes())?;
    }
    file.flush()
}
