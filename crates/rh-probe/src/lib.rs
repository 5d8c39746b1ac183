#![forbid(unsafe_code)]

//! Capability introspection of the system under test.
//!
//! The reconstruction binary prints a build report when invoked with its info
//! flag. The report is parsed into an immutable [`CapabilityMap`] once per run
//! and shared read-only with every gate evaluation afterwards.

pub mod command;

pub use command::{ToolCommand, split_command_line};

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Trailing part of every capability line: `<Marker> : <value>`.
pub const VALUE_PATTERN: &str = r"(?:\s*):(?:\s+)(?P<value>.*)";

pub const DEFAULT_INFO_FLAG: &str = "--info";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKey {
    Version,
    Build,
    Memory,
    Python,
    Julia,
    Matlab,
    Cuda,
    CudaDevices,
    CudaMemory,
}

impl CapabilityKey {
    /// Keys whose marker must appear at least once; the first match wins.
    pub const SINGULAR: [Self; 7] = [
        Self::Version,
        Self::Build,
        Self::Memory,
        Self::Python,
        Self::Julia,
        Self::Matlab,
        Self::Cuda,
    ];

    /// Keys collected from every matching line, possibly none.
    pub const PLURAL: [Self; 2] = [Self::CudaDevices, Self::CudaMemory];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Version => "version",
            Self::Build => "build",
            Self::Memory => "memory",
            Self::Python => "python",
            Self::Julia => "julia",
            Self::Matlab => "matlab",
            Self::Cuda => "cuda",
            Self::CudaDevices => "cuda_devices",
            Self::CudaMemory => "cuda_memory",
        }
    }

    /// Report marker text preceding the value.
    #[must_use]
    pub fn marker(self) -> &'static str {
        match self {
            Self::Version => "Version",
            Self::Build => "Git SHA1",
            Self::Memory => "System Memory size",
            Self::Python => "Python Support",
            Self::Julia => "Julia Support",
            Self::Matlab => "Matlab Support",
            Self::Cuda => "CUDA Support",
            Self::CudaDevices => "Number of CUDA capable devices",
            Self::CudaMemory => "Total amount of global GPU memory",
        }
    }

    /// Name under which the key can be ignored. The device list shares the
    /// `cuda` family with the support flag.
    #[must_use]
    pub fn family(self) -> &'static str {
        match self {
            Self::CudaDevices => Self::Cuda.as_str(),
            other => other.as_str(),
        }
    }

    #[must_use]
    pub fn is_plural(self) -> bool {
        Self::PLURAL.contains(&self)
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::SINGULAR
            .into_iter()
            .chain(Self::PLURAL)
            .find(|key| key.as_str() == name)
    }
}

impl std::fmt::Display for CapabilityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CapabilityValue {
    Single(String),
    List(Vec<String>),
}

impl CapabilityValue {
    /// Values as a slice: one element for a single value.
    #[must_use]
    pub fn values(&self) -> &[String] {
        match self {
            Self::Single(value) => std::slice::from_ref(value),
            Self::List(values) => values,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityMap {
    values: BTreeMap<CapabilityKey, CapabilityValue>,
}

impl CapabilityMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_single(mut self, key: CapabilityKey, value: impl Into<String>) -> Self {
        self.values
            .insert(key, CapabilityValue::Single(value.into()));
        self
    }

    #[must_use]
    pub fn with_list<I, S>(mut self, key: CapabilityKey, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.values.insert(
            key,
            CapabilityValue::List(values.into_iter().map(Into::into).collect()),
        );
        self
    }

    #[must_use]
    pub fn get(&self, key: CapabilityKey) -> Option<&CapabilityValue> {
        self.values.get(&key)
    }

    /// The single value of `key`, or the first element of a list.
    #[must_use]
    pub fn single(&self, key: CapabilityKey) -> Option<&str> {
        self.get(key)
            .and_then(|value| value.values().first())
            .map(String::as_str)
    }

    /// Every value of `key`; empty when the key is absent.
    #[must_use]
    pub fn list(&self, key: CapabilityKey) -> &[String] {
        match self.get(key) {
            Some(value) => value.values(),
            None => &[],
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (CapabilityKey, &CapabilityValue)> {
        self.values.iter().map(|(key, value)| (*key, value))
    }
}

#[derive(Debug)]
pub enum ProbeError {
    Spawn {
        command: String,
        source: std::io::Error,
    },
    Failed {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
    MissingCapability {
        marker: &'static str,
        report: String,
    },
    InvalidPattern(regex::Error),
}

impl std::fmt::Display for ProbeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spawn { command, source } => {
                write!(f, "failed to launch capability query `{command}`: {source}")
            }
            Self::Failed {
                command,
                status,
                stderr,
            } => write!(
                f,
                "capability query `{command}` failed (status={status:?})\nstderr:\n{stderr}"
            ),
            Self::MissingCapability { marker, report } => write!(
                f,
                "failed to parse capability '{marker}' from report:\n{report}"
            ),
            Self::InvalidPattern(err) => write!(f, "invalid capability pattern: {err}"),
        }
    }
}

impl std::error::Error for ProbeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Spawn { source, .. } => Some(source),
            Self::InvalidPattern(err) => Some(err),
            _ => None,
        }
    }
}

impl From<regex::Error> for ProbeError {
    fn from(value: regex::Error) -> Self {
        Self::InvalidPattern(value)
    }
}

fn marker_regex(key: CapabilityKey) -> Result<Regex, regex::Error> {
    RegexBuilder::new(&format!("{}{VALUE_PATTERN}", regex::escape(key.marker())))
        .case_insensitive(true)
        .build()
}

/// Parse a capability report. Singular keys take their first match and are
/// required; plural keys collect every match in encounter order.
pub fn parse_capability_report(report: &str) -> Result<CapabilityMap, ProbeError> {
    let mut map = CapabilityMap::new();

    for key in CapabilityKey::SINGULAR {
        let pattern = marker_regex(key)?;
        let value = pattern
            .captures(report)
            .map(|captures| captured_value(&captures))
            .ok_or_else(|| ProbeError::MissingCapability {
                marker: key.marker(),
                report: report.to_owned(),
            })?;
        map = map.with_single(key, value);
    }

    for key in CapabilityKey::PLURAL {
        let pattern = marker_regex(key)?;
        let values = pattern
            .captures_iter(report)
            .map(|captures| captured_value(&captures))
            .collect::<Vec<_>>();
        map = map.with_list(key, values);
    }

    Ok(map)
}

fn captured_value(captures: &regex::Captures<'_>) -> String {
    captures
        .name("value")
        .map(|value| value.as_str().trim_end().to_owned())
        .unwrap_or_default()
}

/// Invokes the system under test with its info flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityProbe {
    pub command: ToolCommand,
    pub info_flag: String,
}

impl CapabilityProbe {
    #[must_use]
    pub fn new(command: ToolCommand) -> Self {
        Self {
            command,
            info_flag: DEFAULT_INFO_FLAG.to_owned(),
        }
    }

    /// Run the query once and parse its report. The report is read from the
    /// diagnostic stream, followed by standard output.
    pub fn run(&self) -> Result<CapabilityMap, ProbeError> {
        let rendered = self.command.render([&self.info_flag]);
        debug!(command = %rendered, "querying capabilities");

        let output = self
            .command
            .command()
            .arg(&self.info_flag)
            .output()
            .map_err(|source| ProbeError::Spawn {
                command: rendered.clone(),
                source,
            })?;

        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() {
            return Err(ProbeError::Failed {
                command: rendered,
                status: output.status.code(),
                stderr,
            });
        }

        let mut report = stderr;
        report.push_str(&String::from_utf8_lossy(&output.stdout));
        let capabilities = parse_capability_report(&report)?;
        info!(
            version = capabilities.single(CapabilityKey::Version).unwrap_or_default(),
            build = capabilities.single(CapabilityKey::Build).unwrap_or_default(),
            "capabilities probed"
        );
        Ok(capabilities)
    }
}
