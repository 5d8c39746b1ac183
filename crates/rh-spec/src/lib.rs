#![forbid(unsafe_code)]

//! Test-case model for the reconstruction end-to-end harness.
//!
//! A case file declares one or more [`TestSpec`]s. Each spec names the jobs to
//! run through the reconstruction pipeline and the validations to apply to the
//! resulting dataset. Specs are immutable once parsed.

pub mod loader;

pub use loader::{
    SpecDiscovery, collect_spec_files, discover_specs, load_spec_file, load_specs,
    parse_spec_documents,
};

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::{BTreeMap, BTreeSet};

pub const DEFAULT_PARAMETER_XML: &str = "IsmrmrdParameterMap_Siemens.xml";
pub const DEFAULT_PARAMETER_XSL: &str = "IsmrmrdParameterMap_Siemens.xsl";

/// Tag that unconditionally skips a case.
pub const SKIP_TAG: &str = "skip";

/// One data-processing invocation: an input dataset pushed through a chain of
/// reconstruction stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub name: String,
    pub datafile: String,
    pub checksum: String,
    /// Stage configuration names, index-aligned with `args`.
    pub configurations: Vec<String>,
    pub args: Vec<String>,
    pub output_group: Option<String>,
    /// Sub-measurement index; when present the raw input is converted first.
    pub measurement: Option<String>,
    pub data_conversion_flag: String,
    pub parameter_xml: String,
    pub parameter_xsl: String,
}

impl Job {
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.configurations.len()
    }

    /// `(configuration, args)` pairs in pipeline order. A stage without
    /// matching args gets an empty string.
    pub fn stages(&self) -> impl Iterator<Item = (&str, &str)> {
        self.configurations
            .iter()
            .enumerate()
            .map(|(index, configuration)| {
                let args = self.args.get(index).map_or("", String::as_str);
                (configuration.as_str(), args)
            })
    }

    #[must_use]
    pub fn needs_raw_conversion(&self) -> bool {
        self.measurement.is_some()
    }

    fn to_document(&self) -> Value {
        let mut map = Mapping::new();
        insert(&mut map, "data", Value::String(self.datafile.clone()));
        insert(&mut map, "checksum", Value::String(self.checksum.clone()));
        let stages = self.stages().collect::<Vec<_>>();
        if let [(configuration, args)] = stages.as_slice() {
            insert(
                &mut map,
                "configuration",
                Value::String((*configuration).to_owned()),
            );
            insert(&mut map, "args", Value::String((*args).to_owned()));
        } else {
            let stream = stages
                .into_iter()
                .map(|(configuration, args)| {
                    let mut stage = Mapping::new();
                    insert(
                        &mut stage,
                        "configuration",
                        Value::String(configuration.to_owned()),
                    );
                    insert(&mut stage, "args", Value::String(args.to_owned()));
                    Value::Mapping(stage)
                })
                .collect();
            insert(&mut map, "stream", Value::Sequence(stream));
        }
        if let Some(group) = &self.output_group {
            insert(&mut map, "output_group", Value::String(group.clone()));
        }
        if let Some(measurement) = &self.measurement {
            insert(&mut map, "measurement", Value::String(measurement.clone()));
        }
        insert(
            &mut map,
            "data_conversion_flag",
            Value::String(self.data_conversion_flag.clone()),
        );
        insert(
            &mut map,
            "parameter_xml",
            Value::String(self.parameter_xml.clone()),
        );
        insert(
            &mut map,
            "parameter_xsl",
            Value::String(self.parameter_xsl.clone()),
        );
        Value::Mapping(map)
    }
}

/// One output-versus-reference comparison performed after a job completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Validation {
    pub reference: String,
    pub checksum: String,
    pub reference_image: String,
    pub output_image: String,
    pub scale_comparison_threshold: f64,
    pub value_comparison_threshold: f64,
    pub disable_image_header_test: bool,
}

impl Validation {
    fn to_document(&self) -> Value {
        let mut map = Mapping::new();
        insert(&mut map, "reference", Value::String(self.reference.clone()));
        insert(&mut map, "checksum", Value::String(self.checksum.clone()));
        insert(
            &mut map,
            "reference_image",
            Value::String(self.reference_image.clone()),
        );
        insert(
            &mut map,
            "output_image",
            Value::String(self.output_image.clone()),
        );
        insert(
            &mut map,
            "scale_comparison_threshold",
            Value::Number(self.scale_comparison_threshold.into()),
        );
        insert(
            &mut map,
            "value_comparison_threshold",
            Value::Number(self.value_comparison_threshold.into()),
        );
        insert(
            &mut map,
            "disable_image_header_test",
            Value::Bool(self.disable_image_header_test),
        );
        Value::Mapping(map)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestSpec {
    /// Case file the spec came from, relative to the discovery root.
    pub filename: String,
    pub name: String,
    pub tags: BTreeSet<String>,
    /// Requirement key to required value, values kept in their textual form.
    pub requirements: BTreeMap<String, String>,
    pub dependency: Option<Job>,
    pub reconstruction: Job,
    pub validations: Vec<Validation>,
}

impl TestSpec {
    /// Identity used for deduplication and reporting: `filename::name`.
    #[must_use]
    pub fn id(&self) -> String {
        format!("{}::{}", self.filename, self.name)
    }

    #[must_use]
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// Every job of the case in execution order: dependency first.
    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.dependency
            .iter()
            .chain(std::iter::once(&self.reconstruction))
    }

    /// Serialize back into the case-file schema. Parsing the result with
    /// [`parse_spec_documents`] under the same filename yields an equal spec.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        let mut map = Mapping::new();
        insert(&mut map, "name", Value::String(self.name.clone()));
        insert(
            &mut map,
            "tags",
            Value::Sequence(self.tags.iter().cloned().map(Value::String).collect()),
        );
        let mut requirements = Mapping::new();
        for (key, value) in &self.requirements {
            insert(&mut requirements, key, Value::String(value.clone()));
        }
        insert(&mut map, "requirements", Value::Mapping(requirements));
        if let Some(dependency) = &self.dependency {
            insert(&mut map, "dependency", dependency.to_document());
        }
        insert(&mut map, "reconstruction", self.reconstruction.to_document());
        insert(
            &mut map,
            "validation",
            Value::Sequence(self.validations.iter().map(Validation::to_document).collect()),
        );
        serde_yaml::to_string(&Value::Mapping(map))
    }
}

fn insert(map: &mut Mapping, key: &str, value: Value) {
    map.insert(Value::String(key.to_owned()), value);
}

#[derive(Debug)]
pub enum SpecParseErrorKind {
    Io(std::io::Error),
    Yaml(String),
    Empty,
    MissingKey { key: String },
    InvalidKey { key: String, detail: String },
    DuplicateIdentity { id: String },
}

/// A malformed case file. Always names the file and, where relevant, the
/// offending key as a dotted path (`reconstruction.checksum`).
#[derive(Debug)]
pub struct SpecParseError {
    pub file: String,
    pub kind: SpecParseErrorKind,
}

impl SpecParseError {
    pub(crate) fn missing(file: &str, key: impl Into<String>) -> Self {
        Self {
            file: file.to_owned(),
            kind: SpecParseErrorKind::MissingKey { key: key.into() },
        }
    }

    pub(crate) fn invalid(file: &str, key: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            file: file.to_owned(),
            kind: SpecParseErrorKind::InvalidKey {
                key: key.into(),
                detail: detail.into(),
            },
        }
    }

    /// The key named by the error, if any.
    #[must_use]
    pub fn key(&self) -> Option<&str> {
        match &self.kind {
            SpecParseErrorKind::MissingKey { key } | SpecParseErrorKind::InvalidKey { key, .. } => {
                Some(key)
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for SpecParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            SpecParseErrorKind::Io(err) => write!(f, "{}: io error: {err}", self.file),
            SpecParseErrorKind::Yaml(detail) => write!(f, "{}: invalid yaml: {detail}", self.file),
            SpecParseErrorKind::Empty => write!(f, "{}: file declares no test case", self.file),
            SpecParseErrorKind::MissingKey { key } => {
                write!(f, "{}: missing '{key}' key", self.file)
            }
            SpecParseErrorKind::InvalidKey { key, detail } => {
                write!(f, "{}: invalid '{key}': {detail}", self.file)
            }
            SpecParseErrorKind::DuplicateIdentity { id } => {
                write!(f, "{}: duplicate test case identity '{id}'", self.file)
            }
        }
    }
}

impl std::error::Error for SpecParseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            SpecParseErrorKind::Io(err) => Some(err),
            _ => None,
        }
    }
}
