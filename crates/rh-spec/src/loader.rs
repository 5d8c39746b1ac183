//! Case-file discovery and parsing.

use crate::{
    DEFAULT_PARAMETER_XML, DEFAULT_PARAMETER_XSL, Job, SpecParseError, SpecParseErrorKind,
    TestSpec, Validation,
};
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Result of a lenient discovery pass: every spec that parsed, plus one
/// error per file (or duplicate identity) that did not.
#[derive(Debug, Default)]
pub struct SpecDiscovery {
    pub specs: Vec<TestSpec>,
    pub errors: Vec<SpecParseError>,
}

const SPEC_EXTENSIONS: [&str; 2] = ["yml", "yaml"];

fn is_spec_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| SPEC_EXTENSIONS.contains(&ext))
}

/// Case files under `root`, recursively, sorted by path. Unreadable
/// directories are skipped.
#[must_use]
pub fn collect_spec_files(root: &Path) -> Vec<PathBuf> {
    let mut pending = vec![root.to_path_buf()];
    let mut found = Vec::new();
    while let Some(dir) = pending.pop() {
        let Ok(entries) = fs::read_dir(&dir) else {
            debug!(dir = %dir.display(), "skipping unreadable case directory");
            continue;
        };
        for path in entries.filter_map(Result::ok).map(|entry| entry.path()) {
            if path.is_dir() {
                pending.push(path);
            } else if is_spec_file(&path) {
                found.push(path);
            }
        }
    }
    found.sort();
    found
}

/// Load every case under `root`. The first malformed file or duplicate
/// identity fails the whole load.
pub fn load_specs(root: &Path) -> Result<Vec<TestSpec>, SpecParseError> {
    if !root.is_dir() {
        return Err(SpecParseError {
            file: root.display().to_string(),
            kind: SpecParseErrorKind::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "case directory does not exist",
            )),
        });
    }

    let mut specs = Vec::new();
    for path in collect_spec_files(root) {
        specs.extend(load_spec_file(root, &path)?);
    }
    specs.sort_by_key(TestSpec::id);

    if let Some(pair) = specs.windows(2).find(|pair| pair[0].id() == pair[1].id()) {
        return Err(SpecParseError {
            file: pair[1].filename.clone(),
            kind: SpecParseErrorKind::DuplicateIdentity { id: pair[1].id() },
        });
    }
    Ok(specs)
}

/// Load every case under `root`, isolating failures to the file that caused
/// them. Duplicate identities keep the first spec seen in path order.
#[must_use]
pub fn discover_specs(root: &Path) -> SpecDiscovery {
    let mut discovery = SpecDiscovery::default();
    let mut seen = BTreeSet::new();

    for path in collect_spec_files(root) {
        match load_spec_file(root, &path) {
            Ok(specs) => {
                for spec in specs {
                    let id = spec.id();
                    if seen.insert(id.clone()) {
                        discovery.specs.push(spec);
                    } else {
                        warn!(case = %id, "dropping duplicate test case identity");
                        discovery.errors.push(SpecParseError {
                            file: spec.filename.clone(),
                            kind: SpecParseErrorKind::DuplicateIdentity { id },
                        });
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "skipping malformed case file");
                discovery.errors.push(err);
            }
        }
    }

    discovery.specs.sort_by_key(TestSpec::id);
    discovery
}

/// Parse one case file. The spec filename is the path relative to `root`,
/// with `/` separators.
pub fn load_spec_file(root: &Path, path: &Path) -> Result<Vec<TestSpec>, SpecParseError> {
    let filename = relative_name(root, path);
    let source = fs::read_to_string(path).map_err(|err| SpecParseError {
        file: filename.clone(),
        kind: SpecParseErrorKind::Io(err),
    })?;
    let specs = parse_spec_documents(&filename, &source)?;
    debug!(file = %filename, count = specs.len(), "loaded case file");
    Ok(specs)
}

fn relative_name(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|component| component.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Parse every YAML document of `source` into a spec. Empty documents are
/// ignored; a source without any spec is an error.
pub fn parse_spec_documents(filename: &str, source: &str) -> Result<Vec<TestSpec>, SpecParseError> {
    let mut specs = Vec::new();
    for document in serde_yaml::Deserializer::from_str(source) {
        let value = Value::deserialize(document).map_err(|err| SpecParseError {
            file: filename.to_owned(),
            kind: SpecParseErrorKind::Yaml(err.to_string()),
        })?;
        if value.is_null() {
            continue;
        }
        specs.push(parse_spec(filename, &value)?);
    }

    if specs.is_empty() {
        return Err(SpecParseError {
            file: filename.to_owned(),
            kind: SpecParseErrorKind::Empty,
        });
    }
    Ok(specs)
}

fn parse_spec(file: &str, value: &Value) -> Result<TestSpec, SpecParseError> {
    let root = value
        .as_mapping()
        .ok_or_else(|| SpecParseError::invalid(file, "<document>", "expected a mapping"))?;

    let name = required_string(file, root, "", "name")?;
    let tags = parse_tags(file, root.get("tags"))?;
    let requirements = parse_requirements(file, root.get("requirements"))?;

    let dependency = match root.get("dependency") {
        None | Some(Value::Null) => None,
        Some(value) => Some(parse_job(file, value, "dependency")?),
    };
    let reconstruction = match root.get("reconstruction") {
        None | Some(Value::Null) => return Err(SpecParseError::missing(file, "reconstruction")),
        Some(value) => parse_job(file, value, "reconstruction")?,
    };
    let validations = match root.get("validation") {
        None | Some(Value::Null) => return Err(SpecParseError::missing(file, "validation")),
        Some(Value::Sequence(items)) => {
            if items.is_empty() {
                return Err(SpecParseError::invalid(
                    file,
                    "validation",
                    "expected at least one validation",
                ));
            }
            items
                .iter()
                .enumerate()
                .map(|(idx, item)| parse_validation(file, item, &format!("validation[{idx}]")))
                .collect::<Result<Vec<_>, _>>()?
        }
        Some(item) => vec![parse_validation(file, item, "validation")?],
    };

    Ok(TestSpec {
        filename: file.to_owned(),
        name,
        tags,
        requirements,
        dependency,
        reconstruction,
        validations,
    })
}

fn parse_tags(file: &str, value: Option<&Value>) -> Result<BTreeSet<String>, SpecParseError> {
    match value {
        None | Some(Value::Null) => Ok(BTreeSet::new()),
        Some(Value::Sequence(items)) => items
            .iter()
            .map(|item| {
                scalar_to_string(item)
                    .ok_or_else(|| SpecParseError::invalid(file, "tags", "tags must be scalars"))
            })
            .collect(),
        Some(item) => {
            let tag = scalar_to_string(item)
                .ok_or_else(|| SpecParseError::invalid(file, "tags", "expected a list or scalar"))?;
            Ok(if tag.is_empty() {
                BTreeSet::new()
            } else {
                BTreeSet::from([tag])
            })
        }
    }
}

fn parse_requirements(
    file: &str,
    value: Option<&Value>,
) -> Result<BTreeMap<String, String>, SpecParseError> {
    let map = match value {
        None | Some(Value::Null) => return Ok(BTreeMap::new()),
        Some(Value::Mapping(map)) => map,
        Some(_) => {
            return Err(SpecParseError::invalid(
                file,
                "requirements",
                "expected a mapping",
            ));
        }
    };

    let mut requirements = BTreeMap::new();
    for (key, value) in map {
        let key = scalar_to_string(key).ok_or_else(|| {
            SpecParseError::invalid(file, "requirements", "requirement keys must be scalars")
        })?;
        let value = scalar_to_string(value).ok_or_else(|| {
            SpecParseError::invalid(
                file,
                format!("requirements.{key}"),
                "requirement values must be scalars",
            )
        })?;
        requirements.insert(key, value);
    }
    Ok(requirements)
}

fn parse_job(file: &str, value: &Value, name: &str) -> Result<Job, SpecParseError> {
    let map = value
        .as_mapping()
        .ok_or_else(|| SpecParseError::invalid(file, name, "expected a mapping"))?;

    let datafile = required_string(file, map, name, "data")?;
    let checksum = required_string(file, map, name, "checksum")?;

    let (configurations, args) = match (map.get("configuration"), map.get("stream")) {
        (Some(_), Some(_)) => {
            return Err(SpecParseError::invalid(
                file,
                name,
                "cannot declare both 'configuration' and 'stream'",
            ));
        }
        (Some(_), None) => (
            vec![required_string(file, map, name, "configuration")?],
            vec![optional_string(file, map, name, "args")?.unwrap_or_default()],
        ),
        (None, Some(stream)) => parse_stream(file, stream, name)?,
        (None, None) => return Err(SpecParseError::missing(file, format!("{name}.configuration"))),
    };

    Ok(Job {
        name: name.to_owned(),
        datafile,
        checksum,
        configurations,
        args,
        output_group: optional_string(file, map, name, "output_group")?,
        measurement: optional_string(file, map, name, "measurement")?,
        data_conversion_flag: optional_string(file, map, name, "data_conversion_flag")?
            .unwrap_or_default(),
        parameter_xml: optional_string(file, map, name, "parameter_xml")?
            .unwrap_or_else(|| DEFAULT_PARAMETER_XML.to_owned()),
        parameter_xsl: optional_string(file, map, name, "parameter_xsl")?
            .unwrap_or_else(|| DEFAULT_PARAMETER_XSL.to_owned()),
    })
}

fn parse_stream(
    file: &str,
    value: &Value,
    job: &str,
) -> Result<(Vec<String>, Vec<String>), SpecParseError> {
    let key = format!("{job}.stream");
    let items = value
        .as_sequence()
        .ok_or_else(|| SpecParseError::invalid(file, &key, "expected a list of stages"))?;
    if items.is_empty() {
        return Err(SpecParseError::invalid(
            file,
            &key,
            "expected at least one stage",
        ));
    }

    let mut configurations = Vec::with_capacity(items.len());
    let mut args = Vec::with_capacity(items.len());
    for (idx, item) in items.iter().enumerate() {
        let path = format!("{key}[{idx}]");
        let stage = item
            .as_mapping()
            .ok_or_else(|| SpecParseError::invalid(file, &path, "expected a mapping"))?;
        configurations.push(required_string(file, stage, &path, "configuration")?);
        args.push(optional_string(file, stage, &path, "args")?.unwrap_or_default());
    }
    Ok((configurations, args))
}

fn parse_validation(file: &str, value: &Value, path: &str) -> Result<Validation, SpecParseError> {
    let map = value
        .as_mapping()
        .ok_or_else(|| SpecParseError::invalid(file, path, "expected a mapping"))?;

    let disable_image_header_test = match map.get("disable_image_header_test") {
        None | Some(Value::Null) => false,
        Some(Value::Bool(flag)) => *flag,
        Some(_) => {
            return Err(SpecParseError::invalid(
                file,
                join_key(path, "disable_image_header_test"),
                "expected a boolean",
            ));
        }
    };

    Ok(Validation {
        reference: required_string(file, map, path, "reference")?,
        checksum: required_string(file, map, path, "checksum")?,
        reference_image: required_string(file, map, path, "reference_image")?,
        output_image: required_string(file, map, path, "output_image")?,
        scale_comparison_threshold: required_threshold(
            file,
            map,
            path,
            "scale_comparison_threshold",
        )?,
        value_comparison_threshold: required_threshold(
            file,
            map,
            path,
            "value_comparison_threshold",
        )?,
        disable_image_header_test,
    })
}

fn join_key(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_owned()
    } else {
        format!("{parent}.{key}")
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

fn required_string(
    file: &str,
    map: &Mapping,
    parent: &str,
    key: &str,
) -> Result<String, SpecParseError> {
    match optional_string(file, map, parent, key)? {
        Some(text) if !text.trim().is_empty() => Ok(text),
        _ => Err(SpecParseError::missing(file, join_key(parent, key))),
    }
}

fn optional_string(
    file: &str,
    map: &Mapping,
    parent: &str,
    key: &str,
) -> Result<Option<String>, SpecParseError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => scalar_to_string(value).map(Some).ok_or_else(|| {
            SpecParseError::invalid(file, join_key(parent, key), "expected a scalar value")
        }),
    }
}

fn required_threshold(
    file: &str,
    map: &Mapping,
    parent: &str,
    key: &str,
) -> Result<f64, SpecParseError> {
    let value = match map.get(key) {
        None | Some(Value::Null) => return Err(SpecParseError::missing(file, join_key(parent, key))),
        Some(value) => value,
    };
    let threshold = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    };
    match threshold {
        Some(threshold) if threshold.is_finite() && threshold > 0.0 => Ok(threshold),
        _ => Err(SpecParseError::invalid(
            file,
            join_key(parent, key),
            "expected a positive number",
        )),
    }
}
