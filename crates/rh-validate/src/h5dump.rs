//! [`DatasetReader`] that shells out to `h5dump`.
//!
//! The header query (`-H`) yields the element type and dataspace; a second
//! invocation dumps the raw little-endian elements (`-b LE`) into a scratch
//! file that is decoded here. Compound two-member types are treated as
//! complex numbers and reduced to their real part, the way a float32 cast
//! of a complex array behaves.

use crate::{DatasetReader, ImageArray, ValidationError};
use regex::Regex;
use rh_probe::ToolCommand;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Output;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
}

impl ElementType {
    /// Map an HDF5 predefined type name (`H5T_STD_I16LE`, `H5T_IEEE_F32BE`).
    #[must_use]
    pub fn from_h5_type(name: &str) -> Option<Self> {
        let base = name
            .strip_suffix("LE")
            .or_else(|| name.strip_suffix("BE"))
            .unwrap_or(name);
        let element = match base {
            "H5T_STD_I8" => Self::I8,
            "H5T_STD_U8" => Self::U8,
            "H5T_STD_I16" => Self::I16,
            "H5T_STD_U16" => Self::U16,
            "H5T_STD_I32" => Self::I32,
            "H5T_STD_U32" => Self::U32,
            "H5T_STD_I64" => Self::I64,
            "H5T_STD_U64" => Self::U64,
            "H5T_IEEE_F32" => Self::F32,
            "H5T_IEEE_F64" => Self::F64,
            _ => return None,
        };
        Some(element)
    }

    #[must_use]
    pub fn size(self) -> usize {
        match self {
            Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::I64 | Self::U64 | Self::F64 => 8,
        }
    }

    /// Decode one little-endian element. `bytes` holds exactly `size()` bytes.
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    fn decode(self, bytes: &[u8]) -> f32 {
        match self {
            Self::I8 => f32::from(i8::from_le_bytes(le(bytes))),
            Self::U8 => f32::from(bytes[0]),
            Self::I16 => f32::from(i16::from_le_bytes(le(bytes))),
            Self::U16 => f32::from(u16::from_le_bytes(le(bytes))),
            Self::I32 => i32::from_le_bytes(le(bytes)) as f32,
            Self::U32 => u32::from_le_bytes(le(bytes)) as f32,
            Self::I64 => i64::from_le_bytes(le(bytes)) as f32,
            Self::U64 => u64::from_le_bytes(le(bytes)) as f32,
            Self::F32 => f32::from_le_bytes(le(bytes)),
            Self::F64 => f64::from_le_bytes(le(bytes)) as f32,
        }
    }
}

fn le<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0_u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetHeader {
    pub element: ElementType,
    /// Members per element: 1 for scalars, 2 for complex compounds.
    pub components: usize,
    pub shape: Vec<usize>,
}

impl DatasetHeader {
    #[must_use]
    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Parse the output of `h5dump -H -d <dataset> <file>`.
pub fn parse_header(text: &str) -> Result<DatasetHeader, String> {
    let (element, components) = if text.contains("H5T_COMPOUND") {
        let member = Regex::new(r#"(H5T_[A-Z0-9_]+)\s+"[^"]*"\s*;"#).map_err(|err| err.to_string())?;
        let members = member
            .captures_iter(text)
            .map(|caps| caps[1].to_owned())
            .collect::<Vec<_>>();
        let Some(first) = members.first() else {
            return Err("compound type without members".to_owned());
        };
        if members.iter().any(|name| name != first) {
            return Err(format!("compound members of mixed types: {members:?}"));
        }
        let element = ElementType::from_h5_type(first)
            .ok_or_else(|| format!("unsupported compound member type {first}"))?;
        (element, members.len())
    } else {
        let datatype = Regex::new(r"DATATYPE\s+(H5T_[A-Z0-9_]+)").map_err(|err| err.to_string())?;
        let caps = datatype
            .captures(text)
            .ok_or_else(|| "no DATATYPE in header".to_owned())?;
        let element = ElementType::from_h5_type(&caps[1])
            .ok_or_else(|| format!("unsupported element type {}", &caps[1]))?;
        (element, 1)
    };

    let simple = Regex::new(r"DATASPACE\s+SIMPLE\s*\{\s*\(\s*([0-9,\s]+?)\s*\)")
        .map_err(|err| err.to_string())?;
    let shape = if let Some(caps) = simple.captures(text) {
        caps[1]
            .split(',')
            .map(|dim| {
                dim.trim()
                    .parse::<usize>()
                    .map_err(|err| format!("invalid dimension '{}': {err}", dim.trim()))
            })
            .collect::<Result<Vec<_>, _>>()?
    } else if text.contains("SCALAR") {
        Vec::new()
    } else {
        return Err("no DATASPACE in header".to_owned());
    };

    Ok(DatasetHeader {
        element,
        components,
        shape,
    })
}

/// Decode the raw dump of a dataset, keeping the first member of each
/// compound element.
pub fn decode_elements(bytes: &[u8], header: &DatasetHeader) -> Result<Vec<f32>, String> {
    let size = header.element.size();
    let stride = size * header.components.max(1);
    let expected = header.element_count() * stride;
    if bytes.len() != expected {
        return Err(format!(
            "expected {expected} bytes for {} elements, found {}",
            header.element_count(),
            bytes.len()
        ));
    }
    Ok(bytes
        .chunks_exact(stride)
        .map(|chunk| header.element.decode(&chunk[..size]))
        .collect())
}

/// `/<group>/data`, the dataset holding an image group's pixels.
#[must_use]
pub fn dataset_path(group: &str) -> String {
    format!("/{}/data", group.trim_matches('/'))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct H5DumpReader {
    tool: ToolCommand,
}

impl Default for H5DumpReader {
    fn default() -> Self {
        Self::new(ToolCommand::new("h5dump"))
    }
}

impl H5DumpReader {
    #[must_use]
    pub fn new(tool: ToolCommand) -> Self {
        Self { tool }
    }

    fn invoke(&self, args: &[&OsStr]) -> std::io::Result<Output> {
        self.tool.command().args(args).output()
    }
}

impl DatasetReader for H5DumpReader {
    fn read(&self, file: &Path, group: &str) -> Result<ImageArray, ValidationError> {
        let read_error = |detail: String| ValidationError::DatasetRead {
            file: file.to_path_buf(),
            group: group.to_owned(),
            detail,
        };
        if !file.is_file() {
            return Err(read_error("file not found".to_owned()));
        }
        let dataset = dataset_path(group);

        let header = self
            .invoke(&[
                OsStr::new("-H"),
                OsStr::new("-d"),
                OsStr::new(&dataset),
                file.as_os_str(),
            ])
            .map_err(|err| read_error(format!("failed to run {}: {err}", self.tool)))?;
        if !header.status.success() {
            let text = combined_output(&header);
            if text.contains(&dataset) {
                return Err(ValidationError::MissingGroup {
                    file: file.to_path_buf(),
                    group: group.to_owned(),
                });
            }
            return Err(read_error(text.trim().to_owned()));
        }
        let parsed = parse_header(&String::from_utf8_lossy(&header.stdout)).map_err(read_error)?;

        let dump = tempfile::NamedTempFile::new()
            .map_err(|err| read_error(format!("failed to create dump file: {err}")))?;
        let dump_path: PathBuf = dump.path().to_path_buf();
        let binary = self
            .invoke(&[
                OsStr::new("-d"),
                OsStr::new(&dataset),
                OsStr::new("-b"),
                OsStr::new("LE"),
                OsStr::new("-o"),
                dump_path.as_os_str(),
                file.as_os_str(),
            ])
            .map_err(|err| read_error(format!("failed to run {}: {err}", self.tool)))?;
        if !binary.status.success() {
            return Err(read_error(combined_output(&binary).trim().to_owned()));
        }

        let bytes = std::fs::read(&dump_path)
            .map_err(|err| read_error(format!("failed to read dump: {err}")))?;
        let data = decode_elements(&bytes, &parsed).map_err(read_error)?;
        tracing::debug!(
            file = %file.display(),
            dataset = %dataset,
            shape = ?parsed.shape,
            "read dataset"
        );
        ImageArray::new(parsed.shape, data).map_err(read_error)
    }
}

fn combined_output(output: &Output) -> String {
    format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    )
}
