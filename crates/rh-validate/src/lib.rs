#![forbid(unsafe_code)]

//! Output-versus-reference comparison.
//!
//! Both datasets are read as float32 arrays, singleton dimensions removed and
//! flattened. Two metrics decide the outcome:
//!
//! * `norm_diff = ||output - reference|| / ||reference||`
//! * `scale = (output . output) / (output . reference)`
//!
//! Accumulation happens in f64 so large images do not lose precision.

pub mod h5dump;

pub use h5dump::{ElementType, H5DumpReader};

use rh_spec::Validation;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageArray {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl ImageArray {
    /// Fails when the element count does not match the shape.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self, String> {
        let expected = shape.iter().product::<usize>();
        if expected != data.len() {
            return Err(format!(
                "shape {shape:?} holds {expected} elements, got {}",
                data.len()
            ));
        }
        Ok(Self { shape, data })
    }

    #[must_use]
    pub fn from_vec(data: Vec<f32>) -> Self {
        Self {
            shape: vec![data.len()],
            data,
        }
    }

    /// Shape with every length-one dimension removed.
    #[must_use]
    pub fn squeezed_shape(&self) -> Vec<usize> {
        self.shape.iter().copied().filter(|&dim| dim != 1).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    MissingGroup {
        file: PathBuf,
        group: String,
    },
    DatasetRead {
        file: PathBuf,
        group: String,
        detail: String,
    },
    ShapeMismatch {
        output_shape: Vec<usize>,
        reference_shape: Vec<usize>,
    },
    NonFinite {
        norm_diff: f64,
        scale: f64,
    },
    ValueThreshold {
        norm_diff: f64,
        threshold: f64,
    },
    ScaleThreshold {
        scale: f64,
        deviation: f64,
        threshold: f64,
    },
    Header {
        detail: String,
    },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingGroup { file, group } => write!(
                f,
                "Did not find group '{group}' in file {}",
                file.display()
            ),
            Self::DatasetRead {
                file,
                group,
                detail,
            } => write!(
                f,
                "failed to read group '{group}' from {}: {detail}",
                file.display()
            ),
            Self::ShapeMismatch {
                output_shape,
                reference_shape,
            } => write!(
                f,
                "output shape {output_shape:?} is incompatible with reference shape {reference_shape:?}"
            ),
            Self::NonFinite { norm_diff, scale } => write!(
                f,
                "comparison metrics are not finite: norm diff {norm_diff}, scale {scale}"
            ),
            Self::ValueThreshold {
                norm_diff,
                threshold,
            } => write!(
                f,
                "Comparing values, norm diff: {norm_diff} (threshold: {threshold})"
            ),
            Self::ScaleThreshold {
                scale,
                deviation,
                threshold,
            } => write!(
                f,
                "Comparing image scales, ratio: {scale} ({deviation}) (threshold: {threshold})"
            ),
            Self::Header { detail } => write!(f, "image header mismatch: {detail}"),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Source of named arrays inside persisted output/reference files.
pub trait DatasetReader: Send + Sync {
    /// Read the array stored at `<group>/data` in `file`.
    fn read(&self, file: &Path, group: &str) -> Result<ImageArray, ValidationError>;
}

/// Structural comparison of image headers, run unless a validation disables it.
pub trait HeaderCheck: Send + Sync {
    fn check(
        &self,
        output: &Path,
        output_group: &str,
        reference: &Path,
        reference_group: &str,
    ) -> Result<(), ValidationError>;
}

/// Accepts every header pair.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHeaderCheck;

impl HeaderCheck for NoHeaderCheck {
    fn check(&self, _: &Path, _: &str, _: &Path, _: &str) -> Result<(), ValidationError> {
        Ok(())
    }
}

/// Which threshold the scale deviation `|1 - scale|` is held to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleThresholdPolicy {
    /// The value threshold, as the established suites were tuned against.
    #[default]
    Legacy,
    /// The case's own scale threshold.
    Scale,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComparisonMetrics {
    pub norm_diff: f64,
    pub scale: f64,
}

impl ComparisonMetrics {
    #[must_use]
    pub fn scale_deviation(&self) -> f64 {
        (1.0 - self.scale).abs()
    }
}

/// Compute the comparison metrics of two arrays. The arrays must hold the
/// same number of elements once flattened.
pub fn compare_arrays(
    output: &ImageArray,
    reference: &ImageArray,
) -> Result<ComparisonMetrics, ValidationError> {
    if output.len() != reference.len() {
        return Err(ValidationError::ShapeMismatch {
            output_shape: output.squeezed_shape(),
            reference_shape: reference.squeezed_shape(),
        });
    }
    if output.squeezed_shape() != reference.squeezed_shape() {
        tracing::debug!(
            output = ?output.squeezed_shape(),
            reference = ?reference.squeezed_shape(),
            "comparing arrays of equal size but different shape"
        );
    }

    let mut diff_sq = 0.0_f64;
    let mut reference_sq = 0.0_f64;
    let mut output_sq = 0.0_f64;
    let mut cross = 0.0_f64;
    for (&out, &expected) in output.data.iter().zip(&reference.data) {
        let out = f64::from(out);
        let expected = f64::from(expected);
        let diff = out - expected;
        diff_sq += diff * diff;
        reference_sq += expected * expected;
        output_sq += out * out;
        cross += out * expected;
    }

    Ok(ComparisonMetrics {
        norm_diff: diff_sq.sqrt() / reference_sq.sqrt(),
        scale: output_sq / cross,
    })
}

/// Hold the metrics to the thresholds: values first, then scale.
pub fn check_thresholds(
    metrics: &ComparisonMetrics,
    scale_threshold: f64,
    value_threshold: f64,
    policy: ScaleThresholdPolicy,
) -> Result<(), ValidationError> {
    if !metrics.norm_diff.is_finite() || !metrics.scale.is_finite() {
        return Err(ValidationError::NonFinite {
            norm_diff: metrics.norm_diff,
            scale: metrics.scale,
        });
    }
    if value_threshold < metrics.norm_diff {
        return Err(ValidationError::ValueThreshold {
            norm_diff: metrics.norm_diff,
            threshold: value_threshold,
        });
    }
    let threshold = match policy {
        ScaleThresholdPolicy::Legacy => value_threshold,
        ScaleThresholdPolicy::Scale => scale_threshold,
    };
    let deviation = metrics.scale_deviation();
    if threshold < deviation {
        return Err(ValidationError::ScaleThreshold {
            scale: metrics.scale,
            deviation,
            threshold,
        });
    }
    Ok(())
}

/// One comparison to perform: where the two arrays live and how close they
/// must be.
#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    pub output_path: PathBuf,
    pub output_group: String,
    pub reference_path: PathBuf,
    pub reference_group: String,
    pub scale_threshold: f64,
    pub value_threshold: f64,
    pub check_header: bool,
}

impl Comparison {
    #[must_use]
    pub fn for_validation(validation: &Validation, output_path: &Path, reference_path: &Path) -> Self {
        Self {
            output_path: output_path.to_path_buf(),
            output_group: validation.output_image.clone(),
            reference_path: reference_path.to_path_buf(),
            reference_group: validation.reference_image.clone(),
            scale_threshold: validation.scale_comparison_threshold,
            value_threshold: validation.value_comparison_threshold,
            check_header: !validation.disable_image_header_test,
        }
    }
}

#[derive(Clone)]
pub struct Validator {
    reader: Arc<dyn DatasetReader>,
    header: Arc<dyn HeaderCheck>,
    policy: ScaleThresholdPolicy,
}

impl std::fmt::Debug for Validator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Validator")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl Validator {
    #[must_use]
    pub fn new(reader: Arc<dyn DatasetReader>) -> Self {
        Self {
            reader,
            header: Arc::new(NoHeaderCheck),
            policy: ScaleThresholdPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_header_check(mut self, header: Arc<dyn HeaderCheck>) -> Self {
        self.header = header;
        self
    }

    #[must_use]
    pub fn with_policy(mut self, policy: ScaleThresholdPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn policy(&self) -> ScaleThresholdPolicy {
        self.policy
    }

    pub fn validate(&self, comparison: &Comparison) -> Result<ComparisonMetrics, ValidationError> {
        let output = self
            .reader
            .read(&comparison.output_path, &comparison.output_group)?;
        let reference = self
            .reader
            .read(&comparison.reference_path, &comparison.reference_group)?;

        let metrics = compare_arrays(&output, &reference)?;
        tracing::info!(
            output_group = %comparison.output_group,
            norm_diff = metrics.norm_diff,
            scale = metrics.scale,
            "compared output with reference"
        );
        check_thresholds(
            &metrics,
            comparison.scale_threshold,
            comparison.value_threshold,
            self.policy,
        )?;

        if comparison.check_header {
            self.header.check(
                &comparison.output_path,
                &comparison.output_group,
                &comparison.reference_path,
                &comparison.reference_group,
            )?;
        }
        Ok(metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::{
        Comparison, ComparisonMetrics, DatasetReader, HeaderCheck, ImageArray,
        ScaleThresholdPolicy, ValidationError, Validator, check_thresholds, compare_arrays,
    };
    use proptest::prelude::*;
    use std::collections::BTreeMap;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MapReader(BTreeMap<(PathBuf, String), ImageArray>);

    impl DatasetReader for MapReader {
        fn read(&self, file: &Path, group: &str) -> Result<ImageArray, ValidationError> {
            self.0
                .get(&(file.to_path_buf(), group.to_owned()))
                .cloned()
                .ok_or_else(|| ValidationError::MissingGroup {
                    file: file.to_path_buf(),
                    group: group.to_owned(),
                })
        }
    }

    struct CountingHeader(AtomicUsize);

    impl HeaderCheck for CountingHeader {
        fn check(&self, _: &Path, _: &str, _: &Path, _: &str) -> Result<(), ValidationError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn reference() -> ImageArray {
        ImageArray::new(vec![1, 2, 3], vec![1.0, -2.0, 3.0, 4.5, 0.5, 6.0]).expect("shape")
    }

    fn scaled(factor: f32) -> ImageArray {
        let base = reference();
        ImageArray {
            shape: vec![2, 3],
            data: base.data.iter().map(|v| v * factor).collect(),
        }
    }

    fn validator_for(output: ImageArray) -> (Validator, Comparison) {
        let mut arrays = BTreeMap::new();
        arrays.insert((PathBuf::from("out.h5"), "img".to_owned()), output);
        arrays.insert((PathBuf::from("ref.h5"), "ref_img".to_owned()), reference());
        let comparison = Comparison {
            output_path: PathBuf::from("out.h5"),
            output_group: "img".to_owned(),
            reference_path: PathBuf::from("ref.h5"),
            reference_group: "ref_img".to_owned(),
            scale_threshold: 0.01,
            value_threshold: 0.01,
            check_header: true,
        };
        (Validator::new(Arc::new(MapReader(arrays))), comparison)
    }

    #[test]
    fn identical_arrays_pass_any_positive_threshold() {
        let metrics = compare_arrays(&reference(), &reference()).expect("comparable");
        assert_eq!(metrics.norm_diff, 0.0);
        assert!((metrics.scale - 1.0).abs() < 1e-12);
        for threshold in [1e-9, 0.01, 10.0] {
            assert!(
                check_thresholds(&metrics, threshold, threshold, ScaleThresholdPolicy::Legacy)
                    .is_ok()
            );
        }
    }

    #[test]
    fn doubled_output_fails_below_unit_value_threshold() {
        let metrics = compare_arrays(&scaled(2.0), &reference()).expect("comparable");
        assert!((metrics.scale - 2.0).abs() < 1e-9);
        assert!((metrics.scale_deviation() - 1.0).abs() < 1e-9);
        assert!((metrics.norm_diff - 1.0).abs() < 1e-9);

        for threshold in [0.1, 0.5, 0.99] {
            assert!(
                check_thresholds(&metrics, 100.0, threshold, ScaleThresholdPolicy::Legacy)
                    .is_err()
            );
        }
        assert!(check_thresholds(&metrics, 100.0, 1.5, ScaleThresholdPolicy::Legacy).is_ok());
    }

    #[test]
    fn legacy_policy_holds_scale_to_value_threshold() {
        let metrics = ComparisonMetrics {
            norm_diff: 0.0,
            scale: 2.0,
        };
        let err = check_thresholds(&metrics, 5.0, 0.5, ScaleThresholdPolicy::Legacy)
            .expect_err("legacy uses value threshold");
        assert_eq!(
            err,
            ValidationError::ScaleThreshold {
                scale: 2.0,
                deviation: 1.0,
                threshold: 0.5,
            }
        );
        assert!(check_thresholds(&metrics, 5.0, 0.5, ScaleThresholdPolicy::Scale).is_ok());
    }

    #[test]
    fn scale_policy_holds_scale_to_scale_threshold() {
        let metrics = compare_arrays(&scaled(1.05), &reference()).expect("comparable");
        assert!(check_thresholds(&metrics, 0.01, 0.1, ScaleThresholdPolicy::Legacy).is_ok());
        assert!(matches!(
            check_thresholds(&metrics, 0.01, 0.1, ScaleThresholdPolicy::Scale),
            Err(ValidationError::ScaleThreshold { .. })
        ));
    }

    #[test]
    fn value_check_runs_before_scale_check() {
        let metrics = ComparisonMetrics {
            norm_diff: 0.5,
            scale: 3.0,
        };
        assert!(matches!(
            check_thresholds(&metrics, 0.1, 0.1, ScaleThresholdPolicy::Legacy),
            Err(ValidationError::ValueThreshold { .. })
        ));
    }

    #[test]
    fn zero_reference_is_not_finite() {
        let zeros = ImageArray::from_vec(vec![0.0; 4]);
        let metrics = compare_arrays(&zeros, &zeros).expect("comparable");
        assert!(matches!(
            check_thresholds(&metrics, 1.0, 1.0, ScaleThresholdPolicy::Legacy),
            Err(ValidationError::NonFinite { .. })
        ));
    }

    #[test]
    fn singleton_dimensions_are_ignored_but_sizes_must_match() {
        let output = ImageArray::new(vec![1, 6, 1], reference().data).expect("shape");
        assert!(compare_arrays(&output, &reference()).is_ok());

        let short = ImageArray::from_vec(vec![1.0, 2.0]);
        assert_eq!(
            compare_arrays(&short, &reference()),
            Err(ValidationError::ShapeMismatch {
                output_shape: vec![2],
                reference_shape: vec![2, 3],
            })
        );
    }

    #[test]
    fn image_array_checks_element_count() {
        assert!(ImageArray::new(vec![2, 2], vec![1.0; 3]).is_err());
        assert_eq!(
            ImageArray::new(vec![1, 4, 1], vec![0.0; 4])
                .expect("shape")
                .squeezed_shape(),
            vec![4]
        );
    }

    #[test]
    fn validator_reads_both_groups_and_runs_header_hook() {
        let (validator, comparison) = validator_for(reference());
        let header = Arc::new(CountingHeader(AtomicUsize::new(0)));
        let validator = validator.with_header_check(Arc::clone(&header) as Arc<dyn HeaderCheck>);

        let metrics = validator.validate(&comparison).expect("identical output");
        assert_eq!(metrics.norm_diff, 0.0);
        assert_eq!(header.0.load(Ordering::SeqCst), 1);

        let disabled = Comparison {
            check_header: false,
            ..comparison
        };
        validator.validate(&disabled).expect("identical output");
        assert_eq!(header.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_group_names_file_and_group() {
        let (validator, mut comparison) = validator_for(reference());
        comparison.output_group = "absent".to_owned();
        let err = validator.validate(&comparison).expect_err("missing");
        assert_eq!(err.to_string(), "Did not find group 'absent' in file out.h5");
    }

    #[test]
    fn validator_defaults_to_legacy_policy() {
        let (validator, _) = validator_for(reference());
        assert_eq!(validator.policy(), ScaleThresholdPolicy::Legacy);
        assert_eq!(
            validator
                .with_policy(ScaleThresholdPolicy::Scale)
                .policy(),
            ScaleThresholdPolicy::Scale
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(rh_test_utils::property_test_case_count()))]

        #[test]
        fn metrics_are_invariant_under_uniform_positive_scaling_of_both(
            values in prop::collection::vec(0.5_f32..100.0, 1..64),
            factor in 0.5_f32..4.0,
        ) {
            let base = ImageArray::from_vec(values.clone());
            let both = ImageArray::from_vec(values.iter().map(|v| v * factor).collect());
            let metrics = compare_arrays(&both, &both).expect("comparable");
            prop_assert!(metrics.norm_diff.abs() < 1e-12);
            prop_assert!((metrics.scale - 1.0).abs() < 1e-9);

            let rescaled = compare_arrays(&both, &base).expect("comparable");
            let factor = f64::from(factor);
            prop_assert!((rescaled.scale - factor).abs() < 1e-3 * factor);
        }
    }
}
