#![forbid(unsafe_code)]

//! Decides whether a test case runs against the probed system under test.
//!
//! Tags are checked first, then every declared requirement is expanded into
//! rules through a fixed table and evaluated against the capability map.

use rh_probe::{CapabilityKey, CapabilityMap};
use rh_spec::{SKIP_TAG, TestSpec};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Capability values accepted as an enabled flag.
pub const ENABLED_VALUES: [&str; 5] = ["YES", "yes", "True", "true", "1"];

pub const MISSING_TAG_MESSAGE: &str = "Test missing required tag.";
pub const MARKED_SKIP_MESSAGE: &str = "Test was marked as skipped";

/// Run-level selection: tag filter (logical OR) and capability keys whose
/// rules are treated as satisfied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFilter {
    pub tags: BTreeSet<String>,
    pub ignore_requirements: BTreeSet<String>,
}

impl RunFilter {
    /// Build from the comma-separated command-line forms.
    #[must_use]
    pub fn from_lists(tags: &str, ignore_requirements: &str) -> Self {
        Self {
            tags: parse_comma_separated_set(tags),
            ignore_requirements: parse_comma_separated_set(ignore_requirements),
        }
    }

    fn ignores(&self, capability: CapabilityKey) -> bool {
        self.ignore_requirements.contains(capability.as_str())
            || self.ignore_requirements.contains(capability.family())
    }
}

/// Split `a,b,c` into a set. An empty string is the empty set.
#[must_use]
pub fn parse_comma_separated_set(arg: &str) -> BTreeSet<String> {
    if arg.is_empty() {
        return BTreeSet::new();
    }
    arg.split(',').map(str::to_owned).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Check {
    EnabledFlag,
    /// The capability quantity must reach the threshold. `None` when the
    /// requirement value is not a quantity; such a rule never passes.
    AtLeast { threshold: Option<f64> },
    /// Every element of a list capability must reach the threshold.
    EachAtLeast { threshold: Option<f64> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckKind {
    EnabledFlag,
    AtLeast,
    EachAtLeast,
}

struct RuleTemplate {
    requirement: &'static str,
    capability: CapabilityKey,
    kind: CheckKind,
    message: &'static str,
}

const RULE_TABLE: [RuleTemplate; 7] = [
    RuleTemplate {
        requirement: "matlab_support",
        capability: CapabilityKey::Matlab,
        kind: CheckKind::EnabledFlag,
        message: "MATLAB support required.",
    },
    RuleTemplate {
        requirement: "python_support",
        capability: CapabilityKey::Python,
        kind: CheckKind::EnabledFlag,
        message: "Python support required.",
    },
    RuleTemplate {
        requirement: "julia_support",
        capability: CapabilityKey::Julia,
        kind: CheckKind::EnabledFlag,
        message: "Julia support required.",
    },
    RuleTemplate {
        requirement: "system_memory",
        capability: CapabilityKey::Memory,
        kind: CheckKind::AtLeast,
        message: "Not enough system memory.",
    },
    RuleTemplate {
        requirement: "gpu_support",
        capability: CapabilityKey::Cuda,
        kind: CheckKind::EnabledFlag,
        message: "CUDA support required.",
    },
    RuleTemplate {
        requirement: "gpu_support",
        capability: CapabilityKey::CudaDevices,
        kind: CheckKind::EachAtLeast,
        message: "Not enough CUDA devices.",
    },
    RuleTemplate {
        requirement: "gpu_memory",
        capability: CapabilityKey::CudaMemory,
        kind: CheckKind::EachAtLeast,
        message: "Not enough graphics memory.",
    },
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rule {
    pub requirement: &'static str,
    pub capability: CapabilityKey,
    pub check: Check,
    pub message: &'static str,
}

impl Rule {
    #[must_use]
    pub fn is_satisfied(&self, capabilities: &CapabilityMap) -> bool {
        match self.check {
            Check::EnabledFlag => capabilities
                .single(self.capability)
                .is_some_and(is_enabled),
            Check::AtLeast { threshold } => threshold.is_some_and(|threshold| {
                capabilities
                    .single(self.capability)
                    .and_then(parse_quantity)
                    .is_some_and(|available| threshold <= available)
            }),
            Check::EachAtLeast { threshold } => threshold.is_some_and(|threshold| {
                capabilities
                    .list(self.capability)
                    .iter()
                    .all(|value| parse_quantity(value).is_some_and(|available| threshold <= available))
            }),
        }
    }
}

#[must_use]
pub fn is_enabled(value: &str) -> bool {
    ENABLED_VALUES.contains(&value)
}

/// Parse a quantity such as `8192 MB` or `4000`, dropping a trailing unit.
#[must_use]
pub fn parse_quantity(value: &str) -> Option<f64> {
    let number = value
        .trim()
        .trim_end_matches(|ch: char| ch.is_ascii_alphabetic())
        .trim_end();
    number.parse::<f64>().ok().filter(|parsed| parsed.is_finite())
}

/// Threshold for a count-style rule. A bare enabled flag (`gpu_support: true`)
/// asks for at least one.
fn parse_threshold(value: &str) -> Option<f64> {
    parse_quantity(value).or_else(|| is_enabled(value).then_some(1.0))
}

/// Expand declared requirements into rules, in table order. Unknown
/// requirement keys produce no rule.
#[must_use]
pub fn rules_from_requirements(requirements: &BTreeMap<String, String>) -> Vec<Rule> {
    for key in requirements.keys() {
        if !RULE_TABLE.iter().any(|template| template.requirement == key.as_str()) {
            debug!(requirement = %key, "ignoring unknown requirement");
        }
    }

    RULE_TABLE
        .iter()
        .filter_map(|template| {
            let value = requirements.get(template.requirement)?;
            let check = match template.kind {
                CheckKind::EnabledFlag => Check::EnabledFlag,
                CheckKind::AtLeast => Check::AtLeast {
                    threshold: parse_threshold(value),
                },
                CheckKind::EachAtLeast => Check::EachAtLeast {
                    threshold: parse_threshold(value),
                },
            };
            Some(Rule {
                requirement: template.requirement,
                capability: template.capability,
                check,
                message: template.message,
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum SkipKind {
    MissingTag,
    MarkedSkip,
    Requirement {
        requirement: String,
        capability: CapabilityKey,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipReason {
    pub kind: SkipKind,
    pub message: String,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Proceed,
    Skip(SkipReason),
}

impl GateDecision {
    #[must_use]
    pub fn is_proceed(&self) -> bool {
        matches!(self, Self::Proceed)
    }
}

/// Decide whether `spec` runs. The first failing condition, in order (tag
/// filter, skip tag, requirement rules in table order), names the reason.
#[must_use]
pub fn evaluate(spec: &TestSpec, capabilities: &CapabilityMap, filter: &RunFilter) -> GateDecision {
    if !filter.tags.is_empty() && spec.tags.is_disjoint(&filter.tags) {
        return GateDecision::Skip(SkipReason {
            kind: SkipKind::MissingTag,
            message: MISSING_TAG_MESSAGE.to_owned(),
        });
    }

    if spec.has_tag(SKIP_TAG) {
        return GateDecision::Skip(SkipReason {
            kind: SkipKind::MarkedSkip,
            message: MARKED_SKIP_MESSAGE.to_owned(),
        });
    }

    for rule in rules_from_requirements(&spec.requirements) {
        if filter.ignores(rule.capability) {
            debug!(case = %spec.id(), capability = %rule.capability, "requirement ignored");
            continue;
        }
        if !rule.is_satisfied(capabilities) {
            return GateDecision::Skip(SkipReason {
                kind: SkipKind::Requirement {
                    requirement: rule.requirement.to_owned(),
                    capability: rule.capability,
                },
                message: rule.message.to_owned(),
            });
        }
    }

    GateDecision::Proceed
}

#[cfg(test)]
mod tests {
    use super::{
        Check, GateDecision, MISSING_TAG_MESSAGE, RunFilter, SkipKind, evaluate, parse_quantity,
        parse_comma_separated_set, rules_from_requirements,
    };
    use proptest::prelude::*;
    use rh_probe::{CapabilityKey, CapabilityMap};
    use rh_spec::{Job, TestSpec};
    use std::collections::{BTreeMap, BTreeSet};

    fn job() -> Job {
        Job {
            name: "reconstruction".to_owned(),
            datafile: "in.h5".to_owned(),
            checksum: "c".to_owned(),
            configurations: vec!["default.xml".to_owned()],
            args: vec![String::new()],
            output_group: None,
            measurement: None,
            data_conversion_flag: String::new(),
            parameter_xml: String::new(),
            parameter_xsl: String::new(),
        }
    }

    fn spec(tags: &[&str], requirements: &[(&str, &str)]) -> TestSpec {
        TestSpec {
            filename: "case.yml".to_owned(),
            name: "case".to_owned(),
            tags: tags.iter().map(|tag| (*tag).to_owned()).collect(),
            requirements: requirements
                .iter()
                .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
                .collect(),
            dependency: None,
            reconstruction: job(),
            validations: Vec::new(),
        }
    }

    fn capabilities() -> CapabilityMap {
        CapabilityMap::new()
            .with_single(CapabilityKey::Memory, "8192 MB")
            .with_single(CapabilityKey::Python, "YES")
            .with_single(CapabilityKey::Julia, "NO")
            .with_single(CapabilityKey::Matlab, "NO")
            .with_single(CapabilityKey::Cuda, "NO")
            .with_list(CapabilityKey::CudaDevices, Vec::<String>::new())
            .with_list(CapabilityKey::CudaMemory, Vec::<String>::new())
    }

    fn skip_message(decision: GateDecision) -> String {
        match decision {
            GateDecision::Skip(reason) => reason.message,
            GateDecision::Proceed => panic!("expected a skip"),
        }
    }

    #[test]
    fn memory_requirement_compares_megabytes() {
        let filter = RunFilter::default();
        let enough = spec(&[], &[("system_memory", "4000")]);
        assert!(evaluate(&enough, &capabilities(), &filter).is_proceed());

        let too_much = spec(&[], &[("system_memory", "16000")]);
        assert_eq!(
            skip_message(evaluate(&too_much, &capabilities(), &filter)),
            "Not enough system memory."
        );
    }

    #[test]
    fn tag_filter_is_logical_or() {
        let filter = RunFilter::from_lists("fast", "");
        let slow = spec(&["slow"], &[]);
        assert_eq!(
            skip_message(evaluate(&slow, &capabilities(), &filter)),
            MISSING_TAG_MESSAGE
        );

        let fast_gpu = spec(&["fast", "gpu"], &[("gpu_support", "1")]);
        let decision = evaluate(&fast_gpu, &capabilities(), &filter);
        assert_eq!(skip_message(decision), "CUDA support required.");
    }

    #[test]
    fn skip_tag_wins_over_passing_requirements() {
        let marked = spec(&["skip"], &[]);
        let GateDecision::Skip(reason) = evaluate(&marked, &capabilities(), &RunFilter::default())
        else {
            panic!("expected a skip");
        };
        assert_eq!(reason.kind, SkipKind::MarkedSkip);
    }

    #[test]
    fn ignored_capability_rules_are_not_evaluated() {
        let gpu = spec(&[], &[("gpu_support", "true"), ("matlab_support", "true")]);
        let filter = RunFilter::from_lists("", "cuda,matlab");
        assert!(evaluate(&gpu, &capabilities(), &filter).is_proceed());

        let only_cuda = RunFilter::from_lists("", "cuda");
        assert_eq!(
            skip_message(evaluate(&gpu, &capabilities(), &only_cuda)),
            "MATLAB support required."
        );
    }

    #[test]
    fn gpu_support_expands_into_two_rules() {
        let requirements = BTreeMap::from([("gpu_support".to_owned(), "2".to_owned())]);
        let rules = rules_from_requirements(&requirements);
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].check, Check::EnabledFlag);
        assert_eq!(rules[1].capability, CapabilityKey::CudaDevices);

        let caps = capabilities()
            .with_single(CapabilityKey::Cuda, "YES")
            .with_list(CapabilityKey::CudaDevices, ["1"]);
        let gpu = spec(&[], &[("gpu_support", "2")]);
        assert_eq!(
            skip_message(evaluate(&gpu, &caps, &RunFilter::default())),
            "Not enough CUDA devices."
        );
    }

    #[test]
    fn gpu_memory_checks_every_device() {
        let caps = capabilities().with_list(CapabilityKey::CudaMemory, ["16000 MB", "8000 MB"]);
        let needs_12g = spec(&[], &[("gpu_memory", "12000")]);
        assert_eq!(
            skip_message(evaluate(&needs_12g, &caps, &RunFilter::default())),
            "Not enough graphics memory."
        );
        let needs_4g = spec(&[], &[("gpu_memory", "4000")]);
        assert!(evaluate(&needs_4g, &caps, &RunFilter::default()).is_proceed());
    }

    #[test]
    fn unparsable_threshold_never_passes() {
        let odd = spec(&[], &[("system_memory", "plenty")]);
        assert!(!evaluate(&odd, &capabilities(), &RunFilter::default()).is_proceed());
    }

    #[test]
    fn quantities_drop_unit_suffix() {
        assert_eq!(parse_quantity("8192 MB"), Some(8192.0));
        assert_eq!(parse_quantity("4000"), Some(4000.0));
        assert_eq!(parse_quantity(" 1.5GB "), Some(1.5));
        assert_eq!(parse_quantity("MB"), None);
    }

    #[test]
    fn comma_separated_sets() {
        assert!(parse_comma_separated_set("").is_empty());
        assert_eq!(
            parse_comma_separated_set("a,b,a"),
            BTreeSet::from(["a".to_owned(), "b".to_owned()])
        );
    }

    fn requirement_strategy() -> impl Strategy<Value = Vec<(String, String)>> {
        let keys = prop::sample::subsequence(
            vec![
                "matlab_support",
                "python_support",
                "julia_support",
                "system_memory",
                "gpu_support",
                "gpu_memory",
            ],
            0..=6,
        );
        (keys, prop::collection::vec(0u32..20_000, 6)).prop_map(|(keys, amounts)| {
            keys.into_iter()
                .zip(amounts)
                .map(|(key, amount)| {
                    let value = if key.ends_with("_support") {
                        "true".to_owned()
                    } else {
                        amount.to_string()
                    };
                    (key.to_owned(), value)
                })
                .collect()
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(rh_test_utils::property_test_case_count()))]

        #[test]
        fn prop_decision_is_conjunction_of_rules(reqs in requirement_strategy(), reverse in any::<bool>()) {
            let caps = capabilities()
                .with_single(CapabilityKey::Cuda, "YES")
                .with_list(CapabilityKey::CudaDevices, ["2"])
                .with_list(CapabilityKey::CudaMemory, ["12000 MB"]);
            let mut ordered = reqs.clone();
            if reverse {
                ordered.reverse();
            }
            let forward = spec(&[], &reqs.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect::<Vec<_>>());
            let backward = spec(&[], &ordered.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect::<Vec<_>>());

            let decision = evaluate(&forward, &caps, &RunFilter::default());
            prop_assert_eq!(&decision, &evaluate(&backward, &caps, &RunFilter::default()));

            let all_pass = rules_from_requirements(&forward.requirements)
                .iter()
                .all(|rule| rule.is_satisfied(&caps));
            prop_assert_eq!(decision.is_proceed(), all_pass);
        }
    }
}
