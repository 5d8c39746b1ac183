use crate::config::HarnessConfig;
use crate::report::{CaseReport, SuiteReport};
use crate::{CaseError, HarnessError};
use rh_cache::{DataCache, Fetcher, HttpFetcher};
use rh_gate::{GateDecision, evaluate};
use rh_pipeline::Executor;
use rh_probe::{CapabilityKey, CapabilityMap, CapabilityProbe};
use rh_spec::{Job, SpecParseError, SpecParseErrorKind, TestSpec, discover_specs};
use rh_test_utils::{CaseLogV1, CasePhaseTimings, CaseResult, duration_ms, fixture_id_from_json};
use rh_validate::{
    Comparison, ComparisonMetrics, DatasetReader, H5DumpReader, HeaderCheck, NoHeaderCheck,
    Validator,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Marker in file names of the captured job logs.
const LOG_FILE_MARKER: &str = ".log.";

pub struct Harness {
    config: HarnessConfig,
    fetcher: Arc<dyn Fetcher>,
    reader: Arc<dyn DatasetReader>,
    header: Arc<dyn HeaderCheck>,
}

impl std::fmt::Debug for Harness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Harness")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Harness {
    /// Harness backed by HTTP downloads and the `h5dump` dataset reader.
    pub fn new(config: HarnessConfig) -> Result<Self, HarnessError> {
        let fetcher = HttpFetcher::with_default_timeout().map_err(HarnessError::HttpClient)?;
        let reader = H5DumpReader::new(config.h5dump.clone());
        Ok(Self {
            config,
            fetcher: Arc::new(fetcher),
            reader: Arc::new(reader),
            header: Arc::new(NoHeaderCheck),
        })
    }

    #[must_use]
    pub fn with_fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    #[must_use]
    pub fn with_reader(mut self, reader: Arc<dyn DatasetReader>) -> Self {
        self.reader = reader;
        self
    }

    #[must_use]
    pub fn with_header_check(mut self, header: Arc<dyn HeaderCheck>) -> Self {
        self.header = header;
        self
    }

    #[must_use]
    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Query the reconstruction tool for its capabilities.
    pub fn probe(&self) -> Result<CapabilityMap, HarnessError> {
        let probe = CapabilityProbe::new(self.config.toolchain.reconstruction.clone());
        let capabilities = probe.run()?;
        info!(
            version = capabilities.single(CapabilityKey::Version).unwrap_or(""),
            "probed reconstruction capabilities"
        );
        Ok(capabilities)
    }

    /// Probe once, then run every discovered case. Malformed case files are
    /// reported as failed cases; only a missing case directory or a failed
    /// probe aborts the run.
    pub fn run(&self) -> Result<SuiteReport, HarnessError> {
        if !self.config.cases_root.is_dir() {
            return Err(HarnessError::CasesNotFound {
                root: self.config.cases_root.clone(),
            });
        }

        let capabilities = self.probe()?;
        let discovery = discover_specs(&self.config.cases_root);
        info!(
            cases = discovery.specs.len(),
            malformed = discovery.errors.len(),
            root = %self.config.cases_root.display(),
            "discovered test cases"
        );

        let mut cases = discovery
            .errors
            .into_iter()
            .map(malformed_case_report)
            .collect::<Vec<_>>();
        cases.extend(self.run_specs(&discovery.specs, &capabilities));
        cases.sort_by(|left, right| left.case_id.cmp(&right.case_id));
        Ok(SuiteReport::from_cases(cases))
    }

    /// Run `specs` on the configured number of workers. Reports come back in
    /// the order of `specs`.
    #[must_use]
    pub fn run_specs(&self, specs: &[TestSpec], capabilities: &CapabilityMap) -> Vec<CaseReport> {
        let cache = DataCache::new(
            self.config
                .cache_path
                .clone()
                .unwrap_or_else(|| self.scratch_parent()),
            self.config.data_host_url.clone(),
            Arc::clone(&self.fetcher),
        );
        let workers = self.config.worker_count().min(specs.len().max(1));
        let next = AtomicUsize::new(0);
        let (tx, rx) = mpsc::channel::<(usize, CaseReport)>();

        std::thread::scope(|scope| {
            for _ in 0..workers {
                let tx = tx.clone();
                let next = &next;
                let cache = &cache;
                scope.spawn(move || {
                    loop {
                        let index = next.fetch_add(1, Ordering::Relaxed);
                        let Some(spec) = specs.get(index) else {
                            break;
                        };
                        let report = self.run_case(spec, capabilities, cache);
                        if tx.send((index, report)).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        drop(tx);

        let mut indexed = rx.into_iter().collect::<Vec<_>>();
        indexed.sort_by_key(|(index, _)| *index);
        indexed.into_iter().map(|(_, report)| report).collect()
    }

    /// Gate, then fetch, process and validate one case in its own scratch
    /// directory.
    #[must_use]
    pub fn run_case(
        &self,
        spec: &TestSpec,
        capabilities: &CapabilityMap,
        cache: &DataCache,
    ) -> CaseReport {
        let case_id = spec.id();
        let started = Instant::now();
        let fixture_id = fixture_id_from_json(spec).unwrap_or_default();
        let mut log = CaseLogV1::new(case_id.clone(), fixture_id, CaseResult::Pass);

        if let GateDecision::Skip(reason) = evaluate(spec, capabilities, &self.config.filter) {
            info!(case = %case_id, reason = %reason, "skipping test case");
            log.result = CaseResult::Skip;
            log.details = Some(reason.message.clone());
            log.duration_ms = duration_ms(started.elapsed());
            return CaseReport {
                case_id,
                result: CaseResult::Skip,
                details: Some(reason.message.clone()),
                skip: Some(reason),
                metrics: Vec::new(),
                log,
            };
        }

        info!(case = %case_id, "running test case");
        let mut metrics = Vec::new();
        let outcome = match self.scratch_dir() {
            Ok(scratch) => {
                let outcome = self.execute(
                    spec,
                    scratch.path(),
                    cache,
                    &mut log.phase_timings,
                    &mut metrics,
                );
                log.artifact_refs = log_files(scratch.path())
                    .iter()
                    .filter_map(|path| path.file_name())
                    .map(|name| name.to_string_lossy().into_owned())
                    .collect();
                let outcome = outcome.map_err(|err| self.describe_failure(&err, scratch.path()));
                if let Some(save_root) = &self.config.save_results {
                    let destination = save_root.join(sanitize_case_id(&case_id));
                    if let Err(err) = copy_dir_recursive(scratch.path(), &destination) {
                        warn!(
                            case = %case_id,
                            destination = %destination.display(),
                            error = %err,
                            "failed to save results"
                        );
                    }
                }
                outcome
            }
            Err(err) => Err(err.to_string()),
        };

        let (result, details) = match outcome {
            Ok(()) => {
                info!(case = %case_id, "test case passed");
                (CaseResult::Pass, None)
            }
            Err(details) => {
                warn!(case = %case_id, details = %details, "test case failed");
                (CaseResult::Fail, Some(details))
            }
        };
        log.result = result;
        log.details.clone_from(&details);
        log.duration_ms = duration_ms(started.elapsed());

        CaseReport {
            case_id,
            result,
            details,
            skip: None,
            metrics,
            log,
        }
    }

    fn execute(
        &self,
        spec: &TestSpec,
        scratch: &Path,
        shared: &DataCache,
        timings: &mut CasePhaseTimings,
        metrics: &mut Vec<ComparisonMetrics>,
    ) -> Result<(), CaseError> {
        let scoped;
        let cache = if self.config.cache_enabled() {
            shared
        } else {
            scoped = shared.scoped(scratch.join("data"));
            &scoped
        };
        let executor =
            Executor::new(self.config.toolchain.clone()).with_timeout(self.config.job_timeout);

        if let Some(dependency) = &spec.dependency {
            let output = run_job(&executor, cache, dependency, scratch, timings)?;
            debug!(job = %dependency.name, output = %output.display(), "dependency finished");
        }
        let output = run_job(&executor, cache, &spec.reconstruction, scratch, timings)?;

        let validator = Validator::new(Arc::clone(&self.reader))
            .with_header_check(Arc::clone(&self.header))
            .with_policy(self.config.scale_policy);
        for validation in &spec.validations {
            let phase = Instant::now();
            let reference = cache.resolve(&validation.reference, &validation.checksum)?;
            timings.fetch_ms += duration_ms(phase.elapsed());

            let phase = Instant::now();
            let comparison = Comparison::for_validation(validation, &output, &reference);
            let outcome = validator.validate(&comparison);
            timings.validate_ms += duration_ms(phase.elapsed());
            metrics.push(outcome?);
        }
        Ok(())
    }

    fn describe_failure(&self, err: &CaseError, scratch: &Path) -> String {
        let mut details = err.to_string();
        if self.config.echo_log_on_failure {
            for path in log_files(scratch) {
                let name = path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default();
                match std::fs::read(&path) {
                    Ok(bytes) => {
                        details.push_str(&format!("\n--- {name} ---\n"));
                        details.push_str(&String::from_utf8_lossy(&bytes));
                    }
                    Err(err) => debug!(path = %path.display(), error = %err, "unreadable log file"),
                }
            }
        }
        details
    }

    fn scratch_parent(&self) -> PathBuf {
        self.config
            .scratch_root
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }

    fn scratch_dir(&self) -> Result<tempfile::TempDir, CaseError> {
        let parent = self.scratch_parent();
        std::fs::create_dir_all(&parent).map_err(|source| CaseError::Scratch {
            path: parent.clone(),
            source,
        })?;
        tempfile::Builder::new()
            .prefix("rh-case-")
            .tempdir_in(&parent)
            .map_err(|source| CaseError::Scratch {
                path: parent,
                source,
            })
    }
}

fn run_job(
    executor: &Executor,
    cache: &DataCache,
    job: &Job,
    scratch: &Path,
    timings: &mut CasePhaseTimings,
) -> Result<PathBuf, CaseError> {
    let phase = Instant::now();
    let input = cache.resolve(&job.datafile, &job.checksum)?;
    timings.fetch_ms += duration_ms(phase.elapsed());

    let phase = Instant::now();
    let converted = executor.prepare(job, &input, scratch)?;
    timings.prepare_ms += duration_ms(phase.elapsed());

    let phase = Instant::now();
    let output = executor.run(job, &converted, scratch)?;
    timings.execute_ms += duration_ms(phase.elapsed());
    Ok(output)
}

fn malformed_case_report(err: SpecParseError) -> CaseReport {
    let case_id = match &err.kind {
        SpecParseErrorKind::DuplicateIdentity { id } => format!("{id} (duplicate)"),
        _ => err.file.clone(),
    };
    let details = CaseError::from(err).to_string();
    let mut log = CaseLogV1::new(case_id.clone(), String::new(), CaseResult::Fail);
    log.details = Some(details.clone());
    CaseReport {
        case_id,
        result: CaseResult::Fail,
        details: Some(details),
        skip: None,
        metrics: Vec::new(),
        log,
    }
}

/// Captured job logs in `dir`, sorted by name.
fn log_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .file_name()
                    .is_some_and(|name| name.to_string_lossy().contains(LOG_FILE_MARKER))
        })
        .collect::<Vec<_>>();
    files.sort();
    files
}

/// Directory name for a case identity.
#[must_use]
pub fn sanitize_case_id(case_id: &str) -> String {
    case_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn copy_dir_recursive(source: &Path, destination: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(destination)?;
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let target = destination.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
