#![forbid(unsafe_code)]

//! Drives jobs through the external reconstruction toolchain.
//!
//! [`Executor::prepare`] converts a fetched dataset into the streaming
//! container the reconstruction engine reads; [`Executor::run`] pushes it
//! through every configured stage and converts the result back into a
//! persisted file. Nothing is memoized: each call re-executes its chain.

pub mod pipeline;

pub use pipeline::{LogFiles, Pipeline, StageCommand, StageStatus};

use rh_probe::{ToolCommand, split_command_line};
use rh_spec::Job;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Log-file prefix suffix for the reconstruction pipeline of a job.
pub const RECONSTRUCTION_LOG_TAG: &str = "gadgetron";

#[derive(Debug)]
pub enum ProcessError {
    InvalidJob {
        job: String,
        detail: String,
    },
    EmptyPipeline,
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Spawn {
        stage: String,
        program: String,
        source: std::io::Error,
    },
    Wait {
        stage: String,
        source: std::io::Error,
    },
    Exit {
        stage: String,
        program: String,
        code: Option<i32>,
        logs: LogFiles,
    },
    Timeout {
        command: String,
        timeout: Duration,
        logs: LogFiles,
    },
}

impl ProcessError {
    /// Logs captured before the failure, if the pipeline got that far.
    #[must_use]
    pub fn logs(&self) -> Option<&LogFiles> {
        match self {
            Self::Exit { logs, .. } | Self::Timeout { logs, .. } => Some(logs),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProcessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidJob { job, detail } => write!(f, "job '{job}' is not runnable: {detail}"),
            Self::EmptyPipeline => write!(f, "pipeline has no stages"),
            Self::Io { path, source } => write!(f, "io error at {}: {source}", path.display()),
            Self::Spawn {
                stage,
                program,
                source,
            } => write!(f, "failed to start {program} for stage {stage}: {source}"),
            Self::Wait { stage, source } => write!(f, "failed to wait for stage {stage}: {source}"),
            Self::Exit {
                stage,
                program,
                code,
                logs,
            } => {
                match code {
                    Some(code) => write!(f, "{program} ({stage}) failed with return code {code}")?,
                    None => write!(f, "{program} ({stage}) was terminated by a signal")?,
                }
                write!(f, "; logs: {}", logs.stderr.display())
            }
            Self::Timeout {
                command, timeout, ..
            } => write!(
                f,
                "pipeline timed out after {}s: {command}",
                timeout.as_secs_f64()
            ),
        }
    }
}

impl std::error::Error for ProcessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } | Self::Spawn { source, .. } | Self::Wait { source, .. } => {
                Some(source)
            }
            _ => None,
        }
    }
}

/// The external programs a job is pushed through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Toolchain {
    pub reconstruction: ToolCommand,
    pub siemens_to_ismrmrd: ToolCommand,
    pub ismrmrd_hdf5_to_stream: ToolCommand,
    pub ismrmrd_to_mrd: ToolCommand,
    pub mrd_to_ismrmrd: ToolCommand,
    pub ismrmrd_stream_to_hdf5: ToolCommand,
}

impl Default for Toolchain {
    fn default() -> Self {
        Self {
            reconstruction: ToolCommand::new("gadgetron"),
            siemens_to_ismrmrd: ToolCommand::new("siemens_to_ismrmrd"),
            ismrmrd_hdf5_to_stream: ToolCommand::new("ismrmrd_hdf5_to_stream"),
            ismrmrd_to_mrd: ToolCommand::new("ismrmrd_to_mrd"),
            mrd_to_ismrmrd: ToolCommand::new("mrd_to_ismrmrd"),
            ismrmrd_stream_to_hdf5: ToolCommand::new("ismrmrd_stream_to_hdf5"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Executor {
    toolchain: Toolchain,
    timeout: Option<Duration>,
}

impl Executor {
    #[must_use]
    pub fn new(toolchain: Toolchain) -> Self {
        Self {
            toolchain,
            timeout: None,
        }
    }

    /// Deadline applied to each pipeline the executor runs.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn toolchain(&self) -> &Toolchain {
        &self.toolchain
    }

    /// The raw-to-intermediate conversion for a job that selects a
    /// measurement, with the file it writes. `None` when no conversion is
    /// needed.
    #[must_use]
    pub fn raw_conversion(&self, job: &Job, input: &Path, scratch: &Path) -> Option<(Pipeline, PathBuf)> {
        let measurement = job.measurement.as_ref()?;
        let output = scratch.join(format!("{}.h5", conversion_prefix(input, job)));
        let mut stage = StageCommand::new("siemens_to_ismrmrd", &self.toolchain.siemens_to_ismrmrd)
            .arg("-X")
            .arg("-f")
            .arg(input)
            .arg("-m")
            .arg(&job.parameter_xml)
            .arg("-x")
            .arg(&job.parameter_xsl)
            .arg("-o")
            .arg(&output)
            .arg("-z")
            .arg(measurement);
        if !job.data_conversion_flag.is_empty() {
            stage = stage.arg(&job.data_conversion_flag);
        }
        let pipeline = Pipeline::new(scratch).stage(stage).with_timeout(self.timeout);
        Some((pipeline, output))
    }

    /// Intermediate file to stream container: `hdf5_to_stream | to_mrd`.
    #[must_use]
    pub fn stream_conversion(&self, input: &Path, output: &Path, scratch: &Path) -> Pipeline {
        Pipeline::new(scratch)
            .stage(
                StageCommand::new("ismrmrd_hdf5_to_stream", &self.toolchain.ismrmrd_hdf5_to_stream)
                    .arg("-i")
                    .arg(input)
                    .arg("--use-stdout"),
            )
            .stage(
                StageCommand::new("ismrmrd_to_mrd", &self.toolchain.ismrmrd_to_mrd)
                    .arg("-o")
                    .arg(output),
            )
            .with_timeout(self.timeout)
    }

    /// One reconstruction stage per configuration, then the two converters
    /// that persist the stream into `output`.
    pub fn reconstruction_pipeline(
        &self,
        job: &Job,
        input: &Path,
        output: &Path,
        scratch: &Path,
    ) -> Result<Pipeline, ProcessError> {
        validate_job(job)?;
        let mut pipeline = Pipeline::new(scratch).with_timeout(self.timeout);
        for (index, (configuration, args)) in job.stages().enumerate() {
            let mut stage = StageCommand::new(
                format!("stage {index} ({configuration})"),
                &self.toolchain.reconstruction,
            )
            .arg("--from_stream")
            .arg("-c")
            .arg(configuration)
            .args(split_command_line(args));
            if index == 0 {
                stage = stage.arg("--input_path").arg(input);
            }
            pipeline = pipeline.stage(stage);
        }

        let mut persist =
            StageCommand::new("ismrmrd_stream_to_hdf5", &self.toolchain.ismrmrd_stream_to_hdf5)
                .arg("--use-stdin")
                .arg("-o")
                .arg(output);
        if let Some(group) = job.output_group.as_deref().filter(|group| !group.is_empty()) {
            persist = persist.arg("-g").arg(group);
        }
        Ok(pipeline
            .stage(StageCommand::new("mrd_to_ismrmrd", &self.toolchain.mrd_to_ismrmrd))
            .stage(persist))
    }

    /// Convert the fetched `input` into the stream container the
    /// reconstruction engine reads. Returns the converted file.
    pub fn prepare(&self, job: &Job, input: &Path, scratch: &Path) -> Result<PathBuf, ProcessError> {
        let prefix = conversion_prefix(input, job);
        let mut source = input.to_path_buf();

        if let Some((pipeline, converted)) = self.raw_conversion(job, input, scratch) {
            tracing::info!(job = %job.name, command = %pipeline.render(), "converting raw data");
            pipeline.run(&LogFiles::with_prefix(scratch, &prefix))?;
            source = converted;
        }

        let output = scratch.join(format!("{prefix}.mrd"));
        let pipeline = self.stream_conversion(&source, &output, scratch);
        tracing::info!(job = %job.name, command = %pipeline.render(), "converting to stream");
        pipeline.run(&LogFiles::with_prefix(scratch, &format!("{prefix}_conversion")))?;
        Ok(output)
    }

    /// Reconstruct `input` (the result of [`Self::prepare`]). Returns the
    /// persisted output file, `<scratch>/<job>.output.mrd`.
    pub fn run(&self, job: &Job, input: &Path, scratch: &Path) -> Result<PathBuf, ProcessError> {
        let output = scratch.join(format!("{}.output.mrd", job.name));
        let pipeline = self.reconstruction_pipeline(job, input, &output, scratch)?;
        let logs = LogFiles::with_prefix(scratch, &reconstruction_log_prefix(job));
        tracing::info!(job = %job.name, command = %pipeline.render(), "running reconstruction");
        let statuses = pipeline.run(&logs)?;
        tracing::debug!(job = %job.name, stages = statuses.len(), "reconstruction finished");
        Ok(output)
    }

    /// Both steps for one job.
    pub fn process(&self, job: &Job, input: &Path, scratch: &Path) -> Result<PathBuf, ProcessError> {
        let converted = self.prepare(job, input, scratch)?;
        self.run(job, &converted, scratch)
    }
}

/// `<input file name>_<job name>`, shared by every conversion artifact.
#[must_use]
pub fn conversion_prefix(input: &Path, job: &Job) -> String {
    let file_name = input
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{file_name}_{}", job.name)
}

#[must_use]
pub fn reconstruction_log_prefix(job: &Job) -> String {
    format!("{}_{RECONSTRUCTION_LOG_TAG}", job.name)
}

fn validate_job(job: &Job) -> Result<(), ProcessError> {
    let invalid = |detail: String| ProcessError::InvalidJob {
        job: job.name.clone(),
        detail,
    };
    if job.configurations.is_empty() {
        return Err(invalid("no stage configured".to_owned()));
    }
    if job.configurations.len() != job.args.len() {
        return Err(invalid(format!(
            "{} configurations but {} argument strings",
            job.configurations.len(),
            job.args.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{Executor, ProcessError, Toolchain, conversion_prefix};
    use rh_probe::ToolCommand;
    use rh_spec::{DEFAULT_PARAMETER_XML, DEFAULT_PARAMETER_XSL, Job};
    use rh_test_utils::fake_tools;
    use std::path::Path;

    fn job(stages: &[(&str, &str)]) -> Job {
        Job {
            name: "reconstruction".to_owned(),
            datafile: "grappa/meas.dat".to_owned(),
            checksum: "c0011".to_owned(),
            configurations: stages.iter().map(|(c, _)| (*c).to_owned()).collect(),
            args: stages.iter().map(|(_, a)| (*a).to_owned()).collect(),
            output_group: Some("grappa".to_owned()),
            measurement: None,
            data_conversion_flag: String::new(),
            parameter_xml: DEFAULT_PARAMETER_XML.to_owned(),
            parameter_xsl: DEFAULT_PARAMETER_XSL.to_owned(),
        }
    }

    fn fake_toolchain() -> Toolchain {
        Toolchain {
            reconstruction: ToolCommand::shell(fake_tools::reconstruction(fake_tools::INFO_REPORT)),
            siemens_to_ismrmrd: ToolCommand::shell(fake_tools::SIEMENS_TO_ISMRMRD),
            ismrmrd_hdf5_to_stream: ToolCommand::shell(fake_tools::ISMRMRD_HDF5_TO_STREAM),
            ismrmrd_to_mrd: ToolCommand::shell(fake_tools::ISMRMRD_TO_MRD),
            mrd_to_ismrmrd: ToolCommand::shell(fake_tools::MRD_TO_ISMRMRD),
            ismrmrd_stream_to_hdf5: ToolCommand::shell(fake_tools::ISMRMRD_STREAM_TO_HDF5),
        }
    }

    #[test]
    fn reconstruction_stages_follow_the_invocation_contract() {
        let executor = Executor::default();
        let job = job(&[
            ("default_measurement_dependencies", "--parameter 'noise=true'"),
            ("Generic_Cartesian_Grappa", ""),
        ]);
        let pipeline = executor
            .reconstruction_pipeline(
                &job,
                Path::new("/s/in.mrd"),
                Path::new("/s/out.mrd"),
                Path::new("/s"),
            )
            .expect("valid job");
        let rendered = pipeline
            .stages()
            .iter()
            .map(|stage| stage.render())
            .collect::<Vec<_>>();
        assert_eq!(
            rendered,
            vec![
                "gadgetron --from_stream -c default_measurement_dependencies --parameter noise=true --input_path /s/in.mrd",
                "gadgetron --from_stream -c Generic_Cartesian_Grappa",
                "mrd_to_ismrmrd",
                "ismrmrd_stream_to_hdf5 --use-stdin -o /s/out.mrd -g grappa",
            ]
        );
    }

    #[test]
    fn absent_output_group_is_not_passed() {
        let mut job = job(&[("cfg", "")]);
        job.output_group = None;
        let pipeline = Executor::default()
            .reconstruction_pipeline(&job, Path::new("in"), Path::new("out"), Path::new("."))
            .expect("valid job");
        let last = pipeline.stages().last().expect("stages").render();
        assert_eq!(last, "ismrmrd_stream_to_hdf5 --use-stdin -o out");
    }

    #[test]
    fn raw_conversion_only_with_measurement() {
        let executor = Executor::default();
        let mut job = job(&[("cfg", "")]);
        assert!(
            executor
                .raw_conversion(&job, Path::new("/d/meas.dat"), Path::new("/s"))
                .is_none()
        );

        job.measurement = Some("2".to_owned());
        let (pipeline, output) = executor
            .raw_conversion(&job, Path::new("/d/meas.dat"), Path::new("/s"))
            .expect("conversion needed");
        assert_eq!(output, Path::new("/s/meas.dat_reconstruction.h5"));
        assert_eq!(
            pipeline.render(),
            "siemens_to_ismrmrd -X -f /d/meas.dat -m IsmrmrdParameterMap_Siemens.xml \
             -x IsmrmrdParameterMap_Siemens.xsl -o /s/meas.dat_reconstruction.h5 -z 2"
        );

        job.data_conversion_flag = "--flashPatRef".to_owned();
        let (pipeline, _) = executor
            .raw_conversion(&job, Path::new("/d/meas.dat"), Path::new("/s"))
            .expect("conversion needed");
        assert!(pipeline.render().ends_with("-z 2 --flashPatRef"));
    }

    #[test]
    fn mismatched_stage_lists_are_rejected() {
        let mut job = job(&[("a", ""), ("b", "")]);
        job.args.pop();
        let err = Executor::default()
            .reconstruction_pipeline(&job, Path::new("i"), Path::new("o"), Path::new("."))
            .expect_err("invalid");
        assert!(matches!(err, ProcessError::InvalidJob { .. }));
    }

    #[test]
    fn conversion_prefix_uses_file_name_and_job() {
        let job = job(&[("a", "")]);
        assert_eq!(
            conversion_prefix(Path::new("/cache/x/meas.h5"), &job),
            "meas.h5_reconstruction"
        );
    }

    #[cfg(unix)]
    #[test]
    fn process_runs_conversion_and_every_stage() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("meas.dat");
        std::fs::write(&input, "raw").expect("input");
        let mut job = job(&[("first", "--verbose"), ("second", "")]);
        job.measurement = Some("1".to_owned());

        let executor = Executor::new(fake_toolchain());
        let output = executor.process(&job, &input, dir.path()).expect("job runs");

        assert_eq!(output, dir.path().join("reconstruction.output.mrd"));
        assert_eq!(
            std::fs::read_to_string(&output).expect("output"),
            "raw[m1]|first --verbose|second@grappa"
        );
        let recon_err = dir.path().join("reconstruction_gadgetron.log.err");
        let stderr = std::fs::read_to_string(recon_err).expect("stderr log");
        assert!(stderr.contains("stage first starting"));
        assert!(stderr.contains("stage second starting"));
        assert!(
            std::fs::read_to_string(dir.path().join("meas.dat_reconstruction.log.out"))
                .expect("conversion log")
                .contains("converting measurement 1")
        );
    }

    #[cfg(unix)]
    #[test]
    fn failing_stage_reports_exit_code() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("in.mrd");
        std::fs::write(&input, "stream").expect("input");
        let job = job(&[("ok", ""), ("fail", "")]);

        let err = Executor::new(fake_toolchain())
            .run(&job, &input, dir.path())
            .expect_err("stage fails");
        match &err {
            ProcessError::Exit { stage, code, .. } => {
                assert_eq!(stage, "stage 1 (fail)");
                assert_eq!(*code, Some(7));
            }
            other => panic!("unexpected error: {other}"),
        }
        let logs = err.logs().expect("logs attached");
        assert!(
            std::fs::read_to_string(&logs.stderr)
                .expect("stderr log")
                .contains("stage fail failed")
        );
        assert!(err.to_string().contains("failed with return code 7"));
    }

    #[cfg(unix)]
    #[test]
    fn failing_converter_is_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("in.h5");
        std::fs::write(&input, "data").expect("input");
        let mut toolchain = fake_toolchain();
        toolchain.ismrmrd_to_mrd = ToolCommand::shell(fake_tools::FAILING_TOOL);

        let err = Executor::new(toolchain)
            .prepare(&job(&[("a", "")]), &input, dir.path())
            .expect_err("converter fails");
        assert!(matches!(
            err,
            ProcessError::Exit { ref stage, code: Some(3), .. } if stage == "ismrmrd_to_mrd"
        ));
    }
}
