#![forbid(unsafe_code)]

use clap::{Parser, ValueEnum};
use rh_gate::RunFilter;
use rh_harness::{
    Harness, HarnessConfig, HarnessError, SuiteReport, append_run_log, default_cache_path,
    emit_suite_json, emit_suite_markdown,
};
use rh_pipeline::Toolchain;
use rh_probe::ToolCommand;
use rh_validate::ScaleThresholdPolicy;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ScalePolicyArg {
    /// Scale deviation is held to the value threshold.
    Legacy,
    /// Scale deviation is held to the scale threshold.
    Scale,
}

impl From<ScalePolicyArg> for ScaleThresholdPolicy {
    fn from(value: ScalePolicyArg) -> Self {
        match value {
            ScalePolicyArg::Legacy => Self::Legacy,
            ScalePolicyArg::Scale => Self::Scale,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "rh_e2e", version, about = "End-to-end tests for the reconstruction toolchain")]
struct Cli {
    /// Directory searched recursively for case files.
    #[arg(long, env = "RH_CASES", default_value = "cases")]
    cases: PathBuf,

    /// Base URL of the remote dataset host.
    #[arg(long, env = "RH_DATA_HOST", default_value = rh_harness::DEFAULT_DATA_HOST)]
    data_host: String,

    /// Download datasets into each case's scratch directory instead of the shared cache.
    #[arg(long, env = "RH_CACHE_DISABLE")]
    cache_disable: bool,

    /// Shared dataset cache; defaults to `data/` beside the case directory.
    #[arg(long, env = "RH_CACHE_PATH")]
    cache_path: Option<PathBuf>,

    /// Comma-separated capabilities whose requirements are not checked.
    #[arg(long, env = "RH_IGNORE_REQUIREMENTS", default_value = "")]
    ignore_requirements: String,

    /// Comma-separated tags; only cases carrying one of them run.
    #[arg(long, env = "RH_TAGS", default_value = "")]
    tags: String,

    /// Append captured job logs to the details of failed cases.
    #[arg(long, env = "RH_ECHO_LOG_ON_FAILURE")]
    echo_log_on_failure: bool,

    /// Copy each case's scratch directory here once it finishes.
    #[arg(long, env = "RH_SAVE_RESULTS")]
    save_results: Option<PathBuf>,

    /// Parent of the per-case scratch directories.
    #[arg(long, env = "RH_SCRATCH_ROOT")]
    scratch_root: Option<PathBuf>,

    #[arg(long, env = "RH_WORKERS", default_value_t = 1)]
    workers: usize,

    /// Kill a pipeline that runs longer than this.
    #[arg(long, env = "RH_JOB_TIMEOUT_SECS")]
    job_timeout_secs: Option<u64>,

    #[arg(long, env = "RH_RECONSTRUCTION_COMMAND", default_value = "gadgetron")]
    reconstruction_command: String,

    #[arg(long, env = "RH_SIEMENS_TO_ISMRMRD_COMMAND", default_value = "siemens_to_ismrmrd")]
    siemens_to_ismrmrd_command: String,

    #[arg(
        long,
        env = "RH_ISMRMRD_HDF5_TO_STREAM_COMMAND",
        default_value = "ismrmrd_hdf5_to_stream"
    )]
    ismrmrd_hdf5_to_stream_command: String,

    #[arg(long, env = "RH_ISMRMRD_TO_MRD_COMMAND", default_value = "ismrmrd_to_mrd")]
    ismrmrd_to_mrd_command: String,

    #[arg(long, env = "RH_MRD_TO_ISMRMRD_COMMAND", default_value = "mrd_to_ismrmrd")]
    mrd_to_ismrmrd_command: String,

    #[arg(
        long,
        env = "RH_ISMRMRD_STREAM_TO_HDF5_COMMAND",
        default_value = "ismrmrd_stream_to_hdf5"
    )]
    ismrmrd_stream_to_hdf5_command: String,

    #[arg(long, env = "RH_H5DUMP_COMMAND", default_value = "h5dump")]
    h5dump_command: String,

    #[arg(long, env = "RH_SCALE_POLICY", value_enum, default_value_t = ScalePolicyArg::Legacy)]
    scale_policy: ScalePolicyArg,

    #[arg(long)]
    report_json: Option<PathBuf>,

    #[arg(long)]
    report_markdown: Option<PathBuf>,

    /// Append one JSON line per case to this file.
    #[arg(long, env = "RH_RUN_LOG")]
    run_log: Option<PathBuf>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(report) if report.is_success() => {}
        Ok(_) => std::process::exit(1),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(2);
        }
    }
}

fn run(cli: Cli) -> Result<SuiteReport, String> {
    let report_json = cli.report_json.clone();
    let report_markdown = cli.report_markdown.clone();
    let run_log = cli.run_log.clone();
    let config = config_from_cli(cli)?;

    let harness = Harness::new(config).map_err(|err| err.to_string())?;
    let report = harness.run().map_err(|err| err.to_string())?;

    println!(
        "{} passed, {} failed, {} skipped ({} total)",
        report.passed_cases, report.failed_cases, report.skipped_cases, report.total_cases
    );
    for case in report.cases.iter().filter(|case| !case.passed()) {
        println!(
            "{} {}: {}",
            case.result.as_str(),
            case.case_id,
            case.details.as_deref().unwrap_or("")
        );
    }

    if let Some(path) = &report_json {
        let json = emit_suite_json(&report).map_err(|err| err.to_string())?;
        write_report(path, &json).map_err(|err| err.to_string())?;
    }
    if let Some(path) = &report_markdown {
        write_report(path, &emit_suite_markdown(&report)).map_err(|err| err.to_string())?;
    }
    if let Some(path) = &run_log {
        append_run_log(path, &report.cases).map_err(|source| {
            HarnessError::Report {
                path: path.clone(),
                source,
            }
            .to_string()
        })?;
    }

    Ok(report)
}

fn config_from_cli(cli: Cli) -> Result<HarnessConfig, String> {
    let cache_path = if cli.cache_disable {
        None
    } else {
        Some(
            cli.cache_path
                .unwrap_or_else(|| default_cache_path(&cli.cases)),
        )
    };

    Ok(HarnessConfig {
        cache_path,
        data_host_url: cli.data_host,
        filter: RunFilter::from_lists(&cli.tags, &cli.ignore_requirements),
        echo_log_on_failure: cli.echo_log_on_failure,
        save_results: cli.save_results,
        scratch_root: cli.scratch_root,
        workers: cli.workers,
        job_timeout: cli.job_timeout_secs.map(Duration::from_secs),
        toolchain: Toolchain {
            reconstruction: tool("--reconstruction-command", &cli.reconstruction_command)?,
            siemens_to_ismrmrd: tool(
                "--siemens-to-ismrmrd-command",
                &cli.siemens_to_ismrmrd_command,
            )?,
            ismrmrd_hdf5_to_stream: tool(
                "--ismrmrd-hdf5-to-stream-command",
                &cli.ismrmrd_hdf5_to_stream_command,
            )?,
            ismrmrd_to_mrd: tool("--ismrmrd-to-mrd-command", &cli.ismrmrd_to_mrd_command)?,
            mrd_to_ismrmrd: tool("--mrd-to-ismrmrd-command", &cli.mrd_to_ismrmrd_command)?,
            ismrmrd_stream_to_hdf5: tool(
                "--ismrmrd-stream-to-hdf5-command",
                &cli.ismrmrd_stream_to_hdf5_command,
            )?,
        },
        h5dump: tool("--h5dump-command", &cli.h5dump_command)?,
        scale_policy: cli.scale_policy.into(),
        cases_root: cli.cases,
    })
}

fn tool(flag: &str, command_line: &str) -> Result<ToolCommand, String> {
    ToolCommand::parse(command_line).ok_or_else(|| format!("{flag} must name a program"))
}

fn write_report(path: &Path, contents: &str) -> Result<(), HarnessError> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| HarnessError::Report {
            path: path.to_path_buf(),
            source,
        })?;
    }
    std::fs::write(path, contents).map_err(|source| HarnessError::Report {
        path: path.to_path_buf(),
        source,
    })
}
