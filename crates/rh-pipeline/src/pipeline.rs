//! Processes chained standard-output to standard-input.
//!
//! A [`Pipeline`] is an explicit list of [`StageCommand`]s. Running it spawns
//! every stage directly (no shell), pipes stage *i* into stage *i+1*, sends
//! the last stage's output to the stdout log and every stage's diagnostics to
//! the shared stderr log. The pipeline succeeds only if every stage does.

use crate::ProcessError;
use rh_probe::ToolCommand;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Child, ExitStatus, Stdio};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageCommand {
    /// Name used in logs and errors.
    pub label: String,
    pub tool: ToolCommand,
    pub args: Vec<OsString>,
}

impl StageCommand {
    #[must_use]
    pub fn new(label: impl Into<String>, tool: &ToolCommand) -> Self {
        Self {
            label: label.into(),
            tool: tool.clone(),
            args: Vec::new(),
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn render(&self) -> String {
        self.tool.render(&self.args)
    }
}

/// Captured standard output and standard error of one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFiles {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

impl LogFiles {
    /// `<dir>/<prefix>.log.out` and `<dir>/<prefix>.log.err`.
    #[must_use]
    pub fn with_prefix(dir: &Path, prefix: &str) -> Self {
        Self {
            stdout: dir.join(format!("{prefix}.log.out")),
            stderr: dir.join(format!("{prefix}.log.err")),
        }
    }

    #[must_use]
    pub fn paths(&self) -> [&Path; 2] {
        [&self.stdout, &self.stderr]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageStatus {
    pub label: String,
    pub program: String,
    pub success: bool,
    /// `None` when the stage was terminated by a signal.
    pub code: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    stages: Vec<StageCommand>,
    working_dir: PathBuf,
    timeout: Option<Duration>,
}

impl Pipeline {
    #[must_use]
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            stages: Vec::new(),
            working_dir: working_dir.into(),
            timeout: None,
        }
    }

    #[must_use]
    pub fn stage(mut self, stage: StageCommand) -> Self {
        self.stages.push(stage);
        self
    }

    /// Kill every stage if the whole group has not exited within `timeout`.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn stages(&self) -> &[StageCommand] {
        &self.stages
    }

    #[must_use]
    pub fn render(&self) -> String {
        self.stages
            .iter()
            .map(StageCommand::render)
            .collect::<Vec<_>>()
            .join(" | ")
    }

    /// Run every stage to completion. Logs are written whatever the outcome.
    pub fn run(&self, logs: &LogFiles) -> Result<Vec<StageStatus>, ProcessError> {
        let Some(last) = self.stages.len().checked_sub(1) else {
            return Err(ProcessError::EmptyPipeline);
        };
        let stdout_log = create_log(&logs.stdout)?;
        let stderr_log = create_log(&logs.stderr)?;

        let mut guards = Vec::with_capacity(self.stages.len());
        let mut upstream = None;
        for (index, stage) in self.stages.iter().enumerate() {
            let mut command = stage.tool.command();
            command.args(&stage.args).current_dir(&self.working_dir);
            command.stdin(upstream.take().map_or_else(Stdio::null, Stdio::from));
            if index == last {
                command.stdout(clone_log(&stdout_log, &logs.stdout)?);
            } else {
                command.stdout(Stdio::piped());
            }
            command.stderr(clone_log(&stderr_log, &logs.stderr)?);

            tracing::debug!(stage = %stage.label, command = %stage.render(), "spawning stage");
            let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
                stage: stage.label.clone(),
                program: stage.tool.program.clone(),
                source,
            })?;
            upstream = child.stdout.take();
            guards.push(ProcessGuard::new(child));
        }

        let exits = self.wait_all(&mut guards, logs)?;
        let statuses = self
            .stages
            .iter()
            .zip(exits)
            .map(|(stage, status)| StageStatus {
                label: stage.label.clone(),
                program: stage.tool.program.clone(),
                success: status.success(),
                code: status.code(),
            })
            .collect::<Vec<_>>();

        if let Some(failed) = first_failure(&statuses) {
            return Err(ProcessError::Exit {
                stage: failed.label.clone(),
                program: failed.program.clone(),
                code: failed.code,
                logs: logs.clone(),
            });
        }
        Ok(statuses)
    }

    fn wait_all(
        &self,
        guards: &mut [ProcessGuard],
        logs: &LogFiles,
    ) -> Result<Vec<ExitStatus>, ProcessError> {
        let deadline = self.timeout.map(|timeout| Instant::now() + timeout);
        let mut exits: Vec<Option<ExitStatus>> = vec![None; guards.len()];
        loop {
            for ((guard, exit), stage) in guards.iter_mut().zip(&mut exits).zip(&self.stages) {
                if exit.is_none() {
                    *exit = guard.try_wait().map_err(|source| ProcessError::Wait {
                        stage: stage.label.clone(),
                        source,
                    })?;
                }
            }
            if exits.iter().all(Option::is_some) {
                return Ok(exits.into_iter().flatten().collect());
            }
            if let Some(deadline) = deadline
                && Instant::now() >= deadline
            {
                for guard in guards.iter_mut() {
                    let _ = guard.kill();
                }
                return Err(ProcessError::Timeout {
                    command: self.render(),
                    timeout: self.timeout.unwrap_or_default(),
                    logs: logs.clone(),
                });
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

/// The stage to blame: a stage that exited with a status of its own wins
/// over one killed by a signal (typically a broken pipe caused downstream).
fn first_failure(statuses: &[StageStatus]) -> Option<&StageStatus> {
    let mut failures = statuses.iter().filter(|status| !status.success);
    let first = failures.clone().next()?;
    Some(failures.find(|status| status.code.is_some()).unwrap_or(first))
}

fn create_log(path: &Path) -> Result<File, ProcessError> {
    File::create(path).map_err(|source| ProcessError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn clone_log(file: &File, path: &Path) -> Result<Stdio, ProcessError> {
    file.try_clone()
        .map(Stdio::from)
        .map_err(|source| ProcessError::Io {
            path: path.to_path_buf(),
            source,
        })
}

/// Kills the child on drop unless it has already exited.
struct ProcessGuard {
    child: Option<Child>,
}

impl ProcessGuard {
    const fn new(child: Child) -> Self {
        Self { child: Some(child) }
    }

    fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>> {
        match self.child.as_mut() {
            Some(child) => child.try_wait(),
            None => Ok(None),
        }
    }

    fn kill(&mut self) -> std::io::Result<Option<ExitStatus>> {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let status = child.wait()?;
            return Ok(Some(status));
        }
        Ok(None)
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            match child.try_wait() {
                Ok(None) => {}
                Ok(Some(_)) | Err(_) => return,
            }
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
