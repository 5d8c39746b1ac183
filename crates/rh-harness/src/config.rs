use rh_gate::RunFilter;
use rh_pipeline::Toolchain;
use rh_probe::ToolCommand;
use rh_validate::ScaleThresholdPolicy;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_DATA_HOST: &str = "http://gadgetrondata.blob.core.windows.net/gadgetrontestdata/";

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Directory searched recursively for case files.
    pub cases_root: PathBuf,
    pub data_host_url: String,
    /// Shared dataset cache; `None` stores downloads in each case's scratch
    /// directory instead.
    pub cache_path: Option<PathBuf>,
    pub filter: RunFilter,
    pub echo_log_on_failure: bool,
    /// Copy every case's scratch directory here once it finishes.
    pub save_results: Option<PathBuf>,
    /// Parent of the per-case scratch directories; the system temp dir when
    /// unset.
    pub scratch_root: Option<PathBuf>,
    pub workers: usize,
    pub job_timeout: Option<Duration>,
    pub toolchain: Toolchain,
    pub h5dump: ToolCommand,
    pub scale_policy: ScaleThresholdPolicy,
}

impl HarnessConfig {
    #[must_use]
    pub fn default_paths() -> Self {
        let cases_root = PathBuf::from("cases");
        Self {
            cache_path: Some(default_cache_path(&cases_root)),
            cases_root,
            data_host_url: DEFAULT_DATA_HOST.to_owned(),
            filter: RunFilter::default(),
            echo_log_on_failure: false,
            save_results: None,
            scratch_root: None,
            workers: 1,
            job_timeout: None,
            toolchain: Toolchain::default(),
            h5dump: ToolCommand::new("h5dump"),
            scale_policy: ScaleThresholdPolicy::default(),
        }
    }

    #[must_use]
    pub fn cache_enabled(&self) -> bool {
        self.cache_path.is_some()
    }

    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.max(1)
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::default_paths()
    }
}

/// `data/` beside the case directory.
#[must_use]
pub fn default_cache_path(cases_root: &Path) -> PathBuf {
    cases_root
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .join("data")
}
