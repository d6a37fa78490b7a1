//! Runner configuration
//!
//! Where results are stored, which pipeline file to load, and defaults
//! applied to stages that do not set their own.

use crate::definition::{PipelineCatalog, DEFAULT_IMAGE};
use crate::error::{PipelineError, Result};
use crate::runner::DEFAULT_STAGE_TIMEOUT_SECS;
use std::path::PathBuf;

pub const ENV_PIPELINES: &str = "DEVSECOPS_PIPELINES";
pub const ENV_RESULTS_DIR: &str = "DEVSECOPS_RESULTS_DIR";
pub const ENV_STAGE_TIMEOUT: &str = "DEVSECOPS_STAGE_TIMEOUT";
pub const ENV_OUTPUT_WIDTH: &str = "DEVSECOPS_OUTPUT_WIDTH";
pub const ENV_IMAGE: &str = "DEVSECOPS_IMAGE";

/// Runner configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    /// TOML pipeline file; builtin pipelines when `None`.
    pub pipelines_file: Option<PathBuf>,

    /// Directory results are persisted under.
    pub results_dir: PathBuf,

    /// Timeout for stages that do not set `timeout_secs`. Zero disables.
    pub default_stage_timeout_secs: u64,

    /// Maximum characters of stage output shown in reports.
    pub output_width: usize,

    /// Image reference used by the builtin pipelines.
    pub image: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            pipelines_file: None,
            results_dir: PathBuf::from(".devsecops/runs"),
            default_stage_timeout_secs: DEFAULT_STAGE_TIMEOUT_SECS,
            output_width: 60,
            image: DEFAULT_IMAGE.to_string(),
        }
    }
}

impl RunnerConfig {
    /// Creates configuration from environment variables
    ///
    /// Expected environment variables (all optional):
    /// - DEVSECOPS_PIPELINES (path to a TOML pipeline file)
    /// - DEVSECOPS_RESULTS_DIR (default: .devsecops/runs)
    /// - DEVSECOPS_STAGE_TIMEOUT (seconds, default: 600)
    /// - DEVSECOPS_OUTPUT_WIDTH (characters, default: 60)
    /// - DEVSECOPS_IMAGE (default: devsecops-demo:latest)
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let parse_number = |key: &str| -> Result<Option<u64>> {
            match lookup(key) {
                Some(raw) => raw.trim().parse::<u64>().map(Some).map_err(|_| {
                    PipelineError::Config(format!("{} must be a non-negative integer, got {:?}", key, raw))
                }),
                None => Ok(None),
            }
        };

        let config = Self {
            pipelines_file: lookup(ENV_PIPELINES)
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
            results_dir: lookup(ENV_RESULTS_DIR)
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.results_dir),
            default_stage_timeout_secs: parse_number(ENV_STAGE_TIMEOUT)?
                .unwrap_or(defaults.default_stage_timeout_secs),
            output_width: parse_number(ENV_OUTPUT_WIDTH)?
                .map(|w| w as usize)
                .unwrap_or(defaults.output_width),
            image: lookup(ENV_IMAGE)
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.image),
        };
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<()> {
        if self.results_dir.as_os_str().is_empty() {
            return Err(PipelineError::Config(
                "results_dir cannot be empty".to_string(),
            ));
        }
        if self.output_width < 8 {
            return Err(PipelineError::Config(
                "output_width must be at least 8".to_string(),
            ));
        }
        if self.image.trim().is_empty() {
            return Err(PipelineError::Config("image cannot be empty".to_string()));
        }
        Ok(())
    }

    /// Load the configured pipeline file, or the builtin pipelines.
    pub fn load_catalog(&self) -> Result<PipelineCatalog> {
        match &self.pipelines_file {
            Some(path) => PipelineCatalog::load(path),
            None => Ok(PipelineCatalog::builtin(&self.image)),
        }
    }
}
