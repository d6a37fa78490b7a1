//! Filesystem store for finalized pipeline results.
//!
//! Layout: `<root>/<pipeline_id>/<run_id>.json` plus `<root>/<pipeline_id>/latest.json`.

use crate::error::{PipelineError, Result};
use crate::result::{Outcome, PipelineResult};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

const LATEST: &str = "latest.json";

/// Persists results so later runs can gate on them.
#[derive(Debug, Clone)]
pub struct ResultStore {
    root: PathBuf,
}

impl ResultStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn pipeline_dir(&self, pipeline_id: &str) -> Result<PathBuf> {
        if pipeline_id.is_empty()
            || pipeline_id.contains(['/', '\\'])
            || pipeline_id == "."
            || pipeline_id == ".."
        {
            return Err(PipelineError::InvalidDefinition(format!(
                "pipeline id '{}' is not usable as a directory name",
                pipeline_id
            )));
        }
        Ok(self.root.join(pipeline_id))
    }

    /// Write a finalized result; returns the path of the run file.
    pub fn save(&self, result: &PipelineResult) -> Result<PathBuf> {
        let dir = self.pipeline_dir(&result.pipeline_id)?;
        fs::create_dir_all(&dir)?;

        let json = serde_json::to_vec_pretty(result)?;
        let run_path = dir.join(format!("{}.json", result.run_id));
        fs::write(&run_path, &json)?;

        // Write then rename so readers never see a partial latest.json.
        let tmp = dir.join(format!("{}.tmp", LATEST));
        fs::write(&tmp, &json)?;
        fs::rename(&tmp, dir.join(LATEST))?;

        debug!(path = %run_path.display(), "Saved pipeline result");
        Ok(run_path)
    }

    /// Most recently saved result for a pipeline.
    pub fn latest(&self, pipeline_id: &str) -> Result<Option<PipelineResult>> {
        let path = self.pipeline_dir(pipeline_id)?.join(LATEST);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Latest outcomes for the given pipelines; pipelines never run are absent.
    pub fn latest_outcomes(&self, pipeline_ids: &[String]) -> Result<BTreeMap<String, Outcome>> {
        let mut outcomes = BTreeMap::new();
        for id in pipeline_ids {
            if let Some(result) = self.latest(id)? {
                outcomes.insert(id.clone(), result.outcome);
            }
        }
        Ok(outcomes)
    }
}
