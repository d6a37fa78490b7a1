//! Pipeline definitions, the builtin CI/CD set, and TOML loading.

use crate::error::{PipelineError, Result};
use crate::gate::Gate;
use crate::stage::{BuiltinStage, StageConfig};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::Path;

/// Image reference built and tested by the builtin pipelines.
pub const DEFAULT_IMAGE: &str = "devsecops-demo:latest";

/// An ordered, gated sequence of stages.
///
/// Stage order is execution order and is fixed once loaded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineDefinition {
    pub id: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Evaluated before any stage runs.
    #[serde(default)]
    pub entry_gate: Gate,

    /// Run-level budget checked between stages.
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    #[serde(rename = "stage")]
    pub stages: Vec<StageConfig>,
}

impl PipelineDefinition {
    pub fn new(id: impl Into<String>, entry_gate: Gate, stages: Vec<StageConfig>) -> Self {
        Self {
            id: id.into(),
            description: None,
            entry_gate,
            timeout_secs: None,
            stages,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// The CI pipeline: quality and security gates, then image publication.
    pub fn builtin_ci(image: &str) -> Self {
        let stages = [
            BuiltinStage::Lint,
            BuiltinStage::Test,
            BuiltinStage::StaticScan,
            BuiltinStage::DependencyScan,
            BuiltinStage::ImageBuild,
            BuiltinStage::ImageScan,
            BuiltinStage::RuntimeContainerTest,
            BuiltinStage::Dast,
            BuiltinStage::ImagePush,
        ]
        .into_iter()
        .map(|stage| StageConfig::from_builtin(stage, image))
        .collect();

        Self::new(
            "ci",
            Gate::any_of([Gate::branch("main"), Gate::ManualTrigger]),
            stages,
        )
        .with_description("Lint, test, scan, build, verify and publish the application image")
    }

    /// The CD pipeline: deploy the image to a local cluster and verify it.
    pub fn builtin_cd(image: &str) -> Self {
        let stages = [
            BuiltinStage::ClusterSetup,
            BuiltinStage::ImageLoad,
            BuiltinStage::Deploy,
            BuiltinStage::ServiceVerify,
        ]
        .into_iter()
        .map(|stage| StageConfig::from_builtin(stage, image))
        .collect();

        Self::new(
            "cd",
            Gate::any_of([Gate::upstream("ci"), Gate::ManualTrigger]),
            stages,
        )
        .with_description("Deploy to a kind cluster, wait for rollout and verify the service")
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(PipelineError::InvalidDefinition(
                "pipeline id cannot be empty".to_string(),
            ));
        }
        if self.stages.is_empty() {
            return Err(PipelineError::InvalidDefinition(format!(
                "pipeline '{}': stages cannot be empty",
                self.id
            )));
        }
        if self.timeout_secs == Some(0) {
            return Err(PipelineError::InvalidDefinition(format!(
                "pipeline '{}': timeout_secs must be > 0",
                self.id
            )));
        }
        self.entry_gate
            .validate()
            .map_err(|e| PipelineError::InvalidDefinition(format!("pipeline '{}': {}", self.id, e)))?;

        let mut seen = HashSet::new();
        for stage in &self.stages {
            stage.validate().map_err(|e| {
                PipelineError::InvalidDefinition(format!("pipeline '{}': {}", self.id, e))
            })?;
            if !seen.insert(stage.name.as_str()) {
                return Err(PipelineError::InvalidDefinition(format!(
                    "pipeline '{}': duplicate stage name '{}'",
                    self.id, stage.name
                )));
            }
        }
        Ok(())
    }

    /// Deterministic SHA-256 digest of the definition.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        match serde_json::to_vec(self) {
            Ok(bytes) => hasher.update(&bytes),
            // Serializing plain data cannot fail; fall back to the stage order.
            Err(_) => {
                for stage in &self.stages {
                    hasher.update(stage.name.as_bytes());
                    hasher.update(b"\0");
                }
            }
        }
        hex::encode(hasher.finalize())
    }
}

/// A validated set of pipeline definitions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineCatalog {
    #[serde(rename = "pipeline", default)]
    pipelines: Vec<PipelineDefinition>,
}

impl PipelineCatalog {
    pub fn new(pipelines: Vec<PipelineDefinition>) -> Result<Self> {
        let catalog = Self { pipelines };
        catalog.validate()?;
        Ok(catalog)
    }

    /// The builtin `ci` and `cd` pipelines for `image`.
    pub fn builtin(image: &str) -> Self {
        Self {
            pipelines: vec![
                PipelineDefinition::builtin_ci(image),
                PipelineDefinition::builtin_cd(image),
            ],
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let catalog: Self = toml::from_str(s)?;
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pipelines.is_empty() {
            return Err(PipelineError::InvalidDefinition(
                "no pipelines defined".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for pipeline in &self.pipelines {
            pipeline.validate()?;
            if !seen.insert(pipeline.id.as_str()) {
                return Err(PipelineError::InvalidDefinition(format!(
                    "duplicate pipeline id '{}'",
                    pipeline.id
                )));
            }
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<&PipelineDefinition> {
        self.pipelines
            .iter()
            .find(|p| p.id == id)
            .ok_or_else(|| PipelineError::UnknownPipeline(id.to_string()))
    }

    pub fn pipelines(&self) -> &[PipelineDefinition] {
        &self.pipelines
    }

    /// Ids of pipelines that `id`'s entry gate waits on.
    pub fn upstream_of(&self, id: &str) -> Result<Vec<String>> {
        fn collect(gate: &Gate, out: &mut Vec<String>) {
            match gate {
                Gate::UpstreamSuccess { pipeline } => out.push(pipeline.clone()),
                Gate::AnyOf { gates } => gates.iter().for_each(|g| collect(g, out)),
                _ => {}
            }
        }
        let mut out = Vec::new();
        collect(&self.get(id)?.entry_gate, &mut out);
        Ok(out)
    }
}
