//! Stage definitions and configuration.

use crate::poller::PollTarget;
use crate::probe::ProbeSpec;
use crate::verifier::RuntimeCheck;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Secrets the image push stage reads from the environment.
pub const DOCKERHUB_USERNAME: &str = "DOCKERHUB_USERNAME";
pub const DOCKERHUB_TOKEN: &str = "DOCKERHUB_TOKEN";

/// What the runner does when a stage fails.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Halt the pipeline.
    #[default]
    Abort,
    /// Record the failure and keep going. Advisory stages only.
    Continue,
}

/// Builtin DevSecOps stages.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BuiltinStage {
    /// flake8 app
    Lint,

    /// pytest -q
    Test,

    /// bandit -r app
    StaticScan,

    /// pip-audit -r requirements.txt
    DependencyScan,

    /// docker build -t <image> .
    ImageBuild,

    /// trivy image --exit-code 1 --severity HIGH,CRITICAL <image>
    ImageScan,

    /// docker run -d, then health and echo checks against the container
    RuntimeContainerTest,

    /// Placeholder dynamic scan; always passes.
    Dast,

    /// docker login, tag and push
    ImagePush,

    /// kind create cluster
    ClusterSetup,

    /// kind load docker-image
    ImageLoad,

    /// kubectl apply, then wait for the deployment rollout
    Deploy,

    /// kubectl port-forward, then health and echo checks through the tunnel
    ServiceVerify,
}

/// Local port the runtime container test publishes the app on.
pub const CONTAINER_TEST_PORT: u16 = 8000;
/// Local port the service verification tunnel listens on.
pub const PORT_FORWARD_PORT: u16 = 8080;
/// Name of the cluster, deployment and service used by the CD pipeline.
pub const APP_NAME: &str = "devsecops-demo";
/// Container started by the runtime container test.
pub const CI_CONTAINER_NAME: &str = "devsecops-demo-ci";

impl BuiltinStage {
    /// Get the stage name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            BuiltinStage::Lint => "lint",
            BuiltinStage::Test => "test",
            BuiltinStage::StaticScan => "static-scan",
            BuiltinStage::DependencyScan => "dependency-scan",
            BuiltinStage::ImageBuild => "image-build",
            BuiltinStage::ImageScan => "image-scan",
            BuiltinStage::RuntimeContainerTest => "runtime-container-test",
            BuiltinStage::Dast => "dast",
            BuiltinStage::ImagePush => "image-push",
            BuiltinStage::ClusterSetup => "cluster-setup",
            BuiltinStage::ImageLoad => "image-load",
            BuiltinStage::Deploy => "deploy",
            BuiltinStage::ServiceVerify => "service-verify",
        }
    }

    /// Get the stage's command for the given image reference.
    pub fn command(&self, image: &str) -> Vec<String> {
        match self {
            BuiltinStage::Lint => args(["flake8", "app"]),
            BuiltinStage::Test => args(["pytest", "-q"]),
            BuiltinStage::StaticScan => args(["bandit", "-r", "app"]),
            BuiltinStage::DependencyScan => args(["pip-audit", "-r", "requirements.txt"]),
            BuiltinStage::ImageBuild => args(["docker", "build", "-t", image, "."]),
            BuiltinStage::ImageScan => args([
                "trivy",
                "image",
                "--exit-code",
                "1",
                "--severity",
                "HIGH,CRITICAL",
                image,
            ]),
            BuiltinStage::RuntimeContainerTest => {
                let publish = format!("{}:8000", CONTAINER_TEST_PORT);
                args([
                    "docker",
                    "run",
                    "-d",
                    "--rm",
                    "--name",
                    CI_CONTAINER_NAME,
                    "-p",
                    publish.as_str(),
                    image,
                ])
            }
            BuiltinStage::Dast => Vec::new(),
            BuiltinStage::ImagePush => {
                let script = format!(
                    "echo \"${token}\" | docker login -u \"${user}\" --password-stdin \
                     && docker tag {image} \"${user}/{app}:latest\" \
                     && docker push \"${user}/{app}:latest\"",
                    token = DOCKERHUB_TOKEN,
                    user = DOCKERHUB_USERNAME,
                    image = image,
                    app = APP_NAME,
                );
                args(["sh", "-c", script.as_str()])
            }
            BuiltinStage::ClusterSetup => {
                args(["kind", "create", "cluster", "--name", APP_NAME, "--wait", "60s"])
            }
            BuiltinStage::ImageLoad => {
                args(["kind", "load", "docker-image", image, "--name", APP_NAME])
            }
            BuiltinStage::Deploy => args(["kubectl", "apply", "-f", "k8s/"]),
            BuiltinStage::ServiceVerify => {
                let service = format!("svc/{}", APP_NAME);
                let ports = format!("{}:80", PORT_FORWARD_PORT);
                args(["kubectl", "port-forward", service.as_str(), ports.as_str()])
            }
        }
    }

    /// Default per-stage timeout in seconds.
    pub fn default_timeout_secs(&self) -> u64 {
        match self {
            BuiltinStage::Lint | BuiltinStage::Dast => 120,
            BuiltinStage::Test | BuiltinStage::StaticScan | BuiltinStage::DependencyScan => 300,
            BuiltinStage::RuntimeContainerTest | BuiltinStage::ServiceVerify => 120,
            BuiltinStage::ImageBuild
            | BuiltinStage::ImageScan
            | BuiltinStage::ImagePush
            | BuiltinStage::ClusterSetup
            | BuiltinStage::ImageLoad
            | BuiltinStage::Deploy => 900,
        }
    }
}

fn args<'a>(parts: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    parts.into_iter().map(str::to_string).collect()
}

/// Configuration for a pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageConfig {
    /// Stage name, unique within a pipeline.
    pub name: String,

    /// Command to execute (first element is executable). Empty means no-op.
    #[serde(default)]
    pub command: Vec<String>,

    /// Exit code that counts as success.
    #[serde(default)]
    pub expected_exit_code: i32,

    #[serde(default)]
    pub on_failure: FailurePolicy,

    /// Timeout in seconds. `None` uses the runner default, `Some(0)` disables.
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Environment variables that must be set before the command runs.
    #[serde(default)]
    pub required_env: Vec<String>,

    /// Leave the command running in the background for the rest of the run.
    #[serde(default)]
    pub detach: bool,

    /// Wait for this target after the command succeeds.
    #[serde(default)]
    pub readiness: Option<PollTarget>,

    /// Base URL the runtime checks are issued against.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Runtime checks issued once the target is ready.
    #[serde(default)]
    pub checks: Vec<RuntimeCheck>,

    /// Teardown command run when the pipeline run ends, for stages that
    /// leave something behind (containers, clusters).
    #[serde(default)]
    pub cleanup: Vec<String>,
}

impl StageConfig {
    /// Create a custom stage configuration.
    pub fn custom(name: impl Into<String>, command: Vec<String>, timeout_secs: u64) -> Self {
        Self {
            name: name.into(),
            command,
            expected_exit_code: 0,
            on_failure: FailurePolicy::Abort,
            timeout_secs: Some(timeout_secs),
            required_env: Vec::new(),
            detach: false,
            readiness: None,
            base_url: None,
            checks: Vec::new(),
            cleanup: Vec::new(),
        }
    }

    /// Create a stage that does nothing and passes.
    pub fn noop(name: impl Into<String>) -> Self {
        Self::custom(name, Vec::new(), 0)
    }

    /// Create a stage configuration from a builtin stage.
    pub fn from_builtin(stage: BuiltinStage, image: &str) -> Self {
        let config = Self::custom(stage.name(), stage.command(image), stage.default_timeout_secs());
        match stage {
            BuiltinStage::RuntimeContainerTest => {
                let base = format!("http://127.0.0.1:{}", CONTAINER_TEST_PORT);
                config
                    .with_readiness(PollTarget::from_parts(
                        ProbeSpec::http(format!("{}/health", base)),
                        Duration::from_secs(2),
                        Duration::from_secs(60),
                    ))
                    .with_checks(base, vec![RuntimeCheck::health(), RuntimeCheck::echo("hello")])
                    .with_cleanup(args(["docker", "rm", "-f", CI_CONTAINER_NAME]))
            }
            BuiltinStage::ImagePush => {
                config.requires_env([DOCKERHUB_USERNAME, DOCKERHUB_TOKEN])
            }
            BuiltinStage::ClusterSetup => {
                config.with_cleanup(args(["kind", "delete", "cluster", "--name", APP_NAME]))
            }
            BuiltinStage::Deploy => config.with_readiness(PollTarget::from_parts(
                ProbeSpec::deployment("default", APP_NAME),
                Duration::from_secs(5),
                Duration::from_secs(180),
            )),
            BuiltinStage::ServiceVerify => {
                let base = format!("http://127.0.0.1:{}", PORT_FORWARD_PORT);
                config
                    .detached()
                    .with_readiness(PollTarget::from_parts(
                        ProbeSpec::http(format!("{}/health", base)),
                        Duration::from_secs(1),
                        Duration::from_secs(30),
                    ))
                    .with_checks(base, vec![RuntimeCheck::health(), RuntimeCheck::echo("hello")])
            }
            _ => config,
        }
    }

    pub fn with_expected_exit_code(mut self, code: i32) -> Self {
        self.expected_exit_code = code;
        self
    }

    /// Record failures but let the pipeline continue.
    pub fn continue_on_failure(mut self) -> Self {
        self.on_failure = FailurePolicy::Continue;
        self
    }

    pub fn requires_env<'a>(mut self, names: impl IntoIterator<Item = &'a str>) -> Self {
        self.required_env
            .extend(names.into_iter().map(str::to_string));
        self
    }

    pub fn detached(mut self) -> Self {
        self.detach = true;
        self
    }

    pub fn with_readiness(mut self, target: PollTarget) -> Self {
        self.readiness = Some(target);
        self
    }

    pub fn with_checks(mut self, base_url: impl Into<String>, checks: Vec<RuntimeCheck>) -> Self {
        self.base_url = Some(base_url.into());
        self.checks = checks;
        self
    }

    /// Run `command` when the pipeline run ends.
    pub fn with_cleanup(mut self, command: Vec<String>) -> Self {
        self.cleanup = command;
        self
    }

    /// A stage with nothing to run, wait for or verify.
    pub fn is_noop(&self) -> bool {
        self.command.is_empty() && self.readiness.is_none() && self.checks.is_empty()
    }

    /// Effective timeout, falling back to `default_secs`. Zero disables.
    pub fn effective_timeout_secs(&self, default_secs: u64) -> u64 {
        self.timeout_secs.unwrap_or(default_secs)
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("stage name cannot be empty".to_string());
        }
        if self.command.first().is_some_and(|exe| exe.trim().is_empty()) {
            return Err(format!("stage '{}' has an empty executable", self.name));
        }
        if self.cleanup.first().is_some_and(|exe| exe.trim().is_empty()) {
            return Err(format!("stage '{}' has an empty cleanup executable", self.name));
        }
        if self.detach && self.command.is_empty() {
            return Err(format!(
                "stage '{}' is detached but has no command",
                self.name
            ));
        }
        if let Some(target) = &self.readiness {
            target
                .validate()
                .map_err(|e| format!("stage '{}': {}", self.name, e))?;
        }
        if !self.checks.is_empty() {
            match &self.base_url {
                Some(url) if url.starts_with("http://") || url.starts_with("https://") => {}
                Some(url) => {
                    return Err(format!(
                        "stage '{}' base_url must be http(s): {}",
                        self.name, url
                    ))
                }
                None => {
                    return Err(format!(
                        "stage '{}' has runtime checks but no base_url",
                        self.name
                    ))
                }
            }
        }
        if let Some(name) = self.required_env.iter().find(|n| n.trim().is_empty()) {
            return Err(format!(
                "stage '{}' has an empty required_env entry {:?}",
                self.name, name
            ));
        }
        Ok(())
    }
}
