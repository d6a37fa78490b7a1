//! Readiness probes: read-only queries that report whether a target is ready.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// A read-only readiness query.
///
/// Implementations must not change the state of the target they query.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    /// Human-readable description of the target.
    fn describe(&self) -> String;

    /// Query the target once.
    ///
    /// Errors are treated by the poller as "not ready yet".
    async fn is_ready(&self) -> anyhow::Result<bool>;
}

/// Serializable description of a probe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProbeSpec {
    /// GET a URL; ready on any 2xx response.
    Http { url: String },

    /// Query a Kubernetes deployment's rollout status via kubectl.
    Deployment {
        namespace: String,
        name: String,
        #[serde(default = "default_kubectl")]
        kubectl: String,
    },
}

fn default_kubectl() -> String {
    "kubectl".to_string()
}

impl ProbeSpec {
    pub fn http(url: impl Into<String>) -> Self {
        ProbeSpec::Http { url: url.into() }
    }

    pub fn deployment(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        ProbeSpec::Deployment {
            namespace: namespace.into(),
            name: name.into(),
            kubectl: default_kubectl(),
        }
    }

    /// Build the probe this entry describes.
    pub fn build(&self, client: &reqwest::Client) -> Box<dyn ReadinessProbe> {
        match self {
            ProbeSpec::Http { url } => Box::new(HttpProbe::new(client.clone(), url.clone())),
            ProbeSpec::Deployment {
                namespace,
                name,
                kubectl,
            } => Box::new(
                DeploymentProbe::new(namespace.clone(), name.clone()).with_kubectl(kubectl.clone()),
            ),
        }
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        match self {
            ProbeSpec::Http { url } if !(url.starts_with("http://") || url.starts_with("https://")) => {
                Err(format!("http probe url must be http(s): {}", url))
            }
            ProbeSpec::Deployment { namespace, name, .. }
                if namespace.trim().is_empty() || name.trim().is_empty() =>
            {
                Err("deployment probe requires namespace and name".to_string())
            }
            _ => Ok(()),
        }
    }
}

impl std::fmt::Display for ProbeSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeSpec::Http { url } => write!(f, "{}", url),
            ProbeSpec::Deployment {
                namespace, name, ..
            } => write!(f, "deployment/{} (ns {})", name, namespace),
        }
    }
}

/// Ready when a GET returns a 2xx status.
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpProbe {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl ReadinessProbe for HttpProbe {
    fn describe(&self) -> String {
        self.url.clone()
    }

    async fn is_ready(&self) -> anyhow::Result<bool> {
        let response = self.client.get(&self.url).send().await?;
        debug!(url = %self.url, status = %response.status(), "HTTP readiness probe");
        Ok(response.status().is_success())
    }
}

/// Ready when every declared replica is updated, ready and available.
pub struct DeploymentProbe {
    namespace: String,
    name: String,
    kubectl: String,
}

impl DeploymentProbe {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            kubectl: default_kubectl(),
        }
    }

    /// Use a different kubectl executable.
    pub fn with_kubectl(mut self, kubectl: impl Into<String>) -> Self {
        self.kubectl = kubectl.into();
        self
    }
}

#[async_trait]
impl ReadinessProbe for DeploymentProbe {
    fn describe(&self) -> String {
        format!("deployment/{} (ns {})", self.name, self.namespace)
    }

    async fn is_ready(&self) -> anyhow::Result<bool> {
        let output = Command::new(&self.kubectl)
            .args(["get", "deployment", &self.name, "-n", &self.namespace, "-o", "json"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            anyhow::bail!(
                "{} get deployment {} failed: {}",
                self.kubectl,
                self.name,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let doc: serde_json::Value = serde_json::from_slice(&output.stdout)?;
        let status = DeploymentStatus::from_json(&doc);
        debug!(
            deployment = %self.name,
            desired = status.desired,
            ready = status.ready,
            updated = status.updated,
            available = status.available,
            "Deployment readiness probe"
        );
        Ok(status.is_ready())
    }
}

/// Replica counts extracted from a `kubectl get deployment -o json` document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeploymentStatus {
    pub desired: u64,
    pub ready: u64,
    pub updated: u64,
    pub available: u64,
}

impl DeploymentStatus {
    pub fn from_json(doc: &serde_json::Value) -> Self {
        let count = |pointer: &str| doc.pointer(pointer).and_then(|v| v.as_u64()).unwrap_or(0);
        Self {
            // Kubernetes defaults spec.replicas to 1 when omitted.
            desired: doc
                .pointer("/spec/replicas")
                .and_then(|v| v.as_u64())
                .unwrap_or(1),
            ready: count("/status/readyReplicas"),
            updated: count("/status/updatedReplicas"),
            available: count("/status/availableReplicas"),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.desired > 0
            && self.ready == self.desired
            && self.updated == self.desired
            && self.available == self.desired
    }
}
