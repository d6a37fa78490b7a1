//! DevSecOps CI - pipeline orchestration core
//!
//! Provides a sequential CI/CD pipeline runner that:
//! - Evaluates an entry gate against the trigger context
//! - Executes stages in declaration order, halting on the first abort-policy failure
//! - Waits for deployed workloads to become ready and verifies them with synthetic requests
//! - Renders and persists a per-stage result report

pub mod config;
pub mod definition;
pub mod error;
pub mod gate;
pub mod pipeline;
pub mod poller;
pub mod probe;
pub mod result;
pub mod runner;
pub mod stage;
pub mod store;
pub mod telemetry;
pub mod verifier;

// Re-export key types
pub use config::RunnerConfig;
pub use definition::{PipelineCatalog, PipelineDefinition, DEFAULT_IMAGE};
pub use error::{PipelineError, Result};
pub use gate::{Gate, GateContext, GateVerdict, TriggerKind};
pub use pipeline::{CancelFlag, PipelineRunner};
pub use poller::{PollOutcome, PollTarget, ReadinessPoller};
pub use probe::{DeploymentProbe, HttpProbe, ProbeSpec, ReadinessProbe};
pub use result::{AbortReason, FailureReason, Outcome, PipelineResult, StageOutcome, StageResult};
pub use runner::{ProcessExecutor, StageExecutor};
pub use stage::{BuiltinStage, FailurePolicy, StageConfig};
pub use store::ResultStore;
pub use verifier::{BodyExpectation, HttpMethod, RuntimeCheck, RuntimeVerifier, Verification};
