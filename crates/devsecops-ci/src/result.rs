//! Stage and pipeline results, run state and report rendering.

use crate::gate::{GateContext, GateVerdict, TriggerKind};
use crate::stage::FailurePolicy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

/// Overall outcome of a pipeline run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failed,
    Aborted,
    /// The entry gate rejected the run. Not a failure.
    Skipped,
}

impl Outcome {
    /// Process exit code reported to the automation platform.
    pub fn exit_code(&self) -> i32 {
        match self {
            Outcome::Success | Outcome::Skipped => 0,
            Outcome::Failed => 1,
            Outcome::Aborted => 2,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => write!(f, "SUCCESS"),
            Outcome::Failed => write!(f, "FAILED"),
            Outcome::Aborted => write!(f, "ABORTED"),
            Outcome::Skipped => write!(f, "SKIPPED"),
        }
    }
}

/// Why a stage failed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// The command exited with an unexpected code.
    StageFailure { expected: i32, actual: i32 },

    /// The command could not be spawned.
    ToolUnavailable { message: String },

    /// A secret the stage requires is absent from the environment.
    MissingCredential { name: String },

    /// The command outlived its per-stage timeout.
    StageTimeout { timeout_secs: u64 },

    /// The readiness target never became ready.
    ReadinessTimeout {
        target: String,
        attempts: u32,
        elapsed_ms: u64,
    },

    /// A runtime check got an unexpected response.
    VerificationFailure {
        check: String,
        actual_status: Option<u16>,
        actual_body: String,
    },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::StageFailure { expected, actual } => {
                write!(f, "exit code {} (expected {})", actual, expected)
            }
            FailureReason::ToolUnavailable { message } => {
                write!(f, "tool unavailable: {}", message)
            }
            FailureReason::MissingCredential { name } => {
                write!(f, "missing credential: {}", name)
            }
            FailureReason::StageTimeout { timeout_secs } => {
                write!(f, "timed out after {}s", timeout_secs)
            }
            FailureReason::ReadinessTimeout {
                target,
                attempts,
                elapsed_ms,
            } => write!(
                f,
                "{} not ready after {} attempt(s) in {}ms",
                target, attempts, elapsed_ms
            ),
            FailureReason::VerificationFailure {
                check,
                actual_status,
                actual_body,
            } => {
                let status = actual_status
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "no response".to_string());
                write!(
                    f,
                    "check {} failed: status {}, body {:?}",
                    check, status, actual_body
                )
            }
        }
    }
}

/// Outcome of a single stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageOutcome {
    Passed,
    Failed { reason: FailureReason },
}

/// Result of a stage execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageResult {
    /// Stage name.
    pub stage_name: String,

    /// Passed, or failed with a reason.
    pub outcome: StageOutcome,

    /// Failure policy the stage ran under.
    pub on_failure: FailurePolicy,

    /// Exit code, when a process ran to completion.
    pub exit_code: Option<i32>,

    /// Captured stdout.
    pub stdout: String,

    /// Captured stderr.
    pub stderr: String,

    /// Duration in milliseconds.
    pub duration_ms: u64,
}

impl StageResult {
    pub fn passed(
        stage_name: impl Into<String>,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
        duration_ms: u64,
    ) -> Self {
        Self {
            stage_name: stage_name.into(),
            outcome: StageOutcome::Passed,
            on_failure: FailurePolicy::Abort,
            exit_code,
            stdout,
            stderr,
            duration_ms,
        }
    }

    pub fn failed(stage_name: impl Into<String>, reason: FailureReason, duration_ms: u64) -> Self {
        Self {
            stage_name: stage_name.into(),
            outcome: StageOutcome::Failed { reason },
            on_failure: FailurePolicy::Abort,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms,
        }
    }

    pub fn with_policy(mut self, on_failure: FailurePolicy) -> Self {
        self.on_failure = on_failure;
        self
    }

    pub fn with_output(mut self, exit_code: Option<i32>, stdout: String, stderr: String) -> Self {
        self.exit_code = exit_code;
        self.stdout = stdout;
        self.stderr = stderr;
        self
    }

    /// Whether this stage passed.
    pub fn is_passed(&self) -> bool {
        matches!(self.outcome, StageOutcome::Passed)
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        match &self.outcome {
            StageOutcome::Passed => None,
            StageOutcome::Failed { reason } => Some(reason),
        }
    }

    /// Output shown in reports: stderr for failures when present, else stdout.
    fn display_output(&self) -> &str {
        if !self.is_passed() && !self.stderr.trim().is_empty() {
            self.stderr.trim()
        } else {
            self.stdout.trim()
        }
    }
}

/// Why a run was aborted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AbortReason {
    /// Cancelled by an external interrupt.
    Cancelled,
    /// The pipeline-level timeout expired.
    PipelineTimeout { timeout_secs: u64 },
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::Cancelled => write!(f, "cancelled"),
            AbortReason::PipelineTimeout { timeout_secs } => {
                write!(f, "pipeline timed out after {}s", timeout_secs)
            }
        }
    }
}

/// Lifecycle of a single pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Pending,
    GateEvaluated { passed: bool },
    Running,
    Success,
    Failed,
    Aborted,
    Skipped,
}

impl RunState {
    pub fn can_transition_to(&self, next: &RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Pending, GateEvaluated { .. })
                | (GateEvaluated { passed: true }, Running)
                | (GateEvaluated { passed: false }, Skipped)
                | (Running, Success)
                | (Running, Failed)
                | (Running, Aborted)
        )
    }
}

/// Result of a complete pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineResult {
    pub run_id: Uuid,

    pub pipeline_id: String,

    /// Digest of the pipeline definition that ran.
    pub definition_digest: String,

    pub branch: String,

    pub trigger: TriggerKind,

    pub gate: GateVerdict,

    /// Executed stages, in execution order.
    pub stages: Vec<StageResult>,

    pub outcome: Outcome,

    /// Set when `outcome` is `Aborted`.
    pub abort_reason: Option<AbortReason>,

    pub started_at: DateTime<Utc>,

    pub finished_at: DateTime<Utc>,

    /// Total duration in milliseconds.
    pub duration_ms: u64,
}

impl PipelineResult {
    /// Number of stages that passed.
    pub fn passed_count(&self) -> usize {
        self.stages.iter().filter(|s| s.is_passed()).count()
    }

    /// Number of stages that failed.
    pub fn failed_count(&self) -> usize {
        self.stages.iter().filter(|s| !s.is_passed()).count()
    }

    /// Whether a stage with this name was executed.
    pub fn executed(&self, stage_name: &str) -> bool {
        self.stages.iter().any(|s| s.stage_name == stage_name)
    }

    /// The stage that halted the run, if any.
    pub fn halting_stage(&self) -> Option<&StageResult> {
        if self.outcome != Outcome::Failed {
            return None;
        }
        self.stages
            .iter()
            .rev()
            .find(|s| !s.is_passed() && s.on_failure == FailurePolicy::Abort)
    }

    pub fn exit_code(&self) -> i32 {
        self.outcome.exit_code()
    }

    /// Render the per-stage table plus overall outcome.
    ///
    /// Output columns are truncated to `width` characters.
    pub fn render_table(&self, width: usize) -> String {
        let name_width = self
            .stages
            .iter()
            .map(|s| s.stage_name.chars().count())
            .max()
            .unwrap_or(0)
            .max("STAGE".len());

        let mut out = format!(
            "Pipeline: {} (run {})\nBranch: {}  Trigger: {}\nGate: {}\n\n",
            self.pipeline_id, self.run_id, self.branch, self.trigger, self.gate.message
        );

        if !self.stages.is_empty() {
            out.push_str(&format!(
                "{:<nw$}  {:<8}  {:>10}  {}\n",
                "STAGE",
                "OUTCOME",
                "DURATION",
                "OUTPUT",
                nw = name_width
            ));
            for stage in &self.stages {
                let (label, detail) = match &stage.outcome {
                    StageOutcome::Passed => ("passed", first_line(stage.display_output())),
                    StageOutcome::Failed { reason } => ("failed", reason.to_string()),
                };
                out.push_str(&format!(
                    "{:<nw$}  {:<8}  {:>8}ms  {}\n",
                    stage.stage_name,
                    label,
                    stage.duration_ms,
                    truncate(&detail, width),
                    nw = name_width
                ));
            }
            out.push('\n');
        }

        out.push_str(&format!(
            "Outcome: {} ({} passed, {} failed, {}ms)\n",
            self.outcome,
            self.passed_count(),
            self.failed_count(),
            self.duration_ms
        ));
        if let Some(reason) = &self.abort_reason {
            out.push_str(&format!("Aborted: {}\n", reason));
        }
        if let Some(stage) = self.halting_stage() {
            out.push_str(&format!("Halted at: {}\n", stage.stage_name));
            let output = stage.display_output();
            if !output.is_empty() {
                out.push_str(&format!("Output: {}\n", truncate(output, width)));
            }
        }
        out
    }
}

fn first_line(s: &str) -> String {
    s.lines().next().unwrap_or("").to_string()
}

/// Truncate to `width` characters, marking the cut with `...`.
pub fn truncate(s: &str, width: usize) -> String {
    let flat: String = s
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect();
    if flat.chars().count() <= width {
        return flat;
    }
    if width <= 3 {
        return flat.chars().take(width).collect();
    }
    let mut cut: String = flat.chars().take(width - 3).collect();
    cut.push_str("...");
    cut
}

/// Accumulates a run's results. Owned exclusively by the runner and
/// consumed by [`RunRecorder::finish`].
pub(crate) struct RunRecorder {
    run_id: Uuid,
    pipeline_id: String,
    definition_digest: String,
    branch: String,
    trigger: TriggerKind,
    gate: Option<GateVerdict>,
    stages: Vec<StageResult>,
    state: RunState,
    started_at: DateTime<Utc>,
    clock: Instant,
}

impl RunRecorder {
    pub(crate) fn start(pipeline_id: &str, definition_digest: String, ctx: &GateContext) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            pipeline_id: pipeline_id.to_string(),
            definition_digest,
            branch: ctx.branch.clone(),
            trigger: ctx.trigger,
            gate: None,
            stages: Vec::new(),
            state: RunState::Pending,
            started_at: Utc::now(),
            clock: Instant::now(),
        }
    }

    pub(crate) fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub(crate) fn transition(&mut self, next: RunState) {
        debug_assert!(
            self.state.can_transition_to(&next),
            "illegal run state transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!(run_id = %self.run_id, from = ?self.state, to = ?next, "Run state transition");
        self.state = next;
    }

    pub(crate) fn gate_evaluated(&mut self, verdict: GateVerdict) {
        self.transition(RunState::GateEvaluated {
            passed: verdict.passed,
        });
        self.gate = Some(verdict);
    }

    pub(crate) fn record(&mut self, result: StageResult) {
        self.stages.push(result);
    }

    pub(crate) fn finish(
        mut self,
        outcome: Outcome,
        abort_reason: Option<AbortReason>,
    ) -> PipelineResult {
        let terminal = match outcome {
            Outcome::Success => RunState::Success,
            Outcome::Failed => RunState::Failed,
            Outcome::Aborted => RunState::Aborted,
            Outcome::Skipped => RunState::Skipped,
        };
        self.transition(terminal);

        let duration_ms = self.clock.elapsed().as_millis() as u64;
        info!(
            run_id = %self.run_id,
            pipeline = %self.pipeline_id,
            outcome = %outcome,
            stages = self.stages.len(),
            duration_ms,
            "Pipeline run finished"
        );

        PipelineResult {
            run_id: self.run_id,
            pipeline_id: self.pipeline_id,
            definition_digest: self.definition_digest,
            branch: self.branch,
            trigger: self.trigger,
            gate: self.gate.unwrap_or_else(|| GateVerdict {
                passed: false,
                message: "gate not evaluated".to_string(),
            }),
            stages: self.stages,
            outcome,
            abort_reason,
            started_at: self.started_at,
            finished_at: Utc::now(),
            duration_ms,
        }
    }
}
