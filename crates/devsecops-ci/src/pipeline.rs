//! Pipeline orchestration: gate, fail-fast stage sequence, result.

use crate::definition::PipelineDefinition;
use crate::gate::GateContext;
use crate::result::{AbortReason, Outcome, PipelineResult, RunRecorder, RunState};
use crate::runner::StageExecutor;
use crate::stage::FailurePolicy;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Cooperative cancellation, observed between stages.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Runs pipeline definitions one stage at a time.
pub struct PipelineRunner<E: StageExecutor> {
    executor: E,
    cancel: CancelFlag,
}

impl<E: StageExecutor> PipelineRunner<E> {
    pub fn new(executor: E) -> Self {
        Self {
            executor,
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Handle that cancels the current or next run.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Execute a pipeline.
    ///
    /// - Entry gate closed: `Skipped`, no stage runs.
    /// - A stage with `on_failure = abort` fails: `Failed`, later stages never run.
    /// - Cancellation or pipeline timeout seen before a stage: `Aborted`.
    /// - Otherwise: `Success`.
    pub async fn run(
        &mut self,
        definition: &PipelineDefinition,
        ctx: &GateContext,
    ) -> PipelineResult {
        let mut recorder = RunRecorder::start(&definition.id, definition.digest(), ctx);
        let run_id = recorder.run_id();

        info!(
            run_id = %run_id,
            pipeline = %definition.id,
            branch = %ctx.branch,
            trigger = %ctx.trigger,
            "Starting pipeline run"
        );

        let verdict = definition.entry_gate.verdict(ctx);
        let gate_passed = verdict.passed;
        info!(run_id = %run_id, passed = gate_passed, "{}", verdict.message);
        recorder.gate_evaluated(verdict);

        if !gate_passed {
            return recorder.finish(Outcome::Skipped, None);
        }

        recorder.transition(RunState::Running);
        // A budget too large to represent is no deadline at all.
        let deadline = definition
            .timeout_secs
            .and_then(|secs| Instant::now().checked_add(Duration::from_secs(secs)));

        let mut outcome = Outcome::Success;
        let mut abort_reason = None;

        for stage in &definition.stages {
            if self.cancel.is_cancelled() {
                warn!(run_id = %run_id, stage = %stage.name, "Run cancelled before stage");
                outcome = Outcome::Aborted;
                abort_reason = Some(AbortReason::Cancelled);
                break;
            }
            if let (Some(deadline), Some(secs)) = (deadline, definition.timeout_secs) {
                if Instant::now() >= deadline {
                    warn!(run_id = %run_id, stage = %stage.name, "Pipeline timeout reached");
                    outcome = Outcome::Aborted;
                    abort_reason = Some(AbortReason::PipelineTimeout { timeout_secs: secs });
                    break;
                }
            }

            info!(run_id = %run_id, stage = %stage.name, "Executing stage");
            let result = self.executor.execute(stage).await;

            let failure = result.failure().cloned();
            recorder.record(result);

            let Some(reason) = failure else {
                info!(run_id = %run_id, stage = %stage.name, "Stage passed");
                continue;
            };

            match stage.on_failure {
                FailurePolicy::Abort => {
                    warn!(run_id = %run_id, stage = %stage.name, %reason, "Stage failed, halting pipeline");
                    outcome = Outcome::Failed;
                    break;
                }
                FailurePolicy::Continue => {
                    warn!(run_id = %run_id, stage = %stage.name, %reason, "Advisory stage failed, continuing");
                }
            }
        }

        self.executor.shutdown().await;
        recorder.finish(outcome, abort_reason)
    }
}
