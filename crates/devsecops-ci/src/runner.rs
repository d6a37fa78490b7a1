//! Stage execution: external commands, readiness waits and runtime checks.

use crate::poller::{PollOutcome, ReadinessPoller};
use crate::result::{FailureReason, StageResult};
use crate::stage::StageConfig;
use crate::verifier::{RuntimeVerifier, Verification};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Default per-stage timeout in seconds.
pub const DEFAULT_STAGE_TIMEOUT_SECS: u64 = 600;

/// Timeout for each stage teardown command.
const CLEANUP_TIMEOUT_SECS: u64 = 120;

/// Executes one stage and reports its result.
///
/// Failures are returned as data in the [`StageResult`], never as errors, so
/// the pipeline runner applies one failure policy to every kind of stage.
#[async_trait]
pub trait StageExecutor: Send {
    async fn execute(&mut self, stage: &StageConfig) -> StageResult;

    /// Release anything the executor kept alive across stages.
    async fn shutdown(&mut self) {}
}

/// Captured output of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Runs stages as local processes.
///
/// Detached stage processes are kept until [`StageExecutor::shutdown`] or
/// drop, whichever comes first. Stage cleanup commands run on shutdown,
/// last registered first.
pub struct ProcessExecutor {
    poller: ReadinessPoller,
    verifier: RuntimeVerifier,
    default_timeout_secs: u64,
    detached: Vec<(String, Child)>,
    cleanups: Vec<(String, Vec<String>)>,
}

impl ProcessExecutor {
    pub fn new(client: reqwest::Client, default_timeout_secs: u64) -> Self {
        Self {
            poller: ReadinessPoller::new(client.clone()),
            verifier: RuntimeVerifier::new(client),
            default_timeout_secs,
            detached: Vec::new(),
            cleanups: Vec::new(),
        }
    }

    /// Run a command to completion, bounded by `timeout_secs` (0 disables).
    pub async fn run_command(
        command: &[String],
        timeout_secs: u64,
    ) -> Result<CommandOutput, FailureReason> {
        let (exe, args) = command.split_first().ok_or_else(|| FailureReason::ToolUnavailable {
            message: "empty command".to_string(),
        })?;

        let child = Command::new(exe)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| FailureReason::ToolUnavailable {
                message: format!("{}: {}", exe, e),
            })?;

        let waited = if timeout_secs > 0 {
            match tokio::time::timeout(
                Duration::from_secs(timeout_secs),
                child.wait_with_output(),
            )
            .await
            {
                Ok(waited) => waited,
                Err(_) => return Err(FailureReason::StageTimeout { timeout_secs }),
            }
        } else {
            child.wait_with_output().await
        };

        let output = waited.map_err(|e| FailureReason::ToolUnavailable {
            message: format!("{}: {}", exe, e),
        })?;

        Ok(CommandOutput {
            // Killed by a signal: no exit code.
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    fn spawn_detached(&mut self, stage: &StageConfig) -> Result<(), FailureReason> {
        let (exe, args) = stage
            .command
            .split_first()
            .ok_or_else(|| FailureReason::ToolUnavailable {
                message: "empty command".to_string(),
            })?;

        let child = Command::new(exe)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| FailureReason::ToolUnavailable {
                message: format!("{}: {}", exe, e),
            })?;

        info!(stage = %stage.name, pid = ?child.id(), "Started detached process");
        self.detached.push((stage.name.clone(), child));
        Ok(())
    }

    /// Number of cleanup commands waiting for shutdown.
    pub fn pending_cleanup_count(&self) -> usize {
        self.cleanups.len()
    }

    /// Number of detached processes currently held.
    pub fn detached_count(&self) -> usize {
        self.detached.len()
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

fn missing_credential(stage: &StageConfig) -> Option<FailureReason> {
    stage
        .required_env
        .iter()
        .find(|name| std::env::var_os(name.as_str()).map_or(true, |v| v.is_empty()))
        .map(|name| FailureReason::MissingCredential { name: name.clone() })
}

#[async_trait]
impl StageExecutor for ProcessExecutor {
    async fn execute(&mut self, stage: &StageConfig) -> StageResult {
        let start = Instant::now();

        if let Some(reason) = missing_credential(stage) {
            warn!(stage = %stage.name, %reason, "Stage cannot start");
            return StageResult::failed(&stage.name, reason, elapsed_ms(start))
                .with_policy(stage.on_failure);
        }

        // Registered before the command runs: a failed or timed out stage
        // may still have created what the cleanup removes.
        if !stage.cleanup.is_empty() {
            self.cleanups.push((stage.name.clone(), stage.cleanup.clone()));
        }

        let mut exit_code = None;
        let mut stdout = String::new();
        let mut stderr = String::new();

        if stage.is_noop() {
            info!(stage = %stage.name, "No-op stage");
        } else if stage.detach {
            if let Err(reason) = self.spawn_detached(stage) {
                return StageResult::failed(&stage.name, reason, elapsed_ms(start))
                    .with_policy(stage.on_failure);
            }
        } else if !stage.command.is_empty() {
            let timeout_secs = stage.effective_timeout_secs(self.default_timeout_secs);
            debug!(stage = %stage.name, command = ?stage.command, timeout_secs, "Running command");

            let output = match Self::run_command(&stage.command, timeout_secs).await {
                Ok(output) => output,
                Err(reason) => {
                    return StageResult::failed(&stage.name, reason, elapsed_ms(start))
                        .with_policy(stage.on_failure);
                }
            };

            if output.exit_code != stage.expected_exit_code {
                let reason = FailureReason::StageFailure {
                    expected: stage.expected_exit_code,
                    actual: output.exit_code,
                };
                return StageResult::failed(&stage.name, reason, elapsed_ms(start))
                    .with_policy(stage.on_failure)
                    .with_output(Some(output.exit_code), output.stdout, output.stderr);
            }

            exit_code = Some(output.exit_code);
            stdout = output.stdout;
            stderr = output.stderr;
        }

        if let Some(target) = &stage.readiness {
            if let PollOutcome::TimedOut { attempts, elapsed } = self.poller.poll(target).await {
                let reason = FailureReason::ReadinessTimeout {
                    target: target.probe.to_string(),
                    attempts,
                    elapsed_ms: elapsed.as_millis() as u64,
                };
                return StageResult::failed(&stage.name, reason, elapsed_ms(start))
                    .with_policy(stage.on_failure)
                    .with_output(exit_code, stdout, stderr);
            }
        }

        if let Some(base_url) = &stage.base_url {
            for check in &stage.checks {
                if let Verification::Fail {
                    actual_status,
                    actual_body,
                } = self.verifier.verify(check, base_url).await
                {
                    let reason = FailureReason::VerificationFailure {
                        check: check.to_string(),
                        actual_status,
                        actual_body,
                    };
                    return StageResult::failed(&stage.name, reason, elapsed_ms(start))
                        .with_policy(stage.on_failure)
                        .with_output(exit_code, stdout, stderr);
                }
            }
        }

        StageResult::passed(&stage.name, exit_code, stdout, stderr, elapsed_ms(start))
            .with_policy(stage.on_failure)
    }

    async fn shutdown(&mut self) {
        for (stage, mut child) in self.detached.drain(..) {
            match child.kill().await {
                Ok(()) => info!(stage = %stage, "Stopped detached process"),
                Err(e) => warn!(stage = %stage, error = %e, "Failed to stop detached process"),
            }
        }

        while let Some((stage, command)) = self.cleanups.pop() {
            match Self::run_command(&command, CLEANUP_TIMEOUT_SECS).await {
                Ok(output) if output.exit_code == 0 => {
                    info!(stage = %stage, "Stage cleanup finished")
                }
                Ok(output) => warn!(
                    stage = %stage,
                    exit_code = output.exit_code,
                    stderr = %output.stderr.trim(),
                    "Stage cleanup failed"
                ),
                Err(reason) => warn!(stage = %stage, %reason, "Stage cleanup failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::StageOutcome;

    fn executor() -> ProcessExecutor {
        ProcessExecutor::new(reqwest::Client::new(), DEFAULT_STAGE_TIMEOUT_SECS)
    }

    #[tokio::test]
    async fn test_execute_simple_command() {
        let config = StageConfig::custom(
            "echo_test",
            vec!["echo".to_string(), "hello".to_string()],
            60,
        );

        let result = executor().execute(&config).await;
        assert!(result.is_passed());
        assert_eq!(result.exit_code, Some(0));
        assert!(result.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn test_execute_failing_command() {
        let config = StageConfig::custom("false_test", vec!["false".to_string()], 60);

        let result = executor().execute(&config).await;
        assert!(!result.is_passed());
        assert_eq!(result.exit_code, Some(1));
        assert_eq!(
            result.failure(),
            Some(&FailureReason::StageFailure {
                expected: 0,
                actual: 1
            })
        );
    }

    #[tokio::test]
    async fn test_expected_exit_code_other_than_zero() {
        let config =
            StageConfig::custom("false_ok", vec!["false".to_string()], 60).with_expected_exit_code(1);
        let result = executor().execute(&config).await;
        assert!(result.is_passed());

        let config = StageConfig::custom("true_bad", vec!["true".to_string()], 60)
            .with_expected_exit_code(1);
        let result = executor().execute(&config).await;
        assert!(!result.is_passed());
    }

    #[tokio::test]
    async fn test_missing_tool_is_tool_unavailable() {
        let config = StageConfig::custom(
            "missing",
            vec!["/nonexistent-binary-that-does-not-exist".to_string()],
            5,
        );
        let result = executor().execute(&config).await;
        assert!(matches!(
            result.failure(),
            Some(FailureReason::ToolUnavailable { .. })
        ));
        assert_eq!(result.exit_code, None);
    }

    #[tokio::test]
    async fn test_stage_timeout() {
        let config = StageConfig::custom(
            "sleepy",
            vec!["sleep".to_string(), "5".to_string()],
            1,
        );
        let result = executor().execute(&config).await;
        assert_eq!(
            result.failure(),
            Some(&FailureReason::StageTimeout { timeout_secs: 1 })
        );
    }

    #[tokio::test]
    async fn test_missing_credential_fails_before_spawn() {
        let config = StageConfig::custom(
            "push",
            vec!["/nonexistent-binary-that-does-not-exist".to_string()],
            5,
        )
        .requires_env(["DEVSECOPS_TEST_SECRET_THAT_IS_NEVER_SET"]);

        let result = executor().execute(&config).await;
        assert_eq!(
            result.failure(),
            Some(&FailureReason::MissingCredential {
                name: "DEVSECOPS_TEST_SECRET_THAT_IS_NEVER_SET".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_noop_stage_passes() {
        let result = executor().execute(&StageConfig::noop("dast")).await;
        assert_eq!(result.outcome, StageOutcome::Passed);
        assert_eq!(result.exit_code, None);
    }

    #[tokio::test]
    async fn test_policy_is_recorded() {
        let config = StageConfig::custom("advisory", vec!["false".to_string()], 5)
            .continue_on_failure();
        let result = executor().execute(&config).await;
        assert_eq!(result.on_failure, crate::stage::FailurePolicy::Continue);
    }

    #[tokio::test]
    async fn test_cleanup_runs_on_shutdown_in_reverse_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = dir.path().join("cleanup.log");
        let append = |line: &str| {
            vec![
                "sh".to_string(),
                "-c".to_string(),
                format!("echo {} >> '{}'", line, log.display()),
            ]
        };

        let mut executor = executor();
        let container = StageConfig::custom("container", vec!["true".to_string()], 5)
            .with_cleanup(append("container"));
        // Fails, but whatever it started still gets torn down.
        let cluster = StageConfig::custom("cluster", vec!["false".to_string()], 5)
            .with_cleanup(append("cluster"));

        assert!(executor.execute(&container).await.is_passed());
        assert!(!executor.execute(&cluster).await.is_passed());
        assert_eq!(executor.pending_cleanup_count(), 2);
        assert!(!log.exists());

        executor.shutdown().await;
        assert_eq!(executor.pending_cleanup_count(), 0);
        let ran = std::fs::read_to_string(&log).expect("cleanup log");
        assert_eq!(ran.lines().collect::<Vec<_>>(), vec!["cluster", "container"]);
    }

    #[tokio::test]
    async fn test_missing_credential_registers_no_cleanup() {
        let mut executor = executor();
        let config = StageConfig::custom("push", vec!["true".to_string()], 5)
            .requires_env(["DEVSECOPS_TEST_SECRET_THAT_IS_NEVER_SET"])
            .with_cleanup(vec!["true".to_string()]);
        assert!(!executor.execute(&config).await.is_passed());
        assert_eq!(executor.pending_cleanup_count(), 0);
    }

    #[tokio::test]
    async fn test_detached_process_is_stopped_on_shutdown() {
        let mut executor = executor();
        let config = StageConfig::custom(
            "tunnel",
            vec!["sleep".to_string(), "30".to_string()],
            0,
        )
        .detached();

        let result = executor.execute(&config).await;
        assert!(result.is_passed());
        assert_eq!(executor.detached_count(), 1);

        executor.shutdown().await;
        assert_eq!(executor.detached_count(), 0);
    }
}
