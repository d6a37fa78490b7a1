//! Entry gate evaluation for pipeline runs.

use crate::result::Outcome;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// What kind of event triggered a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// A push to a branch.
    #[default]
    Push,
    /// Started explicitly by an operator.
    Manual,
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerKind::Push => write!(f, "push"),
            TriggerKind::Manual => write!(f, "manual"),
        }
    }
}

impl FromStr for TriggerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "push" => Ok(TriggerKind::Push),
            "manual" | "workflow_dispatch" => Ok(TriggerKind::Manual),
            other => Err(format!(
                "unknown trigger '{}' (expected 'push' or 'manual')",
                other
            )),
        }
    }
}

/// Inputs a gate may inspect. Supplied by the trigger layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GateContext {
    /// Branch the run was triggered for, without any `refs/heads/` prefix.
    pub branch: String,

    /// How the run was triggered.
    pub trigger: TriggerKind,

    /// Latest known outcome per upstream pipeline id.
    pub upstream: BTreeMap<String, Outcome>,
}

impl GateContext {
    pub fn new(branch: impl Into<String>, trigger: TriggerKind) -> Self {
        let branch = branch.into();
        let branch = branch
            .strip_prefix("refs/heads/")
            .map(str::to_string)
            .unwrap_or(branch);
        Self {
            branch,
            trigger,
            upstream: BTreeMap::new(),
        }
    }

    /// Record the outcome of an upstream pipeline.
    pub fn with_upstream(mut self, pipeline_id: impl Into<String>, outcome: Outcome) -> Self {
        self.upstream.insert(pipeline_id.into(), outcome);
        self
    }
}

/// A precondition that decides whether a pipeline run starts.
///
/// Evaluation is a pure function of the [`GateContext`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Gate {
    /// Always open.
    #[default]
    Always,

    /// Open when the branch matches. A trailing `*` matches any suffix.
    BranchMatch { branch: String },

    /// Open when the run was started manually.
    ManualTrigger,

    /// Open when the named upstream pipeline's latest outcome is `Success`.
    UpstreamSuccess { pipeline: String },

    /// Open when any inner gate is open.
    AnyOf { gates: Vec<Gate> },
}

impl Gate {
    pub fn branch(branch: impl Into<String>) -> Self {
        Gate::BranchMatch {
            branch: branch.into(),
        }
    }

    pub fn upstream(pipeline: impl Into<String>) -> Self {
        Gate::UpstreamSuccess {
            pipeline: pipeline.into(),
        }
    }

    pub fn any_of(gates: impl IntoIterator<Item = Gate>) -> Self {
        Gate::AnyOf {
            gates: gates.into_iter().collect(),
        }
    }

    /// Evaluate the gate against a run context.
    pub fn evaluate(&self, ctx: &GateContext) -> bool {
        match self {
            Gate::Always => true,
            Gate::BranchMatch { branch } => branch_matches(branch, &ctx.branch),
            Gate::ManualTrigger => ctx.trigger == TriggerKind::Manual,
            Gate::UpstreamSuccess { pipeline } => {
                ctx.upstream.get(pipeline) == Some(&Outcome::Success)
            }
            Gate::AnyOf { gates } => gates.iter().any(|g| g.evaluate(ctx)),
        }
    }

    /// Evaluate and explain the decision.
    pub fn verdict(&self, ctx: &GateContext) -> GateVerdict {
        let passed = self.evaluate(ctx);
        let message = if passed {
            format!("gate {} passed", self)
        } else {
            format!(
                "gate {} rejected (branch={}, trigger={})",
                self, ctx.branch, ctx.trigger
            )
        };
        GateVerdict { passed, message }
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        match self {
            Gate::BranchMatch { branch } if branch.trim().is_empty() => {
                Err("branch_match gate requires a branch".to_string())
            }
            Gate::UpstreamSuccess { pipeline } if pipeline.trim().is_empty() => {
                Err("upstream_success gate requires a pipeline id".to_string())
            }
            Gate::AnyOf { gates } if gates.is_empty() => {
                Err("any_of gate requires at least one gate".to_string())
            }
            Gate::AnyOf { gates } => gates.iter().try_for_each(Gate::validate),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Gate::Always => write!(f, "always"),
            Gate::BranchMatch { branch } => write!(f, "branch({})", branch),
            Gate::ManualTrigger => write!(f, "manual"),
            Gate::UpstreamSuccess { pipeline } => write!(f, "upstream({})", pipeline),
            Gate::AnyOf { gates } => {
                let parts: Vec<String> = gates.iter().map(|g| g.to_string()).collect();
                write!(f, "{}", parts.join(" | "))
            }
        }
    }
}

fn branch_matches(pattern: &str, branch: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => branch.starts_with(prefix),
        None => pattern == branch,
    }
}

/// Gate evaluation verdict.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GateVerdict {
    /// Whether the gate passed.
    pub passed: bool,

    /// Summary message.
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push(branch: &str) -> GateContext {
        GateContext::new(branch, TriggerKind::Push)
    }

    #[test]
    fn test_branch_match() {
        let gate = Gate::branch("main");
        assert!(gate.evaluate(&push("main")));
        assert!(gate.evaluate(&push("refs/heads/main")));
        assert!(!gate.evaluate(&push("feature/x")));
    }

    #[test]
    fn test_branch_prefix_match() {
        let gate = Gate::branch("release/*");
        assert!(gate.evaluate(&push("release/1.2")));
        assert!(!gate.evaluate(&push("main")));
    }

    #[test]
    fn test_manual_trigger() {
        let gate = Gate::ManualTrigger;
        assert!(gate.evaluate(&GateContext::new("dev", TriggerKind::Manual)));
        assert!(!gate.evaluate(&push("dev")));
    }

    #[test]
    fn test_upstream_success_requires_success() {
        let gate = Gate::upstream("ci");
        assert!(!gate.evaluate(&push("main")));
        assert!(!gate.evaluate(&push("main").with_upstream("ci", Outcome::Failed)));
        assert!(!gate.evaluate(&push("main").with_upstream("ci", Outcome::Skipped)));
        assert!(gate.evaluate(&push("main").with_upstream("ci", Outcome::Success)));
    }

    #[test]
    fn test_any_of_is_logical_or() {
        let gate = Gate::any_of([Gate::upstream("ci"), Gate::ManualTrigger]);

        let manual_after_failed_ci =
            GateContext::new("main", TriggerKind::Manual).with_upstream("ci", Outcome::Failed);
        assert!(gate.evaluate(&manual_after_failed_ci));

        let push_after_green_ci = push("main").with_upstream("ci", Outcome::Success);
        assert!(gate.evaluate(&push_after_green_ci));

        let push_after_failed_ci = push("main").with_upstream("ci", Outcome::Failed);
        assert!(!gate.evaluate(&push_after_failed_ci));
    }

    #[test]
    fn test_evaluate_is_deterministic() {
        let gate = Gate::any_of([Gate::branch("main"), Gate::ManualTrigger]);
        let ctx = push("main");
        let first = gate.evaluate(&ctx);
        for _ in 0..10 {
            assert_eq!(gate.evaluate(&ctx), first);
        }
    }

    #[test]
    fn test_verdict_message() {
        let gate = Gate::branch("main");
        let verdict = gate.verdict(&push("dev"));
        assert!(!verdict.passed);
        assert!(verdict.message.contains("rejected"));
        assert!(verdict.message.contains("branch=dev"));
    }

    #[test]
    fn test_trigger_from_str() {
        assert_eq!("push".parse::<TriggerKind>(), Ok(TriggerKind::Push));
        assert_eq!("Manual".parse::<TriggerKind>(), Ok(TriggerKind::Manual));
        assert!("cron".parse::<TriggerKind>().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_any_of() {
        assert!(Gate::AnyOf { gates: vec![] }.validate().is_err());
        assert!(Gate::branch(" ").validate().is_err());
        assert!(Gate::any_of([Gate::ManualTrigger]).validate().is_ok());
    }

    #[test]
    fn test_gate_toml_shape() {
        let gate: Gate = toml::from_str(
            r#"
            kind = "any_of"
            gates = [
                { kind = "upstream_success", pipeline = "ci" },
                { kind = "manual_trigger" },
            ]
            "#,
        )
        .expect("parse gate");
        assert_eq!(gate, Gate::any_of([Gate::upstream("ci"), Gate::ManualTrigger]));
    }
}
