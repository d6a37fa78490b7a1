//! DevSecOps pipeline CLI
//!
//! The `devsecops` command runs the gated CI/CD pipelines and inspects
//! their stored results.
//!
//! ## Commands
//!
//! - `run`: Execute a pipeline and print its report
//! - `list`: List pipelines with their gates and stages
//! - `show`: Print the latest stored result of a pipeline
//! - `validate`: Validate pipeline definitions

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use devsecops_ci::telemetry::init_tracing;
use devsecops_ci::{
    CancelFlag, GateContext, PipelineRunner, ProcessExecutor, ResultStore, RunnerConfig,
    TriggerKind,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{debug, warn, Level};

#[derive(Parser, Debug)]
#[command(name = "devsecops")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run gated CI/CD pipelines with readiness checks and runtime verification", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Pipeline definition file (default: builtin ci and cd pipelines)
    #[arg(long, global = true, env = "DEVSECOPS_PIPELINES")]
    pipelines: Option<PathBuf>,

    /// Directory for stored results (default: .devsecops/runs)
    #[arg(long, global = true, env = "DEVSECOPS_RESULTS_DIR")]
    results_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a pipeline
    Run {
        /// Pipeline id, e.g. `ci` or `cd`
        pipeline: String,

        /// Branch the run is for (default: $GITHUB_REF_NAME, then the current git branch)
        #[arg(long)]
        branch: Option<String>,

        /// How the run was triggered: push or manual
        #[arg(long, default_value = "push")]
        trigger: TriggerKind,
    },

    /// List pipelines, their entry gates and stages
    List,

    /// Show the latest stored result of a pipeline
    Show {
        /// Pipeline id
        pipeline: String,
    },

    /// Validate pipeline definitions without running anything
    Validate,
}

impl Cli {
    fn runner_config(&self) -> Result<RunnerConfig> {
        let mut config = RunnerConfig::from_env().context("Invalid runner configuration")?;
        if let Some(path) = &self.pipelines {
            config.pipelines_file = Some(path.clone());
        }
        if let Some(dir) = &self.results_dir {
            config.results_dir = dir.clone();
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    let config = cli.runner_config()?;

    let code = match cli.command {
        Commands::Run {
            pipeline,
            branch,
            trigger,
        } => {
            let cancel = CancelFlag::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received, cancelling after the current stage");
                    on_interrupt.cancel();
                }
            });
            cmd_run(&config, &pipeline, branch, trigger, cancel).await?
        }
        Commands::List => cmd_list(&config)?,
        Commands::Show { pipeline } => cmd_show(&config, &pipeline)?,
        Commands::Validate => cmd_validate(&config)?,
    };

    Ok(ExitCode::from(code))
}

/// Branch precedence: explicit flag, `GITHUB_REF_NAME`, git, `main`.
fn resolve_branch(
    explicit: Option<String>,
    ref_name: Option<String>,
    git_branch: impl FnOnce() -> Option<String>,
) -> String {
    explicit
        .filter(|b| !b.trim().is_empty())
        .or_else(|| ref_name.filter(|b| !b.trim().is_empty()))
        .or_else(git_branch)
        .unwrap_or_else(|| "main".to_string())
}

fn current_git_branch() -> Option<String> {
    let output = std::process::Command::new("git")
        .args(["rev-parse", "--abbrev-ref", "HEAD"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let branch = String::from_utf8_lossy(&output.stdout).trim().to_string();
    // Detached HEAD has no branch name.
    if branch.is_empty() || branch == "HEAD" {
        None
    } else {
        Some(branch)
    }
}

/// Run one pipeline, persist and print its result. Returns the process exit code.
async fn cmd_run(
    config: &RunnerConfig,
    pipeline_id: &str,
    branch: Option<String>,
    trigger: TriggerKind,
    cancel: CancelFlag,
) -> Result<u8> {
    let catalog = config
        .load_catalog()
        .context("Failed to load pipeline definitions")?;
    let definition = catalog.get(pipeline_id)?;
    let store = ResultStore::new(&config.results_dir);

    let branch = resolve_branch(
        branch,
        std::env::var("GITHUB_REF_NAME").ok(),
        current_git_branch,
    );
    let mut ctx = GateContext::new(branch, trigger);
    let upstream = catalog.upstream_of(pipeline_id)?;
    ctx.upstream = store
        .latest_outcomes(&upstream)
        .context("Failed to read upstream results")?;
    debug!(pipeline = %pipeline_id, upstream = ?ctx.upstream, "Gate context");

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .context("Failed to build HTTP client")?;
    let executor = ProcessExecutor::new(client, config.default_stage_timeout_secs);
    let mut runner = PipelineRunner::new(executor).with_cancel_flag(cancel);

    println!("Running pipeline: {}", definition.id);
    if let Some(description) = &definition.description {
        println!("{}", description);
    }
    println!("Stages: {}", definition.stage_names().join(", "));
    println!();

    let result = runner.run(definition, &ctx).await;
    let path = store
        .save(&result)
        .context("Failed to save pipeline result")?;

    for stage in &result.stages {
        let status = if stage.is_passed() { "✓" } else { "✗" };
        println!("  {} {} ({}ms)", status, stage.stage_name, stage.duration_ms);
    }
    println!();
    print!("{}", result.render_table(config.output_width));
    println!("Result saved to {}", path.display());

    Ok(result.exit_code().clamp(0, u8::MAX as i32) as u8)
}

fn cmd_list(config: &RunnerConfig) -> Result<u8> {
    let catalog = config
        .load_catalog()
        .context("Failed to load pipeline definitions")?;

    for pipeline in catalog.pipelines() {
        println!("{}", pipeline.id);
        if let Some(description) = &pipeline.description {
            println!("  {}", description);
        }
        println!("  gate:   {}", pipeline.entry_gate);
        if let Some(secs) = pipeline.timeout_secs {
            println!("  timeout: {}s", secs);
        }
        println!("  stages: {}", pipeline.stage_names().join(" -> "));
    }
    Ok(0)
}

fn cmd_show(config: &RunnerConfig, pipeline_id: &str) -> Result<u8> {
    let store = ResultStore::new(&config.results_dir);
    match store
        .latest(pipeline_id)
        .with_context(|| format!("Failed to read results for '{}'", pipeline_id))?
    {
        Some(result) => {
            print!("{}", result.render_table(config.output_width));
            println!(
                "Started: {}  Finished: {}",
                result.started_at.to_rfc3339(),
                result.finished_at.to_rfc3339()
            );
        }
        None => println!("No runs recorded for '{}'", pipeline_id),
    }
    Ok(0)
}

fn cmd_validate(config: &RunnerConfig) -> Result<u8> {
    let catalog = config
        .load_catalog()
        .context("Pipeline definitions are invalid")?;

    for pipeline in catalog.pipelines() {
        println!(
            "✓ {} ({} stages, digest {})",
            pipeline.id,
            pipeline.stages.len(),
            &pipeline.digest()[..12]
        );
    }
    println!("{} pipeline(s) valid", catalog.pipelines().len());
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use devsecops_ci::Outcome;

    const PIPELINES_TOML: &str = r#"
[[pipeline]]
id = "ci"
entry_gate = { kind = "branch_match", branch = "main" }

[[pipeline.stage]]
name = "lint"
command = ["sh", "-c", "echo lint ok"]

[[pipeline.stage]]
name = "scan"
command = ["sh", "-c", "exit 1"]

[[pipeline]]
id = "cd"
entry_gate = { kind = "upstream_success", pipeline = "ci" }

[[pipeline.stage]]
name = "deploy"
command = ["sh", "-c", "echo deployed"]
"#;

    fn config_in(dir: &std::path::Path) -> RunnerConfig {
        let pipelines = dir.join("pipelines.toml");
        std::fs::write(&pipelines, PIPELINES_TOML).expect("write pipelines");
        RunnerConfig {
            pipelines_file: Some(pipelines),
            results_dir: dir.join("runs"),
            ..RunnerConfig::default()
        }
    }

    #[test]
    fn test_parse_run_command() {
        let cli = Cli::try_parse_from([
            "devsecops", "run", "ci", "--branch", "main", "--trigger", "manual",
        ])
        .expect("parse");
        match cli.command {
            Commands::Run {
                pipeline,
                branch,
                trigger,
            } => {
                assert_eq!(pipeline, "ci");
                assert_eq!(branch.as_deref(), Some("main"));
                assert_eq!(trigger, TriggerKind::Manual);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_unknown_trigger() {
        let err = Cli::try_parse_from(["devsecops", "run", "ci", "--trigger", "cron"]);
        assert!(err.is_err());
    }

    #[test]
    fn test_parse_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "devsecops",
            "validate",
            "--verbose",
            "--results-dir",
            "/tmp/runs",
        ])
        .expect("parse");
        assert!(cli.verbose);
        assert_eq!(cli.results_dir, Some(PathBuf::from("/tmp/runs")));
        assert!(matches!(cli.command, Commands::Validate));
    }

    #[test]
    fn test_resolve_branch_precedence() {
        assert_eq!(
            resolve_branch(Some("dev".into()), Some("main".into()), || None),
            "dev"
        );
        assert_eq!(
            resolve_branch(None, Some("release".into()), || Some("feature".into())),
            "release"
        );
        assert_eq!(
            resolve_branch(None, Some(String::new()), || Some("feature".into())),
            "feature"
        );
        assert_eq!(resolve_branch(None, None, || None), "main");
    }

    #[tokio::test]
    async fn test_cmd_run_failure_exit_code_and_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = config_in(dir.path());

        let code = cmd_run(
            &config,
            "ci",
            Some("main".into()),
            TriggerKind::Push,
            CancelFlag::new(),
        )
        .await
        .expect("run");
        assert_eq!(code, 1);

        let stored = ResultStore::new(&config.results_dir)
            .latest("ci")
            .expect("latest")
            .expect("stored");
        assert_eq!(stored.outcome, Outcome::Failed);
        assert_eq!(stored.stages.len(), 2);
    }

    #[tokio::test]
    async fn test_cmd_run_cd_skipped_after_failed_ci() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = config_in(dir.path());

        cmd_run(&config, "ci", Some("main".into()), TriggerKind::Push, CancelFlag::new())
            .await
            .expect("ci run");
        let code = cmd_run(&config, "cd", Some("main".into()), TriggerKind::Push, CancelFlag::new())
            .await
            .expect("cd run");
        assert_eq!(code, 0);

        let stored = ResultStore::new(&config.results_dir)
            .latest("cd")
            .expect("latest")
            .expect("stored");
        assert_eq!(stored.outcome, Outcome::Skipped);
        assert!(stored.stages.is_empty());
    }

    #[tokio::test]
    async fn test_cmd_run_cd_manual_trigger_after_failed_ci() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = config_in(dir.path());
        let mut pipelines = std::fs::read_to_string(config.pipelines_file.as_ref().expect("file"))
            .expect("read pipelines");
        pipelines = pipelines.replace(
            r#"entry_gate = { kind = "upstream_success", pipeline = "ci" }"#,
            r#"entry_gate = { kind = "any_of", gates = [{ kind = "upstream_success", pipeline = "ci" }, { kind = "manual_trigger" }] }"#,
        );
        assert!(pipelines.contains("manual_trigger"));
        std::fs::write(config.pipelines_file.as_ref().expect("file"), pipelines)
            .expect("write pipelines");

        let ci = cmd_run(&config, "ci", Some("main".into()), TriggerKind::Push, CancelFlag::new())
            .await
            .expect("ci run");
        assert_eq!(ci, 1);

        let store = ResultStore::new(&config.results_dir);
        assert_eq!(
            store.latest("ci").expect("latest").map(|r| r.outcome),
            Some(Outcome::Failed)
        );

        let code = cmd_run(&config, "cd", Some("main".into()), TriggerKind::Manual, CancelFlag::new())
            .await
            .expect("cd run");
        assert_eq!(code, 0);

        let cd = store.latest("cd").expect("latest").expect("stored");
        assert_eq!(cd.outcome, Outcome::Success);
        assert!(cd.gate.passed);
        assert_eq!(cd.stages.len(), 1);
        assert_eq!(cd.stages[0].stdout.trim(), "deployed");
    }

    #[tokio::test]
    async fn test_cmd_run_cancelled_before_start() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = config_in(dir.path());
        let cancel = CancelFlag::new();
        cancel.cancel();

        let code = cmd_run(&config, "ci", Some("main".into()), TriggerKind::Push, cancel)
            .await
            .expect("run");
        assert_eq!(code, 2);
    }

    #[tokio::test]
    async fn test_cmd_run_unknown_pipeline() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = config_in(dir.path());
        let err = cmd_run(&config, "nightly", None, TriggerKind::Push, CancelFlag::new()).await;
        assert!(err.is_err());
    }

    #[test]
    fn test_cmd_validate_and_list() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = config_in(dir.path());
        assert_eq!(cmd_validate(&config).expect("validate"), 0);
        assert_eq!(cmd_list(&config).expect("list"), 0);
        assert_eq!(cmd_show(&config, "ci").expect("show"), 0);
    }

    #[test]
    fn test_cmd_validate_rejects_bad_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("pipelines.toml");
        std::fs::write(&path, "[[pipeline]]\nid = \"ci\"\nstage = []\n").expect("write");
        let config = RunnerConfig {
            pipelines_file: Some(path),
            ..RunnerConfig::default()
        };
        assert!(cmd_validate(&config).is_err());
    }
}
