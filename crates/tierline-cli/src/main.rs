//! Tierline CLI
//!
//! The `tierline` command is the manual invocation surface of the release
//! pipeline.
//!
//! ## Commands
//!
//! - `deploy`: run the current ref against an environment
//! - `release`: cut and deploy a new version
//! - `hotfix`: cut and deploy a hotfix version
//! - `rollback`: return an environment to an earlier release
//! - `event`: process an inbound event JSON file
//! - `status`: show the current status of each environment
//! - `history`: show terminal runs, releases or rollbacks
//!
//! The process exit code mirrors the run outcome.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tierline_core::{DeployError, ManualFlags, PipelineConfig, RawEvent};
use tierline_pipeline::{
    CancelToken, Completion, Conductor, DryRunReport, PipelineRun, RollbackReport,
    RollbackRequest, StateStores,
};
use tierline_state::{
    ReleaseRegistry, RollbackLog, RollbackStrategy, RunHistory, RunOutcome, StatusBoard,
    SurrealHandle,
};
use tracing::{info, Level};

/// Exit code for usage and configuration errors.
const EXIT_USAGE: u8 = 64;

#[derive(Parser)]
#[command(name = "tierline")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Risk-tiered release pipeline controller", long_about = None)]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(short, long, global = true, env = "TIERLINE_CONFIG", default_value = "tierline.json")]
    config: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines and machine-readable results
    #[arg(long, global = true)]
    json: bool,

    /// Keep all state in memory for this invocation
    #[arg(long, global = true)]
    ephemeral: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Deploy a ref to an environment
    Deploy {
        #[command(flatten)]
        target: TargetArgs,
    },

    /// Cut a release version and deploy it
    Release {
        #[command(flatten)]
        target: TargetArgs,

        /// major, minor, patch, rc, or an exact version
        #[arg(long, default_value = "patch")]
        bump: String,
    },

    /// Cut a hotfix version and deploy it
    Hotfix {
        #[command(flatten)]
        target: TargetArgs,
    },

    /// Roll an environment back to an earlier release
    Rollback {
        /// Environment to roll back
        environment: String,

        /// Which parts of the environment to roll back
        #[arg(long, value_enum, default_value = "last-known-good")]
        strategy: StrategyArg,

        /// Release version or commit to return to
        #[arg(long)]
        revision: Option<String>,

        /// Who is rolling back
        #[arg(short, long, env = "TIERLINE_ACTOR")]
        actor: String,

        /// Justification, recorded in the rollback log
        #[arg(short, long)]
        reason: Option<String>,

        /// Authorize, resolve the target and plan without running any stage
        #[arg(long)]
        dry_run: bool,
    },

    /// Process an inbound event from a JSON file
    Event {
        /// Event file, or `-` for stdin
        path: PathBuf,

        /// Classify, authorize and plan without running any stage
        #[arg(long)]
        dry_run: bool,
    },

    /// Show the current status of each environment
    Status {
        /// Only this environment
        environment: Option<String>,
    },

    /// Show recorded history
    History {
        #[command(subcommand)]
        action: HistoryAction,
    },
}

#[derive(clap::Args)]
struct TargetArgs {
    /// Environment to deploy to (resolved from the ref when omitted)
    #[arg(short, long)]
    environment: Option<String>,

    /// Git ref to deploy
    #[arg(long = "ref", default_value = "refs/heads/main")]
    git_ref: String,

    /// Commit to deploy
    #[arg(long)]
    revision: Option<String>,

    /// Who is deploying
    #[arg(short, long, env = "TIERLINE_ACTOR")]
    actor: String,

    /// Justification, required for hotfixes and emergencies
    #[arg(short, long)]
    reason: Option<String>,

    /// Mark the request as an emergency
    #[arg(long)]
    emergency: bool,

    /// Classify, authorize and plan without running any stage
    #[arg(long)]
    dry_run: bool,
}

#[derive(Subcommand)]
enum HistoryAction {
    /// Terminal pipeline runs, oldest first
    Runs {
        #[arg(short, long)]
        environment: Option<String>,

        /// Maximum number of runs to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Releases of one environment, newest first
    Releases { environment: String },
    /// Rollback log entries
    Rollbacks {
        #[arg(short, long)]
        environment: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum StrategyArg {
    LastKnownGood,
    SpecificRevision,
    InfrastructureOnly,
    ContentOnly,
}

impl From<StrategyArg> for RollbackStrategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::LastKnownGood => RollbackStrategy::LastKnownGood,
            StrategyArg::SpecificRevision => RollbackStrategy::SpecificRevision,
            StrategyArg::InfrastructureOnly => RollbackStrategy::InfrastructureOnly,
            StrategyArg::ContentOnly => RollbackStrategy::ContentOnly,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tierline_core::init_tracing(cli.json, level);

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(error_exit_code(&e))
        }
    }
}

async fn run(cli: Cli) -> Result<u8> {
    let config = PipelineConfig::load(&cli.config)
        .with_context(|| format!("failed to load config {}", cli.config.display()))?;
    let stores = open_stores(&config, cli.ephemeral).await?;
    let json = cli.json;

    match cli.command {
        Commands::Deploy { target } => {
            let event = manual_event(&target, None);
            cmd_event(&config, stores, &event, target.dry_run, json).await
        }
        Commands::Release { target, bump } => {
            let event = manual_event(&target, Some(bump));
            cmd_event(&config, stores, &event, target.dry_run, json).await
        }
        Commands::Hotfix { target } => {
            let event = manual_event(&target, Some("hotfix".to_string()));
            cmd_event(&config, stores, &event, target.dry_run, json).await
        }
        Commands::Rollback {
            environment,
            strategy,
            revision,
            actor,
            reason,
            dry_run,
        } => {
            let mut request = RollbackRequest::new(&environment, strategy.into(), &actor);
            if let Some(revision) = revision {
                request = request.with_revision(&revision);
            }
            request.reason = reason;
            cmd_rollback(&config, stores, request, dry_run, json).await
        }
        Commands::Event { path, dry_run } => {
            let event = read_event(&path)?;
            cmd_event(&config, stores, &event, dry_run, json).await
        }
        Commands::Status { environment } => cmd_status(&stores, environment.as_deref(), json).await,
        Commands::History { action } => cmd_history(&stores, action, json).await,
    }
}

async fn open_stores(config: &PipelineConfig, ephemeral: bool) -> Result<StateStores> {
    if ephemeral {
        return Ok(StateStores::in_memory());
    }
    let handle = SurrealHandle::connect(&config.state_url)
        .await
        .with_context(|| format!("failed to open state store at {}", config.state_url))?;
    Ok(StateStores::surreal(Arc::new(handle)))
}

fn manual_event(target: &TargetArgs, version: Option<String>) -> RawEvent {
    let mut event = RawEvent::new("manual", &target.git_ref, &target.actor);
    event.explicit_environment = target.environment.clone();
    event.explicit_version_request = version;
    event.reason = target.reason.clone();
    if target.emergency {
        event.manual_flags = Some(ManualFlags { emergency: true });
    }
    if let Some(revision) = &target.revision {
        event.payload = serde_json::json!({ "sha": revision });
    }
    event
}

fn read_event(path: &Path) -> Result<RawEvent> {
    let raw = if path == Path::new("-") {
        std::io::read_to_string(std::io::stdin()).context("failed to read event from stdin")?
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("failed to read event {}", path.display()))?
    };
    serde_json::from_str(&raw).map_err(|e| DeployError::MalformedEvent(e.to_string()).into())
}

/// A token cancelled on Ctrl-C.
fn interrupt_token() -> CancelToken {
    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, cancelling run");
            trigger.cancel();
        }
    });
    cancel
}

// ========== Run Commands ==========

async fn cmd_event(
    config: &PipelineConfig,
    stores: StateStores,
    event: &RawEvent,
    dry_run: bool,
    json: bool,
) -> Result<u8> {
    let conductor = Conductor::from_config(config.clone(), stores)
        .context("failed to build pipeline from config")?;

    if dry_run {
        let request = conductor.classifier().request_from(event)?;
        let report = conductor.dry_run(&request).await?;
        print_dry_run(&report, json)?;
        return Ok(dry_run_exit_code(&report));
    }

    match conductor.handle_event(event, &interrupt_token()).await? {
        Completion::Deployment(run) => {
            print_run(&run, json)?;
            Ok(exit_code(run.outcome().unwrap_or(RunOutcome::Failed)))
        }
        Completion::Rollback(report) => {
            print_rollback(&report, json)?;
            Ok(exit_code(report.outcome()))
        }
    }
}

async fn cmd_rollback(
    config: &PipelineConfig,
    stores: StateStores,
    request: RollbackRequest,
    dry_run: bool,
    json: bool,
) -> Result<u8> {
    let conductor = Conductor::from_config(config.clone(), stores)
        .context("failed to build pipeline from config")?;

    if dry_run {
        let report = conductor.dry_run_rollback(&request).await?;
        print_dry_run(&report, json)?;
        return Ok(dry_run_exit_code(&report));
    }

    let report = conductor.rollback(request, &interrupt_token()).await?;
    print_rollback(&report, json)?;
    Ok(exit_code(report.outcome()))
}

fn exit_code(outcome: RunOutcome) -> u8 {
    match outcome {
        RunOutcome::Deployed => 0,
        RunOutcome::Failed => 1,
        RunOutcome::Rejected => 2,
        RunOutcome::ConditionsNotMet => 3,
        RunOutcome::NoChangesDetected => 10,
        RunOutcome::Cancelled => 130,
    }
}

/// A dry run that would not proceed exits as a rejection.
fn dry_run_exit_code(report: &DryRunReport) -> u8 {
    if report.would_proceed() {
        0
    } else {
        exit_code(RunOutcome::Rejected)
    }
}

/// Usage and config problems exit 64; pipeline errors map through their
/// outcome.
fn error_exit_code(error: &anyhow::Error) -> u8 {
    match error.downcast_ref::<DeployError>() {
        Some(DeployError::Config(_))
        | Some(DeployError::MalformedEvent(_))
        | Some(DeployError::InvalidEnvironment(_))
        | None => EXIT_USAGE,
        Some(DeployError::AuthorizationDenied { .. })
        | Some(DeployError::VersionRegression { .. }) => exit_code(RunOutcome::Rejected),
        Some(_) => exit_code(RunOutcome::Failed),
    }
}

// ========== Output ==========

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_run(run: &PipelineRun, json: bool) -> Result<()> {
    if json {
        return match run.to_record() {
            Some(record) => print_json(&record),
            None => Ok(()),
        };
    }

    let outcome = run.outcome().map(|o| o.as_str()).unwrap_or("in_flight");
    println!(
        "{} {} -> {} ({})",
        run.operation(),
        run.artifact().label(),
        run.environment().name,
        run.run_id()
    );
    for stage in run.stages() {
        let mut line = format!("  {:<22} {:?}", stage.name, stage.status);
        if stage.attempts > 1 {
            line.push_str(&format!(" after {} attempts", stage.attempts));
        }
        println!("{}", line);
    }
    println!("Outcome: {} [{}] {}", outcome, run.code(), run.reason());
    Ok(())
}

fn print_rollback(report: &RollbackReport, json: bool) -> Result<()> {
    if json {
        return print_json(&report.record);
    }
    if let Some(run) = &report.run {
        print_run(run, false)?;
    }
    let record = &report.record;
    println!(
        "Rollback {} {} -> {} (tag {})",
        record.environment,
        record.strategy.as_str(),
        record.target_version.as_deref().unwrap_or("none"),
        record.rollback_tag.as_deref().unwrap_or("none"),
    );
    println!("Outcome: {} [{}]", record.outcome, record.code);
    Ok(())
}

fn print_dry_run(report: &DryRunReport, json: bool) -> Result<()> {
    if json {
        return print_json(&serde_json::json!({
            "environment": report.environment,
            "operation": report.operation,
            "decision": report.decision,
            "planned_version": report.planned_version.as_ref().map(ToString::to_string),
            "version_error": report.version_error,
            "rollback_target": report.rollback_target.as_ref().map(ToString::to_string),
            "stages": report.stages,
            "plan_digest": report.plan_digest,
            "provisioning_plan": report.provisioning_plan,
            "would_proceed": report.would_proceed(),
        }));
    }

    println!("Dry run: {} -> {}", report.operation, report.environment);
    println!(
        "Authorization: {} ({})",
        if report.decision.allowed { "allowed" } else { "denied" },
        report.decision.policy_reason
    );
    if let Some(target) = &report.rollback_target {
        println!("Rollback target: {}", target);
    }
    match (&report.planned_version, &report.version_error) {
        (Some(version), _) => println!("Version: {}", version),
        (None, Some(error)) => println!("Version: refused ({})", error),
        (None, None) => println!("Version: none"),
    }
    let stages: Vec<&str> = report.stages.iter().map(|s| s.as_str()).collect();
    println!("Stages: {}", stages.join(", "));
    println!("Plan digest: {}", report.plan_digest);
    if let Some(plan) = &report.provisioning_plan {
        println!("Provisioning plan:\n{}", plan.diff_summary);
    }
    Ok(())
}

// ========== Read Commands ==========

async fn cmd_status(stores: &StateStores, environment: Option<&str>, json: bool) -> Result<u8> {
    let statuses = match environment {
        Some(env) => stores.status.current(env).await?.into_iter().collect(),
        None => stores.status.all().await?,
    };

    if json {
        print_json(&statuses)?;
        return Ok(0);
    }
    if statuses.is_empty() {
        println!("No status recorded yet");
    }
    for status in statuses {
        println!(
            "{:<12} {:<20} {} run {}",
            status.environment,
            status.outcome,
            status.timestamp.to_rfc3339(),
            status.triggering_run_id
        );
    }
    Ok(0)
}

async fn cmd_history(stores: &StateStores, action: HistoryAction, json: bool) -> Result<u8> {
    match action {
        HistoryAction::Runs { environment, limit } => {
            let runs = stores.runs.list_runs(environment.as_deref()).await?;
            let skip = runs.len().saturating_sub(limit);
            let runs = &runs[skip..];
            if json {
                print_json(&runs)?;
                return Ok(0);
            }
            if runs.is_empty() {
                println!("No runs recorded");
            }
            for run in runs {
                println!(
                    "{} {:<10} {:<10} {:<20} {} by {}",
                    run.completed_at.to_rfc3339(),
                    run.environment,
                    run.operation,
                    run.outcome,
                    run.version.as_deref().unwrap_or(&run.source_ref),
                    run.actor
                );
            }
        }
        HistoryAction::Releases { environment } => {
            let releases = stores.releases.releases(&environment).await?;
            if json {
                print_json(&releases)?;
                return Ok(0);
            }
            if releases.is_empty() {
                println!("No releases for {}", environment);
            }
            for release in releases {
                let outcome = stores
                    .releases
                    .last_outcome(&environment, &release.version)
                    .await?
                    .map(|o| o.outcome.as_str())
                    .unwrap_or("pending");
                println!(
                    "{} {:<32} {:<10} {} by {}",
                    release.created_at.to_rfc3339(),
                    release.version,
                    outcome,
                    release.source_revision,
                    release.created_by
                );
            }
        }
        HistoryAction::Rollbacks { environment } => {
            let log = stores.rollbacks.list(environment.as_deref()).await?;
            if json {
                print_json(&log)?;
                return Ok(0);
            }
            if log.is_empty() {
                println!("No rollbacks recorded");
            }
            for entry in log {
                println!(
                    "{} {:<10} {:<20} {} -> {} by {}: {}",
                    entry.recorded_at.to_rfc3339(),
                    entry.environment,
                    entry.strategy.as_str(),
                    entry.outcome,
                    entry.target_version.as_deref().unwrap_or("none"),
                    entry.initiated_by,
                    entry.reason
                );
            }
        }
    }
    Ok(0)
}
