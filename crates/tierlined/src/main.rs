//! tierlined: consumes newline-delimited inbound events from stdin.
//!
//! Each event runs as its own task. Runs on different environments proceed in
//! parallel; infra windows on one environment serialise through the shared
//! lock inside the [`Conductor`]. Ctrl-C cancels every in-flight run and the
//! daemon exits once they have settled.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tierline_core::{PipelineConfig, RawEvent, METRICS};
use tierline_pipeline::{CancelToken, Conductor, StateStores};
use tierline_state::{RunOutcome, SurrealHandle};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::task::JoinSet;
use tracing::{error, info, warn, Level};

#[derive(Parser)]
#[command(name = "tierlined")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Consume inbound release pipeline events from stdin", long_about = None)]
struct Args {
    /// Path to the JSON configuration file
    #[arg(short, long, env = "TIERLINE_CONFIG", default_value = "tierline.json")]
    config: PathBuf,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,

    /// Keep all state in memory
    #[arg(long)]
    ephemeral: bool,
}

/// Tally of terminal outcomes over one input stream.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct Tally {
    deployed: usize,
    no_changes: usize,
    failed: usize,
    rejected: usize,
    cancelled: usize,
    not_met: usize,
    /// Lines that never became a run.
    errors: usize,
}

impl Tally {
    fn count(&mut self, outcome: Option<RunOutcome>) {
        match outcome {
            Some(RunOutcome::Deployed) => self.deployed += 1,
            Some(RunOutcome::NoChangesDetected) => self.no_changes += 1,
            Some(RunOutcome::Failed) => self.failed += 1,
            Some(RunOutcome::Rejected) => self.rejected += 1,
            Some(RunOutcome::Cancelled) => self.cancelled += 1,
            Some(RunOutcome::ConditionsNotMet) => self.not_met += 1,
            None => self.errors += 1,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tierline_core::init_tracing(args.json, level);

    let config = PipelineConfig::load(&args.config)
        .with_context(|| format!("failed to load config {}", args.config.display()))?;
    let stores = if args.ephemeral {
        StateStores::in_memory()
    } else {
        let handle = SurrealHandle::connect(&config.state_url)
            .await
            .with_context(|| format!("failed to open state store at {}", config.state_url))?;
        StateStores::surreal(Arc::new(handle))
    };
    let conductor = Arc::new(
        Conductor::from_config(config, stores).context("failed to build pipeline from config")?,
    );

    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling in-flight runs");
            trigger.cancel();
        }
    });

    info!("tierlined reading events from stdin");
    let tally = consume(conductor, BufReader::new(tokio::io::stdin()), cancel).await?;
    info!(?tally, "input drained");
    METRICS.flush();
    Ok(())
}

/// Run every event line from `reader` to completion. Stops reading on
/// cancellation and waits for in-flight runs to settle.
async fn consume<R>(conductor: Arc<Conductor>, reader: R, cancel: CancelToken) -> Result<Tally>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut tasks = JoinSet::new();
    let mut tally = Tally::default();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read event stream")?,
            _ = cancel.cancelled() => break,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        let conductor = conductor.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move { process_line(&conductor, &line, &cancel).await });

        // Reap whatever already finished so the set does not grow unbounded.
        while let Some(done) = tasks.try_join_next() {
            tally.count(done.unwrap_or(None));
        }
    }

    while let Some(done) = tasks.join_next().await {
        match done {
            Ok(outcome) => tally.count(outcome),
            Err(e) => {
                error!(error = %e, "event task panicked");
                tally.count(None);
            }
        }
    }
    Ok(tally)
}

/// Parse and run one event line. `None` when the line never became a run.
async fn process_line(conductor: &Conductor, line: &str, cancel: &CancelToken) -> Option<RunOutcome> {
    let event: RawEvent = match serde_json::from_str(line) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "skipping malformed event line");
            return None;
        }
    };

    match conductor.handle_event(&event, cancel).await {
        Ok(completion) => {
            let outcome = completion.outcome();
            if let Some(run) = completion.run() {
                info!(
                    run_id = %run.run_id(),
                    environment = %run.environment().name,
                    outcome = %outcome,
                    code = %run.code(),
                    "event processed"
                );
            } else {
                info!(outcome = %outcome, git_ref = %event.git_ref, "event processed without a run");
            }
            Some(outcome)
        }
        Err(e) => {
            warn!(code = e.code(), error = %e, git_ref = %event.git_ref, "event refused");
            None
        }
    }
}
