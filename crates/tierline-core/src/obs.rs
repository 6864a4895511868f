//! Structured observability hooks for pipeline lifecycle events.
//!
//! This module provides:
//! - Run-scoped tracing spans, either as an RAII guard (`RunSpan`) for
//!   synchronous code or as a plain span (`run_span`) to `.instrument()`
//!   futures with
//! - Emission functions for key lifecycle events: start, stage transition,
//!   finish, authorization, lock window, rollback and status publication
//!
//! Events are emitted at `info!` level. Filter with `RUST_LOG`; pass
//! `--json` to the binaries for NDJSON output.

use tracing::info;

/// RAII guard that enters a run-scoped tracing span for the duration of a run.
///
/// Not `Send`; inside async tasks use [`run_span`] with `Instrument`.
pub struct RunSpan {
    _span: tracing::span::EnteredSpan,
}

impl RunSpan {
    /// Create and enter a span tagged with the run id and environment.
    pub fn enter(run_id: &str, environment: &str) -> Self {
        Self {
            _span: run_span(run_id, environment).entered(),
        }
    }
}

/// Span tagging every event with `run_id` and `environment`.
pub fn run_span(run_id: &str, environment: &str) -> tracing::Span {
    tracing::info_span!("tierline.run", run_id = %run_id, environment = %environment)
}

/// Emit event: run started.
pub fn emit_run_started(run_id: &str, environment: &str, trigger: &str, actor: &str) {
    info!(
        event = "run.started",
        run_id = %run_id,
        environment = %environment,
        trigger = %trigger,
        actor = %actor,
    );
}

/// Emit event: a stage changed status.
pub fn emit_stage_transition(run_id: &str, stage: &str, status: &str, attempt: u32) {
    info!(
        event = "run.stage",
        run_id = %run_id,
        stage = %stage,
        status = %status,
        attempt = attempt,
    );
}

/// Emit event: run reached its terminal outcome.
pub fn emit_run_finished(run_id: &str, environment: &str, outcome: &str, code: &str, duration_ms: u64) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        environment = %environment,
        outcome = %outcome,
        code = %code,
        duration_ms = duration_ms,
    );
}

/// Emit event: authorization decision.
pub fn emit_authorization_decided(
    run_id: &str,
    actor: &str,
    environment: &str,
    operation: &str,
    allowed: bool,
    reason: &str,
) {
    info!(
        event = "authz.decided",
        run_id = %run_id,
        actor = %actor,
        environment = %environment,
        operation = %operation,
        allowed = allowed,
        reason = %reason,
    );
}

/// Emit event: infra lock acquired after queueing.
pub fn emit_lock_acquired(run_id: &str, environment: &str, waited_ms: u64) {
    info!(event = "lock.acquired", run_id = %run_id, environment = %environment, waited_ms = waited_ms);
}

/// Emit event: infra lock released.
pub fn emit_lock_released(run_id: &str, environment: &str, held_ms: u64) {
    info!(event = "lock.released", run_id = %run_id, environment = %environment, held_ms = held_ms);
}

/// Emit event: rollback audit entry written.
pub fn emit_rollback_recorded(environment: &str, strategy: &str, target: &str, outcome: &str) {
    info!(
        event = "rollback.recorded",
        environment = %environment,
        strategy = %strategy,
        target = %target,
        outcome = %outcome,
    );
}

/// Emit event: status snapshot publication attempt.
pub fn emit_status_published(environment: &str, outcome: &str, applied: bool) {
    info!(
        event = "status.published",
        environment = %environment,
        outcome = %outcome,
        applied = applied,
    );
}

/// Emit event: a best-effort side effect failed (warning level).
pub fn emit_side_effect_error(run_id: &str, what: &str, error: &dyn std::fmt::Display) {
    tracing::warn!(event = "run.side_effect_error", run_id = %run_id, what = %what, error = %error);
}
