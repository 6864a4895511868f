//! In-memory implementations of the storage traits
//!
//! Used by tests and by ephemeral (`--ephemeral`) CLI invocations. Every
//! store keeps its entries behind a `Mutex` and preserves insertion order.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::StorageError;
use crate::schema::*;
use crate::storage_traits::*;

fn lock<T>(mutex: &Mutex<T>) -> StorageResult<MutexGuard<'_, T>> {
    mutex.lock().map_err(|_| StorageError::Poisoned)
}

fn matches_env(candidate: &str, environment: Option<&str>) -> bool {
    environment.map(|env| env == candidate).unwrap_or(true)
}

// ---------------------------------------------------------------------------
// MemoryRunHistory
// ---------------------------------------------------------------------------

/// In-memory run history backed by a `Vec` in recording order.
#[derive(Debug, Default)]
pub struct MemoryRunHistory {
    runs: Mutex<Vec<PipelineRunRecord>>,
}

impl MemoryRunHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunHistory for MemoryRunHistory {
    async fn record_run(&self, run: &PipelineRunRecord) -> StorageResult<()> {
        let mut runs = lock(&self.runs)?;
        if runs.iter().any(|r| r.run_id == run.run_id) {
            return Err(StorageError::Conflict {
                kind: "pipeline run",
                key: run.run_id.0.clone(),
            });
        }
        runs.push(run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: &RunId) -> StorageResult<PipelineRunRecord> {
        let runs = lock(&self.runs)?;
        runs.iter()
            .find(|r| &r.run_id == run_id)
            .cloned()
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })
    }

    async fn list_runs(&self, environment: Option<&str>) -> StorageResult<Vec<PipelineRunRecord>> {
        let runs = lock(&self.runs)?;
        Ok(runs
            .iter()
            .filter(|r| matches_env(&r.environment, environment))
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// MemoryReleaseRegistry
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ReleaseState {
    releases: Vec<ReleaseRecord>,
    outcomes: Vec<ReleaseOutcomeRecord>,
}

/// In-memory release registry.
///
/// Releases and outcomes are kept oldest-last internally; `releases`
/// reverses on read.
#[derive(Debug, Default)]
pub struct MemoryReleaseRegistry {
    state: Mutex<ReleaseState>,
}

impl MemoryReleaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReleaseRegistry for MemoryReleaseRegistry {
    async fn record_release(&self, release: &ReleaseRecord) -> StorageResult<()> {
        let mut state = lock(&self.state)?;
        if state
            .releases
            .iter()
            .any(|r| r.environment == release.environment && r.version == release.version)
        {
            return Err(StorageError::Conflict {
                kind: "release",
                key: format!("{}/{}", release.environment, release.version),
            });
        }
        state.releases.push(release.clone());
        Ok(())
    }

    async fn record_outcome(&self, outcome: &ReleaseOutcomeRecord) -> StorageResult<()> {
        let mut state = lock(&self.state)?;
        let known = state
            .releases
            .iter()
            .any(|r| r.environment == outcome.environment && r.version == outcome.version);
        if !known {
            return Err(StorageError::ReleaseNotFound {
                environment: outcome.environment.clone(),
                version: outcome.version.clone(),
            });
        }
        state.outcomes.push(outcome.clone());
        Ok(())
    }

    async fn releases(&self, environment: &str) -> StorageResult<Vec<ReleaseRecord>> {
        let state = lock(&self.state)?;
        let mut lineage: Vec<ReleaseRecord> = state
            .releases
            .iter()
            .filter(|r| r.environment == environment)
            .cloned()
            .collect();
        lineage.reverse(); // newest first
        Ok(lineage)
    }

    async fn last_outcome(
        &self,
        environment: &str,
        version: &str,
    ) -> StorageResult<Option<ReleaseOutcomeRecord>> {
        let state = lock(&self.state)?;
        Ok(state
            .outcomes
            .iter()
            .rev()
            .find(|o| o.environment == environment && o.version == version)
            .cloned())
    }
}

// ---------------------------------------------------------------------------
// MemoryRollbackLog / MemoryAuthorizationAudit
// ---------------------------------------------------------------------------

/// In-memory rollback audit trail.
#[derive(Debug, Default)]
pub struct MemoryRollbackLog {
    entries: Mutex<Vec<RollbackRecord>>,
}

impl MemoryRollbackLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RollbackLog for MemoryRollbackLog {
    async fn append(&self, record: &RollbackRecord) -> StorageResult<()> {
        let mut entries = lock(&self.entries)?;
        if entries.iter().any(|e| e.rollback_id == record.rollback_id) {
            return Err(StorageError::Conflict {
                kind: "rollback record",
                key: record.rollback_id.clone(),
            });
        }
        entries.push(record.clone());
        Ok(())
    }

    async fn list(&self, environment: Option<&str>) -> StorageResult<Vec<RollbackRecord>> {
        let entries = lock(&self.entries)?;
        Ok(entries
            .iter()
            .filter(|e| matches_env(&e.environment, environment))
            .cloned()
            .collect())
    }
}

/// In-memory authorization decision trail.
#[derive(Debug, Default)]
pub struct MemoryAuthorizationAudit {
    entries: Mutex<Vec<AuthorizationDecisionRecord>>,
}

impl MemoryAuthorizationAudit {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuthorizationAudit for MemoryAuthorizationAudit {
    async fn append(&self, decision: &AuthorizationDecisionRecord) -> StorageResult<()> {
        lock(&self.entries)?.push(decision.clone());
        Ok(())
    }

    async fn list(
        &self,
        environment: Option<&str>,
    ) -> StorageResult<Vec<AuthorizationDecisionRecord>> {
        let entries = lock(&self.entries)?;
        Ok(entries
            .iter()
            .filter(|e| matches_env(&e.environment, environment))
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// MemoryStatusBoard
// ---------------------------------------------------------------------------

/// In-memory status board keyed by environment name.
#[derive(Debug, Default)]
pub struct MemoryStatusBoard {
    snapshots: Mutex<BTreeMap<String, EnvironmentStatus>>,
}

impl MemoryStatusBoard {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StatusBoard for MemoryStatusBoard {
    async fn publish(&self, status: &EnvironmentStatus) -> StorageResult<bool> {
        let mut snapshots = lock(&self.snapshots)?;
        if let Some(existing) = snapshots.get(&status.environment) {
            if existing.timestamp > status.timestamp {
                return Ok(false);
            }
        }
        snapshots.insert(status.environment.clone(), status.clone());
        Ok(true)
    }

    async fn current(&self, environment: &str) -> StorageResult<Option<EnvironmentStatus>> {
        Ok(lock(&self.snapshots)?.get(environment).cloned())
    }

    async fn all(&self) -> StorageResult<Vec<EnvironmentStatus>> {
        Ok(lock(&self.snapshots)?.values().cloned().collect())
    }
}
