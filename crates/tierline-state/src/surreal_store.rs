use std::sync::Arc;

use async_trait::async_trait;

use crate::error::StorageError;
use crate::handle::{
    SurrealHandle, AUTHZ_DECISIONS, ENVIRONMENT_STATUS, RELEASES, RELEASE_OUTCOMES, ROLLBACKS,
    RUNS,
};
use crate::schema::*;
use crate::storage_traits::*;

fn release_key(environment: &str, version: &str) -> String {
    format!("{}/{}", environment, version)
}

/// SurrealDB-backed implementation of every storage trait.
#[derive(Clone)]
pub struct SurrealStateStore {
    handle: Arc<SurrealHandle>,
}

impl SurrealStateStore {
    pub fn new(handle: Arc<SurrealHandle>) -> Self {
        Self { handle }
    }
}

#[async_trait]
impl RunHistory for SurrealStateStore {
    async fn record_run(&self, run: &PipelineRunRecord) -> StorageResult<()> {
        self.handle
            .append_entry(RUNS, &run.environment, run.run_id.0.clone(), true, run)
            .await
    }

    async fn get_run(&self, run_id: &RunId) -> StorageResult<PipelineRunRecord> {
        self.handle
            .entries_by_key::<PipelineRunRecord>(RUNS, &run_id.0)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })
    }

    async fn list_runs(&self, environment: Option<&str>) -> StorageResult<Vec<PipelineRunRecord>> {
        self.handle.entries(RUNS, environment).await
    }
}

#[async_trait]
impl ReleaseRegistry for SurrealStateStore {
    async fn record_release(&self, release: &ReleaseRecord) -> StorageResult<()> {
        self.handle
            .append_entry(
                RELEASES,
                &release.environment,
                release_key(&release.environment, &release.version),
                true,
                release,
            )
            .await
    }

    async fn record_outcome(&self, outcome: &ReleaseOutcomeRecord) -> StorageResult<()> {
        let key = release_key(&outcome.environment, &outcome.version);
        let known = self
            .handle
            .entries_by_key::<ReleaseRecord>(RELEASES, &key)
            .await?;
        if known.is_empty() {
            return Err(StorageError::ReleaseNotFound {
                environment: outcome.environment.clone(),
                version: outcome.version.clone(),
            });
        }
        self.handle
            .append_entry(RELEASE_OUTCOMES, &outcome.environment, key, false, outcome)
            .await
    }

    async fn releases(&self, environment: &str) -> StorageResult<Vec<ReleaseRecord>> {
        let mut lineage: Vec<ReleaseRecord> =
            self.handle.entries(RELEASES, Some(environment)).await?;
        lineage.reverse(); // newest first
        Ok(lineage)
    }

    async fn last_outcome(
        &self,
        environment: &str,
        version: &str,
    ) -> StorageResult<Option<ReleaseOutcomeRecord>> {
        Ok(self
            .handle
            .entries_by_key::<ReleaseOutcomeRecord>(
                RELEASE_OUTCOMES,
                &release_key(environment, version),
            )
            .await?
            .into_iter()
            .next())
    }
}

#[async_trait]
impl RollbackLog for SurrealStateStore {
    async fn append(&self, record: &RollbackRecord) -> StorageResult<()> {
        self.handle
            .append_entry(
                ROLLBACKS,
                &record.environment,
                record.rollback_id.clone(),
                true,
                record,
            )
            .await
    }

    async fn list(&self, environment: Option<&str>) -> StorageResult<Vec<RollbackRecord>> {
        self.handle.entries(ROLLBACKS, environment).await
    }
}

#[async_trait]
impl AuthorizationAudit for SurrealStateStore {
    async fn append(&self, decision: &AuthorizationDecisionRecord) -> StorageResult<()> {
        self.handle
            .append_entry(
                AUTHZ_DECISIONS,
                &decision.environment,
                uuid::Uuid::new_v4().to_string(),
                false,
                decision,
            )
            .await
    }

    async fn list(
        &self,
        environment: Option<&str>,
    ) -> StorageResult<Vec<AuthorizationDecisionRecord>> {
        self.handle.entries(AUTHZ_DECISIONS, environment).await
    }
}

#[async_trait]
impl StatusBoard for SurrealStateStore {
    async fn publish(&self, status: &EnvironmentStatus) -> StorageResult<bool> {
        self.handle.replace_status(status).await
    }

    async fn current(&self, environment: &str) -> StorageResult<Option<EnvironmentStatus>> {
        Ok(self
            .handle
            .entries::<EnvironmentStatus>(ENVIRONMENT_STATUS, Some(environment))
            .await?
            .into_iter()
            .next())
    }

    async fn all(&self) -> StorageResult<Vec<EnvironmentStatus>> {
        let mut snapshots: Vec<EnvironmentStatus> =
            self.handle.entries(ENVIRONMENT_STATUS, None).await?;
        snapshots.sort_by(|a, b| a.environment.cmp(&b.environment));
        Ok(snapshots)
    }
}
