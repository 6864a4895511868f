//! Status reporter: the per-environment "current status" snapshot, plus
//! run summaries for notification sinks.

use std::sync::Arc;

use tierline_core::obs;
use tierline_core::{NotificationSink, Result};
use tierline_state::{EnvironmentStatus, StatusBoard};

use crate::executor::PipelineRun;

pub struct StatusReporter {
    board: Arc<dyn StatusBoard>,
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl StatusReporter {
    pub fn new(board: Arc<dyn StatusBoard>) -> Self {
        Self {
            board,
            sinks: Vec::new(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Publish a terminal run. In-flight runs are ignored, and a result
    /// older than the stored snapshot does not replace it.
    ///
    /// Returns whether the snapshot was replaced. Sink failures are logged
    /// and never surface.
    pub async fn report(&self, run: &PipelineRun) -> Result<bool> {
        let Some(summary) = run.summary() else {
            tracing::debug!(run_id = %run.run_id(), "not reporting an in-flight run");
            return Ok(false);
        };

        let status = EnvironmentStatus {
            environment: summary.environment.clone(),
            outcome: summary.outcome,
            code: summary.code.clone(),
            timestamp: summary.completed_at,
            triggering_run_id: summary.run_id.clone(),
        };
        let applied = self.board.publish(&status).await?;
        obs::emit_status_published(&status.environment, status.outcome.as_str(), applied);

        for sink in &self.sinks {
            if let Err(e) = sink.publish(&summary).await {
                obs::emit_side_effect_error(&summary.run_id.0, "notification", &e);
            }
        }
        Ok(applied)
    }

    pub async fn current(&self, environment: &str) -> Result<Option<EnvironmentStatus>> {
        Ok(self.board.current(environment).await?)
    }

    pub async fn all(&self) -> Result<Vec<EnvironmentStatus>> {
        Ok(self.board.all().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::executor::{StageChecks, StageExecutor};
    use crate::lock::EnvironmentLocks;
    use crate::stage::ExecutionPlan;
    use tierline_core::config::TimeoutConfig;
    use tierline_core::fakes::{FakeContentStore, FakeProvisioningEngine, RecordingNotifier};
    use tierline_core::{
        Artifact, DeploymentRequest, Environment, Operation, Tier, TriggerDescriptor, TriggerType,
    };
    use tierline_state::fakes::MemoryStatusBoard;
    use tierline_state::RunOutcome;

    fn fresh_run() -> PipelineRun {
        PipelineRun::new(
            DeploymentRequest::new(
                TriggerDescriptor::of(TriggerType::MainPush),
                "refs/heads/main",
                "ci",
            ),
            Environment::new("staging", Tier::Staging),
            Operation::Deploy,
            Artifact::revision("abc123"),
            ExecutionPlan::full(),
        )
    }

    async fn finished_run() -> PipelineRun {
        let executor = StageExecutor::new(
            Arc::new(FakeProvisioningEngine::new()),
            Arc::new(FakeContentStore::new()),
            StageChecks::new(),
            Arc::new(EnvironmentLocks::new()),
            TimeoutConfig::default(),
        );
        executor.execute(fresh_run(), &CancelToken::new()).await
    }

    #[tokio::test]
    async fn test_in_flight_run_is_not_published() {
        let board = Arc::new(MemoryStatusBoard::new());
        let reporter = StatusReporter::new(board.clone());
        assert!(!reporter.report(&fresh_run()).await.unwrap());
        assert!(board.current("staging").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_terminal_run_is_published_and_notified() {
        let notifier = Arc::new(RecordingNotifier::new());
        let reporter =
            StatusReporter::new(Arc::new(MemoryStatusBoard::new())).with_sink(notifier.clone());
        let run = finished_run().await;

        assert!(reporter.report(&run).await.unwrap());
        let status = reporter.current("staging").await.unwrap().unwrap();
        assert_eq!(status.outcome, RunOutcome::Deployed);
        assert_eq!(&status.triggering_run_id, run.run_id());
        assert_eq!(notifier.summaries().len(), 1);
    }

    #[tokio::test]
    async fn test_older_result_does_not_overwrite_newer() {
        let reporter = StatusReporter::new(Arc::new(MemoryStatusBoard::new()));
        let older = finished_run().await;
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let newer = finished_run().await;

        assert!(reporter.report(&newer).await.unwrap());
        assert!(!reporter.report(&older).await.unwrap());
        let status = reporter.current("staging").await.unwrap().unwrap();
        assert_eq!(&status.triggering_run_id, newer.run_id());
    }

    #[tokio::test]
    async fn test_failing_sink_does_not_fail_report() {
        let reporter = StatusReporter::new(Arc::new(MemoryStatusBoard::new()))
            .with_sink(Arc::new(RecordingNotifier::failing()));
        assert!(reporter.report(&finished_run().await).await.unwrap());
    }
}
