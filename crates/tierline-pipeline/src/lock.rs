//! Per-environment exclusive locks.
//!
//! `tokio::sync::Mutex` hands the lock out in FIFO order, so runs queueing
//! on the same environment enter `infra-apply` in arrival order.
//!
//! Versioned runs additionally take a release turn for their whole
//! plan-deploy-record span, so versions on one environment are minted and
//! shipped in the same order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tierline_core::obs;
use tierline_core::{DeployError, Result, METRICS};
use tierline_state::{LockWindow, RunId};
use tokio::sync::OwnedMutexGuard;

use crate::cancel::CancelToken;

/// Registry of one async mutex per environment name.
#[derive(Debug, Default)]
pub struct EnvironmentLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl EnvironmentLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, environment: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(environment.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Wait up to `queue_timeout` for the environment's lock.
    pub async fn acquire(
        &self,
        environment: &str,
        run_id: &RunId,
        queue_timeout: Duration,
    ) -> Result<InfraLease> {
        let slot = self.slot(environment);
        let requested_at = Utc::now();

        let guard = match slot.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                METRICS.inc_lock_waits();
                tracing::debug!(run_id = %run_id, environment, "queueing for infra lock");
                tokio::time::timeout(queue_timeout, slot.lock_owned())
                    .await
                    .map_err(|_| DeployError::LockContention {
                        environment: environment.to_string(),
                        waited_ms: queue_timeout.as_millis() as u64,
                    })?
            }
        };

        let acquired_at = Utc::now();
        let waited_ms = (acquired_at - requested_at).num_milliseconds().max(0) as u64;
        obs::emit_lock_acquired(&run_id.0, environment, waited_ms);

        Ok(InfraLease {
            environment: environment.to_string(),
            run_id: run_id.clone(),
            requested_at,
            acquired_at,
            _guard: guard,
        })
    }
}

/// Held infra lock. Dropping it releases the lock without a window record;
/// call [`release`](Self::release) to get one.
#[derive(Debug)]
pub struct InfraLease {
    environment: String,
    run_id: RunId,
    requested_at: DateTime<Utc>,
    acquired_at: DateTime<Utc>,
    _guard: OwnedMutexGuard<()>,
}

impl InfraLease {
    /// Release the lock. `released_at` is stamped before the guard drops,
    /// so the next holder's `acquired_at` is never earlier.
    pub fn release(self) -> LockWindow {
        let released_at = Utc::now();
        let held_ms = (released_at - self.acquired_at).num_milliseconds().max(0) as u64;
        obs::emit_lock_released(&self.run_id.0, &self.environment, held_ms);
        LockWindow {
            environment: self.environment,
            requested_at: self.requested_at,
            acquired_at: self.acquired_at,
            released_at,
        }
    }
}

/// One release turn per environment, handed out in arrival order.
#[derive(Debug, Default)]
pub struct ReleaseSequencer {
    slots: EnvironmentLocks,
}

impl ReleaseSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the environment's release turn. `None` if `cancel` fires
    /// first.
    pub async fn enter(&self, environment: &str, cancel: &CancelToken) -> Option<ReleaseTurn> {
        if cancel.is_cancelled() {
            return None;
        }
        let slot = self.slots.slot(environment);
        let guard = match slot.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                tracing::debug!(environment, "waiting for release turn");
                tokio::select! {
                    guard = slot.lock_owned() => guard,
                    _ = cancel.cancelled() => return None,
                }
            }
        };
        Some(ReleaseTurn { _guard: guard })
    }
}

/// Held release turn. Dropping it lets the next versioned run plan.
#[derive(Debug)]
pub struct ReleaseTurn {
    _guard: OwnedMutexGuard<()>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_second_holder_waits_for_release() {
        let locks = Arc::new(EnvironmentLocks::new());
        let first = locks
            .acquire("prod", &RunId::new(), Duration::from_secs(5))
            .await
            .unwrap();

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                locks
                    .acquire("prod", &RunId::new(), Duration::from_secs(5))
                    .await
                    .unwrap()
                    .release()
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let first_window = first.release();
        let second_window = waiter.await.unwrap();

        assert!(!first_window.overlaps(&second_window));
        assert!(second_window.acquired_at >= first_window.released_at);
    }

    #[tokio::test]
    async fn test_queue_timeout_is_lock_contention() {
        let locks = EnvironmentLocks::new();
        let _held = locks
            .acquire("prod", &RunId::new(), Duration::from_secs(5))
            .await
            .unwrap();
        let err = locks
            .acquire("prod", &RunId::new(), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "lock_contention");
    }

    #[tokio::test]
    async fn test_environments_do_not_share_locks() {
        let locks = EnvironmentLocks::new();
        let _prod = locks
            .acquire("prod", &RunId::new(), Duration::from_secs(5))
            .await
            .unwrap();
        locks
            .acquire("staging", &RunId::new(), Duration::from_millis(10))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_release_turns_are_exclusive_per_environment() {
        let sequencer = Arc::new(ReleaseSequencer::new());
        let cancel = CancelToken::new();
        let first = sequencer.enter("prod", &cancel).await.unwrap();

        let waiter = {
            let sequencer = sequencer.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { sequencer.enter("prod", &cancel).await.is_some() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        assert!(sequencer.enter("staging", &cancel).await.is_some());

        drop(first);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_abandons_the_release_queue() {
        let sequencer = Arc::new(ReleaseSequencer::new());
        let _held = sequencer.enter("prod", &CancelToken::new()).await.unwrap();

        let cancel = CancelToken::new();
        let waiter = {
            let sequencer = sequencer.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { sequencer.enter("prod", &cancel).await.is_none() })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        assert!(waiter.await.unwrap());
    }
}
