//! Cooperative run cancellation.

use std::sync::Arc;

use tokio::sync::watch;

/// Cloneable cancellation flag shared between a run and whoever may stop it.
///
/// The executor checks it at stage boundaries and, for the validation stages
/// before `infra-apply`, while they run. It is never honoured inside the
/// infra lock window.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // The sender lives as long as any token, so `wait_for` only errors
        // if every token is gone, which cannot happen while `self` exists.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
