//! Purpose: Shared cancellation signal for one conversion pipeline.
//! Exports: `CancelSignal`, `CancelReason`.
//! Role: Lets the consumer, the master deadline, and process interruption stop the producer.
//! Invariants: The first recorded reason wins; later `cancel` calls are no-ops.
//! Invariants: `cancelled()` resolves immediately once the signal is set.
use std::sync::Arc;

use tokio::sync::watch;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CancelReason {
    BrokenDownstream,
    ProducerFailed,
    Timeout,
    Interrupted,
}

/// Cloneable handle; every clone observes the same signal.
#[derive(Clone, Debug)]
pub struct CancelSignal {
    state: Arc<watch::Sender<Option<CancelReason>>>,
}

impl CancelSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            state: Arc::new(tx),
        }
    }

    /// Returns true when this call set the signal.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        self.state.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        })
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.borrow().is_some()
    }

    pub fn reason(&self) -> Option<CancelReason> {
        *self.state.borrow()
    }

    pub async fn cancelled(&self) -> CancelReason {
        let mut rx = self.state.subscribe();
        loop {
            if let Some(reason) = *rx.borrow_and_update() {
                return reason;
            }
            if rx.changed().await.is_err() {
                // Sender lives in `self`, so this only happens during teardown.
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}
