//! Cancellation token raced against in-flight queries

use tokio::sync::watch;

use crate::engine::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitState {
    Pending,
    Canceled,
    Discarded,
}

/// One-shot cancellation signal.
///
/// `wait()` resolves once either `cancel()` or `discard()` has been called and
/// fails with [`EngineError::CanceledByUser`] when `cancel()` came first. Only
/// the first transition counts.
#[derive(Debug)]
pub struct CancelableWait {
    state: watch::Sender<WaitState>,
}

impl CancelableWait {
    pub fn new() -> Self {
        let (state, _) = watch::channel(WaitState::Pending);
        Self { state }
    }

    pub fn cancel(&self) {
        self.settle(WaitState::Canceled);
    }

    /// Release waiters without an error; the work finished first.
    pub fn discard(&self) {
        self.settle(WaitState::Discarded);
    }

    pub fn is_pending(&self) -> bool {
        *self.state.borrow() == WaitState::Pending
    }

    pub fn is_canceled(&self) -> bool {
        *self.state.borrow() == WaitState::Canceled
    }

    pub async fn wait(&self) -> EngineResult<()> {
        let mut rx = self.state.subscribe();
        let settled = rx
            .wait_for(|state| *state != WaitState::Pending)
            .await
            .map(|state| *state)
            // The sender lives in `self`, so the channel cannot close here.
            .unwrap_or(WaitState::Discarded);

        match settled {
            WaitState::Canceled => Err(EngineError::CanceledByUser),
            _ => Ok(()),
        }
    }

    fn settle(&self, next: WaitState) {
        self.state.send_if_modified(|state| {
            if *state == WaitState::Pending {
                *state = next;
                true
            } else {
                false
            }
        });
    }
}

impl Default for CancelableWait {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;

    #[tokio::test]
    async fn cancel_wakes_waiter_with_error() {
        let wait = Arc::new(CancelableWait::new());
        let waiter = {
            let wait = wait.clone();
            tokio::spawn(async move { wait.wait().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        wait.cancel();

        let err = waiter
            .await
            .expect("task should join")
            .expect_err("wait should fail after cancel");
        assert!(err.is_canceled());
    }

    #[tokio::test]
    async fn discard_resolves_cleanly() {
        let wait = CancelableWait::new();
        wait.discard();
        wait.wait().await.expect("discarded wait resolves");
    }

    #[tokio::test]
    async fn first_transition_wins() {
        let wait = CancelableWait::new();
        wait.discard();
        wait.cancel();
        assert!(!wait.is_canceled());
        wait.wait().await.expect("discard came first");

        let wait = CancelableWait::new();
        wait.cancel();
        wait.discard();
        assert!(wait.wait().await.is_err());
    }

    #[tokio::test]
    async fn pending_wait_does_not_resolve() {
        let wait = CancelableWait::new();
        let outcome = tokio::time::timeout(Duration::from_millis(20), wait.wait()).await;
        assert!(outcome.is_err(), "wait should still be pending");
        assert!(wait.is_pending());
    }
}
