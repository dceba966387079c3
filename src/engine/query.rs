//! Cancellable query handles
//!
//! Every adapter that supports `query()` wraps its work in an
//! [`ExecutionTracker`]. The tracker owns the handle state machine
//! (`Created -> Executing -> Completed | Canceled | Failed`), remembers the
//! engine-native execution identifier while work is in flight, and races the
//! work against a [`CancelableWait`].

use std::future::Future;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;

use crate::engine::cancel::CancelableWait;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::types::{QueryId, QueryRowResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryState {
    Created,
    Executing,
    Completed,
    Canceled,
    Failed,
}

impl QueryState {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Canceled | Self::Failed)
    }
}

/// Handle returned by `Adapter::query`
#[async_trait]
pub trait CancelableQuery: Send + Sync {
    fn id(&self) -> QueryId;

    fn state(&self) -> QueryState;

    /// Run the query. May be called once.
    async fn execute(&self) -> EngineResult<Vec<QueryRowResult>>;

    /// Stop the running query. Fails with `NotCancelable` before the engine
    /// has reported an execution identifier.
    async fn cancel(&self) -> EngineResult<()>;
}

#[derive(Debug)]
struct TrackerState<Id> {
    phase: QueryState,
    execution: Option<Id>,
    canceling: bool,
}

/// State shared between `execute()` and `cancel()` of one handle.
#[derive(Debug)]
pub struct ExecutionTracker<Id> {
    id: QueryId,
    state: Mutex<TrackerState<Id>>,
    wait: CancelableWait,
}

impl<Id: Clone + Send> ExecutionTracker<Id> {
    pub fn new() -> Self {
        Self {
            id: QueryId::new(),
            state: Mutex::new(TrackerState {
                phase: QueryState::Created,
                execution: None,
                canceling: false,
            }),
            wait: CancelableWait::new(),
        }
    }

    pub fn id(&self) -> QueryId {
        self.id
    }

    pub fn state(&self) -> QueryState {
        self.state.lock().phase
    }

    pub fn execution_id(&self) -> Option<Id> {
        self.state.lock().execution.clone()
    }

    /// Move from `Created` to `Executing`.
    pub fn begin(&self) -> EngineResult<()> {
        let mut state = self.state.lock();
        if state.phase != QueryState::Created {
            return Err(EngineError::QueryAlreadyStarted);
        }
        state.phase = QueryState::Executing;
        Ok(())
    }

    /// Remember the identifier `cancel()` will target.
    pub fn record(&self, execution: Id) {
        self.state.lock().execution = Some(execution);
    }

    /// Run `work` until it completes or the handle is canceled.
    pub async fn race<T, F>(&self, work: F) -> EngineResult<T>
    where
        F: Future<Output = EngineResult<T>>,
    {
        tokio::pin!(work);
        tokio::select! {
            result = &mut work => result,
            waited = self.wait.wait() => match waited {
                Err(err) => Err(err),
                // Discarded by a concurrent finish; the work still owns the result.
                Ok(()) => work.await,
            },
        }
    }

    /// Settle the handle with the outcome of `race`.
    ///
    /// Errors that arrive while a cancel is in progress are reported as
    /// `CanceledByUser`, whatever the driver said.
    pub fn finish<T>(&self, result: EngineResult<T>) -> EngineResult<T> {
        self.wait.discard();

        let mut state = self.state.lock();
        state.execution = None;
        let canceled = state.canceling || self.wait.is_canceled();
        state.canceling = false;

        match result {
            Ok(value) => {
                state.phase = QueryState::Completed;
                Ok(value)
            }
            Err(err) if canceled || err.is_canceled() => {
                state.phase = QueryState::Canceled;
                tracing::debug!(query_id = %self.id, error = %err, "Query canceled");
                Err(EngineError::CanceledByUser)
            }
            Err(err) => {
                state.phase = QueryState::Failed;
                Err(err)
            }
        }
    }

    /// Issue the engine-native kill through `kill`, then release the race.
    pub async fn cancel<F, Fut>(&self, kill: F) -> EngineResult<()>
    where
        F: FnOnce(Id) -> Fut,
        Fut: Future<Output = EngineResult<()>>,
    {
        let execution = {
            let mut state = self.state.lock();
            let Some(execution) = state.execution.clone() else {
                return Err(EngineError::NotCancelable);
            };
            state.canceling = true;
            execution
        };

        if let Err(err) = kill(execution).await {
            self.state.lock().canceling = false;
            tracing::warn!(query_id = %self.id, error = %err, "Failed to cancel query");
            return Err(err);
        }

        self.wait.cancel();
        Ok(())
    }
}

impl<Id: Clone + Send> Default for ExecutionTracker<Id> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;

    #[tokio::test]
    async fn completes_when_work_wins() {
        let tracker: ExecutionTracker<u32> = ExecutionTracker::new();
        tracker.begin().expect("first begin");
        tracker.record(7);
        assert_eq!(tracker.execution_id(), Some(7));

        let result = tracker.race(async { Ok::<_, EngineError>(42) }).await;
        let value = tracker.finish(result).expect("work result");

        assert_eq!(value, 42);
        assert_eq!(tracker.state(), QueryState::Completed);
        assert_eq!(tracker.execution_id(), None);
    }

    #[tokio::test]
    async fn execute_runs_once() {
        let tracker: ExecutionTracker<u32> = ExecutionTracker::new();
        tracker.begin().expect("first begin");
        let err = tracker.begin().expect_err("second begin");
        assert!(matches!(err, EngineError::QueryAlreadyStarted));
    }

    #[tokio::test]
    async fn cancel_without_execution_id_is_rejected() {
        let tracker: ExecutionTracker<u32> = ExecutionTracker::new();
        let err = tracker
            .cancel(|_| async { Ok(()) })
            .await
            .expect_err("nothing to cancel");
        assert!(matches!(err, EngineError::NotCancelable));
    }

    #[tokio::test]
    async fn cancel_wins_race_and_is_retagged() {
        let tracker: Arc<ExecutionTracker<u32>> = Arc::new(ExecutionTracker::new());
        tracker.begin().expect("begin");
        tracker.record(99);

        let runner = {
            let tracker = tracker.clone();
            tokio::spawn(async move {
                let result = tracker
                    .race(async {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        Ok::<_, EngineError>(())
                    })
                    .await;
                tracker.finish(result)
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        tracker
            .cancel(|id| async move {
                assert_eq!(id, 99);
                Ok(())
            })
            .await
            .expect("cancel succeeds");

        let err = runner
            .await
            .expect("join")
            .expect_err("query should be canceled");
        assert_eq!(err.discriminator(), Some("CANCELED_BY_USER"));
        assert_eq!(tracker.state(), QueryState::Canceled);
    }

    #[tokio::test]
    async fn driver_error_during_cancel_is_retagged() {
        let tracker: ExecutionTracker<u32> = ExecutionTracker::new();
        tracker.begin().expect("begin");
        tracker.record(1);
        tracker.state.lock().canceling = true;

        let err = tracker
            .finish::<()>(Err(EngineError::execution_error_with_code(
                "canceling statement due to user request",
                "57014",
            )))
            .expect_err("error expected");
        assert!(err.is_canceled());
    }

    #[tokio::test]
    async fn failed_kill_resets_canceling() {
        let tracker: ExecutionTracker<u32> = ExecutionTracker::new();
        tracker.begin().expect("begin");
        tracker.record(5);

        let err = tracker
            .cancel(|_| async { Err(EngineError::execution_error("kill refused")) })
            .await
            .expect_err("kill failure is reported");
        assert!(!err.is_canceled());

        let result = tracker.finish::<()>(Err(EngineError::execution_error("later failure")));
        assert!(matches!(result, Err(EngineError::ExecutionError { .. })));
        assert_eq!(tracker.state(), QueryState::Failed);
    }
}
