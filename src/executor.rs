//! ThreadExecutor (C4): bridges blocking model inference off the async
//! event loop, with cooperative cancellation.
//!
//! `spawn_blocking` tasks cannot be preempted — dropping the future that
//! awaits one does not stop the worker thread. So unlike ordinary tokio
//! cancellation (drop the future), cancelling a [`ThreadExecutor`] run
//! means setting a flag the blocking callable is expected to poll at its
//! own streaming checkpoints (inside a token callback, a generated-chunk
//! callback, and so on) and return early from. This mirrors the original
//! prototype's `threading.Event`-based `cancel_event`, generalized to
//! `tokio_util::sync::CancellationToken` — the idiom the rest of this
//! workspace's async code already selects over.

use crate::error::{PipelineError, Result};
use tokio_util::sync::CancellationToken;

/// Bridges one blocking callable at a time onto a worker thread.
pub struct ThreadExecutor {
    cancel: CancellationToken,
}

impl Default for ThreadExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadExecutor {
    #[must_use]
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
        }
    }

    /// A clone of the cancellation token for this executor's *next* `run`.
    /// Callers hold this to request cancellation while a run is in flight.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Requests cancellation of the in-flight (or next-started) run.
    pub fn request_cancel(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Clears the cancellation flag, submits `blocking_fn` to a worker
    /// thread with a clone of the fresh token, and awaits its completion.
    ///
    /// `blocking_fn` is expected to poll the token at its own streaming
    /// boundaries and return early once it observes cancellation.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Channel`] if the worker thread panicked.
    /// Propagates whatever error `blocking_fn` itself returns, including
    /// one signalling observed cancellation.
    pub async fn run<F, T>(&mut self, blocking_fn: F) -> Result<T>
    where
        F: FnOnce(CancellationToken) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let cancel = self.fresh_token();
        Self::run_with_token(cancel, blocking_fn).await
    }

    /// Like [`ThreadExecutor::run`], but also cancels the run the moment
    /// `external` fires. This is how a stage's workload (cancelled by the
    /// server scaffold's main loop on a new turn) reaches down into the
    /// blocking model call: the main loop's `CancellationToken` is not the
    /// same token the worker thread polls, so the two are bridged for the
    /// lifetime of this call.
    pub async fn run_linked<F, T>(&mut self, external: &CancellationToken, blocking_fn: F) -> Result<T>
    where
        F: FnOnce(CancellationToken) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let cancel = self.fresh_token();
        let bridge_cancel = cancel.clone();
        let external = external.clone();
        let bridge = tokio::spawn(async move {
            external.cancelled().await;
            bridge_cancel.cancel();
        });
        let result = Self::run_with_token(cancel, blocking_fn).await;
        bridge.abort();
        result
    }

    /// Installs a fresh cancellation token as `self.cancel` and returns a
    /// clone of it — the one token the next run's worker thread (and, for
    /// `run_linked`, its bridge task) both observe.
    fn fresh_token(&mut self) -> CancellationToken {
        self.cancel = CancellationToken::new();
        self.cancel.clone()
    }

    async fn run_with_token<F, T>(cancel: CancellationToken, blocking_fn: F) -> Result<T>
    where
        F: FnOnce(CancellationToken) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        tokio::task::spawn_blocking(move || blocking_fn(cancel))
            .await
            .map_err(|e| PipelineError::Channel(format!("worker thread panicked: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn run_executes_blocking_fn_to_completion() {
        let mut executor = ThreadExecutor::new();
        let result = executor.run(|_cancel| Ok(42)).await.unwrap();
        assert_eq!(result, 42);
    }

    #[tokio::test]
    async fn blocking_fn_observes_cooperative_cancellation() {
        let mut executor = ThreadExecutor::new();
        // `run` installs its own fresh token when polled, so the only way to
        // get a handle to the token the closure actually received is to have
        // the closure hand it back, rather than grabbing `cancel_token()`
        // beforehand (that would race the swap and cancel a stale token).
        let (token_tx, token_rx) = tokio::sync::oneshot::channel();
        let canceller = tokio::spawn(async move {
            if let Ok(token) = token_rx.await {
                tokio::time::sleep(Duration::from_millis(20)).await;
                token.cancel();
            }
        });

        let result = executor
            .run(move |cancel| {
                let _ = token_tx.send(cancel.clone());
                loop {
                    if cancel.is_cancelled() {
                        return Err(PipelineError::Model("cancelled".to_string()));
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
            })
            .await;

        canceller.await.unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn run_linked_external_token_cancels_the_worker() {
        let mut executor = ThreadExecutor::new();
        let external = CancellationToken::new();
        let linked_external = external.clone();
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            linked_external.cancel();
        });

        let result = executor
            .run_linked(&external, |cancel| {
                loop {
                    if cancel.is_cancelled() {
                        return Err(PipelineError::Model("cancelled".to_string()));
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
            })
            .await;

        canceller.await.unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn each_run_starts_with_a_fresh_cancellation_flag() {
        let mut executor = ThreadExecutor::new();
        executor.request_cancel();
        assert!(executor.is_cancelled());

        let observed_cancelled_at_start = executor.run(|cancel| Ok(cancel.is_cancelled())).await.unwrap();
        assert!(!observed_cancelled_at_start);
    }
}
