use std::{future::Future, time::Duration};

/// A wrapper around a future that implements timing-out of that future.
///
/// On timeout the wrapped future is dropped, not polled to completion; when
/// the future is a remote call, the remote side may still be executing and
/// the caller is responsible for tearing the remote session down.
pub struct TimeoutFuture<F: Future> {
    fut: F,
    timeout: Duration,
}

impl<F: Future> TimeoutFuture<F> {
    pub fn new(fut: F, timeout: Duration) -> Self {
        Self { fut, timeout }
    }

    /// Waits for the future to complete. Returns [None] if it times out instead.
    ///
    /// **Not** cancel-safe.
    pub async fn wait(self) -> Option<F::Output> {
        tokio::select! {
            r = self.fut => {
                Some(r)
            }
            _ = tokio::time::sleep(self.timeout) => {
                None
            }
        }
    }
}
