//! Suspension points for job polling.
//!
//! Blocking and cooperative callers run the same async core; they differ
//! only in how a poll delay is spent.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// The caller withdrew interest while the operation was suspended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Interrupted;

pub(crate) trait Suspend {
    async fn pause(&mut self, delay: Duration) -> Result<(), Interrupted>;

    /// Interest already withdrawn; checked between steps.
    fn interrupted(&self) -> bool {
        false
    }
}

/// Sleeps the calling thread.
#[derive(Debug, Default)]
pub(crate) struct Blocking;

impl Suspend for Blocking {
    async fn pause(&mut self, delay: Duration) -> Result<(), Interrupted> {
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        Ok(())
    }
}

/// Yields to the tokio scheduler, racing the delay against a cancellation token.
#[derive(Debug)]
pub(crate) struct Cooperative<'a> {
    cancel: &'a CancellationToken,
}

impl<'a> Cooperative<'a> {
    pub(crate) fn new(cancel: &'a CancellationToken) -> Self {
        Self { cancel }
    }
}

impl Suspend for Cooperative<'_> {
    async fn pause(&mut self, delay: Duration) -> Result<(), Interrupted> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Interrupted),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    fn interrupted(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Drive a future built on [`Blocking`] to completion on the current thread.
pub(crate) fn run_blocking<F: Future>(future: F) -> F::Output {
    futures::executor::block_on(future)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn blocking_pause_sleeps() {
        let start = Instant::now();
        let result = run_blocking(Blocking.pause(Duration::from_millis(20)));
        assert_eq!(result, Ok(()));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn cooperative_pause_completes_without_cancel() {
        let token = CancellationToken::new();
        let mut suspend = Cooperative::new(&token);
        assert_eq!(suspend.pause(Duration::from_millis(5)).await, Ok(()));
        assert!(!suspend.interrupted());
    }

    #[tokio::test]
    async fn cooperative_pause_interrupted_by_cancel() {
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let start = Instant::now();
        let mut suspend = Cooperative::new(&token);
        assert_eq!(suspend.pause(Duration::from_secs(30)).await, Err(Interrupted));
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(suspend.interrupted());
    }
}
