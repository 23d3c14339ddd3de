//! Request-scoped cancellation.
//!
//! Dropping the `CancelHandle` counts as cancellation, so a request whose
//! client went away stops at its next await point.

use tokio::sync::watch;

pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

#[derive(Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolves once cancelled; never resolves otherwise.
    pub async fn cancelled(&mut self) {
        // wait_for errors only when the sender is gone, which is a cancel too.
        let _ = self.rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// Resolves once the process-wide shutdown flag is set or its sender is gone.
///
/// Only `()` leaves this future, so loops can `select!` on it next to arms
/// that await without holding a `watch::Ref`.
pub async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_resolves() {
        let (handle, mut signal) = cancel_pair();
        assert!(!signal.is_cancelled());
        handle.cancel();
        tokio::time::timeout(Duration::from_millis(100), signal.cancelled())
            .await
            .unwrap();
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn test_dropped_handle_cancels() {
        let (handle, mut signal) = cancel_pair();
        drop(handle);
        tokio::time::timeout(Duration::from_millis(100), signal.cancelled())
            .await
            .unwrap();
        assert!(signal.is_cancelled());
    }

    #[test]
    fn test_pending_until_cancelled() {
        let (handle, mut signal) = cancel_pair();
        let mut cancelled = tokio_test::task::spawn(signal.cancelled());
        tokio_test::assert_pending!(cancelled.poll());

        handle.cancel();
        assert!(cancelled.is_woken());
        tokio_test::assert_ready!(cancelled.poll());
    }

    #[test]
    fn test_stop_requested_sees_flag_set_earlier() {
        let (tx, mut rx) = watch::channel(false);
        tx.send_replace(true);
        let mut stop = tokio_test::task::spawn(stop_requested(&mut rx));
        tokio_test::assert_ready!(stop.poll());
    }

    #[test]
    fn test_stop_requested_waits_for_flag() {
        let (tx, mut rx) = watch::channel(false);
        let mut stop = tokio_test::task::spawn(stop_requested(&mut rx));
        tokio_test::assert_pending!(stop.poll());
        tx.send_replace(true);
        assert!(stop.is_woken());
        tokio_test::assert_ready!(stop.poll());
    }
}
