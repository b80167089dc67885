//! Cancellation scope for component-scoped asynchronous work.
//!
//! Every long-lived command invocation carries a [`Scope`]; tearing the
//! owner down closes the scope, which wakes any pending timer select and
//! is checked before every store mutation so no write lands after
//! teardown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

#[derive(Clone, Default)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

#[derive(Default)]
struct ScopeInner {
    closed: AtomicBool,
    notify: Notify,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close the scope. Idempotent; wakes everything waiting in
    /// [`Scope::cancelled`].
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Completes once the scope has been closed.
    pub async fn cancelled(&self) {
        loop {
            if self.is_closed() {
                return;
            }
            // Register interest before the final check so a close between
            // the check and the await cannot be missed.
            let notified = self.inner.notify.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancelled_completes_after_close() {
        let scope = Scope::new();
        let waiter = {
            let scope = scope.clone();
            tokio::spawn(async move { scope.cancelled().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        scope.close();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish")
            .expect("waiter task should not panic");
        assert!(scope.is_closed());
    }

    #[tokio::test]
    async fn cancelled_returns_immediately_when_already_closed() {
        let scope = Scope::new();
        scope.close();
        scope.close(); // idempotent
        scope.cancelled().await;
    }
}
