//! Count-down latch delaying the first subscribe until dependents are ready.

use tokio::sync::watch;

/// A count-down latch over the broadcaster's startup dependents.
///
/// Subsystems that register listeners at startup are declared via
/// [`add_dependents`] before the broadcaster starts; each signals readiness
/// with [`dependent_ready`]. [`await_dependents`] resolves once all declared
/// dependents have signalled (immediately if none were declared), letting the
/// broadcaster pick its backfill depth with full knowledge of every initial
/// listener's confirmation requirements.
///
/// [`add_dependents`]: DependentAwaiter::add_dependents
/// [`dependent_ready`]: DependentAwaiter::dependent_ready
/// [`await_dependents`]: DependentAwaiter::await_dependents
#[derive(Debug)]
pub struct DependentAwaiter {
    remaining: watch::Sender<usize>,
}

impl Default for DependentAwaiter {
    fn default() -> Self {
        Self::new()
    }
}

impl DependentAwaiter {
    /// Creates a latch with no declared dependents.
    pub fn new() -> Self {
        let (remaining, _) = watch::channel(0);
        Self { remaining }
    }

    /// Declares `count` additional dependents to wait for.
    pub fn add_dependents(&self, count: usize) {
        self.remaining.send_modify(|remaining| *remaining += count);
    }

    /// Signals that one dependent has finished registering its listeners.
    /// Extra signals beyond the declared count are ignored.
    pub fn dependent_ready(&self) {
        self.remaining.send_modify(|remaining| *remaining = remaining.saturating_sub(1));
    }

    /// Resolves once every declared dependent has signalled readiness.
    pub async fn await_dependents(&self) {
        let mut ready = self.remaining.subscribe();
        // The sender lives in self, so the stream cannot end early.
        let _ = ready.wait_for(|&remaining| remaining == 0).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, time::Duration};
    use tokio::time::timeout;

    #[tokio::test]
    async fn ready_immediately_with_no_dependents() {
        let awaiter = DependentAwaiter::new();
        timeout(Duration::from_secs(1), awaiter.await_dependents())
            .await
            .expect("should not wait when nothing was declared");
    }

    #[tokio::test]
    async fn waits_for_every_declared_dependent() {
        let awaiter = Arc::new(DependentAwaiter::new());
        awaiter.add_dependents(2);

        let waiter = {
            let awaiter = awaiter.clone();
            tokio::spawn(async move { awaiter.await_dependents().await })
        };

        awaiter.dependent_ready();
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        awaiter.dependent_ready();
        timeout(Duration::from_secs(1), waiter)
            .await
            .expect("latch should open")
            .expect("waiter should not panic");
    }

    #[tokio::test]
    async fn extra_ready_signals_are_ignored() {
        let awaiter = DependentAwaiter::new();
        awaiter.add_dependents(1);
        awaiter.dependent_ready();
        awaiter.dependent_ready();
        timeout(Duration::from_secs(1), awaiter.await_dependents()).await.expect("latch open");
    }
}
