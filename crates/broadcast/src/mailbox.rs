//! Drop-oldest mailboxes for inter-task signalling.

use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::{futures::Notified, Notify};

/// A multi-producer, single-consumer buffer with drop-oldest overflow.
///
/// Two configurations are used by the broadcaster:
///
/// - **Signal mailbox** (`capacity == 0`, unbounded): every delivered item is
///   retained until the consumer drains it. Used for subscribe/unsubscribe
///   requests.
/// - **Latest-only mailbox** (`capacity == 1`): a delivery replaces any
///   pending item. Used for new heads and replay requests, where only the
///   most recent value matters.
///
/// Delivery never blocks; when a bounded mailbox overflows, the oldest item
/// is silently discarded and [`deliver`] reports it so the producer can log.
///
/// [`deliver`]: Mailbox::deliver
#[derive(Debug)]
pub struct Mailbox<T> {
    queue: Mutex<VecDeque<T>>,
    capacity: usize,
    notify: Notify,
}

impl<T> Mailbox<T> {
    /// Creates a mailbox. `capacity == 0` means unbounded.
    pub fn new(capacity: usize) -> Self {
        Self { queue: Mutex::new(VecDeque::new()), capacity, notify: Notify::new() }
    }

    /// Delivers an item, discarding the oldest pending item if the mailbox is
    /// over capacity. Returns true if an item was discarded.
    pub fn deliver(&self, item: T) -> bool {
        let was_over_capacity = {
            let mut queue = self.queue.lock();
            queue.push_back(item);
            if self.capacity > 0 && queue.len() > self.capacity {
                queue.pop_front();
                true
            } else {
                false
            }
        };
        self.notify.notify_one();
        was_over_capacity
    }

    /// Resolves when at least one delivery has occurred since the last
    /// wakeup. Consumers drain with [`retrieve`] or
    /// [`retrieve_latest_and_clear`] afterwards.
    ///
    /// [`retrieve`]: Mailbox::retrieve
    /// [`retrieve_latest_and_clear`]: Mailbox::retrieve_latest_and_clear
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }

    /// Removes and returns the oldest pending item.
    pub fn retrieve(&self) -> Option<T> {
        self.queue.lock().pop_front()
    }

    /// Removes and returns the newest pending item, discarding the rest.
    pub fn retrieve_latest_and_clear(&self) -> Option<T> {
        let mut queue = self.queue.lock();
        let latest = queue.pop_back();
        queue.clear();
        latest
    }

    /// Removes and returns all pending items in delivery order.
    pub fn retrieve_all(&self) -> Vec<T> {
        self.queue.lock().drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn unbounded_mailbox_retains_everything() {
        let mailbox = Mailbox::new(0);
        for i in 0..100 {
            assert!(!mailbox.deliver(i));
        }
        assert_eq!(mailbox.retrieve_all(), (0..100).collect::<Vec<_>>());
        assert_eq!(mailbox.retrieve(), None);
    }

    #[test]
    fn bounded_mailbox_drops_oldest() {
        let mailbox = Mailbox::new(1);
        assert!(!mailbox.deliver(1));
        assert!(mailbox.deliver(2));
        assert!(mailbox.deliver(3));
        assert_eq!(mailbox.retrieve(), Some(3));
        assert_eq!(mailbox.retrieve(), None);
    }

    #[test]
    fn retrieve_latest_clears_backlog() {
        let mailbox = Mailbox::new(0);
        mailbox.deliver("a");
        mailbox.deliver("b");
        mailbox.deliver("c");
        assert_eq!(mailbox.retrieve_latest_and_clear(), Some("c"));
        assert_eq!(mailbox.retrieve(), None);
    }

    #[tokio::test]
    async fn notification_survives_delivery_before_wait() {
        let mailbox = Mailbox::new(1);
        mailbox.deliver(7u64);
        // The permit was stored before anyone waited.
        tokio::time::timeout(Duration::from_secs(1), mailbox.notified())
            .await
            .expect("notification should already be pending");
        assert_eq!(mailbox.retrieve(), Some(7));
    }

    #[tokio::test]
    async fn notifies_a_parked_consumer() {
        let mailbox = std::sync::Arc::new(Mailbox::new(0));
        let consumer = {
            let mailbox = mailbox.clone();
            tokio::spawn(async move {
                mailbox.notified().await;
                mailbox.retrieve()
            })
        };
        tokio::task::yield_now().await;
        mailbox.deliver(42);
        let received = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("consumer should wake")
            .expect("consumer should not panic");
        assert_eq!(received, Some(42));
    }
}
