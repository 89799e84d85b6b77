//! Id assignment and deadline tracking for requests awaiting an answer.
//!
//! The correlator is owned by the session task, so ids, registrations and
//! expirations are all serialized there. Whichever of "reply arrived" and
//! "deadline expired" the task observes first removes the entry; the other
//! finds nothing and is a no-op.

use std::collections::BTreeMap;
use std::future::poll_fn;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio_util::time::{DelayQueue, delay_queue};

struct Entry<T> {
    waiter: T,
    deadline: delay_queue::Key,
}

pub(crate) struct Correlator<T> {
    last_id: u32,
    timeout: Duration,
    pending: BTreeMap<u32, Entry<T>>,
    deadlines: DelayQueue<u32>,
}

impl<T> Correlator<T> {
    pub(crate) fn new(timeout: Duration) -> Self {
        Self {
            last_id: 0,
            timeout,
            pending: BTreeMap::new(),
            deadlines: DelayQueue::new(),
        }
    }

    /// Next id, strictly increasing and never 0 (0 marks pushes on the wire).
    pub(crate) fn next_id(&mut self) -> u32 {
        self.last_id = self.last_id.wrapping_add(1);
        if self.last_id == 0 {
            self.last_id = 1;
        }
        self.last_id
    }

    /// Track `waiter` under `id` until it is taken, expires, or is drained.
    pub(crate) fn register(&mut self, id: u32, waiter: T) {
        let deadline = self.deadlines.insert(id, self.timeout);
        if let Some(old) = self.pending.insert(id, Entry { waiter, deadline }) {
            self.deadlines.try_remove(&old.deadline);
        }
    }

    /// Claim the entry for `id`, cancelling its deadline.
    pub(crate) fn take(&mut self, id: u32) -> Option<T> {
        let entry = self.pending.remove(&id)?;
        self.deadlines.try_remove(&entry.deadline);
        Some(entry.waiter)
    }

    /// Remove every entry, in id order.
    pub(crate) fn drain(&mut self) -> Vec<(u32, T)> {
        self.deadlines.clear();
        std::mem::take(&mut self.pending)
            .into_iter()
            .map(|(id, entry)| (id, entry.waiter))
            .collect()
    }

    /// Resolve when the earliest outstanding deadline passes. Pending forever
    /// while nothing is registered.
    pub(crate) async fn next_expired(&mut self) -> (u32, T) {
        poll_fn(|cx| self.poll_expired(cx)).await
    }

    fn poll_expired(&mut self, cx: &mut Context<'_>) -> Poll<(u32, T)> {
        while let Poll::Ready(Some(expired)) = self.deadlines.poll_expired(cx) {
            let id = expired.into_inner();
            if let Some(entry) = self.pending.remove(&id) {
                return Poll::Ready((id, entry.waiter));
            }
        }
        Poll::Pending
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_increase_and_skip_zero() {
        let mut c: Correlator<()> = Correlator::new(Duration::from_secs(5));
        assert_eq!(c.next_id(), 1);
        assert_eq!(c.next_id(), 2);
        c.last_id = u32::MAX;
        assert_eq!(c.next_id(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn take_cancels_deadline() {
        let mut c = Correlator::new(Duration::from_secs(5));
        let id = c.next_id();
        c.register(id, "publish");
        assert_eq!(c.take(id), Some("publish"));
        assert_eq!(c.take(id), None);
        assert!(c.is_empty());

        let expired =
            tokio::time::timeout(Duration::from_secs(10), c.next_expired()).await;
        assert!(expired.is_err(), "taken entry must not expire");
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_consumes_entry() {
        let mut c = Correlator::new(Duration::from_secs(5));
        let first = c.next_id();
        c.register(first, "a");
        tokio::time::advance(Duration::from_secs(1)).await;
        let second = c.next_id();
        c.register(second, "b");

        let (id, waiter) = c.next_expired().await;
        assert_eq!((id, waiter), (first, "a"));
        assert_eq!(c.take(first), None, "expired entry cannot complete");
        assert_eq!(c.len(), 1);

        let (id, waiter) = c.next_expired().await;
        assert_eq!((id, waiter), (second, "b"));
        assert!(c.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn drain_returns_id_order_and_clears() {
        let mut c = Correlator::new(Duration::from_secs(5));
        for name in ["x", "y", "z"] {
            let id = c.next_id();
            c.register(id, name);
        }
        let drained = c.drain();
        assert_eq!(drained, vec![(1, "x"), (2, "y"), (3, "z")]);
        assert!(c.is_empty());

        let expired =
            tokio::time::timeout(Duration::from_secs(10), c.next_expired()).await;
        assert!(expired.is_err());
    }
}
