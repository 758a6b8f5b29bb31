use crossbeam::queue::{ArrayQueue, SegQueue};
use std::fmt;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{self, Instant};

enum Slots<T> {
    Bounded(ArrayQueue<T>),
    Unbounded(SegQueue<T>),
}

/// Queue with wake-on-insert and timed removal. A bounded queue of capacity one
/// doubles as an idempotent wakeup flag: repeated offers collapse into one.
pub struct HandoffQueue<T> {
    slots: Slots<T>,
    notify: Notify,
}

impl<T> HandoffQueue<T> {
    pub fn bounded(capacity: usize) -> Self {
        Self {
            slots: Slots::Bounded(ArrayQueue::new(capacity.max(1))),
            notify: Notify::new(),
        }
    }

    pub fn unbounded() -> Self {
        Self {
            slots: Slots::Unbounded(SegQueue::new()),
            notify: Notify::new(),
        }
    }

    /// Inserts and wakes one taker. Returns the item back when full.
    pub fn offer(&self, item: T) -> Result<(), T> {
        match &self.slots {
            Slots::Bounded(q) => q.push(item)?,
            Slots::Unbounded(q) => q.push(item),
        }
        self.notify.notify_one();
        Ok(())
    }

    pub fn poll(&self) -> Option<T> {
        match &self.slots {
            Slots::Bounded(q) => q.pop(),
            Slots::Unbounded(q) => q.pop(),
        }
    }

    pub async fn take_timeout(&self, timeout: Duration) -> Option<T> {
        self.take_until(Instant::now() + timeout).await
    }

    /// Waits for an item until `deadline`.
    pub async fn take_until(&self, deadline: Instant) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // register before checking so an offer between the check and the
            // await is not lost
            notified.as_mut().enable();

            if let Some(item) = self.poll() {
                return Some(item);
            }
            if time::timeout_at(deadline, notified).await.is_err() {
                return self.poll();
            }
        }
    }

    pub fn len(&self) -> usize {
        match &self.slots {
            Slots::Bounded(q) => q.len(),
            Slots::Unbounded(q) => q.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) -> Vec<T> {
        std::iter::from_fn(|| self.poll()).collect()
    }
}

impl<T> fmt::Debug for HandoffQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandoffQueue").field("len", &self.len()).finish()
    }
}
