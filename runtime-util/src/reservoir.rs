//! A bounded mediator queue with an overflow side channel.
//!
//! `reservoir(limit)` returns a sender and two receivers. The mediator
//! holds up to `limit` items in insertion order. When full and a new item
//! arrives, the oldest queued item is moved to the overflow receiver
//! instead of being delivered on the main receiver; if the overflow side
//! is itself full, its oldest item is dropped (and logged) to make room.
//! Closing the sender drains everything already queued to the main
//! receiver before it (and the overflow receiver) report closed.
//!
//! Used to cap in-flight uploads without ever blocking a producer: plain
//! `tokio::mpsc` channels can't evict an already-queued item when full, so
//! this keeps its own bounded deques behind a mutex instead.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::warn;

struct State<T> {
    queue: VecDeque<T>,
    overflow: VecDeque<T>,
    closed: bool,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    limit: usize,
    receive_notify: Notify,
    overflow_notify: Notify,
}

pub struct ReservoirSender<T> {
    inner: Arc<Inner<T>>,
}

pub struct ReservoirReceiver<T> {
    inner: Arc<Inner<T>>,
}

pub struct OverflowReceiver<T> {
    inner: Arc<Inner<T>>,
}

pub fn reservoir<T>(limit: usize) -> (ReservoirSender<T>, ReservoirReceiver<T>, OverflowReceiver<T>) {
    let limit = limit.max(1);
    let inner = Arc::new(Inner {
        state: Mutex::new(State {
            queue: VecDeque::with_capacity(limit),
            overflow: VecDeque::new(),
            closed: false,
        }),
        limit,
        receive_notify: Notify::new(),
        overflow_notify: Notify::new(),
    });
    (
        ReservoirSender { inner: inner.clone() },
        ReservoirReceiver { inner: inner.clone() },
        OverflowReceiver { inner },
    )
}

impl<T> ReservoirSender<T> {
    /// Enqueues an item. Never blocks: if the mediator is already holding
    /// `limit` items, the oldest one is displaced to the overflow side.
    pub fn send(&self, item: T) {
        let mut state = self.inner.state.lock().expect("reservoir mutex poisoned");
        if state.closed {
            return;
        }
        state.queue.push_back(item);
        if state.queue.len() > self.inner.limit {
            let overflowed = state.queue.pop_front().expect("just pushed");
            if state.overflow.len() >= self.inner.limit {
                state.overflow.pop_front();
                warn!("reservoir overflow queue full, dropping oldest overflow item");
            }
            state.overflow.push_back(overflowed);
            drop(state);
            self.inner.overflow_notify.notify_one();
        } else {
            drop(state);
        }
        self.inner.receive_notify.notify_one();
    }

    pub fn close(&self) {
        let mut state = self.inner.state.lock().expect("reservoir mutex poisoned");
        state.closed = true;
        drop(state);
        self.inner.receive_notify.notify_waiters();
        self.inner.overflow_notify.notify_waiters();
    }
}

impl<T> Clone for ReservoirSender<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> ReservoirReceiver<T> {
    /// Waits for the next item, or returns `None` once the sender is
    /// closed and the queue has fully drained.
    pub async fn recv(&self) -> Option<T> {
        loop {
            let notified = self.inner.receive_notify.notified();
            {
                let mut state = self.inner.state.lock().expect("reservoir mutex poisoned");
                if let Some(item) = state.queue.pop_front() {
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }
}

impl<T> OverflowReceiver<T> {
    pub async fn recv(&self) -> Option<T> {
        loop {
            let notified = self.inner.overflow_notify.notified();
            {
                let mut state = self.inner.state.lock().expect("reservoir mutex poisoned");
                if let Some(item) = state.overflow.pop_front() {
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
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
    async fn delivers_items_in_order_under_the_limit() {
        let (tx, rx, _overflow) = reservoir::<i32>(3);
        tx.send(1);
        tx.send(2);
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
    }

    #[tokio::test]
    async fn overflow_receives_oldest_when_full() {
        let (tx, rx, overflow) = reservoir::<i32>(2);
        tx.send(1);
        tx.send(2);
        tx.send(3); // queue now holds [2,3], 1 displaced to overflow
        assert_eq!(overflow.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(rx.recv().await, Some(3));
    }

    #[tokio::test]
    async fn overflow_drops_oldest_when_overflow_itself_is_full() {
        let (tx, _rx, overflow) = reservoir::<i32>(1);
        tx.send(1); // queue: [1]
        tx.send(2); // 1 -> overflow, queue: [2]
        tx.send(3); // 2 -> overflow (overflow limit 1, 1 dropped), queue: [3]
        assert_eq!(overflow.recv().await, Some(2));
    }

    #[tokio::test]
    async fn close_drains_then_reports_done() {
        let (tx, rx, overflow) = reservoir::<i32>(5);
        tx.send(1);
        tx.send(2);
        tx.close();
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(rx.recv().await, None);
        assert_eq!(overflow.recv().await, None);
    }

    #[tokio::test]
    async fn send_after_close_is_a_noop() {
        let (tx, rx, _overflow) = reservoir::<i32>(5);
        tx.close();
        tx.send(99);
        assert_eq!(
            tokio::time::timeout(Duration::from_millis(20), rx.recv())
                .await
                .unwrap(),
            None
        );
    }
}
