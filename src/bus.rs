// SPDX-License-Identifier: GPL-3.0-only

//! Single-producer, multi-consumer frame distribution
//!
//! Every consumer owns a bounded queue. When a queue is full the oldest
//! unread frame is dropped, so a slow renderer can never stall capture:
//! `publish` only ever takes the bus lock briefly and never waits on a
//! consumer.
//!
//! Consumers choose how to wait:
//! - [`FrameBus::poll`] never blocks and returns [`Poll::Empty`] when nothing
//!   is queued
//! - [`FrameBus::poll_timeout`] parks the calling OS thread (worker threads)
//! - [`FrameBus::recv`] suspends the calling task (async consumers)

use crate::constants::DEFAULT_QUEUE_DEPTH;
use crate::errors::{CaptureError, CaptureResult};
use crate::media::{Frame, SharedFrame};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

/// Identifies one subscription on a bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerId(u64);

impl std::fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "consumer-{}", self.0)
    }
}

/// Result of polling a consumer queue
#[derive(Debug, Clone)]
pub enum Poll {
    /// The oldest unread frame
    Frame(SharedFrame),
    /// Nothing queued right now
    Empty,
    /// The bus was closed or the consumer unsubscribed
    Closed,
}

impl Poll {
    pub fn into_frame(self) -> Option<SharedFrame> {
        match self {
            Poll::Frame(frame) => Some(frame),
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Poll::Closed)
    }
}

/// Counters for one bus
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    pub published: u64,
    /// Frames discarded by drop-oldest across all consumers
    pub dropped: u64,
    /// Frames rejected because their sequence did not increase
    pub rejected: u64,
    pub consumers: usize,
}

struct ConsumerSlot {
    queue: VecDeque<SharedFrame>,
    notify: Arc<Notify>,
    dropped: u64,
}

#[derive(Default)]
struct BusState {
    closed: bool,
    next_id: u64,
    consumers: HashMap<ConsumerId, ConsumerSlot>,
    last_sequence: Option<u64>,
    latest: Option<SharedFrame>,
    stats: BusStats,
}

struct BusInner {
    name: String,
    depth: usize,
    state: Mutex<BusState>,
    /// Wakes threads parked in `poll_timeout`
    available: Condvar,
}

/// Frame distribution point shared by one producer and many consumers
///
/// Cloning yields another handle to the same bus.
#[derive(Clone)]
pub struct FrameBus {
    inner: Arc<BusInner>,
}

impl FrameBus {
    /// Create a bus with the given per-consumer queue depth (minimum 1)
    pub fn new(name: impl Into<String>, depth: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                name: name.into(),
                depth: depth.max(1),
                state: Mutex::new(BusState::default()),
                available: Condvar::new(),
            }),
        }
    }

    /// Create a bus with the default queue depth
    pub fn with_default_depth(name: impl Into<String>) -> Self {
        Self::new(name, DEFAULT_QUEUE_DEPTH)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn depth(&self) -> usize {
        self.inner.depth
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand a frame to every consumer
    ///
    /// The frame becomes shared and immutable from here on. Consumers whose
    /// queue is full lose their oldest unread frame. Never blocks on a
    /// consumer.
    ///
    /// # Errors
    /// * `SessionClosed` - the bus has been closed
    pub fn publish(&self, frame: Frame) -> CaptureResult<()> {
        self.publish_shared(Arc::new(frame))
    }

    /// Like [`publish`](Self::publish) for a frame that is already shared
    pub fn publish_shared(&self, frame: SharedFrame) -> CaptureResult<()> {
        let mut state = self.lock();
        if state.closed {
            return Err(CaptureError::SessionClosed);
        }

        if let Some(last) = state.last_sequence
            && frame.sequence <= last
        {
            state.stats.rejected += 1;
            warn!(
                bus = %self.inner.name,
                sequence = frame.sequence,
                last,
                "Rejecting out-of-order frame"
            );
            return Ok(());
        }

        let depth = self.inner.depth;
        let mut dropped = 0;
        for slot in state.consumers.values_mut() {
            if slot.queue.len() >= depth {
                slot.queue.pop_front();
                slot.dropped += 1;
                dropped += 1;
            }
            slot.queue.push_back(Arc::clone(&frame));
            slot.notify.notify_one();
        }

        state.last_sequence = Some(frame.sequence);
        state.latest = Some(Arc::clone(&frame));
        state.stats.published += 1;
        state.stats.dropped += dropped;
        drop(state);

        trace!(bus = %self.inner.name, sequence = frame.sequence, dropped, "Published frame");
        self.inner.available.notify_all();
        Ok(())
    }

    /// Register a new consumer
    ///
    /// A new consumer only sees frames published after it subscribed.
    ///
    /// # Errors
    /// * `SessionClosed` - the bus has been closed
    pub fn subscribe(&self) -> CaptureResult<ConsumerId> {
        let mut state = self.lock();
        if state.closed {
            return Err(CaptureError::SessionClosed);
        }

        let id = ConsumerId(state.next_id);
        state.next_id += 1;
        state.consumers.insert(
            id,
            ConsumerSlot {
                queue: VecDeque::with_capacity(self.inner.depth),
                notify: Arc::new(Notify::new()),
                dropped: 0,
            },
        );
        state.stats.consumers = state.consumers.len();

        debug!(bus = %self.inner.name, consumer = %id, "Consumer subscribed");
        Ok(id)
    }

    /// Remove a consumer; unknown or already removed ids are ignored
    pub fn unsubscribe(&self, id: ConsumerId) {
        let mut state = self.lock();
        if let Some(slot) = state.consumers.remove(&id) {
            state.stats.consumers = state.consumers.len();
            slot.notify.notify_one();
            debug!(bus = %self.inner.name, consumer = %id, dropped = slot.dropped, "Consumer unsubscribed");
        }
    }

    /// Take the oldest unread frame without waiting
    pub fn poll(&self, id: ConsumerId) -> Poll {
        let mut state = self.lock();
        Self::poll_locked(&mut state, id)
    }

    fn poll_locked(state: &mut BusState, id: ConsumerId) -> Poll {
        if state.closed {
            return Poll::Closed;
        }
        match state.consumers.get_mut(&id) {
            Some(slot) => match slot.queue.pop_front() {
                Some(frame) => Poll::Frame(frame),
                None => Poll::Empty,
            },
            None => Poll::Closed,
        }
    }

    /// Block the calling thread until a frame arrives, the bus closes or the
    /// timeout elapses (in which case `Empty` is returned)
    pub fn poll_timeout(&self, id: ConsumerId, timeout: Duration) -> Poll {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            match Self::poll_locked(&mut state, id) {
                Poll::Empty => {}
                other => return other,
            }

            let now = Instant::now();
            if now >= deadline {
                return Poll::Empty;
            }
            state = self
                .inner
                .available
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Wait asynchronously for the next frame
    ///
    /// Returns `None` once the bus is closed or the consumer is gone.
    pub async fn recv(&self, id: ConsumerId) -> Option<SharedFrame> {
        loop {
            let notify = {
                let mut state = self.lock();
                match Self::poll_locked(&mut state, id) {
                    Poll::Frame(frame) => return Some(frame),
                    Poll::Closed => return None,
                    Poll::Empty => state.consumers.get(&id).map(|slot| Arc::clone(&slot.notify))?,
                }
            };
            // Notify keeps a permit if the producer signalled between the
            // poll above and this await
            notify.notified().await;
        }
    }

    /// Close the bus: queued frames are discarded, every consumer sees
    /// `Closed` on its next poll and further subscriptions fail
    pub fn close(&self) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        state.latest = None;
        let mut discarded = 0;
        for slot in state.consumers.values_mut() {
            discarded += slot.queue.len();
            slot.queue.clear();
            slot.notify.notify_one();
        }
        drop(state);

        self.inner.available.notify_all();
        debug!(bus = %self.inner.name, discarded, "Frame bus closed");
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Most recently published frame, if the bus is still open
    pub fn latest(&self) -> Option<SharedFrame> {
        self.lock().latest.clone()
    }

    /// Frames dropped so far for one consumer
    pub fn dropped_for(&self, id: ConsumerId) -> Option<u64> {
        self.lock().consumers.get(&id).map(|slot| slot.dropped)
    }

    pub fn stats(&self) -> BusStats {
        self.lock().stats
    }
}

impl std::fmt::Debug for FrameBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("FrameBus")
            .field("name", &self.inner.name)
            .field("depth", &self.inner.depth)
            .field("closed", &state.closed)
            .field("consumers", &state.consumers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(sequence: u64) -> Frame {
        Frame::from_rgba(vec![0; 4], 1, 1, Duration::from_millis(sequence), sequence)
    }

    #[test]
    fn test_poll_empty_then_frame() {
        let bus = FrameBus::new("test", 2);
        let id = bus.subscribe().unwrap();
        assert!(matches!(bus.poll(id), Poll::Empty));

        bus.publish(frame(1)).unwrap();
        let got = bus.poll(id).into_frame().unwrap();
        assert_eq!(got.sequence, 1);
    }

    #[test]
    fn test_drop_oldest_keeps_newest() {
        let bus = FrameBus::new("test", 2);
        let id = bus.subscribe().unwrap();
        for seq in 1..=10 {
            bus.publish(frame(seq)).unwrap();
        }

        assert_eq!(bus.poll(id).into_frame().unwrap().sequence, 9);
        assert_eq!(bus.poll(id).into_frame().unwrap().sequence, 10);
        assert!(matches!(bus.poll(id), Poll::Empty));
        assert_eq!(bus.dropped_for(id), Some(8));
    }

    #[test]
    fn test_out_of_order_is_rejected() {
        let bus = FrameBus::new("test", 4);
        let id = bus.subscribe().unwrap();
        bus.publish(frame(5)).unwrap();
        bus.publish(frame(3)).unwrap();
        bus.publish(frame(5)).unwrap();

        assert_eq!(bus.poll(id).into_frame().unwrap().sequence, 5);
        assert!(matches!(bus.poll(id), Poll::Empty));
        assert_eq!(bus.stats().rejected, 2);
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let bus = FrameBus::new("test", 2);
        let id = bus.subscribe().unwrap();
        bus.unsubscribe(id);
        bus.unsubscribe(id);
        assert!(bus.poll(id).is_closed());
        assert_eq!(bus.stats().consumers, 0);
    }

    #[test]
    fn test_close_discards_and_rejects() {
        let bus = FrameBus::new("test", 2);
        let id = bus.subscribe().unwrap();
        bus.publish(frame(1)).unwrap();
        bus.close();

        assert!(bus.poll(id).is_closed());
        assert_eq!(bus.subscribe(), Err(CaptureError::SessionClosed));
        assert_eq!(bus.publish(frame(2)), Err(CaptureError::SessionClosed));
        assert!(bus.latest().is_none());
    }

    #[test]
    fn test_poll_timeout_wakes_on_publish() {
        let bus = FrameBus::new("test", 2);
        let id = bus.subscribe().unwrap();
        let producer = bus.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.publish(frame(1)).unwrap();
        });

        let got = bus.poll_timeout(id, Duration::from_secs(2));
        handle.join().unwrap();
        assert_eq!(got.into_frame().unwrap().sequence, 1);
    }

    #[test]
    fn test_poll_timeout_expires() {
        let bus = FrameBus::new("test", 2);
        let id = bus.subscribe().unwrap();
        assert!(matches!(
            bus.poll_timeout(id, Duration::from_millis(10)),
            Poll::Empty
        ));
    }

    #[tokio::test]
    async fn test_recv_returns_none_after_close() {
        let bus = FrameBus::new("test", 2);
        let id = bus.subscribe().unwrap();
        let closer = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            closer.close();
        });
        assert!(bus.recv(id).await.is_none());
    }
}
