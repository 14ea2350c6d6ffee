// SPDX-License-Identifier: MIT OR Apache-2.0
//! gwo-bus
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Bounded in-memory event bus with two read surfaces over one append
//! stream: `tail(n)` over a fixed-capacity ring buffer, and long-lived
//! broadcast subscriptions that deliver every event appended after the
//! subscription was opened. Producers never block: a full ring drops its
//! oldest event, and a subscriber that falls behind loses its subscription
//! rather than slowing the appender.

use gwo_core::Event;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// Default ring and per-subscriber channel capacity.
const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct StatsInner {
    total_published: AtomicU64,
    ring_dropped: AtomicU64,
    subscriber_lagged: AtomicU64,
}

/// Why a subscription ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionEnd {
    /// The subscriber's buffer overflowed; it missed this many events and
    /// must reconnect.
    Lagged(u64),
    /// The bus was dropped.
    Closed,
}

/// In-memory event bus.
pub struct EventBus {
    ring: Mutex<Ring>,
    tx: broadcast::Sender<Event>,
    stats: Arc<StatsInner>,
}

struct Ring {
    buf: VecDeque<Event>,
    capacity: usize,
}

impl EventBus {
    /// Create a bus with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a bus whose ring and subscriber channels hold `capacity`
    /// events.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(capacity);
        Self {
            ring: Mutex::new(Ring {
                buf: VecDeque::with_capacity(capacity),
                capacity,
            }),
            tx,
            stats: Arc::new(StatsInner::default()),
        }
    }

    /// Append an event: recorded in the ring and fanned out to every
    /// subscriber. Never blocks.
    pub fn publish(&self, event: Event) {
        self.stats.total_published.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut ring) = self.ring.lock() {
            if ring.buf.len() == ring.capacity {
                ring.buf.pop_front();
                self.stats.ring_dropped.fetch_add(1, Ordering::Relaxed);
            }
            ring.buf.push_back(event.clone());
        }
        // No subscribers is fine; the ring still has the event.
        let _ = self.tx.send(event);
    }

    /// The most recent up-to-`n` events, oldest first.
    #[must_use]
    pub fn tail(&self, n: usize) -> Vec<Event> {
        match self.ring.lock() {
            Ok(ring) => {
                let skip = ring.buf.len().saturating_sub(n);
                ring.buf.iter().skip(skip).cloned().collect()
            }
            Err(_) => Vec::new(),
        }
    }

    /// Open a subscription that receives every event published after this
    /// call.
    #[must_use]
    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            rx: self.tx.subscribe(),
            stats: Arc::clone(&self.stats),
        }
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Snapshot of bus counters.
    #[must_use]
    pub fn stats(&self) -> BusStats {
        BusStats {
            total_published: self.stats.total_published.load(Ordering::Relaxed),
            ring_dropped: self.stats.ring_dropped.load(Ordering::Relaxed),
            subscriber_lagged: self.stats.subscriber_lagged.load(Ordering::Relaxed),
            active_subscribers: self.tx.receiver_count(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A live subscription handle.
pub struct EventSubscription {
    rx: broadcast::Receiver<Event>,
    stats: Arc<StatsInner>,
}

impl EventSubscription {
    /// Receive the next event.
    ///
    /// Delivery is at-most-once and in publish order. A subscriber that
    /// lags past its buffer is disconnected: the missed count is returned
    /// and the subscription must be re-opened.
    ///
    /// # Errors
    ///
    /// [`SubscriptionEnd::Lagged`] when the buffer overflowed,
    /// [`SubscriptionEnd::Closed`] when the bus is gone.
    pub async fn recv(&mut self) -> Result<Event, SubscriptionEnd> {
        match self.rx.recv().await {
            Ok(ev) => Ok(ev),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                self.stats.subscriber_lagged.fetch_add(n, Ordering::Relaxed);
                Err(SubscriptionEnd::Lagged(n))
            }
            Err(broadcast::error::RecvError::Closed) => Err(SubscriptionEnd::Closed),
        }
    }

    /// Try to receive without waiting. `None` when nothing is pending or
    /// the subscription ended.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

/// Snapshot of bus statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusStats {
    /// Events published over the bus's lifetime.
    pub total_published: u64,
    /// Events evicted from the ring by overflow.
    pub ring_dropped: u64,
    /// Events missed by lagging subscribers before disconnect.
    pub subscriber_lagged: u64,
    /// Live subscriber count.
    pub active_subscribers: usize,
}
