//! Bounded channels connecting pipeline stages.
//!
//! Two flavours share one implementation:
//!
//! - **ring** ([`BoundedChannel::ring`]): overwrite-oldest. `put` always
//!   succeeds; when full the oldest item is evicted.
//! - **backpressure** ([`BoundedChannel::backpressure`]): drop-oldest or
//!   reject-newest when full, plus a high/low watermark flag with hysteresis.
//!
//! Each channel owns exactly one mutex and one condition variable. No
//! operation ever takes two channel locks, so there is no ordering between
//! channels, only FIFO order within one.

use crate::config::{ChannelConfig, OverflowPolicy};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Result of a bounded `get`.
#[derive(Debug, PartialEq, Eq)]
pub enum Recv<T> {
    /// An item was dequeued.
    Item(T),
    /// A shutdown sentinel woke the consumer.
    Sentinel,
    /// The timeout elapsed with nothing to deliver.
    Empty,
}

impl<T> Recv<T> {
    /// Returns the item, discarding sentinel/empty.
    pub fn into_item(self) -> Option<T> {
        match self {
            Self::Item(item) => Some(item),
            Self::Sentinel | Self::Empty => None,
        }
    }
}

/// Point-in-time counters for a channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelStats {
    pub name: String,
    pub size: usize,
    pub capacity: usize,
    pub total_put: u64,
    pub total_get: u64,
    pub dropped: u64,
    /// `size / capacity`.
    pub utilization: f32,
    pub backpressure_active: bool,
}

/// Watermark thresholds in items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermarks {
    pub high: usize,
    pub low: usize,
}

impl Watermarks {
    /// Derive item thresholds from fill ratios.
    ///
    /// `high` is rounded up and at least 1; `low` is rounded down and kept
    /// strictly below `high`.
    pub fn from_ratios(capacity: usize, high: f32, low: f32) -> Self {
        let cap = capacity as f32;
        let high_items = ((cap * high).ceil() as usize).clamp(1, capacity.max(1));
        let low_items = ((cap * low).floor() as usize).min(high_items.saturating_sub(1));
        Self {
            high: high_items,
            low: low_items,
        }
    }
}

/// Type-erased control surface the coordinator and health monitor use.
pub trait ManagedChannel: Send + Sync {
    fn name(&self) -> &str;
    /// Remove every queued item, returning how many were removed.
    fn clear(&self) -> usize;
    /// Wake one blocked consumer with a sentinel.
    fn inject_sentinel(&self);
    fn stats(&self) -> ChannelStats;
    /// When the backpressure flag last turned on, if it is on now.
    fn backpressure_since(&self) -> Option<Instant>;
}

struct State<T> {
    items: VecDeque<T>,
    sentinels: usize,
    total_put: u64,
    total_get: u64,
    dropped: u64,
    backpressure_since: Option<Instant>,
}

/// A fixed-capacity FIFO with an explicit overflow policy.
pub struct BoundedChannel<T> {
    name: String,
    capacity: usize,
    policy: OverflowPolicy,
    watermarks: Option<Watermarks>,
    state: Mutex<State<T>>,
    ready: Condvar,
}

impl<T> std::fmt::Debug for BoundedChannel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedChannel")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl<T> BoundedChannel<T> {
    fn with_policy(
        name: impl Into<String>,
        capacity: usize,
        policy: OverflowPolicy,
        watermarks: Option<Watermarks>,
    ) -> Self {
        let capacity = capacity.max(1);
        Self {
            name: name.into(),
            capacity,
            policy,
            watermarks,
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity),
                sentinels: 0,
                total_put: 0,
                total_get: 0,
                dropped: 0,
                backpressure_since: None,
            }),
            ready: Condvar::new(),
        }
    }

    /// Overwrite ring buffer: the producer never blocks and never fails.
    pub fn ring(name: impl Into<String>, capacity: usize) -> Self {
        Self::with_policy(name, capacity, OverflowPolicy::OverwriteOldest, None)
    }

    /// Backpressure queue with explicit watermarks.
    ///
    /// `OverflowPolicy::OverwriteOldest` is treated as drop-oldest here.
    pub fn backpressure(
        name: impl Into<String>,
        capacity: usize,
        policy: OverflowPolicy,
        watermarks: Watermarks,
    ) -> Self {
        let policy = match policy {
            OverflowPolicy::OverwriteOldest => OverflowPolicy::DropOldest,
            other => other,
        };
        Self::with_policy(name, capacity, policy, Some(watermarks))
    }

    /// Backpressure queue using the policy and watermark ratios from config.
    pub fn from_config(name: impl Into<String>, capacity: usize, config: &ChannelConfig) -> Self {
        let capacity = capacity.max(1);
        let marks = Watermarks::from_ratios(capacity, config.high_watermark, config.low_watermark);
        Self::backpressure(name, capacity, config.overflow_policy, marks)
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Enqueue an item. Never blocks.
    ///
    /// Returns `false` only for a reject-newest queue that is full.
    pub fn put(&self, item: T) -> bool {
        let state = self.lock();
        self.push_locked(state, item)
    }

    /// Enqueue `item` unless `stale()` says it belongs to superseded work.
    ///
    /// `stale` runs under the channel lock, the same lock [`clear`] takes. An
    /// interrupt that marks work stale before clearing therefore either
    /// removes the item or makes this call refuse it.
    ///
    /// Returns `false` if the item was stale or refused by the overflow policy.
    ///
    /// [`clear`]: ManagedChannel::clear
    pub fn put_unless_stale(&self, item: T, stale: impl FnOnce() -> bool) -> bool {
        let state = self.lock();
        if stale() {
            return false;
        }
        self.push_locked(state, item)
    }

    fn push_locked(&self, mut state: MutexGuard<'_, State<T>>, item: T) -> bool {
        if state.items.len() >= self.capacity {
            match self.policy {
                OverflowPolicy::OverwriteOldest | OverflowPolicy::DropOldest => {
                    let _ = state.items.pop_front();
                    state.dropped += 1;
                }
                OverflowPolicy::RejectNewest => {
                    state.dropped += 1;
                    return false;
                }
            }
        }
        state.items.push_back(item);
        state.total_put += 1;
        self.update_watermark(&mut state);
        drop(state);
        self.ready.notify_one();
        true
    }

    /// Dequeue the next item, waiting at most `timeout`.
    ///
    /// A pending sentinel is delivered ahead of queued items.
    pub fn get(&self, timeout: Duration) -> Recv<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if state.sentinels > 0 {
                state.sentinels -= 1;
                return Recv::Sentinel;
            }
            if let Some(item) = state.items.pop_front() {
                state.total_get += 1;
                self.update_watermark(&mut state);
                return Recv::Item(item);
            }
            let now = Instant::now();
            if now >= deadline {
                return Recv::Empty;
            }
            let (guard, _) = self
                .ready
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            state = guard;
        }
    }

    /// Dequeue without waiting.
    pub fn try_get(&self) -> Option<T> {
        let mut state = self.lock();
        let item = state.items.pop_front()?;
        state.total_get += 1;
        self.update_watermark(&mut state);
        Some(item)
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    /// Whether the high watermark has been reached and the low one not yet.
    ///
    /// Always `false` for ring channels.
    pub fn is_backpressure_active(&self) -> bool {
        self.lock().backpressure_since.is_some()
    }

    /// Copy of the queued items in FIFO order.
    pub fn snapshot(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.lock().items.iter().cloned().collect()
    }

    fn update_watermark(&self, state: &mut State<T>) {
        let Some(marks) = self.watermarks else {
            return;
        };
        let len = state.items.len();
        match state.backpressure_since {
            None if len >= marks.high => state.backpressure_since = Some(Instant::now()),
            Some(_) if len <= marks.low => state.backpressure_since = None,
            _ => {}
        }
    }

    fn clear_items(&self) -> usize {
        let mut state = self.lock();
        let removed = state.items.len();
        state.items.clear();
        self.update_watermark(&mut state);
        removed
    }
}

impl<T: Send> ManagedChannel for BoundedChannel<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn clear(&self) -> usize {
        self.clear_items()
    }

    fn inject_sentinel(&self) {
        self.lock().sentinels += 1;
        self.ready.notify_all();
    }

    fn stats(&self) -> ChannelStats {
        let state = self.lock();
        let size = state.items.len();
        ChannelStats {
            name: self.name.clone(),
            size,
            capacity: self.capacity,
            total_put: state.total_put,
            total_get: state.total_get,
            dropped: state.dropped,
            utilization: size as f32 / self.capacity as f32,
            backpressure_active: state.backpressure_since.is_some(),
        }
    }

    fn backpressure_since(&self) -> Option<Instant> {
        self.lock().backpressure_since
    }
}
