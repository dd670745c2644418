//! Keel work queue: turns a stream of change notifications into keys to
//! reconcile. Keys are deduplicated while pending, never handed to two
//! workers at once, and re-queued once if they change while in flight.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::fmt;
use std::hash::Hash;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use metrics::{counter, gauge};
use rand::Rng;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tracing::{debug, warn};

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse::<T>().ok())
}

/// What `add` does when `capacity` keys are already pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Wait for a worker to take a key.
    Block,
    /// Drop the key, log it and count it.
    Drop,
}

impl FromStr for OverflowPolicy {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "block" => Ok(Self::Block),
            "drop" => Ok(Self::Drop),
            other => Err(format!("unknown overflow policy: {} (expect block|drop)", other)),
        }
    }
}

/// Exponential backoff: `min(base * 2^attempt + jitter, max)`.
///
/// Jitter is added on top of the exponential step (up to `jitter * step`) and
/// the sum is clamped to `max`, so successive delays never shrink.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    /// Fraction in `[0, 1]`.
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self { base: Duration::from_millis(5), max: Duration::from_secs(60), jitter: 0.1 }
    }
}

impl Backoff {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            base: env_parse::<u64>("KEEL_BACKOFF_BASE_MS").map(Duration::from_millis).unwrap_or(d.base),
            max: env_parse::<u64>("KEEL_BACKOFF_MAX_MS").map(Duration::from_millis).unwrap_or(d.max),
            jitter: env_parse::<f64>("KEEL_BACKOFF_JITTER").unwrap_or(d.jitter),
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let step = 2u32
            .checked_pow(attempt)
            .and_then(|factor| self.base.checked_mul(factor))
            .unwrap_or(self.max)
            .min(self.max);
        let frac = if self.jitter.is_finite() { self.jitter.clamp(0.0, 1.0) } else { 0.0 };
        let jitter = if frac > 0.0 && !step.is_zero() {
            step.mul_f64(rand::thread_rng().gen_range(0.0..=frac))
        } else {
            Duration::ZERO
        };
        step.saturating_add(jitter).min(self.max)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    /// Maximum number of pending (not yet dequeued) keys.
    pub capacity: usize,
    pub overflow: OverflowPolicy,
    pub backoff: Backoff,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { capacity: 2048, overflow: OverflowPolicy::Block, backoff: Backoff::default() }
    }
}

impl QueueConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            capacity: env_parse::<usize>("KEEL_QUEUE_CAP").filter(|n| *n > 0).unwrap_or(d.capacity),
            overflow: env_parse::<OverflowPolicy>("KEEL_QUEUE_OVERFLOW").unwrap_or(d.overflow),
            backoff: Backoff::from_env(),
        }
    }
}

struct State<K> {
    pending: VecDeque<K>,
    queued: FxHashSet<K>,
    processing: FxHashSet<K>,
    dirty: FxHashSet<K>,
    failures: FxHashMap<K, u32>,
    dropped: u64,
    /// `add_after` timers that have not fired yet.
    delayed: usize,
    shutting_down: bool,
}

impl<K> Default for State<K> {
    fn default() -> Self {
        Self {
            pending: VecDeque::new(),
            queued: FxHashSet::default(),
            processing: FxHashSet::default(),
            dirty: FxHashSet::default(),
            failures: FxHashMap::default(),
            dropped: 0,
            delayed: 0,
            shutting_down: false,
        }
    }
}

/// Deduplicating work queue keyed by `K`. All bookkeeping sits behind one mutex;
/// every operation is an O(1) set/map lookup.
pub struct WorkQueue<K> {
    state: Mutex<State<K>>,
    items: Notify,
    space: Notify,
    cfg: QueueConfig,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + fmt::Display + Send + Sync + 'static,
{
    pub fn new(cfg: QueueConfig) -> Self {
        Self { state: Mutex::new(State::default()), items: Notify::new(), space: Notify::new(), cfg }
    }

    fn lock(&self) -> MutexGuard<'_, State<K>> { self.state.lock().unwrap_or_else(PoisonError::into_inner) }

    pub fn config(&self) -> &QueueConfig { &self.cfg }

    /// Enqueue `key`. Returns false when the key was already pending, was dropped
    /// under `OverflowPolicy::Drop`, or the queue is shut down.
    ///
    /// A key that is currently in flight is marked dirty instead and re-queued by `done`.
    pub async fn add(&self, key: K) -> bool {
        loop {
            let space = self.space.notified();
            {
                let mut st = self.lock();
                if st.shutting_down {
                    return false;
                }
                if st.queued.contains(&key) {
                    return false;
                }
                if st.processing.contains(&key) {
                    let fresh = st.dirty.insert(key.clone());
                    if fresh {
                        debug!(key = %key, "queue: in flight; marked dirty");
                    }
                    return fresh;
                }
                if st.pending.len() < self.cfg.capacity {
                    st.queued.insert(key.clone());
                    st.pending.push_back(key);
                    gauge!("queue_depth", st.pending.len() as f64);
                    counter!("queue_adds_total", 1u64);
                    drop(st);
                    self.items.notify_one();
                    return true;
                }
                if self.cfg.overflow == OverflowPolicy::Drop {
                    st.dropped = st.dropped.saturating_add(1);
                    counter!("queue_dropped_total", 1u64);
                    warn!(key = %key, capacity = self.cfg.capacity, "queue: full; dropping key");
                    return false;
                }
            }
            space.await;
        }
    }

    /// Wait for the next key and mark it in flight. `None` once shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let items = self.items.notified();
            {
                let mut st = self.lock();
                if st.shutting_down {
                    return None;
                }
                if let Some(key) = st.pending.pop_front() {
                    st.queued.remove(&key);
                    st.processing.insert(key.clone());
                    let more = !st.pending.is_empty();
                    gauge!("queue_depth", st.pending.len() as f64);
                    drop(st);
                    self.space.notify_waiters();
                    if more {
                        self.items.notify_one();
                    }
                    return Some(key);
                }
            }
            items.await;
        }
    }

    /// Finish processing `key`. If it changed while in flight it goes straight
    /// back to the queue; that re-add ignores `capacity` since it was already admitted.
    pub fn done(&self, key: &K) {
        let mut st = self.lock();
        st.processing.remove(key);
        if st.dirty.remove(key) && !st.shutting_down && st.queued.insert(key.clone()) {
            st.pending.push_back(key.clone());
            gauge!("queue_depth", st.pending.len() as f64);
            drop(st);
            self.items.notify_one();
        }
    }

    /// Add `key` after `delay`. Used for requeue-after and backoff.
    pub fn add_after(self: &Arc<Self>, key: K, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        self.lock().delayed += 1;
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            queue.add(key).await;
            queue.lock().delayed -= 1;
        });
    }

    /// Count a failure for `key` and schedule it after the backoff for that many
    /// failures. Returns the chosen delay.
    pub fn add_rate_limited(self: &Arc<Self>, key: K) -> Duration {
        let attempt = {
            let mut st = self.lock();
            let n = st.failures.entry(key.clone()).or_insert(0);
            let attempt = *n;
            *n = n.saturating_add(1);
            attempt
        };
        let delay = self.cfg.backoff.delay(attempt);
        debug!(key = %key, attempt, delay_ms = delay.as_millis() as u64, "queue: backoff");
        self.add_after(key, delay);
        delay
    }

    /// Reset the failure count for `key`.
    pub fn forget(&self, key: &K) { self.lock().failures.remove(key); }

    pub fn num_requeues(&self, key: &K) -> u32 { self.lock().failures.get(key).copied().unwrap_or(0) }

    /// Pending keys (not counting in-flight ones).
    pub fn len(&self) -> usize { self.lock().pending.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn in_flight(&self) -> usize { self.lock().processing.len() }

    pub fn is_processing(&self, key: &K) -> bool { self.lock().processing.contains(key) }

    pub fn dropped(&self) -> u64 { self.lock().dropped }

    /// Nothing pending, nothing in flight and no timer about to add a key.
    pub fn is_idle(&self) -> bool {
        let st = self.lock();
        st.pending.is_empty() && st.processing.is_empty() && st.delayed == 0
    }

    /// Stop handing out keys. Blocked `get`/`add` calls return.
    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.items.notify_waiters();
        self.space.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool { self.lock().shutting_down }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(capacity: usize, overflow: OverflowPolicy) -> Arc<WorkQueue<String>> {
        Arc::new(WorkQueue::new(QueueConfig { capacity, overflow, backoff: Backoff::default() }))
    }

    #[tokio::test]
    async fn pending_keys_are_deduplicated() {
        let q = queue(16, OverflowPolicy::Block);
        assert!(q.add("a".into()).await);
        assert!(!q.add("a".into()).await);
        assert!(q.add("b".into()).await);
        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await.as_deref(), Some("a"));
        assert_eq!(q.get().await.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn in_flight_key_is_requeued_once_after_done() {
        let q = queue(16, OverflowPolicy::Block);
        q.add("a".into()).await;
        let key = q.get().await.unwrap();
        assert!(q.is_processing(&key));
        assert!(q.add("a".into()).await);
        assert!(!q.add("a".into()).await, "second change while in flight collapses");
        assert_eq!(q.len(), 0, "never pending while in flight");
        q.done(&key);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await.as_deref(), Some("a"));
        q.done(&"a".to_string());
        assert_eq!(q.len(), 0);
        assert_eq!(q.in_flight(), 0);
    }

    #[tokio::test]
    async fn drop_policy_counts_overflow() {
        let q = queue(2, OverflowPolicy::Drop);
        assert!(q.add("a".into()).await);
        assert!(q.add("b".into()).await);
        assert!(!q.add("c".into()).await);
        assert_eq!(q.dropped(), 1);
        assert_eq!(q.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn block_policy_waits_for_space() {
        let q = queue(1, OverflowPolicy::Block);
        q.add("a".into()).await;
        let q2 = Arc::clone(&q);
        let blocked = tokio::spawn(async move { q2.add("b".into()).await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!blocked.is_finished());
        assert_eq!(q.get().await.as_deref(), Some("a"));
        assert!(tokio::time::timeout(Duration::from_secs(2), blocked).await.unwrap().unwrap());
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn shut_down_releases_waiters() {
        let q = queue(4, OverflowPolicy::Block);
        let q2 = Arc::clone(&q);
        let waiter = tokio::spawn(async move { q2.get().await });
        tokio::task::yield_now().await;
        q.shut_down();
        assert_eq!(tokio::time::timeout(Duration::from_secs(2), waiter).await.unwrap().unwrap(), None);
        assert!(!q.add("a".into()).await);
    }

    #[test]
    fn backoff_is_non_decreasing_and_bounded() {
        let b = Backoff { base: Duration::from_millis(10), max: Duration::from_millis(300), jitter: 1.0 };
        for _ in 0..50 {
            let delays: Vec<Duration> = (0..12).map(|a| b.delay(a)).collect();
            assert!(delays.windows(2).all(|w| w[0] <= w[1]), "{delays:?}");
            assert!(delays.iter().all(|d| *d <= b.max));
            assert!(delays[0] >= b.base);
        }
        assert_eq!(b.delay(u32::MAX), b.max);
    }

    #[test]
    fn overflow_policy_parses() {
        assert_eq!("Drop".parse::<OverflowPolicy>(), Ok(OverflowPolicy::Drop));
        assert_eq!("block".parse::<OverflowPolicy>(), Ok(OverflowPolicy::Block));
        assert!("spill".parse::<OverflowPolicy>().is_err());
    }
}
