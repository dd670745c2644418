//! Keel engine: drives every registered reconciler from the work queue.
//!
//! Per key: IDLE -> DEQUEUED -> RUNNING -> {SUCCESS -> IDLE,
//! SUCCESS+REQUEUE -> SCHEDULED, ERROR -> BACKOFF}. Terminal errors give up
//! after `max_attempts` and leave a `Stalled` condition on the object.

#![forbid(unsafe_code)]

use std::any::Any;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use futures::StreamExt;
use keel_core::{
    Action, Condition, ConditionStatus, Context, Object, ReconcileError, Reconciler, ResourceKey, ResourceStore,
    StoreError,
};
use keel_queue::{QueueConfig, WorkQueue};
use keel_registry::Registry;
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

mod dispatch;
mod helpers;

use dispatch::KnownKeys;

pub use helpers::{create_or_update, ensure_finalizer, remove_finalizer, set_condition, Applied};

pub const STALLED: &str = "Stalled";
pub const TERMINAL_REASON: &str = "TerminalError";

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse::<T>().ok())
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub workers: usize,
    pub queue: QueueConfig,
    /// Consecutive terminal failures tolerated before the key stalls.
    /// Transient and conflict errors only drive backoff and never count here.
    pub max_attempts: u32,
    pub reconcile_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { workers: 4, queue: QueueConfig::default(), max_attempts: 5, reconcile_timeout: Duration::from_secs(30) }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            workers: env_parse::<usize>("KEEL_WORKERS").filter(|n| *n > 0).unwrap_or(d.workers),
            queue: QueueConfig::from_env(),
            max_attempts: env_parse::<u32>("KEEL_MAX_ATTEMPTS").filter(|n| *n > 0).unwrap_or(d.max_attempts),
            reconcile_timeout: env_parse::<u64>("KEEL_RECONCILE_TIMEOUT_MS")
                .filter(|n| *n > 0)
                .map(Duration::from_millis)
                .unwrap_or(d.reconcile_timeout),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("starting watch for {gvk}: {source}")]
    Watch { gvk: String, source: StoreError },
}

/// True when the object carries a `Stalled=True` condition for its current generation.
pub fn is_stalled(obj: &Object) -> bool {
    obj.condition(STALLED)
        .map(|c| c.status == ConditionStatus::True && c.observed_generation == obj.metadata.generation)
        .unwrap_or(false)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

pub struct Engine {
    store: Arc<dyn ResourceStore>,
    registry: Arc<Registry>,
    queue: Arc<WorkQueue<ResourceKey>>,
    cfg: EngineConfig,
    started: watch::Sender<bool>,
    terminal: Mutex<FxHashMap<ResourceKey, u32>>,
}

impl Engine {
    pub fn new(store: Arc<dyn ResourceStore>, registry: Arc<Registry>, cfg: EngineConfig) -> Self {
        let queue = Arc::new(WorkQueue::new(cfg.queue.clone()));
        let (started, _) = watch::channel(false);
        Self { store, registry, queue, cfg, started, terminal: Mutex::new(FxHashMap::default()) }
    }

    pub fn queue(&self) -> &Arc<WorkQueue<ResourceKey>> { &self.queue }

    pub fn config(&self) -> &EngineConfig { &self.cfg }

    /// Resolves once `run` has listed every kind and its workers are up.
    pub async fn started(&self) {
        let mut rx = self.started.subscribe();
        let _ = rx.wait_for(|s| *s).await;
    }

    /// Start the worker pool, then watch every reconciled kind and enqueue
    /// what already exists. Runs until `shutdown` fires; workers finish their
    /// current pass.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<(), EngineError> {
        let mut tasks = JoinSet::new();
        // Workers first: with a blocking queue the initial list needs them draining.
        for id in 0..self.cfg.workers.max(1) {
            let engine = Arc::clone(&self);
            let stop = shutdown.clone();
            tasks.spawn(async move {
                while let Some(key) = engine.queue.get().await {
                    engine.process(key, &stop).await;
                }
                debug!(worker = id, "engine: worker stopped");
            });
        }

        let kinds = self.registry.reconciled();
        for reg in &kinds {
            // Watch before listing so nothing written in between is missed.
            let listed = async {
                let events = self.store.watch(&reg.gvk, None).await?;
                let existing = self.store.list(&reg.gvk, None).await?;
                Ok::<_, StoreError>((events, existing))
            }
            .await;
            let (mut events, existing) = match listed {
                Ok(v) => v,
                Err(source) => {
                    self.queue.shut_down();
                    while tasks.join_next().await.is_some() {}
                    return Err(EngineError::Watch { gvk: reg.gvk.to_string(), source });
                }
            };
            debug!(gvk = %reg.gvk, count = existing.len(), "engine: initial list");
            let mut known = KnownKeys::seed(&existing);
            for obj in &existing {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = self.queue.add(obj.key()) => {}
                }
            }
            let queue = Arc::clone(&self.queue);
            let stop = shutdown.clone();
            let gvk = reg.gvk.clone();
            tasks.spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        ev = events.next() => match ev {
                            Some(ev) => {
                                for key in known.observe(&ev) {
                                    queue.add(key).await;
                                }
                            }
                            None => {
                                warn!(gvk = %gvk, "engine: watch stream ended");
                                break;
                            }
                        }
                    }
                }
            });
        }

        self.started.send_replace(true);
        info!(kinds = kinds.len(), workers = self.cfg.workers, "engine started");

        shutdown.cancelled().await;
        self.queue.shut_down();
        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                error!(error = %e, "engine: task failed");
            }
        }
        info!("engine stopped");
        Ok(())
    }

    /// Wait until the queue has been idle for a short quiet period.
    /// Returns false if `timeout` passes first.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let quiet = Duration::from_millis(50);
        let deadline = Instant::now() + timeout;
        let mut idle_since: Option<Instant> = None;
        while Instant::now() < deadline {
            if self.queue.is_idle() {
                let since = *idle_since.get_or_insert_with(Instant::now);
                if since.elapsed() >= quiet {
                    return true;
                }
            } else {
                idle_since = None;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    async fn process(&self, key: ResourceKey, shutdown: &CancellationToken) {
        let reconciler = match self.registry.lookup(&key.gvk).and_then(|r| r.reconciler.clone()) {
            Some(r) => r,
            None => {
                self.queue.forget(&key);
                self.queue.done(&key);
                return;
            }
        };

        let current = match self.store.get(&key).await {
            Ok(obj) => Some(obj),
            Err(StoreError::NotFound(_)) => None,
            Err(e) => {
                warn!(key = %key, error = %e, "engine: read failed");
                self.queue.done(&key);
                self.queue.add_rate_limited(key);
                return;
            }
        };
        if let Some(obj) = &current {
            if is_stalled(obj) && !obj.is_deleting() {
                debug!(key = %key, generation = obj.metadata.generation, "engine: stalled; waiting for a spec change");
                self.queue.forget(&key);
                self.queue.done(&key);
                return;
            }
        }
        let had_stalled = current.as_ref().map(|o| o.condition(STALLED).is_some()).unwrap_or(false);

        let attempt = self.queue.num_requeues(&key);
        let cx = Context { store: Arc::clone(&self.store), cancel: shutdown.child_token(), attempt };
        let started = Instant::now();
        let outcome = self.invoke(reconciler, &key, cx).await;
        let took = started.elapsed();
        histogram!("reconcile_duration_ms", took.as_secs_f64() * 1000.0, "gvk" => key.gvk.to_string());

        match outcome {
            Ok(action) => {
                counter!("reconcile_total", 1u64, "result" => "ok");
                debug!(key = %key, took_ms = took.as_millis() as u64, requeue = ?action.requeue_after(), "reconciled");
                if had_stalled {
                    self.clear_stalled(&key).await;
                }
                self.reset_terminal(&key);
                self.queue.forget(&key);
                self.queue.done(&key);
                if let Some(delay) = action.requeue_after() {
                    self.queue.add_after(key, delay);
                }
            }
            Err(e) if e.is_terminal() && self.bump_terminal(&key) >= self.cfg.max_attempts => {
                counter!("reconcile_total", 1u64, "result" => "stalled");
                error!(key = %key, attempt = attempt + 1, error = %e, "reconcile gave up");
                self.mark_stalled(&key, &e).await;
                self.reset_terminal(&key);
                self.queue.forget(&key);
                self.queue.done(&key);
            }
            Err(e) => {
                let result = match e {
                    ReconcileError::Transient(_) => "transient",
                    ReconcileError::Terminal(_) => "terminal",
                    ReconcileError::Conflict(_) => "conflict",
                };
                counter!("reconcile_total", 1u64, "result" => result);
                self.queue.done(&key);
                let delay = self.queue.add_rate_limited(key.clone());
                warn!(key = %key, attempt = attempt + 1, delay_ms = delay.as_millis() as u64, error = %e, "reconcile failed; retrying");
            }
        }
    }

    fn terminal_counts(&self) -> std::sync::MutexGuard<'_, FxHashMap<ResourceKey, u32>> {
        self.terminal.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record one more terminal failure for `key` and return the running count.
    fn bump_terminal(&self, key: &ResourceKey) -> u32 {
        let mut counts = self.terminal_counts();
        let n = counts.entry(key.clone()).or_insert(0);
        *n += 1;
        *n
    }

    fn reset_terminal(&self, key: &ResourceKey) {
        self.terminal_counts().remove(key);
    }

    /// One reconcile call on its own task, bounded by the configured deadline.
    async fn invoke(&self, reconciler: Arc<dyn Reconciler>, key: &ResourceKey, cx: Context) -> Result<Action, ReconcileError> {
        let cancel = cx.cancel.clone();
        let owned = key.clone();
        let handle = tokio::spawn(async move { reconciler.reconcile(&owned, &cx).await });
        let abort = handle.abort_handle();
        match tokio::time::timeout(self.cfg.reconcile_timeout, handle).await {
            Ok(Ok(res)) => res,
            Ok(Err(join)) if join.is_panic() => {
                let msg = panic_message(join.into_panic());
                error!(key = %key, panic = %msg, "reconciler panicked");
                Err(ReconcileError::Terminal(format!("reconciler panicked: {msg}")))
            }
            Ok(Err(join)) => Err(ReconcileError::transient(join)),
            Err(_) => {
                cancel.cancel();
                abort.abort();
                counter!("reconcile_timeouts_total", 1u64);
                Err(ReconcileError::Transient(format!(
                    "reconcile exceeded {}ms deadline",
                    self.cfg.reconcile_timeout.as_millis()
                )))
            }
        }
    }

    async fn mark_stalled(&self, key: &ResourceKey, err: &ReconcileError) {
        let message = err.to_string();
        let res = helpers::update_status_with(self.store.as_ref(), key, |obj| {
            let generation = obj.metadata.generation;
            obj.set_condition(Condition::new(STALLED, ConditionStatus::True, TERMINAL_REASON, &message, generation));
        })
        .await;
        if let Err(e) = res {
            warn!(key = %key, error = %e, "engine: could not record stalled condition");
        }
    }

    async fn clear_stalled(&self, key: &ResourceKey) {
        let res = helpers::update_status_with(self.store.as_ref(), key, |obj| {
            obj.remove_condition(STALLED);
        })
        .await;
        match res {
            Ok(_) | Err(StoreError::NotFound(_)) => {}
            Err(e) => warn!(key = %key, error = %e, "engine: could not clear stalled condition"),
        }
    }
}
