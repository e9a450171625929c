//! Ordered asynchronous delivery of cache mutations to one listener
//!
//! Each (region, auxiliary) pair owns one [`CacheEventQueue`]. Producers append
//! events without waiting; a single worker task drains them in order and
//! awaits the listener for each one. The worker is spawned on demand and exits
//! after sitting idle, so a process with many regions and tiers does not keep
//! a task per queue alive forever.
//!
//! Listener failures are retried after a pause. Failures are counted over the
//! queue's whole lifetime; once the count reaches `max_failure` the queue
//! destroys itself, drops whatever is still pending and rejects new events.

use std::{
    collections::VecDeque,
    fmt, io,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{runtime::Handle, sync::Notify};
use tracing::{debug, error, warn};

use crate::{
    CacheError,
    config::EventQueueConfig,
    element::{CacheElement, CacheKey, Cacheable},
    listener::CacheListener,
};

/// A queued unit of work for one listener
pub enum CacheEvent<K, V> {
    Put(CacheElement<K, V>),
    Remove(K),
    RemoveAll,
    Dispose,
}

impl<K: CacheKey, V: Cacheable> CacheEvent<K, V> {
    async fn deliver(&self, listener: &dyn CacheListener<K, V>, cache_name: &str) -> io::Result<()> {
        match self {
            CacheEvent::Put(element) => listener.handle_put(element.clone()).await,
            CacheEvent::Remove(key) => listener.handle_remove(cache_name, key).await,
            CacheEvent::RemoveAll => listener.handle_remove_all(cache_name).await,
            CacheEvent::Dispose => listener.handle_dispose(cache_name).await,
        }
    }
}

impl<K: CacheKey, V> fmt::Display for CacheEvent<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheEvent::Put(element) => write!(f, "PutEvent[{}]", element.key),
            CacheEvent::Remove(key) => write!(f, "RemoveEvent[{}]", key),
            CacheEvent::RemoveAll => f.write_str("RemoveAllEvent"),
            CacheEvent::Dispose => f.write_str("DisposeEvent"),
        }
    }
}

/// Point-in-time view of a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventQueueStats {
    pub pending: usize,
    pub processed: u64,
    pub failures: u32,
    pub working: bool,
    pub destroyed: bool,
}

struct QueueState<K, V> {
    pending: VecDeque<CacheEvent<K, V>>,
    /// A worker task exists for this queue
    working: bool,
    /// The worker has popped an event and not finished it yet
    in_flight: bool,
    destroyed: bool,
    failures: u32,
}

struct QueueInner<K: CacheKey, V: Cacheable> {
    cache_name: String,
    listener_id: u64,
    listener: Arc<dyn CacheListener<K, V>>,
    max_failure: u32,
    wait_before_retry: Duration,
    idle_time_millis: AtomicU64,
    state: Mutex<QueueState<K, V>>,
    new_work: Notify,
    processed: AtomicU64,
    runtime: Handle,
}

/// Per-listener event queue with bounded retry and an on-demand worker
pub struct CacheEventQueue<K: CacheKey, V: Cacheable> {
    inner: Arc<QueueInner<K, V>>,
}

impl<K: CacheKey, V: Cacheable> Clone for CacheEventQueue<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: CacheKey, V: Cacheable> CacheEventQueue<K, V> {
    /// Create a queue whose workers run on the current tokio runtime.
    pub fn new(
        listener: Arc<dyn CacheListener<K, V>>,
        listener_id: u64,
        cache_name: impl Into<String>,
        config: &EventQueueConfig,
    ) -> Result<Self, CacheError> {
        let cache_name = cache_name.into();
        let runtime = Handle::try_current().map_err(|e| {
            CacheError::Configuration(format!(
                "event queue for cache [{}] must be created inside a tokio runtime: {}",
                cache_name, e
            ))
        })?;
        Ok(Self::with_runtime(listener, listener_id, cache_name, config, runtime))
    }

    /// Create a queue whose workers run on `runtime`.
    pub fn with_runtime(
        listener: Arc<dyn CacheListener<K, V>>,
        listener_id: u64,
        cache_name: impl Into<String>,
        config: &EventQueueConfig,
        runtime: Handle,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                cache_name: cache_name.into(),
                listener_id,
                listener,
                max_failure: config.max_failure,
                wait_before_retry: config.wait_before_retry(),
                idle_time_millis: AtomicU64::new(config.idle_time_millis),
                state: Mutex::new(QueueState {
                    pending: VecDeque::new(),
                    working: false,
                    in_flight: false,
                    destroyed: false,
                    failures: 0,
                }),
                new_work: Notify::new(),
                processed: AtomicU64::new(0),
                runtime,
            }),
        }
    }

    pub fn enqueue_put(&self, element: CacheElement<K, V>) -> Result<(), CacheError> {
        self.enqueue(CacheEvent::Put(element))
    }

    pub fn enqueue_remove(&self, key: K) -> Result<(), CacheError> {
        self.enqueue(CacheEvent::Remove(key))
    }

    pub fn enqueue_remove_all(&self) -> Result<(), CacheError> {
        self.enqueue(CacheEvent::RemoveAll)
    }

    pub fn enqueue_dispose(&self) -> Result<(), CacheError> {
        self.enqueue(CacheEvent::Dispose)
    }

    fn enqueue(&self, event: CacheEvent<K, V>) -> Result<(), CacheError> {
        let spawn_worker = {
            let mut state = self.inner.state();
            if state.destroyed {
                debug!(
                    "Event queue for cache {} (listener {}) is destroyed, rejecting {}",
                    self.inner.cache_name, self.inner.listener_id, event
                );
                return Err(CacheError::QueueDestroyed {
                    cache_name: self.inner.cache_name.clone(),
                    listener_id: self.inner.listener_id,
                });
            }
            state.pending.push_back(event);
            !std::mem::replace(&mut state.working, true)
        };

        if spawn_worker {
            debug!(
                "Starting event queue worker for cache {} (listener {})",
                self.inner.cache_name, self.inner.listener_id
            );
            let inner = Arc::clone(&self.inner);
            self.inner.runtime.spawn(inner.run());
        } else {
            self.inner.new_work.notify_one();
        }
        Ok(())
    }

    /// Nothing pending and nothing being delivered
    pub fn is_empty(&self) -> bool {
        let state = self.inner.state();
        state.pending.is_empty() && !state.in_flight
    }

    /// A worker is currently attached and the queue is not destroyed
    pub fn is_alive(&self) -> bool {
        let state = self.inner.state();
        state.working && !state.destroyed
    }

    pub fn is_working(&self) -> bool {
        self.inner.state().working
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.state().destroyed
    }

    /// Stop the queue for good, discarding pending events.
    ///
    /// An event already being delivered finishes, but nothing after it runs.
    pub fn destroy(&self) {
        {
            let mut state = self.inner.state();
            if state.destroyed {
                return;
            }
            self.inner.destroy_locked(&mut state);
        }
        self.inner.new_work.notify_one();
    }

    /// Change how long an idle worker waits before exiting. Applies from the
    /// worker's next idle wait.
    pub fn set_idle_timeout(&self, idle: Duration) {
        self.inner
            .idle_time_millis
            .store(u64::try_from(idle.as_millis()).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.inner.idle_time_millis.load(Ordering::Relaxed))
    }

    pub fn listener_id(&self) -> u64 {
        self.inner.listener_id
    }

    pub fn cache_name(&self) -> &str {
        &self.inner.cache_name
    }

    /// Cumulative listener failures since the queue was created
    pub fn failure_count(&self) -> u32 {
        self.inner.state().failures
    }

    pub fn stats(&self) -> EventQueueStats {
        let state = self.inner.state();
        EventQueueStats {
            pending: state.pending.len(),
            processed: self.inner.processed.load(Ordering::Relaxed),
            failures: state.failures,
            working: state.working,
            destroyed: state.destroyed,
        }
    }
}

impl<K: CacheKey, V: Cacheable> QueueInner<K, V> {
    fn state(&self) -> MutexGuard<'_, QueueState<K, V>> {
        // State is only mutated in short critical sections that cannot leave
        // it half-updated, so a poisoned lock is still usable.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn destroy_locked(&self, state: &mut QueueState<K, V>) {
        let dropped = state.pending.len();
        state.pending.clear();
        state.destroyed = true;
        state.working = false;
        state.in_flight = false;
        debug!(
            "Destroyed event queue for cache {} (listener {}), dropped {} pending events",
            self.cache_name, self.listener_id, dropped
        );
    }

    async fn run(self: Arc<Self>) {
        loop {
            let next = {
                let mut state = self.state();
                if state.destroyed {
                    return;
                }
                let event = state.pending.pop_front();
                state.in_flight = event.is_some();
                event
            };

            match next {
                Some(event) => self.process(event).await,
                None => {
                    let idle = Duration::from_millis(self.idle_time_millis.load(Ordering::Relaxed));
                    if tokio::time::timeout(idle, self.new_work.notified())
                        .await
                        .is_err()
                    {
                        let mut state = self.state();
                        if state.destroyed {
                            return;
                        }
                        if state.pending.is_empty() {
                            state.working = false;
                            debug!(
                                "Event queue worker for cache {} (listener {}) idle for {:?}, exiting",
                                self.cache_name, self.listener_id, idle
                            );
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Deliver one event, retrying until it succeeds or the queue gives up.
    async fn process(&self, event: CacheEvent<K, V>) {
        loop {
            let result = event.deliver(self.listener.as_ref(), &self.cache_name).await;

            {
                let mut state = self.state();
                let e = match result {
                    Ok(()) => {
                        self.processed.fetch_add(1, Ordering::Relaxed);
                        state.in_flight = false;
                        if matches!(event, CacheEvent::Dispose) && !state.destroyed {
                            self.destroy_locked(&mut state);
                        }
                        return;
                    }
                    Err(e) => e,
                };

                state.failures += 1;
                if state.destroyed {
                    state.in_flight = false;
                    return;
                }
                if state.failures >= self.max_failure {
                    error!(
                        "Event queue for cache {} (listener {}) failed {} times, last on {}: {}. Dropping event and marking queue as non-functional",
                        self.cache_name, self.listener_id, state.failures, event, e
                    );
                    self.destroy_locked(&mut state);
                    return;
                }
                warn!(
                    "Listener {} failed on {} for cache {} ({}), failure {} of {}. Retrying in {:?}",
                    self.listener_id,
                    event,
                    self.cache_name,
                    e,
                    state.failures,
                    self.max_failure,
                    self.wait_before_retry
                );
            }

            tokio::time::sleep(self.wait_before_retry).await;

            let mut state = self.state();
            if state.destroyed {
                state.in_flight = false;
                return;
            }
        }
    }
}
