//! Rollwatch store: keyed work queue and the worker pool that drains it.
//!
//! Semantics follow the usual controller work queue:
//! - a key waiting in the queue is never queued twice;
//! - a key being processed is never handed to a second worker; adding it
//!   again marks it dirty and it is requeued once `done` is called;
//! - `add_after` schedules a delayed add, keeping only the earliest deadline.
//!   All delays of one queue share a single `DelayQueue` and timer task.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Poll, Waker};
use std::time::Duration;

use metrics::{counter, gauge};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::time::delay_queue::{DelayQueue, Key as DelayKey};
use tracing::{debug, info};

struct State<K> {
    queue: VecDeque<K>,
    dirty: FxHashSet<K>,
    processing: FxHashSet<K>,
    delays: DelayQueue<K>,
    waiting: FxHashMap<K, (DelayKey, Instant)>,
    delay_task: Option<Waker>,
    delay_task_started: bool,
    shutting_down: bool,
}

struct Shared<K> {
    state: Mutex<State<K>>,
    notify: Notify,
}

/// Cloneable handle to one coalescing work queue.
pub struct WorkQueue<K> {
    inner: Arc<Shared<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self { Self { inner: Arc::clone(&self.inner) } }
}

impl<K> Default for WorkQueue<K>
where
    K: Clone + Eq + Hash + Debug + Send + 'static,
{
    fn default() -> Self { Self::new() }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Debug + Send + 'static,
{
    pub fn new() -> Self {
        let state = State {
            queue: VecDeque::new(),
            dirty: FxHashSet::default(),
            processing: FxHashSet::default(),
            delays: DelayQueue::new(),
            waiting: FxHashMap::default(),
            delay_task: None,
            delay_task_started: false,
            shutting_down: false,
        };
        Self { inner: Arc::new(Shared { state: Mutex::new(state), notify: Notify::new() }) }
    }

    fn lock(&self) -> MutexGuard<'_, State<K>> { self.inner.state.lock().unwrap_or_else(PoisonError::into_inner) }

    /// Number of keys ready to be handed out.
    pub fn len(&self) -> usize { self.lock().queue.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
    pub fn is_shutting_down(&self) -> bool { self.lock().shutting_down }

    pub fn add(&self, key: K) {
        let mut st = self.lock();
        if st.shutting_down || st.dirty.contains(&key) {
            return;
        }
        st.dirty.insert(key.clone());
        if st.processing.contains(&key) {
            return;
        }
        st.queue.push_back(key);
        gauge!("rollwatch_workqueue_depth").set(st.queue.len() as f64);
        counter!("rollwatch_workqueue_adds_total").increment(1);
        drop(st);
        self.inner.notify.notify_one();
    }

    /// Add `key` once `delay` has elapsed. A pending earlier deadline for
    /// the same key wins; a later one is moved up.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            return self.add(key);
        }
        let deadline = Instant::now() + delay;
        let mut st = self.lock();
        if st.shutting_down {
            return;
        }
        match st.waiting.get(&key).copied() {
            Some((_, at)) if at <= deadline => return,
            Some((slot, _)) => {
                st.delays.reset_at(&slot, deadline);
                st.waiting.insert(key, (slot, deadline));
            }
            None => {
                let slot = st.delays.insert_at(key.clone(), deadline);
                st.waiting.insert(key, (slot, deadline));
            }
        }
        if !st.delay_task_started {
            st.delay_task_started = true;
            drop(st);
            tokio::spawn(self.clone().run_delays());
        }
    }

    /// Number of keys with a pending delayed add.
    pub fn delayed(&self) -> usize { self.lock().waiting.len() }

    async fn run_delays(self) {
        loop {
            let expired = std::future::poll_fn(|cx| {
                let mut st = self.lock();
                if st.shutting_down {
                    return Poll::Ready(None);
                }
                st.delay_task = Some(cx.waker().clone());
                match st.delays.poll_expired(cx) {
                    Poll::Ready(Some(expired)) => {
                        let key = expired.into_inner();
                        st.waiting.remove(&key);
                        Poll::Ready(Some(key))
                    }
                    // An empty queue wakes this task on the next insert.
                    _ => Poll::Pending,
                }
            })
            .await;
            match expired {
                Some(key) => self.add(key),
                None => break,
            }
        }
        debug!("delay timer stopped");
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.lock();
                if let Some(key) = st.queue.pop_front() {
                    st.dirty.remove(&key);
                    st.processing.insert(key.clone());
                    gauge!("rollwatch_workqueue_depth").set(st.queue.len() as f64);
                    return Some(key);
                }
                if st.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark `key` as finished; requeue it if it was added while in flight.
    pub fn done(&self, key: &K) {
        let mut st = self.lock();
        st.processing.remove(key);
        if st.dirty.contains(key) && !st.shutting_down {
            st.queue.push_back(key.clone());
            drop(st);
            self.inner.notify.notify_one();
        }
    }

    /// Stop handing out keys; idle workers return `None` from [`get`](Self::get).
    pub fn shutdown(&self) {
        let mut st = self.lock();
        st.shutting_down = true;
        st.queue.clear();
        st.waiting.clear();
        st.delays.clear();
        let delay_task = st.delay_task.take();
        drop(st);
        if let Some(waker) = delay_task {
            waker.wake();
        }
        self.inner.notify.notify_waiters();
        info!("work queue shut down");
    }
}

/// Spawn `concurrency` workers draining `queue`. The handler's return value
/// is an optional requeue delay for the key it just processed.
pub fn spawn_workers<K, H, Fut>(queue: WorkQueue<K>, concurrency: usize, handler: H) -> Vec<JoinHandle<()>>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    H: Fn(K) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<Duration>> + Send + 'static,
{
    let handler = Arc::new(handler);
    (0..concurrency.max(1))
        .map(|worker| {
            let q = queue.clone();
            let h = Arc::clone(&handler);
            tokio::spawn(async move {
                while let Some(key) = q.get().await {
                    let requeue = h(key.clone()).await;
                    q.done(&key);
                    if let Some(delay) = requeue {
                        q.add_after(key, delay);
                    }
                }
                debug!(worker, "worker stopped");
            })
        })
        .collect()
}
