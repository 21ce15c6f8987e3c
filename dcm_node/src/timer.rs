//! Deadline bookkeeping shared by the receive buffer and the folder
//! watcher: one worker thread, one deadline per key, cancel-on-reschedule.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::trace;

type Handler<K> = Arc<dyn Fn(K) + Send + Sync + 'static>;

struct Shared<K> {
    deadlines: Mutex<HashMap<K, Instant>>,
    wakeup: Condvar,
    stopping: AtomicBool,
}

/// A set of per-key one-shot timers backed by a single worker thread.
///
/// Arming a key replaces any pending deadline for it. Due keys fire on a
/// short-lived thread of their own so one slow handler cannot hold back
/// the other timers.
pub struct TimerWheel<K: Eq + Hash + Clone + Send + 'static> {
    shared: Arc<Shared<K>>,
    worker: Option<JoinHandle<()>>,
}

impl<K: Eq + Hash + Clone + Send + 'static> TimerWheel<K> {
    pub fn new<F>(name: &str, handler: F) -> Self
    where
        F: Fn(K) + Send + Sync + 'static,
    {
        let shared = Arc::new(Shared {
            deadlines: Mutex::new(HashMap::new()),
            wakeup: Condvar::new(),
            stopping: AtomicBool::new(false),
        });
        let handler: Handler<K> = Arc::new(handler);
        let worker = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name(format!("timer-{name}"))
                .spawn(move || run_wheel(shared, handler))
                .ok()
        };
        Self { shared, worker }
    }

    /// Arms (or re-arms) the timer for `key` to fire after `delay`.
    pub fn arm(&self, key: K, delay: Duration) {
        let mut deadlines = self.shared.deadlines.lock().unwrap();
        deadlines.insert(key, Instant::now() + delay);
        self.shared.wakeup.notify_one();
    }

    /// Cancels a pending timer, if any.
    pub fn cancel(&self, key: &K) {
        let mut deadlines = self.shared.deadlines.lock().unwrap();
        deadlines.remove(key);
    }

    /// Whether the key currently has a pending deadline.
    pub fn is_armed(&self, key: &K) -> bool {
        self.shared.deadlines.lock().unwrap().contains_key(key)
    }

    /// Cancels everything and stops the worker.
    pub fn stop(&mut self) {
        self.shared.stopping.store(true, Ordering::SeqCst);
        self.shared.deadlines.lock().unwrap().clear();
        self.shared.wakeup.notify_all();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

impl<K: Eq + Hash + Clone + Send + 'static> Drop for TimerWheel<K> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_wheel<K: Eq + Hash + Clone + Send + 'static>(shared: Arc<Shared<K>>, handler: Handler<K>) {
    let mut guard = shared.deadlines.lock().unwrap();
    loop {
        if shared.stopping.load(Ordering::SeqCst) {
            return;
        }
        let now = Instant::now();
        let due: Vec<K> = guard
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &due {
            guard.remove(key);
        }
        if !due.is_empty() {
            drop(guard);
            for key in due {
                trace!("Timer fired");
                let handler = Arc::clone(&handler);
                let _ = std::thread::Builder::new()
                    .name("timer-fire".into())
                    .spawn(move || handler(key));
            }
            guard = shared.deadlines.lock().unwrap();
            continue;
        }
        let wait = guard
            .values()
            .min()
            .map(|next| next.saturating_duration_since(now))
            .unwrap_or(Duration::from_millis(500));
        let (g, _) = shared
            .wakeup
            .wait_timeout(guard, wait.min(Duration::from_millis(500)))
            .unwrap();
        guard = g;
    }
}
