#![forbid(unsafe_code)]
//! Scheduling primitives shared by the event loop and its collaborators.
//!
//! The event loop itself (socket readiness, dispatch) lives outside this
//! workspace; what is defined here is the contract it drives: per-tick
//! [`TimeoutHandler`]s registered with a [`TickDriver`], and the
//! [`WorkerThread`] used to push blocking work (checkpoint serialization)
//! off the loop thread.

use parking_lot::Mutex as PlMutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

// ── Tick contract ──────────────────────────────────────────────────────────

/// An object invoked on every pass of the event loop's timeout phase.
///
/// Handlers run on the loop thread and must not block.
pub trait TimeoutHandler: Send + Sync {
    fn timeout(&self);
}

/// Opaque registration token returned by [`TickDriver::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct TickEntry {
    id: HandlerId,
    handler: Arc<dyn TimeoutHandler>,
    interval: Option<Duration>,
    last_fired: Instant,
}

/// Registry of timeout handlers, driven once per event-loop tick.
///
/// Handlers fire in registration order. A handler registered with an
/// interval is skipped until that much time has elapsed since it last
/// fired; the timing is best-effort, gated on tick cadence.
#[derive(Default)]
pub struct TickDriver {
    entries: PlMutex<Vec<TickEntry>>,
    next_id: AtomicU64,
}

impl TickDriver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler invoked on every tick.
    pub fn register(&self, handler: Arc<dyn TimeoutHandler>) -> HandlerId {
        self.register_with_interval(handler, None)
    }

    /// Register a handler invoked at most once per `interval`.
    pub fn register_with_interval(
        &self,
        handler: Arc<dyn TimeoutHandler>,
        interval: Option<Duration>,
    ) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().push(TickEntry {
            id,
            handler,
            interval,
            last_fired: Instant::now(),
        });
        debug!(target: "cfs::rt", event = "handler_registered", id = id.0);
        id
    }

    /// Remove a previously registered handler. Unknown ids are ignored.
    pub fn unregister(&self, id: HandlerId) {
        self.entries.lock().retain(|entry| entry.id != id);
    }

    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Run one tick: fire every due handler in registration order.
    ///
    /// The handler list is snapshotted first so a handler may register or
    /// unregister without deadlocking; changes take effect next tick.
    pub fn run_tick(&self) {
        let now = Instant::now();
        let due: Vec<(HandlerId, Arc<dyn TimeoutHandler>)> = {
            let mut entries = self.entries.lock();
            entries
                .iter_mut()
                .filter_map(|entry| {
                    let fire = match entry.interval {
                        None => true,
                        Some(interval) => now.duration_since(entry.last_fired) >= interval,
                    };
                    if fire {
                        entry.last_fired = now;
                        Some((entry.id, Arc::clone(&entry.handler)))
                    } else {
                        None
                    }
                })
                .collect()
        };
        for (_, handler) in due {
            handler.timeout();
        }
    }
}

// ── Worker thread ──────────────────────────────────────────────────────────

struct WorkerShared<S> {
    state: Mutex<S>,
    cv: Condvar,
    stop: AtomicBool,
}

/// The worker-side handle passed to the thread body: lock the shared
/// state, sleep on the condition variable, and observe stop requests.
pub struct WorkerHandle<S> {
    shared: Arc<WorkerShared<S>>,
}

impl<S> WorkerHandle<S> {
    /// Acquire the shared-state lock.
    pub fn lock(&self) -> MutexGuard<'_, S> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Atomically release the lock and wait for a wakeup, reacquiring on
    /// return. Must be called with the guard from [`Self::lock`].
    pub fn sleep<'a>(&'a self, guard: MutexGuard<'a, S>) -> MutexGuard<'a, S> {
        self.shared
            .cv
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Like [`Self::sleep`] but bounded; returns the guard and whether the
    /// wait timed out.
    pub fn sleep_timeout<'a>(
        &'a self,
        guard: MutexGuard<'a, S>,
        timeout: Duration,
    ) -> (MutexGuard<'a, S>, bool) {
        let (guard, result) = self
            .shared
            .cv
            .wait_timeout(guard, timeout)
            .unwrap_or_else(PoisonError::into_inner);
        (guard, result.timed_out())
    }

    /// True once [`WorkerThread::stop`] has been requested; the body should
    /// drain and return.
    #[must_use]
    pub fn should_stop(&self) -> bool {
        self.shared.stop.load(Ordering::Acquire)
    }
}

/// A single background worker coordinating with its owner through one
/// mutex and one condition variable.
///
/// The owner mutates the shared state under [`Self::lock`] and signals with
/// [`Self::wakeup`]; the worker body sleeps between requests. Dropping the
/// worker requests a stop and joins the thread.
pub struct WorkerThread<S> {
    shared: Arc<WorkerShared<S>>,
    handle: Option<JoinHandle<()>>,
}

impl<S: Send + 'static> WorkerThread<S> {
    /// Create the worker around its shared state; no thread runs yet.
    #[must_use]
    pub fn new(state: S) -> Self {
        Self {
            shared: Arc::new(WorkerShared {
                state: Mutex::new(state),
                cv: Condvar::new(),
                stop: AtomicBool::new(false),
            }),
            handle: None,
        }
    }

    /// Spawn the worker body. May be called once; a second call replaces
    /// nothing and panics in debug builds.
    pub fn start<F>(&mut self, name: &str, body: F) -> std::io::Result<()>
    where
        F: FnOnce(WorkerHandle<S>) + Send + 'static,
    {
        debug_assert!(self.handle.is_none(), "worker already started");
        let handle = WorkerHandle {
            shared: Arc::clone(&self.shared),
        };
        let join = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || body(handle))?;
        self.handle = Some(join);
        Ok(())
    }

    /// Acquire the shared-state lock from the owning side.
    pub fn lock(&self) -> MutexGuard<'_, S> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Wake every sleeper.
    pub fn wakeup(&self) {
        self.shared.cv.notify_all();
    }

    /// Request the worker to exit and join it.
    pub fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.cv.notify_all();
        if let Some(join) = self.handle.take() {
            if join.join().is_err() {
                warn!(target: "cfs::rt", event = "worker_panicked");
            }
        }
    }
}

impl<S> Drop for WorkerThread<S> {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.cv.notify_all();
        if let Some(join) = self.handle.take() {
            let _ = join.join();
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Recorder {
        tag: usize,
        log: Arc<PlMutex<Vec<usize>>>,
    }

    impl TimeoutHandler for Recorder {
        fn timeout(&self) {
            self.log.lock().push(self.tag);
        }
    }

    #[test]
    fn handlers_fire_in_registration_order() {
        let driver = TickDriver::new();
        let log = Arc::new(PlMutex::new(Vec::new()));
        for tag in 0..3 {
            driver.register(Arc::new(Recorder {
                tag,
                log: Arc::clone(&log),
            }));
        }
        driver.run_tick();
        assert_eq!(*log.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn unregister_removes_handler() {
        let driver = TickDriver::new();
        let log = Arc::new(PlMutex::new(Vec::new()));
        let id = driver.register(Arc::new(Recorder {
            tag: 7,
            log: Arc::clone(&log),
        }));
        driver.run_tick();
        driver.unregister(id);
        driver.run_tick();
        assert_eq!(*log.lock(), vec![7]);
        assert_eq!(driver.handler_count(), 0);
    }

    #[test]
    fn interval_gates_firing() {
        let driver = TickDriver::new();
        let log = Arc::new(PlMutex::new(Vec::new()));
        driver.register_with_interval(
            Arc::new(Recorder {
                tag: 1,
                log: Arc::clone(&log),
            }),
            Some(Duration::from_millis(50)),
        );
        driver.run_tick();
        driver.run_tick();
        assert!(log.lock().is_empty(), "interval not yet elapsed");
        thread::sleep(Duration::from_millis(60));
        driver.run_tick();
        assert_eq!(*log.lock(), vec![1]);
    }

    #[test]
    fn worker_processes_wakeups_and_stops() {
        #[derive(Default)]
        struct Counters {
            requests: usize,
            handled: usize,
        }

        let mut worker = WorkerThread::new(Counters::default());
        let handled_total = Arc::new(AtomicUsize::new(0));
        let handled_clone = Arc::clone(&handled_total);
        worker
            .start("test-worker", move |handle| {
                let mut guard = handle.lock();
                loop {
                    while guard.handled < guard.requests {
                        guard.handled += 1;
                        handled_clone.fetch_add(1, Ordering::SeqCst);
                    }
                    if handle.should_stop() {
                        break;
                    }
                    let (next, _) = handle.sleep_timeout(guard, Duration::from_millis(20));
                    guard = next;
                }
            })
            .expect("spawn worker");

        for _ in 0..3 {
            worker.lock().requests += 1;
            worker.wakeup();
        }

        let deadline = Instant::now() + Duration::from_secs(2);
        while handled_total.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(handled_total.load(Ordering::SeqCst), 3);

        worker.stop();
        assert_eq!(worker.lock().handled, 3);
    }

    #[test]
    fn sleeping_worker_releases_the_lock() {
        let mut worker = WorkerThread::new(0_u32);
        worker
            .start("sleeper", |handle| {
                let mut guard = handle.lock();
                while !handle.should_stop() {
                    let (next, _) = handle.sleep_timeout(guard, Duration::from_millis(10));
                    guard = next;
                }
            })
            .expect("spawn worker");

        // If sleep did not release the mutex this would deadlock.
        thread::sleep(Duration::from_millis(30));
        *worker.lock() = 42;
        worker.stop();
        assert_eq!(*worker.lock(), 42);
    }
}
