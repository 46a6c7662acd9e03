// klippy_mcu/src/reactor.rs
// Cooperative scheduler: monotonic clock, timers, pause and completions.
//
// All higher level logic runs on one scheduler thread. Background threads
// (the transport readers) hand results over through `Completion` objects and
// `register_async_callback`; both wake a scheduler that is blocked in
// `pause()` or `wait()`.

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const NOW: f64 = 0.0;
pub const NEVER: f64 = 9_999_999_999_999_999.0;

// Upper bound on a single blocking sleep so a missed wakeup only costs latency.
const MAX_SLEEP: f64 = 1.0;

pub type TimerCallback = Box<dyn FnMut(f64) -> f64 + Send>;
pub type AsyncCallback = Box<dyn FnOnce(f64) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(usize);

struct Timer {
    waketime: f64,
    // None while the callback is executing
    callback: Option<TimerCallback>,
}

/// Wakeup primitive shared by the reactor and every completion it hands out.
struct Notifier {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl Notifier {
    fn notify(&self) {
        let mut generation = self.generation.lock();
        *generation = generation.wrapping_add(1);
        self.cond.notify_all();
    }
}

struct CompletionInner<T> {
    value: Mutex<Option<T>>,
    notifier: Arc<Notifier>,
}

/// One-shot, thread safe result slot. The first `complete()` wins.
pub struct Completion<T> {
    inner: Arc<CompletionInner<T>>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Completion { inner: Arc::clone(&self.inner) }
    }
}

impl<T: Clone> Completion<T> {
    /// Returns false when the completion already held a value.
    pub fn complete(&self, value: T) -> bool {
        {
            let mut slot = self.inner.value.lock();
            if slot.is_some() {
                return false;
            }
            *slot = Some(value);
        }
        self.inner.notifier.notify();
        true
    }

    pub fn test(&self) -> bool {
        self.inner.value.lock().is_some()
    }

    pub fn result(&self) -> Option<T> {
        self.inner.value.lock().clone()
    }
}

impl<T> std::fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Completion {{ done: {} }}", self.inner.value.lock().is_some())
    }
}

pub struct Reactor {
    start: Instant,
    timers: Mutex<HashMap<usize, Timer>>,
    next_timer_id: AtomicUsize,
    async_tx: Sender<AsyncCallback>,
    async_rx: Receiver<AsyncCallback>,
    notifier: Arc<Notifier>,
    running: AtomicBool,
}

impl Reactor {
    pub fn new() -> Arc<Self> {
        let (async_tx, async_rx) = unbounded();
        Arc::new(Reactor {
            start: Instant::now(),
            timers: Mutex::new(HashMap::new()),
            next_timer_id: AtomicUsize::new(0),
            async_tx,
            async_rx,
            notifier: Arc::new(Notifier { generation: Mutex::new(0), cond: Condvar::new() }),
            running: AtomicBool::new(false),
        })
    }

    /// Seconds since the reactor was created. Never goes backwards.
    pub fn monotonic(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    pub fn completion<T>(&self) -> Completion<T> {
        Completion {
            inner: Arc::new(CompletionInner {
                value: Mutex::new(None),
                notifier: Arc::clone(&self.notifier),
            }),
        }
    }

    // Timers

    pub fn register_timer(&self, callback: TimerCallback, waketime: f64) -> TimerHandle {
        let id = self.next_timer_id.fetch_add(1, Ordering::Relaxed);
        self.timers.lock().insert(id, Timer { waketime, callback: Some(callback) });
        self.notifier.notify();
        TimerHandle(id)
    }

    pub fn update_timer(&self, handle: TimerHandle, waketime: f64) {
        if let Some(timer) = self.timers.lock().get_mut(&handle.0) {
            timer.waketime = waketime;
        }
        self.notifier.notify();
    }

    pub fn unregister_timer(&self, handle: TimerHandle) {
        self.timers.lock().remove(&handle.0);
    }

    /// Queue a callback to run on the scheduler thread. Safe from any thread.
    pub fn register_async_callback(&self, callback: AsyncCallback) {
        if self.async_tx.send(callback).is_err() {
            error!("Reactor: async callback queue closed");
            return;
        }
        self.notifier.notify();
    }

    // Run every due timer and queued async callback; returns the next timer waketime.
    fn run_pending(&self, eventtime: f64) -> f64 {
        while let Ok(callback) = self.async_rx.try_recv() {
            callback(eventtime);
        }
        let due: Vec<usize> = {
            let timers = self.timers.lock();
            timers
                .iter()
                .filter(|(_, t)| t.callback.is_some() && t.waketime <= eventtime)
                .map(|(id, _)| *id)
                .collect()
        };
        for id in due {
            let callback = match self.timers.lock().get_mut(&id) {
                Some(timer) if timer.waketime <= eventtime => timer.callback.take(),
                _ => None,
            };
            let Some(mut callback) = callback else { continue };
            let waketime = callback(eventtime);
            if let Some(timer) = self.timers.lock().get_mut(&id) {
                timer.callback = Some(callback);
                timer.waketime = waketime;
            }
        }
        self.timers
            .lock()
            .values()
            .filter(|t| t.callback.is_some())
            .map(|t| t.waketime)
            .fold(NEVER, f64::min)
    }

    /// Block the calling (scheduler) thread until `completion` resolves or
    /// `waketime` passes, running timers and async callbacks meanwhile.
    pub fn wait<T: Clone>(&self, completion: &Completion<T>, waketime: f64) -> Option<T> {
        loop {
            let seen = *self.notifier.generation.lock();
            if let Some(value) = completion.result() {
                return Some(value);
            }
            let eventtime = self.monotonic();
            if eventtime >= waketime {
                return None;
            }
            let next_timer = self.run_pending(eventtime);
            if completion.test() {
                continue;
            }
            let deadline = waketime.min(next_timer);
            let now = self.monotonic();
            if deadline <= now {
                continue;
            }
            let mut generation = self.notifier.generation.lock();
            if *generation == seen && self.async_rx.is_empty() {
                let timeout = Duration::from_secs_f64((deadline - now).min(MAX_SLEEP));
                self.notifier.cond.wait_for(&mut generation, timeout);
            }
        }
    }

    pub fn pause(&self, waketime: f64) -> f64 {
        let never_done = self.completion::<()>();
        self.wait(&never_done, waketime);
        self.monotonic()
    }

    /// Run the scheduler until `end()` is called.
    pub fn run(&self) {
        self.running.store(true, Ordering::SeqCst);
        debug!("Reactor: run loop started");
        while self.running.load(Ordering::SeqCst) {
            let next = self.run_pending(self.monotonic());
            let stop = self.completion::<()>();
            self.wait(&stop, next.min(self.monotonic() + MAX_SLEEP));
        }
        debug!("Reactor: run loop finished");
    }

    pub fn end(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.notifier.notify();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
