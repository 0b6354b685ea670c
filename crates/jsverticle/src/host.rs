//! Host system primitives consumed by the engines.
//!
//! The bridge only needs timers from its host: the embedded engine builds
//! `setTimeout`/`setInterval` on top of [`HostSystem`]. [`TimerQueue`] keeps
//! each timer as a task on a current-thread tokio runtime and is driven by
//! whichever thread calls into it (the isolated runtime runs one as its event
//! loop). [`ThreadedHost`] drives a queue from a dedicated thread.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep};

/// Host-assigned timer identifier.
pub type TimerId = u64;

/// Callback run when a timer fires; receives the id of the firing timer.
pub type TimerHandler = Box<dyn FnMut(TimerId) + Send + 'static>;

/// Timer services provided by the host.
pub trait HostSystem: Send + Sync + 'static {
    /// Run `handler` once after `delay`.
    fn set_timer(&self, delay: Duration, handler: TimerHandler) -> TimerId;

    /// Run `handler` every `delay` until cancelled.
    fn set_periodic(&self, delay: Duration, handler: TimerHandler) -> TimerId;

    /// Cancel a pending timer. Returns whether a timer was cancelled.
    fn cancel_timer(&self, id: TimerId) -> bool;
}

/// Build a single-threaded runtime with the timer driver enabled.
pub(crate) fn current_thread_runtime() -> std::io::Result<Runtime> {
    Builder::new_current_thread().enable_time().build()
}

/// Drive `future` to completion on the calling thread.
///
/// Returns `None` if no runtime could be built. Must not be called from a
/// thread that is already driving a tokio runtime.
pub(crate) fn block_on<F: Future>(future: F) -> Option<F::Output> {
    match current_thread_runtime() {
        Ok(runtime) => Some(runtime.block_on(future)),
        Err(err) => {
            log::error!("cannot build a runtime to wait on: {err}");
            None
        }
    }
}

/// Like [`block_on`], giving up after `timeout`.
pub(crate) fn block_on_timeout<F: Future>(timeout: Duration, future: F) -> Option<F::Output> {
    block_on(async { tokio::time::timeout(timeout, future).await.ok() }).flatten()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct QueueShared {
    next_id: AtomicU64,
    timers: Mutex<HashMap<TimerId, AbortHandle>>,
    fired: AtomicUsize,
    shutdown: AtomicBool,
    changed: Notify,
}

impl QueueShared {
    fn fire(&self, id: TimerId, handler: &mut TimerHandler) {
        handler(id);
        self.fired.fetch_add(1, Ordering::SeqCst);
    }

    fn finish(&self, id: TimerId) {
        lock(&self.timers).remove(&id);
        self.changed.notify_one();
    }
}

/// A timer queue driven by whichever thread calls [`TimerQueue::run`] or
/// [`TimerQueue::run_due`].
///
/// Each timer is a task on the queue's runtime. Handlers run on the driving
/// thread with no queue lock held, so they may schedule or cancel timers
/// themselves. Timers may be scheduled and cancelled from any thread.
pub struct TimerQueue {
    shared: Arc<QueueShared>,
    runtime: Runtime,
}

impl TimerQueue {
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            shared: Arc::new(QueueShared::default()),
            runtime: current_thread_runtime()?,
        })
    }

    fn schedule(&self, delay: Duration, period: Option<Duration>, handler: TimerHandler) -> TimerId {
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        if self.shared.shutdown.load(Ordering::SeqCst) {
            return id;
        }
        let shared = Arc::clone(&self.shared);
        let mut handler = handler;
        // Held across the spawn so the task cannot finish before it is listed.
        let mut timers = lock(&self.shared.timers);
        let task = self.runtime.spawn(async move {
            if !delay.is_zero() {
                sleep(delay).await;
            }
            match period {
                None => {
                    shared.fire(id, &mut handler);
                    shared.finish(id);
                }
                Some(period) => {
                    let mut ticks = interval_at(Instant::now() + period, period);
                    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        shared.fire(id, &mut handler);
                        ticks.tick().await;
                    }
                }
            }
        });
        timers.insert(id, task.abort_handle());
        id
    }

    /// Number of timers not yet fired or cancelled.
    pub fn pending(&self) -> usize {
        lock(&self.shared.timers).len()
    }

    /// Stop [`TimerQueue::run`] and drop every pending timer.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        for (_, task) in lock(&self.shared.timers).drain() {
            task.abort();
        }
        self.shared.changed.notify_one();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shutdown.load(Ordering::SeqCst)
    }

    /// Give every timer that is due a turn. Returns how many fired.
    ///
    /// Zero-delay timers scheduled before the call always fire.
    pub fn run_due(&self) -> usize {
        if self.is_shut_down() {
            return 0;
        }
        let before = self.shared.fired.load(Ordering::SeqCst);
        self.runtime.block_on(async {
            // The first pass runs ready tasks, the second those whose sleep
            // elapsed while the runtime parked.
            tokio::task::yield_now().await;
            tokio::task::yield_now().await;
        });
        self.shared.fired.load(Ordering::SeqCst) - before
    }

    /// Fire timers as they fall due.
    ///
    /// Returns after [`TimerQueue::shutdown`], or, with `exit_when_idle`,
    /// as soon as no timer is pending.
    pub fn run(&self, exit_when_idle: bool) {
        let shared = &self.shared;
        self.runtime.block_on(async {
            loop {
                if shared.shutdown.load(Ordering::SeqCst) {
                    return;
                }
                if exit_when_idle && lock(&shared.timers).is_empty() {
                    return;
                }
                shared.changed.notified().await;
            }
        });
    }
}

impl HostSystem for TimerQueue {
    fn set_timer(&self, delay: Duration, handler: TimerHandler) -> TimerId {
        self.schedule(delay, None, handler)
    }

    fn set_periodic(&self, delay: Duration, handler: TimerHandler) -> TimerId {
        // A zero period would spin the queue.
        let period = delay.max(Duration::from_millis(1));
        self.schedule(delay, Some(period), handler)
    }

    fn cancel_timer(&self, id: TimerId) -> bool {
        let Some(task) = lock(&self.shared.timers).remove(&id) else {
            return false;
        };
        task.abort();
        self.shared.changed.notify_one();
        true
    }
}

/// A [`TimerQueue`] driven by a dedicated thread.
pub struct ThreadedHost {
    queue: Arc<TimerQueue>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadedHost {
    pub fn new() -> std::io::Result<Self> {
        let queue = Arc::new(TimerQueue::new()?);
        let worker = Arc::clone(&queue);
        let thread = std::thread::Builder::new()
            .name("jsverticle-timers".to_string())
            .spawn(move || worker.run(false))?;
        Ok(Self {
            queue,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Stop the timer thread and wait for it to exit.
    pub fn shutdown(&self) {
        self.queue.shutdown();
        let handle = lock(&self.thread).take();
        if let Some(handle) = handle {
            if handle.thread().id() != std::thread::current().id() && handle.join().is_err() {
                log::warn!("timer thread panicked");
            }
        }
    }
}

impl HostSystem for ThreadedHost {
    fn set_timer(&self, delay: Duration, handler: TimerHandler) -> TimerId {
        self.queue.set_timer(delay, handler)
    }

    fn set_periodic(&self, delay: Duration, handler: TimerHandler) -> TimerId {
        self.queue.set_periodic(delay, handler)
    }

    fn cancel_timer(&self, id: TimerId) -> bool {
        self.queue.cancel_timer(id)
    }
}

impl Drop for ThreadedHost {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> Arc<TimerQueue> {
        Arc::new(TimerQueue::new().unwrap())
    }

    fn counter_handler(counter: &Arc<AtomicUsize>) -> TimerHandler {
        let counter = Arc::clone(counter);
        Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn zero_delay_timer_fires_once() {
        let queue = queue();
        let fired = Arc::new(AtomicUsize::new(0));
        queue.set_timer(Duration::ZERO, counter_handler(&fired));
        assert_eq!(queue.pending(), 1);
        assert_eq!(queue.run_due(), 1);
        assert_eq!(queue.run_due(), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn future_timer_is_not_due_yet() {
        let queue = queue();
        let fired = Arc::new(AtomicUsize::new(0));
        queue.set_timer(Duration::from_secs(60), counter_handler(&fired));
        assert_eq!(queue.run_due(), 0);
        assert_eq!(queue.pending(), 1);
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let queue = queue();
        let fired = Arc::new(AtomicUsize::new(0));
        let id = queue.set_timer(Duration::ZERO, counter_handler(&fired));
        assert!(queue.cancel_timer(id));
        assert!(!queue.cancel_timer(id));
        assert_eq!(queue.run_due(), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn handler_receives_its_own_id() {
        let queue = queue();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = queue.set_timer(
            Duration::ZERO,
            Box::new(move |id| sink.lock().unwrap().push(id)),
        );
        queue.run_due();
        assert_eq!(*seen.lock().unwrap(), vec![id]);
    }

    #[test]
    fn delayed_timer_fires_under_run() {
        let queue = queue();
        let fired = Arc::new(AtomicUsize::new(0));
        queue.set_timer(Duration::from_millis(5), counter_handler(&fired));
        queue.run(true);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn periodic_timer_can_cancel_itself() {
        let queue = queue();
        let fired = Arc::new(AtomicUsize::new(0));
        let handle = Arc::clone(&queue);
        let count = Arc::clone(&fired);
        queue.set_periodic(
            Duration::from_millis(1),
            Box::new(move |id| {
                if count.fetch_add(1, Ordering::SeqCst) == 2 {
                    handle.cancel_timer(id);
                }
            }),
        );
        queue.run(true);
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn run_exits_on_shutdown() {
        let queue = queue();
        let fired = Arc::new(AtomicUsize::new(0));
        queue.set_timer(Duration::from_secs(60), counter_handler(&fired));
        let runner = Arc::clone(&queue);
        let thread = std::thread::spawn(move || runner.run(false));
        queue.shutdown();
        thread.join().unwrap();
        assert!(queue.is_shut_down());
        assert_eq!(queue.pending(), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn timers_after_shutdown_are_ignored() {
        let queue = queue();
        queue.shutdown();
        let fired = Arc::new(AtomicUsize::new(0));
        queue.set_timer(Duration::ZERO, counter_handler(&fired));
        assert_eq!(queue.pending(), 0);
        assert_eq!(queue.run_due(), 0);
    }

    #[test]
    fn threaded_host_fires_on_its_own_thread() {
        let host = ThreadedHost::new().unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        host.set_timer(
            Duration::from_millis(5),
            Box::new(move |_| {
                let _ = tx.send(std::thread::current().name().map(str::to_string));
            }),
        );
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("jsverticle-timers"));
    }

    #[test]
    fn block_on_timeout_gives_up() {
        let never = std::future::pending::<()>();
        assert_eq!(block_on_timeout(Duration::from_millis(5), never), None);
        assert_eq!(block_on_timeout(Duration::from_secs(1), async { 7 }), Some(7));
    }
}
