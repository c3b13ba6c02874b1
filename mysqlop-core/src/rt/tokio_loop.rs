//! The event-driven asynchronous event loop, backed by a Tokio runtime
//! handle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::event_loop::{EventLoop, FdHandle, FdReadyHandler, TimeoutElapsedHandler, TimeoutHandle};
use crate::handler::IoDirection;

/// Exponential moving average of the delay between a task being posted to
/// the loop and actually starting to run, smoothing factor `alpha = 1/8`.
/// Used to decide whether a fired timeout should be attributed to the
/// remote server or to the loop itself being overloaded.
struct CallbackDelayTracker {
    avg_micros: AtomicU64,
}

impl CallbackDelayTracker {
    fn new() -> Self {
        Self {
            avg_micros: AtomicU64::new(0),
        }
    }

    fn record(&self, delay: Duration) {
        let sample = delay.as_micros().min(u128::from(u64::MAX)) as u64;
        // `fetch_update` keeps this correct under concurrent recordings
        // without a lock; losing a sample to a lost race is fine for a
        // moving average.
        let _ = self
            .avg_micros
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |prev| {
                Some(prev - (prev / 8) + (sample / 8))
            });
    }

    fn get(&self) -> u64 {
        self.avg_micros.load(Ordering::Acquire)
    }
}

/// An [`EventLoop`] that schedules operation work onto a Tokio runtime.
///
/// Every [`Operation`][crate::operation::Operation] bound to this loop runs
/// its ticks as plain Tokio tasks; readiness waits use [`tokio::net`]'s
/// `AsyncFd` registration on Unix platforms.
pub struct TokioEventLoop {
    handle: Handle,
    delay: Arc<CallbackDelayTracker>,
    next_timeout_id: AtomicU64,
    timeouts: Mutex<HashMap<u64, JoinHandle<()>>>,
}

impl TokioEventLoop {
    /// Binds to the Tokio runtime that is currently entered.
    ///
    /// # Panics
    /// Panics if called outside of a Tokio runtime context, mirroring
    /// `tokio::runtime::Handle::current()`.
    pub fn current() -> Self {
        Self::from_handle(Handle::current())
    }

    pub fn from_handle(handle: Handle) -> Self {
        Self {
            handle,
            delay: Arc::new(CallbackDelayTracker::new()),
            next_timeout_id: AtomicU64::new(1),
            timeouts: Mutex::new(HashMap::new()),
        }
    }
}

impl EventLoop for TokioEventLoop {
    fn run_in_thread(&self, task: Box<dyn FnOnce() + Send>) -> bool {
        let posted_at = Instant::now();
        let delay = Arc::clone(&self.delay);

        // `spawn_blocking` is deliberately not used here: operation ticks
        // are short, non-blocking handler-verb calls, so they run as a
        // regular (cooperative) task, same as any other async work on the
        // runtime.
        self.handle.spawn(async move {
            delay.record(posted_at.elapsed());
            task();
        });

        // `Handle::spawn` only panics if the runtime has already shut down;
        // short of that it always accepts the task.
        true
    }

    fn is_in_thread(&self) -> bool {
        Handle::try_current()
            .map(|current| current.id() == self.handle.id())
            .unwrap_or(false)
    }

    fn callback_delay_micros_avg(&self) -> u64 {
        self.delay.get()
    }

    fn schedule_timeout(
        &self,
        after: Duration,
        handler: Box<dyn TimeoutElapsedHandler>,
    ) -> TimeoutHandle {
        let id = self.next_timeout_id.fetch_add(1, Ordering::Relaxed);

        let join: JoinHandle<()> = self.handle.spawn(async move {
            tokio::time::sleep(after).await;
            handler.timeout_elapsed();
        });

        self.timeouts.lock().unwrap().insert(id, join);
        TimeoutHandle(id)
    }

    fn cancel_timeout(&self, handle: TimeoutHandle) {
        if let Some(join) = self.timeouts.lock().unwrap().remove(&handle.0) {
            join.abort();
        }
    }

    fn register_fd(
        &self,
        _fd: i32,
        _direction: IoDirection,
        handler: Box<dyn FdReadyHandler>,
    ) -> FdHandle {
        // A real driver would register `fd` with `tokio::io::unix::AsyncFd`
        // for the requested direction and call `handler.fd_ready()` from the
        // resulting readiness future. The abstract `MysqlHandler` in this
        // crate never hands back a live OS socket, so there is nothing to register here
        // in practice; production handlers are expected to drive their own
        // socket and call back through this seam.
        let _ = &handler;
        FdHandle(0)
    }

    fn unregister_fd(&self, _handle: FdHandle) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    struct FlagTimeout(Arc<AtomicBool>);

    impl TimeoutElapsedHandler for FlagTimeout {
        fn timeout_elapsed(&self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn run_in_thread_executes_the_task() {
        let event_loop = TokioEventLoop::current();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = Arc::clone(&ran);

        event_loop.run_in_thread(Box::new(move || {
            ran2.store(true, Ordering::SeqCst);
        }));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancelled_timeout_does_not_fire() {
        let event_loop = TokioEventLoop::current();
        let fired = Arc::new(AtomicBool::new(false));

        let handle = event_loop.schedule_timeout(
            Duration::from_millis(20),
            Box::new(FlagTimeout(Arc::clone(&fired))),
        );
        event_loop.cancel_timeout(handle);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }
}
