//! The synchronous (inline-blocking) event loop.
//!
//! Grounded on `sqlx_core::blocking::runtime::Blocking`: "scheduling" work
//! just means calling it immediately on the current thread, and `wait()` on
//! the owning [`Connection`][crate::connection::Connection] is a no-op
//! because the operation has already run to completion by the time `run()`
//! returns.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::event_loop::{EventLoop, FdHandle, FdReadyHandler, TimeoutElapsedHandler, TimeoutHandle};
use crate::handler::IoDirection;

struct ArmedTimeout {
    cancelled: Arc<AtomicBool>,
}

/// An [`EventLoop`] that runs every posted task immediately, on the calling
/// thread.
///
/// A handler driven by `InlineEventLoop` is expected to use blocking I/O
/// primitives and therefore never actually returns
/// [`Poll3::Pending`][crate::handler::Poll3::Pending]; the FD
/// registration methods below exist only so [`Operation`][crate::operation::Operation]
/// doesn't need to special-case the inline case, and are consequently never
/// invoked in practice by an inline handler.
pub struct InlineEventLoop {
    next_id: AtomicU64,
    timeouts: Mutex<HashMap<u64, ArmedTimeout>>,
}

impl Default for InlineEventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl InlineEventLoop {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            timeouts: Mutex::new(HashMap::new()),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl EventLoop for InlineEventLoop {
    fn run_in_thread(&self, task: Box<dyn FnOnce() + Send>) -> bool {
        task();
        true
    }

    fn is_in_thread(&self) -> bool {
        true
    }

    fn callback_delay_micros_avg(&self) -> u64 {
        // The inline loop never queues callbacks, so it can never stall.
        0
    }

    fn schedule_timeout(
        &self,
        after: Duration,
        handler: Box<dyn TimeoutElapsedHandler>,
    ) -> TimeoutHandle {
        let id = self.next_id();
        let cancelled = Arc::new(AtomicBool::new(false));

        self.timeouts.lock().unwrap().insert(
            id,
            ArmedTimeout {
                cancelled: Arc::clone(&cancelled),
            },
        );

        std::thread::spawn(move || {
            std::thread::sleep(after);
            if !cancelled.load(Ordering::Acquire) {
                handler.timeout_elapsed();
            }
        });

        TimeoutHandle(id)
    }

    fn cancel_timeout(&self, handle: TimeoutHandle) {
        if let Some(armed) = self.timeouts.lock().unwrap().remove(&handle.0) {
            armed.cancelled.store(true, Ordering::Release);
        }
    }

    fn register_fd(
        &self,
        _fd: i32,
        _direction: IoDirection,
        handler: Box<dyn FdReadyHandler>,
    ) -> FdHandle {
        // An inline handler never reports `Pending`, so this should be
        // unreachable in practice; fire immediately rather than hang.
        handler.fd_ready();
        FdHandle(self.next_id())
    }

    fn unregister_fd(&self, _handle: FdHandle) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    struct FlagTimeout(Arc<AtomicBool>);

    impl TimeoutElapsedHandler for FlagTimeout {
        fn timeout_elapsed(&self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn run_in_thread_executes_synchronously() {
        let event_loop = InlineEventLoop::new();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = Arc::clone(&ran);

        let accepted = event_loop.run_in_thread(Box::new(move || {
            ran2.store(true, Ordering::SeqCst);
        }));

        assert!(accepted);
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn cancelling_a_timeout_suppresses_it() {
        let event_loop = InlineEventLoop::new();
        let fired = Arc::new(AtomicBool::new(false));

        let handle = event_loop.schedule_timeout(
            Duration::from_millis(20),
            Box::new(FlagTimeout(Arc::clone(&fired))),
        );
        event_loop.cancel_timeout(handle);

        std::thread::sleep(Duration::from_millis(60));
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn uncancelled_timeout_fires() {
        let event_loop = InlineEventLoop::new();
        let fired = Arc::new(AtomicBool::new(false));

        event_loop.schedule_timeout(
            Duration::from_millis(10),
            Box::new(FlagTimeout(Arc::clone(&fired))),
        );

        std::thread::sleep(Duration::from_millis(60));
        assert!(fired.load(Ordering::SeqCst));
    }
}
