//! The outward dependency an [`Operation`][crate::operation::Operation]
//! schedules itself onto.
//!
//! Two implementations ship in [`crate::rt`]: [`crate::rt::tokio::TokioEventLoop`]
//! (event-driven, behind the `runtime-tokio` feature) and
//! [`crate::rt::inline::InlineEventLoop`] (the synchronous driver, behind
//! `blocking`). Operations are written once against this trait and never
//! branch on which implementation is live.

use std::time::Duration;

use crate::handler::IoDirection;

/// Opaque handle to a registered file-descriptor interest; passed back to
/// [`EventLoop::unregister_fd`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdHandle(pub(crate) u64);

/// Opaque handle to an armed timeout; passed back to
/// [`EventLoop::cancel_timeout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutHandle(pub(crate) u64);

/// Callback invoked when a registered FD becomes ready in the requested
/// direction, or when readiness can no longer be waited for (the loop is
/// shutting down).
pub trait FdReadyHandler: Send {
    fn fd_ready(&self);
}

/// Callback invoked when an armed timeout elapses.
pub trait TimeoutElapsedHandler: Send {
    fn timeout_elapsed(&self);
}

/// Schedules work into the I/O thread; watches a file descriptor for
/// readable/writable; schedules timeouts.
///
/// All methods are safe to call from any thread *except* where noted;
/// `Operation`s only ever call them from the thread the loop itself runs
/// tasks on, which for `InlineEventLoop` is "wherever `run()` was called".
pub trait EventLoop: Send + Sync + 'static {
    /// Posts `task` to run on the I/O thread. Returns `false` if the loop
    /// has been shut down and the task was not accepted — callers must
    /// treat that as an immediate `Failed` completion.
    fn run_in_thread(&self, task: Box<dyn FnOnce() + Send>) -> bool;

    /// `true` when called from the thread that actually drives this loop's
    /// tasks (always `true` for `InlineEventLoop`).
    fn is_in_thread(&self) -> bool;

    /// The current moving average of the delay between a callback becoming
    /// runnable and actually running, used to attribute a fired timeout to
    /// "stalled loop" vs. "legitimately slow server".
    fn callback_delay_micros_avg(&self) -> u64;

    /// Arms a one-shot timeout. The handler fires at most once, on the I/O
    /// thread, unless cancelled first.
    fn schedule_timeout(
        &self,
        after: Duration,
        handler: Box<dyn TimeoutElapsedHandler>,
    ) -> TimeoutHandle;

    /// Cancels a previously scheduled timeout. A no-op if it already fired
    /// or was already cancelled.
    fn cancel_timeout(&self, handle: TimeoutHandle);

    /// Registers interest in `direction` readiness for `fd`. The handler
    /// fires at most once per registration; callers re-register for the
    /// next wait point as needed.
    fn register_fd(
        &self,
        fd: i32,
        direction: IoDirection,
        handler: Box<dyn FdReadyHandler>,
    ) -> FdHandle;

    /// Cancels a previously registered FD interest. A no-op if it already
    /// fired or was already unregistered.
    fn unregister_fd(&self, handle: FdHandle);
}
