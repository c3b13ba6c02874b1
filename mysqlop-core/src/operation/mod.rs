//! The shared operation state machine.
//!
//! [`ConnectOperation`][connect::ConnectOperation] and
//! [`FetchOperation`][fetch::FetchOperation] are both thin specializations
//! of [`Operation`]: each supplies an [`OperationImpl`] that drives a
//! [`MysqlHandler`] verb to completion, and `Operation` supplies the parts
//! that do not vary — state transitions, the total-timeout clock, the
//! connection's single-active-operation invariant, and the blocking
//! `wait()`/`must_succeed()` contract.

pub mod connect;
pub mod fetch;

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{trace, warn};

use crate::connection::Connection;
use crate::error::Error;
use crate::event_loop::{EventLoop, FdHandle, FdReadyHandler, TimeoutElapsedHandler, TimeoutHandle};
use crate::handler::{IoDirection, MysqlHandler};

/// Where an operation sits in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Unstarted,
    Pending,
    Cancelling,
    Completed,
}

/// How a completed operation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationResult {
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

/// What an [`Operation`] hands its specialization on every call.
pub struct Shared<H: MysqlHandler> {
    connection: Connection<H>,
    start: Instant,
    total_timeout: Option<Duration>,
    wakeups: Arc<WakeupBroker>,
    fds: Arc<FdBroker>,
}

impl<H: MysqlHandler> Shared<H> {
    pub fn connection(&self) -> &Connection<H> {
        &self.connection
    }

    pub fn event_loop(&self) -> &Arc<dyn EventLoop> {
        self.connection.event_loop()
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// The total-timeout budget still remaining, or `None` if no total
    /// timeout was configured. Used by `ConnectOperation` to clamp each
    /// attempt's own timeout at arming time.
    pub fn remaining_total_timeout(&self) -> Option<Duration> {
        self.total_timeout.map(|total| total.saturating_sub(self.start.elapsed()))
    }

    /// Auxiliary, cancellable timers a specialization can arm on its own
    /// terms (per-attempt, TCP-handshake, ...), distinct from the single
    /// unconditional total-timeout clock `Operation` itself owns.
    pub fn wakeups(&self) -> &Arc<WakeupBroker> {
        &self.wakeups
    }

    /// The operation's single FD-registration slot: each operation holds
    /// at most one FD registration at a time. A specialization
    /// registers here whenever a handler verb reports `Pending`, instead of
    /// reaching into the event loop directly, so `Operation::complete`
    /// can enforce Invariant 2 (no dangling registration survives into
    /// `Completed`) without every `OperationImpl` having to remember to
    /// unregister on every exit path.
    pub fn fds(&self) -> &Arc<FdBroker> {
        &self.fds
    }
}

/// Registers the one outstanding socket-readiness interest an operation may
/// hold at a time, and re-triggers a `poll()` when it fires.
///
/// Mirrors [`WakeupBroker`] but for [`EventLoop::register_fd`] rather than
/// [`EventLoop::schedule_timeout`]: a handler verb that returns `Pending`
/// hands back which direction it's waiting on (`InternalConnection::pending_direction`)
/// and the specialization registers through here; `Operation::complete`
/// unconditionally unregisters whatever is left before entering `Completed`.
pub struct FdBroker {
    event_loop: Arc<dyn EventLoop>,
    poke: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
    handle: Mutex<Option<FdHandle>>,
}

impl FdBroker {
    fn new(event_loop: Arc<dyn EventLoop>) -> Arc<Self> {
        Arc::new(Self {
            event_loop,
            poke: Mutex::new(None),
            handle: Mutex::new(None),
        })
    }

    fn bind(&self, poke: Arc<dyn Fn() + Send + Sync>) {
        *self.poke.lock().unwrap() = Some(poke);
    }

    /// Registers interest in `direction` readiness for `fd`, replacing
    /// whatever registration this operation previously held.
    pub fn register(self: &Arc<Self>, fd: i32, direction: IoDirection) {
        self.unregister();
        let handle = self.event_loop.register_fd(fd, direction, Box::new(FdFired { broker: Arc::clone(self) }));
        *self.handle.lock().unwrap() = Some(handle);
    }

    /// Cancels the current registration, if any. A no-op otherwise; safe to
    /// call redundantly (e.g. once from the specialization on a `Done`
    /// transition and again, harmlessly, from `Operation::complete`).
    pub fn unregister(&self) {
        if let Some(handle) = self.handle.lock().unwrap().take() {
            self.event_loop.unregister_fd(handle);
        }
    }
}

struct FdFired {
    broker: Arc<FdBroker>,
}

impl FdReadyHandler for FdFired {
    fn fd_ready(&self) {
        self.broker.handle.lock().unwrap().take();
        let poke = self.broker.poke.lock().unwrap().clone();
        if let Some(poke) = poke {
            poke();
        }
    }
}

/// Schedules the auxiliary timers an [`OperationImpl`] arms for itself.
///
/// Firing a wakeup does not complete the operation on its own — it just
/// triggers another `poll()` call, during which the specialization checks
/// [`WakeupBroker::take_fired`] for the ids it cares about and decides what
/// that means (retry the next attempt, fail with a timeout, re-arm with a
/// smaller budget, ...).
pub struct WakeupBroker {
    event_loop: Arc<dyn EventLoop>,
    poke: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
    fired: Mutex<HashSet<u64>>,
    next_id: AtomicU64,
    handles: Mutex<HashMap<u64, TimeoutHandle>>,
}

/// Opaque identity for a timer scheduled through [`WakeupBroker::schedule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WakeupId(u64);

impl WakeupBroker {
    fn new(event_loop: Arc<dyn EventLoop>) -> Arc<Self> {
        Arc::new(Self {
            event_loop,
            poke: Mutex::new(None),
            fired: Mutex::new(HashSet::new()),
            next_id: AtomicU64::new(1),
            handles: Mutex::new(HashMap::new()),
        })
    }

    fn bind(&self, poke: Arc<dyn Fn() + Send + Sync>) {
        *self.poke.lock().unwrap() = Some(poke);
    }

    pub fn schedule(self: &Arc<Self>, after: Duration) -> WakeupId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = self.event_loop.schedule_timeout(
            after,
            Box::new(WakeupFired {
                broker: Arc::clone(self),
                id,
            }),
        );
        self.handles.lock().unwrap().insert(id, handle);
        WakeupId(id)
    }

    pub fn cancel(&self, id: WakeupId) {
        if let Some(handle) = self.handles.lock().unwrap().remove(&id.0) {
            self.event_loop.cancel_timeout(handle);
        }
        self.fired.lock().unwrap().remove(&id.0);
    }

    /// `true`, and consumed, if `id` fired since it was last checked.
    pub fn take_fired(&self, id: WakeupId) -> bool {
        self.fired.lock().unwrap().remove(&id.0)
    }
}

struct WakeupFired {
    broker: Arc<WakeupBroker>,
    id: u64,
}

impl TimeoutElapsedHandler for WakeupFired {
    fn timeout_elapsed(&self) {
        self.broker.fired.lock().unwrap().insert(self.id);
        self.broker.handles.lock().unwrap().remove(&self.id);
        let poke = self.broker.poke.lock().unwrap().clone();
        if let Some(poke) = poke {
            poke();
        }
    }
}

/// The specialization hook every concrete operation implements.
///
/// All methods run on the owning connection's event loop thread; none of
/// them may block.
pub trait OperationImpl<H: MysqlHandler>: Send + 'static {
    /// Name used in tracing spans and panic messages (e.g. `"connect"`,
    /// `"fetch"`).
    fn label(&self) -> &'static str;

    /// Kicks off the operation-specific work. Called exactly once, right
    /// after the connection's operation slot has been acquired and the
    /// total-timeout clock (if any) has been armed.
    fn start(&mut self, shared: &Shared<H>) -> Poll;

    /// Called whenever the loop believes there is forward progress to make:
    /// after an FD the specialization registered became ready, or after it
    /// asked to be polled again immediately.
    fn poll(&mut self, shared: &Shared<H>) -> Poll;

    /// `cancel()` was called while this operation was `Pending`. The
    /// specialization should make a best-effort attempt to unwind whatever
    /// it has in flight (e.g. `kill_running_query`) and tear down local
    /// state; the operation completes with `Cancelled` immediately
    /// afterward regardless of what this returns.
    fn request_cancel(&mut self, shared: &Shared<H>);

    /// Runs once, synchronously, while the connection's operation-slot
    /// guard is still held, right before the operation transitions to
    /// `Completed`. Used to stash final state onto the connection (server
    /// version, TLS session, ...).
    fn on_completed(&mut self, shared: &Shared<H>, result: OperationResult) {
        let _ = (shared, result);
    }
}

/// What [`OperationImpl::start`] / [`OperationImpl::poll`] return.
pub enum Poll {
    /// Still in flight; the specialization has arranged to be polled again
    /// (it registered an FD, or armed a timer that will call back in).
    Pending,
    /// The operation is finished.
    Done(OperationResult, Option<Error>),
}

struct Outcome {
    result: OperationResult,
}

/// The shared machinery behind every concrete operation type.
///
/// Lives behind an `Arc` so it can be handed to the event loop as a
/// [`TimeoutElapsedHandler`] for the total-timeout clock without the
/// specialization needing to know about that plumbing.
pub struct Operation<H: MysqlHandler, I: OperationImpl<H>> {
    shared: Shared<H>,
    state: Mutex<OperationState>,
    outcome: Mutex<Option<Outcome>>,
    error: Mutex<Option<Error>>,
    done: Mutex<bool>,
    done_cv: Condvar,
    guard: Mutex<Option<crate::connection::ConnectionGuard<H>>>,
    total_timeout_handle: Mutex<Option<TimeoutHandle>>,
    imp: Mutex<I>,
    on_complete: Mutex<Option<Box<dyn FnOnce(OperationResult) + Send>>>,
}

impl<H: MysqlHandler, I: OperationImpl<H>> Operation<H, I> {
    pub fn new(connection: Connection<H>, total_timeout: Option<Duration>, imp: I) -> Arc<Self> {
        let wakeups = WakeupBroker::new(Arc::clone(connection.event_loop()));
        let fds = FdBroker::new(Arc::clone(connection.event_loop()));

        let this = Arc::new(Self {
            shared: Shared {
                connection,
                start: Instant::now(),
                total_timeout,
                wakeups: Arc::clone(&wakeups),
                fds: Arc::clone(&fds),
            },
            state: Mutex::new(OperationState::Unstarted),
            outcome: Mutex::new(None),
            error: Mutex::new(None),
            done: Mutex::new(false),
            done_cv: Condvar::new(),
            guard: Mutex::new(None),
            total_timeout_handle: Mutex::new(None),
            imp: Mutex::new(imp),
            on_complete: Mutex::new(None),
        });

        let weak = Arc::downgrade(&this);
        wakeups.bind(Arc::new(move || {
            if let Some(this) = weak.upgrade() {
                this.request_poll();
            }
        }));

        let weak = Arc::downgrade(&this);
        fds.bind(Arc::new(move || {
            if let Some(this) = weak.upgrade() {
                this.request_poll();
            }
        }));

        this
    }

    pub fn state(&self) -> OperationState {
        *self.state.lock().unwrap()
    }

    pub fn result(&self) -> Option<OperationResult> {
        self.outcome.lock().unwrap().as_ref().map(|o| o.result)
    }

    pub fn shared(&self) -> &Shared<H> {
        &self.shared
    }

    /// Locks the specialization and runs `f` against it.
    ///
    /// Used by specializations that hand a consumer direct access to their
    /// state while paused (`FetchOperation::with_row_stream`): safe to call
    /// from any thread, since the only other lock holder is the I/O thread's
    /// own `start`/`poll`/`request_cancel` dispatch, and the pause protocol
    /// guarantees that dispatch never runs concurrently with a paused
    /// consumer touching the same state.
    pub fn with_impl<R>(&self, f: impl FnOnce(&mut I) -> R) -> R {
        f(&mut self.imp.lock().unwrap())
    }

    /// Registers a callback to run exactly once, right after completion,
    /// with the final result. Any panic inside it is caught and logged
    /// rather than propagated, per the no-panics-escape-a-callback
    /// guarantee.
    pub fn on_complete(&self, f: impl FnOnce(OperationResult) + Send + 'static) {
        *self.on_complete.lock().unwrap() = Some(Box::new(f));
    }

    /// Starts the operation.
    ///
    /// Returns immediately; the caller observes completion through
    /// [`Operation::wait`], [`Operation::must_succeed`], or the
    /// `on_complete` callback.
    pub fn run(self: &Arc<Self>) -> Result<(), Error> {
        {
            let mut state = self.state.lock().unwrap();
            if *state != OperationState::Unstarted {
                return Err(Error::InvalidState("operation already started"));
            }
            *state = OperationState::Pending;
        }

        let guard = match self.shared.connection.try_acquire() {
            Ok(guard) => guard,
            Err(err) => {
                self.complete(OperationResult::Failed, Some(err));
                return Ok(());
            }
        };
        *self.guard.lock().unwrap() = Some(guard);

        if let Some(total_timeout) = self.shared.total_timeout {
            let handle = self
                .shared
                .event_loop()
                .schedule_timeout(total_timeout, Box::new(TotalTimeoutHandler(Arc::clone(self))));
            *self.total_timeout_handle.lock().unwrap() = Some(handle);
        }

        let this = Arc::clone(self);
        let accepted = self.shared.event_loop().run_in_thread(Box::new(move || {
            let outcome = {
                let mut imp = this.imp.lock().unwrap();
                trace!(target: "mysqlop::operation", op = imp.label(), "starting");
                imp.start(&this.shared)
            };
            this.handle_poll(outcome);
        }));

        if !accepted {
            self.complete(
                OperationResult::Failed,
                Some(Error::InvalidState("event loop rejected the operation's first tick")),
            );
        }

        Ok(())
    }

    /// Requests cancellation. Non-blocking from the caller's point of view:
    /// the actual state transition and `on_completed` hook both run on the
    /// I/O thread, posted the same way any other tick is. Once the posted
    /// task runs, the operation is `Completed` with result `Cancelled` —
    /// cancellation always wins over whatever the specialization was in the
    /// middle of, since the I/O thread is single-threaded and no further
    /// `poll()` can have been queued ahead of this task.
    pub fn cancel(self: &Arc<Self>) {
        let mut state = self.state.lock().unwrap();
        if *state != OperationState::Pending {
            return;
        }
        *state = OperationState::Cancelling;
        drop(state);

        let this = Arc::clone(self);
        self.shared.event_loop().run_in_thread(Box::new(move || {
            this.imp.lock().unwrap().request_cancel(&this.shared);
            this.complete(OperationResult::Cancelled, Some(Error::Cancelled));
        }));
    }

    /// Blocks the calling thread until the operation reaches `Completed`.
    ///
    /// For an operation bound to [`InlineEventLoop`][crate::rt::InlineEventLoop],
    /// `run()` has already finished synchronously by the time this is
    /// called, so the condition is already satisfied and this returns
    /// immediately — matching the "wait() is a no-op" behavior described
    /// for the synchronous connection variant.
    pub fn wait(&self) {
        let guard = self.done.lock().unwrap();
        let _unused = self.done_cv.wait_while(guard, |done| !*done).unwrap();
    }

    /// Blocks until completion, then returns `Ok(())` if the operation
    /// succeeded or the stored [`Error`] otherwise.
    ///
    /// Consumes the stored error on first call; a second call after a
    /// failure reports a generic [`Error::RequiredOperationFailed`] instead
    /// of the original cause.
    pub fn must_succeed(&self) -> Result<(), Error> {
        self.wait();
        let result = match self.outcome.lock().unwrap().as_ref() {
            Some(outcome) => outcome.result,
            None => return Err(Error::InvalidState("operation has not completed")),
        };
        if result == OperationResult::Succeeded {
            return Ok(());
        }
        match self.error.lock().unwrap().take() {
            Some(err) => Err(err),
            None => Err(Error::from_result(result)),
        }
    }

    /// Called by a specialization (through its own public type) after it
    /// registered an FD and that FD became ready, or after any other event
    /// that warrants another `poll()` call.
    pub(crate) fn request_poll(self: &Arc<Self>) {
        if self.state() != OperationState::Pending && self.state() != OperationState::Cancelling {
            return;
        }
        let this = Arc::clone(self);
        self.shared.event_loop().run_in_thread(Box::new(move || {
            let outcome = this.imp.lock().unwrap().poll(&this.shared);
            this.handle_poll(outcome);
        }));
    }

    fn handle_poll(self: &Arc<Self>, outcome: Poll) {
        if let Poll::Done(result, error) = outcome {
            self.complete(result, error);
        }
    }

    fn complete(self: &Arc<Self>, result: OperationResult, error: Option<Error>) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == OperationState::Completed {
                return;
            }
            *state = OperationState::Completed;
        }

        if let Some(handle) = self.total_timeout_handle.lock().unwrap().take() {
            self.shared.event_loop().cancel_timeout(handle);
        }
        // Invariant 2: no FD registration survives into `Completed`.
        self.shared.fds.unregister();

        {
            let mut imp = self.imp.lock().unwrap();
            let label = imp.label();
            catch_panicking(label, || imp.on_completed(&self.shared, result));
        }

        // Releases the connection's single-active-operation slot.
        self.guard.lock().unwrap().take();

        *self.error.lock().unwrap() = error;
        *self.outcome.lock().unwrap() = Some(Outcome { result });

        {
            let mut done = self.done.lock().unwrap();
            *done = true;
        }
        self.done_cv.notify_all();

        if let Some(cb) = self.on_complete.lock().unwrap().take() {
            catch_panicking("on_complete", move || cb(result));
        }
    }
}

fn catch_panicking(label: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        warn!(target: "mysqlop::operation", op = label, "callback panicked; suppressed");
    }
}

struct TotalTimeoutHandler<H: MysqlHandler, I: OperationImpl<H>>(Arc<Operation<H, I>>);

impl<H: MysqlHandler, I: OperationImpl<H>> TimeoutElapsedHandler for TotalTimeoutHandler<H, I> {
    fn timeout_elapsed(&self) {
        let message = format!(
            "total timeout of {:?} exceeded after {:?}",
            self.0.shared.total_timeout.unwrap_or_default(),
            self.0.shared.elapsed(),
        );
        self.0.complete(OperationResult::TimedOut, Some(Error::Timeout(message)));
    }
}

impl Error {
    fn from_result(result: OperationResult) -> Self {
        match result {
            OperationResult::Cancelled => Error::Cancelled,
            OperationResult::TimedOut => Error::Timeout("operation timed out".to_string()),
            _ => Error::RequiredOperationFailed,
        }
    }
}
