//! Establishing a connection.
//!
//! `ConnectOperation` drives `MysqlHandler::try_connect` through up to
//! `connect_attempts` retries, arming a TCP-handshake sub-timeout and a
//! per-attempt timeout (clamped to whatever is left of `total_timeout`) on
//! every attempt, and attributing a fired timeout to either the remote
//! server or a stalled event loop before giving up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::connection::Connection;
use crate::error::{Error, HandlerError, SqErrno};
use crate::event_loop::EventLoop;
use crate::handler::{ConnectFlags, InternalConnection, MysqlHandler, Poll3};
use crate::key::ConnectionKey;
use crate::options::{
    CertValidationCallback, ChangeUserMode, ConnectionOptions, ConnectionOptionsBuilder, SslOptionsProvider,
};

use super::{Operation, OperationImpl, OperationResult, Poll, Shared, WakeupId};

/// Registers the socket the handler reported as `Pending` for readiness in
/// the direction it asked for. A handler that hasn't produced a socket yet
/// (`raw_fd() == None`) has nothing to register — the next `poll()` is
/// expected to come from one of the armed timeouts instead.
fn register_pending_fd<H: MysqlHandler>(shared: &Shared<H>) {
    let registration = shared.connection().with_raw(|raw| raw.raw_fd().map(|fd| (fd, raw.pending_direction())));
    if let Some((fd, direction)) = registration {
        shared.fds().register(fd, direction);
    }
}

/// Wraps a user-supplied cert validation callback so that, should the
/// handler hold onto it and call it back after this `ConnectOperation` has
/// already finished, validation fails safely instead of running stale
/// logic. A plain `Arc<AtomicBool>` liveness flag stands in for the
/// weak-pointer-to-self a raw-pointer-based driver would need: it is set to
/// `false` exactly once, from `on_completed`, and gives the same
/// fails-safe-after-teardown guarantee without the self-referential `Weak`
/// a generic `Operation<H, I>` can't cheaply hand out mid-construction.
fn wrap_cert_validator(
    options: &mut ConnectionOptions,
    alive: &Arc<AtomicBool>,
) {
    let Some(user_callback) = options.cert_validation_callback.take() else {
        return;
    };
    let alive = Arc::clone(alive);
    options.cert_validation_callback = Some(Arc::new(move |ctx| {
        if !alive.load(Ordering::Acquire) {
            return Err("cert validation callback fired after the connect operation completed".to_string());
        }
        user_callback(ctx)
    }));
}

/// Which sub-timeout, if either, is currently armed for the in-flight
/// attempt.
struct ArmedTimeouts {
    /// Bounds the TCP handshake specifically; cancelled once `try_connect`
    /// reports anything other than waiting on the initial socket connect.
    tcp_handshake: Option<(WakeupId, Duration)>,
    /// Bounds the whole attempt (handshake through authentication).
    attempt: Option<(WakeupId, Duration)>,
}

enum Step {
    /// Waiting on `try_connect` for the current attempt.
    Connecting,
    /// Handshake succeeded; issuing `COM_CHANGE_USER` before declaring
    /// victory (`ChangeUserMode::Enabled`).
    ChangingUser,
}

struct ConnectState<H: MysqlHandler> {
    options: ConnectionOptions,
    key: ConnectionKey,
    change_user_key: Option<ConnectionKey>,
    flags: ConnectFlags,
    attempt: u32,
    last_error: Option<Error>,
    timeouts: ArmedTimeouts,
    step: Step,
    cert_validator_alive: Arc<AtomicBool>,
    _handler: std::marker::PhantomData<fn(&H)>,
}

impl<H: MysqlHandler> ConnectState<H> {
    fn arm_timeouts(&mut self, shared: &Shared<H>) {
        let tcp_timeout = self.options.tcp_timeout_or_default();
        self.timeouts.tcp_handshake =
            (!tcp_timeout.is_zero()).then(|| (shared.wakeups().schedule(tcp_timeout), tcp_timeout));

        if let Some(attempt_timeout) = self.options.attempt_timeout_clamped(shared.elapsed()) {
            self.timeouts.attempt = Some((shared.wakeups().schedule(attempt_timeout), attempt_timeout));
        }
    }

    fn disarm_timeouts(&mut self, shared: &Shared<H>) {
        if let Some((id, _)) = self.timeouts.tcp_handshake.take() {
            shared.wakeups().cancel(id);
        }
        if let Some((id, _)) = self.timeouts.attempt.take() {
            shared.wakeups().cancel(id);
        }
    }

    /// Attributes a fired timeout to the remote server or to the event loop
    /// itself being too busy to service callbacks promptly, and produces
    /// the stable, scenario-tested error message:
    /// `[<errno>](Mysql Client) Connect to <host>:<port> timed out at stage
    /// <stage> (took Nms, timeout was Nms) [(CLIENT_OVERLOADED: cb delay
    /// Nms)] (TcpTimeout:0|1)`.
    fn timeout_error(&self, shared: &Shared<H>, stage: &'static str, is_tcp_stage: bool, armed: Duration) -> Error {
        let delay_micros = shared.event_loop().callback_delay_micros_avg();
        let stalled = delay_micros >= crate::options::DEFAULT_STALL_THRESHOLD.as_micros() as u64;

        let errno = if stalled {
            SqErrno::ConnTimeoutLoopStalled
        } else {
            SqErrno::ConnTimeout
        };

        let overloaded = if stalled {
            format!(" (CLIENT_OVERLOADED: cb delay {}ms)", delay_micros / 1000)
        } else {
            String::new()
        };

        Error::Timeout(format!(
            "[{errno}](Mysql Client) Connect to {} timed out at stage {stage} (took {}ms, timeout was {}ms){overloaded} (TcpTimeout:{})",
            self.key.display_endpoint(),
            shared.elapsed().as_millis(),
            armed.as_millis(),
            is_tcp_stage as u8,
        ))
    }

    fn begin_attempt(&mut self, shared: &Shared<H>) -> Poll {
        self.attempt += 1;
        debug!(
            target: "mysqlop::connect",
            attempt = self.attempt,
            max_attempts = self.options.connect_attempts,
            key = %self.key,
            "starting connect attempt",
        );

        shared.connection().take_raw();
        let raw = shared.connection().handler().new_connection();
        shared.connection().replace_raw(raw);

        self.arm_timeouts(shared);
        self.step = Step::Connecting;
        self.drive_connect(shared)
    }

    fn drive_connect(&mut self, shared: &Shared<H>) -> Poll {
        let poll = shared
            .connection()
            .with_raw(|raw| shared.connection().handler().try_connect(raw, &self.options, &self.key, self.flags));

        match poll {
            Poll3::Pending => {
                register_pending_fd(shared);
                Poll::Pending
            }
            Poll3::Done => {
                self.disarm_timeouts(shared);
                match self.options.change_user_mode {
                    ChangeUserMode::Enabled if self.change_user_key.is_some() => {
                        self.step = Step::ChangingUser;
                        self.drive_change_user(shared)
                    }
                    _ => self.succeed(shared),
                }
            }
            Poll3::Error(err) => self.attempt_failed(shared, err.into()),
        }
    }

    fn drive_change_user(&mut self, shared: &Shared<H>) -> Poll {
        let key = self.change_user_key.clone().unwrap_or_else(|| self.key.clone());
        let poll = shared
            .connection()
            .with_raw(|raw| shared.connection().handler().change_user(raw, &key));

        match poll {
            Poll3::Pending => {
                register_pending_fd(shared);
                Poll::Pending
            }
            Poll3::Done => {
                shared.connection().set_key(key);
                self.succeed(shared)
            }
            Poll3::Error(err) => self.attempt_failed(shared, err.into()),
        }
    }

    fn succeed(&mut self, shared: &Shared<H>) -> Poll {
        let version = shared.connection().with_raw(|raw| shared.connection().handler().server_version(raw));
        shared.connection().set_server_version(version);
        if let Some(session) = shared.connection().with_raw(|raw| shared.connection().handler().tls_session(raw)) {
            shared.connection().store_tls_session(session);
        }
        shared.connection().set_kill_on_query_timeout(self.options.kill_on_query_timeout);
        shared.connection().set_reset_conn_before_close(self.options.reset_conn_before_close);
        shared.connection().set_delayed_reset_conn(self.options.delayed_reset_conn);
        shared.connection().set_default_query_timeout(self.options.query_timeout);

        info!(target: "mysqlop::connect", attempts = self.attempt, key = %self.key, "connected");
        Poll::Done(OperationResult::Succeeded, None)
    }

    fn attempt_failed(&mut self, shared: &Shared<H>, error: Error) -> Poll {
        self.disarm_timeouts(shared);
        warn!(target: "mysqlop::connect", attempt = self.attempt, error = %error, "attempt failed");

        self.last_error = Some(error.clone_for_retry());
        if self.attempt >= self.options.connect_attempts || !error.is_retryable_connect_error() {
            let result = if matches!(error, Error::Timeout(_)) {
                OperationResult::TimedOut
            } else {
                OperationResult::Failed
            };
            return Poll::Done(result, Some(error));
        }

        self.begin_attempt(shared)
    }
}

impl<H: MysqlHandler> OperationImpl<H> for ConnectState<H> {
    fn label(&self) -> &'static str {
        "connect"
    }

    fn start(&mut self, shared: &Shared<H>) -> Poll {
        self.begin_attempt(shared)
    }

    #[instrument(target = "mysqlop::connect", skip_all, fields(attempt = self.attempt))]
    fn poll(&mut self, shared: &Shared<H>) -> Poll {
        if let Some((id, armed)) = self.timeouts.tcp_handshake {
            if shared.wakeups().take_fired(id) {
                // A handshake timeout while still `Connecting` always ends
                // the attempt; once a later step is underway the handshake
                // timer has already been disarmed and can't fire.
                let error = self.timeout_error(shared, "tcp_connect", true, armed);
                return self.attempt_failed(shared, error);
            }
        }

        if let Some((id, armed)) = self.timeouts.attempt {
            if shared.wakeups().take_fired(id) {
                let error = self.timeout_error(shared, "authenticate", false, armed);
                return self.attempt_failed(shared, error);
            }
        }

        match self.step {
            Step::Connecting => self.drive_connect(shared),
            Step::ChangingUser => self.drive_change_user(shared),
        }
    }

    fn request_cancel(&mut self, shared: &Shared<H>) {
        shared.connection().with_raw(|raw| raw.close_socket());
    }

    fn on_completed(&mut self, _shared: &Shared<H>, result: OperationResult) {
        self.cert_validator_alive.store(false, Ordering::Release);

        if result != OperationResult::Succeeded {
            if let Some(error) = self.last_error.take() {
                debug!(target: "mysqlop::connect", %error, "giving up after final attempt");
            }
        }
    }
}

impl Error {
    /// `ConnectState` keeps the most recent attempt's error around purely
    /// for the debug log emitted when all attempts are exhausted; the error
    /// actually reported to the caller is the one returned from
    /// `attempt_failed`, so losing detail here (`io::Error` isn't `Clone`)
    /// is acceptable.
    fn clone_for_retry(&self) -> Error {
        match self {
            Error::Handler(e) => Error::Handler(e.clone()),
            Error::Timeout(m) => Error::Timeout(m.clone()),
            Error::Initialization(e, m) => Error::Initialization(*e, m.clone()),
            Error::InvalidState(m) => Error::InvalidState(m),
            Error::Cancelled => Error::Cancelled,
            Error::RequiredOperationFailed => Error::RequiredOperationFailed,
            Error::Io(e) => Error::Initialization(SqErrno::InitializationFailed, e.to_string()),
        }
    }
}

/// Establishes a new [`Connection`].
///
/// Configuration setters are only valid before [`ConnectOperation::run`] is
/// called; each one returns `Err(Error::InvalidState)` afterward.
pub struct ConnectOperation<H: MysqlHandler> {
    handler: Mutex<Option<H>>,
    event_loop: Arc<dyn EventLoop>,
    key: ConnectionKey,
    builder: Mutex<Option<ConnectionOptionsBuilder>>,
    flags: ConnectFlags,
    change_user_key: Mutex<Option<ConnectionKey>>,
    callback: Mutex<Option<Box<dyn FnOnce(OperationResult) + Send>>>,
    inner: Mutex<Option<Arc<Operation<H, ConnectState<H>>>>>,
}

impl<H: MysqlHandler> ConnectOperation<H> {
    pub fn new(handler: H, event_loop: Arc<dyn EventLoop>, key: ConnectionKey) -> Self {
        Self {
            handler: Mutex::new(Some(handler)),
            event_loop,
            key,
            builder: Mutex::new(Some(ConnectionOptions::builder())),
            flags: ConnectFlags::MULTI_STATEMENTS,
            change_user_key: Mutex::new(None),
            callback: Mutex::new(None),
            inner: Mutex::new(None),
        }
    }

    /// Replaces the whole options record in one call, for callers that
    /// built a [`ConnectionOptions`] up front (e.g. shared across many
    /// connections) rather than through this operation's individual
    /// setters.
    pub fn set_connection_options(&self, options: ConnectionOptions) -> Result<&Self, Error> {
        let mut builder = self.builder.lock().unwrap();
        if builder.is_none() {
            return Err(Error::InvalidState("connect options can't change once run() was called"));
        }
        *builder = Some(ConnectionOptionsBuilder::from(options));
        Ok(self)
    }

    fn edit(&self, f: impl FnOnce(ConnectionOptionsBuilder) -> ConnectionOptionsBuilder) -> Result<&Self, Error> {
        let mut builder = self.builder.lock().unwrap();
        match builder.take() {
            Some(b) => {
                *builder = Some(f(b));
                Ok(self)
            }
            None => Err(Error::InvalidState("connect options can't change once run() was called")),
        }
    }

    pub fn set_timeout(&self, timeout: Duration) -> Result<&Self, Error> {
        self.edit(|b| b.timeout(timeout))
    }

    pub fn set_total_timeout(&self, timeout: Duration) -> Result<&Self, Error> {
        self.edit(|b| b.total_timeout(timeout))
    }

    pub fn set_connect_tcp_timeout(&self, timeout: Duration) -> Result<&Self, Error> {
        self.edit(|b| b.connect_tcp_timeout(timeout))
    }

    pub fn set_connect_attempts(&self, attempts: u32) -> Result<&Self, Error> {
        self.edit(|b| b.connect_attempts(attempts))
    }

    pub fn add_attribute(&self, key: impl Into<String>, value: impl Into<String>) -> Result<&Self, Error> {
        self.edit(|b| b.attribute(key, value))
    }

    pub fn set_compression(&self, codec: impl Into<String>) -> Result<&Self, Error> {
        self.edit(|b| b.compression(codec))
    }

    pub fn set_sni_server_name(&self, name: impl Into<String>) -> Result<&Self, Error> {
        self.edit(|b| b.sni_server_name(name))
    }

    pub fn set_dscp(&self, value: u8) -> Result<&Self, Error> {
        self.edit(|b| b.dscp(value))
    }

    pub fn set_reset_conn_before_close(&self, enabled: bool) -> Result<&Self, Error> {
        self.edit(|b| b.reset_conn_before_close(enabled))
    }

    /// Defers `reset_conn_before_close`'s `COM_RESET_CONNECTION` until the
    /// connection is next checked out rather than issuing it immediately on
    /// release. Pool-side policy; `ConnectOperation` only records the flag.
    pub fn enable_delayed_reset_conn(&self, enabled: bool) -> Result<&Self, Error> {
        self.edit(|b| b.delayed_reset_conn(enabled))
    }

    pub fn set_ssl_options_provider(&self, provider: Arc<dyn SslOptionsProvider>) -> Result<&Self, Error> {
        self.edit(|b| b.ssl_options_provider(provider))
    }

    pub fn set_cert_validation_callback(&self, callback: CertValidationCallback) -> Result<&Self, Error> {
        self.edit(|b| b.cert_validation_callback(callback))
    }

    /// When set, a connection established by this operation dispatches
    /// `MysqlHandler::kill_running_query` the next time one of its fetches
    /// ends in `OperationResult::TimedOut`.
    pub fn set_kill_on_query_timeout(&self, enabled: bool) -> Result<&Self, Error> {
        self.edit(|b| b.kill_on_query_timeout(enabled))
    }

    /// Default total timeout a `FetchOperation` started on the resulting
    /// connection uses when it never calls `set_total_timeout` itself.
    pub fn set_query_timeout(&self, timeout: Duration) -> Result<&Self, Error> {
        self.edit(|b| b.query_timeout(timeout))
    }

    /// Registers a callback to run exactly once after this operation
    /// completes, with the final result — mirrors
    /// [`Operation::on_complete`][super::Operation::on_complete] one layer
    /// up, for callers that never touch the inner `Operation` directly.
    pub fn set_callback(&self, callback: impl FnOnce(OperationResult) + Send + 'static) -> Result<&Self, Error> {
        if self.inner.lock().unwrap().is_some() {
            return Err(Error::InvalidState("connect options can't change once run() was called"));
        }
        *self.callback.lock().unwrap() = Some(Box::new(callback));
        Ok(self)
    }

    /// Enables `COM_CHANGE_USER` to `key` once the initial handshake
    /// succeeds.
    pub fn enable_change_user(&self, key: ConnectionKey) -> Result<&Self, Error> {
        if self.inner.lock().unwrap().is_some() {
            return Err(Error::InvalidState("connect options can't change once run() was called"));
        }
        *self.change_user_key.lock().unwrap() = Some(key);
        self.edit(|b| b.change_user_mode(ChangeUserMode::Enabled))
    }

    /// Starts the connection attempt loop. Mirrors
    /// [`Operation::run`][super::Operation::run]: returns immediately, with
    /// completion observed via [`ConnectOperation::wait`] /
    /// [`ConnectOperation::must_succeed`].
    pub fn run(&self) -> Result<(), Error> {
        let mut options = self
            .builder
            .lock()
            .unwrap()
            .take()
            .ok_or(Error::InvalidState("operation already started"))?
            .build();

        let handler = self
            .handler
            .lock()
            .unwrap()
            .take()
            .ok_or(Error::InvalidState("operation already started"))?;
        let total_timeout = options.total_timeout;
        let connection = Connection::pending(handler, Arc::clone(&self.event_loop), self.key.clone());

        let cert_validator_alive = Arc::new(AtomicBool::new(true));
        wrap_cert_validator(&mut options, &cert_validator_alive);

        let state = ConnectState {
            options,
            key: self.key.clone(),
            change_user_key: self.change_user_key.lock().unwrap().clone(),
            flags: self.flags,
            attempt: 0,
            last_error: None,
            timeouts: ArmedTimeouts { tcp_handshake: None, attempt: None },
            step: Step::Connecting,
            cert_validator_alive,
            _handler: std::marker::PhantomData,
        };

        let op = Operation::new(connection, total_timeout, state);
        if let Some(callback) = self.callback.lock().unwrap().take() {
            op.on_complete(callback);
        }
        let result = op.run();
        *self.inner.lock().unwrap() = Some(op);
        result
    }

    pub fn cancel(&self) {
        if let Some(op) = self.inner.lock().unwrap().as_ref() {
            op.cancel();
        }
    }

    pub fn wait(&self) {
        if let Some(op) = self.inner.lock().unwrap().as_ref() {
            op.wait();
        }
    }

    pub fn must_succeed(&self) -> Result<(), Error> {
        match self.inner.lock().unwrap().as_ref() {
            Some(op) => op.must_succeed(),
            None => Err(Error::InvalidState("run() was not called")),
        }
    }

    /// The resulting connection, available once the operation has
    /// succeeded.
    pub fn connection(&self) -> Option<Connection<H>> {
        let inner = self.inner.lock().unwrap();
        let op = inner.as_ref()?;
        (op.result() == Some(OperationResult::Succeeded)).then(|| op.shared().connection().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rt::InlineEventLoop;
    use crate::testing::MockHandler;
    use std::sync::atomic::AtomicU64;

    fn key() -> ConnectionKey {
        ConnectionKey::new("localhost", 3306, "root", "test")
    }

    fn op(handler: MockHandler, event_loop: Arc<dyn EventLoop>) -> ConnectOperation<MockHandler> {
        ConnectOperation::new(handler, event_loop, key())
    }

    /// Wraps [`InlineEventLoop`] but reports a fixed callback-delay average,
    /// for exercising the "stalled loop" timeout attribution without
    /// actually stalling a real loop.
    struct StalledLoop {
        inner: InlineEventLoop,
        delay_micros: u64,
    }

    impl EventLoop for StalledLoop {
        fn run_in_thread(&self, task: Box<dyn FnOnce() + Send>) -> bool {
            self.inner.run_in_thread(task)
        }

        fn is_in_thread(&self) -> bool {
            self.inner.is_in_thread()
        }

        fn callback_delay_micros_avg(&self) -> u64 {
            self.delay_micros
        }

        fn schedule_timeout(
            &self,
            after: Duration,
            handler: Box<dyn crate::event_loop::TimeoutElapsedHandler>,
        ) -> crate::event_loop::TimeoutHandle {
            self.inner.schedule_timeout(after, handler)
        }

        fn cancel_timeout(&self, handle: crate::event_loop::TimeoutHandle) {
            self.inner.cancel_timeout(handle)
        }

        fn register_fd(
            &self,
            fd: i32,
            direction: crate::handler::IoDirection,
            handler: Box<dyn crate::event_loop::FdReadyHandler>,
        ) -> crate::event_loop::FdHandle {
            self.inner.register_fd(fd, direction, handler)
        }

        fn unregister_fd(&self, handle: crate::event_loop::FdHandle) {
            self.inner.unregister_fd(handle)
        }
    }

    #[test]
    fn happy_connect_succeeds_on_first_attempt() {
        let handler = MockHandler::new();
        let connect = op(handler, Arc::new(InlineEventLoop::new()));

        connect.run().unwrap();
        connect.must_succeed().unwrap();
        assert!(connect.connection().is_some());
    }

    #[test]
    fn succeed_carries_query_timeout_onto_the_connection() {
        let handler = MockHandler::new();
        let connect = op(handler, Arc::new(InlineEventLoop::new()));
        connect.set_query_timeout(Duration::from_secs(5)).unwrap();

        connect.run().unwrap();
        connect.must_succeed().unwrap();

        let connection = connect.connection().unwrap();
        assert_eq!(connection.default_query_timeout(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn succeed_stores_the_handlers_tls_session_on_the_connection() {
        let handler = MockHandler::new();
        handler.push_tls_session(Some(b"ticket".to_vec()));
        let connect = op(handler, Arc::new(InlineEventLoop::new()));

        connect.run().unwrap();
        connect.must_succeed().unwrap();

        let connection = connect.connection().unwrap();
        assert_eq!(connection.tls_session(), Some(b"ticket".to_vec()));
    }

    #[test]
    fn retryable_failure_is_retried_until_connect_attempts_is_spent() {
        let handler = MockHandler::new();
        handler.push_try_connect(Poll3::Error(HandlerError::new(SqErrno::ServerLost, "lost")));
        handler.push_try_connect(Poll3::Done);

        let connect = op(handler, Arc::new(InlineEventLoop::new()));
        connect.set_connect_attempts(2).unwrap();

        connect.run().unwrap();
        connect.must_succeed().unwrap();
        assert_eq!(connect.connection().unwrap().handler().calls().try_connect, 2);
    }

    /// Counts `"mysqlop::connect"` events by level, standing in for the
    /// `logConnectionFailure`/`logConnectionSuccess` counters a retry-then-
    /// succeed connect is expected to trip exactly once each.
    #[derive(Default)]
    struct EventCounts {
        warn: AtomicU64,
        info: AtomicU64,
    }

    struct CountingSubscriber {
        counts: Arc<EventCounts>,
        next_id: AtomicU64,
    }

    impl tracing::Subscriber for CountingSubscriber {
        fn enabled(&self, _metadata: &tracing::Metadata<'_>) -> bool {
            true
        }

        fn new_span(&self, _span: &tracing::span::Attributes<'_>) -> tracing::span::Id {
            tracing::span::Id::from_u64(self.next_id.fetch_add(1, Ordering::Relaxed).max(1))
        }

        fn record(&self, _span: &tracing::span::Id, _values: &tracing::span::Record<'_>) {}

        fn record_follows_from(&self, _span: &tracing::span::Id, _follows: &tracing::span::Id) {}

        fn event(&self, event: &tracing::Event<'_>) {
            if event.metadata().target() != "mysqlop::connect" {
                return;
            }
            match *event.metadata().level() {
                tracing::Level::WARN => {
                    self.counts.warn.fetch_add(1, Ordering::SeqCst);
                }
                tracing::Level::INFO => {
                    self.counts.info.fetch_add(1, Ordering::SeqCst);
                }
                _ => {}
            }
        }

        fn enter(&self, _span: &tracing::span::Id) {}
        fn exit(&self, _span: &tracing::span::Id) {}
    }

    #[test]
    fn retry_then_succeed_logs_exactly_one_failure_and_one_success() {
        let handler = MockHandler::new();
        handler.push_try_connect(Poll3::Error(HandlerError::new(SqErrno::ServerLost, "lost")));
        handler.push_try_connect(Poll3::Done);

        let connect = op(handler, Arc::new(InlineEventLoop::new()));
        connect.set_connect_attempts(2).unwrap();

        let counts = Arc::new(EventCounts::default());
        let subscriber = CountingSubscriber {
            counts: Arc::clone(&counts),
            next_id: AtomicU64::new(1),
        };

        tracing::subscriber::with_default(subscriber, || {
            connect.run().unwrap();
            connect.must_succeed().unwrap();
        });

        assert_eq!(counts.warn.load(Ordering::SeqCst), 1, "one attempt-failed warning expected");
        assert_eq!(counts.info.load(Ordering::SeqCst), 1, "one connected info event expected");
    }

    #[test]
    fn failure_is_reported_once_connect_attempts_is_exhausted() {
        let handler = MockHandler::new();
        handler.push_try_connect(Poll3::Error(HandlerError::new(SqErrno::ServerLost, "lost")));

        let connect = op(handler, Arc::new(InlineEventLoop::new()));
        connect.set_connect_attempts(1).unwrap();

        connect.run().unwrap();
        assert!(connect.must_succeed().is_err());
        assert!(connect.connection().is_none());
    }

    #[test]
    fn tcp_handshake_timeout_reports_stage_and_tcp_marker() {
        let handler = MockHandler::new();
        handler.push_try_connect(Poll3::Pending);

        let connect = op(handler, Arc::new(InlineEventLoop::new()));
        connect.set_connect_tcp_timeout(Duration::from_millis(20)).unwrap();

        connect.run().unwrap();
        let err = connect.must_succeed().unwrap_err();
        let message = err.to_string();
        assert!(message.contains("stage tcp_connect"), "{message}");
        assert!(message.contains("TcpTimeout:1"), "{message}");
        assert!(!message.contains("CLIENT_OVERLOADED"), "{message}");
    }

    #[test]
    fn stalled_loop_attributes_timeout_to_client_overload() {
        let handler = MockHandler::new();
        handler.push_try_connect(Poll3::Pending);

        let event_loop: Arc<dyn EventLoop> = Arc::new(StalledLoop {
            inner: InlineEventLoop::new(),
            delay_micros: 60_000,
        });
        let connect = op(handler, event_loop);
        connect.set_connect_tcp_timeout(Duration::from_millis(20)).unwrap();

        connect.run().unwrap();
        let err = connect.must_succeed().unwrap_err();
        let message = err.to_string();
        assert!(message.contains("CLIENT_OVERLOADED: cb delay 60ms"), "{message}");
    }

    #[test]
    fn timeout_exhausting_attempts_completes_as_timed_out() {
        let handler = MockHandler::new();
        handler.push_try_connect(Poll3::Pending);

        let connect = op(handler, Arc::new(InlineEventLoop::new()));
        connect.set_connect_attempts(1).unwrap();
        connect.set_timeout(Duration::from_millis(20)).unwrap();

        connect.run().unwrap();
        let err = connect.must_succeed().unwrap_err();
        assert!(matches!(err, Error::Timeout(_)), "{err:?}");
    }

    #[test]
    fn per_attempt_timeout_is_retried_until_connect_attempts_is_spent() {
        let handler = MockHandler::new();
        // First attempt never resolves and times out; the retry succeeds.
        handler.push_try_connect(Poll3::Pending);
        handler.push_try_connect(Poll3::Done);

        let connect = op(handler, Arc::new(InlineEventLoop::new()));
        connect.set_connect_attempts(2).unwrap();
        connect.set_timeout(Duration::from_millis(20)).unwrap();

        connect.run().unwrap();
        connect.must_succeed().unwrap();
        assert_eq!(connect.connection().unwrap().handler().calls().try_connect, 2);
    }

    #[test]
    fn cancel_while_connecting_completes_as_cancelled() {
        let handler = MockHandler::new();
        handler.push_try_connect(Poll3::Pending);

        let connect = op(handler, Arc::new(InlineEventLoop::new()));
        connect.run().unwrap();
        connect.cancel();

        assert!(matches!(connect.must_succeed(), Err(Error::Cancelled)));
    }

    #[test]
    fn set_callback_fires_once_with_the_final_result() {
        let handler = MockHandler::new();
        let connect = op(handler, Arc::new(InlineEventLoop::new()));

        let seen = Arc::new(AtomicU64::new(0));
        let seen_clone = Arc::clone(&seen);
        connect
            .set_callback(move |result| {
                seen_clone.store(matches!(result, OperationResult::Succeeded) as u64, Ordering::SeqCst);
            })
            .unwrap();

        connect.run().unwrap();
        connect.wait();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn setters_reject_changes_once_run_has_started() {
        let handler = MockHandler::new();
        let connect = op(handler, Arc::new(InlineEventLoop::new()));
        connect.run().unwrap();
        assert!(matches!(connect.set_timeout(Duration::from_secs(1)), Err(Error::InvalidState(_))));
    }
}
