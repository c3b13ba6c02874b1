//! Streaming fetch of one or more SQL statements issued as a single
//! multi-query.
//!
//! Grounded on the same `Operation`/`OperationImpl` split `ConnectOperation`
//! uses: `FetchState` drives `MysqlHandler::run_query`/`next_result`/
//! `fetch_row` through a small explicit state machine rather than a
//! language coroutine, since the handler itself is callback-driven and may
//! be polled from either an event loop or inline.

use std::cell::Cell;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, trace};

use crate::connection::Connection;
use crate::error::{Error, HandlerError};
use crate::handler::{FetchRowPoll, InternalConnection, MysqlHandler, Poll3, Poll4};

use super::{Operation, OperationImpl, OperationResult, Poll, Shared};

/// Registers the socket a `Pending` handler verb is waiting on, mirroring
/// `connect::register_pending_fd`.
fn register_pending_fd<H: MysqlHandler>(shared: &Shared<H>) {
    let registration = shared.connection().with_raw(|raw| raw.raw_fd().map(|fd| (fd, raw.pending_direction())));
    if let Some((fd, direction)) = registration {
        shared.fds().register(fd, direction);
    }
}

thread_local! {
    /// Set for the duration of a `notify_*` call; `FetchContext::pause_for_consumer`
    /// asserts against it, since the pause/resume protocol is only well-defined
    /// when entered from inside one of those callbacks.
    static INSIDE_NOTIFY: Cell<bool> = Cell::new(false);
}

/// Which step of one statement's lifecycle the fetch is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchAction {
    StartQuery,
    InitFetch,
    Fetch,
    WaitForConsumer,
    CompleteQuery,
    CompleteOperation,
}

/// The rows of the statement currently being fetched.
///
/// Cross-thread access is only valid while the owning operation is paused
/// (`WaitForConsumer`) or has completed — see
/// [`FetchOperation::with_row_stream`].
pub struct RowStream<H: MysqlHandler> {
    result: Option<H::ResultHandle>,
    current_row: Option<H::Row>,
    query_finished: bool,
    num_rows_seen: u64,
    query_result_size: u64,
}

impl<H: MysqlHandler> RowStream<H> {
    fn new() -> Self {
        Self {
            result: None,
            current_row: None,
            query_finished: false,
            num_rows_seen: 0,
            query_result_size: 0,
        }
    }

    fn begin(&mut self, result: H::ResultHandle) {
        self.result = Some(result);
        self.current_row = None;
        self.query_finished = false;
        self.num_rows_seen = 0;
        self.query_result_size = 0;
    }

    /// Fetches the next row from the handler, internal to the driving state
    /// machine. Never called while paused: a paused consumer only reads
    /// `current_row`/the counters, it doesn't advance the stream itself.
    fn slurp(&mut self, handler: &H) -> Slurped {
        let result = self.result.as_mut().expect("slurp called before a result set was opened");
        match handler.fetch_row(result) {
            FetchRowPoll::Pending => Slurped::Pending,
            FetchRowPoll::Row(row) => {
                self.query_result_size += handler.row_size_bytes(&row) as u64;
                self.num_rows_seen += 1;
                self.current_row = Some(row);
                Slurped::Row
            }
            FetchRowPoll::End => {
                self.query_finished = true;
                self.current_row = None;
                Slurped::End
            }
            FetchRowPoll::Error(e) => Slurped::Error(e),
        }
    }

    /// `true` once `slurp` has produced a row not yet consumed.
    pub fn has_next(&self) -> bool {
        self.current_row.is_some()
    }

    /// Moves the current row out, invalidating it. `None` if no row is
    /// currently staged (nothing slurped yet, or the result set ended).
    pub fn consume_row(&mut self) -> Option<H::Row> {
        self.current_row.take()
    }

    pub fn num_rows_seen(&self) -> u64 {
        self.num_rows_seen
    }

    /// Best-effort count of row payload bytes seen so far for the current
    /// result set (no packet/metadata overhead).
    pub fn query_result_size(&self) -> u64 {
        self.query_result_size
    }

    pub fn query_finished(&self) -> bool {
        self.query_finished
    }
}

enum Slurped {
    Pending,
    Row,
    End,
    Error(HandlerError),
}

#[derive(Default)]
struct Accounting {
    num_current_query: u32,
    num_queries_executed: u32,
    current_affected_rows: u64,
    current_last_insert_id: Option<u64>,
    current_recv_gtid: Option<String>,
    current_resp_attrs: Vec<(String, String)>,
}

/// Per-statement / per-row callbacks a consumer implements to drive a
/// [`FetchOperation`].
///
/// Every method is called synchronously on the I/O thread, in the order
/// described by the module; [`FetchContext::pause_for_consumer`] is legal
/// only from inside one of them.
pub trait FetchObserver<H: MysqlHandler>: Send {
    /// A statement just started executing; `ctx.num_current_query()` names
    /// which one.
    fn notify_init_query(&mut self, ctx: &mut FetchContext<'_, H>) {
        let _ = ctx;
    }

    /// A row was just slurped into `ctx.row_stream()` and is available via
    /// `consume_row`.
    fn notify_rows_ready(&mut self, ctx: &mut FetchContext<'_, H>) {
        let _ = ctx;
    }

    /// The current statement finished successfully. `has_more_results` is
    /// `true` if another statement in the same multi-query follows.
    fn notify_query_success(&mut self, ctx: &mut FetchContext<'_, H>, has_more_results: bool) {
        let _ = (ctx, has_more_results);
    }

    /// The current statement (or the fetch as a whole) failed.
    fn notify_failure(&mut self, ctx: &mut FetchContext<'_, H>, result: OperationResult) {
        let _ = (ctx, result);
    }

    /// Fired exactly once, after every other notification, regardless of
    /// outcome.
    fn notify_operation_completed(&mut self, ctx: &mut FetchContext<'_, H>, result: OperationResult) {
        let _ = (ctx, result);
    }
}

/// Handed to a [`FetchObserver`] callback; the only way it can read stream
/// state or request a pause.
pub struct FetchContext<'a, H: MysqlHandler> {
    row_stream: &'a mut RowStream<H>,
    accounting: &'a Accounting,
    pause_requested: &'a mut bool,
}

impl<'a, H: MysqlHandler> FetchContext<'a, H> {
    pub fn row_stream(&mut self) -> &mut RowStream<H> {
        self.row_stream
    }

    /// Saves the action that was about to run and moves to
    /// `WaitForConsumer`: the I/O thread issues no further handler verb for
    /// this operation until [`FetchOperation::resume`] is called. Legal
    /// only from inside a `notify_*` callback.
    pub fn pause_for_consumer(&mut self) {
        debug_assert!(
            INSIDE_NOTIFY.with(|flag| flag.get()),
            "pause_for_consumer() called outside a notify callback"
        );
        *self.pause_requested = true;
    }

    pub fn num_current_query(&self) -> u32 {
        self.accounting.num_current_query
    }

    pub fn num_queries_executed(&self) -> u32 {
        self.accounting.num_queries_executed
    }

    pub fn current_affected_rows(&self) -> u64 {
        self.accounting.current_affected_rows
    }

    pub fn current_last_insert_id(&self) -> Option<u64> {
        self.accounting.current_last_insert_id
    }

    pub fn current_recv_gtid(&self) -> Option<&str> {
        self.accounting.current_recv_gtid.as_deref()
    }

    pub fn current_resp_attrs(&self) -> &[(String, String)] {
        &self.accounting.current_resp_attrs
    }
}

enum StepOutcome {
    Advance,
    Pending,
    Paused,
    Done(OperationResult, Option<Error>),
}

struct FetchState<H: MysqlHandler> {
    sql: String,
    action: FetchAction,
    paused_action: Option<FetchAction>,
    /// Set once `run_query` has returned `Done`, so re-entering
    /// `StartQuery` for a later statement in the same multi-query is a
    /// bookkeeping-only step rather than reissuing the verb.
    started_query: bool,
    row_stream: RowStream<H>,
    accounting: Accounting,
    observer: Box<dyn FetchObserver<H>>,
    final_outcome: Option<(OperationResult, Option<Error>)>,
}

impl<H: MysqlHandler> FetchState<H> {
    fn pause(&mut self, resume_into: FetchAction) {
        self.paused_action = Some(resume_into);
        self.action = FetchAction::WaitForConsumer;
    }

    /// Invokes one `notify_*` hook, giving it disjoint access to
    /// `row_stream`/`accounting` alongside `&mut observer` itself. Returns
    /// whether the callback asked to pause.
    fn fire(&mut self, f: impl FnOnce(&mut dyn FetchObserver<H>, &mut FetchContext<'_, H>)) -> bool {
        let mut pause_requested = false;
        {
            let mut ctx = FetchContext {
                row_stream: &mut self.row_stream,
                accounting: &self.accounting,
                pause_requested: &mut pause_requested,
            };
            INSIDE_NOTIFY.with(|flag| flag.set(true));
            f(self.observer.as_mut(), &mut ctx);
            INSIDE_NOTIFY.with(|flag| flag.set(false));
        }
        pause_requested
    }

    fn fail(&mut self, result: OperationResult, error: Error) -> StepOutcome {
        let paused = self.fire(|observer, ctx| observer.notify_failure(ctx, result));
        if paused {
            self.final_outcome = Some((result, Some(error)));
            self.pause(FetchAction::CompleteOperation);
            return StepOutcome::Paused;
        }
        StepOutcome::Done(result, Some(error))
    }

    fn drive(&mut self, shared: &Shared<H>) -> Poll {
        loop {
            let outcome = match self.action {
                FetchAction::StartQuery => self.step_start_query(shared),
                FetchAction::InitFetch => self.step_init_fetch(shared),
                FetchAction::Fetch => self.step_fetch(shared),
                FetchAction::WaitForConsumer => return Poll::Pending,
                FetchAction::CompleteQuery => self.step_complete_query(shared),
                FetchAction::CompleteOperation => {
                    let (result, error) = self.final_outcome.take().unwrap_or((OperationResult::Succeeded, None));
                    StepOutcome::Done(result, error)
                }
            };
            match outcome {
                StepOutcome::Advance => continue,
                StepOutcome::Pending | StepOutcome::Paused => return Poll::Pending,
                StepOutcome::Done(result, error) => {
                    self.action = FetchAction::CompleteOperation;
                    return Poll::Done(result, error);
                }
            }
        }
    }

    fn step_start_query(&mut self, shared: &Shared<H>) -> StepOutcome {
        if !self.started_query {
            let poll = shared
                .connection()
                .with_raw(|raw| shared.connection().handler().run_query(raw, &self.sql));
            match poll {
                Poll3::Pending => {
                    register_pending_fd(shared);
                    return StepOutcome::Pending;
                }
                Poll3::Done => self.started_query = true,
                Poll3::Error(e) => return self.fail(OperationResult::Failed, e.into()),
            }
        }

        self.accounting.num_current_query += 1;
        trace!(target: "mysqlop::fetch", query = self.accounting.num_current_query, "starting statement");
        let paused = self.fire(|observer, ctx| observer.notify_init_query(ctx));
        self.action = FetchAction::InitFetch;
        if paused {
            self.pause(FetchAction::InitFetch);
            return StepOutcome::Paused;
        }
        StepOutcome::Advance
    }

    fn step_init_fetch(&mut self, shared: &Shared<H>) -> StepOutcome {
        let field_count = shared
            .connection()
            .with_raw(|raw| shared.connection().handler().get_field_count(raw));

        if field_count == 0 {
            self.action = FetchAction::CompleteQuery;
            return StepOutcome::Advance;
        }

        let result = shared.connection().with_raw(|raw| shared.connection().handler().get_result(raw));
        self.row_stream.begin(result);
        self.action = FetchAction::Fetch;
        StepOutcome::Advance
    }

    fn step_fetch(&mut self, shared: &Shared<H>) -> StepOutcome {
        let slurped = self.row_stream.slurp(shared.connection().handler());
        match slurped {
            Slurped::Pending => {
                register_pending_fd(shared);
                StepOutcome::Pending
            }
            Slurped::Row => {
                let paused = self.fire(|observer, ctx| observer.notify_rows_ready(ctx));
                if paused {
                    self.pause(FetchAction::Fetch);
                    return StepOutcome::Paused;
                }
                StepOutcome::Advance
            }
            Slurped::End => {
                self.action = FetchAction::CompleteQuery;
                StepOutcome::Advance
            }
            Slurped::Error(e) => self.fail(OperationResult::Failed, e.into()),
        }
    }

    fn step_complete_query(&mut self, shared: &Shared<H>) -> StepOutcome {
        let handler = shared.connection().handler();
        let (affected, last_insert_id, gtid, resp_attrs) = shared.connection().with_raw(|raw| {
            (
                handler.affected_rows(raw),
                handler.last_insert_id(raw),
                handler.recv_gtid(raw),
                handler.resp_attrs(raw),
            )
        });
        self.accounting.current_affected_rows = affected;
        self.accounting.current_last_insert_id = last_insert_id;
        self.accounting.current_recv_gtid = gtid;
        self.accounting.current_resp_attrs = resp_attrs;
        self.accounting.num_queries_executed += 1;

        let next = shared.connection().with_raw(|raw| handler.next_result(raw));
        match next {
            Poll4::Pending => {
                register_pending_fd(shared);
                StepOutcome::Pending
            }
            Poll4::Done => {
                debug!(target: "mysqlop::fetch", queries = self.accounting.num_queries_executed, "fetch complete");
                let paused = self.fire(|observer, ctx| observer.notify_query_success(ctx, false));
                if paused {
                    self.final_outcome = Some((OperationResult::Succeeded, None));
                    self.pause(FetchAction::CompleteOperation);
                    return StepOutcome::Paused;
                }
                StepOutcome::Done(OperationResult::Succeeded, None)
            }
            Poll4::MoreResults => {
                let paused = self.fire(|observer, ctx| observer.notify_query_success(ctx, true));
                self.action = FetchAction::StartQuery;
                if paused {
                    self.pause(FetchAction::StartQuery);
                    return StepOutcome::Paused;
                }
                StepOutcome::Advance
            }
            Poll4::Error(e) => self.fail(OperationResult::Failed, e.into()),
        }
    }
}

impl<H: MysqlHandler> OperationImpl<H> for FetchState<H> {
    fn label(&self) -> &'static str {
        "fetch"
    }

    fn start(&mut self, shared: &Shared<H>) -> Poll {
        self.action = FetchAction::StartQuery;
        self.drive(shared)
    }

    fn poll(&mut self, shared: &Shared<H>) -> Poll {
        self.drive(shared)
    }

    /// No further handler verb is issued for this operation once
    /// `Operation::cancel` runs — it force-completes right after this
    /// returns — so all there is to do here is a best-effort kill of
    /// whatever statement is in flight.
    fn request_cancel(&mut self, shared: &Shared<H>) {
        shared.connection().with_raw(|raw| shared.connection().handler().kill_running_query(raw));
    }

    fn on_completed(&mut self, shared: &Shared<H>, result: OperationResult) {
        if result == OperationResult::TimedOut && shared.connection().kill_on_query_timeout() {
            shared.connection().with_raw(|raw| shared.connection().handler().kill_running_query(raw));
        }
        self.fire(|observer, ctx| observer.notify_operation_completed(ctx, result));
    }
}

struct NullObserver;
impl<H: MysqlHandler> FetchObserver<H> for NullObserver {}

/// Drives one or more SQL statements, issued as a single multi-query,
/// through [`MysqlHandler::run_query`]/`next_result`/`fetch_row`.
pub struct FetchOperation<H: MysqlHandler> {
    connection: Connection<H>,
    sql: Mutex<Option<String>>,
    total_timeout: Mutex<Option<Duration>>,
    observer: Mutex<Option<Box<dyn FetchObserver<H>>>>,
    inner: Mutex<Option<Arc<Operation<H, FetchState<H>>>>>,
}

impl<H: MysqlHandler> FetchOperation<H> {
    pub fn new(connection: Connection<H>, sql: impl Into<String>) -> Self {
        Self {
            connection,
            sql: Mutex::new(Some(sql.into())),
            total_timeout: Mutex::new(None),
            observer: Mutex::new(Some(Box::new(NullObserver))),
            inner: Mutex::new(None),
        }
    }

    pub fn set_total_timeout(&self, timeout: Duration) -> Result<&Self, Error> {
        if self.inner.lock().unwrap().is_some() {
            return Err(Error::InvalidState("fetch options can't change once run() was called"));
        }
        *self.total_timeout.lock().unwrap() = Some(timeout);
        Ok(self)
    }

    pub fn set_observer(&self, observer: impl FetchObserver<H> + 'static) -> Result<&Self, Error> {
        if self.inner.lock().unwrap().is_some() {
            return Err(Error::InvalidState("fetch options can't change once run() was called"));
        }
        *self.observer.lock().unwrap() = Some(Box::new(observer));
        Ok(self)
    }

    /// Starts the fetch. Returns immediately; completion is observed
    /// through `wait()`/`must_succeed()`, or through the observer's
    /// `notify_operation_completed`.
    pub fn run(&self) -> Result<(), Error> {
        let sql = self
            .sql
            .lock()
            .unwrap()
            .take()
            .ok_or(Error::InvalidState("operation already started"))?;
        let observer = self
            .observer
            .lock()
            .unwrap()
            .take()
            .ok_or(Error::InvalidState("operation already started"))?;
        let total_timeout = self
            .total_timeout
            .lock()
            .unwrap()
            .take()
            .or_else(|| self.connection.default_query_timeout());

        let state = FetchState {
            sql,
            action: FetchAction::StartQuery,
            paused_action: None,
            started_query: false,
            row_stream: RowStream::new(),
            accounting: Accounting::default(),
            observer,
            final_outcome: None,
        };

        let op = Operation::new(self.connection.clone(), total_timeout, state);
        let result = op.run();
        *self.inner.lock().unwrap() = Some(op);
        result
    }

    pub fn cancel(&self) {
        if let Some(op) = self.inner.lock().unwrap().as_ref() {
            op.cancel();
        }
    }

    /// Restores the action saved by `pause_for_consumer` and re-enters the
    /// I/O thread's driving loop. A no-op if the operation never paused or
    /// has already completed.
    pub fn resume(&self) {
        if let Some(op) = self.inner.lock().unwrap().as_ref() {
            let resumed = op.with_impl(|state| {
                if let Some(action) = state.paused_action.take() {
                    state.action = action;
                    true
                } else {
                    false
                }
            });
            if resumed {
                op.request_poll();
            }
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

    pub fn connection(&self) -> &Connection<H> {
        &self.connection
    }

    /// Runs `f` against the live row stream. Only meaningful while the
    /// operation is paused (`WaitForConsumer`) or has completed — the same
    /// cross-thread access window the notify callbacks observe.
    pub fn with_row_stream<R>(&self, f: impl FnOnce(&mut RowStream<H>) -> R) -> Option<R> {
        let inner = self.inner.lock().unwrap();
        let op = inner.as_ref()?;
        Some(op.with_impl(|state| f(&mut state.row_stream)))
    }

    fn with_accounting<R>(&self, f: impl FnOnce(&Accounting) -> R) -> Result<R, Error> {
        let inner = self.inner.lock().unwrap();
        let op = inner.as_ref().ok_or(Error::InvalidState("run() was not called"))?;
        Ok(op.with_impl(|state| f(&state.accounting)))
    }

    pub fn num_current_query(&self) -> Result<u32, Error> {
        self.with_accounting(|a| a.num_current_query)
    }

    pub fn num_queries_executed(&self) -> Result<u32, Error> {
        self.with_accounting(|a| a.num_queries_executed)
    }

    pub fn current_affected_rows(&self) -> Result<u64, Error> {
        self.with_accounting(|a| a.current_affected_rows)
    }

    pub fn current_last_insert_id(&self) -> Result<Option<u64>, Error> {
        self.with_accounting(|a| a.current_last_insert_id)
    }

    pub fn current_recv_gtid(&self) -> Result<Option<String>, Error> {
        self.with_accounting(|a| a.current_recv_gtid.clone())
    }

    pub fn current_resp_attrs(&self) -> Result<Vec<(String, String)>, Error> {
        self.with_accounting(|a| a.current_resp_attrs.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::ConnectionKey;
    use crate::rt::InlineEventLoop;
    use crate::testing::MockHandler;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn connection(handler: MockHandler) -> Connection<MockHandler> {
        let event_loop = Arc::new(InlineEventLoop::new());
        let key = ConnectionKey::new("localhost", 3306, "root", "test");
        Connection::new(handler, event_loop, key, handler_conn())
    }

    fn handler_conn() -> crate::testing::MockConnection {
        crate::testing::MockConnection::default()
    }

    struct CountingObserver {
        rows: Arc<AtomicU32>,
        queries_done: Arc<AtomicU32>,
    }

    impl FetchObserver<MockHandler> for CountingObserver {
        fn notify_rows_ready(&mut self, _ctx: &mut FetchContext<'_, MockHandler>) {
            self.rows.fetch_add(1, Ordering::SeqCst);
        }

        fn notify_query_success(&mut self, _ctx: &mut FetchContext<'_, MockHandler>, _has_more: bool) {
            self.queries_done.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn single_statement_delivers_every_row_then_succeeds() {
        let handler = MockHandler::new();
        handler.push_field_count(1);
        handler.push_fetch_row(FetchRowPoll::Row(vec!["1".into()]));
        handler.push_fetch_row(FetchRowPoll::Row(vec!["2".into()]));
        handler.push_fetch_row(FetchRowPoll::End);
        handler.push_next_result(Poll4::Done);

        let connection = connection(handler);
        let op = FetchOperation::new(connection, "SELECT 1");
        let rows = Arc::new(AtomicU32::new(0));
        let queries_done = Arc::new(AtomicU32::new(0));
        op.set_observer(CountingObserver {
            rows: Arc::clone(&rows),
            queries_done: Arc::clone(&queries_done),
        })
        .unwrap();

        op.run().unwrap();
        op.must_succeed().unwrap();

        assert_eq!(rows.load(Ordering::SeqCst), 2);
        assert_eq!(queries_done.load(Ordering::SeqCst), 1);
        assert_eq!(op.num_queries_executed().unwrap(), 1);
    }

    #[test]
    fn multi_statement_query_advances_through_every_result_set() {
        let handler = MockHandler::new();
        // Statement 1: one row, then MORE_RESULTS.
        handler.push_field_count(1);
        handler.push_fetch_row(FetchRowPoll::Row(vec!["a".into()]));
        handler.push_fetch_row(FetchRowPoll::End);
        handler.push_next_result(Poll4::MoreResults);
        // Statement 2: one row, then done.
        handler.push_field_count(1);
        handler.push_fetch_row(FetchRowPoll::Row(vec!["b".into()]));
        handler.push_fetch_row(FetchRowPoll::End);
        handler.push_next_result(Poll4::Done);

        let connection = connection(handler);
        let op = FetchOperation::new(connection, "SELECT 1; SELECT 2");
        let rows = Arc::new(AtomicU32::new(0));
        let queries_done = Arc::new(AtomicU32::new(0));
        op.set_observer(CountingObserver {
            rows: Arc::clone(&rows),
            queries_done: Arc::clone(&queries_done),
        })
        .unwrap();

        op.run().unwrap();
        op.must_succeed().unwrap();

        assert_eq!(rows.load(Ordering::SeqCst), 2);
        assert_eq!(queries_done.load(Ordering::SeqCst), 2);
        assert_eq!(op.num_queries_executed().unwrap(), 2);
    }

    struct PausingObserver {
        paused_once: std::sync::atomic::AtomicBool,
        rows_seen_while_paused: Arc<Mutex<Vec<String>>>,
    }

    impl FetchObserver<MockHandler> for PausingObserver {
        fn notify_rows_ready(&mut self, ctx: &mut FetchContext<'_, MockHandler>) {
            if !self.paused_once.swap(true, Ordering::SeqCst) {
                if let Some(row) = ctx.row_stream().consume_row() {
                    self.rows_seen_while_paused.lock().unwrap().extend(row);
                }
                ctx.pause_for_consumer();
            }
        }
    }

    #[test]
    fn pause_for_consumer_suspends_until_resume() {
        let handler = MockHandler::new();
        handler.push_field_count(1);
        handler.push_fetch_row(FetchRowPoll::Row(vec!["first".into()]));
        handler.push_fetch_row(FetchRowPoll::Row(vec!["second".into()]));
        handler.push_fetch_row(FetchRowPoll::End);
        handler.push_next_result(Poll4::Done);

        let connection = connection(handler);
        let op = Arc::new(FetchOperation::new(connection, "SELECT 1"));
        let rows_seen = Arc::new(Mutex::new(Vec::new()));
        op.set_observer(PausingObserver {
            paused_once: std::sync::atomic::AtomicBool::new(false),
            rows_seen_while_paused: Arc::clone(&rows_seen),
        })
        .unwrap();

        op.run().unwrap();
        // The inline loop ran everything up to the pause synchronously;
        // resume() drives the rest, also synchronously.
        assert_eq!(*rows_seen.lock().unwrap(), vec!["first".to_string()]);
        op.resume();
        op.must_succeed().unwrap();
    }

    #[test]
    fn cancel_during_fetch_completes_as_cancelled_and_dispatches_kill() {
        let handler = MockHandler::new();
        handler.push_field_count(1);
        // Never resolves: leaves the operation parked in `Fetch` so
        // `cancel()` has something in flight to interrupt.
        handler.push_fetch_row(FetchRowPoll::Pending);

        let connection = connection(handler);
        let op = FetchOperation::new(connection, "SELECT sleep(100)");

        op.run().unwrap();
        op.cancel();
        let result = op.must_succeed();
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(op.connection().handler().calls().kill_running_query, 1);
    }

    #[test]
    fn falls_back_to_the_connections_default_query_timeout_when_none_set_explicitly() {
        let handler = MockHandler::new();
        handler.push_field_count(1);
        // Never resolves, so the only thing that can end the operation is
        // the timeout picked up from the connection.
        handler.push_fetch_row(FetchRowPoll::Pending);

        let connection = connection(handler);
        connection.set_default_query_timeout(Some(Duration::from_millis(20)));

        let op = FetchOperation::new(connection, "SELECT sleep(100)");
        op.run().unwrap();
        op.wait();

        assert!(matches!(op.must_succeed(), Err(Error::Timeout(_))));
    }
}
