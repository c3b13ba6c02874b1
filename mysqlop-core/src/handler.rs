//! The abstract, non-blocking MySQL protocol driver.
//!
//! `MysqlHandler` is the inward dependency the operation engine drives: it
//! never speaks the MySQL wire protocol itself. A real implementation wraps
//! a C client library or a pure-Rust protocol codec; tests use
//! [`crate::testing::MockHandler`].

use std::fmt;

use crate::error::HandlerError;
use crate::key::ConnectionKey;
use crate::options::ConnectionOptions;

bitflags::bitflags! {
    /// Connection capability flags passed to `try_connect`. `MULTI_STATEMENTS`
    /// is always included by [`ConnectOperation`][crate::operation::connect::ConnectOperation];
    /// callers may OR in additional driver-specific flags.
    pub struct ConnectFlags: u32 {
        const MULTI_STATEMENTS = 1 << 0;
        const FOUND_ROWS       = 1 << 1;
        const COMPRESS         = 1 << 2;
        const SSL               = 1 << 3;
    }
}

/// The three-way result every non-blocking handler verb returns.
#[derive(Debug)]
pub enum Poll3 {
    Pending,
    Done,
    Error(HandlerError),
}

/// Like [`Poll3`], but `next_result` additionally reports that another
/// result set follows in the same multi-statement query.
#[derive(Debug)]
pub enum Poll4 {
    Pending,
    Done,
    MoreResults,
    Error(HandlerError),
}

/// The outcome of one `fetch_row` call.
pub enum FetchRowPoll<Row> {
    Pending,
    Row(Row),
    /// No more rows in the current result set.
    End,
    Error(HandlerError),
}

impl<Row: fmt::Debug> fmt::Debug for FetchRowPoll<Row> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchRowPoll::Pending => f.write_str("Pending"),
            FetchRowPoll::Row(row) => f.debug_tuple("Row").field(row).finish(),
            FetchRowPoll::End => f.write_str("End"),
            FetchRowPoll::Error(e) => f.debug_tuple("Error").field(e).finish(),
        }
    }
}

/// Which direction of socket readiness a `Pending` result is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    Readable,
    Writable,
    ReadOrWrite,
}

/// The raw, handler-owned connection object. Exposes only what the engine
/// needs to register the socket with an [`EventLoop`][crate::event_loop::EventLoop]
/// and to attribute failures; everything else (buffers, the wire codec) is
/// private to the handler.
pub trait InternalConnection: Send {
    /// `None` before the handshake has produced a socket, or after close.
    fn raw_fd(&self) -> Option<i32>;

    /// Which direction the most recent `Pending` result is waiting on.
    fn pending_direction(&self) -> IoDirection;

    /// Drops the socket (if any) but keeps higher-level connection state,
    /// used between retry attempts.
    fn close_socket(&mut self);
}

/// The non-blocking verb set a MySQL protocol driver must expose.
///
/// Every verb is expected to be called repeatedly by the owning
/// [`Operation`][crate::operation::Operation] until it reports something
/// other than `Pending`; the handler itself decides what "ready" means for
/// its own I/O model.
pub trait MysqlHandler: Send + Sync + 'static {
    type Connection: InternalConnection;
    type ResultHandle: Send;
    type Row: Send;

    /// Allocates a fresh, not-yet-connected `Connection`. Called once per
    /// connect attempt: a failed attempt's connection is
    /// discarded and a new one requested for the next attempt rather than
    /// being reused.
    fn new_connection(&self) -> Self::Connection;

    fn try_connect(
        &self,
        conn: &mut Self::Connection,
        options: &ConnectionOptions,
        key: &ConnectionKey,
        flags: ConnectFlags,
    ) -> Poll3;

    fn run_query(&self, conn: &mut Self::Connection, sql: &str) -> Poll3;

    fn next_result(&self, conn: &mut Self::Connection) -> Poll4;

    fn fetch_row(&self, result: &mut Self::ResultHandle) -> FetchRowPoll<Self::Row>;

    fn get_field_count(&self, conn: &Self::Connection) -> usize;

    fn get_result(&self, conn: &mut Self::Connection) -> Self::ResultHandle;

    /// Best-effort size in bytes of one fetched row's payload, used only to
    /// accumulate [`RowStream`][crate::operation::fetch::RowStream]'s byte
    /// counter. Handlers that don't track this may return `0`.
    fn row_size_bytes(&self, _row: &Self::Row) -> usize {
        0
    }

    fn reset_conn(&self, conn: &mut Self::Connection) -> Poll3;

    fn change_user(&self, conn: &mut Self::Connection, key: &ConnectionKey) -> Poll3;

    /// Best-effort asynchronous kill of whatever statement is currently
    /// executing on `conn`, dispatched on `FetchOperation::cancel()`.
    /// The default implementation is a no-op for handlers that can't
    /// support it out-of-band.
    fn kill_running_query(&self, _conn: &Self::Connection) {}

    /// Server version string, available once `try_connect` reports `Done`.
    fn server_version(&self, _conn: &Self::Connection) -> Option<String> {
        None
    }

    /// The TLS session ticket negotiated during `try_connect`, if the
    /// connection is using TLS and the underlying driver supports session
    /// resumption. `ConnectOperation::succeed` stores whatever this returns
    /// on the resulting `Connection` so a later connect attempt against the
    /// same cert identity can offer it back via
    /// `ConnectionOptions`/`try_connect`.
    fn tls_session(&self, _conn: &Self::Connection) -> Option<Vec<u8>> {
        None
    }

    /// The affected-row count of the statement that most recently completed.
    fn affected_rows(&self, _conn: &Self::Connection) -> u64 {
        0
    }

    /// The auto-increment id generated by the statement that most recently
    /// completed, if any.
    fn last_insert_id(&self, _conn: &Self::Connection) -> Option<u64> {
        None
    }

    /// The server-supplied GTID for the transaction that most recently
    /// completed, if the server reports one.
    fn recv_gtid(&self, _conn: &Self::Connection) -> Option<String> {
        None
    }

    /// Key/value session-state-change attributes reported by the server
    /// alongside the statement that most recently completed.
    fn resp_attrs(&self, _conn: &Self::Connection) -> Vec<(String, String)> {
        Vec::new()
    }
}
