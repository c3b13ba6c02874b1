//! The host object an [`Operation`][crate::operation::Operation] runs
//! against.
//!
//! A single `Connection<H>` type serves both the asynchronous and the
//! inline-blocking driver; the only axis of variation is which
//! [`EventLoop`][crate::event_loop::EventLoop] implementation it is bound
//! to. `ConnectOperation` and `FetchOperation` are written once against
//! `Connection` and never branch on the loop kind.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use parking_lot::Mutex as SyncMutex;
use tracing::{trace, warn};

use crate::error::{Error, Result};
use crate::event_loop::{EventLoop, FdReadyHandler};
use crate::handler::{MysqlHandler, Poll3};
use crate::key::ConnectionKey;

/// A connection (session) with a specific MySQL server.
///
/// Wraps the handler's [`InternalConnection`][crate::handler::InternalConnection]
/// along with the event loop it is scheduled on. Cheap to clone: all shared
/// state lives behind an `Arc`, matching how a single `ConnectOperation`
/// hands its surviving connection off to a caller-held handle.
pub struct Connection<H: MysqlHandler> {
    inner: Arc<ConnectionShared<H>>,
}

struct ConnectionShared<H: MysqlHandler> {
    handler: H,
    event_loop: Arc<dyn EventLoop>,
    raw: Mutex<Option<H::Connection>>,
    key: SyncMutex<ConnectionKey>,
    /// Invariant 1: at most one operation may be active on a
    /// connection at a time.
    operation_active: AtomicBool,
    /// Set only for operations of type `Connect`, to avoid leaking a TLS
    /// session across cert identities.
    tls_session: SyncMutex<Option<Vec<u8>>>,
    server_version: SyncMutex<Option<String>>,
    /// Set from the connect options that produced this connection; consulted
    /// by `FetchOperation` to decide whether a `TimedOut` query should
    /// dispatch `MysqlHandler::kill_running_query`.
    kill_on_query_timeout: AtomicBool,
    /// Mirrors `ConnectionOptions::reset_conn_before_close`: `close()` issues
    /// `COM_RESET_CONNECTION` before tearing the socket down, unless
    /// `delayed_reset_conn` defers that to pool checkout instead.
    reset_conn_before_close: AtomicBool,
    delayed_reset_conn: AtomicBool,
    /// `ConnectionOptions::query_timeout`: the total-timeout budget a
    /// `FetchOperation` started on this connection falls back to when it
    /// never called `set_total_timeout` itself.
    default_query_timeout: SyncMutex<Option<std::time::Duration>>,
}

impl<H: MysqlHandler> Connection<H> {
    pub fn new(handler: H, event_loop: Arc<dyn EventLoop>, key: ConnectionKey, raw: H::Connection) -> Self {
        Self {
            inner: Arc::new(ConnectionShared {
                handler,
                event_loop,
                raw: Mutex::new(Some(raw)),
                key: SyncMutex::new(key),
                operation_active: AtomicBool::new(false),
                tls_session: SyncMutex::new(None),
                server_version: SyncMutex::new(None),
                kill_on_query_timeout: AtomicBool::new(false),
                reset_conn_before_close: AtomicBool::new(false),
                delayed_reset_conn: AtomicBool::new(false),
                default_query_timeout: SyncMutex::new(None),
            }),
        }
    }

    /// A connection with no raw handler socket yet, used by
    /// `ConnectOperation`, which requests one from the handler itself
    /// before the first attempt.
    pub fn pending(handler: H, event_loop: Arc<dyn EventLoop>, key: ConnectionKey) -> Self {
        Self {
            inner: Arc::new(ConnectionShared {
                handler,
                event_loop,
                raw: Mutex::new(None),
                key: SyncMutex::new(key),
                operation_active: AtomicBool::new(false),
                tls_session: SyncMutex::new(None),
                server_version: SyncMutex::new(None),
                kill_on_query_timeout: AtomicBool::new(false),
                reset_conn_before_close: AtomicBool::new(false),
                delayed_reset_conn: AtomicBool::new(false),
                default_query_timeout: SyncMutex::new(None),
            }),
        }
    }

    /// Removes the raw handler connection, leaving the slot empty. Used
    /// between connect attempts to drop a failed socket before requesting
    /// a fresh one.
    pub fn take_raw(&self) -> Option<H::Connection> {
        self.inner.raw.lock().unwrap().take()
    }

    pub fn handler(&self) -> &H {
        &self.inner.handler
    }

    pub fn event_loop(&self) -> &Arc<dyn EventLoop> {
        &self.inner.event_loop
    }

    pub fn key(&self) -> ConnectionKey {
        self.inner.key.lock().clone()
    }

    pub fn set_key(&self, key: ConnectionKey) {
        *self.inner.key.lock() = key;
    }

    pub fn server_version(&self) -> Option<String> {
        self.inner.server_version.lock().clone()
    }

    pub fn set_server_version(&self, version: Option<String>) {
        *self.inner.server_version.lock() = version;
    }

    pub fn tls_session(&self) -> Option<Vec<u8>> {
        self.inner.tls_session.lock().clone()
    }

    pub fn store_tls_session(&self, session: Vec<u8>) {
        *self.inner.tls_session.lock() = Some(session);
    }

    pub fn kill_on_query_timeout(&self) -> bool {
        self.inner.kill_on_query_timeout.load(Ordering::Acquire)
    }

    pub fn set_kill_on_query_timeout(&self, enabled: bool) {
        self.inner.kill_on_query_timeout.store(enabled, Ordering::Release);
    }

    pub fn set_reset_conn_before_close(&self, enabled: bool) {
        self.inner.reset_conn_before_close.store(enabled, Ordering::Release);
    }

    pub fn set_delayed_reset_conn(&self, enabled: bool) {
        self.inner.delayed_reset_conn.store(enabled, Ordering::Release);
    }

    /// `ConnectionOptions::query_timeout` carried over from the connect that
    /// produced this connection. `FetchOperation::run` falls back to this
    /// when the caller never set a total timeout on the fetch itself.
    pub fn default_query_timeout(&self) -> Option<std::time::Duration> {
        *self.inner.default_query_timeout.lock()
    }

    pub fn set_default_query_timeout(&self, timeout: Option<std::time::Duration>) {
        *self.inner.default_query_timeout.lock() = timeout;
    }

    /// Releases this connection, honoring `reset_conn_before_close`.
    ///
    /// If the option was never enabled, or `delayed_reset_conn` pushed the
    /// reset out to pool checkout instead (out of scope for this crate — no
    /// pool type lives here), this just drops the socket. Otherwise
    /// `MysqlHandler::reset_conn` is driven to completion on the owning
    /// event loop, fire-and-forget: nothing here waits on it, and any error
    /// it reports is logged rather than surfaced, since there is no caller
    /// left to report it to.
    pub fn close(&self) {
        if self.inner.reset_conn_before_close.load(Ordering::Acquire) && !self.inner.delayed_reset_conn.load(Ordering::Acquire)
        {
            let accepted = {
                let connection = self.clone();
                self.inner.event_loop.run_in_thread(Box::new(move || connection.drive_reset()))
            };
            if !accepted {
                warn!(target: "mysqlop::connection", "event loop rejected reset-before-close; closing socket directly");
                self.with_raw(|raw| raw.close_socket());
            }
            return;
        }
        self.with_raw(|raw| raw.close_socket());
    }

    /// One tick of the fire-and-forget `reset_conn` drive started by
    /// `close()`. Runs on the owning event loop thread.
    fn drive_reset(&self) {
        let poll = self.with_raw(|raw| self.inner.handler.reset_conn(raw));
        match poll {
            Poll3::Done => {
                trace!(target: "mysqlop::connection", key = %self.key(), "reset-before-close completed");
                self.with_raw(|raw| raw.close_socket());
            }
            Poll3::Error(err) => {
                warn!(target: "mysqlop::connection", key = %self.key(), %err, "reset-before-close failed");
                self.with_raw(|raw| raw.close_socket());
            }
            Poll3::Pending => {
                let registration = self.with_raw(|raw| raw.raw_fd().map(|fd| (fd, raw.pending_direction())));
                match registration {
                    Some((fd, direction)) => {
                        let connection = self.clone();
                        self.inner
                            .event_loop
                            .register_fd(fd, direction, Box::new(ResetFdFired { connection }));
                    }
                    None => {
                        warn!(target: "mysqlop::connection", "reset-before-close pending with no socket to wait on");
                        self.with_raw(|raw| raw.close_socket());
                    }
                }
            }
        }
    }

    /// Runs `f` with exclusive access to the raw handler connection. Panics
    /// if the connection was already taken by `take_raw` (a bug: only one
    /// operation may hold it at a time, enforced by `try_acquire`).
    pub fn with_raw<R>(&self, f: impl FnOnce(&mut H::Connection) -> R) -> R {
        let mut guard = self.inner.raw.lock().unwrap();
        let raw = guard.as_mut().expect("connection's raw handle was taken while an operation needed it");
        f(raw)
    }

    pub fn replace_raw(&self, raw: H::Connection) {
        *self.inner.raw.lock().unwrap() = Some(raw);
    }

    /// Attempts to mark this connection as hosting an active operation
    /// (Invariant 1). Returns `Err` if one is already active.
    pub fn try_acquire(&self) -> Result<ConnectionGuard<H>> {
        if self
            .inner
            .operation_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            Ok(ConnectionGuard {
                connection: self.clone(),
            })
        } else {
            Err(Error::InvalidState(
                "connection already hosts an active operation",
            ))
        }
    }
}

impl<H: MysqlHandler> Clone for Connection<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Held by an [`Operation`][crate::operation::Operation] for as long as it
/// is the connection's active operation; dropping it releases the slot
/// (Invariant 1), which `complete_operation` does unconditionally.
pub struct ConnectionGuard<H: MysqlHandler> {
    connection: Connection<H>,
}

impl<H: MysqlHandler> ConnectionGuard<H> {
    pub fn connection(&self) -> &Connection<H> {
        &self.connection
    }
}

impl<H: MysqlHandler> Drop for ConnectionGuard<H> {
    fn drop(&mut self) {
        self.connection
            .inner
            .operation_active
            .store(false, Ordering::Release);
    }
}

/// Re-enters `Connection::drive_reset` once the socket `close()` is waiting
/// on becomes ready, the same fd-readiness bounce `FdBroker` uses for
/// `Operation`s, minus the bookkeeping needed to cancel it — nothing ever
/// cancels a reset-before-close once it starts.
struct ResetFdFired<H: MysqlHandler> {
    connection: Connection<H>,
}

impl<H: MysqlHandler> FdReadyHandler for ResetFdFired<H> {
    fn fd_ready(&self) {
        self.connection.drive_reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::ConnectionKey;
    use crate::rt::InlineEventLoop;
    use crate::testing::{MockConnection, MockHandler};

    fn connection(handler: MockHandler) -> Connection<MockHandler> {
        let event_loop = Arc::new(InlineEventLoop::new());
        let key = ConnectionKey::new("localhost", 3306, "root", "test");
        Connection::new(handler, event_loop, key, MockConnection::default())
    }

    #[test]
    fn close_without_reset_before_close_just_drops_the_socket() {
        let handler = MockHandler::new();
        let conn = connection(handler);
        conn.close();
        assert_eq!(conn.handler().calls().reset_conn, 0);
    }

    #[test]
    fn close_with_reset_before_close_drives_reset_conn_to_completion() {
        let handler = MockHandler::new();
        handler.push_reset_conn(Poll3::Done);
        let conn = connection(handler);
        conn.set_reset_conn_before_close(true);

        conn.close();
        assert_eq!(conn.handler().calls().reset_conn, 1);
    }

    #[test]
    fn close_with_delayed_reset_conn_does_not_reset_here() {
        let handler = MockHandler::new();
        let conn = connection(handler);
        conn.set_reset_conn_before_close(true);
        conn.set_delayed_reset_conn(true);

        conn.close();
        assert_eq!(conn.handler().calls().reset_conn, 0);
    }
}
