//! The synchronous client surface.
//!
//! `InlineEventLoop` runs every posted task immediately on the calling
//! thread, so by the time `ConnectOperation::run`/`FetchOperation::run`
//! return, the operation has already reached a terminal state — there is no
//! callback to bridge, unlike [`crate::asynchronous`]. Grounded on
//! `sqlx_core::blocking::MySqlConnection`'s relationship to `sqlx-core`'s
//! async connection: same operations, a different runtime underneath.

use mysqlop_core::rt::InlineEventLoop;
use mysqlop_core::{
    ConnectOperation, Connection, ConnectionKey, Error, EventLoop, FetchObserver, FetchOperation, MysqlHandler, Result,
};
use std::sync::Arc;

/// An established MySQL connection driven by the inline (blocking) event
/// loop.
pub struct BlockingMySqlConnection<H: MysqlHandler> {
    connection: Connection<H>,
}

impl<H: MysqlHandler> BlockingMySqlConnection<H> {
    /// Connects to `key`, blocking the calling thread until the connect
    /// operation reaches a terminal state.
    ///
    /// `configure` runs against the freshly built [`ConnectOperation`]
    /// before it starts, mirroring [`crate::asynchronous::MySqlConnection::connect`].
    pub fn connect(
        handler: H,
        key: ConnectionKey,
        configure: impl FnOnce(&ConnectOperation<H>) -> Result<&ConnectOperation<H>, Error>,
    ) -> Result<Self> {
        let event_loop: Arc<dyn EventLoop> = Arc::new(InlineEventLoop::new());
        let op = ConnectOperation::new(handler, event_loop, key);
        configure(&op)?;

        op.run()?;
        op.must_succeed()?;
        Ok(Self {
            connection: op.connection().expect("a succeeded connect always yields a connection"),
        })
    }

    /// Wraps an already-connected [`Connection`] in the blocking facade.
    pub fn from_connection(connection: Connection<H>) -> Self {
        Self { connection }
    }

    /// Issues `sql` and drives it to completion on the calling thread,
    /// dispatching row/statement notifications to `observer` as they occur.
    pub fn fetch(&self, sql: impl Into<String>, observer: impl FetchObserver<H> + 'static) -> Result<()> {
        let op = FetchOperation::new(self.connection.clone(), sql);
        op.set_observer(observer)?;
        op.run()?;
        op.must_succeed()
    }

    pub fn connection(&self) -> &Connection<H> {
        &self.connection
    }

    /// Releases the underlying connection, honoring whatever
    /// `reset_conn_before_close` setting the connect operation configured.
    pub fn close(self) {
        self.connection.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mysqlop_core::testing::MockHandler;
    use mysqlop_core::{FetchContext, FetchRowPoll, Poll3, Poll4};

    fn key() -> ConnectionKey {
        ConnectionKey::new("localhost", 3306, "root", "test")
    }

    #[test]
    fn connect_runs_synchronously_and_yields_a_connection() {
        let handler = MockHandler::new();
        let connection = BlockingMySqlConnection::connect(handler, key(), |op| op.set_connect_attempts(1)).unwrap();
        assert_eq!(connection.connection().handler().calls().try_connect, 1);
    }

    #[test]
    fn fetch_runs_synchronously_and_delivers_rows() {
        let handler = MockHandler::new();
        handler.push_field_count(1);
        handler.push_fetch_row(FetchRowPoll::Row(vec!["1".into()]));
        handler.push_fetch_row(FetchRowPoll::End);
        handler.push_next_result(Poll4::Done);

        let connection = BlockingMySqlConnection::connect(handler, key(), Ok).unwrap();

        struct CountRows(u32);
        impl FetchObserver<MockHandler> for CountRows {
            fn notify_rows_ready(&mut self, _ctx: &mut FetchContext<'_, MockHandler>) {
                self.0 += 1;
            }
        }

        connection.fetch("SELECT 1", CountRows(0)).unwrap();
    }

    #[test]
    fn close_drives_reset_conn_before_close_when_enabled() {
        let handler = MockHandler::new();
        handler.push_reset_conn(Poll3::Done);
        let connection =
            BlockingMySqlConnection::connect(handler, key(), |op| op.set_reset_conn_before_close(true)).unwrap();

        let shared = connection.connection().clone();
        connection.close();
        assert_eq!(shared.handler().calls().reset_conn, 1);
    }
}
