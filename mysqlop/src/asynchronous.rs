//! The `async`/`await` client surface.
//!
//! `ConnectOperation`/`FetchOperation` report completion through a
//! once-only callback rather than a `Future` impl, since the same
//! operation object is shared with the blocking surface. Bridging to
//! `async fn` here is a `tokio::sync::oneshot` channel fed from that
//! callback — mirroring how `sqlx_core::pool::connect::connect_with_backoff`
//! wraps a retry loop in a plain `async fn` over lower-level primitives —
//! rather than a hand-rolled `Future` that polls the operation's internal
//! state.

use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::debug;

use mysqlop_core::{
    ConnectOperation, Connection, ConnectionKey, Error, EventLoop, FetchContext, FetchObserver, FetchOperation,
    MysqlHandler, OperationResult, Result,
};
use mysqlop_core::rt::TokioEventLoop;

/// An established MySQL connection driven by a Tokio runtime.
///
/// Cheap to clone: cloning shares the underlying [`Connection`], so two
/// clones can each drive their own `fetch` concurrently as long as they
/// don't overlap — the connection's single-active-operation invariant
/// still applies, the same as for any other `Connection` user.
pub struct MySqlConnection<H: MysqlHandler> {
    connection: Connection<H>,
}

impl<H: MysqlHandler> MySqlConnection<H> {
    /// Connects to `key` on the Tokio runtime the caller is currently
    /// running on.
    ///
    /// `configure` runs against the freshly built [`ConnectOperation`]
    /// before it starts, e.g. `|op| op.set_total_timeout(Duration::from_secs(5))`.
    ///
    /// # Panics
    /// Panics if called outside of a Tokio runtime context (same condition
    /// as [`TokioEventLoop::current`]).
    pub async fn connect(
        handler: H,
        key: ConnectionKey,
        configure: impl FnOnce(&ConnectOperation<H>) -> Result<&ConnectOperation<H>, Error>,
    ) -> Result<Self> {
        let event_loop: Arc<dyn EventLoop> = Arc::new(TokioEventLoop::current());
        let op = ConnectOperation::new(handler, event_loop, key);
        configure(&op)?;

        let (tx, rx) = oneshot::channel();
        op.set_callback(move |_result| {
            let _ = tx.send(());
        })?;

        debug!(target: "mysqlop::connect", "starting async connect");
        op.run()?;
        let _ = rx.await;

        op.must_succeed()?;
        Ok(Self {
            connection: op.connection().expect("a succeeded connect always yields a connection"),
        })
    }

    /// Wraps an already-connected [`Connection`] (e.g. one handed back by
    /// the blocking surface) in the async facade.
    pub fn from_connection(connection: Connection<H>) -> Self {
        Self { connection }
    }

    /// Issues `sql` — one or more statements, as a single multi-query — and
    /// drives it to completion, dispatching row/statement notifications to
    /// `observer` as they occur.
    ///
    /// Resolves only once the whole fetch has completed; a consumer that
    /// wants to read rows from another thread mid-fetch still uses
    /// [`FetchContext::pause_for_consumer`]/`FetchOperation::resume` from
    /// inside `observer`, exactly as with the blocking surface.
    pub async fn fetch(&self, sql: impl Into<String>, observer: impl FetchObserver<H> + 'static) -> Result<()> {
        let op = FetchOperation::new(self.connection.clone(), sql);
        let (tx, rx) = oneshot::channel();
        op.set_observer(CompletionObserver {
            inner: observer,
            tx: Some(tx),
        })?;

        op.run()?;
        let _ = rx.await;
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

/// Forwards every notification to the wrapped observer, then fires a
/// one-shot completion signal after `notify_operation_completed` — the
/// last notification `FetchOperation` ever delivers.
struct CompletionObserver<H: MysqlHandler, O: FetchObserver<H>> {
    inner: O,
    tx: Option<oneshot::Sender<()>>,
}

impl<H: MysqlHandler, O: FetchObserver<H>> FetchObserver<H> for CompletionObserver<H, O> {
    fn notify_init_query(&mut self, ctx: &mut FetchContext<'_, H>) {
        self.inner.notify_init_query(ctx);
    }

    fn notify_rows_ready(&mut self, ctx: &mut FetchContext<'_, H>) {
        self.inner.notify_rows_ready(ctx);
    }

    fn notify_query_success(&mut self, ctx: &mut FetchContext<'_, H>, has_more_results: bool) {
        self.inner.notify_query_success(ctx, has_more_results);
    }

    fn notify_failure(&mut self, ctx: &mut FetchContext<'_, H>, result: OperationResult) {
        self.inner.notify_failure(ctx, result);
    }

    fn notify_operation_completed(&mut self, ctx: &mut FetchContext<'_, H>, result: OperationResult) {
        self.inner.notify_operation_completed(ctx, result);
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mysqlop_core::error::HandlerError;
    use mysqlop_core::testing::MockHandler;
    use mysqlop_core::{FetchRowPoll, Poll3, Poll4, SqErrno};

    fn key() -> ConnectionKey {
        ConnectionKey::new("localhost", 3306, "root", "test")
    }

    #[tokio::test]
    async fn connect_resolves_once_the_callback_fires() {
        let handler = MockHandler::new();
        let connection = MySqlConnection::connect(handler, key(), |op| op.set_connect_attempts(1))
            .await
            .unwrap();
        assert_eq!(connection.connection().handler().calls().try_connect, 1);
    }

    #[tokio::test]
    async fn fetch_delivers_rows_and_resolves_on_completion() {
        let handler = MockHandler::new();
        handler.push_field_count(1);
        handler.push_fetch_row(FetchRowPoll::Row(vec!["1".into()]));
        handler.push_fetch_row(FetchRowPoll::End);
        handler.push_next_result(Poll4::Done);

        let connection = MySqlConnection::connect(handler, key(), Ok).await.unwrap();

        struct CountRows(u32);
        impl FetchObserver<MockHandler> for CountRows {
            fn notify_rows_ready(&mut self, _ctx: &mut FetchContext<'_, MockHandler>) {
                self.0 += 1;
            }
        }

        connection.fetch("SELECT 1", CountRows(0)).await.unwrap();
    }

    #[tokio::test]
    async fn connect_failure_is_propagated() {
        let handler = MockHandler::new();
        handler.push_try_connect(Poll3::Error(HandlerError::new(SqErrno::ServerLost, "lost")));
        let result = MySqlConnection::connect(handler, key(), Ok).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn close_drives_reset_conn_before_close_when_enabled() {
        let handler = MockHandler::new();
        handler.push_reset_conn(Poll3::Done);
        let connection = MySqlConnection::connect(handler, key(), |op| op.set_reset_conn_before_close(true))
            .await
            .unwrap();

        let shared = connection.connection().clone();
        connection.close();
        // `close()` posts the reset onto the Tokio runtime rather than
        // driving it inline (unlike the blocking facade's `InlineEventLoop`),
        // so give the spawned task a turn to run before asserting.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(shared.handler().calls().reset_conn, 1);
    }
}
