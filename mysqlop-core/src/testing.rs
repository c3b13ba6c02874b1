//! A scriptable [`MysqlHandler`] for exercising `ConnectOperation` and
//! `FetchOperation` without a real server.
//!
//! Gated behind `cfg(test)` by default; the `testing` feature lifts that
//! gate so downstream crates (e.g. `mysqlop`) can write integration tests
//! against the same fake without duplicating it.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::handler::{ConnectFlags, FetchRowPoll, InternalConnection, IoDirection, MysqlHandler, Poll3, Poll4};
use crate::key::ConnectionKey;
use crate::options::ConnectionOptions;

/// The connection object `MockHandler` hands out. Carries no real socket;
/// `close_socket` just flips a flag so tests can assert it happened.
#[derive(Debug, Default)]
pub struct MockConnection {
    pub closed: bool,
}

impl InternalConnection for MockConnection {
    fn raw_fd(&self) -> Option<i32> {
        None
    }

    fn pending_direction(&self) -> IoDirection {
        IoDirection::ReadOrWrite
    }

    fn close_socket(&mut self) {
        self.closed = true;
    }
}

/// One row, represented as a list of column values in whatever textual form
/// the test wants. `MockHandler` never interprets it.
pub type MockRow = Vec<String>;

#[derive(Default)]
struct Script {
    try_connect: VecDeque<Poll3>,
    run_query: VecDeque<Poll3>,
    next_result: VecDeque<Poll4>,
    field_count: VecDeque<usize>,
    fetch_row: VecDeque<FetchRowPoll<MockRow>>,
    change_user: VecDeque<Poll3>,
    reset_conn: VecDeque<Poll3>,
    tls_session: VecDeque<Option<Vec<u8>>>,
}

/// How many times each verb was invoked, for assertions like "exactly one
/// retry happened" or "a kill was dispatched".
#[derive(Debug, Default, Clone, Copy)]
pub struct CallCounts {
    pub try_connect: u32,
    pub run_query: u32,
    pub next_result: u32,
    pub fetch_row: u32,
    pub kill_running_query: u32,
    pub reset_conn: u32,
    pub change_user: u32,
}

/// A [`MysqlHandler`] driven entirely by canned responses pushed ahead of
/// time with the `push_*` methods.
///
/// Each verb pops the front of its own queue; once a queue is empty it
/// falls back to a reasonable terminal default (`Poll3::Done`,
/// `FetchRowPoll::End`, ...) rather than panicking, so a test only needs to
/// script the calls it cares about.
#[derive(Default)]
pub struct MockHandler {
    script: Mutex<Script>,
    calls: Mutex<CallCounts>,
}

impl MockHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_try_connect(&self, poll: Poll3) -> &Self {
        self.script.lock().unwrap().try_connect.push_back(poll);
        self
    }

    pub fn push_run_query(&self, poll: Poll3) -> &Self {
        self.script.lock().unwrap().run_query.push_back(poll);
        self
    }

    pub fn push_next_result(&self, poll: Poll4) -> &Self {
        self.script.lock().unwrap().next_result.push_back(poll);
        self
    }

    pub fn push_field_count(&self, count: usize) -> &Self {
        self.script.lock().unwrap().field_count.push_back(count);
        self
    }

    pub fn push_fetch_row(&self, poll: FetchRowPoll<MockRow>) -> &Self {
        self.script.lock().unwrap().fetch_row.push_back(poll);
        self
    }

    pub fn push_change_user(&self, poll: Poll3) -> &Self {
        self.script.lock().unwrap().change_user.push_back(poll);
        self
    }

    pub fn push_reset_conn(&self, poll: Poll3) -> &Self {
        self.script.lock().unwrap().reset_conn.push_back(poll);
        self
    }

    pub fn push_tls_session(&self, session: Option<Vec<u8>>) -> &Self {
        self.script.lock().unwrap().tls_session.push_back(session);
        self
    }

    pub fn calls(&self) -> CallCounts {
        *self.calls.lock().unwrap()
    }
}

impl MysqlHandler for MockHandler {
    type Connection = MockConnection;
    type ResultHandle = ();
    type Row = MockRow;

    fn new_connection(&self) -> Self::Connection {
        MockConnection::default()
    }

    fn try_connect(
        &self,
        _conn: &mut Self::Connection,
        _options: &ConnectionOptions,
        _key: &ConnectionKey,
        _flags: ConnectFlags,
    ) -> Poll3 {
        self.calls.lock().unwrap().try_connect += 1;
        self.script
            .lock()
            .unwrap()
            .try_connect
            .pop_front()
            .unwrap_or(Poll3::Done)
    }

    fn run_query(&self, _conn: &mut Self::Connection, _sql: &str) -> Poll3 {
        self.calls.lock().unwrap().run_query += 1;
        self.script.lock().unwrap().run_query.pop_front().unwrap_or(Poll3::Done)
    }

    fn next_result(&self, _conn: &mut Self::Connection) -> Poll4 {
        self.calls.lock().unwrap().next_result += 1;
        self.script
            .lock()
            .unwrap()
            .next_result
            .pop_front()
            .unwrap_or(Poll4::Done)
    }

    fn fetch_row(&self, _result: &mut Self::ResultHandle) -> FetchRowPoll<Self::Row> {
        self.calls.lock().unwrap().fetch_row += 1;
        self.script
            .lock()
            .unwrap()
            .fetch_row
            .pop_front()
            .unwrap_or(FetchRowPoll::End)
    }

    fn get_field_count(&self, _conn: &Self::Connection) -> usize {
        self.script.lock().unwrap().field_count.pop_front().unwrap_or(0)
    }

    fn get_result(&self, _conn: &mut Self::Connection) -> Self::ResultHandle {}

    fn row_size_bytes(&self, row: &Self::Row) -> usize {
        row.iter().map(|cell| cell.len()).sum()
    }

    fn reset_conn(&self, _conn: &mut Self::Connection) -> Poll3 {
        self.calls.lock().unwrap().reset_conn += 1;
        self.script.lock().unwrap().reset_conn.pop_front().unwrap_or(Poll3::Done)
    }

    fn change_user(&self, _conn: &mut Self::Connection, _key: &ConnectionKey) -> Poll3 {
        self.calls.lock().unwrap().change_user += 1;
        self.script
            .lock()
            .unwrap()
            .change_user
            .pop_front()
            .unwrap_or(Poll3::Done)
    }

    fn kill_running_query(&self, _conn: &Self::Connection) {
        self.calls.lock().unwrap().kill_running_query += 1;
    }

    fn tls_session(&self, _conn: &Self::Connection) -> Option<Vec<u8>> {
        self.script.lock().unwrap().tls_session.pop_front().unwrap_or(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unscripted_verbs_fall_back_to_terminal_defaults() {
        let handler = MockHandler::new();
        let mut conn = handler.new_connection();
        assert!(matches!(
            handler.try_connect(&mut conn, &ConnectionOptions::default(), &test_key(), ConnectFlags::empty()),
            Poll3::Done
        ));
        assert!(matches!(handler.fetch_row(&mut ()), FetchRowPoll::End));
    }

    #[test]
    fn scripted_verbs_pop_in_order() {
        let handler = MockHandler::new();
        handler.push_try_connect(Poll3::Pending);
        handler.push_try_connect(Poll3::Done);

        let mut conn = handler.new_connection();
        let options = ConnectionOptions::default();
        let key = test_key();
        assert!(matches!(
            handler.try_connect(&mut conn, &options, &key, ConnectFlags::empty()),
            Poll3::Pending
        ));
        assert!(matches!(
            handler.try_connect(&mut conn, &options, &key, ConnectFlags::empty()),
            Poll3::Done
        ));
        assert_eq!(handler.calls().try_connect, 2);
    }

    fn test_key() -> ConnectionKey {
        ConnectionKey::new("localhost", 3306, "root", "test")
    }
}
