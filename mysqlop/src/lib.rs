//! Asynchronous MySQL client built on the `mysqlop-core` operation engine.
//!
//! This crate does not speak the MySQL wire protocol itself or decode rows
//! into typed values — those are the job of a `MysqlHandler` implementation
//! and a row-decoding layer, respectively, both external to this crate. What
//! it provides is an ergonomic `async`/`await` (and, under `blocking`, a
//! synchronous) surface over `mysqlop-core`'s callback-driven
//! `ConnectOperation`/`FetchOperation`, the same way `sqlx` sits over
//! `sqlx-core`.

#![forbid(unsafe_code)]

#[cfg(feature = "runtime-tokio")]
mod asynchronous;

#[cfg(feature = "blocking")]
mod blocking;

pub use mysqlop_core::{
    ChangeUserMode, Connection, ConnectionGuard, ConnectionKey, ConnectionOptions, ConnectionOptionsBuilder,
    ConnectOperation, Error, EventLoop, FetchContext, FetchObserver, FetchOperation, FetchRowPoll,
    InternalConnection, MysqlHandler, Operation, OperationResult, OperationState, Poll3, Poll4, Result, RowStream,
    SqErrno,
};

#[cfg(feature = "runtime-tokio")]
pub use asynchronous::MySqlConnection;

#[cfg(feature = "blocking")]
pub use blocking::BlockingMySqlConnection;
