//! Core operation engine for `mysqlop`.
//!
//! This crate is not meant to be used directly; the `mysqlop` facade
//! re-exports the pieces applications need. It exists on its own so the
//! operation state machines, the handler seam, and the two event-loop
//! backends can be developed and tested independently of any particular
//! facade surface, the same split `sqlx-core` draws underneath `sqlx`.

pub mod connection;
pub mod error;
pub mod event_loop;
pub mod handler;
pub mod key;
pub mod operation;
pub mod options;
pub mod rt;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use connection::{Connection, ConnectionGuard};
pub use error::{Error, Result, SqErrno};
pub use event_loop::EventLoop;
pub use handler::{FetchRowPoll, InternalConnection, MysqlHandler, Poll3, Poll4};
pub use key::ConnectionKey;
pub use operation::{
    connect::ConnectOperation,
    fetch::{FetchContext, FetchObserver, FetchOperation, RowStream},
    Operation, OperationResult, OperationState,
};
pub use options::{ChangeUserMode, ConnectionOptions, ConnectionOptionsBuilder};
