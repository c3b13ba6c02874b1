//! Concrete [`EventLoop`][crate::event_loop::EventLoop] implementations.
//!
//! Grounded on `sqlx_core`'s split between its default async `Runtime` and
//! `sqlx_core::blocking::runtime::Blocking`: the same operation state
//! machines run unmodified against either loop.

pub mod inline;

#[cfg(feature = "runtime-tokio")]
pub mod tokio_loop;

#[cfg(feature = "runtime-tokio")]
pub use tokio_loop::TokioEventLoop;

pub use inline::InlineEventLoop;
