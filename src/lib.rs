#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod bus;
mod config;
mod dao;
mod dispatch;
mod error;
mod event;
pub mod memory;
pub mod pg;
mod queue;
mod runner;
mod schema;

/// The public bus facade.
pub use self::bus::PersistentBus;
/// Bus configuration and the retry backoff schedule.
pub use self::config::{BusConfig, RetryBackoff};
/// The storage port the bus core is generic over.
pub use self::dao::QueueDao;
/// Handler trait and registration identity.
pub use self::dispatch::{EventDispatcher, EventHandler, SubscriberId};
/// Error types for publishing, storage, and dispatch.
pub use self::error::{DecodeError, DispatchError, PublishError, StorageError};
/// The event trait and the inspection-query result type.
pub use self::event::{BusEvent, BusEventWithMetadata};
/// The queue engine and the caller-visible transaction handle.
pub use self::queue::{BusTransaction, DbBackedQueue};
/// Persisted row types.
pub use self::schema::{BusEventRow, NewBusEvent, ProcessingState};
