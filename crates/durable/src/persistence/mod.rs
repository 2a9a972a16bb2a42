//! Persistence layer
//!
//! This module provides:
//! - Store traits: [`RuleStore`], [`LogSink`], [`DeadLetterStore`], [`ScheduledActionStore`]
//! - [`InMemoryStore`] for testing
//! - [`PostgresStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryStore;
pub use postgres::{PostgresStore, MIGRATOR};
pub use store::{
    DeadLetterStore, DlqBatchQuery, DlqFilter, DlqItem, DlqStats, DlqStatus, LogCategory,
    LogEntry, LogLevel, LogSink, Pagination, RuleStore, ScheduledAction, ScheduledActionStatus,
    ScheduledActionStore, StoreError,
};

/// Every store trait at once, for wiring a single backend through the engine
pub trait Store: RuleStore + LogSink + DeadLetterStore + ScheduledActionStore {}

impl<T> Store for T where T: RuleStore + LogSink + DeadLetterStore + ScheduledActionStore {}
