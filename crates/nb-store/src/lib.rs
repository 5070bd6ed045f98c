//! Durable event store: the transactional outbox, the idempotent inbox,
//! and the best-effort event-trace table.
//!
//! Row state in these tables is the source of truth for at-least-once
//! publishing and exactly-once-effect consumption. Reads fail open (a
//! database blip must not stall publishing), inserts tolerate duplicate
//! keys, and status updates are best-effort.

pub mod memory;
pub mod postgres;
pub mod repository;
pub mod retry;

mod error;
mod status;

pub use error::{is_transient, is_unique_violation, StoreError};
pub use memory::MemoryEventStore;
pub use postgres::PgEventStore;
pub use repository::{EventStore, InboxInsert, OutboxInsert};
pub use status::{InboxStatus, OutboxStatus};

pub type Result<T> = std::result::Result<T, StoreError>;
