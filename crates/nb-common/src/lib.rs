//! Shared vocabulary for the NanoBus messaging runtime.
//!
//! Holds the message [`Envelope`] that every publisher and consumer speaks,
//! the broker naming newtypes, worker identity, and logging setup.

pub mod envelope;
pub mod logging;

mod names;
mod worker;

pub use envelope::{Envelope, EnvelopeBody, MessageStatus, StatusCode, SystemMeta};
pub use names::{ExchangeName, QueueName};
pub use worker::worker_id;
