//! Broker plumbing: the shared connection/channel pool, the per-service
//! topology, the outage circuit breaker, and the wire-level publish path.

pub mod breaker;
pub mod error;
pub mod pool;
pub mod topology;
pub mod wire;

pub use breaker::CircuitBreaker;
pub use error::{BrokerError, ConsumeErrorKind, PublishErrorKind};
pub use pool::BrokerPool;
pub use topology::Topology;

pub type Result<T> = std::result::Result<T, BrokerError>;
