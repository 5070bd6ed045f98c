//! Consumer-side errors that abort the current delivery or session.
//!
//! Everything here bubbles to the outer loop, which resets the broker
//! pool and reconnects; the broker then redelivers the unsettled message
//! and inbox idempotency absorbs the replay.

use nb_broker::BrokerError;
use nb_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("inbox insert failed: {0}")]
    InboxInsert(#[source] StoreError),

    #[error("inbox claim failed: {0}")]
    InboxClaim(#[source] StoreError),

    #[error("ack failed: {0}")]
    Ack(#[source] lapin::Error),
}

impl ConsumerError {
    pub fn as_tag(&self) -> &'static str {
        match self {
            ConsumerError::Broker(error) => error.consume_kind().as_tag(),
            ConsumerError::InboxInsert(_) | ConsumerError::InboxClaim(_) => "inbox_insert_error",
            ConsumerError::Ack(_) => "ack_error",
        }
    }
}

impl From<lapin::Error> for ConsumerError {
    fn from(error: lapin::Error) -> Self {
        Self::Broker(BrokerError::from(error))
    }
}
