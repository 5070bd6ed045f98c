//! Publisher errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PublisherError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] nb_store::StoreError),

    #[error(transparent)]
    Broker(#[from] nb_broker::BrokerError),
}

/// Internal publisher failure categories, carried as metric tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherErrorKind {
    Validation,
    OutboxInsert,
    OutboxUpdate,
    TraceInsert,
}

impl PublisherErrorKind {
    pub fn as_tag(&self) -> &'static str {
        match self {
            PublisherErrorKind::Validation => "validation_error",
            PublisherErrorKind::OutboxInsert => "outbox_insert_error",
            PublisherErrorKind::OutboxUpdate => "outbox_update_error",
            PublisherErrorKind::TraceInsert => "trace_insert_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_match_the_metric_contract() {
        assert_eq!(PublisherErrorKind::Validation.as_tag(), "validation_error");
        assert_eq!(PublisherErrorKind::OutboxInsert.as_tag(), "outbox_insert_error");
        assert_eq!(PublisherErrorKind::OutboxUpdate.as_tag(), "outbox_update_error");
        assert_eq!(PublisherErrorKind::TraceInsert.as_tag(), "trace_insert_error");
    }
}
