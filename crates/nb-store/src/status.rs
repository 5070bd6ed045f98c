//! Row status enums, stored as text.

use std::fmt;

/// Outbox lifecycle: `processing` just before the broker publish,
/// `published` on success, `pending` when the broker was unavailable
/// (the dispatcher re-ships those), `failed` terminally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    Processing,
    Published,
    Pending,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Processing => "processing",
            OutboxStatus::Published => "published",
            OutboxStatus::Pending => "pending",
            OutboxStatus::Failed => "failed",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "processing" => Some(OutboxStatus::Processing),
            "published" => Some(OutboxStatus::Published),
            "pending" => Some(OutboxStatus::Pending),
            "failed" => Some(OutboxStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inbox lifecycle: rows are born `processing` with a fresh lock, end as
/// `processed` or `failed`. Retries keep the row in `processing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxStatus {
    Processing,
    Processed,
    Failed,
}

impl InboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InboxStatus::Processing => "processing",
            InboxStatus::Processed => "processed",
            InboxStatus::Failed => "failed",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "processing" => Some(InboxStatus::Processing),
            "processed" => Some(InboxStatus::Processed),
            "failed" => Some(InboxStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for InboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbox_statuses_round_trip() {
        for status in [
            OutboxStatus::Processing,
            OutboxStatus::Published,
            OutboxStatus::Pending,
            OutboxStatus::Failed,
        ] {
            assert_eq!(OutboxStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(OutboxStatus::from_str("shipped"), None);
    }

    #[test]
    fn inbox_statuses_round_trip() {
        for status in [
            InboxStatus::Processing,
            InboxStatus::Processed,
            InboxStatus::Failed,
        ] {
            assert_eq!(InboxStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(InboxStatus::from_str("done"), None);
    }
}
