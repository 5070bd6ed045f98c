//! The event-store contract used by the publisher and consumer pipelines.

use async_trait::async_trait;
use std::time::Duration;

use crate::Result;

/// A new outbox row, written just before the broker publish.
#[derive(Debug, Clone)]
pub struct OutboxInsert<'a> {
    pub message_id: &'a str,
    pub producer_service: &'a str,
    pub event_type: &'a str,
    pub message_body: serde_json::Value,
    pub partition_key: Option<&'a str>,
}

/// A new inbox row, written when a delivery is first claimed.
#[derive(Debug, Clone)]
pub struct InboxInsert<'a> {
    pub message_id: &'a str,
    pub consumer_service: &'a str,
    pub producer_service: &'a str,
    pub event_type: &'a str,
    pub message_body: serde_json::Value,
    pub retry_count: u32,
    pub worker_id: &'a str,
}

/// Outbox/inbox/trace persistence.
///
/// Existence checks fail open: a persistent database failure reads as
/// "absent", trading rare duplicates (which consumer idempotency absorbs)
/// for continued operation. `mark_*` methods are best-effort and report
/// success as `true`; callers must not treat `false` as a failure of the
/// surrounding flow.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Fail-open outbox existence check.
    async fn exists_in_outbox(&self, message_id: &str, producer_service: &str) -> bool;

    /// Insert with status `processing`. `Ok(false)` on a duplicate
    /// `(message_id, producer_service)`; other SQL faults are errors.
    async fn insert_outbox(&self, row: OutboxInsert<'_>) -> Result<bool>;

    /// Best-effort flip to `published`.
    async fn mark_published(&self, message_id: &str) -> bool;

    /// Best-effort flip to `pending`, recording the broker error.
    async fn mark_pending(&self, message_id: &str, error_message: &str) -> bool;

    /// Fail-open inbox existence check.
    async fn exists_in_inbox(&self, message_id: &str, consumer_service: &str) -> bool;

    /// Fail-open check for an inbox row that is already `processed`.
    async fn exists_in_inbox_processed(&self, message_id: &str, consumer_service: &str) -> bool;

    /// Insert with status `processing`, `locked_at = now()` and the given
    /// worker as `locked_by`. `Ok(false)` on a duplicate
    /// `(message_id, consumer_service)`; other SQL faults are errors.
    async fn insert_inbox(&self, row: InboxInsert<'_>) -> Result<bool>;

    /// Atomic stale-lock takeover: claims the row iff it is `processing`
    /// and unlocked or locked longer ago than `stale_threshold`. Never
    /// claims `processed` or `failed` rows. `Ok(true)` iff exactly one row
    /// was claimed.
    async fn try_claim_inbox(
        &self,
        message_id: &str,
        consumer_service: &str,
        worker_id: &str,
        stale_threshold: Duration,
    ) -> Result<bool>;

    /// Best-effort flip to `processed` with `processed_at = now()`.
    async fn mark_inbox_processed(&self, message_id: &str, consumer_service: &str) -> bool;

    /// Best-effort flip to `failed`, recording the terminal error.
    async fn mark_inbox_failed(
        &self,
        message_id: &str,
        consumer_service: &str,
        error_message: &str,
    ) -> bool;

    /// Best-effort retry-count update ahead of a delayed redelivery. The
    /// row stays `processing` and the worker lock is released so the next
    /// delivery attempt can claim it.
    async fn update_inbox_retry_count(
        &self,
        message_id: &str,
        consumer_service: &str,
        retry_count: u32,
    ) -> bool;

    /// Best-effort trace insert; duplicate message ids are idempotent
    /// skips.
    async fn insert_event_trace(&self, message_id: &str, parent_ids: &[String]) -> bool;
}
