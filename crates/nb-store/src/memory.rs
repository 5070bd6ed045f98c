//! In-memory event store for development and tests.
//!
//! Mirrors the PostgreSQL semantics: unique keys, fail-open reads (always
//! healthy here), stale-lock claims. State is inspectable so tests can
//! assert on row lifecycles without a database.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::repository::{EventStore, InboxInsert, OutboxInsert};
use crate::status::{InboxStatus, OutboxStatus};
use crate::Result;

#[derive(Debug, Clone)]
pub struct MemoryOutboxRow {
    pub producer_service: String,
    pub event_type: String,
    pub message_body: serde_json::Value,
    pub status: OutboxStatus,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MemoryInboxRow {
    pub consumer_service: String,
    pub producer_service: String,
    pub event_type: String,
    pub message_body: serde_json::Value,
    pub status: InboxStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub locked_at: Option<Instant>,
    pub locked_by: Option<String>,
}

#[derive(Default)]
pub struct MemoryEventStore {
    outbox: Mutex<HashMap<(String, String), MemoryOutboxRow>>,
    inbox: Mutex<HashMap<(String, String), MemoryInboxRow>>,
    traces: Mutex<HashMap<String, Vec<String>>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outbox_row(&self, message_id: &str, producer_service: &str) -> Option<MemoryOutboxRow> {
        self.outbox
            .lock()
            .get(&(message_id.to_string(), producer_service.to_string()))
            .cloned()
    }

    pub fn inbox_row(&self, message_id: &str, consumer_service: &str) -> Option<MemoryInboxRow> {
        self.inbox
            .lock()
            .get(&(message_id.to_string(), consumer_service.to_string()))
            .cloned()
    }

    pub fn trace_parents(&self, message_id: &str) -> Option<Vec<String>> {
        self.traces.lock().get(message_id).cloned()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn exists_in_outbox(&self, message_id: &str, producer_service: &str) -> bool {
        self.outbox
            .lock()
            .contains_key(&(message_id.to_string(), producer_service.to_string()))
    }

    async fn insert_outbox(&self, row: OutboxInsert<'_>) -> Result<bool> {
        let mut outbox = self.outbox.lock();
        let key = (row.message_id.to_string(), row.producer_service.to_string());
        if outbox.contains_key(&key) {
            return Ok(false);
        }
        outbox.insert(
            key,
            MemoryOutboxRow {
                producer_service: row.producer_service.to_string(),
                event_type: row.event_type.to_string(),
                message_body: row.message_body,
                status: OutboxStatus::Processing,
                last_error: None,
            },
        );
        Ok(true)
    }

    async fn mark_published(&self, message_id: &str) -> bool {
        let mut outbox = self.outbox.lock();
        let mut updated = false;
        for ((id, _), row) in outbox.iter_mut() {
            if id == message_id {
                row.status = OutboxStatus::Published;
                row.last_error = None;
                updated = true;
            }
        }
        updated
    }

    async fn mark_pending(&self, message_id: &str, error_message: &str) -> bool {
        let mut outbox = self.outbox.lock();
        let mut updated = false;
        for ((id, _), row) in outbox.iter_mut() {
            if id == message_id {
                row.status = OutboxStatus::Pending;
                row.last_error = Some(error_message.to_string());
                updated = true;
            }
        }
        updated
    }

    async fn exists_in_inbox(&self, message_id: &str, consumer_service: &str) -> bool {
        self.inbox
            .lock()
            .contains_key(&(message_id.to_string(), consumer_service.to_string()))
    }

    async fn exists_in_inbox_processed(&self, message_id: &str, consumer_service: &str) -> bool {
        self.inbox
            .lock()
            .get(&(message_id.to_string(), consumer_service.to_string()))
            .map(|row| row.status == InboxStatus::Processed)
            .unwrap_or(false)
    }

    async fn insert_inbox(&self, row: InboxInsert<'_>) -> Result<bool> {
        let mut inbox = self.inbox.lock();
        let key = (row.message_id.to_string(), row.consumer_service.to_string());
        if inbox.contains_key(&key) {
            return Ok(false);
        }
        inbox.insert(
            key,
            MemoryInboxRow {
                consumer_service: row.consumer_service.to_string(),
                producer_service: row.producer_service.to_string(),
                event_type: row.event_type.to_string(),
                message_body: row.message_body,
                status: InboxStatus::Processing,
                retry_count: row.retry_count,
                last_error: None,
                locked_at: Some(Instant::now()),
                locked_by: Some(row.worker_id.to_string()),
            },
        );
        Ok(true)
    }

    async fn try_claim_inbox(
        &self,
        message_id: &str,
        consumer_service: &str,
        worker_id: &str,
        stale_threshold: Duration,
    ) -> Result<bool> {
        let mut inbox = self.inbox.lock();
        let key = (message_id.to_string(), consumer_service.to_string());
        let Some(row) = inbox.get_mut(&key) else {
            return Ok(false);
        };
        if row.status != InboxStatus::Processing {
            return Ok(false);
        }
        let claimable = match row.locked_at {
            None => true,
            Some(locked_at) => locked_at.elapsed() > stale_threshold,
        };
        if !claimable {
            return Ok(false);
        }
        row.locked_at = Some(Instant::now());
        row.locked_by = Some(worker_id.to_string());
        row.retry_count += 1;
        Ok(true)
    }

    async fn mark_inbox_processed(&self, message_id: &str, consumer_service: &str) -> bool {
        let mut inbox = self.inbox.lock();
        let key = (message_id.to_string(), consumer_service.to_string());
        match inbox.get_mut(&key) {
            Some(row) => {
                row.status = InboxStatus::Processed;
                true
            }
            None => false,
        }
    }

    async fn mark_inbox_failed(
        &self,
        message_id: &str,
        consumer_service: &str,
        error_message: &str,
    ) -> bool {
        let mut inbox = self.inbox.lock();
        let key = (message_id.to_string(), consumer_service.to_string());
        match inbox.get_mut(&key) {
            Some(row) => {
                row.status = InboxStatus::Failed;
                row.last_error = Some(error_message.to_string());
                true
            }
            None => false,
        }
    }

    async fn update_inbox_retry_count(
        &self,
        message_id: &str,
        consumer_service: &str,
        retry_count: u32,
    ) -> bool {
        let mut inbox = self.inbox.lock();
        let key = (message_id.to_string(), consumer_service.to_string());
        match inbox.get_mut(&key) {
            Some(row) => {
                row.retry_count = retry_count;
                row.locked_at = None;
                row.locked_by = None;
                true
            }
            None => false,
        }
    }

    async fn insert_event_trace(&self, message_id: &str, parent_ids: &[String]) -> bool {
        self.traces
            .lock()
            .entry(message_id.to_string())
            .or_insert_with(|| parent_ids.to_vec());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn inbox_row<'a>(message_id: &'a str, worker_id: &'a str) -> InboxInsert<'a> {
        InboxInsert {
            message_id,
            consumer_service: "orders",
            producer_service: "demo.billing",
            event_type: "invoice.paid",
            message_body: json!({}),
            retry_count: 1,
            worker_id,
        }
    }

    #[tokio::test]
    async fn duplicate_outbox_insert_is_skipped() {
        let store = MemoryEventStore::new();
        let row = OutboxInsert {
            message_id: "m-1",
            producer_service: "orders",
            event_type: "order.created",
            message_body: json!({}),
            partition_key: None,
        };
        assert!(store.insert_outbox(row.clone()).await.unwrap());
        assert!(!store.insert_outbox(row).await.unwrap());
    }

    #[tokio::test]
    async fn fresh_lock_is_not_claimable() {
        let store = MemoryEventStore::new();
        store.insert_inbox(inbox_row("m-9", "worker-a")).await.unwrap();
        assert!(!store
            .try_claim_inbox("m-9", "orders", "worker-b", Duration::from_secs(300))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn stale_lock_is_claimed_and_retry_count_incremented() {
        let store = MemoryEventStore::new();
        store.insert_inbox(inbox_row("m-9", "worker-a")).await.unwrap();
        assert!(store
            .try_claim_inbox("m-9", "orders", "worker-b", Duration::ZERO)
            .await
            .unwrap());

        let row = store.inbox_row("m-9", "orders").unwrap();
        assert_eq!(row.locked_by.as_deref(), Some("worker-b"));
        assert_eq!(row.retry_count, 2);
    }

    #[tokio::test]
    async fn released_lock_is_claimable_without_staleness() {
        let store = MemoryEventStore::new();
        store.insert_inbox(inbox_row("m-9", "worker-a")).await.unwrap();
        assert!(store.update_inbox_retry_count("m-9", "orders", 2).await);
        assert!(store
            .try_claim_inbox("m-9", "orders", "worker-a", Duration::from_secs(300))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn terminal_rows_are_never_claimed() {
        let store = MemoryEventStore::new();
        store.insert_inbox(inbox_row("m-1", "worker-a")).await.unwrap();
        store.mark_inbox_processed("m-1", "orders").await;
        assert!(!store
            .try_claim_inbox("m-1", "orders", "worker-b", Duration::ZERO)
            .await
            .unwrap());

        store.insert_inbox(inbox_row("m-2", "worker-a")).await.unwrap();
        store.mark_inbox_failed("m-2", "orders", "boom").await;
        assert!(!store
            .try_claim_inbox("m-2", "orders", "worker-b", Duration::ZERO)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn trace_inserts_keep_the_first_chain() {
        let store = MemoryEventStore::new();
        assert!(store.insert_event_trace("m-3", &["m-1".into()]).await);
        assert!(store.insert_event_trace("m-3", &["m-2".into()]).await);
        assert_eq!(store.trace_parents("m-3").unwrap(), vec!["m-1".to_string()]);
    }
}
