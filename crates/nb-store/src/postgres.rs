//! PostgreSQL implementation of the event store.

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use tracing::{debug, info, warn};

use nb_config::BoxConfig;

use crate::error::{is_unique_violation, StoreError};
use crate::repository::{EventStore, InboxInsert, OutboxInsert};
use crate::retry::execute_with_retry;
use crate::Result;

pub struct PgEventStore {
    pool: PgPool,
    schema: String,
    trace_schema: String,
}

impl PgEventStore {
    /// Dial the box database. The pool is capped at a single connection:
    /// the worker loop uses it serially, and a broken connection is
    /// replaced on the next acquire.
    pub async fn connect(config: &BoxConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&config.dsn())
            .await?;
        info!(host = %config.host, db = %config.name, schema = %config.schema, "box store connected");
        Ok(Self::new(pool, &config.schema, &config.trace_schema))
    }

    pub fn new(pool: PgPool, schema: &str, trace_schema: &str) -> Self {
        Self {
            pool,
            schema: schema.to_string(),
            trace_schema: trace_schema.to_string(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn trace_schema(&self) -> &str {
        &self.trace_schema
    }

    fn outbox_table(&self) -> String {
        format!("{}.outbox", self.schema)
    }

    fn inbox_table(&self) -> String {
        format!("{}.inbox", self.schema)
    }

    fn trace_table(&self) -> String {
        format!("{}.event_trace", self.trace_schema)
    }

    /// Create schemas and tables when they do not exist yet. Meant for
    /// development and tests; production schemas are migrated externally.
    pub async fn init_schema(&self) -> Result<()> {
        let statements = [
            format!("CREATE SCHEMA IF NOT EXISTS {}", self.schema),
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {} (
                    id BIGSERIAL PRIMARY KEY,
                    producer_service TEXT NOT NULL,
                    event_type TEXT NOT NULL,
                    message_body JSONB NOT NULL,
                    partition_key TEXT,
                    message_id TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'processing',
                    last_error TEXT,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                    published_at TIMESTAMPTZ,
                    UNIQUE (message_id, producer_service)
                )
                "#,
                self.outbox_table()
            ),
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {} (
                    id BIGSERIAL PRIMARY KEY,
                    consumer_service TEXT NOT NULL,
                    producer_service TEXT NOT NULL,
                    event_type TEXT NOT NULL,
                    message_body JSONB NOT NULL,
                    message_id TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'processing',
                    retry_count INTEGER NOT NULL DEFAULT 1,
                    last_error TEXT,
                    locked_at TIMESTAMPTZ,
                    locked_by TEXT,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                    processed_at TIMESTAMPTZ,
                    UNIQUE (message_id, consumer_service)
                )
                "#,
                self.inbox_table()
            ),
            format!("CREATE SCHEMA IF NOT EXISTS {}", self.trace_schema),
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {} (
                    message_id TEXT PRIMARY KEY,
                    trace_ids TEXT[] NOT NULL DEFAULT '{{}}'
                )
                "#,
                self.trace_table()
            ),
        ];

        for statement in &statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn exists_in_outbox(&self, message_id: &str, producer_service: &str) -> bool {
        let query = format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE message_id = $1 AND producer_service = $2)",
            self.outbox_table()
        );
        let query = query.as_str();
        let pool = &self.pool;

        let result = execute_with_retry("outbox.exists", move || {
            sqlx::query_scalar::<_, bool>(&query)
                .bind(message_id)
                .bind(producer_service)
                .fetch_one(pool)
        })
        .await;

        match result {
            Ok(exists) => exists,
            Err(error) => {
                warn!(message_id, error = %error, "outbox existence check failed, failing open");
                false
            }
        }
    }

    async fn insert_outbox(&self, row: OutboxInsert<'_>) -> Result<bool> {
        let query = format!(
            "INSERT INTO {} \
             (message_id, producer_service, event_type, message_body, partition_key, status) \
             VALUES ($1, $2, $3, $4, $5, 'processing')",
            self.outbox_table()
        );
        let query = query.as_str();
        let pool = &self.pool;
        let OutboxInsert {
            message_id,
            producer_service,
            event_type,
            message_body,
            partition_key,
        } = row;
        let body = &message_body;

        let result = execute_with_retry("outbox.insert", move || {
            sqlx::query(&query)
                .bind(message_id)
                .bind(producer_service)
                .bind(event_type)
                .bind(body)
                .bind(partition_key)
                .execute(pool)
        })
        .await;

        match result {
            Ok(_) => Ok(true),
            Err(error) if is_unique_violation(&error) => {
                debug!(message_id, "outbox row already exists");
                Ok(false)
            }
            Err(error) => Err(StoreError::from(error)),
        }
    }

    async fn mark_published(&self, message_id: &str) -> bool {
        let query = format!(
            "UPDATE {} SET status = 'published', published_at = now(), last_error = NULL \
             WHERE message_id = $1",
            self.outbox_table()
        );
        let query = query.as_str();
        let pool = &self.pool;

        let result = execute_with_retry("outbox.mark_published", move || {
            sqlx::query(&query).bind(message_id).execute(pool)
        })
        .await;

        match result {
            Ok(done) => done.rows_affected() > 0,
            Err(error) => {
                warn!(message_id, error = %error, "failed to mark outbox row published");
                false
            }
        }
    }

    async fn mark_pending(&self, message_id: &str, error_message: &str) -> bool {
        let query = format!(
            "UPDATE {} SET status = 'pending', last_error = $2 WHERE message_id = $1",
            self.outbox_table()
        );
        let query = query.as_str();
        let pool = &self.pool;

        let result = execute_with_retry("outbox.mark_pending", move || {
            sqlx::query(&query)
                .bind(message_id)
                .bind(error_message)
                .execute(pool)
        })
        .await;

        match result {
            Ok(done) => done.rows_affected() > 0,
            Err(error) => {
                warn!(message_id, error = %error, "failed to mark outbox row pending");
                false
            }
        }
    }

    async fn exists_in_inbox(&self, message_id: &str, consumer_service: &str) -> bool {
        let query = format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE message_id = $1 AND consumer_service = $2)",
            self.inbox_table()
        );
        let query = query.as_str();
        let pool = &self.pool;

        let result = execute_with_retry("inbox.exists", move || {
            sqlx::query_scalar::<_, bool>(&query)
                .bind(message_id)
                .bind(consumer_service)
                .fetch_one(pool)
        })
        .await;

        match result {
            Ok(exists) => exists,
            Err(error) => {
                warn!(message_id, error = %error, "inbox existence check failed, failing open");
                false
            }
        }
    }

    async fn exists_in_inbox_processed(&self, message_id: &str, consumer_service: &str) -> bool {
        let query = format!(
            "SELECT EXISTS(SELECT 1 FROM {} \
             WHERE message_id = $1 AND consumer_service = $2 AND status = 'processed')",
            self.inbox_table()
        );
        let query = query.as_str();
        let pool = &self.pool;

        let result = execute_with_retry("inbox.exists_processed", move || {
            sqlx::query_scalar::<_, bool>(&query)
                .bind(message_id)
                .bind(consumer_service)
                .fetch_one(pool)
        })
        .await;

        match result {
            Ok(exists) => exists,
            Err(error) => {
                warn!(message_id, error = %error, "inbox processed check failed, failing open");
                false
            }
        }
    }

    async fn insert_inbox(&self, row: InboxInsert<'_>) -> Result<bool> {
        let query = format!(
            "INSERT INTO {} \
             (message_id, consumer_service, producer_service, event_type, message_body, \
              status, retry_count, locked_at, locked_by) \
             VALUES ($1, $2, $3, $4, $5, 'processing', $6, now(), $7)",
            self.inbox_table()
        );
        let query = query.as_str();
        let pool = &self.pool;
        let InboxInsert {
            message_id,
            consumer_service,
            producer_service,
            event_type,
            message_body,
            retry_count,
            worker_id,
        } = row;
        let body = &message_body;

        let result = execute_with_retry("inbox.insert", move || {
            sqlx::query(&query)
                .bind(message_id)
                .bind(consumer_service)
                .bind(producer_service)
                .bind(event_type)
                .bind(body)
                .bind(retry_count as i32)
                .bind(worker_id)
                .execute(pool)
        })
        .await;

        match result {
            Ok(_) => Ok(true),
            Err(error) if is_unique_violation(&error) => {
                debug!(message_id, "inbox row already exists");
                Ok(false)
            }
            Err(error) => Err(StoreError::from(error)),
        }
    }

    async fn try_claim_inbox(
        &self,
        message_id: &str,
        consumer_service: &str,
        worker_id: &str,
        stale_threshold: Duration,
    ) -> Result<bool> {
        let query = format!(
            "UPDATE {} SET locked_at = now(), locked_by = $1, retry_count = retry_count + 1 \
             WHERE message_id = $2 AND consumer_service = $3 AND status = 'processing' \
             AND (locked_at IS NULL OR locked_at < now() - make_interval(secs => $4))",
            self.inbox_table()
        );
        let query = query.as_str();
        let pool = &self.pool;
        let stale_secs = stale_threshold.as_secs_f64();

        let result = execute_with_retry("inbox.try_claim", move || {
            sqlx::query(&query)
                .bind(worker_id)
                .bind(message_id)
                .bind(consumer_service)
                .bind(stale_secs)
                .execute(pool)
        })
        .await?;

        let claimed = result.rows_affected() == 1;
        if claimed {
            debug!(message_id, worker_id, "claimed stale inbox lock");
        }
        Ok(claimed)
    }

    async fn mark_inbox_processed(&self, message_id: &str, consumer_service: &str) -> bool {
        let query = format!(
            "UPDATE {} SET status = 'processed', processed_at = now() \
             WHERE message_id = $1 AND consumer_service = $2",
            self.inbox_table()
        );
        let query = query.as_str();
        let pool = &self.pool;

        let result = execute_with_retry("inbox.mark_processed", move || {
            sqlx::query(&query)
                .bind(message_id)
                .bind(consumer_service)
                .execute(pool)
        })
        .await;

        match result {
            Ok(done) => done.rows_affected() > 0,
            Err(error) => {
                warn!(message_id, error = %error, "failed to mark inbox row processed");
                false
            }
        }
    }

    async fn mark_inbox_failed(
        &self,
        message_id: &str,
        consumer_service: &str,
        error_message: &str,
    ) -> bool {
        let query = format!(
            "UPDATE {} SET status = 'failed', last_error = $3 \
             WHERE message_id = $1 AND consumer_service = $2",
            self.inbox_table()
        );
        let query = query.as_str();
        let pool = &self.pool;

        let result = execute_with_retry("inbox.mark_failed", move || {
            sqlx::query(&query)
                .bind(message_id)
                .bind(consumer_service)
                .bind(error_message)
                .execute(pool)
        })
        .await;

        match result {
            Ok(done) => done.rows_affected() > 0,
            Err(error) => {
                warn!(message_id, error = %error, "failed to mark inbox row failed");
                false
            }
        }
    }

    async fn update_inbox_retry_count(
        &self,
        message_id: &str,
        consumer_service: &str,
        retry_count: u32,
    ) -> bool {
        let query = format!(
            "UPDATE {} SET retry_count = $3, locked_at = NULL, locked_by = NULL \
             WHERE message_id = $1 AND consumer_service = $2",
            self.inbox_table()
        );
        let query = query.as_str();
        let pool = &self.pool;

        let result = execute_with_retry("inbox.update_retry_count", move || {
            sqlx::query(&query)
                .bind(message_id)
                .bind(consumer_service)
                .bind(retry_count as i32)
                .execute(pool)
        })
        .await;

        match result {
            Ok(done) => done.rows_affected() > 0,
            Err(error) => {
                warn!(message_id, error = %error, "failed to update inbox retry count");
                false
            }
        }
    }

    async fn insert_event_trace(&self, message_id: &str, parent_ids: &[String]) -> bool {
        let query = format!(
            "INSERT INTO {} (message_id, trace_ids) VALUES ($1, $2)",
            self.trace_table()
        );
        let query = query.as_str();
        let pool = &self.pool;

        let result = execute_with_retry("trace.insert", move || {
            sqlx::query(&query)
                .bind(message_id)
                .bind(parent_ids)
                .execute(pool)
        })
        .await;

        match result {
            Ok(_) => true,
            Err(error) if is_unique_violation(&error) => {
                debug!(message_id, "event trace already recorded");
                true
            }
            Err(error) => {
                warn!(message_id, error = %error, "failed to insert event trace");
                false
            }
        }
    }
}
