//! Publisher pipeline: transactional-outbox publishing.
//!
//! An event is durably recorded in the outbox first, then handed to the
//! broker. When the broker is unavailable the row is left `pending` and
//! an external dispatcher re-ships it later, so `publish` returning at
//! all means the event will eventually reach the bus.

mod error;

pub use error::{PublisherError, PublisherErrorKind};

use std::sync::Arc;
use std::time::Instant;

use nb_broker::BrokerPool;
use nb_common::Envelope;
use nb_config::BrokerConfig;
use nb_metrics::Metrics;
use nb_store::{EventStore, OutboxInsert};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

/// Note recorded on outbox rows parked by the publisher kill switch.
const KILL_SWITCH_NOTE: &str = "direct publish disabled (AMQP_PUBLISHER_ENABLED=false)";

pub struct NanoPublisher {
    config: BrokerConfig,
    pool: Arc<BrokerPool>,
    store: Arc<dyn EventStore>,
    metrics: Arc<Metrics>,
    delay_ms: Option<i32>,
    meta: Map<String, Value>,
    partition_key: Option<String>,
}

impl NanoPublisher {
    pub fn new(
        config: BrokerConfig,
        pool: Arc<BrokerPool>,
        store: Arc<dyn EventStore>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            config,
            pool,
            store,
            metrics,
            delay_ms: None,
            meta: Map::new(),
            partition_key: None,
        }
    }

    /// Delay applied to every publish through this instance, delivered as
    /// an `x-delay` header to the delayed exchange plugin.
    pub fn delay(mut self, delay_ms: i32) -> Self {
        self.delay_ms = Some(delay_ms);
        self
    }

    /// Meta entries merged into every envelope published here.
    pub fn meta(mut self, meta: Map<String, Value>) -> Self {
        self.meta.extend(meta);
        self
    }

    pub fn partition_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = Some(key.into());
        self
    }

    /// Publish `envelope` as `event`.
    ///
    /// `Ok(true)`: the event is on the broker, or a previous publish of
    /// the same message id already settled it. `Ok(false)`: the event is
    /// durably recorded as `pending`; the dispatcher will ship it.
    /// Errors are validation failures and outbox-insert faults only.
    pub async fn publish(
        &self,
        event: &str,
        mut envelope: Envelope,
    ) -> Result<bool, PublisherError> {
        if let Err(error) = self.validate(event, &envelope) {
            self.metrics.incr_with_tags(
                "rmq_publisher_error_total",
                &[("error_type", PublisherErrorKind::Validation.as_tag())],
            );
            return Err(error);
        }

        envelope.set_event_type(event);
        envelope.set_app_id(self.config.app_id());
        envelope.set_delay_ms(self.delay_ms);
        if !self.meta.is_empty() {
            envelope.merge_meta(self.meta.clone());
        }

        let message_id = envelope.message_id().to_string();
        let producer_service = self.config.service.as_str();
        let body = serde_json::to_value(envelope.body()).unwrap_or(Value::Null);

        self.metrics
            .incr_with_tags("rmq_publish_total", &[("event_name", event)]);
        if let Ok(bytes) = envelope.to_bytes() {
            self.metrics.histogram_with_tags(
                "rmq_payload_bytes",
                bytes.len() as u64,
                &[("event_name", event)],
            );
        }

        // Idempotent skip: a previous publish attempt owns this id.
        if self.store.exists_in_outbox(&message_id, producer_service).await {
            debug!(message_id, event, "already in outbox, skipping");
            return Ok(true);
        }

        let inserted = self
            .store
            .insert_outbox(OutboxInsert {
                message_id: &message_id,
                producer_service,
                event_type: event,
                message_body: body,
                partition_key: self.partition_key.as_deref(),
            })
            .await
            .map_err(|error| {
                self.metrics.incr_with_tags(
                    "rmq_publisher_error_total",
                    &[("error_type", PublisherErrorKind::OutboxInsert.as_tag())],
                );
                PublisherError::from(error)
            })?;
        if !inserted {
            // Lost a race with another publisher holding the same id.
            debug!(message_id, event, "outbox row raced, skipping");
            return Ok(true);
        }

        if !self.store.insert_event_trace(&message_id, envelope.trace()).await {
            self.metrics.incr_with_tags(
                "rmq_publisher_error_total",
                &[("error_type", PublisherErrorKind::TraceInsert.as_tag())],
            );
        }

        if !self.config.publisher_enabled {
            info!(message_id, event, "publisher kill switch on, leaving row pending");
            self.mark_pending(&message_id, KILL_SWITCH_NOTE).await;
            return Ok(false);
        }

        let started = Instant::now();
        match self
            .pool
            .publish(&self.config.bus_exchange(), event, &envelope)
            .await
        {
            Ok(()) => {
                self.metrics
                    .incr_with_tags("rmq_publish_success_total", &[("event_name", event)]);
                self.metrics.timing_with_tags(
                    "rmq_publish_duration_ms",
                    started.elapsed().as_millis() as u64,
                    &[("event_name", event)],
                );
                if !self.store.mark_published(&message_id).await {
                    // The broker has the message; a missed status update
                    // must not fail the publish.
                    self.metrics.incr_with_tags(
                        "rmq_publisher_error_total",
                        &[("error_type", PublisherErrorKind::OutboxUpdate.as_tag())],
                    );
                }
                Ok(true)
            }
            Err(error) => {
                let kind = error.publish_kind();
                warn!(message_id, event, error = %error, "direct publish failed, row pending");
                self.metrics
                    .incr_with_tags("rmq_publish_error_total", &[("error_type", kind.as_tag())]);
                self.mark_pending(&message_id, &error.to_string()).await;
                Ok(false)
            }
        }
    }

    async fn mark_pending(&self, message_id: &str, note: &str) {
        if !self.store.mark_pending(message_id, note).await {
            self.metrics.incr_with_tags(
                "rmq_publisher_error_total",
                &[("error_type", PublisherErrorKind::OutboxUpdate.as_tag())],
            );
        }
    }

    fn validate(&self, event: &str, envelope: &Envelope) -> Result<(), PublisherError> {
        if event.trim().is_empty() {
            return Err(PublisherError::Validation("event name is empty".into()));
        }
        if envelope.message_id().is_empty() {
            return Err(PublisherError::Validation("message id is empty".into()));
        }
        Ok(())
    }
}
