//! The consume loop.
//!
//! Outer loop: circuit breaker, topology bootstrap, one blocking AMQP
//! consume session at a time. Broker faults reset the pool and reconnect;
//! they are never fatal. Per delivery: validate, short-circuit system
//! events, fast-path idempotency, atomic inbox claim, user callback, then
//! ack/retry/dead-letter with exactly one ack per delivery.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicQosOptions,
};
use lapin::types::FieldTable;
use nb_broker::{wire, BrokerPool, CircuitBreaker, Topology};
use nb_common::{worker_id, Envelope, ExchangeName};
use nb_config::{BrokerConfig, TuningConfig};
use nb_metrics::Metrics;
use nb_store::{EventStore, InboxInsert};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::backoff::{Backoff, RetryStatus};
use crate::error::ConsumerError;
use crate::memstat;
use crate::shutdown;
use crate::system::SystemEvents;
use crate::validator;

pub type EventCallback =
    Arc<dyn Fn(Envelope) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
pub type FailureObserver = Arc<dyn Fn(&Envelope, &anyhow::Error) + Send + Sync>;

/// Pause after an AMQP fault before redialing.
const AMQP_ERROR_SLEEP: Duration = Duration::from_secs(2);

enum SessionEnd {
    Shutdown,
    Reinit,
    StreamEnded,
}

enum Claim {
    Owned,
    AlreadyProcessed,
    LockedElsewhere,
}

pub struct NanoConsumer {
    config: BrokerConfig,
    tuning: TuningConfig,
    pool: Arc<BrokerPool>,
    store: Arc<dyn EventStore>,
    metrics: Arc<Metrics>,
    breaker: CircuitBreaker,
    topology: Topology,
    consumer_tag: String,
    patterns: Vec<String>,
    tries: u32,
    backoff: Backoff,
    outage_sleep: Duration,
    catch_observer: Option<FailureObserver>,
    failed_observer: Option<FailureObserver>,
    debug_callback: Option<EventCallback>,
    system: SystemEvents,
    worker_id: String,
    jobs_since_reinit: u64,
    topology_ready: bool,
    shutdown: Arc<AtomicBool>,
}

impl NanoConsumer {
    pub fn new(
        config: BrokerConfig,
        tuning: TuningConfig,
        pool: Arc<BrokerPool>,
        store: Arc<dyn EventStore>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let topology = Topology::for_service(&config);
        let outage_sleep = tuning.outage_sleep;
        Self {
            consumer_tag: config.service.clone(),
            config,
            tuning,
            pool,
            store,
            metrics,
            breaker: CircuitBreaker::new(),
            topology,
            patterns: Vec::new(),
            tries: 1,
            backoff: Backoff::default(),
            outage_sleep,
            catch_observer: None,
            failed_observer: None,
            debug_callback: None,
            system: SystemEvents::new(),
            worker_id: worker_id(),
            jobs_since_reinit: 0,
            topology_ready: false,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Routing-key patterns to subscribe on the bus exchange.
    pub fn events<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.patterns.extend(patterns.into_iter().map(Into::into));
        self
    }

    /// Total delivery attempts before a message is parked on the failed
    /// queue. Minimum 1.
    pub fn tries(mut self, tries: u32) -> Self {
        self.tries = tries.max(1);
        self
    }

    pub fn backoff(mut self, backoff: impl Into<Backoff>) -> Self {
        self.backoff = backoff.into();
        self
    }

    pub fn outage_sleep(mut self, sleep: Duration) -> Self {
        self.outage_sleep = sleep;
        self
    }

    /// Observer invoked on every retryable callback failure. Its own
    /// behavior can never affect the control flow.
    pub fn catch_handler(
        mut self,
        observer: impl Fn(&Envelope, &anyhow::Error) + Send + Sync + 'static,
    ) -> Self {
        self.catch_observer = Some(Arc::new(observer));
        self
    }

    /// Observer invoked when the retry budget is exhausted.
    pub fn failed_handler(
        mut self,
        observer: impl Fn(&Envelope, &anyhow::Error) + Send + Sync + 'static,
    ) -> Self {
        self.failed_observer = Some(Arc::new(observer));
        self
    }

    /// Callback used instead of the main one for envelopes flagged
    /// `system.is_debug`.
    pub fn debug_handler<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.debug_callback = Some(Arc::new(move |envelope| Box::pin(callback(envelope))));
        self
    }

    /// Register an additional system-event handler; its routing key is
    /// bound alongside the subscribed patterns.
    pub fn system_handler<F, Fut>(mut self, event: &str, handler: F) -> Self
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.system.register(event, handler);
        self
    }

    /// User callbacks for broker-outage transitions, on top of the
    /// built-in logging.
    pub fn outage_callbacks(
        self,
        on_enter: impl Fn(u64) + Send + Sync + 'static,
        on_exit: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        self.breaker.on_outage_enter(on_enter);
        self.breaker.on_outage_exit(on_exit);
        self
    }

    /// Run the consume loop until the process is told to shut down.
    pub async fn consume<F, Fut>(self, callback: F) -> anyhow::Result<()>
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let callback: EventCallback = Arc::new(move |envelope| Box::pin(callback(envelope)));
        self.run(callback).await
    }

    async fn run(mut self, callback: EventCallback) -> anyhow::Result<()> {
        shutdown::install(self.shutdown.clone());
        info!(
            queue = %self.topology.main_queue(),
            worker = %self.worker_id,
            tries = self.tries,
            "consumer starting"
        );

        loop {
            if self.shutdown_requested() {
                break;
            }
            if !self
                .breaker
                .ensure_connection_or_sleep(&self.pool, self.outage_sleep)
                .await
            {
                continue;
            }
            if self.shutdown_requested() {
                break;
            }

            match self.consume_session(&callback).await {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::Reinit) => {
                    self.reinitialize_connections().await;
                }
                Ok(SessionEnd::StreamEnded) => {
                    warn!("consumer stream ended, reconnecting");
                    self.pool.reset().await;
                    self.topology_ready = false;
                    tokio::time::sleep(AMQP_ERROR_SLEEP).await;
                }
                Err(consume_error) => {
                    self.metrics.incr_with_tags(
                        "rmq_consumer_error_total",
                        &[("error_type", consume_error.as_tag())],
                    );
                    match consume_error {
                        ConsumerError::Broker(_) | ConsumerError::Ack(_) => {
                            // Broker infrastructure fault: reset, redial,
                            // let the broker redeliver the unacked message.
                            error!(error = %consume_error, "consume loop error, resetting");
                            self.pool.reset().await;
                            self.topology_ready = false;
                            tokio::time::sleep(AMQP_ERROR_SLEEP).await;
                        }
                        fatal => {
                            // Not a broker fault. Exit nonzero and let the
                            // supervisor restart the worker; the delivery
                            // stays unacked and comes back.
                            error!(error = %fatal, "fatal consumer error, exiting");
                            self.pool.reset().await;
                            return Err(fatal.into());
                        }
                    }
                }
            }
        }

        // Channel first, then connection; errors suppressed.
        self.pool.reset().await;
        info!("consumer stopped");
        Ok(())
    }

    async fn consume_session(
        &mut self,
        callback: &EventCallback,
    ) -> Result<SessionEnd, ConsumerError> {
        let channel = self.pool.channel().await?;

        if !self.topology_ready {
            self.topology.declare(&channel).await?;
            let mut patterns = self.patterns.clone();
            patterns.extend(self.system.event_names());
            self.topology.bind_events(&channel, &patterns).await?;
            self.topology_ready = true;
        }

        // One unacked delivery per worker: fair dispatch across workers,
        // bounded per-worker memory.
        channel.basic_qos(1, BasicQosOptions::default()).await?;

        let mut deliveries = channel
            .basic_consume(
                self.topology.main_queue().as_str(),
                &self.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        info!(queue = %self.topology.main_queue(), tag = %self.consumer_tag, "consuming");

        while let Some(delivery) = deliveries.next().await {
            let delivery = delivery?;
            self.handle_delivery(delivery, callback).await?;

            if self.shutdown_requested() {
                let _ = channel
                    .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
                    .await;
                return Ok(SessionEnd::Shutdown);
            }
            if self.reinit_due() {
                let _ = channel
                    .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
                    .await;
                return Ok(SessionEnd::Reinit);
            }
        }
        Ok(SessionEnd::StreamEnded)
    }

    async fn handle_delivery(
        &mut self,
        delivery: Delivery,
        callback: &EventCallback,
    ) -> Result<(), ConsumerError> {
        if validator::validate(&delivery.properties, &delivery.data).is_err() {
            self.metrics.incr_with_tags(
                "rmq_consumer_error_total",
                &[("error_type", "validation_error")],
            );
            return self.ack(&delivery).await;
        }

        let properties = &delivery.properties;
        let message_id = short_string(properties.message_id());
        let event_type = short_string(properties.kind());
        let app_id = short_string(properties.app_id());
        let retry_header = wire::retry_count_header(properties);

        let envelope = match Envelope::from_parts(
            message_id.clone(),
            Some(event_type.clone()),
            Some(app_id),
            retry_header,
            &delivery.data,
        ) {
            Ok(envelope) => envelope,
            Err(parse_error) => {
                // Valid JSON, but not the envelope shape.
                warn!(message_id, error = %parse_error, "body does not fit the envelope shape");
                self.metrics.incr_with_tags(
                    "rmq_consumer_error_total",
                    &[("error_type", "validation_error")],
                );
                return self.ack(&delivery).await;
            }
        };

        if let Some(handler) = self.system.handler(&event_type) {
            if let Err(handler_error) = handler(envelope.clone()).await {
                warn!(event = %event_type, error = %handler_error, "system handler failed");
            }
            return self.ack(&delivery).await;
        }

        let tags = [("event_name", event_type.as_str())];
        self.metrics.incr_with_tags("event_started_count", &tags);
        self.metrics.histogram_with_tags(
            "rmq_consumer_payload_bytes",
            delivery.data.len() as u64,
            &tags,
        );

        let retry_count = retry_header + 1;
        let retry_status = RetryStatus::of(retry_count, self.tries);
        let started = Instant::now();
        let consumer_service = self.config.service.clone();

        if self
            .store
            .exists_in_inbox_processed(&message_id, &consumer_service)
            .await
        {
            debug!(message_id, "already processed, skipping duplicate");
            return self.ack(&delivery).await;
        }

        match self.claim(&envelope, &event_type, retry_count).await? {
            Claim::Owned => {}
            Claim::AlreadyProcessed => {
                debug!(message_id, "processed while we looked, skipping");
                return self.ack(&delivery).await;
            }
            Claim::LockedElsewhere => {
                debug!(message_id, "locked by another worker, skipping");
                return self.ack(&delivery).await;
            }
        }

        let runner: EventCallback = if envelope.is_debug() {
            self.debug_callback
                .clone()
                .unwrap_or_else(|| callback.clone())
        } else {
            callback.clone()
        };

        match runner(envelope.clone()).await {
            Ok(()) => {
                self.handle_success(&delivery, &message_id, &consumer_service, &event_type, retry_status, started)
                    .await
            }
            Err(callback_error) => {
                self.handle_failure(
                    &delivery,
                    envelope,
                    &event_type,
                    retry_count,
                    retry_status,
                    started,
                    callback_error,
                )
                .await
            }
        }
    }

    async fn claim(
        &self,
        envelope: &Envelope,
        event_type: &str,
        retry_count: u32,
    ) -> Result<Claim, ConsumerError> {
        let message_id = envelope.message_id();
        let consumer_service = self.config.service.as_str();

        let inserted = self
            .store
            .insert_inbox(InboxInsert {
                message_id,
                consumer_service,
                producer_service: envelope.app_id().unwrap_or(""),
                event_type,
                message_body: serde_json::to_value(envelope.body()).unwrap_or(Value::Null),
                retry_count,
                worker_id: &self.worker_id,
            })
            .await
            .map_err(|store_error| {
                self.metrics.incr_with_tags(
                    "rmq_consumer_error_total",
                    &[("error_type", "inbox_insert_error")],
                );
                ConsumerError::InboxInsert(store_error)
            })?;
        if inserted {
            return Ok(Claim::Owned);
        }

        if self
            .store
            .exists_in_inbox_processed(message_id, consumer_service)
            .await
        {
            return Ok(Claim::AlreadyProcessed);
        }

        let claimed = self
            .store
            .try_claim_inbox(
                message_id,
                consumer_service,
                &self.worker_id,
                self.tuning.lock_stale_threshold,
            )
            .await
            .map_err(|store_error| {
                self.metrics.incr_with_tags(
                    "rmq_consumer_error_total",
                    &[("error_type", "inbox_insert_error")],
                );
                ConsumerError::InboxClaim(store_error)
            })?;

        if claimed {
            Ok(Claim::Owned)
        } else {
            Ok(Claim::LockedElsewhere)
        }
    }

    async fn handle_success(
        &mut self,
        delivery: &Delivery,
        message_id: &str,
        consumer_service: &str,
        event_type: &str,
        retry_status: RetryStatus,
        started: Instant,
    ) -> Result<(), ConsumerError> {
        self.ack(delivery).await?;

        if !self
            .store
            .mark_inbox_processed(message_id, consumer_service)
            .await
        {
            self.metrics.incr_with_tags(
                "rmq_consumer_error_total",
                &[("error_type", "inbox_update_error")],
            );
        }

        self.metrics.timing_with_tags(
            "event_processed_duration",
            started.elapsed().as_millis() as u64,
            &[
                ("event_name", event_type),
                ("exit_status", "success"),
                ("retry", retry_status.as_tag()),
            ],
        );
        if let Some(peak) = memstat::peak_rss_bytes() {
            self.metrics.gauge_with_tags(
                "event_processed_memory_bytes",
                peak,
                &[("event_name", event_type)],
            );
            memstat::reset_peak_rss();
        }

        if self.tuning.connection_max_jobs > 0 {
            self.jobs_since_reinit += 1;
        }
        debug!(message_id, "processed");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_failure(
        &mut self,
        delivery: &Delivery,
        mut envelope: Envelope,
        event_type: &str,
        retry_count: u32,
        retry_status: RetryStatus,
        started: Instant,
        callback_error: anyhow::Error,
    ) -> Result<(), ConsumerError> {
        let message_id = envelope.message_id().to_string();
        let consumer_service = self.config.service.clone();
        self.metrics.incr_with_tags(
            "rmq_consumer_error_total",
            &[("error_type", "user_callback_error")],
        );

        if retry_count < self.tries {
            if let Some(observer) = &self.catch_observer {
                observer(&envelope, &callback_error);
            }

            let delay_ms = self.backoff.delay_ms(retry_count);
            envelope.set_retry_count(retry_count);
            envelope.set_delay_ms(Some(delay_ms));
            warn!(
                message_id = %message_id,
                retry_count,
                delay_ms,
                error = %callback_error,
                "callback failed, scheduling retry"
            );

            if let Err(publish_error) = self
                .pool
                .publish(self.topology.delayed_exchange(), event_type, &envelope)
                .await
            {
                self.metrics.incr_with_tags(
                    "rmq_consumer_error_total",
                    &[("error_type", "retry_republish_error")],
                );
                // No ack: the broker redelivers and idempotency takes over.
                return Err(ConsumerError::Broker(publish_error));
            }

            if !self
                .store
                .update_inbox_retry_count(&message_id, &consumer_service, retry_count + 1)
                .await
            {
                self.metrics.incr_with_tags(
                    "rmq_consumer_error_total",
                    &[("error_type", "inbox_update_error")],
                );
            }

            self.ack(delivery).await?;
            self.metrics.timing_with_tags(
                "event_processed_duration",
                started.elapsed().as_millis() as u64,
                &[
                    ("event_name", event_type),
                    ("exit_status", "failed"),
                    ("retry", retry_status.as_tag()),
                ],
            );
            return Ok(());
        }

        // Retry budget exhausted: park the message for operators.
        if let Some(observer) = &self.failed_observer {
            observer(&envelope, &callback_error);
        }
        self.metrics.incr_with_tags(
            "rmq_consumer_dlx_total",
            &[("reason", "max_retries_exceeded")],
        );

        envelope.set_consumer_error(callback_error.to_string());
        envelope.set_retry_count(retry_count);
        envelope.set_delay_ms(None);
        error!(
            message_id = %message_id,
            retry_count,
            error = %callback_error,
            "retries exhausted, routing to failed queue"
        );

        // The default exchange routes straight to the named queue.
        let default_exchange = ExchangeName::new("");
        if let Err(publish_error) = self
            .pool
            .publish(
                &default_exchange,
                self.topology.failed_queue().as_str(),
                &envelope,
            )
            .await
        {
            self.metrics.incr_with_tags(
                "rmq_consumer_error_total",
                &[("error_type", "dlx_publish_error")],
            );
            return Err(ConsumerError::Broker(publish_error));
        }

        self.ack(delivery).await?;

        if !self
            .store
            .mark_inbox_failed(&message_id, &consumer_service, &format!("{callback_error:#}"))
            .await
        {
            self.metrics.incr_with_tags(
                "rmq_consumer_error_total",
                &[("error_type", "inbox_update_error")],
            );
        }
        self.metrics.timing_with_tags(
            "event_processed_duration",
            started.elapsed().as_millis() as u64,
            &[
                ("event_name", event_type),
                ("exit_status", "failed"),
                ("retry", retry_status.as_tag()),
            ],
        );
        Ok(())
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), ConsumerError> {
        delivery
            .acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|ack_error| {
                self.metrics.incr("rmq_consumer_ack_failed_total");
                ConsumerError::Ack(ack_error)
            })
    }

    async fn reinitialize_connections(&mut self) {
        self.metrics.incr_with_tags(
            "rmq_consumer_connection_reinit_total",
            &[("reason", "max_jobs")],
        );
        let started = Instant::now();

        self.pool.reset().await;
        self.topology_ready = false;
        self.jobs_since_reinit = 0;

        self.metrics.timing(
            "rmq_consumer_connection_reinit_duration_ms",
            started.elapsed().as_millis() as u64,
        );
        info!(
            max_jobs = self.tuning.connection_max_jobs,
            "connections reinitialized"
        );
    }

    fn reinit_due(&self) -> bool {
        self.tuning.connection_max_jobs > 0
            && self.jobs_since_reinit >= self.tuning.connection_max_jobs
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

fn short_string(value: &Option<lapin::types::ShortString>) -> String {
    value
        .as_ref()
        .map(|value| value.as_str().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nb_store::MemoryEventStore;
    use std::collections::HashMap;

    fn consumer() -> NanoConsumer {
        let env: HashMap<&str, &str> = HashMap::from([
            ("AMQP_HOST", "localhost"),
            ("AMQP_PORT", "5672"),
            ("AMQP_USER", "guest"),
            ("AMQP_PASS", "guest"),
            ("AMQP_VHOST", "/"),
            ("AMQP_PROJECT", "demo"),
            ("AMQP_MICROSERVICE_NAME", "orders"),
        ]);
        let config =
            BrokerConfig::from_lookup(&move |key: &str| env.get(key).map(|v| v.to_string()))
                .unwrap();
        let tuning = TuningConfig::default();
        let pool = Arc::new(BrokerPool::new(config.clone(), Arc::new(Metrics::disabled())));
        NanoConsumer::new(
            config,
            tuning,
            pool,
            Arc::new(MemoryEventStore::new()),
            Arc::new(Metrics::disabled()),
        )
    }

    #[test]
    fn fluent_configuration_accumulates() {
        let consumer = consumer()
            .events(["order.*", "invoice.paid"])
            .tries(3)
            .backoff([1, 5, 60])
            .outage_sleep(Duration::from_secs(5));

        assert_eq!(consumer.patterns, vec!["order.*", "invoice.paid"]);
        assert_eq!(consumer.tries, 3);
        assert_eq!(consumer.backoff, Backoff::Schedule(vec![1, 5, 60]));
        assert_eq!(consumer.outage_sleep, Duration::from_secs(5));
    }

    #[test]
    fn tries_never_drop_below_one() {
        assert_eq!(consumer().tries(0).tries, 1);
    }

    #[test]
    fn consumer_tag_is_the_service_name() {
        assert_eq!(consumer().consumer_tag, "orders");
    }

    #[test]
    fn reinit_is_off_by_default() {
        let mut consumer = consumer();
        consumer.jobs_since_reinit = 10_000;
        assert!(!consumer.reinit_due());
    }

    #[test]
    fn reinit_triggers_at_the_job_threshold() {
        let mut consumer = consumer();
        consumer.tuning.connection_max_jobs = 100;
        consumer.jobs_since_reinit = 99;
        assert!(!consumer.reinit_due());
        consumer.jobs_since_reinit = 100;
        assert!(consumer.reinit_due());
    }
}
