//! Process-wide AMQP connection and channel pool.
//!
//! One connection and one channel per worker process. `channel()` hands
//! out clones of the single shared [`Channel`] handle; a clone refers to
//! the same broker channel, so the broker-side channel count stays at one
//! no matter how many publishers or consumers a process instantiates.

use std::sync::Arc;

use lapin::options::BasicPublishOptions;
use lapin::{Channel, Connection, ConnectionProperties};
use nb_common::{Envelope, ExchangeName};
use nb_config::BrokerConfig;
use nb_metrics::Metrics;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::BrokerError;
use crate::wire;
use crate::Result;

pub struct BrokerPool {
    config: BrokerConfig,
    metrics: Arc<Metrics>,
    connection: RwLock<Option<Connection>>,
    channel: RwLock<Option<Channel>>,
}

impl BrokerPool {
    pub fn new(config: BrokerConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            config,
            metrics,
            connection: RwLock::new(None),
            channel: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// The shared channel, dialing the broker and opening the channel on
    /// first use or after a reset. Callers never close what they get.
    pub async fn channel(&self) -> Result<Channel> {
        {
            let guard = self.channel.read().await;
            if let Some(channel) = guard.as_ref() {
                if channel.status().connected() {
                    return Ok(channel.clone());
                }
            }
        }

        let mut guard = self.channel.write().await;
        if let Some(channel) = guard.as_ref() {
            if channel.status().connected() {
                return Ok(channel.clone());
            }
        }

        let channel = self.open_channel().await?;
        *guard = Some(channel.clone());
        Ok(channel)
    }

    /// Dial connection and channel without handing anything out.
    pub async fn ensure_connected(&self) -> Result<()> {
        self.channel().await.map(|_| ())
    }

    /// Health probe: verifies the shared connection and channel are open,
    /// dialing fresh when needed. Heartbeats are negotiated from the URI
    /// and serviced by lapin's reactor; a missed heartbeat drives the
    /// connection state to error, which this probe observes. On failure
    /// the pool is reset so the next probe dials fresh.
    pub async fn probe(&self) -> bool {
        match self.ensure_connected().await {
            Ok(()) => true,
            Err(error) => {
                debug!(error = %error, "broker probe failed");
                self.reset().await;
                false
            }
        }
    }

    /// Close channel then connection, suppressing errors, and null both so
    /// the next obtain dials fresh.
    pub async fn reset(&self) {
        let mut channel_guard = self.channel.write().await;
        if let Some(channel) = channel_guard.take() {
            let _ = channel.close(200, "reset").await;
            self.metrics.gauge("rmq_channel_active", 0);
        }
        drop(channel_guard);

        let mut connection_guard = self.connection.write().await;
        if let Some(connection) = connection_guard.take() {
            let _ = connection.close(200, "reset").await;
            self.metrics.gauge("rmq_connection_active", 0);
        }
        info!("broker pool reset");
    }

    /// Publish an envelope. Connection, channel and timeout failures reset
    /// the pool before the error is returned, so the next publish dials
    /// fresh.
    pub async fn publish(
        &self,
        exchange: &ExchangeName,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<()> {
        let result = self.publish_inner(exchange, routing_key, envelope).await;
        if let Err(error) = &result {
            if error.publish_kind().requires_reset() {
                warn!(
                    error = %error,
                    exchange = %exchange,
                    routing_key,
                    "publish failed, resetting broker pool"
                );
                self.reset().await;
            }
        }
        result
    }

    async fn publish_inner(
        &self,
        exchange: &ExchangeName,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<()> {
        let body = envelope.to_bytes()?;
        let channel = self.channel().await?;

        channel
            .basic_publish(
                exchange.as_str(),
                routing_key,
                BasicPublishOptions::default(),
                &body,
                wire::wire_properties(envelope),
            )
            .await?
            .await?;

        debug!(
            message_id = %envelope.message_id(),
            exchange = %exchange,
            routing_key,
            bytes = body.len(),
            "published"
        );
        Ok(())
    }

    async fn open_channel(&self) -> Result<Channel> {
        let mut guard = self.connection.write().await;

        let connected = matches!(guard.as_ref(), Some(c) if c.status().connected());
        if !connected {
            *guard = None;
            let connection = Connection::connect(
                &self.config.amqp_uri(),
                ConnectionProperties::default()
                    .with_connection_name(self.config.app_id().into()),
            )
            .await
            .map_err(|error| {
                let wrapped = BrokerError::from(error);
                self.metrics.incr_with_tags(
                    "rmq_connection_errors_total",
                    &[("error_type", wrapped.publish_kind().as_tag())],
                );
                wrapped
            })?;

            self.metrics.incr("rmq_connection_total");
            self.metrics.gauge("rmq_connection_active", 1);
            info!(host = %self.config.host, port = self.config.port, "broker connection opened");
            *guard = Some(connection);
        }

        let connection = match guard.as_ref() {
            Some(connection) => connection,
            None => return Err(BrokerError::Config("connection unavailable".into())),
        };

        let channel = connection.create_channel().await.map_err(|error| {
            let wrapped = BrokerError::from(error);
            self.metrics.incr_with_tags(
                "rmq_channel_errors_total",
                &[("error_type", wrapped.publish_kind().as_tag())],
            );
            wrapped
        })?;

        self.metrics.incr("rmq_channel_total");
        self.metrics.gauge("rmq_channel_active", 1);
        debug!(id = channel.id(), "broker channel opened");
        Ok(channel)
    }
}
