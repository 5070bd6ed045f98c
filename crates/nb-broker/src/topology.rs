//! Per-service broker topology.
//!
//! For project `P` and service `S`:
//! - topic exchange `P.bus` (central, all publishers emit here)
//! - queue `P.S` with `x-dead-letter-exchange = P.S.failed`
//! - delayed-message exchange `P.S` (plugin type, `x-delayed-type=topic`)
//! - queue `P.S.failed`
//! - binding `P.S` (exchange) → `P.S` (queue) with routing key `#`
//! - one `P.bus` → `P.S` binding per subscribed pattern
//!
//! All verbs are idempotent so the graph can be redeclared after every
//! reconnect.

use lapin::options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{Channel, ExchangeKind};
use nb_common::{ExchangeName, QueueName};
use nb_config::BrokerConfig;
use tracing::debug;

use crate::Result;

pub const DELAYED_EXCHANGE_TYPE: &str = "x-delayed-message";

#[derive(Debug, Clone)]
pub struct Topology {
    bus_exchange: ExchangeName,
    delayed_exchange: ExchangeName,
    main_queue: QueueName,
    failed_queue: QueueName,
}

impl Topology {
    pub fn for_service(config: &BrokerConfig) -> Self {
        Self {
            bus_exchange: config.bus_exchange(),
            delayed_exchange: config.delayed_exchange(),
            main_queue: config.main_queue(),
            failed_queue: config.failed_queue(),
        }
    }

    pub fn bus_exchange(&self) -> &ExchangeName {
        &self.bus_exchange
    }

    pub fn delayed_exchange(&self) -> &ExchangeName {
        &self.delayed_exchange
    }

    pub fn main_queue(&self) -> &QueueName {
        &self.main_queue
    }

    pub fn failed_queue(&self) -> &QueueName {
        &self.failed_queue
    }

    /// Declare the full exchange/queue graph.
    pub async fn declare(&self, channel: &Channel) -> Result<()> {
        let durable = ExchangeDeclareOptions {
            durable: true,
            ..Default::default()
        };

        channel
            .exchange_declare(
                self.bus_exchange.as_str(),
                ExchangeKind::Topic,
                durable,
                FieldTable::default(),
            )
            .await?;

        let mut main_args = FieldTable::default();
        main_args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(self.failed_queue.as_str().into()),
        );
        channel
            .queue_declare(
                self.main_queue.as_str(),
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                main_args,
            )
            .await?;

        let mut delayed_args = FieldTable::default();
        delayed_args.insert("x-delayed-type".into(), AMQPValue::LongString("topic".into()));
        channel
            .exchange_declare(
                self.delayed_exchange.as_str(),
                ExchangeKind::Custom(DELAYED_EXCHANGE_TYPE.to_string()),
                durable,
                delayed_args,
            )
            .await?;

        channel
            .queue_declare(
                self.failed_queue.as_str(),
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        // Retries flow from the service's own delayed exchange back into
        // its main queue, whatever the routing key.
        channel
            .queue_bind(
                self.main_queue.as_str(),
                self.delayed_exchange.as_str(),
                "#",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        debug!(
            bus = %self.bus_exchange,
            queue = %self.main_queue,
            failed = %self.failed_queue,
            "topology declared"
        );
        Ok(())
    }

    /// Bind the main queue to the bus for each subscribed pattern.
    pub async fn bind_events<S: AsRef<str>>(&self, channel: &Channel, patterns: &[S]) -> Result<()> {
        for pattern in patterns {
            channel
                .queue_bind(
                    self.main_queue.as_str(),
                    self.bus_exchange.as_str(),
                    pattern.as_ref(),
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
            debug!(pattern = pattern.as_ref(), queue = %self.main_queue, "event bound");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config() -> BrokerConfig {
        let env: HashMap<&str, &str> = HashMap::from([
            ("AMQP_HOST", "localhost"),
            ("AMQP_PORT", "5672"),
            ("AMQP_USER", "guest"),
            ("AMQP_PASS", "guest"),
            ("AMQP_VHOST", "/"),
            ("AMQP_PROJECT", "demo"),
            ("AMQP_MICROSERVICE_NAME", "orders"),
        ]);
        BrokerConfig::from_lookup(&move |key: &str| env.get(key).map(|v| v.to_string())).unwrap()
    }

    #[test]
    fn names_follow_the_namespace() {
        let topology = Topology::for_service(&config());

        assert_eq!(topology.bus_exchange().as_str(), "demo.bus");
        assert_eq!(topology.main_queue().as_str(), "demo.orders");
        assert_eq!(topology.delayed_exchange().as_str(), "demo.orders");
        assert_eq!(topology.failed_queue().as_str(), "demo.orders.failed");
    }

    #[test]
    fn delayed_exchange_and_main_queue_are_distinct_resources() {
        let topology = Topology::for_service(&config());
        // Same string, different types; the compiler keeps them apart.
        assert_eq!(
            topology.delayed_exchange().as_str(),
            topology.main_queue().as_str()
        );
    }
}
