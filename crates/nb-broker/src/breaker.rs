//! Outage-mode circuit breaker.
//!
//! Long-running loops call [`CircuitBreaker::ensure_connection_or_sleep`]
//! at the top of every iteration. While the broker is unreachable the
//! loop idles instead of hammering the broker and the database.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::pool::BrokerPool;

type EnterCallback = Box<dyn Fn(u64) + Send + Sync>;
type ExitCallback = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
pub struct CircuitBreaker {
    outage: AtomicBool,
    on_enter: Mutex<Option<EnterCallback>>,
    on_exit: Mutex<Option<ExitCallback>>,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Callback invoked once on the healthy→outage transition, with the
    /// sleep duration in seconds.
    pub fn on_outage_enter(&self, callback: impl Fn(u64) + Send + Sync + 'static) {
        *self.on_enter.lock() = Some(Box::new(callback));
    }

    /// Callback invoked once on the outage→healthy transition.
    pub fn on_outage_exit(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self.on_exit.lock() = Some(Box::new(callback));
    }

    pub fn in_outage(&self) -> bool {
        self.outage.load(Ordering::SeqCst)
    }

    /// Probe broker health. Healthy: fire the exit callback if we were in
    /// an outage, return `true`. Unhealthy: fire the enter callback on the
    /// first failure, sleep, return `false`.
    pub async fn ensure_connection_or_sleep(&self, pool: &BrokerPool, sleep: Duration) -> bool {
        if pool.probe().await {
            if self.outage.swap(false, Ordering::SeqCst) {
                info!("broker outage over, resuming");
                if let Some(callback) = self.on_exit.lock().as_ref() {
                    callback();
                }
            }
            return true;
        }

        if !self.outage.swap(true, Ordering::SeqCst) {
            warn!(sleep_secs = sleep.as_secs(), "broker unreachable, entering outage mode");
            if let Some(callback) = self.on_enter.lock().as_ref() {
                callback(sleep.as_secs());
            }
        }
        tokio::time::sleep(sleep).await;
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nb_config::BrokerConfig;
    use nb_metrics::Metrics;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    /// Pool pointed at a port nothing listens on: dials fail immediately.
    fn dead_pool() -> BrokerPool {
        let env: HashMap<&str, &str> = HashMap::from([
            ("AMQP_HOST", "127.0.0.1"),
            ("AMQP_PORT", "1"),
            ("AMQP_USER", "guest"),
            ("AMQP_PASS", "guest"),
            ("AMQP_VHOST", "/"),
            ("AMQP_PROJECT", "demo"),
            ("AMQP_MICROSERVICE_NAME", "orders"),
        ]);
        let config =
            BrokerConfig::from_lookup(&move |key: &str| env.get(key).map(|v| v.to_string()))
                .unwrap();
        BrokerPool::new(config, Arc::new(Metrics::disabled()))
    }

    #[tokio::test]
    async fn unreachable_broker_enters_outage_once() {
        let pool = dead_pool();
        let breaker = CircuitBreaker::new();
        let entered = Arc::new(AtomicU32::new(0));
        let seen_sleep = Arc::new(AtomicU32::new(0));

        let entered_in_cb = entered.clone();
        let sleep_in_cb = seen_sleep.clone();
        breaker.on_outage_enter(move |sleep_secs| {
            entered_in_cb.fetch_add(1, Ordering::SeqCst);
            sleep_in_cb.store(sleep_secs as u32, Ordering::SeqCst);
        });

        let sleep = Duration::from_millis(10);
        assert!(!breaker.ensure_connection_or_sleep(&pool, sleep).await);
        assert!(!breaker.ensure_connection_or_sleep(&pool, sleep).await);

        assert!(breaker.in_outage());
        assert_eq!(entered.load(Ordering::SeqCst), 1, "enter fires once");
        assert_eq!(seen_sleep.load(Ordering::SeqCst), 0, "10ms rounds to 0s");
    }

    #[tokio::test]
    async fn exit_callback_waits_for_recovery() {
        let pool = dead_pool();
        let breaker = CircuitBreaker::new();
        let exited = Arc::new(AtomicU32::new(0));
        let exited_in_cb = exited.clone();
        breaker.on_outage_exit(move || {
            exited_in_cb.fetch_add(1, Ordering::SeqCst);
        });

        assert!(
            !breaker
                .ensure_connection_or_sleep(&pool, Duration::from_millis(5))
                .await
        );
        assert_eq!(exited.load(Ordering::SeqCst), 0);
    }
}
