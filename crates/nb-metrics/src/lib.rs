//! Fire-and-forget StatsD metrics over UDP.
//!
//! Every emission is best-effort: transport problems are discarded, never
//! surfaced to callers. When disabled, no socket exists and no network
//! work happens. Tag values must come from bounded sets (event names,
//! service names, enum tags); per-message ids are forbidden by contract.

use std::collections::HashMap;
use std::net::UdpSocket;
use std::time::Instant;

use cadence::prelude::*;
use cadence::{MetricBuilder, Metric, StatsdClient, UdpMetricSink};
use nb_config::MetricsConfig;
use parking_lot::Mutex;
use tracing::warn;

/// Tag pairs attached to a single emission.
pub type Tags<'a> = &'a [(&'a str, &'a str)];

/// StatsD client wrapper with the runtime's default tags
/// (`nano_service_name`, `env`) baked in.
pub struct Metrics {
    client: Option<StatsdClient>,
    timers: Mutex<HashMap<String, Instant>>,
}

impl Metrics {
    /// Build from config. Any socket or resolution failure degrades to the
    /// disabled sink with a warning; metrics never block startup.
    pub fn new(config: &MetricsConfig, service_name: &str) -> Self {
        if !config.enabled {
            return Self::disabled();
        }

        let client = Self::connect(config, service_name);
        if client.is_none() {
            warn!(
                host = %config.host,
                port = config.port,
                "statsd sink unavailable, metrics disabled"
            );
        }
        Self {
            client,
            timers: Mutex::new(HashMap::new()),
        }
    }

    /// A sink that drops everything.
    pub fn disabled() -> Self {
        Self {
            client: None,
            timers: Mutex::new(HashMap::new()),
        }
    }

    fn connect(config: &MetricsConfig, service_name: &str) -> Option<StatsdClient> {
        let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
        socket.set_nonblocking(true).ok()?;
        let sink = UdpMetricSink::from((config.host.as_str(), config.port), socket).ok()?;
        Some(Self::build_client(sink, &config.namespace, service_name, &config.env))
    }

    fn build_client<S>(sink: S, namespace: &str, service_name: &str, env: &str) -> StatsdClient
    where
        S: cadence::MetricSink + Send + Sync + std::panic::RefUnwindSafe + 'static,
    {
        StatsdClient::builder(namespace, sink)
            .with_tag("nano_service_name", service_name)
            .with_tag("env", env)
            .with_error_handler(|_| {})
            .build()
    }

    pub fn is_enabled(&self) -> bool {
        self.client.is_some()
    }

    pub fn incr(&self, name: &str) {
        self.incr_with_tags(name, &[]);
    }

    pub fn incr_with_tags(&self, name: &str, tags: Tags<'_>) {
        self.incr_by_with_tags(name, 1, tags);
    }

    pub fn incr_by_with_tags(&self, name: &str, delta: i64, tags: Tags<'_>) {
        if let Some(client) = &self.client {
            send(client.count_with_tags(name, delta), tags);
        }
    }

    pub fn decr(&self, name: &str) {
        self.incr_by_with_tags(name, -1, &[]);
    }

    pub fn gauge(&self, name: &str, value: u64) {
        self.gauge_with_tags(name, value, &[]);
    }

    pub fn gauge_with_tags(&self, name: &str, value: u64, tags: Tags<'_>) {
        if let Some(client) = &self.client {
            send(client.gauge_with_tags(name, value), tags);
        }
    }

    pub fn timing(&self, name: &str, millis: u64) {
        self.timing_with_tags(name, millis, &[]);
    }

    pub fn timing_with_tags(&self, name: &str, millis: u64, tags: Tags<'_>) {
        if let Some(client) = &self.client {
            send(client.time_with_tags(name, millis), tags);
        }
    }

    pub fn set(&self, name: &str, value: i64) {
        self.set_with_tags(name, value, &[]);
    }

    pub fn set_with_tags(&self, name: &str, value: i64, tags: Tags<'_>) {
        if let Some(client) = &self.client {
            send(client.set_with_tags(name, value), tags);
        }
    }

    pub fn histogram(&self, name: &str, value: u64) {
        self.histogram_with_tags(name, value, &[]);
    }

    pub fn histogram_with_tags(&self, name: &str, value: u64, tags: Tags<'_>) {
        if let Some(client) = &self.client {
            send(client.histogram_with_tags(name, value), tags);
        }
    }

    /// Start a named stopwatch. A second start under the same key restarts
    /// the measurement.
    pub fn start_timer(&self, key: &str) {
        self.timers.lock().insert(key.to_string(), Instant::now());
    }

    /// Stop a named stopwatch and return elapsed milliseconds, or `None`
    /// when the key was never started.
    pub fn end_timer(&self, key: &str) -> Option<u64> {
        let started = self.timers.lock().remove(key)?;
        Some(started.elapsed().as_millis() as u64)
    }
}

fn send<'a, T: Metric + From<String>>(builder: MetricBuilder<'a, '_, T>, tags: Tags<'a>) {
    let mut builder = builder;
    for (key, value) in tags {
        builder = builder.with_tag(key, value);
    }
    let _ = builder.try_send();
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence::SpyMetricSink;

    fn metrics_over(sink: SpyMetricSink) -> Metrics {
        Metrics {
            client: Some(Metrics::build_client(sink, "nanobus", "orders", "test")),
            timers: Mutex::new(HashMap::new()),
        }
    }

    #[test]
    fn disabled_sink_is_inert() {
        let metrics = Metrics::disabled();
        assert!(!metrics.is_enabled());
        metrics.incr("rmq_publish_total");
        metrics.gauge("rmq_connection_active", 1);
        metrics.timing("rmq_publish_duration_ms", 12);
    }

    #[test]
    fn counters_carry_default_tags() {
        let (rx, sink) = SpyMetricSink::new();
        let metrics = metrics_over(sink);
        metrics.incr("rmq_publish_total");

        let line = String::from_utf8(rx.try_recv().unwrap()).unwrap();
        assert!(line.starts_with("nanobus.rmq_publish_total:1|c"));
        assert!(line.contains("nano_service_name:orders"));
        assert!(line.contains("env:test"));
    }

    #[test]
    fn call_site_tags_are_appended() {
        let (rx, sink) = SpyMetricSink::new();
        let metrics = metrics_over(sink);
        metrics.incr_with_tags("rmq_publish_error_total", &[("error_type", "timeout")]);

        let line = String::from_utf8(rx.try_recv().unwrap()).unwrap();
        assert!(line.contains("error_type:timeout"));
    }

    #[test]
    fn gauge_timing_set_histogram_emit_their_kinds() {
        let (rx, sink) = SpyMetricSink::new();
        let metrics = metrics_over(sink);
        metrics.gauge("rmq_connection_active", 1);
        metrics.timing("rmq_publish_duration_ms", 42);
        metrics.set("unique_publishers", 7);
        metrics.histogram("rmq_payload_bytes", 512);

        let lines: Vec<String> = rx
            .try_iter()
            .map(|bytes| String::from_utf8(bytes).unwrap())
            .collect();
        assert!(lines[0].contains("|g"));
        assert!(lines[1].contains("|ms"));
        assert!(lines[2].contains("|s"));
        assert!(lines[3].contains("|h"));
    }

    #[test]
    fn decrement_sends_negative_count() {
        let (rx, sink) = SpyMetricSink::new();
        let metrics = metrics_over(sink);
        metrics.decr("rmq_connection_active");
        let line = String::from_utf8(rx.try_recv().unwrap()).unwrap();
        assert!(line.contains(":-1|c"));
    }

    #[test]
    fn timer_returns_elapsed_and_clears() {
        let metrics = Metrics::disabled();
        metrics.start_timer("delivery");
        assert!(metrics.end_timer("delivery").is_some());
        assert_eq!(metrics.end_timer("delivery"), None);
    }

    #[test]
    fn timer_unknown_key_is_none() {
        let metrics = Metrics::disabled();
        assert_eq!(metrics.end_timer("never-started"), None);
    }
}
