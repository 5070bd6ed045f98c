//! System events: framework-level messages handled before any inbox or
//! callback machinery runs.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use nb_common::Envelope;
use tracing::{debug, info, warn};

pub type SystemHandler =
    Arc<dyn Fn(Envelope) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

pub const SYSTEM_PING: &str = "system.ping.1";

const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);

/// Registry of system-event handlers, keyed by routing key. The ping
/// handler is always present; services may register more.
pub struct SystemEvents {
    handlers: HashMap<String, SystemHandler>,
}

impl SystemEvents {
    pub fn new() -> Self {
        let mut registry = Self {
            handlers: HashMap::new(),
        };
        registry.register(SYSTEM_PING, |envelope| system_ping(envelope));
        registry
    }

    pub fn register<F, Fut>(&mut self, event: &str, handler: F)
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.handlers.insert(
            event.to_string(),
            Arc::new(move |envelope| Box::pin(handler(envelope))),
        );
    }

    pub fn handler(&self, event: &str) -> Option<SystemHandler> {
        self.handlers.get(event).cloned()
    }

    /// Routing keys to bind alongside the service's own subscriptions.
    pub fn event_names(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }
}

impl Default for SystemEvents {
    fn default() -> Self {
        Self::new()
    }
}

/// Answer a `system.ping.1` with an HTTP heartbeat. The URL is read per
/// invocation so operators can repoint it without restarting workers; a
/// missing URL is a quiet no-op.
async fn system_ping(envelope: Envelope) -> anyhow::Result<()> {
    let Some(url) = std::env::var("HEARTBEAT_URL").ok().filter(|url| !url.is_empty()) else {
        debug!(message_id = %envelope.message_id(), "ping received, no heartbeat url configured");
        return Ok(());
    };

    let client = reqwest::Client::builder()
        .timeout(HEARTBEAT_TIMEOUT)
        .build()?;
    match client.get(&url).send().await {
        Ok(response) => {
            info!(
                message_id = %envelope.message_id(),
                status = %response.status(),
                "heartbeat sent"
            );
        }
        Err(error) => {
            warn!(message_id = %envelope.message_id(), error = %error, "heartbeat failed");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_is_registered_by_default() {
        let registry = SystemEvents::new();
        assert!(registry.handler(SYSTEM_PING).is_some());
        assert!(registry.handler("order.created").is_none());
        assert_eq!(registry.event_names(), vec![SYSTEM_PING.to_string()]);
    }

    #[tokio::test]
    async fn custom_handlers_are_invokable() {
        let mut registry = SystemEvents::new();
        registry.register("system.drain.1", |_envelope| async { Ok(()) });

        let handler = registry.handler("system.drain.1").expect("registered");
        handler(Envelope::new()).await.expect("handler runs");
    }

    #[tokio::test]
    async fn ping_without_url_is_a_no_op() {
        // HEARTBEAT_URL is unset in the test environment.
        let registry = SystemEvents::new();
        let handler = registry.handler(SYSTEM_PING).unwrap();
        handler(Envelope::new()).await.expect("ping is quiet without a url");
    }
}
