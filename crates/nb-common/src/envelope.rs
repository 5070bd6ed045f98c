//! The message envelope.
//!
//! An envelope is a JSON object with exactly four top-level sections
//! (`meta`, `status`, `payload`, `system`) plus AMQP-visible identity that
//! never travels inside the body: `message_id`, `type` (the routing key),
//! `app_id`, and the retry/delay headers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Rendering used for `system.created_at`, millisecond precision.
pub const CREATED_AT_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

fn format_created_at(ts: DateTime<Utc>) -> String {
    ts.format(CREATED_AT_FORMAT).to_string()
}

/// Caller-set outcome code. Closed set; anything else is a decode error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusCode {
    Unknown,
    Success,
    Error,
}

impl StatusCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusCode::Unknown => "unknown",
            StatusCode::Success => "success",
            StatusCode::Error => "error",
        }
    }
}

/// The `status` section: outcome code plus free-form data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageStatus {
    pub code: StatusCode,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl Default for MessageStatus {
    fn default() -> Self {
        Self {
            code: StatusCode::Unknown,
            data: Map::new(),
        }
    }
}

/// The `system` section: runtime bookkeeping carried with the message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMeta {
    #[serde(default)]
    pub is_debug: bool,
    #[serde(default)]
    pub consumer_error: Option<String>,
    #[serde(default = "SystemMeta::created_at_now")]
    pub created_at: String,
    /// Ordered chain of ancestor message ids, oldest first.
    #[serde(default)]
    pub trace_id: Vec<String>,
}

impl SystemMeta {
    fn created_at_now() -> String {
        format_created_at(Utc::now())
    }
}

impl Default for SystemMeta {
    fn default() -> Self {
        Self {
            is_debug: false,
            consumer_error: None,
            created_at: Self::created_at_now(),
            trace_id: Vec::new(),
        }
    }
}

/// The wire body. Field order here is the serialized key order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeBody {
    #[serde(default)]
    pub meta: Map<String, Value>,
    #[serde(default)]
    pub status: MessageStatus,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(default)]
    pub system: SystemMeta,
}

/// A NanoBus message.
///
/// `message_id` is fixed at construction and never mutates. `type` and
/// `app_id` are stamped by the publisher just before the wire publish; on
/// the consumer side they arrive from the delivery properties.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    message_id: String,
    event_type: Option<String>,
    app_id: Option<String>,
    retry_count: u32,
    delay_ms: Option<i32>,
    body: EnvelopeBody,
}

impl Envelope {
    /// Fresh envelope with a time-sortable message id and the default body.
    pub fn new() -> Self {
        Self {
            message_id: Uuid::now_v7().to_string(),
            event_type: None,
            app_id: None,
            retry_count: 0,
            delay_ms: None,
            body: EnvelopeBody::default(),
        }
    }

    /// Fresh envelope carrying the given payload section.
    pub fn from_payload(payload: Map<String, Value>) -> Self {
        let mut envelope = Self::new();
        envelope.body.payload = payload;
        envelope
    }

    /// Construction-time id override. Publishing the same logical event
    /// twice with one id is what makes the outbox/inbox dedupe work.
    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = message_id.into();
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// Rebuild an envelope from delivery parts. An empty body yields the
    /// default sections; missing top-level keys default individually.
    pub fn from_parts(
        message_id: impl Into<String>,
        event_type: Option<String>,
        app_id: Option<String>,
        retry_count: u32,
        body: &[u8],
    ) -> serde_json::Result<Self> {
        let body = if body.is_empty() {
            EnvelopeBody::default()
        } else {
            serde_json::from_slice(body)?
        };
        Ok(Self {
            message_id: message_id.into(),
            event_type,
            app_id,
            retry_count,
            delay_ms: None,
            body,
        })
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn event_type(&self) -> Option<&str> {
        self.event_type.as_deref()
    }

    /// Stamped once by the publisher; the consumer reads it back from the
    /// delivery's `type` property.
    pub fn set_event_type(&mut self, event_type: impl Into<String>) {
        self.event_type = Some(event_type.into());
    }

    pub fn app_id(&self) -> Option<&str> {
        self.app_id.as_deref()
    }

    pub fn set_app_id(&mut self, app_id: impl Into<String>) {
        self.app_id = Some(app_id.into());
    }

    /// Value of the `x-retry-count` header this envelope was delivered (or
    /// will be republished) with.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn set_retry_count(&mut self, retry_count: u32) {
        self.retry_count = retry_count;
    }

    /// `x-delay` to request from the delayed exchange on the next publish.
    pub fn delay_ms(&self) -> Option<i32> {
        self.delay_ms
    }

    pub fn set_delay_ms(&mut self, delay_ms: Option<i32>) {
        self.delay_ms = delay_ms;
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.body.payload
    }

    pub fn payload_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.body.payload
    }

    pub fn meta(&self) -> &Map<String, Value> {
        &self.body.meta
    }

    /// Merge entries into `meta`; incoming keys win.
    pub fn merge_meta(&mut self, meta: Map<String, Value>) {
        self.body.meta.extend(meta);
    }

    pub fn status(&self) -> &MessageStatus {
        &self.body.status
    }

    pub fn set_status(&mut self, code: StatusCode, data: Map<String, Value>) {
        self.body.status = MessageStatus { code, data };
    }

    pub fn is_debug(&self) -> bool {
        self.body.system.is_debug
    }

    pub fn set_debug(&mut self, is_debug: bool) {
        self.body.system.is_debug = is_debug;
    }

    pub fn consumer_error(&self) -> Option<&str> {
        self.body.system.consumer_error.as_deref()
    }

    pub fn set_consumer_error(&mut self, error: impl Into<String>) {
        self.body.system.consumer_error = Some(error.into());
    }

    pub fn created_at(&self) -> &str {
        &self.body.system.created_at
    }

    /// Ancestor message ids, oldest first.
    pub fn trace(&self) -> &[String] {
        &self.body.system.trace_id
    }

    /// Extend this envelope's trace chain with the parent's chain plus the
    /// parent itself, building the hop history across causally related
    /// events.
    pub fn chain_from(&mut self, parent: &Envelope) {
        let mut trace = parent.body.system.trace_id.clone();
        trace.push(parent.message_id.clone());
        self.body.system.trace_id = trace;
    }

    pub fn body(&self) -> &EnvelopeBody {
        &self.body
    }

    /// Serialized wire body.
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&self.body)
    }
}

impl Default for Envelope {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload_of(pairs: &[(&str, &str)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect()
    }

    #[test]
    fn default_body_has_exactly_four_sections() {
        let envelope = Envelope::new();
        let body: Value = serde_json::from_slice(&envelope.to_bytes().unwrap()).unwrap();
        let object = body.as_object().unwrap();

        assert_eq!(object.len(), 4);
        for key in ["meta", "status", "payload", "system"] {
            assert!(object.contains_key(key), "missing section {key}");
        }
        assert_eq!(object["status"]["code"], json!("unknown"));
        assert_eq!(object["system"]["is_debug"], json!(false));
        assert_eq!(object["system"]["consumer_error"], Value::Null);
        assert_eq!(object["system"]["trace_id"], json!([]));
    }

    #[test]
    fn created_at_is_millisecond_precise() {
        let envelope = Envelope::new();
        // "YYYY-MM-DD HH:MM:SS.mmm" is 23 chars with one space separator.
        assert_eq!(envelope.created_at().len(), 23);
        assert_eq!(envelope.created_at().as_bytes()[10], b' ');
        chrono::NaiveDateTime::parse_from_str(envelope.created_at(), CREATED_AT_FORMAT)
            .expect("created_at must parse back");
    }

    #[test]
    fn message_ids_are_unique_and_sortable() {
        let a = Envelope::new();
        // UUIDv7 orders by millisecond timestamp; step past the current one.
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = Envelope::new();
        assert_ne!(a.message_id(), b.message_id());
        assert!(a.message_id() < b.message_id());
    }

    #[test]
    fn from_parts_defaults_missing_sections() {
        let envelope =
            Envelope::from_parts("m-1", Some("order.created".into()), None, 2, b"{\"payload\":{\"id\":\"o-1\"}}")
                .unwrap();

        assert_eq!(envelope.message_id(), "m-1");
        assert_eq!(envelope.retry_count(), 2);
        assert_eq!(envelope.payload()["id"], json!("o-1"));
        assert_eq!(envelope.status().code, StatusCode::Unknown);
        assert!(envelope.meta().is_empty());
        assert!(envelope.trace().is_empty());
    }

    #[test]
    fn from_parts_rejects_non_json_bodies() {
        assert!(Envelope::from_parts("m-1", None, None, 0, b"not json").is_err());
    }

    #[test]
    fn from_parts_accepts_empty_body() {
        let envelope = Envelope::from_parts("m-1", None, None, 0, b"").unwrap();
        assert_eq!(envelope.status().code, StatusCode::Unknown);
    }

    #[test]
    fn trace_chain_appends_parent_ids_in_order() {
        let grandparent = Envelope::new().with_message_id("m-1");
        let mut parent = Envelope::new().with_message_id("m-2");
        parent.chain_from(&grandparent);
        let mut child = Envelope::new().with_message_id("m-3");
        child.chain_from(&parent);

        assert_eq!(parent.trace(), ["m-1"]);
        assert_eq!(child.trace(), ["m-1", "m-2"]);
    }

    #[test]
    fn merge_meta_overwrites_existing_keys() {
        let mut envelope = Envelope::new();
        envelope.merge_meta(payload_of(&[("tenant", "acme"), ("env", "dev")]));
        envelope.merge_meta(payload_of(&[("env", "prod")]));

        assert_eq!(envelope.meta()["tenant"], json!("acme"));
        assert_eq!(envelope.meta()["env"], json!("prod"));
    }

    #[test]
    fn status_codes_round_trip_through_json() {
        let mut envelope = Envelope::new();
        envelope.set_status(StatusCode::Error, Map::new());
        let parsed = Envelope::from_parts("m", None, None, 0, &envelope.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed.status().code, StatusCode::Error);
    }

    #[test]
    fn consumer_error_round_trips() {
        let mut envelope = Envelope::new();
        envelope.set_consumer_error("callback blew up");
        let parsed = Envelope::from_parts("m", None, None, 0, &envelope.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed.consumer_error(), Some("callback blew up"));
    }
}
