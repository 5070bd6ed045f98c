//! Envelope ↔ AMQP wire mapping.

use lapin::types::{AMQPValue, FieldTable};
use lapin::BasicProperties;
use nb_common::Envelope;

pub const HEADER_DELAY: &str = "x-delay";
pub const HEADER_RETRY_COUNT: &str = "x-retry-count";

const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// AMQP properties for publishing an envelope: identity, persistence,
/// JSON content type, and the delay/retry headers when present.
pub fn wire_properties(envelope: &Envelope) -> BasicProperties {
    let mut headers = FieldTable::default();
    if let Some(delay_ms) = envelope.delay_ms() {
        headers.insert(HEADER_DELAY.into(), AMQPValue::LongInt(delay_ms));
    }
    if envelope.retry_count() > 0 {
        headers.insert(
            HEADER_RETRY_COUNT.into(),
            AMQPValue::LongInt(envelope.retry_count() as i32),
        );
    }

    let mut properties = BasicProperties::default()
        .with_message_id(envelope.message_id().into())
        .with_delivery_mode(DELIVERY_MODE_PERSISTENT)
        .with_content_type("application/json".into())
        .with_headers(headers);

    if let Some(event_type) = envelope.event_type() {
        properties = properties.with_kind(event_type.into());
    }
    if let Some(app_id) = envelope.app_id() {
        properties = properties.with_app_id(app_id.into());
    }
    properties
}

/// `x-retry-count` from delivery properties, zero when absent.
pub fn retry_count_header(properties: &BasicProperties) -> u32 {
    header_value(properties, HEADER_RETRY_COUNT)
        .and_then(header_u32)
        .unwrap_or(0)
}

fn header_value<'a>(properties: &'a BasicProperties, name: &str) -> Option<&'a AMQPValue> {
    properties
        .headers()
        .as_ref()?
        .inner()
        .iter()
        .find(|(key, _)| key.as_str() == name)
        .map(|(_, value)| value)
}

fn header_u32(value: &AMQPValue) -> Option<u32> {
    match value {
        AMQPValue::ShortShortInt(v) => u32::try_from(*v).ok(),
        AMQPValue::ShortShortUInt(v) => Some(u32::from(*v)),
        AMQPValue::ShortInt(v) => u32::try_from(*v).ok(),
        AMQPValue::ShortUInt(v) => Some(u32::from(*v)),
        AMQPValue::LongInt(v) => u32::try_from(*v).ok(),
        AMQPValue::LongUInt(v) => Some(*v),
        AMQPValue::LongLongInt(v) => u32::try_from(*v).ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope() -> Envelope {
        let mut envelope = Envelope::new().with_message_id("m-1");
        envelope.set_event_type("order.created");
        envelope.set_app_id("demo.orders");
        envelope
    }

    #[test]
    fn properties_carry_identity_and_persistence() {
        let properties = wire_properties(&envelope());

        assert_eq!(properties.message_id().as_ref().unwrap().as_str(), "m-1");
        assert_eq!(properties.kind().as_ref().unwrap().as_str(), "order.created");
        assert_eq!(properties.app_id().as_ref().unwrap().as_str(), "demo.orders");
        assert_eq!(*properties.delivery_mode(), Some(2));
        assert_eq!(
            properties.content_type().as_ref().unwrap().as_str(),
            "application/json"
        );
    }

    #[test]
    fn no_retry_headers_on_first_publish() {
        let properties = wire_properties(&envelope());
        assert!(header_value(&properties, HEADER_DELAY).is_none());
        assert!(header_value(&properties, HEADER_RETRY_COUNT).is_none());
        assert_eq!(retry_count_header(&properties), 0);
    }

    #[test]
    fn retry_publish_carries_delay_and_count() {
        let mut retried = envelope().with_retry_count(2);
        retried.set_delay_ms(Some(5000));
        let properties = wire_properties(&retried);

        assert_eq!(
            header_value(&properties, HEADER_DELAY),
            Some(&AMQPValue::LongInt(5000))
        );
        assert_eq!(retry_count_header(&properties), 2);
    }

    #[test]
    fn retry_count_header_tolerates_integer_widths() {
        for value in [
            AMQPValue::ShortShortInt(3),
            AMQPValue::ShortInt(3),
            AMQPValue::LongInt(3),
            AMQPValue::LongLongInt(3),
            AMQPValue::LongUInt(3),
        ] {
            assert_eq!(header_u32(&value), Some(3));
        }
        assert_eq!(header_u32(&AMQPValue::LongInt(-1)), None);
        assert_eq!(header_u32(&AMQPValue::Boolean(true)), None);
    }
}
