//! Incoming-message validation.
//!
//! A delivery missing its identity properties or carrying a non-JSON body
//! cannot be retried into anything useful; the consumer acks it away and
//! counts a validation error.

use lapin::BasicProperties;
use thiserror::Error;
use tracing::error;

const BODY_PREVIEW_BYTES: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing or empty type")]
    MissingType,

    #[error("missing or empty message_id")]
    MissingMessageId,

    #[error("missing or empty app_id")]
    MissingAppId,

    #[error("body is not valid JSON")]
    InvalidBody,
}

pub fn validate(properties: &BasicProperties, body: &[u8]) -> Result<(), ValidationError> {
    let result = check(properties, body);
    if let Err(reason) = result {
        let message_id = properties
            .message_id()
            .as_ref()
            .map(|value| value.as_str())
            .unwrap_or("<unset>");
        let preview = &body[..body.len().min(BODY_PREVIEW_BYTES)];
        error!(
            message_id,
            reason = %reason,
            body_preview = %String::from_utf8_lossy(preview),
            "rejected invalid message"
        );
    }
    result
}

fn check(properties: &BasicProperties, body: &[u8]) -> Result<(), ValidationError> {
    if is_blank(properties.kind()) {
        return Err(ValidationError::MissingType);
    }
    if is_blank(properties.message_id()) {
        return Err(ValidationError::MissingMessageId);
    }
    if is_blank(properties.app_id()) {
        return Err(ValidationError::MissingAppId);
    }
    if !body.is_empty() && serde_json::from_slice::<serde_json::Value>(body).is_err() {
        return Err(ValidationError::InvalidBody);
    }
    Ok(())
}

fn is_blank(value: &Option<lapin::types::ShortString>) -> bool {
    value
        .as_ref()
        .map(|value| value.as_str().trim().is_empty())
        .unwrap_or(true)
}
