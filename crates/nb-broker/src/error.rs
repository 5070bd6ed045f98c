//! Broker error types and the closed taxonomies carried as metric tags.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("broker configuration error: {0}")]
    Config(String),
}

/// Failure categories on the publish path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishErrorKind {
    Connection,
    Channel,
    Timeout,
    Encoding,
    Config,
    Unknown,
}

impl PublishErrorKind {
    pub fn as_tag(&self) -> &'static str {
        match self {
            PublishErrorKind::Connection => "connection_error",
            PublishErrorKind::Channel => "channel_error",
            PublishErrorKind::Timeout => "timeout",
            PublishErrorKind::Encoding => "encoding_error",
            PublishErrorKind::Config => "config_error",
            PublishErrorKind::Unknown => "unknown",
        }
    }

    /// Kinds after which the shared connection must be thrown away.
    pub fn requires_reset(&self) -> bool {
        matches!(
            self,
            PublishErrorKind::Connection | PublishErrorKind::Channel | PublishErrorKind::Timeout
        )
    }
}

/// Failure categories on the consume path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeErrorKind {
    Connection,
    Channel,
    Io,
    ConsumeSetup,
}

impl ConsumeErrorKind {
    pub fn as_tag(&self) -> &'static str {
        match self {
            ConsumeErrorKind::Connection => "connection_error",
            ConsumeErrorKind::Channel => "channel_error",
            ConsumeErrorKind::Io => "io_error",
            ConsumeErrorKind::ConsumeSetup => "consume_setup_error",
        }
    }
}

fn amqp_publish_kind(error: &lapin::Error) -> PublishErrorKind {
    match error {
        lapin::Error::InvalidConnectionState(_) | lapin::Error::MissingHeartbeatError => {
            PublishErrorKind::Connection
        }
        lapin::Error::InvalidChannelState(_)
        | lapin::Error::InvalidChannel(_)
        | lapin::Error::ChannelsLimitReached => PublishErrorKind::Channel,
        lapin::Error::IOError(io) => match io.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                PublishErrorKind::Timeout
            }
            _ => PublishErrorKind::Connection,
        },
        lapin::Error::SerialisationError(_) | lapin::Error::ParsingError(_) => {
            PublishErrorKind::Encoding
        }
        lapin::Error::InvalidProtocolVersion(_) => PublishErrorKind::Config,
        _ => PublishErrorKind::Unknown,
    }
}

impl BrokerError {
    pub fn publish_kind(&self) -> PublishErrorKind {
        match self {
            BrokerError::Amqp(error) => amqp_publish_kind(error),
            BrokerError::Encoding(_) => PublishErrorKind::Encoding,
            BrokerError::Config(_) => PublishErrorKind::Config,
        }
    }

    pub fn consume_kind(&self) -> ConsumeErrorKind {
        match self {
            BrokerError::Amqp(error) => match error {
                lapin::Error::InvalidConnectionState(_) | lapin::Error::MissingHeartbeatError => {
                    ConsumeErrorKind::Connection
                }
                lapin::Error::InvalidChannelState(_)
                | lapin::Error::InvalidChannel(_)
                | lapin::Error::ChannelsLimitReached => ConsumeErrorKind::Channel,
                lapin::Error::IOError(_) => ConsumeErrorKind::Io,
                _ => ConsumeErrorKind::ConsumeSetup,
            },
            _ => ConsumeErrorKind::ConsumeSetup,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::Arc;

    fn io_error(kind: io::ErrorKind) -> BrokerError {
        BrokerError::Amqp(lapin::Error::IOError(Arc::new(io::Error::new(kind, "io"))))
    }

    #[test]
    fn io_timeout_maps_to_timeout() {
        assert_eq!(
            io_error(io::ErrorKind::TimedOut).publish_kind(),
            PublishErrorKind::Timeout
        );
    }

    #[test]
    fn io_reset_maps_to_connection() {
        assert_eq!(
            io_error(io::ErrorKind::ConnectionReset).publish_kind(),
            PublishErrorKind::Connection
        );
    }

    #[test]
    fn heartbeat_miss_is_a_connection_error() {
        let error = BrokerError::Amqp(lapin::Error::MissingHeartbeatError);
        assert_eq!(error.publish_kind(), PublishErrorKind::Connection);
        assert_eq!(error.consume_kind(), ConsumeErrorKind::Connection);
    }

    #[test]
    fn channel_limit_is_a_channel_error() {
        let error = BrokerError::Amqp(lapin::Error::ChannelsLimitReached);
        assert_eq!(error.publish_kind(), PublishErrorKind::Channel);
        assert_eq!(error.consume_kind(), ConsumeErrorKind::Channel);
    }

    #[test]
    fn encoding_and_config_have_their_own_kinds() {
        let encoding = BrokerError::Encoding(serde_json::from_str::<serde_json::Value>("{").unwrap_err());
        assert_eq!(encoding.publish_kind(), PublishErrorKind::Encoding);

        let config = BrokerError::Config("bad uri".into());
        assert_eq!(config.publish_kind(), PublishErrorKind::Config);
        assert_eq!(config.consume_kind(), ConsumeErrorKind::ConsumeSetup);
    }

    #[test]
    fn connection_kinds_require_reset() {
        assert!(PublishErrorKind::Connection.requires_reset());
        assert!(PublishErrorKind::Channel.requires_reset());
        assert!(PublishErrorKind::Timeout.requires_reset());
        assert!(!PublishErrorKind::Encoding.requires_reset());
        assert!(!PublishErrorKind::Config.requires_reset());
        assert!(!PublishErrorKind::Unknown.requires_reset());
    }

    #[test]
    fn tags_match_the_metric_contract() {
        assert_eq!(PublishErrorKind::Connection.as_tag(), "connection_error");
        assert_eq!(PublishErrorKind::Timeout.as_tag(), "timeout");
        assert_eq!(ConsumeErrorKind::Io.as_tag(), "io_error");
        assert_eq!(ConsumeErrorKind::ConsumeSetup.as_tag(), "consume_setup_error");
    }
}
