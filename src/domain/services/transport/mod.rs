//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// The seam between the relay and a concrete publish/subscribe broker. The supervisor only ever
// talks to these traits, which lets the relay run against RabbitMQ in production and an in-memory
// broker in tests.
//
// | Component        | Description                                                 |
// |------------------|-------------------------------------------------------------|
// | BrokerTransport  | Opens one session per host                                  |
// | BrokerSession    | Topic subscribe/unsubscribe on a live session, and close    |
// | TransportEvent   | Deliveries and connection loss pushed by a live session     |
// | TransportError   | Classified transport failures                               |
// | AmqpTransport    | RabbitMQ implementation (see `amqp`)                        |
//--------------------------------------------------------------------------------------------------

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

use crate::domain::models::types::RelayErrorCode;

pub mod amqp;

pub use amqp::{AmqpSettings, AmqpTransport};

/// Something a live session reports on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A message published on `topic`.
    Message { topic: String, payload: Vec<u8> },
    /// The session ended without being closed by the relay.
    Closed { reason: String },
}

/// Errors that can occur at the transport layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The host refused the connection.
    #[error("Connection refused: {0}")]
    Refused(String),

    /// Any other connection or session failure.
    #[error("Transport failure: {0}")]
    Failed(String),

    /// The broker refused a single topic.
    #[error("Topic rejected: {0}")]
    Rejected(String),

    /// The handshake did not complete in time.
    #[error("Handshake timed out")]
    Timeout,

    /// The attempt was abandoned before it completed.
    #[error("Handshake cancelled")]
    Cancelled,
}

impl TransportError {
    /// Maps the failure onto the code reported to subscribers.
    pub fn code(&self) -> RelayErrorCode {
        match self {
            Self::Refused(_) => RelayErrorCode::ConnectionRefused,
            Self::Rejected(_) => RelayErrorCode::SubscribeRejected,
            Self::Failed(_) | Self::Timeout | Self::Cancelled => RelayErrorCode::ConnectionFailed,
        }
    }
}

/// Opens broker sessions.
#[async_trait]
pub trait BrokerTransport: Send + Sync + 'static {
    /// Connects to `host`.
    ///
    /// `events` is wired into the session before the handshake completes, so every message the
    /// broker routes to the session is observed. The returned session is exclusively owned by the
    /// caller.
    ///
    /// # Errors
    /// * `TransportError::Refused` - the host actively refused the connection
    /// * `TransportError::Failed` - any other handshake failure
    async fn connect(
        &self,
        host: &str,
        events: UnboundedSender<TransportEvent>,
    ) -> Result<Box<dyn BrokerSession>, TransportError>;
}

/// A live broker session for one host.
#[async_trait]
pub trait BrokerSession: Send + Sync {
    /// Starts routing `topic` to this session.
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Stops routing `topic` to this session.
    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Gracefully closes the session. No `Closed` event is emitted for a requested close.
    async fn close(self: Box<Self>) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_classify_into_relay_codes() {
        assert_eq!(
            TransportError::Refused("nope".into()).code(),
            RelayErrorCode::ConnectionRefused
        );
        assert_eq!(
            TransportError::Failed("reset".into()).code(),
            RelayErrorCode::ConnectionFailed
        );
        assert_eq!(TransportError::Timeout.code(), RelayErrorCode::ConnectionFailed);
        assert_eq!(
            TransportError::Rejected("acl".into()).code(),
            RelayErrorCode::SubscribeRejected
        );
    }
}
