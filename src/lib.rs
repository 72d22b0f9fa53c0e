// Expose the modules
pub mod config;
pub mod domain;

// Re-export key types for easier usage
pub use config::{ConfigError, RelayConfig};
pub use domain::models::types::{
    DrainOutcome, HostState, RelayErrorCode, SubscribeOutcome, TopicFilterError, TopicMessage,
    TopicPayload, UnsubscribeOutcome, topic_matches_filter, validate_topic_filter,
};
pub use domain::services::events::{
    EventBus, EventError, EventLogger, EventResult, LoggingListener, MessageDispatcher,
    TopicListener,
};
pub use domain::services::ledger::SubscriptionLedger;
pub use domain::services::relay::{NotificationRelay, RelayError, RelaySettings, RetryPolicy};
pub use domain::services::transport::{
    AmqpSettings, AmqpTransport, BrokerSession, BrokerTransport, TransportError, TransportEvent,
};
