//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// This module defines the core data types shared by the relay: connection states, the outcomes
// returned to subscribers, the error taxonomy carried on the outbound stream, and the message
// envelope delivered to listeners. It also holds the MQTT-style topic filter rules.
//
// | Section            | Description                                                      |
// |--------------------|------------------------------------------------------------------|
// | ENUMS              | Host state, operation outcomes, error codes, payload variants.   |
// | STRUCTS            | The TopicMessage envelope.                                       |
// | TOPIC FILTERS      | Validation and wildcard matching of topic filters.               |
// | TESTS              | Unit tests for the defined types.                                |
//--------------------------------------------------------------------------------------------------

//--------------------------------------------------------------------------------------------------
//  ENUMS
//--------------------------------------------------------------------------------------------------
// | Name                | Description                                          |
// |---------------------|------------------------------------------------------|
// | HostState           | Lifecycle state of one host connection.              |
// | RelayErrorCode      | Classified failure reported to subscribers.          |
// | SubscribeOutcome    | Result of a subscribe call.                          |
// | UnsubscribeOutcome  | Result of an unsubscribe call.                       |
// | DrainOutcome        | Result of the shutdown drain.                        |
// | TopicPayload        | Decoded payload or error code of a delivery.         |
//--------------------------------------------------------------------------------------------------
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle state of the broker connection for one host.
///
/// `Absent → Connecting → Connected → Closing → Absent`, plus `Connecting → Absent` when the
/// handshake fails and `Connected → Absent` when the transport drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostState {
    /// No connection and no entry for the host.
    Absent,
    /// Handshake in flight.
    Connecting,
    /// Session established, wire subscriptions can be issued.
    Connected,
    /// Graceful close in progress.
    Closing,
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Absent => "absent",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// Classified failure surfaced to subscribers and on the outbound stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelayErrorCode {
    /// The host actively refused the transport connection. Not retried.
    ConnectionRefused,
    /// Any other handshake or transport failure, including a dropped session.
    ConnectionFailed,
    /// The retry budget ran out while the host was still connecting.
    SubscribeTimeout,
    /// The broker refused one topic. The connection and other topics are unaffected.
    SubscribeRejected,
    /// A payload was not JSON and was forwarded as text. Informational only.
    DeserializationFallback,
    /// The drain could not confirm every connection closed in time.
    DrainTimeout,
}

impl fmt::Display for RelayErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            Self::ConnectionRefused => "CONNECTION_REFUSED",
            Self::ConnectionFailed => "CONNECTION_FAILED",
            Self::SubscribeTimeout => "SUBSCRIBE_TIMEOUT",
            Self::SubscribeRejected => "SUBSCRIBE_REJECTED",
            Self::DeserializationFallback => "DESERIALIZATION_FALLBACK",
            Self::DrainTimeout => "DRAIN_TIMEOUT",
        };
        f.write_str(code)
    }
}

/// Result of `subscribe(host, topic)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// The topic is now subscribed on the wire.
    Subscribed,
    /// The broker already held the subscription, only the count went up.
    AlreadySubscribed,
    /// The topic was refused, locally or by the broker. The count was rolled back.
    Rejected(String),
    /// The subscription could not be established. The count was rolled back.
    Failed(RelayErrorCode),
    /// An unsubscribe of the same topic arrived while this request was pending.
    Cancelled,
}

impl SubscribeOutcome {
    /// Whether the caller now holds a reference on the topic.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Subscribed | Self::AlreadySubscribed)
    }
}

/// Result of `unsubscribe(host, topic)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsubscribeOutcome {
    /// There was no reference to release.
    NotSubscribed,
    /// Other subscribers still hold the topic.
    Decremented,
    /// The last reference went away; wire work runs after the grace period.
    Released,
}

/// Result of `drain_all()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every live connection was closed.
    Drained { closed: usize },
    /// The global timeout elapsed first. `pending` lists hosts whose close was not confirmed.
    TimedOut { closed: usize, pending: Vec<String> },
}

impl DrainOutcome {
    /// The error code to report, if the drain was partial.
    pub fn error(&self) -> Option<RelayErrorCode> {
        match self {
            Self::Drained { .. } => None,
            Self::TimedOut { .. } => Some(RelayErrorCode::DrainTimeout),
        }
    }
}

/// Decoded body of a delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum TopicPayload {
    /// The payload parsed as JSON.
    Json(serde_json::Value),
    /// The payload was forwarded as (lossy UTF-8) text.
    Raw(String),
    /// Distinguished error payload for a failed or dropped subscription.
    Error(RelayErrorCode),
}

//--------------------------------------------------------------------------------------------------
//  STRUCTS
//--------------------------------------------------------------------------------------------------
// | Name          | Description                                       | Key Methods        |
// |---------------|---------------------------------------------------|--------------------|
// | TopicMessage  | One outbound (host, topic, payload) notification   | is_error           |
//--------------------------------------------------------------------------------------------------

/// Outbound notification: `onTopicMessage(host, topic, payload | errorCode)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicMessage {
    pub host: String,
    pub topic: String,
    pub payload: TopicPayload,
    pub timestamp: DateTime<Utc>,
}

impl TopicMessage {
    pub fn new(host: impl Into<String>, topic: impl Into<String>, payload: TopicPayload) -> Self {
        Self {
            host: host.into(),
            topic: topic.into(),
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.payload, TopicPayload::Error(_))
    }
}

//--------------------------------------------------------------------------------------------------
//  TOPIC FILTERS
//--------------------------------------------------------------------------------------------------

/// Reasons a topic filter is refused before it reaches the wire.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TopicFilterError {
    #[error("topic filter is empty")]
    Empty,
    #[error("topic filter contains a NUL character")]
    NulCharacter,
    #[error("'#' must occupy a whole level and be the last level: {0}")]
    MisplacedMultiLevel(String),
    #[error("'+' must occupy a whole level: {0}")]
    MisplacedSingleLevel(String),
}

/// Checks a filter against the MQTT topic filter rules.
///
/// `+` and `#` have to stand alone in their level and `#` may only appear last.
/// Empty levels (`a//b`) are legal.
pub fn validate_topic_filter(filter: &str) -> Result<(), TopicFilterError> {
    if filter.is_empty() {
        return Err(TopicFilterError::Empty);
    }
    if filter.contains('\0') {
        return Err(TopicFilterError::NulCharacter);
    }

    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || i != last) {
            return Err(TopicFilterError::MisplacedMultiLevel(filter.to_owned()));
        }
        if level.contains('+') && *level != "+" {
            return Err(TopicFilterError::MisplacedSingleLevel(filter.to_owned()));
        }
    }

    Ok(())
}

/// Whether `topic` is matched by `filter`.
///
/// - `+` matches exactly one level
/// - `#` matches any number of remaining levels, including none
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    if topic == filter || filter == "#" {
        return true;
    }

    let mut topic_levels = topic.split('/');
    for level in filter.split('/') {
        if level == "#" {
            return true;
        }
        match topic_levels.next() {
            Some(t) if level == "+" || level == t => continue,
            _ => return false,
        }
    }

    topic_levels.next().is_none()
}
