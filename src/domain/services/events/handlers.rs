//--------------------------------------------------------------------------------------------------
// STRUCTS & TRAITS
//--------------------------------------------------------------------------------------------------
// | Name                    | Description                                       | Key Methods       |
// |-------------------------|---------------------------------------------------|-------------------|
// | TopicListener           | Receiver of outbound topic notifications          | on_topic_message  |
// | EventLogger             | Bounded in-memory history of notifications        | get_history       |
// | LoggingListener         | Writes every notification to the tracing log      |                   |
//--------------------------------------------------------------------------------------------------

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

use super::event_types::EventResult;
use crate::domain::models::types::{TopicMessage, TopicPayload};

/// Consumer of `onTopicMessage(host, topic, payload | errorCode)` notifications.
#[async_trait::async_trait]
pub trait TopicListener: Send + Sync {
    /// Handles one notification. An error is logged by the dispatcher and does not stop delivery.
    async fn on_topic_message(&self, message: TopicMessage) -> EventResult<()>;
}

/// A simple in-memory notification history, mostly for diagnostics and tests
pub struct EventLogger {
    /// Maximum number of messages to keep in history
    max_history: usize,
    history: Arc<RwLock<VecDeque<TopicMessage>>>,
}

impl EventLogger {
    pub fn new(max_history: usize) -> Self {
        Self {
            max_history,
            history: Arc::new(RwLock::new(VecDeque::with_capacity(max_history))),
        }
    }

    /// Returns the retained notifications, oldest first
    pub async fn get_history(&self) -> Vec<TopicMessage> {
        self.history.read().await.iter().cloned().collect()
    }
}

#[async_trait::async_trait]
impl TopicListener for EventLogger {
    async fn on_topic_message(&self, message: TopicMessage) -> EventResult<()> {
        let mut history = self.history.write().await;
        if history.len() >= self.max_history {
            history.pop_front();
        }
        history.push_back(message);
        Ok(())
    }
}

/// Logs each notification through `tracing`.
#[derive(Debug, Default)]
pub struct LoggingListener;

#[async_trait::async_trait]
impl TopicListener for LoggingListener {
    async fn on_topic_message(&self, message: TopicMessage) -> EventResult<()> {
        match &message.payload {
            TopicPayload::Json(value) => {
                info!(host = %message.host, topic = %message.topic, "{}", value)
            }
            TopicPayload::Raw(text) => {
                info!(host = %message.host, topic = %message.topic, "{}", text)
            }
            TopicPayload::Error(code) => {
                warn!(host = %message.host, topic = %message.topic, "notification error: {}", code)
            }
        }
        Ok(())
    }
}
