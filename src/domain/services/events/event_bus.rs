//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// This module implements the outbound notification bus using tokio's broadcast channel. Every
// TopicMessage the relay produces goes through here, to the dispatcher's listener fan-out and to
// any raw `events()` subscriber.
//
// | Component     | Description                                                 |
// |---------------|-------------------------------------------------------------|
// | EventBus      | Broadcast bus of TopicMessage                               |
//
//--------------------------------------------------------------------------------------------------
// STRUCTS
//--------------------------------------------------------------------------------------------------
// | Name          | Description                                   | Key Methods                   |
// |---------------|-----------------------------------------------|-------------------------------|
// | EventBus      | Outbound notification publishing component    | publish, subscribe            |
//
//--------------------------------------------------------------------------------------------------

use tokio::sync::broadcast;
use tracing::{debug, error, info};

use super::event_types::{EventError, EventResult};
use crate::domain::models::types::TopicMessage;

/// Broadcast bus carrying every outbound `TopicMessage`.
///
/// Slow receivers lag rather than block the relay: once `capacity` messages are queued the oldest
/// are dropped for that receiver.
#[derive(Debug, Clone)]
pub struct EventBus {
    /// Channel for broadcasting messages to all subscribers
    sender: broadcast::Sender<TopicMessage>,
    /// Capacity of the channel
    capacity: usize,
}

impl EventBus {
    /// Creates a new bus with the specified capacity.
    ///
    /// # Arguments
    ///
    /// * `capacity` - The maximum number of messages that can be queued per receiver before
    ///   older ones are dropped.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        info!("Created new EventBus with capacity: {}", capacity);
        Self { sender, capacity }
    }

    /// Publishes a message to all subscribers.
    ///
    /// Publishing with no subscribers drops the message and still succeeds.
    ///
    /// # Returns
    ///
    /// * `Ok(())` - If the message was published or there were no subscribers.
    /// * `Err(EventError)` - If the broadcast send failed.
    pub fn publish(&self, message: TopicMessage) -> EventResult<()> {
        if self.sender.receiver_count() == 0 {
            debug!(host = %message.host, topic = %message.topic, "No subscribers for message");
            return Ok(());
        }

        match self.sender.send(message) {
            Ok(_) => Ok(()),
            Err(e) => {
                error!("Failed to publish message: {}", e);
                Err(EventError::PublishError(e.to_string()))
            }
        }
    }

    /// Creates a new independent subscription.
    pub fn subscribe(&self) -> broadcast::Receiver<TopicMessage> {
        debug!(
            "New subscriber added to EventBus (total: {})",
            self.sender.receiver_count() + 1
        );
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
