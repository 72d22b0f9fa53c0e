//--------------------------------------------------------------------------------------------------
// STRUCTS & TRAITS
//--------------------------------------------------------------------------------------------------
// | Name                    | Description                                       | Key Methods        |
// |-------------------------|---------------------------------------------------|--------------------|
// | MessageDispatcher       | Decodes raw deliveries and fans them out          | dispatch           |
// |                         | to listeners registered by topic filter           | dispatch_error     |
// |                         |                                                   | register_listener  |
// |                         |                                                   | start              |
//--------------------------------------------------------------------------------------------------

use std::fmt;
use std::sync::Arc;

use tokio::sync::{RwLock, broadcast};
use tracing::{debug, error, info, warn};

use super::event_bus::EventBus;
use super::handlers::TopicListener;
use crate::domain::models::types::{
    RelayErrorCode, TopicMessage, TopicPayload, topic_matches_filter,
};

struct Registration {
    host: String,
    filter: String,
    listener: Arc<dyn TopicListener>,
}

/// Turns raw `(host, topic, payload)` deliveries into `TopicMessage`s and routes them to
/// listeners.
///
/// Clones share the bus and the listener table, so the supervisor's pumps and the relay front
/// end all publish into the same fan-out.
#[derive(Clone)]
pub struct MessageDispatcher {
    event_bus: EventBus,
    listeners: Arc<RwLock<Vec<Registration>>>,
}

impl fmt::Debug for MessageDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageDispatcher")
            .field("event_bus", &self.event_bus)
            .field("listeners", &"...")
            .finish()
    }
}

impl MessageDispatcher {
    pub fn new(event_bus: EventBus) -> Self {
        Self {
            event_bus,
            listeners: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Registers `listener` for every topic on `host` matched by `filter`.
    ///
    /// Listeners are fed from the bounded bus by a single task. A listener slower than the bus
    /// capacity makes that task lag, and the skipped notifications are lost for every listener
    /// even though the broker already counts them as delivered. Listeners that need every
    /// notification must hand work off instead of processing it inline.
    ///
    /// # Arguments
    /// * `host` - The host whose notifications the listener wants
    /// * `filter` - Topic filter, `+` and `#` wildcards allowed
    /// * `listener` - The listener to call
    pub async fn register_listener(
        &self,
        host: &str,
        filter: &str,
        listener: Arc<dyn TopicListener>,
    ) {
        self.listeners.write().await.push(Registration {
            host: host.to_owned(),
            filter: filter.to_owned(),
            listener,
        });
        debug!(host, filter, "Registered topic listener");
    }

    /// Decodes `raw` and publishes it.
    ///
    /// JSON payloads are forwarded structured. Anything else goes out as text.
    pub fn dispatch(&self, host: &str, topic: &str, raw: &[u8]) {
        let payload = decode_payload(host, topic, raw);
        self.publish(TopicMessage::new(host, topic, payload));
    }

    /// Publishes the distinguished error payload for `(host, topic)`.
    pub fn dispatch_error(&self, host: &str, topic: &str, code: RelayErrorCode) {
        self.publish(TopicMessage::new(host, topic, TopicPayload::Error(code)));
    }

    /// Raw feed of every outbound message.
    pub fn subscribe(&self) -> broadcast::Receiver<TopicMessage> {
        self.event_bus.subscribe()
    }

    fn publish(&self, message: TopicMessage) {
        if let Err(e) = self.event_bus.publish(message) {
            error!("Dropping notification: {}", e);
        }
    }

    /// Starts delivering bus messages to registered listeners.
    ///
    /// Listeners are called one message at a time, so per-topic order on the bus is the order each
    /// listener sees.
    ///
    /// # Returns
    /// A JoinHandle that completes once every bus sender is gone
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let listeners = Arc::clone(&self.listeners);
        let mut receiver = self.event_bus.subscribe();

        tokio::spawn(async move {
            info!("Message dispatcher started");

            loop {
                let message = match receiver.recv().await {
                    Ok(message) => message,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Message dispatcher lagged, {} notifications skipped", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                let targets: Vec<Arc<dyn TopicListener>> = listeners
                    .read()
                    .await
                    .iter()
                    .filter(|r| {
                        r.host == message.host && topic_matches_filter(&message.topic, &r.filter)
                    })
                    .map(|r| Arc::clone(&r.listener))
                    .collect();

                if targets.is_empty() {
                    debug!(host = %message.host, topic = %message.topic, "No listener registered");
                    continue;
                }

                for listener in targets {
                    if let Err(e) = listener.on_topic_message(message.clone()).await {
                        error!("Listener failed to process notification: {}", e);
                    }
                }
            }

            info!("Message dispatcher stopped");
        })
    }
}

fn decode_payload(host: &str, topic: &str, raw: &[u8]) -> TopicPayload {
    match serde_json::from_slice::<serde_json::Value>(raw) {
        Ok(value) => TopicPayload::Json(value),
        Err(e) => {
            debug!(
                host,
                topic,
                code = %RelayErrorCode::DeserializationFallback,
                "Payload is not JSON, forwarding as text: {}",
                e
            );
            TopicPayload::Raw(String::from_utf8_lossy(raw).into_owned())
        }
    }
}
