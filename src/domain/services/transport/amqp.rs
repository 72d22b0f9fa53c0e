use async_trait::async_trait;
use rabbitmq::{
    ConsumerEvent, RabbitMQError, TopicConsumer, TopicConsumerBuilder, routing_key_to_topic,
    topic_to_routing_key,
};
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, info};
use uuid::Uuid;

use super::{BrokerSession, BrokerTransport, TransportError, TransportEvent};

/// Connection parameters shared by every host.
#[derive(Debug, Clone)]
pub struct AmqpSettings {
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    pub exchange: String,
    pub heartbeat_secs: u16,
}

impl Default for AmqpSettings {
    fn default() -> Self {
        Self {
            port: 5672,
            user: "guest".to_string(),
            password: "guest".to_string(),
            vhost: "/".to_string(),
            exchange: rabbitmq::DEFAULT_TOPIC_EXCHANGE.to_string(),
            heartbeat_secs: 30,
        }
    }
}

/// RabbitMQ-backed transport.
///
/// Every session announces the same per-process client id as its connection name.
#[derive(Debug, Clone)]
pub struct AmqpTransport {
    settings: AmqpSettings,
    client_id: String,
}

impl AmqpTransport {
    pub fn new(app_id: &str, settings: AmqpSettings) -> Self {
        let client_id = format!("{}-{}", app_id, Uuid::new_v4());
        info!(client_id = %client_id, "AMQP transport created");
        Self {
            settings,
            client_id,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Builds the connection URI for `host`. The default vhost is left off the path.
    pub fn connection_uri(&self, host: &str) -> String {
        let s = &self.settings;
        if s.vhost == "/" {
            format!("amqp://{}:{}@{}:{}", s.user, s.password, host, s.port)
        } else {
            format!(
                "amqp://{}:{}@{}:{}/{}",
                s.user,
                s.password,
                host,
                s.port,
                s.vhost.replace('/', "%2f")
            )
        }
    }
}

#[async_trait]
impl BrokerTransport for AmqpTransport {
    async fn connect(
        &self,
        host: &str,
        events: UnboundedSender<TransportEvent>,
    ) -> Result<Box<dyn BrokerSession>, TransportError> {
        let (consumer_tx, mut consumer_rx) = mpsc::unbounded_channel::<ConsumerEvent>();

        // Ends once the consumer's forwarding task drops its sender.
        tokio::spawn(async move {
            while let Some(event) = consumer_rx.recv().await {
                let event = match event {
                    ConsumerEvent::Delivery {
                        routing_key,
                        content,
                    } => TransportEvent::Message {
                        topic: routing_key_to_topic(&routing_key),
                        payload: content,
                    },
                    ConsumerEvent::Closed { reason } => TransportEvent::Closed { reason },
                };
                if events.send(event).is_err() {
                    break;
                }
            }
        });

        let consumer = TopicConsumerBuilder::new(&self.connection_uri(host), &self.client_id)
            .exchange(&self.settings.exchange)
            .heartbeat(self.settings.heartbeat_secs)
            .build(consumer_tx)
            .await
            .map_err(|err| match err {
                RabbitMQError::ConnectionRefused(msg) => TransportError::Refused(msg),
                other => TransportError::Failed(other.to_string()),
            })?;

        debug!(host, queue = consumer.queue_name(), "AMQP session open");
        Ok(Box::new(AmqpSession { consumer }))
    }
}

struct AmqpSession {
    consumer: TopicConsumer,
}

#[async_trait]
impl BrokerSession for AmqpSession {
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.consumer
            .bind(&topic_to_routing_key(topic))
            .await
            .map_err(|err| TransportError::Rejected(err.to_string()))
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.consumer
            .unbind(&topic_to_routing_key(topic))
            .await
            .map_err(|err| TransportError::Failed(err.to_string()))
    }

    async fn close(self: Box<Self>) -> Result<(), TransportError> {
        self.consumer
            .close()
            .await
            .map_err(|err| TransportError::Failed(err.to_string()))
    }
}
