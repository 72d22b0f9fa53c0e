//--------------------------------------------------------------------------------------------------
// In-memory broker used by the integration tests. Behaviour is configured per host and every
// connect, subscribe, unsubscribe and close is recorded for assertions.
//--------------------------------------------------------------------------------------------------
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;

use notify_relay::{
    BrokerSession, BrokerTransport, NotificationRelay, RelaySettings, TransportError,
    TransportEvent, topic_matches_filter,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostBehavior {
    Accept,
    Refuse,
    Fail,
    /// Accept after the given delay
    Delay(Duration),
    /// Accept, but never finish closing
    HangOnClose,
    /// Report the connection closed while the handshake is still running, then accept
    DropOnOpen,
    /// Accept, but never answer a subscribe to the given topic
    HangOnSubscribe(String),
}

#[derive(Default)]
struct BrokerState {
    behaviors: HashMap<String, HostBehavior>,
    rejected_topics: HashSet<String>,
    sessions: HashMap<String, UnboundedSender<TransportEvent>>,
    bound: HashMap<String, HashSet<String>>,
    connects: Vec<String>,
    subscribes: Vec<(String, String)>,
    unsubscribes: Vec<(String, String)>,
    closes: Vec<String>,
}

#[derive(Clone, Default)]
pub struct FakeBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl FakeBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_behavior(&self, host: &str, behavior: HostBehavior) {
        self.state
            .lock()
            .behaviors
            .insert(host.to_string(), behavior);
    }

    pub fn reject_topic(&self, topic: &str) {
        self.state.lock().rejected_topics.insert(topic.to_string());
    }

    /// Delivers a message if the host's live session has a matching binding.
    pub fn publish(&self, host: &str, topic: &str, payload: &[u8]) -> bool {
        let state = self.state.lock();
        let bound = state
            .bound
            .get(host)
            .map(|filters| filters.iter().any(|f| topic_matches_filter(topic, f)))
            .unwrap_or(false);
        match state.sessions.get(host) {
            Some(tx) if bound => tx
                .send(TransportEvent::Message {
                    topic: topic.to_string(),
                    payload: payload.to_vec(),
                })
                .is_ok(),
            _ => false,
        }
    }

    /// Simulates the broker dropping the host's connection.
    pub fn drop_connection(&self, host: &str) {
        let mut state = self.state.lock();
        state.bound.remove(host);
        if let Some(tx) = state.sessions.remove(host) {
            let _ = tx.send(TransportEvent::Closed {
                reason: "connection reset by peer".to_string(),
            });
        }
    }

    pub fn connect_count(&self, host: &str) -> usize {
        self.state.lock().connects.iter().filter(|h| *h == host).count()
    }

    pub fn subscribe_count(&self, host: &str, topic: &str) -> usize {
        self.state
            .lock()
            .subscribes
            .iter()
            .filter(|(h, t)| h == host && t == topic)
            .count()
    }

    pub fn unsubscribe_count(&self, host: &str, topic: &str) -> usize {
        self.state
            .lock()
            .unsubscribes
            .iter()
            .filter(|(h, t)| h == host && t == topic)
            .count()
    }

    pub fn close_count(&self, host: &str) -> usize {
        self.state.lock().closes.iter().filter(|h| *h == host).count()
    }
}

#[async_trait]
impl BrokerTransport for FakeBroker {
    async fn connect(
        &self,
        host: &str,
        events: UnboundedSender<TransportEvent>,
    ) -> Result<Box<dyn BrokerSession>, TransportError> {
        let behavior = {
            let mut state = self.state.lock();
            state.connects.push(host.to_string());
            state
                .behaviors
                .get(host)
                .cloned()
                .unwrap_or(HostBehavior::Accept)
        };

        match behavior {
            HostBehavior::Refuse => {
                return Err(TransportError::Refused(format!("{host}: connection refused")));
            }
            HostBehavior::Fail => {
                return Err(TransportError::Failed(format!("{host}: handshake failed")));
            }
            HostBehavior::Delay(delay) => tokio::time::sleep(delay).await,
            HostBehavior::DropOnOpen => {
                let _ = events.send(TransportEvent::Closed {
                    reason: "connection reset during open".to_string(),
                });
                // Lets the close event reach the relay before the handshake result does.
                tokio::time::sleep(Duration::from_millis(10)).await;
                return Ok(Box::new(FakeSession {
                    host: host.to_string(),
                    hang_on_close: false,
                    hang_topic: None,
                    broker: self.clone(),
                }));
            }
            HostBehavior::Accept | HostBehavior::HangOnClose | HostBehavior::HangOnSubscribe(_) => {}
        }

        let mut state = self.state.lock();
        state.sessions.insert(host.to_string(), events);
        state.bound.insert(host.to_string(), HashSet::new());
        Ok(Box::new(FakeSession {
            host: host.to_string(),
            hang_on_close: behavior == HostBehavior::HangOnClose,
            hang_topic: match behavior {
                HostBehavior::HangOnSubscribe(topic) => Some(topic),
                _ => None,
            },
            broker: self.clone(),
        }))
    }
}

struct FakeSession {
    host: String,
    hang_on_close: bool,
    hang_topic: Option<String>,
    broker: FakeBroker,
}

#[async_trait]
impl BrokerSession for FakeSession {
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        if self.hang_topic.as_deref() == Some(topic) {
            self.broker
                .state
                .lock()
                .subscribes
                .push((self.host.clone(), topic.to_string()));
            return std::future::pending().await;
        }
        let mut state = self.broker.state.lock();
        state
            .subscribes
            .push((self.host.clone(), topic.to_string()));
        if state.rejected_topics.contains(topic) {
            return Err(TransportError::Rejected(format!("access refused to {topic}")));
        }
        state
            .bound
            .entry(self.host.clone())
            .or_default()
            .insert(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock();
        state
            .unsubscribes
            .push((self.host.clone(), topic.to_string()));
        if let Some(bound) = state.bound.get_mut(&self.host) {
            bound.remove(topic);
        }
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), TransportError> {
        if self.hang_on_close {
            std::future::pending::<()>().await;
        }
        let mut state = self.broker.state.lock();
        state.closes.push(self.host.clone());
        state.sessions.remove(&self.host);
        state.bound.remove(&self.host);
        Ok(())
    }
}

pub fn relay_with(broker: &FakeBroker) -> NotificationRelay {
    NotificationRelay::new(Arc::new(broker.clone()), RelaySettings::default())
}
