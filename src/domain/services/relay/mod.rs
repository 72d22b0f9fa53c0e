//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// The public entry point of the relay. NotificationRelay routes every subscribe and unsubscribe to
// the worker of its host, creating workers on first use, and exposes the outbound notification
// stream and the shutdown drain.
//--------------------------------------------------------------------------------------------------

// +----------------------------------------------------------+
// | MODULES                                                  |
// +----------------------------------------------------------+
// | Exports:                                                 |
// |   - NotificationRelay (struct)                           |
// |   - RelaySettings, RetryPolicy (structs)                 |
// |   - HostWorker, HostWorkerClient (structs)               |
// |   - PendingSubscribeRequest (struct)                     |
// |   - RelayError (enum)                                    |
// +----------------------------------------------------------+

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::domain::models::types::{
    DrainOutcome, HostState, RelayErrorCode, SubscribeOutcome, TopicMessage, UnsubscribeOutcome,
};
use crate::domain::services::drain::DrainController;
use crate::domain::services::events::{EventBus, MessageDispatcher, TopicListener};
use crate::domain::services::transport::BrokerTransport;

pub mod host_worker;
pub mod pending;

pub use host_worker::{HostWorker, HostWorkerClient, SubscribeReply, WorkerSettings};
pub use pending::{PendingSubscribeRequest, RetryPolicy};

/// Errors of the relay's internal plumbing. They never reach callers of the public operations,
/// which turn them into classified outcomes.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The host worker is gone or did not answer.
    #[error("Host worker unavailable: {0}")]
    WorkerUnavailable(String),
}

/// Timing and sizing of the relay.
#[derive(Debug, Clone, Copy)]
pub struct RelaySettings {
    pub retry: RetryPolicy,
    pub unsubscribe_grace: Duration,
    pub connect_timeout: Duration,
    pub teardown_timeout: Duration,
    pub drain_timeout: Duration,
    pub event_capacity: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            unsubscribe_grace: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            teardown_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(2),
            event_capacity: 1024,
        }
    }
}

impl RelaySettings {
    fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            unsubscribe_grace: self.unsubscribe_grace,
            connect_timeout: self.connect_timeout,
            teardown_timeout: self.teardown_timeout,
        }
    }
}

/// Multiplexes topic subscriptions of many independent consumers onto at most one broker
/// connection per host.
///
/// Subscriptions are reference counted per `(host, topic)`: the wire subscribe happens on the
/// first reference, the wire unsubscribe (and the teardown of an unused connection) after the
/// last reference has been gone for the grace period. Every operation returns a classified
/// outcome and never fails.
pub struct NotificationRelay {
    transport: Arc<dyn BrokerTransport>,
    dispatcher: MessageDispatcher,
    settings: RelaySettings,
    hosts: RwLock<HashMap<String, HostWorkerClient>>,
}

impl NotificationRelay {
    pub fn new(transport: Arc<dyn BrokerTransport>, settings: RelaySettings) -> Self {
        info!("Creating notification relay");
        Self {
            transport,
            dispatcher: MessageDispatcher::new(EventBus::new(settings.event_capacity)),
            settings,
            hosts: RwLock::new(HashMap::new()),
        }
    }

    /// Adds a reference on `topic` at `host`.
    ///
    /// # Returns
    /// * `Subscribed` - the topic is now subscribed on the wire
    /// * `AlreadySubscribed` - the connection already carried the topic
    /// * `Rejected(reason)` - the filter is invalid or the broker refused it
    /// * `Failed(code)` - the connection could not be established in time or at all
    /// * `Cancelled` - an unsubscribe of the same topic arrived while this one was pending
    ///
    /// Dropping the returned future gives the reference back.
    pub async fn subscribe(&self, host: &str, topic: &str) -> SubscribeOutcome {
        loop {
            let client = self.worker_for(host);
            match client.subscribe(topic).await {
                Ok(SubscribeReply::Done(outcome)) => return outcome,
                Ok(SubscribeReply::Pending(ticket)) => {
                    debug!(host, topic, ticket, "Subscribe pending on connection");
                    return PendingSubscribeRequest::new(client, topic, ticket, self.settings.retry)
                        .resolve()
                        .await;
                }
                Ok(SubscribeReply::Retired) => self.forget_worker(&client),
                Err(err) => {
                    error!(host, topic, "Subscribe failed: {}", err);
                    return SubscribeOutcome::Failed(RelayErrorCode::ConnectionFailed);
                }
            }
        }
    }

    /// Drops a reference on `topic` at `host`.
    pub async fn unsubscribe(&self, host: &str, topic: &str) -> UnsubscribeOutcome {
        let Some(client) = self.hosts.read().get(host).cloned() else {
            debug!(host, topic, "Unsubscribe for unknown host");
            return UnsubscribeOutcome::NotSubscribed;
        };
        match client.unsubscribe(topic).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(host, topic, "Unsubscribe failed: {}", err);
                UnsubscribeOutcome::NotSubscribed
            }
        }
    }

    /// Closes every connection, bounded by the drain timeout.
    ///
    /// Safe to call more than once; with nothing live it returns immediately. Hosts left idle by
    /// the drain are forgotten.
    pub async fn drain_all(&self) -> DrainOutcome {
        let clients: Vec<HostWorkerClient> = self.hosts.read().values().cloned().collect();
        let outcome = DrainController::new(self.settings.drain_timeout)
            .drain_all(clients)
            .await;
        if matches!(outcome, DrainOutcome::Drained { .. }) {
            self.reap_idle().await;
        }
        outcome
    }

    /// Stops the workers of hosts with no subscribers, no pending work and no connection.
    ///
    /// # Returns
    /// The number of hosts forgotten
    pub async fn reap_idle(&self) -> usize {
        let clients: Vec<HostWorkerClient> = self.hosts.read().values().cloned().collect();
        let mut reaped = 0;
        for client in clients {
            if let Ok(true) = client.retire().await {
                self.forget_worker(&client);
                reaped += 1;
            }
        }
        if reaped > 0 {
            debug!(reaped, "Reaped idle host workers");
        }
        reaped
    }

    /// Connection state of `host`.
    pub fn host_state(&self, host: &str) -> HostState {
        self.hosts
            .read()
            .get(host)
            .map(HostWorkerClient::state)
            .unwrap_or(HostState::Absent)
    }

    /// Active references on `(host, topic)`.
    pub async fn ref_count(&self, host: &str, topic: &str) -> usize {
        let Some(client) = self.hosts.read().get(host).cloned() else {
            return 0;
        };
        client.ref_count(topic).await.unwrap_or(0)
    }

    /// Hosts with a live worker, sorted.
    pub fn hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.hosts.read().keys().cloned().collect();
        hosts.sort();
        hosts
    }

    /// Registers a listener for topics on `host` matching `filter`.
    ///
    /// A listener that stalls for longer than `event_capacity` notifications makes every listener
    /// miss the notifications it skipped.
    pub async fn register_listener(
        &self,
        host: &str,
        filter: &str,
        listener: Arc<dyn TopicListener>,
    ) {
        self.dispatcher
            .register_listener(host, filter, listener)
            .await;
    }

    /// Raw feed of every outbound notification.
    pub fn events(&self) -> broadcast::Receiver<TopicMessage> {
        self.dispatcher.subscribe()
    }

    pub fn dispatcher(&self) -> &MessageDispatcher {
        &self.dispatcher
    }

    /// Starts delivering notifications to registered listeners.
    pub fn start(&self) -> JoinHandle<()> {
        self.dispatcher.start()
    }

    /// Removes `client` from the host map unless it was already replaced.
    fn forget_worker(&self, client: &HostWorkerClient) {
        let mut hosts = self.hosts.write();
        if hosts
            .get(client.host())
            .is_some_and(|current| current.same_worker(client))
        {
            hosts.remove(client.host());
        }
    }

    fn worker_for(&self, host: &str) -> HostWorkerClient {
        if let Some(client) = self.hosts.read().get(host) {
            return client.clone();
        }

        self.hosts
            .write()
            .entry(host.to_owned())
            .or_insert_with(|| {
                info!(host, "Starting host worker");
                let worker = HostWorker::new(
                    host,
                    Arc::clone(&self.transport),
                    self.dispatcher.clone(),
                    self.settings.worker_settings(),
                );
                let (client, _handle) = worker.start();
                client
            })
            .clone()
    }
}
