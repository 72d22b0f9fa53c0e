//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// Owns the broker connection of one host. The supervisor starts handshakes, applies their results,
// reacts to transport loss and tears sessions down. It is driven exclusively by the host's worker,
// which makes every transition here serialized per host.
//
// | Component             | Description                                                 |
// |-----------------------|-------------------------------------------------------------|
// | ConnectionSupervisor  | State machine around one host's BrokerSession               |
// | HostConnection        | The live (or connecting) entry for the host                 |
// | ConnectionEvent       | Handshake results and transport loss fed back to the worker |
// | HandshakeOutcome      | What applying a handshake result did                        |
//--------------------------------------------------------------------------------------------------

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::models::types::HostState;
use crate::domain::services::events::MessageDispatcher;
use crate::domain::services::transport::{
    BrokerSession, BrokerTransport, TransportError, TransportEvent,
};

/// Fed back into the host worker by the tasks the supervisor spawns.
///
/// Every event carries the epoch of the connection attempt it belongs to, so results of a
/// superseded attempt can be recognised and dropped.
pub enum ConnectionEvent {
    Handshake {
        epoch: u64,
        result: Result<Box<dyn BrokerSession>, TransportError>,
    },
    Closed {
        epoch: u64,
        reason: String,
    },
}

/// What `on_handshake` did with a handshake result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// The host is now `Connected`.
    Connected,
    /// The attempt failed and the entry was removed.
    Failed(TransportError),
    /// The result belonged to an attempt that is no longer current and was discarded.
    Stale,
}

/// The connection entry of a host with at least one subscriber.
pub struct HostConnection {
    pub state: HostState,
    /// Only set while `Connected`.
    pub transport: Option<Box<dyn BrokerSession>>,
    pub epoch: u64,
    /// Set when the transport reported the session closed before its handshake result arrived.
    pub closed_early: Option<String>,
    cancel: CancellationToken,
}

/// Connection state machine for one host.
pub struct ConnectionSupervisor {
    host: String,
    transport: Arc<dyn BrokerTransport>,
    dispatcher: MessageDispatcher,
    events_tx: UnboundedSender<ConnectionEvent>,
    connection: Option<HostConnection>,
    state_view: Arc<RwLock<HostState>>,
    next_epoch: u64,
    connect_timeout: Duration,
    teardown_timeout: Duration,
}

impl ConnectionSupervisor {
    pub fn new(
        host: &str,
        transport: Arc<dyn BrokerTransport>,
        dispatcher: MessageDispatcher,
        events_tx: UnboundedSender<ConnectionEvent>,
        connect_timeout: Duration,
        teardown_timeout: Duration,
    ) -> Self {
        Self {
            host: host.to_owned(),
            transport,
            dispatcher,
            events_tx,
            connection: None,
            state_view: Arc::new(RwLock::new(HostState::Absent)),
            next_epoch: 0,
            connect_timeout,
            teardown_timeout,
        }
    }

    pub fn state(&self) -> HostState {
        self.connection
            .as_ref()
            .map(|c| c.state)
            .unwrap_or(HostState::Absent)
    }

    /// Shared, lock-protected copy of the state for readers outside the worker.
    pub fn state_view(&self) -> Arc<RwLock<HostState>> {
        Arc::clone(&self.state_view)
    }

    /// Returns the current state, starting a handshake first if the host has no entry.
    ///
    /// The transport event channel and its pump exist before `connect` is called, so no message
    /// routed to the new session goes unobserved.
    pub fn ensure_connecting(&mut self) -> HostState {
        if let Some(connection) = &self.connection {
            return connection.state;
        }

        self.next_epoch += 1;
        let epoch = self.next_epoch;
        let cancel = CancellationToken::new();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();

        tokio::spawn(pump_transport_events(
            self.host.clone(),
            epoch,
            transport_rx,
            self.dispatcher.clone(),
            self.events_tx.clone(),
        ));

        let host = self.host.clone();
        let transport = Arc::clone(&self.transport);
        let events_tx = self.events_tx.clone();
        let token = cancel.clone();
        let connect_timeout = self.connect_timeout;
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = token.cancelled() => Err(TransportError::Cancelled),
                outcome = tokio::time::timeout(connect_timeout, transport.connect(&host, transport_tx)) => {
                    outcome.unwrap_or(Err(TransportError::Timeout))
                }
            };
            let _ = events_tx.send(ConnectionEvent::Handshake { epoch, result });
        });

        info!(host = %self.host, epoch, "Connecting to broker");
        self.connection = Some(HostConnection {
            state: HostState::Connecting,
            transport: None,
            epoch,
            closed_early: None,
            cancel,
        });
        self.publish_state();
        HostState::Connecting
    }

    /// Applies the result of handshake `epoch`.
    pub fn on_handshake(
        &mut self,
        epoch: u64,
        result: Result<Box<dyn BrokerSession>, TransportError>,
    ) -> HandshakeOutcome {
        let current = matches!(
            &self.connection,
            Some(c) if c.epoch == epoch && c.state == HostState::Connecting
        );

        if !current {
            debug!(host = %self.host, epoch, "Dropping stale handshake result");
            if let Ok(session) = result {
                tokio::spawn(close_session(
                    self.host.clone(),
                    session,
                    self.teardown_timeout,
                ));
            }
            return HandshakeOutcome::Stale;
        }

        let closed_early = self
            .connection
            .as_mut()
            .and_then(|c| c.closed_early.take());
        let result = match (result, closed_early) {
            (Ok(session), Some(reason)) => {
                tokio::spawn(close_session(
                    self.host.clone(),
                    session,
                    self.teardown_timeout,
                ));
                Err(TransportError::Failed(format!("closed during handshake: {reason}")))
            }
            (result, _) => result,
        };

        match result {
            Ok(session) => {
                if let Some(connection) = self.connection.as_mut() {
                    connection.state = HostState::Connected;
                    connection.transport = Some(session);
                }
                info!(host = %self.host, epoch, "Broker connection established");
                self.publish_state();
                HandshakeOutcome::Connected
            }
            Err(err) => {
                warn!(host = %self.host, epoch, "Broker handshake failed: {}", err);
                self.connection = None;
                self.publish_state();
                HandshakeOutcome::Failed(err)
            }
        }
    }

    /// Handles the transport reporting that session `epoch` ended.
    ///
    /// A close that overtakes its own handshake result is remembered, and that result is then
    /// applied as a failure. Returns `true` if the current connection was removed.
    pub fn on_transport_closed(&mut self, epoch: u64, reason: &str) -> bool {
        match self.connection.as_mut() {
            Some(c) if c.epoch == epoch && c.state == HostState::Connected => {}
            Some(c) if c.epoch == epoch && c.state == HostState::Connecting => {
                debug!(host = %self.host, epoch, "Transport closed before handshake completed");
                c.closed_early = Some(reason.to_owned());
                return false;
            }
            _ => {
                debug!(host = %self.host, epoch, "Dropping close event for inactive connection");
                return false;
            }
        }

        warn!(host = %self.host, epoch, "Broker connection lost: {}", reason);
        self.connection = None;
        self.publish_state();
        true
    }

    /// Issues a wire subscribe on the live session, bounded by the connect timeout.
    pub async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        let session = self.session()?;
        tokio::time::timeout(self.connect_timeout, session.subscribe(topic))
            .await
            .unwrap_or(Err(TransportError::Timeout))
    }

    /// Issues a wire unsubscribe on the live session, bounded by the connect timeout.
    pub async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        let session = self.session()?;
        tokio::time::timeout(self.connect_timeout, session.unsubscribe(topic))
            .await
            .unwrap_or(Err(TransportError::Timeout))
    }

    /// Drops the host's connection without waiting for the session to close.
    ///
    /// Used when the session stopped answering; the close runs in the background under the
    /// teardown timeout.
    pub fn abandon(&mut self, reason: &str) {
        let Some(mut connection) = self.connection.take() else {
            return;
        };
        warn!(host = %self.host, epoch = connection.epoch, "Abandoning broker connection: {}", reason);
        connection.cancel.cancel();
        if let Some(session) = connection.transport.take() {
            tokio::spawn(close_session(
                self.host.clone(),
                session,
                self.teardown_timeout,
            ));
        }
        self.publish_state();
    }

    /// Closes and removes the host's connection.
    ///
    /// An in-flight handshake is cancelled. A live session is closed within the teardown timeout,
    /// after which the entry is removed regardless. Returns `false` if there was nothing to tear
    /// down.
    pub async fn teardown(&mut self) -> bool {
        let Some(connection) = self.connection.as_mut() else {
            return false;
        };

        connection.cancel.cancel();
        connection.state = HostState::Closing;
        let session = connection.transport.take();
        let epoch = connection.epoch;
        self.publish_state();

        info!(host = %self.host, epoch, "Tearing down broker connection");
        if let Some(session) = session {
            close_session(self.host.clone(), session, self.teardown_timeout).await;
        }

        self.connection = None;
        self.publish_state();
        true
    }

    fn session(&self) -> Result<&dyn BrokerSession, TransportError> {
        self.connection
            .as_ref()
            .and_then(|c| c.transport.as_deref())
            .ok_or_else(|| TransportError::Failed(format!("{} is not connected", self.host)))
    }

    fn publish_state(&self) {
        *self.state_view.write() = self.state();
    }
}

async fn close_session(host: String, session: Box<dyn BrokerSession>, limit: Duration) {
    match tokio::time::timeout(limit, session.close()).await {
        Ok(Ok(())) => debug!(host = %host, "Broker session closed"),
        Ok(Err(err)) => warn!(host = %host, "Broker session close failed: {}", err),
        Err(_) => warn!(host = %host, "Broker session close timed out after {:?}", limit),
    }
}

async fn pump_transport_events(
    host: String,
    epoch: u64,
    mut transport_rx: UnboundedReceiver<TransportEvent>,
    dispatcher: MessageDispatcher,
    events_tx: UnboundedSender<ConnectionEvent>,
) {
    while let Some(event) = transport_rx.recv().await {
        match event {
            TransportEvent::Message { topic, payload } => {
                dispatcher.dispatch(&host, &topic, &payload);
            }
            TransportEvent::Closed { reason } => {
                let _ = events_tx.send(ConnectionEvent::Closed { epoch, reason });
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::time::timeout;

    use crate::domain::services::events::EventBus;

    struct Session {
        closes: Arc<AtomicUsize>,
    }

    struct HungSession;

    #[async_trait]
    impl BrokerSession for HungSession {
        async fn subscribe(&self, _topic: &str) -> Result<(), TransportError> {
            std::future::pending().await
        }

        async fn unsubscribe(&self, _topic: &str) -> Result<(), TransportError> {
            std::future::pending().await
        }

        async fn close(self: Box<Self>) -> Result<(), TransportError> {
            std::future::pending().await
        }
    }

    #[async_trait]
    impl BrokerSession for Session {
        async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
            if topic == "forbidden" {
                Err(TransportError::Rejected(topic.to_string()))
            } else {
                Ok(())
            }
        }

        async fn unsubscribe(&self, _topic: &str) -> Result<(), TransportError> {
            Ok(())
        }

        async fn close(self: Box<Self>) -> Result<(), TransportError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Transport {
        refuse: bool,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl BrokerTransport for Transport {
        async fn connect(
            &self,
            host: &str,
            events: UnboundedSender<TransportEvent>,
        ) -> Result<Box<dyn BrokerSession>, TransportError> {
            if self.refuse {
                return Err(TransportError::Refused(host.to_string()));
            }
            let _ = events.send(TransportEvent::Message {
                topic: "hello".to_string(),
                payload: b"{}".to_vec(),
            });
            Ok(Box::new(Session {
                closes: Arc::clone(&self.closes),
            }))
        }
    }

    fn supervisor(
        refuse: bool,
    ) -> (
        ConnectionSupervisor,
        UnboundedReceiver<ConnectionEvent>,
        Arc<AtomicUsize>,
        MessageDispatcher,
    ) {
        let closes = Arc::new(AtomicUsize::new(0));
        let transport = Arc::new(Transport {
            refuse,
            closes: Arc::clone(&closes),
        });
        let dispatcher = MessageDispatcher::new(EventBus::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let supervisor = ConnectionSupervisor::new(
            "robot-a",
            transport,
            dispatcher.clone(),
            tx,
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        (supervisor, rx, closes, dispatcher)
    }

    async fn next_handshake(
        rx: &mut UnboundedReceiver<ConnectionEvent>,
    ) -> (u64, Result<Box<dyn BrokerSession>, TransportError>) {
        match timeout(Duration::from_secs(1), rx.recv()).await {
            Ok(Some(ConnectionEvent::Handshake { epoch, result })) => (epoch, result),
            _ => panic!("expected a handshake event"),
        }
    }

    #[tokio::test]
    async fn handshake_success_connects_and_forwards_messages() {
        let (mut sup, mut rx, _closes, dispatcher) = supervisor(false);
        let mut feed = dispatcher.subscribe();

        assert_eq!(sup.ensure_connecting(), HostState::Connecting);
        assert_eq!(sup.ensure_connecting(), HostState::Connecting);
        assert_eq!(*sup.state_view().read(), HostState::Connecting);

        let (epoch, result) = next_handshake(&mut rx).await;
        assert_eq!(sup.on_handshake(epoch, result), HandshakeOutcome::Connected);
        assert_eq!(sup.state(), HostState::Connected);
        assert!(sup.subscribe("runs/1").await.is_ok());
        assert!(matches!(
            sup.subscribe("forbidden").await,
            Err(TransportError::Rejected(_))
        ));

        let message = timeout(Duration::from_secs(1), feed.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.topic, "hello");
    }

    #[tokio::test]
    async fn handshake_failure_removes_entry() {
        let (mut sup, mut rx, _closes, _dispatcher) = supervisor(true);
        sup.ensure_connecting();

        let (epoch, result) = next_handshake(&mut rx).await;
        assert!(matches!(
            sup.on_handshake(epoch, result),
            HandshakeOutcome::Failed(TransportError::Refused(_))
        ));
        assert_eq!(sup.state(), HostState::Absent);
        assert_eq!(*sup.state_view().read(), HostState::Absent);
    }

    #[tokio::test]
    async fn stale_handshake_is_closed_and_ignored() {
        let (mut sup, mut rx, closes, _dispatcher) = supervisor(false);
        sup.ensure_connecting();
        let (epoch, result) = next_handshake(&mut rx).await;

        assert!(sup.teardown().await);
        assert_eq!(sup.on_handshake(epoch, result), HandshakeOutcome::Stale);
        assert_eq!(sup.state(), HostState::Absent);

        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transport_close_only_applies_to_current_epoch() {
        let (mut sup, mut rx, _closes, _dispatcher) = supervisor(false);
        sup.ensure_connecting();
        let (epoch, result) = next_handshake(&mut rx).await;
        sup.on_handshake(epoch, result);

        assert!(!sup.on_transport_closed(epoch + 1, "old"));
        assert_eq!(sup.state(), HostState::Connected);
        assert!(sup.on_transport_closed(epoch, "reset"));
        assert_eq!(sup.state(), HostState::Absent);
        assert!(sup.subscribe("runs/1").await.is_err());
    }

    #[tokio::test]
    async fn teardown_closes_live_session() {
        let (mut sup, mut rx, closes, _dispatcher) = supervisor(false);
        assert!(!sup.teardown().await);

        sup.ensure_connecting();
        let (epoch, result) = next_handshake(&mut rx).await;
        sup.on_handshake(epoch, result);

        assert!(sup.teardown().await);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(sup.state(), HostState::Absent);
    }

    #[tokio::test]
    async fn close_before_handshake_result_fails_the_handshake() {
        let (mut sup, mut rx, closes, _dispatcher) = supervisor(false);
        sup.ensure_connecting();
        let (epoch, result) = next_handshake(&mut rx).await;

        assert!(!sup.on_transport_closed(epoch, "reset"));
        assert_eq!(sup.state(), HostState::Connecting);
        assert!(matches!(
            sup.on_handshake(epoch, result),
            HandshakeOutcome::Failed(TransportError::Failed(_))
        ));
        assert_eq!(sup.state(), HostState::Absent);

        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_wire_calls_time_out_and_abandon_does_not_wait() {
        let (mut sup, mut rx, _closes, _dispatcher) = supervisor(false);
        sup.ensure_connecting();
        let (epoch, _) = next_handshake(&mut rx).await;
        sup.on_handshake(epoch, Ok(Box::new(HungSession)));

        assert_eq!(sup.subscribe("runs/1").await, Err(TransportError::Timeout));
        assert_eq!(sup.unsubscribe("runs/1").await, Err(TransportError::Timeout));

        sup.abandon("wire call timed out");
        assert_eq!(sup.state(), HostState::Absent);
        assert_eq!(*sup.state_view().read(), HostState::Absent);
    }
}
