//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// This module implements the per-host serialization domain. One HostWorker task owns the ledger
// slice, the connection supervisor, pending subscribe requests and deferred releases of a host;
// everything else talks to it through a HostWorkerClient.
//
// | Component           | Description                                                 |
// |---------------------|-------------------------------------------------------------|
// | HostWorker          | Task owning all mutable state of one host                   |
// | HostWorkerClient    | Cloneable handle sending commands to the worker             |
// | HostCommand         | Commands sent to the worker                                 |
// | SubscribeReply      | Immediate answer to a subscribe                             |
//
//--------------------------------------------------------------------------------------------------
// STRUCTS
//--------------------------------------------------------------------------------------------------
// | Name               | Description                                       | Key Methods         |
// |--------------------|---------------------------------------------------|---------------------|
// | HostWorker         | Worker task managing one host                     | start               |
// |                    |                                                   | handle_command      |
// |--------------------|---------------------------------------------------|---------------------|
// | HostWorkerClient   | Client interface to worker                        | subscribe           |
// |                    |                                                   | poll                |
// |                    |                                                   | unsubscribe         |
// |                    |                                                   | teardown            |
// |                    |                                                   | ref_count           |
// |                    |                                                   | abandon             |
// |                    |                                                   | retire              |
//
//--------------------------------------------------------------------------------------------------
// ENUMS
//--------------------------------------------------------------------------------------------------
// | Name               | Description                                       | Variants            |
// |--------------------|---------------------------------------------------|---------------------|
// | HostCommand        | Commands sent to worker                           | Subscribe           |
// |                    |                                                   | Poll                |
// |                    |                                                   | Unsubscribe         |
// |                    |                                                   | Teardown            |
// |                    |                                                   | RefCount            |
// |                    |                                                   | Abandon             |
// |                    |                                                   | Retire              |
// |--------------------|---------------------------------------------------|---------------------|
// | SubscribeReply     | Immediate subscribe answer                        | Done                |
// |                    |                                                   | Pending             |
// |                    |                                                   | Retired             |
//--------------------------------------------------------------------------------------------------

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{self, Receiver, Sender, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::RelayError;
use crate::domain::models::types::{
    HostState, RelayErrorCode, SubscribeOutcome, UnsubscribeOutcome, validate_topic_filter,
};
use crate::domain::services::events::MessageDispatcher;
use crate::domain::services::ledger::SubscriptionLedger;
use crate::domain::services::supervisor::{
    ConnectionEvent, ConnectionSupervisor, HandshakeOutcome,
};
use crate::domain::services::transport::{BrokerTransport, TransportError};

const COMMAND_BUFFER: usize = 256;

/// Timing knobs of a host worker.
#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub unsubscribe_grace: Duration,
    pub connect_timeout: Duration,
    pub teardown_timeout: Duration,
}

/// Immediate answer to a subscribe command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeReply {
    /// The outcome is final
    Done(SubscribeOutcome),
    /// The host is connecting; poll the ticket for the outcome
    Pending(u64),
    /// The worker was retired; ask a fresh worker
    Retired,
}

/// Commands that can be sent to the HostWorker
#[derive(Debug)]
enum HostCommand {
    /// Add a reference on a topic
    Subscribe {
        topic: String,
        response_tx: oneshot::Sender<SubscribeReply>,
    },

    /// Check on a pending subscribe
    Poll {
        ticket: u64,
        final_attempt: bool,
        response_tx: oneshot::Sender<Option<SubscribeOutcome>>,
    },

    /// Drop a reference on a topic
    Unsubscribe {
        topic: String,
        response_tx: oneshot::Sender<UnsubscribeOutcome>,
    },

    /// Close the connection immediately, forgetting every subscriber
    Teardown { response_tx: oneshot::Sender<bool> },

    /// Read the reference count of a topic
    RefCount {
        topic: String,
        response_tx: oneshot::Sender<usize>,
    },

    /// The caller of a pending subscribe went away
    Abandon { ticket: u64 },

    /// Stop accepting subscribes if the host is idle
    Retire { response_tx: oneshot::Sender<bool> },
}

enum PendingSlot {
    Waiting {
        topic: String,
    },
    Resolved {
        topic: String,
        outcome: SubscribeOutcome,
    },
}

/// Worker task that owns every piece of mutable state for one host
pub struct HostWorker {
    host: String,
    ledger: SubscriptionLedger,
    supervisor: ConnectionSupervisor,
    /// Topics currently bound on the live session
    wire_topics: HashSet<String>,
    /// Pending subscribe requests by ticket
    pending: HashMap<u64, PendingSlot>,
    next_ticket: u64,
    /// Deferred releases by topic
    deferred: HashMap<String, (u64, CancellationToken)>,
    next_release: u64,
    unsubscribe_grace: Duration,
    dispatcher: MessageDispatcher,
    connection_rx: UnboundedReceiver<ConnectionEvent>,
    release_tx: UnboundedSender<(String, u64)>,
    release_rx: UnboundedReceiver<(String, u64)>,
    retired: bool,
}

impl HostWorker {
    pub fn new(
        host: &str,
        transport: Arc<dyn BrokerTransport>,
        dispatcher: MessageDispatcher,
        settings: WorkerSettings,
    ) -> Self {
        let (connection_tx, connection_rx) = mpsc::unbounded_channel();
        let (release_tx, release_rx) = mpsc::unbounded_channel();

        Self {
            host: host.to_owned(),
            ledger: SubscriptionLedger::new(),
            supervisor: ConnectionSupervisor::new(
                host,
                transport,
                dispatcher.clone(),
                connection_tx,
                settings.connect_timeout,
                settings.teardown_timeout,
            ),
            wire_topics: HashSet::new(),
            pending: HashMap::new(),
            next_ticket: 0,
            deferred: HashMap::new(),
            next_release: 0,
            unsubscribe_grace: settings.unsubscribe_grace,
            dispatcher,
            connection_rx,
            release_tx,
            release_rx,
            retired: false,
        }
    }

    /// Spawns the worker and returns the client to drive it
    ///
    /// The worker stops, tearing its connection down, once every client is dropped.
    pub fn start(self) -> (HostWorkerClient, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let client = HostWorkerClient {
            host: self.host.clone(),
            command_tx,
            state: self.supervisor.state_view(),
        };
        let handle = tokio::spawn(self.run(command_rx));
        (client, handle)
    }

    /// Main worker loop
    async fn run(mut self, mut command_rx: Receiver<HostCommand>) {
        debug!(host = %self.host, "Host worker started");
        loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(event) = self.connection_rx.recv() => self.handle_connection_event(event).await,
                Some((topic, id)) = self.release_rx.recv() => self.run_release(topic, id).await,
            }
        }

        self.cancel_deferred();
        self.supervisor.teardown().await;
        debug!(host = %self.host, "Host worker stopped");
    }

    /// Processes a single command
    async fn handle_command(&mut self, command: HostCommand) {
        match command {
            HostCommand::Subscribe { topic, response_tx } => {
                if self.retired {
                    let _ = response_tx.send(SubscribeReply::Retired);
                    return;
                }
                let reply = self.subscribe(topic.clone()).await;
                if let Err(reply) = response_tx.send(reply) {
                    debug!(host = %self.host, topic = %topic, "Subscriber left before the reply");
                    match reply {
                        SubscribeReply::Done(outcome) if outcome.is_active() => {
                            self.release_reference(&topic);
                        }
                        SubscribeReply::Pending(ticket) => self.abandon(ticket),
                        _ => {}
                    }
                }
            }
            HostCommand::Poll {
                ticket,
                final_attempt,
                response_tx,
            } => {
                let polled = self.poll(ticket, final_attempt);
                let outcome = polled.as_ref().map(|(_, outcome)| outcome.clone());
                if response_tx.send(outcome).is_err() {
                    if let Some((topic, outcome)) = polled {
                        if outcome.is_active() {
                            self.release_reference(&topic);
                        }
                    }
                }
            }
            HostCommand::Unsubscribe { topic, response_tx } => {
                let outcome = self.unsubscribe(&topic);
                let _ = response_tx.send(outcome);
            }
            HostCommand::Teardown { response_tx } => {
                let live = self.teardown().await;
                let _ = response_tx.send(live);
            }
            HostCommand::RefCount { topic, response_tx } => {
                let _ = response_tx.send(self.ledger.count(&self.host, &topic));
            }
            HostCommand::Abandon { ticket } => self.abandon(ticket),
            HostCommand::Retire { response_tx } => {
                let idle = self.is_idle();
                if idle {
                    debug!(host = %self.host, "Retiring idle host worker");
                    self.retired = true;
                }
                let _ = response_tx.send(idle);
            }
        }
    }

    fn is_idle(&self) -> bool {
        self.ledger.total_for_host(&self.host) == 0
            && self.pending.is_empty()
            && self.deferred.is_empty()
            && self.supervisor.state() == HostState::Absent
    }

    async fn subscribe(&mut self, topic: String) -> SubscribeReply {
        if let Err(err) = validate_topic_filter(&topic) {
            debug!(host = %self.host, topic = %topic, "Refusing topic filter: {}", err);
            return SubscribeReply::Done(SubscribeOutcome::Rejected(err.to_string()));
        }

        if let Some((_, token)) = self.deferred.remove(&topic) {
            debug!(host = %self.host, topic = %topic, "Subscriber returned, release aborted");
            token.cancel();
        }
        self.ledger.increment(&self.host, &topic);

        match self.supervisor.ensure_connecting() {
            HostState::Connected => SubscribeReply::Done(self.subscribe_on_wire(&topic).await),
            _ => {
                self.next_ticket += 1;
                let ticket = self.next_ticket;
                self.pending.insert(ticket, PendingSlot::Waiting { topic });
                SubscribeReply::Pending(ticket)
            }
        }
    }

    /// Issues the wire subscribe for a topic whose reference is already counted.
    async fn subscribe_on_wire(&mut self, topic: &str) -> SubscribeOutcome {
        if self.wire_topics.contains(topic) {
            return SubscribeOutcome::AlreadySubscribed;
        }

        match self.supervisor.subscribe(topic).await {
            Ok(()) => {
                info!(host = %self.host, topic, "Subscribed");
                self.wire_topics.insert(topic.to_owned());
                SubscribeOutcome::Subscribed
            }
            Err(TransportError::Timeout) => {
                self.on_wire_timeout(topic);
                SubscribeOutcome::Failed(RelayErrorCode::ConnectionFailed)
            }
            Err(err) => {
                warn!(host = %self.host, topic, "Wire subscribe failed: {}", err);
                self.release_reference(topic);
                match err {
                    TransportError::Rejected(reason) => SubscribeOutcome::Rejected(reason),
                    other => SubscribeOutcome::Failed(other.code()),
                }
            }
        }
    }

    /// Returns the outcome of a pending subscribe together with its topic once it is final.
    fn poll(&mut self, ticket: u64, final_attempt: bool) -> Option<(String, SubscribeOutcome)> {
        match self.pending.remove(&ticket) {
            Some(PendingSlot::Resolved { topic, outcome }) => Some((topic, outcome)),
            Some(PendingSlot::Waiting { topic }) if final_attempt => {
                warn!(host = %self.host, topic = %topic, "Subscribe retry budget exhausted");
                self.release_reference(&topic);
                Some((
                    topic,
                    SubscribeOutcome::Failed(RelayErrorCode::SubscribeTimeout),
                ))
            }
            Some(waiting) => {
                self.pending.insert(ticket, waiting);
                None
            }
            None => {
                warn!(host = %self.host, ticket, "Poll for unknown subscribe ticket");
                Some((
                    String::new(),
                    SubscribeOutcome::Failed(RelayErrorCode::ConnectionFailed),
                ))
            }
        }
    }

    /// Forgets a pending subscribe whose caller is gone, giving back any reference it holds.
    fn abandon(&mut self, ticket: u64) {
        let topic = match self.pending.remove(&ticket) {
            Some(PendingSlot::Waiting { topic }) => topic,
            Some(PendingSlot::Resolved { topic, outcome }) if outcome.is_active() => topic,
            _ => return,
        };
        debug!(host = %self.host, topic = %topic, ticket, "Pending subscribe abandoned");
        self.release_reference(&topic);
    }

    fn unsubscribe(&mut self, topic: &str) -> UnsubscribeOutcome {
        if self.ledger.count(&self.host, topic) == 0 {
            debug!(host = %self.host, topic, "Unsubscribe without subscription");
            return UnsubscribeOutcome::NotSubscribed;
        }

        // The newest waiting request for the topic gives up its reference.
        let waiting = self
            .pending
            .iter()
            .filter(|(_, slot)| matches!(slot, PendingSlot::Waiting { topic: t } if t == topic))
            .map(|(ticket, _)| *ticket)
            .max();
        if let Some(ticket) = waiting {
            self.pending.insert(
                ticket,
                PendingSlot::Resolved {
                    topic: topic.to_owned(),
                    outcome: SubscribeOutcome::Cancelled,
                },
            );
        }

        if self.release_reference(topic) > 0 {
            UnsubscribeOutcome::Decremented
        } else {
            UnsubscribeOutcome::Released
        }
    }

    /// Drops one reference and schedules the release once the topic has none left.
    fn release_reference(&mut self, topic: &str) -> usize {
        let remaining = self.ledger.decrement(&self.host, topic);
        if remaining == 0 {
            self.schedule_release(topic);
        }
        remaining
    }

    fn schedule_release(&mut self, topic: &str) {
        self.next_release += 1;
        let id = self.next_release;
        let token = CancellationToken::new();
        if let Some((_, previous)) = self
            .deferred
            .insert(topic.to_owned(), (id, token.clone()))
        {
            previous.cancel();
        }

        let grace = self.unsubscribe_grace;
        let release_tx = self.release_tx.clone();
        let topic = topic.to_owned();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(grace) => {
                    let _ = release_tx.send((topic, id));
                }
            }
        });
    }

    /// Runs a deferred release after re-validating it against the ledger.
    async fn run_release(&mut self, topic: String, id: u64) {
        match self.deferred.get(&topic) {
            Some((current, _)) if *current == id => {
                self.deferred.remove(&topic);
            }
            _ => return,
        }
        if self.ledger.count(&self.host, &topic) > 0 {
            return;
        }

        if self.wire_topics.remove(&topic) {
            match self.supervisor.unsubscribe(&topic).await {
                Ok(()) => info!(host = %self.host, topic = %topic, "Unsubscribed"),
                Err(TransportError::Timeout) => {
                    self.on_wire_timeout(&topic);
                    return;
                }
                Err(err) => {
                    warn!(host = %self.host, topic = %topic, "Wire unsubscribe failed: {}", err)
                }
            }
        }

        if self.ledger.total_for_host(&self.host) == 0 {
            self.cancel_deferred();
            self.wire_topics.clear();
            self.supervisor.teardown().await;
        }
    }

    async fn handle_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Handshake { epoch, result } => {
                match self.supervisor.on_handshake(epoch, result) {
                    HandshakeOutcome::Connected => self.on_connected().await,
                    HandshakeOutcome::Failed(err) => self.on_connection_lost(err.code()),
                    HandshakeOutcome::Stale => {}
                }
            }
            ConnectionEvent::Closed { epoch, reason } => {
                if self.supervisor.on_transport_closed(epoch, &reason) {
                    self.on_connection_lost(RelayErrorCode::ConnectionFailed);
                }
            }
        }
    }

    async fn on_connected(&mut self) {
        if self.ledger.total_for_host(&self.host) == 0 {
            debug!(host = %self.host, "Connected without subscribers");
            self.cancel_deferred();
            self.supervisor.teardown().await;
            return;
        }

        let mut waiting: Vec<(u64, String)> = self
            .pending
            .iter()
            .filter_map(|(ticket, slot)| match slot {
                PendingSlot::Waiting { topic } => Some((*ticket, topic.clone())),
                PendingSlot::Resolved { .. } => None,
            })
            .collect();
        waiting.sort_unstable_by_key(|(ticket, _)| *ticket);

        for (ticket, topic) in waiting {
            // A wire timeout on an earlier topic resolves the rest as failed.
            if !matches!(self.pending.get(&ticket), Some(PendingSlot::Waiting { .. })) {
                continue;
            }
            let outcome = self.subscribe_on_wire(&topic).await;
            self.pending
                .insert(ticket, PendingSlot::Resolved { topic, outcome });
        }
    }

    /// A wire call that never answered means the session is unusable.
    fn on_wire_timeout(&mut self, topic: &str) {
        warn!(host = %self.host, topic, "Wire call timed out, dropping connection");
        self.on_connection_lost(RelayErrorCode::ConnectionFailed);
        self.supervisor.abandon("wire call timed out");
    }

    /// Handshake failure or transport loss: every subscriber on the host is dropped and told.
    fn on_connection_lost(&mut self, code: RelayErrorCode) {
        self.resolve_waiting(SubscribeOutcome::Failed(code));

        self.cancel_deferred();
        self.wire_topics.clear();
        for topic in self.ledger.clear_host(&self.host) {
            self.dispatcher.dispatch_error(&self.host, &topic, code);
        }
    }

    async fn teardown(&mut self) -> bool {
        self.resolve_waiting(SubscribeOutcome::Failed(RelayErrorCode::ConnectionFailed));
        self.cancel_deferred();
        self.wire_topics.clear();
        self.ledger.clear_host(&self.host);
        self.supervisor.teardown().await
    }

    fn resolve_waiting(&mut self, outcome: SubscribeOutcome) {
        for slot in self.pending.values_mut() {
            let PendingSlot::Waiting { topic } = slot else {
                continue;
            };
            let topic = std::mem::take(topic);
            *slot = PendingSlot::Resolved {
                topic,
                outcome: outcome.clone(),
            };
        }
    }

    fn cancel_deferred(&mut self) {
        for (_, (_, token)) in self.deferred.drain() {
            token.cancel();
        }
    }
}

/// Client interface to interact with the HostWorker
#[derive(Clone, Debug)]
pub struct HostWorkerClient {
    host: String,
    command_tx: Sender<HostCommand>,
    state: Arc<RwLock<HostState>>,
}

impl HostWorkerClient {
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Connection state as last published by the worker.
    pub fn state(&self) -> HostState {
        *self.state.read()
    }

    /// Adds a reference on `topic`.
    ///
    /// # Returns
    /// The final outcome, or a ticket to poll while the host is connecting
    pub async fn subscribe(&self, topic: &str) -> Result<SubscribeReply, RelayError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(HostCommand::Subscribe {
            topic: topic.to_owned(),
            response_tx,
        })
        .await?;
        self.receive(response_rx).await
    }

    /// Checks on a pending subscribe.
    ///
    /// With `final_attempt` set, a request that is still waiting is resolved as timed out.
    pub async fn poll(
        &self,
        ticket: u64,
        final_attempt: bool,
    ) -> Result<Option<SubscribeOutcome>, RelayError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(HostCommand::Poll {
            ticket,
            final_attempt,
            response_tx,
        })
        .await?;
        self.receive(response_rx).await
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<UnsubscribeOutcome, RelayError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(HostCommand::Unsubscribe {
            topic: topic.to_owned(),
            response_tx,
        })
        .await?;
        self.receive(response_rx).await
    }

    /// Closes the host's connection now.
    ///
    /// # Returns
    /// Whether a connection (live or connecting) was torn down
    pub async fn teardown(&self) -> Result<bool, RelayError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(HostCommand::Teardown { response_tx }).await?;
        self.receive(response_rx).await
    }

    pub async fn ref_count(&self, topic: &str) -> Result<usize, RelayError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(HostCommand::RefCount {
            topic: topic.to_owned(),
            response_tx,
        })
        .await?;
        self.receive(response_rx).await
    }

    /// Tells the worker that the caller of pending `ticket` is gone.
    ///
    /// Usable from `Drop`: the command is queued without waiting, or handed to a task when the
    /// queue is full.
    pub fn abandon(&self, ticket: u64) {
        match self.command_tx.try_send(HostCommand::Abandon { ticket }) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(command)) => {
                if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                    let command_tx = self.command_tx.clone();
                    runtime.spawn(async move {
                        let _ = command_tx.send(command).await;
                    });
                }
            }
        }
    }

    /// Asks the worker to stop taking subscribes if it holds nothing.
    ///
    /// # Returns
    /// Whether the worker is idle and now retired
    pub async fn retire(&self) -> Result<bool, RelayError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(HostCommand::Retire { response_tx }).await?;
        self.receive(response_rx).await
    }

    /// Whether both clients drive the same worker.
    pub fn same_worker(&self, other: &HostWorkerClient) -> bool {
        self.command_tx.same_channel(&other.command_tx)
    }

    async fn send(&self, command: HostCommand) -> Result<(), RelayError> {
        self.command_tx.send(command).await.map_err(|_| {
            RelayError::WorkerUnavailable(format!("{} worker channel closed", self.host))
        })
    }

    async fn receive<T>(&self, response_rx: oneshot::Receiver<T>) -> Result<T, RelayError> {
        response_rx.await.map_err(|_| {
            RelayError::WorkerUnavailable(format!(
                "failed to receive response from {} worker",
                self.host
            ))
        })
    }
}
