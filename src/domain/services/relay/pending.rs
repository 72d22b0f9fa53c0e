use std::time::Duration;

use tokio::time::{Instant, sleep_until};
use tracing::{debug, error};

use super::host_worker::HostWorkerClient;
use crate::domain::models::types::{RelayErrorCode, SubscribeOutcome};

/// Retry budget for a subscribe issued while its host is connecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Number of polls before giving up
    pub attempts: u32,
    /// Delay between polls
    pub interval: Duration,
    /// Upper bound on the total wait
    pub ceiling: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 4,
            interval: Duration::from_millis(500),
            ceiling: Duration::from_secs(2),
        }
    }
}

/// A subscribe waiting for its host's handshake.
///
/// The worker resolves the request as soon as the handshake completes; the request polls for that
/// resolution on a fixed interval. The last poll, by attempt count or by deadline, tells the
/// worker to give up, which rolls the ledger increment back and yields `SubscribeTimeout`.
///
/// Dropping the request before it resolved hands its ticket back to the worker, which releases
/// the reference the request holds.
#[derive(Debug)]
pub struct PendingSubscribeRequest {
    pub host: String,
    pub topic: String,
    pub ticket: u64,
    pub attempts_remaining: u32,
    pub deadline: Instant,
    interval: Duration,
    client: HostWorkerClient,
    resolved: bool,
}

impl PendingSubscribeRequest {
    pub fn new(client: HostWorkerClient, topic: &str, ticket: u64, policy: RetryPolicy) -> Self {
        Self {
            host: client.host().to_owned(),
            topic: topic.to_owned(),
            ticket,
            attempts_remaining: policy.attempts.max(1),
            deadline: Instant::now() + policy.ceiling,
            interval: policy.interval,
            client,
            resolved: false,
        }
    }

    /// Waits for the outcome of the request.
    pub async fn resolve(mut self) -> SubscribeOutcome {
        let outcome = self.wait_for_outcome().await;
        self.resolved = true;
        outcome
    }

    async fn wait_for_outcome(&mut self) -> SubscribeOutcome {
        loop {
            let wake = (Instant::now() + self.interval).min(self.deadline);
            sleep_until(wake).await;

            self.attempts_remaining = self.attempts_remaining.saturating_sub(1);
            let final_attempt = self.attempts_remaining == 0 || Instant::now() >= self.deadline;

            match self.client.poll(self.ticket, final_attempt).await {
                Ok(Some(outcome)) => return outcome,
                Ok(None) => {
                    debug!(
                        host = %self.host,
                        topic = %self.topic,
                        attempts_remaining = self.attempts_remaining,
                        "Host still connecting"
                    );
                }
                Err(err) => {
                    error!(host = %self.host, topic = %self.topic, "Pending subscribe lost: {}", err);
                    return SubscribeOutcome::Failed(RelayErrorCode::ConnectionFailed);
                }
            }
        }
    }
}

impl Drop for PendingSubscribeRequest {
    fn drop(&mut self) {
        if !self.resolved {
            debug!(host = %self.host, topic = %self.topic, ticket = self.ticket, "Pending subscribe dropped");
            self.client.abandon(self.ticket);
        }
    }
}
