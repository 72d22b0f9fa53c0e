//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// Shutdown drain. All host connections are torn down concurrently and the whole drain is raced
// against one global timeout; a drain that runs out of time reports the hosts it could not
// confirm instead of failing.
//--------------------------------------------------------------------------------------------------

use std::collections::BTreeSet;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::domain::models::types::DrainOutcome;
use crate::domain::services::relay::HostWorkerClient;

#[derive(Debug, Clone, Copy)]
pub struct DrainController {
    timeout: Duration,
}

impl DrainController {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Tears down every host behind `clients` within the global timeout.
    pub async fn drain_all(&self, clients: Vec<HostWorkerClient>) -> DrainOutcome {
        if clients.is_empty() {
            return DrainOutcome::Drained { closed: 0 };
        }

        let mut pending: BTreeSet<String> = BTreeSet::new();
        let mut set = JoinSet::new();
        for client in clients {
            pending.insert(client.host().to_owned());
            set.spawn(async move {
                let result = client.teardown().await;
                (client.host().to_owned(), result)
            });
        }

        let mut closed = 0;
        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                joined = set.join_next() => match joined {
                    Some(Ok((host, result))) => {
                        pending.remove(&host);
                        match result {
                            Ok(true) => closed += 1,
                            Ok(false) => {}
                            Err(err) => warn!(host = %host, "Drain could not reach host: {}", err),
                        }
                    }
                    Some(Err(err)) => warn!("Drain task failed: {}", err),
                    None => break,
                },
                _ = &mut deadline => {
                    set.abort_all();
                    let pending: Vec<String> = pending.into_iter().collect();
                    warn!(?pending, "Drain timed out after {:?}", self.timeout);
                    return DrainOutcome::TimedOut { closed, pending };
                }
            }
        }

        info!(closed, "Drained all broker connections");
        DrainOutcome::Drained { closed }
    }
}
