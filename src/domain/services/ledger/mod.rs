//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// Reference counts of active subscribers per (host, topic). Pure bookkeeping with no I/O, only
// ever touched from inside a host's worker so no locking is needed.
//
// | Name                | Description                                   | Key Methods          |
// |---------------------|-----------------------------------------------|----------------------|
// | SubscriptionLedger  | (host, topic) -> active subscriber count      | increment, decrement |
// |                     |                                               | total_for_host       |
// |                     |                                               | topics, clear_host   |
//--------------------------------------------------------------------------------------------------

use std::collections::HashMap;

/// Per-host map of topic to active-subscriber count.
///
/// Entries that reach zero are removed, so `topics` only ever lists referenced topics.
#[derive(Debug, Default, Clone)]
pub struct SubscriptionLedger {
    hosts: HashMap<String, HashMap<String, usize>>,
}

impl SubscriptionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one reference and returns the new count.
    pub fn increment(&mut self, host: &str, topic: &str) -> usize {
        let count = self
            .hosts
            .entry(host.to_owned())
            .or_default()
            .entry(topic.to_owned())
            .or_insert(0);
        *count += 1;
        *count
    }

    /// Drops one reference and returns the new count.
    ///
    /// A missing or zero entry is left alone and reports 0.
    pub fn decrement(&mut self, host: &str, topic: &str) -> usize {
        let Some(topics) = self.hosts.get_mut(host) else {
            return 0;
        };
        let Some(count) = topics.get_mut(topic) else {
            return 0;
        };

        *count = count.saturating_sub(1);
        let remaining = *count;
        if remaining == 0 {
            topics.remove(topic);
            if topics.is_empty() {
                self.hosts.remove(host);
            }
        }
        remaining
    }

    pub fn count(&self, host: &str, topic: &str) -> usize {
        self.hosts
            .get(host)
            .and_then(|topics| topics.get(topic))
            .copied()
            .unwrap_or(0)
    }

    /// Sum of all topic counts for `host`.
    pub fn total_for_host(&self, host: &str) -> usize {
        self.hosts
            .get(host)
            .map(|topics| topics.values().sum())
            .unwrap_or(0)
    }

    /// Topics of `host` with a non-zero count, sorted.
    pub fn topics(&self, host: &str) -> Vec<String> {
        let mut topics: Vec<String> = self
            .hosts
            .get(host)
            .map(|topics| topics.keys().cloned().collect())
            .unwrap_or_default();
        topics.sort();
        topics
    }

    /// Forgets every reference on `host` and returns the topics that were held.
    pub fn clear_host(&mut self, host: &str) -> Vec<String> {
        let mut topics: Vec<String> = self
            .hosts
            .remove(host)
            .map(|topics| topics.into_keys().collect())
            .unwrap_or_default();
        topics.sort();
        topics
    }
}
