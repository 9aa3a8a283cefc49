//! Ingestion relay: forwards freshly published ledger tasks to the broker.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use weft_broker::{Producer, Topic};
use weft_clients::Ledger;
use weft_types::TaskStatus;

/// Periodically polls the ledger for `todo` learn-uplets and publishes each
/// one to the `train` topic at most once per process lifetime.
///
/// The forwarded-key set lives in memory only: after a restart the same
/// task may be republished, and the pipelines' deterministic workspace
/// teardown absorbs the duplicate, the same property broker redelivery
/// already requires.
pub struct Relay {
    ledger: Arc<dyn Ledger>,
    producer: Arc<dyn Producer>,
    period: Duration,
    /// Keys already forwarded, oldest first.
    published: VecDeque<String>,
    /// Membership index over `published`.
    published_set: HashSet<String>,
}

impl Relay {
    pub fn new(ledger: Arc<dyn Ledger>, producer: Arc<dyn Producer>, period: Duration) -> Self {
        Self {
            ledger,
            producer,
            period,
            published: VecDeque::new(),
            published_set: HashSet::new(),
        }
    }

    /// Run the relay loop until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(period_secs = self.period.as_secs(), "relay started");
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            self.tick().await;
        }
        info!("relay stopped");
    }

    /// One poll-and-forward round.
    pub async fn tick(&mut self) {
        let uplets = match self.ledger.query_learnuplets(TaskStatus::Todo).await {
            Ok(uplets) => uplets,
            Err(e) => {
                warn!(error = %e, "ledger query failed; skipping tick");
                return;
            }
        };

        let mut todo_keys: HashSet<String> = HashSet::with_capacity(uplets.len());
        for uplet in &uplets {
            if let Err(e) = uplet.validate() {
                warn!(key = %uplet.key, error = %e, "dropping invalid learn-uplet");
                continue;
            }
            todo_keys.insert(uplet.key.clone());

            if self.published_set.contains(&uplet.key) {
                continue;
            }

            let body = match serde_json::to_vec(uplet) {
                Ok(body) => body,
                Err(e) => {
                    warn!(key = %uplet.key, error = %e, "failed to serialise learn-uplet");
                    continue;
                }
            };
            match self.producer.publish(Topic::Train, body).await {
                Ok(()) => {
                    debug!(key = %uplet.key, "learn-uplet forwarded to broker");
                    self.published.push_back(uplet.key.clone());
                    self.published_set.insert(uplet.key.clone());
                }
                // Not marked published: the next tick retries.
                Err(e) => warn!(key = %uplet.key, error = %e, "publish failed"),
            }
        }

        // Prune from the front only, stopping at the first key that is
        // still pending on the ledger; keys behind it stay regardless.
        while let Some(front) = self.published.front() {
            if todo_keys.contains(front) {
                break;
            }
            let key = self.published.pop_front().unwrap_or_default();
            self.published_set.remove(&key);
            debug!(key, "forwarded key pruned");
        }
    }

    /// Number of keys currently remembered as forwarded.
    pub fn tracked_keys(&self) -> usize {
        self.published.len()
    }
}
