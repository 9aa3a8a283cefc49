//! Broker consumer with per-topic parallelism caps, per-task budgets and
//! graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use weft_broker::{Consumer, Delivery, Topic};

use crate::error::ComputeError;
use crate::worker::Worker;

/// How long a cancelled task gets to finish its cleanup before the
/// dispatcher abandons it.
const CLEANUP_GRACE: Duration = Duration::from_secs(30);

/// Per-topic dispatch settings.
#[derive(Debug, Clone, Copy)]
pub struct TopicConfig {
    /// Maximum number of simultaneously executing handlers.
    pub parallelism: usize,
    /// Wall-clock budget for one task.
    pub timeout: Duration,
}

/// Handles one delivery for one topic.
///
/// Handlers must be idempotent across redeliveries; the pipelines guarantee
/// this by tearing down any previous workspace state when they start.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        topic: Topic,
        body: &[u8],
        cancel: &CancellationToken,
    ) -> Result<(), ComputeError>;
}

#[async_trait]
impl TaskHandler for Worker {
    async fn handle(
        &self,
        topic: Topic,
        body: &[u8],
        cancel: &CancellationToken,
    ) -> Result<(), ComputeError> {
        match topic {
            Topic::Train => self.handle_learn(body, cancel).await,
            Topic::Predict => self.handle_pred(body, cancel).await,
        }
    }
}

/// One subscription the dispatcher should serve.
pub struct Subscription {
    pub topic: Topic,
    pub consumer: Box<dyn Consumer>,
    pub config: TopicConfig,
}

/// Pulls deliveries from the broker and runs them through a [`TaskHandler`]
/// under bounded concurrency.
///
/// Delivery semantics are at-least-once: a handler success acknowledges the
/// message, a retryable failure requeues it, and a non-retryable failure is
/// acknowledged after the task has been reported `failed`; redelivering a
/// task that cannot succeed only burns broker retries.
pub struct Dispatcher {
    handler: Arc<dyn TaskHandler>,
    shutdown: CancellationToken,
    drain_deadline: Duration,
}

impl Dispatcher {
    pub fn new(handler: Arc<dyn TaskHandler>, drain_deadline: Duration) -> Self {
        Self {
            handler,
            shutdown: CancellationToken::new(),
            drain_deadline,
        }
    }

    /// Token that stops intake when cancelled; in-flight tasks then drain
    /// up to the drain deadline.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serve the given subscriptions until shutdown.
    pub async fn run(&self, subscriptions: Vec<Subscription>) {
        let mut topics = JoinSet::new();
        for sub in subscriptions {
            let handler = Arc::clone(&self.handler);
            let shutdown = self.shutdown.clone();
            let drain_deadline = self.drain_deadline;
            topics.spawn(async move {
                run_topic(handler, sub, shutdown, drain_deadline).await;
            });
        }
        while topics.join_next().await.is_some() {}
        info!("dispatcher stopped");
    }
}

async fn run_topic(
    handler: Arc<dyn TaskHandler>,
    mut sub: Subscription,
    shutdown: CancellationToken,
    drain_deadline: Duration,
) {
    let topic = sub.topic;
    let semaphore = Arc::new(Semaphore::new(sub.config.parallelism));
    // Parent of every in-flight task's token; cancelled only when the drain
    // deadline expires.
    let force_cancel = CancellationToken::new();
    let mut tasks = JoinSet::new();

    info!(%topic, parallelism = sub.config.parallelism, "subscribed");

    loop {
        // Stop accepting new messages as soon as shutdown is requested.
        let delivery = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = sub.consumer.next() => match next {
                Some(delivery) => delivery,
                None => break,
            },
        };

        // The permit bounds in-flight tasks; intake waits here when the
        // topic is saturated.
        let permit = tokio::select! {
            _ = shutdown.cancelled() => {
                delivery.requeue().await;
                break;
            }
            permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let handler = Arc::clone(&handler);
        let cancel = force_cancel.child_token();
        let budget = sub.config.timeout;
        tasks.spawn(async move {
            let _permit = permit;
            handle_delivery(handler, topic, delivery, budget, cancel).await;
        });

        // Reap finished tasks so the join set does not grow unboundedly.
        while let Some(Some(_)) = tasks.join_next().now_or_never() {}
    }

    // Drain in-flight tasks, then force-cancel the stragglers.
    let drained = tokio::time::timeout(drain_deadline, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(%topic, "drain deadline exceeded; cancelling in-flight tasks");
        force_cancel.cancel();
        while tasks.join_next().await.is_some() {}
    }
    info!(%topic, "topic drained");
}

/// Run one delivery to completion under its budget and settle it with the
/// broker.
async fn handle_delivery(
    handler: Arc<dyn TaskHandler>,
    topic: Topic,
    delivery: Delivery,
    budget: Duration,
    cancel: CancellationToken,
) {
    let body = delivery.body.clone();
    let fut = handler.handle(topic, &body, &cancel);
    tokio::pin!(fut);

    let result = tokio::select! {
        res = &mut fut => res,
        _ = tokio::time::sleep(budget) => {
            warn!(%topic, "task exceeded its budget; cancelling");
            cancel.cancel();
            // Give the handler a bounded window to run its cleanup
            // (terminate the container, remove the workspace).
            match tokio::time::timeout(CLEANUP_GRACE, &mut fut).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(ComputeError::Cancelled)) => Err(ComputeError::Timeout),
                Ok(Err(err)) => Err(err),
                Err(_) => {
                    error!(%topic, "task did not settle after cancellation");
                    Err(ComputeError::Timeout)
                }
            }
        }
    };

    match result {
        Ok(()) => delivery.finish().await,
        Err(err) if err.is_retryable() => {
            warn!(%topic, error = %err, "task failed; requeueing");
            delivery.requeue().await;
        }
        Err(err) => {
            error!(%topic, error = %err, "task failed permanently");
            delivery.finish().await;
        }
    }
}
