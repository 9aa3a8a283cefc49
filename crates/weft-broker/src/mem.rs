//! In-process broker.
//!
//! One [`MemBroker`] instance backs both ends: producers append to a
//! per-topic queue, consumers pull from it, and `requeue` puts the message
//! at the back again.  Every publish is also recorded so tests can assert
//! exact delivery counts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::{Ack, BrokerError, Consumer, Delivery, Producer, Topic};

struct TopicQueue {
    tx: mpsc::UnboundedSender<Bytes>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
    log: Mutex<Vec<Bytes>>,
}

/// In-memory broker implementing [`Producer`] directly and handing out one
/// [`MemConsumer`] per topic.
pub struct MemBroker {
    topics: HashMap<Topic, TopicQueue>,
}

impl MemBroker {
    pub fn new() -> Arc<Self> {
        let mut topics = HashMap::new();
        for topic in [Topic::Train, Topic::Predict] {
            let (tx, rx) = mpsc::unbounded_channel();
            topics.insert(
                topic,
                TopicQueue {
                    tx,
                    rx: Mutex::new(Some(rx)),
                    log: Mutex::new(Vec::new()),
                },
            );
        }
        Arc::new(Self { topics })
    }

    /// Take the consumer end of a topic.
    ///
    /// # Panics
    ///
    /// Panics if called twice for the same topic; a topic has exactly one
    /// subscriber per process.
    pub fn consumer(&self, topic: Topic) -> MemConsumer {
        let queue = &self.topics[&topic];
        let rx = queue
            .rx
            .lock()
            .unwrap()
            .take()
            .expect("mem broker topic already has a consumer");
        MemConsumer {
            rx,
            requeue_tx: queue.tx.clone(),
        }
    }

    /// Every message ever published to `topic`, in publish order.
    pub fn published(&self, topic: Topic) -> Vec<Bytes> {
        self.topics[&topic].log.lock().unwrap().clone()
    }

    pub fn publish_count(&self, topic: Topic) -> usize {
        self.topics[&topic].log.lock().unwrap().len()
    }
}

#[async_trait]
impl Producer for MemBroker {
    async fn publish(&self, topic: Topic, body: Vec<u8>) -> Result<(), BrokerError> {
        let queue = &self.topics[&topic];
        let body = Bytes::from(body);
        queue.log.lock().unwrap().push(body.clone());
        queue.tx.send(body).map_err(|_| BrokerError::Closed)
    }
}

/// Consumer end of one in-memory topic.
pub struct MemConsumer {
    rx: mpsc::UnboundedReceiver<Bytes>,
    requeue_tx: mpsc::UnboundedSender<Bytes>,
}

struct MemAck {
    body: Bytes,
    requeue_tx: mpsc::UnboundedSender<Bytes>,
}

#[async_trait]
impl Ack for MemAck {
    async fn finish(self: Box<Self>) {}

    async fn requeue(self: Box<Self>) {
        // Requeue failure only happens at shutdown, when redelivery is moot.
        let _ = self.requeue_tx.send(self.body);
    }
}

#[async_trait]
impl Consumer for MemConsumer {
    async fn next(&mut self) -> Option<Delivery> {
        let body = self.rx.recv().await?;
        let acker = MemAck {
            body: body.clone(),
            requeue_tx: self.requeue_tx.clone(),
        };
        Some(Delivery::new(body, Box::new(acker)))
    }
}
