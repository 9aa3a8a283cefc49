//! NSQ bindings for the [`Producer`] and [`Consumer`] traits.
//!
//! The broker library itself is an external collaborator; this module only
//! adapts tokio-nsq's producer and lookupd-discovering consumer onto the
//! crate's two traits.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use bytes::Bytes;
use tokio_nsq::{
    NSQChannel, NSQConsumer, NSQConsumerConfig, NSQConsumerConfigSources,
    NSQConsumerLookupConfig, NSQMessage, NSQProducer, NSQProducerConfig, NSQRequeueDelay,
    NSQTopic,
};
use tracing::warn;

use crate::{Ack, BrokerError, Consumer, Delivery, Producer, Topic};

fn nsq_topic(topic: Topic) -> Result<std::sync::Arc<NSQTopic>, BrokerError> {
    NSQTopic::new(topic.to_string()).ok_or(BrokerError::InvalidName {
        name: topic.to_string(),
    })
}

/// Publisher over a single nsqd TCP connection.
pub struct NsqProducer {
    // tokio-nsq producers take `&mut self` to publish; serialise access.
    producer: tokio::sync::Mutex<NSQProducer>,
    topics: HashMap<Topic, std::sync::Arc<NSQTopic>>,
}

impl NsqProducer {
    /// Connect to the nsqd instance at `host:port`.
    pub fn connect(host: &str, port: u16) -> Result<Self, BrokerError> {
        let mut topics = HashMap::new();
        for topic in [Topic::Train, Topic::Predict] {
            topics.insert(topic, nsq_topic(topic)?);
        }
        let producer = NSQProducerConfig::new(format!("{host}:{port}")).build();
        Ok(Self {
            producer: tokio::sync::Mutex::new(producer),
            topics,
        })
    }
}

#[async_trait]
impl Producer for NsqProducer {
    async fn publish(&self, topic: Topic, body: Vec<u8>) -> Result<(), BrokerError> {
        let nsq_topic = &self.topics[&topic];
        let mut producer = self.producer.lock().await;
        producer
            .publish(nsq_topic, body)
            .await
            .map_err(|e| BrokerError::Publish {
                topic,
                reason: e.to_string(),
            })
    }
}

/// Subscriber on one topic, discovering nsqd instances via nsqlookupd.
pub struct NsqConsumer {
    consumer: NSQConsumer,
}

impl NsqConsumer {
    /// Subscribe to `topic` on `channel`, polling the given nsqlookupd
    /// HTTP endpoints for producers.
    pub fn connect(
        topic: Topic,
        channel: &str,
        lookupd_urls: &[String],
        max_in_flight: u32,
    ) -> Result<Self, BrokerError> {
        let nsq_topic = nsq_topic(topic)?;
        let nsq_channel = NSQChannel::new(channel).ok_or(BrokerError::InvalidName {
            name: channel.to_owned(),
        })?;

        let addresses: HashSet<String> = lookupd_urls.iter().cloned().collect();
        let consumer = NSQConsumerConfig::new(nsq_topic, nsq_channel)
            .set_max_in_flight(max_in_flight)
            .set_sources(NSQConsumerConfigSources::Lookup(
                NSQConsumerLookupConfig::new().set_addresses(addresses),
            ))
            .build();

        Ok(Self { consumer })
    }
}

struct NsqAck {
    message: NSQMessage,
}

#[async_trait]
impl Ack for NsqAck {
    async fn finish(self: Box<Self>) {
        self.message.finish().await;
    }

    async fn requeue(self: Box<Self>) {
        self.message.requeue(NSQRequeueDelay::DefaultDelay).await;
    }
}

#[async_trait]
impl Consumer for NsqConsumer {
    async fn next(&mut self) -> Option<Delivery> {
        match self.consumer.consume_filtered().await {
            Some(message) => {
                let body = Bytes::from(message.body.clone());
                Some(Delivery::new(body, Box::new(NsqAck { message })))
            }
            None => {
                warn!("nsq consumer stream ended");
                None
            }
        }
    }
}
