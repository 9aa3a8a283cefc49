//! Message-broker abstraction for task distribution.
//!
//! The gateway publishes uplets, the worker consumes them; both sides only
//! see the [`Producer`] and [`Consumer`] traits.  [`mem`] provides the
//! in-process broker used by tests and by `BrokerKind::Mem`; [`nsq`] binds
//! the same traits onto an external NSQ deployment.  Delivery is
//! at-least-once: a handler acknowledges with [`Delivery::finish`] or asks
//! for redelivery with [`Delivery::requeue`].

pub mod mem;
pub mod nsq;

use std::str::FromStr;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

pub use mem::MemBroker;
pub use nsq::{NsqConsumer, NsqProducer};

/// Broker topics carrying uplet messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Topic {
    /// Learn-uplets.
    Train,
    /// Pred-uplets.
    Predict,
}

/// Which broker implementation a process should wire up.
///
/// An explicit enum: historically an empty broker host silently selected a
/// mock, which made misconfiguration indistinguishable from intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerKind {
    /// External NSQ deployment.
    Nsq,
    /// In-process broker; relay, dispatcher and tests share one instance.
    Mem,
}

impl FromStr for BrokerKind {
    type Err = BrokerError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.to_ascii_lowercase().as_str() {
            "nsq" => Ok(BrokerKind::Nsq),
            // "mock" kept as an alias for compatibility with older configs.
            "mem" | "mock" => Ok(BrokerKind::Mem),
            _ => Err(BrokerError::UnknownKind {
                kind: raw.to_owned(),
            }),
        }
    }
}

impl std::fmt::Display for BrokerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerKind::Nsq => write!(f, "nsq"),
            BrokerKind::Mem => write!(f, "mem"),
        }
    }
}

/// Errors surfaced by broker implementations.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("unsupported broker kind: {kind} (available: nsq, mem)")]
    UnknownKind { kind: String },

    #[error("invalid topic or channel name: {name}")]
    InvalidName { name: String },

    #[error("publishing to {topic} failed: {reason}")]
    Publish { topic: Topic, reason: String },

    #[error("broker connection closed")]
    Closed,
}

/// Publish messages onto a topic.
#[async_trait]
pub trait Producer: Send + Sync {
    async fn publish(&self, topic: Topic, body: Vec<u8>) -> Result<(), BrokerError>;
}

/// Acknowledgement backend of one delivery.
#[async_trait]
pub trait Ack: Send {
    /// Mark the message as handled.
    async fn finish(self: Box<Self>);
    /// Hand the message back for redelivery.
    async fn requeue(self: Box<Self>);
}

/// One message pulled from a topic.
pub struct Delivery {
    pub body: Bytes,
    acker: Box<dyn Ack>,
}

impl Delivery {
    pub fn new(body: Bytes, acker: Box<dyn Ack>) -> Self {
        Self { body, acker }
    }

    /// Acknowledge successful handling.
    pub async fn finish(self) {
        self.acker.finish().await;
    }

    /// Request redelivery; the broker will hand the message out again.
    pub async fn requeue(self) {
        self.acker.requeue().await;
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("len", &self.body.len())
            .finish()
    }
}

/// Pull messages from one topic.
#[async_trait]
pub trait Consumer: Send {
    /// Next delivery, or `None` once the subscription is closed.
    async fn next(&mut self) -> Option<Delivery>;
}
