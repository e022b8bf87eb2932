//! Broker port - the durable queue the worker consumes from.
//!
//! The broker is an opaque FIFO service reached over the network. These
//! traits are the seam between the worker loop and a concrete client
//! (`impls::amqp` for RabbitMQ, `impls::inmem_broker` for development).
//!
//! Ownership: the worker loop owns the `Broker` handle it got from a
//! `Connector`. Nothing else closes or reopens it.

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::Envelope;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("connecting to {endpoint} failed: {reason}")]
    Connect { endpoint: String, reason: String },

    #[error("declaring queue '{queue}' failed: {reason}")]
    QueueDeclare { queue: String, reason: String },

    #[error("starting consumer on '{queue}' failed: {reason}")]
    Consume { queue: String, reason: String },

    #[error("acknowledgement of delivery {delivery_tag} failed: {reason}")]
    Ack { delivery_tag: u64, reason: String },

    #[error("publishing to '{queue}' failed: {reason}")]
    Publish { queue: String, reason: String },

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("channel is closed")]
    ChannelClosed,

    #[error("closing connection failed: {0}")]
    Close(String),
}

impl BrokerError {
    /// The link to the broker is gone (as opposed to a refused operation).
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, BrokerError::ConnectionLost(_) | BrokerError::ChannelClosed)
    }
}

/// When deliveries count as consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    /// Ack after dispatch. A crash mid-dispatch gets the message redelivered.
    #[default]
    Manual,

    /// Broker auto-ack: consumed on receipt, lost if the worker crashes
    /// mid-dispatch.
    Auto,
}

impl AckMode {
    pub fn as_str(self) -> &'static str {
        match self {
            AckMode::Manual => "manual",
            AckMode::Auto => "auto",
        }
    }
}

impl std::str::FromStr for AckMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "manual" => Ok(AckMode::Manual),
            "auto" => Ok(AckMode::Auto),
            other => Err(format!("unknown ack mode '{other}' (expected manual or auto)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
}

impl QueueSpec {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeOptions {
    pub consumer_tag: String,
    pub ack_mode: AckMode,
    /// Unacked deliveries the broker may push ahead (manual mode only).
    pub prefetch: u16,
}

/// One delivered message. The owner must settle it exactly once.
#[async_trait]
pub trait Delivery: Send {
    fn delivery_tag(&self) -> u64;

    /// The broker delivered this message before and it was never acked.
    fn redelivered(&self) -> bool;

    fn envelope(&self) -> &Envelope;

    /// Mark handled. A no-op in auto-ack mode.
    async fn ack(self: Box<Self>) -> Result<(), BrokerError>;

    /// Refuse the message, optionally putting it back on the queue.
    async fn reject(self: Box<Self>, requeue: bool) -> Result<(), BrokerError>;
}

/// A registered consumer on one queue.
#[async_trait]
pub trait Consumer: Send {
    fn tag(&self) -> &str;

    /// Wait for the next delivery.
    ///
    /// Returns `None` once the consumer is cancelled or the connection is gone.
    /// Must be cancel-safe: dropping the future loses no message.
    async fn next(&mut self) -> Option<Result<Box<dyn Delivery>, BrokerError>>;
}

/// An open connection + channel.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare the queue, creating it if absent. Declaring an existing queue
    /// with different durability is an error.
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError>;

    async fn consume(
        &self,
        queue: &str,
        options: &ConsumeOptions,
    ) -> Result<Box<dyn Consumer>, BrokerError>;

    /// Stop deliveries to a consumer. Unknown tags are ignored.
    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError>;

    /// Publish a persistent message to `queue` through the default exchange.
    async fn publish(&self, queue: &str, envelope: &Envelope) -> Result<(), BrokerError>;

    /// Release channel and connection. Safe to call any number of times.
    async fn close(&self) -> Result<(), BrokerError>;

    fn is_connected(&self) -> bool;
}

/// Opens broker connections. Kept separate from `Broker` so the lifecycle
/// controller can reconnect.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Where this connector points, for logs (never includes credentials).
    fn endpoint(&self) -> String;

    async fn connect(&self) -> Result<Arc<dyn Broker>, BrokerError>;
}
