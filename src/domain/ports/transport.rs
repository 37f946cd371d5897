use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::domain::models::DispatchError;

/// Exchange types a transport can declare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    Topic,
    Direct,
    Fanout,
}

/// A message handed to a consumer, waiting for ack or nack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub routing_key: String,
    pub redelivered: bool,
    pub body: Vec<u8>,
}

/// A message to publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub routing_key: String,
    pub body: Vec<u8>,
    pub request_id: Option<String>,
    pub message_id: Option<String>,
}

/// A started consumer. The receiver yields `None` once the consumer is
/// cancelled or the connection is lost.
#[derive(Debug)]
pub struct Consumer {
    pub consumer_tag: String,
    pub deliveries: UnboundedReceiver<Delivery>,
}

/// Errors reported by a broker transport
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("broker unreachable: {0}")]
    Unreachable(String),

    #[error("transport is not connected")]
    NotConnected,

    #[error("topology error: {0}")]
    Topology(String),

    #[error("consume error: {0}")]
    Consume(String),

    #[error("acknowledgement error: {0}")]
    Acknowledge(String),

    #[error("publish error: {0}")]
    Publish(String),

    #[error("close error: {0}")]
    Close(String),
}

impl From<TransportError> for DispatchError {
    fn from(err: TransportError) -> Self {
        DispatchError::Connection(err.to_string())
    }
}

/// Thin abstraction over a topic-exchange message broker with AMQP-like
/// semantics: one connection and one channel per process, durable exchanges
/// and queues, wildcard bindings, manual ack/nack.
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Opens the connection and channel; a no-op when already open
    async fn connect(&self) -> Result<(), TransportError>;

    async fn is_connected(&self) -> bool;

    /// Declares an exchange; identical redeclaration is a no-op
    async fn assert_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), TransportError>;

    /// Declares a queue; identical redeclaration is a no-op
    async fn assert_queue(&self, name: &str, durable: bool) -> Result<(), TransportError>;

    /// Binds a queue to an exchange; binding the same pair twice is a no-op
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError>;

    /// Sets the unacknowledged-delivery window for consumers started afterwards
    async fn set_prefetch(&self, prefetch_count: u16) -> Result<(), TransportError>;

    async fn consume(&self, queue: &str) -> Result<Consumer, TransportError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError>;

    async fn publish(&self, exchange: &str, message: OutboundMessage) -> Result<(), TransportError>;

    /// Closes the channel and then the connection; safe when never connected
    async fn close(&self) -> Result<(), TransportError>;
}
