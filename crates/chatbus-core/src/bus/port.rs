use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::Result;

/// Broker exchange flavours the backbone declares.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Pattern routing on dot-separated routing keys (`*` one word, `#` any).
    Topic,
    /// Exact routing-key match; used for the dead-letter exchange.
    Direct,
}

/// Where a queue's rejected messages go.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeadLetterRoute {
    pub exchange: String,
    pub routing_key: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub dead_letter: Option<DeadLetterRoute>,
}

/// A message ready to be written to an exchange.
#[derive(Clone, Debug)]
pub struct OutboundMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    /// Survive broker restarts (AMQP delivery mode 2).
    pub persistent: bool,
    pub content_type: &'static str,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub app_id: Option<String>,
}

/// How a consumer settles one delivery.
#[async_trait]
pub trait DeliveryAcker: Send {
    async fn ack(self: Box<Self>) -> Result<()>;

    /// Put the message back on its queue with the delivery count incremented.
    async fn requeue(self: Box<Self>) -> Result<()>;

    /// Reject without requeue; the broker dead-letters it through the queue's
    /// dead-letter route.
    async fn reject(self: Box<Self>) -> Result<()>;

    /// Explicitly route the message to the queue's dead-letter destination with
    /// `reason`, then acknowledge the original.
    async fn dead_letter(self: Box<Self>, reason: &str) -> Result<()>;
}

/// One message handed to a consumer.
pub struct InboundDelivery {
    pub routing_key: String,
    pub payload: Vec<u8>,
    /// 1 on first delivery, incremented by every requeue.
    pub delivery_count: u32,
    pub acker: Box<dyn DeliveryAcker>,
}

impl std::fmt::Debug for InboundDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundDelivery")
            .field("routing_key", &self.routing_key)
            .field("bytes", &self.payload.len())
            .field("delivery_count", &self.delivery_count)
            .finish()
    }
}

/// Stream of deliveries for one consumer; ends when the consumer is cancelled
/// or the connection is lost.
pub type DeliveryStream = BoxStream<'static, Result<InboundDelivery>>;

/// Broker port: establishes physical connections.
///
/// RabbitMQ (`chatbus-amqp`) and the in-process broker (`bus::memory`) both sit
/// behind this interface.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>>;

    fn is_open(&self) -> bool;

    /// Resolves once the connection is lost or closed.
    async fn closed(&self);

    async fn close(&self) -> Result<()>;
}

/// A logical channel on a connection. Callers serialize access to it.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()>;

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    async fn set_prefetch(&self, count: u16) -> Result<()>;

    /// Write the message and wait for the broker's confirmation.
    async fn publish(&self, message: &OutboundMessage) -> Result<()>;

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
