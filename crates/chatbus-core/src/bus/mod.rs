//! Broker abstraction: ports, topology naming, and the in-process broker.

pub mod memory;
pub mod port;
pub mod topology;

pub use memory::{InMemoryBroker, StoredMessage};
pub use port::{
    BrokerChannel, BrokerConnection, BrokerConnector, DeadLetterRoute, DeliveryAcker,
    DeliveryStream, ExchangeKind, InboundDelivery, OutboundMessage, QueueSpec,
};
pub use topology::{dead_letter_queue_name, topic_matches, QueueTopology};
