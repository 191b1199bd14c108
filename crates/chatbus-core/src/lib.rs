//! Core of the chat-bot event backbone.
//!
//! Envelope and schema registry, broker ports, connection manager, publisher,
//! subscriber and the listener session state machine. The concrete RabbitMQ
//! adapter lives in `chatbus-amqp`; `bus::memory` provides an in-process
//! broker.

pub mod bus;
pub mod config;
pub mod connection;
pub mod domain;
pub mod errors;
pub mod events;
pub mod logging;
pub mod ports;
pub mod publisher;
pub mod session;
pub mod subscriber;

pub use errors::{Error, Result};
