//! Event contract shared by every service on the backbone.

pub mod envelope;
pub mod schema;

pub use envelope::{Decoded, Envelope, UnknownEvent};
pub use schema::{
    CookieChanged, EventData, EventKind, MatchEnded, MessageReceived, MessageSend,
    MessengerDisconnected, ThreadType,
};
