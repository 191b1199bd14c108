use async_trait::async_trait;

use crate::{
    domain::{AccountId, CorrelationId, EventId},
    events::EventData,
    Result,
};

/// Hexagonal port for the inbound chat-transport connection a listener
/// session drives.
///
/// The protocol client itself lives outside this workspace.
#[async_trait]
pub trait ListenerTransport: Send + Sync {
    /// Install a fresh session credential (cookie) for `account`.
    async fn apply_credential(&self, account: &AccountId, cookie: &str) -> Result<()>;

    /// Open the inbound connection; resolves once it is listening.
    async fn connect(&self, account: &AccountId) -> Result<()>;
}

/// Hexagonal port for emitting events onto the backbone.
///
/// Implemented by [`crate::publisher::Publisher`]; tests use in-memory fakes.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, data: EventData, correlation_id: Option<CorrelationId>) -> Result<EventId>;
}
