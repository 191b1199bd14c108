/// Core error type for the event backbone.
///
/// Adapter crates map their broker-specific errors into this type so publishers,
/// subscribers and the session state machine can tell transient faults from
/// logical ones.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    /// Connect/reconnect exhausted, wait timed out, or the manager was closed.
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("schema violation for `{event_type}`: {reason}")]
    SchemaViolation { event_type: String, reason: String },

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("handler failed: {0}")]
    HandlerFailure(String),

    #[error("publish of `{event_type}` unconfirmed after {attempts} attempt(s): {last_error}")]
    PublishUnconfirmed {
        event_type: String,
        attempts: u32,
        last_error: String,
    },

    /// Transient adapter fault (channel closed, nack, I/O on the socket).
    #[error("broker error: {0}")]
    Broker(String),

    #[error("session error: {0}")]
    Session(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("external error: {0}")]
    External(String),
}

impl Error {
    pub fn schema(event_type: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SchemaViolation {
            event_type: event_type.into(),
            reason: reason.into(),
        }
    }

    /// Faults that a bounded retry may clear.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Broker(_) | Self::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
