use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::{
    bus::port::OutboundMessage,
    config::Config,
    connection::{BusChannel, ChannelRole, ConnectionManager},
    domain::{CorrelationId, EventId},
    errors::Error,
    events::{
        CookieChanged, Envelope, EventData, EventKind, MatchEnded, MessageReceived, MessageSend,
        MessengerDisconnected, ThreadType,
    },
    ports::EventSink,
    Result,
};

pub const CONTENT_TYPE_JSON: &str = "application/json";

#[derive(Clone, Debug)]
pub struct PublisherSettings {
    /// Stamped into every envelope's `producer`.
    pub producer: String,
    /// Total attempts per event, including the first.
    pub attempts: u32,
    pub retry_delay: Duration,
}

impl PublisherSettings {
    pub fn new(producer: impl Into<String>) -> Self {
        Self {
            producer: producer.into(),
            attempts: 3,
            retry_delay: Duration::from_millis(500),
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self {
            producer: cfg.service_name.clone(),
            attempts: cfg.publish_attempts,
            retry_delay: cfg.publish_retry_delay,
        }
    }
}

/// Validates, stamps and emits envelopes on the topic exchange.
///
/// Holds one channel and replaces it when it goes stale or fails.
pub struct Publisher {
    manager: ConnectionManager,
    settings: PublisherSettings,
    channel: Mutex<Option<BusChannel>>,
}

impl Publisher {
    pub fn new(manager: ConnectionManager, settings: PublisherSettings) -> Self {
        Self {
            manager,
            settings,
            channel: Mutex::new(None),
        }
    }

    pub fn producer(&self) -> &str {
        &self.settings.producer
    }

    /// Publish `data` as `event_type`.
    ///
    /// Nothing reaches the broker if the payload does not match the event
    /// type or fails validation.
    pub async fn publish(
        &self,
        event_type: EventKind,
        data: EventData,
        correlation_id: Option<CorrelationId>,
    ) -> Result<EventId> {
        let envelope = Envelope::new(event_type, data, self.settings.producer.as_str(), correlation_id)?;
        envelope.data().validate()?;
        self.send(&envelope).await?;
        Ok(envelope.event_id())
    }

    /// Publish with the event type taken from the payload variant.
    pub async fn emit(
        &self,
        data: EventData,
        correlation_id: Option<CorrelationId>,
    ) -> Result<EventId> {
        self.publish(data.kind(), data, correlation_id).await
    }

    /// Dynamic entry point for callers holding an event type string and raw
    /// JSON.
    pub async fn publish_raw(
        &self,
        event_type: &str,
        data: Value,
        correlation_id: Option<CorrelationId>,
    ) -> Result<EventId> {
        let kind = EventKind::from_event_type(event_type)
            .ok_or_else(|| Error::schema(event_type, "unknown event type"))?;
        let data = EventData::from_value(kind, data)
            .map_err(|e| Error::schema(event_type, e.to_string()))?;
        self.publish(kind, data, correlation_id).await
    }

    pub async fn publish_message_received(
        &self,
        message: MessageReceived,
        correlation_id: Option<CorrelationId>,
    ) -> Result<EventId> {
        self.emit(message.into(), correlation_id).await
    }

    pub async fn publish_message_send(
        &self,
        recipient_id: &str,
        recipient_type: ThreadType,
        body: &str,
        correlation_id: Option<CorrelationId>,
    ) -> Result<EventId> {
        let data = MessageSend {
            recipient_id: recipient_id.to_string(),
            recipient_type,
            body: body.to_string(),
            attachment_id: None,
            attachment_type: None,
        };
        self.emit(data.into(), correlation_id).await
    }

    pub async fn publish_cookie_changed(
        &self,
        account_id: &str,
        new_cookie: &str,
        old_cookie: Option<&str>,
        force_reconnect: bool,
    ) -> Result<EventId> {
        let data = CookieChanged {
            account_id: account_id.to_string(),
            old_cookie: old_cookie.map(str::to_string),
            new_cookie: new_cookie.to_string(),
            force_reconnect,
        };
        let id = self.emit(data.into(), None).await?;
        info!(account_id, event_id = %id, "published cookie.changed");
        Ok(id)
    }

    pub async fn publish_match_ended(
        &self,
        ended: MatchEnded,
        correlation_id: Option<CorrelationId>,
    ) -> Result<EventId> {
        self.emit(ended.into(), correlation_id).await
    }

    pub async fn publish_messenger_disconnected(
        &self,
        account_id: &str,
        reason: Option<&str>,
    ) -> Result<EventId> {
        let data = MessengerDisconnected {
            account_id: account_id.to_string(),
            reason: reason.map(str::to_string),
        };
        self.emit(data.into(), None).await
    }

    /// Close the held channel; the next publish opens a new one.
    pub async fn close(&self) -> Result<()> {
        let held = self.channel.lock().await.take();
        match held {
            Some(ch) => ch.close().await,
            None => Ok(()),
        }
    }

    async fn send(&self, envelope: &Envelope) -> Result<()> {
        let message = OutboundMessage {
            exchange: self.manager.exchange().to_string(),
            routing_key: envelope.event_type().routing_key().to_string(),
            payload: envelope.to_bytes()?,
            persistent: true,
            content_type: CONTENT_TYPE_JSON,
            message_id: Some(envelope.event_id().to_string()),
            correlation_id: Some(envelope.correlation_id().to_string()),
            app_id: Some(envelope.producer().to_string()),
        };

        let event_type = envelope.event_type();
        let attempts = self.settings.attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.try_send(&message).await {
                Ok(()) => {
                    debug!(
                        event_type = %event_type,
                        event_id = %envelope.event_id(),
                        attempt,
                        "event published"
                    );
                    return Ok(());
                }
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => {
                    warn!(event_type = %event_type, attempt, error = %e, "publish failed");
                    last_error = e.to_string();
                    self.discard_channel().await;
                    if attempt < attempts {
                        sleep(self.settings.retry_delay).await;
                    }
                }
            }
        }

        Err(Error::PublishUnconfirmed {
            event_type: event_type.to_string(),
            attempts,
            last_error,
        })
    }

    async fn try_send(&self, message: &OutboundMessage) -> Result<()> {
        let channel = self.current_channel().await?;
        channel.publish(message).await
    }

    async fn current_channel(&self) -> Result<BusChannel> {
        let mut slot = self.channel.lock().await;
        if let Some(ch) = slot.as_ref() {
            if !self.manager.is_stale(ch) {
                return Ok(ch.clone());
            }
        }
        if let Some(old) = slot.take() {
            let _ = old.close().await;
        }
        let fresh = self.manager.open_channel(ChannelRole::Publisher).await?;
        *slot = Some(fresh.clone());
        Ok(fresh)
    }

    async fn discard_channel(&self) {
        let held = self.channel.lock().await.take();
        if let Some(ch) = held {
            let _ = ch.close().await;
        }
    }
}

#[async_trait]
impl EventSink for Publisher {
    async fn emit(&self, data: EventData, correlation_id: Option<CorrelationId>) -> Result<EventId> {
        Publisher::emit(self, data, correlation_id).await
    }
}
