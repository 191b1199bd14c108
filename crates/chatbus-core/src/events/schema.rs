//! Schema registry: the closed set of event types and their payloads.
//!
//! Evolution is additive only. A new field must be `Option` or carry a serde
//! default, unknown fields are ignored on decode, and an existing field is never
//! removed or retyped. New event types are new variants.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{errors::Error, Result};

pub const SCHEMA_VERSION: u16 = 1;

/// Event type, doubling as the routing key on the topic exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "message.received")]
    MessageReceived,
    #[serde(rename = "message.send")]
    MessageSend,
    #[serde(rename = "cookie.changed")]
    CookieChanged,
    #[serde(rename = "match.ended")]
    MatchEnded,
    #[serde(rename = "messenger.disconnected")]
    MessengerDisconnected,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::MessageReceived,
        EventKind::MessageSend,
        EventKind::CookieChanged,
        EventKind::MatchEnded,
        EventKind::MessengerDisconnected,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::MessageReceived => "message.received",
            Self::MessageSend => "message.send",
            Self::CookieChanged => "cookie.changed",
            Self::MatchEnded => "match.ended",
            Self::MessengerDisconnected => "messenger.disconnected",
        }
    }

    pub fn routing_key(self) -> &'static str {
        self.as_str()
    }

    /// `None` for event types this build does not know about.
    pub fn from_event_type(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Conversation kind; `recipient_type` uses the same values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadType {
    User,
    Thread,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageReceived {
    pub message_id: String,
    pub user_id: String,
    pub sender_id: String,
    pub body: String,
    pub reply_to_id: String,
    #[serde(rename = "type")]
    pub thread_type: ThreadType,
    #[serde(default)]
    pub attachments: Vec<Map<String, Value>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageSend {
    pub recipient_id: String,
    pub recipient_type: ThreadType,
    pub body: String,
    pub attachment_id: Option<String>,
    pub attachment_type: Option<String>,
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct CookieChanged {
    pub account_id: String,
    pub old_cookie: Option<String>,
    pub new_cookie: String,
    #[serde(default = "default_force_reconnect")]
    pub force_reconnect: bool,
}

fn default_force_reconnect() -> bool {
    true
}

// Cookies are credentials; keep them out of logs.
impl fmt::Debug for CookieChanged {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CookieChanged")
            .field("account_id", &self.account_id)
            .field("old_cookie", &self.old_cookie.as_ref().map(|_| "<redacted>"))
            .field("new_cookie", &"<redacted>")
            .field("force_reconnect", &self.force_reconnect)
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatchEnded {
    pub match_id: String,
    pub puuid: String,
    pub summoner_name: String,
    /// Seconds.
    pub game_duration: u64,
    pub win: bool,
    pub champion: String,
    #[serde(default)]
    pub kills: u32,
    #[serde(default)]
    pub deaths: u32,
    #[serde(default)]
    pub assists: u32,
    #[serde(default)]
    pub kda: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessengerDisconnected {
    pub account_id: String,
    pub reason: Option<String>,
}

/// Event payload, one variant per [`EventKind`].
///
/// Serialized without a tag: the envelope's `event_type` is the tag.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EventData {
    MessageReceived(MessageReceived),
    MessageSend(MessageSend),
    CookieChanged(CookieChanged),
    MatchEnded(MatchEnded),
    MessengerDisconnected(MessengerDisconnected),
}

impl EventData {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::MessageReceived(_) => EventKind::MessageReceived,
            Self::MessageSend(_) => EventKind::MessageSend,
            Self::CookieChanged(_) => EventKind::CookieChanged,
            Self::MatchEnded(_) => EventKind::MatchEnded,
            Self::MessengerDisconnected(_) => EventKind::MessengerDisconnected,
        }
    }

    /// Decode a JSON payload as the variant registered for `kind`.
    pub fn from_value(kind: EventKind, value: Value) -> serde_json::Result<Self> {
        Ok(match kind {
            EventKind::MessageReceived => Self::MessageReceived(serde_json::from_value(value)?),
            EventKind::MessageSend => Self::MessageSend(serde_json::from_value(value)?),
            EventKind::CookieChanged => Self::CookieChanged(serde_json::from_value(value)?),
            EventKind::MatchEnded => Self::MatchEnded(serde_json::from_value(value)?),
            EventKind::MessengerDisconnected => {
                Self::MessengerDisconnected(serde_json::from_value(value)?)
            }
        })
    }

    /// Producer-side contract check, run before anything touches the broker.
    pub fn validate(&self) -> Result<()> {
        let kind = self.kind();
        match self {
            Self::MessageReceived(d) => {
                require(kind, "message_id", &d.message_id)?;
                require(kind, "user_id", &d.user_id)?;
                require(kind, "sender_id", &d.sender_id)?;
                require(kind, "reply_to_id", &d.reply_to_id)?;
            }
            Self::MessageSend(d) => {
                require(kind, "recipient_id", &d.recipient_id)?;
                if d.attachment_type.is_some() && d.attachment_id.is_none() {
                    return Err(Error::schema(
                        kind.as_str(),
                        "attachment_type given without attachment_id",
                    ));
                }
            }
            Self::CookieChanged(d) => {
                require(kind, "account_id", &d.account_id)?;
                require(kind, "new_cookie", &d.new_cookie)?;
            }
            Self::MatchEnded(d) => {
                require(kind, "match_id", &d.match_id)?;
                require(kind, "puuid", &d.puuid)?;
                if !d.kda.is_finite() || d.kda < 0.0 {
                    return Err(Error::schema(
                        kind.as_str(),
                        format!("kda must be a finite, non-negative number (got {})", d.kda),
                    ));
                }
            }
            Self::MessengerDisconnected(d) => {
                require(kind, "account_id", &d.account_id)?;
            }
        }
        Ok(())
    }
}

fn require(kind: EventKind, field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::schema(
            kind.as_str(),
            format!("`{field}` must not be empty"),
        ));
    }
    Ok(())
}

impl From<MessageReceived> for EventData {
    fn from(d: MessageReceived) -> Self {
        Self::MessageReceived(d)
    }
}

impl From<MessageSend> for EventData {
    fn from(d: MessageSend) -> Self {
        Self::MessageSend(d)
    }
}

impl From<CookieChanged> for EventData {
    fn from(d: CookieChanged) -> Self {
        Self::CookieChanged(d)
    }
}

impl From<MatchEnded> for EventData {
    fn from(d: MatchEnded) -> Self {
        Self::MatchEnded(d)
    }
}

impl From<MessengerDisconnected> for EventData {
    fn from(d: MessengerDisconnected) -> Self {
        Self::MessengerDisconnected(d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn match_ended(kda: f64) -> MatchEnded {
        MatchEnded {
            match_id: "VN2_1".to_string(),
            puuid: "p-1".to_string(),
            summoner_name: "Faker".to_string(),
            game_duration: 1800,
            win: true,
            champion: "Ahri".to_string(),
            kills: 10,
            deaths: 2,
            assists: 7,
            kda,
        }
    }

    #[test]
    fn event_type_strings_resolve_to_kinds() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::from_event_type(kind.as_str()), Some(kind));
        }
        assert_eq!(EventKind::from_event_type("match.started"), None);
    }

    #[test]
    fn thread_type_travels_under_type_key() {
        let data = json!({
            "message_id": "m1",
            "user_id": "u1",
            "sender_id": "u1",
            "body": "hi",
            "reply_to_id": "t1",
            "type": "thread"
        });
        let EventData::MessageReceived(d) =
            EventData::from_value(EventKind::MessageReceived, data).unwrap()
        else {
            panic!("wrong variant");
        };
        assert_eq!(d.thread_type, ThreadType::Thread);
        assert!(d.attachments.is_empty());

        let back = serde_json::to_value(EventData::MessageReceived(d)).unwrap();
        assert_eq!(back["type"], "thread");
    }

    #[test]
    fn legacy_defaults_are_applied() {
        let cookie = EventData::from_value(
            EventKind::CookieChanged,
            json!({"account_id": "a", "new_cookie": "c_user=1"}),
        )
        .unwrap();
        let EventData::CookieChanged(c) = cookie else {
            panic!("wrong variant");
        };
        assert!(c.force_reconnect);
        assert_eq!(c.old_cookie, None);

        let ended = EventData::from_value(
            EventKind::MatchEnded,
            json!({
                "match_id": "m", "puuid": "p", "summoner_name": "s",
                "game_duration": 60, "win": false, "champion": "Zed"
            }),
        )
        .unwrap();
        let EventData::MatchEnded(m) = ended else {
            panic!("wrong variant");
        };
        assert_eq!((m.kills, m.deaths, m.assists), (0, 0, 0));
        assert_eq!(m.kda, 0.0);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let data = json!({"account_id": "a", "reason": null, "added_in_v2": 42});
        assert!(EventData::from_value(EventKind::MessengerDisconnected, data).is_ok());
    }

    #[test]
    fn missing_required_field_fails_decode() {
        let data = json!({"recipient_type": "user", "body": "x"});
        assert!(EventData::from_value(EventKind::MessageSend, data).is_err());
    }

    #[test]
    fn validate_rejects_empty_ids_and_bad_kda() {
        let d = EventData::MessengerDisconnected(MessengerDisconnected {
            account_id: "  ".to_string(),
            reason: None,
        });
        assert!(matches!(d.validate(), Err(Error::SchemaViolation { .. })));

        assert!(EventData::MatchEnded(match_ended(4.5)).validate().is_ok());
        assert!(EventData::MatchEnded(match_ended(f64::NAN)).validate().is_err());
        assert!(EventData::MatchEnded(match_ended(-1.0)).validate().is_err());
    }

    #[test]
    fn cookie_debug_is_redacted() {
        let c = CookieChanged {
            account_id: "a".to_string(),
            old_cookie: Some("secret-old".to_string()),
            new_cookie: "secret-new".to_string(),
            force_reconnect: true,
        };
        let printed = format!("{c:?}");
        assert!(!printed.contains("secret"));
    }
}
