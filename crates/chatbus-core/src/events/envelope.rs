use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use uuid::Uuid;

use crate::{
    domain::{CorrelationId, EventId},
    errors::Error,
    events::schema::{EventData, EventKind},
    Result,
};

/// Producer name used when a legacy envelope carries none.
pub const UNKNOWN_PRODUCER: &str = "unknown";

/// Wrapper around an event payload carrying routing and tracing metadata.
///
/// Construct with [`Envelope::new`] / [`Envelope::for_data`]; the fields are
/// read-only afterwards.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Envelope {
    event_type: EventKind,
    #[serde(serialize_with = "serialize_timestamp")]
    timestamp: DateTime<Utc>,
    event_id: EventId,
    correlation_id: CorrelationId,
    producer: String,
    data: EventData,
}

/// Outcome of decoding a delivery body.
#[derive(Clone, Debug, PartialEq)]
pub enum Decoded {
    Known(Envelope),
    /// Well-formed envelope with an event type this build does not know.
    Unknown(UnknownEvent),
}

#[derive(Clone, Debug, PartialEq)]
pub struct UnknownEvent {
    pub event_type: String,
    pub event_id: Option<String>,
    pub producer: Option<String>,
}

#[derive(Deserialize)]
struct RawEnvelope {
    event_type: String,
    #[serde(deserialize_with = "deserialize_timestamp")]
    timestamp: DateTime<Utc>,
    #[serde(default)]
    event_id: Option<String>,
    #[serde(default)]
    correlation_id: Option<String>,
    #[serde(default)]
    producer: Option<String>,
    #[serde(default)]
    data: Value,
}

impl Envelope {
    /// Stamp a fresh envelope; fails if `data` is not the variant for `event_type`.
    pub fn new(
        event_type: EventKind,
        data: EventData,
        producer: impl Into<String>,
        correlation_id: Option<CorrelationId>,
    ) -> Result<Self> {
        if data.kind() != event_type {
            return Err(Error::schema(
                event_type.as_str(),
                format!("payload is a `{}` variant", data.kind()),
            ));
        }
        Ok(Self::for_data(data, producer, correlation_id))
    }

    /// Stamp a fresh envelope whose type is taken from the payload variant.
    pub fn for_data(
        data: EventData,
        producer: impl Into<String>,
        correlation_id: Option<CorrelationId>,
    ) -> Self {
        Self {
            event_type: data.kind(),
            timestamp: Utc::now(),
            event_id: EventId::new(),
            correlation_id: correlation_id.unwrap_or_default(),
            producer: producer.into(),
            data,
        }
    }

    pub fn event_type(&self) -> EventKind {
        self.event_type
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    pub fn producer(&self) -> &str {
        &self.producer
    }

    pub fn data(&self) -> &EventData {
        &self.data
    }

    pub fn into_data(self) -> EventData {
        self.data
    }

    /// UTF-8 JSON wire form.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse a delivery body.
    ///
    /// Structural problems (not UTF-8, not an envelope, `data` not matching the
    /// registered variant) are `MalformedMessage`; an unregistered event type is
    /// reported as [`Decoded::Unknown`] instead.
    pub fn decode(body: &[u8]) -> Result<Decoded> {
        let text = std::str::from_utf8(body)
            .map_err(|e| Error::MalformedMessage(format!("payload is not UTF-8: {e}")))?;
        let raw: RawEnvelope = serde_json::from_str(text)
            .map_err(|e| Error::MalformedMessage(format!("invalid envelope: {e}")))?;

        let Some(kind) = EventKind::from_event_type(&raw.event_type) else {
            return Ok(Decoded::Unknown(UnknownEvent {
                event_type: raw.event_type,
                event_id: raw.event_id,
                producer: raw.producer,
            }));
        };

        let data = EventData::from_value(kind, raw.data).map_err(|e| {
            Error::MalformedMessage(format!("`{kind}` data does not match schema: {e}"))
        })?;

        let event_id = match raw.event_id {
            Some(id) => Uuid::parse_str(&id)
                .map(EventId)
                .map_err(|e| Error::MalformedMessage(format!("invalid event_id `{id}`: {e}")))?,
            None => EventId::new(),
        };

        Ok(Decoded::Known(Self {
            event_type: kind,
            timestamp: raw.timestamp,
            event_id,
            correlation_id: raw
                .correlation_id
                .map(CorrelationId)
                .unwrap_or_default(),
            producer: raw
                .producer
                .unwrap_or_else(|| UNKNOWN_PRODUCER.to_string()),
            data,
        }))
    }
}

fn serialize_timestamp<S: Serializer>(ts: &DateTime<Utc>, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
}

fn deserialize_timestamp<'de, D>(d: D) -> std::result::Result<DateTime<Utc>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(d)?;
    parse_timestamp(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp `{raw}`")))
}

/// RFC 3339, or a naive ISO-8601 date-time taken as UTC (legacy producers emit
/// `datetime.utcnow()` without an offset, sometimes space-separated).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}
