//! Positions: atomic, totally ordered batches of events.

use crate::error::CodecError;
use crate::event::Event;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

/// The migration index every log starts at before any migration ran.
pub const BASELINE_MIGRATION_INDEX: i32 = 1;

/// The write time of a position, kept with the RFC 3339 text it was read from so that
/// re-encoding reproduces that text exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timestamp {
    at: DateTime<Utc>,
    text: String,
}

impl Timestamp {
    /// Parses an RFC 3339 timestamp, keeping `text` as given.
    pub fn parse(text: &str) -> Result<Self, chrono::ParseError> {
        let at = DateTime::parse_from_rfc3339(text)?.with_timezone(&Utc);
        Ok(Self {
            at,
            text: text.to_string(),
        })
    }

    /// The instant.
    pub fn at(&self) -> DateTime<Utc> {
        self.at
    }

    /// The wire text.
    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(at: DateTime<Utc>) -> Self {
        Self {
            at,
            text: at.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.text)
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Timestamp::parse(&text).map_err(serde::de::Error::custom)
    }
}

/// A batch of events written together under one sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Monotonic sequence number, never rewritten.
    pub position: u64,
    /// Schema version under which `events` are valid.
    pub migration_index: i32,
    /// When the position was originally written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
    /// Free-form metadata attached by the writer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub information: Option<Value>,
    /// The events, in application order.
    pub events: Vec<Event>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPosition {
    position: u64,
    migration_index: i32,
    #[serde(default)]
    timestamp: Option<Timestamp>,
    #[serde(default)]
    information: Option<Value>,
    events: Vec<Value>,
}

impl Position {
    /// Creates a position without timestamp or information.
    pub fn new(position: u64, migration_index: i32, events: Vec<Event>) -> Self {
        Self {
            position,
            migration_index,
            timestamp: None,
            information: None,
            events,
        }
    }

    /// Sets the timestamp.
    pub fn with_timestamp(mut self, timestamp: impl Into<Timestamp>) -> Self {
        self.timestamp = Some(timestamp.into());
        self
    }

    /// Sets the information payload.
    pub fn with_information(mut self, information: Value) -> Self {
        self.information = Some(information);
        self
    }

    /// Decodes the wire form, reporting event failures with the codec taxonomy.
    pub fn from_value(value: Value) -> Result<Self, CodecError> {
        let raw: RawPosition =
            serde_json::from_value(value).map_err(|e| CodecError::Malformed {
                reason: format!("position: {e}"),
            })?;
        let events = raw
            .events
            .into_iter()
            .map(Event::from_value)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            position: raw.position,
            migration_index: raw.migration_index,
            timestamp: raw.timestamp,
            information: raw.information,
            events,
        })
    }

    /// Encodes the wire form.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Decodes a JSON array of positions, checking that position numbers strictly increase.
pub fn decode_log(value: Value) -> Result<Vec<Position>, CodecError> {
    let items = match value {
        Value::Array(items) => items,
        _ => {
            return Err(CodecError::Malformed {
                reason: "log must be a list of positions".to_string(),
            });
        }
    };
    let mut positions = Vec::with_capacity(items.len());
    for item in items {
        let position = Position::from_value(item)?;
        if let Some(last) = positions.last().map(|p: &Position| p.position) {
            if position.position <= last {
                return Err(CodecError::Malformed {
                    reason: format!(
                        "position {} does not follow position {last}",
                        position.position
                    ),
                });
            }
        }
        positions.push(position);
    }
    Ok(positions)
}

/// Encodes positions as a JSON array.
pub fn encode_log(positions: &[Position]) -> Value {
    Value::Array(positions.iter().map(Position::to_value).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_form_omits_absent_metadata() {
        let text = r#"{"position":3,"migration_index":2,"events":[{"type":"delete","fqid":"a/1"}]}"#;
        let position = Position::from_value(serde_json::from_str(text).unwrap()).unwrap();
        assert_eq!(position.position, 3);
        assert_eq!(serde_json::to_string(&position.to_value()).unwrap(), text);
    }

    #[test]
    fn keeps_timestamp_and_information() {
        let value = json!({
            "position": 1,
            "migration_index": 1,
            "timestamp": "2024-03-01T10:00:00Z",
            "information": {"action": "topic.create"},
            "events": [],
        });
        let position = Position::from_value(value).unwrap();
        let timestamp = position.timestamp.as_ref().unwrap();
        assert_eq!(timestamp.as_str(), "2024-03-01T10:00:00Z");
        let at: DateTime<Utc> = "2024-03-01T10:00:00Z".parse().unwrap();
        assert_eq!(timestamp.at(), at);
        assert_eq!(position.information, Some(json!({"action": "topic.create"})));
    }

    #[test]
    fn timestamp_text_survives_a_round_trip() {
        let text = concat!(
            r#"[{"position":1,"migration_index":1,"timestamp":"2024-03-01T10:00:00.000Z","events":[]},"#,
            r#"{"position":2,"migration_index":1,"timestamp":"2024-03-01T11:00:00+01:00","events":[]}]"#,
        );
        let positions = decode_log(serde_json::from_str(text).unwrap()).unwrap();
        assert_eq!(
            positions[0].timestamp.as_ref().map(Timestamp::at),
            positions[1].timestamp.as_ref().map(Timestamp::at)
        );
        assert_eq!(serde_json::to_string(&encode_log(&positions)).unwrap(), text);
    }

    #[test]
    fn timestamp_must_be_rfc3339() {
        let value = json!({"position": 1, "migration_index": 1, "timestamp": "yesterday", "events": []});
        assert!(matches!(Position::from_value(value), Err(CodecError::Malformed { .. })));
    }

    #[test]
    fn built_timestamps_use_the_utc_suffix() {
        let at = "2024-03-01T10:00:00.250Z".parse::<DateTime<Utc>>().unwrap();
        let position = Position::new(1, 1, vec![]).with_timestamp(at);
        assert_eq!(
            position.to_value()["timestamp"],
            json!("2024-03-01T10:00:00.250Z")
        );
    }

    #[test]
    fn log_must_be_strictly_increasing() {
        let log = json!([
            {"position": 2, "migration_index": 1, "events": []},
            {"position": 2, "migration_index": 1, "events": []},
        ]);
        assert!(decode_log(log).is_err());
    }

    #[test]
    fn event_errors_surface_with_codec_taxonomy() {
        let value = json!({"position": 1, "migration_index": 1, "events": [{"type": "delete", "fqid": "x"}]});
        assert!(matches!(Position::from_value(value), Err(CodecError::BadFqid(_))));
    }
}
