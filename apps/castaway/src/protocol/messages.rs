use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::trace;

use super::{EntityId, EntityKind, fields};

/// One entity inside a collection snapshot. The service sends flat objects;
/// everything besides `id` is the authoritative value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub id: EntityId,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl EntitySnapshot {
    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }
}

/// Inbound frames from the push channel, discriminated by `type`.
///
/// The polling endpoint returns the body of a `snapshot` frame, so both
/// paths feed the store through the same shape.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Full collection snapshot. Tracked entities of this kind that are
    /// absent from `entities` have been removed on the service.
    Snapshot {
        kind: EntityKind,
        entities: Vec<EntitySnapshot>,
    },
    /// Delta for a single entity: changed fields only.
    Event {
        kind: EntityKind,
        id: EntityId,
        fields: Map<String, Value>,
    },
    /// Request-scoped acknowledgement of a submitted command.
    Ack { request_id: String },
    /// Any frame kind this client does not understand.
    #[serde(other)]
    Unknown,
}

impl ServerFrame {
    /// Parse a raw frame. Malformed payloads are dropped, never raised.
    pub fn parse(raw: &str) -> Option<ServerFrame> {
        match serde_json::from_str(raw) {
            Ok(frame) => Some(frame),
            Err(err) => {
                trace!(error = %err, "dropping malformed frame");
                None
            }
        }
    }
}

/// Outbound command payloads, one variant per controllable field family.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    SetVolume { percent: u8 },
    AssignChannel { channel_id: Option<String> },
    SetEqBands { bands: Vec<EqBand> },
    Seek { position_ms: u64 },
    SetPlaying { playing: bool },
}

impl Command {
    /// The authoritative field this command mutates.
    pub fn field_key(&self) -> &'static str {
        match self {
            Command::SetVolume { .. } => fields::VOLUME,
            Command::AssignChannel { .. } => fields::CHANNEL,
            Command::SetEqBands { .. } => fields::EQ_BANDS,
            Command::Seek { .. } => fields::PROGRESS,
            Command::SetPlaying { .. } => fields::PLAYING,
        }
    }

    /// The optimistic value a successful command would leave behind.
    pub fn optimistic_value(&self) -> Value {
        match self {
            Command::SetVolume { percent } => Value::from(*percent),
            Command::AssignChannel { channel_id } => match channel_id {
                Some(id) => Value::from(id.clone()),
                None => Value::Null,
            },
            Command::SetEqBands { bands } => {
                serde_json::to_value(bands).unwrap_or(Value::Null)
            }
            Command::Seek { position_ms } => Value::from(*position_ms),
            Command::SetPlaying { playing } => Value::from(*playing),
        }
    }
}

/// One parametric equalizer band.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EqBand {
    pub freq_hz: f32,
    pub gain_db: f32,
    pub q: f32,
}

/// Failure of a command endpoint. Any variant means "defer to the next
/// authoritative snapshot"; none of them roll the optimistic value back.
#[derive(Debug, Clone, Error)]
pub enum CommandError {
    #[error("command rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("service unreachable: {0}")]
    Unreachable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_snapshot_frame() {
        let raw = r#"{"type":"snapshot","kind":"node","entities":[{"id":"n1","name":"Kitchen","volume_percent":40}]}"#;
        match ServerFrame::parse(raw) {
            Some(ServerFrame::Snapshot { kind, entities }) => {
                assert_eq!(kind, EntityKind::Node);
                assert_eq!(entities.len(), 1);
                assert_eq!(entities[0].id, "n1");
                assert_eq!(entities[0].fields["volume_percent"], 40);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn parses_event_frame() {
        let raw = r#"{"type":"event","kind":"player_status","id":"ch1","fields":{"progress_ms":1500}}"#;
        match ServerFrame::parse(raw) {
            Some(ServerFrame::Event { kind, id, fields }) => {
                assert_eq!(kind, EntityKind::PlayerStatus);
                assert_eq!(id, "ch1");
                assert_eq!(fields["progress_ms"], 1500);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn unknown_frame_kind_is_tolerated() {
        let raw = r#"{"type":"lease_renewal","ttl":30}"#;
        assert!(matches!(ServerFrame::parse(raw), Some(ServerFrame::Unknown)));
    }

    #[test]
    fn malformed_frame_is_dropped() {
        assert!(ServerFrame::parse("{not json").is_none());
        assert!(ServerFrame::parse(r#"{"type":"snapshot"}"#).is_none());
    }

    #[test]
    fn command_field_keys() {
        assert_eq!(Command::SetVolume { percent: 30 }.field_key(), fields::VOLUME);
        assert_eq!(Command::Seek { position_ms: 10 }.field_key(), fields::PROGRESS);
    }
}
