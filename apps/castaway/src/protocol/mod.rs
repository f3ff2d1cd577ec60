use serde::{Deserialize, Serialize};

pub mod messages;

pub use messages::{Command, CommandError, EntitySnapshot, EqBand, ServerFrame};

/// Entity identifier as issued by the service.
pub type EntityId = String;

/// Key of one field inside an entity's authoritative value.
pub type FieldKey = String;

/// Kinds of entities the client keeps synchronized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Node,
    PlayerStatus,
    Equalizer,
}

impl EntityKind {
    /// Every kind the fallback poller has to cover.
    pub const ALL: [EntityKind; 3] = [
        EntityKind::Node,
        EntityKind::PlayerStatus,
        EntityKind::Equalizer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Node => "node",
            EntityKind::PlayerStatus => "player_status",
            EntityKind::Equalizer => "equalizer",
        }
    }
}

/// Well-known field keys inside authoritative values.
pub mod fields {
    pub const VOLUME: &str = "volume_percent";
    pub const CHANNEL: &str = "channel_id";
    pub const EQ_BANDS: &str = "eq_bands";
    pub const PROGRESS: &str = "progress_ms";
    pub const DURATION: &str = "duration_ms";
    pub const PLAYING: &str = "is_playing";
}
