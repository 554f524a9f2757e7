use serde::{Deserialize, Serialize};

/// Last known placement of a player or a monster in world units.
///
/// The field names on the wire match the documents the game clients write,
/// so `is_moving` travels as `isMove`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    #[serde(skip)]
    pub id: String,
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub angle: f64,
    #[serde(rename = "isMove", default)]
    pub is_moving: bool,
    #[serde(default)]
    pub speed: f64,
}

impl Position {
    pub fn new(id: impl Into<String>, x: f64, y: f64) -> Self {
        Self {
            id: id.into(),
            x,
            y,
            angle: 0.0,
            is_moving: false,
            speed: 0.0,
        }
    }

    pub fn with_angle(mut self, angle: f64) -> Self {
        self.angle = angle;
        self
    }

    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = speed.max(0.0);
        self
    }
}

/// A cached player position together with the store's own write time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerRecord {
    pub position: Position,
    pub source_updated_at_ms: i64,
}

impl PlayerRecord {
    pub fn new(position: Position, source_updated_at_ms: i64) -> Self {
        Self {
            position,
            source_updated_at_ms,
        }
    }

    pub fn id(&self) -> &str {
        self.position.id.as_str()
    }

    /// A record is stale once `now` is past `source_updated_at + stale_window`.
    pub fn is_stale(&self, now_ms: i64, stale_window_ms: i64) -> bool {
        now_ms > self.source_updated_at_ms.saturating_add(stale_window_ms)
    }
}

/// Activity flag of one player as tracked in memory and in the users
/// collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserActivity {
    pub id: String,
    pub active: bool,
    pub updated_at_ms: i64,
}

impl UserActivity {
    pub fn new(id: impl Into<String>, active: bool, updated_at_ms: i64) -> Self {
        Self {
            id: id.into(),
            active,
            updated_at_ms,
        }
    }
}

/// One chip of the world field. `row`/`col` come from the document id, not
/// from the document body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldTile {
    #[serde(skip)]
    pub row: usize,
    #[serde(skip)]
    pub col: usize,
    #[serde(rename = "chip", default)]
    pub chip_id: i64,
    #[serde(rename = "hitPoint", default)]
    pub hit_point: f64,
}
