//! Per-room session store
//!
//! In-memory table of connected players keyed by connection id. The store has no
//! behavior of its own; all mutation goes through the owning [`Room`](super::Room).

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque connection identifier assigned by the transport at accept time
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    /// Generate a fresh id for a newly accepted connection
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }
}

impl From<&str> for ClientId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ClientId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A connected player's synchronized record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerRecord {
    /// Owning connection
    pub id: ClientId,
    pub x: f64,
    pub y: f64,
}

impl PlayerRecord {
    pub fn new(id: ClientId, x: f64, y: f64) -> Self {
        Self { id, x, y }
    }
}

/// Player records of a single room
#[derive(Debug, Default)]
pub struct SessionStore {
    players: HashMap<ClientId, PlayerRecord>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the record for `id`
    pub fn set(&mut self, id: ClientId, record: PlayerRecord) {
        self.players.insert(id, record);
    }

    pub fn get(&self, id: &ClientId) -> Option<&PlayerRecord> {
        self.players.get(id)
    }

    pub fn get_mut(&mut self, id: &ClientId) -> Option<&mut PlayerRecord> {
        self.players.get_mut(id)
    }

    /// Remove the record for `id`, returning it if present
    pub fn delete(&mut self, id: &ClientId) -> Option<PlayerRecord> {
        self.players.remove(id)
    }

    pub fn contains(&self, id: &ClientId) -> bool {
        self.players.contains_key(id)
    }

    pub fn size(&self) -> usize {
        self.players.len()
    }

    pub fn clear(&mut self) {
        self.players.clear();
    }

    /// Iterate over all records in arbitrary order
    pub fn iter(&self) -> impl Iterator<Item = (&ClientId, &PlayerRecord)> {
        self.players.iter()
    }
}
