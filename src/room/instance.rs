//! Room state machine
//!
//! A room owns the session store of its players and reacts to join, position and
//! leave events. Every change is followed by a full state sync through the
//! [`Transport`]; notifications are only emitted once the mutation is applied.

use std::collections::HashMap;
use std::f64::consts::TAU;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{ClientId, PlayerRecord, SessionStore, Transport};
use crate::server::ServerMessage;

/// Default radius of the spawn circle around the origin
pub const DEFAULT_SPAWN_RADIUS: f64 = 5.0;

/// Errors that can occur during room operations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoomError {
    #[error("Room has been disposed")]
    Disposed,

    #[error("Client already joined: {0}")]
    DuplicateClient(ClientId),
}

/// Result type for room operations
pub type RoomResult<T> = Result<T, RoomError>;

/// Room lifecycle phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomPhase {
    /// Instantiated, nobody joined yet
    Created,
    /// Accepting joins, leaves and messages
    Active,
    /// Terminal
    Disposed,
}

/// Descriptive data attached at creation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomMetadata {
    /// Room type name clients ask for
    pub room_type: String,
    pub description: Option<String>,
}

/// How incoming positions are checked before they overwrite a record
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum PositionPolicy {
    /// Accept every value verbatim
    #[default]
    Trust,
    /// Drop updates with a non-finite coordinate or one beyond `limit`
    Bounded { limit: f64 },
}

impl PositionPolicy {
    pub fn accepts(&self, x: f64, y: f64) -> bool {
        match self {
            PositionPolicy::Trust => true,
            PositionPolicy::Bounded { limit } => {
                x.is_finite() && y.is_finite() && x.abs() <= *limit && y.abs() <= *limit
            }
        }
    }
}

/// Tunables for a room instance
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoomSettings {
    pub spawn_radius: f64,
    pub position_policy: PositionPolicy,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            spawn_radius: DEFAULT_SPAWN_RADIUS,
            position_policy: PositionPolicy::Trust,
        }
    }
}

/// Messages a joined client can send to its room
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RoomMessage {
    Position { x: f64, y: f64 },
}

/// Synchronized room state as seen by clients
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomState {
    pub players: HashMap<ClientId, PlayerRecord>,
    pub player_count: usize,
}

/// A single authoritative session shared by its connected clients
pub struct Room {
    id: Uuid,
    metadata: RoomMetadata,
    settings: RoomSettings,
    phase: RoomPhase,
    store: SessionStore,
    player_count: usize,
    rng: StdRng,
}

impl Room {
    /// Create a room with an entropy-seeded spawn generator
    pub fn new(metadata: RoomMetadata, settings: RoomSettings) -> Self {
        Self::with_rng(metadata, settings, StdRng::from_entropy())
    }

    /// Create a room with a deterministic spawn generator
    #[cfg(test)]
    pub fn with_seed(metadata: RoomMetadata, settings: RoomSettings, seed: u64) -> Self {
        Self::with_rng(metadata, settings, StdRng::seed_from_u64(seed))
    }

    fn with_rng(metadata: RoomMetadata, settings: RoomSettings, rng: StdRng) -> Self {
        Self {
            id: Uuid::new_v4(),
            metadata,
            settings,
            phase: RoomPhase::Created,
            store: SessionStore::new(),
            player_count: 0,
            rng,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn metadata(&self) -> &RoomMetadata {
        &self.metadata
    }

    #[cfg(test)]
    pub fn phase(&self) -> RoomPhase {
        self.phase
    }

    pub fn player_count(&self) -> usize {
        self.player_count
    }

    pub fn is_empty(&self) -> bool {
        self.player_count == 0
    }

    pub fn contains(&self, client: &ClientId) -> bool {
        self.store.contains(client)
    }

    /// Snapshot of the synchronized state
    pub fn state(&self) -> RoomState {
        RoomState {
            players: self
                .store
                .iter()
                .map(|(id, record)| (id.clone(), record.clone()))
                .collect(),
            player_count: self.player_count,
        }
    }

    /// Add a player for `client` at a random point on the spawn circle.
    ///
    /// Join options are accepted and ignored.
    pub fn on_join<T: Transport>(
        &mut self,
        client: ClientId,
        _options: Option<&serde_json::Value>,
        transport: &mut T,
    ) -> RoomResult<()> {
        self.ensure_open()?;
        if self.store.contains(&client) {
            return Err(RoomError::DuplicateClient(client));
        }
        self.phase = RoomPhase::Active;

        let (x, y) = self.spawn_point();
        self.store
            .set(client.clone(), PlayerRecord::new(client.clone(), x, y));
        self.recount();

        info!(
            "Player {} joined room {} at ({:.2}, {:.2}), {} online",
            client, self.id, x, y, self.player_count
        );

        self.broadcast_state(transport);
        transport.send(&client, ServerMessage::welcome(self.welcome_text()));
        transport.broadcast(ServerMessage::player_joined(client, self.player_count));
        Ok(())
    }

    /// Apply a message from a joined client.
    ///
    /// Messages from ids without a record are dropped without creating one.
    pub fn on_message<T: Transport>(
        &mut self,
        client: &ClientId,
        message: RoomMessage,
        transport: &mut T,
    ) -> RoomResult<()> {
        self.ensure_open()?;

        match message {
            RoomMessage::Position { x, y } => {
                if !self.settings.position_policy.accepts(x, y) {
                    warn!(
                        "Rejected position ({}, {}) from {} in room {}",
                        x, y, client, self.id
                    );
                    return Ok(());
                }

                match self.store.get(client) {
                    None => {
                        debug!("Dropping position from unknown client {}", client);
                        return Ok(());
                    }
                    Some(record) if record.x == x && record.y == y => return Ok(()),
                    Some(_) => {}
                }

                if let Some(record) = self.store.get_mut(client) {
                    record.x = x;
                    record.y = y;
                }
            }
        }

        self.broadcast_state(transport);
        Ok(())
    }

    /// Remove the player for `client` and tell the remaining connections.
    ///
    /// Graceful and timed-out leaves are handled the same way.
    pub fn on_leave<T: Transport>(
        &mut self,
        client: &ClientId,
        consented: bool,
        transport: &mut T,
    ) -> RoomResult<()> {
        self.ensure_open()?;

        if self.store.delete(client).is_none() {
            debug!("Leave for unknown client {} ignored", client);
            return Ok(());
        }
        self.recount();

        info!(
            "Player {} left room {} ({}), {} online",
            client,
            self.id,
            if consented { "graceful" } else { "dropped" },
            self.player_count
        );

        self.broadcast_state(transport);
        transport.broadcast(ServerMessage::player_left(client.clone(), self.player_count));
        Ok(())
    }

    /// Release the room. Player data is discarded.
    pub fn on_dispose(&mut self) {
        if self.phase == RoomPhase::Disposed {
            return;
        }
        info!(
            "Disposing room {} ({}) with {} players",
            self.id, self.metadata.room_type, self.player_count
        );
        self.phase = RoomPhase::Disposed;
        self.store.clear();
        self.recount();
    }

    fn ensure_open(&self) -> RoomResult<()> {
        if self.phase == RoomPhase::Disposed {
            return Err(RoomError::Disposed);
        }
        Ok(())
    }

    fn recount(&mut self) {
        self.player_count = self.store.size();
    }

    fn spawn_point(&mut self) -> (f64, f64) {
        let angle = self.rng.gen_range(0.0..TAU);
        let radius = self.settings.spawn_radius;
        (radius * angle.cos(), radius * angle.sin())
    }

    fn welcome_text(&self) -> String {
        format!(
            "Welcome to {}! Players online: {}",
            self.metadata.room_type, self.player_count
        )
    }

    fn broadcast_state<T: Transport>(&self, transport: &mut T) {
        transport.broadcast(ServerMessage::state(self.state()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records every emitted message with its destination (`None` = broadcast)
    #[derive(Default)]
    struct RecordingTransport {
        sent: Vec<(Option<ClientId>, ServerMessage)>,
    }

    impl RecordingTransport {
        fn take(&mut self) -> Vec<(Option<ClientId>, ServerMessage)> {
            std::mem::take(&mut self.sent)
        }

        fn last_state(&self) -> Option<&RoomState> {
            self.sent.iter().rev().find_map(|(_, msg)| match msg {
                ServerMessage::State { state } => Some(state),
                _ => None,
            })
        }
    }

    impl Transport for RecordingTransport {
        fn send(&mut self, to: &ClientId, message: ServerMessage) {
            self.sent.push((Some(to.clone()), message));
        }

        fn broadcast(&mut self, message: ServerMessage) {
            self.sent.push((None, message));
        }
    }

    fn test_room() -> Room {
        Room::with_seed(
            RoomMetadata {
                room_type: "my_room".to_string(),
                description: Some("test room".to_string()),
            },
            RoomSettings::default(),
            7,
        )
    }

    fn id(s: &str) -> ClientId {
        ClientId::from(s)
    }

    #[test]
    fn test_new_room_is_created_and_empty() {
        let room = test_room();
        assert_eq!(room.phase(), RoomPhase::Created);
        assert_eq!(room.player_count(), 0);
        assert_eq!(room.metadata().room_type, "my_room");
    }

    #[test]
    fn test_first_join_welcomes_with_count() {
        let mut room = test_room();
        let mut transport = RecordingTransport::default();

        room.on_join(id("a"), None, &mut transport).unwrap();

        assert_eq!(room.phase(), RoomPhase::Active);
        assert_eq!(room.player_count(), 1);

        let sent = transport.take();
        assert_eq!(sent.len(), 3);
        assert!(matches!(
            &sent[0],
            (None, ServerMessage::State { state }) if state.player_count == 1
        ));
        match &sent[1] {
            (Some(to), ServerMessage::WelcomeMessage { message }) => {
                assert_eq!(to, &id("a"));
                assert!(message.contains('1'));
            }
            other => panic!("Expected welcome, got {:?}", other),
        }
        assert_eq!(sent[2], (None, ServerMessage::player_joined(id("a"), 1)));
    }

    #[test]
    fn test_spawn_is_on_circle() {
        let mut room = test_room();
        let mut transport = RecordingTransport::default();
        room.on_join(id("a"), None, &mut transport).unwrap();

        let state = room.state();
        let record = &state.players[&id("a")];
        let distance = (record.x * record.x + record.y * record.y).sqrt();
        assert!((distance - DEFAULT_SPAWN_RADIUS).abs() < 1e-9);
    }

    #[test]
    fn test_two_joins_have_distinct_spawns() {
        let mut room = test_room();
        let mut transport = RecordingTransport::default();
        room.on_join(id("a"), None, &mut transport).unwrap();
        room.on_join(id("b"), None, &mut transport).unwrap();

        let state = transport.last_state().unwrap();
        assert_eq!(state.player_count, 2);
        assert_eq!(state.players.len(), 2);
        let a = &state.players[&id("a")];
        let b = &state.players[&id("b")];
        assert!(a.x != b.x || a.y != b.y);

        let joined: Vec<_> = transport
            .take()
            .into_iter()
            .filter_map(|(_, msg)| match msg {
                ServerMessage::PlayerJoined { player_count, .. } => Some(player_count),
                _ => None,
            })
            .collect();
        assert_eq!(joined, vec![1, 2]);
    }

    #[test]
    fn test_duplicate_join_is_rejected() {
        let mut room = test_room();
        let mut transport = RecordingTransport::default();
        room.on_join(id("a"), None, &mut transport).unwrap();
        transport.take();

        let result = room.on_join(id("a"), None, &mut transport);
        assert_eq!(result, Err(RoomError::DuplicateClient(id("a"))));
        assert_eq!(room.player_count(), 1);
        assert!(transport.take().is_empty());
    }

    #[test]
    fn test_join_options_are_ignored() {
        let mut room = test_room();
        let mut transport = RecordingTransport::default();
        let options = serde_json::json!({"x": 100.0, "name": "A"});
        room.on_join(id("a"), Some(&options), &mut transport).unwrap();

        let state = room.state();
        let record = &state.players[&id("a")];
        assert_ne!(record.x, 100.0);
    }

    #[test]
    fn test_position_overwrites_verbatim() {
        let mut room = test_room();
        let mut transport = RecordingTransport::default();
        room.on_join(id("a"), None, &mut transport).unwrap();
        transport.take();

        room.on_message(&id("a"), RoomMessage::Position { x: 3.5, y: -2.1 }, &mut transport)
            .unwrap();

        let sent = transport.take();
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            (None, ServerMessage::State { state }) => {
                let record = &state.players[&id("a")];
                assert_eq!(record.x, 3.5);
                assert_eq!(record.y, -2.1);
            }
            other => panic!("Expected state sync, got {:?}", other),
        }
    }

    #[test]
    fn test_trust_policy_accepts_extreme_values() {
        let mut room = test_room();
        let mut transport = RecordingTransport::default();
        room.on_join(id("a"), None, &mut transport).unwrap();

        room.on_message(&id("a"), RoomMessage::Position { x: 1e12, y: -1e12 }, &mut transport)
            .unwrap();

        let state = room.state();
        let record = &state.players[&id("a")];
        assert_eq!((record.x, record.y), (1e12, -1e12));
    }

    #[test]
    fn test_repeated_position_is_not_rebroadcast() {
        let mut room = test_room();
        let mut transport = RecordingTransport::default();
        room.on_join(id("a"), None, &mut transport).unwrap();

        let msg = RoomMessage::Position { x: 1.0, y: 1.0 };
        room.on_message(&id("a"), msg, &mut transport).unwrap();
        let before = room.state();
        transport.take();

        room.on_message(&id("a"), msg, &mut transport).unwrap();
        assert!(transport.take().is_empty());
        assert_eq!(room.state(), before);
    }

    #[test]
    fn test_position_from_unknown_client_is_noop() {
        let mut room = test_room();
        let mut transport = RecordingTransport::default();
        room.on_join(id("a"), None, &mut transport).unwrap();
        transport.take();

        room.on_message(&id("ghost"), RoomMessage::Position { x: 1.0, y: 2.0 }, &mut transport)
            .unwrap();

        assert!(transport.take().is_empty());
        assert!(!room.contains(&id("ghost")));
        assert_eq!(room.player_count(), 1);
    }

    #[test]
    fn test_bounded_policy_drops_out_of_range() {
        let mut room = Room::with_seed(
            RoomMetadata {
                room_type: "my_room".to_string(),
                description: None,
            },
            RoomSettings {
                spawn_radius: 1.0,
                position_policy: PositionPolicy::Bounded { limit: 10.0 },
            },
            1,
        );
        let mut transport = RecordingTransport::default();
        room.on_join(id("a"), None, &mut transport).unwrap();
        let spawn = room.state().players[&id("a")].clone();
        transport.take();

        room.on_message(&id("a"), RoomMessage::Position { x: 11.0, y: 0.0 }, &mut transport)
            .unwrap();
        room.on_message(&id("a"), RoomMessage::Position { x: f64::NAN, y: 0.0 }, &mut transport)
            .unwrap();
        assert!(transport.take().is_empty());
        assert_eq!(&room.state().players[&id("a")], &spawn);

        room.on_message(&id("a"), RoomMessage::Position { x: -10.0, y: 9.5 }, &mut transport)
            .unwrap();
        assert_eq!(transport.take().len(), 1);
    }

    #[test]
    fn test_leave_removes_record_and_announces() {
        let mut room = test_room();
        let mut transport = RecordingTransport::default();
        room.on_join(id("a"), None, &mut transport).unwrap();
        room.on_join(id("b"), None, &mut transport).unwrap();
        transport.take();

        room.on_leave(&id("a"), true, &mut transport).unwrap();

        assert_eq!(room.player_count(), 1);
        assert!(!room.contains(&id("a")));
        let sent = transport.take();
        assert_eq!(sent.len(), 2);
        match &sent[0] {
            (None, ServerMessage::State { state }) => {
                assert_eq!(state.player_count, 1);
                assert!(!state.players.contains_key(&id("a")));
            }
            other => panic!("Expected state sync, got {:?}", other),
        }
        assert_eq!(sent[1], (None, ServerMessage::player_left(id("a"), 1)));
    }

    #[test]
    fn test_dropped_leave_behaves_like_graceful() {
        let mut room = test_room();
        let mut transport = RecordingTransport::default();
        room.on_join(id("a"), None, &mut transport).unwrap();
        room.on_leave(&id("a"), false, &mut transport).unwrap();

        assert_eq!(room.player_count(), 0);
        assert!(room.is_empty());
    }

    #[test]
    fn test_leave_unknown_client_is_noop() {
        let mut room = test_room();
        let mut transport = RecordingTransport::default();
        room.on_leave(&id("ghost"), true, &mut transport).unwrap();
        assert!(transport.take().is_empty());
    }

    #[test]
    fn test_count_tracks_joins_and_leaves() {
        let mut room = test_room();
        let mut transport = RecordingTransport::default();
        let mut open: Vec<ClientId> = Vec::new();

        for step in 0..40u32 {
            if step % 3 == 2 && !open.is_empty() {
                let client = open.remove((step as usize) % open.len());
                room.on_leave(&client, step % 2 == 0, &mut transport).unwrap();
            } else {
                let client = ClientId::from(format!("c{}", step));
                room.on_join(client.clone(), None, &mut transport).unwrap();
                open.push(client);
            }
            assert_eq!(room.player_count(), open.len());
            assert_eq!(room.state().players.len(), room.state().player_count);
        }
    }

    #[test]
    fn test_disposed_room_rejects_operations() {
        let mut room = test_room();
        let mut transport = RecordingTransport::default();
        room.on_join(id("a"), None, &mut transport).unwrap();
        room.on_dispose();

        assert_eq!(room.phase(), RoomPhase::Disposed);
        assert_eq!(room.player_count(), 0);
        assert_eq!(
            room.on_join(id("b"), None, &mut transport),
            Err(RoomError::Disposed)
        );
        assert_eq!(
            room.on_message(&id("a"), RoomMessage::Position { x: 0.0, y: 0.0 }, &mut transport),
            Err(RoomError::Disposed)
        );
        assert_eq!(
            room.on_leave(&id("a"), true, &mut transport),
            Err(RoomError::Disposed)
        );
    }
}
