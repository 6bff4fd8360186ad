//! Room registry and per-room event loop
//!
//! Each room runs as one tokio task that owns the [`Room`] and its
//! [`ChannelTransport`] and processes commands strictly one at a time, so room
//! state needs no locking. Connections talk to a room through a cloneable
//! [`RoomHandle`]. The [`RoomRegistry`] implements "join or create" for the
//! configured room type.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use super::{ChannelTransport, ClientId, Outbound, Room, RoomError, RoomMessage, RoomResult};
use crate::config::RoomConfig;
use crate::health::ServerStats;

/// Errors that can occur during registry operations
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Unknown room type: {0}")]
    UnknownRoomType(String),

    #[error("Room error: {0}")]
    Room(#[from] RoomError),
}

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Commands processed by a room task
#[derive(Debug)]
pub enum RoomCommand {
    Join {
        client: ClientId,
        options: Option<serde_json::Value>,
        outbound: Outbound,
        reply: oneshot::Sender<RoomResult<()>>,
    },
    Position {
        client: ClientId,
        x: f64,
        y: f64,
    },
    Leave {
        client: ClientId,
        consented: bool,
    },
    #[cfg(test)]
    State {
        reply: oneshot::Sender<super::RoomState>,
    },
    Dispose,
}

/// Handle to a running room task
#[derive(Debug, Clone)]
pub struct RoomHandle {
    id: Uuid,
    room_type: String,
    commands: mpsc::UnboundedSender<RoomCommand>,
}

impl RoomHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn room_type(&self) -> &str {
        &self.room_type
    }

    /// Whether the room task has stopped accepting commands
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Join `client`, delivering its room messages to `outbound`
    pub async fn join(
        &self,
        client: ClientId,
        options: Option<serde_json::Value>,
        outbound: Outbound,
    ) -> RoomResult<()> {
        let (reply, rx) = oneshot::channel();
        self.command(RoomCommand::Join {
            client,
            options,
            outbound,
            reply,
        })?;
        rx.await.map_err(|_| RoomError::Disposed)?
    }

    /// Queue a position update from `client`
    pub fn send_position(&self, client: &ClientId, x: f64, y: f64) -> RoomResult<()> {
        self.command(RoomCommand::Position {
            client: client.clone(),
            x,
            y,
        })
    }

    /// Queue a leave for `client`
    pub fn leave(&self, client: &ClientId, consented: bool) -> RoomResult<()> {
        self.command(RoomCommand::Leave {
            client: client.clone(),
            consented,
        })
    }

    /// Snapshot of the room state after all previously queued commands
    #[cfg(test)]
    pub async fn state(&self) -> RoomResult<super::RoomState> {
        let (reply, rx) = oneshot::channel();
        self.command(RoomCommand::State { reply })?;
        rx.await.map_err(|_| RoomError::Disposed)
    }

    /// Ask the room to dispose itself
    pub fn dispose(&self) {
        let _ = self.commands.send(RoomCommand::Dispose);
    }

    fn command(&self, command: RoomCommand) -> RoomResult<()> {
        self.commands
            .send(command)
            .map_err(|_| RoomError::Disposed)
    }
}

type RoomMap = Arc<RwLock<HashMap<String, RoomHandle>>>;

/// Owns a room for the lifetime of its task
struct RoomRunner {
    room: Room,
    transport: ChannelTransport,
    commands: mpsc::UnboundedReceiver<RoomCommand>,
    empty_timeout: Option<Duration>,
    rooms: RoomMap,
    stats: Arc<ServerStats>,
}

impl RoomRunner {
    async fn run(mut self) {
        let mut dispose_at: Option<Instant> = None;

        loop {
            let deadline = dispose_at.unwrap_or_else(Instant::now);
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(RoomCommand::Dispose) | None => break,
                        Some(command) => self.handle(command),
                    }
                }
                _ = tokio::time::sleep_until(deadline), if dispose_at.is_some() => {
                    info!("Room {} stayed empty, disposing", self.room.id());
                    break;
                }
            }

            dispose_at = match self.empty_timeout {
                Some(timeout) if self.room.is_empty() => {
                    dispose_at.or_else(|| Some(Instant::now() + timeout))
                }
                _ => None,
            };
        }

        self.finish().await;
    }

    fn handle(&mut self, command: RoomCommand) {
        let before = self.room.player_count();

        match command {
            RoomCommand::Join {
                client,
                options,
                outbound,
                reply,
            } => {
                let duplicate =
                    self.room.contains(&client) || self.transport.is_attached(&client);
                let result = if duplicate {
                    Err(RoomError::DuplicateClient(client))
                } else {
                    self.transport.attach(client.clone(), outbound);
                    let result = self
                        .room
                        .on_join(client.clone(), options.as_ref(), &mut self.transport);
                    if result.is_err() {
                        self.transport.detach(&client);
                    }
                    result
                };
                let _ = reply.send(result);
            }
            RoomCommand::Position { client, x, y } => {
                if let Err(e) = self.room.on_message(
                    &client,
                    RoomMessage::Position { x, y },
                    &mut self.transport,
                ) {
                    debug!("Position from {} not applied: {}", client, e);
                }
            }
            RoomCommand::Leave { client, consented } => {
                self.transport.detach(&client);
                if let Err(e) = self.room.on_leave(&client, consented, &mut self.transport) {
                    debug!("Leave for {} not applied: {}", client, e);
                }
            }
            #[cfg(test)]
            RoomCommand::State { reply } => {
                let _ = reply.send(self.room.state());
            }
            RoomCommand::Dispose => {}
        }

        self.stats.adjust_players(before, self.room.player_count());
    }

    async fn finish(mut self) {
        // Stop intake first: a registry holding the map lock may be waiting on a
        // join reply, which resolves once the queued command is dropped.
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            debug!("Room {} dropping command during dispose: {:?}", self.room.id(), command);
        }

        debug!(
            "Room {} releasing {} connections",
            self.room.id(),
            self.transport.len()
        );
        let before = self.room.player_count();
        self.room.on_dispose();
        self.transport.clear();
        self.stats.adjust_players(before, self.room.player_count());
        self.stats.room_closed();

        let mut rooms = self.rooms.write().await;
        let room_type = &self.room.metadata().room_type;
        if rooms.get(room_type).map(RoomHandle::id) == Some(self.room.id()) {
            rooms.remove(room_type);
        }
    }
}

/// Creates rooms on demand and routes joins to them
pub struct RoomRegistry {
    config: RoomConfig,
    rooms: RoomMap,
    stats: Arc<ServerStats>,
}

impl RoomRegistry {
    pub fn new(config: RoomConfig, stats: Arc<ServerStats>) -> Self {
        Self {
            config,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            stats,
        }
    }

    /// Join the running room of `room_type`, creating it if there is none.
    ///
    /// Calls are serialized so concurrent first joins land in the same room.
    pub async fn join_or_create(
        &self,
        room_type: &str,
        client: ClientId,
        options: Option<serde_json::Value>,
        outbound: Outbound,
    ) -> RegistryResult<RoomHandle> {
        if room_type != self.config.room_type {
            return Err(RegistryError::UnknownRoomType(room_type.to_string()));
        }

        let mut rooms = self.rooms.write().await;

        if let Some(handle) = rooms.get(room_type).filter(|h| !h.is_closed()).cloned() {
            match handle
                .join(client.clone(), options.clone(), outbound.clone())
                .await
            {
                Ok(()) => return Ok(handle),
                Err(RoomError::Disposed) => {
                    debug!("Room {} was disposed, creating a new one", handle.id());
                    rooms.remove(room_type);
                }
                Err(e) => return Err(e.into()),
            }
        }

        let handle = self.create_room();
        handle.join(client, options, outbound).await?;
        rooms.insert(room_type.to_string(), handle.clone());
        Ok(handle)
    }

    #[cfg(test)]
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Dispose every room
    pub async fn shutdown(&self) {
        let handles: Vec<RoomHandle> = {
            let mut rooms = self.rooms.write().await;
            rooms.drain().map(|(_, handle)| handle).collect()
        };

        if !handles.is_empty() {
            info!("Disposing {} rooms", handles.len());
        }
        for handle in handles {
            handle.dispose();
        }
    }

    fn create_room(&self) -> RoomHandle {
        let room = Room::new(self.config.metadata(), self.config.settings());
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let handle = RoomHandle {
            id: room.id(),
            room_type: room.metadata().room_type.clone(),
            commands: commands_tx,
        };

        info!(
            "Created room {} of type {} ({}; positions: {:?})",
            handle.id,
            handle.room_type,
            room.metadata().description.as_deref().unwrap_or("no description"),
            self.config.settings().position_policy
        );
        self.stats.room_opened();

        let runner = RoomRunner {
            room,
            transport: ChannelTransport::new(),
            commands: commands_rx,
            empty_timeout: self.config.empty_room_timeout(),
            rooms: Arc::clone(&self.rooms),
            stats: Arc::clone(&self.stats),
        };
        tokio::spawn(runner.run());

        handle
    }
}
