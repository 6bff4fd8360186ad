//! WebSocket server implementation
//!
//! Accepts game client connections, assigns each one a [`ClientId`], delivers
//! decoded messages to its room and writes the room's outbound queue back onto
//! the socket.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::protocol::{
    ClientEnvelope, ClientMessage, ErrorCode, ProtocolError, ProtocolResult, ServerMessage,
};
use crate::config::ServerConfig;
use crate::room::{
    outbound_channel, ClientId, Outbound, RegistryError, RoomHandle, RoomRegistry,
};

/// WebSocket server for game client connections
pub struct WebSocketServer {
    config: ServerConfig,
    registry: Arc<RoomRegistry>,
    shutdown_tx: broadcast::Sender<()>,
}

impl WebSocketServer {
    /// Create a new WebSocket server
    pub fn new(config: ServerConfig, registry: Arc<RoomRegistry>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            registry,
            shutdown_tx,
        }
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> anyhow::Result<()> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(&addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    ///
    /// Connections are handled concurrently. On shutdown every connection is
    /// closed and all rooms are disposed.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        info!("WebSocket server listening on ws://{}", listener.local_addr()?);

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let registry = Arc::clone(&self.registry);
                            let shutdown_rx = self.shutdown_tx.subscribe();

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, peer_addr, registry, shutdown_rx).await {
                                    error!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        self.registry.shutdown().await;
        Ok(())
    }
}

/// Per-connection state
struct ClientSession {
    client: ClientId,
    room: Option<RoomHandle>,
    /// Whether the client asked to leave (as opposed to dropping)
    consented: bool,
}

impl ClientSession {
    fn new(client: ClientId) -> Self {
        Self {
            client,
            room: None,
            consented: false,
        }
    }

    /// Tell the room this client is gone, if it joined one
    fn leave_room(&mut self) {
        if let Some(room) = self.room.take() {
            if room.leave(&self.client, self.consented).is_err() {
                debug!("Room {} already disposed when {} left", room.id(), self.client);
            }
        }
    }
}

/// What to do after handling a client frame
#[derive(Debug, PartialEq)]
enum Reply {
    None,
    Message(ServerMessage),
    Close,
}

/// Handle a single WebSocket connection
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    registry: Arc<RoomRegistry>,
    shutdown_rx: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    info!("New connection from {}", peer_addr);

    let ws_stream = accept_async(stream).await?;
    let mut session = ClientSession::new(ClientId::generate());
    debug!("Assigned id {} to {}", session.client, peer_addr);

    let result = connection_loop(ws_stream, peer_addr, &mut session, &registry, shutdown_rx).await;

    // Always release the player record, even when the socket failed mid-send.
    session.leave_room();
    info!("Connection {} from {} closed", session.client, peer_addr);
    result
}

async fn connection_loop(
    ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
    peer_addr: SocketAddr,
    session: &mut ClientSession,
    registry: &RoomRegistry,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (outbound_tx, mut outbound_rx) = outbound_channel();

    let connected = encode(&ServerMessage::connected(session.client.clone()))?;
    ws_sender.send(Message::Text(connected)).await?;

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        debug!("Received message from {}: {}", session.client, text);

                        match handle_message(&text, session, registry, &outbound_tx).await {
                            Reply::None => {}
                            Reply::Message(response) => {
                                ws_sender.send(Message::Text(encode(&response)?)).await?;
                            }
                            Reply::Close => {
                                let _ = ws_sender.send(Message::Close(None)).await;
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        warn!(
                            "Received binary message from {} ({} bytes), ignoring",
                            peer_addr,
                            data.len()
                        );
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        info!("Client {} requested close", session.client);
                        session.consented = true;
                        break;
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => {
                        warn!("WebSocket error from {}: {}", peer_addr, e);
                        break;
                    }
                    None => {
                        info!("Connection dropped by {}", peer_addr);
                        break;
                    }
                }
            }
            outbound = outbound_rx.recv() => {
                // The sender half lives in this loop, so the queue never closes here.
                if let Some(message) = outbound {
                    ws_sender.send(Message::Text(encode(&message)?)).await?;
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received, closing connection to {}", peer_addr);
                let _ = ws_sender.send(Message::Close(None)).await;
                break;
            }
        }
    }

    Ok(())
}

/// Serialize an outgoing message, falling back to an `internal_error` reply
fn encode(message: &ServerMessage) -> ProtocolResult<String> {
    message.to_json().or_else(encoding_failed)
}

fn encoding_failed(error: ProtocolError) -> ProtocolResult<String> {
    error!("Failed to encode server message: {}", error);
    ServerMessage::error_with_code("Failed to encode server message", ErrorCode::InternalError)
        .to_json()
}

/// Handle a client frame and decide what to answer
async fn handle_message(
    text: &str,
    session: &mut ClientSession,
    registry: &RoomRegistry,
    outbound: &Outbound,
) -> Reply {
    let envelope = match ClientEnvelope::from_json(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!("Invalid message from {}: {}", session.client, e);
            return Reply::Message(e.into());
        }
    };

    match envelope.message {
        ClientMessage::Ping { seq } => {
            debug!("Received ping with seq {}", seq);
            Reply::Message(ServerMessage::pong(seq))
        }
        ClientMessage::JoinOrCreate { room, options } => {
            if session.room.is_some() {
                return Reply::Message(ServerMessage::error_with_code(
                    "Already joined a room",
                    ErrorCode::AlreadyJoined,
                ));
            }

            match registry
                .join_or_create(&room, session.client.clone(), options, outbound.clone())
                .await
            {
                Ok(handle) => {
                    debug!(
                        "{} joined room {} ({})",
                        session.client,
                        handle.id(),
                        handle.room_type()
                    );
                    session.room = Some(handle);
                    Reply::None
                }
                Err(e @ RegistryError::UnknownRoomType(_)) => Reply::Message(
                    ServerMessage::error_with_code(e.to_string(), ErrorCode::RoomNotFound),
                ),
                Err(e @ RegistryError::Room(_)) => {
                    warn!("Join for {} failed: {}", session.client, e);
                    Reply::Message(ServerMessage::error_with_code(
                        e.to_string(),
                        ErrorCode::RoomUnavailable,
                    ))
                }
            }
        }
        ClientMessage::Position { x, y } => {
            let Some(room) = &session.room else {
                return Reply::Message(ServerMessage::error_with_code(
                    "Join a room before sending positions",
                    ErrorCode::NotJoined,
                ));
            };

            if room.send_position(&session.client, x, y).is_err() {
                session.room = None;
                return Reply::Message(ServerMessage::error_with_code(
                    "Room is no longer available",
                    ErrorCode::RoomUnavailable,
                ));
            }
            Reply::None
        }
        ClientMessage::Leave => {
            session.consented = true;
            session.leave_room();
            Reply::Close
        }
    }
}
