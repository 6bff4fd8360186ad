//! Transport boundary used by rooms
//!
//! A [`Room`](super::Room) never touches sockets. It emits messages through a
//! [`Transport`], which decides how they reach the connected clients. Delivery is
//! best-effort: a destination that is gone or lagging is skipped, never retried.

use std::collections::HashMap;

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use super::ClientId;
use crate::server::ServerMessage;

/// Outbound delivery primitives consumed by a room
pub trait Transport {
    /// Send a message to a single connection
    fn send(&mut self, to: &ClientId, message: ServerMessage);

    /// Send a message to every attached connection
    fn broadcast(&mut self, message: ServerMessage);
}

/// Messages a connection may have queued before further ones are dropped
pub const OUTBOUND_CAPACITY: usize = 256;

/// Sender half of a connection's outbound queue
pub type Outbound = mpsc::Sender<ServerMessage>;

/// Create the outbound queue for one connection
pub fn outbound_channel() -> (Outbound, mpsc::Receiver<ServerMessage>) {
    mpsc::channel(OUTBOUND_CAPACITY)
}

/// Transport backed by one bounded queue per attached connection
///
/// The connection task owning the receiving half writes queued messages to its
/// socket in order. A connection whose queue is full misses messages until it
/// catches up; the next state sync supersedes whatever it missed.
#[derive(Debug, Default)]
pub struct ChannelTransport {
    clients: HashMap<ClientId, Outbound>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start delivering room messages to `client`
    pub fn attach(&mut self, client: ClientId, outbound: Outbound) {
        self.clients.insert(client, outbound);
    }

    /// Stop delivering room messages to `client`
    pub fn detach(&mut self, client: &ClientId) -> bool {
        self.clients.remove(client).is_some()
    }

    pub fn is_attached(&self, client: &ClientId) -> bool {
        self.clients.contains_key(client)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn clear(&mut self) {
        self.clients.clear();
    }
}

fn deliver(client: &ClientId, outbound: &Outbound, message: ServerMessage) {
    match outbound.try_send(message) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            warn!("Outbound queue of {} is full, dropping message", client);
        }
        Err(TrySendError::Closed(_)) => {
            debug!("Dropping message for closed connection {}", client);
        }
    }
}

impl Transport for ChannelTransport {
    fn send(&mut self, to: &ClientId, message: ServerMessage) {
        match self.clients.get(to) {
            Some(outbound) => deliver(to, outbound, message),
            None => debug!("Dropping message for unattached connection {}", to),
        }
    }

    fn broadcast(&mut self, message: ServerMessage) {
        for (client, outbound) in &self.clients {
            deliver(client, outbound, message.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_reaches_only_target() {
        let mut transport = ChannelTransport::new();
        let (a_tx, mut a_rx) = outbound_channel();
        let (b_tx, mut b_rx) = outbound_channel();
        transport.attach(ClientId::from("a"), a_tx);
        transport.attach(ClientId::from("b"), b_tx);

        transport.send(&ClientId::from("a"), ServerMessage::pong(1));

        assert_eq!(a_rx.try_recv().unwrap(), ServerMessage::pong(1));
        assert!(b_rx.try_recv().is_err());
    }

    #[test]
    fn test_broadcast_reaches_all_attached() {
        let mut transport = ChannelTransport::new();
        let (a_tx, mut a_rx) = outbound_channel();
        let (b_tx, mut b_rx) = outbound_channel();
        transport.attach(ClientId::from("a"), a_tx);
        transport.attach(ClientId::from("b"), b_tx);

        transport.broadcast(ServerMessage::pong(2));

        assert_eq!(a_rx.try_recv().unwrap(), ServerMessage::pong(2));
        assert_eq!(b_rx.try_recv().unwrap(), ServerMessage::pong(2));
    }

    #[test]
    fn test_detached_client_receives_nothing() {
        let mut transport = ChannelTransport::new();
        let (a_tx, mut a_rx) = outbound_channel();
        transport.attach(ClientId::from("a"), a_tx);
        assert!(transport.detach(&ClientId::from("a")));
        assert!(!transport.detach(&ClientId::from("a")));

        transport.broadcast(ServerMessage::pong(3));
        assert!(a_rx.try_recv().is_err());
        assert_eq!(transport.len(), 0);
    }

    #[test]
    fn test_closed_receiver_does_not_block_others() {
        let mut transport = ChannelTransport::new();
        let (a_tx, a_rx) = outbound_channel();
        let (b_tx, mut b_rx) = outbound_channel();
        transport.attach(ClientId::from("a"), a_tx);
        transport.attach(ClientId::from("b"), b_tx);
        drop(a_rx);

        transport.broadcast(ServerMessage::pong(4));
        transport.send(&ClientId::from("a"), ServerMessage::pong(5));

        assert_eq!(b_rx.try_recv().unwrap(), ServerMessage::pong(4));
    }

    #[test]
    fn test_stalled_client_queue_is_bounded() {
        let mut transport = ChannelTransport::new();
        let (stalled_tx, mut stalled_rx) = outbound_channel();
        let (live_tx, mut live_rx) = outbound_channel();
        transport.attach(ClientId::from("stalled"), stalled_tx);
        transport.attach(ClientId::from("live"), live_tx);

        for seq in 0..(OUTBOUND_CAPACITY as u64 * 10) {
            transport.broadcast(ServerMessage::pong(seq));
            // The live client keeps up.
            assert_eq!(live_rx.try_recv().unwrap(), ServerMessage::pong(seq));
        }

        let mut queued = Vec::new();
        while let Ok(msg) = stalled_rx.try_recv() {
            queued.push(msg);
        }
        assert_eq!(queued.len(), OUTBOUND_CAPACITY);
        assert_eq!(queued[0], ServerMessage::pong(0));
        assert!(transport.is_attached(&ClientId::from("stalled")));

        // Once drained, the stalled client receives again.
        transport.send(&ClientId::from("stalled"), ServerMessage::pong(7));
        assert_eq!(stalled_rx.try_recv().unwrap(), ServerMessage::pong(7));
    }
}
