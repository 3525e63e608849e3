//! Best-effort primary → replica replication over UDP.
//!
//! After a state-changing operation succeeds, the primary's connection
//! handler hands a [`ReplicationUpdate`] to the [`Replicator`], which sends
//! one datagram to every peer and moves on: no acknowledgement, no retry.
//! Each replica runs an [`UpdateListener`] that applies whatever arrives to
//! its own [`Registry`]. Replicas therefore trail the primary closely but
//! without guarantees; every update is safe to apply twice except
//! `Buffer`, which appends.
//!
//! A datagram is the operation's opcode followed by the same ASCII payload
//! a client would send for it, without the terminator.

use std::{
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
};

use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::{
    error::ProtocolError,
    protocol::{Opcode, Request, SEND_PAYLOAD_LENGTH},
    registry::Registry,
    state::Message,
};

/// Large enough for the longest update plus slack to detect oversize ones.
const DATAGRAM_BUFFER: usize = 2 * (SEND_PAYLOAD_LENGTH + 1);

/// A state change the primary made, described for replicas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationUpdate {
    Register(String),
    /// The user logged in, so their mailbox was drained.
    Login(String),
    /// A message was buffered for an offline recipient.
    Buffer(Message),
    Logout(String),
    Delete(String),
}

impl ReplicationUpdate {
    pub fn opcode(&self) -> Opcode {
        self.to_request().opcode()
    }

    pub fn encode(&self) -> Vec<u8> {
        let request = self.to_request();
        let payload = request.payload();
        let mut datagram = Vec::with_capacity(payload.len() + 1);
        datagram.push(request.opcode().as_byte());
        datagram.extend_from_slice(payload.as_bytes());
        datagram
    }

    pub fn decode(datagram: &[u8]) -> Result<Self, ProtocolError> {
        let (&code, operand) = datagram
            .split_first()
            .ok_or_else(|| ProtocolError::malformed("empty datagram"))?;
        let opcode = Opcode::from_byte(code).ok_or(ProtocolError::UnknownOpcode(code))?;

        let update = match Request::decode(opcode, operand)? {
            Request::Register { username } => ReplicationUpdate::Register(username),
            Request::Login { username } => ReplicationUpdate::Login(username),
            Request::Send(message) => ReplicationUpdate::Buffer(message),
            Request::Logout { username } => ReplicationUpdate::Logout(username),
            Request::Delete { username } => ReplicationUpdate::Delete(username),
            Request::Search { .. } => {
                return Err(ProtocolError::malformed("search does not change state"));
            }
        };
        Ok(update)
    }

    fn to_request(&self) -> Request {
        match self {
            ReplicationUpdate::Register(username) => Request::Register {
                username: username.clone(),
            },
            ReplicationUpdate::Login(username) => Request::Login {
                username: username.clone(),
            },
            ReplicationUpdate::Buffer(message) => Request::Send(message.clone()),
            ReplicationUpdate::Logout(username) => Request::Logout {
                username: username.clone(),
            },
            ReplicationUpdate::Delete(username) => Request::Delete {
                username: username.clone(),
            },
        }
    }
}

/// Sends updates to every configured peer, fire-and-forget.
pub struct Replicator {
    socket: Option<UdpSocket>,
    peers: Vec<SocketAddr>,
}

impl Replicator {
    /// Binds an ephemeral UDP socket for talking to `peers`.
    pub async fn bind(peers: Vec<SocketAddr>) -> io::Result<Self> {
        if peers.is_empty() {
            return Ok(Self::disabled());
        }
        let local = if peers.iter().all(SocketAddr::is_ipv6) {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        };
        let socket = UdpSocket::bind(local).await?;
        Ok(Self {
            socket: Some(socket),
            peers,
        })
    }

    /// A replicator with no peers; `propagate` does nothing.
    pub fn disabled() -> Self {
        Self {
            socket: None,
            peers: Vec::new(),
        }
    }

    pub fn peers(&self) -> &[SocketAddr] {
        &self.peers
    }

    pub async fn propagate(&self, update: &ReplicationUpdate) {
        let Some(socket) = &self.socket else {
            return;
        };
        let datagram = update.encode();
        for peer in &self.peers {
            if let Err(err) = socket.send_to(&datagram, peer).await {
                debug!(%peer, error = ?err, "dropping replication update");
            }
        }
        debug!(opcode = ?update.opcode(), peers = self.peers.len(), "update propagated");
    }
}

/// Applies updates arriving on this server's replication address.
pub struct UpdateListener {
    socket: UdpSocket,
    registry: Arc<Registry>,
}

impl UpdateListener {
    pub fn new(socket: UdpSocket, registry: Arc<Registry>) -> Self {
        Self { socket, registry }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Runs until the task is dropped or aborted.
    pub async fn run(self) {
        if let Ok(addr) = self.local_addr() {
            info!(%addr, "replication listener ready");
        }
        let mut buffer = vec![0u8; DATAGRAM_BUFFER];
        loop {
            match self.socket.recv_from(&mut buffer).await {
                Ok((len, from)) => self.handle_datagram(&buffer[..len], from).await,
                Err(err) => warn!(error = ?err, "failed to receive replication update"),
            }
        }
    }

    async fn handle_datagram(&self, datagram: &[u8], from: SocketAddr) {
        match ReplicationUpdate::decode(datagram) {
            Ok(update) => {
                let changed = self.registry.apply(&update).await;
                debug!(%from, ?update, changed, "applied replication update");
            }
            Err(err) => warn!(%from, error = %err, "ignoring malformed replication update"),
        }
    }
}
