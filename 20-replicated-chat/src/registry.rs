//! The authoritative in-memory state shared by every worker.
//!
//! A [`Registry`] owns the [`ServerState`] together with the table of live
//! sessions behind a single lock. Every public operation is one critical
//! section, so a login draining a mailbox can never interleave with a send
//! appending to it. Operations that change the persisted state write a
//! snapshot before releasing the lock, which keeps snapshots in mutation
//! order.
//!
//! The lock is never held across a socket operation. A send looks the
//! recipient's session up under the lock, releases it, and then writes the
//! push through the session's [`FrameWriter`] itself, so the sender learns
//! whether the push reached the recipient's socket.

use std::collections::HashMap;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{
    error::{ProtocolError, SnapshotError},
    protocol::{FrameWriter, Response},
    replication::ReplicationUpdate,
    snapshot::SnapshotStore,
    state::{Delivery, Message, ServerState, WildcardPattern},
};

/// Identifies one accepted client connection for the lifetime of the server.
pub type ConnectionId = u64;

/// Search results are counted by a two-byte header.
const MAX_SEARCH_RESULTS: usize = u16::MAX as usize;

/// Binding between a logged-in username and the connection serving it.
#[derive(Debug, Clone)]
pub struct Session {
    connection: ConnectionId,
    writer: FrameWriter,
}

impl Session {
    pub fn new(connection: ConnectionId, writer: FrameWriter) -> Self {
        Self { connection, writer }
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    async fn push(&self, delivery: Delivery) -> Result<(), ProtocolError> {
        self.writer.write(&Response::Receive(delivery)).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    NotRegistered,
    AlreadyLoggedIn,
    /// The session was created; carries the drained mailbox, oldest first.
    LoggedIn(Vec<Message>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    RecipientMissing,
    Delivered,
    /// Sender and recipient are the same logged-in user; the push is the
    /// only thing they will see.
    DeliveredToSelf,
    Buffered,
    /// The push could not be written to the recipient's socket, or their
    /// mailbox was full.
    Failed,
}

struct Inner {
    state: ServerState,
    sessions: HashMap<String, Session>,
}

pub struct Registry {
    inner: Mutex<Inner>,
    store: Option<SnapshotStore>,
}

impl Registry {
    pub fn new(state: ServerState, store: Option<SnapshotStore>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state,
                sessions: HashMap::new(),
            }),
            store,
        }
    }

    /// A registry that never touches disk.
    pub fn ephemeral() -> Self {
        Self::new(ServerState::new(), None)
    }

    /// Restores the last snapshot from `store`, or starts empty if there is none.
    pub async fn open(store: SnapshotStore) -> Result<Self, SnapshotError> {
        let state = match store.load().await? {
            Some(snapshot) => {
                debug!(
                    path = %store.path().display(),
                    taken = %snapshot.timestamp,
                    "restored snapshot"
                );
                snapshot.state
            }
            None => ServerState::new(),
        };
        Ok(Self::new(state, Some(store)))
    }

    /// Returns `false` if the username is already registered.
    pub async fn register(&self, username: &str) -> bool {
        let mut inner = self.inner.lock().await;
        if !inner.state.register(username) {
            return false;
        }
        self.persist(&inner.state).await;
        true
    }

    pub async fn login(&self, username: &str, session: Session) -> LoginOutcome {
        let mut inner = self.inner.lock().await;
        if !inner.state.is_registered(username) {
            return LoginOutcome::NotRegistered;
        }
        if inner.sessions.contains_key(username) {
            return LoginOutcome::AlreadyLoggedIn;
        }

        inner.sessions.insert(username.to_string(), session);
        let unread = inner.state.drain_mailbox(username);
        if !unread.is_empty() {
            self.persist(&inner.state).await;
        }
        LoginOutcome::LoggedIn(unread)
    }

    /// Registered usernames matching the wildcard `query`, sorted.
    pub async fn search(&self, query: &str) -> Result<Vec<String>, regex::Error> {
        let pattern = WildcardPattern::new(query)?;
        let mut matches = self.inner.lock().await.state.search(&pattern);
        if matches.len() > MAX_SEARCH_RESULTS {
            warn!(query, total = matches.len(), "truncating search results");
            matches.truncate(MAX_SEARCH_RESULTS);
        }
        Ok(matches)
    }

    /// Pushes `message` to its recipient if they are logged in, otherwise
    /// buffers it. A push that cannot be written drops the recipient's
    /// session.
    pub async fn send(&self, message: Message) -> SendOutcome {
        let session = {
            let mut inner = self.inner.lock().await;
            if !inner.state.is_registered(&message.recipient) {
                return SendOutcome::RecipientMissing;
            }
            match inner.sessions.get(&message.recipient).cloned() {
                Some(session) => session,
                None => {
                    let recipient = message.recipient.clone();
                    if !inner.state.buffer(message) {
                        warn!(%recipient, "mailbox full");
                        return SendOutcome::Failed;
                    }
                    self.persist(&inner.state).await;
                    return SendOutcome::Buffered;
                }
            }
        };

        if let Err(err) = session.push(message.delivery()).await {
            warn!(recipient = %message.recipient, error = %err, "push failed, dropping session");
            let mut inner = self.inner.lock().await;
            take_owned_session(&mut inner.sessions, &message.recipient, session.connection);
            return SendOutcome::Failed;
        }
        if message.sender == message.recipient {
            SendOutcome::DeliveredToSelf
        } else {
            SendOutcome::Delivered
        }
    }

    /// Ends `username`'s session if `connection` owns it.
    pub async fn logout(&self, username: &str, connection: ConnectionId) -> bool {
        let mut inner = self.inner.lock().await;
        take_owned_session(&mut inner.sessions, username, connection).is_some()
    }

    /// Ends the session and unregisters `username` if `connection` owns the session.
    pub async fn delete(&self, username: &str, connection: ConnectionId) -> bool {
        let mut inner = self.inner.lock().await;
        if take_owned_session(&mut inner.sessions, username, connection).is_none() {
            return false;
        }
        inner.state.remove(username);
        self.persist(&inner.state).await;
        true
    }

    /// Drops every session owned by `connection`, returning their usernames.
    pub async fn release(&self, connection: ConnectionId) -> Vec<String> {
        let mut inner = self.inner.lock().await;
        let owned: Vec<String> = inner
            .sessions
            .iter()
            .filter(|(_, session)| session.connection == connection)
            .map(|(username, _)| username.clone())
            .collect();
        for username in &owned {
            inner.sessions.remove(username);
        }
        owned
    }

    /// Applies an update received from the primary. Returns whether the
    /// persisted state changed.
    pub async fn apply(&self, update: &ReplicationUpdate) -> bool {
        let mut inner = self.inner.lock().await;
        let changed = match update {
            ReplicationUpdate::Register(username) => inner.state.register(username),
            ReplicationUpdate::Login(username) => !inner.state.drain_mailbox(username).is_empty(),
            ReplicationUpdate::Buffer(message) => inner.state.buffer(message.clone()),
            // Sessions are local to the server holding the connection.
            ReplicationUpdate::Logout(_) => false,
            ReplicationUpdate::Delete(username) => inner.state.remove(username),
        };
        if changed {
            self.persist(&inner.state).await;
        }
        changed
    }

    pub async fn is_logged_in(&self, username: &str) -> bool {
        self.inner.lock().await.sessions.contains_key(username)
    }

    /// A copy of the current persisted state.
    pub async fn state(&self) -> ServerState {
        self.inner.lock().await.state.clone()
    }

    async fn persist(&self, state: &ServerState) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(err) = store.save(state).await {
            warn!(error = ?err, "failed to write snapshot, continuing in memory");
        }
    }
}

fn take_owned_session(
    sessions: &mut HashMap<String, Session>,
    username: &str,
    connection: ConnectionId,
) -> Option<Session> {
    match sessions.get(username) {
        Some(session) if session.connection == connection => sessions.remove(username),
        _ => None,
    }
}
