//! One task per client connection.
//!
//! A reader task decodes requests off the socket and forwards them over a
//! channel, so the connection loop only ever waits on cancel-safe channel
//! receives. The loop `select!`s between the next request and the idle
//! timer.
//!
//! The write half sits in a [`FrameWriter`] shared with the session this
//! connection logs in. Responses from the loop and pushes from other
//! connections' senders go through the same lock, a whole frame at a time.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncBufRead, BufReader},
    net::TcpStream,
    select,
    sync::mpsc,
    time::{Instant, sleep},
};
use tracing::{debug, info, warn};

use crate::{
    error::ProtocolError,
    protocol::{FrameWriter, Request, Response, Status, read_request},
    registry::{ConnectionId, LoginOutcome, Registry, SendOutcome, Session},
    replication::{ReplicationUpdate, Replicator},
    state::Message,
};

/// Requests are strictly sequential per connection; a small queue is plenty.
const REQUEST_QUEUE: usize = 8;

/// Everything a connection needs from the server that accepted it.
#[derive(Clone)]
pub struct ConnectionContext {
    pub registry: Arc<Registry>,
    pub replicator: Arc<Replicator>,
    pub idle_timeout: Duration,
    pub write_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Unauthenticated,
    LoggedIn(String),
    LoggedOut,
    Terminated,
}

/// What the reader task hands to the connection loop.
enum Inbound {
    Request(Request),
    /// A frame that could not be decoded; answer it and keep going.
    Rejected(ProtocolError),
    /// The stream is unusable.
    Failed(ProtocolError),
}

/// Serves one accepted client until it disconnects, fails, or idles out.
pub async fn serve_connection(
    stream: TcpStream,
    id: ConnectionId,
    context: ConnectionContext,
) -> Result<()> {
    let peer = stream.peer_addr().ok();
    let (reader, writer) = stream.into_split();
    let writer = FrameWriter::with_timeout(writer, context.write_timeout);

    let (request_tx, mut requests) = mpsc::channel(REQUEST_QUEUE);
    let reader_task = tokio::spawn(read_requests(BufReader::new(reader), request_tx));

    let mut handler = ConnectionHandler::new(
        id,
        Arc::clone(&context.registry),
        Arc::clone(&context.replicator),
        writer.clone(),
    );
    debug!(connection = id, ?peer, "connection opened");

    let result = run_connection(
        &mut handler,
        &mut requests,
        &writer,
        context.idle_timeout,
        peer,
    )
    .await;

    handler.close().await;
    writer.close().await;
    reader_task.abort();
    debug!(connection = id, ?peer, "connection closed");
    result
}

async fn run_connection(
    handler: &mut ConnectionHandler,
    requests: &mut mpsc::Receiver<Inbound>,
    writer: &FrameWriter,
    idle_timeout: Duration,
    peer: Option<SocketAddr>,
) -> Result<()> {
    let idle = sleep(idle_timeout);
    tokio::pin!(idle);

    loop {
        select! {
            inbound = requests.recv() => {
                let response = match inbound {
                    Some(Inbound::Request(request)) => handler.handle(request).await,
                    Some(Inbound::Rejected(err)) => {
                        debug!(connection = handler.id, ?peer, error = %err, "rejected request");
                        Some(rejection(&err))
                    }
                    Some(Inbound::Failed(err)) => {
                        return Err(err).context("failed to read request");
                    }
                    None => return Ok(()),
                };
                if let Some(response) = response {
                    writer
                        .write(&response)
                        .await
                        .context("failed to write response")?;
                }
                idle.as_mut().reset(Instant::now() + idle_timeout);
            }
            () = &mut idle => {
                info!(connection = handler.id, ?peer, "dropping idle connection");
                return Ok(());
            }
        }
    }
}

async fn read_requests<R>(mut reader: R, requests: mpsc::Sender<Inbound>)
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let inbound = match read_request(&mut reader).await {
            Ok(Some(request)) => Inbound::Request(request),
            Ok(None) => return,
            Err(err) if err.is_recoverable() => Inbound::Rejected(err),
            Err(err) => {
                let _ = requests.send(Inbound::Failed(err)).await;
                return;
            }
        };
        if requests.send(inbound).await.is_err() {
            return;
        }
    }
}

/// The status sent back for a frame that could not be decoded.
pub fn rejection(err: &ProtocolError) -> Response {
    match err {
        ProtocolError::UnknownOpcode(_) => Response::Status(Status::BadOperation),
        _ => Response::Status(Status::UnknownError),
    }
}

/// The per-connection state machine.
///
/// Register and Search work in any state. Login moves to `LoggedIn`;
/// Logout and Delete leave it. Send, Logout and Delete are only honoured
/// for the user this connection is logged in as; anything else gets
/// `UNKNOWN_ERROR`.
pub struct ConnectionHandler {
    id: ConnectionId,
    state: ConnectionState,
    registry: Arc<Registry>,
    replicator: Arc<Replicator>,
    writer: FrameWriter,
}

impl ConnectionHandler {
    pub fn new(
        id: ConnectionId,
        registry: Arc<Registry>,
        replicator: Arc<Replicator>,
        writer: FrameWriter,
    ) -> Self {
        Self {
            id,
            state: ConnectionState::Unauthenticated,
            registry,
            replicator,
            writer,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Runs one request. `None` means the request needs no reply frame of
    /// its own (a message sent to oneself arrives as a push instead).
    pub async fn handle(&mut self, request: Request) -> Option<Response> {
        let response = match request {
            Request::Register { username } => self.register(username).await,
            Request::Login { username } => self.login(username).await,
            Request::Search { query } => self.search(&query).await,
            Request::Send(message) => return self.send(message).await,
            Request::Logout { username } => self.logout(username).await,
            Request::Delete { username } => self.delete(username).await,
        };
        Some(response)
    }

    /// Releases any session this connection still holds.
    pub async fn close(&mut self) {
        let released = self.registry.release(self.id).await;
        if !released.is_empty() {
            info!(connection = self.id, users = ?released, "released sessions of closed connection");
        }
        self.state = ConnectionState::Terminated;
    }

    fn logged_in_as(&self) -> Option<&str> {
        match &self.state {
            ConnectionState::LoggedIn(username) => Some(username),
            _ => None,
        }
    }

    async fn register(&self, username: String) -> Response {
        if !self.registry.register(&username).await {
            debug!(connection = self.id, %username, "username already registered");
            return Response::Status(Status::RegisterExists);
        }
        info!(connection = self.id, %username, "registered");
        self.replicator
            .propagate(&ReplicationUpdate::Register(username))
            .await;
        Response::Status(Status::RegisterOk)
    }

    async fn login(&mut self, username: String) -> Response {
        if let Some(current) = self.logged_in_as() {
            debug!(connection = self.id, current, "connection is already logged in");
            return Response::Status(Status::LoginAlreadyLoggedIn);
        }

        let session = Session::new(self.id, self.writer.clone());
        match self.registry.login(&username, session).await {
            LoginOutcome::NotRegistered => Response::Status(Status::LoginNotRegistered),
            LoginOutcome::AlreadyLoggedIn => Response::Status(Status::LoginAlreadyLoggedIn),
            LoginOutcome::LoggedIn(unread) => {
                info!(connection = self.id, %username, unread = unread.len(), "logged in");
                self.replicator
                    .propagate(&ReplicationUpdate::Login(username.clone()))
                    .await;
                self.state = ConnectionState::LoggedIn(username);
                if unread.is_empty() {
                    Response::Status(Status::LoginOkNoUnread)
                } else {
                    Response::Unread(unread.iter().map(Message::delivery).collect())
                }
            }
        }
    }

    async fn search(&self, query: &str) -> Response {
        match self.registry.search(query).await {
            Ok(matches) if matches.is_empty() => Response::Status(Status::SearchNoResults),
            Ok(matches) => Response::SearchResults(matches),
            Err(err) => {
                warn!(connection = self.id, query, error = %err, "search failed");
                Response::Status(Status::UnknownError)
            }
        }
    }

    async fn send(&self, message: Message) -> Option<Response> {
        if self.logged_in_as() != Some(message.sender.as_str()) {
            warn!(
                connection = self.id,
                sender = %message.sender,
                "send from a user this connection is not logged in as"
            );
            return Some(Response::Status(Status::UnknownError));
        }

        let status = match self.registry.send(message.clone()).await {
            SendOutcome::RecipientMissing => Status::SendRecipientDne,
            SendOutcome::Delivered => Status::SendOkDelivered,
            SendOutcome::DeliveredToSelf => return None,
            SendOutcome::Buffered => {
                self.replicator
                    .propagate(&ReplicationUpdate::Buffer(message))
                    .await;
                Status::SendOkBuffered
            }
            SendOutcome::Failed => Status::SendFailed,
        };
        Some(Response::Status(status))
    }

    async fn logout(&mut self, username: String) -> Response {
        if self.logged_in_as() != Some(username.as_str())
            || !self.registry.logout(&username, self.id).await
        {
            return self.reject_session_op(&username, "logout");
        }
        self.state = ConnectionState::LoggedOut;
        info!(connection = self.id, %username, "logged out");
        self.replicator
            .propagate(&ReplicationUpdate::Logout(username))
            .await;
        Response::Status(Status::LogoutOk)
    }

    async fn delete(&mut self, username: String) -> Response {
        if self.logged_in_as() != Some(username.as_str())
            || !self.registry.delete(&username, self.id).await
        {
            return self.reject_session_op(&username, "delete");
        }
        self.state = ConnectionState::LoggedOut;
        info!(connection = self.id, %username, "deleted account");
        self.replicator
            .propagate(&ReplicationUpdate::Delete(username))
            .await;
        Response::Status(Status::DeleteOk)
    }

    fn reject_session_op(&mut self, username: &str, operation: &str) -> Response {
        warn!(connection = self.id, username, operation, "no matching session");
        // The registry may have dropped our session after a failed push.
        if self.logged_in_as() == Some(username) {
            self.state = ConnectionState::LoggedOut;
        }
        Response::Status(Status::UnknownError)
    }
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::DuplexStream,
        net::UdpSocket,
        time::timeout,
    };

    use super::*;
    use crate::{
        protocol::read_response,
        state::{Delivery, MESSAGE_LENGTH},
    };

    /// A handler plus the client's end of its socket.
    struct Harness {
        handler: ConnectionHandler,
        pushes: BufReader<DuplexStream>,
    }

    impl Harness {
        /// The next push written to this connection, if one arrives promptly.
        async fn next_push(&mut self) -> Option<Delivery> {
            match timeout(Duration::from_millis(50), read_response(&mut self.pushes)).await {
                Ok(Ok(Some(Response::Receive(delivery)))) => Some(delivery),
                _ => None,
            }
        }
    }

    fn harness(id: ConnectionId, registry: &Arc<Registry>) -> Harness {
        harness_with(id, registry, Arc::new(Replicator::disabled()))
    }

    fn harness_with(
        id: ConnectionId,
        registry: &Arc<Registry>,
        replicator: Arc<Replicator>,
    ) -> Harness {
        let (server, client) = tokio::io::duplex(64 * 1024);
        Harness {
            handler: ConnectionHandler::new(
                id,
                Arc::clone(registry),
                replicator,
                FrameWriter::new(server),
            ),
            pushes: BufReader::new(client),
        }
    }

    fn register(username: &str) -> Request {
        Request::Register {
            username: username.into(),
        }
    }

    fn login(username: &str) -> Request {
        Request::Login {
            username: username.into(),
        }
    }

    fn logout(username: &str) -> Request {
        Request::Logout {
            username: username.into(),
        }
    }

    fn send(sender: &str, recipient: &str, body: &str) -> Request {
        Request::Send(Message::new(sender, recipient, body))
    }

    fn status(status: Status) -> Option<Response> {
        Some(Response::Status(status))
    }

    #[tokio::test]
    async fn self_send_scenario() {
        let registry = Arc::new(Registry::ephemeral());
        let mut foo = harness(1, &registry);

        assert_eq!(foo.handler.handle(register("foo")).await, status(Status::RegisterOk));
        assert_eq!(foo.handler.handle(login("foo")).await, status(Status::LoginOkNoUnread));
        assert_eq!(
            foo.handler
                .handle(Request::Search {
                    query: "foo".into()
                })
                .await,
            Some(Response::SearchResults(vec!["foo".into()]))
        );

        assert_eq!(foo.handler.handle(send("foo", "foo", "hi")).await, None);
        assert_eq!(foo.next_push().await, Some(Delivery::new("foo", "hi")));
        assert_eq!(foo.next_push().await, None);
    }

    #[tokio::test]
    async fn offline_recipient_scenario() {
        let registry = Arc::new(Registry::ephemeral());
        let mut a = harness(1, &registry);
        let mut b = harness(2, &registry);

        a.handler.handle(register("a")).await;
        a.handler.handle(register("b")).await;
        a.handler.handle(login("a")).await;

        assert_eq!(
            a.handler.handle(send("a", "b", "hello")).await,
            status(Status::SendOkBuffered)
        );
        assert_eq!(
            b.handler.handle(login("b")).await,
            Some(Response::Unread(vec![Delivery::new("a", "hello")]))
        );
        assert_eq!(
            a.handler.handle(send("a", "b", "live")).await,
            status(Status::SendOkDelivered)
        );
        assert_eq!(b.next_push().await, Some(Delivery::new("a", "live")));
    }

    #[tokio::test]
    async fn duplicate_and_unknown_users() {
        let registry = Arc::new(Registry::ephemeral());
        let mut conn = harness(1, &registry);

        assert_eq!(conn.handler.handle(login("x")).await, status(Status::LoginNotRegistered));
        conn.handler.handle(register("x")).await;
        assert_eq!(conn.handler.handle(register("x")).await, status(Status::RegisterExists));
        assert_eq!(
            conn.handler
                .handle(Request::Search { query: "y*".into() })
                .await,
            status(Status::SearchNoResults)
        );
    }

    #[tokio::test]
    async fn session_ops_require_a_login() {
        let registry = Arc::new(Registry::ephemeral());
        let mut conn = harness(1, &registry);
        conn.handler.handle(register("a")).await;
        conn.handler.handle(register("b")).await;

        assert_eq!(conn.handler.handle(send("a", "b", "hi")).await, status(Status::UnknownError));
        assert_eq!(conn.handler.handle(logout("a")).await, status(Status::UnknownError));
        assert_eq!(
            conn.handler
                .handle(Request::Delete {
                    username: "a".into()
                })
                .await,
            status(Status::UnknownError)
        );

        conn.handler.handle(login("a")).await;
        assert_eq!(
            conn.handler.handle(send("b", "a", "spoofed")).await,
            status(Status::UnknownError)
        );
        assert_eq!(conn.handler.handle(logout("b")).await, status(Status::UnknownError));
        assert_eq!(*conn.handler.state(), ConnectionState::LoggedIn("a".into()));
    }

    #[tokio::test]
    async fn login_twice_on_one_connection_is_refused() {
        let registry = Arc::new(Registry::ephemeral());
        let mut conn = harness(1, &registry);
        conn.handler.handle(register("a")).await;
        conn.handler.handle(register("b")).await;
        conn.handler.handle(login("a")).await;

        assert_eq!(conn.handler.handle(login("b")).await, status(Status::LoginAlreadyLoggedIn));
        assert!(!registry.is_logged_in("b").await);
    }

    #[tokio::test]
    async fn logout_then_login_again() {
        let registry = Arc::new(Registry::ephemeral());
        let mut conn = harness(1, &registry);
        conn.handler.handle(register("a")).await;
        conn.handler.handle(login("a")).await;

        assert_eq!(conn.handler.handle(logout("a")).await, status(Status::LogoutOk));
        assert_eq!(*conn.handler.state(), ConnectionState::LoggedOut);
        assert_eq!(conn.handler.handle(login("a")).await, status(Status::LoginOkNoUnread));
    }

    #[tokio::test]
    async fn delete_ends_the_session_and_frees_the_name() {
        let registry = Arc::new(Registry::ephemeral());
        let mut conn = harness(1, &registry);
        conn.handler.handle(register("a")).await;
        conn.handler.handle(login("a")).await;

        assert_eq!(
            conn.handler
                .handle(Request::Delete {
                    username: "a".into()
                })
                .await,
            status(Status::DeleteOk)
        );
        assert_eq!(*conn.handler.state(), ConnectionState::LoggedOut);
        assert_eq!(conn.handler.handle(login("a")).await, status(Status::LoginNotRegistered));
        assert_eq!(conn.handler.handle(register("a")).await, status(Status::RegisterOk));
    }

    #[tokio::test]
    async fn closing_releases_the_session() {
        let registry = Arc::new(Registry::ephemeral());
        let mut first = harness(1, &registry);
        let mut second = harness(2, &registry);
        first.handler.handle(register("a")).await;
        first.handler.handle(login("a")).await;

        assert_eq!(second.handler.handle(login("a")).await, status(Status::LoginAlreadyLoggedIn));
        first.handler.close().await;
        assert_eq!(*first.handler.state(), ConnectionState::Terminated);
        assert_eq!(second.handler.handle(login("a")).await, status(Status::LoginOkNoUnread));
    }

    #[tokio::test]
    async fn send_to_a_vanished_session_fails() {
        let registry = Arc::new(Registry::ephemeral());
        let mut a = harness(1, &registry);
        let b = harness(2, &registry);
        let Harness {
            handler: mut b_handler,
            pushes: b_pushes,
        } = b;

        a.handler.handle(register("a")).await;
        a.handler.handle(register("b")).await;
        a.handler.handle(login("a")).await;
        b_handler.handle(login("b")).await;
        drop(b_pushes);

        assert_eq!(a.handler.handle(send("a", "b", "hi")).await, status(Status::SendFailed));
        // b's session is gone, so its logout is refused and it may log in again.
        assert_eq!(b_handler.handle(logout("b")).await, status(Status::UnknownError));
        assert_eq!(*b_handler.state(), ConnectionState::LoggedOut);
    }

    #[tokio::test]
    async fn recipient_that_stops_reading_gets_the_sender_a_send_failed() {
        let registry = Arc::new(Registry::ephemeral());
        let mut a = harness(1, &registry);
        // b's socket buffer holds a single push and nobody reads it.
        let (server, _unread) = tokio::io::duplex(512);
        let mut b = ConnectionHandler::new(
            2,
            Arc::clone(&registry),
            Arc::new(Replicator::disabled()),
            FrameWriter::with_timeout(server, Duration::from_millis(50)),
        );

        a.handler.handle(register("a")).await;
        a.handler.handle(register("b")).await;
        a.handler.handle(login("a")).await;
        b.handle(login("b")).await;

        let body = "x".repeat(MESSAGE_LENGTH);
        let mut delivered = 0;
        let failed = loop {
            match a.handler.handle(send("a", "b", &body)).await {
                Some(Response::Status(Status::SendOkDelivered)) => delivered += 1,
                other => break other,
            }
        };
        assert_eq!(failed, status(Status::SendFailed));
        assert!(delivered <= 2, "{delivered} pushes reported delivered");

        // b no longer holds a session, so the next message is kept for later.
        assert!(!registry.is_logged_in("b").await);
        assert_eq!(
            a.handler.handle(send("a", "b", "later")).await,
            status(Status::SendOkBuffered)
        );
    }

    #[test]
    fn rejections_map_to_status_codes() {
        assert_eq!(
            rejection(&ProtocolError::UnknownOpcode(42)),
            Response::Status(Status::BadOperation)
        );
        assert_eq!(
            rejection(&ProtocolError::malformed("bad")),
            Response::Status(Status::UnknownError)
        );
    }

    async fn next_opcode(peer: &UdpSocket) -> Option<u8> {
        let mut buffer = [0u8; 512];
        let (len, _) = timeout(Duration::from_millis(500), peer.recv_from(&mut buffer))
            .await
            .ok()?
            .ok()?;
        (len > 0).then_some(buffer[0])
    }

    #[tokio::test]
    async fn only_state_changes_are_replicated() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.expect("bind peer");
        let replicator = Replicator::bind(vec![peer.local_addr().expect("addr")])
            .await
            .expect("bind replicator");
        let registry = Arc::new(Registry::ephemeral());
        let mut conn = harness_with(1, &registry, Arc::new(replicator));

        conn.handler.handle(register("charu2")).await;
        assert_eq!(next_opcode(&peer).await, Some(1));
        conn.handler.handle(register("eric2")).await;
        assert_eq!(next_opcode(&peer).await, Some(1));
        conn.handler.handle(login("charu2")).await;
        assert_eq!(next_opcode(&peer).await, Some(2));
        conn.handler.handle(send("charu2", "eric2", "hello!")).await;
        assert_eq!(next_opcode(&peer).await, Some(4));

        conn.handler
            .handle(Request::Search { query: "*".into() })
            .await;
        assert_eq!(next_opcode(&peer).await, None);
    }
}
