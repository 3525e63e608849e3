//! The chat client: a typed async API plus the terminal front end.
//!
//! [`ChatClient`] speaks to one server. [`ClientSession`] sits on top of it
//! with a list of servers, fails over to the next one when the connection
//! drops and silently logs the user back in there.

use std::{collections::VecDeque, fmt, net::SocketAddr, str::FromStr};

use anyhow::{Result, bail};
use thiserror::Error;
use tokio::{
    io::{self, AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpStream, tcp::OwnedWriteHalf},
    select,
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    cli::ClientArgs,
    error::{ClientError, ProtocolError},
    protocol::{Request, Response, Status, read_response, write_request},
    state::{Delivery, Message, is_valid_message, is_valid_query, is_valid_username},
};

const FRAME_QUEUE: usize = 16;

const HELP: &str = "\
commands:
  register <username>
  login <username>
  search [pattern]            `*` matches any run of characters
  send <username> <message>
  logout
  delete                      remove your account
  help
  quit";

/// How the server handled a sent message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sent {
    Delivered,
    Buffered,
}

/// One connection to one chat server.
///
/// Frames are read by a background task, so [`ChatClient::next_push`] can
/// sit in a `select!` without losing half-read frames. Messages pushed
/// while a request is in flight are queued and handed out later by
/// `next_push`.
pub struct ChatClient {
    server: SocketAddr,
    writer: OwnedWriteHalf,
    frames: mpsc::Receiver<Result<Response, ProtocolError>>,
    reader_task: JoinHandle<()>,
    pending: VecDeque<Delivery>,
}

impl ChatClient {
    pub async fn connect(server: SocketAddr) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(server)
            .await
            .map_err(|source| ClientError::Connect {
                addr: server,
                source,
            })?;
        info!("connected to {}", server);

        let (reader, writer) = stream.into_split();
        let (frame_tx, frames) = mpsc::channel(FRAME_QUEUE);
        let reader_task = tokio::spawn(read_frames(BufReader::new(reader), frame_tx));

        Ok(Self {
            server,
            writer,
            frames,
            reader_task,
            pending: VecDeque::new(),
        })
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    /// Returns `false` if the username is already taken.
    pub async fn register(&mut self, username: &str) -> Result<bool, ClientError> {
        let request = Request::Register {
            username: username.to_string(),
        };
        match self.call(request).await?.status() {
            Status::RegisterOk => Ok(true),
            Status::RegisterExists => Ok(false),
            other => Err(ClientError::Rejected(other)),
        }
    }

    /// Logs in and returns the messages that were waiting, oldest first.
    pub async fn login(&mut self, username: &str) -> Result<Vec<Delivery>, ClientError> {
        let request = Request::Login {
            username: username.to_string(),
        };
        match self.call(request).await? {
            Response::Unread(unread) => Ok(unread),
            Response::Status(Status::LoginOkNoUnread) => Ok(Vec::new()),
            other => Err(ClientError::Rejected(other.status())),
        }
    }

    pub async fn search(&mut self, query: &str) -> Result<Vec<String>, ClientError> {
        let request = Request::Search {
            query: query.to_string(),
        };
        match self.call(request).await? {
            Response::SearchResults(usernames) => Ok(usernames),
            Response::Status(Status::SearchNoResults) => Ok(Vec::new()),
            other => Err(ClientError::Rejected(other.status())),
        }
    }

    /// Sends a message. A message to oneself is answered only by its push,
    /// which stays queued for [`ChatClient::next_push`].
    pub async fn send(&mut self, message: Message) -> Result<Sent, ClientError> {
        let to_self = message.sender == message.recipient;
        let sender = message.sender.clone();
        write_request(&mut self.writer, &Request::Send(message)).await?;

        loop {
            match self.next_frame().await? {
                Response::Receive(delivery) => {
                    let echo = to_self && delivery.sender == sender;
                    self.pending.push_back(delivery);
                    if echo {
                        return Ok(Sent::Delivered);
                    }
                }
                Response::Status(Status::SendOkDelivered) => return Ok(Sent::Delivered),
                Response::Status(Status::SendOkBuffered) => return Ok(Sent::Buffered),
                other => return Err(ClientError::Rejected(other.status())),
            }
        }
    }

    pub async fn logout(&mut self, username: &str) -> Result<(), ClientError> {
        let request = Request::Logout {
            username: username.to_string(),
        };
        self.expect(request, Status::LogoutOk).await
    }

    pub async fn delete(&mut self, username: &str) -> Result<(), ClientError> {
        let request = Request::Delete {
            username: username.to_string(),
        };
        self.expect(request, Status::DeleteOk).await
    }

    /// Waits for the next message pushed by the server. Cancel-safe.
    pub async fn next_push(&mut self) -> Result<Delivery, ClientError> {
        if let Some(delivery) = self.pending.pop_front() {
            return Ok(delivery);
        }
        loop {
            match self.next_frame().await? {
                Response::Receive(delivery) => return Ok(delivery),
                other => warn!(status = ?other.status(), "ignoring unsolicited frame"),
            }
        }
    }

    /// Closes the write half so the server sees a clean disconnect.
    pub async fn close(mut self) {
        if let Err(error) = self.writer.shutdown().await {
            warn!(?error, "failed to shutdown client writer cleanly");
        }
    }

    async fn expect(&mut self, request: Request, success: Status) -> Result<(), ClientError> {
        let status = self.call(request).await?.status();
        if status == success {
            Ok(())
        } else {
            Err(ClientError::Rejected(status))
        }
    }

    /// Writes a request and waits for its response, queueing any pushes
    /// that arrive first.
    async fn call(&mut self, request: Request) -> Result<Response, ClientError> {
        write_request(&mut self.writer, &request).await?;
        loop {
            match self.next_frame().await? {
                Response::Receive(delivery) => self.pending.push_back(delivery),
                response => return Ok(response),
            }
        }
    }

    async fn next_frame(&mut self) -> Result<Response, ClientError> {
        match self.frames.recv().await {
            Some(frame) => Ok(frame?),
            None => Err(ClientError::Disconnected(self.server)),
        }
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

async fn read_frames<R>(mut reader: R, frames: mpsc::Sender<Result<Response, ProtocolError>>)
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let frame = match read_response(&mut reader).await {
            Ok(Some(response)) => Ok(response),
            Ok(None) => return,
            Err(err) => Err(err),
        };
        let failed = frame.is_err();
        if frames.send(frame).await.is_err() || failed {
            return;
        }
    }
}

/// A command typed at the terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Register(String),
    Login(String),
    Search(String),
    Send { recipient: String, body: String },
    Logout,
    Delete,
    Help,
    Quit,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InputError {
    #[error("unknown command {0:?}; type `help` for a list")]
    UnknownCommand(String),
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("usernames are 1 to 50 letters or digits")]
    InvalidUsername,
    #[error("search patterns are up to 50 letters, digits or `*`")]
    InvalidQuery,
    #[error("messages are 1 to 262 ASCII characters and may not contain `|`")]
    InvalidMessage,
}

const SEND_USAGE: &str = "send <username> <message>";

impl FromStr for Input {
    type Err = InputError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (command, rest) = match line.split_once(char::is_whitespace) {
            Some((command, rest)) => (command, rest.trim()),
            None => (line, ""),
        };

        match command {
            "register" => Ok(Input::Register(username_arg(rest, "register <username>")?)),
            "login" => Ok(Input::Login(username_arg(rest, "login <username>")?)),
            "search" => {
                let query = if rest.is_empty() { "*" } else { rest };
                if !is_valid_query(query) {
                    return Err(InputError::InvalidQuery);
                }
                Ok(Input::Search(query.to_string()))
            }
            "send" => {
                let (recipient, body) = rest
                    .split_once(char::is_whitespace)
                    .ok_or(InputError::Usage(SEND_USAGE))?;
                let recipient = username_arg(recipient, SEND_USAGE)?;
                let body = body.trim_start();
                if !is_valid_message(body) {
                    return Err(InputError::InvalidMessage);
                }
                Ok(Input::Send {
                    recipient,
                    body: body.to_string(),
                })
            }
            "logout" => Ok(Input::Logout),
            "delete" => Ok(Input::Delete),
            "help" => Ok(Input::Help),
            "quit" | "exit" => Ok(Input::Quit),
            other => Err(InputError::UnknownCommand(other.to_string())),
        }
    }
}

fn username_arg(arg: &str, usage: &'static str) -> Result<String, InputError> {
    if arg.is_empty() {
        return Err(InputError::Usage(usage));
    }
    if !is_valid_username(arg) {
        return Err(InputError::InvalidUsername);
    }
    Ok(arg.to_string())
}

/// A line of terminal output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    Info(String),
    Error(String),
    Message(Delivery),
}

impl fmt::Display for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Output::Info(text) => write!(f, "*** {text}"),
            Output::Error(text) => write!(f, "!!! {text}"),
            Output::Message(delivery) => write!(f, "<{}> {}", delivery.sender, delivery.body),
        }
    }
}

fn info(text: impl Into<String>) -> Output {
    Output::Info(text.into())
}

fn error(text: impl Into<String>) -> Output {
    Output::Error(text.into())
}

/// Turns a rejection into output; anything else means the connection is gone.
fn rejected(err: ClientError) -> Result<Vec<Output>, ClientError> {
    match err {
        ClientError::Rejected(status) => Ok(vec![error(describe(status))]),
        other => Err(other),
    }
}

fn describe(status: Status) -> String {
    match status {
        Status::LoginNotRegistered => "that user is not registered".into(),
        Status::LoginAlreadyLoggedIn => "that user is already logged in".into(),
        Status::SendRecipientDne => "no such recipient".into(),
        Status::SendFailed => "the message could not be delivered".into(),
        Status::BadOperation => "the server did not understand the request".into(),
        Status::UnknownError => "the server could not process the request".into(),
        other => format!("unexpected reply {other:?}"),
    }
}

/// A terminal user's view of the service: who they are logged in as and
/// which server they are talking to.
pub struct ClientSession {
    servers: Vec<SocketAddr>,
    current: usize,
    client: Option<ChatClient>,
    username: Option<String>,
}

impl ClientSession {
    pub fn new(servers: Vec<SocketAddr>) -> Self {
        Self {
            servers,
            current: 0,
            client: None,
            username: None,
        }
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn server(&self) -> Option<SocketAddr> {
        self.client.as_ref().map(ChatClient::server)
    }

    /// Connects to the first reachable server.
    pub async fn connect(&mut self) -> Result<SocketAddr, ClientError> {
        Ok(self.connected().await?.server())
    }

    /// Runs one command. If the connection drops, fails over to the next
    /// server and tries the command once more there.
    pub async fn execute(&mut self, input: &Input) -> Result<Vec<Output>> {
        match self.try_execute(input).await {
            Ok(output) => Ok(output),
            Err(err) => {
                warn!(error = %err, "lost connection to chat server");
                self.fail_over().await?;
                Ok(self.try_execute(input).await?)
            }
        }
    }

    /// Waits for the next pushed message, failing over as needed. Pends
    /// forever while no server is connected.
    pub async fn next_push(&mut self) -> Result<Delivery> {
        loop {
            let Some(client) = self.client.as_mut() else {
                return std::future::pending().await;
            };
            match client.next_push().await {
                Ok(delivery) => return Ok(delivery),
                Err(err) => {
                    warn!(error = %err, "lost connection to chat server");
                    self.fail_over().await?;
                }
            }
        }
    }

    /// Errors returned here are connection failures; server rejections
    /// are already rendered into the output.
    async fn try_execute(&mut self, input: &Input) -> Result<Vec<Output>, ClientError> {
        let output = match input {
            Input::Help => HELP.lines().map(info).collect(),
            Input::Register(username) => {
                let result = self.connected().await?.register(username).await;
                match result {
                    Ok(true) => vec![info(format!("registered {username}"))],
                    Ok(false) => vec![error(format!("{username} is already registered"))],
                    Err(err) => rejected(err)?,
                }
            }
            Input::Login(username) => {
                let result = self.connected().await?.login(username).await;
                match result {
                    Ok(unread) => {
                        self.username = Some(username.clone());
                        let mut output = vec![info(format!("logged in as {username}"))];
                        if !unread.is_empty() {
                            output.push(info(format!("{} unread messages", unread.len())));
                        }
                        output.extend(unread.into_iter().map(Output::Message));
                        output
                    }
                    Err(err) => rejected(err)?,
                }
            }
            Input::Search(query) => {
                let result = self.connected().await?.search(query).await;
                match result {
                    Ok(usernames) if usernames.is_empty() => {
                        vec![info(format!("no users match {query}"))]
                    }
                    Ok(usernames) => vec![info(format!("users: {}", usernames.join(", ")))],
                    Err(err) => rejected(err)?,
                }
            }
            Input::Send { recipient, body } => {
                let Some(sender) = self.username.clone() else {
                    return Ok(vec![error("log in before sending messages")]);
                };
                let message = Message::new(sender, recipient.clone(), body.clone());
                let result = self.connected().await?.send(message).await;
                match result {
                    Ok(Sent::Delivered) => vec![info(format!("delivered to {recipient}"))],
                    Ok(Sent::Buffered) => {
                        vec![info(format!("{recipient} is offline; message buffered"))]
                    }
                    Err(err) => rejected(err)?,
                }
            }
            Input::Logout => {
                let Some(username) = self.username.clone() else {
                    return Ok(vec![error("not logged in")]);
                };
                let result = self.connected().await?.logout(&username).await;
                match result {
                    Ok(()) => {
                        self.username = None;
                        vec![info("logged out")]
                    }
                    Err(err) => rejected(err)?,
                }
            }
            Input::Delete => {
                let Some(username) = self.username.clone() else {
                    return Ok(vec![error("log in to delete your account")]);
                };
                let result = self.connected().await?.delete(&username).await;
                match result {
                    Ok(()) => {
                        self.username = None;
                        vec![info(format!("deleted account {username}"))]
                    }
                    Err(err) => rejected(err)?,
                }
            }
            Input::Quit => {
                self.quit().await;
                vec![info("leaving chat")]
            }
        };
        Ok(output)
    }

    /// Logs out if needed and closes the connection. Never fails over.
    async fn quit(&mut self) {
        let Some(mut client) = self.client.take() else {
            return;
        };
        if let Some(username) = self.username.take() {
            if let Err(err) = client.logout(&username).await {
                debug!(%username, error = %err, "logout on quit failed");
            }
        }
        client.close().await;
    }

    async fn connected(&mut self) -> Result<&mut ChatClient, ClientError> {
        let client = match self.client.take() {
            Some(client) => client,
            None => self.connect_any().await?,
        };
        Ok(self.client.insert(client))
    }

    async fn fail_over(&mut self) -> Result<(), ClientError> {
        self.client = None;
        if !self.servers.is_empty() {
            self.current = (self.current + 1) % self.servers.len();
        }
        let client = self.connect_any().await?;
        info!(server = %client.server(), "failed over to another chat server");
        self.client = Some(client);
        Ok(())
    }

    /// Tries every server once, starting with the current one, and logs
    /// the user back in on whichever answers.
    async fn connect_any(&mut self) -> Result<ChatClient, ClientError> {
        let mut last_error = None;
        for offset in 0..self.servers.len() {
            let index = (self.current + offset) % self.servers.len();
            let addr = self.servers[index];
            let mut client = match ChatClient::connect(addr).await {
                Ok(client) => client,
                Err(err) => {
                    warn!(server = %addr, error = %err, "chat server unreachable");
                    last_error = Some(err);
                    continue;
                }
            };

            if let Some(username) = self.username.clone() {
                match client.login(&username).await {
                    Ok(unread) => {
                        debug!(%username, server = %addr, "resumed session");
                        client.pending.extend(unread);
                    }
                    Err(ClientError::Rejected(status)) => {
                        warn!(%username, ?status, "could not resume session");
                        self.username = None;
                    }
                    Err(err) => {
                        warn!(server = %addr, error = %err, "chat server dropped the connection");
                        last_error = Some(err);
                        continue;
                    }
                }
            }

            self.current = index;
            return Ok(client);
        }
        Err(last_error.unwrap_or(ClientError::NoServers))
    }
}

pub async fn run(args: ClientArgs) -> Result<()> {
    if args.servers.is_empty() {
        bail!("at least one --server is required");
    }

    let mut session = ClientSession::new(args.servers);
    let server = session.connect().await?;
    write_stdout(&format!("*** connected to {server}; type `help` for commands")).await?;

    let mut lines = BufReader::new(io::stdin()).lines();
    loop {
        select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                if !handle_line(&mut session, &line).await? {
                    return Ok(());
                }
            }
            push = session.next_push() => render(&Output::Message(push?)).await?,
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }

    for output in session.execute(&Input::Quit).await? {
        render(&output).await?;
    }
    Ok(())
}

/// Returns `false` once the user has quit.
async fn handle_line(session: &mut ClientSession, line: &str) -> Result<bool> {
    if line.trim().is_empty() {
        return Ok(true);
    }

    let input = match line.parse::<Input>() {
        Ok(input) => input,
        Err(err) => {
            render(&Output::Error(err.to_string())).await?;
            return Ok(true);
        }
    };

    for output in session.execute(&input).await? {
        render(&output).await?;
    }
    Ok(input != Input::Quit)
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn render(output: &Output) -> io::Result<()> {
    match output {
        Output::Error(_) => write_stderr(&output.to_string()).await,
        _ => write_stdout(&output.to_string()).await,
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
