//! Binary wire protocol spoken between clients and the server.
//!
//! A request is a one-byte [`Opcode`] followed by an ASCII payload and a
//! `\n` terminator. A response starts with a one-byte [`Status`]; login
//! with unread mail and successful searches add a big-endian `u16` record
//! count and a body:
//!
//! ```text
//! LOGIN_OK_UNREAD  count  sender|body\n sender|body\n ...
//! SEARCH_OK        count  alice|bob|carol\n
//! RECEIVE_OK              sender|body\n
//! ```
//!
//! None of the payload alphabets can contain `\n`, so every frame can be
//! read exactly, whatever the TCP segmentation.

use std::{fmt, io, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::Mutex,
    time,
};

use crate::{
    error::ProtocolError,
    state::{
        Delivery, MESSAGE_LENGTH, Message, USERNAME_LENGTH, is_valid_message, is_valid_query,
        is_valid_username,
    },
};

/// Separates fields inside a payload and usernames in search results.
pub const DELIMITER: u8 = b'|';

/// Ends every payload and record.
pub const TERMINATOR: u8 = b'\n';

/// Longest `sender|recipient|body` payload a send request may carry.
pub const SEND_PAYLOAD_LENGTH: usize = MESSAGE_LENGTH + 2 * USERNAME_LENGTH + 2;

/// Longest `sender|body` record the server ever emits.
const RECORD_LENGTH: usize = USERNAME_LENGTH + 1 + MESSAGE_LENGTH;

/// How long one frame may take to reach a client's socket buffer.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// How far past a field's maximum we read looking for its terminator
/// before giving up on the stream.
const DISCARD_LIMIT: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Register = 1,
    Login = 2,
    Search = 3,
    Send = 4,
    Logout = 5,
    Delete = 6,
}

impl Opcode {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Opcode::Register),
            2 => Some(Opcode::Login),
            3 => Some(Opcode::Search),
            4 => Some(Opcode::Send),
            5 => Some(Opcode::Logout),
            6 => Some(Opcode::Delete),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Longest payload this operation accepts, terminator excluded.
    pub fn max_payload(self) -> usize {
        match self {
            Opcode::Send => SEND_PAYLOAD_LENGTH,
            _ => USERNAME_LENGTH,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    RegisterOk = 1,
    RegisterExists = 2,
    LoginOkNoUnread = 8,
    LoginOkUnread = 9,
    LoginNotRegistered = 10,
    LoginAlreadyLoggedIn = 11,
    SearchOk = 16,
    SearchNoResults = 17,
    SendOkDelivered = 24,
    SendOkBuffered = 25,
    SendRecipientDne = 26,
    SendFailed = 27,
    ReceiveOk = 32,
    LogoutOk = 40,
    DeleteOk = 48,
    BadOperation = 126,
    UnknownError = 127,
}

impl Status {
    pub fn from_byte(byte: u8) -> Option<Self> {
        let status = match byte {
            1 => Status::RegisterOk,
            2 => Status::RegisterExists,
            8 => Status::LoginOkNoUnread,
            9 => Status::LoginOkUnread,
            10 => Status::LoginNotRegistered,
            11 => Status::LoginAlreadyLoggedIn,
            16 => Status::SearchOk,
            17 => Status::SearchNoResults,
            24 => Status::SendOkDelivered,
            25 => Status::SendOkBuffered,
            26 => Status::SendRecipientDne,
            27 => Status::SendFailed,
            32 => Status::ReceiveOk,
            40 => Status::LogoutOk,
            48 => Status::DeleteOk,
            126 => Status::BadOperation,
            127 => Status::UnknownError,
            _ => return None,
        };
        Some(status)
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// A decoded client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Register { username: String },
    Login { username: String },
    Search { query: String },
    Send(Message),
    Logout { username: String },
    Delete { username: String },
}

impl Request {
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::Register { .. } => Opcode::Register,
            Request::Login { .. } => Opcode::Login,
            Request::Search { .. } => Opcode::Search,
            Request::Send(_) => Opcode::Send,
            Request::Logout { .. } => Opcode::Logout,
            Request::Delete { .. } => Opcode::Delete,
        }
    }

    /// The payload text, without the terminator.
    pub fn payload(&self) -> String {
        match self {
            Request::Register { username }
            | Request::Login { username }
            | Request::Logout { username }
            | Request::Delete { username } => username.clone(),
            Request::Search { query } => query.clone(),
            Request::Send(message) => {
                format!("{}|{}|{}", message.sender, message.recipient, message.body)
            }
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let payload = self.payload();
        let mut encoded = Vec::with_capacity(payload.len() + 2);
        encoded.push(self.opcode().as_byte());
        encoded.extend_from_slice(payload.as_bytes());
        encoded.push(TERMINATOR);
        encoded
    }

    /// Validates and decodes an unterminated payload for `opcode`.
    pub fn decode(opcode: Opcode, payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() > opcode.max_payload() {
            return Err(ProtocolError::malformed(format!(
                "payload exceeds {} bytes",
                opcode.max_payload()
            )));
        }
        let text = ascii(payload)?;

        let request = match opcode {
            Opcode::Register => Request::Register {
                username: username(text)?,
            },
            Opcode::Login => Request::Login {
                username: username(text)?,
            },
            Opcode::Logout => Request::Logout {
                username: username(text)?,
            },
            Opcode::Delete => Request::Delete {
                username: username(text)?,
            },
            Opcode::Search => {
                if !text.is_empty() && !is_valid_query(text) {
                    return Err(ProtocolError::malformed("invalid search query"));
                }
                Request::Search {
                    query: text.to_string(),
                }
            }
            Opcode::Send => Request::Send(message(text)?),
        };
        Ok(request)
    }
}

fn ascii(bytes: &[u8]) -> Result<&str, ProtocolError> {
    if !bytes.is_ascii() {
        return Err(ProtocolError::malformed("payload is not ASCII"));
    }
    std::str::from_utf8(bytes).map_err(|err| ProtocolError::malformed(err.to_string()))
}

fn username(text: &str) -> Result<String, ProtocolError> {
    if !is_valid_username(text) {
        return Err(ProtocolError::malformed(format!("invalid username {text:?}")));
    }
    Ok(text.to_string())
}

fn message(text: &str) -> Result<Message, ProtocolError> {
    let mut fields = text.splitn(3, DELIMITER as char);
    let (Some(sender), Some(recipient), Some(body)) = (fields.next(), fields.next(), fields.next())
    else {
        return Err(ProtocolError::malformed(
            "send payload must be sender|recipient|body",
        ));
    };
    if !is_valid_message(body) {
        return Err(ProtocolError::malformed("invalid message body"));
    }
    Ok(Message::new(username(sender)?, username(recipient)?, body))
}

/// A frame sent from the server to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// A bare status byte.
    Status(Status),
    /// `LOGIN_OK_UNREAD` with the drained mailbox, oldest first.
    Unread(Vec<Delivery>),
    /// `SEARCH_OK` with the matching usernames.
    SearchResults(Vec<String>),
    /// `RECEIVE_OK`: a message pushed to a logged-in recipient.
    Receive(Delivery),
}

impl Response {
    pub fn status(&self) -> Status {
        match self {
            Response::Status(status) => *status,
            Response::Unread(_) => Status::LoginOkUnread,
            Response::SearchResults(_) => Status::SearchOk,
            Response::Receive(_) => Status::ReceiveOk,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut encoded = vec![self.status().as_byte()];
        match self {
            Response::Status(_) => {}
            Response::Unread(deliveries) => {
                encoded.extend_from_slice(&count_header(deliveries.len())?);
                for delivery in deliveries {
                    push_record(&mut encoded, delivery);
                }
            }
            Response::SearchResults(usernames) => {
                encoded.extend_from_slice(&count_header(usernames.len())?);
                encoded.extend_from_slice(usernames.join("|").as_bytes());
                encoded.push(TERMINATOR);
            }
            Response::Receive(delivery) => push_record(&mut encoded, delivery),
        }
        Ok(encoded)
    }
}

fn count_header(count: usize) -> Result<[u8; 2], ProtocolError> {
    u16::try_from(count)
        .map(u16::to_be_bytes)
        .map_err(|_| ProtocolError::TooManyRecords(count))
}

fn push_record(buffer: &mut Vec<u8>, delivery: &Delivery) {
    buffer.extend_from_slice(delivery.sender.as_bytes());
    buffer.push(DELIMITER);
    buffer.extend_from_slice(delivery.body.as_bytes());
    buffer.push(TERMINATOR);
}

/// Reads the next request.
///
/// Returns `Ok(None)` when the peer closes the stream between frames.
/// Recoverable errors (see [`ProtocolError::is_recoverable`]) consume the
/// offending frame so the caller can answer it and keep reading.
pub async fn read_request<R>(reader: &mut R) -> Result<Option<Request>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let mut opcode = [0u8; 1];
    if reader.read(&mut opcode).await? == 0 {
        return Ok(None);
    }

    let Some(opcode) = Opcode::from_byte(opcode[0]) else {
        discard_line(reader).await?;
        return Err(ProtocolError::UnknownOpcode(opcode[0]));
    };

    let payload = read_field(reader, opcode.max_payload()).await?;
    Request::decode(opcode, &payload).map(Some)
}

pub async fn write_request<W>(writer: &mut W, request: &Request) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&request.encode()).await?;
    writer.flush().await
}

/// Reads the next server frame, including unsolicited pushes.
///
/// Returns `Ok(None)` when the server closes the stream between frames.
pub async fn read_response<R>(reader: &mut R) -> Result<Option<Response>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let mut code = [0u8; 1];
    if reader.read(&mut code).await? == 0 {
        return Ok(None);
    }
    let status = Status::from_byte(code[0])
        .ok_or_else(|| ProtocolError::malformed(format!("unknown status code {}", code[0])))?;

    let response = match status {
        Status::LoginOkUnread => {
            let count = read_count(reader).await?;
            let mut deliveries = Vec::with_capacity(count);
            for _ in 0..count {
                deliveries.push(read_record(reader).await?);
            }
            Response::Unread(deliveries)
        }
        Status::SearchOk => {
            let count = read_count(reader).await?;
            let line = read_field(reader, count.max(1) * (USERNAME_LENGTH + 1)).await?;
            let line = ascii(&line)?;
            let usernames: Vec<String> = if count == 0 {
                Vec::new()
            } else {
                line.split(DELIMITER as char).map(str::to_string).collect()
            };
            if usernames.len() != count {
                return Err(ProtocolError::malformed(format!(
                    "expected {count} search results, got {}",
                    usernames.len()
                )));
            }
            Response::SearchResults(usernames)
        }
        Status::ReceiveOk => Response::Receive(read_record(reader).await?),
        other => Response::Status(other),
    };
    Ok(Some(response))
}

pub async fn write_response<W>(writer: &mut W, response: &Response) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    // Encode the whole frame first so a push can never land inside it.
    let encoded = response.encode()?;
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The write half of a client connection, shared by the task serving it
/// and by senders pushing messages to it.
///
/// Frames are written whole under the lock. A write that fails or outlives
/// the timeout drops the writer, because the stream may now end inside a
/// frame; every later write fails with [`io::ErrorKind::BrokenPipe`].
#[derive(Clone)]
pub struct FrameWriter {
    inner: Arc<Mutex<Option<BoxedWriter>>>,
    timeout: Duration,
}

impl FrameWriter {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::with_timeout(writer, WRITE_TIMEOUT)
    }

    pub fn with_timeout<W>(writer: W, timeout: Duration) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            inner: Arc::new(Mutex::new(Some(Box::new(writer)))),
            timeout,
        }
    }

    pub async fn write(&self, response: &Response) -> Result<(), ProtocolError> {
        let mut guard = self.inner.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe).into());
        };
        let result = match time::timeout(self.timeout, write_response(writer, response)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "frame write timed out").into()),
        };
        if matches!(result, Err(ProtocolError::Io(_))) {
            *guard = None;
        }
        result
    }

    /// Whether an earlier write failed and the writer was dropped.
    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.is_none()
    }

    /// Shuts the stream down; later writes fail.
    pub async fn close(&self) {
        let writer = self.inner.lock().await.take();
        if let Some(mut writer) = writer {
            let _ = time::timeout(self.timeout, writer.shutdown()).await;
        }
    }
}

impl fmt::Debug for FrameWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameWriter")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

async fn read_count<R>(reader: &mut R) -> Result<usize, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let mut header = [0u8; 2];
    reader.read_exact(&mut header).await.map_err(|err| {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            ProtocolError::Truncated
        } else {
            ProtocolError::Io(err)
        }
    })?;
    Ok(u16::from_be_bytes(header) as usize)
}

async fn read_record<R>(reader: &mut R) -> Result<Delivery, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let line = read_field(reader, RECORD_LENGTH).await?;
    let line = ascii(&line)?;
    let (sender, body) = line
        .split_once(DELIMITER as char)
        .ok_or_else(|| ProtocolError::malformed("record must be sender|body"))?;
    Ok(Delivery::new(sender, body))
}

/// Reads up to the next terminator, which is consumed but not returned.
///
/// A field longer than `max_len` is skipped through its terminator and
/// reported as malformed.
async fn read_field<R>(reader: &mut R, max_len: usize) -> Result<Vec<u8>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let mut field = Vec::new();
    let read = (&mut *reader)
        .take(max_len as u64 + 1)
        .read_until(TERMINATOR, &mut field)
        .await?;

    if field.last() == Some(&TERMINATOR) {
        field.pop();
        return Ok(field);
    }
    if read <= max_len {
        return Err(ProtocolError::Truncated);
    }

    discard_line(reader).await?;
    Err(ProtocolError::malformed(format!(
        "field exceeds {max_len} bytes"
    )))
}

async fn discard_line<R>(reader: &mut R) -> Result<(), ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let mut skipped = Vec::new();
    let read = (&mut *reader)
        .take(DISCARD_LIMIT as u64)
        .read_until(TERMINATOR, &mut skipped)
        .await?;

    if skipped.last() == Some(&TERMINATOR) {
        Ok(())
    } else if read < DISCARD_LIMIT {
        Err(ProtocolError::Truncated)
    } else {
        Err(ProtocolError::FrameTooLong(DISCARD_LIMIT))
    }
}
