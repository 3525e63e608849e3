//! Users, messages and the persisted server state.
//!
//! [`ServerState`] is the unit that gets snapshotted and replicated. It
//! knows nothing about connections; live sessions are tracked by the
//! [`crate::registry::Registry`] that wraps it.

use std::collections::{BTreeMap, BTreeSet};

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Maximum length of a username or search query, in bytes.
pub const USERNAME_LENGTH: usize = 50;

/// Maximum length of a message body, in bytes.
pub const MESSAGE_LENGTH: usize = 262;

/// A mailbox is drained in one response whose count header is two bytes wide.
pub const MAILBOX_CAPACITY: usize = u16::MAX as usize;

/// A chat message as written by its sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub sender: String,
    pub recipient: String,
    pub body: String,
}

impl Message {
    pub fn new(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            sender: sender.into(),
            recipient: recipient.into(),
            body: body.into(),
        }
    }

    /// The part of the message the recipient gets to see.
    pub fn delivery(&self) -> Delivery {
        Delivery {
            sender: self.sender.clone(),
            body: self.body.clone(),
        }
    }
}

/// A message as it reaches its recipient: who sent it and what it says.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub sender: String,
    pub body: String,
}

impl Delivery {
    pub fn new(sender: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            body: body.into(),
        }
    }
}

/// Registered users and their undelivered messages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerState {
    registered_users: BTreeSet<String>,
    mailboxes: BTreeMap<String, Vec<Message>>,
}

impl ServerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_registered(&self, username: &str) -> bool {
        self.registered_users.contains(username)
    }

    /// Adds a user. Returns `false` if the name is already taken.
    ///
    /// A fresh registration always starts with an empty mailbox, even when
    /// the name belonged to a deleted account that still had mail waiting.
    pub fn register(&mut self, username: &str) -> bool {
        if !self.registered_users.insert(username.to_string()) {
            return false;
        }
        self.mailboxes.remove(username);
        true
    }

    /// Removes a user, keeping whatever is left in their mailbox.
    pub fn remove(&mut self, username: &str) -> bool {
        self.registered_users.remove(username)
    }

    /// Appends a message to its recipient's mailbox.
    ///
    /// Returns `false` when the mailbox is already at [`MAILBOX_CAPACITY`].
    pub fn buffer(&mut self, message: Message) -> bool {
        let mailbox = self.mailboxes.entry(message.recipient.clone()).or_default();
        if mailbox.len() >= MAILBOX_CAPACITY {
            return false;
        }
        mailbox.push(message);
        true
    }

    /// Takes every buffered message for `username`, oldest first.
    pub fn drain_mailbox(&mut self, username: &str) -> Vec<Message> {
        self.mailboxes.remove(username).unwrap_or_default()
    }

    pub fn mailbox(&self, username: &str) -> &[Message] {
        self.mailboxes
            .get(username)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn registered_users(&self) -> impl Iterator<Item = &str> {
        self.registered_users.iter().map(String::as_str)
    }

    pub fn user_count(&self) -> usize {
        self.registered_users.len()
    }

    pub fn buffered_count(&self) -> usize {
        self.mailboxes.values().map(Vec::len).sum()
    }

    /// Registered usernames matching `pattern`, in sorted order.
    pub fn search(&self, pattern: &WildcardPattern) -> Vec<String> {
        self.registered_users
            .iter()
            .filter(|username| pattern.matches(username))
            .cloned()
            .collect()
    }
}

/// A search query where `*` stands for zero or more arbitrary characters.
///
/// Matches are anchored at both ends, so `ali` does not match `alice`.
/// An empty query matches every name.
#[derive(Debug, Clone)]
pub struct WildcardPattern {
    regex: Regex,
}

impl WildcardPattern {
    pub fn new(query: &str) -> Result<Self, regex::Error> {
        let body = if query.is_empty() {
            ".*".to_string()
        } else {
            query
                .split('*')
                .map(regex::escape)
                .collect::<Vec<_>>()
                .join(".*")
        };
        let regex = Regex::new(&format!("^(?s:{body})$"))?;
        Ok(Self { regex })
    }

    pub fn matches(&self, candidate: &str) -> bool {
        self.regex.is_match(candidate)
    }
}

/// Non-empty, ASCII alphanumeric, at most [`USERNAME_LENGTH`] bytes.
pub fn is_valid_username(username: &str) -> bool {
    !username.is_empty()
        && username.len() <= USERNAME_LENGTH
        && username.bytes().all(|byte| byte.is_ascii_alphanumeric())
}

/// Like a username, but `*` wildcards are allowed too.
pub fn is_valid_query(query: &str) -> bool {
    !query.is_empty()
        && query.len() <= USERNAME_LENGTH
        && query
            .bytes()
            .all(|byte| byte.is_ascii_alphanumeric() || byte == b'*')
}

/// Non-empty ASCII text without protocol delimiters, at most
/// [`MESSAGE_LENGTH`] bytes.
pub fn is_valid_message(body: &str) -> bool {
    !body.is_empty()
        && body.len() <= MESSAGE_LENGTH
        && body.is_ascii()
        && !body.contains(['\n', '|'])
}
