//! A small replicated chat service.
//!
//! Users register a name, log in over TCP, search for each other and send
//! short text messages. A message to someone who is online is pushed to
//! them at once; otherwise it waits in their mailbox until they next log
//! in. One server acts as primary and forwards every state change to its
//! replicas over UDP, so a client can fail over when the primary goes away.
//!
//! - [`cli`] parses the command line for server and client modes.
//! - [`protocol`] is the binary request/response codec.
//! - [`state`] holds registered users and mailboxes; [`snapshot`] saves
//!   and restores it as JSON.
//! - [`registry`] guards that state together with the live sessions.
//! - [`connection`] runs the per-client state machine.
//! - [`replication`] ships updates to peers and applies incoming ones.
//! - [`server`] wires the listeners together.
//! - [`client`] is the typed client API and the terminal front end.

pub mod cli;
pub mod client;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod replication;
pub mod server;
pub mod snapshot;
pub mod state;
