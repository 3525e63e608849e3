use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::server::ServerConfig;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one chat server, replicating state changes to its peers.
    Server(ServerArgs),
    /// Connect to a chat server from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Identity of this server; selects its snapshot file.
    #[arg(long, env = "CHAT_SERVER_ID", default_value_t = 0)]
    pub id: u32,

    /// Socket address clients connect to. Use port 0 for an ephemeral port.
    #[arg(long, env = "CHAT_LISTEN", default_value = "127.0.0.1:22080")]
    pub listen: SocketAddr,

    /// Socket address that receives replicated updates.
    #[arg(long, env = "CHAT_REPLICATION_LISTEN", default_value = "127.0.0.1:22070")]
    pub replication_listen: SocketAddr,

    /// Replication address of a peer server. Repeat or comma-separate.
    #[arg(long = "peer", env = "CHAT_PEERS", value_delimiter = ',')]
    pub peers: Vec<SocketAddr>,

    /// Directory holding `server_<id>.json` snapshots.
    #[arg(long, env = "CHAT_STATE_DIR", default_value = "state")]
    pub state_dir: PathBuf,

    /// Keep all state in memory; nothing is read from or written to disk.
    #[arg(long)]
    pub ephemeral: bool,

    /// Seconds a client may stay silent before it is disconnected.
    #[arg(
        long,
        env = "CHAT_IDLE_TIMEOUT_SECS",
        default_value_t = 300,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub idle_timeout_secs: u64,

    /// Seconds a write may block on a client that is not reading before
    /// that client is dropped.
    #[arg(
        long,
        env = "CHAT_WRITE_TIMEOUT_SECS",
        default_value_t = 5,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub write_timeout_secs: u64,
}

impl From<ServerArgs> for ServerConfig {
    fn from(args: ServerArgs) -> Self {
        ServerConfig {
            id: args.id,
            listen: args.listen,
            replication_listen: args.replication_listen,
            peers: args.peers,
            state_dir: (!args.ephemeral).then_some(args.state_dir),
            idle_timeout: Duration::from_secs(args.idle_timeout_secs),
            write_timeout: Duration::from_secs(args.write_timeout_secs),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Servers to try, in order. The client fails over to the next one
    /// when its connection drops.
    #[arg(
        long = "server",
        env = "CHAT_SERVERS",
        value_delimiter = ',',
        default_value = "127.0.0.1:22080"
    )]
    pub servers: Vec<SocketAddr>,
}
