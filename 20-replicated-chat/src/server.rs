use std::{
    future::Future,
    io,
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use tokio::{
    net::{TcpListener, TcpStream, UdpSocket},
    select,
    task::JoinSet,
};
use tracing::{info, warn};

use crate::{
    connection::{ConnectionContext, serve_connection},
    protocol::WRITE_TIMEOUT,
    registry::{ConnectionId, Registry},
    replication::{Replicator, UpdateListener},
    snapshot::SnapshotStore,
};

/// Idle clients are dropped after this long without a request.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Everything needed to start one server process.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Identity of this server; keys its snapshot file.
    pub id: u32,
    /// Address clients connect to.
    pub listen: SocketAddr,
    /// Address the update listener receives replicated state changes on.
    pub replication_listen: SocketAddr,
    /// Replication addresses of the other servers.
    pub peers: Vec<SocketAddr>,
    /// Where snapshots live. `None` keeps everything in memory.
    pub state_dir: Option<PathBuf>,
    pub idle_timeout: Duration,
    /// How long a response or push may wait on a client's full socket
    /// buffer before the client is given up on.
    pub write_timeout: Duration,
}

impl ServerConfig {
    /// A standalone, in-memory server on ephemeral localhost ports.
    pub fn local(id: u32) -> Self {
        let any_port = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
        Self {
            id,
            listen: any_port,
            replication_listen: any_port,
            peers: Vec::new(),
            state_dir: None,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            write_timeout: WRITE_TIMEOUT,
        }
    }
}

pub struct Server {
    id: u32,
    listener: TcpListener,
    replication: UdpSocket,
    registry: Arc<Registry>,
    replicator: Arc<Replicator>,
    idle_timeout: Duration,
    write_timeout: Duration,
}

impl Server {
    /// Restores this server's snapshot and binds its client and
    /// replication sockets.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let registry = match &config.state_dir {
            Some(dir) => {
                let store = SnapshotStore::new(dir, config.id);
                Registry::open(store)
                    .await
                    .context("failed to restore server state")?
            }
            None => Registry::ephemeral(),
        };
        let state = registry.state().await;
        info!(
            server = config.id,
            users = state.user_count(),
            buffered = state.buffered_count(),
            "server state loaded"
        );

        let listener = TcpListener::bind(config.listen)
            .await
            .with_context(|| format!("failed to bind client listener on {}", config.listen))?;
        let replication = UdpSocket::bind(config.replication_listen)
            .await
            .with_context(|| {
                format!(
                    "failed to bind replication listener on {}",
                    config.replication_listen
                )
            })?;
        let replicator = Replicator::bind(config.peers)
            .await
            .context("failed to open replication socket")?;

        Ok(Self {
            id: config.id,
            listener,
            replication,
            registry: Arc::new(registry),
            replicator: Arc::new(replicator),
            idle_timeout: config.idle_timeout,
            write_timeout: config.write_timeout,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn replication_addr(&self) -> io::Result<SocketAddr> {
        self.replication.local_addr()
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    /// Serves clients and applies replicated updates until `shutdown`
    /// completes. Open client connections are closed on the way out.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            id,
            listener,
            replication,
            registry,
            replicator,
            idle_timeout,
            write_timeout,
        } = self;

        let updates = tokio::spawn(UpdateListener::new(replication, Arc::clone(&registry)).run());
        let context = ConnectionContext {
            registry,
            replicator,
            idle_timeout,
            write_timeout,
        };
        let mut connections = JoinSet::new();
        let mut next_id: ConnectionId = 0;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!(server = id, "server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    next_id += 1;
                    handle_accept_result(accept_result, next_id, &context, &mut connections);
                }
                Some(_) = connections.join_next() => {}
            }
        }

        connections.shutdown().await;
        updates.abort();
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_accept_result(
    result: io::Result<(TcpStream, SocketAddr)>,
    id: ConnectionId,
    context: &ConnectionContext,
    connections: &mut JoinSet<()>,
) {
    match result {
        Ok((stream, peer)) => spawn_connection_handler(stream, peer, id, context, connections),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection_handler(
    stream: TcpStream,
    peer: SocketAddr,
    id: ConnectionId,
    context: &ConnectionContext,
    connections: &mut JoinSet<()>,
) {
    info!(connection = id, %peer, "client connected");
    let context = context.clone();
    connections.spawn(async move {
        if let Err(err) = serve_connection(stream, id, context).await {
            warn!(connection = id, %peer, error = ?err, "client connection closed with error");
        }
    });
}
