use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use replicated_chat::{
    client::{ChatClient, ClientSession, Input, Output, Sent},
    registry::Registry,
    server::{Server, ServerConfig},
    state::{Delivery, Message, ServerState},
};
use tokio::{
    sync::oneshot,
    task::JoinHandle,
    time::{sleep, timeout},
};

const CONVERGE_TIMEOUT: Duration = Duration::from_secs(3);

struct RunningServer {
    addr: SocketAddr,
    replication: SocketAddr,
    registry: Arc<Registry>,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl RunningServer {
    async fn start(config: ServerConfig) -> Result<Self> {
        let server = Server::bind(config).await?;
        let addr = server.local_addr()?;
        let replication = server.replication_addr()?;
        let registry = server.registry();
        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.await;
            };
            let _ = server.run_until(shutdown).await;
        });
        Ok(Self {
            addr,
            replication,
            registry,
            shutdown,
            task,
        })
    }

    async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.task.await;
    }
}

/// A replica plus a primary that replicates to it.
async fn start_pair() -> Result<(RunningServer, RunningServer)> {
    let replica = RunningServer::start(ServerConfig::local(1)).await?;
    let mut primary_config = ServerConfig::local(0);
    primary_config.peers = vec![replica.replication];
    let primary = RunningServer::start(primary_config).await?;
    Ok((primary, replica))
}

/// Polls `registry` until `done` holds for its state.
async fn converge<F>(registry: &Registry, done: F) -> Result<ServerState>
where
    F: Fn(&ServerState) -> bool,
{
    timeout(CONVERGE_TIMEOUT, async {
        loop {
            let state = registry.state().await;
            if done(&state) {
                return state;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .context("replica never converged")
}

async fn expect_output<F>(run: F, expected: &[&str]) -> Result<()>
where
    F: Future<Output = Result<Vec<Output>>>,
{
    let output: Vec<String> = run.await?.iter().map(ToString::to_string).collect();
    assert_eq!(output, expected);
    Ok(())
}

#[tokio::test]
async fn replica_follows_the_primary() -> Result<()> {
    let (primary, replica) = start_pair().await?;

    let mut alice = ChatClient::connect(primary.addr).await?;
    assert!(alice.register("alice").await?);
    assert!(alice.register("bob").await?);
    assert!(alice.login("alice").await?.is_empty());
    assert_eq!(
        alice.send(Message::new("alice", "bob", "hello!")).await?,
        Sent::Buffered
    );

    let state = converge(&replica.registry, |state| state.mailbox("bob").len() == 1).await?;
    assert_eq!(state.registered_users().collect::<Vec<_>>(), vec!["alice", "bob"]);
    assert_eq!(state.mailbox("bob"), &[Message::new("alice", "bob", "hello!")]);

    // Bob reads his mail on the primary; the replica drains its copy too.
    let mut bob = ChatClient::connect(primary.addr).await?;
    assert_eq!(
        bob.login("bob").await?,
        vec![Delivery::new("alice", "hello!")]
    );
    converge(&replica.registry, |state| state.mailbox("bob").is_empty()).await?;

    bob.delete("bob").await?;
    let state = converge(&replica.registry, |state| !state.is_registered("bob")).await?;
    assert!(state.is_registered("alice"));

    // Sessions stay local to the server holding the connection.
    assert!(!replica.registry.is_logged_in("alice").await);

    primary.stop().await;
    replica.stop().await;
    Ok(())
}

#[tokio::test]
async fn client_fails_over_to_the_replica() -> Result<()> {
    let (primary, replica) = start_pair().await?;

    let mut session = ClientSession::new(vec![primary.addr, replica.addr]);
    assert_eq!(session.connect().await?, primary.addr);
    expect_output(
        session.execute(&Input::Register("alice".into())),
        &["*** registered alice"],
    )
    .await?;
    expect_output(
        session.execute(&Input::Register("bob".into())),
        &["*** registered bob"],
    )
    .await?;
    expect_output(
        session.execute(&Input::Login("alice".into())),
        &["*** logged in as alice"],
    )
    .await?;
    converge(&replica.registry, |state| state.user_count() == 2).await?;

    primary.stop().await;

    // The send fails on the dead primary, so the session reconnects to the
    // replica, logs alice back in and retries there.
    expect_output(
        session.execute(&Input::Send {
            recipient: "bob".into(),
            body: "are you there?".into(),
        }),
        &["*** bob is offline; message buffered"],
    )
    .await?;
    assert_eq!(session.server(), Some(replica.addr));
    assert_eq!(session.username(), Some("alice"));
    assert!(replica.registry.is_logged_in("alice").await);
    assert_eq!(
        replica.registry.state().await.mailbox("bob"),
        &[Message::new("alice", "bob", "are you there?")]
    );

    replica.stop().await;
    Ok(())
}

#[tokio::test]
async fn state_survives_a_restart() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut config = ServerConfig::local(4);
    config.state_dir = Some(dir.path().to_path_buf());

    let server = RunningServer::start(config.clone()).await?;
    let mut alice = ChatClient::connect(server.addr).await?;
    assert!(alice.register("alice").await?);
    assert!(alice.register("bob").await?);
    assert!(alice.login("alice").await?.is_empty());
    assert_eq!(
        alice.send(Message::new("alice", "bob", "see you later")).await?,
        Sent::Buffered
    );
    alice.close().await;
    server.stop().await;

    assert!(dir.path().join("server_4.json").exists());

    let restarted = RunningServer::start(config).await?;
    let mut bob = ChatClient::connect(restarted.addr).await?;
    assert!(!bob.register("alice").await?);
    assert_eq!(
        bob.login("bob").await?,
        vec![Delivery::new("alice", "see you later")]
    );
    restarted.stop().await;
    Ok(())
}
