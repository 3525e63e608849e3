use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{Context, Result, anyhow};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(3);

#[tokio::test]
async fn cli_chat_end_to_end() -> Result<()> {
    let binary = Path::new(env!("CARGO_BIN_EXE_replicated_chat"));

    let (mut server_child, mut server_stdout) = spawn_server(binary).await?;
    let addr = read_server_addr(&mut server_stdout).await?;

    // Drain additional server logs in the background so the pipe never fills.
    let server_log_task = tokio::spawn(async move {
        drain_stdout(server_stdout).await;
    });

    let mut alice = spawn_client(binary, &addr).await?;
    let mut bob = spawn_client(binary, &addr).await?;

    alice.expect("register alice", "*** registered alice").await?;
    alice.expect("login alice", "*** logged in as alice").await?;
    bob.expect("register bob", "*** registered bob").await?;
    bob.expect("login bob", "*** logged in as bob").await?;

    alice.expect("search *", "*** users: alice, bob").await?;

    // Bob is online, so Alice's message is pushed straight to him.
    alice.expect("send bob hi bob", "*** delivered to bob").await?;
    let bob_hears_alice =
        read_line_expect(&mut bob.stdout, "waiting for bob to hear alice").await?;
    assert_eq!(bob_hears_alice, "<alice> hi bob");

    // Quitting logs Bob out, so the next message waits in his mailbox.
    bob.expect("quit", "*** leaving chat").await?;
    ensure_success(&mut bob.child, "bob client").await?;
    alice
        .expect("send bob are you there", "*** bob is offline; message buffered")
        .await?;
    alice.expect("quit", "*** leaving chat").await?;
    ensure_success(&mut alice.child, "alice client").await?;

    // Bob comes back and finds the message waiting.
    let mut bob = spawn_client(binary, &addr).await?;
    bob.expect("login bob", "*** logged in as bob").await?;
    let unread = read_line_expect(&mut bob.stdout, "waiting for unread count").await?;
    assert_eq!(unread, "*** 1 unread messages");
    let waiting = read_line_expect(&mut bob.stdout, "waiting for buffered message").await?;
    assert_eq!(waiting, "<alice> are you there");
    bob.expect("quit", "*** leaving chat").await?;
    ensure_success(&mut bob.child, "bob client").await?;

    // The server stays up after clients disconnect; terminate it manually.
    let _ = server_child.kill().await;
    let _ = server_child.wait().await;
    let _ = server_log_task.await;

    Ok(())
}

struct ClientProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl ClientProcess {
    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.stdin
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("failed to send line '{line}'"))?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }

    /// Types `line` and checks the next line printed in reply.
    async fn expect(&mut self, line: &str, reply: &str) -> Result<()> {
        self.send_line(line).await?;
        let printed = read_line_expect(&mut self.stdout, &format!("waiting after '{line}'")).await?;
        assert_eq!(printed, reply);
        Ok(())
    }
}

async fn spawn_server(binary: &Path) -> Result<(Child, BufReader<ChildStdout>)> {
    let mut cmd = Command::new(binary);
    cmd.arg("server")
        .arg("--listen")
        .arg("127.0.0.1:0")
        .arg("--replication-listen")
        .arg("127.0.0.1:0")
        .arg("--ephemeral")
        .env("RUST_LOG", "info")
        .env("NO_COLOR", "1")
        .env_remove("CHAT_PEERS")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let mut child = cmd.spawn().context("failed to spawn server")?;
    let stdout = child
        .stdout
        .take()
        .context("server stdout missing after spawn")?;

    Ok((child, BufReader::new(stdout)))
}

/// Skips startup logs up to the listening banner and returns its address.
async fn read_server_addr(reader: &mut BufReader<ChildStdout>) -> Result<String> {
    loop {
        let line = read_line(reader)
            .await?
            .context("server did not emit listening address")?;
        let trimmed = line.trim();
        if !trimmed.contains("server listening on") {
            continue;
        }
        let addr = trimmed
            .split_whitespace()
            .last()
            .context("unexpected server banner format")?;
        if !addr.contains(':') {
            return Err(anyhow!("server banner missing socket: {trimmed}"));
        }
        return Ok(addr.to_string());
    }
}

async fn spawn_client(binary: &Path, addr: &str) -> Result<ClientProcess> {
    let mut cmd = Command::new(binary);
    cmd.arg("client")
        .arg("--server")
        .arg(addr)
        .env("RUST_LOG", "warn")
        .env("NO_COLOR", "1")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let mut child = cmd.spawn().context("failed to spawn client")?;

    let stdin = child
        .stdin
        .take()
        .context("client stdin missing after spawn")?;
    let stdout = child
        .stdout
        .take()
        .context("client stdout missing after spawn")?;

    let mut process = ClientProcess {
        child,
        stdin,
        stdout: BufReader::new(stdout),
    };

    let banner = read_line_expect(&mut process.stdout, "waiting for connect banner").await?;
    if !banner.starts_with(&format!("*** connected to {addr}")) {
        return Err(anyhow!("expected connect banner for {addr}, got '{banner}'"));
    }

    Ok(process)
}

async fn read_line_expect(
    reader: &mut BufReader<ChildStdout>,
    description: &str,
) -> Result<String> {
    match read_line(reader).await {
        Ok(Some(line)) => Ok(line),
        Ok(None) => Err(anyhow!("{description}: stream closed")),
        Err(err) => Err(err.context(format!("{description}: failed to read line"))),
    }
}

async fn read_line(reader: &mut BufReader<ChildStdout>) -> Result<Option<String>> {
    let mut line = String::new();
    let bytes = timeout(READ_TIMEOUT, reader.read_line(&mut line))
        .await
        .map_err(|_| anyhow!("timed out waiting for line"))??;
    if bytes == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

async fn drain_stdout(mut reader: BufReader<ChildStdout>) {
    let mut buffer = String::new();
    while matches!(reader.read_line(&mut buffer).await, Ok(bytes) if bytes > 0) {
        buffer.clear();
    }
}

async fn ensure_success(child: &mut Child, name: &str) -> Result<()> {
    let status = timeout(READ_TIMEOUT, child.wait())
        .await
        .map_err(|_| anyhow!("{name} did not exit"))?
        .with_context(|| format!("failed to await {name} process"))?;
    if !status.success() {
        return Err(anyhow!("{name} exited with status {status}"));
    }
    Ok(())
}
