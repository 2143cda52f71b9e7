use std::{net::SocketAddr, path::Path, process::Stdio, time::Duration};

use anyhow::{Context, Result, anyhow};
use bully_election::{
    message::{Message, MessageKind},
    transport::{receive_line, send_line},
};
use tokio::{
    net::TcpListener,
    process::{Child, Command},
    sync::mpsc,
    time::{Instant, sleep, timeout},
};

const STARTUP_TIMEOUT: Duration = Duration::from_secs(5);
const EXIT_TIMEOUT: Duration = Duration::from_secs(5);
const SEND_TIMEOUT: Duration = Duration::from_millis(200);

#[tokio::test]
async fn force_stop_ends_the_process_cleanly() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("node");

    // Collect everything the node reports to its log sink.
    let collector = TcpListener::bind("127.0.0.1:0").await?;
    let sink_port = collector.local_addr()?.port();
    let (line_tx, mut line_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((stream, _)) = collector.accept().await {
            if let Ok(Some(line)) = receive_line(stream, Duration::from_secs(1)).await {
                let _ = line_tx.send(line);
            }
        }
    });

    let mut child = spawn_node(&binary, 0, sink_port, 17900)?;
    let addr: SocketAddr = "127.0.0.1:17900".parse()?;

    let force_stop = Message::new(99, MessageKind::ForceStop).encode();
    send_when_listening(addr, &force_stop).await?;

    let status = timeout(EXIT_TIMEOUT, child.wait())
        .await
        .context("node did not exit after FORCE_STOP")??;
    assert!(status.success(), "node exited with {status}");

    let mut lines = Vec::new();
    while let Ok(Some(line)) = timeout(Duration::from_secs(1), line_rx.recv()).await {
        let done = line == "exit: 0";
        lines.push(line);
        if done {
            break;
        }
    }
    assert_eq!(lines.first().map(String::as_str), Some("Process 0 started."));
    assert!(
        lines
            .iter()
            .any(|line| line.starts_with("Process 0 received: ") && line.ends_with("FORCE_STOP")),
        "missing FORCE_STOP receipt in {lines:?}"
    );
    assert_eq!(lines.last().map(String::as_str), Some("exit: 0"));
    Ok(())
}

#[tokio::test]
async fn occupied_port_is_a_startup_error() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("node");
    let _squatter = TcpListener::bind("127.0.0.1:17950").await?;

    let mut child = spawn_node(&binary, 0, 0, 17950)?;

    let status = timeout(EXIT_TIMEOUT, child.wait())
        .await
        .context("node should give up on a taken port")??;
    assert!(!status.success());
    Ok(())
}

#[tokio::test]
async fn malformed_peer_list_is_rejected() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("node");

    let mut child = Command::new(binary)
        .args(["0", "0", "1:not-a-port", "--base-port", "17960"])
        .env("RUST_LOG", "warn")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .context("failed to spawn node")?;

    let status = timeout(EXIT_TIMEOUT, child.wait())
        .await
        .context("node should reject the peer list")??;
    assert!(!status.success());
    Ok(())
}

fn spawn_node(binary: &Path, id: u32, sink_port: u16, base_port: u16) -> Result<Child> {
    let mut cmd = Command::new(binary);
    cmd.arg(id.to_string())
        .arg(sink_port.to_string())
        .arg("")
        .arg("--base-port")
        .arg(base_port.to_string())
        .arg("--election-timeout-ms")
        .arg("200")
        .arg("--coordinator-timeout-ms")
        .arg("400")
        .env("RUST_LOG", "warn")
        .env("RUST_LOG_STYLE", "never")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    cmd.spawn()
        .with_context(|| format!("failed to spawn node {id}"))
}

/// Retries until the node accepts the line or startup takes too long.
async fn send_when_listening(addr: SocketAddr, line: &str) -> Result<()> {
    let start = Instant::now();
    loop {
        match send_line(addr, line, SEND_TIMEOUT).await {
            Ok(()) => return Ok(()),
            Err(_) if start.elapsed() < STARTUP_TIMEOUT => sleep(Duration::from_millis(50)).await,
            Err(err) => return Err(anyhow!("node never started listening on {addr}: {err:#}")),
        }
    }
}
