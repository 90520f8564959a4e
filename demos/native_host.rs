//! Native host bridge over WebSocket.
//!
//! Demonstrates:
//! - Binding a local WebSocket listener in the host process
//! - The extension side connecting with `WebSocketTransport::connect`
//! - RPC in both directions over one socket
//! - Typed handlers and typed calls
//! - A connection streaming progress updates
//!
//! Usage:
//!   cargo run --example native_host
//!   cargo run --example native_host -- --debug --no-wait

mod common;

// ============================================================================
// Imports
// ============================================================================

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use common::Args;
use realmbus::{Client, PendingServer, RealmKind, Server, WebSocketTransport};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct Download {
    url: String,
    chunks: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct HostInfo {
    name: String,
    version: String,
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() {
    let args = Args::parse();
    common::init_logging(args.debug);

    if let Err(e) = run(&args).await {
        eprintln!("\n[ERROR] {e:#}");
        std::process::exit(1);
    }
}

async fn run(args: &Args) -> anyhow::Result<()> {
    println!("=== Native Host ===\n");

    let listener = PendingServer::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).await?;
    let url = listener.ws_url();
    println!("[Setup] Listening on {url}");

    // ========================================================================
    // Extension side connects
    // ========================================================================

    let extension = tokio::spawn(async move { WebSocketTransport::connect(&url).await });
    let host_transport = listener.accept().await?;
    let extension_transport = extension.await.context("extension task")??;
    println!("        ✓ Extension connected\n");

    // Host API
    let host = Server::new(common::realm(RealmKind::Other("native".into())), "host")
        .with_transport(Arc::new(host_transport.clone()));
    host.group("").on_typed("info", |_: Value, _sender| async {
        Ok::<_, realmbus::Error>(HostInfo {
            name: "realmbus-native".into(),
            version: env!("CARGO_PKG_VERSION").into(),
        })
    });
    host.group("net").on("download", |req| async move {
        let download: Download = serde_json::from_value(req.params)?;
        let Some(connection) = req.sender.connection().cloned() else {
            return Ok(json!({"queued": download.url}));
        };
        tokio::spawn(async move {
            for chunk in 1..=download.chunks {
                let _ = connection.send_message(json!({"chunk": chunk, "of": download.chunks}));
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            connection.disconnect();
        });
        Ok(Value::Null)
    });
    host.start();

    // Extension API, called by the host
    let ext = Server::new(common::realm(RealmKind::Background), "ext")
        .with_transport(Arc::new(extension_transport.clone()));
    ext.on("tabs/count", |_req| async { Ok(json!(3)) });
    ext.start();

    let to_host = Client::new(common::realm(RealmKind::Background), Arc::new(extension_transport))
        .with_prefix("host");
    let to_extension = Client::new(
        common::realm(RealmKind::Other("native".into())),
        Arc::new(host_transport.clone()),
    )
    .with_prefix("ext");

    // ========================================================================
    // RPC both ways
    // ========================================================================

    println!("[RPC] extension -> host");
    let info: HostInfo = to_host.call_typed("info", &Value::Null).await?;
    println!("        ✓ {} {}", info.name, info.version);

    let queued = to_host
        .call("net/download", json!({"url": "https://example.com/a.user.js", "chunks": 0}))
        .await?;
    println!("        ✓ {queued}");

    println!("[RPC] host -> extension");
    let tabs = to_extension.call("tabs/count", Value::Null).await?;
    println!("        ✓ {tabs} tabs open\n");

    // ========================================================================
    // Streaming
    // ========================================================================

    println!("[Connection] net/download");
    let progress = to_host
        .connect(
            "net/download",
            json!({"url": "https://example.com/b.user.js", "chunks": 4}),
        )
        .await?;

    let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();
    let updates = done_tx.clone();
    progress.on_message(move |update| {
        let _ = updates.send(Some(update));
    });
    progress.on_disconnect(move || {
        let _ = done_tx.send(None);
    });

    while let Some(Some(update)) = tokio::time::timeout(Duration::from_secs(2), done_rx.recv())
        .await
        .context("download stalled")?
    {
        println!("        · {update}");
    }
    println!("        ✓ Download finished\n");

    common::wait_for_exit(args.no_wait).await;
    host_transport.shutdown();
    println!("=== Done ===");
    Ok(())
}
