//! Userscript bridge across three realms.
//!
//! Demonstrates:
//! - Background API server on the extension runtime
//! - Content script relaying page requests over custom events
//! - Group middleware (logging + permission check)
//! - A streaming connection
//! - Topic fan-out with `publish` vs `emit`
//! - A handle to a content-side object used from the page
//!
//! Usage:
//!   cargo run --example userscript_bridge
//!   cargo run --example userscript_bridge -- --debug

mod common;

// ============================================================================
// Imports
// ============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use common::Args;
use parking_lot::Mutex;
use realmbus::middleware::{Next, middleware_fn};
use realmbus::transport::{Document, EventFlag, EventRole, Runtime, Target};
use realmbus::{
    Client, Error, EventTransport, HandleId, HandleObject, HandleRegistry, MessageQueue, RealmKind,
    RemoteHandle, Request, RuntimeTransport, Sender, SenderDescriptor, Server,
};
use serde_json::{Value, json};
use tracing::info;

// ============================================================================
// Realms
// ============================================================================

/// Background page: storage API and script update notifications.
fn background(runtime: &Runtime) -> (Server, MessageQueue) {
    let transport = RuntimeTransport::new(runtime, SenderDescriptor::background(), Target::Runtime);
    let realm = common::realm(RealmKind::Background);

    let server = Server::new(realm.clone(), "api").with_transport(Arc::new(transport.clone()));

    let timing = middleware_fn(|req: Request, next: Next<Request, realmbus::Result<Value>>| async move {
        let started = Instant::now();
        let action = req.action.clone();
        let result = next.run(req).await;
        info!(action = %action, elapsed = ?started.elapsed(), ok = result.is_ok(), "api call");
        result
    });
    let only_tabs = middleware_fn(|req: Request, next: Next<Request, realmbus::Result<Value>>| async move {
        if req.sender.tab_id() < 0 {
            return Err(Error::handler("permission denied"));
        }
        next.run(req).await
    });

    let store: Arc<Mutex<HashMap<String, Value>>> = Arc::default();
    let gm = server.group_with("gm", timing).use_middleware(only_tabs);

    let values = Arc::clone(&store);
    gm.on_sync("getValue", move |req| {
        let key = req.params["key"].as_str().unwrap_or_default().to_string();
        Ok(values.lock().get(&key).cloned().unwrap_or(Value::Null))
    });

    let values = Arc::clone(&store);
    gm.on_sync("setValue", move |req| {
        let key = req.params["key"].as_str().unwrap_or_default().to_string();
        values.lock().insert(key, req.params["value"].clone());
        Ok(json!(true))
    });

    // Streams three log lines, then hangs up
    server.group("script").on("logs", |req| async move {
        let Some(connection) = req.sender.connection().cloned() else {
            return Err(Error::handler("logs requires a connection"));
        };
        tokio::spawn(async move {
            for line in ["installed", "enabled", "ran on example.com"] {
                let _ = connection.send_message(json!(line));
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            connection.disconnect();
        });
        Ok(Value::Null)
    });

    server.start();

    let mq = MessageQueue::new(realm, Arc::new(transport.to_tab(1, None)));
    (server, mq)
}

/// A page-visible object owned by the content script.
struct Badge {
    text: Mutex<String>,
}

#[async_trait]
impl HandleObject for Badge {
    async fn invoke(&self, method: &str, args: Value) -> realmbus::Result<Value> {
        match method {
            "setText" => {
                *self.text.lock() = args.as_str().unwrap_or_default().to_string();
                Ok(Value::Null)
            }
            "getText" => Ok(json!(*self.text.lock())),
            other => Err(Error::handler(format!("Badge has no method {other}"))),
        }
    }
}

/// Content script: relays `gm/*` from the page to the background.
fn content(
    runtime: &Runtime,
    document: &Document,
    flag: &EventFlag,
) -> (Server, MessageQueue, HandleRegistry, HandleId) {
    let realm = common::realm(RealmKind::Content);
    let to_background = RuntimeTransport::new(runtime, SenderDescriptor::tab(1, 1, 0), Target::Runtime);
    let background = Client::new(realm.clone(), Arc::new(to_background.clone())).with_prefix("api");

    let page = EventTransport::new(document, flag, EventRole::Content);
    let server = Server::new(realm.clone(), "content").with_transport(Arc::new(page));

    let relay = background.clone();
    server.group("gm").on("getValue", move |req| {
        let relay = relay.clone();
        async move { relay.call("gm/getValue", req.params).await }
    });
    let relay = background.clone();
    server.group("gm").on("setValue", move |req| {
        let relay = relay.clone();
        async move { relay.call("gm/setValue", req.params).await }
    });

    let handles = HandleRegistry::new();
    let badge = handles.insert(Arc::new(Badge {
        text: Mutex::new(String::new()),
    }));
    handles.mount(&server.group("handle"));
    server.start();

    let mq = MessageQueue::new(realm, Arc::new(to_background));
    (server, mq, handles, badge)
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() {
    let args = Args::parse();
    common::init_logging(args.debug);

    if let Err(e) = run().await {
        eprintln!("\n[ERROR] {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    println!("=== Userscript Bridge ===\n");

    let runtime = Runtime::new();
    let document = Document::new();
    let flag = EventFlag::generate();

    let (bg_server, bg_mq) = background(&runtime);
    let (_ct_server, ct_mq, handles, badge) = content(&runtime, &document, &flag);

    // Page script talks to the content script only
    let page = Client::new(
        common::realm(RealmKind::Inject),
        Arc::new(EventTransport::new(&document, &flag, EventRole::Inject)),
    )
    .with_prefix("content");

    // ========================================================================
    // RPC through two hops
    // ========================================================================

    println!("[RPC] page -> content -> background");
    page.call("gm/setValue", json!({"key": "theme", "value": "dark"}))
        .await
        .context("setValue")?;
    let theme = page
        .call_throw("gm/getValue", json!({"key": "theme"}))
        .await
        .context("getValue")?;
    println!("        ✓ theme = {theme}");

    match page.call_throw("gm/getValue", json!({"key": "missing"})).await {
        Err(e) => println!("        ✓ missing key rejected: {e}"),
        Ok(v) => println!("        ✗ unexpected value {v}"),
    }

    // A caller outside any tab is rejected by the guard
    let denied = bg_server
        .dispatch(
            "gm/getValue",
            json!({"key": "theme"}),
            Sender::new(SenderDescriptor::background()),
        )
        .await;
    println!("        ✓ guard: {}\n", denied.message.unwrap_or_default());

    // ========================================================================
    // Connection
    // ========================================================================

    println!("[Connection] script/logs");
    let to_background = RuntimeTransport::new(&runtime, SenderDescriptor::tab(1, 1, 0), Target::Runtime);
    let logs = Client::new(common::realm(RealmKind::Content), Arc::new(to_background))
        .with_prefix("api")
        .connect("script/logs", Value::Null)
        .await?;

    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    let done_tx = Mutex::new(Some(done_tx));
    logs.on_message(|line| println!("        · {line}"));
    logs.on_disconnect(move || {
        if let Some(tx) = done_tx.lock().take() {
            let _ = tx.send(());
        }
    });
    tokio::time::timeout(Duration::from_secs(2), done_rx)
        .await
        .context("log stream did not finish")??;
    println!("        ✓ remote hung up\n");

    // ========================================================================
    // Pub/sub
    // ========================================================================

    println!("[MQ] script/updated");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let subscription = ct_mq.subscribe("script/updated", move |m| sink.lock().push(m));

    bg_mq.emit("script/updated", json!("local only")).await;
    bg_mq.publish("script/updated", json!({"id": 1})).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    println!("        ✓ content saw {:?}", seen.lock());
    subscription.unsubscribe();

    // ========================================================================
    // Handles
    // ========================================================================

    println!("\n[Handle] badge {badge}");
    let handle = RemoteHandle::new(badge, page.clone().with_prefix("content/handle"));
    handle.invoke("setText", json!("3 scripts")).await?;
    println!("        ✓ text = {}", handle.invoke("getText", Value::Null).await?);
    handle.release().await?;
    println!("        ✓ released, {} left", handles.len());

    println!("\n=== Done ===");
    Ok(())
}
