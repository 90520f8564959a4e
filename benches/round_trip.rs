//! RPC round-trip benchmarks over the in-memory transport.
//!
//! - Sequential `call` latency
//! - Concurrent calls: 10, 100, 1000 in flight
//! - Topic publish with one local and one remote subscriber
//!
//! Run with: cargo bench --bench round_trip
//! Results saved to: target/criterion/

use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use realmbus::{Client, MemoryTransport, MessageQueue, Realm, RealmKind, Server};
use serde_json::{Value, json};
use tokio::runtime::Runtime;

// ============================================================================
// Benchmark Parameters
// ============================================================================

const CONCURRENCY: &[usize] = &[10, 100, 1000];

// ============================================================================
// Setup
// ============================================================================

fn echo_pair() -> (Server, Client) {
    let (background, content) = MemoryTransport::pair();
    let server = Server::new(Realm::with_defaults(RealmKind::Background), "api")
        .with_transport(Arc::new(background));
    server
        .group("bench")
        .on("echo", |req| async move { Ok(req.params) });
    server.start();

    let client = Client::new(Realm::with_defaults(RealmKind::Content), Arc::new(content))
        .with_prefix("api");
    (server, client)
}

// ============================================================================
// Benchmark: Sequential Calls
// ============================================================================

fn bench_call(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let (_server, client) = rt.block_on(async { echo_pair() });

    c.bench_function("call_echo", |b| {
        b.to_async(&rt).iter(|| async {
            client
                .call("bench/echo", json!({"n": 1}))
                .await
                .expect("echo")
        });
    });
}

// ============================================================================
// Benchmark: Concurrent Calls
// ============================================================================

fn bench_concurrent(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let (_server, client) = rt.block_on(async { echo_pair() });

    let mut group = c.benchmark_group("concurrent_calls");
    for &count in CONCURRENCY {
        group.bench_with_input(BenchmarkId::new("echo", count), &count, |b, &count| {
            b.to_async(&rt).iter(|| async {
                let calls = (0..count).map(|n| client.call("bench/echo", json!(n)));
                futures_util::future::try_join_all(calls)
                    .await
                    .expect("echo")
            });
        });
    }
    group.finish();
}

// ============================================================================
// Benchmark: Publish
// ============================================================================

fn bench_publish(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let (background, content) = MemoryTransport::pair();

    let (_remote, local) = rt.block_on(async {
        let remote = MessageQueue::new(
            Realm::with_defaults(RealmKind::Background),
            Arc::new(background),
        );
        let local = MessageQueue::new(Realm::with_defaults(RealmKind::Content), Arc::new(content));
        remote.subscribe("bench/tick", |_| {});
        local.subscribe("bench/tick", |_| {});
        (remote, local)
    });

    c.bench_function("publish", |b| {
        b.to_async(&rt).iter(|| async {
            local
                .publish("bench/tick", Value::Null)
                .await
                .expect("publish");
        });
    });
}

criterion_group!(benches, bench_call, bench_concurrent, bench_publish);
criterion_main!(benches);
