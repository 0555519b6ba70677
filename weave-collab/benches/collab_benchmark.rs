use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use std::sync::Arc;
use uuid::Uuid;

use weave_collab::awareness::{color_for_user, AwarenessRegistry, AwarenessState, CursorPosition};
use weave_collab::broadcast::{BroadcastGroup, PeerInfo};
use weave_collab::crdt::{Document, Operation, SiteId};
use weave_collab::diff;
use weave_collab::protocol::SyncMessage;
use weave_collab::storage::{PersistedSnapshot, RocksStore, StoreConfig, Persistence};

fn typed_ops(site: u128, text: &str) -> Vec<Operation> {
    let mut doc = Document::new(SiteId::from_u128(site));
    let mut ops = Vec::new();
    for (i, ch) in text.chars().enumerate() {
        ops.extend(doc.local_insert(i, &ch.to_string()).unwrap());
    }
    ops
}

// ─── Engine benchmarks ──────────────────────────────────────────

fn bench_local_typing(c: &mut Criterion) {
    c.bench_function("local_insert_1000_chars_appended", |b| {
        b.iter(|| {
            let mut doc = Document::new(SiteId::from_u128(1));
            for i in 0..1000 {
                black_box(doc.local_insert(i, "x").unwrap());
            }
            black_box(doc.len());
        })
    });
}

fn bench_remote_merge(c: &mut Criterion) {
    let ops = typed_ops(1, &"collaborative editing ".repeat(50));

    c.bench_function("apply_remote_1100_ops", |b| {
        b.iter(|| {
            let mut doc = Document::new(SiteId::from_u128(2));
            for op in &ops {
                doc.apply_remote(black_box(op.clone()));
            }
            black_box(doc.content());
        })
    });
}

fn bench_concurrent_merge(c: &mut Criterion) {
    let left = typed_ops(1, &"a".repeat(300));
    let right = typed_ops(2, &"b".repeat(300));

    c.bench_function("merge_two_concurrent_300_char_runs", |b| {
        b.iter(|| {
            let mut doc = Document::new(SiteId::from_u128(3));
            for (l, r) in left.iter().zip(right.iter()) {
                doc.apply_remote(l.clone());
                doc.apply_remote(r.clone());
            }
            black_box(doc.content());
        })
    });
}

fn bench_ops_since(c: &mut Criterion) {
    let mut doc = Document::new(SiteId::from_u128(1));
    doc.local_insert(0, &"x".repeat(5000)).unwrap();
    let mut peer = Document::new(SiteId::from_u128(2));
    for op in doc.ops_since(peer.state_vector()).into_iter().take(4000) {
        peer.apply_remote(op);
    }

    c.bench_function("ops_since_1000_missing_of_5000", |b| {
        b.iter(|| {
            black_box(doc.ops_since(black_box(peer.state_vector())));
        })
    });
}

// ─── Diff benchmarks ────────────────────────────────────────────

fn bench_diff(c: &mut Criterion) {
    let old = "The quick brown fox jumps over the lazy dog. ".repeat(200);
    let mut new = old.clone();
    new.insert_str(4500, "very ");

    c.bench_function("diff_9k_chars_single_edit", |b| {
        b.iter(|| {
            black_box(diff::diff(black_box(&old), black_box(&new), 4500));
        })
    });
}

// ─── Protocol benchmarks ────────────────────────────────────────

fn bench_update_encode(c: &mut Criterion) {
    let msg = SyncMessage::update("doc", typed_ops(1, &"y".repeat(100)));

    c.bench_function("update_encode_100_ops", |b| {
        b.iter(|| {
            black_box(black_box(&msg).encode().unwrap());
        })
    });
}

fn bench_update_decode(c: &mut Criterion) {
    let encoded = SyncMessage::update("doc", typed_ops(1, &"y".repeat(100)))
        .encode()
        .unwrap();

    c.bench_function("update_decode_100_ops", |b| {
        b.iter(|| {
            black_box(SyncMessage::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_awareness_encode(c: &mut Criterion) {
    let mut state = AwarenessState::new("client", "alice", "Alice", 42);
    state.cursor = Some(CursorPosition::new(12, 40));
    let msg = SyncMessage::awareness("doc", state);

    c.bench_function("awareness_encode", |b| {
        b.iter(|| {
            black_box(black_box(&msg).encode().unwrap());
        })
    });
}

// ─── Presence benchmarks ────────────────────────────────────────

fn bench_awareness_merge_and_purge(c: &mut Criterion) {
    let states: Vec<AwarenessState> = (0..1000)
        .map(|i| AwarenessState::new(format!("c{i}"), format!("u{i}"), "User", i as u64))
        .collect();

    c.bench_function("awareness_merge_1000_then_purge", |b| {
        b.iter(|| {
            let mut registry = AwarenessRegistry::new("local");
            for state in &states {
                registry.merge_remote(&state.client_id, state.clone());
            }
            black_box(registry.purge_stale(30_500, std::time::Duration::from_secs(30)));
        })
    });
}

fn bench_color_for_user(c: &mut Criterion) {
    c.bench_function("color_for_user", |b| {
        b.iter(|| {
            black_box(color_for_user(black_box("someone@example.com")));
        })
    });
}

// ─── Broadcast benchmarks ───────────────────────────────────────

fn bench_broadcast_1000_messages(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("broadcast_1000_msgs_100_peers", |b| {
        b.iter(|| {
            rt.block_on(async {
                let group = BroadcastGroup::new(2048);

                let mut receivers = Vec::new();
                for i in 0..100 {
                    let rx = group.add_peer(PeerInfo::new(Uuid::new_v4(), format!("peer{i}"))).await;
                    receivers.push(rx);
                }

                let frame: Arc<str> = Arc::from(r#"{"type":"heartbeat","documentId":"doc","payload":{}}"#);
                for _ in 0..1000 {
                    group.broadcast_raw(Uuid::nil(), black_box(frame.clone()));
                }
            });
        })
    });
}

// ─── Storage benchmarks ─────────────────────────────────────────

fn bench_save_snapshot(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let dir = std::env::temp_dir().join(format!("weave_bench_{}", Uuid::new_v4()));
    let store = RocksStore::open(StoreConfig::for_testing(&dir)).unwrap();

    let mut doc = Document::new(SiteId::from_u128(1));
    doc.local_insert(0, &"persist ".repeat(250)).unwrap();
    let snapshot = PersistedSnapshot::from_document("bench", &doc, doc.state_vector());

    c.bench_function("save_snapshot_2000_ops", |b| {
        b.iter(|| {
            rt.block_on(store.save(black_box(&snapshot))).unwrap();
        })
    });

    drop(store);
    let _ = std::fs::remove_dir_all(&dir);
}

criterion_group!(
    benches,
    bench_local_typing,
    bench_remote_merge,
    bench_concurrent_merge,
    bench_ops_since,
    bench_diff,
    bench_update_encode,
    bench_update_decode,
    bench_awareness_encode,
    bench_awareness_merge_and_purge,
    bench_color_for_user,
    bench_broadcast_1000_messages,
    bench_save_snapshot,
);
criterion_main!(benches);
