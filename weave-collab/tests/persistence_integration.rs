//! Persistence integration tests.
//!
//! Verifies:
//! - Snapshot save/load roundtrip through the RocksDB store
//! - Crash recovery: drop the relay, reopen the database, rooms come back
//! - A session resumes its op log from disk and uploads it
//! - LZ4 keeps op logs compact
//! - Multi-document isolation

use std::sync::Arc;
use tempfile::tempdir;
use tokio::time::{timeout, Duration};

use weave_collab::crdt::{Document, SiteId, StateVector};
use weave_collab::server::{ServerConfig, SyncServer};
use weave_collab::session::{CollabSession, SessionConfig};
use weave_collab::storage::{Persistence, PersistedSnapshot, RocksStore, StoreConfig};
use weave_collab::transport::MemoryTransport;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn snapshot_with_text(document_id: &str, text: &str) -> (Document, PersistedSnapshot) {
    let mut doc = Document::new(SiteId::from_u128(1));
    doc.local_insert(0, text).unwrap();
    let snapshot = PersistedSnapshot::from_document(document_id, &doc, &StateVector::new());
    (doc, snapshot)
}

async fn wait_for_ops(server: &SyncServer, document_id: &str, count: usize) {
    timeout(Duration::from_secs(5), async {
        loop {
            if server.room_operations(document_id).await.map(|ops| ops.len()) == Some(count) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("relay never reached the expected op count");
}

// ─── Roundtrip ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_snapshot_roundtrip() {
    let dir = tempdir().unwrap();
    let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();

    let (doc, snapshot) = snapshot_with_text("notes", "Hello, persistence world!");
    store.save(&snapshot).await.unwrap();

    let loaded = store.load("notes").await.unwrap().expect("snapshot should exist");
    assert_eq!(loaded, snapshot);

    let restored = Document::from_operations(SiteId::from_u128(2), loaded.operations);
    assert_eq!(restored.content(), doc.content());
    assert!(store.load("missing").await.unwrap().is_none());
}

#[tokio::test]
async fn test_overwrite_keeps_latest_and_counts_saves() {
    let dir = tempdir().unwrap();
    let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();

    let (_, first) = snapshot_with_text("d", "v1");
    let (_, second) = snapshot_with_text("d", "version two");
    store.save(&first).await.unwrap();
    store.save(&second).await.unwrap();

    assert_eq!(store.load("d").await.unwrap(), Some(second));
    let meta = store.store().load_metadata("d").unwrap();
    assert_eq!(meta.save_count, 2);
    assert_eq!(meta.operation_count, 11);
}

// ─── Crash Recovery ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_crash_recovery_multiple_documents() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("db");

    // Phase 1: write, then drop the store (simulates a crash)
    {
        let store = RocksStore::open(StoreConfig::for_testing(&db_path)).unwrap();
        for i in 0..5 {
            let (_, snapshot) = snapshot_with_text(&format!("doc-{i}"), &format!("Document {i} content"));
            store.save(&snapshot).await.unwrap();
        }
    }

    // Phase 2: a new relay recovers every room
    let config = ServerConfig {
        storage_path: Some(db_path),
        ..ServerConfig::for_testing()
    };
    let server = SyncServer::open(config).unwrap();
    let recovered = server.recover().await.unwrap();
    assert_eq!(recovered, 5, "All 5 documents should be recovered");
    assert_eq!(server.room_count().await, 5);
    assert_eq!(
        server.room_operations("doc-3").await.map(|ops| ops.len()),
        Some("Document 3 content".len())
    );
}

#[tokio::test]
async fn test_relay_log_survives_restart() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("db");

    {
        let store = Arc::new(RocksStore::open(StoreConfig::for_testing(&db_path)).unwrap());
        let server = Arc::new(SyncServer::with_store(ServerConfig::for_testing(), store));
        let transport = Arc::new(MemoryTransport::new(server.clone()));

        let alice = CollabSession::open("doc", SessionConfig::for_testing("alice"), transport, None).await;
        alice.wait_synced().await.unwrap();
        alice.insert_text(0, "must survive").await.unwrap();
        wait_for_ops(&server, "doc", 12).await;
        alice.close().await;
    }
    // Let spawned relay tasks release the database.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let store = Arc::new(RocksStore::open(StoreConfig::for_testing(&db_path)).unwrap());
    let server = Arc::new(SyncServer::with_store(ServerConfig::for_testing(), store));
    assert_eq!(server.recover().await.unwrap(), 1);

    // A brand new client with no local state gets everything back.
    let transport = Arc::new(MemoryTransport::new(server.clone()));
    let bob = CollabSession::open("doc", SessionConfig::for_testing("bob"), transport, None).await;
    bob.wait_synced().await.unwrap();
    assert_eq!(bob.content().await.unwrap(), "must survive");
}

// ─── Session Resume ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_session_resumes_from_rocksdb() {
    let dir = tempdir().unwrap();
    let store: Arc<dyn Persistence> = Arc::new(RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());

    {
        let server = Arc::new(SyncServer::new(ServerConfig::for_testing()));
        let transport = Arc::new(MemoryTransport::new(server));
        transport.fail_next_connects(u32::MAX);
        let session = CollabSession::open("draft", SessionConfig::for_testing("alice"), transport, Some(store.clone())).await;
        session.insert_text(0, "Hello").await.unwrap();
        session.delete_text(2, 2).await.unwrap();
        session.close().await;
    }

    let saved = store.load("draft").await.unwrap().unwrap();
    assert_eq!(saved.operations.len(), 7);

    let server = Arc::new(SyncServer::new(ServerConfig::for_testing()));
    let transport = Arc::new(MemoryTransport::new(server.clone()));
    let session = CollabSession::open("draft", SessionConfig::for_testing("alice"), transport, Some(store)).await;
    assert_eq!(session.content().await.unwrap(), "Heo");

    session.wait_synced().await.unwrap();
    wait_for_ops(&server, "draft", 7).await;
    session.close().await;
}

// ─── Compression ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_repetitive_op_log_compresses() {
    let dir = tempdir().unwrap();
    let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();

    let text = "lorem ipsum ".repeat(500);
    let (_, snapshot) = snapshot_with_text("big", &text);
    store.save(&snapshot).await.unwrap();

    let meta = store.store().load_metadata("big").unwrap();
    assert_eq!(meta.operation_count, 6000);
    let ratio = meta.snapshot_size as f64 / meta.compressed_size as f64;
    assert!(ratio >= 3.0, "Compression ratio {ratio:.1}x is too low for an op log");
}

// ─── Isolation ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_documents_isolated_and_deletable() {
    let dir = tempdir().unwrap();
    let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();

    for (id, text) in [("a", "alpha"), ("b", "beta"), ("c", "gamma")] {
        let (_, snapshot) = snapshot_with_text(id, text);
        store.save(&snapshot).await.unwrap();
    }
    assert_eq!(store.list_documents().await.unwrap(), vec!["a", "b", "c"]);

    store.delete("b").await.unwrap();
    assert_eq!(store.list_documents().await.unwrap(), vec!["a", "c"]);
    assert!(store.load("b").await.unwrap().is_none());

    let a = store.load("a").await.unwrap().unwrap();
    let restored = Document::from_operations(SiteId::from_u128(5), a.operations);
    assert_eq!(restored.content(), "alpha");
}
