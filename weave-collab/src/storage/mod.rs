//! Persistence port for document op logs.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐  save(snapshot)   ┌───────────────────────────────┐
//! │ CollabSession│ ────────────────► │ dyn Persistence               │
//! │ SyncServer   │ ◄──────────────── │  ├─ MemoryStore (HashMap)     │
//! └──────────────┘  load(documentId) │  └─ RocksStore  (RocksDB)     │
//!                                    │       ├─ CF "documents" (LZ4) │
//!                                    │       └─ CF "metadata"        │
//!                                    └───────────────────────────────┘
//! ```
//!
//! A snapshot is the full op log of a document plus the state vector that
//! was last confirmed by the relay. Replaying the log on a fresh engine
//! restores the document exactly; the vector tells a resumed session what
//! the relay already has.
//!
//! Failures never take a session down: it logs, degrades to memory-only
//! and keeps editing.
//!
//! Reference: Kleppmann, Designing Data-Intensive Applications, Chapter 3

mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{DocumentMetadata, DocumentStore, RocksStore, StoreConfig, StoreError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crdt::{Document, Operation, StateVector};

/// Durable form of one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSnapshot {
    pub document_id: String,
    /// Op log in causal order.
    pub operations: Vec<Operation>,
    /// What the relay was known to hold at the last successful sync.
    pub last_synced_vector: StateVector,
}

impl PersistedSnapshot {
    pub fn new(document_id: impl Into<String>, operations: Vec<Operation>, last_synced_vector: StateVector) -> Self {
        Self {
            document_id: document_id.into(),
            operations,
            last_synced_vector,
        }
    }

    /// Capture the current log of `doc`.
    pub fn from_document(document_id: impl Into<String>, doc: &Document, last_synced_vector: &StateVector) -> Self {
        Self::new(document_id, doc.operations().to_vec(), last_synced_vector.clone())
    }

    /// State vector covered by the stored ops.
    pub fn state_vector(&self) -> StateVector {
        let mut sv = StateVector::new();
        for op in &self.operations {
            sv.observe(op.id());
        }
        sv
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>, PersistenceError> {
        serde_json::to_vec(self).map_err(|e| PersistenceError::Serialization(e.to_string()))
    }

    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, PersistenceError> {
        serde_json::from_slice(bytes).map_err(|e| PersistenceError::Corrupt(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PersistenceError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("corrupt snapshot: {0}")]
    Corrupt(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for PersistenceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Compression(reason) | StoreError::Deserialization(reason) => {
                PersistenceError::Corrupt(reason)
            }
            other => PersistenceError::Backend(other.to_string()),
        }
    }
}

/// Durable storage for document snapshots, keyed by document id.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Load the last saved snapshot, `None` when the document is unknown.
    async fn load(&self, document_id: &str) -> Result<Option<PersistedSnapshot>, PersistenceError>;

    /// Replace the stored snapshot for `snapshot.document_id`.
    async fn save(&self, snapshot: &PersistedSnapshot) -> Result<(), PersistenceError>;

    /// Ids of every stored document.
    async fn list_documents(&self) -> Result<Vec<String>, PersistenceError>;

    async fn delete(&self, document_id: &str) -> Result<(), PersistenceError>;
}
