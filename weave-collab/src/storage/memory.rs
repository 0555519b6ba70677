use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use super::{Persistence, PersistedSnapshot, PersistenceError};

/// Process-local store. Data lives as long as the value does.
///
/// Failures can be switched on to exercise degraded mode.
#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: Mutex<HashMap<String, PersistedSnapshot>>,
    failing: AtomicBool,
    saves: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// When set, every call fails with [`PersistenceError::Unavailable`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Successful saves so far.
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }

    /// Synchronous peek, for tests and diagnostics.
    pub fn snapshot(&self, document_id: &str) -> Option<PersistedSnapshot> {
        self.lock().get(document_id).cloned()
    }

    fn check(&self) -> Result<(), PersistenceError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable("memory store switched off".into()));
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, PersistedSnapshot>> {
        self.documents.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Persistence for MemoryStore {
    async fn load(&self, document_id: &str) -> Result<Option<PersistedSnapshot>, PersistenceError> {
        self.check()?;
        Ok(self.lock().get(document_id).cloned())
    }

    async fn save(&self, snapshot: &PersistedSnapshot) -> Result<(), PersistenceError> {
        self.check()?;
        self.lock().insert(snapshot.document_id.clone(), snapshot.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list_documents(&self) -> Result<Vec<String>, PersistenceError> {
        self.check()?;
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn delete(&self, document_id: &str) -> Result<(), PersistenceError> {
        self.check()?;
        self.lock().remove(document_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::StateVector;

    #[tokio::test]
    async fn test_save_load_list_delete() {
        let store = MemoryStore::new();
        assert_eq!(store.load("a").await.unwrap(), None);

        store.save(&PersistedSnapshot::new("b", vec![], StateVector::new())).await.unwrap();
        store.save(&PersistedSnapshot::new("a", vec![], StateVector::new())).await.unwrap();
        assert_eq!(store.list_documents().await.unwrap(), vec!["a", "b"]);
        assert!(store.load("a").await.unwrap().is_some());
        assert_eq!(store.save_count(), 2);

        store.delete("a").await.unwrap();
        assert_eq!(store.list_documents().await.unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_failing_store() {
        let store = MemoryStore::new();
        store.set_failing(true);
        let err = store
            .save(&PersistedSnapshot::new("a", vec![], StateVector::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, PersistenceError::Unavailable(_)));

        store.set_failing(false);
        assert!(store.load("a").await.unwrap().is_none());
    }
}
