use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use super::{CollabSession, SessionConfig, SessionError, SessionEvent};
use crate::awareness::{AwarenessPatch, AwarenessState};
use crate::storage::Persistence;
use crate::transport::Transport;

/// Open sessions keyed by document id, behind the editor-facing API.
///
/// Every call names the document and the acting user; a call for a
/// document that is not open, or by a user other than the one the
/// document was opened for, is rejected.
pub struct SessionManager {
    transport: Arc<dyn Transport>,
    store: Option<Arc<dyn Persistence>>,
    defaults: SessionConfig,
    sessions: RwLock<HashMap<String, Arc<CollabSession>>>,
}

impl SessionManager {
    /// `defaults` supplies timings and reconnect policy for every session;
    /// identity comes from [`SessionManager::open`].
    pub fn new(transport: Arc<dyn Transport>, store: Option<Arc<dyn Persistence>>, defaults: SessionConfig) -> Self {
        Self {
            transport,
            store,
            defaults,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Open `document_id` for `user_id`, or return the session already open.
    pub async fn open(&self, document_id: &str, user_id: &str, name: &str) -> Result<Arc<CollabSession>, SessionError> {
        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(document_id) {
            if existing.user_id() != user_id {
                return Err(wrong_user(existing, user_id));
            }
            return Ok(existing.clone());
        }

        let config = SessionConfig {
            user_id: user_id.to_string(),
            name: name.to_string(),
            ..self.defaults.clone()
        };
        let session = Arc::new(
            CollabSession::open(document_id, config, self.transport.clone(), self.store.clone()).await,
        );
        sessions.insert(document_id.to_string(), session.clone());
        log::info!("Opened document {document_id} for {user_id}");
        Ok(session)
    }

    pub async fn session(&self, document_id: &str) -> Option<Arc<CollabSession>> {
        self.sessions.read().await.get(document_id).cloned()
    }

    pub async fn insert_text(
        &self,
        document_id: &str,
        position: usize,
        text: &str,
        user_id: &str,
    ) -> Result<(), SessionError> {
        self.acting(document_id, user_id).await?.insert_text(position, text).await
    }

    pub async fn delete_text(
        &self,
        document_id: &str,
        position: usize,
        length: usize,
        user_id: &str,
    ) -> Result<(), SessionError> {
        self.acting(document_id, user_id).await?.delete_text(position, length).await
    }

    /// Replace the content with `text`, diffed against the current content.
    pub async fn apply_text(
        &self,
        document_id: &str,
        text: &str,
        cursor_hint: usize,
        user_id: &str,
    ) -> Result<(), SessionError> {
        self.acting(document_id, user_id).await?.apply_text(text, cursor_hint).await
    }

    pub async fn update_awareness(
        &self,
        document_id: &str,
        user_id: &str,
        patch: AwarenessPatch,
    ) -> Result<AwarenessState, SessionError> {
        self.acting(document_id, user_id).await?.update_awareness(patch).await
    }

    pub async fn get_content(&self, document_id: &str) -> Result<String, SessionError> {
        self.opened(document_id).await?.content().await
    }

    pub async fn get_active_users(&self, document_id: &str) -> Result<Vec<AwarenessState>, SessionError> {
        self.opened(document_id).await?.active_users().await
    }

    pub async fn subscribe(&self, document_id: &str) -> Result<broadcast::Receiver<SessionEvent>, SessionError> {
        Ok(self.opened(document_id).await?.subscribe())
    }

    /// Close one document. Closing a document that is not open is an error.
    pub async fn close(&self, document_id: &str) -> Result<(), SessionError> {
        let session = self
            .sessions
            .write()
            .await
            .remove(document_id)
            .ok_or_else(|| SessionError::UnknownDocument(document_id.to_string()))?;
        session.close().await;
        Ok(())
    }

    pub async fn close_all(&self) {
        let sessions: Vec<Arc<CollabSession>> = self.sessions.write().await.drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.close().await;
        }
    }

    /// Ids of open documents, sorted.
    pub async fn open_documents(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn opened(&self, document_id: &str) -> Result<Arc<CollabSession>, SessionError> {
        self.session(document_id)
            .await
            .ok_or_else(|| SessionError::UnknownDocument(document_id.to_string()))
    }

    async fn acting(&self, document_id: &str, user_id: &str) -> Result<Arc<CollabSession>, SessionError> {
        let session = self.opened(document_id).await?;
        if session.user_id() != user_id {
            return Err(wrong_user(&session, user_id));
        }
        Ok(session)
    }
}

fn wrong_user(session: &CollabSession, user_id: &str) -> SessionError {
    SessionError::WrongUser {
        document_id: session.document_id().to_string(),
        expected: session.user_id().to_string(),
        user_id: user_id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{ServerConfig, SyncServer};
    use crate::transport::MemoryTransport;

    fn manager() -> SessionManager {
        let server = Arc::new(SyncServer::new(ServerConfig::for_testing()));
        let transport = Arc::new(MemoryTransport::new(server));
        SessionManager::new(transport, None, SessionConfig::default())
    }

    #[tokio::test]
    async fn test_ui_api_round_trip() {
        let manager = manager();
        manager.open("notes", "alice", "Alice").await.unwrap();

        manager.insert_text("notes", 0, "Hello", "alice").await.unwrap();
        manager.delete_text("notes", 1, 1, "alice").await.unwrap();
        assert_eq!(manager.get_content("notes").await.unwrap(), "Hllo");

        let users = manager.get_active_users("notes").await.unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].name, "Alice");

        manager.close_all().await;
        assert!(manager.open_documents().await.is_empty());
    }

    #[tokio::test]
    async fn test_open_is_idempotent_per_document() {
        let manager = manager();
        let first = manager.open("a", "alice", "Alice").await.unwrap();
        let again = manager.open("a", "alice", "Alice").await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        manager.open("b", "alice", "Alice").await.unwrap();
        assert_eq!(manager.open_documents().await, vec!["a", "b"]);
        manager.close_all().await;
    }

    #[tokio::test]
    async fn test_unknown_document_and_wrong_user() {
        let manager = manager();
        assert_eq!(
            manager.get_content("missing").await.unwrap_err(),
            SessionError::UnknownDocument("missing".into())
        );

        manager.open("a", "alice", "Alice").await.unwrap();
        let err = manager.insert_text("a", 0, "x", "mallory").await.unwrap_err();
        assert!(matches!(err, SessionError::WrongUser { .. }));
        assert!(matches!(
            manager.open("a", "bob", "Bob").await.unwrap_err(),
            SessionError::WrongUser { .. }
        ));

        manager.close("a").await.unwrap();
        assert!(manager.close("a").await.is_err());
    }
}
