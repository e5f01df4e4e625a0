//! Conversation registry.
//!
//! Sole owner of the conversation list, the current selection, and the
//! pending-switch id used to attribute push events that land while a send is
//! still waiting for its server-assigned conversation id.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use printline_protocol::{Conversation, SyncResult};

use crate::selection::SelectionStore;

#[derive(Default)]
struct RegistryState {
    conversations: Vec<Conversation>,
    current: Option<String>,
    pending_switch: Option<String>,
}

#[derive(Clone, Default)]
pub struct ConversationRegistry {
    inner: Arc<RwLock<RegistryState>>,
    selection: Option<SelectionStore>,
}

impl ConversationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry that persists the current selection and restores the
    /// one saved by the previous session.
    pub async fn with_selection(selection: SelectionStore) -> SyncResult<Self> {
        let restored = selection.load_selected().await?;
        if let Some(id) = &restored {
            debug!(conversation_id = %id, "restored last selected conversation");
        }
        Ok(Self {
            inner: Arc::new(RwLock::new(RegistryState {
                current: restored,
                ..RegistryState::default()
            })),
            selection: Some(selection),
        })
    }

    /// Merge a conversation in by id, never duplicating. The list stays
    /// ordered newest first.
    pub async fn upsert(&self, conversation: Conversation) {
        let mut state = self.inner.write().await;
        if let Some(existing) = state
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation.id)
        {
            existing.title = conversation.title;
            existing.updated_at = conversation.updated_at;
            existing.kind = conversation.kind;
        } else {
            state.conversations.push(conversation);
        }
        state
            .conversations
            .sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    }

    pub async fn rename(&self, id: &str, title: &str) {
        let mut state = self.inner.write().await;
        if let Some(existing) = state.conversations.iter_mut().find(|c| c.id == id) {
            existing.title = title.to_string();
            existing.updated_at = Utc::now();
        }
        state
            .conversations
            .sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    }

    pub async fn remove(&self, id: &str) {
        let cleared_selection = {
            let mut state = self.inner.write().await;
            state.conversations.retain(|c| c.id != id);
            if state.pending_switch.as_deref() == Some(id) {
                state.pending_switch = None;
            }
            if state.current.as_deref() == Some(id) {
                state.current = None;
                true
            } else {
                false
            }
        };
        if cleared_selection {
            self.persist_selection(None).await;
        }
    }

    pub async fn list(&self) -> Vec<Conversation> {
        self.inner.read().await.conversations.clone()
    }

    pub async fn get(&self, id: &str) -> Option<Conversation> {
        self.inner
            .read()
            .await
            .conversations
            .iter()
            .find(|c| c.id == id)
            .cloned()
    }

    /// Make `id` the current conversation. Any pending switch is consumed:
    /// an explicit selection supersedes in-flight attribution.
    pub async fn select(&self, id: &str) {
        {
            let mut state = self.inner.write().await;
            state.current = Some(id.to_string());
            state.pending_switch = None;
        }
        self.persist_selection(Some(id)).await;
    }

    pub async fn clear_selection(&self) {
        {
            let mut state = self.inner.write().await;
            state.current = None;
            state.pending_switch = None;
        }
        self.persist_selection(None).await;
    }

    pub async fn current(&self) -> Option<String> {
        self.inner.read().await.current.clone()
    }

    /// Mint a temp conversation, insert it, and select it.
    pub async fn begin_temp(&self) -> Conversation {
        let conversation = Conversation::temp();
        let id = conversation.id.clone();
        {
            let mut state = self.inner.write().await;
            state.conversations.insert(0, conversation.clone());
            state.current = Some(id.clone());
            state.pending_switch = None;
        }
        self.persist_selection(Some(&id)).await;
        conversation
    }

    /// Re-tag a temp conversation with its server id, carrying the selection
    /// and any pending switch along with it.
    pub async fn promote_temp(&self, temp_id: &str, real_id: &str) {
        let mut promoted_selection = None;
        {
            let mut state = self.inner.write().await;
            if let Some(existing) = state.conversations.iter_mut().find(|c| c.id == temp_id) {
                existing.id = real_id.to_string();
                existing.updated_at = Utc::now();
            }
            // The server may have broadcast its own entry before promotion.
            dedupe_by_id(&mut state.conversations, real_id);

            if state.current.as_deref() == Some(temp_id) {
                state.current = Some(real_id.to_string());
                promoted_selection = Some(real_id.to_string());
            }
            if state.pending_switch.as_deref() == Some(temp_id) {
                state.pending_switch = Some(real_id.to_string());
            }
        }
        if let Some(id) = promoted_selection {
            self.persist_selection(Some(&id)).await;
        }
    }

    pub async fn set_pending_switch(&self, id: &str) {
        self.inner.write().await.pending_switch = Some(id.to_string());
    }

    pub async fn take_pending_switch(&self) -> Option<String> {
        self.inner.write().await.pending_switch.take()
    }

    /// Whether events for `conversation_id` belong to the visible message
    /// list: either the current selection or the id a just-promoted send is
    /// switching to.
    pub async fn accepts(&self, conversation_id: &str) -> bool {
        let state = self.inner.read().await;
        state.current.as_deref() == Some(conversation_id)
            || state.pending_switch.as_deref() == Some(conversation_id)
    }

    async fn persist_selection(&self, id: Option<&str>) {
        if let Some(selection) = &self.selection {
            if let Err(error) = selection.save_selected(id).await {
                warn!(%error, "failed to persist conversation selection");
            }
        }
    }
}

fn dedupe_by_id(conversations: &mut Vec<Conversation>, id: &str) {
    let mut seen = false;
    conversations.retain(|c| {
        if c.id == id {
            if seen {
                return false;
            }
            seen = true;
        }
        true
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use printline_protocol::is_temp_id;

    fn conversation(id: &str, title: &str) -> Conversation {
        Conversation {
            id: id.to_string(),
            title: title.to_string(),
            updated_at: Utc::now(),
            kind: Conversation::default_kind(),
        }
    }

    #[tokio::test]
    async fn upsert_merges_by_id() {
        let registry = ConversationRegistry::new();
        registry.upsert(conversation("c1", "First")).await;
        registry.upsert(conversation("c1", "Renamed")).await;

        let list = registry.list().await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].title, "Renamed");
    }

    #[tokio::test]
    async fn newest_conversation_sorts_first() {
        let registry = ConversationRegistry::new();
        let mut old = conversation("c1", "Old");
        old.updated_at = Utc::now() - chrono::Duration::hours(1);
        registry.upsert(old).await;
        registry.upsert(conversation("c2", "New")).await;

        let list = registry.list().await;
        assert_eq!(list[0].id, "c2");
    }

    #[tokio::test]
    async fn begin_temp_selects_a_temp_conversation() {
        let registry = ConversationRegistry::new();
        let temp = registry.begin_temp().await;

        assert!(is_temp_id(&temp.id));
        assert_eq!(registry.current().await.as_deref(), Some(temp.id.as_str()));
    }

    #[tokio::test]
    async fn promote_temp_carries_selection_and_pending_switch() {
        let registry = ConversationRegistry::new();
        let temp = registry.begin_temp().await;
        registry.set_pending_switch(&temp.id).await;

        registry.promote_temp(&temp.id, "conv-real").await;

        assert_eq!(registry.current().await.as_deref(), Some("conv-real"));
        assert!(registry.accepts("conv-real").await);
        assert!(!registry.accepts(&temp.id).await);
        assert_eq!(
            registry.take_pending_switch().await.as_deref(),
            Some("conv-real")
        );
    }

    #[tokio::test]
    async fn promote_temp_drops_duplicate_server_entry() {
        let registry = ConversationRegistry::new();
        let temp = registry.begin_temp().await;
        registry.upsert(conversation("conv-real", "Broadcast copy")).await;

        registry.promote_temp(&temp.id, "conv-real").await;

        let list = registry.list().await;
        assert_eq!(list.iter().filter(|c| c.id == "conv-real").count(), 1);
    }

    #[tokio::test]
    async fn accepts_covers_selection_and_pending_switch() {
        let registry = ConversationRegistry::new();
        registry.upsert(conversation("c1", "One")).await;
        registry.select("c1").await;
        registry.set_pending_switch("c2").await;

        assert!(registry.accepts("c1").await);
        assert!(registry.accepts("c2").await);
        assert!(!registry.accepts("c3").await);
    }

    #[tokio::test]
    async fn select_consumes_pending_switch() {
        let registry = ConversationRegistry::new();
        registry.set_pending_switch("c2").await;
        registry.select("c1").await;

        assert!(!registry.accepts("c2").await);
        assert_eq!(registry.take_pending_switch().await, None);
    }

    #[tokio::test]
    async fn remove_clears_selection() {
        let registry = ConversationRegistry::new();
        registry.upsert(conversation("c1", "One")).await;
        registry.select("c1").await;
        registry.remove("c1").await;

        assert_eq!(registry.current().await, None);
        assert!(registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn selection_survives_reconstruction() {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let selection = crate::SelectionStore::open(pool).await.unwrap();

        let registry = ConversationRegistry::with_selection(selection.clone())
            .await
            .unwrap();
        registry.upsert(conversation("c1", "One")).await;
        registry.select("c1").await;

        let reopened = ConversationRegistry::with_selection(selection).await.unwrap();
        assert_eq!(reopened.current().await.as_deref(), Some("c1"));
    }
}
