//! Per-conversation message store.
//!
//! All mutation goes through the methods here, serialized behind an async
//! RwLock, so concurrent network callbacks, push events, and timers never
//! tear the state. Every write is idempotent under at-least-once delivery:
//! replaying an event lands the store in the same place.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use printline_protocol::{
    ChatMessage, MessageContent, MessagePatch, MessageStatus, META_TEMP_PLACEHOLDER,
};

/// Shared message state keyed by conversation id.
#[derive(Clone, Default)]
pub struct MessageStore {
    inner: Arc<RwLock<HashMap<String, Vec<ChatMessage>>>>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wholesale replace a conversation's messages, typically after a history
    /// fetch. De-duplicates by id (last occurrence wins) and orders by
    /// creation time.
    pub async fn set_messages(&self, conversation_id: &str, messages: Vec<ChatMessage>) {
        let mut deduped: Vec<ChatMessage> = Vec::with_capacity(messages.len());
        for msg in messages {
            if let Some(existing) = deduped.iter_mut().find(|m| m.id == msg.id) {
                *existing = msg;
            } else {
                deduped.push(msg);
            }
        }
        deduped.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let mut inner = self.inner.write().await;
        inner.insert(conversation_id.to_string(), deduped);
    }

    /// Upsert a message by either identity (`id` or `client_side_id`).
    ///
    /// The match is searched across every conversation, not just the bucket
    /// the incoming message is tagged with: a server echo can arrive tagged
    /// with the promoted conversation id while the optimistic entry still
    /// sits under its temp id. When a match exists the incoming message is
    /// merged into it: metadata keys are overlaid on the existing bag,
    /// content is only replaced when the incoming one is non-empty, and a
    /// terminal `Sent` status is never downgraded by a stale duplicate.
    pub async fn add_message(&self, msg: ChatMessage) {
        let mut inner = self.inner.write().await;

        let Some((bucket_id, index)) = locate_match(&inner, &msg) else {
            inner.entry(msg.conversation_id.clone()).or_default().push(msg);
            return;
        };
        let Some(mut existing) = inner.get_mut(&bucket_id).map(|b| b.remove(index)) else {
            return;
        };
        merge_into(&mut existing, msg);

        // The merge may have re-tagged the conversation; file the message
        // under its new home.
        let home = existing.conversation_id.clone();
        let bucket = inner.entry(home.clone()).or_default();
        if home == bucket_id && index <= bucket.len() {
            bucket.insert(index, existing);
        } else {
            bucket.push(existing);
        }
    }

    /// Apply a shallow patch to the message matching `key` in any
    /// conversation. Status transitions away from `Sent` are rejected.
    pub async fn update_message(&self, key: &str, patch: MessagePatch) -> bool {
        let mut inner = self.inner.write().await;

        let Some((bucket_id, index)) = locate(&inner, key) else {
            return false;
        };
        let mut msg = match inner.get_mut(&bucket_id) {
            Some(bucket) => bucket.remove(index),
            None => return false,
        };

        if let Some(status) = patch.status {
            if msg.status != MessageStatus::Sent || status == MessageStatus::Sent {
                msg.status = status;
            }
        }
        if let Some(content) = patch.content {
            msg.content = content;
        }
        if let Some(conversation_id) = patch.conversation_id {
            msg.conversation_id = conversation_id;
        }
        for (k, v) in patch.metadata {
            if v.is_null() {
                msg.metadata.remove(&k);
            } else {
                msg.metadata.insert(k, v);
            }
        }

        // A conversation re-tag moves the message into its new bucket;
        // otherwise it returns to its original slot.
        let home = msg.conversation_id.clone();
        let bucket = inner.entry(home.clone()).or_default();
        if home == bucket_id && index <= bucket.len() {
            bucket.insert(index, msg);
        } else {
            bucket.push(msg);
        }
        true
    }

    /// Promote an AI placeholder to its server-assigned streaming identity.
    ///
    /// Re-tags the id and conversation, clears the content so chunks start
    /// from empty text, and drops the placeholder marker. No-op when the temp
    /// id is gone, which happens when the same promotion already arrived from
    /// another event.
    pub async fn replace_temp_id(&self, temp_id: &str, real_id: &str, conversation_id: &str) -> bool {
        let mut inner = self.inner.write().await;

        let Some((bucket_id, index)) = locate(&inner, temp_id) else {
            return false;
        };

        let mut msg = match inner.get_mut(&bucket_id).map(|b| b.remove(index)) {
            Some(msg) => msg,
            None => return false,
        };

        debug!(temp_id, real_id, conversation_id, "promoting placeholder");
        msg.id = real_id.to_string();
        msg.conversation_id = conversation_id.to_string();
        msg.content = MessageContent::empty();
        msg.status = MessageStatus::Streaming;
        msg.metadata.remove(META_TEMP_PLACEHOLDER);

        inner
            .entry(conversation_id.to_string())
            .or_default()
            .push(msg);
        true
    }

    /// Append a stream chunk onto the message's text content. Strict no-op
    /// when the id is unknown: chunks never create entries.
    pub async fn append_stream_content(&self, key: &str, chunk: &str) -> bool {
        let mut inner = self.inner.write().await;

        let Some((bucket_id, index)) = locate(&inner, key) else {
            return false;
        };

        let Some(msg) = inner.get_mut(&bucket_id).and_then(|b| b.get_mut(index)) else {
            return false;
        };

        match &mut msg.content {
            MessageContent::Text { text } => text.push_str(chunk),
            other => *other = MessageContent::text(chunk),
        }
        if msg.status != MessageStatus::Sent {
            msg.status = MessageStatus::Streaming;
        }
        true
    }

    /// Remove the message matching `key`, wherever it lives.
    pub async fn remove_message(&self, key: &str) -> bool {
        let mut inner = self.inner.write().await;
        let Some((bucket_id, index)) = locate(&inner, key) else {
            return false;
        };
        if let Some(bucket) = inner.get_mut(&bucket_id) {
            bucket.remove(index);
            return true;
        }
        false
    }

    /// Cloned snapshot of a conversation's messages.
    pub async fn messages(&self, conversation_id: &str) -> Vec<ChatMessage> {
        let inner = self.inner.read().await;
        inner.get(conversation_id).cloned().unwrap_or_default()
    }

    /// Look a message up by either identity without knowing its conversation.
    pub async fn find_any(&self, key: &str) -> Option<ChatMessage> {
        let inner = self.inner.read().await;
        locate(&inner, key)
            .and_then(|(bucket_id, index)| inner.get(&bucket_id).and_then(|b| b.get(index)).cloned())
    }

    pub async fn find(&self, conversation_id: &str, key: &str) -> Option<ChatMessage> {
        let inner = self.inner.read().await;
        inner
            .get(conversation_id)
            .and_then(|bucket| bucket.iter().find(|m| m.matches_id(key)).cloned())
    }

    /// Most recent AI placeholder still waiting for its stream.
    pub async fn latest_ai_placeholder(&self, conversation_id: &str) -> Option<ChatMessage> {
        let inner = self.inner.read().await;
        inner
            .get(conversation_id)
            .and_then(|bucket| bucket.iter().rev().find(|m| m.is_placeholder()).cloned())
    }

    /// Move every message from a temp conversation into its promoted server
    /// conversation, re-tagging each message on the way.
    pub async fn retag_conversation(&self, temp_id: &str, real_id: &str) {
        let mut inner = self.inner.write().await;
        let Some(mut moved) = inner.remove(temp_id) else {
            return;
        };
        debug!(temp_id, real_id, count = moved.len(), "re-tagging conversation");
        for msg in &mut moved {
            msg.conversation_id = real_id.to_string();
        }
        inner.entry(real_id.to_string()).or_default().extend(moved);
    }

    /// Force every in-flight message in a conversation into an error state.
    /// Returns how many were flipped; a second invocation returns zero.
    pub async fn fail_in_flight(&self, conversation_id: &str, text: &str, code: &str) -> usize {
        let mut inner = self.inner.write().await;
        let Some(bucket) = inner.get_mut(conversation_id) else {
            return 0;
        };
        let mut flipped = 0;
        for msg in bucket.iter_mut() {
            if msg.status.is_in_flight() || msg.is_placeholder() {
                msg.status = MessageStatus::Failed;
                msg.content = MessageContent::error(text, Some(code.to_string()));
                msg.metadata.remove(META_TEMP_PLACEHOLDER);
                flipped += 1;
            }
        }
        flipped
    }
}

fn locate(inner: &HashMap<String, Vec<ChatMessage>>, key: &str) -> Option<(String, usize)> {
    for (bucket_id, bucket) in inner {
        if let Some(index) = bucket.iter().position(|m| m.matches_id(key)) {
            return Some((bucket_id.clone(), index));
        }
    }
    None
}

fn locate_match(
    inner: &HashMap<String, Vec<ChatMessage>>,
    incoming: &ChatMessage,
) -> Option<(String, usize)> {
    for (bucket_id, bucket) in inner {
        if let Some(index) = bucket.iter().position(|m| matches_either(m, incoming)) {
            return Some((bucket_id.clone(), index));
        }
    }
    None
}

fn matches_either(existing: &ChatMessage, incoming: &ChatMessage) -> bool {
    existing.matches_id(&incoming.id)
        || incoming
            .client_side_id
            .as_deref()
            .is_some_and(|key| existing.matches_id(key))
}

fn merge_into(existing: &mut ChatMessage, incoming: ChatMessage) {
    // A confirmed server id replaces a locally-minted one.
    existing.id = incoming.id;
    if incoming.client_side_id.is_some() {
        existing.client_side_id = incoming.client_side_id;
    }
    existing.conversation_id = incoming.conversation_id;
    existing.sender = incoming.sender;
    if !incoming.content.is_empty() {
        existing.content = incoming.content;
    }
    if existing.status != MessageStatus::Sent || incoming.status == MessageStatus::Sent {
        existing.status = incoming.status;
    }
    for (k, v) in incoming.metadata {
        existing.metadata.insert(k, v);
    }
}
