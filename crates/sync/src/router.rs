//! Push-event router.
//!
//! One subscription per session feeds every decoded event through here.
//! Routing reads the current selection and pending-switch id from the
//! registry at dispatch time, never from a snapshot, so a conversation
//! switch mid-turn changes attribution without cancelling anything.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use printline_protocol::{
    is_temp_id, ChatMessage, Conversation, MessageContent, MessagePatch, MessageStatus,
    PushEvent, SenderType, SyncResult, ThinkingPhase, META_THINKING_ICON, META_THINKING_TEXT,
};
use printline_store::{ConversationRegistry, MessageStore, Watchdog};

#[derive(Clone)]
pub struct SyncRouter {
    store: MessageStore,
    registry: ConversationRegistry,
    watchdog: Watchdog,
    /// Active stream message id per conversation, for chunk frames that
    /// arrive without one.
    streams: Arc<RwLock<HashMap<String, String>>>,
}

impl SyncRouter {
    pub fn new(store: MessageStore, registry: ConversationRegistry, watchdog: Watchdog) -> Self {
        Self {
            store,
            registry,
            watchdog,
            streams: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Decode and route one raw frame. Unknown or malformed frames are
    /// logged and dropped; they never poison the stream.
    pub async fn handle_frame(&self, event: &str, data: Value) {
        match PushEvent::decode(event, data) {
            Ok(decoded) => {
                if let Err(error) = self.handle_event(decoded).await {
                    warn!(event, %error, "failed to apply push event");
                }
            }
            Err(error) => {
                warn!(event, %error, "dropping undecodable push frame");
            }
        }
    }

    pub async fn handle_event(&self, event: PushEvent) -> SyncResult<()> {
        match event {
            PushEvent::ThinkingUpdate {
                conversation_id,
                icon,
                text,
                phase,
            } => {
                self.on_thinking(&conversation_id, icon, text, phase).await
            }
            PushEvent::StreamStart {
                message_id,
                conversation_id,
            } => self.on_stream_start(&message_id, &conversation_id).await,
            PushEvent::StreamChunk {
                message_id,
                conversation_id,
                text,
            } => self.on_stream_chunk(message_id, &conversation_id, &text).await,
            PushEvent::MessageNew(msg) | PushEvent::MessageUpdated(msg) => {
                self.on_message(msg).await
            }
            PushEvent::ConversationCreated(conversation) => {
                self.on_conversation_created(conversation).await
            }
            PushEvent::ConversationUpdated {
                id,
                title,
                updated_at,
            } => self.on_conversation_updated(&id, title, updated_at).await,
        }
    }

    async fn on_thinking(
        &self,
        conversation_id: &str,
        icon: Option<String>,
        text: String,
        phase: ThinkingPhase,
    ) -> SyncResult<()> {
        if !self.registry.accepts(conversation_id).await {
            debug!(conversation_id, "thinking update for unwatched conversation");
            return Ok(());
        }

        let target = self.turn_target(conversation_id).await;
        match phase {
            ThinkingPhase::Final => {
                // The turn is over; whatever carried the indicator goes
                // terminal and the watchdog stands down.
                if let Some(key) = target {
                    self.store
                        .update_message(&key, MessagePatch::status(MessageStatus::Sent))
                        .await;
                }
                self.streams.write().await.remove(conversation_id);
                self.watchdog.disarm().await;
            }
            ThinkingPhase::Running => {
                if let Some(key) = target {
                    let mut patch = MessagePatch::status(MessageStatus::Thinking)
                        .with_metadata(META_THINKING_TEXT, json!(text));
                    if let Some(icon) = icon {
                        patch = patch.with_metadata(META_THINKING_ICON, json!(icon));
                    }
                    self.store.update_message(&key, patch).await;
                }
            }
        }
        Ok(())
    }

    async fn on_stream_start(&self, message_id: &str, conversation_id: &str) -> SyncResult<()> {
        if !self.registry.accepts(conversation_id).await {
            debug!(conversation_id, "stream start for unwatched conversation");
            return Ok(());
        }

        match self.store.latest_ai_placeholder(conversation_id).await {
            Some(placeholder) => {
                self.store
                    .replace_temp_id(&placeholder.id, message_id, conversation_id)
                    .await;
            }
            None => {
                // The turn began in another tab; materialize the message.
                debug!(message_id, conversation_id, "stream start without placeholder");
                self.store
                    .add_message(ChatMessage {
                        id: message_id.to_string(),
                        client_side_id: None,
                        conversation_id: conversation_id.to_string(),
                        sender: SenderType::Ai,
                        content: MessageContent::empty(),
                        status: MessageStatus::Streaming,
                        metadata: serde_json::Map::new(),
                        created_at: chrono::Utc::now(),
                    })
                    .await;
            }
        }

        self.streams
            .write()
            .await
            .insert(conversation_id.to_string(), message_id.to_string());
        Ok(())
    }

    async fn on_stream_chunk(
        &self,
        message_id: Option<String>,
        conversation_id: &str,
        text: &str,
    ) -> SyncResult<()> {
        let target = match message_id {
            Some(id) => Some(id),
            None => self.streams.read().await.get(conversation_id).cloned(),
        };
        let Some(target) = target else {
            debug!(conversation_id, "dropping chunk with no stream target");
            return Ok(());
        };

        if self.store.append_stream_content(&target, text).await {
            // Streaming supersedes the thinking indicator.
            self.store
                .update_message(
                    &target,
                    MessagePatch::default()
                        .with_metadata(META_THINKING_ICON, Value::Null)
                        .with_metadata(META_THINKING_TEXT, Value::Null),
                )
                .await;
        }
        Ok(())
    }

    async fn on_message(&self, msg: ChatMessage) -> SyncResult<()> {
        let conversation_id = msg.conversation_id.clone();
        if !self.registry.accepts(&conversation_id).await {
            debug!(conversation_id, "message event for unwatched conversation");
            return Ok(());
        }

        let terminal_ai = msg.sender == SenderType::Ai && msg.status == MessageStatus::Sent;
        self.store.add_message(msg).await;

        if terminal_ai {
            self.streams.write().await.remove(&conversation_id);
            self.watchdog.disarm().await;
        }
        Ok(())
    }

    async fn on_conversation_created(&self, conversation: Conversation) -> SyncResult<()> {
        // If the user is sitting in a temp conversation, this is its server
        // identity arriving over the push channel.
        if let Some(current) = self.registry.current().await {
            if is_temp_id(&current) {
                self.store.retag_conversation(&current, &conversation.id).await;
                self.registry.promote_temp(&current, &conversation.id).await;
                let mut streams = self.streams.write().await;
                if let Some(stream) = streams.remove(&current) {
                    streams.insert(conversation.id.clone(), stream);
                }
            }
        }
        self.registry.upsert(conversation).await;
        Ok(())
    }

    async fn on_conversation_updated(
        &self,
        id: &str,
        title: Option<String>,
        updated_at: Option<chrono::DateTime<chrono::Utc>>,
    ) -> SyncResult<()> {
        let Some(mut existing) = self.registry.get(id).await else {
            debug!(id, "update for unknown conversation");
            return Ok(());
        };
        if let Some(title) = title {
            existing.title = title;
        }
        existing.updated_at = updated_at.unwrap_or_else(chrono::Utc::now);
        self.registry.upsert(existing).await;
        Ok(())
    }

    /// The message carrying the current turn: the recorded stream id if one
    /// exists, otherwise the newest AI placeholder.
    async fn turn_target(&self, conversation_id: &str) -> Option<String> {
        if let Some(id) = self.streams.read().await.get(conversation_id) {
            return Some(id.clone());
        }
        self.store
            .latest_ai_placeholder(conversation_id)
            .await
            .map(|m| m.id)
    }
}
