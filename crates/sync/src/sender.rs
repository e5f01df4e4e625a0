//! Optimistic sender pipeline.
//!
//! A send inserts the user message and an AI placeholder synchronously, then
//! reconciles with whatever the network says later: server echo, retry,
//! conversation promotion, or an offline fallback. The store stays the
//! single source of truth the whole way through.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use printline_broadcast::CrossTabSync;
use printline_offline::OfflineQueue;
use printline_protocol::{
    is_temp_id, ChatMessage, MessagePatch, MessageStatus, QueuedMessage, SyncEventKind,
    SyncError, SyncResult, META_ERROR_CODE, META_RETRY_COUNT,
};
use printline_store::{ConversationRegistry, MessageStore, Watchdog};

use crate::api::ChatApi;
use crate::notice::EngineNotice;
use crate::retry::RetryManager;

const OFFLINE_NOTICE_TEXT: &str =
    "Your message was saved and will be sent when the connection returns.";

#[derive(Clone)]
pub struct SenderPipeline {
    api: Arc<dyn ChatApi>,
    store: MessageStore,
    registry: ConversationRegistry,
    watchdog: Watchdog,
    queue: OfflineQueue,
    retry: RetryManager,
    tabs: Arc<CrossTabSync>,
    notices: broadcast::Sender<EngineNotice>,
}

impl SenderPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        api: Arc<dyn ChatApi>,
        store: MessageStore,
        registry: ConversationRegistry,
        watchdog: Watchdog,
        queue: OfflineQueue,
        retry: RetryManager,
        tabs: Arc<CrossTabSync>,
        notices: broadcast::Sender<EngineNotice>,
    ) -> Self {
        Self {
            api,
            store,
            registry,
            watchdog,
            queue,
            retry,
            tabs,
            notices,
        }
    }

    /// Send a user message, optimistically and with retries. Failures are
    /// reflected in the store before the error is returned.
    pub async fn send_text(&self, text: &str, context: Option<Value>) -> SyncResult<()> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SyncError::validation("message text is empty"));
        }

        let conversation_id = match self.registry.current().await {
            Some(id) => id,
            None => self.registry.begin_temp().await.id,
        };

        let client_id = cuid2::create_id();
        let user_msg = ChatMessage::outbound(text, &conversation_id, &client_id);
        let placeholder = ChatMessage::ai_placeholder(&conversation_id);
        let placeholder_id = placeholder.id.clone();
        self.store.add_message(user_msg).await;
        self.store.add_message(placeholder).await;

        self.dispatch(&client_id, &placeholder_id, text, &conversation_id, context)
            .await
    }

    /// Re-issue a failed user message, keeping its identity.
    pub async fn retry_failed(&self, key: &str) -> SyncResult<()> {
        let Some(msg) = self.store.find_any(key).await else {
            return Err(SyncError::validation(format!("no message matches '{key}'")));
        };
        if msg.status != MessageStatus::Failed {
            return Err(SyncError::validation("message is not in a failed state"));
        }
        let Some(text) = msg.content.as_text().map(str::to_string) else {
            return Err(SyncError::validation("only text messages can be retried"));
        };
        let client_key = msg.client_side_id.clone().unwrap_or_else(|| msg.id.clone());
        let conversation_id = msg.conversation_id.clone();

        self.store
            .update_message(&client_key, MessagePatch::status(MessageStatus::Sending))
            .await;
        let placeholder = ChatMessage::ai_placeholder(&conversation_id);
        let placeholder_id = placeholder.id.clone();
        self.store.add_message(placeholder).await;

        self.dispatch(&client_key, &placeholder_id, &text, &conversation_id, None)
            .await
    }

    /// Discard a failed message instead of retrying it.
    pub async fn cancel_failed(&self, key: &str) -> SyncResult<()> {
        self.retry.cancel(key).await;
        self.queue.remove(key).await?;
        self.store.remove_message(key).await;
        Ok(())
    }

    /// Fill the store from server history. Page 1 replaces; later pages
    /// merge with what is already loaded.
    pub async fn load_history(&self, conversation_id: &str, page: u32, page_size: u32) -> SyncResult<usize> {
        let fetched = self
            .api
            .fetch_history(conversation_id.to_string(), page, page_size)
            .await?;
        let count = fetched.len();

        let combined = if page <= 1 {
            fetched
        } else {
            let mut merged = fetched;
            merged.extend(self.store.messages(conversation_id).await);
            merged
        };
        self.store.set_messages(conversation_id, combined).await;
        Ok(count)
    }

    /// Drain the offline queue, then keep re-flushing on a delay while
    /// entries remain. Each pass reports its result on the notice channel.
    /// A delivered entry is reconciled the same way a live send is: its
    /// store message goes `Sent` and any conversation the server created is
    /// promoted and broadcast.
    pub async fn flush_offline(&self) -> SyncResult<()> {
        loop {
            let api = self.api.clone();
            let store = self.store.clone();
            let registry = self.registry.clone();
            let tabs = self.tabs.clone();
            let report = self
                .queue
                .flush(move |entry: QueuedMessage| {
                    let api = api.clone();
                    let store = store.clone();
                    let registry = registry.clone();
                    let tabs = tabs.clone();
                    async move {
                        let outcome = api
                            .send_message(
                                entry.body,
                                entry.temp_id.clone(),
                                entry.conversation_id,
                                None,
                            )
                            .await?;

                        if let Some(conversation) = outcome.new_conversation {
                            if let Some(msg) = store.find_any(&entry.temp_id).await {
                                if is_temp_id(&msg.conversation_id) {
                                    store
                                        .retag_conversation(&msg.conversation_id, &conversation.id)
                                        .await;
                                    registry
                                        .promote_temp(&msg.conversation_id, &conversation.id)
                                        .await;
                                }
                            }
                            registry.upsert(conversation.clone()).await;
                            if let Err(error) = tabs
                                .publish(
                                    SyncEventKind::ConversationCreated,
                                    serde_json::to_value(&conversation)?,
                                )
                                .await
                            {
                                warn!(%error, "conversation created, cross-tab broadcast failed");
                            }
                        }

                        store
                            .update_message(
                                &entry.temp_id,
                                MessagePatch::status(MessageStatus::Sent),
                            )
                            .await;
                        if let Some(echo) = outcome.message {
                            store.add_message(echo).await;
                        }
                        Ok(())
                    }
                })
                .await?;

            let Some(report) = report else {
                // Another flush owns the queue right now.
                return Ok(());
            };
            if report.sent > 0 || report.dropped > 0 {
                info!(
                    sent = report.sent,
                    dropped = report.dropped,
                    remaining = report.remaining,
                    "offline queue flushed"
                );
            }
            let _ = self.notices.send(EngineNotice::FlushCompleted {
                sent: report.sent,
                dropped: report.dropped,
                remaining: report.remaining,
            });

            if !report.needs_reflush() {
                return Ok(());
            }
            tokio::time::sleep(self.queue.reflush_delay()).await;
        }
    }

    /// Cancel all in-flight retries. Called on engine teardown.
    pub async fn shutdown(&self) {
        self.retry.cancel_all().await;
    }

    async fn dispatch(
        &self,
        client_key: &str,
        placeholder_id: &str,
        text: &str,
        conversation_id: &str,
        context: Option<Value>,
    ) -> SyncResult<()> {
        self.watchdog.arm(conversation_id).await;

        // A temp conversation has no server id yet; the server creates one.
        let target = if is_temp_id(conversation_id) {
            None
        } else {
            Some(conversation_id.to_string())
        };

        let api = self.api.clone();
        let send_text = text.to_string();
        let send_key = client_key.to_string();
        let send_target = target.clone();
        let store = self.store.clone();
        let notices = self.notices.clone();
        let retry_key = client_key.to_string();

        let outcome = self
            .retry
            .run(
                client_key,
                move |attempt| {
                    let store = store.clone();
                    let notices = notices.clone();
                    let key = retry_key.clone();
                    async move {
                        store
                            .update_message(
                                &key,
                                MessagePatch::status(MessageStatus::Retrying)
                                    .with_metadata(META_RETRY_COUNT, json!(attempt)),
                            )
                            .await;
                        let _ = notices.send(EngineNotice::Retrying {
                            message_key: key,
                            attempt,
                        });
                    }
                },
                move || {
                    let api = api.clone();
                    let text = send_text.clone();
                    let key = send_key.clone();
                    let target = send_target.clone();
                    let context = context.clone();
                    async move { api.send_message(text, key, target, context).await }
                },
            )
            .await;

        match outcome {
            Ok(outcome) => {
                // Promotion first: the echo arrives tagged with the server
                // conversation id, so the optimistic entry has to live there
                // before the echo is merged into it.
                if let Some(conversation) = outcome.new_conversation {
                    self.promote_conversation(conversation_id, conversation.id.clone())
                        .await;
                    self.registry.upsert(conversation.clone()).await;
                    if let Err(error) = self
                        .tabs
                        .publish(
                            SyncEventKind::ConversationCreated,
                            serde_json::to_value(&conversation)?,
                        )
                        .await
                    {
                        warn!(%error, "conversation created, cross-tab broadcast failed");
                    }
                }

                self.store
                    .update_message(client_key, MessagePatch::status(MessageStatus::Sent))
                    .await;
                if let Some(echo) = outcome.message {
                    // Unifies the optimistic entry with its server id.
                    self.store.add_message(echo).await;
                }

                self.queue.remove(client_key).await?;
                Ok(())
            }
            Err(error) => {
                self.watchdog.disarm().await;
                self.store
                    .update_message(
                        client_key,
                        MessagePatch::status(MessageStatus::Failed)
                            .with_metadata(META_ERROR_CODE, json!(error.code())),
                    )
                    .await;
                self.store.remove_message(placeholder_id).await;

                if error.is_retryable() {
                    let queued = QueuedMessage::new(client_key, text, target);
                    self.queue.add(&queued).await?;
                    self.store
                        .add_message(ChatMessage::error_notice(
                            conversation_id,
                            OFFLINE_NOTICE_TEXT,
                            Some(error.code().to_string()),
                        ))
                        .await;
                    let _ = self.notices.send(EngineNotice::SavedOffline {
                        temp_id: client_key.to_string(),
                    });
                    debug!(key = client_key, "send failed, saved offline");
                } else {
                    self.store
                        .add_message(ChatMessage::error_notice(
                            conversation_id,
                            format!("Sending failed: {error}"),
                            Some(error.code().to_string()),
                        ))
                        .await;
                }
                Err(error)
            }
        }
    }

    async fn promote_conversation(&self, temp_id: &str, real_id: String) {
        debug!(temp_id, real_id = %real_id, "promoting conversation after first send");
        self.store.retag_conversation(temp_id, &real_id).await;
        self.registry.promote_temp(temp_id, &real_id).await;
        // Events for the new id stay attributable even if the user has
        // switched away in the meantime.
        self.registry.set_pending_switch(&real_id).await;
    }
}
