//! Printline runtime crate
//!
//! Wires the engine together: configuration, the SQLite pool, state stores,
//! the sender pipeline, the push-event router, and cross-tab sync, plus the
//! tracing bootstrap shared by anything embedding the engine.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use printline_broadcast::{
    ChannelHub, ChannelTransport, CrossTabSync, StorageTransport, TabTransport,
};
use printline_config::{BroadcastTransport, SyncConfig};
use printline_offline::OfflineQueue;
use printline_protocol::{Conversation, SyncEventKind, SyncResult};
use printline_store::{ConversationRegistry, MessageStore, SelectionStore, Watchdog};
use printline_sync::{
    channel, ChatApi, EngineNotice, HttpChatApi, PushChannel, RetryManager, SenderPipeline,
    SyncRouter,
};

pub mod telemetry {
    use anyhow::Result;
    use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

    /// Install the global tracing subscriber for anything embedding the
    /// engine. `RUST_LOG` overrides the default `info` filter.
    pub fn init_tracing() -> Result<()> {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let subscriber = SubscriberBuilder::default()
            .with_env_filter(env_filter)
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .map_err(|error| anyhow::anyhow!("failed to set tracing subscriber: {error}"))
    }
}

const NOTICE_CAPACITY: usize = 64;

/// The assembled synchronization engine. One instance per client session
/// ("tab"); instances sharing a transport stay in sync with each other.
pub struct SyncEngine {
    store: MessageStore,
    registry: ConversationRegistry,
    watchdog: Watchdog,
    queue: OfflineQueue,
    tabs: Arc<CrossTabSync>,
    pipeline: SenderPipeline,
    router: SyncRouter,
    api: Arc<dyn ChatApi>,
    notices: broadcast::Sender<EngineNotice>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncEngine {
    /// Build the engine from configuration, with the production HTTP client
    /// and the configured tab transport.
    pub async fn initialise(config: SyncConfig) -> Result<Self> {
        let api: Arc<dyn ChatApi> =
            Arc::new(HttpChatApi::new(&config.api).context("failed to build chat api client")?);
        let pool = open_pool(&config.queue.database_url).await?;

        let transport: Arc<dyn TabTransport> = match config.broadcast.transport {
            BroadcastTransport::Channel => Arc::new(ChannelTransport::new(ChannelHub::new())),
            BroadcastTransport::Storage => Arc::new(
                StorageTransport::open(
                    pool.clone(),
                    Duration::from_millis(config.broadcast.poll_interval_ms),
                )
                .await
                .context("failed to open storage tab transport")?,
            ),
        };

        Self::assemble(config, api, pool, transport).await
    }

    /// Build the engine around an explicit API client and tab transport.
    /// This is how sibling tabs share one transport, and how tests inject a
    /// scripted API.
    pub async fn initialise_with(
        config: SyncConfig,
        api: Arc<dyn ChatApi>,
        transport: Arc<dyn TabTransport>,
    ) -> Result<Self> {
        let pool = open_pool(&config.queue.database_url).await?;
        Self::assemble(config, api, pool, transport).await
    }

    async fn assemble(
        config: SyncConfig,
        api: Arc<dyn ChatApi>,
        pool: SqlitePool,
        transport: Arc<dyn TabTransport>,
    ) -> Result<Self> {
        let store = MessageStore::new();
        let selection = SelectionStore::open(pool.clone())
            .await
            .context("failed to open selection store")?;
        let registry = ConversationRegistry::with_selection(selection)
            .await
            .context("failed to restore conversation selection")?;
        let watchdog = Watchdog::new(
            Duration::from_secs(config.watchdog.timeout_seconds),
            store.clone(),
        );
        let queue = OfflineQueue::open(pool.clone(), config.queue.clone())
            .await
            .context("failed to open offline queue")?;
        let retry = RetryManager::new(config.retry.clone());
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);

        let tabs = Arc::new(CrossTabSync::new(transport));
        tabs.start()
            .await
            .context("failed to start cross-tab sync")?;

        let pipeline = SenderPipeline::new(
            api.clone(),
            store.clone(),
            registry.clone(),
            watchdog.clone(),
            queue.clone(),
            retry,
            tabs.clone(),
            notices.clone(),
        );
        let router = SyncRouter::new(store.clone(), registry.clone(), watchdog.clone());

        let engine = Self {
            store,
            registry,
            watchdog,
            queue,
            tabs,
            pipeline,
            router,
            api,
            notices,
            tasks: Mutex::new(Vec::new()),
        };
        engine.spawn_watchdog_forwarder().await;
        engine.spawn_tab_listeners().await;
        info!(tab_id = engine.tabs.tab_id(), "sync engine initialised");
        Ok(engine)
    }

    /// Spawn the router loop over a connected push channel.
    pub async fn attach<C>(&self, push_channel: C)
    where
        C: PushChannel + 'static,
    {
        let router = self.router.clone();
        let handle = tokio::spawn(channel::pump(push_channel, router));
        self.tasks.lock().await.push(handle);
    }

    /// Flush the offline queue after connectivity returns.
    pub async fn on_reconnect(&self) -> SyncResult<()> {
        info!("connection restored, flushing offline queue");
        self.pipeline.flush_offline().await
    }

    /// Subscribe to user-visible engine notices.
    pub fn notices(&self) -> broadcast::Receiver<EngineNotice> {
        self.notices.subscribe()
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn registry(&self) -> &ConversationRegistry {
        &self.registry
    }

    pub fn sender(&self) -> &SenderPipeline {
        &self.pipeline
    }

    pub fn router(&self) -> &SyncRouter {
        &self.router
    }

    pub fn offline_queue(&self) -> &OfflineQueue {
        &self.queue
    }

    /// Rename a conversation server-side and propagate to sibling tabs.
    pub async fn rename_conversation(&self, id: &str, title: &str) -> SyncResult<()> {
        self.api
            .rename_conversation(id.to_string(), title.to_string())
            .await?;
        self.registry.rename(id, title).await;
        self.tabs
            .publish(
                SyncEventKind::ConversationRenamed,
                serde_json::json!({ "id": id, "title": title }),
            )
            .await?;
        Ok(())
    }

    /// Delete a conversation server-side and propagate to sibling tabs.
    pub async fn delete_conversation(&self, id: &str) -> SyncResult<()> {
        self.api.delete_conversation(id.to_string()).await?;
        self.registry.remove(id).await;
        self.tabs
            .publish(
                SyncEventKind::ConversationDeleted,
                serde_json::json!({ "id": id }),
            )
            .await?;
        Ok(())
    }

    /// Load the conversation list from the server into the registry.
    pub async fn refresh_conversations(&self, kind: Option<&str>) -> SyncResult<usize> {
        let conversations = self
            .api
            .list_conversations(kind.map(str::to_string))
            .await?;
        let count = conversations.len();
        for conversation in conversations {
            self.registry.upsert(conversation).await;
        }
        Ok(count)
    }

    /// Tear everything down: cancel retries, disarm the watchdog, stop the
    /// router and listener tasks.
    pub async fn shutdown(&self) {
        self.pipeline.shutdown().await;
        self.watchdog.disarm().await;
        self.tabs.shutdown().await;
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
        info!("sync engine shut down");
    }

    async fn spawn_watchdog_forwarder(&self) {
        let mut timeouts = self.watchdog.subscribe();
        let notices = self.notices.clone();
        let handle = tokio::spawn(async move {
            while let Ok(conversation_id) = timeouts.recv().await {
                let _ = notices.send(EngineNotice::WatchdogTimeout { conversation_id });
            }
        });
        self.tasks.lock().await.push(handle);
    }

    async fn spawn_tab_listeners(&self) {
        let mut created = self.tabs.subscribe(SyncEventKind::ConversationCreated).await;
        let mut renamed = self.tabs.subscribe(SyncEventKind::ConversationRenamed).await;
        let mut deleted = self.tabs.subscribe(SyncEventKind::ConversationDeleted).await;
        let registry = self.registry.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = created.recv() => match event {
                        Ok(message) => {
                            match serde_json::from_value::<Conversation>(message.payload) {
                                Ok(conversation) => registry.upsert(conversation).await,
                                Err(error) => {
                                    warn!(%error, "malformed cross-tab conversation payload")
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    event = renamed.recv() => match event {
                        Ok(message) => {
                            let id = message.payload["id"].as_str().unwrap_or_default().to_string();
                            let title = message.payload["title"].as_str().unwrap_or_default().to_string();
                            if !id.is_empty() {
                                registry.rename(&id, &title).await;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    event = deleted.recv() => match event {
                        Ok(message) => {
                            if let Some(id) = message.payload["id"].as_str() {
                                registry.remove(id).await;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
        self.tasks.lock().await.push(handle);
    }
}

async fn open_pool(database_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .with_context(|| format!("invalid sqlite url '{database_url}'"))?
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await
        .context("failed to open local database")?;
    Ok(pool)
}
