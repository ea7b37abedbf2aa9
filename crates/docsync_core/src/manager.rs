//! Service facade over documents, presence and observers.
//!
//! Connections, the cluster bridge and server-side code all go through
//! [`DocumentManager`]; it owns the document cache, the presence
//! registry, the callback dispatcher and the persistence pipeline.

use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};
use yrs::Doc;

use crate::cache::DocumentCache;
use crate::callbacks::{CallbackDispatcher, DocumentCallback};
use crate::container::ContainerOptions;
use crate::context::DocumentContext;
use crate::error::Result;
use crate::persistence::{PersistencePipeline, PipelineOptions};
use crate::presence::{PresenceChange, PresenceRegistry};
use crate::protocol::AwarenessEntry;
use crate::storage::DocStorage;

/// Tuning for [`DocumentManager`].
#[derive(Debug, Clone)]
pub struct DocumentManagerOptions {
    /// How long an unused container stays in memory.
    pub cache_duration: Duration,
    pub container: ContainerOptions,
    pub pipeline: PipelineOptions,
    /// Presence entries idle for longer than this are expired.
    pub presence_timeout: Duration,
    pub cleanup_interval: Duration,
}

impl Default for DocumentManagerOptions {
    fn default() -> Self {
        Self {
            cache_duration: Duration::from_secs(60),
            container: ContainerOptions::default(),
            pipeline: PipelineOptions::default(),
            presence_timeout: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(10),
        }
    }
}

pub struct DocumentManager {
    options: DocumentManagerOptions,
    pipeline: Arc<PersistencePipeline>,
    callbacks: Arc<CallbackDispatcher>,
    cache: DocumentCache,
    presence: PresenceRegistry,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

impl DocumentManager {
    /// Must be called within a Tokio runtime.
    pub fn new(storage: Arc<dyn DocStorage>, options: DocumentManagerOptions) -> Arc<Self> {
        let pipeline = Arc::new(PersistencePipeline::new(storage, options.pipeline.clone()));
        let callbacks = Arc::new(CallbackDispatcher::new());
        let cache = DocumentCache::new(
            options.cache_duration,
            options.container.clone(),
            Arc::clone(&pipeline),
            Arc::clone(&callbacks),
        );

        Arc::new(Self {
            options,
            pipeline,
            callbacks,
            cache,
            presence: PresenceRegistry::new(),
            cleanup_task: Mutex::new(None),
        })
    }

    /// Register an observer. Register before [`start`](Self::start) to
    /// receive `on_initialized`.
    pub fn add_callback(&self, callback: Arc<dyn DocumentCallback>) {
        self.callbacks.register(callback);
    }

    pub fn options(&self) -> &DocumentManagerOptions {
        &self.options
    }

    pub fn cache(&self) -> &DocumentCache {
        &self.cache
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    pub fn pipeline(&self) -> &Arc<PersistencePipeline> {
        &self.pipeline
    }

    /// Notify observers and start the periodic cleanup task.
    pub async fn start(self: &Arc<Self>) {
        self.callbacks.initialized(self).await;

        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.options.cleanup_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                manager.cleanup().await;
            }
        });

        let previous = self
            .cleanup_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
        info!(
            cleanup_interval_secs = period.as_secs_f64(),
            "Document manager started"
        );
    }

    /// Encode the server's state vector for the context's document.
    pub async fn get_state_vector(&self, ctx: &DocumentContext) -> Result<Vec<u8>> {
        self.cache
            .apply_update_return(&ctx.document_name, |doc| doc.state_vector())
            .await
    }

    /// Encode everything a peer with `state_vector` is missing.
    pub async fn get_update(&self, ctx: &DocumentContext, state_vector: &[u8]) -> Result<Vec<u8>> {
        self.cache
            .apply_update_return(&ctx.document_name, |doc| doc.diff_since(state_vector))
            .await
    }

    /// Merge a client update and notify observers of the resulting change.
    pub async fn apply_update(&self, ctx: &DocumentContext, update: &[u8]) -> Result<()> {
        let doc = self.cache.lock(&ctx.document_name).await?;
        self.callbacks.document_changing(ctx).await;

        if let Some(diff) = doc.apply_update(update)? {
            debug!(
                document = %ctx.document_name,
                client_id = ctx.client_id,
                bytes = diff.len(),
                "Applied update"
            );
            self.callbacks.document_changed(ctx, &diff).await;
        }
        Ok(())
    }

    /// Mutate the document on the server side.
    pub async fn update_doc<F, R>(&self, ctx: &DocumentContext, action: F) -> Result<R>
    where
        F: FnOnce(&Doc) -> R,
    {
        let doc = self.cache.lock(&ctx.document_name).await?;
        self.callbacks.document_changing(ctx).await;

        let (result, diffs) = doc.mutate(action)?;
        for diff in diffs {
            self.callbacks.document_changed(ctx, &diff).await;
        }
        Ok(result)
    }

    /// Record an awareness ping from `ctx.client_id`.
    pub async fn ping(
        &self,
        ctx: &DocumentContext,
        clock: u64,
        state: Option<String>,
    ) -> PresenceChange {
        let change =
            self.presence
                .add_or_update(&ctx.document_name, ctx.client_id, clock, state.clone());
        if change.is_visible() {
            self.callbacks
                .awareness_updated(ctx, clock, state.as_deref())
                .await;
        }
        change
    }

    /// Remove a client's presence. Unknown clients are ignored.
    ///
    /// Returns whether the client was present.
    pub async fn disconnect(&self, ctx: &DocumentContext) -> bool {
        let Some(user) = self.presence.remove(&ctx.document_name, ctx.client_id) else {
            return false;
        };
        debug!(
            document = %ctx.document_name,
            client_id = ctx.client_id,
            "Client disconnected"
        );
        self.callbacks
            .client_disconnected(ctx, user.client_clock)
            .await;
        true
    }

    /// Current presence of every client on `document`.
    pub fn get_awareness(&self, document: &str) -> Vec<AwarenessEntry> {
        self.presence
            .get_users(document)
            .into_iter()
            .map(|(client_id, user)| {
                AwarenessEntry::new(client_id, user.client_clock, user.client_state)
            })
            .collect()
    }

    /// Expire idle presence and evict idle documents.
    pub async fn cleanup(&self) {
        for expired in self.presence.cleanup(self.options.presence_timeout) {
            debug!(
                document = %expired.document_name,
                client_id = expired.client_id,
                "Presence expired"
            );
            let ctx = DocumentContext::new(expired.document_name, expired.client_id);
            self.callbacks
                .client_disconnected(&ctx, expired.user.client_clock)
                .await;
        }
        self.cache.sweep().await;
    }

    /// Stop background work, close every document and drain pending writes.
    pub async fn shutdown(&self) {
        let task = self
            .cleanup_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }

        self.cache.shutdown().await;
        self.pipeline.flush().await;
        info!("Document manager shut down");
    }
}

impl std::fmt::Debug for DocumentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentManager")
            .field("documents", &self.cache.len())
            .field("callbacks", &self.callbacks)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::CallbackResult;
    use crate::engine::SyncDoc;
    use crate::error::DocSyncError;
    use crate::storage::MemoryStorage;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use yrs::{GetString, Text, Transact};

    #[derive(Default)]
    struct Events {
        log: Mutex<Vec<String>>,
        initialized: AtomicUsize,
    }

    impl Events {
        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.log.lock().unwrap())
        }
    }

    #[async_trait]
    impl DocumentCallback for Events {
        async fn on_initialized(&self, _manager: &Arc<DocumentManager>) -> CallbackResult {
            self.initialized.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_document_changing(&self, ctx: &DocumentContext) -> CallbackResult {
            self.log
                .lock()
                .unwrap()
                .push(format!("changing:{}", ctx.client_id));
            Ok(())
        }

        async fn on_document_changed(&self, ctx: &DocumentContext, _diff: &[u8]) -> CallbackResult {
            self.log
                .lock()
                .unwrap()
                .push(format!("changed:{}", ctx.client_id));
            Ok(())
        }

        async fn on_client_disconnected(
            &self,
            ctx: &DocumentContext,
            last_clock: u64,
        ) -> CallbackResult {
            self.log
                .lock()
                .unwrap()
                .push(format!("disconnected:{}:{}", ctx.client_id, last_clock));
            Ok(())
        }

        async fn on_awareness_updated(
            &self,
            ctx: &DocumentContext,
            clock: u64,
            _state: Option<&str>,
        ) -> CallbackResult {
            self.log
                .lock()
                .unwrap()
                .push(format!("awareness:{}:{}", ctx.client_id, clock));
            Ok(())
        }
    }

    fn insert(text: &str) -> Vec<u8> {
        let doc = Doc::new();
        let body = doc.get_or_insert_text("body");
        let mut txn = doc.transact_mut();
        body.insert(&mut txn, 0, text);
        txn.encode_update_v1()
    }

    fn manager(options: DocumentManagerOptions) -> (Arc<DocumentManager>, Arc<Events>) {
        let manager = DocumentManager::new(Arc::new(MemoryStorage::new()), options);
        let events = Arc::new(Events::default());
        manager.add_callback(events.clone());
        (manager, events)
    }

    #[tokio::test]
    async fn test_apply_update_fires_change_events() {
        let (manager, events) = manager(DocumentManagerOptions::default());
        let ctx = DocumentContext::new("notes", 7);

        manager.apply_update(&ctx, &insert("Hello")).await.unwrap();
        assert_eq!(events.take(), vec!["changing:7", "changed:7"]);

        // Re-applying known content integrates nothing
        let update = manager.get_update(&ctx, &[]).await.unwrap();
        manager.apply_update(&ctx, &update).await.unwrap();
        assert_eq!(events.take(), vec!["changing:7"]);
    }

    #[tokio::test]
    async fn test_get_update_contains_applied_content() {
        let (manager, _events) = manager(DocumentManagerOptions::default());
        let ctx = DocumentContext::new("notes", 1);
        manager.apply_update(&ctx, &insert("Hello")).await.unwrap();

        let update = manager.get_update(&ctx, &[]).await.unwrap();
        let replica = SyncDoc::from_snapshot("replica", &update).unwrap();
        let body = replica.inner().get_or_insert_text("body");
        assert_eq!(body.get_string(&replica.inner().transact()), "Hello");

        let sv = manager.get_state_vector(&ctx).await.unwrap();
        assert_eq!(sv, replica.state_vector().unwrap());
    }

    #[tokio::test]
    async fn test_update_doc_runs_server_side_mutation() {
        let (manager, events) = manager(DocumentManagerOptions::default());
        let ctx = DocumentContext::system("notes");

        let text = manager
            .update_doc(&ctx, |doc| {
                let body = doc.get_or_insert_text("body");
                body.insert(&mut doc.transact_mut(), 0, "server");
                body.get_string(&doc.transact())
            })
            .await
            .unwrap();

        assert_eq!(text, "server");
        assert_eq!(events.take(), vec!["changing:0", "changed:0"]);
    }

    #[tokio::test]
    async fn test_missing_document_is_reported() {
        let (manager, _events) = manager(DocumentManagerOptions {
            container: ContainerOptions {
                auto_create: false,
                ..ContainerOptions::default()
            },
            ..DocumentManagerOptions::default()
        });

        let err = manager
            .get_state_vector(&DocumentContext::new("ghost", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, DocSyncError::DocumentNotFound(_)));
    }

    #[tokio::test]
    async fn test_ping_fires_awareness_only_when_visible() {
        let (manager, events) = manager(DocumentManagerOptions::default());
        let ctx = DocumentContext::new("notes", 3);

        assert!(manager.ping(&ctx, 1, Some("{}".into())).await.is_new);
        manager.ping(&ctx, 1, Some("{}".into())).await;
        manager.ping(&ctx, 2, None).await;

        assert_eq!(events.take(), vec!["awareness:3:1", "awareness:3:2"]);
        assert_eq!(
            manager.get_awareness("notes"),
            vec![AwarenessEntry::new(3, 2, None)]
        );
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (manager, events) = manager(DocumentManagerOptions::default());
        let ctx = DocumentContext::new("notes", 3);
        manager.ping(&ctx, 4, None).await;
        events.take();

        assert!(manager.disconnect(&ctx).await);
        assert!(!manager.disconnect(&ctx).await);
        assert_eq!(events.take(), vec!["disconnected:3:4"]);
    }

    #[tokio::test]
    async fn test_cleanup_expires_presence_as_disconnect() {
        let (manager, events) = manager(DocumentManagerOptions {
            presence_timeout: Duration::from_millis(20),
            ..DocumentManagerOptions::default()
        });
        manager.ping(&DocumentContext::new("notes", 9), 1, None).await;
        events.take();

        tokio::time::sleep(Duration::from_millis(40)).await;
        manager.cleanup().await;

        assert_eq!(events.take(), vec!["disconnected:9:1"]);
        assert!(manager.get_awareness("notes").is_empty());
    }

    #[tokio::test]
    async fn test_start_notifies_and_shutdown_persists() {
        let storage = Arc::new(MemoryStorage::new());
        let manager = DocumentManager::new(storage.clone(), DocumentManagerOptions::default());
        let events = Arc::new(Events::default());
        manager.add_callback(events.clone());

        manager.start().await;
        assert_eq!(events.initialized.load(Ordering::SeqCst), 1);

        manager
            .apply_update(&DocumentContext::new("notes", 1), &insert("saved"))
            .await
            .unwrap();
        manager.shutdown().await;

        let state = storage.load_doc("notes").unwrap().unwrap();
        let restored = SyncDoc::from_snapshot("notes", &state).unwrap();
        let body = restored.inner().get_or_insert_text("body");
        assert_eq!(body.get_string(&restored.inner().transact()), "saved");
    }
}
