//! Life-cycle of one in-memory document.
//!
//! A container loads its document on first use (concurrent callers share
//! one load), serializes every mutation behind a single async mutex, and
//! persists snapshots through a per-document debounced writer.

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{Mutex, OnceCell, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::callbacks::CallbackDispatcher;
use crate::context::DocumentContext;
use crate::debounce::{DebounceAction, Debouncer};
use crate::engine::{SyncDoc, UpdateSubscription};
use crate::error::{DocSyncError, Result};
use crate::persistence::PersistencePipeline;

/// Tuning for [`DocumentContainer`].
#[derive(Debug, Clone)]
pub struct ContainerOptions {
    /// Create missing documents instead of failing.
    pub auto_create: bool,
    /// Quiet period before a snapshot is taken.
    pub store_delay: Duration,
    /// Longest a change may stay unsnapshotted under continuous edits.
    pub store_max_delay: Duration,
}

impl Default for ContainerOptions {
    fn default() -> Self {
        Self {
            auto_create: true,
            store_delay: Duration::from_millis(100),
            store_max_delay: Duration::from_millis(1000),
        }
    }
}

struct LoadedDoc {
    doc: SyncDoc,
    _updates: UpdateSubscription,
}

/// Exclusive access to a loaded document.
///
/// The container's mutation lock is held until the guard is dropped.
pub struct DocumentGuard {
    loaded: Arc<LoadedDoc>,
    _lock: OwnedMutexGuard<()>,
}

impl Deref for DocumentGuard {
    type Target = SyncDoc;

    fn deref(&self) -> &SyncDoc {
        &self.loaded.doc
    }
}

pub struct DocumentContainer {
    name: String,
    options: ContainerOptions,
    pipeline: Arc<PersistencePipeline>,
    callbacks: Arc<CallbackDispatcher>,
    loaded: OnceCell<Arc<LoadedDoc>>,
    mutation: Arc<Mutex<()>>,
    /// Set by the update observer, cleared when a snapshot is queued.
    changed: Arc<AtomicBool>,
    writer: Debouncer,
    disposed: AtomicBool,
}

impl DocumentContainer {
    /// Must be called within a Tokio runtime.
    pub fn new(
        name: impl Into<String>,
        options: ContainerOptions,
        pipeline: Arc<PersistencePipeline>,
        callbacks: Arc<CallbackDispatcher>,
    ) -> Arc<Self> {
        let name = name.into();
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let weak = weak.clone();
            let action: DebounceAction = Arc::new(move || {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(container) = weak.upgrade() {
                        container.persist().await;
                    }
                })
            });

            Self {
                writer: Debouncer::new(options.store_delay, options.store_max_delay, action),
                name,
                options,
                pipeline,
                callbacks,
                loaded: OnceCell::new(),
                mutation: Arc::new(Mutex::new(())),
                changed: Arc::new(AtomicBool::new(false)),
                disposed: AtomicBool::new(false),
            }
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.initialized()
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(DocSyncError::ContainerDisposed(self.name.clone()));
        }
        Ok(())
    }

    /// Wait for the document and take its mutation lock.
    pub async fn lock(&self) -> Result<DocumentGuard> {
        self.ensure_live()?;
        let loaded = self.loaded.get_or_try_init(|| self.load()).await?.clone();
        let lock = Arc::clone(&self.mutation).lock_owned().await;
        // Disposal may have completed while this caller was queued.
        self.ensure_live()?;
        Ok(DocumentGuard {
            loaded,
            _lock: lock,
        })
    }

    /// Run `action` against the document with exclusive access.
    pub async fn apply_update_return<F, R>(&self, action: F) -> Result<R>
    where
        F: FnOnce(&SyncDoc) -> Result<R>,
    {
        let guard = self.lock().await?;
        action(&guard)
    }

    async fn load(&self) -> Result<Arc<LoadedDoc>> {
        let doc = match self.pipeline.load_doc(&self.name).await? {
            Some(state) => {
                debug!(document = %self.name, bytes = state.len(), "Loaded document");
                SyncDoc::from_snapshot(&self.name, &state)?
            }
            None if self.options.auto_create => {
                debug!(document = %self.name, "Created new document");
                SyncDoc::new(&self.name)
            }
            None => return Err(DocSyncError::DocumentNotFound(self.name.clone())),
        };

        self.callbacks
            .document_loaded(&DocumentContext::system(&self.name))
            .await;

        let writer = self.writer.clone();
        let changed = Arc::clone(&self.changed);
        let updates = doc.observe_updates(move |_update| {
            changed.store(true, Ordering::Release);
            writer.ping();
        })?;

        Ok(Arc::new(LoadedDoc {
            doc,
            _updates: updates,
        }))
    }

    /// Queue a snapshot if anything changed since the last one.
    ///
    /// The snapshot is taken under the mutation lock; storage I/O happens
    /// later in the persistence pipeline.
    async fn persist(&self) {
        let Some(loaded) = self.loaded.get() else {
            return;
        };
        let _lock = self.mutation.lock().await;
        self.queue_snapshot(loaded);
    }

    fn queue_snapshot(&self, loaded: &LoadedDoc) {
        if !self.changed.swap(false, Ordering::AcqRel) {
            return;
        }
        match loaded.doc.snapshot() {
            Ok(state) => self.pipeline.enqueue(&self.name, state),
            Err(e) => {
                self.changed.store(true, Ordering::Release);
                warn!(document = %self.name, "Failed to snapshot document: {}", e);
            }
        }
    }

    /// Persist pending changes now instead of waiting for the writer.
    pub async fn flush(&self) {
        self.persist().await;
    }

    /// Persist pending changes and refuse every later operation.
    ///
    /// The final snapshot is queued before the container is marked
    /// disposed, so a replacement container always loads the latest state.
    pub async fn dispose(&self) {
        {
            let _lock = self.mutation.lock().await;
            if self.is_disposed() {
                return;
            }
            if let Some(loaded) = self.loaded.get() {
                self.queue_snapshot(loaded);
            }
            self.disposed.store(true, Ordering::Release);
        }
        self.writer.flush().await;
        debug!(document = %self.name, "Disposed document container");
    }
}

impl std::fmt::Debug for DocumentContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentContainer")
            .field("name", &self.name)
            .field("loaded", &self.is_loaded())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
