//! Registry of live document containers with idle eviction.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::callbacks::CallbackDispatcher;
use crate::container::{ContainerOptions, DocumentContainer, DocumentGuard};
use crate::engine::SyncDoc;
use crate::error::Result;
use crate::persistence::PersistencePipeline;

struct CacheEntry {
    container: Arc<DocumentContainer>,
    valid_until: Instant,
}

/// Containers keyed by document name.
///
/// Every lookup extends the entry's lifetime by the cache duration. The
/// sweep disposes expired containers in three steps (collect under the
/// lock, dispose unlocked, remove under the lock) so teardown never
/// blocks lookups of other documents.
pub struct DocumentCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    cache_duration: Duration,
    container_options: ContainerOptions,
    pipeline: Arc<PersistencePipeline>,
    callbacks: Arc<CallbackDispatcher>,
    /// Serializes sweeps with each other and with shutdown.
    sweep_lock: tokio::sync::Mutex<()>,
}

impl DocumentCache {
    pub fn new(
        cache_duration: Duration,
        container_options: ContainerOptions,
        pipeline: Arc<PersistencePipeline>,
        callbacks: Arc<CallbackDispatcher>,
    ) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            cache_duration,
            container_options,
            pipeline,
            callbacks,
            sweep_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn lock_entries(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up or create the container for `name`, refreshing its lifetime.
    ///
    /// A container that has already been disposed is replaced.
    pub fn get_container(&self, name: &str) -> Arc<DocumentContainer> {
        let valid_until = Instant::now() + self.cache_duration;
        let mut entries = self.lock_entries();

        if let Some(entry) = entries.get_mut(name) {
            entry.valid_until = valid_until;
            if !entry.container.is_disposed() {
                return Arc::clone(&entry.container);
            }
        }

        let container = DocumentContainer::new(
            name,
            self.container_options.clone(),
            Arc::clone(&self.pipeline),
            Arc::clone(&self.callbacks),
        );
        entries.insert(
            name.to_string(),
            CacheEntry {
                container: Arc::clone(&container),
                valid_until,
            },
        );
        container
    }

    /// Take the mutation lock of `name`.
    ///
    /// If eviction disposed the container while this call was waiting,
    /// the call is retried once against a fresh container.
    pub async fn lock(&self, name: &str) -> Result<DocumentGuard> {
        match self.get_container(name).lock().await {
            Err(e) if e.is_disposed() => {
                debug!(document = name, "Container disposed during lookup, retrying");
                self.get_container(name).lock().await
            }
            result => result,
        }
    }

    /// Run `action` against the document with exclusive access.
    pub async fn apply_update_return<F, R>(&self, name: &str, action: F) -> Result<R>
    where
        F: FnOnce(&SyncDoc) -> Result<R>,
    {
        let guard = self.lock(name).await?;
        action(&guard)
    }

    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock_entries().contains_key(name)
    }

    /// Dispose and remove every container past its lifetime.
    ///
    /// Returns the number of evicted containers.
    pub async fn sweep(&self) -> usize {
        let _sweeping = self.sweep_lock.lock().await;

        let now = Instant::now();
        let expired: Vec<(String, Arc<DocumentContainer>)> = self
            .lock_entries()
            .iter()
            .filter(|(_, entry)| entry.valid_until <= now)
            .map(|(name, entry)| (name.clone(), Arc::clone(&entry.container)))
            .collect();
        if expired.is_empty() {
            return 0;
        }

        for (_, container) in &expired {
            container.dispose().await;
        }

        let mut entries = self.lock_entries();
        let mut evicted = 0;
        for (name, container) in expired {
            // A lookup may have replaced the entry while we were disposing.
            if entries
                .get(&name)
                .is_some_and(|entry| Arc::ptr_eq(&entry.container, &container))
            {
                entries.remove(&name);
                evicted += 1;
            }
        }
        debug!(evicted, remaining = entries.len(), "Swept document cache");
        drop(entries);

        self.pipeline.retry_pending();
        evicted
    }

    /// Flush and close every container.
    pub async fn shutdown(&self) {
        let _sweeping = self.sweep_lock.lock().await;

        let containers: Vec<Arc<DocumentContainer>> = self
            .lock_entries()
            .drain()
            .map(|(_, entry)| entry.container)
            .collect();
        info!(documents = containers.len(), "Closing document containers");

        for container in containers {
            container.flush().await;
            container.dispose().await;
        }
    }
}
