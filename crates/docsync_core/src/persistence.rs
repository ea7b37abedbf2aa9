//! Fleet-wide persistence pipeline.
//!
//! Snapshots handed over by containers are coalesced per document name
//! (the newest payload wins) and written on the same delay/ceiling
//! policy as the per-document writers. Writes fan out to the blocking
//! pool, bounded by a semaphore so a slow backend cannot grow the
//! number of concurrent writes.
//!
//! A snapshot whose write fails stays queued, and keeps shadowing storage
//! in [`PersistencePipeline::load_doc`], until a later write succeeds.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::debounce::{DebounceAction, Debouncer};
use crate::error::{DocSyncError, Result};
use crate::storage::DocStorage;

/// Tuning for [`PersistencePipeline`].
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub delay: Duration,
    pub max_delay: Duration,
    pub max_parallel_writes: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            max_parallel_writes: 16,
        }
    }
}

struct PendingWrite {
    state: Arc<Vec<u8>>,
    generation: u64,
}

type PendingMap = Arc<Mutex<HashMap<String, PendingWrite>>>;

fn lock_pending(
    pending: &Mutex<HashMap<String, PendingWrite>>,
) -> MutexGuard<'_, HashMap<String, PendingWrite>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Coalescing, bounded-parallelism writer in front of a [`DocStorage`].
pub struct PersistencePipeline {
    storage: Arc<dyn DocStorage>,
    pending: PendingMap,
    next_generation: AtomicU64,
    gate: Debouncer,
}

impl PersistencePipeline {
    /// Must be called within a Tokio runtime.
    pub fn new(storage: Arc<dyn DocStorage>, options: PipelineOptions) -> Self {
        let pending: PendingMap = Arc::default();
        let permits = Arc::new(Semaphore::new(options.max_parallel_writes.max(1)));

        let action: DebounceAction = {
            let storage = Arc::clone(&storage);
            let pending = Arc::clone(&pending);
            Arc::new(move || {
                let storage = Arc::clone(&storage);
                let pending = Arc::clone(&pending);
                let permits = Arc::clone(&permits);
                Box::pin(write_pending(storage, pending, permits))
            })
        };

        Self {
            storage,
            pending,
            next_generation: AtomicU64::new(1),
            gate: Debouncer::new(options.delay, options.max_delay, action),
        }
    }

    /// Queue a snapshot for `name`, replacing any queued one.
    pub fn enqueue(&self, name: &str, state: Vec<u8>) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        lock_pending(&self.pending).insert(
            name.to_string(),
            PendingWrite {
                state: Arc::new(state),
                generation,
            },
        );
        self.gate.ping();
    }

    /// Load a document, preferring a snapshot that has not been written yet.
    pub async fn load_doc(&self, name: &str) -> Result<Option<Vec<u8>>> {
        if let Some(write) = lock_pending(&self.pending).get(name) {
            return Ok(Some(write.state.as_ref().clone()));
        }

        let storage = Arc::clone(&self.storage);
        let owned = name.to_string();
        tokio::task::spawn_blocking(move || storage.load_doc(&owned))
            .await
            .map_err(|e| DocSyncError::Storage(format!("load task failed: {}", e)))?
    }

    /// Number of documents waiting to be written.
    pub fn pending_len(&self) -> usize {
        lock_pending(&self.pending).len()
    }

    pub fn storage(&self) -> &Arc<dyn DocStorage> {
        &self.storage
    }

    /// Schedule another write pass if snapshots are still queued, for
    /// example after a failed write.
    pub fn retry_pending(&self) {
        if self.pending_len() > 0 {
            self.gate.ping();
        }
    }

    /// Write everything queued and stop accepting new writes.
    pub async fn flush(&self) {
        self.retry_pending();
        self.gate.flush().await;
    }
}

async fn write_pending(storage: Arc<dyn DocStorage>, pending: PendingMap, permits: Arc<Semaphore>) {
    // Entries stay visible to `load_doc` until their write completes.
    let batch: Vec<(String, Arc<Vec<u8>>, u64)> = lock_pending(&pending)
        .iter()
        .map(|(name, write)| (name.clone(), Arc::clone(&write.state), write.generation))
        .collect();
    if batch.is_empty() {
        return;
    }
    debug!(documents = batch.len(), "Writing coalesced snapshots");

    let mut tasks = JoinSet::new();
    for (name, state, generation) in batch {
        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            break;
        };
        let storage = Arc::clone(&storage);
        let pending = Arc::clone(&pending);

        tasks.spawn(async move {
            let _permit = permit;
            let key = name.clone();
            let bytes = state.len();
            let result =
                tokio::task::spawn_blocking(move || storage.save_doc(&name, &state)).await;

            match result {
                Ok(Ok(())) => debug!(document = %key, bytes, "Stored document"),
                Ok(Err(e)) => {
                    error!(document = %key, "Failed to store document, keeping it queued: {}", e);
                    return;
                }
                Err(e) => {
                    error!(document = %key, "Store task failed, keeping it queued: {}", e);
                    return;
                }
            }

            let mut pending = lock_pending(&pending);
            if pending.get(&key).is_some_and(|w| w.generation == generation) {
                pending.remove(&key);
            }
        });
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            warn!("Store worker panicked: {}", e);
        }
    }
}
