//! Adapter over the yrs document engine.
//!
//! The engine is treated as a black box: it merges binary updates,
//! encodes state vectors, diffs and snapshots, and reports the update
//! produced by every committed transaction. Transactions are mutually
//! exclusive; a conflicting acquisition is reported, never waited on.

use std::sync::{Arc, Mutex, PoisonError};

use yrs::{
    Doc, ReadTxn, StateVector, Subscription, Transact, Update, updates::decoder::Decode,
    updates::encoder::Encode,
};

use crate::error::{DocSyncError, Result};

/// Encoding of a v1 update that carries no structs and no deletions.
const EMPTY_UPDATE_V1: [u8; 2] = [0, 0];

/// Whether an encoded v1 update changes nothing.
pub fn is_empty_update(update: &[u8]) -> bool {
    update.is_empty() || update == EMPTY_UPDATE_V1
}

/// A CRDT document owned by one container.
pub struct SyncDoc {
    doc: Doc,
    name: String,
}

impl SyncDoc {
    /// Create a new empty document.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            doc: Doc::new(),
            name: name.into(),
        }
    }

    /// Build a document from persisted snapshot bytes.
    pub fn from_snapshot(name: impl Into<String>, snapshot: &[u8]) -> Result<Self> {
        let doc = Self::new(name);
        doc.apply_update(snapshot)?;
        Ok(doc)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Apply a binary update inside a write transaction.
    ///
    /// Returns the update actually integrated by this transaction, or
    /// `None` when the document did not change.
    pub fn apply_update(&self, update: &[u8]) -> Result<Option<Vec<u8>>> {
        let decoded = Update::decode_v1(update)
            .map_err(|e| DocSyncError::Crdt(format!("Failed to decode update: {}", e)))?;

        let mut txn = self
            .doc
            .try_transact_mut()
            .map_err(|_| DocSyncError::TransactionConflict(self.name.clone()))?;
        txn.apply_update(decoded)
            .map_err(|e| DocSyncError::Crdt(format!("Failed to apply update: {}", e)))?;

        let diff = txn.encode_update_v1();
        Ok((!is_empty_update(&diff)).then_some(diff))
    }

    /// Run a server-side mutation.
    ///
    /// `action` opens its own transactions; the update committed by each
    /// of them is returned in commit order.
    pub fn mutate<F, R>(&self, action: F) -> Result<(R, Vec<Vec<u8>>)>
    where
        F: FnOnce(&Doc) -> R,
    {
        let committed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&committed);
        let subscription = self.observe_updates(move |update| {
            sink.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(update.to_vec());
        })?;

        let result = action(&self.doc);
        drop(subscription);

        let diffs = std::mem::take(&mut *committed.lock().unwrap_or_else(PoisonError::into_inner));
        Ok((result, diffs))
    }

    /// Encode the full document state as a snapshot.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        let txn = self
            .doc
            .try_transact()
            .map_err(|_| DocSyncError::TransactionConflict(self.name.clone()))?;
        Ok(txn.encode_state_as_update_v1(&StateVector::default()))
    }

    /// Encode the current state vector.
    pub fn state_vector(&self) -> Result<Vec<u8>> {
        let txn = self
            .doc
            .try_transact()
            .map_err(|_| DocSyncError::TransactionConflict(self.name.clone()))?;
        Ok(txn.state_vector().encode_v1())
    }

    /// Encode everything the holder of `state_vector` is missing.
    ///
    /// An empty state vector means the remote has nothing, so the full
    /// state is returned.
    pub fn diff_since(&self, state_vector: &[u8]) -> Result<Vec<u8>> {
        let sv = if state_vector.is_empty() {
            StateVector::default()
        } else {
            StateVector::decode_v1(state_vector)
                .map_err(|e| DocSyncError::Crdt(format!("Failed to decode state vector: {}", e)))?
        };
        let txn = self
            .doc
            .try_transact()
            .map_err(|_| DocSyncError::TransactionConflict(self.name.clone()))?;
        Ok(txn.encode_state_as_update_v1(&sv))
    }

    /// Observe every committed update.
    ///
    /// The returned handle unregisters the observer exactly once, when dropped.
    pub fn observe_updates<F>(&self, callback: F) -> Result<UpdateSubscription>
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        let subscription = self
            .doc
            .observe_update_v1(move |_txn, event| {
                callback(&event.update);
            })
            .map_err(|_| DocSyncError::TransactionConflict(self.name.clone()))?;
        Ok(UpdateSubscription {
            _subscription: subscription,
        })
    }

    /// Access the underlying engine document for typed reads.
    pub fn inner(&self) -> &Doc {
        &self.doc
    }
}

impl std::fmt::Debug for SyncDoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncDoc")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Scoped registration of an update observer.
#[must_use = "the observer is removed as soon as the subscription is dropped"]
pub struct UpdateSubscription {
    _subscription: Subscription,
}
