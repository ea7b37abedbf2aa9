//! Presence registry: who is connected to which document.
//!
//! Entries are keyed by `(document, client id)`. Each document has its
//! own lock; the outer map is only write-locked to add or prune whole
//! documents.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

type ClientMap = HashMap<u64, ConnectedUser>;

/// Last known presence of one client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedUser {
    pub client_clock: u64,
    /// JSON-encoded awareness state, `None` for the `null` state.
    pub client_state: Option<String>,
    pub last_activity: Instant,
}

/// Outcome of [`PresenceRegistry::add_or_update`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PresenceChange {
    pub is_new: bool,
    pub clock_advanced: bool,
    pub state_changed: bool,
}

impl PresenceChange {
    /// Whether peers need to hear about this ping.
    pub fn is_visible(&self) -> bool {
        self.is_new || self.clock_advanced
    }
}

/// A presence entry removed by [`PresenceRegistry::cleanup`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredClient {
    pub document_name: String,
    pub client_id: u64,
    pub user: ConnectedUser,
}

#[derive(Debug, Default)]
pub struct PresenceRegistry {
    documents: RwLock<HashMap<String, Arc<Mutex<ClientMap>>>>,
}

fn lock_clients(clients: &Mutex<ClientMap>) -> MutexGuard<'_, ClientMap> {
    clients.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a ping from `client_id`.
    ///
    /// State and clock only move forward: a ping whose clock is not
    /// greater than the stored one leaves both untouched, but still
    /// counts as activity.
    pub fn add_or_update(
        &self,
        document: &str,
        client_id: u64,
        clock: u64,
        state: Option<String>,
    ) -> PresenceChange {
        let now = Instant::now();
        self.with_clients(document, |clients| match clients.entry(client_id) {
            Entry::Vacant(slot) => {
                slot.insert(ConnectedUser {
                    client_clock: clock,
                    client_state: state,
                    last_activity: now,
                });
                PresenceChange {
                    is_new: true,
                    clock_advanced: false,
                    state_changed: true,
                }
            }
            Entry::Occupied(mut slot) => {
                let user = slot.get_mut();
                user.last_activity = now;
                if clock <= user.client_clock {
                    return PresenceChange::default();
                }
                let state_changed = user.client_state != state;
                user.client_clock = clock;
                user.client_state = state;
                PresenceChange {
                    is_new: false,
                    clock_advanced: true,
                    state_changed,
                }
            }
        })
    }

    /// Remove a client on explicit disconnect.
    pub fn remove(&self, document: &str, client_id: u64) -> Option<ConnectedUser> {
        let documents = self.documents.read().unwrap_or_else(PoisonError::into_inner);
        let clients = documents.get(document)?;
        lock_clients(clients).remove(&client_id)
    }

    pub fn get(&self, document: &str, client_id: u64) -> Option<ConnectedUser> {
        let documents = self.documents.read().unwrap_or_else(PoisonError::into_inner);
        let clients = documents.get(document)?;
        lock_clients(clients).get(&client_id).cloned()
    }

    /// Every client of `document`, ordered by client id.
    pub fn get_users(&self, document: &str) -> Vec<(u64, ConnectedUser)> {
        let documents = self.documents.read().unwrap_or_else(PoisonError::into_inner);
        let Some(clients) = documents.get(document) else {
            return Vec::new();
        };
        let mut users: Vec<_> = lock_clients(clients)
            .iter()
            .map(|(id, user)| (*id, user.clone()))
            .collect();
        users.sort_by_key(|(id, _)| *id);
        users
    }

    /// Remove and return every client idle for longer than `max_age`.
    pub fn cleanup(&self, max_age: Duration) -> Vec<ExpiredClient> {
        let Some(cutoff) = Instant::now().checked_sub(max_age) else {
            return Vec::new();
        };

        let mut expired = Vec::new();
        {
            let documents = self.documents.read().unwrap_or_else(PoisonError::into_inner);
            for (name, clients) in documents.iter() {
                lock_clients(clients).retain(|id, user| {
                    if user.last_activity < cutoff {
                        expired.push(ExpiredClient {
                            document_name: name.clone(),
                            client_id: *id,
                            user: user.clone(),
                        });
                        false
                    } else {
                        true
                    }
                });
            }
        }

        self.prune_empty();
        expired
    }

    pub fn document_count(&self) -> usize {
        self.documents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn with_clients<R>(&self, document: &str, f: impl FnOnce(&mut ClientMap) -> R) -> R {
        // The outer read lock is held while touching the document so
        // `prune_empty` cannot detach a map another caller is writing to.
        {
            let documents = self.documents.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(clients) = documents.get(document) {
                return f(&mut lock_clients(clients));
            }
        }

        let mut documents = self.documents.write().unwrap_or_else(PoisonError::into_inner);
        let clients = documents.entry(document.to_string()).or_default();
        let mut guard = lock_clients(clients);
        f(&mut guard)
    }

    fn prune_empty(&self) {
        let mut documents = self.documents.write().unwrap_or_else(PoisonError::into_inner);
        documents.retain(|_, clients| !lock_clients(clients).is_empty());
    }
}
