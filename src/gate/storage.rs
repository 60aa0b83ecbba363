use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::errors::StorageError;

use super::session::Settings;

// -----------------------------------------------------------------------------
// ----- Storage ---------------------------------------------------------------

/// Durable persistence of a user's settings, keyed by user id.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Called after every settings mutation on a bound session.
    async fn store(&self, user_id: &str, settings: &Settings) -> Result<(), StorageError>;

    async fn delete(&self, user_id: &str) -> Result<(), StorageError>;

    /// Called on bind. `Ok(None)` means nothing persisted for this user.
    async fn query(&self, user_id: &str) -> Result<Option<Settings>, StorageError>;

    /// Sent while the user is online; extends expiry of the persisted entry.
    async fn heartbeat(&self, user_id: &str);
}

// -----------------------------------------------------------------------------
// ----- MemoryStorage ---------------------------------------------------------

/// Process-local storage. Entries expire `ttl` after the last store or
/// heartbeat; `None` keeps them forever.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, Entry>>,
    ttl: Option<Duration>,
    stores: AtomicU64,
}

#[derive(Debug, Clone)]
struct Entry {
    settings: Settings,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

impl MemoryStorage {
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            stores: AtomicU64::new(0),
        }
    }

    /// Number of `store` calls served so far.
    pub fn store_count(&self) -> u64 {
        self.stores.load(Ordering::Relaxed)
    }

    /// Entries held, expired ones not yet swept included.
    pub fn entry_count(&self) -> usize {
        self.entries.lock().len()
    }

    fn deadline(&self) -> Option<Instant> {
        self.ttl.map(|ttl| Instant::now() + ttl)
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn store(&self, user_id: &str, settings: &Settings) -> Result<(), StorageError> {
        let entry = Entry {
            settings: settings.clone(),
            expires_at: self.deadline(),
        };

        let mut entries = self.entries.lock();
        if self.ttl.is_some() {
            let now = Instant::now();
            entries.retain(|_, held| !held.is_expired(now));
        }
        entries.insert(user_id.to_string(), entry);
        drop(entries);

        self.stores.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn delete(&self, user_id: &str) -> Result<(), StorageError> {
        self.entries.lock().remove(user_id);
        Ok(())
    }

    async fn query(&self, user_id: &str) -> Result<Option<Settings>, StorageError> {
        let mut entries = self.entries.lock();

        let Some(entry) = entries.get(user_id) else {
            return Ok(None);
        };

        if entry.is_expired(Instant::now()) {
            entries.remove(user_id);
            return Ok(None);
        }

        Ok(Some(entry.settings.clone()))
    }

    /// Only live entries are extended; an expired one is dropped instead.
    async fn heartbeat(&self, user_id: &str) {
        let now = Instant::now();
        let deadline = self.deadline();
        let mut entries = self.entries.lock();

        let expired = match entries.get_mut(user_id) {
            None => return,
            Some(entry) if entry.is_expired(now) => true,
            Some(entry) => {
                entry.expires_at = deadline;
                false
            }
        };

        if expired {
            entries.remove(user_id);
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
