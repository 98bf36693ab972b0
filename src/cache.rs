//! Two-generation rate cache over a durable key/value store.
//!
//! Generations live in an indexed ring of [`DEPTH`] slots: slot 0 is the
//! current generation, slot 1 the one it replaced. Each slot is two entries
//! (serialized rates and an RFC 3339 timestamp) written together.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::StoreError;
use crate::models::{price_map, Generation, RateRecord};

pub const DEPTH: usize = 2;

pub const CURRENT: usize = 0;
pub const PREVIOUS: usize = 1;

#[derive(Debug, Clone, Copy)]
pub struct SlotKeys {
    pub rates: &'static str,
    pub timestamp: &'static str,
}

pub const SLOT_KEYS: [SlotKeys; DEPTH] = [
    SlotKeys {
        rates: "rates_current",
        timestamp: "rates_timestamp",
    },
    SlotKeys {
        rates: "rates_previous",
        timestamp: "rates_previous_timestamp",
    },
];

/// Durable string key/value storage.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write all entries at once; either every entry lands or none does.
    async fn set_many(&self, entries: &[(&str, String)]) -> Result<(), StoreError>;

    /// Delete all keys at once. Absent keys are ignored.
    async fn remove_many(&self, keys: &[&str]) -> Result<(), StoreError>;
}

/// Key/value store persisted as a single JSON object on disk.
pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<HashMap<String, String>, StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn load_for_write(&self) -> Result<HashMap<String, String>, StoreError> {
        match self.load().await {
            Err(StoreError::Json(e)) => {
                warn!(error = %e, path = %self.path.display(), "Replacing malformed cache file");
                Ok(HashMap::new())
            }
            other => other,
        }
    }

    async fn save(&self, entries: &HashMap<String, String>) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(entries)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");

        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.remove(key))
    }

    async fn set_many(&self, entries: &[(&str, String)]) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut map = self.load_for_write().await?;

        for (key, value) in entries {
            map.insert((*key).to_string(), value.clone());
        }
        self.save(&map).await
    }

    async fn remove_many(&self, keys: &[&str]) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut map = self.load_for_write().await?;

        for key in keys {
            map.remove(*key);
        }
        self.save(&map).await
    }
}

/// In-process store, lost when the process exits.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set_many(&self, entries: &[(&str, String)]) -> Result<(), StoreError> {
        let mut map = self.entries.lock().await;
        for (key, value) in entries {
            map.insert((*key).to_string(), value.clone());
        }
        Ok(())
    }

    async fn remove_many(&self, keys: &[&str]) -> Result<(), StoreError> {
        let mut map = self.entries.lock().await;
        for key in keys {
            map.remove(*key);
        }
        Ok(())
    }
}

/// The cached generations, newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct History {
    slots: [Option<Generation>; DEPTH],
}

impl History {
    pub fn current(&self) -> Option<&Generation> {
        self.slots[CURRENT].as_ref()
    }

    pub fn previous(&self) -> Option<&Generation> {
        self.slots[PREVIOUS].as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.current().is_none()
    }
}

/// True when the two sets differ in size or in any code's price.
pub fn rates_differ(existing: &[RateRecord], incoming: &[RateRecord]) -> bool {
    let existing = price_map(existing);
    let incoming = price_map(incoming);

    existing.len() != incoming.len()
        || incoming
            .iter()
            .any(|(code, price)| existing.get(code) != Some(price))
}

pub struct RateCache<S> {
    store: S,
    merge_lock: Mutex<()>,
}

impl<S: KeyValueStore> RateCache<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            merge_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub async fn read_current(&self) -> Option<Generation> {
        self.read_slot(CURRENT).await
    }

    pub async fn read_previous(&self) -> Option<Generation> {
        self.read_slot(PREVIOUS).await
    }

    /// Reads every slot. A previous generation without a current one is
    /// dropped.
    pub async fn history(&self) -> History {
        let mut history = History::default();
        for index in 0..DEPTH {
            history.slots[index] = self.read_slot(index).await;
        }

        if let Some(first_gap) = history.slots.iter().position(Option::is_none) {
            if history.slots[first_gap..].iter().any(Option::is_some) {
                warn!(slot = first_gap, "Ignoring cached generations behind an empty slot");
                for slot in &mut history.slots[first_gap..] {
                    *slot = None;
                }
            }
        }
        history
    }

    /// Stores `incoming` as the current generation if it differs from what is
    /// cached, rotating the old current generation into the previous slot.
    ///
    /// Returns `true` when a new generation was persisted.
    pub async fn merge(&self, incoming: &[RateRecord]) -> bool {
        let _guard = self.merge_lock.lock().await;
        let history = self.history().await;

        let Some(current) = history.current() else {
            // Older slots may still hold data behind an unreadable current
            // slot; they must not resurface next to the fresh generation.
            if !self.clear_slots(1..DEPTH).await {
                return false;
            }
            let fresh = Generation::new(incoming.to_vec(), Utc::now());
            return self.write_slot(CURRENT, &fresh).await;
        };

        if !rates_differ(&current.rates, incoming) {
            return false;
        }

        // Oldest first, so a crash never leaves current behind previous.
        for index in (1..DEPTH).rev() {
            if let Some(older) = &history.slots[index - 1] {
                if !self.write_slot(index, older).await {
                    error!(slot = index, "Rotation failed, keeping current generation");
                    return false;
                }
            }
        }

        let fresh = Generation::new(incoming.to_vec(), Utc::now());
        let written = self.write_slot(CURRENT, &fresh).await;
        if written {
            info!(
                count = incoming.len(),
                replaced = %current.timestamp,
                "Rates changed, rotated generations"
            );
        }
        written
    }

    async fn read_slot(&self, index: usize) -> Option<Generation> {
        let keys = SLOT_KEYS[index];

        let raw = match self.store.get(keys.rates).await {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(error = %e, key = keys.rates, "Failed to read cached rates");
                return None;
            }
        };
        let rates: Vec<RateRecord> = match serde_json::from_str(&raw) {
            Ok(rates) => rates,
            Err(e) => {
                warn!(error = %e, key = keys.rates, "Ignoring malformed cached rates");
                return None;
            }
        };

        let timestamp = match self.store.get(keys.timestamp).await {
            Ok(Some(raw)) => DateTime::parse_from_rfc3339(&raw)
                .map(|t| t.with_timezone(&Utc))
                .ok(),
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, key = keys.timestamp, "Failed to read cache timestamp");
                None
            }
        };
        let timestamp = timestamp.unwrap_or_else(|| {
            warn!(key = keys.timestamp, "Cache timestamp missing, treating rates as stale");
            DateTime::<Utc>::UNIX_EPOCH
        });

        Some(Generation::new(rates, timestamp))
    }

    async fn clear_slots(&self, indices: std::ops::Range<usize>) -> bool {
        let keys: Vec<&str> = SLOT_KEYS[indices]
            .iter()
            .flat_map(|keys| [keys.rates, keys.timestamp])
            .collect();

        match self.store.remove_many(&keys).await {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "Failed to clear stale generations");
                false
            }
        }
    }

    async fn write_slot(&self, index: usize, generation: &Generation) -> bool {
        let keys = SLOT_KEYS[index];

        let rates = match serde_json::to_string(&generation.rates) {
            Ok(rates) => rates,
            Err(e) => {
                error!(error = %e, key = keys.rates, "Failed to serialize rates");
                return false;
            }
        };
        let entries = [
            (keys.rates, rates),
            (keys.timestamp, generation.timestamp.to_rfc3339()),
        ];

        match self.store.set_many(&entries).await {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, key = keys.rates, "Failed to persist generation");
                false
            }
        }
    }
}
