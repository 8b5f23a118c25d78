//! Session-scoped key/value store
//!
//! Every mutation bumps a monotonic version and publishes a
//! `context_updated` event on the owning session's bus.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::{Result, RoundtableError};
use crate::events::types::CONTEXT_UPDATED;
use crate::events::{Event, SharedEventBus};

/// A stored value with its write metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub value: Value,
    /// Store version at which this entry was last written.
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<String>,
}

/// Portable form used for context save/load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub session_id: String,
    pub version: u64,
    pub entries: BTreeMap<String, ContextEntry>,
    pub taken_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    entries: BTreeMap<String, ContextEntry>,
    version: u64,
}

/// Key/value store owned by exactly one session.
pub struct ContextStore {
    session_id: String,
    inner: RwLock<Inner>,
    bus: SharedEventBus,
}

impl ContextStore {
    pub fn new(session_id: impl Into<String>, bus: SharedEventBus) -> Self {
        Self {
            session_id: session_id.into(),
            inner: RwLock::new(Inner::default()),
            bus,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.read().entries.get(key).map(|e| e.value.clone())
    }

    pub fn get_entry(&self, key: &str) -> Option<ContextEntry> {
        self.inner.read().entries.get(key).cloned()
    }

    /// Deserialize a stored value into `T`.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key) {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| RoundtableError::store(format!("key '{key}': {e}"))),
            None => Ok(None),
        }
    }

    /// Write a value, returning the new store version.
    pub fn set(&self, key: impl Into<String>, value: Value, updated_by: Option<&str>) -> u64 {
        let key = key.into();
        let version = {
            let mut inner = self.inner.write();
            inner.version += 1;
            let version = inner.version;
            inner.entries.insert(
                key.clone(),
                ContextEntry {
                    value,
                    version,
                    updated_at: Utc::now(),
                    updated_by: updated_by.map(str::to_string),
                },
            );
            version
        };
        debug!(session_id = %self.session_id, key, version, "Context key written");
        self.publish("set", Some(&key), version, updated_by);
        version
    }

    /// Serialize `value` and store it under `key`.
    pub fn set_serialized<T: Serialize>(
        &self,
        key: impl Into<String>,
        value: &T,
        updated_by: Option<&str>,
    ) -> Result<u64> {
        let value = serde_json::to_value(value)?;
        Ok(self.set(key, value, updated_by))
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        let (removed, version) = {
            let mut inner = self.inner.write();
            let removed = inner.entries.remove(key)?;
            inner.version += 1;
            (removed, inner.version)
        };
        self.publish("remove", Some(key), version, None);
        Some(removed.value)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.read().entries.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.read().entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    pub fn version(&self) -> u64 {
        self.inner.read().version
    }

    pub fn clear(&self) {
        let version = {
            let mut inner = self.inner.write();
            if inner.entries.is_empty() {
                return;
            }
            inner.entries.clear();
            inner.version += 1;
            inner.version
        };
        self.publish("clear", None, version, None);
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        let inner = self.inner.read();
        ContextSnapshot {
            session_id: self.session_id.clone(),
            version: inner.version,
            entries: inner.entries.clone(),
            taken_at: Utc::now(),
        }
    }

    /// Serialize the whole store (context save).
    pub fn export_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.snapshot())?)
    }

    /// Replace the store contents from an exported snapshot (context load).
    ///
    /// Entries are copied; the store keeps its own session id and its version
    /// continues from the higher of the two counters.
    pub fn import_json(&self, raw: &str) -> Result<usize> {
        let snapshot: ContextSnapshot = serde_json::from_str(raw)?;
        let count = snapshot.entries.len();
        let version = {
            let mut inner = self.inner.write();
            inner.version = inner.version.max(snapshot.version) + 1;
            inner.entries = snapshot.entries;
            inner.version
        };
        info!(
            session_id = %self.session_id,
            from_session = %snapshot.session_id,
            count,
            "Context imported"
        );
        self.publish("import", None, version, None);
        Ok(count)
    }

    fn publish(&self, op: &str, key: Option<&str>, version: u64, updated_by: Option<&str>) {
        self.bus.emit(
            Event::new(
                CONTEXT_UPDATED,
                json!({
                    "op": op,
                    "key": key,
                    "version": version,
                    "updated_by": updated_by,
                }),
            )
            .for_session(self.session_id.clone()),
        );
    }
}
