//! Key/value store contract used for DLR correlation records and multipart
//! reassembly, plus an in-memory implementation.
//!
//! The gateway needs only per-key idempotent operations: plain get/set with a
//! TTL, and hash-set/hash-values with a TTL on the whole hash. No cross-key
//! transactions.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("key/value store unavailable: {0}")]
    Unavailable(String),

    #[error("key '{key}' holds a {actual} value, expected {expected}")]
    WrongType {
        key: String,
        expected: &'static str,
        actual: &'static str,
    },
}

/// Store contract. All operations are idempotent per key.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    /// Set a string value with a TTL
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError>;

    /// Set one field of a hash (creating the hash if needed)
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), KvError>;

    /// All values of a hash, `None` when the key does not exist
    async fn hvals(&self, key: &str) -> Result<Option<Vec<String>>, KvError>;

    /// (Re)arm the TTL on an existing key
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), KvError>;
}

enum Value {
    Str(String),
    // BTreeMap keeps hvals deterministic for tests; callers sort anyway
    Hash(std::collections::BTreeMap<String, String>),
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// In-memory store with lazy expiry, used in tests and single-process runs.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut entries = self.entries.lock().expect("kv lock");
        if entries.get(key).is_some_and(Entry::expired) {
            entries.remove(key);
            return Ok(None);
        }
        match entries.get(key) {
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(KvError::WrongType {
                key: key.to_string(),
                expected: "string",
                actual: "hash",
            }),
            None => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError> {
        let mut entries = self.entries.lock().expect("kv lock");
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), KvError> {
        let mut entries = self.entries.lock().expect("kv lock");

        if entries.get(key).is_some_and(Entry::expired) {
            entries.remove(key);
        }

        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Hash(Default::default()),
            expires_at: None,
        });

        match &mut entry.value {
            Value::Hash(map) => {
                map.insert(field.to_string(), value.to_string());
                Ok(())
            }
            Value::Str(_) => Err(KvError::WrongType {
                key: key.to_string(),
                expected: "hash",
                actual: "string",
            }),
        }
    }

    async fn hvals(&self, key: &str) -> Result<Option<Vec<String>>, KvError> {
        let mut entries = self.entries.lock().expect("kv lock");
        if entries.get(key).is_some_and(Entry::expired) {
            entries.remove(key);
            return Ok(None);
        }
        match entries.get(key) {
            Some(Entry {
                value: Value::Hash(map),
                ..
            }) => Ok(Some(map.values().cloned().collect())),
            Some(_) => Err(KvError::WrongType {
                key: key.to_string(),
                expected: "hash",
                actual: "string",
            }),
            None => Ok(None),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), KvError> {
        let mut entries = self.entries.lock().expect("kv lock");
        if let Some(entry) = entries.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_roundtrip() {
        let kv = MemoryKv::new();
        kv.set_ex("k", "v", Duration::from_secs(60)).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(kv.get("missing").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn values_expire() {
        let kv = MemoryKv::new();
        kv.set_ex("k", "v", Duration::from_secs(5)).await.unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn hash_set_and_values() {
        let kv = MemoryKv::new();
        kv.hset("h", "2", "b").await.unwrap();
        kv.hset("h", "1", "a").await.unwrap();
        kv.expire("h", Duration::from_secs(300)).await.unwrap();

        let vals = kv.hvals("h").await.unwrap().unwrap();
        assert_eq!(vals.len(), 2);
        assert!(vals.contains(&"a".to_string()));
        assert_eq!(kv.hvals("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn hset_is_idempotent_per_field() {
        let kv = MemoryKv::new();
        kv.hset("h", "1", "a").await.unwrap();
        kv.hset("h", "1", "a").await.unwrap();

        assert_eq!(kv.hvals("h").await.unwrap().unwrap(), vec!["a".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn hash_ttl_covers_whole_hash() {
        let kv = MemoryKv::new();
        kv.hset("h", "1", "a").await.unwrap();
        kv.expire("h", Duration::from_secs(300)).await.unwrap();

        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(kv.hvals("h").await.unwrap(), None);
    }

    #[tokio::test]
    async fn type_confusion_is_an_error() {
        let kv = MemoryKv::new();
        kv.set_ex("k", "v", Duration::from_secs(60)).await.unwrap();
        assert!(matches!(
            kv.hset("k", "f", "v").await,
            Err(KvError::WrongType { .. })
        ));
    }
}
