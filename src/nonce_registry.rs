//! At-most-once capsule access (§3 NonceRegistry entry, §4.4).
//!
//! Grounded on `nonce_store.rs`'s pluggable-backend shape (`NonceStore`
//! trait, in-memory default, optional RocksDB/Redis backends selected by
//! Cargo feature), generalized from a bare `(timestamp, ttl)` tuple to the
//! richer [`NonceEntry`] record §3 asks for: a nonce is bound to one
//! capsule and carries its own lifecycle independent of the capsule's.

use crate::ids::CapsuleId;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NonceError {
    #[error("nonce already used: {0}")]
    Reused(String),

    #[error("nonce expired: {0}")]
    Expired(String),

    #[error("nonce storage error: {0}")]
    StorageError(String),
}

pub type Result<T> = std::result::Result<T, NonceError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NonceStatus {
    Active,
    Used,
    Expired,
}

/// A single nonce registry record (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NonceEntry {
    pub nonce: String,
    pub capsule_id: CapsuleId,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    pub status: NonceStatus,
}

/// Pluggable nonce registry backend. Implementations must make `register`
/// and `consume` atomic check-and-set operations — the race this guards
/// against is two concurrent accesses to the same capsule both observing
/// `Active` before either writes `Used`.
pub trait NonceStore: Send + Sync {
    /// Insert a fresh, `Active` entry. Fails if the nonce already exists —
    /// this is how [`crate::time_capsule`] enforces nonce uniqueness on
    /// capsule creation.
    fn register(&self, nonce: &str, capsule_id: CapsuleId, expires_at: DateTime<Utc>) -> Result<()>;

    /// Atomically consume a nonce: succeeds and marks it `Used` iff it is
    /// currently `Active` and unexpired; otherwise returns the failure
    /// without mutating anything.
    fn consume(&self, nonce: &str, now: DateTime<Utc>) -> Result<NonceEntry>;

    fn lookup(&self, nonce: &str) -> Option<NonceEntry>;

    /// Mark every `Active` entry whose `expires_at <= now` as `Expired`,
    /// returning the count transitioned.
    fn expire_sweep(&self, now: DateTime<Utc>) -> usize;
}

/// In-memory nonce registry. The default backend (`memory-nonce-store`
/// feature) and what every test in this crate uses.
#[derive(Default)]
pub struct MemoryNonceStore {
    entries: Mutex<HashMap<String, NonceEntry>>,
}

impl MemoryNonceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NonceStore for MemoryNonceStore {
    fn register(&self, nonce: &str, capsule_id: CapsuleId, expires_at: DateTime<Utc>) -> Result<()> {
        let mut entries = self.entries.lock();
        if entries.contains_key(nonce) {
            return Err(NonceError::Reused(nonce.to_string()));
        }
        entries.insert(
            nonce.to_string(),
            NonceEntry {
                nonce: nonce.to_string(),
                capsule_id,
                created_at: Utc::now(),
                expires_at,
                used_at: None,
                status: NonceStatus::Active,
            },
        );
        Ok(())
    }

    fn consume(&self, nonce: &str, now: DateTime<Utc>) -> Result<NonceEntry> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(nonce)
            .ok_or_else(|| NonceError::StorageError(format!("unknown nonce {nonce}")))?;

        match entry.status {
            NonceStatus::Used => return Err(NonceError::Reused(nonce.to_string())),
            NonceStatus::Expired => return Err(NonceError::Expired(nonce.to_string())),
            NonceStatus::Active => {}
        }
        if now > entry.expires_at {
            entry.status = NonceStatus::Expired;
            return Err(NonceError::Expired(nonce.to_string()));
        }

        entry.status = NonceStatus::Used;
        entry.used_at = Some(now);
        Ok(entry.clone())
    }

    fn lookup(&self, nonce: &str) -> Option<NonceEntry> {
        self.entries.lock().get(nonce).cloned()
    }

    fn expire_sweep(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.lock();
        let mut count = 0;
        for entry in entries.values_mut() {
            if entry.status == NonceStatus::Active && now > entry.expires_at {
                entry.status = NonceStatus::Expired;
                count += 1;
            }
        }
        count
    }
}

/// Generate a fresh 64-character hex nonce (§3: "64-char unique").
pub fn generate_nonce_hex() -> String {
    hex::encode(crate::crypto::generate_nonce())
}

#[cfg(feature = "rocksdb-nonce-store")]
pub mod rocksdb_backend {
    //! Persistent nonce registry. Nonces must survive process restart so a
    //! capsule's at-most-once guarantee holds across a device reboot, not
    //! just within one process lifetime.
    use super::*;
    use rocksdb::{IteratorMode, Options, DB};

    pub struct RocksDbNonceStore {
        db: DB,
    }

    impl RocksDbNonceStore {
        pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
            let mut opts = Options::default();
            opts.create_if_missing(true);
            let db = DB::open(&opts, path).map_err(|e| NonceError::StorageError(e.to_string()))?;
            Ok(RocksDbNonceStore { db })
        }

        fn get(&self, nonce: &str) -> Result<Option<NonceEntry>> {
            match self
                .db
                .get(nonce.as_bytes())
                .map_err(|e| NonceError::StorageError(e.to_string()))?
            {
                Some(bytes) => Ok(Some(
                    serde_json::from_slice(&bytes)
                        .map_err(|e| NonceError::StorageError(e.to_string()))?,
                )),
                None => Ok(None),
            }
        }

        fn put(&self, entry: &NonceEntry) -> Result<()> {
            let bytes =
                serde_json::to_vec(entry).map_err(|e| NonceError::StorageError(e.to_string()))?;
            self.db
                .put(entry.nonce.as_bytes(), bytes)
                .map_err(|e| NonceError::StorageError(e.to_string()))
        }
    }

    impl NonceStore for RocksDbNonceStore {
        fn register(
            &self,
            nonce: &str,
            capsule_id: CapsuleId,
            expires_at: DateTime<Utc>,
        ) -> Result<()> {
            if self.get(nonce)?.is_some() {
                return Err(NonceError::Reused(nonce.to_string()));
            }
            self.put(&NonceEntry {
                nonce: nonce.to_string(),
                capsule_id,
                created_at: Utc::now(),
                expires_at,
                used_at: None,
                status: NonceStatus::Active,
            })
        }

        fn consume(&self, nonce: &str, now: DateTime<Utc>) -> Result<NonceEntry> {
            let mut entry = self
                .get(nonce)?
                .ok_or_else(|| NonceError::StorageError(format!("unknown nonce {nonce}")))?;
            match entry.status {
                NonceStatus::Used => return Err(NonceError::Reused(nonce.to_string())),
                NonceStatus::Expired => return Err(NonceError::Expired(nonce.to_string())),
                NonceStatus::Active => {}
            }
            if now > entry.expires_at {
                entry.status = NonceStatus::Expired;
                self.put(&entry)?;
                return Err(NonceError::Expired(nonce.to_string()));
            }
            entry.status = NonceStatus::Used;
            entry.used_at = Some(now);
            self.put(&entry)?;
            Ok(entry)
        }

        fn lookup(&self, nonce: &str) -> Option<NonceEntry> {
            self.get(nonce).ok().flatten()
        }

        fn expire_sweep(&self, now: DateTime<Utc>) -> usize {
            let mut count = 0;
            let iter = self.db.iterator(IteratorMode::Start);
            for item in iter.flatten() {
                if let Ok(mut entry) = serde_json::from_slice::<NonceEntry>(&item.1) {
                    if entry.status == NonceStatus::Active && now > entry.expires_at {
                        entry.status = NonceStatus::Expired;
                        if self.put(&entry).is_ok() {
                            count += 1;
                        }
                    }
                }
            }
            count
        }
    }
}

#[cfg(feature = "redis-nonce-store")]
pub mod redis_backend {
    //! Distributed nonce registry for deployments where more than one
    //! on-device process shares a capsule's at-most-once guarantee
    //! (e.g. a primary process plus a background sync worker).
    use super::*;
    use redis::Commands;

    pub struct RedisNonceStore {
        client: redis::Client,
        key_prefix: String,
    }

    impl RedisNonceStore {
        pub fn connect(redis_url: &str, key_prefix: impl Into<String>) -> Result<Self> {
            let client =
                redis::Client::open(redis_url).map_err(|e| NonceError::StorageError(e.to_string()))?;
            Ok(RedisNonceStore {
                client,
                key_prefix: key_prefix.into(),
            })
        }

        fn key(&self, nonce: &str) -> String {
            format!("{}{}", self.key_prefix, nonce)
        }
    }

    impl NonceStore for RedisNonceStore {
        fn register(
            &self,
            nonce: &str,
            capsule_id: CapsuleId,
            expires_at: DateTime<Utc>,
        ) -> Result<()> {
            let mut con = self
                .client
                .get_connection()
                .map_err(|e| NonceError::StorageError(e.to_string()))?;
            let entry = NonceEntry {
                nonce: nonce.to_string(),
                capsule_id,
                created_at: Utc::now(),
                expires_at,
                used_at: None,
                status: NonceStatus::Active,
            };
            let payload =
                serde_json::to_string(&entry).map_err(|e| NonceError::StorageError(e.to_string()))?;
            let ttl = (expires_at - Utc::now()).num_seconds().max(1) as usize;
            let set: bool = redis::cmd("SET")
                .arg(self.key(nonce))
                .arg(payload)
                .arg("NX")
                .arg("EX")
                .arg(ttl)
                .query(&mut con)
                .map_err(|e| NonceError::StorageError(e.to_string()))?;
            if !set {
                return Err(NonceError::Reused(nonce.to_string()));
            }
            Ok(())
        }

        fn consume(&self, nonce: &str, now: DateTime<Utc>) -> Result<NonceEntry> {
            let mut con = self
                .client
                .get_connection()
                .map_err(|e| NonceError::StorageError(e.to_string()))?;
            let raw: Option<String> = con
                .get(self.key(nonce))
                .map_err(|e| NonceError::StorageError(e.to_string()))?;
            let mut entry: NonceEntry = match raw {
                Some(raw) => {
                    serde_json::from_str(&raw).map_err(|e| NonceError::StorageError(e.to_string()))?
                }
                None => return Err(NonceError::StorageError(format!("unknown nonce {nonce}"))),
            };
            match entry.status {
                NonceStatus::Used => return Err(NonceError::Reused(nonce.to_string())),
                NonceStatus::Expired => return Err(NonceError::Expired(nonce.to_string())),
                NonceStatus::Active => {}
            }
            if now > entry.expires_at {
                return Err(NonceError::Expired(nonce.to_string()));
            }
            entry.status = NonceStatus::Used;
            entry.used_at = Some(now);
            let payload =
                serde_json::to_string(&entry).map_err(|e| NonceError::StorageError(e.to_string()))?;
            let _: () = con
                .set(self.key(nonce), payload)
                .map_err(|e| NonceError::StorageError(e.to_string()))?;
            Ok(entry)
        }

        fn lookup(&self, nonce: &str) -> Option<NonceEntry> {
            let mut con = self.client.get_connection().ok()?;
            let raw: Option<String> = con.get(self.key(nonce)).ok()?;
            raw.and_then(|raw| serde_json::from_str(&raw).ok())
        }

        fn expire_sweep(&self, _now: DateTime<Utc>) -> usize {
            // Redis enforces expiry natively via the key TTL set in `register`.
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn first_consume_succeeds_second_replays() {
        let store = MemoryNonceStore::new();
        let nonce = generate_nonce_hex();
        let capsule_id = CapsuleId::new();
        let expires_at = Utc::now() + Duration::hours(1);
        store.register(&nonce, capsule_id, expires_at).unwrap();

        assert!(store.consume(&nonce, Utc::now()).is_ok());
        let err = store.consume(&nonce, Utc::now()).unwrap_err();
        assert!(matches!(err, NonceError::Reused(_)));
    }

    #[test]
    fn register_rejects_duplicate_nonce() {
        let store = MemoryNonceStore::new();
        let nonce = generate_nonce_hex();
        let expires_at = Utc::now() + Duration::hours(1);
        store.register(&nonce, CapsuleId::new(), expires_at).unwrap();
        let err = store
            .register(&nonce, CapsuleId::new(), expires_at)
            .unwrap_err();
        assert!(matches!(err, NonceError::Reused(_)));
    }

    #[test]
    fn consume_after_expiry_fails() {
        let store = MemoryNonceStore::new();
        let nonce = generate_nonce_hex();
        let expires_at = Utc::now() - Duration::seconds(1);
        store.register(&nonce, CapsuleId::new(), expires_at).unwrap();
        let err = store.consume(&nonce, Utc::now()).unwrap_err();
        assert!(matches!(err, NonceError::Expired(_)));
    }

    #[test]
    fn expire_sweep_marks_stale_active_entries() {
        let store = MemoryNonceStore::new();
        let nonce = generate_nonce_hex();
        let expires_at = Utc::now() - Duration::seconds(1);
        store.register(&nonce, CapsuleId::new(), expires_at).unwrap();
        let swept = store.expire_sweep(Utc::now());
        assert_eq!(swept, 1);
        assert_eq!(store.lookup(&nonce).unwrap().status, NonceStatus::Expired);
    }

    #[test]
    fn generated_nonces_are_64_hex_chars() {
        let nonce = generate_nonce_hex();
        assert_eq!(nonce.len(), 64);
        assert!(nonce.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
