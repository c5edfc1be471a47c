//! Time Capsules: sealed, nonce-gated, single-access payload delivery (§3, §4.4).
//!
//! Grounded on `mesh_capsule::MutationGuard`'s dead-man's-switch shape: a
//! capsule holds its own destruction state and refuses to hand back
//! plaintext once that state flips, the same way the guard refuses access
//! once `breached` is set. Where that guard protects against tamper, this
//! capsule guards against replay (the nonce registry) and key destruction
//! (crypto-shred, §4.5) instead of a canary value.

use crate::audit_log::{AuditEvent, AuditLog};
use crate::crypto::{generate_nonce, CryptoError};
use crate::ids::CapsuleId;
use crate::nonce_registry::{generate_nonce_hex, NonceError, NonceStore};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use zeroize::Zeroize;

#[derive(Debug, Error)]
pub enum CapsuleError {
    #[error(transparent)]
    Nonce(#[from] NonceError),

    #[error("capsule key destroyed")]
    KeyDestroyed,

    #[error("capsule expired")]
    Expired,

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

pub type Result<T> = std::result::Result<T, CapsuleError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CapsuleStatus {
    Created,
    Delivered,
    Expired,
    Deleted,
}

/// Public view of a capsule. Never carries key material or ciphertext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeCapsule {
    pub id: CapsuleId,
    pub nonce: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: CapsuleStatus,
}

/// The 32-byte data-encryption key, zeroized on drop and on crypto-shred.
struct DekGuard([u8; 32]);

impl Drop for DekGuard {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

struct CapsuleRecord {
    meta: TimeCapsule,
    dek: Option<DekGuard>,
    aead_nonce: [u8; 12],
    ciphertext: Vec<u8>,
}

/// Owns every sealed capsule and the single-use nonce that gates its one
/// allowed access. One mutex per capsule (§5): `deliver`/`access`/
/// `expire_sweep` each touch only the record(s) they need.
pub struct CapsuleRegistry {
    capsules: RwLock<HashMap<CapsuleId, Arc<Mutex<CapsuleRecord>>>>,
    nonce_store: Arc<dyn NonceStore>,
    audit_log: Arc<AuditLog>,
}

impl CapsuleRegistry {
    pub fn new(nonce_store: Arc<dyn NonceStore>, audit_log: Arc<AuditLog>) -> Self {
        CapsuleRegistry {
            capsules: RwLock::new(HashMap::new()),
            nonce_store,
            audit_log,
        }
    }

    /// `seal(payload, ttl_secs)` — generates a fresh DEK and single-use
    /// nonce, encrypts with ChaCha20-Poly1305, registers the nonce, and
    /// returns the sealed capsule's public metadata plus the nonce the
    /// recipient must present to `access`.
    pub fn seal(&self, payload: &[u8], ttl_secs: i64, now: DateTime<Utc>) -> Result<TimeCapsule> {
        let capsule_id = CapsuleId::new();
        let nonce_hex = generate_nonce_hex();
        let expires_at = now + Duration::seconds(ttl_secs);

        let dek_bytes = generate_nonce();
        let aead_nonce_bytes: [u8; 12] = {
            let mut buf = [0u8; 12];
            buf.copy_from_slice(&generate_nonce()[0..12]);
            buf
        };
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&dek_bytes));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&aead_nonce_bytes), payload)
            .map_err(|_| CryptoError::SigningFailed("capsule encryption failed".into()))?;

        self.nonce_store.register(&nonce_hex, capsule_id, expires_at)?;

        let meta = TimeCapsule {
            id: capsule_id,
            nonce: nonce_hex.clone(),
            created_at: now,
            expires_at,
            status: CapsuleStatus::Created,
        };
        self.capsules.write().insert(
            capsule_id,
            Arc::new(Mutex::new(CapsuleRecord {
                meta: meta.clone(),
                dek: Some(DekGuard(dek_bytes)),
                aead_nonce: aead_nonce_bytes,
                ciphertext,
            })),
        );

        self.audit_log.append(AuditEvent::CapsuleCreated {
            capsule_id,
            nonce: nonce_hex,
        })?;
        tracing::info!(capsule_id = %capsule_id, "time capsule sealed");
        Ok(meta)
    }

    fn record(&self, id: CapsuleId) -> Result<Arc<Mutex<CapsuleRecord>>> {
        self.capsules
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| CapsuleError::IllegalState(format!("no such capsule {id}")))
    }

    pub fn get(&self, id: CapsuleId) -> Result<TimeCapsule> {
        Ok(self.record(id)?.lock().meta.clone())
    }

    /// `CREATED -> DELIVERED`, meaning the capsule has left the device.
    pub fn deliver(&self, id: CapsuleId) -> Result<()> {
        let record = self.record(id)?;
        {
            let mut guard = record.lock();
            if guard.meta.status != CapsuleStatus::Created {
                return Err(CapsuleError::IllegalState(format!(
                    "cannot deliver capsule in state {:?}",
                    guard.meta.status
                )));
            }
            guard.meta.status = CapsuleStatus::Delivered;
        }
        self.audit_log
            .append(AuditEvent::CapsuleDelivered { capsule_id: id })?;
        Ok(())
    }

    /// `access(id, nonce, now)` — consumes the single-use nonce, checks
    /// expiry and key liveness, and decrypts. Single-use is enforced by the
    /// nonce registry, not by a capsule status transition: `status` has no
    /// terminal "accessed" state of its own (§3), so a successful access
    /// leaves `CREATED`/`DELIVERED` as it found it. Every failure path
    /// still leaves the capsule's audit trail intact: a replayed nonce is
    /// reported by the nonce registry, not swallowed here.
    pub fn access(&self, id: CapsuleId, nonce: &str, now: DateTime<Utc>) -> Result<Vec<u8>> {
        let record = self.record(id)?;
        let mut guard = record.lock();

        if guard.meta.status == CapsuleStatus::Expired || now >= guard.meta.expires_at {
            return Err(CapsuleError::Expired);
        }
        if guard.dek.is_none() {
            return Err(CapsuleError::KeyDestroyed);
        }
        if !matches!(guard.meta.status, CapsuleStatus::Created | CapsuleStatus::Delivered) {
            return Err(CapsuleError::IllegalState(format!(
                "cannot access capsule in state {:?}",
                guard.meta.status
            )));
        }

        self.nonce_store.consume(nonce, now)?;

        let dek = guard.dek.as_ref().ok_or(CapsuleError::KeyDestroyed)?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&dek.0));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&guard.aead_nonce), guard.ciphertext.as_ref())
            .map_err(|_| CryptoError::VerificationFailed("capsule decryption failed".into()))?;

        drop(guard);
        self.audit_log
            .append(AuditEvent::CapsuleAccessed { capsule_id: id })?;
        Ok(plaintext)
    }

    /// Permanently destroys the data-encryption key for `id` and moves
    /// `status` to the terminal `DELETED` state, called by secure
    /// deletion's crypto-shred path (§4.5). Idempotent.
    pub fn destroy_key(&self, id: CapsuleId) -> Result<()> {
        let record = self.record(id)?;
        let mut guard = record.lock();
        guard.dek = None;
        guard.meta.status = CapsuleStatus::Deleted;
        Ok(())
    }

    pub fn is_key_destroyed(&self, id: CapsuleId) -> Result<bool> {
        Ok(self.record(id)?.lock().dek.is_none())
    }

    /// Marks every non-terminal capsule past `expires_at` as `EXPIRED`.
    pub fn expire_sweep(&self, now: DateTime<Utc>) -> Result<u64> {
        let ids: Vec<CapsuleId> = {
            let capsules = self.capsules.read();
            capsules
                .iter()
                .filter_map(|(id, record)| {
                    let guard = record.lock();
                    let is_terminal =
                        matches!(guard.meta.status, CapsuleStatus::Expired | CapsuleStatus::Deleted);
                    if !is_terminal && guard.meta.expires_at <= now {
                        Some(*id)
                    } else {
                        None
                    }
                })
                .collect()
        };
        for id in &ids {
            if let Some(record) = self.capsules.read().get(id).cloned() {
                record.lock().meta.status = CapsuleStatus::Expired;
            }
            self.audit_log
                .append(AuditEvent::CapsuleExpired { capsule_id: *id })?;
        }
        Ok(ids.len() as u64)
    }

    /// Capsules still `EXPIRED` once `grace_secs` has elapsed since their
    /// `expires_at` — the set the expiry sweep hands to secure deletion's
    /// crypto-shred path next (§4.4 grace period).
    pub fn expired_past_grace(&self, grace_secs: i64, now: DateTime<Utc>) -> Vec<CapsuleId> {
        self.capsules
            .read()
            .iter()
            .filter_map(|(id, record)| {
                let guard = record.lock();
                if guard.meta.status == CapsuleStatus::Expired
                    && now >= guard.meta.expires_at + Duration::seconds(grace_secs)
                {
                    Some(*id)
                } else {
                    None
                }
            })
            .collect()
    }
}

impl From<crate::audit_log::AuditError> for CapsuleError {
    fn from(err: crate::audit_log::AuditError) -> Self {
        CapsuleError::IllegalState(err.to_string())
    }
}
