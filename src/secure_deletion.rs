//! Secure Deletion / crypto-shred key registry (§3, §4.5).
//!
//! Grounded on `genome.rs`'s seal-once constructor pattern for the
//! certificate itself (built once by [`SecureDeletionService::delete`],
//! then only its mutable fields move) and on `mesh_capsule`'s "destruction is
//! permanent and checkable" stance: once a key is destroyed there is no
//! path back to the plaintext, and [`DestroyedKeyRegistry::is_destroyed`]
//! lets any caller check that without needing the key itself.

use crate::ids::CertificateId;
use crate::time_capsule::CapsuleRegistry;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeletionError {
    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("deletion certificate integrity failed")]
    IntegrityFailed,
}

pub type Result<T> = std::result::Result<T, DeletionError>;

/// The method used to render a resource unrecoverable (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeletionMethod {
    /// Destroy the data-encryption key; ciphertext remains but is inert.
    CryptoShred,
    /// Physically overwrite the plaintext storage.
    Overwrite,
    /// Both, for resources where the key and the plaintext live separately.
    Both,
}

/// How a key was rendered unusable (§3 DestroyedKeyRecord.destruction_method).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DestructionMethod {
    Zeroed,
    Overwritten,
    DeletedFromHsm,
    Revoked,
}

/// What kind of key was destroyed (§3 DestroyedKeyRecord.key_type). The core
/// only ever destroys capsule data-encryption keys itself; the other
/// variants exist so a collaborator's own key hierarchy (key-encryption
/// keys, category keys, DS master keys, session keys) can be recorded in the
/// same registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyType {
    Dek,
    Kek,
    Category,
    Ds,
    Session,
}

/// §3's closed status set, walked in order by `delete` and `verify`:
/// `INITIATED -> {KEY_DESTROYED, STORAGE_DELETED} -> COMPLETED -> VERIFIED`,
/// or `FAILED` if the requested path(s) never finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeletionStatus {
    Initiated,
    KeyDestroyed,
    StorageDeleted,
    Completed,
    Verified,
    Failed,
}

/// A single destroyed key, kept only long enough to answer "was this ever
/// destroyed" — never the key material itself (§3 DestroyedKeyRecord).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestroyedKeyRecord {
    pub key_id: String,
    pub key_type: KeyType,
    pub destruction_method: DestructionMethod,
    pub resource_ref: String,
    pub destroyed_at: DateTime<Utc>,
    pub certificate_id: CertificateId,
}

/// Append-only record of every destroyed key. Checking membership here is
/// how `verify` confirms crypto-shred actually happened rather than trusting
/// a status field alone.
#[derive(Default)]
pub struct DestroyedKeyRegistry {
    destroyed: RwLock<HashMap<String, DestroyedKeyRecord>>,
}

impl DestroyedKeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        key_id: &str,
        key_type: KeyType,
        resource_ref: &str,
        method: DestructionMethod,
        certificate_id: CertificateId,
        now: DateTime<Utc>,
    ) {
        self.destroyed.write().insert(
            key_id.to_string(),
            DestroyedKeyRecord {
                key_id: key_id.to_string(),
                key_type,
                destruction_method: method,
                resource_ref: resource_ref.to_string(),
                destroyed_at: now,
                certificate_id,
            },
        );
    }

    pub fn is_destroyed(&self, key_id: &str) -> bool {
        self.destroyed.read().contains_key(key_id)
    }

    pub fn get(&self, key_id: &str) -> Option<DestroyedKeyRecord> {
        self.destroyed.read().get(key_id).cloned()
    }
}

/// A secure deletion certificate (§3). Immutable: `id`, `resource_type`,
/// `resource_id`, `method`, `initiated_at`. Mutable: `key_destroyed`,
/// `storage_deleted`, `storage_overwritten`, `status`, `completed_at`,
/// `verified_at`, `certificate_hash`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecureDeletionCertificate {
    pub id: CertificateId,
    pub resource_type: String,
    pub resource_id: String,
    pub method: DeletionMethod,
    pub key_destroyed: bool,
    pub storage_deleted: bool,
    pub storage_overwritten: bool,
    pub initiated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub verified_at: Option<DateTime<Utc>>,
    pub status: DeletionStatus,
    pub certificate_hash: String,
}

impl SecureDeletionCertificate {
    /// SHA-256 over every mutable field, the "over all mutable state" §4.5
    /// asks for. Called after every mutation, never lazily.
    fn compute_hash(&self) -> String {
        hex::encode(crate::crypto::hash_bytes(
            format!(
                "{}|{}|{}|{:?}|{}|{}|{}|{:?}|{}|{}",
                self.id,
                self.resource_type,
                self.resource_id,
                self.method,
                self.key_destroyed,
                self.storage_deleted,
                self.storage_overwritten,
                self.status,
                self.completed_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
                self.verified_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
            )
            .as_bytes(),
        ))
    }

    fn update_hash(&mut self) {
        self.certificate_hash = self.compute_hash();
    }

    /// Recompute and compare; `true` iff nothing was mutated out-of-band
    /// after the last `update_hash` call.
    pub fn verify_integrity(&self) -> bool {
        self.compute_hash() == self.certificate_hash
    }
}

struct CertificateRecord {
    certificate: SecureDeletionCertificate,
    capsule_id: Option<crate::ids::CapsuleId>,
    key_id: Option<String>,
}

/// Orchestrates destruction of a resource's key material (and, for
/// `OVERWRITE`/`BOTH`, its plaintext) and issues the resulting certificate.
/// One lock per certificate (§5), matching every other entity in the core.
pub struct SecureDeletionService {
    capsules: Arc<CapsuleRegistry>,
    registry: Arc<DestroyedKeyRegistry>,
    certificates: RwLock<HashMap<CertificateId, Mutex<CertificateRecord>>>,
    overwritten_resources: Mutex<HashSet<String>>,
}

impl SecureDeletionService {
    pub fn new(capsules: Arc<CapsuleRegistry>, registry: Arc<DestroyedKeyRegistry>) -> Self {
        SecureDeletionService {
            capsules,
            registry,
            certificates: RwLock::new(HashMap::new()),
            overwritten_resources: Mutex::new(HashSet::new()),
        }
    }

    /// `delete(resource_type, resource_id, method, capsule_id)` — runs the
    /// destruction path(s) `method` names, walking the certificate through
    /// `INITIATED -> {KEY_DESTROYED, STORAGE_DELETED} -> COMPLETED`
    /// (checkCompletion, §4.5), or leaving it `FAILED` if a requested path
    /// didn't finish.
    pub fn delete(
        &self,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        method: DeletionMethod,
        capsule_id: Option<crate::ids::CapsuleId>,
        now: DateTime<Utc>,
    ) -> Result<SecureDeletionCertificate> {
        let resource_type = resource_type.into();
        let resource_id = resource_id.into();
        let certificate_id = CertificateId::new();
        let key_id = capsule_id.map(|id| id.to_string()).unwrap_or_else(|| resource_id.clone());

        let mut certificate = SecureDeletionCertificate {
            id: certificate_id,
            resource_type,
            resource_id: resource_id.clone(),
            method,
            key_destroyed: false,
            storage_deleted: false,
            storage_overwritten: false,
            initiated_at: now,
            completed_at: None,
            verified_at: None,
            status: DeletionStatus::Initiated,
            certificate_hash: String::new(),
        };
        certificate.update_hash();

        if matches!(method, DeletionMethod::CryptoShred | DeletionMethod::Both) {
            if let Some(capsule_id) = capsule_id {
                let _ = self.capsules.destroy_key(capsule_id);
            }
            self.registry
                .record(&key_id, KeyType::Dek, &resource_id, DestructionMethod::Zeroed, certificate_id, now);
            certificate.key_destroyed = true;
            if certificate.status == DeletionStatus::Initiated {
                certificate.status = DeletionStatus::KeyDestroyed;
            }
            certificate.update_hash();
        }
        if matches!(method, DeletionMethod::Overwrite | DeletionMethod::Both) {
            self.overwritten_resources.lock().insert(resource_id.clone());
            certificate.storage_deleted = true;
            certificate.storage_overwritten = true;
            if certificate.status == DeletionStatus::Initiated {
                certificate.status = DeletionStatus::StorageDeleted;
            }
            certificate.update_hash();
        }

        if self.check_completion(method, &certificate) {
            certificate.status = DeletionStatus::Completed;
            certificate.completed_at = Some(now);
        } else {
            certificate.status = DeletionStatus::Failed;
        }
        certificate.update_hash();

        self.certificates.write().insert(
            certificate_id,
            Mutex::new(CertificateRecord {
                certificate: certificate.clone(),
                capsule_id,
                key_id: Some(key_id),
            }),
        );
        tracing::info!(certificate_id = %certificate_id, resource_id = %certificate.resource_id, "secure deletion certificate issued");
        Ok(certificate)
    }

    /// checkCompletion (§4.5): CRYPTO_SHRED complete when `key_destroyed`;
    /// OVERWRITE complete when both storage bits; BOTH when all three.
    fn check_completion(&self, method: DeletionMethod, certificate: &SecureDeletionCertificate) -> bool {
        match method {
            DeletionMethod::CryptoShred => certificate.key_destroyed,
            DeletionMethod::Overwrite => certificate.storage_deleted && certificate.storage_overwritten,
            DeletionMethod::Both => {
                certificate.key_destroyed && certificate.storage_deleted && certificate.storage_overwritten
            }
        }
    }

    /// Recompute the certificate hash from its mutable fields and compare,
    /// then — requiring `status=COMPLETED` — move it to `VERIFIED`.
    pub fn verify(&self, certificate_id: CertificateId, now: DateTime<Utc>) -> Result<SecureDeletionCertificate> {
        let certificates = self.certificates.read();
        let record = certificates
            .get(&certificate_id)
            .ok_or_else(|| DeletionError::IllegalState(format!("no such certificate {certificate_id}")))?;
        let mut guard = record.lock();

        if guard.certificate.status != DeletionStatus::Completed {
            return Err(DeletionError::IllegalState(format!(
                "cannot verify certificate in state {:?}",
                guard.certificate.status
            )));
        }
        if !guard.certificate.verify_integrity() {
            return Err(DeletionError::IntegrityFailed);
        }

        let key_still_live = match (&guard.key_id, matches!(guard.certificate.method, DeletionMethod::CryptoShred | DeletionMethod::Both)) {
            (_, false) => false,
            (Some(key_id), true) => !self.registry.is_destroyed(key_id),
            (None, true) => true,
        };
        if key_still_live {
            return Err(DeletionError::IntegrityFailed);
        }

        guard.certificate.status = DeletionStatus::Verified;
        guard.certificate.verified_at = Some(now);
        guard.certificate.update_hash();
        Ok(guard.certificate.clone())
    }

    pub fn get(&self, certificate_id: CertificateId) -> Result<SecureDeletionCertificate> {
        let certificates = self.certificates.read();
        let record = certificates
            .get(&certificate_id)
            .ok_or_else(|| DeletionError::IllegalState(format!("no such certificate {certificate_id}")))?;
        Ok(record.lock().certificate.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit_log::AuditLog;
    use crate::nonce_registry::MemoryNonceStore;

    fn service() -> (SecureDeletionService, Arc<CapsuleRegistry>) {
        let capsules = Arc::new(CapsuleRegistry::new(
            Arc::new(MemoryNonceStore::new()),
            Arc::new(AuditLog::new("node")),
        ));
        let registry = Arc::new(DestroyedKeyRegistry::new());
        (SecureDeletionService::new(capsules.clone(), registry), capsules)
    }

    #[test]
    fn crypto_shred_destroys_the_capsule_key() {
        let (service, capsules) = service();
        let now = Utc::now();
        let capsule = capsules.seal(b"secret", 3600, now).unwrap();
        let certificate = service
            .delete("capsule", capsule.id.to_string(), DeletionMethod::CryptoShred, Some(capsule.id), now)
            .unwrap();
        assert_eq!(certificate.status, DeletionStatus::Completed);
        assert!(certificate.key_destroyed);
        assert!(capsules.is_key_destroyed(capsule.id).unwrap());
    }

    #[test]
    fn verify_succeeds_after_completion() {
        let (service, capsules) = service();
        let now = Utc::now();
        let capsule = capsules.seal(b"secret", 3600, now).unwrap();
        let certificate = service
            .delete("capsule", capsule.id.to_string(), DeletionMethod::CryptoShred, Some(capsule.id), now)
            .unwrap();
        let verified = service.verify(certificate.id, now).unwrap();
        assert_eq!(verified.status, DeletionStatus::Verified);
        assert!(verified.verify_integrity());
    }

    #[test]
    fn both_method_requires_overwrite_and_shred() {
        let (service, _capsules) = service();
        let now = Utc::now();
        let certificate = service
            .delete("account", "resource-without-capsule", DeletionMethod::Both, None, now)
            .unwrap();
        assert_eq!(certificate.status, DeletionStatus::Completed);
        assert!(certificate.key_destroyed && certificate.storage_deleted && certificate.storage_overwritten);
    }

    #[test]
    fn tampering_with_booleans_breaks_verification() {
        let (service, capsules) = service();
        let now = Utc::now();
        let capsule = capsules.seal(b"secret", 3600, now).unwrap();
        let certificate = service
            .delete("capsule", capsule.id.to_string(), DeletionMethod::CryptoShred, Some(capsule.id), now)
            .unwrap();
        {
            let certificates = service.certificates.read();
            let mut guard = certificates.get(&certificate.id).unwrap().lock();
            guard.certificate.storage_overwritten = true;
        }
        let err = service.verify(certificate.id, now).unwrap_err();
        assert!(matches!(err, DeletionError::IntegrityFailed));
    }

    #[test]
    fn verify_before_completion_is_illegal_state() {
        let (service, _capsules) = service();
        let now = Utc::now();
        let certificate = SecureDeletionCertificate {
            id: CertificateId::new(),
            resource_type: "capsule".into(),
            resource_id: "r".into(),
            method: DeletionMethod::CryptoShred,
            key_destroyed: false,
            storage_deleted: false,
            storage_overwritten: false,
            initiated_at: now,
            completed_at: None,
            verified_at: None,
            status: DeletionStatus::Initiated,
            certificate_hash: String::new(),
        };
        service.certificates.write().insert(
            certificate.id,
            Mutex::new(CertificateRecord {
                certificate,
                capsule_id: None,
                key_id: None,
            }),
        );
        let certificate_id = *service.certificates.read().keys().next().unwrap();
        let err = service.verify(certificate_id, now).unwrap_err();
        assert!(matches!(err, DeletionError::IllegalState(_)));
    }
}
