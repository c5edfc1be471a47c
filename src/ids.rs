//! Opaque 128-bit identifiers used across the core.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! opaque_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

opaque_id!(DsId);
opaque_id!(RequesterId);
opaque_id!(RequestId);
opaque_id!(ContractId);
opaque_id!(ObligationId);
opaque_id!(ViolationId);
opaque_id!(PlanId);
opaque_id!(CapsuleId);
opaque_id!(CertificateId);
opaque_id!(CampaignId);

/// A hex-encoded SHA-256 digest, always 64 characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hash(String);

impl Hash {
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self(hex::encode(bytes))
    }

    pub fn from_hex(s: impl Into<String>) -> Result<Self, HashFormatError> {
        let s = s.into();
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(HashFormatError);
        }
        Ok(Self(s))
    }

    pub fn zero() -> Self {
        Self("0".repeat(64))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("hash must be 64 hex characters")]
pub struct HashFormatError;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        assert_ne!(ContractId::new(), ContractId::new());
    }

    #[test]
    fn zero_hash_is_64_zero_chars() {
        assert_eq!(Hash::zero().as_str(), "0".repeat(64));
    }

    #[test]
    fn hash_from_hex_rejects_wrong_length() {
        assert!(Hash::from_hex("abc").is_err());
    }

    #[test]
    fn hash_from_bytes_round_trips_through_hex() {
        let bytes = [7u8; 32];
        let hash = Hash::from_bytes(&bytes);
        assert_eq!(hash.as_str().len(), 64);
        assert_eq!(Hash::from_hex(hash.as_str().to_string()).unwrap(), hash);
    }
}
