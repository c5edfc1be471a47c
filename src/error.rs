//! Top-level error type.
//!
//! Every module owns a narrow `thiserror` enum scoped to its own concern
//! (see `crypto::CryptoError`, `consent::ConsentError`, and so on). At the
//! external-interface boundary (§6) those converge into `CoreError`, whose
//! variants are exactly the closed kind taxonomy in §7. `CoreError` never
//! downgrades a failure silently and always carries enough structure to
//! build the "reason-code vector plus plain-language description" §7 asks
//! user-visible rejections to carry.

use thiserror::Error;

use crate::audit_log::AuditError;
use crate::consent::ConsentError;
use crate::crypto::CryptoError;
use crate::nonce_registry::NonceError;
use crate::prb::PrbError;
use crate::query_plan::QueryPlanError;
use crate::secure_deletion::DeletionError;
use crate::time_capsule::CapsuleError;
use crate::vm::VmError;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("illegal state: {message}")]
    IllegalState { message: String },

    #[error("consent denied: {reason_codes:?}")]
    ConsentDenied { reason_codes: Vec<String> },

    #[error("plan rejected: {errors:?}")]
    PlanRejected { errors: Vec<String> },

    #[error("privacy risk budget exhausted: required {required}, remaining {remaining}")]
    PrbExhausted {
        required: rust_decimal::Decimal,
        remaining: rust_decimal::Decimal,
    },

    #[error("replay detected")]
    ReplayDetected,

    #[error("expired: {kind}")]
    Expired { kind: String },

    #[error("key destroyed")]
    KeyDestroyed,

    #[error("signature invalid")]
    SignatureInvalid,

    #[error("resource exceeded: {dimension}")]
    ResourceExceeded { dimension: String },

    #[error("network blocked: {destination}")]
    NetworkBlocked { destination: String },

    #[error("integrity failed: {message}")]
    IntegrityFailed { message: String },
}

impl CoreError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        CoreError::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn illegal_state(message: impl Into<String>) -> Self {
        CoreError::IllegalState {
            message: message.into(),
        }
    }

    /// The small reason-code vector §7 asks rejections to carry.
    pub fn reason_codes(&self) -> Vec<String> {
        match self {
            CoreError::InvalidArgument { .. } => vec!["INVALID_ARGUMENT".into()],
            CoreError::IllegalState { .. } => vec!["ILLEGAL_STATE".into()],
            CoreError::ConsentDenied { reason_codes } => reason_codes.clone(),
            CoreError::PlanRejected { errors } => errors.clone(),
            CoreError::PrbExhausted { .. } => vec!["PRB_EXHAUSTED".into()],
            CoreError::ReplayDetected => vec!["REPLAY_DETECTED".into()],
            CoreError::Expired { kind } => vec![format!("EXPIRED_{}", kind.to_uppercase())],
            CoreError::KeyDestroyed => vec!["KEY_DESTROYED".into()],
            CoreError::SignatureInvalid => vec!["SIGNATURE_INVALID".into()],
            CoreError::ResourceExceeded { dimension } => {
                vec![format!("RESOURCE_EXCEEDED_{}", dimension.to_uppercase())]
            }
            CoreError::NetworkBlocked { .. } => vec!["NETWORK_BLOCKED".into()],
            CoreError::IntegrityFailed { .. } => vec!["INTEGRITY_FAILED".into()],
        }
    }

    /// A plain-language description derived from the reason codes, the
    /// "immutable code table" §7 asks for.
    pub fn description(&self) -> String {
        self.to_string()
    }
}

impl From<CryptoError> for CoreError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::InvalidSignature | CryptoError::VerificationFailed(_) => {
                CoreError::SignatureInvalid
            }
            other => CoreError::invalid_argument(other.to_string()),
        }
    }
}

impl From<AuditError> for CoreError {
    fn from(err: AuditError) -> Self {
        match err {
            AuditError::BrokenChain { .. } | AuditError::SequenceMismatch { .. } => {
                CoreError::IntegrityFailed {
                    message: err.to_string(),
                }
            }
            other => CoreError::illegal_state(other.to_string()),
        }
    }
}

impl From<ConsentError> for CoreError {
    fn from(err: ConsentError) -> Self {
        match err {
            ConsentError::Denied { reason_codes } => CoreError::ConsentDenied { reason_codes },
            ConsentError::InvalidArgument(message) => CoreError::InvalidArgument { message },
            ConsentError::IllegalState(message) => CoreError::IllegalState { message },
        }
    }
}

impl From<QueryPlanError> for CoreError {
    fn from(err: QueryPlanError) -> Self {
        match err {
            QueryPlanError::Rejected { errors } => CoreError::PlanRejected { errors },
            QueryPlanError::SignatureInvalid => CoreError::SignatureInvalid,
            QueryPlanError::Expired => CoreError::Expired {
                kind: "plan_ttl".into(),
            },
            QueryPlanError::IllegalState(message) => CoreError::IllegalState { message },
            QueryPlanError::Consent(inner) => inner.into(),
        }
    }
}

impl From<VmError> for CoreError {
    fn from(err: VmError) -> Self {
        match err {
            VmError::ResourceExceeded { dimension } => CoreError::ResourceExceeded { dimension },
            VmError::NetworkBlocked { destination } => CoreError::NetworkBlocked { destination },
            VmError::PrbExhausted { required, remaining } => {
                CoreError::PrbExhausted { required, remaining }
            }
            VmError::FieldFault(message) => CoreError::illegal_state(message),
            VmError::Cancelled => CoreError::IllegalState {
                message: "execution cancelled".into(),
            },
        }
    }
}

impl From<NonceError> for CoreError {
    fn from(err: NonceError) -> Self {
        match err {
            NonceError::Reused(_) => CoreError::ReplayDetected,
            NonceError::Expired(_) => CoreError::Expired {
                kind: "nonce".into(),
            },
            NonceError::StorageError(message) => CoreError::illegal_state(message),
        }
    }
}

impl From<CapsuleError> for CoreError {
    fn from(err: CapsuleError) -> Self {
        match err {
            CapsuleError::Nonce(inner) => inner.into(),
            CapsuleError::KeyDestroyed => CoreError::KeyDestroyed,
            CapsuleError::Expired => CoreError::Expired {
                kind: "capsule".into(),
            },
            CapsuleError::IllegalState(message) => CoreError::IllegalState { message },
            CapsuleError::Crypto(inner) => inner.into(),
        }
    }
}

impl From<DeletionError> for CoreError {
    fn from(err: DeletionError) -> Self {
        match err {
            DeletionError::IllegalState(message) => CoreError::IllegalState { message },
            DeletionError::IntegrityFailed => CoreError::IntegrityFailed {
                message: "deletion certificate hash mismatch".into(),
            },
        }
    }
}

impl From<PrbError> for CoreError {
    fn from(err: PrbError) -> Self {
        match err {
            PrbError::Exhausted { required, remaining } => {
                CoreError::PrbExhausted { required, remaining }
            }
            PrbError::IllegalState(message) => CoreError::IllegalState { message },
            PrbError::InvalidArgument(message) => CoreError::InvalidArgument { message },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_codes_are_non_empty_for_every_kind() {
        let errors = vec![
            CoreError::invalid_argument("x"),
            CoreError::illegal_state("x"),
            CoreError::ConsentDenied {
                reason_codes: vec!["CONSENT_REVOKED".into()],
            },
            CoreError::ReplayDetected,
            CoreError::SignatureInvalid,
            CoreError::KeyDestroyed,
        ];
        for err in errors {
            assert!(!err.reason_codes().is_empty());
        }
    }
}
