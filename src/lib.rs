//! # consent_core — on-device consent and query enforcement core
//!
//! The local enforcement core of a personal-data brokerage platform. A Data
//! Sovereign (DS) holds raw data on-device; external Requesters submit
//! signed data requests; upon DS consent a signed, sandboxed query plan
//! executes against local data and its output is packaged into a
//! time-limited encrypted capsule.
//!
//! ## Guarantees
//!
//! - Every disclosure is covered by an active, fresh [`consent`] contract.
//! - Every execution is constrained by an allowlisted operator set, declared
//!   fields, and resource limits with no network egress (see [`vm`]).
//! - Every outcome leaves a hash-chained, locally verifiable [`audit_log`]
//!   entry and a crypto-shreddable secret (see [`secure_deletion`]).
//! - Every replay or tamper attempt fails closed.
//!
//! ## Layout
//!
//! Leaf utilities ([`ids`], [`actor`], [`canonicalize`], [`crypto`],
//! [`policy`]) back the seven subsystems: [`consent`], [`query_plan`],
//! [`vm`], [`time_capsule`] + [`nonce_registry`], [`secure_deletion`],
//! [`audit_log`], [`prb`]. [`api`] is the thin facade a UI/transport/storage
//! collaborator drives; it owns no policy of its own, it only wires the
//! subsystems together per the external-interface list this core exposes.
//!
//! Persistence, transport, requester reputation, device enrollment, and the
//! end-user UX surfaces are out of scope — this crate treats them as
//! external collaborators and models only the shape of what it hands them
//! or expects back (see [`api::ConsentCore`]).
//!
//! ## Example
//!
//! ```rust
//! use consent_core::{ConsentCore, CoreConfig, DataRequest};
//! use consent_core::query_plan::AllowedOp;
//! use consent_core::ids::{CampaignId, DsId, RequesterId};
//! use std::collections::BTreeSet;
//!
//! let core = ConsentCore::new(CoreConfig::default());
//! let campaign_id = CampaignId::new();
//! let request_id = core.submit_request(DataRequest {
//!     ds_id: DsId::new(),
//!     requester_id: RequesterId::new(),
//!     campaign_id,
//!     purpose_hash: "purpose-1".to_string(),
//!     scope_hash: "scope-1".to_string(),
//!     requested_fields: BTreeSet::from(["steps".to_string()]),
//!     proposed_steps: vec![AllowedOp::Select { fields: BTreeSet::from(["steps".to_string()]) }],
//! });
//! let preview = core.quote_prb(request_id).unwrap();
//! assert!(preview.total_cost >= Default::default());
//! ```

pub mod actor;
pub mod api;
pub mod audit_log;
pub mod canonicalize;
pub mod consent;
pub mod crypto;
pub mod error;
pub mod ids;
pub mod nonce_registry;
pub mod policy;
pub mod prb;
pub mod query_plan;
pub mod secure_deletion;
pub mod time_capsule;
pub mod vm;

pub use api::{BudgetPreview, ConsentCore, CoreConfig, DataRequest, Denied, ExecutionResult};
pub use error::CoreError;

/// Version of the consent core crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
