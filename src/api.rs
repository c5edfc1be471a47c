//! External-interface facade (§6).
//!
//! Grounded on `hope_core::lib.rs`'s top-level re-export style: one thin
//! function per capability, all internal state (the consent engine, the
//! capsule registry, the key store, every PRB) held behind a single struct
//! so a UI/transport/storage collaborator never touches the subsystem
//! internals directly. Every method here either returns `Ok` or a
//! [`CoreError`] — nothing downgrades silently, matching §7's fail-closed
//! propagation policy.

use crate::actor::Actor;
use crate::audit_log::{AuditEvent, AuditExport, AuditLog};
use crate::consent::{ConsentContract, ConsentEngine, DeliveryMode, EnforcementLevel, ObligationKind};
use crate::error::CoreError;
use crate::ids::{CampaignId, CapsuleId, ContractId, DsId, RequestId, RequesterId};
use crate::nonce_registry::{MemoryNonceStore, NonceStore};
use crate::policy::PolicyConfig;
use crate::prb::{PrbSnapshot, PrivacyRiskBudget};
use crate::query_plan::{draft_plan, AllowedOp, PlanValidator, QueryPlan};
use crate::secure_deletion::{DeletionMethod, DestroyedKeyRegistry, SecureDeletionCertificate, SecureDeletionService};
use crate::time_capsule::{CapsuleRegistry, TimeCapsule};
use crate::vm::{PlanVm, Row, StepPreview};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// What a Requester submits (§2 flow: "a Requester submits a request
/// referencing a purpose, scope and fields"). The payload attribute schema
/// itself is an out-of-scope collaborator concern (§1); the core only needs
/// enough structure to build a consent contract and preview its cost.
#[derive(Debug, Clone)]
pub struct DataRequest {
    pub ds_id: DsId,
    pub requester_id: RequesterId,
    pub campaign_id: CampaignId,
    pub purpose_hash: String,
    pub scope_hash: String,
    pub requested_fields: BTreeSet<String>,
    pub proposed_steps: Vec<AllowedOp>,
}

struct SubmittedRequest {
    request: DataRequest,
}

/// A cost estimate for a request's proposed steps, computed without
/// touching any data (§4.3 preview mode, §6 `quote_prb`).
pub struct BudgetPreview {
    pub total_cost: Decimal,
    pub steps: Vec<StepPreview>,
}

/// What `execute_plan` (§6) returns: the transformed output, a summary of
/// resource usage, and the PRB actually charged.
pub struct ExecutionResult {
    pub output: Vec<Row>,
    pub capsule_payload: Option<Vec<u8>>,
    pub steps_executed: u32,
    pub prb_charged: Decimal,
}

/// What `access_capsule` (§6) returns on a rejected access.
#[derive(Debug)]
pub struct Denied {
    pub reason: String,
}

/// Construction parameters for [`ConsentCore`]. `node_id` identifies this
/// device in the audit log (§3 AuditEntry.node_id); `policy` supplies every
/// collaborator-tunable threshold (§5, §9).
pub struct CoreConfig {
    pub node_id: String,
    pub policy: PolicyConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            node_id: "device-0".to_string(),
            policy: PolicyConfig::default(),
        }
    }
}

/// The on-device consent and query enforcement core (§1). Owns every
/// subsystem named in §2's component table and exposes exactly the external
/// interface §6 lists; nothing else is public.
pub struct ConsentCore {
    policy: PolicyConfig,
    audit_log: Arc<AuditLog>,
    consent: ConsentEngine,
    capsules: Arc<CapsuleRegistry>,
    deletion: SecureDeletionService,
    key_store: Box<dyn crate::crypto::KeyStore>,
    requests: parking_lot::RwLock<HashMap<RequestId, SubmittedRequest>>,
    campaign_of_contract: parking_lot::RwLock<HashMap<ContractId, CampaignId>>,
    prbs: parking_lot::RwLock<HashMap<CampaignId, Arc<PrivacyRiskBudget>>>,
}

impl ConsentCore {
    /// Build a core with the default in-memory nonce registry
    /// (`memory-nonce-store` feature) and a fresh software-backed key store.
    pub fn new(config: CoreConfig) -> Self {
        Self::with_nonce_store(config, Arc::new(MemoryNonceStore::new()))
    }

    /// Build a core over a collaborator-chosen nonce registry backend (e.g.
    /// `rocksdb-nonce-store` for cross-restart persistence).
    pub fn with_nonce_store(config: CoreConfig, nonce_store: Arc<dyn NonceStore>) -> Self {
        let audit_log = Arc::new(AuditLog::new(config.node_id));
        let consent = ConsentEngine::new(audit_log.clone(), config.policy.revocation_visibility_secs);
        let capsules = Arc::new(CapsuleRegistry::new(nonce_store, audit_log.clone()));
        let destroyed_keys = Arc::new(DestroyedKeyRegistry::new());
        let deletion = SecureDeletionService::new(capsules.clone(), destroyed_keys);
        ConsentCore {
            policy: config.policy,
            audit_log,
            consent,
            capsules,
            deletion,
            key_store: Box::new(crate::crypto::SoftwareKeyStore::generate()),
            requests: parking_lot::RwLock::new(HashMap::new()),
            campaign_of_contract: parking_lot::RwLock::new(HashMap::new()),
            prbs: parking_lot::RwLock::new(HashMap::new()),
        }
    }

    pub fn audit_log(&self) -> &Arc<AuditLog> {
        &self.audit_log
    }

    /// `submit_request(request) → request_id` (§6).
    pub fn submit_request(&self, request: DataRequest) -> RequestId {
        let request_id = RequestId::new();
        self.requests
            .write()
            .insert(request_id, SubmittedRequest { request });
        request_id
    }

    fn request(&self, request_id: RequestId) -> Result<DataRequest, CoreError> {
        self.requests
            .read()
            .get(&request_id)
            .map(|r| r.request.clone())
            .ok_or_else(|| CoreError::invalid_argument(format!("no such request {request_id}")))
    }

    /// `quote_prb(request) → budget_preview` (§6). Runs the VM's preview
    /// mode over the request's proposed steps; no contract needs to exist
    /// yet and no data is touched.
    pub fn quote_prb(&self, request_id: RequestId) -> Result<BudgetPreview, CoreError> {
        let request = self.request(request_id)?;
        let draft = draft_plan(
            ContractId::new(),
            request.scope_hash.clone(),
            request.proposed_steps.clone(),
            BTreeSet::new(),
            self.policy.resource_limits.clone(),
            self.policy.plan_max_ttl_secs,
            Utc::now(),
        );
        let vm = PlanVm::new(&self.policy);
        let steps = vm.preview(&draft);
        let total_cost = steps
            .iter()
            .fold(Decimal::ZERO, |acc, s| acc + self.policy.cost_for(s.operator));
        Ok(BudgetPreview { total_cost, steps })
    }

    /// Grant consent for `request_id` (DS acceptance is an out-of-scope UI
    /// concern per §1; this is the point where the core takes over). Wraps
    /// `ConsentEngine::create` (§4.1) and remembers the contract's campaign
    /// for later PRB lookups during execution.
    #[allow(clippy::too_many_arguments)]
    pub fn create_consent(
        &self,
        request_id: RequestId,
        duration_start: DateTime<Utc>,
        duration_end: DateTime<Utc>,
        compensation: Decimal,
        permitted_fields: BTreeSet<String>,
        sensitive_field_consents: HashMap<String, bool>,
        allowed_transforms: BTreeSet<String>,
        output_restrictions: BTreeSet<String>,
        delivery_mode: DeliveryMode,
        retention_days: u32,
        retention_policy: impl Into<String>,
        obligations: Vec<(ObligationKind, EnforcementLevel)>,
    ) -> Result<ConsentContract, CoreError> {
        let request = self.request(request_id)?;
        let contract = self.consent.create(
            request.ds_id,
            request.requester_id,
            request_id,
            request.scope_hash,
            request.purpose_hash,
            duration_start,
            duration_end,
            compensation,
            permitted_fields,
            sensitive_field_consents,
            allowed_transforms,
            output_restrictions,
            delivery_mode,
            retention_days,
            retention_policy,
            obligations,
        )?;
        self.campaign_of_contract
            .write()
            .insert(contract.id, request.campaign_id);
        Ok(contract)
    }

    /// `allocate` + immediately `lock` a campaign's privacy risk budget
    /// (§4.7). Kept as one call at the facade layer: a campaign's budget is
    /// always locked before any plan referencing it can execute.
    pub fn allocate_and_lock_prb(
        &self,
        campaign_id: CampaignId,
        budget: Decimal,
        ruleset_version: impl Into<String>,
    ) -> Result<PrbSnapshot, CoreError> {
        let prb = PrivacyRiskBudget::allocate(campaign_id, budget, ruleset_version)?;
        self.audit_log.append(AuditEvent::PrbAllocated {
            campaign_id,
            allocated: budget,
        })?;
        prb.lock()?;
        self.audit_log.append(AuditEvent::PrbLocked { campaign_id })?;
        let snapshot = prb.snapshot();
        self.prbs.write().insert(campaign_id, Arc::new(prb));
        Ok(snapshot)
    }

    fn prb_for_contract(&self, contract_id: ContractId) -> Result<Arc<PrivacyRiskBudget>, CoreError> {
        let campaign_id = *self
            .campaign_of_contract
            .read()
            .get(&contract_id)
            .ok_or_else(|| CoreError::illegal_state(format!("no campaign for contract {contract_id}")))?;
        self.prbs
            .read()
            .get(&campaign_id)
            .cloned()
            .ok_or_else(|| CoreError::illegal_state(format!("no locked PRB for campaign {campaign_id}")))
    }

    /// `sign_plan(contract, plan_draft) → QueryPlan` (§6). Validates the
    /// draft against the named contract (§4.2) and signs it; a rejected
    /// draft is reported as a `PlanRejected` error carrying every failing
    /// reason code, and `QUERY_PLAN_REJECTED` is audited.
    pub fn sign_plan(
        &self,
        contract_id: ContractId,
        ops: Vec<AllowedOp>,
        output_restrictions: BTreeSet<String>,
        ttl_secs: i64,
    ) -> Result<QueryPlan, CoreError> {
        let contract = self.consent.get(contract_id)?;
        let validator = PlanValidator::new(&self.policy, &self.consent);
        let draft = draft_plan(
            contract_id,
            contract.scope_hash,
            ops,
            output_restrictions,
            self.policy.resource_limits.clone(),
            ttl_secs,
            Utc::now(),
        );
        match validator.sign_plan(draft, self.key_store.as_ref(), Utc::now()) {
            Ok(signed) => {
                self.audit_log.append(AuditEvent::QueryPlanSigned {
                    plan_id: signed.id,
                    contract_id,
                })?;
                Ok(signed)
            }
            Err((rejected, err)) => {
                let reasons = err.reason_codes_for_audit();
                self.audit_log.append(AuditEvent::QueryPlanRejected {
                    plan_id: rejected.id,
                    reasons,
                })?;
                Err(err.into())
            }
        }
    }

    /// `execute_plan(plan, data) → ExecutionResult` (§6). Re-verifies the
    /// plan's signature and TTL immediately before running it (§4.2), then
    /// interprets every step inside the sandboxed VM (§4.3), charging the
    /// campaign's PRB as it goes. Appends one `TRANSFORM_EXECUTED` per step
    /// and a single `QUERY_EXECUTED` at the end.
    pub fn execute_plan(&self, plan: &QueryPlan, data: Vec<Row>) -> Result<ExecutionResult, CoreError> {
        let validator = PlanValidator::new(&self.policy, &self.consent);
        let now = Utc::now();
        validator.verify_for_execution(plan, self.key_store.as_ref(), now)?;

        let prb = self.prb_for_contract(plan.contract_id)?;
        let vm = PlanVm::new(&self.policy);
        let audit_log = self.audit_log.clone();
        let plan_id = plan.id;
        let output = vm.execute(plan, data, &prb, false, |step_index, operator| {
            let _ = audit_log.append(AuditEvent::TransformExecuted {
                plan_id,
                step_index,
                operator: operator.to_string(),
            });
        })?;

        self.audit_log.append(AuditEvent::QueryExecuted {
            plan_id,
            prb_charged: output.prb_charged,
        })?;

        Ok(ExecutionResult {
            output: output.rows,
            capsule_payload: output.capsule_payload,
            steps_executed: output.steps_executed,
            prb_charged: output.prb_charged,
        })
    }

    /// `seal_capsule(output, ttl) → TimeCapsule` (§6). `output` is typically
    /// a `PackCapsule` step's serialized payload from [`ExecutionResult`],
    /// but any byte payload a collaborator wants sealed may be passed.
    pub fn seal_capsule(&self, output: &[u8], ttl_secs: i64) -> Result<TimeCapsule, CoreError> {
        Ok(self.capsules.seal(output, ttl_secs, Utc::now())?)
    }

    /// `access_capsule(capsule_id, nonce) → decrypted_output | Denied(reason)` (§6).
    pub fn access_capsule(&self, capsule_id: CapsuleId, nonce: &str) -> Result<Vec<u8>, Denied> {
        match self.capsules.access(capsule_id, nonce, Utc::now()) {
            Ok(plaintext) => Ok(plaintext),
            Err(err) => {
                if matches!(
                    err,
                    crate::time_capsule::CapsuleError::Nonce(crate::nonce_registry::NonceError::Reused(_))
                ) {
                    let _ = self
                        .audit_log
                        .append(AuditEvent::NonceReplayDetected { nonce: nonce.to_string() });
                }
                Err(Denied { reason: err.to_string() })
            }
        }
    }

    /// `revoke_consent(contract_id) → ()` (§6). Visible to new executions
    /// within the policy's revocation-visibility window (§4.1); every check
    /// reads the contract live, so there is no staleness to bound here.
    pub fn revoke_consent(&self, contract_id: ContractId) -> Result<(), CoreError> {
        Ok(self.consent.revoke(contract_id)?)
    }

    /// `delete_resource(resource_type, resource_id, method) → SecureDeletionCertificate` (§6).
    /// When `resource_type` identifies a capsule the core also unlinks the
    /// capsule's own encryption key.
    pub fn delete_resource(
        &self,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        method: DeletionMethod,
        capsule_id: Option<CapsuleId>,
    ) -> Result<SecureDeletionCertificate, CoreError> {
        let resource_id = resource_id.into();
        let certificate = self
            .deletion
            .delete(resource_type, resource_id.clone(), method, capsule_id, Utc::now())?;
        self.audit_log.append(AuditEvent::DeletionInitiated {
            certificate_id: certificate.id,
            resource_id,
        })?;
        if certificate.status == crate::secure_deletion::DeletionStatus::Completed {
            self.audit_log.append(AuditEvent::DeletionCompleted {
                certificate_id: certificate.id,
            })?;
        }
        Ok(certificate)
    }

    /// Verify a previously-issued certificate, appending `DELETION_VERIFIED`
    /// on success.
    pub fn verify_deletion(
        &self,
        certificate_id: crate::ids::CertificateId,
    ) -> Result<SecureDeletionCertificate, CoreError> {
        let certificate = self.deletion.verify(certificate_id, Utc::now())?;
        self.audit_log
            .append(AuditEvent::DeletionVerified { certificate_id })?;
        Ok(certificate)
    }

    /// `audit_export(range) → audit_bundle` (§6). `range` is an inclusive
    /// `[start, end)` sequence-number window; `None` exports everything.
    pub fn audit_export(&self, range: Option<(u64, u64)>) -> AuditExport {
        match range {
            Some((start, end)) => AuditExport {
                node_id: self.audit_log.node_id().to_string(),
                exported_at: Utc::now(),
                entry_count: (end - start).min(self.audit_log.len().saturating_sub(start)),
                entries: self.audit_log.range(start, end),
            },
            None => self.audit_log.export(),
        }
    }

    /// Periodic maintenance: expires consent contracts and capsules past
    /// their deadlines (§4.1 `expire_sweep`, §4.4 `expire_sweep`), then hands
    /// every capsule still `EXPIRED` past its grace period to secure
    /// deletion's crypto-shred path (§4.4). A collaborator-driven scheduler,
    /// not a background thread the core starts itself.
    pub fn run_expiry_sweep(&self, now: DateTime<Utc>) -> Result<(u64, u64, u64), CoreError> {
        let contracts = self.consent.expire_sweep(now)?;
        let capsules = self.capsules.expire_sweep(now)?;

        let due = self
            .capsules
            .expired_past_grace(self.policy.capsule_expiry_grace_secs, now);
        let mut shredded = 0u64;
        for capsule_id in due {
            self.deletion
                .delete("capsule", capsule_id.to_string(), DeletionMethod::CryptoShred, Some(capsule_id), now)?;
            shredded += 1;
        }

        Ok((contracts, capsules, shredded))
    }

    pub fn actor_label(actor: Actor) -> &'static str {
        actor.label()
    }
}

impl crate::query_plan::QueryPlanError {
    fn reason_codes_for_audit(&self) -> Vec<String> {
        match self {
            crate::query_plan::QueryPlanError::Rejected { errors } => errors.clone(),
            other => vec![other.to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::DsId;

    fn core() -> ConsentCore {
        ConsentCore::new(CoreConfig::default())
    }

    fn sample_request(campaign_id: CampaignId) -> DataRequest {
        DataRequest {
            ds_id: DsId::new(),
            requester_id: RequesterId::new(),
            campaign_id,
            purpose_hash: "purpose-1".to_string(),
            scope_hash: "scope-1".to_string(),
            requested_fields: BTreeSet::from(["steps".to_string(), "hr".to_string()]),
            proposed_steps: vec![
                AllowedOp::Select {
                    fields: BTreeSet::from(["steps".to_string(), "hr".to_string()]),
                },
                AllowedOp::Aggregate { op: "count".to_string() },
                AllowedOp::PackCapsule,
            ],
        }
    }

    #[test]
    fn s1_happy_path_end_to_end() {
        let core = core();
        let campaign_id = CampaignId::new();
        let request_id = core.submit_request(sample_request(campaign_id));

        let preview = core.quote_prb(request_id).unwrap();
        assert!(preview.total_cost > Decimal::ZERO);

        core.allocate_and_lock_prb(campaign_id, "10.0000".parse().unwrap(), "v1")
            .unwrap();

        let now = Utc::now();
        let contract = core
            .create_consent(
                request_id,
                now,
                now + chrono::Duration::hours(1),
                "10.0000".parse().unwrap(),
                BTreeSet::from(["steps".to_string(), "hr".to_string()]),
                HashMap::new(),
                BTreeSet::from(["select".to_string(), "aggregate".to_string(), "pack_capsule".to_string()]),
                BTreeSet::new(),
                DeliveryMode::CleanRoom,
                30,
                "standard",
                vec![],
            )
            .unwrap();

        let plan = core
            .sign_plan(
                contract.id,
                vec![
                    AllowedOp::Select {
                        fields: BTreeSet::from(["steps".to_string(), "hr".to_string()]),
                    },
                    AllowedOp::Aggregate { op: "count".to_string() },
                    AllowedOp::PackCapsule,
                ],
                BTreeSet::new(),
                1800,
            )
            .unwrap();

        let mut row = Row::new();
        row.insert("steps".to_string(), serde_json::json!(100));
        row.insert("hr".to_string(), serde_json::json!(70));
        let result = core.execute_plan(&plan, vec![row]).unwrap();
        assert_eq!(result.output.len(), 1);

        let payload = serde_json::to_vec(&result.output).unwrap();
        let capsule = core.seal_capsule(&payload, 1800).unwrap();

        let first = core.access_capsule(capsule.id, &capsule.nonce);
        assert!(first.is_ok());
        let second = core.access_capsule(capsule.id, &capsule.nonce);
        assert!(second.is_err());
    }

    #[test]
    fn s3_field_scope_violation_is_rejected_before_execution() {
        let core = core();
        let campaign_id = CampaignId::new();
        let mut request = sample_request(campaign_id);
        request.requested_fields = BTreeSet::from(["steps".to_string()]);
        let request_id = core.submit_request(request);
        core.allocate_and_lock_prb(campaign_id, "10.0000".parse().unwrap(), "v1")
            .unwrap();
        let now = Utc::now();
        let contract = core
            .create_consent(
                request_id,
                now,
                now + chrono::Duration::hours(1),
                "10.0000".parse().unwrap(),
                BTreeSet::from(["steps".to_string()]),
                HashMap::new(),
                BTreeSet::from(["select".to_string()]),
                BTreeSet::new(),
                DeliveryMode::Direct,
                30,
                "standard",
                vec![],
            )
            .unwrap();

        let err = core
            .sign_plan(
                contract.id,
                vec![AllowedOp::Select {
                    fields: BTreeSet::from(["steps".to_string(), "hr".to_string()]),
                }],
                BTreeSet::new(),
                1800,
            )
            .unwrap_err();
        match err {
            CoreError::PlanRejected { errors } => {
                assert!(errors.contains(&"UNAUTHORIZED_FIELD_ACCESS_ATTEMPT".to_string()));
            }
            other => panic!("expected PlanRejected, got {other:?}"),
        }
    }

    #[test]
    fn s2_revocation_denies_subsequent_signing() {
        let core = core();
        let campaign_id = CampaignId::new();
        let request_id = core.submit_request(sample_request(campaign_id));
        core.allocate_and_lock_prb(campaign_id, "10.0000".parse().unwrap(), "v1")
            .unwrap();
        let now = Utc::now();
        let contract = core
            .create_consent(
                request_id,
                now,
                now + chrono::Duration::hours(1),
                "10.0000".parse().unwrap(),
                BTreeSet::from(["steps".to_string(), "hr".to_string()]),
                HashMap::new(),
                BTreeSet::from(["select".to_string(), "aggregate".to_string(), "pack_capsule".to_string()]),
                BTreeSet::new(),
                DeliveryMode::CleanRoom,
                30,
                "standard",
                vec![],
            )
            .unwrap();

        core.revoke_consent(contract.id).unwrap();

        let err = core
            .sign_plan(
                contract.id,
                vec![AllowedOp::Select {
                    fields: BTreeSet::from(["steps".to_string()]),
                }],
                BTreeSet::new(),
                1800,
            )
            .unwrap_err();
        match err {
            CoreError::PlanRejected { errors } => {
                assert!(errors.contains(&"CONSENT_REVOKED".to_string()));
            }
            other => panic!("expected PlanRejected, got {other:?}"),
        }
    }

    #[test]
    fn s4_prb_exhaustion_during_execution() {
        let core = core();
        let campaign_id = CampaignId::new();
        let request_id = core.submit_request(sample_request(campaign_id));
        core.allocate_and_lock_prb(campaign_id, "0.05".parse().unwrap(), "v1")
            .unwrap();
        let now = Utc::now();
        let contract = core
            .create_consent(
                request_id,
                now,
                now + chrono::Duration::hours(1),
                "10.0000".parse().unwrap(),
                BTreeSet::from(["steps".to_string()]),
                HashMap::new(),
                BTreeSet::from(["select".to_string(), "aggregate".to_string()]),
                BTreeSet::new(),
                DeliveryMode::Direct,
                30,
                "standard",
                vec![],
            )
            .unwrap();

        let plan = core
            .sign_plan(
                contract.id,
                vec![
                    AllowedOp::Select {
                        fields: BTreeSet::from(["steps".to_string()]),
                    },
                    AllowedOp::Aggregate { op: "count".to_string() },
                ],
                BTreeSet::new(),
                1800,
            )
            .unwrap();

        let mut row = Row::new();
        row.insert("steps".to_string(), serde_json::json!(1));
        let err = core.execute_plan(&plan, vec![row]).unwrap_err();
        assert!(matches!(err, CoreError::PrbExhausted { .. }));
    }

    #[test]
    fn s5_crypto_shred_then_access_returns_key_destroyed() {
        let core = core();
        let capsule = core.seal_capsule(b"sensitive payload", 3600).unwrap();
        let certificate = core
            .delete_resource("capsule", capsule.id.to_string(), DeletionMethod::CryptoShred, Some(capsule.id))
            .unwrap();
        assert_eq!(certificate.status, crate::secure_deletion::DeletionStatus::Completed);
        core.verify_deletion(certificate.id).unwrap();

        let result = core.access_capsule(capsule.id, &capsule.nonce);
        assert!(result.is_err());
    }

    #[test]
    fn audit_export_range_matches_explicit_bounds() {
        let core = core();
        core.seal_capsule(b"a", 3600).unwrap();
        core.seal_capsule(b"b", 3600).unwrap();
        let bundle = core.audit_export(Some((0, 1)));
        assert_eq!(bundle.entries.len(), 1);
    }
}
