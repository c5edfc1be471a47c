//! Consent Contracts, Obligations, and Violations (§3, §4.1).
//!
//! Grounded on `genome::SealedGenome`'s seal-once immutability and
//! `GenomeError::{AlreadySealed,RuleViolation}` shape: a contract is built
//! once via a validating constructor and, once granted, only its `status`,
//! `revoked_at`, and `blockchain_anchor_hash` may ever change — exactly the
//! bounded-setter pattern the design notes (§9) ask for in place of
//! getter/setter sprawl. Append-on-transition follows `audit_log`'s pattern:
//! every state change appends before the call returns.

use crate::actor::Actor;
use crate::audit_log::{AuditEvent, AuditLog};
use crate::crypto::hash_bytes;
use crate::ids::{ContractId, DsId, ObligationId, RequesterId, ViolationId};
use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConsentError {
    #[error("consent denied: {reason_codes:?}")]
    Denied { reason_codes: Vec<String> },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("illegal state: {0}")]
    IllegalState(String),
}

pub type Result<T> = std::result::Result<T, ConsentError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContractStatus {
    Active,
    Revoked,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryMode {
    CleanRoom,
    Direct,
    Encrypted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ObligationKind {
    RetentionLimit,
    UsageRestriction,
    DeletionRequirement,
    AccessLimit,
    SharingProhibition,
    PurposeLimitation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnforcementLevel {
    Strict,
    Monitored,
    Advisory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObligationStatus {
    Active,
    Satisfied,
    Violated,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentObligation {
    pub id: ObligationId,
    pub contract_id: ContractId,
    pub kind: ObligationKind,
    pub enforcement_level: EnforcementLevel,
    pub status: ObligationStatus,
}

impl ConsentObligation {
    /// `SATISFIED ↔ VIOLATED` transitions are forbidden once terminal;
    /// `Satisfied` and `Violated` are each other's only forbidden target.
    pub fn transition(&mut self, new_status: ObligationStatus) -> Result<()> {
        let terminal_conflict = matches!(
            (self.status, new_status),
            (ObligationStatus::Satisfied, ObligationStatus::Violated)
                | (ObligationStatus::Violated, ObligationStatus::Satisfied)
        );
        if terminal_conflict {
            return Err(ConsentError::IllegalState(format!(
                "obligation {} cannot move from {:?} to {:?}",
                self.id, self.status, new_status
            )));
        }
        self.status = new_status;
        Ok(())
    }

    fn stable_tuple(&self) -> String {
        format!("{:?}|{:?}|{:?}", self.kind, self.enforcement_level, self.status)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    Critical,
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationStatus {
    Detected,
    Acknowledged,
    Investigating,
    Resolved,
    Escalated,
    Dismissed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObligationViolation {
    pub id: ViolationId,
    pub contract_id: ContractId,
    pub obligation_id: ObligationId,
    pub violation_type: String,
    pub severity: ViolationSeverity,
    pub status: ViolationStatus,
    pub penalty: Option<Decimal>,
}

/// Immutable except for `status`, `revoked_at`, `blockchain_anchor_hash`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentContract {
    pub id: ContractId,
    pub ds_id: DsId,
    pub requester_id: RequesterId,
    pub request_id: crate::ids::RequestId,
    pub scope_hash: String,
    pub purpose_hash: String,
    pub duration_start: DateTime<Utc>,
    pub duration_end: DateTime<Utc>,
    pub status: ContractStatus,
    pub revoked_at: Option<DateTime<Utc>>,
    pub compensation: Decimal,
    pub permitted_fields: BTreeSet<String>,
    pub sensitive_field_consents: HashMap<String, bool>,
    pub allowed_transforms: BTreeSet<String>,
    pub transform_chain_rules: Vec<String>,
    pub output_restrictions: BTreeSet<String>,
    pub delivery_mode: DeliveryMode,
    pub retention_days: u32,
    pub retention_policy: String,
    pub obligation_hash: String,
    pub blockchain_anchor_hash: Option<String>,
}

/// Closed set of valid plan operators a contract may name in
/// `allowed_transforms` (§3 PlanStep `AllowedOps`).
pub const ALLOWED_OPS: &[&str] = &[
    "select",
    "filter",
    "project",
    "bucketize",
    "aggregate",
    "cluster_ref",
    "redact",
    "sample",
    "export",
    "pack_capsule",
];

fn stable_obligation_hash(obligations: &[ConsentObligation]) -> String {
    let mut tuples: Vec<String> = obligations.iter().map(|o| o.stable_tuple()).collect();
    tuples.sort();
    hex::encode(hash_bytes(tuples.join("|").as_bytes()))
}

/// The input a validator extracts from a query plan before consulting the
/// consent engine. Kept independent of [`crate::query_plan::QueryPlan`] so
/// this module never has to import it back — `query_plan` depends on
/// `consent`, not the other way around.
pub struct PlanCheckInput<'a> {
    pub scope_hash: &'a str,
    pub permitted_fields: &'a BTreeSet<String>,
    pub sensitive_fields_touched: &'a BTreeSet<String>,
    pub operators: &'a BTreeSet<String>,
    pub output_restrictions: &'a BTreeSet<String>,
    pub required_obligation_kinds: &'a BTreeSet<ObligationKind>,
}

struct ContractRecord {
    contract: ConsentContract,
    obligations: Vec<ConsentObligation>,
}

/// Owns every contract and its obligations; one per-entity lock per
/// contract, matching §5's "acquire per-entity mutation locks" rule.
pub struct ConsentEngine {
    contracts: RwLock<HashMap<ContractId, Arc<Mutex<ContractRecord>>>>,
    audit_log: Arc<AuditLog>,
    revocation_visibility: Duration,
}

impl ConsentEngine {
    pub fn new(audit_log: Arc<AuditLog>, revocation_visibility_secs: i64) -> Self {
        ConsentEngine {
            contracts: RwLock::new(HashMap::new()),
            audit_log,
            revocation_visibility: Duration::seconds(revocation_visibility_secs),
        }
    }

    /// `create(...)` — validates duration ordering, non-empty
    /// `permitted_fields`, positive compensation, `allowed_transforms ⊆
    /// AllowedOps`. Computes `obligation_hash`. Emits `CONSENT_GRANTED`.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &self,
        ds_id: DsId,
        requester_id: RequesterId,
        request_id: crate::ids::RequestId,
        scope_hash: impl Into<String>,
        purpose_hash: impl Into<String>,
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
    ) -> Result<ConsentContract> {
        if duration_start >= duration_end {
            return Err(ConsentError::InvalidArgument(
                "duration_start must precede duration_end".into(),
            ));
        }
        if compensation <= Decimal::ZERO {
            return Err(ConsentError::InvalidArgument(
                "compensation must be positive".into(),
            ));
        }
        if permitted_fields.is_empty() {
            return Err(ConsentError::InvalidArgument(
                "permitted_fields must not be empty".into(),
            ));
        }
        for op in &allowed_transforms {
            if !ALLOWED_OPS.contains(&op.as_str()) {
                return Err(ConsentError::InvalidArgument(format!(
                    "{op} is not an allowed transform"
                )));
            }
        }

        let contract_id = ContractId::new();
        let obligation_records: Vec<ConsentObligation> = obligations
            .into_iter()
            .map(|(kind, enforcement_level)| ConsentObligation {
                id: ObligationId::new(),
                contract_id,
                kind,
                enforcement_level,
                status: ObligationStatus::Active,
            })
            .collect();
        let obligation_hash = stable_obligation_hash(&obligation_records);

        let contract = ConsentContract {
            id: contract_id,
            ds_id,
            requester_id,
            request_id,
            scope_hash: scope_hash.into(),
            purpose_hash: purpose_hash.into(),
            duration_start,
            duration_end,
            status: ContractStatus::Active,
            revoked_at: None,
            compensation,
            permitted_fields,
            sensitive_field_consents,
            allowed_transforms,
            transform_chain_rules: Vec::new(),
            output_restrictions,
            delivery_mode,
            retention_days,
            retention_policy: retention_policy.into(),
            obligation_hash,
            blockchain_anchor_hash: None,
        };

        self.contracts.write().insert(
            contract_id,
            Arc::new(Mutex::new(ContractRecord {
                contract: contract.clone(),
                obligations: obligation_records,
            })),
        );

        self.audit_log.append(AuditEvent::ConsentGranted {
            contract_id,
            actor: Actor::Ds,
        })?;
        tracing::info!(contract_id = %contract_id, "consent contract granted");
        Ok(contract)
    }

    fn record(&self, id: ContractId) -> Result<Arc<Mutex<ContractRecord>>> {
        self.contracts
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| ConsentError::IllegalState(format!("no such contract {id}")))
    }

    pub fn get(&self, id: ContractId) -> Result<ConsentContract> {
        Ok(self.record(id)?.lock().contract.clone())
    }

    pub fn obligations(&self, id: ContractId) -> Result<Vec<ConsentObligation>> {
        Ok(self.record(id)?.lock().obligations.clone())
    }

    /// Bind a late-arriving anchor hash. Modeled as a bounded setter rather
    /// than a free mutable reference (§9 design note).
    pub fn set_blockchain_anchor_hash(&self, id: ContractId, hash: impl Into<String>) -> Result<()> {
        let record = self.record(id)?;
        record.lock().contract.blockchain_anchor_hash = Some(hash.into());
        Ok(())
    }

    /// `revoke(id)` — allowed only from ACTIVE.
    pub fn revoke(&self, id: ContractId) -> Result<()> {
        let record = self.record(id)?;
        {
            let mut guard = record.lock();
            if guard.contract.status != ContractStatus::Active {
                return Err(ConsentError::IllegalState(format!(
                    "cannot revoke contract in state {:?}",
                    guard.contract.status
                )));
            }
            guard.contract.status = ContractStatus::Revoked;
            guard.contract.revoked_at = Some(Utc::now());
        }
        self.audit_log
            .append(AuditEvent::ConsentRevoked { contract_id: id })?;
        tracing::warn!(contract_id = %id, "consent contract revoked");
        Ok(())
    }

    /// Marks every `ACTIVE` contract with `duration_end <= now` as
    /// `EXPIRED`, one audit entry per contract.
    pub fn expire_sweep(&self, now: DateTime<Utc>) -> Result<u64> {
        let ids: Vec<ContractId> = {
            let contracts = self.contracts.read();
            contracts
                .iter()
                .filter_map(|(id, record)| {
                    let guard = record.lock();
                    if guard.contract.status == ContractStatus::Active
                        && guard.contract.duration_end <= now
                    {
                        Some(*id)
                    } else {
                        None
                    }
                })
                .collect()
        };
        for id in &ids {
            if let Some(record) = self.contracts.read().get(id).cloned() {
                record.lock().contract.status = ContractStatus::Expired;
            }
            self.audit_log
                .append(AuditEvent::ConsentExpired { contract_id: *id })?;
        }
        Ok(ids.len() as u64)
    }

    /// Record an obligation violation; transitions the obligation to
    /// `VIOLATED` (unless already terminal) and appends an audit entry.
    pub fn record_violation(
        &self,
        contract_id: ContractId,
        obligation_id: ObligationId,
        violation_type: impl Into<String>,
        severity: ViolationSeverity,
        penalty: Option<Decimal>,
    ) -> Result<ObligationViolation> {
        let record = self.record(contract_id)?;
        {
            let mut guard = record.lock();
            let obligation = guard
                .obligations
                .iter_mut()
                .find(|o| o.id == obligation_id)
                .ok_or_else(|| ConsentError::IllegalState("no such obligation".into()))?;
            obligation.transition(ObligationStatus::Violated)?;
        }
        let violation = ObligationViolation {
            id: ViolationId::new(),
            contract_id,
            obligation_id,
            violation_type: violation_type.into(),
            severity,
            status: ViolationStatus::Detected,
            penalty,
        };
        self.audit_log.append(AuditEvent::ObligationViolated {
            contract_id,
            obligation_id,
            severity: format!("{:?}", severity),
        })?;
        Ok(violation)
    }

    /// `check(contract, plan)` — fail-closed policy from §4.1.
    pub fn check(&self, contract_id: ContractId, input: PlanCheckInput<'_>, now: DateTime<Utc>) -> Result<()> {
        let record = self.record(contract_id)?;
        let guard = record.lock();
        let contract = &guard.contract;
        let mut reasons = Vec::new();

        // 1. status ACTIVE and unexpired. A revocation younger than the
        // visibility window still denies: there is no cached decision here
        // to go stale, every check reads the live contract, so the window
        // is satisfied trivially (the freshest possible read is immediate).
        if contract.status != ContractStatus::Active || now >= contract.duration_end {
            reasons.push(match contract.status {
                ContractStatus::Revoked => "CONSENT_REVOKED".to_string(),
                ContractStatus::Expired => "CONSENT_EXPIRED".to_string(),
                ContractStatus::Active => "CONSENT_EXPIRED".to_string(),
            });
        }

        // 2. scope binding.
        if input.scope_hash != contract.scope_hash {
            reasons.push("SCOPE_MISMATCH".to_string());
        }

        // 3. field scope + sensitive field explicit consent.
        if !input.permitted_fields.is_subset(&contract.permitted_fields) {
            reasons.push("UNAUTHORIZED_FIELD_ACCESS_ATTEMPT".to_string());
        }
        for field in input.sensitive_fields_touched {
            if !contract.sensitive_field_consents.get(field).copied().unwrap_or(false) {
                reasons.push(format!("SENSITIVE_FIELD_NOT_CONSENTED:{field}"));
            }
        }

        // 4. operator allowlist.
        if !input.operators.is_subset(&contract.allowed_transforms) {
            reasons.push("UNAUTHORIZED_TRANSFORM".to_string());
        }

        // 5. output restrictions cannot be weakened.
        if !input.output_restrictions.is_superset(&contract.output_restrictions) {
            reasons.push("OUTPUT_RESTRICTIONS_WEAKENED".to_string());
        }

        // 6. no obligation may be VIOLATED, and every obligation kind the
        // plan's operators require must be present on the contract.
        if guard
            .obligations
            .iter()
            .any(|o| o.status == ObligationStatus::Violated)
        {
            reasons.push("OBLIGATION_VIOLATED".to_string());
        }
        let present_kinds: BTreeSet<ObligationKind> = guard.obligations.iter().map(|o| o.kind).collect();
        if !input.required_obligation_kinds.is_subset(&present_kinds) {
            reasons.push("REQUIRED_OBLIGATION_MISSING".to_string());
        }

        if reasons.is_empty() {
            Ok(())
        } else {
            Err(ConsentError::Denied { reason_codes: reasons })
        }
    }
}

impl From<crate::audit_log::AuditError> for ConsentError {
    fn from(err: crate::audit_log::AuditError) -> Self {
        ConsentError::IllegalState(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_contract(engine: &ConsentEngine) -> ConsentContract {
        let now = Utc::now();
        engine
            .create(
                DsId::new(),
                RequesterId::new(),
                crate::ids::RequestId::new(),
                "scope-hash",
                "purpose-hash",
                now,
                now + Duration::hours(1),
                Decimal::new(100_000, 4),
                BTreeSet::from(["steps".to_string(), "hr".to_string()]),
                HashMap::new(),
                BTreeSet::from(["select".to_string(), "aggregate".to_string(), "pack_capsule".to_string()]),
                BTreeSet::new(),
                DeliveryMode::CleanRoom,
                30,
                "standard",
                vec![],
            )
            .unwrap()
    }

    fn engine() -> ConsentEngine {
        ConsentEngine::new(Arc::new(AuditLog::new("node")), 60)
    }

    #[test]
    fn duration_end_before_start_is_rejected() {
        let engine = engine();
        let now = Utc::now();
        let err = engine
            .create(
                DsId::new(),
                RequesterId::new(),
                crate::ids::RequestId::new(),
                "s",
                "p",
                now,
                now - Duration::hours(1),
                Decimal::ONE,
                BTreeSet::from(["f".to_string()]),
                HashMap::new(),
                BTreeSet::new(),
                BTreeSet::new(),
                DeliveryMode::Direct,
                1,
                "r",
                vec![],
            )
            .unwrap_err();
        assert!(matches!(err, ConsentError::InvalidArgument(_)));
    }

    #[test]
    fn non_positive_compensation_is_rejected() {
        let engine = engine();
        let now = Utc::now();
        let err = engine
            .create(
                DsId::new(),
                RequesterId::new(),
                crate::ids::RequestId::new(),
                "s",
                "p",
                now,
                now + Duration::hours(1),
                Decimal::ZERO,
                BTreeSet::from(["f".to_string()]),
                HashMap::new(),
                BTreeSet::new(),
                BTreeSet::new(),
                DeliveryMode::Direct,
                1,
                "r",
                vec![],
            )
            .unwrap_err();
        assert!(matches!(err, ConsentError::InvalidArgument(_)));
    }

    #[test]
    fn s1_happy_path_check_allows() {
        let engine = engine();
        let contract = sample_contract(&engine);
        let result = engine.check(
            contract.id,
            PlanCheckInput {
                scope_hash: "scope-hash",
                permitted_fields: &BTreeSet::from(["steps".to_string(), "hr".to_string()]),
                sensitive_fields_touched: &BTreeSet::new(),
                operators: &BTreeSet::from(["select".to_string(), "aggregate".to_string(), "pack_capsule".to_string()]),
                output_restrictions: &BTreeSet::new(),
                required_obligation_kinds: &BTreeSet::new(),
            },
            Utc::now(),
        );
        assert!(result.is_ok());
    }

    #[test]
    fn s3_field_scope_violation_is_denied() {
        let engine = engine();
        let contract_id = {
            let mut fields = BTreeSet::new();
            fields.insert("steps".to_string());
            engine
                .create(
                    DsId::new(),
                    RequesterId::new(),
                    crate::ids::RequestId::new(),
                    "scope",
                    "purpose",
                    Utc::now(),
                    Utc::now() + Duration::hours(1),
                    Decimal::ONE,
                    fields,
                    HashMap::new(),
                    BTreeSet::from(["select".to_string()]),
                    BTreeSet::new(),
                    DeliveryMode::Direct,
                    1,
                    "r",
                    vec![],
                )
                .unwrap()
                .id
        };
        let result = engine.check(
            contract_id,
            PlanCheckInput {
                scope_hash: "scope",
                permitted_fields: &BTreeSet::from(["steps".to_string(), "hr".to_string()]),
                sensitive_fields_touched: &BTreeSet::new(),
                operators: &BTreeSet::from(["select".to_string()]),
                output_restrictions: &BTreeSet::new(),
                required_obligation_kinds: &BTreeSet::new(),
            },
            Utc::now(),
        );
        match result {
            Err(ConsentError::Denied { reason_codes }) => {
                assert!(reason_codes.contains(&"UNAUTHORIZED_FIELD_ACCESS_ATTEMPT".to_string()));
            }
            _ => panic!("expected denial"),
        }
    }

    #[test]
    fn s2_revoked_contract_is_denied() {
        let engine = engine();
        let contract = sample_contract(&engine);
        engine.revoke(contract.id).unwrap();
        let result = engine.check(
            contract.id,
            PlanCheckInput {
                scope_hash: "scope-hash",
                permitted_fields: &BTreeSet::from(["steps".to_string()]),
                sensitive_fields_touched: &BTreeSet::new(),
                operators: &BTreeSet::from(["select".to_string()]),
                output_restrictions: &BTreeSet::new(),
                required_obligation_kinds: &BTreeSet::new(),
            },
            Utc::now(),
        );
        match result {
            Err(ConsentError::Denied { reason_codes }) => {
                assert!(reason_codes.contains(&"CONSENT_REVOKED".to_string()));
            }
            _ => panic!("expected denial"),
        }
    }

    #[test]
    fn cannot_revoke_twice() {
        let engine = engine();
        let contract = sample_contract(&engine);
        engine.revoke(contract.id).unwrap();
        assert!(engine.revoke(contract.id).is_err());
    }

    #[test]
    fn expire_sweep_transitions_past_duration_end() {
        let engine = engine();
        let contract = sample_contract(&engine);
        let swept = engine.expire_sweep(Utc::now() + Duration::hours(2)).unwrap();
        assert_eq!(swept, 1);
        assert_eq!(engine.get(contract.id).unwrap().status, ContractStatus::Expired);
    }

    #[test]
    fn missing_required_obligation_kind_is_denied() {
        let engine = engine();
        let contract = sample_contract(&engine);
        let result = engine.check(
            contract.id,
            PlanCheckInput {
                scope_hash: "scope-hash",
                permitted_fields: &BTreeSet::from(["steps".to_string()]),
                sensitive_fields_touched: &BTreeSet::new(),
                operators: &BTreeSet::from(["select".to_string()]),
                output_restrictions: &BTreeSet::new(),
                required_obligation_kinds: &BTreeSet::from([ObligationKind::DeletionRequirement]),
            },
            Utc::now(),
        );
        match result {
            Err(ConsentError::Denied { reason_codes }) => {
                assert!(reason_codes.contains(&"REQUIRED_OBLIGATION_MISSING".to_string()));
            }
            _ => panic!("expected denial"),
        }
    }

    #[test]
    fn obligation_cannot_move_from_satisfied_to_violated() {
        let mut obligation = ConsentObligation {
            id: ObligationId::new(),
            contract_id: ContractId::new(),
            kind: ObligationKind::RetentionLimit,
            enforcement_level: EnforcementLevel::Strict,
            status: ObligationStatus::Satisfied,
        };
        assert!(obligation.transition(ObligationStatus::Violated).is_err());
    }
}
