//! Query Plan: signed, validated, expiring execution programs (§3, §4.2).
//!
//! Grounded on `genome::SealedGenome`'s seal-once pattern again: a plan is
//! assembled, validated, and signed in one motion by [`sign_plan`], after
//! which its steps and TTL are immutable — only `status` moves, and only
//! forward.

use crate::canonicalize::{canonical_form, canonical_set};
use crate::consent::{ConsentEngine, ConsentError, PlanCheckInput};
use crate::crypto::KeyStore;
use crate::ids::{ContractId, PlanId};
use crate::policy::{PolicyConfig, ResourceLimits};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueryPlanError {
    #[error("plan rejected: {errors:?}")]
    Rejected { errors: Vec<String> },

    #[error("signature invalid")]
    SignatureInvalid,

    #[error("plan expired")]
    Expired,

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error(transparent)]
    Consent(#[from] ConsentError),
}

pub type Result<T> = std::result::Result<T, QueryPlanError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryPlanStatus {
    Draft,
    Signed,
    Executing,
    Completed,
    Rejected,
    Expired,
}

/// Closed operator taxonomy (§3 AllowedOps), one variant per step kind, each
/// carrying exactly the parameters that operator needs. `Aggregate` takes no
/// field: it reduces over whatever fields are currently in scope to a single
/// literal `_aggregate_<op>` key. `ClusterRef` takes a closed `kind` label
/// rather than a caller-supplied id; the VM generates the id itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", content = "params")]
pub enum AllowedOp {
    Select { fields: BTreeSet<String> },
    Filter { predicate: String },
    Project { fields: BTreeSet<String> },
    Bucketize { field: String, bucket_width: String },
    Aggregate { op: String },
    ClusterRef { kind: String },
    Redact { fields: BTreeSet<String> },
    Sample { rate: String },
    Export { destination: String },
    PackCapsule,
}

impl AllowedOp {
    pub fn name(&self) -> &'static str {
        match self {
            AllowedOp::Select { .. } => "select",
            AllowedOp::Filter { .. } => "filter",
            AllowedOp::Project { .. } => "project",
            AllowedOp::Bucketize { .. } => "bucketize",
            AllowedOp::Aggregate { .. } => "aggregate",
            AllowedOp::ClusterRef { .. } => "cluster_ref",
            AllowedOp::Redact { .. } => "redact",
            AllowedOp::Sample { .. } => "sample",
            AllowedOp::Export { .. } => "export",
            AllowedOp::PackCapsule => "pack_capsule",
        }
    }

    /// Fields this step reads. Feeds both the static consent field-scope
    /// check (`QueryPlan::fields_touched`) and the VM's runtime field jail —
    /// `Filter`'s predicate-embedded field counts here exactly like
    /// `Select`'s, so a plan can't smuggle a field past either check by
    /// hiding it inside a predicate string instead of a field list.
    fn input_fields(&self) -> BTreeSet<String> {
        match self {
            AllowedOp::Select { fields }
            | AllowedOp::Project { fields }
            | AllowedOp::Redact { fields } => fields.clone(),
            AllowedOp::Bucketize { field, .. } => BTreeSet::from([field.clone()]),
            AllowedOp::Filter { predicate } => predicate_field(predicate)
                .map(|f| BTreeSet::from([f]))
                .unwrap_or_default(),
            _ => BTreeSet::new(),
        }
    }

    /// Fields this step leaves in the row schema afterward. Empty means the
    /// step doesn't change the schema (`Filter`, `Sample`, `Export`,
    /// `PackCapsule`) and the jail should not be narrowed by it.
    fn output_fields(&self) -> BTreeSet<String> {
        match self {
            AllowedOp::Select { fields }
            | AllowedOp::Project { fields }
            | AllowedOp::Redact { fields } => fields.clone(),
            AllowedOp::Bucketize { field, .. } => BTreeSet::from([field.clone()]),
            AllowedOp::Aggregate { op } => BTreeSet::from([format!("_aggregate_{op}")]),
            AllowedOp::ClusterRef { .. } => BTreeSet::from(["cluster_ref".to_string()]),
            _ => BTreeSet::new(),
        }
    }
}

/// `field:op:value` — same shape the VM's predicate matcher expects. Lives
/// here too since the field it names must be visible before any data runs.
fn predicate_field(predicate: &str) -> Option<String> {
    predicate.split(':').next().filter(|s| !s.is_empty()).map(str::to_string)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub index: u32,
    pub op: AllowedOp,
    pub input_fields: BTreeSet<String>,
    pub output_fields: BTreeSet<String>,
}

/// A query plan (§3 QueryPlan). Immutable once signed, aside from `status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryPlan {
    pub id: PlanId,
    pub contract_id: ContractId,
    pub scope_hash: String,
    pub steps: Vec<PlanStep>,
    pub output_restrictions: BTreeSet<String>,
    pub resource_limits: ResourceLimits,
    pub created_at: DateTime<Utc>,
    pub ttl_secs: i64,
    pub status: QueryPlanStatus,
    pub signing_key_id: Option<String>,
    pub signature: Option<Vec<u8>>,
}

impl QueryPlan {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.created_at + Duration::seconds(self.ttl_secs)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }

    /// Field-ordered pipe-delimited signable form (§6): plan id, contract
    /// id, scope hash, one operator name per step in order, sorted output
    /// restrictions, resource limits, ISO-8601 creation timestamp, TTL.
    pub fn signable_form(&self) -> String {
        let steps = canonical_form(
            &self
                .steps
                .iter()
                .map(|s| s.op.name())
                .collect::<Vec<_>>(),
        );
        let restrictions = canonical_set(self.output_restrictions.iter().cloned());
        let resource_limits = format!(
            "{}|{}|{}|{}",
            self.resource_limits.cpu_ms,
            self.resource_limits.memory_bytes,
            self.resource_limits.wall_ms,
            self.resource_limits.battery_pct
        );
        canonical_form(&[
            &self.id.to_string(),
            &self.contract_id.to_string(),
            &self.scope_hash,
            &steps,
            &restrictions,
            &resource_limits,
            &self.created_at.to_rfc3339(),
            &self.ttl_secs.to_string(),
        ])
    }

    fn operator_set(&self) -> BTreeSet<String> {
        self.steps.iter().map(|s| s.op.name().to_string()).collect()
    }

    fn fields_touched(&self) -> BTreeSet<String> {
        self.steps.iter().flat_map(|s| s.input_fields.iter().cloned()).collect()
    }
}

/// Runs the ordered checks §4.2 lists, then signs. Built once per node and
/// shared across every `sign_plan` call — it is stateless aside from the
/// `PolicyConfig` and `ConsentEngine` it wraps.
pub struct PlanValidator<'a> {
    policy: &'a PolicyConfig,
    consent_engine: &'a ConsentEngine,
}

impl<'a> PlanValidator<'a> {
    pub fn new(policy: &'a PolicyConfig, consent_engine: &'a ConsentEngine) -> Self {
        PlanValidator { policy, consent_engine }
    }

    /// Aggregated validation: every failing rule contributes its own reason
    /// code rather than returning on the first failure, so a rejected plan
    /// tells the caller everything wrong with it in one pass.
    fn validate(&self, plan: &QueryPlan, now: DateTime<Utc>) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if plan.steps.is_empty() {
            errors.push("EMPTY_PLAN".to_string());
        }
        if plan.ttl_secs <= 0 || plan.ttl_secs > self.policy.plan_max_ttl_secs {
            errors.push("TTL_OUT_OF_BOUNDS".to_string());
        }
        for (i, step) in plan.steps.iter().enumerate() {
            if step.index as usize != i {
                errors.push(format!("STEP_INDEX_OUT_OF_ORDER:{i}"));
            }
        }
        // pack_capsule, if present, must be the terminal step.
        if let Some(pos) = plan
            .steps
            .iter()
            .position(|s| matches!(s.op, AllowedOp::PackCapsule))
        {
            if pos != plan.steps.len() - 1 {
                errors.push("PACK_CAPSULE_NOT_TERMINAL".to_string());
            }
        }

        // resource_limits within policy caps (§5).
        let caps = &self.policy.resource_limits;
        if plan.resource_limits.cpu_ms > caps.cpu_ms
            || plan.resource_limits.memory_bytes > caps.memory_bytes
            || plan.resource_limits.wall_ms > caps.wall_ms
            || plan.resource_limits.battery_pct > caps.battery_pct
        {
            errors.push("RESOURCE_LIMITS_EXCEED_POLICY".to_string());
        }

        let sensitive_fields_touched = BTreeSet::new();
        let operators = plan.operator_set();
        let required_obligation_kinds = self.policy.required_obligations_for(&operators);
        let check = self.consent_engine.check(
            plan.contract_id,
            PlanCheckInput {
                scope_hash: &plan.scope_hash,
                permitted_fields: &plan.fields_touched(),
                sensitive_fields_touched: &sensitive_fields_touched,
                operators: &operators,
                output_restrictions: &plan.output_restrictions,
                required_obligation_kinds: &required_obligation_kinds,
            },
            now,
        );
        if let Err(ConsentError::Denied { reason_codes }) = check {
            errors.extend(reason_codes);
        } else if let Err(other) = check {
            errors.push(other.to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// `sign_plan(plan, key_store)` — validate, then sign the canonical
    /// form, moving `status` `DRAFT -> SIGNED` (or `-> REJECTED`, a terminal
    /// failure state, never silently dropped).
    pub fn sign_plan(
        &self,
        mut plan: QueryPlan,
        key_store: &dyn KeyStore,
        now: DateTime<Utc>,
    ) -> std::result::Result<QueryPlan, (QueryPlan, QueryPlanError)> {
        if plan.status != QueryPlanStatus::Draft {
            return Err((
                plan.clone(),
                QueryPlanError::IllegalState(format!("cannot sign plan in state {:?}", plan.status)),
            ));
        }
        if let Err(errors) = self.validate(&plan, now) {
            plan.status = QueryPlanStatus::Rejected;
            return Err((plan, QueryPlanError::Rejected { errors }));
        }
        let signable = plan.signable_form();
        let signature = match key_store.sign(signable.as_bytes()) {
            Ok(sig) => sig,
            Err(err) => {
                plan.status = QueryPlanStatus::Rejected;
                return Err((plan, QueryPlanError::Rejected { errors: vec![err.to_string()] }));
            }
        };
        plan.signature = Some(signature);
        plan.signing_key_id = Some(key_store.identifier());
        plan.status = QueryPlanStatus::Signed;
        tracing::info!(plan_id = %plan.id, "query plan signed");
        Ok(plan)
    }

    /// Re-verify a signed plan's signature and TTL before execution — the
    /// VM calls this immediately before running any step.
    pub fn verify_for_execution(
        &self,
        plan: &QueryPlan,
        key_store: &dyn KeyStore,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if plan.status != QueryPlanStatus::Signed {
            return Err(QueryPlanError::IllegalState(format!(
                "cannot execute plan in state {:?}",
                plan.status
            )));
        }
        if plan.is_expired(now) {
            return Err(QueryPlanError::Expired);
        }
        let signature = plan
            .signature
            .as_ref()
            .ok_or(QueryPlanError::SignatureInvalid)?;
        key_store
            .verify(plan.signable_form().as_bytes(), signature)
            .map_err(|_| QueryPlanError::SignatureInvalid)?;
        Ok(())
    }
}

/// Build an unsigned draft. Step indices are assigned in array order; each
/// step's `input_fields`/`output_fields` are derived from its operator.
pub fn draft_plan(
    contract_id: ContractId,
    scope_hash: impl Into<String>,
    ops: Vec<AllowedOp>,
    output_restrictions: BTreeSet<String>,
    resource_limits: ResourceLimits,
    ttl_secs: i64,
    now: DateTime<Utc>,
) -> QueryPlan {
    let steps = ops
        .into_iter()
        .enumerate()
        .map(|(index, op)| {
            let input_fields = op.input_fields();
            let output_fields = op.output_fields();
            PlanStep {
                index: index as u32,
                op,
                input_fields,
                output_fields,
            }
        })
        .collect();
    QueryPlan {
        id: PlanId::new(),
        contract_id,
        scope_hash: scope_hash.into(),
        steps,
        output_restrictions,
        resource_limits,
        created_at: now,
        ttl_secs,
        status: QueryPlanStatus::Draft,
        signing_key_id: None,
        signature: None,
    }
}
