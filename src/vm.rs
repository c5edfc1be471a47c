//! Plan VM: sandboxed execution of a signed [`QueryPlan`] (§3, §4.3, §5).
//!
//! Grounded on `executor::SecureExecutor`'s jail pattern: that executor
//! confines every path to a canonicalized `storage_root` and rejects
//! anything that resolves outside it. This VM confines every step to a
//! `FieldJail` of currently-permitted field names the same way — each
//! operator can only narrow the jail, never widen it, and any attempt to
//! read a field outside it is a `FieldFault`, not a panic.

use crate::ids::PlanId;
use crate::policy::{PolicyConfig, ResourceLimits};
use crate::prb::{PrbError, PrivacyRiskBudget};
use crate::query_plan::{AllowedOp, PlanStep, QueryPlan};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VmError {
    #[error("resource exceeded: {dimension}")]
    ResourceExceeded { dimension: String },

    #[error("network blocked: {destination}")]
    NetworkBlocked { destination: String },

    #[error("privacy risk budget exhausted: required {required}, remaining {remaining}")]
    PrbExhausted {
        required: Decimal,
        remaining: Decimal,
    },

    #[error("field fault: {0}")]
    FieldFault(String),

    #[error("execution cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, VmError>;

impl From<PrbError> for VmError {
    fn from(err: PrbError) -> Self {
        match err {
            PrbError::Exhausted { required, remaining } => VmError::PrbExhausted { required, remaining },
            PrbError::IllegalState(message) | PrbError::InvalidArgument(message) => {
                VmError::FieldFault(message)
            }
        }
    }
}

pub type Row = BTreeMap<String, Value>;

/// Process-wide egress gate. `PlanVm::execute` forces it `blocked=true` for
/// the entire span of an execution and releases it to `blocked=false` on
/// exit (§5); only the `export` operator probes it from inside a plan. A
/// collaborator may also hold a reference to flip it outside of any
/// execution (e.g. airplane mode); that external state has no effect while
/// a plan is running, since entry always re-engages the gate.
pub struct NetworkGate {
    blocked: AtomicBool,
}

impl NetworkGate {
    pub fn new() -> Self {
        NetworkGate {
            blocked: AtomicBool::new(true),
        }
    }

    pub fn open(&self) {
        self.blocked.store(false, Ordering::SeqCst);
    }

    pub fn block(&self) {
        self.blocked.store(true, Ordering::SeqCst);
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::SeqCst)
    }

    pub fn check_egress(&self, destination: &str) -> Result<()> {
        if self.blocked.load(Ordering::SeqCst) {
            return Err(VmError::NetworkBlocked {
                destination: destination.to_string(),
            });
        }
        Ok(())
    }

    /// Engage the gate for the span of one execution. `PlanVm::execute` sets
    /// `blocked=true` on entry and `blocked=false` on exit (including an
    /// early return or a panic unwinding through it) per §5.
    fn enter(&self) -> NetworkGateGuard<'_> {
        self.blocked.store(true, Ordering::SeqCst);
        NetworkGateGuard { gate: self }
    }
}

struct NetworkGateGuard<'a> {
    gate: &'a NetworkGate,
}

impl Drop for NetworkGateGuard<'_> {
    fn drop(&mut self) {
        self.gate.blocked.store(false, Ordering::SeqCst);
    }
}

impl Default for NetworkGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks all four resource dimensions §5 names. CPU time has no per-thread
/// clock available without a platform crate this stack does not
/// otherwise pull in, so it's checked against the same wall-clock elapsed
/// reading as `wall_ms`, against its own (usually tighter) cap. Battery has
/// no real power-draw sensor to sample either, so each step charges a flat
/// one-point estimate against `battery_pct`, the same flat-charge approach
/// `policy::prb_cost_table` takes for per-operator privacy cost.
struct ResourceMonitor {
    limits: ResourceLimits,
    started: Instant,
    memory_used: AtomicU64,
    battery_used: AtomicU64,
}

impl ResourceMonitor {
    fn new(limits: ResourceLimits) -> Self {
        ResourceMonitor {
            limits,
            started: Instant::now(),
            memory_used: AtomicU64::new(0),
            battery_used: AtomicU64::new(0),
        }
    }

    fn check_time(&self) -> Result<()> {
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        if elapsed_ms > self.limits.wall_ms {
            return Err(VmError::ResourceExceeded {
                dimension: "wall_ms".to_string(),
            });
        }
        if elapsed_ms > self.limits.cpu_ms {
            return Err(VmError::ResourceExceeded {
                dimension: "cpu_ms".to_string(),
            });
        }
        Ok(())
    }

    fn charge_memory(&self, bytes: u64) -> Result<()> {
        let total = self.memory_used.fetch_add(bytes, Ordering::SeqCst) + bytes;
        if total > self.limits.memory_bytes {
            return Err(VmError::ResourceExceeded {
                dimension: "memory_bytes".to_string(),
            });
        }
        Ok(())
    }

    fn charge_battery(&self) -> Result<()> {
        let total = self.battery_used.fetch_add(1, Ordering::SeqCst) + 1;
        if total > self.limits.battery_pct as u64 {
            return Err(VmError::ResourceExceeded {
                dimension: "battery_pct".to_string(),
            });
        }
        Ok(())
    }
}

/// What one [`PlanVm::execute`] call produces.
pub struct VmOutput {
    pub rows: Vec<Row>,
    pub capsule_payload: Option<Vec<u8>>,
    pub prb_charged: Decimal,
    pub steps_executed: u32,
}

/// Sandboxed interpreter for a signed plan's steps. One instance per
/// execution; holds no state across calls.
pub struct PlanVm<'a> {
    policy: &'a PolicyConfig,
    network_gate: NetworkGate,
}

impl<'a> PlanVm<'a> {
    pub fn new(policy: &'a PolicyConfig) -> Self {
        PlanVm {
            policy,
            network_gate: NetworkGate::new(),
        }
    }

    pub fn network_gate(&self) -> &NetworkGate {
        &self.network_gate
    }

    /// Execute every step of `plan` against `dataset`, charging `prb` one
    /// cost per step. In `preview` mode no PRB is actually consumed — the
    /// returned `prb_charged` is the sum that *would* have been charged,
    /// for `quote_prb` (§6).
    pub fn execute(
        &self,
        plan: &QueryPlan,
        dataset: Vec<Row>,
        prb: &PrivacyRiskBudget,
        preview: bool,
        mut on_step: impl FnMut(u32, &str),
    ) -> Result<VmOutput> {
        let _gate_guard = self.network_gate.enter();
        let monitor = ResourceMonitor::new(self.policy.resource_limits.clone());
        let mut field_jail: Option<BTreeSet<String>> = None;
        let mut rows = dataset;
        let mut capsule_payload = None;
        let mut total_cost = Decimal::ZERO;
        let mut steps_executed = 0u32;

        for step in &plan.steps {
            monitor.check_time()?;
            let op_name = step.op.name();
            let cost = self.policy.cost_for(op_name);

            if preview {
                total_cost += cost;
            } else if !prb.can_consume(cost) {
                let snapshot = prb.snapshot();
                return Err(VmError::PrbExhausted {
                    required: cost,
                    remaining: snapshot.remaining,
                });
            }

            rows = self.apply(step, rows, &mut field_jail, plan.id, &monitor, &mut capsule_payload)?;

            if !preview {
                prb.consume(cost)?;
                total_cost += cost;
            }
            steps_executed += 1;
            on_step(step.index, op_name);
        }

        Ok(VmOutput {
            rows,
            capsule_payload,
            prb_charged: total_cost,
            steps_executed,
        })
    }

    /// Every step's input fields are checked against the jail before the
    /// operator runs — `Filter`'s predicate-embedded field goes through the
    /// same gate `Select`'s field list does, via `step.input_fields`. Every
    /// step whose `output_fields` is non-empty narrows the jail to exactly
    /// that set afterward; a step that doesn't change the row schema
    /// (`Filter`, `Sample`, `Export`, `PackCapsule`) leaves the jail alone.
    fn apply(
        &self,
        step: &PlanStep,
        rows: Vec<Row>,
        field_jail: &mut Option<BTreeSet<String>>,
        plan_id: PlanId,
        monitor: &ResourceMonitor,
        capsule_payload: &mut Option<Vec<u8>>,
    ) -> Result<Vec<Row>> {
        monitor.charge_memory((rows.len() * 256) as u64)?;
        monitor.charge_battery()?;
        check_jail_all(field_jail, &step.input_fields)?;

        let result = match &step.op {
            AllowedOp::Select { fields } | AllowedOp::Project { fields } => Ok(rows
                .into_iter()
                .map(|row| row.into_iter().filter(|(k, _)| fields.contains(k)).collect())
                .collect()),
            AllowedOp::Filter { predicate } => {
                let (field, op_sym, value) = parse_predicate(predicate)?;
                Ok(rows
                    .into_iter()
                    .filter(|row| row.get(&field).map(|v| matches_predicate(v, op_sym, &value)).unwrap_or(false))
                    .collect())
            }
            AllowedOp::Bucketize { field, bucket_width } => {
                let width: f64 = bucket_width
                    .parse()
                    .map_err(|_| VmError::FieldFault("invalid bucket_width".into()))?;
                if width <= 0.0 {
                    return Err(VmError::FieldFault("bucket_width must be positive".into()));
                }
                Ok(rows
                    .into_iter()
                    .map(|mut row| {
                        if let Some(Value::Number(n)) = row.get(field).cloned() {
                            if let Some(raw) = n.as_f64() {
                                let bucket = (raw / width).floor() * width;
                                row.insert(field.clone(), Value::String(format!("[{bucket}, {})", bucket + width)));
                            }
                        }
                        row
                    })
                    .collect())
            }
            AllowedOp::Aggregate { op } => {
                let result = match op.as_str() {
                    "count" => rows.iter().map(|row| row.len() as f64).sum::<f64>(),
                    "sum" | "mean" | "min" | "max" => {
                        let values: Vec<f64> = rows
                            .iter()
                            .flat_map(|row| row.values())
                            .filter_map(Value::as_f64)
                            .collect();
                        match op.as_str() {
                            "sum" => values.iter().sum::<f64>(),
                            "mean" => {
                                if values.is_empty() {
                                    0.0
                                } else {
                                    values.iter().sum::<f64>() / values.len() as f64
                                }
                            }
                            "min" => values.iter().cloned().fold(f64::INFINITY, f64::min),
                            "max" => values.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
                            _ => unreachable!(),
                        }
                    }
                    other => return Err(VmError::FieldFault(format!("unknown aggregate op {other}"))),
                };
                let mut out = Row::new();
                out.insert(format!("_aggregate_{op}"), serde_json::json!(result));
                Ok(vec![out])
            }
            AllowedOp::ClusterRef { kind } => {
                if !matches!(kind.as_str(), "topic" | "mood" | "scene" | "activity") {
                    return Err(VmError::FieldFault(format!("unknown cluster_ref kind {kind}")));
                }
                if rows.len() < self.policy.cohort_size_threshold as usize {
                    return Err(VmError::FieldFault(format!(
                        "cohort size {} below threshold {}",
                        rows.len(),
                        self.policy.cohort_size_threshold
                    )));
                }
                let digest = crate::crypto::hash_bytes(format!("{plan_id}|{kind}").as_bytes());
                let cluster_ref = format!("{kind}:{}", hex::encode(&digest[0..4]));
                let mut out = Row::new();
                out.insert("cluster_ref".to_string(), Value::String(cluster_ref));
                out.insert("cohort_size".to_string(), serde_json::json!(rows.len()));
                Ok(vec![out])
            }
            AllowedOp::Redact { fields } => Ok(rows
                .into_iter()
                .map(|mut row| {
                    for field in fields {
                        if row.contains_key(field) {
                            row.insert(field.clone(), Value::String("[REDACTED]".to_string()));
                        }
                    }
                    row
                })
                .collect()),
            AllowedOp::Sample { rate } => {
                let rate: f64 = rate.parse().map_err(|_| VmError::FieldFault("invalid sample rate".into()))?;
                if !(0.0..=1.0).contains(&rate) {
                    return Err(VmError::FieldFault("sample rate must be within [0,1]".into()));
                }
                let seed = {
                    let digest = crate::crypto::hash_bytes(plan_id.to_string().as_bytes());
                    u64::from_le_bytes(digest[0..8].try_into().unwrap())
                };
                let mut rng = StdRng::seed_from_u64(seed);
                Ok(rows.into_iter().filter(|_| rng.gen::<f64>() < rate).collect())
            }
            AllowedOp::Export { destination } => {
                self.network_gate.check_egress(destination)?;
                Ok(rows)
            }
            AllowedOp::PackCapsule => {
                let serialized = serde_json::to_vec(&rows)
                    .map_err(|e| VmError::FieldFault(format!("capsule serialization failed: {e}")))?;
                *capsule_payload = Some(serialized);
                Ok(rows)
            }
        }?;

        if !step.output_fields.is_empty() {
            narrow_jail(field_jail, &step.output_fields);
        }

        Ok(result)
    }
}

/// One step's description for [`PlanVm::preview`] (§4.3 "Preview mode").
pub struct StepPreview {
    pub index: u32,
    pub operator: &'static str,
    pub description: String,
    pub privacy_impact: f64,
}

impl<'a> PlanVm<'a> {
    /// Describe every step of `plan` without touching any data: no field is
    /// read, no row is produced, no PRB is charged. Used by `quote_prb` (§6)
    /// to show a DS what a plan would cost before they consent to running it.
    pub fn preview(&self, plan: &QueryPlan) -> Vec<StepPreview> {
        let max_cost = self
            .policy
            .prb_cost_table
            .values()
            .cloned()
            .fold(Decimal::ZERO, Decimal::max)
            .max(Decimal::ONE);
        plan.steps
            .iter()
            .map(|step| {
                let op_name = step.op.name();
                let cost = self.policy.cost_for(op_name);
                let privacy_impact = (cost / max_cost)
                    .to_string()
                    .parse::<f64>()
                    .unwrap_or(0.0)
                    .clamp(0.0, 1.0);
                StepPreview {
                    index: step.index,
                    operator: op_name,
                    description: describe_operator(&step.op),
                    privacy_impact,
                }
            })
            .collect()
    }
}

fn describe_operator(op: &AllowedOp) -> String {
    match op {
        AllowedOp::Select { fields } => format!("select fields {fields:?}"),
        AllowedOp::Filter { predicate } => format!("filter rows on `{predicate}`"),
        AllowedOp::Project { fields } => format!("project down to fields {fields:?}"),
        AllowedOp::Bucketize { field, bucket_width } => {
            format!("bucketize `{field}` into width-{bucket_width} buckets")
        }
        AllowedOp::Aggregate { op } => format!("aggregate currently scoped fields with {op}"),
        AllowedOp::ClusterRef { kind } => format!("replace rows with a generated `{kind}` cluster ref"),
        AllowedOp::Redact { fields } => format!("redact fields {fields:?}"),
        AllowedOp::Sample { rate } => format!("retain a random {rate} sample of rows"),
        AllowedOp::Export { destination } => format!("export output toward `{destination}`"),
        AllowedOp::PackCapsule => "pack output into a time capsule".to_string(),
    }
}

fn narrow_jail(field_jail: &mut Option<BTreeSet<String>>, fields: &BTreeSet<String>) {
    *field_jail = Some(match field_jail.take() {
        Some(existing) => existing.intersection(fields).cloned().collect(),
        None => fields.clone(),
    });
}

fn check_jail(field_jail: &Option<BTreeSet<String>>, field: &str) -> Result<()> {
    match field_jail {
        Some(jail) if !jail.contains(field) => {
            Err(VmError::FieldFault(format!("field {field} is outside the jailed scope")))
        }
        _ => Ok(()),
    }
}

fn check_jail_all(field_jail: &Option<BTreeSet<String>>, fields: &BTreeSet<String>) -> Result<()> {
    for field in fields {
        check_jail(field_jail, field)?;
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
enum PredicateOp {
    Eq,
    Gt,
    Lt,
}

fn parse_predicate(predicate: &str) -> Result<(String, PredicateOp, String)> {
    let parts: Vec<&str> = predicate.splitn(3, ':').collect();
    if parts.len() != 3 {
        return Err(VmError::FieldFault(format!("malformed predicate {predicate}")));
    }
    let op = match parts[1] {
        "eq" => PredicateOp::Eq,
        "gt" => PredicateOp::Gt,
        "lt" => PredicateOp::Lt,
        other => return Err(VmError::FieldFault(format!("unknown predicate operator {other}"))),
    };
    Ok((parts[0].to_string(), op, parts[2].to_string()))
}

fn matches_predicate(value: &Value, op: PredicateOp, target: &str) -> bool {
    match op {
        PredicateOp::Eq => value.to_string().trim_matches('"') == target,
        PredicateOp::Gt | PredicateOp::Lt => {
            let (Some(lhs), Ok(rhs)) = (value.as_f64(), f64::from_str(target)) else {
                return false;
            };
            match op {
                PredicateOp::Gt => lhs > rhs,
                PredicateOp::Lt => lhs < rhs,
                PredicateOp::Eq => unreachable!(),
            }
        }
    }
}
