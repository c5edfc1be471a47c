//! Policy configuration.
//!
//! The core treats every numeric threshold as collaborator-supplied:
//! constructors take a `PolicyConfig` rather than reading a file or
//! environment variable themselves. `Default` matches the reference
//! literal defaults so a collaborator that wants them can use
//! `PolicyConfig::default()` unchanged.

use crate::consent::ObligationKind;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub cpu_ms: u64,
    pub memory_bytes: u64,
    pub wall_ms: u64,
    pub battery_pct: u8,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        ResourceLimits {
            cpu_ms: 30_000,
            memory_bytes: 100 * 1024 * 1024,
            wall_ms: 60_000,
            battery_pct: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Maximum lifetime a query plan's TTL may request (§4.2).
    pub plan_max_ttl_secs: i64,
    /// Default resource caps the Plan VM enforces (§5).
    pub resource_limits: ResourceLimits,
    /// Window within which a revocation must become visible to new checks (§4.1).
    pub revocation_visibility_secs: i64,
    /// Grace period after capsule expiry before Secure Deletion must run (§4.4).
    pub capsule_expiry_grace_secs: i64,
    /// Minimum cohort size required for cohort-sensitive output restrictions (§8).
    pub cohort_size_threshold: u64,
    /// Per-operator PRB cost, keyed by operator name (§9 open question).
    pub prb_cost_table: HashMap<String, Decimal>,
    /// Obligation kinds a contract must carry before a plan naming this
    /// operator may be signed (§4.1 check 6, "all required obligation kinds
    /// present"). Keyed by operator name; an operator absent from the table
    /// requires nothing.
    pub required_obligation_kinds: HashMap<String, BTreeSet<ObligationKind>>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        let mut prb_cost_table = HashMap::new();
        prb_cost_table.insert("select".to_string(), Decimal::new(5, 2)); // 0.05
        prb_cost_table.insert("filter".to_string(), Decimal::new(5, 2));
        prb_cost_table.insert("project".to_string(), Decimal::new(5, 2));
        prb_cost_table.insert("aggregate".to_string(), Decimal::new(10, 2)); // 0.10
        prb_cost_table.insert("bucketize".to_string(), Decimal::new(10, 2));
        prb_cost_table.insert("redact".to_string(), Decimal::new(15, 2)); // 0.15
        prb_cost_table.insert("sample".to_string(), Decimal::new(15, 2));
        prb_cost_table.insert("cluster_ref".to_string(), Decimal::new(25, 2)); // 0.25
        prb_cost_table.insert("export".to_string(), Decimal::new(25, 2));
        prb_cost_table.insert("pack_capsule".to_string(), Decimal::new(10, 2));

        PolicyConfig {
            plan_max_ttl_secs: 24 * 60 * 60,
            resource_limits: ResourceLimits::default(),
            revocation_visibility_secs: 60,
            capsule_expiry_grace_secs: 60 * 60,
            cohort_size_threshold: 50,
            prb_cost_table,
            required_obligation_kinds: HashMap::new(),
        }
    }
}

impl PolicyConfig {
    pub fn cost_for(&self, operator: &str) -> Decimal {
        self.prb_cost_table
            .get(operator)
            .copied()
            .unwrap_or(Decimal::new(10, 2))
    }

    /// Union of every required obligation kind across `operators`, the set
    /// `PlanValidator::validate` must find present on the signing contract.
    pub fn required_obligations_for(&self, operators: &BTreeSet<String>) -> BTreeSet<ObligationKind> {
        operators
            .iter()
            .filter_map(|op| self.required_obligation_kinds.get(op))
            .flat_map(|kinds| kinds.iter().copied())
            .collect()
    }
}
