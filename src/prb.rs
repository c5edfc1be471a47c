//! Privacy Risk Budget: per-campaign ε-style allocation, lock, consume (§3, §4.7).
//!
//! Grounded on `mesh_capsule::CapsuleState`'s shape: a small closed `enum`
//! plus guarded transition methods, rather than a free-floating status
//! field any caller could overwrite.

use crate::ids::CampaignId;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PrbError {
    #[error("privacy risk budget exhausted: required {required}, remaining {remaining}")]
    Exhausted {
        required: Decimal,
        remaining: Decimal,
    },

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, PrbError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrbStatus {
    Draft,
    Locked,
    Exhausted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PrbState {
    campaign_id: CampaignId,
    allocated: Decimal,
    consumed: Decimal,
    ruleset_version: String,
    status: PrbStatus,
    locked_at: Option<DateTime<Utc>>,
}

/// A snapshot of a [`PrivacyRiskBudget`]'s state, safe to hand to a caller
/// without exposing the lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrbSnapshot {
    pub campaign_id: CampaignId,
    pub allocated: Decimal,
    pub consumed: Decimal,
    pub remaining: Decimal,
    pub ruleset_version: String,
    pub status: PrbStatus,
    pub locked_at: Option<DateTime<Utc>>,
}

/// One campaign's privacy risk budget. Interior mutability behind a single
/// per-entity lock, matching the concurrency model's "acquire a per-PRB
/// mutation lock" requirement (§5).
pub struct PrivacyRiskBudget {
    state: Mutex<PrbState>,
}

impl PrivacyRiskBudget {
    /// `allocate(campaign, budget, ruleset_version)` → status DRAFT.
    pub fn allocate(
        campaign_id: CampaignId,
        allocated: Decimal,
        ruleset_version: impl Into<String>,
    ) -> Result<Self> {
        if allocated <= Decimal::ZERO {
            return Err(PrbError::InvalidArgument(
                "allocated budget must be positive".into(),
            ));
        }
        Ok(PrivacyRiskBudget {
            state: Mutex::new(PrbState {
                campaign_id,
                allocated,
                consumed: Decimal::ZERO,
                ruleset_version: ruleset_version.into(),
                status: PrbStatus::Draft,
                locked_at: None,
            }),
        })
    }

    pub fn campaign_id(&self) -> CampaignId {
        self.state.lock().campaign_id
    }

    pub fn snapshot(&self) -> PrbSnapshot {
        let state = self.state.lock();
        PrbSnapshot {
            campaign_id: state.campaign_id,
            allocated: state.allocated,
            consumed: state.consumed,
            remaining: state.allocated - state.consumed,
            ruleset_version: state.ruleset_version.clone(),
            status: state.status,
            locked_at: state.locked_at,
        }
    }

    /// `lock()` → allowed only from DRAFT; renders `allocated` immutable.
    pub fn lock(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.status != PrbStatus::Draft {
            return Err(PrbError::IllegalState(format!(
                "cannot lock budget in state {:?}",
                state.status
            )));
        }
        state.status = PrbStatus::Locked;
        state.locked_at = Some(Utc::now());
        tracing::info!(campaign_id = %state.campaign_id, "privacy risk budget locked");
        Ok(())
    }

    /// Side-effect-free predicate matching the success condition of `consume`.
    pub fn can_consume(&self, cost: Decimal) -> bool {
        let state = self.state.lock();
        state.status == PrbStatus::Locked && cost <= state.allocated - state.consumed
    }

    /// `consume(cost)` → allowed only from LOCKED; rejects if `cost > remaining`.
    pub fn consume(&self, cost: Decimal) -> Result<PrbSnapshot> {
        if cost < Decimal::ZERO {
            return Err(PrbError::InvalidArgument("cost must not be negative".into()));
        }
        let mut state = self.state.lock();
        if state.status != PrbStatus::Locked {
            return Err(PrbError::IllegalState(format!(
                "cannot consume from budget in state {:?}",
                state.status
            )));
        }
        let remaining = state.allocated - state.consumed;
        if cost > remaining {
            return Err(PrbError::Exhausted {
                required: cost,
                remaining,
            });
        }
        state.consumed += cost;
        let remaining_after = state.allocated - state.consumed;
        if remaining_after == Decimal::ZERO {
            state.status = PrbStatus::Exhausted;
        }
        tracing::info!(
            campaign_id = %state.campaign_id,
            cost = %cost,
            remaining = %remaining_after,
            "privacy risk budget consumed"
        );
        Ok(PrbSnapshot {
            campaign_id: state.campaign_id,
            allocated: state.allocated,
            consumed: state.consumed,
            remaining: remaining_after,
            ruleset_version: state.ruleset_version.clone(),
            status: state.status,
            locked_at: state.locked_at,
        })
    }
}
