//! Allocation lifecycle states.
//!
//! Each state carries exactly what the next stage needs, so a stage cannot run out of order:
//! there is no way to solve an allocation that was never filtered, or to commit one that was
//! never solved.

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::carrier::CarrierCapacityRecord;
use crate::request::AllocationRequest;
use crate::solver::LinearProgram;
use crate::types::{AllocationId, CarrierId};

use super::CarrierAllocation;

/// Marker trait for valid allocation states.
pub trait AllocationState: Send + Sync {}

/// One allocation request on its way through the pipeline.
///
/// The generic parameter `T` is the current state.
#[derive(Debug, Clone)]
pub struct Allocation<T: AllocationState> {
    pub id: AllocationId,
    pub request: AllocationRequest,
    pub received_at: DateTime<Utc>,
    pub state: T,
}

// ============================================================================
// Allocation States
// ============================================================================

/// A validated request that has not looked at any carrier yet.
#[derive(Debug, Clone)]
pub struct Received {}

impl AllocationState for Received {}

/// Carriers that passed all three eligibility stages, in snapshot order.
#[derive(Debug, Clone)]
pub struct Filtered {
    pub eligible: Vec<CarrierCapacityRecord>,
}

impl AllocationState for Filtered {}

/// The linear program built from the eligible carriers.
///
/// `carriers[i]` is the carrier behind decision variable `i`.
#[derive(Debug, Clone)]
pub struct Formulated {
    pub carriers: Vec<CarrierId>,
    pub program: LinearProgram,
}

impl AllocationState for Formulated {}

/// Rounded per-carrier shares, not yet applied to the store.
#[derive(Debug, Clone)]
pub struct Solved {
    pub plan: Vec<CarrierAllocation>,
    pub solved_at: DateTime<Utc>,
}

impl AllocationState for Solved {}

/// Shares that have been subtracted from carrier headroom.
#[derive(Debug, Clone)]
pub struct Committed {
    pub plan: Vec<CarrierAllocation>,
    pub committed_at: DateTime<Utc>,
}

impl AllocationState for Committed {}

impl Allocation<Received> {
    pub fn new(request: AllocationRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            request,
            received_at: Utc::now(),
            state: Received {},
        }
    }
}

impl Allocation<Solved> {
    /// Time from receipt to a solved plan.
    pub fn solve_latency(&self) -> Duration {
        self.state.solved_at - self.received_at
    }
}

impl Allocation<Committed> {
    /// Time from receipt until the plan was applied to the store.
    pub fn latency(&self) -> Duration {
        self.state.committed_at - self.received_at
    }
}
