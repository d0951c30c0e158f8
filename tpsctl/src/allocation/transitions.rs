use chrono::Utc;
use tracing::{debug, warn};

use crate::carrier::CarrierCapacityRecord;
use crate::solver::LpSolver;
use crate::storage::CapacityStore;

use super::types::{Allocation, Committed, Filtered, Formulated, Received, Solved};
use super::{AllocationResult, RejectionReason, filter_eligible, formulate};

impl Allocation<Received> {
    /// Narrow `snapshot` to the carriers eligible for this request.
    pub fn filter(self, snapshot: &[CarrierCapacityRecord]) -> Result<Allocation<Filtered>, RejectionReason> {
        let eligible = filter_eligible(snapshot, &self.request)?;
        debug!(allocation_id = %self.id, eligible = eligible.len(), "Filtered carriers");

        Ok(Allocation {
            id: self.id,
            request: self.request,
            received_at: self.received_at,
            state: Filtered { eligible },
        })
    }
}

impl Allocation<Filtered> {
    pub fn formulate(self) -> Result<Allocation<Formulated>, RejectionReason> {
        let formulated = formulate(&self.state.eligible, &self.request).map_err(|e| {
            warn!(allocation_id = %self.id, error = %e, "Could not formulate allocation program");
            RejectionReason::NoFeasibleAllocation
        })?;

        Ok(Allocation {
            id: self.id,
            request: self.request,
            received_at: self.received_at,
            state: Formulated {
                carriers: formulated.carriers,
                program: formulated.program,
            },
        })
    }
}

impl Allocation<Formulated> {
    /// Solve the program and round the answer into a plan.
    ///
    /// Synchronous and CPU-bound; the engine runs it on the blocking pool. Every solver failure
    /// is reported to the caller as `NoFeasibleAllocation`; the detail only goes to the log.
    pub fn solve<L: LpSolver + ?Sized>(self, solver: &L) -> Result<Allocation<Solved>, RejectionReason> {
        let formulated = super::AllocationProgram {
            carriers: self.state.carriers,
            program: self.state.program,
        };

        let plan = solver
            .solve(&formulated.program)
            .and_then(|x| formulated.plan_from_solution(&x))
            .map_err(|e| {
                debug!(allocation_id = %self.id, error = %e, "No feasible allocation");
                RejectionReason::NoFeasibleAllocation
            })?;

        Ok(Allocation {
            id: self.id,
            request: self.request,
            received_at: self.received_at,
            state: Solved {
                plan,
                solved_at: Utc::now(),
            },
        })
    }
}

impl Allocation<Solved> {
    /// Subtract the plan from carrier headroom, all or nothing.
    ///
    /// A store refusal (another allocation got there first, or a carrier vanished in a
    /// refresh) ends the allocation as `NoFeasibleAllocation`.
    pub async fn commit<S: CapacityStore>(self, store: &S) -> Result<Allocation<Committed>, RejectionReason> {
        debug!(
            allocation_id = %self.id,
            solve_latency_ms = self.solve_latency().num_milliseconds(),
            "Committing plan"
        );
        store.commit(&self.state.plan).await.map_err(|e| {
            warn!(allocation_id = %self.id, error = %e, "Commit refused");
            RejectionReason::NoFeasibleAllocation
        })?;

        Ok(Allocation {
            id: self.id,
            request: self.request,
            received_at: self.received_at,
            state: Committed {
                plan: self.state.plan,
                committed_at: Utc::now(),
            },
        })
    }
}

impl Allocation<Committed> {
    pub fn into_result(self) -> AllocationResult {
        let total_allocated_tps = self.state.plan.iter().map(|p| p.allocated_tps).sum();
        AllocationResult::Success {
            allocation_id: self.id,
            total_requested_tps: self.request.requested_tps,
            total_allocated_tps,
            per_carrier: self.state.plan,
        }
    }
}
