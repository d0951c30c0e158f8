//! The allocation engine.
//!
//! [`AllocationEngine::allocate`] runs one request through the whole pipeline and always
//! returns an [`AllocationResult`]. Nothing in the pipeline holds a lock while filtering,
//! formulating or solving: those stages work on a snapshot. Only the final commit touches
//! shared state, and it re-checks headroom carrier by carrier, so a snapshot that went stale
//! in the meantime is refused instead of overcommitting.

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use serde_json::Value;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::allocation::{Allocation, AllocationResult, Committed, Formulated, Received, RejectionReason, Solved};
use crate::audit::{AuditRecord, AuditSink};
use crate::config::EngineConfig;
use crate::request::AllocationRequest;
use crate::solver::{LpSolver, SimplexSolver};
use crate::storage::CapacityStore;

pub struct AllocationEngine<S> {
    store: Arc<S>,
    solver: Arc<dyn LpSolver>,
    audit: Arc<dyn AuditSink>,
    config: EngineConfig,
}

impl<S> Clone for AllocationEngine<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            solver: self.solver.clone(),
            audit: self.audit.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: CapacityStore> AllocationEngine<S> {
    /// An engine using the bundled simplex solver, capped at `config.max_solver_iterations`.
    pub fn new(store: Arc<S>, audit: Arc<dyn AuditSink>, config: EngineConfig) -> Self {
        let solver = Arc::new(SimplexSolver::new(config.max_solver_iterations));
        Self {
            store,
            solver,
            audit,
            config,
        }
    }

    pub fn with_solver(mut self, solver: Arc<dyn LpSolver>) -> Self {
        self.solver = solver;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Allocate capacity for a validated request.
    #[instrument(skip_all, fields(requested_tps = %request.requested_tps, destinations = request.destinations.len()))]
    pub async fn allocate(&self, request: AllocationRequest) -> AllocationResult {
        let allocation = Allocation::new(request.clone());
        let allocation_id = allocation.id;

        let result = match self.run(allocation).await {
            Ok(committed) => {
                let latency = committed.latency().to_std().map(|d| d.as_secs_f64()).unwrap_or_default();
                histogram!("tpsctl_allocation_duration_seconds").record(latency);
                committed.into_result()
            }
            Err(reason) => AllocationResult::Rejected { allocation_id, reason },
        };

        self.finish(Some(&request), &result).await;
        result
    }

    /// Validate a raw JSON payload, then allocate. Invalid payloads are rejected as
    /// `MalformedRequest` before any carrier is looked at.
    pub async fn allocate_value(&self, payload: Value) -> AllocationResult {
        match AllocationRequest::from_value(payload) {
            Ok(request) => self.allocate(request).await,
            Err(e) => self.reject_malformed(e.to_string()).await,
        }
    }

    /// Reject a payload that never became a request, e.g. a line that is not JSON at all.
    pub async fn reject_malformed(&self, message: String) -> AllocationResult {
        let result = AllocationResult::Rejected {
            allocation_id: Uuid::new_v4(),
            reason: RejectionReason::MalformedRequest(message),
        };
        self.finish(None, &result).await;
        result
    }

    async fn run(&self, allocation: Allocation<Received>) -> Result<Allocation<Committed>, RejectionReason> {
        let snapshot = self.store.snapshot().await.map_err(|e| {
            error!(allocation_id = %allocation.id, error = %e, "Failed to read carrier snapshot");
            RejectionReason::NoFeasibleAllocation
        })?;

        let formulated = allocation.filter(&snapshot)?.formulate()?;
        let solved = self.solve(formulated).await?;
        solved.commit(self.store.as_ref()).await
    }

    /// Solve on the blocking pool, bounded by `solver_timeout`.
    ///
    /// A timed-out solve keeps running in the background until its iteration cap; its answer
    /// is discarded.
    async fn solve(&self, formulated: Allocation<Formulated>) -> Result<Allocation<Solved>, RejectionReason> {
        let allocation_id = formulated.id;
        let solver = self.solver.clone();
        let started = Instant::now();

        let task = tokio::task::spawn_blocking(move || formulated.solve(solver.as_ref()));
        let outcome = tokio::time::timeout(self.config.solver_timeout, task).await;
        histogram!("tpsctl_solver_duration_seconds").record(started.elapsed().as_secs_f64());

        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                error!(%allocation_id, error = %e, "Solver task failed");
                Err(RejectionReason::NoFeasibleAllocation)
            }
            Err(_) => {
                warn!(%allocation_id, timeout = ?self.config.solver_timeout, "Solver timed out");
                counter!("tpsctl_solver_timeouts_total").increment(1);
                Err(RejectionReason::NoFeasibleAllocation)
            }
        }
    }

    async fn finish(&self, request: Option<&AllocationRequest>, result: &AllocationResult) {
        counter!("tpsctl_allocations_total", "outcome" => result.outcome()).increment(1);

        match result {
            AllocationResult::Success {
                allocation_id,
                total_allocated_tps,
                per_carrier,
                ..
            } => info!(%allocation_id, %total_allocated_tps, carriers = per_carrier.len(), "Allocation approved"),
            AllocationResult::Rejected { allocation_id, reason } => {
                info!(%allocation_id, reason = reason.code(), "Allocation rejected: {}", reason)
            }
        }

        if let Err(e) = self.audit.record(AuditRecord::new(request, result)).await {
            warn!(allocation_id = %result.allocation_id(), "Failed to write audit record: {:#}", e);
        }
    }
}
