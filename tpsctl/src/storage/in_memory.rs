//! In-memory capacity store.
//!
//! Each carrier record sits behind its own lock, so commits touching disjoint carriers do not
//! contend. A commit locks every carrier in its plan in `carrier_id` order before checking any
//! of them, which keeps concurrent commits deadlock-free and makes check-then-apply atomic.
//!
//! Every cell also tracks how much the store has handed out for its carrier. A refresh brings
//! in headroom as the profile source sees it, which knows nothing about those commits, so the
//! committed total is carried into the new record and subtracted from it. State is lost on
//! restart.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use tracing::{debug, trace};

use crate::allocation::CarrierAllocation;
use crate::carrier::CarrierCapacityRecord;
use crate::types::CarrierId;

use super::{CapacityStore, Result, StoreError, normalise_record, validate_plan};

struct CarrierState {
    record: CarrierCapacityRecord,
    /// Sum of every share committed against this carrier since it was first loaded
    committed_tps: Decimal,
}

impl CarrierState {
    /// A freshly loaded record, net of what was already committed against the carrier.
    fn net_of(mut record: CarrierCapacityRecord, committed_tps: Decimal) -> Self {
        record.allocatable_tps = (record.allocatable_tps - committed_tps).max(Decimal::ZERO);
        Self { record, committed_tps }
    }
}

type CarrierCell = Arc<Mutex<CarrierState>>;

#[derive(Clone, Default)]
pub struct InMemoryCapacityStore {
    carriers: Arc<RwLock<BTreeMap<CarrierId, CarrierCell>>>,
}

impl InMemoryCapacityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store preloaded with `records`.
    pub fn with_records(records: impl IntoIterator<Item = CarrierCapacityRecord>) -> Self {
        let store = Self::new();
        store.replace_all(records);
        store
    }

    fn replace_all(&self, records: impl IntoIterator<Item = CarrierCapacityRecord>) -> usize {
        // The write lock waits out in-flight commits, so no committed share is missed
        let mut carriers = self.carriers.write();

        let fresh: BTreeMap<CarrierId, CarrierCell> = records
            .into_iter()
            .map(normalise_record)
            .map(|record| {
                let committed_tps = carriers
                    .get(&record.carrier_id)
                    .map(|cell| cell.lock().committed_tps)
                    .unwrap_or_default();
                (record.carrier_id.clone(), Arc::new(Mutex::new(CarrierState::net_of(record, committed_tps))))
            })
            .collect();

        let count = fresh.len();
        *carriers = fresh;
        count
    }

    fn commit_locked(&self, plan: &[CarrierAllocation]) -> Result<Vec<CarrierCapacityRecord>> {
        validate_plan(plan)?;

        // Hold the map read lock so a refresh cannot swap carriers out mid-commit
        let carriers = self.carriers.read();

        let mut shares: Vec<&CarrierAllocation> = plan.iter().collect();
        shares.sort_by(|a, b| a.carrier_id.cmp(&b.carrier_id));

        let mut guards = Vec::with_capacity(shares.len());
        for share in &shares {
            let cell = carriers
                .get(&share.carrier_id)
                .ok_or_else(|| StoreError::UnknownCarrier(share.carrier_id.clone()))?;
            guards.push(cell.lock());
        }

        for (share, state) in shares.iter().zip(&guards) {
            if share.allocated_tps > state.record.allocatable_tps {
                return Err(StoreError::InsufficientCapacity {
                    carrier_id: share.carrier_id.clone(),
                    requested: share.allocated_tps,
                    available: state.record.allocatable_tps,
                });
            }
        }

        let mut updated = Vec::with_capacity(guards.len());
        for (share, state) in shares.iter().zip(guards.iter_mut()) {
            state.record.allocatable_tps = (state.record.allocatable_tps - share.allocated_tps).max(Decimal::ZERO);
            state.committed_tps += share.allocated_tps;
            trace!(
                carrier = %state.record.carrier_id,
                remaining = %state.record.allocatable_tps,
                committed = %state.committed_tps,
                "Applied share"
            );
            updated.push(state.record.clone());
        }

        Ok(updated)
    }
}

impl CapacityStore for InMemoryCapacityStore {
    async fn snapshot(&self) -> Result<Vec<CarrierCapacityRecord>> {
        let carriers = self.carriers.read();
        Ok(carriers.values().map(|cell| cell.lock().record.clone()).collect())
    }

    async fn get(&self, carrier_id: &str) -> Result<CarrierCapacityRecord> {
        let carriers = self.carriers.read();
        carriers
            .get(carrier_id)
            .map(|cell| cell.lock().record.clone())
            .ok_or_else(|| StoreError::NotFound(carrier_id.to_string()))
    }

    async fn commit(&self, plan: &[CarrierAllocation]) -> Result<Vec<CarrierCapacityRecord>> {
        self.commit_locked(plan)
    }

    async fn refresh(&self, records: Vec<CarrierCapacityRecord>) -> Result<usize> {
        let count = self.replace_all(records);
        debug!(carriers = count, "Replaced in-memory carrier set");
        Ok(count)
    }
}
