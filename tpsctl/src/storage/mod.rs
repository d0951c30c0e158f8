use std::future::Future;

use rust_decimal::Decimal;
use thiserror::Error;

use crate::allocation::CarrierAllocation;
use crate::carrier::CarrierCapacityRecord;
use crate::types::CarrierId;

pub mod in_memory;

#[cfg(feature = "postgres")]
pub mod postgres;


pub use in_memory::InMemoryCapacityStore;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Carrier not found: {0}")]
    NotFound(CarrierId),

    /// The plan names a carrier the store does not hold, usually because a refresh removed it.
    #[error("Unknown carrier in plan: {0}")]
    UnknownCarrier(CarrierId),

    /// Another commit consumed the headroom between snapshot and commit.
    #[error("Insufficient capacity on {carrier_id}: requested {requested}, available {available}")]
    InsufficientCapacity {
        carrier_id: CarrierId,
        requested: Decimal,
        available: Decimal,
    },

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[cfg(feature = "postgres")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Shared carrier capacity state.
///
/// All reads go through [`snapshot`](CapacityStore::snapshot) and all headroom mutation goes
/// through [`commit`](CapacityStore::commit); [`refresh`](CapacityStore::refresh) is reserved
/// for the periodic job that rebuilds records from usage data.
pub trait CapacityStore: Send + Sync + 'static {
    /// Every carrier record, ordered by `carrier_id`.
    ///
    /// Each record is internally consistent; records may come from slightly different moments.
    fn snapshot(&self) -> impl Future<Output = Result<Vec<CarrierCapacityRecord>>> + Send;

    fn get(&self, carrier_id: &str) -> impl Future<Output = Result<CarrierCapacityRecord>> + Send;

    /// Atomically subtract every share in `plan` from its carrier's headroom.
    ///
    /// Either every share is applied or none is. A share larger than the carrier's current
    /// `allocatable_tps` fails the whole commit with [`StoreError::InsufficientCapacity`].
    /// Applied headroom is floored at zero. Returns the updated records.
    fn commit(&self, plan: &[CarrierAllocation]) -> impl Future<Output = Result<Vec<CarrierCapacityRecord>>> + Send;

    /// Replace the carrier set with `records`. Returns how many records are now held.
    ///
    /// Incoming headroom does not know about this store's commits. For every carrier already
    /// held, the total committed against it so far is subtracted from the new
    /// `allocatable_tps` (floored at zero), so a refresh never hands committed capacity out
    /// twice. Carriers missing from `records` are dropped along with their committed total.
    fn refresh(&self, records: Vec<CarrierCapacityRecord>) -> impl Future<Output = Result<usize>> + Send;
}

/// Reject plans the committer must never apply: empty, non-positive or repeated shares.
pub(crate) fn validate_plan(plan: &[CarrierAllocation]) -> Result<()> {
    if plan.is_empty() {
        return Err(StoreError::InvalidPlan("plan is empty".to_string()));
    }
    for (i, share) in plan.iter().enumerate() {
        if share.allocated_tps <= Decimal::ZERO {
            return Err(StoreError::InvalidPlan(format!(
                "non-positive share {} for {}",
                share.allocated_tps, share.carrier_id
            )));
        }
        if plan[..i].iter().any(|earlier| earlier.carrier_id == share.carrier_id) {
            return Err(StoreError::InvalidPlan(format!("carrier {} appears twice", share.carrier_id)));
        }
    }
    Ok(())
}

/// Normalise a record from the refresh job before it is stored.
pub(crate) fn normalise_record(mut record: CarrierCapacityRecord) -> CarrierCapacityRecord {
    record.allocatable_tps = crate::types::floor_tps(record.allocatable_tps.max(Decimal::ZERO));
    record
}
