//! The allocation pipeline.
//!
//! An allocation moves through a fixed sequence of states, enforced at compile time with
//! the typestate pattern (see [`types`]):
//!
//! ```text
//! Received -> Filtered -> Formulated -> Solved -> Committed
//!     |           |            |           |
//!     +-----------+------------+-----------+----> Rejected
//! ```
//!
//! Every transition either advances the allocation or ends it with a [`RejectionReason`].
//! The stages themselves live in [`filter`] and [`formulate`]; the glue that moves an
//! [`Allocation`] between states lives in [`transitions`].

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

use crate::types::{AllocationId, CarrierId};

pub mod filter;
pub mod formulate;
pub mod transitions;
pub mod types;

pub use filter::filter_eligible;
pub use formulate::{AllocationProgram, formulate};
pub use types::{Allocation, AllocationState, Committed, Filtered, Formulated, Received, Solved};

/// Why an allocation request was turned down.
///
/// The `Display` text is the message returned to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectionReason {
    #[error("No carriers found supporting the requested destinations")]
    NoCarrierForDestinations,

    #[error("No carriers found supporting the requested TPS")]
    NoCapacityAvailable,

    #[error("No carriers found supporting the requested peak times")]
    NoPeakWindowOverlap,

    #[error("Could not allocate TPS under current constraints")]
    NoFeasibleAllocation,

    #[error("Malformed allocation request: {0}")]
    MalformedRequest(String),
}

impl RejectionReason {
    /// Stable machine-readable code, used on the wire and as a metrics label.
    pub fn code(&self) -> &'static str {
        match self {
            RejectionReason::NoCarrierForDestinations => "no_carrier_for_destinations",
            RejectionReason::NoCapacityAvailable => "no_capacity_available",
            RejectionReason::NoPeakWindowOverlap => "no_peak_window_overlap",
            RejectionReason::NoFeasibleAllocation => "no_feasible_allocation",
            RejectionReason::MalformedRequest(_) => "malformed_request",
        }
    }
}

/// TPS granted to one carrier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarrierAllocation {
    #[serde(rename = "carrier")]
    pub carrier_id: CarrierId,
    #[serde(with = "rust_decimal::serde::float")]
    pub allocated_tps: Decimal,
}

/// Outcome of one allocation request.
#[derive(Debug, Clone, PartialEq)]
pub enum AllocationResult {
    Success {
        allocation_id: AllocationId,
        total_requested_tps: Decimal,
        /// Sum of `per_carrier`
        total_allocated_tps: Decimal,
        /// Only carriers with a positive share, in snapshot order
        per_carrier: Vec<CarrierAllocation>,
    },
    Rejected {
        allocation_id: AllocationId,
        reason: RejectionReason,
    },
}

impl AllocationResult {
    pub fn allocation_id(&self) -> AllocationId {
        match self {
            AllocationResult::Success { allocation_id, .. } | AllocationResult::Rejected { allocation_id, .. } => {
                *allocation_id
            }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, AllocationResult::Success { .. })
    }

    pub fn rejection(&self) -> Option<&RejectionReason> {
        match self {
            AllocationResult::Rejected { reason, .. } => Some(reason),
            AllocationResult::Success { .. } => None,
        }
    }

    /// `"success"` or the rejection code; used as the outcome label on metrics.
    pub fn outcome(&self) -> &'static str {
        match self {
            AllocationResult::Success { .. } => "success",
            AllocationResult::Rejected { reason, .. } => reason.code(),
        }
    }
}

/// Wire form of [`AllocationResult`].
#[derive(Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
enum WireResult<'a> {
    Success {
        allocation_id: AllocationId,
        #[serde(with = "rust_decimal::serde::float")]
        total_requested_tps: Decimal,
        #[serde(with = "rust_decimal::serde::float")]
        total_allocated_tps: Decimal,
        allocations: &'a [CarrierAllocation],
    },
    Failure {
        allocation_id: AllocationId,
        reason: &'static str,
        message: String,
    },
}

impl Serialize for AllocationResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let wire = match self {
            AllocationResult::Success {
                allocation_id,
                total_requested_tps,
                total_allocated_tps,
                per_carrier,
            } => WireResult::Success {
                allocation_id: *allocation_id,
                total_requested_tps: *total_requested_tps,
                total_allocated_tps: *total_allocated_tps,
                allocations: per_carrier,
            },
            AllocationResult::Rejected { allocation_id, reason } => WireResult::Failure {
                allocation_id: *allocation_id,
                reason: reason.code(),
                message: reason.to_string(),
            },
        };
        wire.serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn test_success_wire_shape() {
        let id = Uuid::nil();
        let result = AllocationResult::Success {
            allocation_id: id,
            total_requested_tps: dec!(50),
            total_allocated_tps: dec!(50),
            per_carrier: vec![
                CarrierAllocation {
                    carrier_id: "carrier-a".to_string(),
                    allocated_tps: dec!(24.5),
                },
                CarrierAllocation {
                    carrier_id: "carrier-b".to_string(),
                    allocated_tps: dec!(25.5),
                },
            ],
        };

        assert_eq!(
            serde_json::to_value(&result).unwrap(),
            json!({
                "status": "success",
                "allocation_id": id,
                "total_requested_tps": 50.0,
                "total_allocated_tps": 50.0,
                "allocations": [
                    {"carrier": "carrier-a", "allocated_tps": 24.5},
                    {"carrier": "carrier-b", "allocated_tps": 25.5}
                ]
            })
        );
    }

    #[test]
    fn test_failure_wire_shape() {
        let result = AllocationResult::Rejected {
            allocation_id: Uuid::nil(),
            reason: RejectionReason::NoPeakWindowOverlap,
        };

        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["status"], "failure");
        assert_eq!(value["reason"], "no_peak_window_overlap");
        assert_eq!(value["message"], "No carriers found supporting the requested peak times");
        assert_eq!(result.outcome(), "no_peak_window_overlap");
        assert!(!result.is_success());
    }

    #[test]
    fn test_rejection_messages() {
        assert_eq!(
            RejectionReason::NoCarrierForDestinations.to_string(),
            "No carriers found supporting the requested destinations"
        );
        assert_eq!(RejectionReason::NoCapacityAvailable.to_string(), "No carriers found supporting the requested TPS");
        assert_eq!(
            RejectionReason::NoFeasibleAllocation.to_string(),
            "Could not allocate TPS under current constraints"
        );
        assert_eq!(
            RejectionReason::MalformedRequest("missing required field `destinations`".to_string()).to_string(),
            "Malformed allocation request: missing required field `destinations`"
        );
    }
}
