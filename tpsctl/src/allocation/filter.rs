//! Carrier eligibility.
//!
//! Three stages run in a fixed order and each one only narrows the set left by the one before:
//!
//! 1. destination coverage: the carrier serves at least one requested country
//! 2. headroom: `allocatable_tps > 0`
//! 3. peak overlap: the carrier's peak window overlaps the requested one
//!
//! The first stage to empty the set decides the rejection.

use crate::carrier::CarrierCapacityRecord;
use crate::request::AllocationRequest;

use super::RejectionReason;

/// Select the carriers allowed to take part in `request`.
///
/// Pure function of its inputs; snapshot order is preserved.
pub fn filter_eligible(
    snapshot: &[CarrierCapacityRecord],
    request: &AllocationRequest,
) -> Result<Vec<CarrierCapacityRecord>, RejectionReason> {
    let covering: Vec<&CarrierCapacityRecord> =
        snapshot.iter().filter(|c| c.supports_any(&request.destinations)).collect();
    if covering.is_empty() {
        return Err(RejectionReason::NoCarrierForDestinations);
    }

    let with_headroom: Vec<&CarrierCapacityRecord> = covering.into_iter().filter(|c| c.has_headroom()).collect();
    if with_headroom.is_empty() {
        return Err(RejectionReason::NoCapacityAvailable);
    }

    let overlapping: Vec<CarrierCapacityRecord> = with_headroom
        .into_iter()
        .filter(|c| c.peak_window.overlaps(&request.peak_window))
        .cloned()
        .collect();
    if overlapping.is_empty() {
        return Err(RejectionReason::NoPeakWindowOverlap);
    }

    Ok(overlapping)
}
