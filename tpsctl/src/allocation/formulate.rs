//! Turning eligible carriers into a linear program, and a solution back into a plan.
//!
//! For eligible carriers `i = 1..n` and requested destinations `d = 1..k`:
//!
//! ```text
//! minimize    Σ x_i
//! subject to  Σ x_i = requested_tps
//!             Σ_{i serves d} x_i >= requested_tps / k     for every d
//!             0 <= x_i <= allocatable_tps_i
//! ```
//!
//! The sum is already fixed by the equality, so the objective only breaks ties.

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

use crate::carrier::CarrierCapacityRecord;
use crate::request::AllocationRequest;
use crate::solver::{LinearProgram, SolveError};
use crate::types::{CarrierId, tps_from_f64};

use super::CarrierAllocation;

/// Relative slack allowed when checking a solver's answer against the program.
const FEASIBILITY_TOLERANCE: f64 = 1e-6;

/// A linear program plus the carrier behind each of its variables.
#[derive(Debug, Clone, PartialEq)]
pub struct AllocationProgram {
    pub carriers: Vec<CarrierId>,
    pub program: LinearProgram,
}

pub fn formulate(eligible: &[CarrierCapacityRecord], request: &AllocationRequest) -> Result<AllocationProgram, SolveError> {
    let n = eligible.len();
    let requested = to_f64(request.requested_tps)?;

    let mut program = LinearProgram::new(vec![1.0; n]);
    for (i, carrier) in eligible.iter().enumerate() {
        program.set_bounds(i, 0.0, to_f64(carrier.allocatable_tps)?);
    }

    program.add_equality(vec![1.0; n], requested);

    let share = requested / request.destinations.len() as f64;
    for destination in &request.destinations {
        let row = eligible
            .iter()
            .map(|c| if c.supports(destination) { 1.0 } else { 0.0 })
            .collect();
        program.add_lower_bound(row, share);
    }

    Ok(AllocationProgram {
        carriers: eligible.iter().map(|c| c.carrier_id.clone()).collect(),
        program,
    })
}

impl AllocationProgram {
    /// Check a raw solution and round it into per-carrier shares.
    ///
    /// Zero shares are dropped; carrier order follows the program's variable order.
    pub fn plan_from_solution(&self, x: &[f64]) -> Result<Vec<CarrierAllocation>, SolveError> {
        let scale = self.program.b_eq.iter().fold(1.0_f64, |acc, b| acc.max(b.abs()));
        if !self.program.is_satisfied_by(x, FEASIBILITY_TOLERANCE * scale) {
            return Err(SolveError::Numerical("solution violates the program it was solved for".to_string()));
        }

        let mut plan = Vec::with_capacity(self.carriers.len());
        for (carrier_id, value) in self.carriers.iter().zip(x) {
            let allocated_tps =
                tps_from_f64(*value).ok_or_else(|| SolveError::Numerical(format!("share {value} for {carrier_id}")))?;
            if allocated_tps > Decimal::ZERO {
                plan.push(CarrierAllocation {
                    carrier_id: carrier_id.clone(),
                    allocated_tps,
                });
            }
        }

        if plan.is_empty() {
            return Err(SolveError::Numerical("solution allocates nothing".to_string()));
        }
        Ok(plan)
    }
}

fn to_f64(value: Decimal) -> Result<f64, SolveError> {
    value
        .to_f64()
        .filter(|v| v.is_finite())
        .ok_or_else(|| SolveError::Malformed(format!("{value} is not representable as f64")))
}
