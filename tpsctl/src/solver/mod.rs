//! Linear-program model and the solver seam.
//!
//! Programs use the familiar `linprog` layout:
//!
//! ```text
//! minimize    c · x
//! subject to  A_ub · x <= b_ub
//!             A_eq · x == b_eq
//!             lo_i <= x_i <= hi_i
//! ```
//!
//! [`LpSolver`] is a pure function of its input, so the engine is free to run it on the
//! blocking pool. The bundled implementation is [`SimplexSolver`].

use thiserror::Error;

pub mod simplex;

pub use simplex::SimplexSolver;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SolveError {
    #[error("problem is infeasible")]
    Infeasible,

    #[error("problem is unbounded")]
    Unbounded,

    #[error("iteration limit of {0} pivots reached")]
    IterationLimit(usize),

    #[error("numerical failure: {0}")]
    Numerical(String),

    #[error("malformed program: {0}")]
    Malformed(String),
}

/// A linear program over `objective.len()` variables.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearProgram {
    pub objective: Vec<f64>,
    pub a_ub: Vec<Vec<f64>>,
    pub b_ub: Vec<f64>,
    pub a_eq: Vec<Vec<f64>>,
    pub b_eq: Vec<f64>,
    /// Per-variable `(lo, hi)`. `hi` may be `f64::INFINITY`; `lo` must be finite.
    pub bounds: Vec<(f64, f64)>,
}

impl LinearProgram {
    /// A program with the given objective and no constraints; every variable is `>= 0`.
    pub fn new(objective: Vec<f64>) -> Self {
        let bounds = vec![(0.0, f64::INFINITY); objective.len()];
        Self {
            objective,
            a_ub: Vec::new(),
            b_ub: Vec::new(),
            a_eq: Vec::new(),
            b_eq: Vec::new(),
            bounds,
        }
    }

    pub fn num_vars(&self) -> usize {
        self.objective.len()
    }

    /// Add `row · x <= rhs`.
    pub fn add_upper_bound(&mut self, row: Vec<f64>, rhs: f64) {
        self.a_ub.push(row);
        self.b_ub.push(rhs);
    }

    /// Add `row · x >= rhs`, stored as `-row · x <= -rhs`.
    pub fn add_lower_bound(&mut self, row: Vec<f64>, rhs: f64) {
        self.a_ub.push(row.into_iter().map(|a| -a).collect());
        self.b_ub.push(-rhs);
    }

    /// Add `row · x == rhs`.
    pub fn add_equality(&mut self, row: Vec<f64>, rhs: f64) {
        self.a_eq.push(row);
        self.b_eq.push(rhs);
    }

    pub fn set_bounds(&mut self, var: usize, lo: f64, hi: f64) {
        self.bounds[var] = (lo, hi);
    }

    /// Check dimensions and that every coefficient is finite.
    pub fn validate(&self) -> Result<(), SolveError> {
        let n = self.num_vars();
        if n == 0 {
            return Err(SolveError::Malformed("no decision variables".to_string()));
        }
        if self.bounds.len() != n {
            return Err(SolveError::Malformed(format!("{} bounds for {} variables", self.bounds.len(), n)));
        }
        if self.a_ub.len() != self.b_ub.len() || self.a_eq.len() != self.b_eq.len() {
            return Err(SolveError::Malformed("constraint rows and right-hand sides differ in length".to_string()));
        }
        if self.a_ub.iter().chain(self.a_eq.iter()).any(|row| row.len() != n) {
            return Err(SolveError::Malformed("constraint row width does not match variable count".to_string()));
        }

        let all_finite = self
            .objective
            .iter()
            .chain(self.b_ub.iter())
            .chain(self.b_eq.iter())
            .chain(self.a_ub.iter().flatten())
            .chain(self.a_eq.iter().flatten())
            .all(|v| v.is_finite());
        if !all_finite {
            return Err(SolveError::Malformed("non-finite coefficient".to_string()));
        }

        for (i, (lo, hi)) in self.bounds.iter().enumerate() {
            if !lo.is_finite() || hi.is_nan() {
                return Err(SolveError::Malformed(format!("variable {i} has unsupported bounds ({lo}, {hi})")));
            }
        }

        Ok(())
    }

    /// True if `x` satisfies every constraint and bound within `tolerance`.
    pub fn is_satisfied_by(&self, x: &[f64], tolerance: f64) -> bool {
        if x.len() != self.num_vars() {
            return false;
        }
        let dot = |row: &[f64]| row.iter().zip(x).map(|(a, v)| a * v).sum::<f64>();

        let bounds_ok = self.bounds.iter().zip(x).all(|((lo, hi), v)| *v >= lo - tolerance && *v <= hi + tolerance);
        let ub_ok = self.a_ub.iter().zip(&self.b_ub).all(|(row, b)| dot(row) <= b + tolerance);
        let eq_ok = self.a_eq.iter().zip(&self.b_eq).all(|(row, b)| (dot(row) - b).abs() <= tolerance);

        bounds_ok && ub_ok && eq_ok
    }

    pub fn objective_value(&self, x: &[f64]) -> f64 {
        self.objective.iter().zip(x).map(|(c, v)| c * v).sum()
    }
}

/// A solver that returns an optimal feasible point or explains why there is none.
pub trait LpSolver: Send + Sync {
    fn solve(&self, program: &LinearProgram) -> Result<Vec<f64>, SolveError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lower_bound_is_stored_negated() {
        let mut lp = LinearProgram::new(vec![1.0, 1.0]);
        lp.add_lower_bound(vec![1.0, 0.0], 5.0);
        assert_eq!(lp.a_ub, vec![vec![-1.0, -0.0]]);
        assert_eq!(lp.b_ub, vec![-5.0]);
        assert!(lp.is_satisfied_by(&[5.0, 0.0], 1e-9));
        assert!(!lp.is_satisfied_by(&[4.0, 0.0], 1e-9));
    }

    #[test]
    fn test_validate_rejects_shape_errors() {
        let mut lp = LinearProgram::new(vec![1.0, 1.0]);
        lp.add_equality(vec![1.0], 2.0);
        assert!(matches!(lp.validate(), Err(SolveError::Malformed(_))));

        let mut lp = LinearProgram::new(vec![1.0]);
        lp.set_bounds(0, f64::NEG_INFINITY, 1.0);
        assert!(matches!(lp.validate(), Err(SolveError::Malformed(_))));

        assert!(matches!(LinearProgram::new(vec![]).validate(), Err(SolveError::Malformed(_))));
    }
}
