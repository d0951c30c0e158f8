//! Dense two-phase primal simplex with Bland's rule.
//!
//! Variables are shifted so every lower bound is zero and finite upper bounds become explicit
//! `<=` rows. Phase one drives a sum of artificial variables to zero to find a feasible basis;
//! phase two optimises the real objective from there. Bland's smallest-index rule is used for
//! both the entering and the leaving variable, which rules out cycling on degenerate vertices.
//!
//! Allocation programs have one column per eligible carrier and a handful of rows, so a dense
//! tableau is plenty.

use tracing::trace;

use super::{LinearProgram, LpSolver, SolveError};

/// Default pivot budget across both phases.
pub const DEFAULT_MAX_ITERATIONS: usize = 100_000;

const PIVOT_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowKind {
    Le,
    Ge,
    Eq,
}

#[derive(Debug, Clone)]
pub struct SimplexSolver {
    max_iterations: usize,
}

impl SimplexSolver {
    pub fn new(max_iterations: usize) -> Self {
        Self { max_iterations }
    }
}

impl Default for SimplexSolver {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ITERATIONS)
    }
}

impl LpSolver for SimplexSolver {
    fn solve(&self, program: &LinearProgram) -> Result<Vec<f64>, SolveError> {
        program.validate()?;
        let n = program.num_vars();
        let lower: Vec<f64> = program.bounds.iter().map(|(lo, _)| *lo).collect();

        for (i, (lo, hi)) in program.bounds.iter().enumerate() {
            if *hi < *lo - PIVOT_TOLERANCE {
                trace!(var = i, lo, hi, "Empty variable range");
                return Err(SolveError::Infeasible);
            }
        }

        // Rows in terms of the shifted variables y = x - lo, all y >= 0
        let shift = |row: &[f64], rhs: f64| rhs - row.iter().zip(&lower).map(|(a, lo)| a * lo).sum::<f64>();
        let mut rows: Vec<(Vec<f64>, RowKind, f64)> = Vec::new();
        for (row, b) in program.a_ub.iter().zip(&program.b_ub) {
            rows.push((row.clone(), RowKind::Le, shift(row, *b)));
        }
        for (row, b) in program.a_eq.iter().zip(&program.b_eq) {
            rows.push((row.clone(), RowKind::Eq, shift(row, *b)));
        }
        for (i, (lo, hi)) in program.bounds.iter().enumerate() {
            if hi.is_finite() {
                let mut row = vec![0.0; n];
                row[i] = 1.0;
                rows.push((row, RowKind::Le, (hi - lo).max(0.0)));
            }
        }

        if rows.is_empty() {
            // Only y >= 0 applies: optimal at the origin unless some cost is negative
            if program.objective.iter().any(|c| *c < -PIVOT_TOLERANCE) {
                return Err(SolveError::Unbounded);
            }
            return Ok(lower);
        }

        // Every right-hand side must be non-negative for the starting basis
        for (row, kind, rhs) in rows.iter_mut() {
            if *rhs < 0.0 {
                row.iter_mut().for_each(|a| *a = -*a);
                *rhs = -*rhs;
                *kind = match kind {
                    RowKind::Le => RowKind::Ge,
                    RowKind::Ge => RowKind::Le,
                    RowKind::Eq => RowKind::Eq,
                };
            }
        }

        let slack_count = rows.iter().filter(|(_, k, _)| *k != RowKind::Eq).count();
        let artificial_count = rows.iter().filter(|(_, k, _)| *k != RowKind::Le).count();
        let artificial_start = n + slack_count;
        let width = artificial_start + artificial_count;

        let mut tableau = Tableau::new(rows.len(), width);
        let mut next_slack = n;
        let mut next_artificial = artificial_start;
        for (r, (row, kind, rhs)) in rows.iter().enumerate() {
            tableau.cells[r][..n].copy_from_slice(row);
            tableau.cells[r][width] = *rhs;
            match kind {
                RowKind::Le => {
                    tableau.cells[r][next_slack] = 1.0;
                    tableau.basis[r] = next_slack;
                    next_slack += 1;
                }
                RowKind::Ge => {
                    tableau.cells[r][next_slack] = -1.0;
                    next_slack += 1;
                    tableau.cells[r][next_artificial] = 1.0;
                    tableau.basis[r] = next_artificial;
                    next_artificial += 1;
                }
                RowKind::Eq => {
                    tableau.cells[r][next_artificial] = 1.0;
                    tableau.basis[r] = next_artificial;
                    next_artificial += 1;
                }
            }
        }

        let mut iterations = 0usize;

        if artificial_count > 0 {
            let mut phase_one_cost = vec![0.0; width];
            phase_one_cost[artificial_start..].iter_mut().for_each(|c| *c = 1.0);
            self.optimise(&mut tableau, &phase_one_cost, width, &mut iterations)?;

            let scale = 1.0 + rows.iter().map(|(_, _, rhs)| rhs.abs()).fold(0.0, f64::max);
            let infeasibility = tableau.objective(&phase_one_cost);
            if infeasibility > 1e-7 * scale {
                trace!(infeasibility, iterations, "Phase one ended with artificial mass");
                return Err(SolveError::Infeasible);
            }

            // Pivot any zero-valued artificial out of the basis where a real column allows it.
            // Rows where none does are redundant and keep their artificial at zero.
            for r in 0..tableau.basis.len() {
                if tableau.basis[r] >= artificial_start
                    && let Some(j) = (0..artificial_start).find(|&j| tableau.cells[r][j].abs() > PIVOT_TOLERANCE)
                {
                    tableau.pivot(r, j);
                }
            }
        }

        let mut phase_two_cost = vec![0.0; width];
        phase_two_cost[..n].copy_from_slice(&program.objective);
        self.optimise(&mut tableau, &phase_two_cost, artificial_start, &mut iterations)?;
        trace!(iterations, "Simplex converged");

        let mut x = lower;
        for (r, &column) in tableau.basis.iter().enumerate() {
            if column < n {
                x[column] += tableau.cells[r][width].max(0.0);
            }
        }

        if x.iter().any(|v| !v.is_finite()) {
            return Err(SolveError::Numerical("non-finite value in solution".to_string()));
        }
        Ok(x)
    }
}

impl SimplexSolver {
    /// Run primal simplex iterations for `cost`, considering only the first `eligible` columns
    /// as entering candidates.
    fn optimise(&self, tableau: &mut Tableau, cost: &[f64], eligible: usize, iterations: &mut usize) -> Result<(), SolveError> {
        loop {
            let Some(entering) = (0..eligible)
                .filter(|j| !tableau.basis.contains(j))
                .find(|&j| tableau.reduced_cost(cost, j) < -PIVOT_TOLERANCE)
            else {
                return Ok(());
            };

            if *iterations >= self.max_iterations {
                return Err(SolveError::IterationLimit(self.max_iterations));
            }

            let leaving = tableau.ratio_test(entering).ok_or(SolveError::Unbounded)?;
            tableau.pivot(leaving, entering);
            *iterations += 1;
        }
    }
}

/// Constraint rows plus a trailing right-hand-side column.
struct Tableau {
    cells: Vec<Vec<f64>>,
    basis: Vec<usize>,
    rhs: usize,
}

impl Tableau {
    fn new(rows: usize, width: usize) -> Self {
        Self {
            cells: vec![vec![0.0; width + 1]; rows],
            basis: vec![0; rows],
            rhs: width,
        }
    }

    fn reduced_cost(&self, cost: &[f64], column: usize) -> f64 {
        let basic: f64 = self
            .basis
            .iter()
            .zip(&self.cells)
            .map(|(&b, row)| cost[b] * row[column])
            .sum();
        cost[column] - basic
    }

    fn objective(&self, cost: &[f64]) -> f64 {
        self.basis.iter().zip(&self.cells).map(|(&b, row)| cost[b] * row[self.rhs]).sum()
    }

    /// Minimum-ratio row for `column`, ties broken by the smallest basic index.
    fn ratio_test(&self, column: usize) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for (r, row) in self.cells.iter().enumerate() {
            let a = row[column];
            if a <= PIVOT_TOLERANCE {
                continue;
            }
            let ratio = (row[self.rhs] / a).max(0.0);
            let replace = match best {
                None => true,
                Some((br, b)) => ratio < b - PIVOT_TOLERANCE || (ratio <= b + PIVOT_TOLERANCE && self.basis[r] < self.basis[br]),
            };
            if replace {
                best = Some((r, ratio));
            }
        }
        best.map(|(r, _)| r)
    }

    fn pivot(&mut self, row: usize, column: usize) {
        let p = self.cells[row][column];
        self.cells[row].iter_mut().for_each(|v| *v /= p);
        let pivot_row = self.cells[row].clone();

        for (r, cells) in self.cells.iter_mut().enumerate() {
            if r == row {
                continue;
            }
            let factor = cells[column];
            if factor != 0.0 {
                cells.iter_mut().zip(&pivot_row).for_each(|(v, pv)| *v -= factor * pv);
            }
        }
        self.basis[row] = column;
    }
}
