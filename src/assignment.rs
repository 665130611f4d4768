use pathfinding::kuhn_munkres::kuhn_munkres_min;
use pathfinding::matrix::Matrix;

use crate::error::{AlignError, Result};

/// Fixed-point scale used to hand `f64` costs to the integer Hungarian solver
const COST_SCALE: f64 = 1e12;

/// Result of a linear assignment: `columns[r]` is the column assigned to row `r`
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub columns: Vec<usize>,
    pub cost: f64,
}

/// Optimal linear assignment over a `rows × cols` cost grid with `rows <= cols`.
///
/// Every row receives a distinct column; the total cost is minimal.
pub trait AssignmentSolver: Send + Sync {
    fn solve(&self, costs: &[Vec<f64>]) -> Result<Assignment>;
}

/// Kuhn-Munkres (Hungarian) backend
#[derive(Debug, Default, Clone, Copy)]
pub struct HungarianSolver;

impl AssignmentSolver for HungarianSolver {
    fn solve(&self, costs: &[Vec<f64>]) -> Result<Assignment> {
        let rows = costs.len();
        let cols = costs.first().map(|r| r.len()).unwrap_or(0);
        if rows == 0 {
            return Ok(Assignment {
                columns: Vec::new(),
                cost: 0.0,
            });
        }
        if rows > cols || costs.iter().any(|r| r.len() != cols) {
            return Err(AlignError::InputMismatch {
                context: "assignment grid must be rectangular with rows <= columns".to_string(),
                left_rows: rows,
                left_cols: cols,
                right_rows: rows,
                right_cols: cols,
            });
        }
        let mut scaled = Vec::with_capacity(rows * cols);
        for row in costs {
            for &c in row {
                if !c.is_finite() || c < 0.0 {
                    return Err(AlignError::InvalidMatrix {
                        context: "assignment grid".to_string(),
                        reason: format!("cost {} is not a finite non-negative value", c),
                    });
                }
                scaled.push((c * COST_SCALE).round() as i64);
            }
        }
        let weights = Matrix::from_vec(rows, cols, scaled).map_err(|e| AlignError::InvalidMatrix {
            context: "assignment grid".to_string(),
            reason: format!("{:?}", e),
        })?;
        let (_, columns) = kuhn_munkres_min(&weights);
        // Report the exact cost of the chosen assignment, not the rounded one.
        let cost = columns.iter().enumerate().map(|(r, &c)| costs[r][c]).sum();
        Ok(Assignment { columns, cost })
    }
}
