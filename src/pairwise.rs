use crate::assignment::AssignmentSolver;
use crate::distance::DistanceMetric;
use crate::error::{AlignError, Result};
use crate::matrix::MembershipMatrix;

/// Optimal column matching between two replicates of the same K.
///
/// `permutation[c]` is the column of the second matrix matched to column `c` of the first,
/// so `second.permute_columns(&permutation)` is the second matrix in the first one's order.
#[derive(Debug, Clone, PartialEq)]
pub struct PairAlignment {
    pub permutation: Vec<usize>,
    pub cost: f64,
}

/// Align `right` onto `left` under `metric`, minimizing the summed column distance
pub fn align_pair(
    left: &MembershipMatrix,
    right: &MembershipMatrix,
    metric: DistanceMetric,
    solver: &dyn AssignmentSolver,
) -> Result<PairAlignment> {
    if left.rows() != right.rows() || left.cols() != right.cols() {
        return Err(AlignError::InputMismatch {
            context: "pairwise alignment requires equal K and individual counts".to_string(),
            left_rows: left.rows(),
            left_cols: left.cols(),
            right_rows: right.rows(),
            right_cols: right.cols(),
        });
    }
    let grid = metric.column_grid(left, right);
    let assignment = solver.solve(&grid)?;
    Ok(PairAlignment {
        permutation: assignment.columns,
        cost: assignment.cost,
    })
}
