use std::collections::BTreeMap;

use rayon::prelude::*;

use crate::assignment::AssignmentSolver;
use crate::distance::DistanceMetric;
use crate::error::AlignError;
use crate::matrix::{invert_permutation, Replicate};
use crate::pairwise::{align_pair, PairAlignment};
use crate::pipeline::CancelToken;

/// Symmetric replicate-by-replicate alignment costs at one K.
///
/// A `None` cell is a pair that failed or was cancelled; it is never read as zero.
#[derive(Debug, Clone, PartialEq)]
pub struct CostMatrix {
    size: usize,
    cells: Vec<Option<f64>>,
}

impl CostMatrix {
    fn empty(size: usize) -> Self {
        let mut cells = vec![None; size * size];
        for i in 0..size {
            cells[i * size + i] = Some(0.0);
        }
        Self { size, cells }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn get(&self, i: usize, j: usize) -> Option<f64> {
        self.cells[i * self.size + j]
    }

    fn set(&mut self, i: usize, j: usize, cost: f64) {
        self.cells[i * self.size + j] = Some(cost);
        self.cells[j * self.size + i] = Some(cost);
    }

    /// Off-diagonal pairs with no cost
    pub fn gaps(&self) -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        for i in 0..self.size {
            for j in (i + 1)..self.size {
                if self.get(i, j).is_none() {
                    out.push((i, j));
                }
            }
        }
        out
    }
}

/// Why a replicate pair has no alignment
#[derive(Debug, Clone)]
pub struct PairFailure {
    pub k: usize,
    pub a: usize,
    pub b: usize,
    pub reason: String,
}

/// All pairwise alignments at one K
#[derive(Debug, Clone)]
pub struct WithinKResult {
    pub k: usize,
    /// Metric the costs were computed with
    pub metric: DistanceMetric,
    pub names: Vec<String>,
    pub costs: CostMatrix,
    /// Keyed by `(i, j)` with `i < j`
    pub alignments: BTreeMap<(usize, usize), PairAlignment>,
    pub failures: Vec<PairFailure>,
    pub cancelled: bool,
}

impl WithinKResult {
    /// Permutation mapping replicate `to`'s columns onto replicate `from`'s order.
    ///
    /// Stored pairs are `i < j`; the reverse direction is the inverse permutation.
    pub fn permutation(&self, from: usize, to: usize) -> Option<Vec<usize>> {
        if from == to {
            return Some((0..self.k).collect());
        }
        if from < to {
            self.alignments.get(&(from, to)).map(|a| a.permutation.clone())
        } else {
            self.alignments
                .get(&(to, from))
                .map(|a| invert_permutation(&a.permutation))
        }
    }

    pub fn replicate_count(&self) -> usize {
        self.names.len()
    }
}

/// Align every unordered replicate pair at one K.
///
/// Pairs run on the rayon pool. A pair that fails is recorded in `failures` and leaves its
/// cell empty; pairs not started before cancellation are left empty as well.
pub fn align_within_k(
    k: usize,
    replicates: &[Replicate],
    metric: DistanceMetric,
    solver: &dyn AssignmentSolver,
    cancel: &CancelToken,
) -> WithinKResult {
    let r = replicates.len();
    let pairs: Vec<(usize, usize)> = (0..r)
        .flat_map(|i| ((i + 1)..r).map(move |j| (i, j)))
        .collect();

    let outcomes: Vec<((usize, usize), Option<Result<PairAlignment, AlignError>>)> = pairs
        .par_iter()
        .map(|&(i, j)| {
            if cancel.is_cancelled() {
                return ((i, j), None);
            }
            let result = align_pair(&replicates[i].matrix, &replicates[j].matrix, metric, solver);
            ((i, j), Some(result))
        })
        .collect();

    let mut costs = CostMatrix::empty(r);
    let mut alignments = BTreeMap::new();
    let mut failures = Vec::new();
    let mut cancelled = false;
    for ((i, j), outcome) in outcomes {
        match outcome {
            Some(Ok(alignment)) => {
                costs.set(i, j, alignment.cost);
                alignments.insert((i, j), alignment);
            }
            Some(Err(e)) => failures.push(PairFailure {
                k,
                a: i,
                b: j,
                reason: e.to_string(),
            }),
            None => cancelled = true,
        }
    }

    WithinKResult {
        k,
        metric,
        names: replicates.iter().map(|r| r.name.clone()).collect(),
        costs,
        alignments,
        failures,
        cancelled,
    }
}


#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;

    /// Build a within-K result straight from a cost grid; stored permutations are identities
    pub fn within_from_costs(k: usize, grid: &[Vec<Option<f64>>]) -> WithinKResult {
        let r = grid.len();
        let mut costs = CostMatrix::empty(r);
        let mut alignments = BTreeMap::new();
        for i in 0..r {
            for j in (i + 1)..r {
                if let Some(c) = grid[i][j] {
                    costs.set(i, j, c);
                    alignments.insert(
                        (i, j),
                        PairAlignment {
                            permutation: (0..k).collect(),
                            cost: c,
                        },
                    );
                }
            }
        }
        WithinKResult {
            k,
            metric: DistanceMetric::default(),
            names: (0..r).map(|i| format!("rep{}", i)).collect(),
            costs,
            alignments,
            failures: Vec::new(),
            cancelled: false,
        }
    }
}
