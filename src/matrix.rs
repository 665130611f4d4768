use crate::error::{AlignError, Result};

/// Tolerance on row sums for a validated membership matrix
pub const ROW_SUM_TOLERANCE: f64 = 1e-6;
/// Largest row-sum deviation the loader accepts before renormalizing
pub const LOAD_SUM_TOLERANCE: f64 = 0.05;

/// Fractional membership of N individuals across K clusters (row-major).
///
/// Entries lie in `[0, 1]` and every row sums to 1. The matrix is immutable once built;
/// column permutations and averages produce new matrices.
#[derive(Debug, Clone, PartialEq)]
pub struct MembershipMatrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl MembershipMatrix {
    /// Build a matrix from row-major data, validating shape and the simplex constraint
    pub fn new(rows: usize, cols: usize, data: Vec<f64>) -> Result<Self> {
        if rows == 0 || cols == 0 {
            return Err(AlignError::InvalidMatrix {
                context: format!("{}x{} matrix", rows, cols),
                reason: "matrix must have at least one row and one column".to_string(),
            });
        }
        if data.len() != rows * cols {
            return Err(AlignError::InvalidMatrix {
                context: format!("{}x{} matrix", rows, cols),
                reason: format!("expected {} values, got {}", rows * cols, data.len()),
            });
        }
        for (i, row) in data.chunks(cols).enumerate() {
            if let Some(v) = row.iter().find(|v| !v.is_finite() || **v < 0.0 || **v > 1.0) {
                return Err(AlignError::InvalidMatrix {
                    context: format!("row {}", i + 1),
                    reason: format!("entry {} outside [0, 1]", v),
                });
            }
            let sum: f64 = row.iter().sum();
            if (sum - 1.0).abs() > ROW_SUM_TOLERANCE {
                return Err(AlignError::InvalidMatrix {
                    context: format!("row {}", i + 1),
                    reason: format!("row sums to {} instead of 1", sum),
                });
            }
        }
        Ok(Self { rows, cols, data })
    }

    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self> {
        let cols = rows.first().map(|r| r.len()).unwrap_or(0);
        if let Some((i, r)) = rows.iter().enumerate().find(|(_, r)| r.len() != cols) {
            return Err(AlignError::InvalidMatrix {
                context: format!("row {}", i + 1),
                reason: format!("expected {} columns, got {}", cols, r.len()),
            });
        }
        let data = rows.iter().flat_map(|r| r.iter().copied()).collect();
        Self::new(rows.len(), cols, data)
    }

    /// Rescale raw rows (e.g. rounded program output) onto the simplex.
    ///
    /// Rows with negative or non-finite entries, or whose sum deviates from 1 by more than
    /// [`LOAD_SUM_TOLERANCE`], are rejected rather than forced into shape.
    pub fn normalized_rows(rows: &[Vec<f64>]) -> Result<Self> {
        let mut fixed = Vec::with_capacity(rows.len());
        for (i, row) in rows.iter().enumerate() {
            if row.iter().any(|v| !v.is_finite() || *v < 0.0) {
                return Err(AlignError::InvalidMatrix {
                    context: format!("row {}", i + 1),
                    reason: "negative or non-numeric membership".to_string(),
                });
            }
            let sum: f64 = row.iter().sum();
            if (sum - 1.0).abs() > LOAD_SUM_TOLERANCE {
                return Err(AlignError::InvalidMatrix {
                    context: format!("row {}", i + 1),
                    reason: format!("row sums to {} instead of 1", sum),
                });
            }
            fixed.push(row.iter().map(|v| (v / sum).min(1.0)).collect::<Vec<f64>>());
        }
        Self::from_rows(&fixed)
    }

    /// Number of individuals
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of clusters (K)
    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn get(&self, i: usize, k: usize) -> f64 {
        self.data[i * self.cols + k]
    }

    pub fn row(&self, i: usize) -> &[f64] {
        &self.data[i * self.cols..(i + 1) * self.cols]
    }

    pub fn column(&self, k: usize) -> Vec<f64> {
        (0..self.rows).map(|i| self.get(i, k)).collect()
    }

    pub fn columns(&self) -> Vec<Vec<f64>> {
        (0..self.cols).map(|k| self.column(k)).collect()
    }

    /// New matrix whose column `c` is column `perm[c]` of `self`
    pub fn permute_columns(&self, perm: &[usize]) -> Result<Self> {
        if !is_permutation(perm, self.cols) {
            return Err(AlignError::InvalidMatrix {
                context: format!("permutation {:?}", perm),
                reason: format!("not a permutation of {} columns", self.cols),
            });
        }
        let mut data = Vec::with_capacity(self.data.len());
        for i in 0..self.rows {
            let row = self.row(i);
            data.extend(perm.iter().map(|&c| row[c]));
        }
        Ok(Self {
            rows: self.rows,
            cols: self.cols,
            data,
        })
    }

    /// Element-wise mean of equally shaped matrices.
    ///
    /// Rows of the mean stay on the simplex; a tiny renormalization absorbs rounding drift.
    pub fn mean_of(matrices: &[MembershipMatrix]) -> Result<Self> {
        let first = matrices.first().ok_or_else(|| AlignError::InvalidMatrix {
            context: "mean".to_string(),
            reason: "no matrices to average".to_string(),
        })?;
        let mut data = vec![0.0; first.data.len()];
        for m in matrices {
            if m.rows != first.rows || m.cols != first.cols {
                return Err(AlignError::InputMismatch {
                    context: "consensus averaging".to_string(),
                    left_rows: first.rows,
                    left_cols: first.cols,
                    right_rows: m.rows,
                    right_cols: m.cols,
                });
            }
            for (acc, v) in data.iter_mut().zip(&m.data) {
                *acc += v;
            }
        }
        let n = matrices.len() as f64;
        for row in data.chunks_mut(first.cols) {
            let mut sum = 0.0;
            for v in row.iter_mut() {
                *v /= n;
                sum += *v;
            }
            for v in row.iter_mut() {
                *v = (*v / sum).clamp(0.0, 1.0);
            }
        }
        Ok(Self {
            rows: first.rows,
            cols: first.cols,
            data,
        })
    }
}

/// True when `perm` is a permutation of `0..n`
pub fn is_permutation(perm: &[usize], n: usize) -> bool {
    if perm.len() != n {
        return false;
    }
    let mut seen = vec![false; n];
    for &p in perm {
        if p >= n || seen[p] {
            return false;
        }
        seen[p] = true;
    }
    true
}

/// Inverse of a permutation of `0..perm.len()`
pub fn invert_permutation(perm: &[usize]) -> Vec<usize> {
    let mut inv = vec![0; perm.len()];
    for (i, &p) in perm.iter().enumerate() {
        inv[p] = i;
    }
    inv
}

/// One independent run's output at a fixed K
#[derive(Debug, Clone)]
pub struct Replicate {
    /// Index within its K group
    pub id: usize,
    pub name: String,
    pub k: usize,
    pub matrix: MembershipMatrix,
}

/// Replicates grouped by K, all sharing the same individuals
#[derive(Debug, Clone)]
pub struct ReplicateSet {
    groups: std::collections::BTreeMap<usize, Vec<Replicate>>,
    individuals: usize,
}

impl ReplicateSet {
    /// Group named matrices by their column count.
    ///
    /// Every matrix must have the same number of rows; ids are assigned per K in input order.
    pub fn from_named(named: Vec<(String, MembershipMatrix)>) -> Result<Self> {
        let individuals = match named.first() {
            Some((_, m)) => m.rows(),
            None => {
                return Err(AlignError::Configuration(
                    "no replicate membership matrices were supplied".to_string(),
                ))
            }
        };
        let mut groups: std::collections::BTreeMap<usize, Vec<Replicate>> =
            std::collections::BTreeMap::new();
        for (name, matrix) in named {
            if matrix.rows() != individuals {
                return Err(AlignError::InputMismatch {
                    context: format!("replicate {} has a different individual count", name),
                    left_rows: individuals,
                    left_cols: matrix.cols(),
                    right_rows: matrix.rows(),
                    right_cols: matrix.cols(),
                });
            }
            let k = matrix.cols();
            let group = groups.entry(k).or_default();
            group.push(Replicate {
                id: group.len(),
                name,
                k,
                matrix,
            });
        }
        Ok(Self {
            groups,
            individuals,
        })
    }

    pub fn individuals(&self) -> usize {
        self.individuals
    }

    /// Replicates for one K (empty when K was not loaded)
    pub fn replicates(&self, k: usize) -> &[Replicate] {
        self.groups.get(&k).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// All K values present, ascending
    pub fn k_values(&self) -> Vec<usize> {
        self.groups.keys().copied().collect()
    }

    pub fn total_replicates(&self) -> usize {
        self.groups.values().map(|g| g.len()).sum()
    }
}
