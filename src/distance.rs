use crate::matrix::MembershipMatrix;

/// Distance between two membership columns over the same individuals.
///
/// Both metrics are normalized by `2N`, so the summed cost of a full column matching between
/// two membership matrices lies in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DistanceMetric {
    #[default]
    SquaredEuclidean,
    TotalVariation,
}

impl DistanceMetric {
    pub fn column_distance(&self, p: &[f64], q: &[f64]) -> f64 {
        let n = p.len().max(1) as f64;
        let total: f64 = match self {
            DistanceMetric::SquaredEuclidean => {
                p.iter().zip(q).map(|(a, b)| (a - b) * (a - b)).sum()
            }
            DistanceMetric::TotalVariation => p.iter().zip(q).map(|(a, b)| (a - b).abs()).sum(),
        };
        total / (2.0 * n)
    }

    /// `grid[a][b]` = distance between column `a` of `left` and column `b` of `right`.
    ///
    /// Row counts must already be checked by the caller.
    pub fn column_grid(&self, left: &MembershipMatrix, right: &MembershipMatrix) -> Vec<Vec<f64>> {
        let left_cols = left.columns();
        let right_cols = right.columns();
        left_cols
            .iter()
            .map(|p| right_cols.iter().map(|q| self.column_distance(p, q)).collect())
            .collect()
    }

    /// Mean cost at or below which two groups of replicates are never separate modes
    pub fn mode_separation_floor(&self) -> f64 {
        match self {
            DistanceMetric::SquaredEuclidean => 0.005,
            DistanceMetric::TotalVariation => 0.05,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DistanceMetric::SquaredEuclidean => "squared-euclidean",
            DistanceMetric::TotalVariation => "total-variation",
        }
    }
}

impl std::str::FromStr for DistanceMetric {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "squared-euclidean" | "sqeuclidean" | "euclidean" => Ok(DistanceMetric::SquaredEuclidean),
            "total-variation" | "tv" => Ok(DistanceMetric::TotalVariation),
            _ => Err(format!(
                "Unknown distance metric: {}. Supported metrics: squared-euclidean, total-variation",
                s
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distances_are_symmetric_and_zero_on_identity() {
        let p = [0.1, 0.9, 0.5];
        let q = [0.4, 0.2, 0.5];
        for metric in [DistanceMetric::SquaredEuclidean, DistanceMetric::TotalVariation] {
            assert_eq!(metric.column_distance(&p, &p), 0.0);
            assert_eq!(metric.column_distance(&p, &q), metric.column_distance(&q, &p));
        }
    }

    #[test]
    fn total_variation_needs_a_wider_separation() {
        let p = [0.9, 0.1, 0.8, 0.2];
        let q = [0.8, 0.2, 0.9, 0.1];
        let squared = DistanceMetric::SquaredEuclidean;
        let tv = DistanceMetric::TotalVariation;
        assert!(tv.column_distance(&p, &q) > squared.column_distance(&p, &q));
        assert!(tv.mode_separation_floor() > squared.mode_separation_floor());
    }

    #[test]
    fn total_variation_of_opposite_hard_assignments_is_one() {
        // Two K=2 matrices with swapped hard labels: each matched column differs everywhere.
        let p = [1.0, 0.0];
        let q = [0.0, 1.0];
        let d = DistanceMetric::TotalVariation.column_distance(&p, &q);
        assert!((2.0 * d - 1.0).abs() < 1e-12);
    }
}
