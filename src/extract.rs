use crate::assignment::AssignmentSolver;
use crate::distance::DistanceMetric;
use crate::error::{AlignError, Result};
use crate::matrix::{MembershipMatrix, Replicate};
use crate::modes::ModeDetection;
use crate::pairwise::align_pair;
use crate::within_k::WithinKResult;

/// Tightness of one mode
#[derive(Debug, Clone, PartialEq)]
pub struct ModeStats {
    pub size: usize,
    /// Mean of the pairwise costs between mode members (0 for a singleton)
    pub mean_cost: f64,
    /// Population variance of the same costs
    pub var_cost: f64,
    pub mean_cost_to_rep: f64,
}

/// How one replicate sits in its mode
#[derive(Debug, Clone, PartialEq)]
pub struct MemberAlignment {
    pub replicate: usize,
    /// Maps the replicate's columns onto the representative's order
    pub permutation: Vec<usize>,
    pub cost: f64,
}

#[derive(Debug, Clone)]
pub struct ModeSummary {
    pub mode: usize,
    pub representative: usize,
    pub representative_matrix: MembershipMatrix,
    pub consensus: MembershipMatrix,
    pub members: Vec<MemberAlignment>,
    pub stats: ModeStats,
    /// Maps this mode's anchor columns onto the major mode's order (identity for mode 0)
    pub alignment_to_major: Vec<usize>,
}

/// Everything extracted for one K
#[derive(Debug, Clone)]
pub struct ModeExtraction {
    pub k: usize,
    pub labels: Vec<usize>,
    pub modes: Vec<ModeSummary>,
}

impl ModeExtraction {
    /// Per-mode anchor used across K: representative or consensus matrix
    pub fn anchors(&self, use_representative: bool) -> Vec<MembershipMatrix> {
        self.modes
            .iter()
            .map(|m| {
                if use_representative {
                    m.representative_matrix.clone()
                } else {
                    m.consensus.clone()
                }
            })
            .collect()
    }

    pub fn alignment_to_major(&self) -> Vec<Vec<usize>> {
        self.modes.iter().map(|m| m.alignment_to_major.clone()).collect()
    }
}

fn pair_cost(within: &WithinKResult, a: usize, b: usize) -> Result<f64> {
    within.costs.get(a, b).ok_or(AlignError::MissingPair {
        k: within.k,
        a,
        b,
    })
}

/// Pick the medoid of `members`: smallest summed cost to the rest, ties to the lowest id
pub fn select_representative(within: &WithinKResult, members: &[usize]) -> Result<usize> {
    let mut best: Option<(usize, f64)> = None;
    let mut sorted = members.to_vec();
    sorted.sort_unstable();
    for &i in &sorted {
        let mut total = 0.0;
        for &j in &sorted {
            if i != j {
                total += pair_cost(within, i, j)?;
            }
        }
        if best.map_or(true, |(_, b)| total < b) {
            best = Some((i, total));
        }
    }
    best.map(|(i, _)| i).ok_or(AlignError::EmptyPartition { k: within.k })
}

/// Representative, consensus, member alignments and statistics for every mode at one K.
///
/// Only stored within-K costs and permutations are used; a pair missing inside a mode is an
/// error rather than something to recompute or compose around.
pub fn extract_modes(
    replicates: &[Replicate],
    within: &WithinKResult,
    detection: &ModeDetection,
    use_representative: bool,
    metric: DistanceMetric,
    solver: &dyn AssignmentSolver,
) -> Result<ModeExtraction> {
    let k = within.k;
    if detection.modes.is_empty() {
        return Err(AlignError::EmptyPartition { k });
    }

    let mut summaries = Vec::with_capacity(detection.modes.len());
    for mode in &detection.modes {
        let rep = select_representative(within, &mode.members)?;

        let mut members = Vec::with_capacity(mode.members.len());
        let mut aligned = Vec::with_capacity(mode.members.len());
        for &m in &mode.members {
            let permutation = within
                .permutation(rep, m)
                .ok_or(AlignError::MissingPair { k, a: rep, b: m })?;
            let cost = pair_cost(within, rep, m)?;
            aligned.push(replicates[m].matrix.permute_columns(&permutation)?);
            members.push(MemberAlignment {
                replicate: m,
                permutation,
                cost,
            });
        }
        let consensus = MembershipMatrix::mean_of(&aligned)?;

        let mut intra = Vec::new();
        for (a, &i) in mode.members.iter().enumerate() {
            for &j in &mode.members[a + 1..] {
                intra.push(pair_cost(within, i, j)?);
            }
        }
        let (mean_cost, var_cost) = mean_and_variance(&intra);
        let mean_cost_to_rep = members.iter().map(|m| m.cost).sum::<f64>() / members.len() as f64;

        summaries.push(ModeSummary {
            mode: mode.id,
            representative: rep,
            representative_matrix: replicates[rep].matrix.clone(),
            consensus,
            members,
            stats: ModeStats {
                size: mode.members.len(),
                mean_cost,
                var_cost,
                mean_cost_to_rep,
            },
            alignment_to_major: (0..k).collect(),
        });
    }

    // Non-major modes are matched against the major mode's anchor for display order.
    let major = if use_representative {
        summaries[0].representative_matrix.clone()
    } else {
        summaries[0].consensus.clone()
    };
    for summary in summaries.iter_mut().skip(1) {
        let anchor = if use_representative {
            &summary.representative_matrix
        } else {
            &summary.consensus
        };
        summary.alignment_to_major = align_pair(&major, anchor, metric, solver)?.permutation;
    }

    Ok(ModeExtraction {
        k,
        labels: detection.labels.clone(),
        modes: summaries,
    })
}

fn mean_and_variance(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    (mean, var)
}
