use std::fs;
use std::path::Path;

use clumpalign::across_k::{IlpMatchingSolver, SolveStatus};
use clumpalign::assignment::{Assignment, AssignmentSolver, HungarianSolver};
use clumpalign::distance::DistanceMetric;
use clumpalign::error::AlignError;
use clumpalign::input::{load_replicates, InputFormat};
use clumpalign::matrix::{MembershipMatrix, ReplicateSet};
use clumpalign::pairwise::align_pair;
use clumpalign::pipeline::{run_pipeline, run_pipeline_with, AlignConfig, Backends, CancelToken, PipelineResult};
use clumpalign::report::{read_matrix, read_mode_labels, read_within_k, write_results};
use clumpalign::Logger;

// Helpers

const N: usize = 20;

fn k2_row(i: usize) -> Vec<f64> {
    let a = 0.85 + 0.01 * (i % 5) as f64;
    if i < 10 {
        vec![a, 1.0 - a]
    } else {
        vec![1.0 - a, a]
    }
}

/// Mode A splits the first K=2 group, mode B the second one
fn k3_row(i: usize, mode_b: bool) -> Vec<f64> {
    let major = if mode_b {
        if i < 10 {
            0
        } else if i < 15 {
            1
        } else {
            2
        }
    } else if i < 5 {
        0
    } else if i < 10 {
        1
    } else {
        2
    };
    let mut row = vec![0.05; 3];
    row[major] = 0.9;
    row
}

/// Rotate the columns and add a small replicate-specific jitter
fn replicate_text(rows: &[Vec<f64>], r: usize) -> String {
    let k = rows[0].len();
    let mut out = String::new();
    for (i, row) in rows.iter().enumerate() {
        let mut jittered: Vec<f64> = (0..k)
            .map(|j| row[(j + r) % k] + 0.002 * ((i + r + j) % 3) as f64)
            .collect();
        let sum: f64 = jittered.iter().sum();
        for v in jittered.iter_mut() {
            *v /= sum;
        }
        let line: Vec<String> = jittered.iter().map(|v| format!("{:.6}", v)).collect();
        out.push_str(&line.join(" "));
        out.push('\n');
    }
    out
}

fn write_input(dir: &Path) {
    let k2: Vec<Vec<f64>> = (0..N).map(k2_row).collect();
    let k3a: Vec<Vec<f64>> = (0..N).map(|i| k3_row(i, false)).collect();
    let k3b: Vec<Vec<f64>> = (0..N).map(|i| k3_row(i, true)).collect();
    for r in 0..4 {
        fs::write(dir.join(format!("run_K2_r{}.Q", r)), replicate_text(&k2, r)).unwrap();
    }
    for r in 0..3 {
        fs::write(dir.join(format!("run_K3_r{}.Q", r)), replicate_text(&k3a, r)).unwrap();
    }
    for r in 3..5 {
        fs::write(dir.join(format!("run_K3_r{}.Q", r)), replicate_text(&k3b, r)).unwrap();
    }
}

fn load(dir: &Path) -> ReplicateSet {
    load_replicates(dir, InputFormat::Admixture).unwrap()
}

fn logger() -> Logger {
    Logger::new(tempfile::tempfile().unwrap())
}

fn run(replicates: &ReplicateSet, config: &AlignConfig) -> PipelineResult {
    run_pipeline(replicates, config, &CancelToken::new(), &mut logger()).unwrap()
}

// End to end

#[test]
fn detects_modes_and_writes_every_output() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write_input(input.path());
    let replicates = load(input.path());
    assert_eq!(replicates.k_values(), vec![2, 3]);

    let result = run(&replicates, &AlignConfig::default());
    let k2 = result.k_result(2).unwrap();
    let k3 = result.k_result(3).unwrap();
    assert_eq!(k2.extraction.modes.len(), 1);
    assert_eq!(k3.extraction.modes.len(), 2);
    assert_eq!(k3.extraction.modes[0].stats.size, 3);
    assert_eq!(k3.detection.labels, vec![0, 0, 0, 1, 1]);

    write_results(output.path(), &replicates, &result).unwrap();
    for file in [
        "input/K2R1.Q",
        "input/K3R5.Q",
        "alignment_withinK/K2.csv",
        "alignment_withinK/K3.csv",
        "modes/K2_modes.csv",
        "modes/K3M1_rep.Q",
        "modes/K3M2_avg.Q",
        "modes/mode_stats.csv",
        "modes/alignment_to_modes.csv",
        "alignment_acrossK/alignment_acrossK_rep.csv",
        "alignment_acrossK/best_pairs_rep.csv",
        "alignment_acrossK/lineages_rep.csv",
    ] {
        assert!(output.path().join(file).exists(), "missing {}", file);
    }

    let stats = fs::read_to_string(output.path().join("modes/mode_stats.csv")).unwrap();
    assert_eq!(stats.lines().count(), 1 + 3);
}

#[test]
fn written_tables_read_back_exactly() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write_input(input.path());
    let replicates = load(input.path());
    let result = run(&replicates, &AlignConfig::default());
    write_results(output.path(), &replicates, &result).unwrap();

    let k3 = result.k_result(3).unwrap();
    let labels = read_mode_labels(&output.path().join("modes/K3_modes.csv")).unwrap();
    let read: Vec<usize> = labels.iter().map(|r| r.mode).collect();
    assert_eq!(read, k3.detection.labels);
    assert_eq!(labels[0].name, "run_K3_r0.Q");

    let records = read_within_k(&output.path().join("alignment_withinK/K3.csv")).unwrap();
    assert_eq!(records.len(), 10);
    for (idx, record) in records.iter().enumerate() {
        let (i, j) = *k3.within.alignments.keys().nth(idx).unwrap();
        assert_eq!(record.cost, k3.within.costs.get(i, j));
        assert_eq!(record.permutation.as_ref(), Some(&k3.within.alignments[&(i, j)].permutation));
    }

    let consensus = read_matrix(&output.path().join("modes/K3M1_avg.Q")).unwrap();
    assert_eq!(consensus, k3.extraction.modes[0].consensus);
}

// Across K

#[test]
fn single_k_range_gives_an_empty_across_k_alignment() {
    let input = tempfile::tempdir().unwrap();
    write_input(input.path());
    let replicates = load(input.path());
    let config = AlignConfig {
        k_range: Some(vec![3]),
        ..AlignConfig::default()
    };
    let result = run(&replicates, &config);
    assert_eq!(result.per_k.len(), 1);
    assert!(result.across_k.edges.is_empty());
    assert_eq!(result.across_k.total_cost, 0.0);
    assert!(result.across_k.proven_optimal);
}

#[test]
fn merge_lets_two_higher_k_clusters_share_a_parent() {
    let input = tempfile::tempdir().unwrap();
    write_input(input.path());
    let replicates = load(input.path());
    let config = AlignConfig {
        merge_clusters_allowed: true,
        ..AlignConfig::default()
    };
    let result = run(&replicates, &config);
    assert_eq!(result.across_k.edges.len(), 2);
    for edge in &result.across_k.edges {
        assert_eq!(edge.matching.len(), 3);
        for b in 0..3 {
            assert_eq!(edge.matching.iter().filter(|&&(_, x)| x == b).count(), 1);
        }
        for a in 0..2 {
            assert!(edge.matching.iter().any(|&(x, _)| x == a));
        }
    }
    for mode in 0..2 {
        let mut labels = result.across_k.labels(3, mode);
        labels.sort_unstable();
        labels.dedup();
        assert_eq!(labels.len(), 3);
    }
}

#[test]
fn without_merge_each_lower_k_cluster_is_used_once() {
    let input = tempfile::tempdir().unwrap();
    write_input(input.path());
    let replicates = load(input.path());
    let result = run(&replicates, &AlignConfig::default());
    for edge in &result.across_k.edges {
        assert_eq!(edge.matching.len(), 2);
        let mut highs: Vec<usize> = edge.matching.iter().map(|&(_, b)| b).collect();
        highs.sort_unstable();
        highs.dedup();
        assert_eq!(highs.len(), 2);
    }
    assert_eq!(result.across_k.best_pairs.len(), 1);
}

// Configuration, cancellation and failures

#[test]
fn requesting_an_absent_k_is_a_configuration_error() {
    let input = tempfile::tempdir().unwrap();
    write_input(input.path());
    let replicates = load(input.path());
    let config = AlignConfig {
        k_range: Some(vec![2, 4]),
        ..AlignConfig::default()
    };
    let err = run_pipeline(&replicates, &config, &CancelToken::new(), &mut logger()).unwrap_err();
    assert!(matches!(err, AlignError::Configuration(_)));
}

#[test]
fn cancelled_runs_stop_with_an_error() {
    let input = tempfile::tempdir().unwrap();
    write_input(input.path());
    let replicates = load(input.path());
    let cancel = CancelToken::new();
    cancel.cancel();
    let err = run_pipeline(&replicates, &AlignConfig::default(), &cancel, &mut logger()).unwrap_err();
    assert!(matches!(err, AlignError::Cancelled { .. }));
}

/// Hungarian solver that cancels the run as soon as it sees a K=3 grid
struct CancelAtK3 {
    cancel: CancelToken,
}

impl AssignmentSolver for CancelAtK3 {
    fn solve(&self, costs: &[Vec<f64>]) -> clumpalign::Result<Assignment> {
        if costs.len() == 3 {
            self.cancel.cancel();
        }
        HungarianSolver.solve(costs)
    }
}

#[test]
fn finished_pairs_survive_cancellation() {
    let input = tempfile::tempdir().unwrap();
    write_input(input.path());
    let replicates = load(input.path());
    let cancel = CancelToken::new();
    let solver = CancelAtK3 { cancel: cancel.clone() };
    let backends = Backends {
        assignment: &solver,
        matching: &IlpMatchingSolver,
    };

    let err = run_pipeline_with(&replicates, &AlignConfig::default(), &backends, &cancel, &mut logger()).unwrap_err();
    let partial = match err {
        AlignError::Cancelled { partial, .. } => partial,
        other => panic!("expected a cancellation, got {}", other),
    };
    let k3 = partial.iter().find(|w| w.k == 3).expect("K=3 results kept");
    assert!(!k3.alignments.is_empty());

    for within in &partial {
        let reps = replicates.replicates(within.k);
        for i in 0..reps.len() {
            for j in (i + 1)..reps.len() {
                match within.alignments.get(&(i, j)) {
                    Some(stored) => {
                        assert_eq!(within.costs.get(i, j), Some(stored.cost));
                        let again = align_pair(&reps[i].matrix, &reps[j].matrix, DistanceMetric::SquaredEuclidean, &HungarianSolver).unwrap();
                        assert_eq!(&again, stored);
                    }
                    None => assert_eq!(within.costs.get(i, j), None),
                }
            }
        }
    }
}

/// Solver with no answer for K=3 grids
struct NoK3;

impl AssignmentSolver for NoK3 {
    fn solve(&self, costs: &[Vec<f64>]) -> clumpalign::Result<Assignment> {
        if costs.len() == 3 {
            return Err(AlignError::InvalidMatrix {
                context: "test grid".to_string(),
                reason: "K=3 is not supported".to_string(),
            });
        }
        HungarianSolver.solve(costs)
    }
}

#[test]
fn a_failed_k_is_reported_and_the_rest_still_runs() {
    let input = tempfile::tempdir().unwrap();
    write_input(input.path());
    let replicates = load(input.path());
    let backends = Backends {
        assignment: &NoK3,
        matching: &IlpMatchingSolver,
    };

    let result = run_pipeline_with(&replicates, &AlignConfig::default(), &backends, &CancelToken::new(), &mut logger()).unwrap();
    assert_eq!(result.per_k.len(), 1);
    assert_eq!(result.per_k[0].k, 2);
    assert_eq!(result.failed.len(), 1);
    assert_eq!(result.failed[0].k, 3);
    assert!(result.failed[0].reason.contains("K=3 is not supported"));
    assert_eq!(result.across_k.status, SolveStatus::Trivial);
}

#[test]
fn permuted_replicate_aligns_at_zero_cost() {
    let rows: Vec<Vec<f64>> = (0..10)
        .map(|i| {
            let a = 0.1 + 0.05 * i as f64;
            vec![a, (1.0 - a) * 0.3, (1.0 - a) * 0.7]
        })
        .collect();
    let left = MembershipMatrix::from_rows(&rows).unwrap();
    let shuffled: Vec<Vec<f64>> = rows.iter().map(|r| vec![r[2], r[0], r[1]]).collect();
    let right = MembershipMatrix::from_rows(&shuffled).unwrap();

    let alignment = align_pair(&left, &right, DistanceMetric::SquaredEuclidean, &HungarianSolver).unwrap();
    assert_eq!(alignment.cost, 0.0);
    assert_eq!(alignment.permutation, vec![1, 2, 0]);
    assert_eq!(right.permute_columns(&alignment.permutation).unwrap(), left);
}
