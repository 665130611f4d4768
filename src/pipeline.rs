use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rayon::prelude::*;

use crate::across_k::{
    align_across_k, AcrossKAlignment, AcrossKOptions, AnchorKind, IlpMatchingSolver, MatchingSolver,
    ModeAnchors,
};
use crate::assignment::{AssignmentSolver, HungarianSolver};
use crate::distance::DistanceMetric;
use crate::error::{AlignError, Result};
use crate::extract::{extract_modes, ModeExtraction};
use crate::matrix::ReplicateSet;
use crate::modes::{detect_modes, ModeDetection, ModeStrategy};
use crate::progress::{format_time_used, StageProgress};
use crate::within_k::{align_within_k, WithinKResult};
use crate::Logger;

/// Shared flag checked before every replicate pair and every K
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Run configuration for one alignment
#[derive(Debug, Clone)]
pub struct AlignConfig {
    /// Explicit K values to align; `None` takes every K found in the input
    pub k_range: Option<Vec<usize>>,
    pub use_representative: bool,
    pub merge_clusters_allowed: bool,
    pub mode_detection_default: bool,
    pub mode_detection_resolution: Option<f64>,
    pub seed: Option<u64>,
    pub metric: DistanceMetric,
    pub all_pairs: bool,
    pub ilp_time_limit: Option<Duration>,
}

impl Default for AlignConfig {
    fn default() -> Self {
        Self {
            k_range: None,
            use_representative: true,
            merge_clusters_allowed: false,
            mode_detection_default: true,
            mode_detection_resolution: None,
            seed: None,
            metric: DistanceMetric::default(),
            all_pairs: false,
            ilp_time_limit: Some(Duration::from_secs(60)),
        }
    }
}

impl AlignConfig {
    pub fn validate(&self) -> Result<()> {
        if let Some(range) = &self.k_range {
            if range.is_empty() {
                return Err(AlignError::Configuration("K range is empty".to_string()));
            }
            if let Some(&k) = range.iter().find(|&&k| k < 2) {
                return Err(AlignError::Configuration(format!(
                    "K range must only contain values >= 2 (found {})",
                    k
                )));
            }
            if range.windows(2).any(|w| w[0] >= w[1]) {
                return Err(AlignError::Configuration(format!(
                    "K range must be strictly increasing: {:?}",
                    range
                )));
            }
        }
        match (self.mode_detection_default, self.mode_detection_resolution) {
            (true, Some(_)) => {
                return Err(AlignError::Configuration(
                    "a community detection resolution cannot be combined with the default mode detection"
                        .to_string(),
                ))
            }
            (false, None) => {
                return Err(AlignError::Configuration(
                    "a community detection resolution is required when the default mode detection is off"
                        .to_string(),
                ))
            }
            (false, Some(res)) if !(res.is_finite() && res > 0.0) => {
                return Err(AlignError::Configuration(format!(
                    "community detection resolution must be a positive number (got {})",
                    res
                )))
            }
            _ => {}
        }
        if self.ilp_time_limit == Some(Duration::ZERO) {
            return Err(AlignError::Configuration("ILP time limit must be positive".to_string()));
        }
        Ok(())
    }

    pub fn strategy(&self) -> ModeStrategy {
        match self.mode_detection_resolution {
            Some(res) if !self.mode_detection_default => ModeStrategy::Resolution(res),
            _ => ModeStrategy::Default,
        }
    }

    pub fn anchor(&self) -> AnchorKind {
        if self.use_representative {
            AnchorKind::Representative
        } else {
            AnchorKind::Consensus
        }
    }

    /// K values to run, checked against what the input holds
    pub fn resolve_k_values(&self, replicates: &ReplicateSet) -> Result<Vec<usize>> {
        let available = replicates.k_values();
        match &self.k_range {
            Some(range) => {
                for k in range {
                    if !available.contains(k) {
                        return Err(AlignError::Configuration(format!(
                            "K={} requested but no replicate has {} columns (available: {:?})",
                            k, k, available
                        )));
                    }
                }
                Ok(range.clone())
            }
            None => {
                let ks: Vec<usize> = available.into_iter().filter(|&k| k >= 2).collect();
                if ks.is_empty() {
                    return Err(AlignError::Configuration(
                        "input holds no replicate with at least 2 clusters".to_string(),
                    ));
                }
                Ok(ks)
            }
        }
    }
}

/// Solver back-ends used by the pipeline
pub struct Backends<'a> {
    pub assignment: &'a dyn AssignmentSolver,
    pub matching: &'a dyn MatchingSolver,
}

impl Default for Backends<'static> {
    fn default() -> Self {
        Self {
            assignment: &HungarianSolver,
            matching: &IlpMatchingSolver,
        }
    }
}

/// Results of every stage at one K
#[derive(Debug, Clone)]
pub struct KResult {
    pub k: usize,
    pub within: WithinKResult,
    pub detection: ModeDetection,
    pub extraction: ModeExtraction,
    pub elapsed: Duration,
}

/// A K value left out of the run, with the error that stopped it
#[derive(Debug, Clone)]
pub struct KFailure {
    pub k: usize,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub individuals: usize,
    pub per_k: Vec<KResult>,
    pub failed: Vec<KFailure>,
    pub across_k: AcrossKAlignment,
}

impl PipelineResult {
    pub fn k_result(&self, k: usize) -> Option<&KResult> {
        self.per_k.iter().find(|r| r.k == k)
    }
}

fn run_single_k(
    k: usize,
    replicates: &ReplicateSet,
    config: &AlignConfig,
    strategy: &ModeStrategy,
    solver: &dyn AssignmentSolver,
    cancel: &CancelToken,
) -> Result<KResult> {
    if cancel.is_cancelled() {
        return Err(AlignError::Cancelled {
            stage: format!("within-K alignment at K={}", k),
            partial: Vec::new(),
        });
    }
    let start = Instant::now();
    let reps = replicates.replicates(k);
    let within = align_within_k(k, reps, config.metric, solver, cancel);
    if within.cancelled {
        let finished = within.alignments.len();
        let total = reps.len() * reps.len().saturating_sub(1) / 2;
        return Err(AlignError::Cancelled {
            stage: format!("within-K alignment at K={} ({} of {} pairs finished)", k, finished, total),
            partial: vec![within],
        });
    }
    let detection = detect_modes(&within, strategy, config.seed)?;
    let extraction = extract_modes(
        reps,
        &within,
        &detection,
        config.use_representative,
        config.metric,
        solver,
    )?;
    Ok(KResult {
        k,
        within,
        detection,
        extraction,
        elapsed: start.elapsed(),
    })
}

/// Run every stage with the default solver back-ends
pub fn run_pipeline(
    replicates: &ReplicateSet,
    config: &AlignConfig,
    cancel: &CancelToken,
    logger: &mut Logger,
) -> Result<PipelineResult> {
    run_pipeline_with(replicates, config, &Backends::default(), cancel, logger)
}

/// Within-K alignment, mode detection and extraction for every K in parallel, then one
/// across-K solve over all modes.
pub fn run_pipeline_with(
    replicates: &ReplicateSet,
    config: &AlignConfig,
    backends: &Backends<'_>,
    cancel: &CancelToken,
    logger: &mut Logger,
) -> Result<PipelineResult> {
    config.validate()?;
    let ks = config.resolve_k_values(replicates)?;
    let strategy = config.strategy();
    let total_start = Instant::now();

    logger.log(&format!(
        "Aligning {} replicate(s) of {} individual(s) at K = {:?}",
        ks.iter().map(|&k| replicates.replicates(k).len()).sum::<usize>(),
        replicates.individuals(),
        ks
    ))?;
    logger.log(&format!(
        "metric: {}, mode detection: {:?}, seed: {:?}, anchor: {}, merge: {}, all pairs: {}",
        config.metric.name(),
        strategy,
        config.seed,
        config.anchor().suffix(),
        config.merge_clusters_allowed,
        config.all_pairs
    ))?;

    println!("[Align] Aligning replicates within K and detecting modes");
    let stage_start = Instant::now();
    let progress = StageProgress::new("K values", ks.len());
    let outcomes: Vec<(Result<KResult>, Option<std::io::Error>)> = ks
        .par_iter()
        .map(|&k| {
            let outcome = run_single_k(k, replicates, config, &strategy, backends.assignment, cancel);
            (outcome, progress.tick().err())
        })
        .collect();
    progress.finish()?;

    let mut per_k = Vec::with_capacity(outcomes.len());
    let mut failed: Vec<(usize, AlignError)> = Vec::new();
    let mut cancelled_stages = Vec::new();
    let mut partial = Vec::new();
    let mut display_error = None;
    for (&k, (outcome, tick_error)) in ks.iter().zip(outcomes) {
        if display_error.is_none() {
            display_error = tick_error;
        }
        let result = match outcome {
            Ok(result) => result,
            Err(AlignError::Cancelled { stage, partial: mut done }) => {
                cancelled_stages.push(stage);
                partial.append(&mut done);
                continue;
            }
            Err(e @ AlignError::Configuration(_)) => {
                logger.log(&format!("Within-K stage failed: {}", e))?;
                return Err(e);
            }
            Err(e) => {
                logger.log(&format!("K={} failed and is left out of the run: {}", k, e))?;
                println!("[Align]   K={} failed: {}", k, e);
                failed.push((k, e));
                continue;
            }
        };
        for failure in &result.within.failures {
            logger.log(&format!(
                "K={}: pair ({}, {}) has no alignment: {}",
                failure.k, result.within.names[failure.a], result.within.names[failure.b], failure.reason
            ))?;
        }
        logger.log(&result.detection.message)?;
        println!("[Align]   {}", result.detection.message);
        for summary in &result.extraction.modes {
            logger.log(&format!(
                "K={} mode {}: size {}, representative {}, mean cost {}, mean cost to representative {}",
                result.k,
                summary.mode + 1,
                summary.stats.size,
                result.within.names[summary.representative],
                summary.stats.mean_cost,
                summary.stats.mean_cost_to_rep
            ))?;
        }
        logger.log(&format!("K={} finished in {:.3}s", result.k, result.elapsed.as_secs_f64()))?;
        per_k.push(result);
    }
    if let Some(e) = display_error {
        logger.log(&format!("Progress display failed: {}", e))?;
    }
    println!("{}", format_time_used(stage_start.elapsed()));

    if !cancelled_stages.is_empty() || cancel.is_cancelled() {
        partial.extend(per_k.into_iter().map(|r| r.within));
        partial.sort_by_key(|w| w.k);
        let stage = if cancelled_stages.is_empty() {
            "across-K alignment".to_string()
        } else {
            cancelled_stages.join(", ")
        };
        logger.log(&format!(
            "Run cancelled during {}; within-K results kept for K = {:?}",
            stage,
            partial.iter().map(|w| w.k).collect::<Vec<_>>()
        ))?;
        return Err(AlignError::Cancelled { stage, partial });
    }
    if per_k.is_empty() && !failed.is_empty() {
        let (_, e) = failed.swap_remove(0);
        return Err(e);
    }
    let failed: Vec<KFailure> = failed
        .into_iter()
        .map(|(k, e)| KFailure { k, reason: e.to_string() })
        .collect();

    println!("[Align] Aligning modes across K");
    let stage_start = Instant::now();
    let anchor = config.anchor();
    let levels: Vec<ModeAnchors> = per_k
        .iter()
        .map(|r| ModeAnchors {
            k: r.k,
            anchors: r.extraction.anchors(config.use_representative),
            alignment_to_major: r.extraction.alignment_to_major(),
        })
        .collect();
    let options = AcrossKOptions {
        merge: config.merge_clusters_allowed,
        all_pairs: config.all_pairs,
        metric: config.metric,
        time_limit: config.ilp_time_limit,
    };
    let across_k = align_across_k(&levels, anchor, &options, backends.matching)?;
    logger.log(&format!(
        "Across-K alignment ({}): {} mode pair(s), total cost {}, status {:?}",
        anchor.suffix(),
        across_k.edges.len(),
        across_k.total_cost,
        across_k.status
    ))?;
    if !across_k.proven_optimal {
        println!(
            "[Align]   Across-K matching is not proven optimal ({:?}); keeping the best incumbent",
            across_k.status
        );
    }
    for best in &across_k.best_pairs {
        println!(
            "[Align]   K{}M{} -> K{}M{}: cost {:.6}",
            best.low.k,
            best.low.mode + 1,
            best.high.k,
            best.high.mode + 1,
            best.cost
        );
    }
    println!("{}", format_time_used(stage_start.elapsed()));

    logger.log(&format!("Pipeline finished in {:.2}s", total_start.elapsed().as_secs_f64()))?;
    Ok(PipelineResult {
        individuals: replicates.individuals(),
        per_k,
        failed,
        across_k,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AlignConfig {
        AlignConfig::default()
    }

    #[test]
    fn default_config_is_valid() {
        assert!(config().validate().is_ok());
        assert_eq!(config().strategy(), ModeStrategy::Default);
        assert_eq!(config().anchor(), AnchorKind::Representative);
    }

    #[test]
    fn rejects_bad_k_ranges() {
        for range in [vec![], vec![1, 2], vec![3, 3], vec![4, 3]] {
            let cfg = AlignConfig {
                k_range: Some(range.clone()),
                ..config()
            };
            assert!(
                matches!(cfg.validate(), Err(AlignError::Configuration(_))),
                "range {:?} should be rejected",
                range
            );
        }
    }

    #[test]
    fn rejects_contradictory_mode_detection_flags() {
        let both = AlignConfig {
            mode_detection_resolution: Some(1.2),
            ..config()
        };
        assert!(both.validate().is_err());

        let neither = AlignConfig {
            mode_detection_default: false,
            ..config()
        };
        assert!(neither.validate().is_err());

        let negative = AlignConfig {
            mode_detection_default: false,
            mode_detection_resolution: Some(-0.5),
            ..config()
        };
        assert!(negative.validate().is_err());

        let tuned = AlignConfig {
            mode_detection_default: false,
            mode_detection_resolution: Some(1.5),
            ..config()
        };
        assert!(tuned.validate().is_ok());
        assert_eq!(tuned.strategy(), ModeStrategy::Resolution(1.5));
    }

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
