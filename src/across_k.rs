use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use good_lp::{constraint, microlp, variable, Expression, ProblemVariables, Solution, SolverModel, Variable};

use crate::assignment::{AssignmentSolver, HungarianSolver};
use crate::distance::DistanceMetric;
use crate::error::{AlignError, Result};
use crate::matrix::MembershipMatrix;

/// Which per-mode matrix stands for the mode across K
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnchorKind {
    Representative,
    Consensus,
}

impl AnchorKind {
    pub fn suffix(&self) -> &'static str {
        match self {
            AnchorKind::Representative => "rep",
            AnchorKind::Consensus => "avg",
        }
    }
}

/// A mode identified by its K and its id at that K
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModeRef {
    pub k: usize,
    pub mode: usize,
}

/// Anchors of every mode at one K, in mode id order
#[derive(Debug, Clone)]
pub struct ModeAnchors {
    pub k: usize,
    pub anchors: Vec<MembershipMatrix>,
    /// Per mode: permutation mapping its columns onto the major mode's order
    pub alignment_to_major: Vec<Vec<usize>>,
}

/// Column matching between a lower-K and a higher-K mode
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeAlignment {
    pub low: ModeRef,
    pub high: ModeRef,
    /// `(low column, high column)` pairs, sorted
    pub matching: Vec<(usize, usize)>,
    pub cost: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SolveStatus {
    Optimal,
    /// Fewer than two K values: nothing to solve
    Trivial,
    TimedOut { limit: Duration },
    SolverFailed(String),
}

/// One node of the lineage forest
#[derive(Debug, Clone, PartialEq)]
pub struct LineageEntry {
    pub k: usize,
    pub mode: usize,
    pub column: usize,
    pub label: usize,
    /// `(K, mode, column)` of the matched lower-K column, if any
    pub parent: Option<(usize, usize, usize)>,
    /// True when the column continues its parent's label rather than splitting off
    pub inherited: bool,
}

#[derive(Debug, Clone)]
pub struct AcrossKAlignment {
    pub anchor: AnchorKind,
    pub edges: Vec<EdgeAlignment>,
    pub total_cost: f64,
    /// Cheapest mode pair for each adjacent K transition
    pub best_pairs: Vec<EdgeAlignment>,
    pub lineages: Vec<LineageEntry>,
    pub status: SolveStatus,
    pub proven_optimal: bool,
}

impl AcrossKAlignment {
    fn trivial(anchor: AnchorKind) -> Self {
        Self {
            anchor,
            edges: Vec::new(),
            total_cost: 0.0,
            best_pairs: Vec::new(),
            lineages: Vec::new(),
            status: SolveStatus::Trivial,
            proven_optimal: true,
        }
    }

    pub fn labels(&self, k: usize, mode: usize) -> Vec<usize> {
        let mut entries: Vec<&LineageEntry> = self
            .lineages
            .iter()
            .filter(|e| e.k == k && e.mode == mode)
            .collect();
        entries.sort_by_key(|e| e.column);
        entries.iter().map(|e| e.label).collect()
    }
}

#[derive(Debug, Clone)]
pub struct AcrossKOptions {
    pub merge: bool,
    pub all_pairs: bool,
    pub metric: DistanceMetric,
    pub time_limit: Option<Duration>,
}

impl Default for AcrossKOptions {
    fn default() -> Self {
        Self {
            merge: false,
            all_pairs: false,
            metric: DistanceMetric::default(),
            time_limit: Some(Duration::from_secs(60)),
        }
    }
}

/// Column distances between one lower-K mode (rows) and one higher-K mode (columns)
#[derive(Debug, Clone)]
pub struct MatchingBlock {
    pub low: ModeRef,
    pub high: ModeRef,
    pub rows: usize,
    pub cols: usize,
    pub costs: Vec<Vec<f64>>,
}

/// Three blocks `A -> B`, `B -> C` and `A -> C` whose matchings must compose
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Coupling {
    pub first: usize,
    pub second: usize,
    pub direct: usize,
}

/// All blocks solved jointly under one capacity regime.
///
/// With `merge`, every higher-K column takes exactly one lower-K column and every lower-K
/// column at least one. Without it, every lower-K column takes exactly one higher-K column
/// and every higher-K column at most one. Whenever blocks `A -> B`, `B -> C` and `A -> C`
/// are all present, the direct matching must equal the composition of the other two.
#[derive(Debug, Clone)]
pub struct MatchingProblem {
    pub blocks: Vec<MatchingBlock>,
    pub merge: bool,
}

impl MatchingProblem {
    pub fn couplings(&self) -> Vec<Coupling> {
        let index: HashMap<(ModeRef, ModeRef), usize> = self
            .blocks
            .iter()
            .enumerate()
            .map(|(i, b)| ((b.low, b.high), i))
            .collect();
        let mut out = Vec::new();
        for (first, a) in self.blocks.iter().enumerate() {
            for (second, b) in self.blocks.iter().enumerate() {
                if b.low != a.high {
                    continue;
                }
                if let Some(&direct) = index.get(&(a.low, b.high)) {
                    out.push(Coupling { first, second, direct });
                }
            }
        }
        out
    }

    /// Groups of blocks that can be solved independently: every coupled block in one
    /// group, every other block on its own.
    pub fn components(&self) -> Vec<Vec<usize>> {
        let coupled = self.coupled_blocks();
        let mut out: Vec<Vec<usize>> = Vec::new();
        let joint: Vec<usize> = (0..self.blocks.len()).filter(|&b| coupled[b]).collect();
        if !joint.is_empty() {
            out.push(joint);
        }
        out.extend((0..self.blocks.len()).filter(|&b| !coupled[b]).map(|b| vec![b]));
        out
    }

    fn coupled_blocks(&self) -> Vec<bool> {
        let mut coupled = vec![false; self.blocks.len()];
        for c in self.couplings() {
            coupled[c.first] = true;
            coupled[c.second] = true;
            coupled[c.direct] = true;
        }
        coupled
    }
}

#[derive(Debug, Clone)]
pub struct MatchingOutcome {
    pub matchings: Vec<Vec<(usize, usize)>>,
    pub status: SolveStatus,
    pub proven_optimal: bool,
}

pub trait MatchingSolver: Send + Sync {
    fn solve(&self, problem: &MatchingProblem, time_limit: Option<Duration>) -> Result<MatchingOutcome>;
}

/// One `(low column, high column)` list per block
pub type Matchings = Vec<Vec<(usize, usize)>>;
type ComponentSolve = fn(&MatchingProblem, &[usize]) -> std::result::Result<Matchings, String>;

/// Integer program over every block, solved by `microlp` through `good_lp`.
///
/// Independent components are solved one after another on a worker thread. Past the time
/// limit the worker is told to stop before its next component, and every unsolved
/// component falls back to the incumbent. That fallback is exact for uncoupled blocks, so
/// only a coupled component left unsolved makes the outcome not proven optimal.
#[derive(Debug, Default, Clone, Copy)]
pub struct IlpMatchingSolver;

impl MatchingSolver for IlpMatchingSolver {
    fn solve(&self, problem: &MatchingProblem, time_limit: Option<Duration>) -> Result<MatchingOutcome> {
        solve_in_worker(problem, time_limit, solve_ilp)
    }
}

fn solve_in_worker(
    problem: &MatchingProblem,
    time_limit: Option<Duration>,
    solve: ComponentSolve,
) -> Result<MatchingOutcome> {
    if problem.blocks.is_empty() {
        return Ok(MatchingOutcome {
            matchings: Vec::new(),
            status: SolveStatus::Trivial,
            proven_optimal: true,
        });
    }
    let components = problem.components();
    let stop = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::channel();
    {
        let owned = problem.clone();
        let components = components.clone();
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            for (c, blocks) in components.iter().enumerate() {
                if stop.load(Ordering::SeqCst) {
                    return;
                }
                if tx.send((c, solve(&owned, blocks))).is_err() {
                    return;
                }
            }
        });
    }

    let deadline = time_limit.map(|limit| Instant::now() + limit);
    let mut solved: Vec<Option<Matchings>> = vec![None; components.len()];
    let mut status = SolveStatus::Optimal;
    for _ in 0..components.len() {
        let received = match deadline {
            Some(deadline) => rx.recv_timeout(deadline.saturating_duration_since(Instant::now())),
            None => rx.recv().map_err(|_| mpsc::RecvTimeoutError::Disconnected),
        };
        match received {
            Ok((c, Ok(matchings))) if matchings.len() == components[c].len() => solved[c] = Some(matchings),
            Ok((c, Ok(matchings))) => {
                status = SolveStatus::SolverFailed(format!(
                    "solver returned {} matchings for {} mode pairs",
                    matchings.len(),
                    components[c].len()
                ));
            }
            Ok((_, Err(detail))) => status = SolveStatus::SolverFailed(detail),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                status = SolveStatus::TimedOut {
                    limit: time_limit.unwrap_or_default(),
                };
                break;
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                status = SolveStatus::SolverFailed("solver thread exited without a result".to_string());
                break;
            }
        }
    }
    stop.store(true, Ordering::SeqCst);

    let fallback = if solved.iter().any(Option::is_none) {
        incumbent(problem)?
    } else {
        Vec::new()
    };
    let mut matchings = vec![Vec::new(); problem.blocks.len()];
    let mut proven_optimal = true;
    for (blocks, result) in components.iter().zip(solved) {
        let pairs = match result {
            Some(pairs) => pairs,
            None => {
                // Only the coupled component has more than one block.
                if blocks.len() > 1 {
                    proven_optimal = false;
                }
                blocks.iter().map(|&b| fallback[b].clone()).collect()
            }
        };
        for (&b, p) in blocks.iter().zip(pairs) {
            matchings[b] = p;
        }
    }
    Ok(MatchingOutcome {
        matchings,
        status,
        proven_optimal,
    })
}

fn solve_ilp(problem: &MatchingProblem, component: &[usize]) -> std::result::Result<Matchings, String> {
    let mut vars = ProblemVariables::new();
    let mut grids: HashMap<usize, Vec<Vec<Variable>>> = HashMap::new();
    let mut terms: Vec<(f64, Variable)> = Vec::new();
    for &b in component {
        let block = &problem.blocks[b];
        let grid: Vec<Vec<Variable>> = (0..block.rows)
            .map(|_| (0..block.cols).map(|_| vars.add(variable().binary())).collect())
            .collect();
        for (a, row) in grid.iter().enumerate() {
            for (c, &v) in row.iter().enumerate() {
                terms.push((block.costs[a][c], v));
            }
        }
        grids.insert(b, grid);
    }
    let objective: Expression = terms.iter().map(|&(c, v)| c * v).sum();

    let mut model = vars.minimise(objective).using(microlp);
    for &b in component {
        let block = &problem.blocks[b];
        let grid = &grids[&b];
        for row in grid {
            let out: Expression = row.iter().copied().sum();
            model = if problem.merge {
                model.with(constraint!(out >= 1.0))
            } else {
                model.with(constraint!(out == 1.0))
            };
        }
        for c in 0..block.cols {
            let into: Expression = grid.iter().map(|row| row[c]).sum();
            model = if problem.merge {
                model.with(constraint!(into == 1.0))
            } else {
                model.with(constraint!(into <= 1.0))
            };
        }
    }
    // x_direct[a][c] >= x_first[a][b] + x_second[b][c] - 1: with the capacities above this
    // pins the direct matching to the composed one.
    for coupling in problem.couplings() {
        let (Some(first), Some(second), Some(direct)) = (
            grids.get(&coupling.first),
            grids.get(&coupling.second),
            grids.get(&coupling.direct),
        ) else {
            continue;
        };
        for (a, first_row) in first.iter().enumerate() {
            for (b, &via) in first_row.iter().enumerate() {
                for (c, &onward) in second[b].iter().enumerate() {
                    model = model.with(constraint!(direct[a][c] >= via + onward - 1.0));
                }
            }
        }
    }

    let solution = model.solve().map_err(|e| e.to_string())?;
    Ok(component
        .iter()
        .map(|b| {
            let mut pairs = Vec::new();
            for (a, row) in grids[b].iter().enumerate() {
                for (c, &v) in row.iter().enumerate() {
                    if solution.value(v) > 0.5 {
                        pairs.push((a, c));
                    }
                }
            }
            pairs
        })
        .collect())
}

/// Feasible matching for every block.
///
/// A block outside any coupling gets its exact optimum from one square assignment, in which
/// surplus rows stand for a second pick of each higher-K column's cheapest lower-K column
/// when merging. Coupled blocks are read off one labelling shared by every mode, so each
/// direct matching is the composition of the matchings it spans.
pub fn incumbent(problem: &MatchingProblem) -> Result<Matchings> {
    let coupled = problem.coupled_blocks();
    let labelling = if coupled.iter().any(|&c| c) {
        Some(Labelling::build(problem)?)
    } else {
        None
    };
    problem
        .blocks
        .iter()
        .zip(coupled)
        .map(|(block, is_coupled)| match &labelling {
            Some(labelling) if is_coupled => labelling.matching(block, problem.merge),
            _ => exact_block(block, problem.merge),
        })
        .collect()
}

fn cheapest_row(costs: &[Vec<f64>], col: usize) -> usize {
    (0..costs.len())
        .min_by(|&x, &y| costs[x][col].total_cmp(&costs[y][col]))
        .unwrap_or(0)
}

fn exact_block(block: &MatchingBlock, merge: bool) -> Result<Vec<(usize, usize)>> {
    if block.rows > block.cols {
        return Err(AlignError::OptimizationInfeasible(format!(
            "K{}M{} has {} columns and cannot be matched into the {} columns of K{}M{}",
            block.low.k,
            block.low.mode + 1,
            block.rows,
            block.cols,
            block.high.k,
            block.high.mode + 1
        )));
    }
    let mut pairs: Vec<(usize, usize)> = if merge {
        let cheapest: Vec<usize> = (0..block.cols).map(|c| cheapest_row(&block.costs, c)).collect();
        let mut square = block.costs.clone();
        let surplus: Vec<f64> = (0..block.cols).map(|c| block.costs[cheapest[c]][c]).collect();
        square.resize(block.cols, surplus);
        HungarianSolver
            .solve(&square)?
            .columns
            .iter()
            .enumerate()
            .map(|(a, &c)| (if a < block.rows { a } else { cheapest[c] }, c))
            .collect()
    } else {
        HungarianSolver
            .solve(&block.costs)?
            .columns
            .iter()
            .enumerate()
            .map(|(a, &c)| (a, c))
            .collect()
    };
    pairs.sort_unstable();
    Ok(pairs)
}

/// Lineage labels for every mode's columns; labels at K are `0..K`.
///
/// Mode 0 of each K is the pivot. A mode takes the labels of the previous K's pivot through
/// a one-to-one assignment, its leftover columns take the new labels, and each new label
/// points back to the cheapest pivot column below it.
struct Labelling {
    ks: Vec<usize>,
    frames: HashMap<ModeRef, Vec<usize>>,
    /// `parents[l][label]` maps a label at `ks[l + 1]` to a label at `ks[l]`
    parents: Vec<Vec<usize>>,
}

impl Labelling {
    fn build(problem: &MatchingProblem) -> Result<Self> {
        let index: HashMap<(ModeRef, ModeRef), &MatchingBlock> =
            problem.blocks.iter().map(|b| ((b.low, b.high), b)).collect();
        let block = |low: ModeRef, high: ModeRef| {
            index.get(&(low, high)).copied().ok_or_else(|| {
                AlignError::OptimizationInfeasible(format!(
                    "no mode pair K{}M{} -> K{}M{} to build lineages on",
                    low.k,
                    low.mode + 1,
                    high.k,
                    high.mode + 1
                ))
            })
        };
        let mut ks: Vec<usize> = problem.blocks.iter().flat_map(|b| [b.low.k, b.high.k]).collect();
        ks.sort_unstable();
        ks.dedup();
        let mut mode_count: HashMap<usize, usize> = HashMap::new();
        for r in problem.blocks.iter().flat_map(|b| [b.low, b.high]) {
            let count = mode_count.entry(r.k).or_insert(0);
            *count = (*count).max(r.mode + 1);
        }
        let modes_at = |k: usize| mode_count.get(&k).copied().unwrap_or(0);
        let pivot = |k: usize| ModeRef { k, mode: 0 };

        let mut frames: HashMap<ModeRef, Vec<usize>> = HashMap::new();
        let mut parents = Vec::new();
        if let Some(&first) = ks.first() {
            frames.insert(pivot(first), (0..first).collect());
        }
        for w in ks.windows(2) {
            let (lo, hi) = (w[0], w[1]);
            let lo_frame = frames.get(&pivot(lo)).cloned().unwrap_or_else(|| (0..lo).collect());
            for mode in 0..modes_at(hi) {
                let high = ModeRef { k: hi, mode };
                let b = block(pivot(lo), high)?;
                let mut frame = vec![None; hi];
                for (a, &c) in HungarianSolver.solve(&b.costs)?.columns.iter().enumerate() {
                    frame[c] = Some(lo_frame[a]);
                }
                let mut next = lo;
                let frame: Vec<usize> = frame
                    .into_iter()
                    .map(|l| {
                        l.unwrap_or_else(|| {
                            next += 1;
                            next - 1
                        })
                    })
                    .collect();
                if mode == 0 {
                    let mut parent: Vec<usize> = (0..hi).collect();
                    for (c, &label) in frame.iter().enumerate().filter(|&(_, &l)| l >= lo) {
                        parent[label] = lo_frame[cheapest_row(&b.costs, c)];
                    }
                    parents.push(parent);
                }
                frames.insert(high, frame);
            }
        }

        // Other modes at the first K borrow their labels from the next K's pivot.
        if let &[first, second, ..] = ks.as_slice() {
            let up = frames.get(&pivot(second)).cloned().unwrap_or_else(|| (0..second).collect());
            for mode in 1..modes_at(first) {
                let low = ModeRef { k: first, mode };
                let b = block(low, pivot(second))?;
                let mut frame = vec![None; first];
                let mut used = vec![false; first];
                for (a, &c) in HungarianSolver.solve(&b.costs)?.columns.iter().enumerate() {
                    let label = up[c];
                    if label < first && !used[label] {
                        frame[a] = Some(label);
                        used[label] = true;
                    }
                }
                let mut free = (0..first).filter(|&l| !used[l]);
                let frame: Vec<usize> = frame.into_iter().map(|l| l.or_else(|| free.next()).unwrap_or(0)).collect();
                frames.insert(low, frame);
            }
        }

        Ok(Self { ks, frames, parents })
    }

    fn matching(&self, block: &MatchingBlock, merge: bool) -> Result<Vec<(usize, usize)>> {
        let frame = |r: ModeRef| {
            self.frames.get(&r).ok_or_else(|| {
                AlignError::OptimizationInfeasible(format!("K{}M{} has no lineage labels", r.k, r.mode + 1))
            })
        };
        let level = |k: usize| self.ks.iter().position(|&x| x == k).unwrap_or(0);
        let (low, high) = (frame(block.low)?, frame(block.high)?);
        let mut column_of = vec![0; low.len()];
        for (a, &label) in low.iter().enumerate() {
            column_of[label] = a;
        }
        let (lo_level, hi_level) = (level(block.low.k), level(block.high.k));

        let mut pairs = Vec::new();
        for (c, &label) in high.iter().enumerate() {
            if label < low.len() {
                pairs.push((column_of[label], c));
            } else if merge {
                let ancestor = (lo_level..hi_level)
                    .rev()
                    .fold(label, |l, step| self.parents[step][l]);
                pairs.push((column_of[ancestor], c));
            }
        }
        pairs.sort_unstable();
        Ok(pairs)
    }
}

/// Align modes across K and trace cluster lineages.
///
/// `modes` must be ordered by increasing K. One K gives the trivial empty alignment; a K with
/// no modes is an error.
pub fn align_across_k(
    modes: &[ModeAnchors],
    anchor: AnchorKind,
    options: &AcrossKOptions,
    solver: &dyn MatchingSolver,
) -> Result<AcrossKAlignment> {
    for level in modes {
        if level.anchors.is_empty() {
            return Err(AlignError::EmptyPartition { k: level.k });
        }
    }
    if modes.windows(2).any(|w| w[0].k >= w[1].k) {
        return Err(AlignError::Configuration(
            "across-K alignment needs strictly increasing K values".to_string(),
        ));
    }
    if modes.len() < 2 {
        return Ok(AcrossKAlignment::trivial(anchor));
    }
    let individuals = modes[0].anchors[0].rows();
    for level in modes {
        for (m, a) in level.anchors.iter().enumerate() {
            if a.rows() != individuals || a.cols() != level.k {
                return Err(AlignError::InputMismatch {
                    context: format!("anchor of K{}M{}", level.k, m + 1),
                    left_rows: individuals,
                    left_cols: level.k,
                    right_rows: a.rows(),
                    right_cols: a.cols(),
                });
            }
        }
    }

    // Level pairs: adjacent only, or every pair of distinct K values.
    let mut level_pairs = Vec::new();
    for lo in 0..modes.len() {
        let last = if options.all_pairs { modes.len() } else { (lo + 2).min(modes.len()) };
        for hi in (lo + 1)..last {
            level_pairs.push((lo, hi));
        }
    }

    let mut blocks = Vec::new();
    for &(lo, hi) in &level_pairs {
        for (ml, low) in modes[lo].anchors.iter().enumerate() {
            for (mh, high) in modes[hi].anchors.iter().enumerate() {
                blocks.push(MatchingBlock {
                    low: ModeRef { k: modes[lo].k, mode: ml },
                    high: ModeRef { k: modes[hi].k, mode: mh },
                    rows: low.cols(),
                    cols: high.cols(),
                    costs: options.metric.column_grid(low, high),
                });
            }
        }
    }

    let problem = MatchingProblem {
        blocks,
        merge: options.merge,
    };
    let MatchingOutcome {
        matchings,
        status,
        proven_optimal,
    } = solver.solve(&problem, options.time_limit)?;
    if matchings.len() != problem.blocks.len() {
        return Err(AlignError::OptimizationInfeasible(format!(
            "solver returned {} matchings for {} mode pairs",
            matchings.len(),
            problem.blocks.len()
        )));
    }

    let edges: Vec<EdgeAlignment> = problem
        .blocks
        .iter()
        .zip(matchings)
        .map(|(block, mut matching)| {
            matching.sort_unstable();
            let cost = matching.iter().map(|&(a, b)| block.costs[a][b]).sum();
            EdgeAlignment {
                low: block.low,
                high: block.high,
                matching,
                cost,
            }
        })
        .collect();
    let total_cost = edges.iter().map(|e| e.cost).sum();

    let mut best_pairs = Vec::new();
    for w in modes.windows(2) {
        let best = edges
            .iter()
            .filter(|e| e.low.k == w[0].k && e.high.k == w[1].k)
            .min_by(|x, y| {
                x.cost
                    .total_cmp(&y.cost)
                    .then(x.low.mode.cmp(&y.low.mode))
                    .then(x.high.mode.cmp(&y.high.mode))
            });
        if let Some(best) = best {
            best_pairs.push(best.clone());
        }
    }

    let lineages = trace_lineages(modes, &edges, &problem);

    Ok(AcrossKAlignment {
        anchor,
        edges,
        total_cost,
        best_pairs,
        lineages,
        status,
        proven_optimal,
    })
}

fn trace_lineages(modes: &[ModeAnchors], edges: &[EdgeAlignment], problem: &MatchingProblem) -> Vec<LineageEntry> {
    let index: HashMap<(ModeRef, ModeRef), usize> =
        edges.iter().enumerate().map(|(i, e)| ((e.low, e.high), i)).collect();
    let mut labels: BTreeMap<ModeRef, Vec<usize>> = BTreeMap::new();
    let mut entries = Vec::new();

    let first = &modes[0];
    for mode in 0..first.anchors.len() {
        let mut label = vec![0; first.k];
        match first.alignment_to_major.get(mode) {
            Some(perm) if perm.len() == first.k => {
                for (c, &col) in perm.iter().enumerate() {
                    label[col] = c;
                }
            }
            _ => label = (0..first.k).collect(),
        }
        for (column, &l) in label.iter().enumerate() {
            entries.push(LineageEntry {
                k: first.k,
                mode,
                column,
                label: l,
                parent: None,
                inherited: false,
            });
        }
        labels.insert(ModeRef { k: first.k, mode }, label);
    }

    for w in modes.windows(2) {
        let (lo, hi) = (&w[0], &w[1]);
        // One counter per K: new clusters in sibling modes never share a label.
        let mut next = labels.values().flatten().max().map_or(0, |m| m + 1);
        for mh in 0..hi.anchors.len() {
            let high = ModeRef { k: hi.k, mode: mh };
            let parent = (0..lo.anchors.len())
                .filter_map(|ml| {
                    let low = ModeRef { k: lo.k, mode: ml };
                    index.get(&(low, high)).map(|&i| (low, i))
                })
                .min_by(|x, y| edges[x.1].cost.total_cmp(&edges[y.1].cost).then(x.0.mode.cmp(&y.0.mode)));
            let (low, edge_idx) = match parent {
                Some(p) => p,
                None => continue,
            };
            let parent_labels = labels.get(&low).cloned().unwrap_or_else(|| (0..lo.k).collect());
            let costs = &problem.blocks[edge_idx].costs;

            let mut children: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
            let mut parent_of = vec![None; hi.k];
            for &(a, b) in &edges[edge_idx].matching {
                children.entry(a).or_default().push(b);
                parent_of[b] = Some(a);
            }
            let mut label = vec![usize::MAX; hi.k];
            let mut inherited = vec![false; hi.k];
            for (&a, kids) in children.iter_mut() {
                kids.sort_by(|&x, &y| costs[a][x].total_cmp(&costs[a][y]).then(x.cmp(&y)));
                label[kids[0]] = parent_labels[a];
                inherited[kids[0]] = true;
            }
            for l in label.iter_mut().filter(|l| **l == usize::MAX) {
                *l = next;
                next += 1;
            }
            for column in 0..hi.k {
                entries.push(LineageEntry {
                    k: hi.k,
                    mode: mh,
                    column,
                    label: label[column],
                    parent: parent_of[column].map(|a| (lo.k, low.mode, a)),
                    inherited: inherited[column],
                });
            }
            labels.insert(high, label);
        }
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn matrix(rows: Vec<Vec<f64>>) -> MembershipMatrix {
        MembershipMatrix::from_rows(&rows).unwrap()
    }

    /// K=2 and K=3 where the K=3 run splits the first K=2 cluster in two
    fn split_levels() -> Vec<ModeAnchors> {
        let k2 = matrix(vec![
            vec![1.0, 0.0],
            vec![1.0, 0.0],
            vec![1.0, 0.0],
            vec![1.0, 0.0],
            vec![0.0, 1.0],
            vec![0.0, 1.0],
        ]);
        // Columns shuffled: high column 0 = old cluster B, 1 and 2 = halves of cluster A.
        let k3 = matrix(vec![
            vec![0.0, 1.0, 0.0],
            vec![0.0, 1.0, 0.0],
            vec![0.0, 0.0, 1.0],
            vec![0.0, 0.0, 1.0],
            vec![1.0, 0.0, 0.0],
            vec![1.0, 0.0, 0.0],
        ]);
        vec![
            ModeAnchors {
                k: 2,
                anchors: vec![k2],
                alignment_to_major: vec![vec![0, 1]],
            },
            ModeAnchors {
                k: 3,
                anchors: vec![k3],
                alignment_to_major: vec![vec![0, 1, 2]],
            },
        ]
    }

    fn options(merge: bool) -> AcrossKOptions {
        AcrossKOptions {
            merge,
            ..AcrossKOptions::default()
        }
    }

    #[test]
    fn single_k_is_a_trivial_alignment() {
        let levels = vec![split_levels().remove(0)];
        let result = align_across_k(&levels, AnchorKind::Representative, &options(false), &IlpMatchingSolver).unwrap();
        assert!(result.edges.is_empty());
        assert_eq!(result.total_cost, 0.0);
        assert!(result.proven_optimal);
        assert_eq!(result.status, SolveStatus::Trivial);
    }

    #[test]
    fn empty_partition_is_rejected() {
        let mut levels = split_levels();
        levels[1].anchors.clear();
        let err = align_across_k(&levels, AnchorKind::Consensus, &options(false), &IlpMatchingSolver).unwrap_err();
        assert!(matches!(err, AlignError::EmptyPartition { k: 3 }));
    }

    #[test]
    fn without_merge_each_low_column_takes_one_high_column() {
        let result =
            align_across_k(&split_levels(), AnchorKind::Representative, &options(false), &IlpMatchingSolver).unwrap();
        assert!(result.proven_optimal);
        let edge = &result.edges[0];
        assert_eq!(edge.matching.len(), 2);
        let mut highs: Vec<usize> = edge.matching.iter().map(|&(_, b)| b).collect();
        highs.dedup();
        assert_eq!(highs.len(), 2);
        // Low cluster B (column 1) must follow high column 0.
        assert!(edge.matching.contains(&(1, 0)));
    }

    #[test]
    fn with_merge_both_halves_map_to_the_split_cluster() {
        let result =
            align_across_k(&split_levels(), AnchorKind::Representative, &options(true), &IlpMatchingSolver).unwrap();
        let edge = &result.edges[0];
        assert_eq!(edge.matching, vec![(0, 1), (0, 2), (1, 0)]);
        let labels = result.labels(3, 0);
        assert_eq!(labels[0], 1);
        let mut sorted = labels.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), 3);
        let split = result
            .lineages
            .iter()
            .filter(|e| e.k == 3 && e.parent == Some((2, 0, 0)))
            .count();
        assert_eq!(split, 2);
    }

    fn mode(k: usize, mode: usize) -> ModeRef {
        ModeRef { k, mode }
    }

    fn block(low: ModeRef, high: ModeRef, costs: Vec<Vec<f64>>) -> MatchingBlock {
        MatchingBlock {
            low,
            high,
            rows: costs.len(),
            cols: costs[0].len(),
            costs,
        }
    }

    /// K2 -> K3 -> K4 with a direct K2 -> K4 block that, on its own, would pick a matching
    /// crossing the composed one
    fn crossing_problem(merge: bool) -> MatchingProblem {
        let far = 5.0;
        let k2_k3 = vec![vec![0.0, far, far], vec![far, 0.0, far]];
        let k3_k4: Vec<Vec<f64>> = (0..3)
            .map(|a| (0..4).map(|b| if a == b { 0.0 } else { far }).collect())
            .collect();
        let k2_k4 = vec![vec![1.0, 0.0, 1.0, 1.0], vec![0.0, 1.0, 1.0, 1.0]];
        MatchingProblem {
            blocks: vec![
                block(mode(2, 0), mode(3, 0), k2_k3),
                block(mode(3, 0), mode(4, 0), k3_k4),
                block(mode(2, 0), mode(4, 0), k2_k4),
            ],
            merge,
        }
    }

    fn compose(first: &[(usize, usize)], second: &[(usize, usize)]) -> Vec<(usize, usize)> {
        let mut out: Vec<(usize, usize)> = first
            .iter()
            .flat_map(|&(a, b)| second.iter().filter(move |&&(x, _)| x == b).map(move |&(_, c)| (a, c)))
            .collect();
        out.sort_unstable();
        out
    }

    fn slow_component(_: &MatchingProblem, _: &[usize]) -> std::result::Result<Matchings, String> {
        thread::sleep(Duration::from_millis(300));
        Err("finished too late".to_string())
    }

    static COUNTED_STARTS: AtomicUsize = AtomicUsize::new(0);

    fn counted_slow_component(problem: &MatchingProblem, blocks: &[usize]) -> std::result::Result<Matchings, String> {
        COUNTED_STARTS.fetch_add(1, Ordering::SeqCst);
        slow_component(problem, blocks)
    }

    fn failing_component(_: &MatchingProblem, _: &[usize]) -> std::result::Result<Matchings, String> {
        Err("no feasible point".to_string())
    }

    #[test]
    fn equal_column_counts_without_merge_give_a_bijection() {
        let a = matrix(vec![vec![0.7, 0.3], vec![0.2, 0.8], vec![0.5, 0.5]]);
        let b = matrix(vec![vec![0.25, 0.75], vec![0.85, 0.15], vec![0.45, 0.55]]);
        let problem = MatchingProblem {
            blocks: vec![block(
                mode(2, 0),
                mode(2, 1),
                DistanceMetric::SquaredEuclidean.column_grid(&a, &b),
            )],
            merge: false,
        };
        let outcome = IlpMatchingSolver.solve(&problem, None).unwrap();
        assert_eq!(outcome.matchings[0], vec![(0, 1), (1, 0)]);
        assert!(outcome.proven_optimal);
    }

    #[test]
    fn incumbent_respects_capacities() {
        let problem = MatchingProblem {
            blocks: vec![block(
                mode(2, 0),
                mode(4, 0),
                vec![vec![0.1, 0.2, 0.9, 0.3], vec![0.8, 0.1, 0.2, 0.7]],
            )],
            merge: true,
        };
        let pairs = &incumbent(&problem).unwrap()[0];
        assert_eq!(pairs.len(), 4);
        for b in 0..4 {
            assert_eq!(pairs.iter().filter(|&&(_, x)| x == b).count(), 1);
        }
        for a in 0..2 {
            assert!(pairs.iter().any(|&(x, _)| x == a));
        }
    }

    #[test]
    fn uncoupled_incumbent_matches_the_integer_program() {
        let costs = vec![vec![0.1, 0.2, 0.9, 0.3], vec![0.8, 0.1, 0.2, 0.7]];
        for merge in [false, true] {
            let problem = MatchingProblem {
                blocks: vec![block(mode(2, 0), mode(4, 0), costs.clone())],
                merge,
            };
            let exact = IlpMatchingSolver.solve(&problem, None).unwrap().matchings;
            let fallback = incumbent(&problem).unwrap();
            let cost = |m: &[(usize, usize)]| m.iter().map(|&(a, b)| costs[a][b]).sum::<f64>();
            assert!((cost(&exact[0]) - cost(&fallback[0])).abs() < 1e-9, "merge {}", merge);
        }
    }

    #[test]
    fn direct_matching_follows_the_composed_one() {
        let problem = crossing_problem(false);
        assert_eq!(problem.couplings(), vec![Coupling { first: 0, second: 1, direct: 2 }]);
        let outcome = IlpMatchingSolver.solve(&problem, None).unwrap();
        assert_eq!(outcome.status, SolveStatus::Optimal);
        let m = &outcome.matchings;
        assert_eq!(m[0], vec![(0, 0), (1, 1)]);
        assert_eq!(m[2], vec![(0, 0), (1, 1)]);
        assert_eq!(m[2], compose(&m[0], &m[1]));
    }

    #[test]
    fn coupled_incumbent_is_coherent() {
        for merge in [false, true] {
            let problem = crossing_problem(merge);
            let m = incumbent(&problem).unwrap();
            assert_eq!(m[2], compose(&m[0], &m[1]), "merge {}", merge);
            if merge {
                for (pairs, cols) in m.iter().zip([3, 4, 4]) {
                    for c in 0..cols {
                        assert_eq!(pairs.iter().filter(|&&(_, x)| x == c).count(), 1);
                    }
                }
            }
        }
    }

    #[test]
    fn timed_out_solve_returns_the_incumbent() {
        let single = MatchingProblem {
            blocks: vec![block(mode(2, 0), mode(3, 0), vec![vec![0.0, 0.4, 0.2], vec![0.5, 0.1, 0.3]])],
            merge: true,
        };
        let outcome = solve_in_worker(&single, Some(Duration::from_millis(20)), slow_component).unwrap();
        assert!(matches!(outcome.status, SolveStatus::TimedOut { .. }));
        assert!(outcome.proven_optimal);
        assert_eq!(outcome.matchings, incumbent(&single).unwrap());

        let coupled = crossing_problem(false);
        let outcome = solve_in_worker(&coupled, Some(Duration::from_millis(20)), slow_component).unwrap();
        assert!(matches!(outcome.status, SolveStatus::TimedOut { .. }));
        assert!(!outcome.proven_optimal);
        assert_eq!(outcome.matchings[2], compose(&outcome.matchings[0], &outcome.matchings[1]));
    }

    #[test]
    fn timed_out_worker_stops_before_the_next_component() {
        // Three independent blocks, so three components for the worker.
        let costs = vec![vec![0.0, 1.0], vec![1.0, 0.0]];
        let problem = MatchingProblem {
            blocks: vec![
                block(mode(2, 0), mode(3, 0), costs.clone()),
                block(mode(2, 0), mode(3, 1), costs.clone()),
                block(mode(2, 0), mode(3, 2), costs),
            ],
            merge: false,
        };
        solve_in_worker(&problem, Some(Duration::from_millis(20)), counted_slow_component).unwrap();
        thread::sleep(Duration::from_millis(900));
        assert_eq!(COUNTED_STARTS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn solver_failure_is_reported_with_the_incumbent() {
        let problem = crossing_problem(true);
        let outcome = solve_in_worker(&problem, None, failing_component).unwrap();
        assert_eq!(outcome.status, SolveStatus::SolverFailed("no feasible point".to_string()));
        assert!(!outcome.proven_optimal);
        assert_eq!(outcome.matchings, incumbent(&problem).unwrap());
    }

    struct GaveUp;

    impl MatchingSolver for GaveUp {
        fn solve(&self, problem: &MatchingProblem, _: Option<Duration>) -> Result<MatchingOutcome> {
            Ok(MatchingOutcome {
                matchings: incumbent(problem)?,
                status: SolveStatus::TimedOut {
                    limit: Duration::from_millis(1),
                },
                proven_optimal: false,
            })
        }
    }

    #[test]
    fn unproven_outcome_reaches_the_alignment() {
        let result = align_across_k(&split_levels(), AnchorKind::Representative, &options(true), &GaveUp).unwrap();
        assert_eq!(
            result.status,
            SolveStatus::TimedOut {
                limit: Duration::from_millis(1)
            }
        );
        assert!(!result.proven_optimal);
        assert_eq!(result.edges[0].matching, vec![(0, 1), (0, 2), (1, 0)]);
    }

    #[test]
    fn new_clusters_in_sibling_modes_get_distinct_labels() {
        let mut levels = split_levels();
        let k3 = levels[1].anchors[0].clone();
        levels[1].anchors.push(k3.permute_columns(&[2, 0, 1]).unwrap());
        levels[1].alignment_to_major.push(vec![1, 2, 0]);
        let result = align_across_k(&levels, AnchorKind::Representative, &options(false), &IlpMatchingSolver).unwrap();
        let fresh = |mode: usize| -> Vec<usize> {
            result.labels(3, mode).into_iter().filter(|&l| l >= 2).collect()
        };
        assert_eq!(fresh(0).len(), 1);
        assert_eq!(fresh(1).len(), 1);
        assert_ne!(fresh(0), fresh(1));
    }
}
