use std::collections::{BTreeMap, HashMap};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::error::{AlignError, Result};
use crate::within_k::{CostMatrix, WithinKResult};

// Two communities stay separate modes only when their mean cross cost exceeds both
// SEPARATION_FACTOR times the replicate noise level and the metric's separation floor.
const SEPARATION_FACTOR: f64 = 3.0;
// Smallest modularity improvement that counts as a move in the local-moving phase
const MIN_GAIN: f64 = 1e-12;

/// Weighted undirected replicate graph, weight = similarity in `[0, 1]`.
///
/// Gaps in the cost matrix are absent edges.
#[derive(Debug, Clone)]
pub struct SimilarityGraph {
    n: usize,
    weights: Vec<f64>,
}

impl SimilarityGraph {
    /// Similarity `1 - cost`, clamped to `[0, 1]`
    pub fn from_costs(costs: &CostMatrix, members: &[usize]) -> Self {
        Self::build(costs, members, |c| 1.0 - c)
    }

    /// Similarity rescaled within `members`: `1 - cost / max_cost`, so the most distant
    /// available pair has weight 0.
    pub fn rescaled(costs: &CostMatrix, members: &[usize]) -> Self {
        let mut max_cost: f64 = 0.0;
        for (a, &i) in members.iter().enumerate() {
            for &j in &members[a + 1..] {
                if let Some(c) = costs.get(i, j) {
                    max_cost = max_cost.max(c);
                }
            }
        }
        if max_cost <= f64::EPSILON {
            Self::build(costs, members, |_| 1.0)
        } else {
            Self::build(costs, members, |c| 1.0 - c / max_cost)
        }
    }

    fn build(costs: &CostMatrix, members: &[usize], similarity: impl Fn(f64) -> f64) -> Self {
        let n = members.len();
        let mut weights = vec![0.0; n * n];
        for (a, &i) in members.iter().enumerate() {
            for (b, &j) in members.iter().enumerate() {
                if a == b {
                    continue;
                }
                if let Some(c) = costs.get(i, j) {
                    weights[a * n + b] = similarity(c).clamp(0.0, 1.0);
                }
            }
        }
        Self { n, weights }
    }

    fn len(&self) -> usize {
        self.n
    }

    fn adjacency(&self) -> Vec<Vec<f64>> {
        self.weights.chunks(self.n.max(1)).take(self.n).map(|r| r.to_vec()).collect()
    }
}

/// Partition a graph's nodes; `labels[i]` is node `i`'s community
pub trait CommunityDetector: Send + Sync {
    fn detect(&self, graph: &SimilarityGraph) -> Vec<usize>;
}

/// Louvain modularity optimization (local moving + aggregation).
///
/// Nodes are visited in index order unless a seed is given, in which case the order is
/// shuffled once per level by a seeded generator. Either way the result is reproducible.
#[derive(Debug, Clone)]
pub struct Louvain {
    pub resolution: f64,
    pub seed: Option<u64>,
}

impl Default for Louvain {
    fn default() -> Self {
        Self {
            resolution: 1.0,
            seed: None,
        }
    }
}

impl CommunityDetector for Louvain {
    fn detect(&self, graph: &SimilarityGraph) -> Vec<usize> {
        let mut rng = self.seed.map(StdRng::seed_from_u64);
        let mut membership: Vec<usize> = (0..graph.len()).collect();
        let mut adj = graph.adjacency();

        loop {
            let n = adj.len();
            let degree: Vec<f64> = adj.iter().map(|r| r.iter().sum()).collect();
            let two_m: f64 = degree.iter().sum();
            if n < 2 || two_m <= 0.0 {
                break;
            }

            let mut community: Vec<usize> = (0..n).collect();
            let mut total: Vec<f64> = degree.clone();
            let mut order: Vec<usize> = (0..n).collect();
            if let Some(rng) = rng.as_mut() {
                order.shuffle(rng);
            }

            let mut moved_any = false;
            loop {
                let mut moved = false;
                for &i in &order {
                    let current = community[i];
                    let mut links: BTreeMap<usize, f64> = BTreeMap::new();
                    for j in 0..n {
                        if j != i && adj[i][j] > 0.0 {
                            *links.entry(community[j]).or_insert(0.0) += adj[i][j];
                        }
                    }
                    total[current] -= degree[i];

                    let mut best = current;
                    let mut best_gain = links.get(&current).copied().unwrap_or(0.0)
                        - self.resolution * total[current] * degree[i] / two_m;
                    for (&c, &w) in &links {
                        let gain = w - self.resolution * total[c] * degree[i] / two_m;
                        if gain > best_gain + MIN_GAIN {
                            best = c;
                            best_gain = gain;
                        }
                    }

                    total[best] += degree[i];
                    if best != current {
                        community[i] = best;
                        moved = true;
                        moved_any = true;
                    }
                }
                if !moved {
                    break;
                }
            }
            if !moved_any {
                break;
            }

            let (renumbered, count) = renumber(&community);
            let mut next = vec![vec![0.0; count]; count];
            for i in 0..n {
                for j in 0..n {
                    next[renumbered[i]][renumbered[j]] += adj[i][j];
                }
            }
            for m in membership.iter_mut() {
                *m = renumbered[*m];
            }
            adj = next;
        }

        renumber(&membership).0
    }
}

/// Relabel communities as 0, 1, ... in order of first appearance
fn renumber(labels: &[usize]) -> (Vec<usize>, usize) {
    let mut map: HashMap<usize, usize> = HashMap::new();
    let out = labels
        .iter()
        .map(|l| {
            let next = map.len();
            *map.entry(*l).or_insert(next)
        })
        .collect();
    (out, map.len())
}

/// How replicates are partitioned into modes
#[derive(Debug, Clone, PartialEq)]
pub enum ModeStrategy {
    /// Louvain at resolution 1 on similarities rescaled within each group, refined
    /// recursively and merged back wherever two communities are not separated beyond the
    /// replicate noise level
    Default,
    /// Plain Louvain on `1 - cost` at the given resolution; larger values give finer modes
    Resolution(f64),
}

/// Replicates at one K judged to be the same solution
#[derive(Debug, Clone, PartialEq)]
pub struct Mode {
    pub id: usize,
    pub members: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct ModeDetection {
    pub k: usize,
    pub modes: Vec<Mode>,
    /// `labels[replicate]` = mode id
    pub labels: Vec<usize>,
    pub isolated: Vec<usize>,
    pub components: usize,
    pub degenerate: bool,
    pub message: String,
}

/// Partition the replicates of one K into modes.
///
/// Replicates are connected when their pair has a cost and a positive similarity, and each
/// connected component is partitioned on its own. Modes are numbered by decreasing size,
/// ties by smallest member, so mode 0 is the major mode. A graph without a single usable
/// edge is reported as degenerate and every replicate becomes its own mode.
pub fn detect_modes(
    within: &WithinKResult,
    strategy: &ModeStrategy,
    seed: Option<u64>,
) -> Result<ModeDetection> {
    let k = within.k;
    let r = within.replicate_count();
    if r == 0 {
        return Err(AlignError::EmptyPartition { k });
    }
    let costs = &within.costs;

    let mut uf = UnionFind::new(r);
    let mut degree = vec![0usize; r];
    for i in 0..r {
        for j in (i + 1)..r {
            if costs.get(i, j).is_some_and(|c| c < 1.0) {
                uf.union(i, j);
                degree[i] += 1;
                degree[j] += 1;
            }
        }
    }
    let mut components: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for i in 0..r {
        components.entry(uf.find(i)).or_default().push(i);
    }
    let mut components: Vec<Vec<usize>> = components.into_values().collect();
    components.sort_by_key(|c| c[0]);
    let isolated: Vec<usize> = if r > 1 {
        (0..r).filter(|&i| degree[i] == 0).collect()
    } else {
        Vec::new()
    };
    let degenerate = r > 1 && isolated.len() == r;

    let detector = Louvain {
        resolution: match strategy {
            ModeStrategy::Default => 1.0,
            ModeStrategy::Resolution(resolution) => *resolution,
        },
        seed,
    };
    let threshold = separation_threshold(noise_level(costs), within.metric.mode_separation_floor());
    let mut groups: Vec<Vec<usize>> = Vec::new();
    for component in &components {
        if component.len() < 2 {
            groups.push(component.clone());
            continue;
        }
        match strategy {
            ModeStrategy::Default => groups.extend(split_recursive(costs, component, &detector, threshold)),
            ModeStrategy::Resolution(_) => {
                let graph = SimilarityGraph::from_costs(costs, component);
                groups.extend(group_members(&detector.detect(&graph), component));
            }
        }
    }
    for g in groups.iter_mut() {
        g.sort_unstable();
    }
    groups.sort_by(|a, b| b.len().cmp(&a.len()).then(a[0].cmp(&b[0])));

    let mut labels = vec![0; r];
    let modes: Vec<Mode> = groups
        .into_iter()
        .enumerate()
        .map(|(id, members)| {
            for &m in &members {
                labels[m] = id;
            }
            Mode { id, members }
        })
        .collect();

    let sizes: Vec<String> = modes.iter().map(|m| m.members.len().to_string()).collect();
    let mut message = format!(
        "K={}: {} mode(s) among {} replicate(s) (sizes {})",
        k,
        modes.len(),
        r,
        sizes.join(", ")
    );
    if degenerate {
        message.push_str(&format!(
            "; {}",
            AlignError::DegenerateGraph {
                k,
                detail: "no replicate pair has an alignment cost, every replicate is its own mode"
                    .to_string(),
            }
        ));
    } else {
        if !isolated.is_empty() {
            let names: Vec<&str> = isolated.iter().map(|&i| within.names[i].as_str()).collect();
            message.push_str(&format!(
                "; isolated replicates kept as singleton modes: {}",
                names.join(", ")
            ));
        }
        if components.len() > 1 {
            message.push_str(&format!(
                "; replicate graph has {} connected components, partitioned separately",
                components.len()
            ));
        }
    }

    Ok(ModeDetection {
        k,
        modes,
        labels,
        isolated,
        components: components.len(),
        degenerate,
        message,
    })
}

fn group_members(labels: &[usize], members: &[usize]) -> Vec<Vec<usize>> {
    let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (pos, &label) in labels.iter().enumerate() {
        groups.entry(label).or_default().push(members[pos]);
    }
    groups.into_values().collect()
}

fn split_recursive(
    costs: &CostMatrix,
    members: &[usize],
    detector: &dyn CommunityDetector,
    threshold: f64,
) -> Vec<Vec<usize>> {
    if members.len() < 2 {
        return vec![members.to_vec()];
    }
    let graph = SimilarityGraph::rescaled(costs, members);
    let groups = merge_weak(costs, group_members(&detector.detect(&graph), members), threshold);
    if groups.len() == 1 {
        return groups;
    }
    groups
        .into_iter()
        .flat_map(|g| split_recursive(costs, &g, detector, threshold))
        .collect()
}

/// Mean available cost between two groups, `None` when every cross pair is a gap
fn mean_cross_cost(costs: &CostMatrix, a: &[usize], b: &[usize]) -> Option<f64> {
    let values: Vec<f64> = a
        .iter()
        .flat_map(|&i| b.iter().filter_map(move |&j| costs.get(i, j)))
        .collect();
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

fn merge_weak(costs: &CostMatrix, mut groups: Vec<Vec<usize>>, threshold: f64) -> Vec<Vec<usize>> {
    loop {
        let mut closest: Option<(usize, usize, f64)> = None;
        for a in 0..groups.len() {
            for b in (a + 1)..groups.len() {
                if let Some(c) = mean_cross_cost(costs, &groups[a], &groups[b]) {
                    if c <= threshold && closest.map_or(true, |(_, _, best)| c < best) {
                        closest = Some((a, b, c));
                    }
                }
            }
        }
        match closest {
            Some((a, b, _)) => {
                let absorbed = groups.remove(b);
                groups[a].extend(absorbed);
                groups[a].sort_unstable();
            }
            None => return groups,
        }
    }
}

/// Median nearest-neighbour cost: how far a replicate typically is from its closest peer.
///
/// Needs at least three replicates to say anything about noise; returns 0 otherwise.
fn noise_level(costs: &CostMatrix) -> f64 {
    let r = costs.size();
    if r < 3 {
        return 0.0;
    }
    let mut nearest: Vec<f64> = (0..r)
        .filter_map(|i| {
            (0..r)
                .filter(|&j| j != i)
                .filter_map(|j| costs.get(i, j))
                .fold(None, |acc: Option<f64>, c| Some(acc.map_or(c, |a| a.min(c))))
        })
        .collect();
    if nearest.is_empty() {
        return 0.0;
    }
    nearest.sort_by(|a, b| a.total_cmp(b));
    let m = nearest.len();
    if m % 2 == 0 {
        (nearest[m / 2 - 1] + nearest[m / 2]) / 2.0
    } else {
        nearest[m / 2]
    }
}

fn separation_threshold(noise: f64, floor: f64) -> f64 {
    (SEPARATION_FACTOR * noise).max(floor)
}

struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<usize>,
}

impl UnionFind {
    fn new(size: usize) -> Self {
        Self {
            parent: (0..size).collect(),
            rank: vec![0; size],
        }
    }

    fn find(&mut self, x: usize) -> usize {
        if self.parent[x] != x {
            let root = self.find(self.parent[x]);
            self.parent[x] = root;
        }
        self.parent[x]
    }

    fn union(&mut self, a: usize, b: usize) {
        let root_a = self.find(a);
        let root_b = self.find(b);
        if root_a == root_b {
            return;
        }
        match self.rank[root_a].cmp(&self.rank[root_b]) {
            std::cmp::Ordering::Less => self.parent[root_a] = root_b,
            std::cmp::Ordering::Greater => self.parent[root_b] = root_a,
            std::cmp::Ordering::Equal => {
                self.parent[root_b] = root_a;
                self.rank[root_a] += 1;
            }
        }
    }
}
