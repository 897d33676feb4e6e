use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use thiserror::Error;

use crate::quantization::kmeans_tree::{QuantizationTree, TreeNode};
use crate::shared::constants::{
    BUILD_THREAD_STEP, DEFAULT_MAX_LEVEL, DEFAULT_MIN_ELEM, DEFAULT_NB_BRANCHES,
    KMEANS_ITERATIONS, MAX_BUILD_THREADS,
};
use crate::shared::descriptor_file::{read_descriptor_file, DescriptorFileError};

#[derive(Error, Debug)]
pub enum TreeBuildError {
    #[error("no training descriptors")]
    Empty,
    #[error("descriptor {row} has a non-finite value at coordinate {column}")]
    NonFinite { row: usize, column: usize },
    #[error("a tree needs at least 2 branches, got {0}")]
    Branches(usize),
    #[error(transparent)]
    Descriptors(#[from] DescriptorFileError),
}

#[derive(Clone, Debug, PartialEq)]
pub struct TreeBuildParams {
    pub nb_branches: usize,
    /// Depth at which splitting stops.
    pub max_level: usize,
    /// A node splits only while it holds more than this many samples.
    pub min_elem: usize,
    pub iterations: usize,
    pub max_threads: usize,
    pub thread_step: usize,
    pub seed: u64,
    /// Read at most this many descriptors from a file.
    pub limit: Option<usize>,
}

impl Default for TreeBuildParams {
    fn default() -> Self {
        Self {
            nb_branches: DEFAULT_NB_BRANCHES,
            max_level: DEFAULT_MAX_LEVEL,
            min_elem: DEFAULT_MIN_ELEM,
            iterations: KMEANS_ITERATIONS,
            max_threads: MAX_BUILD_THREADS,
            thread_step: BUILD_THREAD_STEP,
            seed: 0,
            limit: None,
        }
    }
}

/// Bounds nested parallelism while splitting subtrees.
///
/// Forking a split's children reserves `step` threads; once `cap` are in
/// use, deeper splits run their children sequentially.
pub struct ForkBudget {
    in_use: AtomicUsize,
    cap: usize,
    step: usize,
}

impl ForkBudget {
    pub fn new(cap: usize, step: usize) -> Self {
        Self {
            in_use: AtomicUsize::new(0),
            cap,
            step: step.max(1),
        }
    }

    pub fn try_acquire(&self) -> bool {
        self.in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                (used < self.cap).then_some(used + self.step)
            })
            .is_ok()
    }

    pub fn release(&self) {
        self.in_use.fetch_sub(self.step, Ordering::AcqRel);
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }
}

/// Builds a tree from one descriptor per row of `data`.
pub fn build_tree(
    data: ArrayView2<f32>,
    params: &TreeBuildParams,
) -> Result<QuantizationTree, TreeBuildError> {
    if params.nb_branches < 2 {
        return Err(TreeBuildError::Branches(params.nb_branches));
    }
    if data.nrows() == 0 {
        return Err(TreeBuildError::Empty);
    }
    for (row, sample) in data.axis_iter(Axis(0)).enumerate() {
        if let Some(column) = sample.iter().position(|v| !v.is_finite()) {
            return Err(TreeBuildError::NonFinite { row, column });
        }
    }

    let samples: Vec<usize> = (0..data.nrows()).collect();
    let mut root = TreeNode::leaf(0, mean_of(data, &samples));
    let budget = ForkBudget::new(params.max_threads, params.thread_step);
    let splitter = Splitter {
        data,
        params,
        budget: &budget,
    };
    splitter.recursive_split(&mut root, samples, 0, params.seed);

    let mut tree = QuantizationTree::new(root, params.nb_branches, data.ncols());
    let leaves = tree.assign_leaf_ids();
    log::info!(
        "Built quantization tree from {} descriptors: {} leaves, depth {}",
        data.nrows(),
        leaves,
        tree.depth()
    );
    Ok(tree)
}

/// Reads `{i64, f32[D]}` records from `path` and builds a tree from them.
pub fn build_tree_from_file(
    path: &Path,
    descriptor_size: usize,
    params: &TreeBuildParams,
) -> Result<QuantizationTree, TreeBuildError> {
    let records = read_descriptor_file(path, descriptor_size, params.limit)?;
    log::info!("Read {} descriptors from {}", records.len(), path.display());
    let mut data = Array2::<f32>::zeros((records.len(), descriptor_size));
    for (mut row, record) in data.axis_iter_mut(Axis(0)).zip(&records) {
        row.assign(&ArrayView1::from(&record.descriptor[..]));
    }
    drop(records);
    build_tree(data.view(), params)
}

struct Splitter<'a> {
    data: ArrayView2<'a, f32>,
    params: &'a TreeBuildParams,
    budget: &'a ForkBudget,
}

impl Splitter<'_> {
    fn recursive_split(&self, node: &mut TreeNode, samples: Vec<usize>, level: usize, seed: u64) {
        if level >= self.params.max_level || samples.len() <= self.params.min_elem {
            return;
        }

        let clusters = run_kmeans(self.data, &samples, self.params, seed);
        drop(samples);
        let occupied = clusters.iter().filter(|c| c.is_some()).count();
        if occupied < 2 {
            log::debug!("Node at level {level} does not separate; kept as leaf");
            return;
        }
        log::debug!("Split node at level {level} into {occupied} children");

        let mut work = Vec::with_capacity(occupied);
        {
            let slots = node.children_mut();
            *slots = (0..self.params.nb_branches).map(|_| None).collect();
            for (branch, (slot, cluster)) in slots.iter_mut().zip(clusters).enumerate() {
                if let Some((mean, members)) = cluster {
                    let child = slot.insert(Box::new(TreeNode::leaf(0, mean)));
                    work.push((child, members, child_seed(seed, branch)));
                }
            }
        }

        if self.budget.try_acquire() {
            std::thread::scope(|scope| {
                for (child, members, child_seed) in work {
                    scope.spawn(move || {
                        self.recursive_split(child, members, level + 1, child_seed)
                    });
                }
            });
            self.budget.release();
        } else {
            for (child, members, child_seed) in work {
                self.recursive_split(child, members, level + 1, child_seed);
            }
        }
    }
}

/// Seed for the subtree under `branch`, independent of scheduling order.
fn child_seed(parent: u64, branch: usize) -> u64 {
    parent
        .wrapping_mul(0x9E37_79B9_7F4A_7C15)
        .wrapping_add(branch as u64 + 1)
        .rotate_left(17)
}

fn mean_of(data: ArrayView2<f32>, samples: &[usize]) -> Vec<f32> {
    let mut mean = vec![0.0f32; data.ncols()];
    for (count, &i) in samples.iter().enumerate() {
        accumulate(&mut mean, data.row(i), count + 1);
    }
    mean
}

/// Running average: folds the `count`-th sample into `mean`.
fn accumulate(mean: &mut [f32], sample: ArrayView1<f32>, count: usize) {
    let b = 1.0 / count as f32;
    let a = 1.0 - b;
    for (m, x) in mean.iter_mut().zip(sample.iter()) {
        *m = *m * a + x * b;
    }
}

fn row_distance(mean: &[f32], sample: ArrayView1<f32>) -> f32 {
    mean.iter()
        .zip(sample.iter())
        .map(|(m, x)| (m - x) * (m - x))
        .sum()
}

fn nearest(centers: &[Vec<f32>], sample: ArrayView1<f32>) -> usize {
    let mut best = 0;
    let mut best_d = f32::INFINITY;
    for (i, c) in centers.iter().enumerate() {
        let d = row_distance(c, sample);
        if d < best_d {
            best_d = d;
            best = i;
        }
    }
    best
}

/// Splits `samples` into at most `nb_branches` groups.
///
/// Returns one slot per branch: the group's mean and its members, or `None`
/// for a center that ended up without samples.
fn run_kmeans(
    data: ArrayView2<f32>,
    samples: &[usize],
    params: &TreeBuildParams,
    seed: u64,
) -> Vec<Option<(Vec<f32>, Vec<usize>)>> {
    let k = params.nb_branches;
    let mut centers = initial_centers(data, samples, k, seed);
    let used = centers.len();

    let mut assignment = vec![usize::MAX; samples.len()];
    for iteration in 0..params.iterations.max(1) {
        let mut changed = false;
        for (slot, &i) in assignment.iter_mut().zip(samples) {
            let c = nearest(&centers, data.row(i));
            if *slot != c {
                *slot = c;
                changed = true;
            }
        }
        if !changed {
            log::trace!("k-means converged after {iteration} iterations");
            break;
        }
        let mut counts = vec![0usize; used];
        let mut sums: Vec<Vec<f32>> = vec![vec![0.0; data.ncols()]; used];
        for (&c, &i) in assignment.iter().zip(samples) {
            counts[c] += 1;
            accumulate(&mut sums[c], data.row(i), counts[c]);
        }
        for ((center, mean), count) in centers.iter_mut().zip(sums).zip(&counts) {
            if *count > 0 {
                *center = mean;
            }
        }
    }

    let mut members: Vec<Vec<usize>> = vec![Vec::new(); used];
    for (&c, &i) in assignment.iter().zip(samples) {
        members[c].push(i);
    }
    let mut slots: Vec<Option<(Vec<f32>, Vec<usize>)>> = centers
        .into_iter()
        .zip(members)
        .map(|(mean, m)| (!m.is_empty()).then_some((mean, m)))
        .collect();
    slots.resize_with(k, || None);
    slots
}

/// Each center starts on a distinct sample drawn with the node's seed.
/// Fewer samples than branches give one center per sample.
fn initial_centers(data: ArrayView2<f32>, samples: &[usize], k: usize, seed: u64) -> Vec<Vec<f32>> {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
    rand::seq::index::sample(&mut rng, samples.len(), k.min(samples.len()))
        .into_iter()
        .map(|j| data.row(samples[j]).to_vec())
        .collect()
}
