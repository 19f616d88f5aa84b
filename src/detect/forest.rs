//! Isolation forest outlier model.
//!
//! Trees are grown on random subsamples of the job's own vectors; points
//! that are isolated after few splits score close to 1, points deep in a
//! dense region score around 0.5 or below. Sampling is driven by a seeded
//! RNG so a given input always produces the same forest.

use crate::detect::DetectError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForestParams {
    pub trees: usize,
    pub subsample: usize,
    pub seed: u64,
    /// Fewer vectors than this and the model refuses to fit.
    pub min_samples: usize,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            trees: 100,
            subsample: 256,
            seed: 42,
            min_samples: 10,
        }
    }
}

enum Node {
    Leaf {
        size: usize,
    },
    Split {
        dim: usize,
        value: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
}

pub struct IsolationForest {
    trees: Vec<Node>,
    sample_size: usize,
}

impl IsolationForest {
    pub fn fit(rows: &[&[f64]], params: &ForestParams) -> Result<Self, DetectError> {
        let needed = params.min_samples.max(2);
        if rows.len() < needed {
            return Err(DetectError::InsufficientData {
                needed,
                have: rows.len(),
            });
        }

        let sample_size = params.subsample.clamp(2, rows.len());
        let height_limit = (sample_size as f64).log2().ceil() as usize;
        let mut rng = StdRng::seed_from_u64(params.seed);

        let mut trees = Vec::with_capacity(params.trees.max(1));
        for _ in 0..params.trees.max(1) {
            let sample: Vec<&[f64]> = rand::seq::index::sample(&mut rng, rows.len(), sample_size)
                .iter()
                .map(|i| rows[i])
                .collect();
            trees.push(grow(&sample, 0, height_limit, &mut rng));
        }

        Ok(Self { trees, sample_size })
    }

    /// Anomaly score in `[0, 1]`.
    pub fn score(&self, point: &[f64]) -> f64 {
        let total: f64 = self
            .trees
            .iter()
            .map(|tree| path_length(tree, point, 0))
            .sum();
        let mean = total / self.trees.len() as f64;
        let norm = average_path_length(self.sample_size);
        if norm <= 0.0 {
            return 0.5;
        }
        2f64.powf(-mean / norm)
    }
}

fn grow(rows: &[&[f64]], depth: usize, limit: usize, rng: &mut StdRng) -> Node {
    if depth >= limit || rows.len() <= 1 {
        return Node::Leaf { size: rows.len() };
    }

    // Only dimensions that still vary inside this node can split it.
    let dims = rows[0].len();
    let splittable: Vec<(usize, f64, f64)> = (0..dims)
        .filter_map(|d| {
            let (lo, hi) = rows.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), r| {
                (lo.min(r[d]), hi.max(r[d]))
            });
            (hi > lo).then_some((d, lo, hi))
        })
        .collect();
    if splittable.is_empty() {
        return Node::Leaf { size: rows.len() };
    }

    let (dim, lo, hi) = splittable[rng.gen_range(0..splittable.len())];
    let mut value = lo + (hi - lo) * rng.gen::<f64>();
    if value <= lo || value > hi {
        value = lo + (hi - lo) / 2.0;
    }

    let (left, right): (Vec<&[f64]>, Vec<&[f64]>) = rows.iter().partition(|r| r[dim] < value);
    Node::Split {
        dim,
        value,
        left: Box::new(grow(&left, depth + 1, limit, rng)),
        right: Box::new(grow(&right, depth + 1, limit, rng)),
    }
}

fn path_length(node: &Node, point: &[f64], depth: usize) -> f64 {
    match node {
        Node::Leaf { size } => depth as f64 + average_path_length(*size),
        Node::Split {
            dim,
            value,
            left,
            right,
        } => {
            if point[*dim] < *value {
                path_length(left, point, depth + 1)
            } else {
                path_length(right, point, depth + 1)
            }
        }
    }
}

/// Average path length of an unsuccessful BST search over `n` points, `c(n)`.
pub fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}
