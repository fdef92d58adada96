//! Seeded isolation forest.
//!
//! Scores follow the usual convention: `score_samples` is the negated
//! anomaly score `-2^(-E[h(x)] / c(psi))`, the decision offset is the
//! contamination percentile of those scores, and the reported score is
//! `score_samples - offset`, so negative values are outliers.

use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::{Rng, SeedableRng};

use super::{FeatureMatrix, OutlierModel, OutlierScores};
use crate::constants::{DEFAULT_CONTAMINATION, DEFAULT_MAX_SAMPLES, DEFAULT_N_TREES, DEFAULT_SEED};
use crate::types::AnomalyLabel;

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

/// Hyperparameters; identical params and input always give identical output
#[derive(Debug, Clone)]
pub struct IsolationForestParams {
    pub n_trees: usize,
    pub max_samples: usize,
    pub contamination: f64,
    pub seed: u64,
}

impl Default for IsolationForestParams {
    fn default() -> Self {
        Self {
            n_trees: DEFAULT_N_TREES,
            max_samples: DEFAULT_MAX_SAMPLES,
            contamination: DEFAULT_CONTAMINATION,
            seed: DEFAULT_SEED,
        }
    }
}

#[derive(Debug)]
enum Node {
    Leaf {
        size: usize,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
}

/// Isolation forest retrained from scratch on every `fit_score` call
#[derive(Debug, Clone, Default)]
pub struct IsolationForest {
    pub params: IsolationForestParams,
}

impl IsolationForest {
    pub fn new(params: IsolationForestParams) -> Self {
        Self { params }
    }

    fn build(rows: &FeatureMatrix, indices: Vec<usize>, depth: usize, max_depth: usize, rng: &mut StdRng) -> Node {
        if depth >= max_depth || indices.len() <= 1 {
            return Node::Leaf { size: indices.len() };
        }

        // Only features that still vary inside this node can split it
        let mut candidates = Vec::new();
        for feature in 0..rows.n_features() {
            let (lo, hi) = indices.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &i| {
                let v = rows.value(i, feature);
                (lo.min(v), hi.max(v))
            });
            if lo < hi {
                candidates.push((feature, lo, hi));
            }
        }
        if candidates.is_empty() {
            return Node::Leaf { size: indices.len() };
        }

        let (feature, lo, hi) = candidates[rng.gen_range(0..candidates.len())];
        let threshold = rng.gen_range(lo..hi);
        let (left, right): (Vec<usize>, Vec<usize>) =
            indices.into_iter().partition(|&i| rows.value(i, feature) < threshold);

        Node::Split {
            feature,
            threshold,
            left: Box::new(Self::build(rows, left, depth + 1, max_depth, rng)),
            right: Box::new(Self::build(rows, right, depth + 1, max_depth, rng)),
        }
    }

    fn path_length(node: &Node, point: &[f64], depth: f64) -> f64 {
        match node {
            Node::Leaf { size } => depth + average_path_length(*size),
            Node::Split {
                feature,
                threshold,
                left,
                right,
            } => {
                if point[*feature] < *threshold {
                    Self::path_length(left, point, depth + 1.0)
                } else {
                    Self::path_length(right, point, depth + 1.0)
                }
            }
        }
    }

    /// Raw `score_samples`: in [-1, 0], lower is more anomalous
    pub fn score_samples(&self, features: &FeatureMatrix) -> Vec<f64> {
        let n = features.n_rows();
        if n == 0 {
            return Vec::new();
        }
        let psi = self.params.max_samples.clamp(1, n);
        let normalizer = average_path_length(psi);
        if normalizer <= 0.0 {
            // A single sample cannot be isolated; every point is equally ordinary
            return vec![-0.5; n];
        }

        let max_depth = (psi as f64).log2().ceil().max(1.0) as usize;
        let mut rng = StdRng::seed_from_u64(self.params.seed);
        let trees: Vec<Node> = (0..self.params.n_trees.max(1))
            .map(|_| {
                let subsample = sample(&mut rng, n, psi).into_vec();
                Self::build(features, subsample, 0, max_depth, &mut rng)
            })
            .collect();

        (0..n)
            .map(|i| {
                let point = features.row(i);
                let mean_depth =
                    trees.iter().map(|t| Self::path_length(t, point, 0.0)).sum::<f64>() / trees.len() as f64;
                -(2f64.powf(-mean_depth / normalizer))
            })
            .collect()
    }
}

impl OutlierModel for IsolationForest {
    fn fit_score(&self, features: &FeatureMatrix) -> OutlierScores {
        let raw = self.score_samples(features);
        let offset = percentile(&raw, self.params.contamination * 100.0);
        let scores: Vec<f64> = raw.iter().map(|s| s - offset).collect();
        let labels = scores
            .iter()
            .map(|&s| if s < 0.0 { AnomalyLabel::Anomalous } else { AnomalyLabel::Normal })
            .collect();
        OutlierScores { scores, labels }
    }
}

/// Average path length of an unsuccessful BST search over `n` points, c(n)
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

/// Percentile with linear interpolation between closest ranks
pub fn percentile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let rank = (q.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    sorted[lower] + (sorted[upper] - sorted[lower]) * (rank - lower as f64)
}
