//! Isolation-forest-style outlier ensemble.
//!
//! Points are isolated by random recursive partitioning; the fewer splits
//! it takes to isolate a point, the more anomalous it is. The ensemble is
//! trained in-process, fully serializable, and deterministic for a fixed
//! seed. No randomness is used on the scoring path.
//!
//! Score conventions follow the usual ones for this family of models:
//! `score_samples` lies in [-1, 0] with higher meaning more normal, and
//! `decision_function` subtracts a contamination-derived offset so that
//! negative values classify as outliers.

use crate::error::ModelError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Euler-Mascheroni constant, used in the average path-length correction.
const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

/// Training parameters for the ensemble.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForestParams {
    /// Expected proportion of outliers in the training data; sets the
    /// decision offset
    pub contamination: f64,
    /// Number of trees
    pub n_estimators: usize,
    /// Rows subsampled per tree; `None` selects min(256, n)
    pub max_samples: Option<usize>,
    /// RNG seed for reproducible training
    pub seed: u64,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            contamination: 0.05,
            n_estimators: 150,
            max_samples: None,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Node {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        size: usize,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    /// Path length from root to the leaf holding `point`, with the leaf's
    /// unbuilt-subtree correction added.
    fn path_length(&self, point: &[f64]) -> f64 {
        let mut depth = 0.0;
        let mut index = 0;
        loop {
            match &self.nodes[index] {
                Node::Leaf { size } => return depth + average_path_length(*size),
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    index = if point[*feature] < *threshold { *left } else { *right };
                    depth += 1.0;
                }
            }
        }
    }
}

/// Trained isolation forest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationForest {
    trees: Vec<Tree>,
    n_features: usize,
    sample_size: usize,
    /// Contamination percentile of the training `score_samples`; the
    /// decision boundary
    offset: f64,
}

impl IsolationForest {
    /// Train an ensemble on row-major data.
    pub fn fit(data: &[Vec<f64>], params: &ForestParams) -> Result<Self, ModelError> {
        if data.is_empty() {
            return Err(ModelError::EmptyTrainingSet);
        }
        let n_features = data[0].len();
        if n_features == 0 {
            return Err(ModelError::EmptyTrainingSet);
        }
        for row in data {
            if row.len() != n_features {
                return Err(ModelError::FeatureCountMismatch {
                    expected: n_features,
                    actual: row.len(),
                });
            }
        }

        let sample_size = params.max_samples.unwrap_or_else(|| data.len().min(256)).max(2);
        let height_limit = (sample_size as f64).log2().ceil() as usize;
        let mut rng = StdRng::seed_from_u64(params.seed);

        let mut trees = Vec::with_capacity(params.n_estimators);
        for _ in 0..params.n_estimators {
            // Bootstrap row sample per tree.
            let sample: Vec<&[f64]> = (0..sample_size.min(data.len()))
                .map(|_| data[rng.gen_range(0..data.len())].as_slice())
                .collect();

            let mut nodes = Vec::new();
            build_node(&sample, 0, height_limit, n_features, &mut rng, &mut nodes);
            trees.push(Tree { nodes });
        }

        let mut forest = Self {
            trees,
            n_features,
            sample_size,
            offset: 0.0,
        };

        // Offset at the contamination percentile of the training scores so
        // that roughly that fraction of the training data lands below the
        // decision boundary.
        let mut train_scores: Vec<f64> =
            data.iter().map(|row| forest.score_samples(row)).collect();
        train_scores.sort_by(|a, b| a.partial_cmp(b).unwrap());
        forest.offset = percentile(&train_scores, params.contamination * 100.0);

        Ok(forest)
    }

    /// Feature count the ensemble was trained against.
    pub fn n_features(&self) -> usize {
        self.n_features
    }

    /// Negated anomaly score in [-1, 0]; higher = more normal.
    pub fn score_samples(&self, point: &[f64]) -> f64 {
        let total: f64 = self.trees.iter().map(|t| t.path_length(point)).sum();
        let avg_path = total / self.trees.len() as f64;
        let anomaly = 2f64.powf(-avg_path / average_path_length(self.sample_size));
        -anomaly
    }

    /// Raw decision value; positive = normal, negative = outlier.
    pub fn decision_function(&self, point: &[f64]) -> f64 {
        self.score_samples(point) - self.offset
    }

    /// Native ensemble classification of a point.
    pub fn is_outlier(&self, point: &[f64]) -> bool {
        self.decision_function(point) < 0.0
    }
}

/// Grow one node over the sampled rows, returning its index in the arena.
fn build_node(
    rows: &[&[f64]],
    depth: usize,
    height_limit: usize,
    n_features: usize,
    rng: &mut StdRng,
    nodes: &mut Vec<Node>,
) -> usize {
    if depth >= height_limit || rows.len() <= 1 {
        nodes.push(Node::Leaf { size: rows.len() });
        return nodes.len() - 1;
    }

    // Only features with spread can split this node.
    let splittable: Vec<usize> = (0..n_features)
        .filter(|&f| {
            let (min, max) = feature_range(rows, f);
            max > min
        })
        .collect();
    if splittable.is_empty() {
        nodes.push(Node::Leaf { size: rows.len() });
        return nodes.len() - 1;
    }

    let feature = splittable[rng.gen_range(0..splittable.len())];
    let (min, max) = feature_range(rows, feature);
    let threshold = rng.gen_range(min..max);

    let (left_rows, right_rows): (Vec<&[f64]>, Vec<&[f64]>) =
        rows.iter().copied().partition(|row| row[feature] < threshold);

    // Reserve this node's slot before recursing so child indices are known.
    let index = nodes.len();
    nodes.push(Node::Leaf { size: 0 });
    let left = build_node(&left_rows, depth + 1, height_limit, n_features, rng, nodes);
    let right = build_node(&right_rows, depth + 1, height_limit, n_features, rng, nodes);
    nodes[index] = Node::Split {
        feature,
        threshold,
        left,
        right,
    };
    index
}

fn feature_range(rows: &[&[f64]], feature: usize) -> (f64, f64) {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for row in rows {
        min = min.min(row[feature]);
        max = max.max(row[feature]);
    }
    (min, max)
}

/// Average path length of an unsuccessful BST search over `n` nodes: the
/// standard normalization term for isolation scores.
fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

/// Percentile with linear interpolation over a pre-sorted slice.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = p / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        sorted[lower]
    } else {
        let frac = rank - lower as f64;
        sorted[lower] + (sorted[upper] - sorted[lower]) * frac
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Tight cluster around 0.5 in each dimension.
    fn clustered_data(n: usize, dims: usize, seed: u64) -> Vec<Vec<f64>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| (0..dims).map(|_| rng.gen_range(0.4..0.6)).collect())
            .collect()
    }

    #[test]
    fn test_outlier_scores_below_inliers() {
        let data = clustered_data(500, 4, 7);
        let forest = IsolationForest::fit(&data, &ForestParams::default()).unwrap();

        let inlier = vec![0.5, 0.5, 0.5, 0.5];
        let outlier = vec![5.0, -3.0, 8.0, 10.0];

        assert!(forest.decision_function(&inlier) > forest.decision_function(&outlier));
        assert!(forest.is_outlier(&outlier));
    }

    #[test]
    fn test_deterministic_for_fixed_seed() {
        let data = clustered_data(300, 3, 11);
        let params = ForestParams {
            seed: 99,
            n_estimators: 50,
            ..ForestParams::default()
        };
        let a = IsolationForest::fit(&data, &params).unwrap();
        let b = IsolationForest::fit(&data, &params).unwrap();

        let point = vec![0.45, 0.52, 0.61];
        assert_eq!(a.score_samples(&point), b.score_samples(&point));
        assert_eq!(a.decision_function(&point), b.decision_function(&point));
    }

    #[test]
    fn test_training_outlier_rate_near_contamination() {
        let data = clustered_data(1000, 4, 3);
        let params = ForestParams {
            contamination: 0.1,
            ..ForestParams::default()
        };
        let forest = IsolationForest::fit(&data, &params).unwrap();

        let outliers = data.iter().filter(|row| forest.is_outlier(row)).count();
        let rate = outliers as f64 / data.len() as f64;
        assert!(rate > 0.05 && rate < 0.15, "rate {}", rate);
    }

    #[test]
    fn test_serde_round_trip_scores_identical() {
        let data = clustered_data(200, 4, 5);
        let forest = IsolationForest::fit(&data, &ForestParams::default()).unwrap();

        let json = serde_json::to_string(&forest).unwrap();
        let restored: IsolationForest = serde_json::from_str(&json).unwrap();

        let point = vec![0.3, 0.7, 0.5, 0.9];
        assert_eq!(forest.score_samples(&point), restored.score_samples(&point));
        assert_eq!(
            forest.decision_function(&point),
            restored.decision_function(&point)
        );
    }

    #[test]
    fn test_rejects_empty_and_ragged_input() {
        assert!(matches!(
            IsolationForest::fit(&[], &ForestParams::default()),
            Err(ModelError::EmptyTrainingSet)
        ));

        let ragged = vec![vec![1.0, 2.0], vec![1.0]];
        assert!(matches!(
            IsolationForest::fit(&ragged, &ForestParams::default()),
            Err(ModelError::FeatureCountMismatch { expected: 2, actual: 1 })
        ));
    }

    #[test]
    fn test_constant_data_degenerates_to_leaves() {
        let data = vec![vec![1.0, 1.0]; 50];
        let forest = IsolationForest::fit(&data, &ForestParams::default()).unwrap();
        // Every point is identical; scoring still works and is finite.
        let score = forest.score_samples(&[1.0, 1.0]);
        assert!(score.is_finite());
    }
}
