//! Trajectory batches and the batch indexer

use std::path::Path;

use ndarray::{Array2, Axis};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{HyperRouteError, Result};

/// On-disk trajectory file: `{"sequences": [[node, ..], ..]}`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrajectoryFile {
    /// Node-id sequences, unpadded
    pub sequences: Vec<Vec<u32>>,
}

/// Padded token matrix plus optional node-visit weights
#[derive(Clone, Debug)]
pub struct TrajectoryData {
    /// `(N, max_len)` tokens; `num_nodes` marks padding
    pub tokens: Array2<u32>,
    /// `(N, num_nodes)` visit counts divided by trajectory length
    pub weights: Option<Array2<f32>>,
    num_nodes: usize,
}

impl TrajectoryData {
    /// Pad or truncate every sequence to `max_len`
    ///
    /// Node ids must be below `num_nodes`. With `with_weights`, row `i` of the
    /// weight matrix counts how often each node occurs in the (truncated)
    /// trajectory, normalised by its length.
    pub fn from_sequences(
        sequences: &[Vec<u32>],
        num_nodes: usize,
        max_len: usize,
        with_weights: bool,
    ) -> Result<Self> {
        let sentinel = num_nodes as u32;
        let mut tokens = Array2::from_elem((sequences.len(), max_len), sentinel);
        let mut weights = with_weights.then(|| Array2::<f32>::zeros((sequences.len(), num_nodes)));

        for (row, seq) in sequences.iter().enumerate() {
            let kept = &seq[..seq.len().min(max_len)];
            if let Some(bad) = kept.iter().find(|&&t| t >= sentinel) {
                return Err(HyperRouteError::ShapeMismatch(format!(
                    "trajectory {row} visits node {bad}, network has {num_nodes} nodes"
                )));
            }
            for (col, &node) in kept.iter().enumerate() {
                tokens[[row, col]] = node;
            }
            if let Some(w) = weights.as_mut() {
                let share = 1.0 / kept.len().max(1) as f32;
                for &node in kept {
                    w[[row, node as usize]] += share;
                }
            }
        }

        Ok(TrajectoryData {
            tokens,
            weights,
            num_nodes,
        })
    }

    /// Load a [`TrajectoryFile`] from JSON
    pub fn load_json<P: AsRef<Path>>(
        path: P,
        num_nodes: usize,
        max_len: usize,
        with_weights: bool,
    ) -> Result<Self> {
        let file: TrajectoryFile = serde_json::from_str(&std::fs::read_to_string(path.as_ref())?)?;
        info!(
            path = %path.as_ref().display(),
            trajectories = file.sequences.len(),
            "loaded trajectories"
        );
        Self::from_sequences(&file.sequences, num_nodes, max_len, with_weights)
    }

    /// Number of trajectories
    pub fn len(&self) -> usize {
        self.tokens.nrows()
    }

    /// True when there is no trajectory
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Padding sentinel
    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    /// Rows `indices` of the tokens and weights
    pub fn select(&self, indices: &[usize]) -> (Array2<u32>, Option<Array2<f32>>) {
        (
            self.tokens.select(Axis(0), indices),
            self.weights.as_ref().map(|w| w.select(Axis(0), indices)),
        )
    }
}

/// Partition of `0..len` into batches, reshuffled per epoch when enabled
pub struct BatchIndexer {
    order: Vec<usize>,
    batch_size: usize,
    shuffle: bool,
    current_idx: usize,
}

impl BatchIndexer {
    /// Create a new indexer in natural order
    pub fn new(len: usize, batch_size: usize, shuffle: bool) -> Self {
        BatchIndexer {
            order: (0..len).collect(),
            batch_size: batch_size.max(1),
            shuffle,
            current_idx: 0,
        }
    }

    /// Restart from the beginning, shuffling with `rng` when enabled
    pub fn reset<R: Rng>(&mut self, rng: &mut R) {
        self.current_idx = 0;
        if self.shuffle {
            self.order.shuffle(rng);
        }
    }

    /// Get next batch of indices
    pub fn next_batch(&mut self) -> Option<Vec<usize>> {
        if self.current_idx >= self.order.len() {
            return None;
        }

        let end_idx = (self.current_idx + self.batch_size).min(self.order.len());
        let batch = self.order[self.current_idx..end_idx].to_vec();
        self.current_idx = end_idx;

        Some(batch)
    }

    /// Get number of batches
    pub fn num_batches(&self) -> usize {
        self.order.len().div_ceil(self.batch_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_batch_indexer() {
        let mut indexer = BatchIndexer::new(5, 2, false);
        assert_eq!(indexer.num_batches(), 3);

        assert_eq!(indexer.next_batch().unwrap(), vec![0, 1]);
        assert_eq!(indexer.next_batch().unwrap(), vec![2, 3]);
        assert_eq!(indexer.next_batch().unwrap(), vec![4]);
        assert!(indexer.next_batch().is_none());
    }

    #[test]
    fn test_shuffled_batches_cover_everything() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut indexer = BatchIndexer::new(10, 3, true);
        indexer.reset(&mut rng);
        let mut seen: Vec<usize> = std::iter::from_fn(|| indexer.next_batch()).flatten().collect();
        seen.sort();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_padding_and_weights() {
        let seqs = vec![vec![0, 1, 1], vec![2], vec![0, 1, 2, 0, 1]];
        let data = TrajectoryData::from_sequences(&seqs, 3, 4, true).unwrap();
        assert_eq!(data.tokens, array![[0, 1, 1, 3], [2, 3, 3, 3], [0, 1, 2, 0]]);

        let w = data.weights.as_ref().unwrap();
        assert!((w[[0, 1]] - 2.0 / 3.0).abs() < 1e-6);
        assert_eq!(w[[1, 2]], 1.0);
        assert_eq!(w[[2, 0]], 0.5);
        for row in w.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-6);
        }

        let (tokens, weights) = data.select(&[2, 0]);
        assert_eq!(tokens.row(0), data.tokens.row(2));
        assert_eq!(weights.unwrap().dim(), (2, 3));
    }

    #[test]
    fn test_out_of_range_node() {
        let seqs = vec![vec![0, 5]];
        assert!(matches!(
            TrajectoryData::from_sequences(&seqs, 3, 4, false),
            Err(HyperRouteError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_load_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trajectories.json");
        std::fs::write(&path, r#"{"sequences": [[0, 1], [1, 2, 0]]}"#).unwrap();
        let data = TrajectoryData::load_json(&path, 3, 3, false).unwrap();
        assert_eq!(data.len(), 2);
        assert!(data.weights.is_none());
        assert_eq!(data.tokens, array![[0, 1, 3], [1, 2, 0]]);
    }
}
