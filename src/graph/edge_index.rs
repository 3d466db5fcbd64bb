//! Road-network topology as a sparse edge list

use candle_core::{Device, Tensor};
use petgraph::graph::DiGraph;
use petgraph::visit::EdgeRef;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{HyperRouteError, Result};

/// Edge index representation for sparse adjacency
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeIndex {
    /// Source nodes for each edge
    pub src: Vec<usize>,
    /// Destination nodes for each edge
    pub dst: Vec<usize>,
}

impl EdgeIndex {
    /// Create from edge list
    pub fn from_edges(edges: Vec<(usize, usize)>) -> Self {
        let (src, dst): (Vec<_>, Vec<_>) = edges.into_iter().unzip();
        EdgeIndex { src, dst }
    }

    /// Create from a directed road graph; node ids are petgraph node indices
    pub fn from_graph<N, E>(graph: &DiGraph<N, E>) -> Self {
        let (src, dst) = graph
            .edge_references()
            .map(|e| (e.source().index(), e.target().index()))
            .unzip();
        EdgeIndex { src, dst }
    }

    /// Get number of edges
    pub fn num_edges(&self) -> usize {
        self.src.len()
    }

    /// Iterate over `(src, dst)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.src.iter().copied().zip(self.dst.iter().copied())
    }

    /// Convert to undirected (add reverse edges)
    pub fn to_undirected(&self) -> Self {
        let mut src = self.src.clone();
        let mut dst = self.dst.clone();

        src.extend(&self.dst);
        dst.extend(&self.src);

        EdgeIndex { src, dst }
    }

    /// Check that every endpoint is a valid node id
    pub fn validate(&self, num_nodes: usize) -> Result<()> {
        if self.src.len() != self.dst.len() {
            return Err(HyperRouteError::ShapeMismatch(format!(
                "edge index has {} sources but {} destinations",
                self.src.len(),
                self.dst.len()
            )));
        }
        if let Some((s, d)) = self.iter().find(|&(s, d)| s >= num_nodes || d >= num_nodes) {
            return Err(HyperRouteError::ShapeMismatch(format!(
                "edge ({s}, {d}) references a node outside 0..{num_nodes}"
            )));
        }
        Ok(())
    }

    /// Keep each edge independently with probability `1 - p`
    ///
    /// The original edge set is untouched; the sample is a fresh copy.
    pub fn dropout_edges<R: Rng>(&self, p: f64, rng: &mut R) -> Self {
        if p <= 0.0 {
            return self.clone();
        }
        let (src, dst) = self.iter().filter(|_| rng.gen::<f64>() >= p).unzip();
        EdgeIndex { src, dst }
    }

    /// Replace any existing self loops with exactly one loop per node
    pub fn with_self_loops(&self, num_nodes: usize) -> Self {
        let (mut src, mut dst): (Vec<_>, Vec<_>) = self.iter().filter(|(s, d)| s != d).unzip();
        src.extend(0..num_nodes);
        dst.extend(0..num_nodes);
        EdgeIndex { src, dst }
    }

    /// Source and destination ids as `u32` tensors on `device`
    pub fn to_tensors(&self, device: &Device) -> Result<(Tensor, Tensor)> {
        let src: Vec<u32> = self.src.iter().map(|&s| s as u32).collect();
        let dst: Vec<u32> = self.dst.iter().map(|&d| d as u32).collect();
        let n = src.len();
        Ok((
            Tensor::from_vec(src, n, device)?,
            Tensor::from_vec(dst, n, device)?,
        ))
    }
}
