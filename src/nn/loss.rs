//! Dual-view contrastive losses over hyperbolic and transport distances
//!
//! Every loss is a masked mean: a distance matrix laid against a positive mask,
//! summed, and divided by the mask total. A mask that sums to zero has no
//! positive pair and is reported as [`HyperRouteError::DegenerateBatch`].

use std::fmt;
use std::str::FromStr;

use candle_core::{DType, Device, Tensor};
use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::geometry::{hyperbolic_distance, SinkhornDivergence, TransportReduction};
use crate::{HyperRouteError, Result};

/// Contrastive discriminator family
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LossMeasure {
    /// Hyperbolic distance for node pairs, entropic transport for sequences
    #[default]
    #[serde(rename = "geo")]
    GeometryMixed,
    /// Jensen-Shannon estimator over a similarity matrix (not supported)
    #[serde(rename = "jsd")]
    Jsd,
    /// Binary noise-contrastive estimation (not supported)
    #[serde(rename = "nce")]
    Nce,
    /// Normalised temperature-scaled cross entropy (not supported)
    #[serde(rename = "ntx")]
    NtXent,
}

impl LossMeasure {
    /// Fail with a configuration error for the measures without an implementation
    pub fn ensure_supported(self) -> Result<Self> {
        match self {
            LossMeasure::GeometryMixed => Ok(self),
            other => Err(HyperRouteError::Config(format!(
                "loss measure '{other}' is not supported, use 'geo'"
            ))),
        }
    }
}

impl FromStr for LossMeasure {
    type Err = HyperRouteError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "geo" => Ok(LossMeasure::GeometryMixed),
            "jsd" => Ok(LossMeasure::Jsd),
            "nce" => Ok(LossMeasure::Nce),
            "ntx" => Ok(LossMeasure::NtXent),
            other => Err(HyperRouteError::Config(format!(
                "unknown loss measure '{other}'"
            ))),
        }
    }
}

impl fmt::Display for LossMeasure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LossMeasure::GeometryMixed => "geo",
            LossMeasure::Jsd => "jsd",
            LossMeasure::Nce => "nce",
            LossMeasure::NtXent => "ntx",
        };
        write!(f, "{name}")
    }
}

/// Positive mask `(B, V)`: entry `(b, v)` is 1 when node `v` occurs in row `b`
///
/// Tokens range over `0..=num_nodes`, `num_nodes` being the padding sentinel;
/// the sentinel column is dropped from the result.
pub fn build_positive_mask(tokens: &Array2<u32>, num_nodes: usize) -> Result<Array2<f32>> {
    let mut mask = Array2::<f32>::zeros((tokens.nrows(), num_nodes + 1));
    for (row_idx, row) in tokens.axis_iter(Axis(0)).enumerate() {
        for &token in row {
            let col = token as usize;
            if col > num_nodes {
                return Err(HyperRouteError::ShapeMismatch(format!(
                    "token {token} is outside 0..={num_nodes}"
                )));
            }
            mask[[row_idx, col]] = 1.0;
        }
    }
    mask.remove_index(Axis(1), num_nodes);
    Ok(mask)
}

fn host_to_tensor(array: &Array2<f32>, device: &Device) -> Result<Tensor> {
    let shape = (array.nrows(), array.ncols());
    let values: Vec<f32> = array.iter().copied().collect();
    Ok(Tensor::from_vec(values, shape, device)?)
}

/// `sum(cost ⊙ mask) / sum(mask)`, with `cost` broadcast against `mask`
fn masked_mean(cost: &Tensor, mask: &Tensor, what: &str) -> Result<Tensor> {
    let denom = mask.sum_all()?;
    if denom.to_scalar::<f32>()? == 0.0 {
        return Err(HyperRouteError::DegenerateBatch(format!(
            "{what} mask has no positive entry"
        )));
    }
    Ok(cost.broadcast_mul(mask)?.sum_all()?.div(&denom)?)
}

/// Node-node term: mean hyperbolic distance between the two views of every node
pub fn node_node_loss(node_rep1: &Tensor, node_rep2: &Tensor) -> Result<Tensor> {
    let num_nodes = node_rep1.dim(0)?;
    let mask = Tensor::eye(num_nodes, DType::F32, node_rep1.device())?;
    masked_mean(&hyperbolic_distance(node_rep1, node_rep2)?, &mask, "node-node")
}

/// Per-term values of one objective evaluation
#[derive(Clone, Debug)]
pub struct LossBreakdown {
    /// Differentiable weighted total
    pub total: Tensor,
    /// Node-node term
    pub node_node: f32,
    /// Sequence-sequence term
    pub seq_seq: f32,
    /// Node-sequence term averaged over both view orderings
    pub node_seq: f32,
}

/// Weighted combination of the three contrastive terms for a pair of views
#[derive(Clone, Debug)]
pub struct ContrastiveObjective {
    transport: SinkhornDivergence,
    reduction: TransportReduction,
    lambda_st: f64,
}

impl ContrastiveObjective {
    /// `lambda_st` weights the node-sequence term; the other two share the remainder
    pub fn new(measure: LossMeasure, lambda_st: f64, reduction: TransportReduction) -> Result<Self> {
        measure.ensure_supported()?;
        if !(0.0..=1.0).contains(&lambda_st) {
            return Err(HyperRouteError::Config(format!(
                "lambda_st must lie in [0, 1], got {lambda_st}"
            )));
        }
        Ok(ContrastiveObjective {
            transport: SinkhornDivergence::default(),
            reduction,
            lambda_st,
        })
    }

    /// Weight `(l_ss, l_tt, l_st)` of the node-node, sequence-sequence and node-sequence terms
    pub fn weights(&self) -> (f64, f64, f64) {
        let rest = 0.5 * (1.0 - self.lambda_st);
        (rest, rest, self.lambda_st)
    }

    fn transport_cost(&self, x: &Tensor, y: &Tensor) -> Result<Tensor> {
        self.transport.cost_matrix(x, y, self.reduction)
    }

    /// Sequence-sequence term: transport cost between the two views of each trajectory
    pub fn seq_seq_loss(&self, seq_rep1: &Tensor, seq_rep2: &Tensor) -> Result<Tensor> {
        let batch = seq_rep1.dim(0)?;
        let mask = Tensor::eye(batch, DType::F32, seq_rep1.device())?;
        masked_mean(&self.transport_cost(seq_rep1, seq_rep2)?, &mask, "seq-seq")
    }

    /// Node-sequence term: transport cost from each trajectory to the nodes it
    /// visits, plus the mean hyperbolic distance over the first `min(B, V)` rows
    pub fn node_seq_loss(&self, node_rep: &Tensor, seq_rep: &Tensor, tokens: &Array2<u32>) -> Result<Tensor> {
        let num_nodes = node_rep.dim(0)?;
        let batch = seq_rep.dim(0)?;
        if tokens.nrows() != batch {
            return Err(HyperRouteError::ShapeMismatch(format!(
                "{} token rows for {batch} sequence representations",
                tokens.nrows()
            )));
        }
        let mask = host_to_tensor(&build_positive_mask(tokens, num_nodes)?, node_rep.device())?;
        let transport = masked_mean(&self.transport_cost(seq_rep, node_rep)?, &mask, "node-seq")?;

        let aligned = batch.min(num_nodes);
        let hyperbolic = hyperbolic_distance(&seq_rep.narrow(0, 0, aligned)?, &node_rep.narrow(0, 0, aligned)?)?
            .mean_all()?;
        Ok(transport.add(&hyperbolic)?)
    }

    /// Node-sequence term weighted by external visit weights `(B, V)`
    pub fn weighted_ns_loss(&self, node_rep: &Tensor, seq_rep: &Tensor, weights: &Array2<f32>) -> Result<Tensor> {
        let expected = (seq_rep.dim(0)?, node_rep.dim(0)?);
        if weights.dim() != expected {
            return Err(HyperRouteError::ShapeMismatch(format!(
                "weights {:?} do not match (batch, nodes) {:?}",
                weights.dim(),
                expected
            )));
        }
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(HyperRouteError::ShapeMismatch(
                "visit weights must be finite and non-negative".to_string(),
            ));
        }
        let mask = host_to_tensor(weights, node_rep.device())?;
        masked_mean(&self.transport_cost(seq_rep, node_rep)?, &mask, "weighted node-seq")
    }

    /// Full objective for views `(node_rep1, seq_rep1)` and `(node_rep2, seq_rep2)`
    ///
    /// With `weights` the weighted node-sequence variant is used.
    pub fn compute(
        &self,
        view1: (&Tensor, &Tensor),
        view2: (&Tensor, &Tensor),
        tokens: &Array2<u32>,
        weights: Option<&Array2<f32>>,
    ) -> Result<LossBreakdown> {
        let (node1, seq1) = view1;
        let (node2, seq2) = view2;
        let (l_ss, l_tt, l_st) = self.weights();

        let loss_ss = node_node_loss(node1, node2)?;
        let loss_tt = self.seq_seq_loss(seq1, seq2)?;
        let (loss_st1, loss_st2) = match weights {
            Some(w) => (
                self.weighted_ns_loss(node1, seq2, w)?,
                self.weighted_ns_loss(node2, seq1, w)?,
            ),
            None => (
                self.node_seq_loss(node1, seq2, tokens)?,
                self.node_seq_loss(node2, seq1, tokens)?,
            ),
        };
        let loss_st = loss_st1.add(&loss_st2)?.affine(0.5, 0.0)?;

        let total = loss_ss
            .affine(l_ss, 0.0)?
            .add(&loss_tt.affine(l_tt, 0.0)?)?
            .add(&loss_st.affine(l_st, 0.0)?)?;

        let breakdown = LossBreakdown {
            node_node: loss_ss.to_scalar::<f32>()?,
            seq_seq: loss_tt.to_scalar::<f32>()?,
            node_seq: loss_st.to_scalar::<f32>()?,
            total,
        };
        debug!(
            node_node = breakdown.node_node,
            seq_seq = breakdown.seq_seq,
            node_seq = breakdown.node_seq,
            "contrastive terms"
        );
        Ok(breakdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn points(data: &[f32], n: usize) -> Tensor {
        Tensor::from_slice(data, (n, data.len() / n), &Device::Cpu).unwrap()
    }

    fn objective() -> ContrastiveObjective {
        ContrastiveObjective::new(LossMeasure::GeometryMixed, 0.5, TransportReduction::Pairwise).unwrap()
    }

    #[test]
    fn test_positive_mask() {
        let tokens = array![[0u32, 1], [1, 2]];
        let mask = build_positive_mask(&tokens, 3).unwrap();
        assert_eq!(mask, array![[1.0, 1.0, 0.0], [0.0, 1.0, 1.0]]);

        let padded = array![[0u32, 3], [3, 3]];
        let mask = build_positive_mask(&padded, 3).unwrap();
        assert_eq!(mask, array![[1.0, 0.0, 0.0], [0.0, 0.0, 0.0]]);

        assert!(matches!(
            build_positive_mask(&array![[4u32]], 3),
            Err(HyperRouteError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_node_node_loss_identical_views() {
        let r = points(&[0.1, -0.2, 0.3, 0.0, -0.5, 0.4, 0.0, 0.0, 0.2], 3);
        let loss = node_node_loss(&r, &r).unwrap().to_scalar::<f32>().unwrap();
        assert_abs_diff_eq!(loss, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_node_node_loss_is_mean_distance() {
        let a = points(&[0.0, 0.0, 0.1, 0.1], 2);
        let b = points(&[0.5, 0.0, 0.1, 0.1], 2);
        let loss = node_node_loss(&a, &b).unwrap().to_scalar::<f32>().unwrap();
        assert_abs_diff_eq!(loss, 0.5f32.atanh(), epsilon = 1e-5);
    }

    #[test]
    fn test_seq_seq_loss_pairwise() {
        let s1 = points(&[0.0, 0.0, 0.2, 0.0], 2);
        let s2 = points(&[0.2, 0.0, 0.2, 0.0], 2);
        let loss = objective().seq_seq_loss(&s1, &s2).unwrap().to_scalar::<f32>().unwrap();
        // ½·0.04 on the first row, 0 on the second
        assert_abs_diff_eq!(loss, 0.01, epsilon = 1e-6);
    }

    #[test]
    fn test_node_seq_loss_finite() {
        let nodes = points(&[0.1, 0.0, 0.0, 0.1, -0.1, 0.0], 3);
        let seqs = points(&[0.05, 0.05, -0.05, 0.0], 2);
        let tokens = array![[0u32, 1, 3], [2, 3, 3]];
        let loss = objective()
            .node_seq_loss(&nodes, &seqs, &tokens)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(loss.is_finite() && loss > 0.0);
    }

    #[test]
    fn test_degenerate_batch() {
        let nodes = points(&[0.1, 0.0, 0.0, 0.1], 2);
        let seqs = points(&[0.05, 0.05], 1);
        let all_padding = array![[2u32, 2]];
        assert!(matches!(
            objective().node_seq_loss(&nodes, &seqs, &all_padding),
            Err(HyperRouteError::DegenerateBatch(_))
        ));

        let zero = Array2::<f32>::zeros((1, 2));
        assert!(matches!(
            objective().weighted_ns_loss(&nodes, &seqs, &zero),
            Err(HyperRouteError::DegenerateBatch(_))
        ));
    }

    #[test]
    fn test_weighted_rejects_negative_weights() {
        let nodes = points(&[0.1, 0.0, 0.0, 0.1], 2);
        let seqs = points(&[0.05, 0.05], 1);
        let weights = array![[1.0f32, -0.5]];
        assert!(matches!(
            objective().weighted_ns_loss(&nodes, &seqs, &weights),
            Err(HyperRouteError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_measure_parse_and_support() {
        assert_eq!("geo".parse::<LossMeasure>().unwrap(), LossMeasure::GeometryMixed);
        assert_eq!("ntx".parse::<LossMeasure>().unwrap(), LossMeasure::NtXent);
        assert!("cosine".parse::<LossMeasure>().is_err());
        for measure in [LossMeasure::Jsd, LossMeasure::Nce, LossMeasure::NtXent] {
            assert!(matches!(
                ContrastiveObjective::new(measure, 0.5, TransportReduction::Pairwise),
                Err(HyperRouteError::Config(_))
            ));
        }
    }

    #[test]
    fn test_objective_weights_and_total() {
        let obj = ContrastiveObjective::new(LossMeasure::GeometryMixed, 0.6, TransportReduction::Pairwise).unwrap();
        let (l_ss, l_tt, l_st) = obj.weights();
        assert_abs_diff_eq!(l_ss, 0.2, epsilon = 1e-12);
        assert_abs_diff_eq!(l_tt, 0.2, epsilon = 1e-12);
        assert_abs_diff_eq!(l_st, 0.6, epsilon = 1e-12);

        let nodes = points(&[0.1, 0.0, 0.0, 0.1, -0.1, 0.0], 3);
        let seqs = points(&[0.05, 0.05, -0.05, 0.0], 2);
        let tokens = array![[0u32, 1], [2, 3]];
        let out = obj.compute((&nodes, &seqs), (&nodes, &seqs), &tokens, None).unwrap();
        let total = out.total.to_scalar::<f32>().unwrap();
        let expected = 0.2 * out.node_node + 0.2 * out.seq_seq + 0.6 * out.node_seq;
        assert_abs_diff_eq!(total, expected, epsilon = 1e-5);
        assert_abs_diff_eq!(out.node_node, 0.0, epsilon = 1e-6);
    }
}
