//! Graph attention convolution over sparse edge lists
//!
//! `h_i' = mean_heads( Σ_{j→i} α_ij W h_j ) + b` with
//! `α_ij = softmax_j( LeakyReLU(a_src·W h_j + a_dst·W h_i) )`, where the softmax
//! runs over the incoming edges of each destination node. Messages are gathered
//! with `index_select` and scattered with `index_add`, so no dense adjacency is
//! ever formed.

use candle_core::{Tensor, D};
use candle_nn::{linear_no_bias, Init, Linear, Module, VarBuilder};

use crate::graph::EdgeIndex;
use crate::Result;

/// `max(x, 0) + slope * min(x, 0)`
pub(crate) fn leaky_relu(x: &Tensor, slope: f64) -> Result<Tensor> {
    Ok(x.relu()?.add(&x.minimum(0f32)?.affine(slope, 0.0)?)?)
}

/// Graph attention layer (Velickovic et al., 2018), heads averaged
pub struct GatConv {
    lin: Linear,
    att_src: Tensor,
    att_dst: Tensor,
    bias: Tensor,
    heads: usize,
    out_dim: usize,
    negative_slope: f64,
}

impl GatConv {
    /// Create a layer mapping `in_dim` features to `out_dim` with `heads` attention heads
    pub fn new(in_dim: usize, out_dim: usize, heads: usize, vb: VarBuilder) -> Result<Self> {
        let lin = linear_no_bias(in_dim, heads * out_dim, vb.pp("lin"))?;
        let bound = (6.0 / (heads + out_dim) as f64).sqrt();
        let glorot = Init::Uniform {
            lo: -bound,
            up: bound,
        };
        let att_src = vb.get_with_hints((1, heads, out_dim), "att_src", glorot)?;
        let att_dst = vb.get_with_hints((1, heads, out_dim), "att_dst", glorot)?;
        let bias = vb.get_with_hints(out_dim, "bias", Init::Const(0.0))?;

        Ok(GatConv {
            lin,
            att_src,
            att_dst,
            bias,
            heads,
            out_dim,
            negative_slope: 0.2,
        })
    }

    /// Output feature dimension
    pub fn out_dim(&self) -> usize {
        self.out_dim
    }

    /// Forward pass over `x` `(V, in_dim)` along `edges`
    ///
    /// `edges` must already contain the self loops; every node then has at
    /// least one incoming message.
    pub fn forward(&self, x: &Tensor, edges: &EdgeIndex) -> Result<Tensor> {
        let num_nodes = x.dim(0)?;
        let device = x.device();
        let dtype = x.dtype();

        let h = self
            .lin
            .forward(x)?
            .reshape((num_nodes, self.heads, self.out_dim))?;
        let alpha_src = h.broadcast_mul(&self.att_src)?.sum(D::Minus1)?;
        let alpha_dst = h.broadcast_mul(&self.att_dst)?.sum(D::Minus1)?;

        let (src, dst) = edges.to_tensors(device)?;
        let logits = alpha_src
            .index_select(&src, 0)?
            .add(&alpha_dst.index_select(&dst, 0)?)?;
        let logits = leaky_relu(&logits, self.negative_slope)?;

        let shift = segment_max(&logits, &edges.dst, num_nodes)?.index_select(&dst, 0)?;
        let weights = logits.sub(&shift)?.exp()?;
        let denom = Tensor::zeros((num_nodes, self.heads), dtype, device)?
            .index_add(&dst, &weights, 0)?
            .index_select(&dst, 0)?;
        let alpha = weights.div(&denom)?;

        let messages = h
            .index_select(&src, 0)?
            .broadcast_mul(&alpha.unsqueeze(2)?)?;
        let out = Tensor::zeros((num_nodes, self.heads, self.out_dim), dtype, device)?
            .index_add(&dst, &messages, 0)?;

        Ok(out.mean(1)?.broadcast_add(&self.bias)?)
    }
}

/// Per-destination maximum of edge logits `(E, H)`, detached, shape `(V, H)`
fn segment_max(logits: &Tensor, dst: &[usize], num_nodes: usize) -> Result<Tensor> {
    let (_, heads) = logits.dims2()?;
    let rows = logits.detach().to_vec2::<f32>()?;
    let mut max = vec![f32::NEG_INFINITY; num_nodes * heads];
    for (row, &d) in rows.iter().zip(dst) {
        for (h, &value) in row.iter().enumerate() {
            let slot = &mut max[d * heads + h];
            if value > *slot {
                *slot = value;
            }
        }
    }
    // isolated nodes receive no message; any finite shift works
    for slot in max.iter_mut().filter(|m| !m.is_finite()) {
        *slot = 0.0;
    }
    Ok(Tensor::from_vec(max, (num_nodes, heads), logits.device())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn layer(in_dim: usize, out_dim: usize, heads: usize) -> (VarMap, GatConv) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let conv = GatConv::new(in_dim, out_dim, heads, vb).unwrap();
        (varmap, conv)
    }

    #[test]
    fn test_gat_forward_shape() {
        let (_varmap, conv) = layer(6, 4, 2);
        let x = Tensor::randn(0f32, 1f32, (5, 6), &Device::Cpu).unwrap();
        let edges = EdgeIndex::from_edges(vec![(0, 1), (1, 2), (2, 3), (3, 4)]).with_self_loops(5);
        let out = conv.forward(&x, &edges).unwrap();
        assert_eq!(out.dims(), &[5, 4]);
        let values = out.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_self_loop_only_is_local_transform() {
        // with only self loops each node attends to itself with weight 1
        let (_varmap, conv) = layer(3, 2, 1);
        let x = Tensor::randn(0f32, 1f32, (4, 3), &Device::Cpu).unwrap();
        let edges = EdgeIndex::default().with_self_loops(4);
        let out = conv.forward(&x, &edges).unwrap().to_vec2::<f32>().unwrap();
        let local = conv.lin.forward(&x).unwrap().to_vec2::<f32>().unwrap();
        for (o, l) in out.iter().zip(local.iter()) {
            for (a, b) in o.iter().zip(l.iter()) {
                assert!((a - b).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_gradients_reach_parameters() {
        let (varmap, conv) = layer(3, 2, 2);
        let x = Tensor::randn(0f32, 1f32, (3, 3), &Device::Cpu).unwrap();
        let edges = EdgeIndex::from_edges(vec![(0, 1), (2, 1)]).with_self_loops(3);
        let loss = conv.forward(&x, &edges).unwrap().sqr().unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        let vars = varmap.all_vars();
        assert_eq!(vars.len(), 4);
        for var in vars {
            assert!(grads.get(var.as_tensor()).is_some());
        }
    }

    #[test]
    fn test_leaky_relu() {
        let x = Tensor::new(&[-2f32, 0.0, 3.0], &Device::Cpu).unwrap();
        let y = leaky_relu(&x, 0.2).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(y, vec![-0.4, 0.0, 3.0]);
    }
}
