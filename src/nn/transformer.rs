//! Padding-aware transformer encoder over time-major `(T, B, D)` batches

use candle_core::{Tensor, D};
use candle_nn::{linear, ops::softmax, Init, Linear, Module, VarBuilder};
use rand::Rng;

use crate::nn::augment::dropout;
use crate::nn::positional::{PositionalEncoding, DEFAULT_MAX_LEN};
use crate::{HyperRouteError, Result};

/// Additive attention bias for padded keys
const MASK_VALUE: f64 = -1e9;

/// Layer normalisation over the last dimension with learnable affine terms
struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    fn new(dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(LayerNorm {
            weight: vb.get_with_hints(dim, "weight", Init::Const(1.0))?,
            bias: vb.get_with_hints(dim, "bias", Init::Const(0.0))?,
            eps: 1e-5,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let centered = x.broadcast_sub(&x.mean_keepdim(D::Minus1)?)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = centered.broadcast_div(&var.affine(1.0, self.eps)?.sqrt()?)?;
        Ok(normed.broadcast_mul(&self.weight)?.broadcast_add(&self.bias)?)
    }
}

/// Multi-head scaled dot-product self-attention with a key-padding mask
pub struct MultiHeadSelfAttention {
    in_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl MultiHeadSelfAttention {
    /// `dim` must be divisible by `num_heads`
    pub fn new(dim: usize, num_heads: usize, vb: VarBuilder) -> Result<Self> {
        if num_heads == 0 || dim % num_heads != 0 {
            return Err(HyperRouteError::Config(format!(
                "model width {dim} is not divisible by {num_heads} attention heads"
            )));
        }
        Ok(MultiHeadSelfAttention {
            in_proj: linear(dim, 3 * dim, vb.pp("in_proj"))?,
            out_proj: linear(dim, dim, vb.pp("out_proj"))?,
            num_heads,
            head_dim: dim / num_heads,
        })
    }

    /// `x` is `(T, B, D)`; `key_bias` is `(B, T)` with `0` for real tokens and
    /// a large negative value for padding
    pub fn forward<R: Rng>(
        &self,
        x: &Tensor,
        key_bias: &Tensor,
        drop_rate: f64,
        rng: &mut R,
    ) -> Result<Tensor> {
        let (steps, batch, dim) = x.dims3()?;
        let qkv = self.in_proj.forward(x)?;

        let split = |i: usize| -> Result<Tensor> {
            Ok(qkv
                .narrow(2, i * dim, dim)?
                .reshape((steps, batch, self.num_heads, self.head_dim))?
                .permute((1, 2, 0, 3))?
                .contiguous()?)
        };
        let q = split(0)?;
        let k = split(1)?;
        let v = split(2)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = q.matmul(&k.t()?.contiguous()?)?.affine(scale, 0.0)?;
        let scores = scores.broadcast_add(&key_bias.reshape((batch, 1, 1, steps))?)?;
        let attn = dropout(&softmax(&scores, D::Minus1)?, drop_rate, rng)?;

        let out = attn
            .matmul(&v)?
            .permute((2, 0, 1, 3))?
            .reshape((steps, batch, dim))?;
        Ok(self.out_proj.forward(&out)?)
    }
}

/// Post-norm encoder block: attention and a ReLU feed-forward, each with
/// residual connection and layer norm
pub struct TransformerEncoderLayer {
    self_attn: MultiHeadSelfAttention,
    linear1: Linear,
    linear2: Linear,
    norm1: LayerNorm,
    norm2: LayerNorm,
    drop_rate: f64,
}

impl TransformerEncoderLayer {
    /// Block of width `dim` with a feed-forward of width `ff_dim`
    pub fn new(
        dim: usize,
        num_heads: usize,
        ff_dim: usize,
        drop_rate: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(TransformerEncoderLayer {
            self_attn: MultiHeadSelfAttention::new(dim, num_heads, vb.pp("self_attn"))?,
            linear1: linear(dim, ff_dim, vb.pp("linear1"))?,
            linear2: linear(ff_dim, dim, vb.pp("linear2"))?,
            norm1: LayerNorm::new(dim, vb.pp("norm1"))?,
            norm2: LayerNorm::new(dim, vb.pp("norm2"))?,
            drop_rate,
        })
    }

    /// Forward pass; dropout is active only when `train`
    pub fn forward<R: Rng>(
        &self,
        x: &Tensor,
        key_bias: &Tensor,
        train: bool,
        rng: &mut R,
    ) -> Result<Tensor> {
        let p = if train { self.drop_rate } else { 0.0 };

        let attended = self.self_attn.forward(x, key_bias, p, rng)?;
        let x = self.norm1.forward(&x.add(&dropout(&attended, p, rng)?)?)?;

        let hidden = dropout(&self.linear1.forward(&x)?.relu()?, p, rng)?;
        let ff = self.linear2.forward(&hidden)?;
        self.norm2.forward(&x.add(&dropout(&ff, p, rng)?)?)
    }
}

/// Positional encoding followed by a stack of encoder blocks and masked mean pooling
pub struct SequenceEncoder {
    positional: PositionalEncoding,
    layers: Vec<TransformerEncoderLayer>,
}

impl SequenceEncoder {
    /// Build `num_layers` blocks of width `dim`
    pub fn new(
        dim: usize,
        num_heads: usize,
        ff_dim: usize,
        num_layers: usize,
        drop_rate: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        let positional = PositionalEncoding::new(dim, drop_rate, DEFAULT_MAX_LEN, vb.device())?;
        let layers = (0..num_layers)
            .map(|i| {
                TransformerEncoderLayer::new(
                    dim,
                    num_heads,
                    ff_dim,
                    drop_rate,
                    vb.pp(format!("layers.{i}")),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(SequenceEncoder { positional, layers })
    }

    /// Encode `x` `(T, B, D)` and pool to `(B, D)`
    ///
    /// `keep` is `(B, T)` with `1.0` at real tokens and `0.0` at padding.
    pub fn forward<R: Rng>(
        &self,
        x: &Tensor,
        keep: &Tensor,
        train: bool,
        rng: &mut R,
    ) -> Result<Tensor> {
        let key_bias = keep.affine(-MASK_VALUE, MASK_VALUE)?;
        let mut h = self.positional.forward(x, train, rng)?;
        for layer in &self.layers {
            h = layer.forward(&h, &key_bias, train, rng)?;
        }
        masked_mean_pool(&h, keep)
    }
}

/// Mean over time of `x` `(T, B, D)` restricted to positions where `keep` `(B, T)` is 1
///
/// Padding is excluded from both the sum and the count. A sequence with no real
/// position pools to the zero vector.
pub fn masked_mean_pool(x: &Tensor, keep: &Tensor) -> Result<Tensor> {
    let (steps, batch, _) = x.dims3()?;
    if keep.dims() != [batch, steps] {
        return Err(HyperRouteError::ShapeMismatch(format!(
            "pool mask {:?} does not match sequence batch ({batch}, {steps})",
            keep.dims()
        )));
    }
    let weights = keep.t()?.unsqueeze(2)?.to_dtype(x.dtype())?;
    let total = x.broadcast_mul(&weights)?.sum(0)?;
    let count = weights.sum(0)?.maximum(1f32)?;
    Ok(total.broadcast_div(&count)?)
}
