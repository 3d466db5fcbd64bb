//! Sinusoidal positional encoding for time-major sequences

use candle_core::{Device, Tensor};
use rand::Rng;

use crate::nn::augment::dropout;
use crate::{HyperRouteError, Result};

/// Default number of precomputed positions
pub const DEFAULT_MAX_LEN: usize = 5000;

/// `pe[t, 2k] = sin(t / 10000^(2k/d))`, `pe[t, 2k+1] = cos(..)`, added to `(T, B, d)` inputs
pub struct PositionalEncoding {
    pe: Tensor,
    max_len: usize,
    drop_rate: f64,
}

impl PositionalEncoding {
    /// Precompute the table for `max_len` positions of width `dim`
    ///
    /// Odd widths are supported; the last channel is then a sine.
    pub fn new(dim: usize, drop_rate: f64, max_len: usize, device: &Device) -> Result<Self> {
        let log_base = -(10000f64.ln()) / dim as f64;
        let mut table = vec![0f32; max_len * dim];
        for pos in 0..max_len {
            let row = &mut table[pos * dim..(pos + 1) * dim];
            for k in (0..dim).step_by(2) {
                let angle = pos as f64 * (k as f64 * log_base).exp();
                row[k] = angle.sin() as f32;
                if k + 1 < dim {
                    row[k + 1] = angle.cos() as f32;
                }
            }
        }
        let pe = Tensor::from_vec(table, (max_len, 1, dim), device)?;
        Ok(PositionalEncoding {
            pe,
            max_len,
            drop_rate,
        })
    }

    /// Add the encoding to `x` `(T, B, d)` and apply dropout when `train`
    pub fn forward<R: Rng>(&self, x: &Tensor, train: bool, rng: &mut R) -> Result<Tensor> {
        let steps = x.dim(0)?;
        if steps > self.max_len {
            return Err(HyperRouteError::ShapeMismatch(format!(
                "sequence length {steps} exceeds positional table of {}",
                self.max_len
            )));
        }
        let x = x.broadcast_add(&self.pe.narrow(0, 0, steps)?)?;
        if train {
            dropout(&x, self.drop_rate, rng)
        } else {
            Ok(x)
        }
    }
}
