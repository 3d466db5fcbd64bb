//! Stochastic view augmentation for token batches

use candle_core::Tensor;
use ndarray::Array2;
use rand::Rng;

use crate::Result;

/// Replace each token by `sentinel` with probability `prob`
///
/// Every position gets an independent uniform draw; draws below `prob` are
/// masked. The input batch is left untouched.
pub fn random_mask<R: Rng>(tokens: &Array2<u32>, sentinel: u32, prob: f64, rng: &mut R) -> Array2<u32> {
    if prob <= 0.0 {
        return tokens.clone();
    }
    tokens.mapv(|t| if rng.gen::<f64>() < prob { sentinel } else { t })
}

/// Inverted dropout with the mask drawn from `rng`
///
/// Kept entries are scaled by `1 / (1 - p)`; `p >= 1` zeroes the tensor.
pub fn dropout<R: Rng>(x: &Tensor, p: f64, rng: &mut R) -> Result<Tensor> {
    if p <= 0.0 {
        return Ok(x.clone());
    }
    if p >= 1.0 {
        return Ok(x.zeros_like()?);
    }
    let scale = (1.0 / (1.0 - p)) as f32;
    let mask: Vec<f32> = (0..x.elem_count())
        .map(|_| if rng.gen::<f64>() < p { 0.0 } else { scale })
        .collect();
    let mask = Tensor::from_vec(mask, x.dims(), x.device())?.to_dtype(x.dtype())?;
    Ok(x.mul(&mask)?)
}
