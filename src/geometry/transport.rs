//! Entropic optimal transport with quadratic ground cost
//!
//! The cloud-level quantity is the debiased Sinkhorn divergence between two
//! uniformly weighted point clouds, computed in the log domain with ε-scaling:
//! the potentials are annealed from the cloud diameter down to the blur on
//! detached costs, then one last extrapolation step runs with gradients.

use std::fmt;
use std::str::FromStr;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::{HyperRouteError, Result};

/// How a transport distance is laid against an `(N, M)` mask
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportReduction {
    /// Entry `(i, j)` is the divergence between the singletons `δ(a_i)` and `δ(b_j)`
    Pairwise,
    /// One cloud-level divergence broadcast over every mask entry
    Broadcast,
}

impl Default for TransportReduction {
    fn default() -> Self {
        TransportReduction::Pairwise
    }
}

impl FromStr for TransportReduction {
    type Err = HyperRouteError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pairwise" => Ok(TransportReduction::Pairwise),
            "broadcast" => Ok(TransportReduction::Broadcast),
            other => Err(HyperRouteError::Config(format!(
                "unknown transport reduction '{other}'"
            ))),
        }
    }
}

impl fmt::Display for TransportReduction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportReduction::Pairwise => write!(f, "pairwise"),
            TransportReduction::Broadcast => write!(f, "broadcast"),
        }
    }
}

/// Ground cost matrix `C_ij = ½‖x_i - y_j‖²`, shape `(N, M)`
pub fn ground_cost(x: &Tensor, y: &Tensor) -> Result<Tensor> {
    let x2 = x.sqr()?.sum_keepdim(1)?;
    let y2 = y.sqr()?.sum_keepdim(1)?.t()?;
    let xy = x.matmul(&y.t()?)?;
    let sq = x2.broadcast_add(&y2)?.sub(&xy.affine(2.0, 0.0)?)?;
    Ok(sq.maximum(0f32)?.affine(0.5, 0.0)?)
}

/// `-ε log Σ_j exp(h_j - C_ij / ε)`, reducing `(N, M)` costs to `(N,)`
fn softmin(eps: f64, cost: &Tensor, h: &Tensor) -> Result<Tensor> {
    let logits = h.unsqueeze(0)?.broadcast_sub(&cost.affine(1.0 / eps, 0.0)?)?;
    Ok(log_sum_exp(&logits, 1)?.affine(-eps, 0.0)?)
}

fn log_sum_exp(x: &Tensor, dim: usize) -> Result<Tensor> {
    let max = x.max_keepdim(dim)?.detach();
    let summed = x.broadcast_sub(&max)?.exp()?.sum_keepdim(dim)?.log()?;
    Ok(summed.add(&max)?.squeeze(dim)?)
}

/// Debiased Sinkhorn divergence (geometric loss with `p = 2`)
#[derive(Clone, Debug)]
pub struct SinkhornDivergence {
    /// Target entropic blur; the final ε is `blur²`
    pub blur: f64,
    /// Geometric ratio between successive blurs of the annealing schedule
    pub scaling: f64,
}

impl Default for SinkhornDivergence {
    fn default() -> Self {
        SinkhornDivergence {
            blur: 0.05,
            scaling: 0.5,
        }
    }
}

impl SinkhornDivergence {
    /// Create with an explicit blur and the default scaling
    pub fn new(blur: f64) -> Self {
        SinkhornDivergence {
            blur,
            ..Default::default()
        }
    }

    /// ε values from `diameter²` down to `blur²`
    fn epsilon_schedule(&self, diameter: f64) -> Vec<f64> {
        let mut schedule = vec![diameter.powi(2)];
        let stop = 2.0 * self.blur.ln();
        let step = 2.0 * self.scaling.ln();
        let mut e = 2.0 * diameter.ln();
        while e > stop {
            schedule.push(e.exp());
            e += step;
        }
        schedule.push(self.blur.powi(2));
        schedule
    }

    fn diameter(x: &Tensor, y: &Tensor) -> Result<f64> {
        let all = Tensor::cat(&[&x.detach(), &y.detach()], 0)?;
        let extent = all.max(0)?.sub(&all.min(0)?)?;
        let diameter = extent.sqr()?.sum_all()?.sqrt()?.to_scalar::<f32>()? as f64;
        Ok(diameter)
    }

    fn check_clouds(x: &Tensor, y: &Tensor) -> Result<(usize, usize)> {
        let (n, dx) = x.dims2()?;
        let (m, dy) = y.dims2()?;
        if dx != dy || n == 0 || m == 0 {
            return Err(HyperRouteError::ShapeMismatch(format!(
                "transport expects non-empty clouds of equal dimension, got {:?} and {:?}",
                x.dims(),
                y.dims()
            )));
        }
        Ok((n, m))
    }

    /// Sinkhorn divergence between the uniform clouds `x` `(N, d)` and `y` `(M, d)`
    pub fn divergence(&self, x: &Tensor, y: &Tensor) -> Result<Tensor> {
        let (n, m) = Self::check_clouds(x, y)?;
        let device = x.device();

        let c_xy = ground_cost(x, y)?;
        let c_yx = c_xy.t()?.contiguous()?;
        let c_xx = ground_cost(x, x)?;
        let c_yy = ground_cost(y, y)?;

        let a_log = Tensor::full(-(n as f32).ln(), n, device)?;
        let b_log = Tensor::full(-(m as f32).ln(), m, device)?;

        let schedule = self.epsilon_schedule(Self::diameter(x, y)?.max(self.blur));

        // annealing runs without gradients
        let (dxy, dyx, dxx, dyy) = (c_xy.detach(), c_yx.detach(), c_xx.detach(), c_yy.detach());
        let eps0 = schedule[0];
        let mut g_ab = softmin(eps0, &dyx, &a_log)?;
        let mut f_ba = softmin(eps0, &dxy, &b_log)?;
        let mut f_aa = softmin(eps0, &dxx, &a_log)?;
        let mut g_bb = softmin(eps0, &dyy, &b_log)?;

        for &eps in &schedule {
            let inv = 1.0 / eps;
            let ft_ba = softmin(eps, &dxy, &b_log.add(&g_ab.affine(inv, 0.0)?)?)?;
            let gt_ab = softmin(eps, &dyx, &a_log.add(&f_ba.affine(inv, 0.0)?)?)?;
            let ft_aa = softmin(eps, &dxx, &a_log.add(&f_aa.affine(inv, 0.0)?)?)?;
            let gt_bb = softmin(eps, &dyy, &b_log.add(&g_bb.affine(inv, 0.0)?)?)?;
            f_ba = f_ba.add(&ft_ba)?.affine(0.5, 0.0)?;
            g_ab = g_ab.add(&gt_ab)?.affine(0.5, 0.0)?;
            f_aa = f_aa.add(&ft_aa)?.affine(0.5, 0.0)?;
            g_bb = g_bb.add(&gt_bb)?.affine(0.5, 0.0)?;
        }

        let eps = self.blur.powi(2);
        let inv = 1.0 / eps;
        let f_ba_final = softmin(eps, &c_xy, &b_log.add(&g_ab.affine(inv, 0.0)?)?)?;
        let g_ab_final = softmin(eps, &c_yx, &a_log.add(&f_ba.affine(inv, 0.0)?)?)?;
        let f_aa_final = softmin(eps, &c_xx, &a_log.add(&f_aa.affine(inv, 0.0)?)?)?;
        let g_bb_final = softmin(eps, &c_yy, &b_log.add(&g_bb.affine(inv, 0.0)?)?)?;

        let cost = f_ba_final
            .sub(&f_aa_final)?
            .mean_all()?
            .add(&g_ab_final.sub(&g_bb_final)?.mean_all()?)?;
        Ok(cost.maximum(0f32)?)
    }

    /// Pairwise singleton divergences, shape `(N, M)`
    ///
    /// For Dirac measures the debiased divergence reduces to the ground cost
    /// whatever the blur, so this is [`ground_cost`].
    pub fn pairwise(&self, x: &Tensor, y: &Tensor) -> Result<Tensor> {
        Self::check_clouds(x, y)?;
        ground_cost(x, y)
    }

    /// Transport cost laid out as an `(N, M)` matrix for masking
    pub fn cost_matrix(&self, x: &Tensor, y: &Tensor, reduction: TransportReduction) -> Result<Tensor> {
        match reduction {
            TransportReduction::Pairwise => self.pairwise(x, y),
            TransportReduction::Broadcast => {
                let (n, m) = Self::check_clouds(x, y)?;
                Ok(self.divergence(x, y)?.broadcast_as((n, m))?)
            }
        }
    }
}
