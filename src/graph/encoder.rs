//! GAT encoder stacks in Euclidean and hyperbolic space

use std::fmt;
use std::str::FromStr;

use candle_core::Tensor;
use candle_nn::{Init, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::geometry::PoincareBall;
use crate::graph::{EdgeIndex, GatConv};
use crate::{HyperRouteError, Result};

/// Initial slope of the parametric ReLU
pub const PRELU_INIT: f64 = 0.25;

/// Non-linearity applied after every graph layer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    /// `max(x, 0)`
    Relu,
    /// `max(x, 0) + a * min(x, 0)` with one learnable `a`
    Prelu,
}

impl FromStr for Activation {
    type Err = HyperRouteError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "relu" => Ok(Activation::Relu),
            "prelu" => Ok(Activation::Prelu),
            other => Err(HyperRouteError::Config(format!(
                "unknown activation '{other}', expected 'relu' or 'prelu'"
            ))),
        }
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Activation::Relu => write!(f, "relu"),
            Activation::Prelu => write!(f, "prelu"),
        }
    }
}

/// Activation instance shared by all layers of one encoder
#[derive(Clone, Debug)]
pub(crate) enum ActivationLayer {
    Relu,
    Prelu(Tensor),
}

impl ActivationLayer {
    pub(crate) fn new(kind: Activation, vb: VarBuilder) -> Result<Self> {
        Ok(match kind {
            Activation::Relu => ActivationLayer::Relu,
            Activation::Prelu => {
                ActivationLayer::Prelu(vb.get_with_hints(1, "prelu.weight", Init::Const(PRELU_INIT))?)
            }
        })
    }

    pub(crate) fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            ActivationLayer::Relu => Ok(x.relu()?),
            ActivationLayer::Prelu(slope) => {
                let negative = x.minimum(0f32)?.broadcast_mul(slope)?;
                Ok(x.relu()?.add(&negative)?)
            }
        }
    }
}

/// Which space the graph encoder operates in
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphEncoderKind {
    /// GAT stack on raw features; outputs cross into the ball afterwards
    #[default]
    Euclidean,
    /// GAT stack wrapped in `logmap0` / `expmap0` with per-node offsets
    Hyperbolic,
}

impl FromStr for GraphEncoderKind {
    type Err = HyperRouteError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "euclidean" => Ok(GraphEncoderKind::Euclidean),
            "hyperbolic" => Ok(GraphEncoderKind::Hyperbolic),
            other => Err(HyperRouteError::Config(format!(
                "unknown graph encoder '{other}', expected 'euclidean' or 'hyperbolic'"
            ))),
        }
    }
}

fn build_layers(
    input_dim: usize,
    output_dim: usize,
    num_layers: usize,
    heads: usize,
    vb: &VarBuilder,
) -> Result<Vec<GatConv>> {
    if num_layers == 0 {
        return Err(HyperRouteError::Config(
            "graph encoder needs at least one layer".to_string(),
        ));
    }
    (0..num_layers)
        .map(|i| {
            let in_dim = if i == 0 { input_dim } else { output_dim };
            GatConv::new(in_dim, output_dim, heads, vb.pp(format!("layers.{i}")))
        })
        .collect()
}

/// Euclidean GAT stack: `x ← act(conv_i(x))` for every layer
pub struct GraphEncoder {
    layers: Vec<GatConv>,
    activation: ActivationLayer,
}

impl GraphEncoder {
    /// Build `num_layers` GAT layers, the first `input_dim → output_dim`
    pub fn new(
        input_dim: usize,
        output_dim: usize,
        num_layers: usize,
        heads: usize,
        activation: Activation,
        vb: VarBuilder,
    ) -> Result<Self> {
        let layers = build_layers(input_dim, output_dim, num_layers, heads, &vb)?;
        let activation = ActivationLayer::new(activation, vb)?;
        Ok(GraphEncoder { layers, activation })
    }

    /// Number of GAT layers
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Encode `features` `(V, input_dim)`; `edges` must include self loops
    pub fn forward(&self, features: &Tensor, edges: &EdgeIndex) -> Result<Tensor> {
        let mut x = features.clone();
        for layer in &self.layers {
            x = self.activation.forward(&layer.forward(&x, edges)?)?;
        }
        Ok(x)
    }
}

/// Hyperbolic GAT stack
///
/// Features enter the ball as `expmap0(features) ⊕ offsets`; each layer then
/// computes `expmap0(act(conv(logmap0(x))))`. The output rows are manifold points.
pub struct HyperbolicGraphEncoder {
    layers: Vec<GatConv>,
    activation: ActivationLayer,
    offsets: Tensor,
    ball: PoincareBall,
}

impl HyperbolicGraphEncoder {
    /// Name of the manifold parameter under this encoder's prefix
    pub const OFFSETS: &'static str = "node_offsets";

    /// Standard deviation of freshly drawn offsets
    pub const OFFSET_STD: f64 = 1e-3;

    /// Build the stack plus a `(num_nodes, input_dim)` offset table
    pub fn new(
        num_nodes: usize,
        input_dim: usize,
        output_dim: usize,
        num_layers: usize,
        heads: usize,
        activation: Activation,
        vb: VarBuilder,
    ) -> Result<Self> {
        let layers = build_layers(input_dim, output_dim, num_layers, heads, &vb)?;
        let offsets = vb.get_with_hints(
            (num_nodes, input_dim),
            Self::OFFSETS,
            Init::Randn {
                mean: 0.0,
                stdev: Self::OFFSET_STD,
            },
        )?;
        let activation = ActivationLayer::new(activation, vb)?;
        Ok(HyperbolicGraphEncoder {
            layers,
            activation,
            offsets,
            ball: PoincareBall::new(),
        })
    }

    /// Number of GAT layers
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Encode `features` `(V, input_dim)` to points of the ball
    pub fn forward(&self, features: &Tensor, edges: &EdgeIndex) -> Result<Tensor> {
        let mut x = self
            .ball
            .mobius_add(&self.ball.expmap0(features)?, &self.offsets)?;
        for layer in &self.layers {
            let tangent = self.ball.logmap0(&x)?;
            let h = self.activation.forward(&layer.forward(&tangent, edges)?)?;
            x = self.ball.expmap0(&h)?;
        }
        Ok(x)
    }
}
