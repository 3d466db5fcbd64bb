//! Dual-view model: one node table, a graph encoder and a sequence encoder

use std::str::FromStr;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Init, VarBuilder, VarMap};
use ndarray::Array2;
use rand::Rng;
use rand_distr::{Distribution, StandardNormal, Uniform};
use tracing::debug;

use crate::core::ModelConfig;
use crate::geometry::PoincareBall;
use crate::graph::{
    EdgeIndex, GraphEncoder, GraphEncoderKind, HyperbolicGraphEncoder, PRELU_INIT,
};
use crate::nn::augment::random_mask;
use crate::nn::transformer::SequenceEncoder;
use crate::{HyperRouteError, Result};

/// Parameter name of the node embedding table
pub const NODE_EMBEDDING: &str = "node_embedding.weight";

/// Where sequence tokens are looked up
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LookupMode {
    /// Raw node table
    Plain,
    /// Graph encodings of the full edge set, in tangent space
    Propagated,
}

impl FromStr for LookupMode {
    type Err = HyperRouteError;

    /// `"p"` is plain; any other alphanumeric tag selects propagated lookup
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "p" => Ok(LookupMode::Plain),
            tag if !tag.is_empty() && tag.chars().all(|c| c.is_ascii_alphanumeric()) => {
                Ok(LookupMode::Propagated)
            }
            other => Err(HyperRouteError::Config(format!(
                "invalid mode '{other}', expected 'p' or another alphanumeric tag"
            ))),
        }
    }
}

enum NodeEncoder {
    Euclidean(GraphEncoder),
    Hyperbolic(HyperbolicGraphEncoder),
}

/// Graph encodings in both coordinate systems
struct GraphOutput {
    tangent: Tensor,
    manifold: Tensor,
}

/// Shared node table with graph and sequence views
///
/// `forward` returns manifold points for both views. Parameters live in one
/// [`VarMap`]; the padding row used for sequence lookup is a constant zero
/// tensor outside it.
pub struct DualViewModel {
    varmap: VarMap,
    node_embedding: Tensor,
    padding: Tensor,
    edge_index: EdgeIndex,
    full_edges: EdgeIndex,
    graph_encoder: NodeEncoder,
    seq_encoder: SequenceEncoder,
    mode: LookupMode,
    ball: PoincareBall,
    manifold_params: Vec<Var>,
    num_nodes: usize,
    device: Device,
}

impl DualViewModel {
    /// Build every parameter on `device`
    ///
    /// Unknown activation, mode or encoder values are rejected here, before
    /// any forward pass.
    pub fn new(
        config: &ModelConfig,
        num_nodes: usize,
        edge_index: EdgeIndex,
        device: &Device,
    ) -> Result<Self> {
        let activation = config.activation()?;
        let mode = config.lookup_mode()?;
        let kind = config.graph_encoder()?;
        if mode == LookupMode::Plain && config.embed_size != config.hidden_size {
            return Err(HyperRouteError::Config(format!(
                "plain lookup needs embed_size == hidden_size, got {} and {}",
                config.embed_size, config.hidden_size
            )));
        }
        if num_nodes == 0 {
            return Err(HyperRouteError::Config("road network has no nodes".to_string()));
        }
        edge_index.validate(num_nodes)?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let node_embedding = vb.get_with_hints(
            (num_nodes, config.embed_size),
            NODE_EMBEDDING,
            Init::Randn {
                mean: 0.0,
                stdev: 1.0,
            },
        )?;

        let graph_vb = vb.pp("graph_encoder");
        let graph_encoder = match kind {
            GraphEncoderKind::Euclidean => NodeEncoder::Euclidean(GraphEncoder::new(
                config.embed_size,
                config.hidden_size,
                config.num_graph_layers,
                config.gat_heads,
                activation,
                graph_vb,
            )?),
            GraphEncoderKind::Hyperbolic => NodeEncoder::Hyperbolic(HyperbolicGraphEncoder::new(
                num_nodes,
                config.embed_size,
                config.hidden_size,
                config.num_graph_layers,
                config.gat_heads,
                activation,
                graph_vb,
            )?),
        };

        let seq_encoder = SequenceEncoder::new(
            config.hidden_size,
            config.num_heads,
            config.hidden_size,
            config.num_seq_layers,
            config.drop_rate,
            vb.pp("seq_encoder"),
        )?;

        let manifold_params: Vec<Var> = {
            let offsets = format!("graph_encoder.{}", HyperbolicGraphEncoder::OFFSETS);
            let data = varmap
                .data()
                .lock()
                .map_err(|_| candle_core::Error::Msg("parameter store lock poisoned".to_string()))?;
            data.get(&offsets).cloned().into_iter().collect()
        };

        let full_edges = edge_index.with_self_loops(num_nodes);
        debug!(
            num_nodes,
            num_edges = edge_index.num_edges(),
            ?mode,
            ?kind,
            "built dual-view model"
        );

        Ok(DualViewModel {
            padding: Tensor::zeros((1, config.hidden_size), DType::F32, device)?,
            varmap,
            node_embedding,
            edge_index,
            full_edges,
            graph_encoder,
            seq_encoder,
            mode,
            ball: PoincareBall::new(),
            manifold_params,
            num_nodes,
            device: device.clone(),
        })
    }

    /// Number of road nodes; also the padding sentinel
    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    /// Token lookup mode
    pub fn mode(&self) -> LookupMode {
        self.mode
    }

    /// Device holding the parameters
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Underlying parameter store
    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// All trainable parameters, sorted by name
    pub fn named_parameters(&self) -> Result<Vec<(String, Var)>> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| candle_core::Error::Msg("parameter store lock poisoned".to_string()))?;
        let mut params: Vec<(String, Var)> = data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        params.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(params)
    }

    fn graph_forward(&self, edges: &EdgeIndex) -> Result<GraphOutput> {
        match &self.graph_encoder {
            NodeEncoder::Euclidean(encoder) => {
                let tangent = encoder.forward(&self.node_embedding, edges)?;
                let manifold = self.ball.expmap0(&tangent)?;
                Ok(GraphOutput { tangent, manifold })
            }
            NodeEncoder::Hyperbolic(encoder) => {
                let manifold = encoder.forward(&self.node_embedding, edges)?;
                let tangent = self.ball.logmap0(&manifold)?;
                Ok(GraphOutput { tangent, manifold })
            }
        }
    }

    /// Node representations `(V, hidden)` after dropping each edge with probability `drop_rate`
    pub fn encode_graph<R: Rng>(&self, drop_rate: f64, rng: &mut R) -> Result<Tensor> {
        let edges = self
            .edge_index
            .dropout_edges(drop_rate, rng)
            .with_self_loops(self.num_nodes);
        Ok(self.graph_forward(&edges)?.manifold)
    }

    /// Sequence representations `(B, hidden)` for `tokens` `(B, T)`
    ///
    /// Each token is masked with probability `drop_rate`; masked and padding
    /// positions are both excluded from attention and pooling.
    pub fn encode_sequence<R: Rng>(
        &self,
        tokens: &Array2<u32>,
        drop_rate: f64,
        train: bool,
        rng: &mut R,
    ) -> Result<Tensor> {
        let sentinel = self.num_nodes as u32;
        if let Some(bad) = tokens.iter().find(|&&t| t > sentinel) {
            return Err(HyperRouteError::ShapeMismatch(format!(
                "token {bad} is outside 0..={sentinel}"
            )));
        }
        let (batch, steps) = tokens.dim();

        let base = match self.mode {
            LookupMode::Plain => self.node_embedding.clone(),
            LookupMode::Propagated => self.graph_forward(&self.full_edges)?.tangent,
        };
        let table = Tensor::cat(&[&base, &self.padding], 0)?;

        let masked = random_mask(tokens, sentinel, drop_rate, rng);
        let ids: Vec<u32> = masked.iter().copied().collect();
        let keep: Vec<f32> = ids
            .iter()
            .map(|&t| if t == sentinel { 0.0 } else { 1.0 })
            .collect();
        let ids = Tensor::from_vec(ids, batch * steps, &self.device)?;
        let keep = Tensor::from_vec(keep, (batch, steps), &self.device)?;

        let embedded = table
            .index_select(&ids, 0)?
            .reshape((batch, steps, ()))?
            .transpose(0, 1)?
            .contiguous()?;
        let pooled = self.seq_encoder.forward(&embedded, &keep, train, rng)?;
        self.ball.expmap0(&pooled)
    }

    /// One stochastic view `(node_rep, seq_rep)` of a batch
    pub fn forward<R: Rng>(
        &self,
        tokens: &Array2<u32>,
        drop_edge_rate: f64,
        drop_road_rate: f64,
        rng: &mut R,
    ) -> Result<(Tensor, Tensor)> {
        let node_rep = self.encode_graph(drop_edge_rate, rng)?;
        let seq_rep = self.encode_sequence(tokens, drop_road_rate, true, rng)?;
        Ok((node_rep, seq_rep))
    }

    /// Project manifold parameters back inside the ball
    pub fn retract(&self) -> Result<()> {
        for var in &self.manifold_params {
            var.set(&self.ball.project(var.as_tensor())?)?;
        }
        Ok(())
    }

    /// Fresh initialisation of every parameter from `rng`
    ///
    /// Matrices get Xavier-uniform values, biases zeros, normalisation gains
    /// ones, the node table N(0, 1), PReLU slopes 0.25 and manifold offsets a
    /// small projected normal draw.
    pub fn init_weights<R: Rng>(&self, rng: &mut R) -> Result<()> {
        for (name, var) in self.named_parameters()? {
            let dims = var.as_tensor().dims().to_vec();
            let count: usize = dims.iter().product();
            let values: Vec<f32> = if name == NODE_EMBEDDING {
                (0..count).map(|_| StandardNormal.sample(rng)).collect()
            } else if name.ends_with(HyperbolicGraphEncoder::OFFSETS) {
                let std = HyperbolicGraphEncoder::OFFSET_STD as f32;
                (0..count)
                    .map(|_| {
                        let z: f32 = StandardNormal.sample(rng);
                        std * z
                    })
                    .collect()
            } else if name.ends_with("prelu.weight") {
                vec![PRELU_INIT as f32; count]
            } else if name.contains("norm") && name.ends_with("weight") {
                vec![1.0; count]
            } else if dims.len() >= 2 {
                let bound = xavier_bound(&dims);
                let dist = Uniform::new_inclusive(-bound, bound);
                (0..count).map(|_| dist.sample(rng)).collect()
            } else {
                vec![0.0; count]
            };
            var.set(&Tensor::from_vec(values, dims, &self.device)?)?;
        }
        self.retract()
    }
}

/// `sqrt(6 / (fan_in + fan_out))` with the receptive field folded into both fans
fn xavier_bound(dims: &[usize]) -> f32 {
    let receptive: usize = dims[2..].iter().product();
    let fan_in = dims[1] * receptive;
    let fan_out = dims[0] * receptive;
    (6.0 / (fan_in + fan_out) as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::check_ball;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn ring(n: usize) -> EdgeIndex {
        EdgeIndex::from_edges((0..n).map(|i| (i, (i + 1) % n)).collect()).to_undirected()
    }

    fn build(config: &ModelConfig) -> Result<DualViewModel> {
        DualViewModel::new(config, 6, ring(6), &Device::Cpu)
    }

    #[test]
    fn test_forward_shapes_and_ball() {
        let config = ModelConfig::for_smoke_test();
        let model = build(&config).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let tokens = array![[0u32, 1, 2, 6], [3, 4, 6, 6], [5, 0, 1, 2]];

        let (node_rep, seq_rep) = model.forward(&tokens, 0.2, 0.2, &mut rng).unwrap();
        assert_eq!(node_rep.dims(), &[6, 8]);
        assert_eq!(seq_rep.dims(), &[3, 8]);
        check_ball(&node_rep, "nodes").unwrap();
        check_ball(&seq_rep, "sequences").unwrap();
    }

    #[test]
    fn test_propagated_hyperbolic_model() {
        let config = ModelConfig {
            mode: "g".to_string(),
            embed_size: 4,
            graph_encoder: "hyperbolic".to_string(),
            activation: "relu".to_string(),
            ..ModelConfig::for_smoke_test()
        };
        let model = build(&config).unwrap();
        assert_eq!(model.mode(), LookupMode::Propagated);
        let mut rng = StdRng::seed_from_u64(1);
        let tokens = array![[0u32, 1, 2], [3, 6, 6]];
        let (node_rep, seq_rep) = model.forward(&tokens, 0.5, 0.0, &mut rng).unwrap();
        assert_eq!(node_rep.dims(), &[6, 8]);
        assert_eq!(seq_rep.dims(), &[2, 8]);
        check_ball(&seq_rep, "sequences").unwrap();
    }

    #[test]
    fn test_unknown_values_rejected_at_construction() {
        let config = ModelConfig {
            activation: "swish".to_string(),
            ..ModelConfig::for_smoke_test()
        };
        assert!(matches!(build(&config), Err(HyperRouteError::Config(_))));

        let config = ModelConfig {
            mode: String::new(),
            ..ModelConfig::for_smoke_test()
        };
        assert!(matches!(build(&config), Err(HyperRouteError::Config(_))));

        let config = ModelConfig {
            embed_size: 4,
            ..ModelConfig::for_smoke_test()
        };
        assert!(matches!(build(&config), Err(HyperRouteError::Config(_))));
    }

    #[test]
    fn test_out_of_range_tokens() {
        let model = build(&ModelConfig::for_smoke_test()).unwrap();
        let mut rng = StdRng::seed_from_u64(2);
        let tokens = array![[0u32, 7]];
        assert!(matches!(
            model.encode_sequence(&tokens, 0.0, false, &mut rng),
            Err(HyperRouteError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_named_parameters_sorted_and_init() {
        let config = ModelConfig {
            graph_encoder: "hyperbolic".to_string(),
            ..ModelConfig::for_smoke_test()
        };
        let model = build(&config).unwrap();
        let params = model.named_parameters().unwrap();
        let names: Vec<&str> = params.iter().map(|(n, _)| n.as_str()).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        assert!(names.contains(&NODE_EMBEDDING));
        assert!(names.contains(&"graph_encoder.node_offsets"));
        assert!(names.contains(&"graph_encoder.prelu.weight"));

        let mut rng = StdRng::seed_from_u64(3);
        model.init_weights(&mut rng).unwrap();
        for (name, var) in params {
            let values = var.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();
            if name.ends_with("prelu.weight") {
                assert_eq!(values, vec![0.25]);
            } else if name.ends_with("in_proj.bias") {
                assert!(values.iter().all(|v| *v == 0.0));
            } else if name.ends_with("norm1.weight") {
                assert!(values.iter().all(|v| *v == 1.0));
            }
        }
    }

    #[test]
    fn test_xavier_bound() {
        assert!((xavier_bound(&[4, 2]) - 1.0).abs() < 1e-6);
        assert!((xavier_bound(&[1, 2, 3]) - (6.0f32 / 9.0).sqrt()).abs() < 1e-6);
    }
}
