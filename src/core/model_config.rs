//! Training configuration for the dual-view model

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::geometry::TransportReduction;
use crate::graph::{Activation, GraphEncoderKind};
use crate::nn::{LookupMode, LossMeasure};
use crate::{HyperRouteError, Result};

/// Model configuration
///
/// Loaded from JSON; every key is optional and falls back to
/// [`ModelConfig::for_road_network`]. String-valued keys are parsed by
/// [`ModelConfig::validate`] and again by model construction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Width of the node embedding table
    pub embed_size: usize,
    /// Width of encoder outputs and representations
    pub hidden_size: usize,
    /// Dropout inside the sequence encoder
    pub drop_rate: f64,
    /// Probability of dropping each edge per forward
    pub drop_edge_rate: f64,
    /// Probability of masking each token per forward
    pub drop_road_rate: f64,
    /// Adam step size
    pub learning_rate: f64,
    /// L2 penalty added to gradients
    pub weight_decay: f64,
    /// Last epoch to train (epochs count from 1)
    pub num_epochs: usize,
    /// Trajectories per batch
    pub batch_size: usize,
    /// Contrastive discriminator (`"geo"`, `"jsd"`, `"nce"`, `"ntx"`)
    pub loss_measure: String,
    /// Use visit weights instead of the binary node-sequence mask
    pub weighted_loss: bool,
    /// `"p"` looks tokens up in the raw table, anything else in graph encodings
    pub mode: String,
    /// Weight of the node-sequence term in `[0, 1]`
    pub lambda_st: f64,
    /// `"relu"` or `"prelu"`
    pub activation: String,
    /// Dataset size tag, part of the checkpoint name
    pub num_samples: usize,
    /// Ignore existing checkpoints and start from fresh weights
    pub retrain: bool,
    /// Attention heads of the sequence encoder
    pub num_heads: usize,
    /// GAT layers in the graph encoder
    pub num_graph_layers: usize,
    /// Transformer blocks in the sequence encoder
    pub num_seq_layers: usize,
    /// Attention heads per GAT layer
    pub gat_heads: usize,
    /// `"euclidean"` or `"hyperbolic"`
    pub graph_encoder: String,
    /// `"pairwise"` or `"broadcast"`
    pub transport: String,
    /// Log progress every this many batches
    pub log_every: usize,
    /// Seed of the training random number generator
    pub seed: u64,
    /// Shuffle batch order every epoch
    pub shuffle: bool,
    /// Trajectories are padded or truncated to this length
    pub max_len: usize,
}

impl ModelConfig {
    /// Configuration used for city-scale road networks
    pub fn for_road_network() -> Self {
        ModelConfig {
            embed_size: 128,
            hidden_size: 128,
            drop_rate: 0.2,
            drop_edge_rate: 0.2,
            drop_road_rate: 0.2,
            learning_rate: 1e-3,
            weight_decay: 1e-6,
            num_epochs: 5,
            batch_size: 64,
            loss_measure: "geo".to_string(),
            weighted_loss: false,
            mode: "p".to_string(),
            lambda_st: 0.8,
            activation: "prelu".to_string(),
            num_samples: 500_000,
            retrain: false,
            num_heads: 4,
            num_graph_layers: 2,
            num_seq_layers: 2,
            gat_heads: 1,
            graph_encoder: "euclidean".to_string(),
            transport: "pairwise".to_string(),
            log_every: 200,
            seed: 42,
            shuffle: true,
            max_len: 100,
        }
    }

    /// Small configuration for smoke tests and demos
    pub fn for_smoke_test() -> Self {
        ModelConfig {
            embed_size: 8,
            hidden_size: 8,
            num_heads: 2,
            num_epochs: 2,
            batch_size: 4,
            num_samples: 16,
            log_every: 1,
            max_len: 6,
            ..Self::for_road_network()
        }
    }

    /// Parse a JSON document
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read a JSON configuration file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Parsed `activation`
    pub fn activation(&self) -> Result<Activation> {
        self.activation.parse()
    }

    /// Parsed `mode`
    pub fn lookup_mode(&self) -> Result<LookupMode> {
        self.mode.parse()
    }

    /// Parsed `loss_measure`
    pub fn loss_measure(&self) -> Result<LossMeasure> {
        self.loss_measure.parse()
    }

    /// Parsed `graph_encoder`
    pub fn graph_encoder(&self) -> Result<GraphEncoderKind> {
        self.graph_encoder.parse()
    }

    /// Parsed `transport`
    pub fn transport(&self) -> Result<TransportReduction> {
        self.transport.parse()
    }

    /// Checkpoint name prefix `sv_{lambda_st}_{num_samples}_{mode}`
    pub fn run_key(&self) -> String {
        format!("sv_{:?}_{}_{}", self.lambda_st, self.num_samples, self.mode)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(HyperRouteError::Config(msg));

        if self.embed_size == 0 || self.hidden_size == 0 {
            return invalid("embedding and hidden sizes must be positive".to_string());
        }
        if self.batch_size == 0 {
            return invalid("batch size must be positive".to_string());
        }
        if self.max_len == 0 {
            return invalid("max_len must be positive".to_string());
        }
        if self.log_every == 0 {
            return invalid("log_every must be positive".to_string());
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return invalid(format!("learning rate must be positive, got {}", self.learning_rate));
        }
        if self.weight_decay < 0.0 {
            return invalid(format!("weight decay must be non-negative, got {}", self.weight_decay));
        }
        for (name, rate) in [
            ("drop_rate", self.drop_rate),
            ("drop_edge_rate", self.drop_edge_rate),
            ("drop_road_rate", self.drop_road_rate),
        ] {
            if !(0.0..1.0).contains(&rate) {
                return invalid(format!("{name} must lie in [0, 1), got {rate}"));
            }
        }
        if !(0.0..=1.0).contains(&self.lambda_st) {
            return invalid(format!("lambda_st must lie in [0, 1], got {}", self.lambda_st));
        }
        if self.num_graph_layers == 0 || self.num_seq_layers == 0 {
            return invalid("encoders need at least one layer".to_string());
        }
        if self.gat_heads == 0 {
            return invalid("gat_heads must be positive".to_string());
        }
        if self.num_heads == 0 || self.hidden_size % self.num_heads != 0 {
            return invalid(format!(
                "hidden size {} must be divisible by {} attention heads",
                self.hidden_size, self.num_heads
            ));
        }

        self.activation()?;
        self.loss_measure()?.ensure_supported()?;
        self.graph_encoder()?;
        self.transport()?;
        if self.lookup_mode()? == LookupMode::Plain && self.embed_size != self.hidden_size {
            return invalid(format!(
                "plain lookup needs embed_size == hidden_size, got {} and {}",
                self.embed_size, self.hidden_size
            ));
        }
        Ok(())
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self::for_road_network()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation() {
        let mut config = ModelConfig::default();
        assert!(config.validate().is_ok());

        config.embed_size = 0;
        assert!(config.validate().is_err());

        config.embed_size = 128;
        config.learning_rate = -0.001;
        assert!(config.validate().is_err());

        config.learning_rate = 1e-3;
        config.hidden_size = 130;
        assert!(matches!(config.validate(), Err(HyperRouteError::Config(_))));
    }

    #[test]
    fn test_string_keys_are_parsed() {
        let mut config = ModelConfig::for_smoke_test();
        assert!(config.validate().is_ok());

        config.activation = "gelu".to_string();
        assert!(config.validate().is_err());

        config.activation = "relu".to_string();
        config.loss_measure = "jsd".to_string();
        assert!(config.validate().is_err());

        config.loss_measure = "geo".to_string();
        config.graph_encoder = "hyperbolic".to_string();
        config.transport = "broadcast".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_plain_mode_needs_matching_widths() {
        let mut config = ModelConfig::for_smoke_test();
        config.embed_size = 4;
        assert!(config.validate().is_err());
        config.mode = "g".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_json_defaults_and_run_key() {
        let config = ModelConfig::from_json_str(r#"{"lambda_st": 0.5, "num_samples": 1000, "mode": "g"}"#).unwrap();
        assert_eq!(config.hidden_size, 128);
        assert_eq!(config.run_key(), "sv_0.5_1000_g");

        let config = ModelConfig { lambda_st: 1.0, ..ModelConfig::for_road_network() };
        assert_eq!(config.run_key(), "sv_1.0_500000_p");
    }
}
