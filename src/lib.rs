//! # HyperRoute: dual-view road and trajectory representations
//!
//! This library learns joint representations of road-network segments (graph
//! nodes) and trajectories (node sequences) with self-supervised contrastive
//! objectives that mix Euclidean optimal transport and Poincaré-ball geometry.
//!
//! ## Features
//!
//! - **Geometry**: Poincaré ball maps, hyperbolic distance, Sinkhorn divergence
//! - **Graph encoders**: GAT stacks in Euclidean or hyperbolic space
//! - **Sequence encoder**: positional encoding + padding-aware transformer
//! - **Training**: dual stochastic views, weighted multi-term loss, Adam,
//!   resumable per-epoch checkpoints
//! - **Cross-device**: CPU by default, CUDA / Metal through candle features

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Hyperbolic and optimal-transport geometry primitives
pub mod geometry;

/// Road-network topology and graph encoders
pub mod graph;

/// Neural network components, augmentation and losses
pub mod nn;

/// Configuration, data, optimisation and the training loop
pub mod core;

/// Utility functions and helpers
pub mod utils;

// Re-export commonly used types
pub use geometry::{hyperbolic_distance, PoincareBall, SinkhornDivergence};
pub use graph::EdgeIndex;
pub use nn::{DualViewModel, LossMeasure};
pub use crate::core::{ModelConfig, Trainer, TrajectoryData};

/// Error types for the library
#[derive(Debug, thiserror::Error)]
pub enum HyperRouteError {
    /// A point left the open unit ball or a hyperbolic quantity became non-finite
    #[error("Geometry domain error: {0}")]
    GeometryDomain(String),

    /// A contrastive mask summed to zero, so the loss has no positive pairs
    #[error("Degenerate batch: {0}")]
    DegenerateBatch(String),

    /// Invalid or unsupported configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Checkpoint missing fields or inconsistent with the model
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Incompatible shapes or out-of-range ids
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Tensor backend error
    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Binary serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for the library
pub type Result<T> = std::result::Result<T, HyperRouteError>;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        core::{BatchIndexer, ModelConfig, Trainer, TrainingMetrics, TrajectoryData},
        geometry::{hyperbolic_distance, PoincareBall, SinkhornDivergence, TransportReduction},
        graph::{Activation, EdgeIndex, GraphEncoderKind},
        nn::{random_mask, ContrastiveObjective, DualViewModel, LossMeasure, LookupMode},
        HyperRouteError, Result,
    };
}
