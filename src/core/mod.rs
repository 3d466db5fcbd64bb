//! Configuration, data, optimisation, checkpoints and the training loop

mod checkpoint;
mod data;
mod model_config;
mod optimizer;
mod training;

pub use checkpoint::{
    checkpoint_path, latest_checkpoint, load_state_dict, state_dict, Checkpoint, TensorState, CHECKPOINT_EXT,
};
pub use data::{BatchIndexer, TrajectoryData, TrajectoryFile};
pub use model_config::ModelConfig;
pub use optimizer::{Adam, AdamConfig, OptimizerState, ParamState};
pub use training::{Trainer, TrainingMetrics};
