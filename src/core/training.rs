//! Training loop: resume or fresh start, dual stochastic views, per-epoch checkpoints

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use candle_core::Device;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::checkpoint::{checkpoint_path, latest_checkpoint, load_state_dict, Checkpoint};
use crate::core::data::{BatchIndexer, TrajectoryData};
use crate::core::optimizer::{Adam, AdamConfig};
use crate::core::ModelConfig;
use crate::graph::EdgeIndex;
use crate::nn::{ContrastiveObjective, DualViewModel, LossBreakdown};
use crate::{HyperRouteError, Result};

/// Training metrics
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TrainingMetrics {
    /// Epochs trained in this run, in order
    pub epochs: Vec<usize>,
    /// Mean batch loss of each trained epoch
    pub train_loss: Vec<f32>,
    /// Per-term histories (`node_node`, `seq_seq`, `node_seq`)
    pub custom_metrics: HashMap<String, Vec<f32>>,
    /// Lowest epoch loss seen
    pub best_loss: f32,
    /// Epoch with the lowest loss
    pub best_epoch: usize,
    /// Total training time
    pub total_time: Duration,
}

impl TrainingMetrics {
    /// Create new metrics tracker
    pub fn new() -> Self {
        TrainingMetrics {
            epochs: Vec::new(),
            train_loss: Vec::new(),
            custom_metrics: HashMap::new(),
            best_loss: f32::INFINITY,
            best_epoch: 0,
            total_time: Duration::from_secs(0),
        }
    }

    /// Update metrics for an epoch
    pub fn update_epoch(&mut self, epoch: usize, train_loss: f32) {
        self.epochs.push(epoch);
        self.train_loss.push(train_loss);

        if train_loss < self.best_loss {
            self.best_loss = train_loss;
            self.best_epoch = epoch;
        }
    }

    /// Add custom metric
    pub fn add_metric(&mut self, name: &str, value: f32) {
        self.custom_metrics
            .entry(name.to_string())
            .or_default()
            .push(value);
    }

    /// Number of epochs trained in this run
    pub fn num_epochs(&self) -> usize {
        self.epochs.len()
    }

    /// Get summary statistics
    pub fn summary(&self) -> String {
        format!(
            "Best loss: {:.4} at epoch {}\nTotal training time: {:.2}s\nFinal loss: {:.4}",
            self.best_loss,
            self.best_epoch,
            self.total_time.as_secs_f32(),
            self.train_loss.last().unwrap_or(&0.0)
        )
    }
}

/// Running sums of one epoch
#[derive(Default)]
struct EpochAccumulator {
    batches: usize,
    total: f64,
    node_node: f64,
    seq_seq: f64,
    node_seq: f64,
}

impl EpochAccumulator {
    fn push(&mut self, loss: f32, terms: &LossBreakdown) {
        self.batches += 1;
        self.total += loss as f64;
        self.node_node += terms.node_node as f64;
        self.seq_seq += terms.seq_seq as f64;
        self.node_seq += terms.node_seq as f64;
    }

    fn mean(&self, sum: f64) -> f32 {
        (sum / self.batches.max(1) as f64) as f32
    }
}

/// Owns the model, optimizer and objective for one run
pub struct Trainer {
    config: ModelConfig,
    model: DualViewModel,
    optimizer: Adam,
    objective: ContrastiveObjective,
    save_path: PathBuf,
    start_epoch: usize,
    rng: StdRng,
}

impl Trainer {
    /// Build the run and decide where it starts
    ///
    /// With `retrain` unset and a checkpoint of this run under `save_path`,
    /// model and optimizer state are restored and training resumes after the
    /// saved epoch. Otherwise every weight is freshly initialised and training
    /// starts at epoch 1.
    pub fn new<P: AsRef<Path>>(
        config: ModelConfig,
        num_nodes: usize,
        edge_index: EdgeIndex,
        save_path: P,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;
        let model = DualViewModel::new(&config, num_nodes, edge_index, device)?;
        let optimizer = Adam::new(
            model.named_parameters()?,
            AdamConfig::new(config.learning_rate, config.weight_decay),
        );
        let objective = ContrastiveObjective::new(config.loss_measure()?, config.lambda_st, config.transport()?)?;

        let mut trainer = Trainer {
            rng: StdRng::seed_from_u64(config.seed),
            save_path: save_path.as_ref().to_path_buf(),
            config,
            model,
            optimizer,
            objective,
            start_epoch: 1,
        };
        trainer.start_epoch = trainer.resume_or_init()?;
        Ok(trainer)
    }

    /// Restore the latest checkpoint or initialise fresh weights; returns the first epoch to train
    pub fn resume_or_init(&mut self) -> Result<usize> {
        let run_key = self.config.run_key();
        if !self.config.retrain {
            if let Some((epoch, path)) = latest_checkpoint(&self.save_path, &run_key)? {
                let checkpoint = Checkpoint::load(&path)?;
                if checkpoint.epoch != epoch {
                    return Err(HyperRouteError::Checkpoint(format!(
                        "{} records epoch {}",
                        path.display(),
                        checkpoint.epoch
                    )));
                }
                load_state_dict(&self.model, &checkpoint.model_state_dict)?;
                self.optimizer.load_state(&checkpoint.optimizer_state_dict)?;
                info!(path = %path.display(), epoch, "resuming from checkpoint");
                return Ok(epoch + 1);
            }
        }

        self.model.init_weights(&mut self.rng)?;
        self.optimizer = Adam::new(self.model.named_parameters()?, self.optimizer.config().clone());
        info!(run = %run_key, retrain = self.config.retrain, "starting from fresh weights");
        Ok(1)
    }

    /// First epoch the next call to [`Trainer::train`] runs
    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    /// The model being trained
    pub fn model(&self) -> &DualViewModel {
        &self.model
    }

    /// Configuration of this run
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Two stochastic views, loss, backward, Adam step and retraction for one batch
    pub fn train_step(&mut self, tokens: &Array2<u32>, weights: Option<&Array2<f32>>) -> Result<LossBreakdown> {
        let cfg = &self.config;
        let view1 = self.model.forward(tokens, cfg.drop_edge_rate, cfg.drop_road_rate, &mut self.rng)?;
        let view2 = self.model.forward(tokens, cfg.drop_edge_rate, cfg.drop_road_rate, &mut self.rng)?;

        let weights = if cfg.weighted_loss { weights } else { None };
        let breakdown = self
            .objective
            .compute((&view1.0, &view1.1), (&view2.0, &view2.1), tokens, weights)?;

        let grads = breakdown.total.backward()?;
        self.optimizer.step(&grads)?;
        self.model.retract()?;
        Ok(breakdown)
    }

    /// Train epochs `start_epoch..=num_epochs`, checkpointing after each
    pub fn train(&mut self, data: &TrajectoryData) -> Result<TrainingMetrics> {
        let mut metrics = TrainingMetrics::new();
        let num_epochs = self.config.num_epochs;
        if self.start_epoch > num_epochs {
            info!(start = self.start_epoch, num_epochs, "no epochs left to train");
            return Ok(metrics);
        }
        if data.num_nodes() != self.model.num_nodes() {
            return Err(HyperRouteError::ShapeMismatch(format!(
                "trajectories use {} nodes, model has {}",
                data.num_nodes(),
                self.model.num_nodes()
            )));
        }
        if data.is_empty() {
            return Err(HyperRouteError::DegenerateBatch("no trajectories to train on".to_string()));
        }
        if self.config.weighted_loss && data.weights.is_none() {
            return Err(HyperRouteError::Config(
                "weighted_loss needs trajectories loaded with visit weights".to_string(),
            ));
        }
        std::fs::create_dir_all(&self.save_path)?;

        let run_key = self.config.run_key();
        let mut indexer = BatchIndexer::new(data.len(), self.config.batch_size, self.config.shuffle);
        let start_time = Instant::now();

        info!(
            trajectories = data.len(),
            batches = indexer.num_batches(),
            start = self.start_epoch,
            num_epochs,
            "=== Training ==="
        );

        for epoch in self.start_epoch..=num_epochs {
            indexer.reset(&mut self.rng);
            let mut acc = EpochAccumulator::default();

            while let Some(batch_index) = indexer.next_batch() {
                let (tokens, weights) = data.select(&batch_index);
                let terms = self.train_step(&tokens, weights.as_ref())?;
                let loss = terms.total.to_scalar::<f32>()?;
                acc.push(loss, &terms);

                if acc.batches % self.config.log_every == 0 {
                    info!(epoch, batch = acc.batches, loss = %format!("{loss:.4}"), "(Train)");
                }
            }

            let checkpoint = Checkpoint::capture(epoch, &self.model, self.optimizer.state()?)?;
            let path = checkpoint_path(&self.save_path, &run_key, epoch);
            checkpoint.save(&path)?;
            debug!(epoch, path = %path.display(), "epoch checkpoint written");

            metrics.update_epoch(epoch, acc.mean(acc.total));
            metrics.add_metric("node_node", acc.mean(acc.node_node));
            metrics.add_metric("seq_seq", acc.mean(acc.seq_seq));
            metrics.add_metric("node_seq", acc.mean(acc.node_seq));
            self.start_epoch = epoch + 1;
        }

        metrics.total_time = start_time.elapsed();
        info!("Training complete\n{}", metrics.summary());
        Ok(metrics)
    }
}
