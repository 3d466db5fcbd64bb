use candle_core::Device;
use hyperroute::core::{ModelConfig, Trainer, TrajectoryData};
use hyperroute::graph::EdgeIndex;
use hyperroute::utils::{random_road_network, random_walks, timing::Timer};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::Level;

fn main() -> hyperroute::Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    // Synthetic city: a ring road with shortcuts, trajectories as random walks
    let num_nodes = 40;
    let mut rng = StdRng::seed_from_u64(7);
    let graph = random_road_network(num_nodes, 20, &mut rng);
    let edges = EdgeIndex::from_graph(&graph);

    let config = ModelConfig {
        embed_size: 16,
        hidden_size: 16,
        num_heads: 4,
        num_epochs: 3,
        batch_size: 16,
        max_len: 12,
        num_samples: 200,
        log_every: 5,
        weighted_loss: true,
        graph_encoder: "hyperbolic".to_string(),
        ..ModelConfig::for_smoke_test()
    };
    let walks = random_walks(&edges, num_nodes, config.num_samples, config.max_len, &mut rng);
    let data = TrajectoryData::from_sequences(&walks, num_nodes, config.max_len, true)?;

    let save_path = std::env::temp_dir().join("hyperroute-demo");
    let mut trainer = Trainer::new(config, num_nodes, edges, &save_path, &Device::Cpu)?;

    let metrics = {
        let _timer = Timer::new("training");
        trainer.train(&data)?
    };
    for (epoch, loss) in metrics.epochs.iter().zip(&metrics.train_loss) {
        println!("Epoch {}: loss = {:.4}", epoch, loss);
    }
    println!("{}", metrics.summary());
    println!("Checkpoints in {}", save_path.display());
    Ok(())
}
