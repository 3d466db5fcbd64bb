use candle_core::{Device, Tensor};
use criterion::{criterion_group, criterion_main, Criterion};
use hyperroute::core::{ModelConfig, Trainer, TrajectoryData};
use hyperroute::geometry::{PoincareBall, SinkhornDivergence};
use hyperroute::graph::EdgeIndex;
use hyperroute::nn::node_node_loss;
use hyperroute::utils::{random_road_network, random_walks};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn bench_geometry(c: &mut Criterion) {
    let ball = PoincareBall::new();
    let a = ball
        .expmap0(&Tensor::randn(0f32, 1f32, (512, 64), &Device::Cpu).unwrap())
        .unwrap();
    let b = ball
        .expmap0(&Tensor::randn(0f32, 1f32, (512, 64), &Device::Cpu).unwrap())
        .unwrap();
    let sinkhorn = SinkhornDivergence::default();

    c.bench_function("node_node_loss_512x64", |bench| {
        bench.iter(|| node_node_loss(&a, &b).unwrap())
    });
    c.bench_function("sinkhorn_divergence_512x64", |bench| {
        bench.iter(|| sinkhorn.divergence(&a, &b).unwrap())
    });
}

fn bench_train_step(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(0);
    let num_nodes = 64;
    let edges = EdgeIndex::from_graph(&random_road_network(num_nodes, 32, &mut rng));
    let walks = random_walks(&edges, num_nodes, 32, 12, &mut rng);

    let config = ModelConfig {
        embed_size: 32,
        hidden_size: 32,
        batch_size: 32,
        max_len: 12,
        retrain: true,
        ..ModelConfig::for_smoke_test()
    };
    let data = TrajectoryData::from_sequences(&walks, num_nodes, config.max_len, false).unwrap();
    let dir = std::env::temp_dir().join("hyperroute-bench");
    let mut trainer = Trainer::new(config, num_nodes, edges, &dir, &Device::Cpu).unwrap();

    c.bench_function("dual_view_train_step", |bench| {
        bench.iter(|| trainer.train_step(&data.tokens, None).unwrap())
    });
}

criterion_group!(benches, bench_geometry, bench_train_step);
criterion_main!(benches);
