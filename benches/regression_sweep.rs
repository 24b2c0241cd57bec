use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use ndarray::Array2;
use rand::distributions::Standard;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use regnet::preprocess::PreprocessConfig;
use regnet::regression::{LocalMap, ParallelMap, RayonMap, RegressionEngine};
use regnet::strategy::{BestSubset, PriorOls};
use regnet::types::{LabeledMatrix, numbered_labels};

const PREDICTORS: usize = 20;
const SAMPLES: usize = 100;

fn random_labeled(rows: usize, cols: usize, prefix: &str, seed: u64) -> LabeledMatrix {
    let mut rng = StdRng::seed_from_u64(seed);
    let data = Array2::from_shape_fn((rows, cols), |_| rng.sample(Standard));
    LabeledMatrix::new(data, numbered_labels(prefix, rows), numbered_labels("s", cols))
        .expect("labels match shape")
}

/// Every gene gets a handful of prior edges.
fn sparse_prior(genes: usize) -> LabeledMatrix {
    let data = Array2::from_shape_fn((genes, PREDICTORS), |(g, k)| {
        if (g + k) % (PREDICTORS / 3) == 0 { 1.0 } else { 0.0 }
    });
    LabeledMatrix::new(
        data,
        numbered_labels("g", genes),
        numbered_labels("tf", PREDICTORS),
    )
    .expect("labels match shape")
}

fn build_engine(genes: usize) -> RegressionEngine {
    let x = random_labeled(PREDICTORS, SAMPLES, "tf", 0x5EED);
    let y = random_labeled(genes, SAMPLES, "g", 0x5EED + genes as u64);
    RegressionEngine::new(&x, &y, &sparse_prior(genes), &PreprocessConfig::default())
        .expect("engine builds")
}

fn benchmark_regression_sweep(c: &mut Criterion) {
    let gene_counts = [50_usize, 200];
    let maps: [(&str, Box<dyn ParallelMap>); 2] = [
        ("local", Box::new(LocalMap)),
        ("rayon", Box::new(RayonMap::global())),
    ];

    let mut group = c.benchmark_group("regression_sweep");
    group.sample_size(10);
    for &genes in &gene_counts {
        let engine = build_engine(genes);
        group.throughput(Throughput::Elements(genes as u64));

        for (map_name, map) in &maps {
            group.bench_with_input(
                BenchmarkId::new(format!("prior_ols/{map_name}"), genes),
                &engine,
                |b, engine| {
                    b.iter(|| black_box(engine.run(&PriorOls, map.as_ref()).expect("fit")));
                },
            );
        }

        let best_subset = BestSubset::new(8).expect("valid candidate cap");
        group.bench_with_input(
            BenchmarkId::new("best_subset/rayon", genes),
            &engine,
            |b, engine| {
                b.iter(|| black_box(engine.run(&best_subset, &RayonMap::global()).expect("fit")));
            },
        );
    }
    group.finish();
}

criterion_group!(regression_sweep, benchmark_regression_sweep);
criterion_main!(regression_sweep);
