use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::Rng;
use waggle_distance::{l2_sqr, l2_sqr_scalar};

fn generate_random_vector(size: usize) -> Vec<f32> {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| rng.gen_range(-10.0..10.0)).collect()
}

fn bench_l2_sqr(c: &mut Criterion) {
    for dim in [8, 96, 128, 960] {
        let a = generate_random_vector(dim);
        let b = generate_random_vector(dim);

        c.bench_function(&format!("l2_sqr_dispatched_{}", dim), |bench| {
            bench.iter(|| l2_sqr(black_box(&a), black_box(&b)))
        });
        c.bench_function(&format!("l2_sqr_scalar_{}", dim), |bench| {
            bench.iter(|| l2_sqr_scalar(black_box(&a), black_box(&b)))
        });
    }
}

criterion_group!(benches, bench_l2_sqr);
criterion_main!(benches);
