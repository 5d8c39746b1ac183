use criterion::{Criterion, criterion_group, criterion_main};
use rh_validate::{ImageArray, ScaleThresholdPolicy, check_thresholds, compare_arrays};
use std::hint::black_box;

#[allow(clippy::cast_precision_loss)]
fn image(len: usize, factor: f32) -> ImageArray {
    ImageArray::from_vec((0..len).map(|i| ((i % 997) as f32 + 1.0) * factor).collect())
}

fn benchmark_metrics(c: &mut Criterion) {
    let reference = image(256 * 256 * 16, 1.0);
    let output = image(256 * 256 * 16, 1.001);

    c.bench_function("validate/compare_1m_elements", |b| {
        b.iter(|| {
            let metrics = compare_arrays(black_box(&output), black_box(&reference))
                .expect("equal-length arrays should compare");
            check_thresholds(&metrics, 0.01, 0.01, ScaleThresholdPolicy::Legacy)
                .expect("metrics benchmark input should pass");
        });
    });
}

criterion_group!(metrics_benches, benchmark_metrics);
criterion_main!(metrics_benches);
