use criterion::{black_box, criterion_group, criterion_main, Criterion};

use orpheus_daq::cavity::{flmn, StepCalibration};

pub fn step_conversions(c: &mut Criterion) {
    c.bench_function("step conversions", |b| {
        let calib = StepCalibration::default();
        b.iter(|| {
            let mut total: i64 = 0;
            for i in 0..1000 {
                let d = f64::from(i) * 1.0e-3;
                total += i64::from(calib.plate_steps(black_box(d), 0.125));
                total += i64::from(calib.mirror_steps(black_box(-d)));
            }
            black_box(total);
        })
    });
}

pub fn mode_frequencies(c: &mut Criterion) {
    c.bench_function("mode frequencies", |b| {
        b.iter(|| {
            let mut acc = 0.0;
            for l in 0..3 {
                for m in 0..3 {
                    for n in 10..40 {
                        acc += flmn(l, m, n, black_box(32.5), 1.0, 33.0).unwrap_or(0.0);
                    }
                }
            }
            black_box(acc);
        })
    });
}

criterion_group!(benches, step_conversions, mode_frequencies);
criterion_main!(benches);
