use cannon::labels::build_label_vector;
use cannon::regression::{PixelSpectrum, ScatterGrid, regress};
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

/// Labels, flux and errors for `nstars` stars at one pixel with intrinsic scatter 0.05.
fn synthetic_pixel(nstars: usize, nlabels: usize) -> (Array2<f64>, Array1<f64>, Array1<f64>) {
    let mut rng = StdRng::seed_from_u64(0xCA11_0 + nstars as u64);
    let labels = Array2::from_shape_fn((nstars, nlabels), |_| rng.gen_range(-1.0..1.0));
    let design = build_label_vector(labels.view()).design;
    let truth = Array1::from_shape_fn(design.ncols(), |c| if c == 0 { 1.0 } else { 0.05 });
    let noise = Normal::new(0.0, 0.05).unwrap();
    let flux = design.dot(&truth).mapv(|f| f + noise.sample(&mut rng));
    let flux_err = Array1::from_elem(nstars, 0.02);
    (design, flux, flux_err)
}

fn benchmark_regress(c: &mut Criterion) {
    let grid = ScatterGrid::default();
    let mut group = c.benchmark_group("pixel_regression");
    for &(nstars, nlabels) in &[(100_usize, 3_usize), (500, 3), (500, 5)] {
        let (design, flux, flux_err) = synthetic_pixel(nstars, nlabels);
        group.throughput(Throughput::Elements(nstars as u64));
        group.bench_with_input(
            BenchmarkId::new(format!("{nlabels}_labels"), nstars),
            &(design, flux, flux_err),
            |b, (design, flux, flux_err)| {
                b.iter(|| {
                    let spectrum = PixelSpectrum {
                        pixel: 0,
                        flux: flux.view(),
                        flux_err: flux_err.view(),
                    };
                    let fit = regress(black_box(design.view()), &spectrum, &grid);
                    black_box(fit.map(|f| f.scatter).ok());
                });
            },
        );
    }
    group.finish();
}

criterion_group!(pixel_regression, benchmark_regress);
criterion_main!(pixel_regression);
