use std::time::Duration;

use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use ndarray::Array1;
use ndarray_rand::RandomExt;
use ndarray_rand::rand_distr::{Normal, Uniform};
use photcal::mixture::fit_zeropoint;
use photcal::{
    Calibrator, LocalBackend, MatchedPairs, ObservedCatalog, QueryBackend, ReferenceCatalog,
    Survey, SurveyRegistry,
};

fn pairs(n: usize) -> MatchedPairs {
    let cat_mag = Array1::random(n, Uniform::new(14., 19.));
    let mut obs_mag = &cat_mag + 24. + Array1::random(n, Normal::new(0., 0.03).unwrap());
    // A tenth of the stars are mismatches.
    obs_mag
        .iter_mut()
        .step_by(10)
        .zip(Array1::random(n.div_ceil(10), Uniform::new(-3., 3.)))
        .for_each(|(o, shift)| *o += shift);
    MatchedPairs::new(
        obs_mag,
        Array1::from_elem(n, 0.01),
        cat_mag,
        Array1::from_elem(n, 0.02),
    )
    .unwrap()
}

fn field(n: usize) -> (ObservedCatalog, ReferenceCatalog) {
    let ra = Array1::random(n, Uniform::new(150., 150.5));
    let dec = Array1::random(n, Uniform::new(2., 2.5));
    let cat_mag = Array1::random(n, Uniform::new(14., 19.));
    let err = Array1::from_elem(n, 0.02);
    let obs_mag = &cat_mag + 24. + Array1::random(n, Normal::new(0., 0.05).unwrap());
    let observed = ObservedCatalog::new(ra.clone(), dec.clone(), obs_mag, err.clone()).unwrap();
    let reference = ReferenceCatalog::new(ra, dec, vec![cat_mag], vec![err]).unwrap();
    (observed, reference)
}

fn fit_benchmark(c: &mut Criterion) {
    let mut fit = c.benchmark_group("fit");
    fit.sample_size(20);

    for n in [100, 1000] {
        let pairs = pairs(n);
        fit.bench_function(format!("zeropoint {n}"), |b| {
            b.iter(|| fit_zeropoint(&pairs, 0.1))
        });
    }
}

fn match_benchmark(c: &mut Criterion) {
    let mut matching = c.benchmark_group("match");
    matching.sample_size(10);

    let (observed, reference) = field(5000);
    let survey = Survey::new("BENCH", ["r"], "select 1");
    let mut backend = LocalBackend::new().with_catalog("BENCH", reference.clone());
    backend.upload(&observed).unwrap();
    matching.bench_function("cross match", |b| {
        b.iter(|| backend.cross_match(&survey, 2. / 3600., Duration::from_secs(60)))
    });

    let registry = SurveyRegistry::new(vec![survey.clone()]).unwrap();
    matching.bench_function("calibrate", |b| {
        b.iter_batched(
            || LocalBackend::new().with_catalog("BENCH", reference.clone()),
            |backend| {
                Calibrator::new(&registry, backend)
                    .without_observers()
                    .run(&observed)
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, fit_benchmark, match_benchmark);
criterion_main!(benches);
