use criterion::{Criterion, criterion_group, criterion_main};
use ndarray::{Array, Array2, Axis};
use ndarray_rand::RandomExt;
use ndarray_rand::rand::SeedableRng;
use ndarray_rand::rand_distr::Uniform;
use rand_xoshiro::Xoshiro256Plus;
use vgpr_gp::kernels::SquaredExponential;
use vgpr_gp::likelihoods::{GaussianLikelihood, PoissonLikelihood};
use vgpr_gp::{Exact, GpModel, Inducings, OpperArchambeau, SparseHensman, Snelson, Titsias};

fn training_data(nt: usize) -> (Array2<f64>, Array2<f64>) {
    let mut rng = Xoshiro256Plus::seed_from_u64(42);
    let xt = Array::random_using((nt, 1), Uniform::new(-1., 1.), &mut rng);
    let yt = xt.mapv(|x| 1. + 3. * x + (6. * x).sin());
    (xt, yt)
}

fn criterion_loss(c: &mut Criterion) {
    let nts = [100, 400];

    let mut group = c.benchmark_group("loss");
    group.sample_size(20);
    for nt in nts {
        let (xt, yt) = training_data(nt);
        let counts = yt.mapv(|y| y.exp().round());

        let exact = Exact::params(SquaredExponential::new(1))
            .variance(0.01)
            .build(&xt, &yt)
            .expect("Exact GP built");
        group.bench_function(format!("exact {nt}"), |b| {
            b.iter(|| std::hint::black_box(exact.loss().expect("loss")))
        });

        let fitc = Snelson::params(SquaredExponential::new(1))
            .variance(0.01)
            .inducings(Inducings::Grid(20))
            .build(&xt, &yt)
            .expect("Snelson GP built");
        group.bench_function(format!("snelson {nt}"), |b| {
            b.iter(|| std::hint::black_box(fitc.loss().expect("loss")))
        });

        let vfe = Titsias::params(SquaredExponential::new(1))
            .variance(0.01)
            .inducings(Inducings::Grid(20))
            .build(&xt, &yt)
            .expect("Titsias GP built");
        group.bench_function(format!("titsias {nt}"), |b| {
            b.iter(|| std::hint::black_box(vfe.loss().expect("loss")))
        });

        let svgp = SparseHensman::params(SquaredExponential::new(1), PoissonLikelihood::new())
            .inducings(Some(Inducings::Grid(20)))
            .build(&xt, &counts)
            .expect("SparseHensman GP built");
        group.bench_function(format!("sparse hensman {nt}"), |b| {
            b.iter(|| std::hint::black_box(svgp.loss().expect("loss")))
        });
    }
    group.finish();
}

fn criterion_predict(c: &mut Criterion) {
    let (xt, yt) = training_data(200);
    let xs = Array::linspace(-1., 1., 500).insert_axis(Axis(1));

    let mut group = c.benchmark_group("predict");
    group.sample_size(20);

    let exact = Exact::params(SquaredExponential::new(1))
        .variance(0.01)
        .build(&xt, &yt)
        .expect("Exact GP built");
    group.bench_function("exact", |b| {
        b.iter(|| std::hint::black_box(exact.predict(&xs, false, true).expect("prediction")))
    });

    let oa = OpperArchambeau::params(
        SquaredExponential::new(1),
        GaussianLikelihood::new(0.01).expect("valid variance"),
    )
    .build(&xt, &yt)
    .expect("OpperArchambeau GP built");
    group.bench_function("opper archambeau", |b| {
        b.iter(|| std::hint::black_box(oa.predict(&xs, false, true).expect("prediction")))
    });
    group.finish();
}

criterion_group!(benches, criterion_loss, criterion_predict);
criterion_main!(benches);
