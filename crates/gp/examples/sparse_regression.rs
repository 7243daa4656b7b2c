use log::info;
use ndarray::{Array, Axis};
use ndarray_rand::RandomExt;
use ndarray_rand::rand::SeedableRng;
use ndarray_rand::rand_distr::{Normal, Uniform};
use rand_xoshiro::Xoshiro256Plus;
use vgpr_gp::kernels::SquaredExponential;
use vgpr_gp::metrics::ErrorMethod;
use vgpr_gp::{GpModel, Inducings, Titsias};

const LEARNING_RATE: f64 = 0.01;
const ITERATIONS: usize = 200;

fn main() {
    env_logger::init();

    let mut rng = Xoshiro256Plus::seed_from_u64(0);
    let nt = 500;
    let xt = Array::random_using((nt, 1), Uniform::new(-1., 1.), &mut rng);
    let noise = Array::random_using(nt, Normal::new(0., 0.1).expect("valid std"), &mut rng);
    let yt = xt.column(0).mapv(|x: f64| 1. + 3. * x + (6. * x).sin()) + noise;

    let mut gp = Titsias::params(SquaredExponential::new(1))
        .variance(0.1)
        .inducings(Inducings::Randomized(30))
        .seed(Some(42))
        .build(&xt, &yt)
        .expect("Titsias GP built");

    for i in 0..ITERATIONS {
        let loss = gp.loss().expect("loss computed");
        let theta = gp.parameters() - loss.gradient * LEARNING_RATE;
        gp.set_parameters(&theta).expect("parameters updated");
        if i % 20 == 0 {
            info!("iteration {i}: elbo = {}", -loss.value);
        }
    }
    gp.print_parameters();

    let xtest = Array::linspace(-1., 1., 100).insert_axis(Axis(1));
    let ytest = xtest.column(0).mapv(|x: f64| 1. + 3. * x + (6. * x).sin());
    let (mu, var) = gp.predict(&xtest, false, true).expect("prediction");
    let rmse = gp
        .error(&xtest, &ytest, ErrorMethod::Rmse)
        .expect("error computed");
    println!("elbo = {}", gp.elbo().expect("elbo computed"));
    println!("rmse = {rmse}");
    println!("mean prediction at 0: {} (variance {})", mu[[50, 0]], var[[50, 0]]);
}
