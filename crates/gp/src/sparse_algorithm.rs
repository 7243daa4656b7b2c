use crate::autodiff::{Tape, Var};
use crate::errors::{GpError, Result};
use crate::kernels::Kernel;
use crate::likelihoods::{GaussianLikelihood, Likelihood, NoiseKind};
use crate::model::{GpBase, GpModel, check_unique_names, clamp_variance, column_norms2};
use crate::parameter::{Parameter, Parametrized};
use crate::parameters::{Inducings, SparseParams, SparseValidParams};
use crate::utils::init_inducing_points;

use linfa::{Float, ParamGuard};
use log::debug;
use ndarray::{Array2, ArrayBase, Data, Dimension};
use ndarray_rand::rand::SeedableRng;
use rand_xoshiro::Xoshiro256Plus;

/// Name of the inducing point locations in the parameter registry
pub const INDUCING_POINTS: &str = "inducing_points";

/// Inducing point locations of a sparse model as a parameter.
///
/// With a multi-output kernel the channel column is not counted as trainable.
pub(crate) fn inducing_parameter<F: Float>(
    base: &GpBase<F>,
    inducings: &Inducings<F>,
    train: bool,
    seed: Option<u64>,
) -> Result<Parameter<F>> {
    let mut rng = match seed {
        Some(seed) => Xoshiro256Plus::seed_from_u64(seed),
        None => Xoshiro256Plus::from_entropy(),
    };
    let output_dims = base.kernel().output_dims();
    let z = init_inducing_points(inducings, base.x(), output_dims, &mut rng)?;
    let z = base.check_input(&z)?;
    let m = z.nrows();
    let mut param = Parameter::new(INDUCING_POINTS, z);
    if output_dims > 1 {
        param.set_num_parameters(param.num_parameters() - m);
    }
    param.set_trainable(train);
    Ok(param)
}

/// Low rank quantities shared by the evidence and the prediction of
/// [Snelson] and [Titsias]
struct LowRank<'t, F: Float> {
    /// Cholesky factor of `Kuu`
    luu: Var<'t, F>,
    /// Cholesky factor of `V G Vᵀ + I` with `V = Luu⁻¹ Kuf`
    l: Var<'t, F>,
    /// `L⁻¹ V G y`
    c: Var<'t, F>,
}

/// A sparse Gaussian process regression with a gaussian likelihood and
/// inducing points based on Snelson and Ghahramani (FITC).
///
/// The training outputs are assumed independent given the inducing values:
///
/// `y ~ N(m(X), Qff + diag(Kff - Qff) + σ²I)` with `Qff = Kfu Kuu⁻¹ Kuf`
///
/// The noise variance can be shared or given per output channel.
///
/// # Reference
///
/// E. Snelson, Z. Ghahramani, [Sparse Gaussian Processes using
/// Pseudo-inputs](https://proceedings.neurips.cc/paper/2005/file/4491777b1aa8b5b32c2e8666dbe1a495-Paper.pdf), 2005
#[derive(Debug)]
pub struct Snelson<F: Float> {
    base: GpBase<F>,
    likelihood: GaussianLikelihood<F>,
    z: Parameter<F>,
}

impl<F: Float> Snelson<F> {
    /// Sparse GP parameters given a kernel
    pub fn params(kernel: impl Kernel<F> + 'static) -> SparseParams<F, Snelson<F>> {
        SparseParams::new(kernel).name("Snelson")
    }

    /// Build the model from validated parameters and training data
    pub fn new<D1: Dimension, D2: Dimension>(
        params: SparseValidParams<F>,
        x: &ArrayBase<impl Data<Elem = F>, D1>,
        y: &ArrayBase<impl Data<Elem = F>, D2>,
    ) -> Result<Snelson<F>> {
        let SparseValidParams {
            kernel,
            mean,
            variance,
            jitter,
            name,
            inducings,
            train_inducings,
            seed,
        } = params;
        let likelihood = variance.likelihood(kernel.output_dims())?;
        let name = name.unwrap_or_else(|| "Snelson".to_string());
        let base = GpBase::new(&name, kernel, mean, x, y, jitter)?;
        base.check_likelihood(&likelihood)?;
        let z = inducing_parameter(&base, &inducings, train_inducings, seed)?;
        let model = Snelson {
            base,
            likelihood,
            z,
        };
        check_unique_names(&model)?;
        debug!(
            "{}: {} training points, {} inducing points",
            model.base.name(),
            model.base.x().nrows(),
            model.z.dim().0
        );
        Ok(model)
    }

    /// Gaussian likelihood
    pub fn likelihood(&self) -> &GaussianLikelihood<F> {
        &self.likelihood
    }

    /// Inducing point locations (m, d)
    pub fn inducing_points(&self) -> &Parameter<F> {
        &self.z
    }

    /// Low rank factors with the FITC diagonal `g = diag(Kff - Qff) + σ²` and
    /// the centered outputs
    fn low_rank<'t>(&self, tape: &'t Tape<F>) -> Result<(LowRank<'t, F>, Var<'t, F>, Var<'t, F>)> {
        let kernel = self.base.kernel();
        let x = tape.constant(self.base.x().to_owned());
        let z = tape.parameter(&self.z);
        let m = self.z.dim().0;
        let y = self.base.centered_y(tape);

        let kff_diag = kernel.k_diag(tape, x);
        let kuf = kernel.k(tape, z, Some(x));
        let kuu = kernel.k(tape, z, None);

        let luu = self.cholesky_on(kuu, true)?;
        let v = luu.solve_lower(kuf)?;
        let g = kff_diag - column_norms2(v) + self.likelihood.scale_at(tape, self.base.x())?;
        let vg = v / g.t();
        let l = self.cholesky_on(vg.matmul(v.t()) + tape.eye(m), false)?;
        let c = l.solve_lower(vg.matmul(y))?;
        Ok((LowRank { luu, l, c }, g, y))
    }
}

impl<F: Float> SparseParams<F, Snelson<F>> {
    /// Build a [Snelson] model on the training data
    pub fn build<D1: Dimension, D2: Dimension>(
        self,
        x: &ArrayBase<impl Data<Elem = F>, D1>,
        y: &ArrayBase<impl Data<Elem = F>, D2>,
    ) -> Result<Snelson<F>> {
        Snelson::new(self.check()?, x, y)
    }
}

impl<F: Float> Parametrized<F> for Snelson<F> {
    fn collect_parameters<'a>(&'a self, path: &str, out: &mut Vec<(String, &'a Parameter<F>)>) {
        self.base.collect_with_likelihood(&self.likelihood, path, out);
        self.z.collect_parameters(path, out);
    }

    fn collect_parameters_mut<'a>(
        &'a mut self,
        path: &str,
        out: &mut Vec<(String, &'a mut Parameter<F>)>,
    ) {
        self.base
            .collect_with_likelihood_mut(&mut self.likelihood, path, out);
        self.z.collect_parameters_mut(path, out);
    }
}

impl<F: Float> GpModel<F> for Snelson<F> {
    fn base(&self) -> &GpBase<F> {
        &self.base
    }

    /// `-½ n log 2π - Σ log diag(L) - ½ Σ log g - ½ yᵀG⁻¹y + ½ cᵀc` where
    /// `g = diag(Kff - Qff) + σ²` and `G = diag(g)`
    fn log_marginal_likelihood_on<'t>(&self, tape: &'t Tape<F>) -> Result<Var<'t, F>> {
        let n = self.base.x().nrows();
        let constant = F::cast(0.5 * n as f64 * (2. * std::f64::consts::PI).ln());
        let half = F::cast(0.5);
        let (LowRank { l, c, .. }, g, y) = self.low_rank(tape)?;

        let p = l.diag().ln().sum()
            + g.ln().sum().scale(half)
            + (y.square() / g).sum().scale(half)
            - c.square().sum().scale(half);
        Ok(-p.offset(constant))
    }

    fn predict<D: Dimension>(
        &self,
        xs: &ArrayBase<impl Data<Elem = F>, D>,
        full: bool,
        predict_y: bool,
    ) -> Result<(Array2<F>, Array2<F>)> {
        let xs = self.base.check_input(xs)?;
        let tape = Tape::no_grad();
        let (LowRank { luu, l, c }, _, _) = self.low_rank(&tape)?;
        let (mu, var) = low_rank_predict(&self.base, &tape, &self.z, &xs, luu, l, c, full)?;
        if predict_y {
            self.likelihood.predict(mu, var, full, &xs)
        } else {
            Ok((mu, var))
        }
    }
}

/// Predictive moments `μ = bᵀc` and `Σ = Kss - aᵀa + bᵀb` where
/// `a = Luu⁻¹ Kus` and `b = L⁻¹ a`
#[allow(clippy::too_many_arguments)]
fn low_rank_predict<'t, F: Float>(
    base: &GpBase<F>,
    tape: &'t Tape<F>,
    z: &Parameter<F>,
    xs: &Array2<F>,
    luu: Var<'t, F>,
    l: Var<'t, F>,
    c: Var<'t, F>,
    full: bool,
) -> Result<(Array2<F>, Array2<F>)> {
    let kernel = base.kernel();
    let z = tape.parameter(z);
    let xs_var = tape.constant(xs.to_owned());
    let kus = kernel.k(tape, z, Some(xs_var));
    let a = luu.solve_lower(kus)?;
    let b = l.solve_lower(a)?;

    let mu = b.t().matmul(c).value() + base.mean_at(xs);
    let var = if full {
        (kernel.k(tape, xs_var, None) - a.t().matmul(a) + b.t().matmul(b)).value()
    } else {
        (kernel.k_diag(tape, xs_var) - column_norms2(a) + column_norms2(b)).value()
    };
    Ok((mu, clamp_variance(var, full)))
}

/// A sparse Gaussian process regression with a gaussian likelihood based on
/// the variational free energy bound of Titsias (VFE).
///
/// The evidence lower bound is
///
/// `log N(y | m(X), Qff + σ²I) - tr(Kff - Qff) / 2σ²`
///
/// which never exceeds the exact log marginal likelihood. A single noise
/// variance is shared by all observations.
///
/// # Reference
///
/// M. Titsias, [Variational learning of inducing variables in sparse
/// Gaussian processes](https://proceedings.mlr.press/v5/titsias09a.html), 2009
#[derive(Debug)]
pub struct Titsias<F: Float> {
    base: GpBase<F>,
    likelihood: GaussianLikelihood<F>,
    z: Parameter<F>,
}

impl<F: Float> Titsias<F> {
    /// Sparse GP parameters given a kernel
    pub fn params(kernel: impl Kernel<F> + 'static) -> SparseParams<F, Titsias<F>> {
        SparseParams::new(kernel).name("Titsias")
    }

    /// Build the model from validated parameters and training data
    pub fn new<D1: Dimension, D2: Dimension>(
        params: SparseValidParams<F>,
        x: &ArrayBase<impl Data<Elem = F>, D1>,
        y: &ArrayBase<impl Data<Elem = F>, D2>,
    ) -> Result<Titsias<F>> {
        let SparseValidParams {
            kernel,
            mean,
            variance,
            jitter,
            name,
            inducings,
            train_inducings,
            seed,
        } = params;
        let likelihood = variance.likelihood(kernel.output_dims())?;
        if likelihood.kind() != NoiseKind::Shared {
            return Err(GpError::InvalidValueError(
                "Titsias supports a single noise variance only".to_string(),
            ));
        }
        let name = name.unwrap_or_else(|| "Titsias".to_string());
        let base = GpBase::new(&name, kernel, mean, x, y, jitter)?;
        base.check_likelihood(&likelihood)?;
        let z = inducing_parameter(&base, &inducings, train_inducings, seed)?;
        let model = Titsias {
            base,
            likelihood,
            z,
        };
        check_unique_names(&model)?;
        debug!(
            "{}: {} training points, {} inducing points",
            model.base.name(),
            model.base.x().nrows(),
            model.z.dim().0
        );
        Ok(model)
    }

    /// Gaussian likelihood
    pub fn likelihood(&self) -> &GaussianLikelihood<F> {
        &self.likelihood
    }

    /// Inducing point locations (m, d)
    pub fn inducing_points(&self) -> &Parameter<F> {
        &self.z
    }

    /// Evidence lower bound, same as [GpModel::log_marginal_likelihood]
    pub fn elbo(&self) -> Result<F> {
        self.log_marginal_likelihood()
    }

    /// `Luu`, `V = Luu⁻¹ Kuf`, `L = chol(V Vᵀ / σ² + I)` and `c = L⁻¹ V y / σ²`
    fn low_rank<'t>(&self, tape: &'t Tape<F>) -> Result<(LowRank<'t, F>, Var<'t, F>)> {
        let kernel = self.base.kernel();
        let x = tape.constant(self.base.x().to_owned());
        let z = tape.parameter(&self.z);
        let m = self.z.dim().0;
        let sigma2 = tape.parameter(self.likelihood.scale());
        let y = self.base.centered_y(tape);

        let kuf = kernel.k(tape, z, Some(x));
        let kuu = kernel.k(tape, z, None);
        let luu = self.cholesky_on(kuu, true)?;
        let v = luu.solve_lower(kuf)?;
        let l = self.cholesky_on(v.matmul(v.t()) / sigma2 + tape.eye(m), false)?;
        let c = l.solve_lower(v.matmul(y))? / sigma2;
        Ok((LowRank { luu, l, c }, v))
    }
}

impl<F: Float> SparseParams<F, Titsias<F>> {
    /// Build a [Titsias] model on the training data
    pub fn build<D1: Dimension, D2: Dimension>(
        self,
        x: &ArrayBase<impl Data<Elem = F>, D1>,
        y: &ArrayBase<impl Data<Elem = F>, D2>,
    ) -> Result<Titsias<F>> {
        Titsias::new(self.check()?, x, y)
    }
}

impl<F: Float> Parametrized<F> for Titsias<F> {
    fn collect_parameters<'a>(&'a self, path: &str, out: &mut Vec<(String, &'a Parameter<F>)>) {
        self.base.collect_with_likelihood(&self.likelihood, path, out);
        self.z.collect_parameters(path, out);
    }

    fn collect_parameters_mut<'a>(
        &'a mut self,
        path: &str,
        out: &mut Vec<(String, &'a mut Parameter<F>)>,
    ) {
        self.base
            .collect_with_likelihood_mut(&mut self.likelihood, path, out);
        self.z.collect_parameters_mut(path, out);
    }
}

impl<F: Float> GpModel<F> for Titsias<F> {
    fn base(&self) -> &GpBase<F> {
        &self.base
    }

    /// `-½ n log 2π - Σ log diag(L) - ½ n log σ² - ½ yᵀy / σ² + ½ cᵀc
    /// - ½ (tr(Kff) - tr(Q)) / σ²` with `Q = V Vᵀ`
    fn log_marginal_likelihood_on<'t>(&self, tape: &'t Tape<F>) -> Result<Var<'t, F>> {
        let n = self.base.x().nrows();
        let constant = F::cast(0.5 * n as f64 * (2. * std::f64::consts::PI).ln());
        let half = F::cast(0.5);

        let x = tape.constant(self.base.x().to_owned());
        let kff_diag = self.base.kernel().k_diag(tape, x);
        let sigma2 = tape.parameter(self.likelihood.scale());
        let y = self.base.centered_y(tape);
        let (LowRank { l, c, .. }, v) = self.low_rank(tape)?;

        let p = l.diag().ln().sum()
            + sigma2.ln().scale(half * F::cast(n))
            + (y.square().sum() / sigma2).scale(half)
            - c.square().sum().scale(half)
            + ((kff_diag.sum() - v.square().sum()) / sigma2).scale(half);
        Ok(-p.offset(constant))
    }

    fn predict<D: Dimension>(
        &self,
        xs: &ArrayBase<impl Data<Elem = F>, D>,
        full: bool,
        predict_y: bool,
    ) -> Result<(Array2<F>, Array2<F>)> {
        let xs = self.base.check_input(xs)?;
        let tape = Tape::no_grad();
        let (LowRank { luu, l, c }, _) = self.low_rank(&tape)?;
        let (mu, var) = low_rank_predict(&self.base, &tape, &self.z, &xs, luu, l, c, full)?;
        if predict_y {
            self.likelihood.predict(mu, var, full, &xs)
        } else {
            Ok((mu, var))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::{IndependentOutputs, SquaredExponential};
    use crate::mean_models::LinearMean;
    use crate::model::check_loss_gradient;
    use crate::{Exact, GpError};
    use approx::assert_abs_diff_eq;
    use ndarray::{Array, Array1, Axis, array, concatenate};
    use ndarray_rand::RandomExt;
    use ndarray_rand::rand::Rng;
    use ndarray_rand::rand_distr::{Normal, Uniform};

    fn make_test_data(
        nt: usize,
        eta2: f64,
        rng: &mut Xoshiro256Plus,
    ) -> (Array2<f64>, Array1<f64>) {
        let normal = Normal::new(0., eta2.sqrt()).unwrap();
        let gaussian_noise = Array::<f64, _>::random_using((nt,), normal, rng);
        let xt = 2. * Array::<f64, _>::random_using((nt, 1), Uniform::new(0., 1.), rng) - 1.;
        let yt = xt.column(0).mapv(|x| 1. + 3. * x + (6. * x).sin()) + gaussian_noise;
        (xt, yt)
    }

    fn kernel(variance: f64, lengthscale: f64) -> SquaredExponential<f64> {
        SquaredExponential::new(1)
            .with_variance(variance)
            .unwrap()
            .with_lengthscale(&[lengthscale])
            .unwrap()
    }

    #[test]
    fn test_inducing_points_at_data_match_exact() {
        let xt = array![[0.], [1.], [2.], [3.]];
        let yt = array![0.1, 0.9, -0.2, 1.1];
        let exact = Exact::params(kernel(1., 1.))
            .variance(0.1)
            .build(&xt, &yt)
            .unwrap()
            .log_marginal_likelihood()
            .unwrap();
        let fitc = Snelson::params(kernel(1., 1.))
            .variance(0.1)
            .inducings(Inducings::Located(xt.to_owned()))
            .train_inducings(false)
            .build(&xt, &yt)
            .unwrap()
            .log_marginal_likelihood()
            .unwrap();
        let vfe = Titsias::params(kernel(1., 1.))
            .variance(0.1)
            .inducings(Inducings::Located(xt.to_owned()))
            .train_inducings(false)
            .build(&xt, &yt)
            .unwrap()
            .elbo()
            .unwrap();
        assert_abs_diff_eq!(fitc, exact, epsilon = 1e-5);
        assert_abs_diff_eq!(vfe, exact, epsilon = 1e-5);
    }

    #[test]
    fn test_titsias_bound() {
        let mut rng = Xoshiro256Plus::seed_from_u64(42);
        let (xt, yt) = make_test_data(30, 0.01, &mut rng);
        for _ in 0..20 {
            let variance = rng.gen_range(0.1..3.);
            let lengthscale = rng.gen_range(0.05..2.);
            let noise = rng.gen_range(1e-3..1.);
            let exact = Exact::params(kernel(variance, lengthscale))
                .variance(noise)
                .build(&xt, &yt)
                .unwrap()
                .log_marginal_likelihood()
                .unwrap();
            let vfe = Titsias::params(kernel(variance, lengthscale))
                .variance(noise)
                .inducings(Inducings::Randomized(5))
                .seed(Some(rng.r#gen()))
                .build(&xt, &yt)
                .unwrap()
                .elbo()
                .unwrap();
            assert!(vfe <= exact + 1e-6, "{vfe} > {exact}");
        }
    }

    #[test]
    fn test_sparse_predictions() {
        let mut rng = Xoshiro256Plus::seed_from_u64(0);
        let (xt, yt) = make_test_data(50, 0.01, &mut rng);
        let xs = Array::linspace(-1.2, 1.2, 15).insert_axis(Axis(1));

        let fitc = Snelson::params(kernel(2., 0.3))
            .variance(0.01)
            .inducings(Inducings::Grid(12))
            .build(&xt, &yt)
            .unwrap();
        let vfe = Titsias::params(kernel(2., 0.3))
            .variance(0.01)
            .inducings(Inducings::Grid(12))
            .build(&xt, &yt)
            .unwrap();
        let (mu_fitc, var_fitc) = fitc.predict(&xs, false, false).unwrap();
        let (mu_vfe, var_vfe) = vfe.predict(&xs, false, false).unwrap();
        let (_, cov_fitc) = fitc.predict(&xs, true, false).unwrap();
        let (_, cov_vfe) = vfe.predict(&xs, true, true).unwrap();

        for var in [&var_fitc, &var_vfe] {
            assert!(var.iter().all(|v| *v >= 0.));
        }
        assert!(cov_fitc.diag().iter().all(|v| *v >= 0.));
        assert!(cov_vfe.diag().iter().all(|v| *v >= 0.01));
        assert_abs_diff_eq!(cov_fitc.diag(), var_fitc.column(0), epsilon = 1e-9);

        // both approximations follow the data within the sampled range
        let x_in = array![[-0.5], [0.], [0.5]];
        let truth = x_in.column(0).mapv(|x: f64| 1. + 3. * x + (6. * x).sin());
        for model_mu in [
            fitc.predict(&x_in, false, false).unwrap().0,
            vfe.predict(&x_in, false, false).unwrap().0,
        ] {
            assert_abs_diff_eq!(model_mu.column(0), truth, epsilon = 0.2);
        }
        assert_eq!(mu_fitc.dim(), (15, 1));
        assert_eq!(mu_vfe.dim(), (15, 1));
    }

    #[test]
    fn test_sparse_registry() {
        let xt = array![[0.], [1.], [2.], [3.]];
        let yt = array![0.1, 0.9, -0.2, 1.1];
        let gp = Snelson::params(SquaredExponential::new(1))
            .inducings(Inducings::Grid(3))
            .mean(LinearMean::new(1))
            .build(&xt, &yt)
            .unwrap();
        let names: Vec<_> = gp.get_parameters().into_iter().map(|(n, _)| n).collect();
        assert_eq!(
            names,
            vec![
                "SquaredExponential.variance",
                "SquaredExponential.lengthscale",
                "Gaussian.scale",
                "LinearMean.bias",
                "LinearMean.weight",
                "inducing_points",
            ]
        );
        assert_abs_diff_eq!(
            gp.inducing_points().value(),
            array![[0.], [1.5], [3.]]
        );
        assert_eq!(gp.num_parameters(), 8);
    }

    #[test]
    fn test_multi_output_inducing_points() {
        let x = concatenate(
            Axis(1),
            &[
                array![[0.], [0.], [0.], [1.], [1.]].view(),
                array![[0.], [1.], [2.], [5.], [6.]].view(),
            ],
        )
        .unwrap();
        let y = array![0.1, 0.4, 0.2, -0.3, 0.2];
        let kernel = IndependentOutputs::new(SquaredExponential::new(1), 2).unwrap();
        let gp = Snelson::params(kernel)
            .variance_per_channel(array![0.1, 0.2])
            .inducings(Inducings::GridPerChannel(vec![3, 2]))
            .build(&x, &y)
            .unwrap();
        assert_abs_diff_eq!(
            gp.inducing_points().value(),
            array![[0., 0.], [0., 1.], [0., 2.], [1., 5.], [1., 6.]]
        );
        assert_eq!(gp.inducing_points().num_parameters(), 5);
        let (_, var) = gp.predict(&x, false, true).unwrap();
        assert!(var.iter().all(|v| *v > 0.));
    }

    #[test]
    fn test_titsias_single_noise() {
        let x = concatenate(
            Axis(1),
            &[array![[0.], [1.]].view(), array![[0.], [1.]].view()],
        )
        .unwrap();
        let kernel = IndependentOutputs::new(SquaredExponential::new(1), 2).unwrap();
        let res = Titsias::params(kernel)
            .variance_per_channel(array![0.1, 0.2])
            .build(&x, &array![0., 1.]);
        assert!(matches!(res, Err(GpError::InvalidValueError(_))));
    }

    #[test]
    fn test_sparse_loss_gradients() {
        let xt = array![[0.], [0.7], [1.5], [2.2], [3.]];
        let yt = array![0.1, 0.9, -0.2, 0.4, 1.1];
        check_loss_gradient(
            || {
                Snelson::params(kernel(1.2, 0.8))
                    .variance(0.2)
                    .inducings(Inducings::Located(array![[0.3], [1.4], [2.6]]))
                    .build(&xt, &yt)
                    .unwrap()
            },
            1e-5,
        );
        check_loss_gradient(
            || {
                Titsias::params(kernel(1.2, 0.8))
                    .variance(0.2)
                    .inducings(Inducings::Located(array![[0.3], [1.4], [2.6]]))
                    .build(&xt, &yt)
                    .unwrap()
            },
            1e-5,
        );
    }
}
