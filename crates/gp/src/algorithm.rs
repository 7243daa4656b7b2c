use crate::autodiff::{Tape, Var};
use crate::errors::{GpError, Result};
use crate::kernels::Kernel;
use crate::likelihoods::{GaussianLikelihood, Likelihood, NoiseKind};
use crate::model::{GpBase, GpModel, check_unique_names, clamp_variance, column_norms2};
use crate::parameter::{Parameter, Parametrized};
use crate::parameters::{ExactParams, ExactValidParams};

use linfa::{Float, ParamGuard};
use log::debug;
use ndarray::{Array2, ArrayBase, Data, Dimension};

/// Gaussian process regression with a gaussian likelihood, which allows for
/// exact inference.
///
/// The observations are modeled as
///
/// `y ~ N(m(X), K + σ²I)`
///
/// where:
/// * `m(X)` is the optional mean function at the training inputs,
/// * `K` the kernel matrix of the training inputs,
/// * `σ²` the noise variance, shared, given per output channel of a
///   multi-output kernel, or fixed per training observation.
///
/// # Example
///
/// ```no_run
/// use vgpr_gp::{kernels::SquaredExponential, Exact, GpModel};
/// use ndarray::{array, Array};
///
/// let xt = array![0., 1., 2., 3., 4.];
/// let yt = xt.mapv(|x: f64| x.sin());
///
/// let mut gp = Exact::params(SquaredExponential::new(1))
///     .variance(0.01)
///     .build(&xt, &yt)
///     .expect("GP built");
///
/// // one gradient descent step on the unconstrained parameters
/// let loss = gp.loss().expect("loss computed");
/// let theta = gp.parameters() - loss.gradient * 0.01;
/// gp.set_parameters(&theta).expect("parameters updated");
///
/// let xtest = Array::linspace(0., 4., 9);
/// let (mu, var) = gp.predict(&xtest, false, true).expect("GP prediction");
/// ```
#[derive(Debug)]
pub struct Exact<F: Float> {
    base: GpBase<F>,
    likelihood: GaussianLikelihood<F>,
}

impl<F: Float> Exact<F> {
    /// Exact GP parameters given a kernel
    pub fn params(kernel: impl Kernel<F> + 'static) -> ExactParams<F> {
        ExactParams::new(kernel)
    }

    /// Build the model from validated parameters and training data
    pub fn new<D1: Dimension, D2: Dimension>(
        params: ExactValidParams<F>,
        x: &ArrayBase<impl Data<Elem = F>, D1>,
        y: &ArrayBase<impl Data<Elem = F>, D2>,
    ) -> Result<Exact<F>> {
        let ExactValidParams {
            kernel,
            mean,
            variance,
            jitter,
            name,
        } = params;
        let likelihood = variance.likelihood(kernel.output_dims())?;
        let base = GpBase::new(&name, kernel, mean, x, y, jitter)?;
        base.check_likelihood(&likelihood)?;
        let model = Exact { base, likelihood };
        check_unique_names(&model)?;
        debug!(
            "{}: {} training points, {} trainable values",
            model.base.name(),
            model.base.x().nrows(),
            model.num_parameters()
        );
        Ok(model)
    }

    /// Gaussian likelihood
    pub fn likelihood(&self) -> &GaussianLikelihood<F> {
        &self.likelihood
    }

    /// Mutable gaussian likelihood
    pub fn likelihood_mut(&mut self) -> &mut GaussianLikelihood<F> {
        &mut self.likelihood
    }

    /// `K(X, X) + diag(σ²)` recorded on `tape`
    fn noisy_kff<'t>(&self, tape: &'t Tape<F>) -> Result<Var<'t, F>> {
        let x = tape.constant(self.base.x().to_owned());
        let kff = self.base.kernel().k(tape, x, None);
        let noise = self.likelihood.scale_at(tape, self.base.x())?;
        Ok(kff + noise.diagflat())
    }
}

impl<F: Float> ExactParams<F> {
    /// Build an [Exact] model on the training data
    pub fn build<D1: Dimension, D2: Dimension>(
        self,
        x: &ArrayBase<impl Data<Elem = F>, D1>,
        y: &ArrayBase<impl Data<Elem = F>, D2>,
    ) -> Result<Exact<F>> {
        Exact::new(self.check()?, x, y)
    }
}

impl<F: Float> Parametrized<F> for Exact<F> {
    fn collect_parameters<'a>(&'a self, path: &str, out: &mut Vec<(String, &'a Parameter<F>)>) {
        self.base.collect_with_likelihood(&self.likelihood, path, out);
    }

    fn collect_parameters_mut<'a>(
        &'a mut self,
        path: &str,
        out: &mut Vec<(String, &'a mut Parameter<F>)>,
    ) {
        self.base
            .collect_with_likelihood_mut(&mut self.likelihood, path, out);
    }
}

impl<F: Float> GpModel<F> for Exact<F> {
    fn base(&self) -> &GpBase<F> {
        &self.base
    }

    /// `-½ n log 2π - Σ log diag(L) - ½ yᵀ(K + σ²I)⁻¹y` with `LLᵀ = K + σ²I`
    fn log_marginal_likelihood_on<'t>(&self, tape: &'t Tape<F>) -> Result<Var<'t, F>> {
        let n = self.base.x().nrows();
        let constant = F::cast(0.5 * n as f64 * (2. * std::f64::consts::PI).ln());

        let l = self.cholesky_on(self.noisy_kff(tape)?, true)?;
        let y = self.base.centered_y(tape);
        let alpha = l.solve_lower(y)?;

        let p = l.diag().ln().sum() + alpha.square().sum().scale(F::cast(0.5));
        Ok(-p.offset(constant))
    }

    fn predict<D: Dimension>(
        &self,
        xs: &ArrayBase<impl Data<Elem = F>, D>,
        full: bool,
        predict_y: bool,
    ) -> Result<(Array2<F>, Array2<F>)> {
        if predict_y && self.likelihood.kind() == NoiseKind::PerDataPoint {
            return Err(GpError::UsageError(
                "can only predict function values when data point variances are given, \
                 set predict_y to false"
                    .to_string(),
            ));
        }
        let xs = self.base.check_input(xs)?;
        let tape = Tape::no_grad();
        let kernel = self.base.kernel();
        let x = tape.constant(self.base.x().to_owned());
        let xs_var = tape.constant(xs.to_owned());

        let l = self.cholesky_on(self.noisy_kff(&tape)?, true)?;
        let kfs = kernel.k(&tape, x, Some(xs_var));
        let v = l.solve_lower(kfs)?;
        let alpha = l.solve_lower(self.base.centered_y(&tape))?;

        let mu = v.t().matmul(alpha).value() + self.base.mean_at(&xs);
        let var = if full {
            (kernel.k(&tape, xs_var, None) - v.t().matmul(v)).value()
        } else {
            (kernel.k_diag(&tape, xs_var) - column_norms2(v)).value()
        };
        let var = clamp_variance(var, full);
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
    use crate::kernels::{IndependentOutputs, Matern52, SquaredExponential};
    use crate::mean_models::ConstantMean;
    use crate::model::check_loss_gradient;
    use approx::assert_abs_diff_eq;
    use linfa_linalg::{cholesky::*, triangular::*};
    use ndarray::{Array1, Axis, array, concatenate};

    fn xt() -> Array1<f64> {
        array![0., 1., 2., 3.]
    }

    fn yt() -> Array1<f64> {
        array![0.1, 0.9, -0.2, 1.1]
    }

    /// `log N(y | 0, K)` by a dense factorization
    fn dense_lml(k: &Array2<f64>, y: &Array1<f64>) -> f64 {
        let n = y.len() as f64;
        let l = k.cholesky().unwrap();
        let alpha = l
            .solve_triangular(&y.to_owned().insert_axis(Axis(1)), UPLO::Lower)
            .unwrap();
        let logdet = 2. * l.diag().mapv(f64::ln).sum();
        -0.5 * alpha.mapv(|v| v * v).sum() - 0.5 * logdet - 0.5 * n * (2. * std::f64::consts::PI).ln()
    }

    #[test]
    fn test_exact_lml_reference() {
        let gp = Exact::params(SquaredExponential::new(1))
            .variance(0.1)
            .build(&xt(), &yt())
            .unwrap();
        // closed form value including the default relative jitter
        assert_abs_diff_eq!(
            gp.log_marginal_likelihood().unwrap(),
            -5.831083065496145,
            epsilon = 1e-10
        );
    }

    #[test]
    fn test_exact_lml_dense() {
        let x = array![[0.1, 0.5], [0.7, 0.2], [0.4, 0.9], [0.95, 0.8], [0.3, 0.3]];
        let y = array![0.3, -0.1, 0.8, 0.5, 0.0];
        let kernel = Matern52::new(2)
            .with_variance(1.7)
            .unwrap()
            .with_lengthscale(&[0.4, 0.9])
            .unwrap();
        let gp = Exact::params(kernel).variance(0.05).build(&x, &y).unwrap();
        let mut k = gp.k(&x, None::<&Array2<f64>>).unwrap();
        k.diag_mut().mapv_inplace(|v| v + 0.05);
        let shift = gp.base().jitter() * k.diag().sum() / 5.;
        k.diag_mut().mapv_inplace(|v| v + shift);
        assert_abs_diff_eq!(
            gp.log_marginal_likelihood().unwrap(),
            dense_lml(&k, &y),
            epsilon = 1e-10
        );
    }

    #[test]
    fn test_exact_mean_function() {
        let gp = Exact::params(SquaredExponential::new(1))
            .variance(0.1)
            .mean(ConstantMean::new(2.))
            .build(&xt(), &(yt() + 2.))
            .unwrap();
        assert_abs_diff_eq!(
            gp.log_marginal_likelihood().unwrap(),
            -5.831083065496145,
            epsilon = 1e-10
        );
        let (mu, _) = gp.predict(&array![100.], false, false).unwrap();
        assert_abs_diff_eq!(mu[[0, 0]], 2., epsilon = 1e-10);
    }

    #[test]
    fn test_exact_predict() {
        let gp = Exact::params(SquaredExponential::new(1))
            .variance(1e-4)
            .build(&xt(), &yt())
            .unwrap();
        let (mu, var) = gp.predict(&xt(), false, false).unwrap();
        assert_abs_diff_eq!(mu.column(0), yt(), epsilon = 1e-3);
        assert!(var.iter().all(|v| *v >= 0. && *v < 1e-3));

        let xs = array![-1., 0.5, 1.5, 5.];
        let (mu_full, cov) = gp.predict(&xs, true, false).unwrap();
        let (mu_diag, var) = gp.predict(&xs, false, false).unwrap();
        assert_abs_diff_eq!(mu_full, mu_diag, epsilon = 1e-12);
        assert_abs_diff_eq!(cov.diag(), var.column(0), epsilon = 1e-10);

        let (_, var_y) = gp.predict(&xs, false, true).unwrap();
        assert_abs_diff_eq!(var_y, var + 1e-4, epsilon = 1e-12);
    }

    #[test]
    fn test_exact_predict_checks_input() {
        let gp = Exact::params(SquaredExponential::new(1))
            .build(&xt(), &yt())
            .unwrap();
        assert!(matches!(
            gp.predict(&array![[0., 1.]], false, false),
            Err(GpError::ShapeError(_))
        ));
    }

    #[test]
    fn test_exact_data_variance() {
        let noise = array![0.1, 0.2, 0.1, 0.3];
        let gp = Exact::params(SquaredExponential::new(1))
            .data_variance(noise.to_owned())
            .build(&xt(), &yt())
            .unwrap();
        assert!(matches!(
            gp.predict(&array![0.5], false, true),
            Err(GpError::UsageError(_))
        ));
        assert!(gp.predict(&array![0.5], false, false).is_ok());
        // fixed variances are not trained
        assert_eq!(gp.parameters().len(), 2);

        let mut k = gp.k(&xt(), None::<&Array1<f64>>).unwrap() + Array2::from_diag(&noise);
        let shift = gp.base().jitter() * k.diag().sum() / 4.;
        k.diag_mut().mapv_inplace(|v| v + shift);
        assert_abs_diff_eq!(
            gp.log_marginal_likelihood().unwrap(),
            dense_lml(&k, &yt()),
            epsilon = 1e-10
        );

        let res = Exact::params(SquaredExponential::new(1))
            .data_variance(array![0.1, 0.2])
            .build(&xt(), &yt());
        assert!(matches!(res, Err(GpError::ShapeError(_))));
    }

    #[test]
    fn test_exact_per_channel_variance() {
        let x = concatenate(
            Axis(1),
            &[
                array![[0.], [0.], [1.], [1.]].view(),
                array![[0.], [1.], [0.], [1.]].view(),
            ],
        )
        .unwrap();
        let y = array![0.1, 0.4, -0.3, 0.2];
        let kernel = IndependentOutputs::new(SquaredExponential::new(1), 2).unwrap();
        let gp = Exact::params(kernel)
            .variance_per_channel(array![0.1, 0.3])
            .build(&x, &y)
            .unwrap();
        let names: Vec<_> = gp.get_parameters().into_iter().map(|(n, _)| n).collect();
        assert_eq!(
            names,
            vec![
                "IndependentOutputs.SquaredExponential.variance",
                "IndependentOutputs.SquaredExponential.lengthscale",
                "Gaussian.scale",
            ]
        );
        let (_, var_f) = gp.predict(&x, false, false).unwrap();
        let (_, var_y) = gp.predict(&x, false, true).unwrap();
        assert_abs_diff_eq!(
            var_y - var_f,
            array![[0.1], [0.1], [0.3], [0.3]],
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_exact_rejects_invalid_channels() {
        let y = array![0.1, 0.4, -0.3];
        for c in [2., -1., 0.5, f64::NAN] {
            let x = array![[0., 0.], [1., 1.], [c, 2.]];
            let kernel = IndependentOutputs::new(SquaredExponential::new(1), 2).unwrap();
            let res = Exact::params(kernel).variance(0.1).build(&x, &y);
            assert!(matches!(res, Err(GpError::InvalidValueError(_))));
        }

        let kernel = IndependentOutputs::new(SquaredExponential::new(1), 2).unwrap();
        let gp = Exact::params(kernel)
            .variance(0.1)
            .build(&array![[0., 0.], [1., 1.], [1., 2.]], &y)
            .unwrap();
        assert!(gp.predict(&array![[1., 0.5]], false, true).is_ok());
        assert!(matches!(
            gp.predict(&array![[3., 0.5]], false, true),
            Err(GpError::InvalidValueError(_))
        ));
    }

    #[test]
    fn test_exact_loss_gradient() {
        let build = || {
            Exact::params(SquaredExponential::new(1))
                .variance(0.1)
                .mean(ConstantMean::new(0.2))
                .build(&xt(), &yt())
                .unwrap()
        };
        let gp = build();
        let loss = gp.loss().unwrap();
        assert_abs_diff_eq!(loss.value, -gp.log_marginal_likelihood().unwrap(), epsilon = 1e-12);
        assert_eq!(loss.gradient.len(), 4);
        check_loss_gradient(build, 1e-5);
    }

    #[test]
    fn test_exact_sample() {
        let gp = Exact::params(SquaredExponential::new(1))
            .variance(0.1)
            .build(&xt(), &yt())
            .unwrap();
        let z = array![[0.5], [1.5], [2.5]];
        let samples = gp.sample(&z, 5, false).unwrap();
        assert_eq!(samples.dim(), (3, 5));
        assert_eq!(gp.sample_path(&z, true).unwrap().len(), 3);
    }
}
