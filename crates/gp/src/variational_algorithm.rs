use crate::autodiff::{Tape, Var};
use crate::errors::{GpError, Result};
use crate::kernels::Kernel;
use crate::likelihoods::Likelihood;
use crate::model::{GpBase, GpModel, check_unique_names, clamp_variance, column_norms2};
use crate::parameter::{Parameter, Parametrized};
use crate::parameters::{Inducings, VariationalParams, VariationalValidParams};
use crate::sparse_algorithm::{INDUCING_POINTS, inducing_parameter};

use linfa::{Float, ParamGuard};
use log::debug;
use ndarray::{Array2, ArrayBase, Data, Dimension};

/// Stochastic variational GP (SVGP) with a whitened gaussian posterior
/// `q(u) = N(q_mu, S Sᵀ)` over the inducing values, `S = tril(q_sqrt)`.
///
/// The evidence lower bound is
///
/// `Σ_i E_q(f_i)[log p(y_i | f_i)] - KL(q(u) || N(0, I))`
///
/// where the latent function `f = g + m(x)` adds the optional mean function
/// to the zero mean GP `g`. Any [Likelihood] may be used.
///
/// When built without inducing points (see [Hensman]) the inducing points are
/// pinned to the training inputs as a non trainable parameter and the
/// variational posterior is placed directly on the latent values at `X`.
///
/// # Reference
///
/// J. Hensman, A. Matthews, Z. Ghahramani, [Scalable Variational Gaussian
/// Process Classification](https://proceedings.mlr.press/v38/hensman15.html), 2015
#[derive(Debug)]
pub struct SparseHensman<F: Float> {
    base: GpBase<F>,
    likelihood: Box<dyn Likelihood<F>>,
    z: Parameter<F>,
    sparse: bool,
    q_mu: Parameter<F>,
    q_sqrt: Parameter<F>,
}

/// Non sparse variant of [SparseHensman], the variational posterior being
/// placed on the latent values at the training inputs.
///
/// ```no_run
/// use vgpr_gp::{kernels::Matern32, likelihoods::PoissonLikelihood, GpModel, Hensman};
/// use ndarray::array;
///
/// let x = array![0., 1., 2., 3.];
/// let counts = array![1., 3., 2., 0.];
/// let gp = Hensman::params(Matern32::new(1), PoissonLikelihood::new())
///     .build(&x, &counts)
///     .expect("GP built");
/// let elbo = gp.elbo().expect("elbo computed");
/// ```
#[derive(Debug)]
pub struct Hensman;

impl Hensman {
    /// Variational GP parameters without inducing points
    pub fn params<F: Float>(
        kernel: impl Kernel<F> + 'static,
        likelihood: impl Likelihood<F> + 'static,
    ) -> VariationalParams<F, SparseHensman<F>> {
        VariationalParams::new(kernel, likelihood)
            .inducings(None)
            .name("Hensman")
    }
}

impl<F: Float> SparseHensman<F> {
    /// Variational GP parameters with inducing points, 10 per input dimension
    /// on a grid by default
    pub fn params(
        kernel: impl Kernel<F> + 'static,
        likelihood: impl Likelihood<F> + 'static,
    ) -> VariationalParams<F, SparseHensman<F>> {
        VariationalParams::new(kernel, likelihood)
            .inducings(Some(Inducings::default()))
            .name("SparseHensman")
    }

    /// Build the model from validated parameters and training data
    pub fn new<D1: Dimension, D2: Dimension>(
        params: VariationalValidParams<F>,
        x: &ArrayBase<impl Data<Elem = F>, D1>,
        y: &ArrayBase<impl Data<Elem = F>, D2>,
    ) -> Result<SparseHensman<F>> {
        let VariationalValidParams {
            kernel,
            likelihood,
            mean,
            jitter,
            name,
            inducings,
            train_inducings,
            seed,
        } = params;
        let name = name.unwrap_or_else(|| "SparseHensman".to_string());
        let base = GpBase::new(&name, kernel, mean, x, y, jitter)?;
        base.check_likelihood(likelihood.as_ref())?;
        let sparse = inducings.is_some();
        let z = match inducings {
            Some(inducings) => inducing_parameter(&base, &inducings, train_inducings, seed)?,
            None => {
                let mut z = Parameter::new(INDUCING_POINTS, base.x().to_owned());
                z.set_trainable(false);
                z
            }
        };
        let m = z.dim().0;
        let q_mu = Parameter::new("q_mu", Array2::zeros((m, 1)));
        let mut q_sqrt = Parameter::new("q_sqrt", Array2::eye(m));
        q_sqrt.set_num_parameters(m * (m + 1) / 2);

        let model = SparseHensman {
            base,
            likelihood,
            z,
            sparse,
            q_mu,
            q_sqrt,
        };
        check_unique_names(&model)?;
        debug!(
            "{}: {} training points, {} variational inducing values, {} likelihood",
            model.base.name(),
            model.base.x().nrows(),
            m,
            model.likelihood.name()
        );
        Ok(model)
    }

    /// Likelihood
    pub fn likelihood(&self) -> &dyn Likelihood<F> {
        self.likelihood.as_ref()
    }

    /// Inducing point locations, the training inputs for the non sparse variant
    pub fn inducing_points(&self) -> &Parameter<F> {
        &self.z
    }

    /// Whether the inducing points are distinct from the training inputs
    pub fn is_sparse(&self) -> bool {
        self.sparse
    }

    /// Whitened variational mean (m, 1)
    pub fn q_mu(&self) -> &Parameter<F> {
        &self.q_mu
    }

    /// Whitened variational covariance factor (m, m), only its lower triangle is used
    pub fn q_sqrt(&self) -> &Parameter<F> {
        &self.q_sqrt
    }

    /// Evidence lower bound, same as [GpModel::log_marginal_likelihood]
    pub fn elbo(&self) -> Result<F> {
        self.log_marginal_likelihood()
    }

    /// `KL(N(q_mu, S Sᵀ) || N(0, I))`
    fn kl<'t>(&self, tape: &'t Tape<F>) -> Var<'t, F> {
        let m = self.q_mu.dim().0;
        let q_mu = tape.parameter(&self.q_mu);
        let s = tape.parameter(&self.q_sqrt).tril();
        let kl = q_mu.square().sum() - s.diag().square().ln().sum() + s.square().sum();
        kl.offset(-F::cast(m)).scale(F::cast(0.5))
    }

    /// Latent moments `(μ, Σ)` at `xs` without the mean function
    fn latent_predict(&self, xs: &Array2<F>, full: bool) -> Result<(Array2<F>, Array2<F>)> {
        let tape = Tape::no_grad();
        let kernel = self.base.kernel();
        let z = tape.parameter(&self.z);
        let xs_var = tape.constant(xs.to_owned());
        let q_mu = tape.parameter(&self.q_mu);
        let s = tape.parameter(&self.q_sqrt).tril();

        let luu = self.cholesky_on(kernel.k(&tape, z, None), true)?;
        let kus = kernel.k(&tape, z, Some(xs_var));
        let a = luu.solve_lower(kus)?;
        let b = s.t().matmul(a);

        let mu = a.t().matmul(q_mu).value();
        let var = if full {
            (kernel.k(&tape, xs_var, None) - a.t().matmul(a) + b.t().matmul(b)).value()
        } else {
            (kernel.k_diag(&tape, xs_var) - column_norms2(a) + column_norms2(b)).value()
        };
        Ok((mu, var))
    }
}

impl<F: Float> VariationalParams<F, SparseHensman<F>> {
    /// Build a [SparseHensman] model on the training data
    pub fn build<D1: Dimension, D2: Dimension>(
        self,
        x: &ArrayBase<impl Data<Elem = F>, D1>,
        y: &ArrayBase<impl Data<Elem = F>, D2>,
    ) -> Result<SparseHensman<F>> {
        SparseHensman::new(self.check()?, x, y)
    }
}

impl<F: Float> Parametrized<F> for SparseHensman<F> {
    fn collect_parameters<'a>(&'a self, path: &str, out: &mut Vec<(String, &'a Parameter<F>)>) {
        self.base.collect_with_likelihood(&self.likelihood, path, out);
        self.z.collect_parameters(path, out);
        self.q_mu.collect_parameters(path, out);
        self.q_sqrt.collect_parameters(path, out);
    }

    fn collect_parameters_mut<'a>(
        &'a mut self,
        path: &str,
        out: &mut Vec<(String, &'a mut Parameter<F>)>,
    ) {
        self.base
            .collect_with_likelihood_mut(&mut self.likelihood, path, out);
        self.z.collect_parameters_mut(path, out);
        self.q_mu.collect_parameters_mut(path, out);
        self.q_sqrt.collect_parameters_mut(path, out);
    }
}

impl<F: Float> GpModel<F> for SparseHensman<F> {
    fn base(&self) -> &GpBase<F> {
        &self.base
    }

    fn log_marginal_likelihood_on<'t>(&self, tape: &'t Tape<F>) -> Result<Var<'t, F>> {
        let kernel = self.base.kernel();
        let x = tape.constant(self.base.x().to_owned());
        let y = tape.constant(self.base.y().to_owned());
        let q_mu = tape.parameter(&self.q_mu);
        let s = tape.parameter(&self.q_sqrt).tril();

        let (qf_mu, qf_var) = if self.sparse {
            let z = tape.parameter(&self.z);
            let luu = self.cholesky_on(kernel.k(tape, z, None), true)?;
            let a = luu.solve_lower(kernel.k(tape, z, Some(x)))?;
            let b = s.t().matmul(a);
            let var = kernel.k_diag(tape, x) - column_norms2(a) + column_norms2(b);
            (a.t().matmul(q_mu), var)
        } else {
            let lff = self.cholesky_on(kernel.k(tape, x, None), true)?;
            let qf_sqrt = lff.matmul(s);
            (lff.matmul(q_mu), qf_sqrt.square().sum_rows())
        };
        let qf_mu = qf_mu + self.base.mean_on(tape, x);
        let ve = self
            .likelihood
            .variational_expectation(tape, y, qf_mu, qf_var, self.base.x())?;
        Ok(ve - self.kl(tape))
    }

    fn predict<D: Dimension>(
        &self,
        xs: &ArrayBase<impl Data<Elem = F>, D>,
        full: bool,
        predict_y: bool,
    ) -> Result<(Array2<F>, Array2<F>)> {
        let xs = self.base.check_input(xs)?;
        let (mu, var) = self.latent_predict(&xs, full)?;
        let mu = mu + self.base.mean_at(&xs);
        let var = clamp_variance(var, full);
        if predict_y {
            self.likelihood.predict(mu, var, full, &xs)
        } else {
            Ok((mu, var))
        }
    }
}

/// Variational GP with the Opper and Archambeau parametrization of the
/// gaussian posterior over the latent values at the training inputs:
///
/// `q(f) = N(K ν, (K⁻¹ + diag(λ²))⁻¹)`
///
/// with `2n` variational parameters `ν` (`q_nu`) and `λ > 0` (`q_lambda`).
/// Any [Likelihood] may be used and no inducing points are involved.
///
/// # Reference
///
/// M. Opper, C. Archambeau, [The Variational Gaussian Approximation
/// Revisited](https://doi.org/10.1162/neco.2008.08-07-592), 2009
#[derive(Debug)]
pub struct OpperArchambeau<F: Float> {
    base: GpBase<F>,
    likelihood: Box<dyn Likelihood<F>>,
    q_nu: Parameter<F>,
    q_lambda: Parameter<F>,
}

impl<F: Float> OpperArchambeau<F> {
    /// Variational GP parameters given a kernel and a likelihood
    pub fn params(
        kernel: impl Kernel<F> + 'static,
        likelihood: impl Likelihood<F> + 'static,
    ) -> VariationalParams<F, OpperArchambeau<F>> {
        VariationalParams::new(kernel, likelihood).name("OpperArchambeau")
    }

    /// Build the model from validated parameters and training data
    pub fn new<D1: Dimension, D2: Dimension>(
        params: VariationalValidParams<F>,
        x: &ArrayBase<impl Data<Elem = F>, D1>,
        y: &ArrayBase<impl Data<Elem = F>, D2>,
    ) -> Result<OpperArchambeau<F>> {
        let VariationalValidParams {
            kernel,
            likelihood,
            mean,
            jitter,
            name,
            inducings,
            ..
        } = params;
        if inducings.is_some() {
            return Err(GpError::InvalidValueError(
                "OpperArchambeau does not use inducing points".to_string(),
            ));
        }
        let name = name.unwrap_or_else(|| "OpperArchambeau".to_string());
        let base = GpBase::new(&name, kernel, mean, x, y, jitter)?;
        base.check_likelihood(likelihood.as_ref())?;
        let n = base.x().nrows();
        let model = OpperArchambeau {
            base,
            likelihood,
            q_nu: Parameter::new("q_nu", Array2::zeros((n, 1))),
            q_lambda: Parameter::positive_ones("q_lambda", (n, 1)),
        };
        check_unique_names(&model)?;
        debug!(
            "{}: {} training points, {} likelihood",
            model.base.name(),
            n,
            model.likelihood.name()
        );
        Ok(model)
    }

    /// Likelihood
    pub fn likelihood(&self) -> &dyn Likelihood<F> {
        self.likelihood.as_ref()
    }

    /// Variational parameter `ν` (n, 1)
    pub fn q_nu(&self) -> &Parameter<F> {
        &self.q_nu
    }

    /// Variational parameter `λ` (n, 1)
    pub fn q_lambda(&self) -> &Parameter<F> {
        &self.q_lambda
    }

    /// Evidence lower bound, same as [GpModel::log_marginal_likelihood]
    pub fn elbo(&self) -> Result<F> {
        self.log_marginal_likelihood()
    }
}

impl<F: Float> VariationalParams<F, OpperArchambeau<F>> {
    /// Build an [OpperArchambeau] model on the training data
    pub fn build<D1: Dimension, D2: Dimension>(
        self,
        x: &ArrayBase<impl Data<Elem = F>, D1>,
        y: &ArrayBase<impl Data<Elem = F>, D2>,
    ) -> Result<OpperArchambeau<F>> {
        OpperArchambeau::new(self.check()?, x, y)
    }
}

impl<F: Float> Parametrized<F> for OpperArchambeau<F> {
    fn collect_parameters<'a>(&'a self, path: &str, out: &mut Vec<(String, &'a Parameter<F>)>) {
        self.base.collect_with_likelihood(&self.likelihood, path, out);
        self.q_nu.collect_parameters(path, out);
        self.q_lambda.collect_parameters(path, out);
    }

    fn collect_parameters_mut<'a>(
        &'a mut self,
        path: &str,
        out: &mut Vec<(String, &'a mut Parameter<F>)>,
    ) {
        self.base
            .collect_with_likelihood_mut(&mut self.likelihood, path, out);
        self.q_nu.collect_parameters_mut(path, out);
        self.q_lambda.collect_parameters_mut(path, out);
    }
}

impl<F: Float> GpModel<F> for OpperArchambeau<F> {
    fn base(&self) -> &GpBase<F> {
        &self.base
    }

    /// `E_q[log p(y | f)] - KL(q(f) || p(f))` where, with
    /// `L = chol(diag(λ) K diag(λ) + I)`,
    ///
    /// `2 KL = -n + νᵀKν + Σ log diag(L)² + ‖L⁻¹‖²`
    fn log_marginal_likelihood_on<'t>(&self, tape: &'t Tape<F>) -> Result<Var<'t, F>> {
        let n = self.base.x().nrows();
        let x = tape.constant(self.base.x().to_owned());
        let y = tape.constant(self.base.y().to_owned());
        let nu = tape.parameter(&self.q_nu);
        let lambda = tape.parameter(&self.q_lambda);
        let k = self.base.kernel().k(tape, x, None);

        let l = self.cholesky_on(lambda.matmul(lambda.t()) * k + tape.eye(n), false)?;
        let inv_l = l.solve_lower(tape.eye(n))?;
        let lambda2 = lambda.square();
        let qf_mu = k.matmul(nu) + self.base.mean_on(tape, x);
        let qf_var = (tape.scalar(F::one()) - column_norms2(inv_l)) / lambda2;

        let kl = nu.t().matmul(k).matmul(nu)
            + l.diag().square().ln().sum()
            + inv_l.square().sum();
        let kl = kl.offset(-F::cast(n)).scale(F::cast(0.5));
        let ve = self
            .likelihood
            .variational_expectation(tape, y, qf_mu, qf_var, self.base.x())?;
        Ok(ve - kl)
    }

    fn predict<D: Dimension>(
        &self,
        xs: &ArrayBase<impl Data<Elem = F>, D>,
        full: bool,
        predict_y: bool,
    ) -> Result<(Array2<F>, Array2<F>)> {
        let xs = self.base.check_input(xs)?;
        let tape = Tape::no_grad();
        let kernel = self.base.kernel();
        let x = tape.constant(self.base.x().to_owned());
        let xs_var = tape.constant(xs.to_owned());
        let nu = tape.parameter(&self.q_nu);
        let lambda = tape.parameter(&self.q_lambda);

        let k = kernel.k(&tape, x, None);
        let noise = (tape.scalar(F::one()) / lambda.square()).diagflat();
        let l = self.cholesky_on(k + noise, false)?;
        let kfs = kernel.k(&tape, x, Some(xs_var));
        let a = l.solve_lower(kfs)?;

        let mu = kfs.t().matmul(nu).value() + self.base.mean_at(&xs);
        let var = if full {
            (kernel.k(&tape, xs_var, None) - a.t().matmul(a)).value()
        } else {
            (kernel.k_diag(&tape, xs_var) - column_norms2(a)).value()
        };
        let var = clamp_variance(var, full);
        if predict_y {
            self.likelihood.predict(mu, var, full, &xs)
        } else {
            Ok((mu, var))
        }
    }
}
