//! Observation models linking the latent GP values `f` to the data `y`.
//!
//! Variational models only need the expectation of the log likelihood under a
//! Gaussian marginal `q(f) = N(μ, v)` and the moments of the predictive
//! distribution of `y`, both available in closed form for the likelihoods
//! implemented here:
//! * gaussian: `y ~ N(f, σ²)` with shared, per channel or per data point `σ²`,
//! * poisson: `y ~ Poisson(exp(f))`.

use crate::autodiff::{Tape, Var};
use crate::errors::{GpError, Result};
use crate::kernels::channels;
use crate::parameter::{Parameter, Parametrized, join_path};
use linfa::Float;
use ndarray::{Array1, Array2, Axis, Zip};
use std::fmt;

/// A trait for likelihoods used in variational GP models
pub trait Likelihood<F: Float>: Parametrized<F> + fmt::Debug {
    /// Name used as prefix of the likelihood parameter names
    fn name(&self) -> &str;

    /// Number of output channels the likelihood is parametrized for
    fn output_dims(&self) -> usize {
        1
    }

    /// Fail when `y` (n, 1) observed at `x` is not supported
    fn validate_y(&self, y: &Array2<F>, x: &Array2<F>) -> Result<()>;

    /// `Σ_i E_q(f_i)[log p(y_i | f_i)]` with `q(f_i) = N(mu_i, var_i)`
    fn variational_expectation<'t>(
        &self,
        tape: &'t Tape<F>,
        y: Var<'t, F>,
        mu: Var<'t, F>,
        var: Var<'t, F>,
        x: &Array2<F>,
    ) -> Result<Var<'t, F>>;

    /// Predictive mean and variance of `y` from the latent moments at `x`.
    /// `var` is a (n, n) covariance when `full` is set, a (n, 1) column otherwise.
    fn predict(
        &self,
        mu: Array2<F>,
        var: Array2<F>,
        full: bool,
        x: &Array2<F>,
    ) -> Result<(Array2<F>, Array2<F>)>;
}

impl<F: Float> Parametrized<F> for Box<dyn Likelihood<F>> {
    fn collect_parameters<'a>(&'a self, path: &str, out: &mut Vec<(String, &'a Parameter<F>)>) {
        (**self).collect_parameters(path, out)
    }

    fn collect_parameters_mut<'a>(
        &'a mut self,
        path: &str,
        out: &mut Vec<(String, &'a mut Parameter<F>)>,
    ) {
        (**self).collect_parameters_mut(path, out)
    }
}

/// How the gaussian noise variance is shared among observations
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NoiseKind {
    /// One variance for all observations
    Shared,
    /// One variance per output channel, selected by `X[:, 0]`
    PerChannel,
    /// One fixed variance per training observation
    PerDataPoint,
}

/// Gaussian likelihood `y ~ N(f, σ²)`
#[derive(Debug)]
pub struct GaussianLikelihood<F: Float> {
    scale: Parameter<F>,
    kind: NoiseKind,
}

impl<F: Float> GaussianLikelihood<F> {
    /// Likelihood with a single trainable variance
    pub fn new(variance: F) -> Result<GaussianLikelihood<F>> {
        Ok(GaussianLikelihood {
            scale: Parameter::positive("scale", Array2::from_elem((1, 1), variance))?,
            kind: NoiseKind::Shared,
        })
    }

    /// Likelihood with one trainable variance per output channel
    pub fn per_channel(variances: &Array1<F>) -> Result<GaussianLikelihood<F>> {
        if variances.is_empty() {
            return Err(GpError::InvalidValueError(
                "per channel variances must not be empty".to_string(),
            ));
        }
        let value = variances.to_owned().insert_axis(Axis(1));
        Ok(GaussianLikelihood {
            scale: Parameter::positive("scale", value)?,
            kind: NoiseKind::PerChannel,
        })
    }

    /// Likelihood with fixed variances given for every training observation
    pub fn per_data_point(variances: &Array1<F>) -> Result<GaussianLikelihood<F>> {
        if variances.iter().any(|v| *v < F::zero()) {
            return Err(GpError::InvalidValueError(
                "data point variances must be non negative".to_string(),
            ));
        }
        let value = variances.to_owned().insert_axis(Axis(1));
        let lower = Array2::zeros((1, 1));
        let mut scale = Parameter::bounded("scale", value, Some(lower), None)?;
        scale.set_trainable(false);
        Ok(GaussianLikelihood {
            scale,
            kind: NoiseKind::PerDataPoint,
        })
    }

    /// How the variance is shared
    pub fn kind(&self) -> NoiseKind {
        self.kind
    }

    /// Variance parameter, (1, 1), (channels, 1) or (data points, 1)
    pub fn scale(&self) -> &Parameter<F> {
        &self.scale
    }

    /// Mutable variance parameter
    pub fn scale_mut(&mut self) -> &mut Parameter<F> {
        &mut self.scale
    }

    /// Noise variance of every row of `x` as a (n, 1) column
    pub fn scale_at<'t>(&self, tape: &'t Tape<F>, x: &Array2<F>) -> Result<Var<'t, F>> {
        let scale = tape.parameter(&self.scale);
        match self.kind {
            NoiseKind::Shared => Ok(tape.constant(Array2::ones((x.nrows(), 1))) * scale),
            NoiseKind::PerChannel => {
                let idx = channels(x);
                let n_channels = self.scale.dim().0;
                if let Some(c) = idx.iter().find(|c| **c >= n_channels) {
                    return Err(GpError::ShapeError(format!(
                        "channel index {c} out of range for {n_channels} channel variances"
                    )));
                }
                Ok(scale.gather_rows(idx))
            }
            NoiseKind::PerDataPoint => {
                if x.nrows() != self.scale.dim().0 {
                    return Err(GpError::ShapeError(format!(
                        "expected {} data point variances, got {} points",
                        self.scale.dim().0,
                        x.nrows()
                    )));
                }
                Ok(scale)
            }
        }
    }
}

impl<F: Float> Parametrized<F> for GaussianLikelihood<F> {
    fn collect_parameters<'a>(&'a self, path: &str, out: &mut Vec<(String, &'a Parameter<F>)>) {
        self.scale
            .collect_parameters(&join_path(path, "Gaussian"), out);
    }

    fn collect_parameters_mut<'a>(
        &'a mut self,
        path: &str,
        out: &mut Vec<(String, &'a mut Parameter<F>)>,
    ) {
        self.scale
            .collect_parameters_mut(&join_path(path, "Gaussian"), out);
    }
}

impl<F: Float> Likelihood<F> for GaussianLikelihood<F> {
    fn name(&self) -> &str {
        "Gaussian"
    }

    fn output_dims(&self) -> usize {
        match self.kind {
            NoiseKind::PerChannel => self.scale.dim().0,
            _ => 1,
        }
    }

    fn validate_y(&self, y: &Array2<F>, x: &Array2<F>) -> Result<()> {
        if y.iter().any(|v| !v.is_finite()) {
            return Err(GpError::InvalidValueError(
                "y must contain finite values".to_string(),
            ));
        }
        if self.kind == NoiseKind::PerDataPoint && self.scale.dim().0 != y.nrows() {
            return Err(GpError::ShapeError(format!(
                "expected {} data point variances, got {}",
                y.nrows(),
                self.scale.dim().0
            )));
        }
        if self.kind == NoiseKind::PerChannel {
            let n_channels = self.scale.dim().0;
            if channels(x).iter().any(|c| *c >= n_channels) {
                return Err(GpError::ShapeError(format!(
                    "channel index out of range for {n_channels} channel variances"
                )));
            }
        }
        Ok(())
    }

    fn variational_expectation<'t>(
        &self,
        tape: &'t Tape<F>,
        y: Var<'t, F>,
        mu: Var<'t, F>,
        var: Var<'t, F>,
        x: &Array2<F>,
    ) -> Result<Var<'t, F>> {
        let log_2pi = F::cast((2. * std::f64::consts::PI).ln());
        let sigma2 = self.scale_at(tape, x)?;
        let residual = (y - mu).square() + var;
        let p = sigma2.ln().offset(log_2pi) + residual / sigma2;
        Ok(p.sum().scale(F::cast(-0.5)))
    }

    fn predict(
        &self,
        mu: Array2<F>,
        var: Array2<F>,
        full: bool,
        x: &Array2<F>,
    ) -> Result<(Array2<F>, Array2<F>)> {
        if self.kind == NoiseKind::PerDataPoint {
            return Err(GpError::UsageError(
                "data point variances are unknown at prediction points, \
                 predict function values instead"
                    .to_string(),
            ));
        }
        let tape = Tape::no_grad();
        let noise = self.scale_at(&tape, x)?.value();
        let var = if full {
            let mut var = var;
            var.diag_mut()
                .zip_mut_with(&noise.column(0), |v, n| *v += *n);
            var
        } else {
            var + noise
        };
        Ok((mu, var))
    }
}

/// Poisson likelihood with log link `y ~ Poisson(exp(f))`
#[derive(Clone, Copy, Debug, Default)]
pub struct PoissonLikelihood;

impl PoissonLikelihood {
    /// Poisson likelihood
    pub fn new() -> PoissonLikelihood {
        PoissonLikelihood
    }
}

impl<F: Float> Parametrized<F> for PoissonLikelihood {
    fn collect_parameters<'a>(&'a self, _path: &str, _out: &mut Vec<(String, &'a Parameter<F>)>) {}

    fn collect_parameters_mut<'a>(
        &'a mut self,
        _path: &str,
        _out: &mut Vec<(String, &'a mut Parameter<F>)>,
    ) {
    }
}

impl<F: Float> Likelihood<F> for PoissonLikelihood {
    fn name(&self) -> &str {
        "Poisson"
    }

    fn validate_y(&self, y: &Array2<F>, _x: &Array2<F>) -> Result<()> {
        if y
            .iter()
            .any(|v| !v.is_finite() || *v < F::zero() || v.fract() != F::zero())
        {
            return Err(GpError::InvalidValueError(
                "y must contain non negative integer counts for a poisson likelihood".to_string(),
            ));
        }
        Ok(())
    }

    fn variational_expectation<'t>(
        &self,
        tape: &'t Tape<F>,
        y: Var<'t, F>,
        mu: Var<'t, F>,
        var: Var<'t, F>,
        _x: &Array2<F>,
    ) -> Result<Var<'t, F>> {
        let log_factorial = y.value().mapv(|v| {
            F::cast(libm::lgamma(v.to_f64().unwrap_or(f64::NAN) + 1.))
        });
        let rate = (mu + var.scale(F::cast(0.5))).exp();
        let p = y * mu - rate - tape.constant(log_factorial);
        Ok(p.sum())
    }

    fn predict(
        &self,
        mu: Array2<F>,
        var: Array2<F>,
        full: bool,
        _x: &Array2<F>,
    ) -> Result<(Array2<F>, Array2<F>)> {
        let two = F::cast(2.);
        if full {
            let diag = var.diag().to_owned();
            let mean = Zip::from(mu.column(0))
                .and(&diag)
                .map_collect(|m, v| (*m + *v / two).exp());
            let mut cov = Array2::from_shape_fn(var.dim(), |(i, j)| {
                mean[i] * mean[j] * var[[i, j]].exp_m1()
            });
            cov.diag_mut().zip_mut_with(&mean, |c, m| *c += *m);
            Ok((mean.insert_axis(Axis(1)), cov))
        } else {
            let mean = Zip::from(&mu)
                .and(&var)
                .map_collect(|m, v| (*m + *v / two).exp());
            let variance = Zip::from(&mu)
                .and(&var)
                .and(&mean)
                .map_collect(|m, v, e| *e + v.exp_m1() * (two * *m + *v).exp());
            Ok((mean, variance))
        }
    }
}
