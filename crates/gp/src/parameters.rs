use crate::errors::{GpError, Result};
use crate::kernels::Kernel;
use crate::likelihoods::{GaussianLikelihood, Likelihood};
use crate::mean_models::Mean;
use crate::model::DEFAULT_JITTER;
use linfa::{Float, ParamGuard};
use ndarray::{Array1, Array2};
use std::marker::PhantomData;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

/// Inducing points specification of sparse models
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
#[non_exhaustive]
pub enum Inducings<F: Float> {
    /// `usize` points evenly spaced over the range of every input dimension,
    /// per channel with a multi-output kernel
    Grid(usize),
    /// Number of points of every channel of a multi-output kernel
    GridPerChannel(Vec<usize>),
    /// `usize` points are selected randomly in the training dataset
    Randomized(usize),
    /// Points are given as a (npoints, nx) matrix
    Located(Array2<F>),
}

impl<F: Float> Default for Inducings<F> {
    fn default() -> Inducings<F> {
        Self::Grid(10)
    }
}

impl<F: Float> Inducings<F> {
    fn check(&self) -> Result<()> {
        let empty = match self {
            Inducings::Grid(m) | Inducings::Randomized(m) => *m == 0,
            Inducings::GridPerChannel(ms) => ms.is_empty() || ms.contains(&0),
            Inducings::Located(z) => z.is_empty(),
        };
        if empty {
            return Err(GpError::InvalidValueError(
                "inducing points count should be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Gaussian noise variance specification
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum Variance<F: Float> {
    /// One trainable variance shared by all observations
    Scalar(F),
    /// One trainable variance per output channel
    PerChannel(Array1<F>),
    /// Fixed variance of every training observation
    PerDataPoint(Array1<F>),
}

impl<F: Float> Default for Variance<F> {
    fn default() -> Variance<F> {
        Self::Scalar(F::one())
    }
}

impl<F: Float> Variance<F> {
    fn check(&self) -> Result<()> {
        let valid = match self {
            Variance::Scalar(v) => v.is_finite() && *v > F::zero(),
            Variance::PerChannel(v) | Variance::PerDataPoint(v) => {
                !v.is_empty() && v.iter().all(|v| v.is_finite() && *v > F::zero())
            }
        };
        if !valid {
            return Err(GpError::InvalidValueError(
                "noise variance should be strictly positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Gaussian likelihood for a kernel with `output_dims` channels
    pub(crate) fn likelihood(&self, output_dims: usize) -> Result<GaussianLikelihood<F>> {
        match self {
            Variance::Scalar(v) => GaussianLikelihood::new(*v),
            Variance::PerChannel(v) if v.len() == 1 => GaussianLikelihood::new(v[0]),
            Variance::PerChannel(v) if v.len() == output_dims => GaussianLikelihood::per_channel(v),
            Variance::PerChannel(v) => Err(GpError::ShapeError(format!(
                "expected {} channel variances, got {}",
                output_dims,
                v.len()
            ))),
            Variance::PerDataPoint(v) => GaussianLikelihood::per_data_point(v),
        }
    }
}

fn check_jitter<F: Float>(jitter: F) -> Result<()> {
    if !jitter.is_finite() || jitter < F::zero() {
        return Err(GpError::InvalidValueError(
            "jitter should be a finite non-negative value".to_string(),
        ));
    }
    Ok(())
}

/// A set of validated exact GP parameters.
#[derive(Debug)]
pub struct ExactValidParams<F: Float> {
    /// Covariance function
    pub(crate) kernel: Box<dyn Kernel<F>>,
    /// Optional mean function
    pub(crate) mean: Option<Box<dyn Mean<F>>>,
    /// Gaussian noise variance
    pub(crate) variance: Variance<F>,
    /// Relative jitter added to covariance diagonals
    pub(crate) jitter: F,
    /// Model name
    pub(crate) name: String,
}

impl<F: Float> ExactValidParams<F> {
    /// Get the kernel
    pub fn kernel(&self) -> &dyn Kernel<F> {
        self.kernel.as_ref()
    }

    /// Get the noise variance specification
    pub fn variance(&self) -> &Variance<F> {
        &self.variance
    }

    /// Get the relative jitter
    pub fn jitter(&self) -> F {
        self.jitter
    }

    /// Get the model name
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// The set of parameters that can be specified to build an
/// [exact GP model](crate::Exact).
#[derive(Debug)]
pub struct ExactParams<F: Float>(ExactValidParams<F>);

impl<F: Float> ExactParams<F> {
    /// A constructor for exact GP parameters given a kernel
    pub fn new(kernel: impl Kernel<F> + 'static) -> ExactParams<F> {
        Self(ExactValidParams {
            kernel: Box::new(kernel),
            mean: None,
            variance: Variance::default(),
            jitter: F::cast(DEFAULT_JITTER),
            name: "Exact".to_string(),
        })
    }

    /// Set one trainable noise variance
    pub fn variance(mut self, variance: F) -> Self {
        self.0.variance = Variance::Scalar(variance);
        self
    }

    /// Set one trainable noise variance per output channel
    pub fn variance_per_channel(mut self, variances: Array1<F>) -> Self {
        self.0.variance = Variance::PerChannel(variances);
        self
    }

    /// Set fixed noise variances of the training observations.
    ///
    /// Such a model can only predict function values.
    pub fn data_variance(mut self, variances: Array1<F>) -> Self {
        self.0.variance = Variance::PerDataPoint(variances);
        self
    }

    /// Set the relative jitter
    pub fn jitter(mut self, jitter: F) -> Self {
        self.0.jitter = jitter;
        self
    }

    /// Set the mean function
    pub fn mean(mut self, mean: impl Mean<F> + 'static) -> Self {
        self.0.mean = Some(Box::new(mean));
        self
    }

    /// Set the model name
    pub fn name(mut self, name: &str) -> Self {
        self.0.name = name.to_string();
        self
    }
}

impl<F: Float> ParamGuard for ExactParams<F> {
    type Checked = ExactValidParams<F>;
    type Error = GpError;

    fn check_ref(&self) -> Result<&Self::Checked> {
        check_jitter(self.0.jitter)?;
        self.0.variance.check()?;
        Ok(&self.0)
    }

    fn check(self) -> Result<Self::Checked> {
        self.check_ref()?;
        Ok(self.0)
    }
}

/// A set of validated sparse GP parameters.
#[derive(Debug)]
pub struct SparseValidParams<F: Float> {
    pub(crate) kernel: Box<dyn Kernel<F>>,
    pub(crate) mean: Option<Box<dyn Mean<F>>>,
    pub(crate) variance: Variance<F>,
    pub(crate) jitter: F,
    pub(crate) name: Option<String>,
    /// Inducing points
    pub(crate) inducings: Inducings<F>,
    /// Whether inducing point locations are trained
    pub(crate) train_inducings: bool,
    /// Random generator seed
    pub(crate) seed: Option<u64>,
}

impl<F: Float> SparseValidParams<F> {
    /// Get the kernel
    pub fn kernel(&self) -> &dyn Kernel<F> {
        self.kernel.as_ref()
    }

    /// Get the noise variance specification
    pub fn variance(&self) -> &Variance<F> {
        &self.variance
    }

    /// Get the relative jitter
    pub fn jitter(&self) -> F {
        self.jitter
    }

    /// Get the inducing points specification
    pub fn inducings(&self) -> &Inducings<F> {
        &self.inducings
    }

    /// Whether inducing point locations are trained
    pub fn train_inducings(&self) -> bool {
        self.train_inducings
    }

    /// Get the random generator seed
    pub fn seed(&self) -> Option<&u64> {
        self.seed.as_ref()
    }
}

/// The set of parameters that can be specified to build a sparse GP model
/// `M` with a gaussian likelihood ([Snelson](crate::Snelson), [Titsias](crate::Titsias)).
#[derive(Debug)]
pub struct SparseParams<F: Float, M>(SparseValidParams<F>, PhantomData<M>);

impl<F: Float, M> SparseParams<F, M> {
    /// A constructor for sparse GP parameters given a kernel
    pub fn new(kernel: impl Kernel<F> + 'static) -> SparseParams<F, M> {
        Self(
            SparseValidParams {
                kernel: Box::new(kernel),
                mean: None,
                variance: Variance::default(),
                jitter: F::cast(DEFAULT_JITTER),
                name: None,
                inducings: Inducings::default(),
                train_inducings: true,
                seed: None,
            },
            PhantomData,
        )
    }

    /// Set one trainable noise variance
    pub fn variance(mut self, variance: F) -> Self {
        self.0.variance = Variance::Scalar(variance);
        self
    }

    /// Set one trainable noise variance per output channel
    pub fn variance_per_channel(mut self, variances: Array1<F>) -> Self {
        self.0.variance = Variance::PerChannel(variances);
        self
    }

    /// Set the relative jitter
    pub fn jitter(mut self, jitter: F) -> Self {
        self.0.jitter = jitter;
        self
    }

    /// Set the mean function
    pub fn mean(mut self, mean: impl Mean<F> + 'static) -> Self {
        self.0.mean = Some(Box::new(mean));
        self
    }

    /// Set the model name
    pub fn name(mut self, name: &str) -> Self {
        self.0.name = Some(name.to_string());
        self
    }

    /// Set the inducing points specification
    pub fn inducings(mut self, inducings: Inducings<F>) -> Self {
        self.0.inducings = inducings;
        self
    }

    /// Set whether inducing point locations are trained
    pub fn train_inducings(mut self, train: bool) -> Self {
        self.0.train_inducings = train;
        self
    }

    /// Set the random generator seed used by [Inducings::Randomized]
    pub fn seed(mut self, seed: Option<u64>) -> Self {
        self.0.seed = seed;
        self
    }
}

impl<F: Float, M> ParamGuard for SparseParams<F, M> {
    type Checked = SparseValidParams<F>;
    type Error = GpError;

    fn check_ref(&self) -> Result<&Self::Checked> {
        check_jitter(self.0.jitter)?;
        self.0.variance.check()?;
        if let Variance::PerDataPoint(_) = self.0.variance {
            return Err(GpError::InvalidValueError(
                "sparse models do not support data point variances".to_string(),
            ));
        }
        self.0.inducings.check()?;
        Ok(&self.0)
    }

    fn check(self) -> Result<Self::Checked> {
        self.check_ref()?;
        Ok(self.0)
    }
}

/// A set of validated variational GP parameters.
#[derive(Debug)]
pub struct VariationalValidParams<F: Float> {
    pub(crate) kernel: Box<dyn Kernel<F>>,
    pub(crate) likelihood: Box<dyn Likelihood<F>>,
    pub(crate) mean: Option<Box<dyn Mean<F>>>,
    pub(crate) jitter: F,
    pub(crate) name: Option<String>,
    /// Inducing points, `None` for non sparse models
    pub(crate) inducings: Option<Inducings<F>>,
    pub(crate) train_inducings: bool,
    pub(crate) seed: Option<u64>,
}

impl<F: Float> VariationalValidParams<F> {
    /// Get the kernel
    pub fn kernel(&self) -> &dyn Kernel<F> {
        self.kernel.as_ref()
    }

    /// Get the likelihood
    pub fn likelihood(&self) -> &dyn Likelihood<F> {
        self.likelihood.as_ref()
    }

    /// Get the relative jitter
    pub fn jitter(&self) -> F {
        self.jitter
    }

    /// Get the inducing points specification
    pub fn inducings(&self) -> Option<&Inducings<F>> {
        self.inducings.as_ref()
    }
}

/// The set of parameters that can be specified to build a variational GP
/// model `M` ([SparseHensman](crate::SparseHensman), [Hensman](crate::Hensman),
/// [OpperArchambeau](crate::OpperArchambeau)).
#[derive(Debug)]
pub struct VariationalParams<F: Float, M>(VariationalValidParams<F>, PhantomData<M>);

impl<F: Float, M> VariationalParams<F, M> {
    /// A constructor for variational GP parameters given a kernel and a likelihood
    pub fn new(
        kernel: impl Kernel<F> + 'static,
        likelihood: impl Likelihood<F> + 'static,
    ) -> VariationalParams<F, M> {
        Self(
            VariationalValidParams {
                kernel: Box::new(kernel),
                likelihood: Box::new(likelihood),
                mean: None,
                jitter: F::cast(DEFAULT_JITTER),
                name: None,
                inducings: None,
                train_inducings: true,
                seed: None,
            },
            PhantomData,
        )
    }

    /// Set the relative jitter
    pub fn jitter(mut self, jitter: F) -> Self {
        self.0.jitter = jitter;
        self
    }

    /// Set the mean function
    pub fn mean(mut self, mean: impl Mean<F> + 'static) -> Self {
        self.0.mean = Some(Box::new(mean));
        self
    }

    /// Set the model name
    pub fn name(mut self, name: &str) -> Self {
        self.0.name = Some(name.to_string());
        self
    }

    /// Set the inducing points specification, `None` pins them to the training inputs
    pub fn inducings(mut self, inducings: Option<Inducings<F>>) -> Self {
        self.0.inducings = inducings;
        self
    }

    /// Set whether inducing point locations are trained
    pub fn train_inducings(mut self, train: bool) -> Self {
        self.0.train_inducings = train;
        self
    }

    /// Set the random generator seed used by [Inducings::Randomized]
    pub fn seed(mut self, seed: Option<u64>) -> Self {
        self.0.seed = seed;
        self
    }
}

impl<F: Float, M> ParamGuard for VariationalParams<F, M> {
    type Checked = VariationalValidParams<F>;
    type Error = GpError;

    fn check_ref(&self) -> Result<&Self::Checked> {
        check_jitter(self.0.jitter)?;
        if let Some(inducings) = &self.0.inducings {
            inducings.check()?;
        }
        Ok(&self.0)
    }

    fn check(self) -> Result<Self::Checked> {
        self.check_ref()?;
        Ok(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::SquaredExponential;
    use crate::likelihoods::PoissonLikelihood;
    use crate::{OpperArchambeau, Snelson};
    use ndarray::array;

    #[test]
    fn test_exact_params_check() {
        let kernel = SquaredExponential::<f64>::new(1);
        assert!(ExactParams::new(kernel).jitter(-1.).check_ref().is_err());
        let kernel = SquaredExponential::<f64>::new(1);
        assert!(ExactParams::new(kernel).variance(0.).check_ref().is_err());
        let kernel = SquaredExponential::<f64>::new(1);
        let params = ExactParams::new(kernel)
            .data_variance(array![0.1, 0.2])
            .name("hetero")
            .check()
            .unwrap();
        assert_eq!(params.name(), "hetero");
        assert_eq!(params.variance(), &Variance::PerDataPoint(array![0.1, 0.2]));
    }

    #[test]
    fn test_sparse_params_check() {
        let kernel = SquaredExponential::<f64>::new(1);
        assert!(
            SparseParams::<f64, Snelson<f64>>::new(kernel)
                .inducings(Inducings::Randomized(0))
                .check_ref()
                .is_err()
        );
        let kernel = SquaredExponential::<f64>::new(1);
        assert!(
            SparseParams::<f64, Snelson<f64>>::new(kernel)
                .inducings(Inducings::GridPerChannel(vec![2, 0]))
                .check_ref()
                .is_err()
        );
        let kernel = SquaredExponential::<f64>::new(1);
        let params = SparseParams::<f64, Snelson<f64>>::new(kernel)
            .inducings(Inducings::Grid(5))
            .train_inducings(false)
            .seed(Some(42))
            .check()
            .unwrap();
        assert_eq!(params.inducings(), &Inducings::Grid(5));
        assert!(!params.train_inducings());
        assert_eq!(params.seed(), Some(&42));
    }

    #[test]
    fn test_variational_params_check() {
        let kernel = SquaredExponential::<f64>::new(1);
        let params = VariationalParams::<f64, OpperArchambeau<f64>>::new(kernel, PoissonLikelihood::new())
            .check()
            .unwrap();
        assert!(params.inducings().is_none());
        assert_eq!(params.likelihood().name(), "Poisson");
        let kernel = SquaredExponential::<f64>::new(1);
        assert!(
            VariationalParams::<f64, OpperArchambeau<f64>>::new(kernel, PoissonLikelihood::new())
                .jitter(f64::NAN)
                .check_ref()
                .is_err()
        );
    }

    #[test]
    fn test_variance_likelihood() {
        let v = Variance::PerChannel(array![0.1, 0.2]);
        assert!(v.likelihood(3).is_err());
        assert_eq!(v.likelihood(2).unwrap().scale().dim(), (2, 1));
        let v = Variance::PerChannel(array![0.1]);
        assert_eq!(v.likelihood(3).unwrap().scale().dim(), (1, 1));
    }
}
