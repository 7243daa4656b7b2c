//! Covariance functions used by GP inference models.
//!
//! Stationary kernels are parametrized by a variance `σ²` and one positive
//! length-scale per input dimension (ARD). With the scaled distance
//! `r² = Σ_i (x_i - x'_i)² / ℓ_i²` the following profiles are available:
//! * squared exponential: `σ² exp(-r²/2)`
//! * absolute exponential: `σ² exp(-r)`
//! * matern 3/2: `σ² (1 + √3 r) exp(-√3 r)`
//! * matern 5/2: `σ² (1 + √5 r + 5/3 r²) exp(-√5 r)`
//!
//! Kernels can be summed with [`Sum`] and turned into multi-output kernels
//! with [`IndependentOutputs`], in which case the first input column holds
//! the output channel index.

use crate::autodiff::{Tape, Var};
use crate::errors::{GpError, Result};
use crate::parameter::{Parameter, Parametrized, join_path};
use linfa::Float;
use ndarray::{Array1, Array2, Axis};
use paste::paste;
use std::fmt;

/// A covariance function evaluated on a differentiation tape
pub trait Kernel<F: Float>: Parametrized<F> + fmt::Debug {
    /// Name used as prefix of the kernel parameter names
    fn name(&self) -> &str;

    /// Number of input columns expected
    fn input_dims(&self) -> usize;

    /// Number of output channels, more than one for multi-output kernels
    fn output_dims(&self) -> usize {
        1
    }

    /// Covariance matrix between the rows of `x1` (n, d) and `x2` (m, d),
    /// between `x1` and itself when `x2` is `None`
    fn k<'t>(&self, tape: &'t Tape<F>, x1: Var<'t, F>, x2: Option<Var<'t, F>>) -> Var<'t, F>;

    /// Diagonal of the covariance matrix of `x` (n, d) as a (n, 1) column
    fn k_diag<'t>(&self, tape: &'t Tape<F>, x: Var<'t, F>) -> Var<'t, F>;

    /// Numeric covariance matrix
    fn eval(&self, x1: &Array2<F>, x2: Option<&Array2<F>>) -> Array2<F> {
        let tape = Tape::no_grad();
        let x1 = tape.constant(x1.to_owned());
        let x2 = x2.map(|x| tape.constant(x.to_owned()));
        self.k(&tape, x1, x2).value()
    }

    /// Numeric covariance diagonal
    fn eval_diag(&self, x: &Array2<F>) -> Array1<F> {
        let tape = Tape::no_grad();
        let x = tape.constant(x.to_owned());
        self.k_diag(&tape, x).value().remove_axis(Axis(1))
    }
}

impl<F: Float> Parametrized<F> for Box<dyn Kernel<F>> {
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

impl<F: Float> Kernel<F> for Box<dyn Kernel<F>> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn input_dims(&self) -> usize {
        (**self).input_dims()
    }

    fn output_dims(&self) -> usize {
        (**self).output_dims()
    }

    fn k<'t>(&self, tape: &'t Tape<F>, x1: Var<'t, F>, x2: Option<Var<'t, F>>) -> Var<'t, F> {
        (**self).k(tape, x1, x2)
    }

    fn k_diag<'t>(&self, tape: &'t Tape<F>, x: Var<'t, F>) -> Var<'t, F> {
        (**self).k_diag(tape, x)
    }
}

fn squared_exponential<F: Float>(r2: Var<'_, F>) -> Var<'_, F> {
    r2.scale(F::cast(-0.5)).exp()
}

fn absolute_exponential<F: Float>(r2: Var<'_, F>) -> Var<'_, F> {
    (-r2.sqrt()).exp()
}

fn matern32<F: Float>(r2: Var<'_, F>) -> Var<'_, F> {
    let r = r2.scale(F::cast(3.)).sqrt();
    r.offset(F::one()) * (-r).exp()
}

fn matern52<F: Float>(r2: Var<'_, F>) -> Var<'_, F> {
    let r = r2.scale(F::cast(5.)).sqrt();
    (r.offset(F::one()) + r2.scale(F::cast(5. / 3.))) * (-r).exp()
}

macro_rules! stationary_kernel {
    ($kernel:ident, $profile:ident, $doc:literal) => {
        paste! {
            #[doc = $doc]
            #[derive(Debug)]
            pub struct $kernel<F: Float> {
                variance: Parameter<F>,
                lengthscale: Parameter<F>,
            }

            impl<F: Float> $kernel<F> {
                #[doc = "Kernel over `input_dims` dimensions with unit variance and length-scales"]
                pub fn new(input_dims: usize) -> $kernel<F> {
                    $kernel {
                        variance: Parameter::positive_ones("variance", (1, 1)),
                        lengthscale: Parameter::positive_ones("lengthscale", (1, input_dims)),
                    }
                }

                #[doc = "Set the initial variance"]
                pub fn with_variance(mut self, variance: F) -> Result<$kernel<F>> {
                    self.variance.assign_scalar(variance)?;
                    Ok(self)
                }

                #[doc = "Set the initial length-scales, one value broadcast or one per dimension"]
                pub fn with_lengthscale(mut self, lengthscale: &[F]) -> Result<$kernel<F>> {
                    let dim = self.lengthscale.dim().1;
                    if lengthscale.len() != 1 && lengthscale.len() != dim {
                        return Err(GpError::ShapeError(format!(
                            "{}: expected 1 or {} length-scales, got {}",
                            stringify!($kernel),
                            dim,
                            lengthscale.len()
                        )));
                    }
                    let value = Array2::from_shape_vec((1, lengthscale.len()), lengthscale.to_vec())
                        .map_err(|e| GpError::ShapeError(e.to_string()))?;
                    self.lengthscale.assign(value, None, None, None)?;
                    Ok(self)
                }

                #[doc = "Variance parameter"]
                pub fn variance(&self) -> &Parameter<F> {
                    &self.variance
                }

                #[doc = "Mutable variance parameter"]
                pub fn variance_mut(&mut self) -> &mut Parameter<F> {
                    &mut self.variance
                }

                #[doc = "Length-scale parameter of shape (1, input_dims)"]
                pub fn lengthscale(&self) -> &Parameter<F> {
                    &self.lengthscale
                }

                #[doc = "Mutable length-scale parameter"]
                pub fn lengthscale_mut(&mut self) -> &mut Parameter<F> {
                    &mut self.lengthscale
                }
            }

            impl<F: Float> Parametrized<F> for $kernel<F> {
                fn collect_parameters<'a>(
                    &'a self,
                    path: &str,
                    out: &mut Vec<(String, &'a Parameter<F>)>,
                ) {
                    let path = join_path(path, stringify!($kernel));
                    self.variance.collect_parameters(&path, out);
                    self.lengthscale.collect_parameters(&path, out);
                }

                fn collect_parameters_mut<'a>(
                    &'a mut self,
                    path: &str,
                    out: &mut Vec<(String, &'a mut Parameter<F>)>,
                ) {
                    let path = join_path(path, stringify!($kernel));
                    self.variance.collect_parameters_mut(&path, out);
                    self.lengthscale.collect_parameters_mut(&path, out);
                }
            }

            impl<F: Float> Kernel<F> for $kernel<F> {
                fn name(&self) -> &str {
                    stringify!($kernel)
                }

                fn input_dims(&self) -> usize {
                    self.lengthscale.dim().1
                }

                fn k<'t>(
                    &self,
                    tape: &'t Tape<F>,
                    x1: Var<'t, F>,
                    x2: Option<Var<'t, F>>,
                ) -> Var<'t, F> {
                    let variance = tape.parameter(&self.variance);
                    let lengthscale = tape.parameter(&self.lengthscale);
                    let x1 = x1 / lengthscale;
                    let x2 = x2.map(|x2| x2 / lengthscale).unwrap_or(x1);
                    variance * $profile(x1.sq_dist(x2))
                }

                fn k_diag<'t>(&self, tape: &'t Tape<F>, x: Var<'t, F>) -> Var<'t, F> {
                    let ones = tape.constant(Array2::ones((x.dim().0, 1)));
                    ones * tape.parameter(&self.variance)
                }
            }
        }
    };
}

stationary_kernel!(
    SquaredExponential,
    squared_exponential,
    "Squared exponential kernel `σ² exp(-r²/2)`"
);
stationary_kernel!(
    AbsoluteExponential,
    absolute_exponential,
    "Absolute exponential kernel `σ² exp(-r)`"
);
stationary_kernel!(
    Matern32,
    matern32,
    "Matern 3/2 kernel `σ² (1 + √3 r) exp(-√3 r)`"
);
stationary_kernel!(
    Matern52,
    matern52,
    "Matern 5/2 kernel `σ² (1 + √5 r + 5/3 r²) exp(-√5 r)`"
);

/// Sum of kernels sharing the same inputs
#[derive(Debug)]
pub struct Sum<F: Float> {
    kernels: Vec<Box<dyn Kernel<F>>>,
}

impl<F: Float> Sum<F> {
    /// Sum of the given kernels, which must agree on their input dimension
    pub fn new(kernels: Vec<Box<dyn Kernel<F>>>) -> Result<Sum<F>> {
        let Some(first) = kernels.first() else {
            return Err(GpError::InvalidValueError(
                "Sum kernel needs at least one kernel".to_string(),
            ));
        };
        let input_dims = first.input_dims();
        if kernels.iter().any(|k| k.input_dims() != input_dims) {
            return Err(GpError::ShapeError(
                "Sum kernel operands must have the same input dimension".to_string(),
            ));
        }
        Ok(Sum { kernels })
    }

    /// Summed kernels
    pub fn kernels(&self) -> &[Box<dyn Kernel<F>>] {
        &self.kernels
    }
}

impl<F: Float> Parametrized<F> for Sum<F> {
    fn collect_parameters<'a>(&'a self, path: &str, out: &mut Vec<(String, &'a Parameter<F>)>) {
        let path = join_path(path, "Sum");
        for (i, kernel) in self.kernels.iter().enumerate() {
            kernel.collect_parameters(&format!("{path}[{i}]"), out);
        }
    }

    fn collect_parameters_mut<'a>(
        &'a mut self,
        path: &str,
        out: &mut Vec<(String, &'a mut Parameter<F>)>,
    ) {
        let path = join_path(path, "Sum");
        for (i, kernel) in self.kernels.iter_mut().enumerate() {
            kernel.collect_parameters_mut(&format!("{path}[{i}]"), out);
        }
    }
}

impl<F: Float> Kernel<F> for Sum<F> {
    fn name(&self) -> &str {
        "Sum"
    }

    fn input_dims(&self) -> usize {
        self.kernels[0].input_dims()
    }

    fn output_dims(&self) -> usize {
        self.kernels
            .iter()
            .map(|k| k.output_dims())
            .max()
            .unwrap_or(1)
    }

    fn k<'t>(&self, tape: &'t Tape<F>, x1: Var<'t, F>, x2: Option<Var<'t, F>>) -> Var<'t, F> {
        let mut kernels = self.kernels.iter();
        let first = kernels.next().map(|k| k.k(tape, x1, x2));
        let init = first.unwrap_or_else(|| {
            tape.constant(Array2::zeros((x1.dim().0, x2.unwrap_or(x1).dim().0)))
        });
        kernels.fold(init, |acc, k| acc + k.k(tape, x1, x2))
    }

    fn k_diag<'t>(&self, tape: &'t Tape<F>, x: Var<'t, F>) -> Var<'t, F> {
        let mut kernels = self.kernels.iter();
        let first = kernels.next().map(|k| k.k_diag(tape, x));
        let init = first.unwrap_or_else(|| tape.constant(Array2::zeros((x.dim().0, 1))));
        kernels.fold(init, |acc, k| acc + k.k_diag(tape, x))
    }
}

/// Multi-output kernel with independent channels.
///
/// Inputs carry the channel index in their first column, the remaining
/// columns are passed to the base kernel. Points of different channels are
/// uncorrelated.
#[derive(Debug)]
pub struct IndependentOutputs<F: Float> {
    base: Box<dyn Kernel<F>>,
    output_dims: usize,
}

impl<F: Float> IndependentOutputs<F> {
    /// `output_dims` channels sharing `base` hyperparameters
    pub fn new(base: impl Kernel<F> + 'static, output_dims: usize) -> Result<IndependentOutputs<F>> {
        if output_dims == 0 {
            return Err(GpError::InvalidValueError(
                "IndependentOutputs needs at least one output channel".to_string(),
            ));
        }
        Ok(IndependentOutputs {
            base: Box::new(base),
            output_dims,
        })
    }

    /// Kernel shared by every channel
    pub fn base(&self) -> &dyn Kernel<F> {
        self.base.as_ref()
    }
}

/// Fail unless the first column of `x` holds channel indices in `0..output_dims`.
/// Single output inputs are not checked.
pub(crate) fn check_channels<F: Float>(x: &Array2<F>, output_dims: usize) -> Result<()> {
    if output_dims <= 1 {
        return Ok(());
    }
    let bound = F::cast(output_dims);
    let col = x.column(0);
    let invalid = col.iter().find(|c| {
        !c.is_finite() || **c < F::zero() || c.fract() != F::zero() || **c >= bound
    });
    match invalid {
        Some(c) => Err(GpError::InvalidValueError(format!(
            "channel index {c} in X[:, 0] must be an integer in [0, {output_dims})"
        ))),
        None => Ok(()),
    }
}

/// Channel index stored in the first column of `x`, assumed checked with [`check_channels`]
pub(crate) fn channels<F: Float>(x: &Array2<F>) -> Vec<usize> {
    x.column(0)
        .iter()
        .map(|c| c.round().to_usize().unwrap_or(0))
        .collect()
}

impl<F: Float> Parametrized<F> for IndependentOutputs<F> {
    fn collect_parameters<'a>(&'a self, path: &str, out: &mut Vec<(String, &'a Parameter<F>)>) {
        self.base
            .collect_parameters(&join_path(path, "IndependentOutputs"), out);
    }

    fn collect_parameters_mut<'a>(
        &'a mut self,
        path: &str,
        out: &mut Vec<(String, &'a mut Parameter<F>)>,
    ) {
        self.base
            .collect_parameters_mut(&join_path(path, "IndependentOutputs"), out);
    }
}

impl<F: Float> Kernel<F> for IndependentOutputs<F> {
    fn name(&self) -> &str {
        "IndependentOutputs"
    }

    fn input_dims(&self) -> usize {
        self.base.input_dims() + 1
    }

    fn output_dims(&self) -> usize {
        self.output_dims
    }

    fn k<'t>(&self, tape: &'t Tape<F>, x1: Var<'t, F>, x2: Option<Var<'t, F>>) -> Var<'t, F> {
        let c1 = channels(&x1.value());
        let c2 = x2.map(|x2| channels(&x2.value())).unwrap_or_else(|| c1.clone());
        let mask = Array2::from_shape_fn((c1.len(), c2.len()), |(i, j)| {
            if c1[i] == c2[j] { F::one() } else { F::zero() }
        });
        let k = self
            .base
            .k(tape, x1.columns(1), x2.map(|x2| x2.columns(1)));
        k * tape.constant(mask)
    }

    fn k_diag<'t>(&self, tape: &'t Tape<F>, x: Var<'t, F>) -> Var<'t, F> {
        self.base.k_diag(tape, x.columns(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use finitediff::FiniteDiff;
    use ndarray::{Array, array};

    fn xt() -> Array2<f64> {
        array![[0., 1.], [2., 3.], [4., 5.]]
    }

    macro_rules! test_kernel {
        ($kernel:ident, $k01:expr, $k02:expr) => {
            paste! {
                #[test]
                fn [<test_ $kernel:snake _values>]() {
                    let kernel = $kernel::new(2)
                        .with_variance(2.)
                        .unwrap()
                        .with_lengthscale(&[1., 2.])
                        .unwrap();
                    let k = kernel.eval(&xt(), None);
                    assert_abs_diff_eq!(k[[0, 0]], 2., epsilon = 1e-12);
                    assert_abs_diff_eq!(k[[0, 1]], 2. * $k01, epsilon = 1e-10);
                    assert_abs_diff_eq!(k[[2, 0]], 2. * $k02, epsilon = 1e-10);
                    assert_abs_diff_eq!(k, k.t(), epsilon = 1e-15);
                    assert_abs_diff_eq!(kernel.eval_diag(&xt()), array![2., 2., 2.]);
                }

                #[test]
                fn [<test_ $kernel:snake _lengthscale_gradient>]() {
                    let kernel = $kernel::new(2).with_lengthscale(&[0.7, 1.3]).unwrap();
                    let x2 = array![[0.5, 0.5], [3., 4.]];

                    let tape = Tape::new();
                    let k = kernel.k(
                        &tape,
                        tape.constant(xt()),
                        Some(tape.constant(x2.to_owned())),
                    );
                    let grads = tape.backward(k.sum()).unwrap();
                    let grad = grads.wrt_or_zeros(kernel.lengthscale());

                    let u0 = kernel.lengthscale().unconstrained().to_owned();
                    let f = |u: &Vec<f64>| {
                        let mut kernel = $kernel::new(2);
                        kernel
                            .lengthscale_mut()
                            .assign_unconstrained(&Array::from_shape_vec((1, 2), u.to_owned()).unwrap())
                            .unwrap();
                        kernel.eval(&xt(), Some(&x2)).sum()
                    };
                    let fd = u0.iter().cloned().collect::<Vec<_>>().central_diff(&f);
                    assert_abs_diff_eq!(grad.row(0).to_owned(), Array::from_vec(fd), epsilon = 1e-6);
                }
            }
        };
    }

    test_kernel!(SquaredExponential, 0.0820849986238988, 4.5399929762484854e-05);
    test_kernel!(AbsoluteExponential, 0.10687792566038574, 0.01142289099346694);
    test_kernel!(Matern32, 0.10133970398809887, 0.0037824851141832253);
    test_kernel!(Matern52, 0.09657724032022504, 0.002012730219470162);

    #[test]
    fn test_invalid_lengthscale() {
        assert!(SquaredExponential::<f64>::new(2).with_lengthscale(&[1., 2., 3.]).is_err());
        assert!(SquaredExponential::<f64>::new(2).with_lengthscale(&[-1.]).is_err());
        assert!(SquaredExponential::<f64>::new(2).with_variance(0.).is_err());
    }

    #[test]
    fn test_sum_kernel() {
        let sum = Sum::new(vec![
            Box::new(SquaredExponential::<f64>::new(2)) as Box<dyn Kernel<f64>>,
            Box::new(Matern32::<f64>::new(2)),
        ])
        .unwrap();
        let expected = SquaredExponential::new(2).eval(&xt(), None) + Matern32::new(2).eval(&xt(), None);
        assert_abs_diff_eq!(sum.eval(&xt(), None), expected, epsilon = 1e-12);
        assert_abs_diff_eq!(sum.eval_diag(&xt()), array![2., 2., 2.]);

        let mut names = Vec::new();
        sum.collect_parameters("", &mut names);
        let names: Vec<_> = names.into_iter().map(|(name, _)| name).collect();
        assert_eq!(
            names,
            vec![
                "Sum[0].SquaredExponential.variance",
                "Sum[0].SquaredExponential.lengthscale",
                "Sum[1].Matern32.variance",
                "Sum[1].Matern32.lengthscale",
            ]
        );
        assert!(Sum::new(vec![
            Box::new(SquaredExponential::<f64>::new(2)) as Box<dyn Kernel<f64>>,
            Box::new(Matern32::<f64>::new(1)),
        ])
        .is_err());
    }

    #[test]
    fn test_independent_outputs() {
        let kernel = IndependentOutputs::new(SquaredExponential::<f64>::new(1), 2).unwrap();
        assert_eq!(kernel.input_dims(), 2);
        assert_eq!(kernel.output_dims(), 2);
        let x = array![[0., 0.], [0., 1.], [1., 0.], [1., 1.]];
        let k = kernel.eval(&x, None);
        assert_abs_diff_eq!(k[[0, 1]], (-0.5f64).exp(), epsilon = 1e-12);
        assert_abs_diff_eq!(k[[0, 2]], 0.);
        assert_abs_diff_eq!(k[[1, 3]], 0.);
        assert_abs_diff_eq!(k[[1, 1]], 1.);
        assert_abs_diff_eq!(k[[2, 3]], (-0.5f64).exp(), epsilon = 1e-12);
        assert_eq!(channels(&x), vec![0, 0, 1, 1]);
    }

    #[test]
    fn test_check_channels() {
        assert!(check_channels(&array![[0., 0.5], [1., 2.]], 2).is_ok());
        for c in [-1., 0.5, 2., f64::NAN] {
            assert!(matches!(
                check_channels(&array![[0., 0.5], [c, 2.]], 2),
                Err(GpError::InvalidValueError(_))
            ));
        }
        // the first column is an ordinary input for a single output
        assert!(check_channels(&array![[-0.3], [0.7]], 1).is_ok());
    }
}
