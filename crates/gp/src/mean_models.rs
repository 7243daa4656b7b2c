//! A module for mean functions of the GP prior.
//!
//! Models regress the mean of the latent process on the inputs; the GP then
//! fits the residuals. The following models are implemented:
//! * constant,
//! * linear

use crate::autodiff::{Tape, Var};
use crate::errors::{GpError, Result};
use crate::parameter::{Parameter, Parametrized, join_path};
use linfa::Float;
use ndarray::{Array1, Array2, Axis};
use std::fmt;

/// A trait for mean functions used in GP models
pub trait Mean<F: Float>: Parametrized<F> + fmt::Debug {
    /// Name used as prefix of the mean parameter names
    fn name(&self) -> &str;

    /// Mean at the rows of `x` (n, d) as a (n, 1) column
    fn mean<'t>(&self, tape: &'t Tape<F>, x: Var<'t, F>) -> Var<'t, F>;

    /// Numeric mean at the rows of `x`
    fn eval(&self, x: &Array2<F>) -> Array1<F> {
        let tape = Tape::no_grad();
        self.mean(&tape, tape.constant(x.to_owned()))
            .value()
            .remove_axis(Axis(1))
    }
}

/// A constant function as mean of the GP
#[derive(Debug)]
pub struct ConstantMean<F: Float> {
    bias: Parameter<F>,
}

impl<F: Float> Default for ConstantMean<F> {
    fn default() -> Self {
        ConstantMean::new(F::zero())
    }
}

impl<F: Float> ConstantMean<F> {
    /// Constant mean `m(x) = bias`
    pub fn new(bias: F) -> ConstantMean<F> {
        ConstantMean {
            bias: Parameter::scalar("bias", bias),
        }
    }

    /// Bias parameter
    pub fn bias(&self) -> &Parameter<F> {
        &self.bias
    }

    /// Mutable bias parameter
    pub fn bias_mut(&mut self) -> &mut Parameter<F> {
        &mut self.bias
    }
}

impl<F: Float> Parametrized<F> for ConstantMean<F> {
    fn collect_parameters<'a>(&'a self, path: &str, out: &mut Vec<(String, &'a Parameter<F>)>) {
        self.bias
            .collect_parameters(&join_path(path, "ConstantMean"), out);
    }

    fn collect_parameters_mut<'a>(
        &'a mut self,
        path: &str,
        out: &mut Vec<(String, &'a mut Parameter<F>)>,
    ) {
        self.bias
            .collect_parameters_mut(&join_path(path, "ConstantMean"), out);
    }
}

impl<F: Float> Mean<F> for ConstantMean<F> {
    fn name(&self) -> &str {
        "ConstantMean"
    }

    fn mean<'t>(&self, tape: &'t Tape<F>, x: Var<'t, F>) -> Var<'t, F> {
        tape.constant(Array2::ones((x.dim().0, 1))) * tape.parameter(&self.bias)
    }
}

/// An affine function as mean of the GP
#[derive(Debug)]
pub struct LinearMean<F: Float> {
    bias: Parameter<F>,
    weight: Parameter<F>,
}

impl<F: Float> LinearMean<F> {
    /// Affine mean `m(x) = bias + Σ_i weight_i x_i` with zero coefficients
    pub fn new(input_dims: usize) -> LinearMean<F> {
        LinearMean {
            bias: Parameter::scalar("bias", F::zero()),
            weight: Parameter::new("weight", Array2::zeros((1, input_dims))),
        }
    }

    /// Set the initial coefficients
    pub fn with_coefficients(mut self, bias: F, weight: &[F]) -> Result<LinearMean<F>> {
        let dim = self.weight.dim().1;
        if weight.len() != dim {
            return Err(GpError::ShapeError(format!(
                "LinearMean: expected {} weights, got {}",
                dim,
                weight.len()
            )));
        }
        self.bias.assign_scalar(bias)?;
        let weight = Array2::from_shape_vec((1, dim), weight.to_vec())
            .map_err(|e| GpError::ShapeError(e.to_string()))?;
        self.weight.assign(weight, None, None, None)?;
        Ok(self)
    }

    /// Bias parameter
    pub fn bias(&self) -> &Parameter<F> {
        &self.bias
    }

    /// Weight parameter of shape (1, input_dims)
    pub fn weight(&self) -> &Parameter<F> {
        &self.weight
    }
}

impl<F: Float> Parametrized<F> for LinearMean<F> {
    fn collect_parameters<'a>(&'a self, path: &str, out: &mut Vec<(String, &'a Parameter<F>)>) {
        let path = join_path(path, "LinearMean");
        self.bias.collect_parameters(&path, out);
        self.weight.collect_parameters(&path, out);
    }

    fn collect_parameters_mut<'a>(
        &'a mut self,
        path: &str,
        out: &mut Vec<(String, &'a mut Parameter<F>)>,
    ) {
        let path = join_path(path, "LinearMean");
        self.bias.collect_parameters_mut(&path, out);
        self.weight.collect_parameters_mut(&path, out);
    }
}

impl<F: Float> Mean<F> for LinearMean<F> {
    fn name(&self) -> &str {
        "LinearMean"
    }

    fn mean<'t>(&self, tape: &'t Tape<F>, x: Var<'t, F>) -> Var<'t, F> {
        let weight = tape.parameter(&self.weight);
        x.matmul(weight.t()) + tape.parameter(&self.bias)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_constant_mean() {
        let mean = ConstantMean::new(1.5);
        let x = array![[0.], [1.], [2.]];
        assert_abs_diff_eq!(mean.eval(&x), array![1.5, 1.5, 1.5]);
    }

    #[test]
    fn test_linear_mean() {
        let mean = LinearMean::new(2).with_coefficients(1., &[2., -1.]).unwrap();
        let x = array![[0., 0.], [1., 2.], [3., 1.]];
        assert_abs_diff_eq!(mean.eval(&x), array![1., 1., 6.]);
        assert!(LinearMean::<f64>::new(2).with_coefficients(0., &[1.]).is_err());
    }

    #[test]
    fn test_linear_mean_gradient() {
        let mean = LinearMean::new(2).with_coefficients(1., &[2., -1.]).unwrap();
        let x = array![[0., 0.], [1., 2.], [3., 1.]];
        let tape = Tape::new();
        let m = mean.mean(&tape, tape.constant(x));
        let grads = tape.backward(m.sum()).unwrap();
        assert_abs_diff_eq!(grads.wrt(mean.weight()).unwrap(), &array![[4., 3.]]);
        assert_abs_diff_eq!(grads.wrt(mean.bias()).unwrap(), &array![[3.]]);
    }
}
