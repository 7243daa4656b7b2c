//! A module for metrics to evaluate GP model predictions against observed values.
//!
//! Percentage errors skip observations too close to zero to be meaningful.

use linfa::Float;
use ndarray::{ArrayBase, Data, Ix1, Zip};
use std::fmt;
use std::str::FromStr;

use crate::errors::GpError;

/// Observations with an absolute value below this threshold are skipped by MAPE
const MAPE_THRESHOLD: f64 = 1e-6;

/// Error measures between observed and predicted values
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ErrorMethod {
    /// Mean absolute error
    #[default]
    Mae,
    /// Mean absolute percentage error
    Mape,
    /// Symmetric mean absolute percentage error
    Smape,
    /// Mean squared error
    Mse,
    /// Root mean squared error
    Rmse,
}

impl fmt::Display for ErrorMethod {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ErrorMethod::Mae => "MAE",
            ErrorMethod::Mape => "MAPE",
            ErrorMethod::Smape => "sMAPE",
            ErrorMethod::Mse => "MSE",
            ErrorMethod::Rmse => "RMSE",
        };
        write!(f, "{s}")
    }
}

impl FromStr for ErrorMethod {
    type Err = GpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mae" => Ok(ErrorMethod::Mae),
            "mape" => Ok(ErrorMethod::Mape),
            "smape" => Ok(ErrorMethod::Smape),
            "mse" => Ok(ErrorMethod::Mse),
            "rmse" => Ok(ErrorMethod::Rmse),
            _ => Err(GpError::InvalidValueError(format!(
                "unknown error method {s}, valid methods are MAE, MAPE, sMAPE, MSE and RMSE"
            ))),
        }
    }
}

impl ErrorMethod {
    /// Error between `y_true` and `y_pred`
    pub fn compute<F: Float>(
        &self,
        y_true: &ArrayBase<impl Data<Elem = F>, Ix1>,
        y_pred: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> F {
        match self {
            ErrorMethod::Mae => mean_absolute_error(y_true, y_pred),
            ErrorMethod::Mape => mean_absolute_percentage_error(y_true, y_pred),
            ErrorMethod::Smape => symmetric_mean_absolute_percentage_error(y_true, y_pred),
            ErrorMethod::Mse => mean_squared_error(y_true, y_pred),
            ErrorMethod::Rmse => root_mean_squared_error(y_true, y_pred),
        }
    }
}

fn mean_of<F: Float>(values: impl Iterator<Item = F>) -> F {
    let (sum, n) = values.fold((F::zero(), 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        F::zero()
    } else {
        sum / F::cast(n)
    }
}

/// Mean absolute error `mean(|y - ŷ|)`
pub fn mean_absolute_error<F: Float>(
    y_true: &ArrayBase<impl Data<Elem = F>, Ix1>,
    y_pred: &ArrayBase<impl Data<Elem = F>, Ix1>,
) -> F {
    let diff = Zip::from(y_true)
        .and(y_pred)
        .map_collect(|t, p| (*t - *p).abs());
    mean_of(diff.into_iter())
}

/// Mean absolute percentage error `100 mean(|y - ŷ| / |y|)`
pub fn mean_absolute_percentage_error<F: Float>(
    y_true: &ArrayBase<impl Data<Elem = F>, Ix1>,
    y_pred: &ArrayBase<impl Data<Elem = F>, Ix1>,
) -> F {
    let threshold = F::cast(MAPE_THRESHOLD);
    let errors = y_true
        .iter()
        .zip(y_pred.iter())
        .filter(|(t, _)| t.abs() > threshold)
        .map(|(t, p)| ((*t - *p) / *t).abs());
    mean_of(errors) * F::cast(100.)
}

/// Symmetric mean absolute percentage error `100 mean(2 |y - ŷ| / (|y| + |ŷ|))`
pub fn symmetric_mean_absolute_percentage_error<F: Float>(
    y_true: &ArrayBase<impl Data<Elem = F>, Ix1>,
    y_pred: &ArrayBase<impl Data<Elem = F>, Ix1>,
) -> F {
    let errors = y_true
        .iter()
        .zip(y_pred.iter())
        .filter(|(t, p)| t.abs() + p.abs() > F::zero())
        .map(|(t, p)| F::cast(2.) * (*t - *p).abs() / (t.abs() + p.abs()));
    mean_of(errors) * F::cast(100.)
}

/// Mean squared error `mean((y - ŷ)²)`
pub fn mean_squared_error<F: Float>(
    y_true: &ArrayBase<impl Data<Elem = F>, Ix1>,
    y_pred: &ArrayBase<impl Data<Elem = F>, Ix1>,
) -> F {
    let diff = Zip::from(y_true)
        .and(y_pred)
        .map_collect(|t, p| (*t - *p) * (*t - *p));
    mean_of(diff.into_iter())
}

/// Root mean squared error `sqrt(mean((y - ŷ)²))`
pub fn root_mean_squared_error<F: Float>(
    y_true: &ArrayBase<impl Data<Elem = F>, Ix1>,
    y_pred: &ArrayBase<impl Data<Elem = F>, Ix1>,
) -> F {
    mean_squared_error(y_true, y_pred).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_errors() {
        let y_true = array![1., 2., 0., -4.];
        let y_pred = array![1.5, 1., 0., -3.];
        assert_abs_diff_eq!(mean_absolute_error(&y_true, &y_pred), 0.625);
        assert_abs_diff_eq!(mean_squared_error(&y_true, &y_pred), 2.25 / 4.);
        assert_abs_diff_eq!(root_mean_squared_error(&y_true, &y_pred), 0.75);
        // zero observation skipped
        assert_abs_diff_eq!(
            mean_absolute_percentage_error(&y_true, &y_pred),
            100. * (0.5 + 0.5 + 0.25) / 3.,
            epsilon = 1e-12
        );
        assert_abs_diff_eq!(
            symmetric_mean_absolute_percentage_error(&y_true, &y_pred),
            100. * (1. / 2.5 + 2. / 3. + 2. / 7.) / 3.,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_error_method_parsing() {
        assert_eq!("sMAPE".parse::<ErrorMethod>().unwrap(), ErrorMethod::Smape);
        assert_eq!("rmse".parse::<ErrorMethod>().unwrap(), ErrorMethod::Rmse);
        assert!("r2".parse::<ErrorMethod>().is_err());
        assert_eq!(ErrorMethod::Mape.to_string(), "MAPE");
        let y = array![1., 2.];
        assert_abs_diff_eq!(ErrorMethod::Mae.compute(&y, &y), 0.);
    }
}
