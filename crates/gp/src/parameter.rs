//! Bounded trainable parameters of GP inference models.
//!
//! A [`Parameter`] holds an unconstrained matrix `u` and derives its
//! constrained value through a monotonic bijection chosen from its bounds:
//!
//! * no bounds: `value = u`,
//! * lower bound only: `value = lower + softplus(u)`,
//! * upper bound only: `value = upper - softplus(-u)`,
//! * both bounds: `value = lower + (upper - lower) * sigmoid(u)`.
//!
//! Optimizers work on `u` while all model math uses the constrained value.
//! Parameter values are only changed through [`Parameter::assign`], which
//! validates shapes and bounds before mutating anything.

use crate::autodiff::{Tape, Var, sigmoid, softplus, softplus_inv};
use crate::errors::{GpError, ParameterSnapshot, Result};
use linfa::Float;
use ndarray::{Array2, ArrayBase, Data, Ix2};
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Smallest value allowed for strictly positive parameters
pub const POSITIVE_MINIMUM: f64 = 1e-8;

static NEXT_PARAMETER_ID: AtomicUsize = AtomicUsize::new(0);

/// Process-wide unique identity of a parameter, used as gradient key
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ParameterId(usize);

impl ParameterId {
    fn next() -> ParameterId {
        ParameterId(NEXT_PARAMETER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// The bijection mapping an unconstrained value to the constrained one
#[derive(Clone, Copy, Debug)]
pub enum Transform<'a, F: Float> {
    /// No bounds
    Identity,
    /// Lower bound only
    Lower(&'a Array2<F>),
    /// Upper bound only
    Upper(&'a Array2<F>),
    /// Lower and upper bounds
    Interval(&'a Array2<F>, &'a Array2<F>),
}

/// Prior distribution over the constrained value of a parameter
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Prior<F: Float> {
    /// Normal distribution
    Normal {
        /// mean
        mean: F,
        /// standard deviation
        std: F,
    },
    /// Log-normal distribution: `ln(value)` is normally distributed
    LogNormal {
        /// mean of the logarithm
        mean: F,
        /// standard deviation of the logarithm
        std: F,
    },
    /// Gamma distribution parametrized by shape and rate
    Gamma {
        /// shape `k`
        shape: F,
        /// rate `1/θ`
        rate: F,
    },
}

impl<F: Float> Prior<F> {
    /// Log density summed over all elements of `x`, recorded on the tape of `x`
    pub fn log_density<'t>(&self, x: Var<'t, F>) -> Var<'t, F> {
        let (rows, cols) = x.dim();
        let n = F::cast(rows * cols);
        let half_log_2pi = F::cast(0.5 * (2. * std::f64::consts::PI).ln());
        match *self {
            Prior::Normal { mean, std } => {
                let z = x.offset(-mean).scale(F::one() / std);
                z.square()
                    .sum()
                    .scale(F::cast(-0.5))
                    .offset(-n * (half_log_2pi + std.ln()))
            }
            Prior::LogNormal { mean, std } => {
                let lnx = x.ln();
                let z = lnx.offset(-mean).scale(F::one() / std);
                (z.square().sum().scale(F::cast(-0.5)) - lnx.sum())
                    .offset(-n * (half_log_2pi + std.ln()))
            }
            Prior::Gamma { shape, rate } => {
                let lgamma_shape = F::cast(libm::lgamma(shape.to_f64().unwrap_or(f64::NAN)));
                let constant = n * (shape * rate.ln() - lgamma_shape);
                (x.ln().sum().scale(shape - F::one()) - x.sum().scale(rate)).offset(constant)
            }
        }
    }

    /// Log density summed over all elements of `value`
    pub fn log_density_value(&self, value: &Array2<F>) -> F {
        let tape = Tape::no_grad();
        self.log_density(tape.constant(value.to_owned())).item()
    }
}

/// A named, optionally bounded matrix valued model parameter
#[derive(Debug)]
pub struct Parameter<F: Float> {
    id: ParameterId,
    name: String,
    unconstrained: Array2<F>,
    lower: Option<Array2<F>>,
    upper: Option<Array2<F>>,
    trainable: bool,
    pegged: bool,
    prior: Option<Prior<F>>,
    num_parameters: Option<usize>,
}

impl<F: Float> Parameter<F> {
    /// An unbounded trainable parameter
    pub fn new(name: &str, value: Array2<F>) -> Parameter<F> {
        Parameter {
            id: ParameterId::next(),
            name: name.to_string(),
            unconstrained: value,
            lower: None,
            upper: None,
            trainable: true,
            pegged: false,
            prior: None,
            num_parameters: None,
        }
    }

    /// An unbounded trainable (1, 1) parameter
    pub fn scalar(name: &str, value: F) -> Parameter<F> {
        Parameter::new(name, Array2::from_elem((1, 1), value))
    }

    /// A trainable parameter with elementwise bounds, either given as (1, 1)
    /// matrices or with the shape of `value`.
    pub fn bounded(
        name: &str,
        value: Array2<F>,
        lower: Option<Array2<F>>,
        upper: Option<Array2<F>>,
    ) -> Result<Parameter<F>> {
        let mut param = Parameter::new(name, Array2::zeros(value.raw_dim()));
        param.assign(value, lower, upper, None)?;
        Ok(param)
    }

    /// A trainable parameter bounded below by [`POSITIVE_MINIMUM`]
    pub fn positive(name: &str, value: Array2<F>) -> Result<Parameter<F>> {
        let lower = Array2::from_elem((1, 1), F::cast(POSITIVE_MINIMUM));
        Parameter::bounded(name, value, Some(lower), None)
    }

    /// A trainable parameter filled with ones, bounded below by [`POSITIVE_MINIMUM`]
    pub fn positive_ones(name: &str, dim: (usize, usize)) -> Parameter<F> {
        let lower = F::cast(POSITIVE_MINIMUM);
        let mut param = Parameter::new(name, Array2::from_elem(dim, softplus_inv(F::one() - lower)));
        param.lower = Some(Array2::from_elem(dim, lower));
        param
    }

    /// Unique identity of the parameter
    pub fn id(&self) -> ParameterId {
        self.id
    }

    /// Local name of the parameter (ex: `variance`)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shape of the value as (rows, cols)
    pub fn dim(&self) -> (usize, usize) {
        self.unconstrained.dim()
    }

    /// Constrained value
    pub fn value(&self) -> Array2<F> {
        let u = &self.unconstrained;
        match self.transform() {
            Transform::Identity => u.to_owned(),
            Transform::Lower(lower) => lower + &u.mapv(softplus),
            Transform::Upper(upper) => upper - &u.mapv(|v| softplus(-v)),
            Transform::Interval(lower, upper) => lower + &((upper - lower) * u.mapv(sigmoid)),
        }
    }

    /// Constrained value of a (1, 1) parameter (first element otherwise)
    pub fn scalar_value(&self) -> F {
        self.value()[[0, 0]]
    }

    /// Unconstrained representation updated by optimizers
    pub fn unconstrained(&self) -> &Array2<F> {
        &self.unconstrained
    }

    /// The bijection between unconstrained and constrained values
    pub fn transform(&self) -> Transform<'_, F> {
        match (&self.lower, &self.upper) {
            (None, None) => Transform::Identity,
            (Some(lower), None) => Transform::Lower(lower),
            (None, Some(upper)) => Transform::Upper(upper),
            (Some(lower), Some(upper)) => Transform::Interval(lower, upper),
        }
    }

    /// Elementwise lower bound
    pub fn lower(&self) -> Option<&Array2<F>> {
        self.lower.as_ref()
    }

    /// Elementwise upper bound
    pub fn upper(&self) -> Option<&Array2<F>> {
        self.upper.as_ref()
    }

    /// Whether optimizers update the parameter
    pub fn is_trainable(&self) -> bool {
        self.trainable && !self.pegged
    }

    /// Enable or disable training
    pub fn set_trainable(&mut self, trainable: bool) {
        self.trainable = trainable;
    }

    /// Fix the parameter at its current value and report it as pegged
    pub fn peg(&mut self) {
        self.pegged = true;
    }

    /// Whether the parameter is pegged
    pub fn is_pegged(&self) -> bool {
        self.pegged
    }

    /// Prior over the constrained value
    pub fn prior(&self) -> Option<&Prior<F>> {
        self.prior.as_ref()
    }

    /// Set or remove the prior
    pub fn set_prior(&mut self, prior: Option<Prior<F>>) {
        self.prior = prior;
    }

    /// Number of free values reported for the parameter, the element count
    /// unless overridden
    pub fn num_parameters(&self) -> usize {
        self.num_parameters.unwrap_or(self.unconstrained.len())
    }

    /// Override the reported number of free values
    pub fn set_num_parameters(&mut self, num_parameters: usize) {
        self.num_parameters = Some(num_parameters);
    }

    /// Assign a new constrained value.
    ///
    /// `value` must have the current shape or be (1, 1) in which case it is
    /// broadcast. Given bounds replace the current ones, `None` keeps them.
    /// `train` sets trainability when given. The parameter is left untouched
    /// when any check fails.
    pub fn assign(
        &mut self,
        value: Array2<F>,
        lower: Option<Array2<F>>,
        upper: Option<Array2<F>>,
        train: Option<bool>,
    ) -> Result<()> {
        let dim = self.unconstrained.dim();
        let value = broadcast_to(&self.name, "value", value, dim)?;
        let lower = match lower {
            Some(l) => Some(broadcast_to(&self.name, "lower bound", l, dim)?),
            None => self.lower.to_owned(),
        };
        let upper = match upper {
            Some(u) => Some(broadcast_to(&self.name, "upper bound", u, dim)?),
            None => self.upper.to_owned(),
        };

        if value.iter().any(|v| !v.is_finite()) {
            return Err(GpError::InvalidValueError(format!(
                "{}: value must be finite",
                self.name
            )));
        }
        if let (Some(l), Some(u)) = (&lower, &upper) {
            if l.iter().zip(u.iter()).any(|(l, u)| l >= u) {
                return Err(GpError::InvalidValueError(format!(
                    "{}: lower bound must be lower than upper bound",
                    self.name
                )));
            }
        }
        if let Some(l) = &lower {
            if value.iter().zip(l.iter()).any(|(v, l)| v < l) {
                return Err(GpError::InvalidValueError(format!(
                    "{}: value {} below lower bound {}",
                    self.name,
                    render(&value),
                    render_bound(l)
                )));
            }
        }
        if let Some(u) = &upper {
            if value.iter().zip(u.iter()).any(|(v, u)| v > u) {
                return Err(GpError::InvalidValueError(format!(
                    "{}: value {} above upper bound {}",
                    self.name,
                    render(&value),
                    render_bound(u)
                )));
            }
        }

        self.unconstrained = inverse_transform(&value, lower.as_ref(), upper.as_ref());
        self.lower = lower;
        self.upper = upper;
        if let Some(train) = train {
            self.trainable = train;
        }
        Ok(())
    }

    /// Assign a constrained scalar value to every element, keeping bounds
    pub fn assign_scalar(&mut self, value: F) -> Result<()> {
        self.assign(Array2::from_elem((1, 1), value), None, None, None)
    }

    /// Overwrite the unconstrained representation (optimizer step)
    pub fn assign_unconstrained(&mut self, u: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<()> {
        if u.dim() != self.unconstrained.dim() {
            return Err(GpError::ShapeError(format!(
                "{}: expected unconstrained value of shape {:?}, got {:?}",
                self.name,
                self.unconstrained.dim(),
                u.dim()
            )));
        }
        if u.iter().any(|v| !v.is_finite()) {
            return Err(GpError::InvalidValueError(format!(
                "{}: unconstrained value must be finite",
                self.name
            )));
        }
        self.unconstrained.assign(u);
        Ok(())
    }

    /// Feasible range as displayed in parameter tables
    pub fn range(&self) -> String {
        if self.pegged {
            return "pegged".to_string();
        } else if !self.trainable {
            return "fixed".to_string();
        }
        match (&self.lower, &self.upper) {
            (None, None) => "(-∞, ∞)".to_string(),
            (None, Some(u)) => format!("(-∞, {}]", render_bound(u)),
            (Some(l), None) => format!("[{}, ∞)", render_bound(l)),
            (Some(l), Some(u)) => format!("[{}, {}]", render_bound(l), render_bound(u)),
        }
    }

    /// Table row of the parameter under its fully qualified `name`
    pub fn snapshot(&self, name: &str) -> ParameterSnapshot {
        ParameterSnapshot {
            name: name.to_string(),
            range: self.range(),
            value: render(&self.value()),
        }
    }
}

impl<F: Float> fmt::Display for Parameter<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} = {}", self.name, render(&self.value()))
    }
}

/// Render a value: scalars plainly, vectors on one line
fn render<F: Float>(a: &Array2<F>) -> String {
    if a.len() == 1 {
        format!("{}", a[[0, 0]])
    } else if a.ncols() == 1 {
        format!("{}", a.column(0))
    } else if a.nrows() == 1 {
        format!("{}", a.row(0))
    } else {
        format!("{a}")
    }
}

/// Render a bound, collapsing a constant bound to its scalar
fn render_bound<F: Float>(a: &Array2<F>) -> String {
    match a.iter().next() {
        Some(first) if a.iter().all(|v| v == first) => format!("{first}"),
        _ => render(a),
    }
}

fn broadcast_to<F: Float>(
    name: &str,
    what: &str,
    a: Array2<F>,
    dim: (usize, usize),
) -> Result<Array2<F>> {
    if a.dim() == dim {
        Ok(a)
    } else if a.len() == 1 {
        Ok(Array2::from_elem(dim, a[[0, 0]]))
    } else {
        Err(GpError::ShapeError(format!(
            "{name}: {what} of shape {:?} does not match parameter shape {dim:?}",
            a.dim()
        )))
    }
}

fn inverse_transform<F: Float>(
    value: &Array2<F>,
    lower: Option<&Array2<F>>,
    upper: Option<&Array2<F>>,
) -> Array2<F> {
    let tiny = F::min_positive_value();
    match (lower, upper) {
        (None, None) => value.to_owned(),
        (Some(l), None) => (value - l).mapv(|d| softplus_inv(d.max(tiny))),
        (None, Some(u)) => (u - value).mapv(|d| -softplus_inv(d.max(tiny))),
        (Some(l), Some(u)) => {
            let eps = F::epsilon();
            let s = (value - l) / (u - l);
            s.mapv(|s| {
                let s = s.max(eps).min(F::one() - eps);
                (s / (F::one() - s)).ln()
            })
        }
    }
}

/// Capability of objects owning parameters (kernels, means, likelihoods, models)
/// to list them in a deterministic order under fully qualified names.
pub trait Parametrized<F: Float> {
    /// Append `(name, parameter)` pairs below `path` to `out`
    fn collect_parameters<'a>(&'a self, path: &str, out: &mut Vec<(String, &'a Parameter<F>)>);

    /// Mutable counterpart of [`Parametrized::collect_parameters`], in the same order
    fn collect_parameters_mut<'a>(
        &'a mut self,
        path: &str,
        out: &mut Vec<(String, &'a mut Parameter<F>)>,
    );
}

impl<F: Float> Parametrized<F> for Parameter<F> {
    fn collect_parameters<'a>(&'a self, path: &str, out: &mut Vec<(String, &'a Parameter<F>)>) {
        out.push((join_path(path, &self.name), self));
    }

    fn collect_parameters_mut<'a>(
        &'a mut self,
        path: &str,
        out: &mut Vec<(String, &'a mut Parameter<F>)>,
    ) {
        out.push((join_path(path, &self.name), self));
    }
}

/// Dotted concatenation of a parent path and a child name
pub fn join_path(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{path}.{name}")
    }
}

/// Serializable state of a parameter, keyed by its qualified name
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct ParameterState {
    /// Fully qualified name
    pub name: String,
    /// Shape as (rows, cols)
    pub shape: (usize, usize),
    /// Constrained values in row-major order
    pub value: Vec<f64>,
    /// Trainability flag
    pub trainable: bool,
}

impl ParameterState {
    /// State of `param` registered under `name`
    pub fn of<F: Float>(name: &str, param: &Parameter<F>) -> ParameterState {
        ParameterState {
            name: name.to_string(),
            shape: param.dim(),
            value: param
                .value()
                .iter()
                .map(|v| v.to_f64().unwrap_or(f64::NAN))
                .collect(),
            trainable: param.trainable,
        }
    }

    /// Restore the state into `param`
    pub fn restore<F: Float>(&self, param: &mut Parameter<F>) -> Result<()> {
        let value = Array2::from_shape_vec(self.shape, self.value.iter().map(|v| F::cast(*v)).collect())
            .map_err(|e| GpError::LoadError(format!("{}: {e}", self.name)))?;
        if value.dim() != param.dim() {
            return Err(GpError::LoadError(format!(
                "{}: stored shape {:?} does not match parameter shape {:?}",
                self.name,
                value.dim(),
                param.dim()
            )));
        }
        param.assign(value, None, None, Some(self.trainable))
    }
}
