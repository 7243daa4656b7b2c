//! Behaviour shared by every GP inference model.
//!
//! [`GpBase`] owns the training data, the kernel, the optional mean function
//! and the jitter. The [`GpModel`] trait is implemented by every inference
//! model and provides, on top of the model specific evidence and prediction,
//! the parameter registry, the training loss with its gradient, the
//! stabilized Cholesky factorization and sampling.

use crate::autodiff::{Tape, Var, cholesky_factor};
use crate::errors::{CholeskyFailure, GpError, ParameterSnapshot, Result};
use crate::kernels::{Kernel, check_channels};
use crate::likelihoods::Likelihood;
use crate::mean_models::Mean;
use crate::metrics::ErrorMethod;
use crate::parameter::{Parameter, ParameterState, Parametrized};
use linfa::Float;
use linfa_linalg::LinalgError;
use log::{debug, warn};
use ndarray::{Array1, Array2, ArrayBase, Axis, Data, Dimension, Ix2};
use ndarray_rand::RandomExt;
use ndarray_rand::rand::Rng;
use ndarray_rand::rand_distr::StandardNormal;
use std::collections::HashSet;

/// Default relative jitter added to covariance diagonals
pub const DEFAULT_JITTER: f64 = 1e-8;

/// Smallest jitter meaningful for the precision of `F`
pub fn jitter_floor<F: Float>() -> F {
    if std::mem::size_of::<F>() <= 4 {
        F::cast(1e-6)
    } else {
        F::cast(1e-15)
    }
}

/// Convert `x` into a (n, d) matrix.
///
/// A scalar becomes a (1, 1) matrix and a vector a (n, 1) column; higher
/// ranks and empty inputs are rejected.
pub fn to_matrix<F: Float, D: Dimension>(
    name: &str,
    x: &ArrayBase<impl Data<Elem = F>, D>,
) -> Result<Array2<F>> {
    let x = match x.ndim() {
        0 => Array2::from_elem((1, 1), x.iter().cloned().next().unwrap_or(F::zero())),
        1 => Array2::from_shape_vec((x.len(), 1), x.iter().cloned().collect())
            .map_err(|e| GpError::ShapeError(e.to_string()))?,
        2 => x
            .view()
            .into_dimensionality::<Ix2>()
            .map_err(|e| GpError::ShapeError(e.to_string()))?
            .to_owned(),
        _ => {
            return Err(GpError::ShapeError(format!(
                "{name} must have dimensions (data_points, input_dims) with input_dims optional"
            )));
        }
    };
    if x.is_empty() {
        return Err(GpError::ShapeError(format!("{name} must not be empty")));
    }
    Ok(x)
}

/// Validate training data and return `x` as (n, d) and `y` as (n, 1)
pub fn check_training_data<F: Float, D1: Dimension, D2: Dimension>(
    x: &ArrayBase<impl Data<Elem = F>, D1>,
    y: &ArrayBase<impl Data<Elem = F>, D2>,
) -> Result<(Array2<F>, Array2<F>)> {
    let x = to_matrix("X", x)?;
    if y.ndim() > 2 || (y.ndim() == 2 && y.shape()[1] != 1) {
        return Err(GpError::ShapeError(
            "y must have one dimension (data_points,)".to_string(),
        ));
    }
    let y = to_matrix("y", y)?;
    if x.nrows() != y.nrows() {
        return Err(GpError::ShapeError(format!(
            "number of data points for X and y must match: {} != {}",
            x.nrows(),
            y.nrows()
        )));
    }
    Ok((x, y))
}

/// Training data, kernel and mean function of a GP model
#[derive(Debug)]
pub struct GpBase<F: Float> {
    name: String,
    kernel: Box<dyn Kernel<F>>,
    mean: Option<Box<dyn Mean<F>>>,
    x: Array2<F>,
    y: Array2<F>,
    jitter: F,
}

impl<F: Float> GpBase<F> {
    /// Validate and assemble the shared model state
    pub fn new<D1: Dimension, D2: Dimension>(
        name: &str,
        kernel: Box<dyn Kernel<F>>,
        mean: Option<Box<dyn Mean<F>>>,
        x: &ArrayBase<impl Data<Elem = F>, D1>,
        y: &ArrayBase<impl Data<Elem = F>, D2>,
        jitter: F,
    ) -> Result<GpBase<F>> {
        let (x, y) = check_training_data(x, y)?;
        if kernel.input_dims() != x.ncols() {
            return Err(GpError::ShapeError(format!(
                "kernel {} expects {} input dimensions, X has {}",
                kernel.name(),
                kernel.input_dims(),
                x.ncols()
            )));
        }
        check_channels(&x, kernel.output_dims())?;
        if let Some(mean) = &mean {
            let mu = mean.eval(&x);
            if mu.len() != y.nrows() {
                return Err(GpError::ShapeError(format!(
                    "mean and y data must match shapes: {} != {}",
                    mu.len(),
                    y.nrows()
                )));
            }
        }
        let floor = jitter_floor::<F>();
        let jitter = if jitter < floor {
            debug!("{name}: jitter {jitter} raised to precision floor {floor}");
            floor
        } else {
            jitter
        };
        Ok(GpBase {
            name: name.to_string(),
            kernel,
            mean,
            x,
            y,
            jitter,
        })
    }

    /// Model name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kernel
    pub fn kernel(&self) -> &dyn Kernel<F> {
        self.kernel.as_ref()
    }

    /// Mean function if any
    pub fn mean(&self) -> Option<&dyn Mean<F>> {
        self.mean.as_deref()
    }

    /// Training inputs (n, d)
    pub fn x(&self) -> &Array2<F> {
        &self.x
    }

    /// Training outputs (n, 1)
    pub fn y(&self) -> &Array2<F> {
        &self.y
    }

    /// Relative jitter
    pub fn jitter(&self) -> F {
        self.jitter
    }

    /// Number of input columns
    pub fn input_dims(&self) -> usize {
        self.x.ncols()
    }

    /// Validate prediction inputs and return them as a (n, d) matrix
    pub fn check_input<D: Dimension>(&self, x: &ArrayBase<impl Data<Elem = F>, D>) -> Result<Array2<F>> {
        let x = to_matrix("X", x)?;
        if x.ncols() != self.input_dims() {
            return Err(GpError::ShapeError(format!(
                "X must have {} input dimensions, got {}",
                self.input_dims(),
                x.ncols()
            )));
        }
        check_channels(&x, self.kernel.output_dims())?;
        Ok(x)
    }

    /// Training outputs minus the mean function at the training inputs
    pub(crate) fn centered_y<'t>(&self, tape: &'t Tape<F>) -> Var<'t, F> {
        let y = tape.constant(self.y.to_owned());
        match &self.mean {
            Some(mean) => y - mean.mean(tape, tape.constant(self.x.to_owned())),
            None => y,
        }
    }

    /// Mean function at the rows of `x` recorded on `tape`, zeros without
    /// mean function
    pub(crate) fn mean_on<'t>(&self, tape: &'t Tape<F>, x: Var<'t, F>) -> Var<'t, F> {
        match &self.mean {
            Some(mean) => mean.mean(tape, x),
            None => tape.constant(Array2::zeros((x.dim().0, 1))),
        }
    }

    /// Mean function at `x` as a (n, 1) column, zeros without mean function
    pub(crate) fn mean_at(&self, x: &Array2<F>) -> Array2<F> {
        match &self.mean {
            Some(mean) => mean.eval(x).insert_axis(Axis(1)),
            None => Array2::zeros((x.nrows(), 1)),
        }
    }

    /// Validate the training outputs for `likelihood` and its channel count
    /// against the kernel
    pub(crate) fn check_likelihood(&self, likelihood: &dyn Likelihood<F>) -> Result<()> {
        if likelihood.output_dims() > 1 && likelihood.output_dims() != self.kernel.output_dims() {
            return Err(GpError::ShapeError(format!(
                "kernel and likelihood must have matching output dimensions: {} != {}",
                self.kernel.output_dims(),
                likelihood.output_dims()
            )));
        }
        check_channels(&self.x, likelihood.output_dims())?;
        likelihood.validate_y(&self.y, &self.x)
    }

    /// Kernel, likelihood then mean parameters
    pub(crate) fn collect_with_likelihood<'a>(
        &'a self,
        likelihood: &'a dyn Parametrized<F>,
        path: &str,
        out: &mut Vec<(String, &'a Parameter<F>)>,
    ) {
        self.kernel.collect_parameters(path, out);
        likelihood.collect_parameters(path, out);
        if let Some(mean) = &self.mean {
            mean.collect_parameters(path, out);
        }
    }

    /// Mutable counterpart of [`GpBase::collect_with_likelihood`]
    pub(crate) fn collect_with_likelihood_mut<'a>(
        &'a mut self,
        likelihood: &'a mut dyn Parametrized<F>,
        path: &str,
        out: &mut Vec<(String, &'a mut Parameter<F>)>,
    ) {
        self.kernel.collect_parameters_mut(path, out);
        likelihood.collect_parameters_mut(path, out);
        if let Some(mean) = &mut self.mean {
            mean.collect_parameters_mut(path, out);
        }
    }

    /// `k + jitter * mean(diag(k)) * I`
    pub(crate) fn add_jitter<'t>(&self, k: Var<'t, F>) -> Var<'t, F> {
        let n = k.dim().0;
        let tape = k.tape();
        let shift = k.diag().sum().scale(self.jitter / F::cast(n));
        k + tape.eye(n) * shift
    }
}

impl<F: Float> Parametrized<F> for GpBase<F> {
    fn collect_parameters<'a>(&'a self, path: &str, out: &mut Vec<(String, &'a Parameter<F>)>) {
        self.kernel.collect_parameters(path, out);
        if let Some(mean) = &self.mean {
            mean.collect_parameters(path, out);
        }
    }

    fn collect_parameters_mut<'a>(
        &'a mut self,
        path: &str,
        out: &mut Vec<(String, &'a mut Parameter<F>)>,
    ) {
        self.kernel.collect_parameters_mut(path, out);
        if let Some(mean) = &mut self.mean {
            mean.collect_parameters_mut(path, out);
        }
    }
}

/// The base state alone is not an inference model: its evidence and
/// prediction are not implemented.
impl<F: Float> GpModel<F> for GpBase<F> {
    fn base(&self) -> &GpBase<F> {
        self
    }

    fn predict<D: Dimension>(
        &self,
        _xs: &ArrayBase<impl Data<Elem = F>, D>,
        _full: bool,
        _predict_y: bool,
    ) -> Result<(Array2<F>, Array2<F>)> {
        Err(GpError::NotImplementedError(
            "prediction of the base model".to_string(),
        ))
    }
}

/// Training loss and its gradient w.r.t. the trainable unconstrained values
#[derive(Clone, Debug)]
pub struct Loss<F: Float> {
    /// `-log_marginal_likelihood - log_prior`
    pub value: F,
    /// Gradient in the order of [`GpModel::parameters`]
    pub gradient: Array1<F>,
}

/// A GP inference model
pub trait GpModel<F: Float>: Parametrized<F> {
    /// Shared model state
    fn base(&self) -> &GpBase<F>;

    /// Log marginal likelihood (or its lower bound) recorded on `tape`
    fn log_marginal_likelihood_on<'t>(&self, _tape: &'t Tape<F>) -> Result<Var<'t, F>> {
        Err(GpError::NotImplementedError(format!(
            "log marginal likelihood of {}",
            self.base().name()
        )))
    }

    /// Posterior predictive mean (n, 1) and variance at `xs`.
    ///
    /// The variance is a (n, n) covariance when `full` is set and a (n, 1)
    /// column otherwise. With `predict_y` the moments are those of the
    /// observations, otherwise those of the latent function.
    fn predict<D: Dimension>(
        &self,
        xs: &ArrayBase<impl Data<Elem = F>, D>,
        full: bool,
        predict_y: bool,
    ) -> Result<(Array2<F>, Array2<F>)>;

    /// Log marginal likelihood (or its lower bound)
    fn log_marginal_likelihood(&self) -> Result<F> {
        let tape = Tape::no_grad();
        Ok(self.log_marginal_likelihood_on(&tape)?.item())
    }

    /// Sum of the log prior densities of the trainable parameters
    fn log_prior_on<'t>(&self, tape: &'t Tape<F>) -> Var<'t, F> {
        self.get_parameters()
            .into_iter()
            .filter(|(_, p)| p.is_trainable())
            .filter_map(|(_, p)| p.prior().map(|prior| prior.log_density(tape.parameter(p))))
            .fold(tape.scalar(F::zero()), |acc, lp| acc + lp)
    }

    /// Sum of the log prior densities of the trainable parameters
    fn log_prior(&self) -> F {
        let tape = Tape::no_grad();
        self.log_prior_on(&tape).item()
    }

    /// Training loss `-log_marginal_likelihood - log_prior` with its gradient.
    ///
    /// Each call records a fresh tape, so no gradient state survives between calls.
    fn loss(&self) -> Result<Loss<F>> {
        let tape = Tape::new();
        let lml = self.log_marginal_likelihood_on(&tape)?;
        let loss = -(lml + self.log_prior_on(&tape));
        let grads = tape.backward(loss)?;

        let gradient = self
            .get_parameters()
            .into_iter()
            .filter(|(_, p)| p.is_trainable())
            .flat_map(|(_, p)| grads.wrt_or_zeros(p).iter().cloned().collect::<Vec<_>>())
            .collect::<Array1<F>>();
        let value = loss.item();
        debug!("{}: loss = {}", self.base().name(), value);
        Ok(Loss { value, gradient })
    }

    /// All parameters with their qualified names, in registry order
    fn get_parameters(&self) -> Vec<(String, &Parameter<F>)> {
        let mut params = Vec::new();
        self.collect_parameters("", &mut params);
        params
    }

    /// Trainable unconstrained values flattened in registry order
    fn parameters(&self) -> Array1<F> {
        self.get_parameters()
            .into_iter()
            .filter(|(_, p)| p.is_trainable())
            .flat_map(|(_, p)| p.unconstrained().iter().cloned().collect::<Vec<_>>())
            .collect()
    }

    /// Overwrite the trainable unconstrained values, in the layout of [`GpModel::parameters`]
    fn set_parameters(&mut self, values: &Array1<F>) -> Result<()> {
        let expected = self.parameters().len();
        if values.len() != expected {
            return Err(GpError::ShapeError(format!(
                "expected {} parameter values, got {}",
                expected,
                values.len()
            )));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(GpError::InvalidValueError(
                "parameter values must be finite".to_string(),
            ));
        }
        let mut params = Vec::new();
        self.collect_parameters_mut("", &mut params);
        let mut offset = 0;
        for (_, param) in params.into_iter().filter(|(_, p)| p.is_trainable()) {
            let dim = param.dim();
            let n = dim.0 * dim.1;
            let u = values
                .slice(ndarray::s![offset..offset + n])
                .to_owned()
                .into_shape(dim)
                .map_err(|e| GpError::ShapeError(e.to_string()))?;
            param.assign_unconstrained(&u)?;
            offset += n;
        }
        Ok(())
    }

    /// Parameter registered under `name`
    fn parameter(&self, name: &str) -> Option<&Parameter<F>> {
        self.get_parameters()
            .into_iter()
            .find(|(n, _)| n == name)
            .map(|(_, p)| p)
    }

    /// Mutable parameter registered under `name`
    fn parameter_mut(&mut self, name: &str) -> Option<&mut Parameter<F>> {
        let mut params = Vec::new();
        self.collect_parameters_mut("", &mut params);
        params.into_iter().find(|(n, _)| n == name).map(|(_, p)| p)
    }

    /// Number of trainable values as reported by the parameters
    fn num_parameters(&self) -> usize {
        self.get_parameters()
            .iter()
            .filter(|(_, p)| p.is_trainable())
            .map(|(_, p)| p.num_parameters())
            .sum()
    }

    /// Rows of the parameter table
    fn parameter_snapshots(&self) -> Vec<ParameterSnapshot> {
        self.get_parameters()
            .into_iter()
            .map(|(name, p)| p.snapshot(&name))
            .collect()
    }

    /// Parameter table with name, feasible range and value columns
    fn parameters_table(&self) -> String {
        format_table(&self.parameter_snapshots())
    }

    /// Print the parameter table on stdout
    fn print_parameters(&self) {
        println!("{}", self.parameters_table());
    }

    /// Lower Cholesky factor of `k`, after adding `jitter * mean(diag(k))` to
    /// its diagonal when `add_jitter` is set.
    ///
    /// A failure is returned as [`GpError::CholeskyError`] carrying the
    /// matrix and the parameter table; it is not retried.
    fn cholesky(&self, k: &Array2<F>, add_jitter: bool) -> Result<Array2<F>> {
        let mut k = k.to_owned();
        if add_jitter {
            let n = F::cast(k.nrows());
            let shift = self.base().jitter() * k.diag().sum() / n;
            k.diag_mut().mapv_inplace(|v| v + shift);
        }
        cholesky_factor(&k).map_err(|e| self.cholesky_error(e, &k))
    }

    /// Cholesky factorization recorded on a tape, see [`GpModel::cholesky`]
    fn cholesky_on<'t>(&self, k: Var<'t, F>, add_jitter: bool) -> Result<Var<'t, F>> {
        let k = if add_jitter {
            self.base().add_jitter(k)
        } else {
            k
        };
        k.cholesky().map_err(|e| self.cholesky_error(e, &k.value()))
    }

    /// Structured error of a failed factorization of `k`
    fn cholesky_error(&self, err: LinalgError, k: &Array2<F>) -> GpError {
        let failure = CholeskyFailure {
            message: err.to_string(),
            matrix: k.mapv(|v| v.to_f64().unwrap_or(f64::NAN)),
            has_nan: k.iter().any(|v| v.is_nan()),
            has_inf: k.iter().any(|v| v.is_infinite()),
            parameters: self.parameter_snapshots(),
        };
        warn!(
            "{}: Cholesky decomposition failed: {}\n{}",
            self.base().name(),
            failure,
            format_table(&failure.parameters)
        );
        GpError::CholeskyError(Box::new(failure))
    }

    /// Numeric kernel matrix between `x1` and `x2` (or `x1` itself)
    fn k<D: Dimension>(
        &self,
        x1: &ArrayBase<impl Data<Elem = F>, D>,
        x2: Option<&ArrayBase<impl Data<Elem = F>, D>>,
    ) -> Result<Array2<F>> {
        let x1 = self.base().check_input(x1)?;
        let x2 = x2.map(|x2| self.base().check_input(x2)).transpose()?;
        Ok(self.base().kernel().eval(&x1, x2.as_ref()))
    }

    /// `n` joint samples at `z` as a (points, n) matrix, drawn from the full
    /// predictive covariance stabilized by the model jitter
    fn sample(&self, z: &Array2<F>, n: usize, predict_y: bool) -> Result<Array2<F>> {
        let (mu, chol) = self.sampling_factors(z, predict_y)?;
        let u = Array2::random((z.nrows(), n), StandardNormal).mapv(|v: f64| F::cast(v));
        Ok(mu + chol.dot(&u))
    }

    /// One sample path at `z`
    fn sample_path(&self, z: &Array2<F>, predict_y: bool) -> Result<Array1<F>> {
        Ok(self.sample(z, 1, predict_y)?.remove_axis(Axis(1)))
    }

    /// [`GpModel::sample`] drawing the standard normal noise from `rng`
    fn sample_with_rng<R: Rng>(
        &self,
        z: &Array2<F>,
        n: usize,
        predict_y: bool,
        rng: &mut R,
    ) -> Result<Array2<F>>
    where
        Self: Sized,
    {
        let (mu, chol) = self.sampling_factors(z, predict_y)?;
        let u = Array2::random_using((z.nrows(), n), StandardNormal, rng).mapv(|v: f64| F::cast(v));
        Ok(mu + chol.dot(&u))
    }

    /// Predictive mean and Cholesky factor of the jittered predictive covariance
    fn sampling_factors(&self, z: &Array2<F>, predict_y: bool) -> Result<(Array2<F>, Array2<F>)> {
        let (mu, var) = self.predict(z, true, predict_y)?;
        let chol = self.cholesky(&var, true)?;
        Ok((mu, chol))
    }

    /// Prediction error of the latent mean at `x` against the observations `y`
    fn error<D: Dimension>(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, D>,
        y: &ArrayBase<impl Data<Elem = F>, ndarray::Ix1>,
        method: ErrorMethod,
    ) -> Result<F> {
        let (mu, _) = self.predict(x, false, false)?;
        if mu.nrows() != y.len() {
            return Err(GpError::ShapeError(format!(
                "expected {} observations, got {}",
                mu.nrows(),
                y.len()
            )));
        }
        Ok(method.compute(y, &mu.column(0)))
    }

    /// Serializable states of all parameters
    fn parameter_states(&self) -> Vec<ParameterState> {
        self.get_parameters()
            .into_iter()
            .map(|(name, p)| ParameterState::of(&name, p))
            .collect()
    }

    /// Restore parameter states by name.
    ///
    /// Every state must name a registered parameter with the same shape and
    /// hold values within its bounds, otherwise nothing is restored.
    fn load_parameter_states(&mut self, states: &[ParameterState]) -> Result<()> {
        {
            let params = self.get_parameters();
            for state in states {
                match params.iter().find(|(name, _)| *name == state.name) {
                    Some((_, p)) if p.dim() == state.shape => (),
                    Some((_, p)) => {
                        return Err(GpError::LoadError(format!(
                            "{}: stored shape {:?} does not match parameter shape {:?}",
                            state.name,
                            state.shape,
                            p.dim()
                        )));
                    }
                    None => {
                        return Err(GpError::LoadError(format!(
                            "unknown parameter {}",
                            state.name
                        )));
                    }
                }
            }
        }
        let snapshot = self.parameter_states();
        let mut params = Vec::new();
        self.collect_parameters_mut("", &mut params);
        let restored = states.iter().try_for_each(|state| {
            match params.iter_mut().find(|(name, _)| *name == state.name) {
                Some((_, p)) => state.restore(&mut **p),
                None => Ok(()),
            }
        });
        if let Err(err) = restored {
            for state in &snapshot {
                if let Some((_, p)) = params.iter_mut().find(|(name, _)| *name == state.name) {
                    if let Err(e) = state.restore(&mut **p) {
                        warn!("{}: rollback failed: {e}", state.name);
                    }
                }
            }
            return Err(err);
        }
        Ok(())
    }

    /// Save the parameter states as json
    #[cfg(feature = "persistent")]
    fn save_parameters(&self, path: &str) -> Result<()> {
        use std::io::Write;
        let mut file = std::fs::File::create(path)?;
        let bytes = serde_json::to_vec_pretty(&self.parameter_states())?;
        file.write_all(&bytes)?;
        Ok(())
    }

    /// Load parameter states saved with [`GpModel::save_parameters`]
    #[cfg(feature = "persistent")]
    fn load_parameters(&mut self, path: &str) -> Result<()> {
        let data = std::fs::read_to_string(path)?;
        let states: Vec<ParameterState> = serde_json::from_str(&data)?;
        self.load_parameter_states(&states)
    }
}

/// Fail when two parameters share a qualified name
pub(crate) fn check_unique_names<F: Float>(model: &impl Parametrized<F>) -> Result<()> {
    let mut params = Vec::new();
    model.collect_parameters("", &mut params);
    let mut seen = HashSet::new();
    for (name, _) in params {
        if !seen.insert(name.to_owned()) {
            return Err(GpError::InvalidValueError(format!(
                "parameter name {name} is not unique within the model"
            )));
        }
    }
    Ok(())
}

fn format_table(rows: &[ParameterSnapshot]) -> String {
    let name_width = rows.iter().map(|r| r.name.chars().count()).max().unwrap_or(0).max(4);
    let range_width = rows.iter().map(|r| r.range.chars().count()).max().unwrap_or(0).max(5);
    let mut table = format!("{:<name_width$}  {:<range_width$}  Value", "Name", "Range");
    for row in rows {
        table.push('\n');
        table.push_str(&format!(
            "{:<name_width$}  {:<range_width$}  {}",
            row.name, row.range, row.value
        ));
    }
    table
}

/// Squared euclidean norms of the columns of `v` (m, n) as a (n, 1) column
pub(crate) fn column_norms2<F: Float>(v: Var<'_, F>) -> Var<'_, F> {
    v.square().t().sum_rows()
}

/// Clamp negative variances (numerical noise) to zero, on the diagonal for a full covariance
pub(crate) fn clamp_variance<F: Float>(mut var: Array2<F>, full: bool) -> Array2<F> {
    let clamp = |v: &mut F| {
        if *v < F::zero() {
            *v = F::zero()
        }
    };
    if full {
        var.diag_mut().iter_mut().for_each(clamp);
    } else {
        var.iter_mut().for_each(clamp);
    }
    var
}

/// Compare the loss gradient of the model built by `build` with central differences
#[cfg(test)]
pub(crate) fn check_loss_gradient<M: GpModel<f64>>(build: impl Fn() -> M, epsilon: f64) {
    use finitediff::FiniteDiff;

    let model = build();
    let loss = model.loss().unwrap();
    let theta = model.parameters().to_vec();
    let fd = theta.central_diff(&|t: &Vec<f64>| {
        let mut perturbed = build();
        perturbed.set_parameters(&Array1::from_vec(t.clone())).unwrap();
        -perturbed.log_marginal_likelihood().unwrap() - perturbed.log_prior()
    });
    approx::assert_abs_diff_eq!(loss.gradient, Array1::from_vec(fd), epsilon = epsilon);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::SquaredExponential;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array, array, arr0};

    fn base() -> GpBase<f64> {
        GpBase::new(
            "base",
            Box::new(SquaredExponential::new(1)),
            None,
            &array![0., 1., 2.],
            &array![0.5, 0.1, -0.3],
            DEFAULT_JITTER,
        )
        .unwrap()
    }

    #[test]
    fn test_to_matrix() {
        assert_eq!(to_matrix("X", &arr0(2.)).unwrap(), array![[2.]]);
        assert_eq!(to_matrix("X", &array![1., 2.]).unwrap(), array![[1.], [2.]]);
        assert_eq!(to_matrix("X", &array![[1., 2.]]).unwrap(), array![[1., 2.]]);
        assert!(to_matrix("X", &Array::<f64, _>::zeros((2, 2, 2))).is_err());
        assert!(to_matrix("X", &Array1::<f64>::zeros(0)).is_err());
    }

    #[test]
    fn test_check_training_data() {
        assert!(check_training_data(&array![1., 2.], &array![1., 2.]).is_ok());
        assert!(check_training_data(&array![1., 2.], &array![1., 2., 3.]).is_err());
        assert!(check_training_data(&array![1., 2.], &array![[1., 2.], [3., 4.]]).is_err());
    }

    #[test]
    fn test_check_input() {
        let base = base();
        assert_eq!(base.check_input(&array![0.5, 1.5]).unwrap().dim(), (2, 1));
        assert!(base.check_input(&array![[0.5, 1.5]]).is_err());
    }

    #[test]
    fn test_kernel_input_dims_mismatch() {
        let res = GpBase::new(
            "base",
            Box::new(SquaredExponential::new(2)),
            None,
            &array![0., 1.],
            &array![0., 1.],
            DEFAULT_JITTER,
        );
        assert!(matches!(res, Err(GpError::ShapeError(_))));
    }

    #[test]
    fn test_jitter_floor() {
        let base = GpBase::new(
            "base",
            Box::new(SquaredExponential::<f64>::new(1)),
            None,
            &array![0., 1.],
            &array![0., 1.],
            0.,
        )
        .unwrap();
        assert_eq!(base.jitter(), 1e-15);
        assert_eq!(jitter_floor::<f32>(), 1e-6);
    }

    #[test]
    fn test_base_is_abstract() {
        let base = base();
        assert!(matches!(
            base.log_marginal_likelihood(),
            Err(GpError::NotImplementedError(_))
        ));
        assert!(matches!(base.loss(), Err(GpError::NotImplementedError(_))));
        assert!(base.predict(&array![0.5], false, false).is_err());
    }

    #[test]
    fn test_cholesky_round_trip() {
        let base = base();
        let l = array![[2.0, 0., 0.], [0.5, 1.2, 0.], [-0.3, 0.4, 0.9]];
        let k = l.dot(&l.t());
        assert_abs_diff_eq!(base.cholesky(&k, false).unwrap(), l, epsilon = 1e-12);
    }

    #[test]
    fn test_cholesky_failure_payload() {
        let base = base();
        let k = array![[1., 1.], [1., 1.]];
        let err = base.cholesky(&k, false).unwrap_err();
        let failure = err.cholesky_failure().unwrap();
        assert_eq!(failure.matrix, k);
        assert!(!failure.has_nan);
        assert_eq!(failure.parameters.len(), 2);
        assert_eq!(failure.parameters[0].name, "SquaredExponential.variance");
        assert!(base.cholesky(&array![[1., 1.], [1., 1.]], true).is_ok());
    }

    #[test]
    fn test_cholesky_duplicate_inputs() {
        let with_jitter = |jitter: f64| {
            GpBase::new(
                "duplicates",
                Box::new(SquaredExponential::new(1)),
                None,
                &array![0., 0., 1.],
                &array![0.5, 0.5, -0.3],
                jitter,
            )
            .unwrap()
        };
        let base = with_jitter(0.);
        let k = base.kernel().eval(base.x(), None);
        assert!(matches!(
            base.cholesky(&k, false),
            Err(GpError::CholeskyError(_))
        ));
        assert!(with_jitter(1e-6).cholesky(&k, true).is_ok());
    }

    #[test]
    fn test_parameters_table() {
        let base = base();
        let table = base.parameters_table();
        let lines: Vec<_> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("Name"));
        assert!(lines[1].starts_with("SquaredExponential.variance"));
        assert!(lines[1].contains("[0.00000001, ∞)"));
    }

    #[test]
    fn test_parameter_access() {
        let mut base = base();
        assert!(base.parameter("SquaredExponential.lengthscale").is_some());
        assert!(base.parameter("lengthscale").is_none());
        base.parameter_mut("SquaredExponential.variance")
            .unwrap()
            .assign_scalar(2.)
            .unwrap();
        assert_abs_diff_eq!(
            base.parameter("SquaredExponential.variance").unwrap().scalar_value(),
            2.,
            epsilon = 1e-12
        );
        assert_eq!(base.num_parameters(), 2);
        assert_eq!(base.parameters().len(), 2);
        assert!(base.set_parameters(&array![0.1]).is_err());
        base.set_parameters(&array![0.1, 0.2]).unwrap();
        assert_abs_diff_eq!(base.parameters(), array![0.1, 0.2]);
    }

    #[test]
    fn test_parameter_states() {
        let mut base = base();
        let mut states = base.parameter_states();
        states[1].value = vec![0.25];
        base.load_parameter_states(&states).unwrap();
        assert_abs_diff_eq!(
            base.parameter("SquaredExponential.lengthscale").unwrap().scalar_value(),
            0.25,
            epsilon = 1e-12
        );
        states[0].name = "Unknown.variance".to_string();
        assert!(base.load_parameter_states(&states).is_err());
    }

    #[test]
    fn test_parameter_states_rollback() {
        let mut base = base();
        let before = base.parameter_states();
        let mut states = before.clone();
        states[0].value = vec![3.];
        // negative lengthscale is out of bounds
        states[1].value = vec![-1.];
        assert!(base.load_parameter_states(&states).is_err());
        for (after, before) in base.parameter_states().iter().zip(&before) {
            assert_eq!(after.name, before.name);
            assert_abs_diff_eq!(after.value[0], before.value[0], epsilon = 1e-12);
        }
    }

    #[test]
    fn test_clamp_variance() {
        let var = clamp_variance(array![[-1e-12], [0.5]], false);
        assert_eq!(var, array![[0.], [0.5]]);
        let cov = clamp_variance(array![[-1e-12, -0.1], [-0.1, 0.5]], true);
        assert_eq!(cov, array![[0., -0.1], [-0.1, 0.5]]);
    }
}
