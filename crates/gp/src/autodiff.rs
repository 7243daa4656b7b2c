//! A reverse-mode automatic differentiation context over dense matrices.
//!
//! A [`Tape`] is created for one evaluation (one `loss()` or one prediction),
//! records every matrix operation applied through [`Var`] handles, and is
//! dropped afterwards. Calling [`Tape::backward`] on a scalar (1x1) result
//! returns the [`Gradients`] of that result with respect to the unconstrained
//! values of the trainable [`Parameter`]s bound to the tape.
//!
//! All values are matrices: scalars are `(1, 1)` and vectors are `(n, 1)`
//! columns. Elementwise operations broadcast `(1, 1)` operands as well as
//! `(n, 1)` columns and `(1, m)` rows against `(n, m)` matrices.

use crate::parameter::{Parameter, ParameterId, Transform};
use linfa::Float;
use linfa_linalg::{LinalgError, cholesky::*, triangular::*};
use ndarray::{Array2, Axis, s};
use std::cell::RefCell;
use std::collections::HashMap;
use std::ops::{Add, Div, Mul, Neg, Sub};

#[derive(Clone, Debug)]
enum Op<F> {
    Leaf,
    Add(usize, usize),
    Sub(usize, usize),
    Mul(usize, usize),
    Div(usize, usize),
    Neg(usize),
    Scale(usize, F),
    Offset(usize),
    MatMul(usize, usize),
    Transpose(usize),
    Log(usize),
    Exp(usize),
    Sqrt(usize),
    Square(usize),
    Softplus(usize),
    Sigmoid(usize),
    Sum(usize),
    SumRows(usize),
    Diag(usize),
    DiagFlat(usize),
    Tril(usize),
    Cholesky(usize),
    SolveTriangular { a: usize, b: usize, lower: bool },
    SqDist(usize, usize),
    Columns(usize, usize),
    GatherRows(usize, Vec<usize>),
}

#[derive(Debug)]
struct Node<F> {
    value: Array2<F>,
    op: Op<F>,
    requires_grad: bool,
}

/// Parameter bound to a tape: gradient leaf (when tracked) and constrained value
#[derive(Clone, Copy, Debug)]
struct Binding {
    leaf: Option<usize>,
    value: usize,
}

/// Recording context of one differentiable evaluation
#[derive(Debug)]
pub struct Tape<F: Float> {
    nodes: RefCell<Vec<Node<F>>>,
    bindings: RefCell<HashMap<ParameterId, Binding>>,
    track: bool,
}

impl<F: Float> Default for Tape<F> {
    fn default() -> Self {
        Tape::new()
    }
}

impl<F: Float> Tape<F> {
    /// A tape tracking gradients of trainable parameters
    pub fn new() -> Tape<F> {
        Tape {
            nodes: RefCell::new(Vec::new()),
            bindings: RefCell::new(HashMap::new()),
            track: true,
        }
    }

    /// A tape where every parameter is bound as a constant (prediction, diagnostics)
    pub fn no_grad() -> Tape<F> {
        Tape {
            track: false,
            ..Tape::new()
        }
    }

    /// Number of recorded nodes
    pub fn len(&self) -> usize {
        self.nodes.borrow().len()
    }

    /// Whether nothing has been recorded yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&self, value: Array2<F>, op: Op<F>, requires_grad: bool) -> Var<'_, F> {
        let mut nodes = self.nodes.borrow_mut();
        nodes.push(Node {
            value,
            op,
            requires_grad,
        });
        Var {
            tape: self,
            id: nodes.len() - 1,
        }
    }

    fn requires_grad(&self, id: usize) -> bool {
        self.nodes.borrow()[id].requires_grad
    }

    /// Record a constant matrix
    pub fn constant(&self, value: Array2<F>) -> Var<'_, F> {
        self.push(value, Op::Leaf, false)
    }

    /// Record a constant scalar as a (1, 1) matrix
    pub fn scalar(&self, value: F) -> Var<'_, F> {
        self.constant(Array2::from_elem((1, 1), value))
    }

    /// Record the `n x n` identity matrix
    pub fn eye(&self, n: usize) -> Var<'_, F> {
        self.constant(Array2::eye(n))
    }

    /// Bind a parameter to the tape and return its constrained value.
    ///
    /// A parameter is bound once per tape: later calls return the same node so
    /// that every use contributes to the same gradient.
    pub fn parameter(&self, param: &Parameter<F>) -> Var<'_, F> {
        if let Some(binding) = self.bindings.borrow().get(&param.id()) {
            return Var {
                tape: self,
                id: binding.value,
            };
        }

        let binding = if self.track && param.is_trainable() {
            let leaf = self.push(param.unconstrained().to_owned(), Op::Leaf, true);
            let value = match param.transform() {
                Transform::Identity => leaf,
                Transform::Lower(lower) => self.constant(lower.to_owned()) + leaf.softplus(),
                Transform::Upper(upper) => self.constant(upper.to_owned()) - (-leaf).softplus(),
                Transform::Interval(lower, upper) => {
                    let width = upper - lower;
                    self.constant(lower.to_owned()) + self.constant(width) * leaf.sigmoid()
                }
            };
            Binding {
                leaf: Some(leaf.id),
                value: value.id,
            }
        } else {
            let value = self.constant(param.value());
            Binding {
                leaf: None,
                value: value.id,
            }
        };
        self.bindings.borrow_mut().insert(param.id(), binding);
        Var {
            tape: self,
            id: binding.value,
        }
    }

    /// Run the reverse pass from the scalar `root` and collect the gradients
    /// with respect to the unconstrained value of every tracked parameter.
    ///
    /// Fails when an adjoint linear solve fails.
    ///
    /// *Panics* if `root` is not a (1, 1) value of this tape.
    pub fn backward(&self, root: Var<'_, F>) -> Result<Gradients<F>, LinalgError> {
        assert!(
            std::ptr::eq(root.tape, self),
            "backward root must belong to this tape"
        );
        let nodes = self.nodes.borrow();
        assert_eq!(
            nodes[root.id].value.dim(),
            (1, 1),
            "backward root must be a scalar"
        );

        let mut grads: Vec<Option<Array2<F>>> = vec![None; root.id + 1];
        if nodes[root.id].requires_grad {
            grads[root.id] = Some(Array2::ones((1, 1)));
        }

        for id in (0..=root.id).rev() {
            let Some(g) = grads[id].take() else {
                continue;
            };
            let node = &nodes[id];
            if let Op::Leaf = node.op {
                grads[id] = Some(g);
                continue;
            }
            backprop(&nodes, node, g, &mut grads)?;
        }

        let by_parameter = self
            .bindings
            .borrow()
            .iter()
            .filter_map(|(pid, binding)| {
                binding
                    .leaf
                    .and_then(|leaf| grads.get_mut(leaf).and_then(|g| g.take()))
                    .map(|g| (*pid, g))
            })
            .collect();
        Ok(Gradients { by_parameter })
    }
}

/// Gradients of a scalar with respect to unconstrained parameter values
#[derive(Debug, Default)]
pub struct Gradients<F: Float> {
    by_parameter: HashMap<ParameterId, Array2<F>>,
}

impl<F: Float> Gradients<F> {
    /// Gradient with respect to the unconstrained value of `param`,
    /// `None` when the parameter was not tracked or did not contribute.
    pub fn wrt(&self, param: &Parameter<F>) -> Option<&Array2<F>> {
        self.by_parameter.get(&param.id())
    }

    /// Gradient w.r.t. `param`, zeros when the parameter did not contribute
    pub fn wrt_or_zeros(&self, param: &Parameter<F>) -> Array2<F> {
        self.wrt(param)
            .cloned()
            .unwrap_or_else(|| Array2::zeros(param.unconstrained().raw_dim()))
    }
}

/// A handle on a value recorded in a [`Tape`]
#[derive(Clone, Copy, Debug)]
pub struct Var<'t, F: Float> {
    tape: &'t Tape<F>,
    id: usize,
}

impl<'t, F: Float> Var<'t, F> {
    /// The tape this value is recorded in
    pub fn tape(&self) -> &'t Tape<F> {
        self.tape
    }

    /// A copy of the recorded value
    pub fn value(&self) -> Array2<F> {
        self.tape.nodes.borrow()[self.id].value.to_owned()
    }

    /// Shape of the recorded value as (rows, cols)
    pub fn dim(&self) -> (usize, usize) {
        self.tape.nodes.borrow()[self.id].value.dim()
    }

    /// First element of the recorded value, the scalar for (1, 1) values
    pub fn item(&self) -> F {
        self.tape.nodes.borrow()[self.id].value[[0, 0]]
    }

    fn unary(self, op: Op<F>, f: impl FnOnce(&Array2<F>) -> Array2<F>) -> Var<'t, F> {
        let value = f(&self.tape.nodes.borrow()[self.id].value);
        let requires_grad = self.tape.requires_grad(self.id);
        self.tape.push(value, op, requires_grad)
    }

    fn binary(
        self,
        other: Var<'t, F>,
        op: Op<F>,
        f: impl FnOnce(&Array2<F>, &Array2<F>) -> Array2<F>,
    ) -> Var<'t, F> {
        assert!(
            std::ptr::eq(self.tape, other.tape),
            "operands must belong to the same tape"
        );
        let value = {
            let nodes = self.tape.nodes.borrow();
            f(&nodes[self.id].value, &nodes[other.id].value)
        };
        let requires_grad = self.tape.requires_grad(self.id) || self.tape.requires_grad(other.id);
        self.tape.push(value, op, requires_grad)
    }

    /// Matrix product `self . other`
    pub fn matmul(self, other: Var<'t, F>) -> Var<'t, F> {
        self.binary(other, Op::MatMul(self.id, other.id), |a, b| a.dot(b))
    }

    /// Transposed matrix
    pub fn t(self) -> Var<'t, F> {
        self.unary(Op::Transpose(self.id), |a| a.t().to_owned())
    }

    /// Multiply by a constant
    pub fn scale(self, c: F) -> Var<'t, F> {
        self.unary(Op::Scale(self.id, c), |a| a * c)
    }

    /// Add a constant
    pub fn offset(self, c: F) -> Var<'t, F> {
        self.unary(Op::Offset(self.id), |a| a + c)
    }

    /// Elementwise natural logarithm
    pub fn ln(self) -> Var<'t, F> {
        self.unary(Op::Log(self.id), |a| a.mapv(F::ln))
    }

    /// Elementwise exponential
    pub fn exp(self) -> Var<'t, F> {
        self.unary(Op::Exp(self.id), |a| a.mapv(F::exp))
    }

    /// Elementwise square root, its derivative is taken as zero at zero
    pub fn sqrt(self) -> Var<'t, F> {
        self.unary(Op::Sqrt(self.id), |a| a.mapv(|v| v.max(F::zero()).sqrt()))
    }

    /// Elementwise square
    pub fn square(self) -> Var<'t, F> {
        self.unary(Op::Square(self.id), |a| a.mapv(|v| v * v))
    }

    /// Elementwise `log(1 + exp(x))`
    pub fn softplus(self) -> Var<'t, F> {
        self.unary(Op::Softplus(self.id), |a| a.mapv(softplus))
    }

    /// Elementwise logistic function
    pub fn sigmoid(self) -> Var<'t, F> {
        self.unary(Op::Sigmoid(self.id), |a| a.mapv(sigmoid))
    }

    /// Sum of all elements as a (1, 1) value
    pub fn sum(self) -> Var<'t, F> {
        self.unary(Op::Sum(self.id), |a| Array2::from_elem((1, 1), a.sum()))
    }

    /// Row sums as a (n, 1) column
    pub fn sum_rows(self) -> Var<'t, F> {
        self.unary(Op::SumRows(self.id), |a| a.sum_axis(Axis(1)).insert_axis(Axis(1)))
    }

    /// Diagonal of a square matrix as a (n, 1) column
    pub fn diag(self) -> Var<'t, F> {
        self.unary(Op::Diag(self.id), |a| {
            a.diag().to_owned().insert_axis(Axis(1))
        })
    }

    /// Diagonal matrix built from a (n, 1) column
    pub fn diagflat(self) -> Var<'t, F> {
        self.unary(Op::DiagFlat(self.id), |a| {
            Array2::from_diag(&a.iter().cloned().collect::<ndarray::Array1<F>>())
        })
    }

    /// Lower triangular part, the strict upper part being zeroed
    pub fn tril(self) -> Var<'t, F> {
        self.unary(Op::Tril(self.id), tril)
    }

    /// Columns `start..` of the value
    pub fn columns(self, start: usize) -> Var<'t, F> {
        self.unary(Op::Columns(self.id, start), |a| {
            a.slice(s![.., start..]).to_owned()
        })
    }

    /// Rows selected by `indices` (repetitions allowed)
    pub fn gather_rows(self, indices: Vec<usize>) -> Var<'t, F> {
        let value = {
            let nodes = self.tape.nodes.borrow();
            nodes[self.id].value.select(Axis(0), &indices)
        };
        let requires_grad = self.tape.requires_grad(self.id);
        self.tape
            .push(value, Op::GatherRows(self.id, indices), requires_grad)
    }

    /// Pairwise squared euclidean distances between the rows of `self` (n, d)
    /// and the rows of `other` (m, d) as a (n, m) matrix
    pub fn sq_dist(self, other: Var<'t, F>) -> Var<'t, F> {
        self.binary(other, Op::SqDist(self.id, other.id), sq_dist)
    }

    /// Lower Cholesky factor of a symmetric positive definite matrix
    pub fn cholesky(self) -> Result<Var<'t, F>, LinalgError> {
        let value = cholesky_factor(&self.tape.nodes.borrow()[self.id].value)?;
        let requires_grad = self.tape.requires_grad(self.id);
        Ok(self.tape.push(value, Op::Cholesky(self.id), requires_grad))
    }

    /// Solve `self . X = b` where `self` is lower triangular
    pub fn solve_lower(self, b: Var<'t, F>) -> Result<Var<'t, F>, LinalgError> {
        self.solve_triangular(b, true)
    }

    /// Solve `self . X = b` where `self` is upper triangular
    pub fn solve_upper(self, b: Var<'t, F>) -> Result<Var<'t, F>, LinalgError> {
        self.solve_triangular(b, false)
    }

    fn solve_triangular(self, b: Var<'t, F>, lower: bool) -> Result<Var<'t, F>, LinalgError> {
        let value = {
            let nodes = self.tape.nodes.borrow();
            let uplo = if lower { UPLO::Lower } else { UPLO::Upper };
            nodes[self.id].value.solve_triangular(&nodes[b.id].value, uplo)?
        };
        let requires_grad = self.tape.requires_grad(self.id) || self.tape.requires_grad(b.id);
        Ok(self.tape.push(
            value,
            Op::SolveTriangular {
                a: self.id,
                b: b.id,
                lower,
            },
            requires_grad,
        ))
    }
}

impl<'t, F: Float> Add for Var<'t, F> {
    type Output = Var<'t, F>;
    fn add(self, other: Var<'t, F>) -> Var<'t, F> {
        self.binary(other, Op::Add(self.id, other.id), |a, b| a + b)
    }
}

impl<'t, F: Float> Sub for Var<'t, F> {
    type Output = Var<'t, F>;
    fn sub(self, other: Var<'t, F>) -> Var<'t, F> {
        self.binary(other, Op::Sub(self.id, other.id), |a, b| a - b)
    }
}

impl<'t, F: Float> Mul for Var<'t, F> {
    type Output = Var<'t, F>;
    fn mul(self, other: Var<'t, F>) -> Var<'t, F> {
        self.binary(other, Op::Mul(self.id, other.id), |a, b| a * b)
    }
}

impl<'t, F: Float> Div for Var<'t, F> {
    type Output = Var<'t, F>;
    fn div(self, other: Var<'t, F>) -> Var<'t, F> {
        self.binary(other, Op::Div(self.id, other.id), |a, b| a / b)
    }
}

impl<'t, F: Float> Neg for Var<'t, F> {
    type Output = Var<'t, F>;
    fn neg(self) -> Var<'t, F> {
        self.unary(Op::Neg(self.id), |a| a.mapv(|v| -v))
    }
}

/// Numerically stable `log(1 + exp(x))`
pub(crate) fn softplus<F: Float>(x: F) -> F {
    x.max(F::zero()) + (-x.abs()).exp().ln_1p()
}

/// Inverse of [`softplus`] for `y > 0`
pub(crate) fn softplus_inv<F: Float>(y: F) -> F {
    y + (-(-y).exp_m1()).ln()
}

/// Numerically stable logistic function
pub(crate) fn sigmoid<F: Float>(x: F) -> F {
    if x >= F::zero() {
        F::one() / (F::one() + (-x).exp())
    } else {
        let e = x.exp();
        e / (F::one() + e)
    }
}

/// Lower triangular part of `a`
pub(crate) fn tril<F: Float>(a: &Array2<F>) -> Array2<F> {
    let mut res = a.to_owned();
    for ((i, j), v) in res.indexed_iter_mut() {
        if j > i {
            *v = F::zero();
        }
    }
    res
}

fn triu<F: Float>(a: &Array2<F>) -> Array2<F> {
    let mut res = a.to_owned();
    for ((i, j), v) in res.indexed_iter_mut() {
        if j < i {
            *v = F::zero();
        }
    }
    res
}

fn sq_dist<F: Float>(a: &Array2<F>, b: &Array2<F>) -> Array2<F> {
    assert_eq!(a.ncols(), b.ncols(), "sq_dist operands column mismatch");
    Array2::from_shape_fn((a.nrows(), b.nrows()), |(i, j)| {
        a.row(i)
            .iter()
            .zip(b.row(j).iter())
            .fold(F::zero(), |acc, (u, v)| acc + (*u - *v) * (*u - *v))
    })
}

/// Lower Cholesky factor of `a`.
///
/// Fails with `NotPositiveDefinite` when `a` contains non finite values or when
/// a non positive pivot is met.
pub(crate) fn cholesky_factor<F: Float>(a: &Array2<F>) -> Result<Array2<F>, LinalgError> {
    if a.iter().any(|v| !v.is_finite()) {
        return Err(LinalgError::NotPositiveDefinite);
    }
    let l = tril(&a.cholesky()?);
    if l.diag().iter().any(|d| !(d.is_finite() && *d > F::zero())) {
        return Err(LinalgError::NotPositiveDefinite);
    }
    Ok(l)
}

/// Reduce a broadcast gradient back to the operand shape
fn unbroadcast<F: Float>(g: Array2<F>, dim: (usize, usize)) -> Array2<F> {
    let mut g = g;
    if dim.0 == 1 && g.nrows() != 1 {
        g = g.sum_axis(Axis(0)).insert_axis(Axis(0));
    }
    if dim.1 == 1 && g.ncols() != 1 {
        g = g.sum_axis(Axis(1)).insert_axis(Axis(1));
    }
    g
}

fn accumulate<F: Float>(
    nodes: &[Node<F>],
    grads: &mut [Option<Array2<F>>],
    id: usize,
    delta: Array2<F>,
) {
    if !nodes[id].requires_grad {
        return;
    }
    match &mut grads[id] {
        Some(acc) => *acc += &delta,
        slot @ None => *slot = Some(delta),
    }
}

fn backprop<F: Float>(
    nodes: &[Node<F>],
    node: &Node<F>,
    g: Array2<F>,
    grads: &mut [Option<Array2<F>>],
) -> Result<(), LinalgError> {
    let value = |id: usize| &nodes[id].value;
    let dim = |id: usize| nodes[id].value.dim();
    let wants = |id: usize| nodes[id].requires_grad;
    let half = F::cast(0.5);
    let two = F::cast(2.);

    match &node.op {
        Op::Leaf => (),
        Op::Add(a, b) => {
            accumulate(nodes, grads, *a, unbroadcast(g.to_owned(), dim(*a)));
            accumulate(nodes, grads, *b, unbroadcast(g, dim(*b)));
        }
        Op::Sub(a, b) => {
            accumulate(nodes, grads, *a, unbroadcast(g.to_owned(), dim(*a)));
            accumulate(nodes, grads, *b, unbroadcast(-g, dim(*b)));
        }
        Op::Mul(a, b) => {
            if wants(*a) {
                accumulate(nodes, grads, *a, unbroadcast(&g * value(*b), dim(*a)));
            }
            if wants(*b) {
                accumulate(nodes, grads, *b, unbroadcast(&g * value(*a), dim(*b)));
            }
        }
        Op::Div(a, b) => {
            if wants(*a) {
                accumulate(nodes, grads, *a, unbroadcast(&g / value(*b), dim(*a)));
            }
            if wants(*b) {
                let gb = -(&g * &node.value) / value(*b);
                accumulate(nodes, grads, *b, unbroadcast(gb, dim(*b)));
            }
        }
        Op::Neg(a) => accumulate(nodes, grads, *a, -g),
        Op::Scale(a, c) => accumulate(nodes, grads, *a, g * *c),
        Op::Offset(a) => accumulate(nodes, grads, *a, g),
        Op::MatMul(a, b) => {
            if wants(*a) {
                accumulate(nodes, grads, *a, g.dot(&value(*b).t()));
            }
            if wants(*b) {
                accumulate(nodes, grads, *b, value(*a).t().dot(&g));
            }
        }
        Op::Transpose(a) => accumulate(nodes, grads, *a, g.t().to_owned()),
        Op::Log(a) => accumulate(nodes, grads, *a, g / value(*a)),
        Op::Exp(a) => accumulate(nodes, grads, *a, g * &node.value),
        Op::Sqrt(a) => {
            let mut ga = g;
            ga.zip_mut_with(&node.value, |gv, &r| {
                *gv = if r > F::zero() {
                    *gv * half / r
                } else {
                    F::zero()
                }
            });
            accumulate(nodes, grads, *a, ga)
        }
        Op::Square(a) => accumulate(nodes, grads, *a, g * value(*a) * two),
        Op::Softplus(a) => accumulate(nodes, grads, *a, g * &value(*a).mapv(sigmoid)),
        Op::Sigmoid(a) => {
            let ds = node.value.mapv(|s| s * (F::one() - s));
            accumulate(nodes, grads, *a, g * &ds)
        }
        Op::Sum(a) => accumulate(nodes, grads, *a, Array2::from_elem(dim(*a), g[[0, 0]])),
        Op::SumRows(a) => {
            let ga = Array2::from_shape_fn(dim(*a), |(i, _)| g[[i, 0]]);
            accumulate(nodes, grads, *a, ga)
        }
        Op::Diag(a) => {
            let ga = Array2::from_diag(&g.column(0));
            accumulate(nodes, grads, *a, ga)
        }
        Op::DiagFlat(a) => {
            let ga = g.diag().to_owned().insert_axis(Axis(1));
            accumulate(nodes, grads, *a, ga)
        }
        Op::Tril(a) => accumulate(nodes, grads, *a, tril(&g)),
        Op::Cholesky(a) => {
            // A_bar = sym(L^-T . Phi(L^T . L_bar) . L^-1)
            let l = &node.value;
            let mut p = tril(&l.t().dot(&tril(&g)));
            p.diag_mut().mapv_inplace(|v| v * half);
            let x = l.t().solve_triangular(&p, UPLO::Upper)?;
            let ga = l.t().solve_triangular(&x.t().to_owned(), UPLO::Upper)?;
            let sym = (&ga + &ga.t()) * half;
            accumulate(nodes, grads, *a, sym)
        }
        Op::SolveTriangular { a, b, lower } => {
            let av = value(*a);
            let uplo_t = if *lower { UPLO::Upper } else { UPLO::Lower };
            let gb = av.t().solve_triangular(&g, uplo_t)?;
            if wants(*a) {
                let ga = -gb.dot(&node.value.t());
                let ga = if *lower { tril(&ga) } else { triu(&ga) };
                accumulate(nodes, grads, *a, ga);
            }
            accumulate(nodes, grads, *b, gb);
        }
        Op::SqDist(a, b) => {
            let (av, bv) = (value(*a), value(*b));
            if wants(*a) {
                let rs = g.sum_axis(Axis(1)).insert_axis(Axis(1));
                let ga = (av * &rs - g.dot(bv)) * two;
                accumulate(nodes, grads, *a, ga);
            }
            if wants(*b) {
                let cs = g.sum_axis(Axis(0)).insert_axis(Axis(1));
                let gb = (bv * &cs - g.t().dot(av)) * two;
                accumulate(nodes, grads, *b, gb);
            }
        }
        Op::Columns(a, start) => {
            let mut ga = Array2::zeros(dim(*a));
            ga.slice_mut(s![.., *start..]).assign(&g);
            accumulate(nodes, grads, *a, ga)
        }
        Op::GatherRows(a, indices) => {
            let mut ga = Array2::zeros(dim(*a));
            for (row, &i) in indices.iter().enumerate() {
                let mut target = ga.row_mut(i);
                target += &g.row(row);
            }
            accumulate(nodes, grads, *a, ga)
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use finitediff::FiniteDiff;
    use ndarray::{Array, array};

    fn check_gradient(
        x0: Array2<f64>,
        f: impl for<'t> Fn(&'t Tape<f64>, Var<'t, f64>) -> Var<'t, f64>,
    ) {
        let param = Parameter::new("x", x0.to_owned());
        let tape = Tape::new();
        let x = tape.parameter(&param);
        let out = f(&tape, x);
        let grads = tape.backward(out).unwrap();
        let grad = grads.wrt_or_zeros(&param);

        let shape = x0.raw_dim();
        let eval = |v: &Vec<f64>| -> f64 {
            let tape = Tape::new();
            let x = tape.constant(Array::from_shape_vec(shape.to_owned(), v.to_owned()).unwrap());
            f(&tape, x).item()
        };
        let fd = x0.iter().cloned().collect::<Vec<_>>().central_diff(&eval);
        let fd = Array::from_shape_vec(shape, fd).unwrap();
        assert_abs_diff_eq!(grad, fd, epsilon = 1e-5);
    }

    fn spd() -> Array2<f64> {
        array![[2.0, 0.3, 0.1], [0.3, 1.5, -0.2], [0.1, -0.2, 1.2]]
    }

    #[test]
    fn test_elementwise_gradients() {
        let x0 = array![[0.5, 1.2], [0.7, 2.0]];
        check_gradient(x0.to_owned(), |_, x| (x * x.exp()).sum());
        check_gradient(x0.to_owned(), |_, x| x.ln().square().sum());
        check_gradient(x0.to_owned(), |_, x| x.sqrt().softplus().sum());
        check_gradient(x0.to_owned(), |t, x| (t.scalar(1.) / x).sigmoid().sum());
        check_gradient(x0, |t, x| (x - t.scalar(0.3)).scale(3.).offset(1.).square().sum());
    }

    #[test]
    fn test_broadcast_gradients() {
        let col = array![[0.5], [1.5]];
        check_gradient(col.to_owned(), |t, x| {
            let m = t.constant(array![[1., 2., 3.], [4., 5., 6.]]);
            (m * x).square().sum()
        });
        check_gradient(col, |t, x| {
            let m = t.constant(array![[1., 2.], [4., 5.]]);
            (m / x.t() + x).sum()
        });
    }

    #[test]
    fn test_matrix_gradients() {
        let x0 = array![[0.5, 1.2, -0.3], [0.7, 2.0, 0.1]];
        check_gradient(x0.to_owned(), |_, x| x.matmul(x.t()).diag().ln().sum());
        check_gradient(x0.to_owned(), |_, x| x.t().matmul(x).tril().sum_rows().square().sum());
        check_gradient(x0.to_owned(), |_, x| x.sq_dist(x).exp().sum());
        check_gradient(x0.to_owned(), |t, x| {
            let other = t.constant(array![[0.1, 0.2, 0.3]]);
            x.sq_dist(other).square().sum()
        });
        check_gradient(x0.to_owned(), |_, x| x.columns(1).square().sum());
        check_gradient(x0, |_, x| x.gather_rows(vec![1, 0, 1]).exp().sum());
        check_gradient(array![[0.2], [1.3]], |_, x| x.diagflat().exp().sum());
    }

    #[test]
    fn test_cholesky_gradient() {
        check_gradient(spd(), |_, x| {
            let l = x.matmul(x.t()).cholesky().unwrap();
            l.diag().ln().sum() + l.square().sum()
        });
    }

    #[test]
    fn test_triangular_solve_gradient() {
        let b0 = array![[1.0, -1.0], [0.5, 2.0], [0.3, 0.2]];
        check_gradient(spd(), |t, x| {
            let l = (x + x.t()).scale(0.5).cholesky().unwrap();
            let b = t.constant(b0.to_owned());
            l.solve_lower(b).unwrap().square().sum()
        });
        check_gradient(b0.to_owned(), |t, x| {
            let l = t.constant(spd()).cholesky().unwrap();
            l.t().solve_upper(x).unwrap().sum()
        });
    }

    #[test]
    fn test_cholesky_round_trip() {
        let l0 = array![[1.5, 0., 0.], [0.3, 0.8, 0.], [-0.4, 0.2, 1.1]];
        let a = l0.dot(&l0.t());
        let l = cholesky_factor(&a).unwrap();
        assert_abs_diff_eq!(l, l0, epsilon = 1e-12);
    }

    #[test]
    fn test_cholesky_rejects_singular() {
        let a = array![[1.0, 1.0], [1.0, 1.0]];
        assert!(cholesky_factor(&a).is_err());
        let a = array![[1.0, f64::NAN], [f64::NAN, 1.0]];
        assert!(cholesky_factor(&a).is_err());
    }

    #[test]
    fn test_parameter_bound_once() {
        let param = Parameter::new("p", array![[2.0]]);
        let tape = Tape::new();
        let a = tape.parameter(&param);
        let b = tape.parameter(&param);
        let out = a * b;
        let grads = tape.backward(out).unwrap();
        assert_abs_diff_eq!(grads.wrt(&param).unwrap()[[0, 0]], 4.0, epsilon = 1e-12);
    }

    #[test]
    fn test_no_grad_tape() {
        let param = Parameter::new("p", array![[2.0]]);
        let tape = Tape::no_grad();
        let out = tape.parameter(&param).square().sum();
        assert_abs_diff_eq!(out.item(), 4.0);
        assert!(tape.backward(out).unwrap().wrt(&param).is_none());
    }

    #[test]
    fn test_softplus_inverse() {
        for y in [1e-6f64, 0.1, 1.0, 25.0, 800.0] {
            assert_abs_diff_eq!(softplus(softplus_inv(y)), y, epsilon = 1e-9 * y.max(1.0));
        }
    }
}
