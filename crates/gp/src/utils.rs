use crate::errors::{GpError, Result};
use crate::kernels::channels;
use crate::parameters::Inducings;
use linfa::Float;
use ndarray::{Array1, Array2, ArrayBase, Data, Ix2, Zip, s};
use ndarray_rand::rand::seq::SliceRandom;
use rand_xoshiro::Xoshiro256Plus;

/// Initial inducing point locations (m, d) for the training inputs `x`.
///
/// With a multi-output kernel (`output_dims > 1`) the inputs carry the channel
/// index in their first column and grid points are spread per channel over
/// the data of that channel.
pub(crate) fn init_inducing_points<F: Float>(
    inducings: &Inducings<F>,
    x: &ArrayBase<impl Data<Elem = F>, Ix2>,
    output_dims: usize,
    rng: &mut Xoshiro256Plus,
) -> Result<Array2<F>> {
    let z = match inducings {
        Inducings::Grid(m) if output_dims > 1 => {
            grid_per_channel(&vec![*m; output_dims], x)?
        }
        Inducings::Grid(m) => grid(*m, x),
        Inducings::GridPerChannel(ms) => {
            if ms.len() != output_dims {
                return Err(GpError::ShapeError(format!(
                    "expected inducing point counts for {} channels, got {}",
                    output_dims,
                    ms.len()
                )));
            }
            grid_per_channel(ms, x)?
        }
        Inducings::Randomized(m) => make_inducings(*m, x, rng),
        Inducings::Located(z) => z.to_owned(),
    };
    if z.ncols() != x.ncols() {
        return Err(GpError::ShapeError(format!(
            "inducing points must have {} input dimensions, got {}",
            x.ncols(),
            z.ncols()
        )));
    }
    if z.nrows() == 0 {
        return Err(GpError::InvalidValueError(
            "at least one inducing point is required".to_string(),
        ));
    }
    Ok(z)
}

/// `m` points evenly spaced between the per column extrema of `x`
fn grid<F: Float>(m: usize, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Array2<F> {
    let mut z = Array2::zeros((m, x.ncols()));
    Zip::from(z.columns_mut())
        .and(x.columns())
        .for_each(|mut zi, xi| zi.assign(&linspace_over(xi.iter().cloned(), m)));
    z
}

/// `ms[j]` points for channel `j`: the channel index in the first column, the
/// remaining columns evenly spaced over the data of that channel
fn grid_per_channel<F: Float>(
    ms: &[usize],
    x: &ArrayBase<impl Data<Elem = F>, Ix2>,
) -> Result<Array2<F>> {
    let x = x.to_owned();
    let idx = channels(&x);
    let total = ms.iter().sum();
    let mut z = Array2::zeros((total, x.ncols()));
    let mut offset = 0;
    for (j, m) in ms.iter().enumerate() {
        let rows = idx
            .iter()
            .enumerate()
            .filter(|(_, c)| **c == j)
            .map(|(i, _)| i)
            .collect::<Vec<_>>();
        if rows.is_empty() {
            return Err(GpError::InvalidValueError(format!(
                "channel {j} has no training data to place inducing points"
            )));
        }
        let mut zj = z.slice_mut(s![offset..offset + m, ..]);
        zj.column_mut(0).fill(F::cast(j));
        for i in 1..x.ncols() {
            let values = rows.iter().map(|r| x[[*r, i]]);
            zj.column_mut(i).assign(&linspace_over(values, *m));
        }
        offset += m;
    }
    Ok(z)
}

fn linspace_over<F: Float>(values: impl Iterator<Item = F>, m: usize) -> Array1<F> {
    let (lo, hi) = values.fold((F::infinity(), F::neg_infinity()), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    });
    Array1::linspace(lo, hi, m)
}

/// `n_inducing` distinct training points drawn at random
fn make_inducings<F: Float>(
    n_inducing: usize,
    xt: &ArrayBase<impl Data<Elem = F>, Ix2>,
    rng: &mut Xoshiro256Plus,
) -> Array2<F> {
    let mut indices = (0..xt.nrows()).collect::<Vec<_>>();
    indices.shuffle(rng);
    let n = n_inducing.min(xt.nrows());
    let mut z = Array2::zeros((n, xt.ncols()));
    let idx = indices[..n].to_vec();
    Zip::from(z.rows_mut())
        .and(&Array1::from_vec(idx))
        .for_each(|mut zi, i| zi.assign(&xt.row(*i)));
    z
}
