//! Gaussian process regression engine.
//!
//! This crate re-exports [`vgpr_gp`] which implements the inference models:
//! exact GP regression, sparse FITC ([`Snelson`]), variational free energy
//! ([`Titsias`]), whitened sparse variational GPs ([`SparseHensman`], [`Hensman`])
//! and the non-sparse variational GP of Opper and Archambeau ([`OpperArchambeau`]).
//!
//! ```no_run
//! use ndarray::array;
//! use vgpr::kernels::SquaredExponential;
//! use vgpr::{Exact, GpModel};
//!
//! let x = array![[0.], [1.], [2.], [3.]];
//! let y = array![0.1, 0.9, -0.2, 1.1];
//! let model = Exact::params(SquaredExponential::new(1))
//!     .variance(0.1)
//!     .build(&x, &y)
//!     .expect("valid model");
//! let loss = model.loss().expect("loss evaluation");
//! println!("loss = {}, gradient = {}", loss.value, loss.gradient);
//! ```
pub use vgpr_gp::*;
