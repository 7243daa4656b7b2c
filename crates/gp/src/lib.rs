//! This library implements [Gaussian Process](https://en.wikipedia.org/wiki/Gaussian_process) regression
//! models trained by gradient descent on their log marginal likelihood or on an evidence lower bound.
//!
//! Exact inference with a gaussian likelihood is implemented by [Exact], its complexity is in O(N^3)
//! in processing time and O(N^2) in memory where N is the number of training points.
//!
//! Sparse methods summarize the training data with M < N so-called inducing points, reducing the
//! complexity respectively to O(N.M^2) and O(N.M):
//! * [Snelson] (FITC) and [Titsias] (VFE) with a gaussian likelihood,
//! * [SparseHensman] (SVGP) with any [likelihoods::Likelihood].
//!
//! Non sparse variational methods handle any likelihood with the posterior placed on the latent
//! values at the training inputs: [Hensman] and [OpperArchambeau].
//!
//! All models share the [GpModel] interface: parameter registry, `loss()` with its gradient
//! w.r.t. the unconstrained [Parameter] values computed by reverse-mode differentiation
//! ([autodiff::Tape]), prediction and sampling.
//!
//! Models are configured with builders ([ExactParams], [SparseParams], [VariationalParams])
//! validated through [linfa::ParamGuard].
#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]
pub mod autodiff;
mod errors;
pub mod kernels;
pub mod likelihoods;
pub mod mean_models;
pub mod metrics;
mod model;
pub mod parameter;

mod algorithm;
mod parameters;
mod sparse_algorithm;
mod utils;
mod variational_algorithm;

pub use algorithm::*;
pub use errors::*;
pub use model::*;
pub use parameter::{Parameter, Parametrized, Prior};
pub use parameters::*;
pub use sparse_algorithm::*;
pub use variational_algorithm::*;
