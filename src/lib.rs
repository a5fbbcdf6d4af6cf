#![warn(missing_docs)]
#![doc(test(no_crate_inject))]
#![doc(test(attr(deny(unused, future_incompatible))))]

//! This crate provides factor tables: the discrete probability tables that inference algorithms
//! such as variable elimination and belief propagation multiply together and sum over.
//!
//! A [`Factor`] maps every joint instantiation of a set of [`EnumVariable`]s to a probability,
//! stored as a natural logarithm so that long chains of products don't underflow. Cells can also
//! carry a density over continuous variables ([`Jdf`]) and a [`Trace`] of the assignments that
//! produced them.
//!
//! [`Factorize`] does the arithmetic: pairwise and multi-way products, sum- and
//! max-marginalization, and normalization. Each operation allocates a new factor and leaves its
//! inputs alone, so factors can be shared freely between threads once they're built.
//!
//! Tables are stored through the [`Storage`] trait. Dense storage is a flat array; sparse storage
//! keeps only the non-zero cells and suits large tables with many structural zeros. A
//! [`FactorCache`] lets identical results share one read-only block.
//!
//! ```
//! use factor_tables::{Factor, Factorize, Registry};
//!
//! let mut registry = Registry::new();
//! let rain = registry.enumerable("rain", &["yes", "no"]).unwrap();
//! let wet = registry.enumerable("wet", &["yes", "no"]).unwrap();
//!
//! let mut p_rain: Factor = Factor::new(&[rain.clone()]).unwrap();
//! p_rain.set_probability(&[0], 0.2).unwrap();
//! p_rain.set_probability(&[1], 0.8).unwrap();
//!
//! let mut p_wet: Factor = Factor::new(&[rain.clone(), wet]).unwrap();
//! let table = [
//!     (["yes", "yes"], 0.9),
//!     (["yes", "no"], 0.1),
//!     (["no", "yes"], 0.1),
//!     (["no", "no"], 0.9),
//! ];
//! for (tokens, p) in table.iter() {
//!     let key = p_wet.key_of(tokens).unwrap();
//!     p_wet.set_probability(&key, *p).unwrap();
//! }
//!
//! let ops = Factorize::new();
//! let evidence = ops.margin(&ops.product(&p_rain, &p_wet).unwrap(), &[rain]).unwrap();
//! assert!((evidence.probability(&[0]).unwrap() - 0.26).abs() < 1e-12);
//! ```

pub use sorted_iter;

mod cache;
mod density;
mod error;
mod factor;
pub mod factorize;
mod storage;
mod tree;
pub mod tsv;
mod variable;

pub use cache::FactorCache;
pub use density::{Density, Jdf, Mixture};
pub use error::{FactorError, Result};
pub use factor::{Factor, FactorSummary, Key, Trace};
pub use factorize::{Factorize, Options};
pub use storage::{CachedBlock, CachedStorage, DenseStorage, SparseStorage, Storage, StorageKind};
pub use tree::ProductTree;
pub use variable::{ContinuousVariable, EnumVariable, Registry, Variable};

/// The log-value of probability zero.
pub const LOG_ZERO: f64 = f64::NEG_INFINITY;

/// Computes `ln(exp(a) + exp(b))` without leaving log-space.
///
/// If either argument is [`LOG_ZERO`], the other is returned unchanged, so adding zero to zero
/// is still zero rather than `NaN`.
///
/// ```
/// use factor_tables::{log_sum_of_logs, LOG_ZERO};
///
/// let sum = log_sum_of_logs(0.25f64.ln(), 0.5f64.ln());
/// assert!((sum.exp() - 0.75).abs() < 1e-12);
///
/// // Far below the smallest positive f64, and still exact relative to each other.
/// let sum = log_sum_of_logs(-2000.0, -2000.0);
/// assert!((sum - (-2000.0 + 2f64.ln())).abs() < 1e-9);
///
/// assert_eq!(log_sum_of_logs(LOG_ZERO, -3.0), -3.0);
/// assert_eq!(log_sum_of_logs(LOG_ZERO, LOG_ZERO), LOG_ZERO);
/// ```
pub fn log_sum_of_logs(a: f64, b: f64) -> f64 {
    if a == LOG_ZERO {
        return b;
    }
    if b == LOG_ZERO {
        return a;
    }
    let (high, low) = if a > b { (a, b) } else { (b, a) };
    high + (low - high).exp().ln_1p()
}
