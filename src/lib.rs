mod als;
mod backend;
mod config;
mod cross_validation;
mod datasets;
mod error;
mod evaluation;
mod pipeline;
mod rightfm;
mod rightfm_fast;
mod svd;

use tqdm::Iter;
use tracing_subscriber::EnvFilter;

pub use als::*;
pub use backend::{row_items, BackendKind, Factorizer, FitReport, Fitted, Hyperparameters, RatingPredictor, Recommender};
pub use self::config::*;
pub use cross_validation::*;
pub use datasets::*;
pub use error::*;
pub use evaluation::*;
pub use pipeline::*;
pub use rightfm::*;
pub use svd::*;

pub type Flt = f32;

/// Iteration counter, with a progress bar when `verbose`.
pub(crate) fn process(n: usize, verbose: bool) -> Box<dyn Iterator<Item = usize>> {
    if verbose {
        Box::new((0..n).tqdm())
    } else {
        Box::new(0..n)
    }
}

/// Logs to stderr. `RUST_LOG` wins over `default_level` when set.
pub fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
