//! Worker side of the dispatch protocol: consume jobs scoped to this
//! worker's group, execute them, and emit correlated results.

pub mod executor;
pub mod service;

pub use executor::{InlineExecutor, JobExecutor};
pub use service::{WorkerService, WorkerServiceBuilder};
