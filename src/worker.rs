pub mod cleaner;
pub mod fetcher;
pub mod poller;
pub mod ranker;

pub use cleaner::Cleaner;
pub use fetcher::Fetcher;
pub use poller::{Poller, PollerConfig};
pub use ranker::Ranker;

use thiserror::Error;

/// Clean early exit observed at defined suspension points. Not a failure:
/// partial writes left behind are idempotent upserts and the next cycle
/// resumes naturally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct Cancelled;
