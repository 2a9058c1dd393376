//! Download pipeline: governor, gate, fetch backends, orchestration.
//!
//! The pieces compose as `RetryGate(ConcurrencyGovernor(Fetcher::fetch))`,
//! one governor/gate pair per remote operation kind. The
//! [`DownloadOrchestrator`] owns the pair for file fetches; the catalog
//! client owns its own pair for metadata calls.

mod fetcher;
mod gate;
mod governor;
mod orchestrator;

pub use fetcher::{Aria2Fetcher, FetchError, Fetcher, HttpFetcher};
pub use gate::{GateError, RetryGate, Retryable};
pub use governor::ConcurrencyGovernor;
pub use orchestrator::{
    BatchStats, BatchSummary, DownloadOrchestrator, FileDecision, sanitize_component,
};
