//! The two pipeline stages: fetchers (stage 1) and processors (stage 2).
//!
//! Workers never touch the checkpoint or the stats tracker; everything they
//! observe flows back to the orchestrator over channels.

mod fetcher;
mod processor;

pub use fetcher::{FetcherOutput, FetcherPool};
pub use processor::{ProcessorOutput, ProcessorPool};
