//! Output sinks.
//!
//! Both stages of the pipeline funnel into one `Sink`, selected by the
//! `strategy` config key. Implementations must tolerate concurrent `write`
//! calls from every processor worker.

mod elasticsearch;
mod json;

pub use elasticsearch::ElasticsearchSink;
pub use json::JsonSink;

use crate::config::Config;
use crate::error::{IngestError, Result};
use crate::models::EpssRecord;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait Sink: Send + Sync {
    /// Deliver one bulk. `batch_id` is unique within the run.
    async fn write(&self, batch: &[EpssRecord], batch_id: u64) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

pub fn create_sink(config: &Config) -> Result<Arc<dyn Sink>> {
    match config.strategy.as_str() {
        "elasticsearch" => Ok(Arc::new(ElasticsearchSink::new(&config.elasticsearch)?)),
        "json" => Ok(Arc::new(JsonSink::new(&config.json)?)),
        other => Err(IngestError::Config(format!("unknown strategy: {other}"))),
    }
}
