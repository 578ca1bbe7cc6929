//! Error kinds for the ingestion pipeline.
//!
//! Fetch and flush paths retry on the retriable kinds; `Cancelled` is a clean
//! shutdown, not a failure.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    /// Bad settings, fatal at startup.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Network-level failure talking to the feed or the sink.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The feed answered with a non-2xx status.
    #[error("upstream returned status {status}: {body}")]
    UpstreamStatus { status: u16, body: String },

    /// The feed answered 2xx but the body was not the expected JSON.
    #[error("failed to decode upstream response: {0}")]
    Decode(#[source] serde_json::Error),

    /// The sink rejected a bulk outright.
    #[error("sink returned status {status}: {body}")]
    SinkStatus { status: u16, body: String },

    /// The sink accepted the request but flagged item-level errors.
    #[error("sink reported partial failures in bulk response")]
    SinkPartial,

    /// Checkpoint or summary file I/O.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Shutdown was requested; terminates the pipeline cleanly.
    #[error("operation cancelled")]
    Cancelled,

    /// A worker crashed; recovered at the pool boundary.
    #[error("worker panicked: {0}")]
    Panic(String),
}

impl IngestError {
    /// Whether the fetch/flush retry loops should try again.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            IngestError::Transport(_)
                | IngestError::UpstreamStatus { .. }
                | IngestError::Decode(_)
                | IngestError::SinkStatus { .. }
                | IngestError::SinkPartial
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, IngestError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;
