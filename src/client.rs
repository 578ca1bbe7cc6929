//! EPSS API client.
//!
//! Paged GETs against the upstream feed, guarded by a capacity-1 token
//! bucket: a background task replenishes one token per `rate_limit` period
//! and callers block on token acquisition or cancellation.

use crate::config::ApiConfig;
use crate::error::{IngestError, Result};
use crate::models::EpssResponse;
use chrono::Utc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const USER_AGENT: &str = "epss-fetcher/1.0";

/// Truncation applied to upstream error bodies before they enter error values.
const BODY_PREFIX_LEN: usize = 256;

pub struct EpssClient {
    client: reqwest::Client,
    config: ApiConfig,
    // None when rate limiting is disabled (zero interval).
    tokens: Option<tokio::sync::Mutex<mpsc::Receiver<()>>>,
}

impl EpssClient {
    /// Build the HTTP client and start the rate-limit refill task.
    /// Must be called from within a tokio runtime.
    pub fn new(config: ApiConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(USER_AGENT)
            .build()?;

        let tokens = if config.rate_limit.is_zero() {
            None
        } else {
            Some(tokio::sync::Mutex::new(spawn_refill(config.rate_limit)))
        };

        Ok(Self {
            client,
            config,
            tokens,
        })
    }

    /// Fetch one page. `date` scopes the query to a single day (incremental
    /// mode); `None` walks the full snapshot.
    pub async fn fetch_page(
        &self,
        cancel: &CancellationToken,
        date: Option<&str>,
        offset: usize,
        limit: usize,
    ) -> Result<EpssResponse> {
        self.acquire_token(cancel).await?;

        let mut query: Vec<(String, String)> = Vec::with_capacity(3);
        if let Some(d) = date {
            query.push(("date".to_string(), d.to_string()));
        }
        query.push(("offset".to_string(), offset.to_string()));
        query.push(("limit".to_string(), limit.to_string()));

        debug!(offset, limit, date = date.unwrap_or(""), "fetching page");

        let request = self
            .client
            .get(&self.config.base_url)
            .query(&query)
            .header(reqwest::header::ACCEPT, "application/json");

        let response = tokio::select! {
            r = request.send() => r?,
            _ = cancel.cancelled() => return Err(IngestError::Cancelled),
        };

        let status = response.status();
        let body = tokio::select! {
            b = response.text() => b?,
            _ = cancel.cancelled() => return Err(IngestError::Cancelled),
        };

        if !status.is_success() {
            return Err(IngestError::UpstreamStatus {
                status: status.as_u16(),
                body: body.chars().take(BODY_PREFIX_LEN).collect(),
            });
        }

        let mut parsed: EpssResponse =
            serde_json::from_str(&body).map_err(IngestError::Decode)?;

        let now = Utc::now();
        for record in &mut parsed.data {
            record.timestamp = Some(now);
        }

        Ok(parsed)
    }

    /// Total record count for the query, via a 1-record probe at offset 0.
    pub async fn total_for(
        &self,
        cancel: &CancellationToken,
        date: Option<&str>,
    ) -> Result<usize> {
        let resp = self.fetch_page(cancel, date, 0, 1).await?;
        Ok(resp.total)
    }

    async fn acquire_token(&self, cancel: &CancellationToken) -> Result<()> {
        let Some(tokens) = &self.tokens else {
            return Ok(());
        };
        let mut rx = tokio::select! {
            guard = tokens.lock() => guard,
            _ = cancel.cancelled() => return Err(IngestError::Cancelled),
        };
        tokio::select! {
            token = rx.recv() => match token {
                Some(()) => Ok(()),
                // Refill task gone; don't wedge the pipeline.
                None => Ok(()),
            },
            _ = cancel.cancelled() => Err(IngestError::Cancelled),
        }
    }
}

/// Start the refill task: one token per interval, extra tokens discarded
/// while the bucket is full. The bucket starts full so the first request
/// never waits.
fn spawn_refill(interval: Duration) -> mpsc::Receiver<()> {
    let (tx, rx) = mpsc::channel::<()>(1);
    let _ = tx.try_send(());

    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            match tx.try_send(()) {
                Ok(()) => {}
                // Bucket full: discard the replenishment.
                Err(mpsc::error::TrySendError::Full(())) => {}
                // Client dropped.
                Err(mpsc::error::TrySendError::Closed(())) => break,
            }
        }
    });

    rx
}
