//! Stage 1: fetcher pool.
//!
//! Workers pull byte offsets from a shared channel, fetch pages with retry,
//! and push record batches downstream. The first worker to observe the end
//! of upstream data raises the one-shot completion signal; the pool
//! supervisor raises it as well once every worker has exited, so a fully
//! consumed offset plan also terminates the run.

use crate::client::EpssClient;
use crate::config::RetryConfig;
use crate::error::IngestError;
use crate::models::{EpssRecord, EpssResponse};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type SharedOffsets = Arc<tokio::sync::Mutex<mpsc::Receiver<usize>>>;

pub struct FetcherPool {
    client: Arc<EpssClient>,
    retry: RetryConfig,
    page_size: usize,
    workers: usize,
    /// None walks the full snapshot; Some(date) scopes every page query.
    fetch_date: Option<String>,
}

pub struct FetcherOutput {
    pub batches: mpsc::Receiver<Vec<EpssRecord>>,
    /// Failed offsets with the terminal error, after retries are exhausted.
    pub errors: mpsc::Receiver<(usize, IngestError)>,
    pub completion: mpsc::Receiver<()>,
    pub supervisor: JoinHandle<()>,
}

impl FetcherPool {
    pub fn new(
        client: Arc<EpssClient>,
        retry: RetryConfig,
        page_size: usize,
        workers: usize,
        fetch_date: Option<String>,
    ) -> Self {
        Self {
            client,
            retry,
            page_size,
            workers,
            fetch_date,
        }
    }

    pub fn start(self, cancel: CancellationToken, offsets: mpsc::Receiver<usize>) -> FetcherOutput {
        let (batch_tx, batch_rx) = mpsc::channel::<Vec<EpssRecord>>(self.workers * 2);
        let (error_tx, error_rx) = mpsc::channel::<(usize, IngestError)>(self.workers);
        let (completion_tx, completion_rx) = mpsc::channel::<()>(1);

        let offsets: SharedOffsets = Arc::new(tokio::sync::Mutex::new(offsets));

        let mut tasks = JoinSet::new();
        for worker_id in 0..self.workers {
            tasks.spawn(run_worker(
                worker_id,
                self.client.clone(),
                self.retry.clone(),
                self.page_size,
                self.fetch_date.clone(),
                cancel.clone(),
                offsets.clone(),
                batch_tx.clone(),
                error_tx.clone(),
                completion_tx.clone(),
            ));
        }
        // The workers hold the only long-lived senders; dropping these closes
        // the channels once the pool has fully wound down.
        drop(batch_tx);

        let supervisor = tokio::spawn(async move {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    if e.is_panic() {
                        warn!(error = %e, "fetch worker panicked");
                        let _ = error_tx
                            .try_send((0, IngestError::Panic(format!("fetch worker: {e}"))));
                    }
                }
            }
            // All offsets consumed without hitting an empty page still ends
            // the run.
            let _ = completion_tx.try_send(());
        });

        FetcherOutput {
            batches: batch_rx,
            errors: error_rx,
            completion: completion_rx,
            supervisor,
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_worker(
    worker_id: usize,
    client: Arc<EpssClient>,
    retry: RetryConfig,
    page_size: usize,
    fetch_date: Option<String>,
    cancel: CancellationToken,
    offsets: SharedOffsets,
    batch_tx: mpsc::Sender<Vec<EpssRecord>>,
    error_tx: mpsc::Sender<(usize, IngestError)>,
    completion_tx: mpsc::Sender<()>,
) {
    loop {
        let offset = tokio::select! {
            maybe = async { offsets.lock().await.recv().await } => match maybe {
                Some(offset) => offset,
                None => return,
            },
            _ = cancel.cancelled() => return,
        };

        let result = fetch_with_retry(
            &client,
            &retry,
            &cancel,
            fetch_date.as_deref(),
            offset,
            page_size,
        )
        .await;

        match result {
            Ok(resp) => {
                if resp.data.is_empty() || offset >= resp.total {
                    info!(
                        worker_id,
                        offset,
                        total = resp.total,
                        received = resp.data.len(),
                        "reached end of data, signalling completion"
                    );
                    // Buffered(1): never blocks, duplicates are discarded.
                    let _ = completion_tx.try_send(());
                    return;
                }

                debug!(worker_id, offset, records = resp.data.len(), "page fetched");
                tokio::select! {
                    sent = batch_tx.send(resp.data) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                    _ = cancel.cancelled() => return,
                }
            }
            Err(err) if err.is_cancelled() => return,
            Err(err) => {
                warn!(worker_id, offset, error = %err, "offset failed after retries");
                if error_tx.send((offset, err)).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Up to `max_retries` additional attempts; the attempt-k delay is
/// `delay * backoff * k`. Cancellation aborts the loop immediately.
async fn fetch_with_retry(
    client: &EpssClient,
    retry: &RetryConfig,
    cancel: &CancellationToken,
    date: Option<&str>,
    offset: usize,
    page_size: usize,
) -> Result<EpssResponse, IngestError> {
    let mut last_err = None;

    for attempt in 0..=retry.max_retries {
        if attempt > 0 {
            let delay = retry.delay.mul_f64(retry.backoff * attempt as f64);
            debug!(offset, attempt, delay_ms = delay.as_millis() as u64, "retrying fetch");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(IngestError::Cancelled),
            }
        }

        match client.fetch_page(cancel, date, offset, page_size).await {
            Ok(resp) => return Ok(resp),
            Err(err) if !err.is_retriable() => return Err(err),
            Err(err) => last_err = Some(err),
        }
    }

    Err(last_err.unwrap_or(IngestError::Cancelled))
}
