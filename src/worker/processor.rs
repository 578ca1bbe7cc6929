//! Stage 2: processor pool.
//!
//! Workers buffer incoming batches up to the bulk size, flush through the
//! shared sink with retry, and report each successful flush's record count
//! upstream so the orchestrator can track progress.

use crate::config::RetryConfig;
use crate::error::IngestError;
use crate::models::EpssRecord;
use crate::output::Sink;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type SharedBatches = Arc<tokio::sync::Mutex<mpsc::Receiver<Vec<EpssRecord>>>>;

pub struct ProcessorPool {
    sink: Arc<dyn Sink>,
    retry: RetryConfig,
    bulk_size: usize,
    bulk_timeout: Duration,
    workers: usize,
}

pub struct ProcessorOutput {
    /// Dropped bulks with the terminal error, after retries are exhausted.
    pub errors: mpsc::Receiver<(u64, IngestError)>,
    /// Record count of every successful flush.
    pub flushed: mpsc::Receiver<usize>,
    pub supervisor: JoinHandle<()>,
}

impl ProcessorPool {
    pub fn new(
        sink: Arc<dyn Sink>,
        retry: RetryConfig,
        bulk_size: usize,
        bulk_timeout: Duration,
        workers: usize,
    ) -> Self {
        Self {
            sink,
            retry,
            bulk_size,
            bulk_timeout,
            workers,
        }
    }

    pub fn start(
        self,
        cancel: CancellationToken,
        batches: mpsc::Receiver<Vec<EpssRecord>>,
    ) -> ProcessorOutput {
        let (error_tx, error_rx) = mpsc::channel::<(u64, IngestError)>(self.workers);
        let (flushed_tx, flushed_rx) = mpsc::channel::<usize>(self.workers);

        let batches: SharedBatches = Arc::new(tokio::sync::Mutex::new(batches));
        let batch_counter = Arc::new(Mutex::new(0u64));

        let mut tasks = JoinSet::new();
        for worker_id in 0..self.workers {
            tasks.spawn(run_worker(
                worker_id,
                self.sink.clone(),
                self.retry.clone(),
                self.bulk_size,
                self.bulk_timeout,
                cancel.clone(),
                batches.clone(),
                batch_counter.clone(),
                error_tx.clone(),
                flushed_tx.clone(),
            ));
        }
        drop(flushed_tx);

        let supervisor = tokio::spawn(async move {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    if e.is_panic() {
                        warn!(error = %e, "processor worker panicked");
                        let _ = error_tx
                            .try_send((0, IngestError::Panic(format!("processor worker: {e}"))));
                    }
                }
            }
        });

        ProcessorOutput {
            errors: error_rx,
            flushed: flushed_rx,
            supervisor,
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_worker(
    worker_id: usize,
    sink: Arc<dyn Sink>,
    retry: RetryConfig,
    bulk_size: usize,
    bulk_timeout: Duration,
    cancel: CancellationToken,
    batches: SharedBatches,
    batch_counter: Arc<Mutex<u64>>,
    error_tx: mpsc::Sender<(u64, IngestError)>,
    flushed_tx: mpsc::Sender<usize>,
) {
    let mut buffer: Vec<EpssRecord> = Vec::with_capacity(bulk_size);
    let mut timer =
        tokio::time::interval_at(tokio::time::Instant::now() + bulk_timeout, bulk_timeout);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            maybe = async { batches.lock().await.recv().await } => match maybe {
                Some(batch) => {
                    buffer.extend(batch);
                    while buffer.len() >= bulk_size {
                        let bulk: Vec<EpssRecord> = buffer.drain(..bulk_size).collect();
                        flush(
                            worker_id, &sink, &retry, &cancel,
                            &batch_counter, &error_tx, &flushed_tx, bulk,
                        )
                        .await;
                        timer.reset();
                    }
                }
                None => {
                    // Input closed: flush the remainder and wind down.
                    if !buffer.is_empty() {
                        let bulk = std::mem::take(&mut buffer);
                        flush(
                            worker_id, &sink, &retry, &cancel,
                            &batch_counter, &error_tx, &flushed_tx, bulk,
                        )
                        .await;
                    }
                    return;
                }
            },
            _ = timer.tick() => {
                if !buffer.is_empty() {
                    let bulk = std::mem::take(&mut buffer);
                    flush(
                        worker_id, &sink, &retry, &cancel,
                        &batch_counter, &error_tx, &flushed_tx, bulk,
                    )
                    .await;
                }
            }
            _ = cancel.cancelled() => {
                // One last flush so buffered records survive shutdown.
                if !buffer.is_empty() {
                    let bulk = std::mem::take(&mut buffer);
                    flush(
                        worker_id, &sink, &retry, &cancel,
                        &batch_counter, &error_tx, &flushed_tx, bulk,
                    )
                    .await;
                }
                return;
            }
        }
    }
}

/// Write one bulk through the sink with the shared retry policy. A bulk that
/// exhausts its retries is dropped and reported on the error channel.
#[allow(clippy::too_many_arguments)]
async fn flush(
    worker_id: usize,
    sink: &Arc<dyn Sink>,
    retry: &RetryConfig,
    cancel: &CancellationToken,
    batch_counter: &Arc<Mutex<u64>>,
    error_tx: &mpsc::Sender<(u64, IngestError)>,
    flushed_tx: &mpsc::Sender<usize>,
    bulk: Vec<EpssRecord>,
) {
    let batch_id = {
        let mut counter = batch_counter.lock();
        *counter += 1;
        *counter
    };

    debug!(worker_id, batch_id, records = bulk.len(), "flushing bulk");

    let mut last_err = None;
    for attempt in 0..=retry.max_retries {
        if attempt > 0 {
            let delay = retry.delay.mul_f64(retry.backoff * attempt as f64);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return,
            }
        }

        match sink.write(&bulk, batch_id).await {
            Ok(()) => {
                let _ = flushed_tx.send(bulk.len()).await;
                return;
            }
            Err(err) => {
                warn!(worker_id, batch_id, attempt, error = %err, "bulk write failed");
                last_err = Some(err);
            }
        }
    }

    if let Some(err) = last_err {
        let _ = error_tx.send((batch_id, err)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use async_trait::async_trait;
    use std::collections::HashSet;

    /// Records every write; optionally fails the first N calls.
    struct RecordingSink {
        writes: Mutex<Vec<(u64, Vec<EpssRecord>)>>,
        fail_first: Mutex<usize>,
    }

    impl RecordingSink {
        fn new(fail_first: usize) -> Arc<Self> {
            Arc::new(Self {
                writes: Mutex::new(Vec::new()),
                fail_first: Mutex::new(fail_first),
            })
        }
    }

    #[async_trait]
    impl Sink for RecordingSink {
        async fn write(&self, batch: &[EpssRecord], batch_id: u64) -> Result<()> {
            {
                let mut remaining = self.fail_first.lock();
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(IngestError::SinkStatus {
                        status: 500,
                        body: "injected".into(),
                    });
                }
            }
            self.writes.lock().push((batch_id, batch.to_vec()));
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn retry_config() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            delay: Duration::from_millis(5),
            backoff: 1.0,
        }
    }

    fn records(offset: usize, n: usize) -> Vec<EpssRecord> {
        (0..n)
            .map(|i| EpssRecord {
                cve: format!("CVE-2024-{:04}", offset + i),
                epss: "0.1".into(),
                percentile: "0.5".into(),
                date: "2024-01-15".into(),
                timestamp: None,
            })
            .collect()
    }

    #[tokio::test]
    async fn buffers_to_bulk_size_and_flushes_remainder() {
        let sink = RecordingSink::new(0);
        let pool = ProcessorPool::new(
            sink.clone(),
            retry_config(),
            2,
            Duration::from_secs(60),
            1,
        );
        let (tx, rx) = mpsc::channel(4);
        let mut out = pool.start(CancellationToken::new(), rx);

        tx.send(records(0, 3)).await.unwrap();
        drop(tx);

        let mut flushed_total = 0;
        while let Some(count) = out.flushed.recv().await {
            flushed_total += count;
        }
        out.supervisor.await.unwrap();

        assert_eq!(flushed_total, 3);
        let writes = sink.writes.lock();
        // One full bulk of 2 plus the remainder of 1.
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].1.len(), 2);
        assert_eq!(writes[1].1.len(), 1);
    }

    #[tokio::test]
    async fn timer_flushes_partial_buffer() {
        let sink = RecordingSink::new(0);
        let pool = ProcessorPool::new(
            sink.clone(),
            retry_config(),
            100,
            Duration::from_millis(50),
            1,
        );
        let (tx, rx) = mpsc::channel(4);
        let mut out = pool.start(CancellationToken::new(), rx);

        tx.send(records(0, 3)).await.unwrap();
        let count = tokio::time::timeout(Duration::from_secs(2), out.flushed.recv())
            .await
            .expect("timer should flush within the timeout")
            .unwrap();
        assert_eq!(count, 3);
        drop(tx);
        out.supervisor.await.unwrap();
    }

    #[tokio::test]
    async fn batch_ids_are_unique() {
        let sink = RecordingSink::new(0);
        let pool = ProcessorPool::new(
            sink.clone(),
            retry_config(),
            1,
            Duration::from_secs(60),
            4,
        );
        let (tx, rx) = mpsc::channel(16);
        let out = pool.start(CancellationToken::new(), rx);

        for i in 0..10 {
            tx.send(records(i, 1)).await.unwrap();
        }
        drop(tx);
        out.supervisor.await.unwrap();

        let writes = sink.writes.lock();
        let ids: HashSet<u64> = writes.iter().map(|(id, _)| *id).collect();
        assert_eq!(writes.len(), 10);
        assert_eq!(ids.len(), 10);
    }

    #[tokio::test]
    async fn write_failure_retries_then_succeeds() {
        let sink = RecordingSink::new(2);
        let pool = ProcessorPool::new(
            sink.clone(),
            retry_config(),
            2,
            Duration::from_secs(60),
            1,
        );
        let (tx, rx) = mpsc::channel(4);
        let mut out = pool.start(CancellationToken::new(), rx);

        tx.send(records(0, 2)).await.unwrap();
        drop(tx);

        assert_eq!(out.flushed.recv().await, Some(2));
        out.supervisor.await.unwrap();
        assert_eq!(sink.writes.lock().len(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_drop_the_bulk() {
        let sink = RecordingSink::new(usize::MAX);
        let pool = ProcessorPool::new(
            sink.clone(),
            retry_config(),
            2,
            Duration::from_secs(60),
            1,
        );
        let (tx, rx) = mpsc::channel(4);
        let mut out = pool.start(CancellationToken::new(), rx);

        tx.send(records(0, 2)).await.unwrap();
        drop(tx);

        let (batch_id, err) = out.errors.recv().await.unwrap();
        assert_eq!(batch_id, 1);
        assert!(matches!(err, IngestError::SinkStatus { .. }));
        assert!(out.flushed.recv().await.is_none());
        out.supervisor.await.unwrap();
    }

    #[tokio::test]
    async fn cancellation_flushes_buffered_records() {
        let sink = RecordingSink::new(0);
        let pool = ProcessorPool::new(
            sink.clone(),
            retry_config(),
            100,
            Duration::from_secs(60),
            1,
        );
        let (tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let mut out = pool.start(cancel.clone(), rx);

        tx.send(records(0, 5)).await.unwrap();
        // Give the worker a beat to buffer, then pull the plug.
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        assert_eq!(out.flushed.recv().await, Some(5));
        out.supervisor.await.unwrap();
        assert_eq!(sink.writes.lock()[0].1.len(), 5);
    }
}
