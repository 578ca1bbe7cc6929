//! Orchestrator: mode selection, stage wiring, progress, shutdown.
//!
//! Owns the checkpoint store and the stats tracker. The worker pools never
//! see either; fetch errors, flush errors, flushed counts, and the
//! completion signal all arrive over channels.

use crate::checkpoint::CheckpointStore;
use crate::client::EpssClient;
use crate::config::Config;
use crate::error::{IngestError, Result};
use crate::models::Checkpoint;
use crate::output::{create_sink, Sink};
use crate::stats::StatsTracker;
use crate::worker::{FetcherPool, ProcessorPool};
use chrono::Local;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Full,
    Incremental,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Full => "full",
            RunMode::Incremental => "incremental",
        }
    }
}

/// Everything the stages need to know, fixed before launch.
#[derive(Debug, Clone)]
struct RunPlan {
    mode: RunMode,
    fetch_date: Option<String>,
    total: usize,
    start_offset: usize,
}

enum ModeDecision {
    /// Data already current; do not start the stages.
    Skip,
    Run(RunPlan),
}

pub struct Orchestrator {
    config: Arc<Config>,
    client: Arc<EpssClient>,
    checkpoint: Arc<CheckpointStore>,
    stats: Arc<StatsTracker>,
    sink: Arc<dyn Sink>,
}

impl Orchestrator {
    pub fn new(config: Config) -> Result<Self> {
        let client = Arc::new(EpssClient::new(config.api.clone())?);

        let checkpoint = Arc::new(CheckpointStore::new(
            &config.checkpoint.file_path,
            config.checkpoint.enabled,
        ));
        checkpoint.load()?;

        let stats = Arc::new(StatsTracker::new(config.logging.output_file.clone()));
        let sink = create_sink(&config)?;

        Ok(Self {
            config: Arc::new(config),
            client,
            checkpoint,
            stats,
            sink,
        })
    }

    /// Run the pipeline. `target_date` forces an explicit incremental run;
    /// `force_incremental` enables the incremental-today behavior when the
    /// checkpoint carries a prior date. Returns `Cancelled` when shutdown
    /// was signal-driven.
    pub async fn run(
        &self,
        cancel: CancellationToken,
        target_date: Option<&str>,
        force_incremental: bool,
    ) -> Result<()> {
        let checkpoint = self.checkpoint.snapshot();

        let plan = match self
            .determine_mode(&cancel, target_date, force_incremental, &checkpoint)
            .await?
        {
            ModeDecision::Skip => {
                info!(
                    last_update = %checkpoint.last_data_date,
                    "data already up to date, nothing to fetch"
                );
                return Ok(());
            }
            ModeDecision::Run(plan) => plan,
        };

        self.stats.set_total(plan.total);
        info!(
            mode = plan.mode.as_str(),
            date = plan.fetch_date.as_deref().unwrap_or(""),
            total = plan.total,
            start_offset = plan.start_offset,
            "starting ingest"
        );

        self.checkpoint
            .update_mode(plan.mode.as_str(), plan.fetch_date.as_deref().unwrap_or(""));
        if let Err(e) = self.checkpoint.save() {
            warn!(error = %e, "failed to persist checkpoint before launch");
        }

        self.run_stages(&cancel, &plan).await;

        // Final checkpoint and summary.
        let final_stats = self.stats.snapshot();
        self.checkpoint.update_progress(
            plan.start_offset + final_stats.processed,
            plan.total,
            final_stats.processed,
        );
        if let Err(e) = self.checkpoint.save() {
            warn!(error = %e, "failed to save final checkpoint");
        }
        if let Err(e) = self.stats.save_summary() {
            warn!(error = %e, "failed to save summary");
        }
        self.stats.print_summary();

        if let Err(e) = self.sink.close().await {
            warn!(error = %e, "failed to close sink");
        }

        if cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }
        Ok(())
    }

    async fn run_stages(&self, cancel: &CancellationToken, plan: &RunPlan) {
        let fetchers = self.config.workers.fetchers;
        let processors = self.config.workers.processors;
        let page_size = self.config.api.page_size;
        let bulk_size = self.config.bulk.size;

        // Natural completion tears down stage 1 only; processors keep
        // draining the batch channel until it closes.
        let fetch_cancel = cancel.child_token();
        let monitor_cancel = CancellationToken::new();

        let (offset_tx, offset_rx) = mpsc::channel::<usize>(fetchers);

        let fetcher_pool = FetcherPool::new(
            self.client.clone(),
            self.config.retry.clone(),
            page_size,
            fetchers,
            plan.fetch_date.clone(),
        );
        let mut fetcher_out = fetcher_pool.start(fetch_cancel.clone(), offset_rx);

        let processor_pool = ProcessorPool::new(
            self.sink.clone(),
            self.config.retry.clone(),
            bulk_size,
            self.config.bulk.timeout,
            processors,
        );
        let processor_out = processor_pool.start(cancel.clone(), fetcher_out.batches);

        // Offset generator: start_offset, start_offset+page_size, … < total.
        let generator = {
            let gen_cancel = fetch_cancel.clone();
            let (start, total) = (plan.start_offset, plan.total);
            tokio::spawn(async move {
                let mut offset = start;
                while offset < total {
                    tokio::select! {
                        sent = offset_tx.send(offset) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                        _ = gen_cancel.cancelled() => break,
                    }
                    offset += page_size;
                }
            })
        };

        // Event sink: errors from both stages plus flushed counts.
        let events = {
            let stats = self.stats.clone();
            let checkpoint = self.checkpoint.clone();
            let mut fetch_errors = fetcher_out.errors;
            let mut process_errors = processor_out.errors;
            let mut flushed = processor_out.flushed;
            tokio::spawn(async move {
                let mut fetch_open = true;
                let mut process_open = true;
                let mut flushed_open = true;

                while fetch_open || process_open || flushed_open {
                    tokio::select! {
                        maybe = fetch_errors.recv(), if fetch_open => match maybe {
                            Some((offset, err)) => {
                                warn!(offset, error = %err, "fetch error");
                                stats.add_failed(page_size);
                                let key = match &err {
                                    IngestError::Panic(msg) => format!("panic: {msg}"),
                                    _ => format!("offset {offset}"),
                                };
                                checkpoint.record_failed(key);
                            }
                            None => fetch_open = false,
                        },
                        maybe = process_errors.recv(), if process_open => match maybe {
                            Some((batch_id, err)) => {
                                warn!(batch_id, error = %err, "process error");
                                stats.add_failed(bulk_size);
                                let key = match &err {
                                    IngestError::Panic(msg) => format!("panic: {msg}"),
                                    _ => format!("batch {batch_id}"),
                                };
                                checkpoint.record_failed(key);
                            }
                            None => process_open = false,
                        },
                        maybe = flushed.recv(), if flushed_open => match maybe {
                            Some(count) => stats.add_processed(count),
                            None => flushed_open = false,
                        },
                    }
                }
            })
        };

        // Progress display + periodic checkpoint persistence.
        let monitor = {
            let stats = self.stats.clone();
            let checkpoint = self.checkpoint.clone();
            let mon_cancel = monitor_cancel.clone();
            let (start, total) = (plan.start_offset, plan.total);
            let bar = ProgressBar::new(plan.total.saturating_sub(plan.start_offset) as u64);
            bar.set_style(
                ProgressStyle::default_bar()
                    .template(
                        "{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} ({eta})",
                    )
                    .expect("Invalid progress bar template")
                    .progress_chars("#>-"),
            );
            bar.set_message("Processing EPSS data");

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                let mut last_processed = 0usize;

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let snapshot = stats.snapshot();
                            if snapshot.processed > last_processed {
                                bar.inc((snapshot.processed - last_processed) as u64);
                                last_processed = snapshot.processed;
                            }
                            checkpoint.update_progress(
                                start + snapshot.processed,
                                total,
                                snapshot.processed,
                            );
                            if let Err(e) = checkpoint.save() {
                                warn!(error = %e, "failed to save checkpoint");
                            }
                        }
                        _ = mon_cancel.cancelled() => {
                            bar.finish_and_clear();
                            return;
                        }
                    }
                }
            })
        };

        // Wait for the plan to finish or for a shutdown signal.
        tokio::select! {
            _ = fetcher_out.completion.recv() => {
                info!("upstream data exhausted, finishing run");
            }
            _ = cancel.cancelled() => {
                info!("shutdown requested, draining stages");
            }
        }

        // Teardown order matters: stop stage 1, let stage 2 drain the closed
        // batch channel, then stop the monitors.
        fetch_cancel.cancel();
        let _ = generator.await;
        let _ = fetcher_out.supervisor.await;
        let _ = processor_out.supervisor.await;
        let _ = events.await;
        monitor_cancel.cancel();
        let _ = monitor.await;
    }

    async fn determine_mode(
        &self,
        cancel: &CancellationToken,
        target_date: Option<&str>,
        force_incremental: bool,
        checkpoint: &Checkpoint,
    ) -> Result<ModeDecision> {
        // 1. Explicit date always wins.
        if let Some(date) = target_date.filter(|d| !d.is_empty()) {
            info!(date, "running in incremental mode for explicit date");
            let total = self.client.total_for(cancel, Some(date)).await?;
            return Ok(ModeDecision::Run(RunPlan {
                mode: RunMode::Incremental,
                fetch_date: Some(date.to_string()),
                total,
                start_offset: 0,
            }));
        }

        // 2. Forced incremental against today.
        if force_incremental && !checkpoint.last_data_date.is_empty() {
            let today = Local::now().format("%Y-%m-%d").to_string();
            if checkpoint.last_data_date == today {
                return Ok(ModeDecision::Skip);
            }

            info!(
                from = %checkpoint.last_data_date,
                to = %today,
                "running incremental update"
            );
            match self.client.total_for(cancel, Some(&today)).await {
                Ok(total) => {
                    return Ok(ModeDecision::Run(RunPlan {
                        mode: RunMode::Incremental,
                        fetch_date: Some(today),
                        total,
                        start_offset: 0,
                    }));
                }
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => {
                    warn!(error = %err, "no data for today yet, falling back to full mode");
                    return self.full_fallback(cancel, checkpoint).await;
                }
            }
        }

        // 3. Fresh checkpoint: full mode from the stored offset.
        if checkpoint.last_data_date.is_empty() || checkpoint.mode.is_empty() {
            info!("no usable checkpoint, running full mode");
            let total = self.client.total_for(cancel, None).await?;
            return Ok(ModeDecision::Run(RunPlan {
                mode: RunMode::Full,
                fetch_date: None,
                total,
                start_offset: checkpoint.offset,
            }));
        }

        // 4. Resume whatever the checkpoint was doing.
        if checkpoint.mode == "incremental" {
            info!(date = %checkpoint.last_data_date, "resuming incremental run");
            match self
                .client
                .total_for(cancel, Some(&checkpoint.last_data_date))
                .await
            {
                Ok(total) => Ok(ModeDecision::Run(RunPlan {
                    mode: RunMode::Incremental,
                    fetch_date: Some(checkpoint.last_data_date.clone()),
                    total,
                    start_offset: checkpoint.offset,
                })),
                Err(err) if err.is_cancelled() => Err(err),
                Err(err) => {
                    warn!(error = %err, "failed to resume incremental mode, switching to full");
                    self.full_fallback(cancel, checkpoint).await
                }
            }
        } else {
            info!(offset = checkpoint.offset, "resuming full run");
            let total = self.client.total_for(cancel, None).await?;
            Ok(ModeDecision::Run(RunPlan {
                mode: RunMode::Full,
                fetch_date: None,
                total,
                start_offset: checkpoint.offset,
            }))
        }
    }

    /// 5. Full-mode fallback from a failed incremental plan.
    async fn full_fallback(
        &self,
        cancel: &CancellationToken,
        checkpoint: &Checkpoint,
    ) -> Result<ModeDecision> {
        let total = self.client.total_for(cancel, None).await?;
        Ok(ModeDecision::Run(RunPlan {
            mode: RunMode::Full,
            fetch_date: None,
            total,
            start_offset: checkpoint.offset,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        ApiConfig, BulkConfig, CheckpointConfig, JsonConfig, LoggingConfig, RetryConfig,
        WorkersConfig,
    };
    use serde_json::json;
    use wiremock::matchers::{method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(base_url: String, dir: &tempfile::TempDir) -> Config {
        Config {
            workers: WorkersConfig {
                fetchers: 2,
                processors: 2,
            },
            bulk: BulkConfig {
                size: 2,
                timeout: Duration::from_millis(200),
            },
            strategy: "json".into(),
            api: ApiConfig {
                base_url,
                rate_limit: Duration::ZERO,
                timeout: Duration::from_secs(5),
                page_size: 100,
                max_retries: 2,
            },
            elasticsearch: Default::default(),
            json: JsonConfig {
                output_dir: dir.path().join("out").to_str().unwrap().to_string(),
                file_pattern: "epss_batch_%d.json".into(),
                format: "ndjson".into(),
            },
            retry: RetryConfig {
                max_retries: 2,
                delay: Duration::from_millis(10),
                backoff: 1.0,
            },
            logging: LoggingConfig::default(),
            checkpoint: CheckpointConfig {
                enabled: true,
                file_path: dir
                    .path()
                    .join("checkpoint.json")
                    .to_str()
                    .unwrap()
                    .to_string(),
            },
        }
    }

    fn probe_body(total: usize) -> serde_json::Value {
        json!({"total": total, "offset": 0, "limit": 1, "data": [
            {"cve": "CVE-2024-0000", "epss": "0.1", "percentile": "0.5", "date": "2024-01-15"}
        ]})
    }

    #[tokio::test]
    async fn explicit_date_plans_incremental_from_zero() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("date", "2024-01-15"))
            .respond_with(ResponseTemplate::new(200).set_body_json(probe_body(5)))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let orch = Orchestrator::new(test_config(server.uri(), &dir)).unwrap();
        let cancel = CancellationToken::new();

        let decision = orch
            .determine_mode(&cancel, Some("2024-01-15"), false, &Checkpoint::fresh())
            .await
            .unwrap();
        match decision {
            ModeDecision::Run(plan) => {
                assert_eq!(plan.mode, RunMode::Incremental);
                assert_eq!(plan.fetch_date.as_deref(), Some("2024-01-15"));
                assert_eq!(plan.total, 5);
                assert_eq!(plan.start_offset, 0);
            }
            ModeDecision::Skip => panic!("expected a run plan"),
        }
    }

    #[tokio::test]
    async fn current_checkpoint_skips() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let orch = Orchestrator::new(test_config(server.uri(), &dir)).unwrap();
        let cancel = CancellationToken::new();

        let mut cp = Checkpoint::fresh();
        cp.mode = "incremental".into();
        cp.last_data_date = Local::now().format("%Y-%m-%d").to_string();

        let decision = orch
            .determine_mode(&cancel, None, true, &cp)
            .await
            .unwrap();
        assert!(matches!(decision, ModeDecision::Skip));
    }

    #[tokio::test]
    async fn fresh_checkpoint_runs_full() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(probe_body(1234)))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let orch = Orchestrator::new(test_config(server.uri(), &dir)).unwrap();
        let cancel = CancellationToken::new();

        let decision = orch
            .determine_mode(&cancel, None, false, &Checkpoint::fresh())
            .await
            .unwrap();
        match decision {
            ModeDecision::Run(plan) => {
                assert_eq!(plan.mode, RunMode::Full);
                assert!(plan.fetch_date.is_none());
                assert_eq!(plan.total, 1234);
                assert_eq!(plan.start_offset, 0);
            }
            ModeDecision::Skip => panic!("expected a run plan"),
        }
    }

    #[tokio::test]
    async fn incremental_checkpoint_resumes_from_offset() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("date", "2024-01-10"))
            .respond_with(ResponseTemplate::new(200).set_body_json(probe_body(900)))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let orch = Orchestrator::new(test_config(server.uri(), &dir)).unwrap();
        let cancel = CancellationToken::new();

        let mut cp = Checkpoint::fresh();
        cp.mode = "incremental".into();
        cp.last_data_date = "2024-01-10".into();
        cp.offset = 400;

        let decision = orch
            .determine_mode(&cancel, None, false, &cp)
            .await
            .unwrap();
        match decision {
            ModeDecision::Run(plan) => {
                assert_eq!(plan.mode, RunMode::Incremental);
                assert_eq!(plan.fetch_date.as_deref(), Some("2024-01-10"));
                assert_eq!(plan.total, 900);
                assert_eq!(plan.start_offset, 400);
            }
            ModeDecision::Skip => panic!("expected a run plan"),
        }
    }

    #[tokio::test]
    async fn failed_resume_falls_back_to_full() {
        let server = MockServer::start().await;
        // Date-scoped probe fails; the full probe succeeds.
        Mock::given(method("GET"))
            .and(query_param("date", "2024-01-10"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(probe_body(5000)))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let orch = Orchestrator::new(test_config(server.uri(), &dir)).unwrap();
        let cancel = CancellationToken::new();

        let mut cp = Checkpoint::fresh();
        cp.mode = "incremental".into();
        cp.last_data_date = "2024-01-10".into();
        cp.offset = 100;

        let decision = orch
            .determine_mode(&cancel, None, false, &cp)
            .await
            .unwrap();
        match decision {
            ModeDecision::Run(plan) => {
                assert_eq!(plan.mode, RunMode::Full);
                assert!(plan.fetch_date.is_none());
                assert_eq!(plan.total, 5000);
                assert_eq!(plan.start_offset, 100);
            }
            ModeDecision::Skip => panic!("expected a run plan"),
        }
    }
}
