//! Run statistics: thread-safe counters and the end-of-run summary.

use crate::error::Result;
use crate::models::ProcessingStats;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::info;

#[derive(Debug)]
struct Counters {
    start_time: DateTime<Utc>,
    total: usize,
    processed: usize,
    failed: usize,
}

pub struct StatsTracker {
    inner: Mutex<Counters>,
    output_file: String,
}

impl StatsTracker {
    pub fn new(output_file: impl Into<String>) -> Self {
        Self {
            inner: Mutex::new(Counters {
                start_time: Utc::now(),
                total: 0,
                processed: 0,
                failed: 0,
            }),
            output_file: output_file.into(),
        }
    }

    pub fn set_total(&self, total: usize) {
        self.inner.lock().total = total;
    }

    pub fn add_processed(&self, count: usize) {
        self.inner.lock().processed += count;
    }

    pub fn add_failed(&self, count: usize) {
        self.inner.lock().failed += count;
    }

    /// A consistent view of the counters with the derived figures filled in.
    pub fn snapshot(&self) -> ProcessingStats {
        let counters = self.inner.lock();
        let end_time = Utc::now();
        let duration_secs = (end_time - counters.start_time)
            .to_std()
            .unwrap_or_default()
            .as_secs_f64();

        let success_rate = if counters.total > 0 {
            counters.processed as f64 / counters.total as f64 * 100.0
        } else {
            0.0
        };
        let records_per_sec = if duration_secs > 0.0 {
            counters.processed as f64 / duration_secs
        } else {
            0.0
        };

        ProcessingStats {
            start_time: counters.start_time,
            end_time,
            total_records: counters.total,
            processed: counters.processed,
            failed: counters.failed,
            success_rate,
            duration_secs,
            records_per_sec,
        }
    }

    /// Write the human-readable summary to the configured file, plus a
    /// `.json` sibling holding the stats structure.
    pub fn save_summary(&self) -> Result<()> {
        if self.output_file.is_empty() {
            return Ok(());
        }

        let stats = self.snapshot();
        let summary = format!(
            "EPSS Fetcher - Processing Summary\n\
             =================================\n\
             Start Time: {}\n\
             End Time: {}\n\
             Duration: {:.2}s\n\
             Total Records: {}\n\
             Processed: {}\n\
             Failed: {}\n\
             Success Rate: {:.2}%\n\
             Records/sec: {:.2}\n",
            stats.start_time.to_rfc3339(),
            stats.end_time.to_rfc3339(),
            stats.duration_secs,
            stats.total_records,
            stats.processed,
            stats.failed,
            stats.success_rate,
            stats.records_per_sec,
        );
        std::fs::write(&self.output_file, summary)?;

        let json = serde_json::to_string_pretty(&stats)
            .expect("stats serialization cannot fail");
        std::fs::write(format!("{}.json", self.output_file), json)?;
        Ok(())
    }

    pub fn print_summary(&self) {
        let stats = self.snapshot();
        info!(
            total = stats.total_records,
            processed = stats.processed,
            failed = stats.failed,
            "run finished"
        );
        println!("\n=== Processing Summary ===");
        println!("Duration: {:.2}s", stats.duration_secs);
        println!(
            "Total: {}, Processed: {}, Failed: {}",
            stats.total_records, stats.processed, stats.failed
        );
        println!(
            "Success Rate: {:.2}%, Records/sec: {:.2}",
            stats.success_rate, stats.records_per_sec
        );
    }
}
