//! Batched-file sink.
//!
//! Every flush lands in its own file named from the printf-style
//! `file_pattern` and the batch id, so concurrent writers never collide.

use crate::config::JsonConfig;
use crate::error::{IngestError, Result};
use crate::models::EpssRecord;
use crate::output::Sink;
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq)]
enum FileFormat {
    Array,
    Ndjson,
}

#[derive(Debug)]
pub struct JsonSink {
    output_dir: PathBuf,
    file_pattern: String,
    format: FileFormat,
}

impl JsonSink {
    pub fn new(config: &JsonConfig) -> Result<Self> {
        let format = match config.format.as_str() {
            "array" => FileFormat::Array,
            "ndjson" => FileFormat::Ndjson,
            other => {
                return Err(IngestError::Config(format!("unknown JSON format: {other}")))
            }
        };

        if format_filename(&config.file_pattern, 0).is_none() {
            return Err(IngestError::Config(format!(
                "json.file_pattern must contain one integer directive (e.g. %d): {}",
                config.file_pattern
            )));
        }

        let output_dir = PathBuf::from(&config.output_dir);
        std::fs::create_dir_all(&output_dir)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&output_dir, std::fs::Permissions::from_mode(0o755))?;
        }

        Ok(Self {
            output_dir,
            file_pattern: config.file_pattern.clone(),
            format,
        })
    }
}

#[async_trait]
impl Sink for JsonSink {
    async fn write(&self, batch: &[EpssRecord], batch_id: u64) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let filename = format_filename(&self.file_pattern, batch_id)
            .expect("pattern validated at construction");
        let path = self.output_dir.join(filename);

        let contents = match self.format {
            FileFormat::Array => serde_json::to_vec_pretty(batch)
                .expect("record serialization cannot fail"),
            FileFormat::Ndjson => {
                let mut buf = Vec::new();
                for record in batch {
                    serde_json::to_writer(&mut buf, record)
                        .expect("record serialization cannot fail");
                    buf.push(b'\n');
                }
                buf
            }
        };

        tokio::fs::write(&path, contents).await?;
        debug!(batch_id, records = batch.len(), path = %path.display(), "batch file written");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Expand a printf-style pattern with one integer argument. Supports `%d`
/// and zero-padded `%0Nd`, matching the patterns operators already have in
/// their config files. Returns None when the pattern carries no directive.
fn format_filename(pattern: &str, batch_id: u64) -> Option<String> {
    let percent = pattern.find('%')?;
    let rest = &pattern[percent + 1..];

    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    let after = &rest[digits.len()..];
    if !after.starts_with('d') {
        return None;
    }

    let rendered = if let Some(width_str) = digits.strip_prefix('0') {
        let width: usize = if width_str.is_empty() {
            0
        } else {
            width_str.parse().ok()?
        };
        format!("{batch_id:0width$}")
    } else if !digits.is_empty() {
        let width: usize = digits.parse().ok()?;
        format!("{batch_id:width$}")
    } else {
        batch_id.to_string()
    };

    let mut out = String::with_capacity(pattern.len() + rendered.len());
    out.push_str(&pattern[..percent]);
    out.push_str(&rendered);
    out.push_str(&after[1..]);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink_config(dir: &tempfile::TempDir, format: &str) -> JsonConfig {
        JsonConfig {
            output_dir: dir.path().to_str().unwrap().to_string(),
            file_pattern: "epss_batch_%d.json".into(),
            format: format.into(),
        }
    }

    fn records(n: usize) -> Vec<EpssRecord> {
        (0..n)
            .map(|i| EpssRecord {
                cve: format!("CVE-2024-{i:04}"),
                epss: "0.5".into(),
                percentile: "0.9".into(),
                date: "2024-01-15".into(),
                timestamp: None,
            })
            .collect()
    }

    #[test]
    fn pattern_formatting() {
        assert_eq!(
            format_filename("epss_batch_%d.json", 7).unwrap(),
            "epss_batch_7.json"
        );
        assert_eq!(
            format_filename("epss_%05d.ndjson", 42).unwrap(),
            "epss_00042.ndjson"
        );
        assert_eq!(format_filename("batch-%d", 3).unwrap(), "batch-3");
        assert!(format_filename("no_directive.json", 1).is_none());
        assert!(format_filename("bad_%s.json", 1).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn output_dir_is_created_with_expected_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let mut config = sink_config(&dir, "ndjson");
        config.output_dir = dir.path().join("nested/out").to_str().unwrap().to_string();
        JsonSink::new(&config).unwrap();

        let mode = std::fs::metadata(dir.path().join("nested/out"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn unknown_format_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = JsonSink::new(&sink_config(&dir, "xml")).unwrap_err();
        assert!(matches!(err, IngestError::Config(_)));
    }

    #[tokio::test]
    async fn ndjson_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonSink::new(&sink_config(&dir, "ndjson")).unwrap();
        let batch = records(3);
        sink.write(&batch, 1).await.unwrap();

        let raw =
            std::fs::read_to_string(dir.path().join("epss_batch_1.json")).unwrap();
        let parsed: Vec<EpssRecord> = raw
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(parsed, batch);
    }

    #[tokio::test]
    async fn array_format_is_pretty_json() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonSink::new(&sink_config(&dir, "array")).unwrap();
        sink.write(&records(2), 9).await.unwrap();

        let raw =
            std::fs::read_to_string(dir.path().join("epss_batch_9.json")).unwrap();
        assert!(raw.starts_with('['));
        let parsed: Vec<EpssRecord> = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.len(), 2);
    }

    #[tokio::test]
    async fn empty_batch_writes_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonSink::new(&sink_config(&dir, "ndjson")).unwrap();
        sink.write(&[], 5).await.unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn concurrent_writes_use_distinct_files() {
        let dir = tempfile::tempdir().unwrap();
        let sink = std::sync::Arc::new(JsonSink::new(&sink_config(&dir, "ndjson")).unwrap());

        let mut handles = Vec::new();
        for id in 1..=4u64 {
            let sink = sink.clone();
            handles.push(tokio::spawn(async move {
                sink.write(&records(2), id).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 4);
    }
}
