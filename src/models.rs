//! Data model for the EPSS feed and the pipeline's persisted state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One paged response from the EPSS API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpssResponse {
    #[serde(default)]
    pub status: String,
    #[serde(rename = "status-code", default)]
    pub status_code: i32,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub access: String,
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
    #[serde(default)]
    pub data: Vec<EpssRecord>,
}

/// A single per-CVE score record. `epss` and `percentile` stay strings,
/// exactly as the upstream emits them; `cve` is the upsert key downstream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EpssRecord {
    pub cve: String,
    pub epss: String,
    pub percentile: String,
    pub date: String,
    /// Stamped by the client when the record was fetched.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Durable progress state, serialized pretty-printed to the checkpoint file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub offset: usize,
    pub total: usize,
    pub processed: usize,
    pub last_updated: DateTime<Utc>,
    pub start_time: DateTime<Utc>,
    /// YYYY-MM-DD of the last ingested date, empty for full-mode runs.
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub last_data_date: String,
    /// "full", "incremental", or "" for a fresh checkpoint.
    #[serde(default)]
    pub mode: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub failed_records: Vec<String>,
}

impl Checkpoint {
    pub fn fresh() -> Self {
        let now = Utc::now();
        Self {
            offset: 0,
            total: 0,
            processed: 0,
            last_updated: now,
            start_time: now,
            last_data_date: String::new(),
            mode: String::new(),
            failed_records: Vec::new(),
        }
    }
}

/// Runtime counters plus the derived figures computed at snapshot time.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingStats {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub total_records: usize,
    pub processed: usize,
    pub failed: usize,
    pub success_rate: f64,
    pub duration_secs: f64,
    pub records_per_sec: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_parses_upstream_envelope() {
        let body = r#"{
            "status": "OK",
            "status-code": 200,
            "version": "1.0",
            "access": "public",
            "total": 2,
            "offset": 0,
            "limit": 100,
            "data": [
                {"cve": "CVE-2024-0001", "epss": "0.91", "percentile": "0.99", "date": "2024-01-15"},
                {"cve": "CVE-2024-0002", "epss": "0.05", "percentile": "0.40", "date": "2024-01-15"}
            ]
        }"#;

        let resp: EpssResponse = serde_json::from_str(body).unwrap();
        assert_eq!(resp.total, 2);
        assert_eq!(resp.data.len(), 2);
        assert_eq!(resp.data[0].cve, "CVE-2024-0001");
        assert_eq!(resp.data[0].epss, "0.91");
        assert!(resp.data[0].timestamp.is_none());
    }

    #[test]
    fn record_serializes_without_missing_timestamp() {
        let record = EpssRecord {
            cve: "CVE-2024-0001".into(),
            epss: "0.5".into(),
            percentile: "0.9".into(),
            date: "2024-01-15".into(),
            timestamp: None,
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("timestamp"));
    }

    #[test]
    fn fresh_checkpoint_is_empty_mode() {
        let cp = Checkpoint::fresh();
        assert_eq!(cp.mode, "");
        assert_eq!(cp.offset, 0);
        assert!(cp.failed_records.is_empty());

        let json = serde_json::to_string(&cp).unwrap();
        assert!(!json.contains("last_data_date"));
        assert!(!json.contains("failed_records"));
    }
}
