//! Elasticsearch bulk-index sink.
//!
//! Batches are encoded as NDJSON action/document pairs and POSTed to the
//! `_bulk` endpoint. Records upsert by CVE id, so re-running a date leaves
//! each CVE present exactly once.

use crate::config::ElasticsearchConfig;
use crate::error::{IngestError, Result};
use crate::models::EpssRecord;
use crate::output::Sink;
use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

pub struct ElasticsearchSink {
    client: reqwest::Client,
    host: String,
    index: String,
    username: String,
    password: String,
}

impl ElasticsearchSink {
    pub fn new(config: &ElasticsearchConfig) -> Result<Self> {
        let host = config
            .hosts
            .first()
            .cloned()
            .ok_or_else(|| IngestError::Config("elasticsearch.hosts cannot be empty".into()))?;

        let mut builder = reqwest::Client::builder().timeout(config.timeout);
        if config.skip_tls_verify {
            builder = builder.danger_accept_invalid_certs(true);
        } else if !config.ca_cert_path.is_empty() {
            let pem = std::fs::read(&config.ca_cert_path).map_err(|e| {
                IngestError::Config(format!(
                    "failed to read CA certificate {}: {e}",
                    config.ca_cert_path
                ))
            })?;
            let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                IngestError::Config(format!("failed to parse CA certificate: {e}"))
            })?;
            builder = builder.add_root_certificate(cert);
        }

        Ok(Self {
            client: builder.build()?,
            host,
            index: config.index.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    /// Alternating `{"index":…}` action lines and document lines, one pair
    /// per record, each newline-terminated.
    fn build_bulk_body(&self, batch: &[EpssRecord]) -> String {
        let mut body = String::new();
        for record in batch {
            let action = json!({"index": {"_index": self.index, "_id": record.cve}});
            body.push_str(&action.to_string());
            body.push('\n');
            body.push_str(
                &serde_json::to_string(record).expect("record serialization cannot fail"),
            );
            body.push('\n');
        }
        body
    }
}

#[async_trait]
impl Sink for ElasticsearchSink {
    async fn write(&self, batch: &[EpssRecord], batch_id: u64) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let url = format!("{}/_bulk", self.host);
        let mut request = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(self.build_bulk_body(batch));

        if !self.username.is_empty() && !self.password.is_empty() {
            request = request.basic_auth(&self.username, Some(&self.password));
        }

        let response = request.send().await?;
        let status = response.status();
        if status.as_u16() >= 400 {
            let body = response.text().await.unwrap_or_default();
            return Err(IngestError::SinkStatus {
                status: status.as_u16(),
                body: body.chars().take(256).collect(),
            });
        }

        let bulk_resp: serde_json::Value = response.json().await?;
        if bulk_resp.get("errors") == Some(&serde_json::Value::Bool(true)) {
            return Err(IngestError::SinkPartial);
        }

        debug!(batch_id, records = batch.len(), "bulk indexed");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
