//! Upload of normalized project batches to a PostgREST endpoint.

use async_trait::async_trait;
use cordis_core::{CanonicalColumn, CellValue, ProjectRecord};
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

/// Serialized batch size above which a warning is logged.
pub const PAYLOAD_WARN_BYTES: usize = 5 * 1024 * 1024;

const ERROR_BODY_LIMIT: usize = 500;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("sink rejected batch with http {status}: {body}")]
    Rejected { status: u16, body: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkMode {
    #[default]
    Upsert,
    Insert,
}

impl SinkMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "upsert" => Some(Self::Upsert),
            "insert" => Some(Self::Insert),
            _ => None,
        }
    }

    pub fn prefer_header(self) -> &'static str {
        match self {
            Self::Upsert => "resolution=merge-duplicates,return=minimal",
            Self::Insert => "return=minimal",
        }
    }
}

/// Destination for normalized project batches, keyed by `id`.
#[async_trait]
pub trait ProjectSink: Send + Sync {
    async fn upsert(&self, records: &[ProjectRecord]) -> Result<(), SinkError>;
}

#[derive(Debug, Clone)]
pub struct PostgrestSink {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    mode: SinkMode,
}

impl PostgrestSink {
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        table: &str,
        api_key: impl Into<String>,
        mode: SinkMode,
    ) -> Self {
        Self {
            client,
            endpoint: Self::endpoint_for(base_url, table, mode),
            api_key: api_key.into(),
            mode,
        }
    }

    pub fn endpoint_for(base_url: &str, table: &str, mode: SinkMode) -> String {
        let base = format!("{}/rest/v1/{}", base_url.trim_end_matches('/'), table);
        match mode {
            SinkMode::Upsert => format!("{base}?on_conflict={}", CanonicalColumn::Id),
            SinkMode::Insert => base,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl ProjectSink for PostgrestSink {
    async fn upsert(&self, records: &[ProjectRecord]) -> Result<(), SinkError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .header(CONTENT_TYPE, "application/json")
            .header("Prefer", self.mode.prefer_header())
            .json(records)
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(SinkError::Rejected {
            status: status.as_u16(),
            body: body.chars().take(ERROR_BODY_LIMIT).collect(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFailure {
    pub id: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UploadSummary {
    pub attempted: usize,
    pub records_ok: usize,
    pub records_failed: usize,
    pub batches_ok: usize,
    pub batches_failed: usize,
    pub failures: Vec<RecordFailure>,
}

impl UploadSummary {
    /// Percentage of attempted records that reached the sink.
    pub fn success_rate(&self) -> f64 {
        if self.attempted == 0 {
            return 0.0;
        }
        self.records_ok as f64 / self.attempted as f64 * 100.0
    }
}

fn record_id(record: &ProjectRecord) -> Option<String> {
    record
        .get(CanonicalColumn::Id.as_str())
        .and_then(CellValue::to_text)
}

fn payload_size(batch: &[ProjectRecord]) -> Result<usize, serde_json::Error> {
    serde_json::to_vec(batch).map(|payload| payload.len())
}

/// Send `records` in batches; a rejected batch is retried one record at a time
/// so a single bad row cannot sink its neighbours.
pub async fn upload_records(
    sink: &dyn ProjectSink,
    records: &[ProjectRecord],
    batch_size: usize,
    limit: Option<usize>,
) -> UploadSummary {
    let records = match limit {
        Some(limit) if limit < records.len() => {
            info!(limit, total = records.len(), "capping upload");
            &records[..limit]
        }
        _ => records,
    };
    let batch_size = batch_size.max(1);
    let total_batches = records.len().div_ceil(batch_size);
    let mut summary = UploadSummary {
        attempted: records.len(),
        ..Default::default()
    };

    for (index, batch) in records.chunks(batch_size).enumerate() {
        let batch_no = index + 1;
        match payload_size(batch) {
            Ok(bytes) if bytes > PAYLOAD_WARN_BYTES => {
                warn!(batch = batch_no, bytes, "large upload payload");
            }
            Ok(_) => {}
            Err(err) => warn!(batch = batch_no, error = %err, "could not size upload payload"),
        }

        match sink.upsert(batch).await {
            Ok(()) => {
                summary.batches_ok += 1;
                summary.records_ok += batch.len();
                info!(batch = batch_no, total_batches, records = batch.len(), "batch uploaded");
            }
            Err(err) => {
                summary.batches_failed += 1;
                warn!(
                    batch = batch_no,
                    total_batches,
                    error = %err,
                    "batch rejected; retrying records individually"
                );
                for record in batch {
                    match sink.upsert(std::slice::from_ref(record)).await {
                        Ok(()) => summary.records_ok += 1,
                        Err(err) => {
                            let id = record_id(record);
                            warn!(id = id.as_deref().unwrap_or("<none>"), error = %err, "record rejected");
                            summary.records_failed += 1;
                            summary.failures.push(RecordFailure {
                                id,
                                reason: err.to_string(),
                            });
                        }
                    }
                }
            }
        }
    }

    info!(
        attempted = summary.attempted,
        ok = summary.records_ok,
        failed = summary.records_failed,
        success_rate = summary.success_rate(),
        "upload finished"
    );
    summary
}
