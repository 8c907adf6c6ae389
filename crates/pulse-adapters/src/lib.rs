//! Batch source contracts, CSV decoding and the survey row normalizer.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pulse_core::{RawRow, ValidationError};
use pulse_storage::BatchFetcher;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub mod columns;
pub mod normalize;

pub use columns::ColumnMapping;
pub use normalize::{
    clean_value, is_email_shaped, parse_date, tenure_rank, Normalized, NormalizedBatch, Normalizer,
};

pub const CRATE_NAME: &str = "pulse-adapters";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BatchOrigin {
    Remote { url: String },
    LocalFallback { path: PathBuf },
    Local { path: PathBuf },
}

#[derive(Debug, Clone)]
pub struct BatchPayload {
    pub source_id: String,
    pub origin: BatchOrigin,
    pub received_at: DateTime<Utc>,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("no batch available: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[async_trait]
pub trait BatchSource: Send + Sync {
    fn source_id(&self) -> &str;

    async fn load(&self, run_id: Uuid) -> Result<BatchPayload, SourceError>;
}

/// Reads one CSV file from disk.
#[derive(Debug, Clone)]
pub struct LocalFileSource {
    source_id: String,
    path: PathBuf,
}

impl LocalFileSource {
    pub fn new(source_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            source_id: source_id.into(),
            path: path.into(),
        }
    }
}

async fn read_local(path: &Path) -> Result<Vec<u8>, SourceError> {
    if !tokio::fs::try_exists(path)
        .await
        .with_context(|| format!("checking {}", path.display()))?
    {
        return Err(SourceError::Unavailable(format!("{} does not exist", path.display())));
    }
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading batch {}", path.display()))?;
    Ok(bytes)
}

#[async_trait]
impl BatchSource for LocalFileSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn load(&self, _run_id: Uuid) -> Result<BatchPayload, SourceError> {
        let bytes = read_local(&self.path).await?;
        Ok(BatchPayload {
            source_id: self.source_id.clone(),
            origin: BatchOrigin::Local {
                path: self.path.clone(),
            },
            received_at: Utc::now(),
            bytes,
        })
    }
}

/// Downloads the batch, keeping a local backup that doubles as the fallback when
/// the remote is unreachable.
#[derive(Debug, Clone)]
pub struct RemoteCsvSource {
    source_id: String,
    url: String,
    backup_path: PathBuf,
    force_local: bool,
    fetcher: BatchFetcher,
}

impl RemoteCsvSource {
    pub fn new(
        source_id: impl Into<String>,
        url: impl Into<String>,
        backup_path: impl Into<PathBuf>,
        fetcher: BatchFetcher,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            url: url.into(),
            backup_path: backup_path.into(),
            force_local: false,
            fetcher,
        }
    }

    pub fn force_local(mut self, force_local: bool) -> Self {
        self.force_local = force_local;
        self
    }

    async fn refresh_backup(&self, bytes: &[u8]) -> anyhow::Result<()> {
        if let Some(parent) = self.backup_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        tokio::fs::write(&self.backup_path, bytes)
            .await
            .with_context(|| format!("writing backup {}", self.backup_path.display()))
    }
}

#[async_trait]
impl BatchSource for RemoteCsvSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn load(&self, run_id: Uuid) -> Result<BatchPayload, SourceError> {
        if !self.force_local {
            match self.fetcher.fetch_bytes(run_id, &self.url).await {
                Ok(bytes) => {
                    if let Err(err) = self.refresh_backup(&bytes).await {
                        warn!(error = %err, "downloaded batch but could not refresh local backup");
                    } else {
                        info!(url = %self.url, bytes = bytes.len(), "downloaded batch; local backup updated");
                    }
                    return Ok(BatchPayload {
                        source_id: self.source_id.clone(),
                        origin: BatchOrigin::Remote {
                            url: self.url.clone(),
                        },
                        received_at: Utc::now(),
                        bytes,
                    });
                }
                Err(err) => {
                    warn!(url = %self.url, error = %err, "remote fetch failed; falling back to local backup");
                }
            }
        }

        let bytes = read_local(&self.backup_path).await.map_err(|err| match err {
            SourceError::Unavailable(_) => SourceError::Unavailable(format!(
                "remote fetch failed and no local backup at {}",
                self.backup_path.display()
            )),
            other => other,
        })?;
        Ok(BatchPayload {
            source_id: self.source_id.clone(),
            origin: BatchOrigin::LocalFallback {
                path: self.backup_path.clone(),
            },
            received_at: Utc::now(),
            bytes,
        })
    }
}

/// Decoded CSV rows plus records the reader could not decode.
#[derive(Debug, Clone, Default)]
pub struct CsvBatch {
    pub rows: Vec<RawRow>,
    pub unreadable: Vec<ValidationError>,
}

/// Decode a delimited batch. A header row is required; undecodable records are
/// reported per row instead of failing the batch.
pub fn read_csv_batch(bytes: &[u8], delimiter: u8) -> Result<CsvBatch, csv::Error> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_reader(bytes);
    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .enumerate()
        .map(|(idx, h)| {
            let h = if idx == 0 { h.trim_start_matches('\u{feff}') } else { h };
            h.trim().to_string()
        })
        .collect();

    let mut batch = CsvBatch::default();
    for (idx, record) in reader.records().enumerate() {
        let row_number = idx + 1;
        match record {
            Ok(record) => {
                let fields = headers
                    .iter()
                    .zip(record.iter())
                    .filter(|(header, _)| !header.is_empty())
                    .map(|(header, value)| (header.clone(), value.to_string()))
                    .collect();
                batch.rows.push(RawRow::new(row_number, fields));
            }
            Err(err) => batch.unreadable.push(ValidationError {
                row: row_number,
                key: None,
                field: "<row>".to_string(),
                reason: format!("could not be decoded: {err}"),
            }),
        }
    }
    Ok(batch)
}
