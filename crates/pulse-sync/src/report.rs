//! Per-run report files and the Parquet snapshot of the enriched dataset.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use parquet::arrow::ArrowWriter;
use pulse_core::{RecordView, TaskMarker, ValidationError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;

use crate::RunSummary;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub rows: usize,
}

pub fn reports_dir_for(workspace_root: &Path, run_id: &str) -> PathBuf {
    workspace_root.join("reports").join(run_id)
}

/// Write `run_summary.json`, `rejections.json` and `run_brief.md`.
pub async fn write_run_files(
    reports_dir: &Path,
    summary: &RunSummary,
    rejections: &[ValidationError],
) -> Result<()> {
    fs::create_dir_all(reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let summary_json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(reports_dir.join("run_summary.json"), summary_json)
        .await
        .context("writing run_summary.json")?;

    let rejections_json = serde_json::to_vec_pretty(&serde_json::json!({
        "run_id": summary.run_id,
        "rejections": rejections,
    }))
    .context("serializing rejections")?;
    fs::write(reports_dir.join("rejections.json"), rejections_json)
        .await
        .context("writing rejections.json")?;

    fs::write(reports_dir.join("run_brief.md"), run_brief(summary, rejections))
        .await
        .context("writing run_brief.md")?;
    Ok(())
}

fn run_brief(summary: &RunSummary, rejections: &[ValidationError]) -> String {
    let status = if summary.fatal_error.is_some() {
        "aborted"
    } else if summary.cancelled {
        "cancelled"
    } else {
        "completed"
    };
    let mut lines = vec![
        "# Pulse Run Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Status: {status}"),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!("- Source: {}", summary.source_id),
        format!(
            "- Batch: `{}`{}",
            summary.batch_sha256,
            if summary.batch_deduplicated { " (seen before)" } else { "" }
        ),
        String::new(),
        "## Records".to_string(),
        format!("- rows read: {}", summary.rows_read),
        format!("- rejected: {}", summary.rejected),
        format!("- inserted: {}", summary.inserted),
        format!("- updated: {}", summary.updated),
        format!("- skipped: {}", summary.skipped),
        format!("- record errors: {}", summary.record_errors.len()),
        String::new(),
        "## Enrichment".to_string(),
        format!("- enqueued: {} (recovered: {})", summary.enqueued, summary.recovered),
        format!("- already in flight: {}", summary.already_in_flight),
        format!("- reused cached results: {}", summary.reused),
        format!("- left pending: {}", summary.deferred),
        format!("- enriched: {}", summary.enrichment.enriched),
        format!("- failed: {}", summary.enrichment.failed),
        format!("- scorer calls: {}", summary.enrichment.scorer_calls),
    ];
    if let Some(error) = &summary.fatal_error {
        lines.push(String::new());
        lines.push(format!("**Fatal:** {error}"));
    }
    if !rejections.is_empty() {
        lines.push(String::new());
        lines.push("## Rejections".to_string());
        lines.extend(rejections.iter().map(|r| format!("- {r}")));
    }
    if !summary.enrichment.failures.is_empty() {
        lines.push(String::new());
        lines.push("## Enrichment Failures".to_string());
        lines.extend(summary.enrichment.failures.iter().map(|f| {
            format!("- {} ({} attempts): {}", f.key, f.attempts, f.error)
        }));
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Export the current dataset as Parquet and return the manifest path.
pub async fn export_parquet_snapshots(
    reports_dir: &Path,
    views: &[RecordView],
    failures: &[TaskMarker],
) -> Result<PathBuf> {
    let snapshot_dir = reports_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let records_path = snapshot_dir.join("records.parquet");
    let failures_path = snapshot_dir.join("enrichment_failures.parquet");
    write_records_parquet(&records_path, views)?;
    write_failures_parquet(&failures_path, failures)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![
            manifest_entry("records", reports_dir, &records_path, views.len())?,
            manifest_entry("enrichment_failures", reports_dir, &failures_path, failures.len())?,
        ],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_records_parquet(path: &Path, views: &[RecordView]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("employee_id", DataType::Utf8, false),
        ArrowField::new("survey_period", DataType::Utf8, false),
        ArrowField::new("department", DataType::Utf8, true),
        ArrowField::new("role", DataType::Utf8, true),
        ArrowField::new("location", DataType::Utf8, true),
        ArrowField::new("tenure_rank", DataType::UInt32, false),
        ArrowField::new("response_date", DataType::Utf8, false),
        ArrowField::new("score", DataType::UInt32, false),
        ArrowField::new("comment", DataType::Utf8, true),
        ArrowField::new("enrichment_state", DataType::Utf8, false),
        ArrowField::new("sentiment_label", DataType::Utf8, true),
        ArrowField::new("sentiment_confidence", DataType::Float64, true),
        ArrowField::new("model_version", DataType::Utf8, true),
        ArrowField::new("full_hash", DataType::Utf8, false),
        ArrowField::new("text_hash", DataType::Utf8, true),
    ]));

    let employee_ids = StringArray::from(
        views
            .iter()
            .map(|v| Some(v.record.key.employee_id.as_str()))
            .collect::<Vec<_>>(),
    );
    let periods = StringArray::from(
        views
            .iter()
            .map(|v| Some(v.record.key.period.to_string()))
            .collect::<Vec<_>>(),
    );
    let departments = StringArray::from(
        views
            .iter()
            .map(|v| v.record.department.as_deref())
            .collect::<Vec<_>>(),
    );
    let roles = StringArray::from(views.iter().map(|v| v.record.role.as_deref()).collect::<Vec<_>>());
    let locations = StringArray::from(
        views
            .iter()
            .map(|v| v.record.location.as_deref())
            .collect::<Vec<_>>(),
    );
    let tenure_ranks = UInt32Array::from(
        views
            .iter()
            .map(|v| u32::from(v.record.tenure_rank))
            .collect::<Vec<_>>(),
    );
    let response_dates = StringArray::from(
        views
            .iter()
            .map(|v| Some(v.record.response_date.to_string()))
            .collect::<Vec<_>>(),
    );
    let scores = UInt32Array::from(views.iter().map(|v| u32::from(v.record.score)).collect::<Vec<_>>());
    let comments = StringArray::from(views.iter().map(|v| v.record.comment.as_deref()).collect::<Vec<_>>());
    let states = StringArray::from(views.iter().map(|v| Some(v.state.as_str())).collect::<Vec<_>>());
    let labels = StringArray::from(
        views
            .iter()
            .map(|v| v.sentiment.as_ref().map(|s| s.label.as_str()))
            .collect::<Vec<_>>(),
    );
    let confidences = Float64Array::from(
        views
            .iter()
            .map(|v| v.sentiment.as_ref().map(|s| s.confidence))
            .collect::<Vec<_>>(),
    );
    let model_versions = StringArray::from(
        views
            .iter()
            .map(|v| v.sentiment.as_ref().map(|s| s.model_version.as_str()))
            .collect::<Vec<_>>(),
    );
    let full_hashes = StringArray::from(
        views
            .iter()
            .map(|v| Some(v.fingerprint.full_hash.as_str()))
            .collect::<Vec<_>>(),
    );
    let text_hashes = StringArray::from(
        views
            .iter()
            .map(|v| v.fingerprint.text_hash.as_ref().map(|h| h.as_str()))
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(employee_ids),
            Arc::new(periods),
            Arc::new(departments),
            Arc::new(roles),
            Arc::new(locations),
            Arc::new(tenure_ranks),
            Arc::new(response_dates),
            Arc::new(scores),
            Arc::new(comments),
            Arc::new(states),
            Arc::new(labels),
            Arc::new(confidences),
            Arc::new(model_versions),
            Arc::new(full_hashes),
            Arc::new(text_hashes),
        ],
    )
    .context("building records record batch")?;
    write_parquet(path, batch)
}

fn write_failures_parquet(path: &Path, failures: &[TaskMarker]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("employee_id", DataType::Utf8, false),
        ArrowField::new("survey_period", DataType::Utf8, false),
        ArrowField::new("text_hash", DataType::Utf8, false),
        ArrowField::new("attempts", DataType::UInt32, false),
        ArrowField::new("last_error", DataType::Utf8, true),
        ArrowField::new("failed_at", DataType::Utf8, false),
    ]));

    let employee_ids = StringArray::from(
        failures
            .iter()
            .map(|m| Some(m.key.employee_id.as_str()))
            .collect::<Vec<_>>(),
    );
    let periods = StringArray::from(
        failures
            .iter()
            .map(|m| Some(m.key.period.to_string()))
            .collect::<Vec<_>>(),
    );
    let text_hashes = StringArray::from(
        failures
            .iter()
            .map(|m| Some(m.text_hash.as_str()))
            .collect::<Vec<_>>(),
    );
    let attempts = UInt32Array::from(failures.iter().map(|m| m.attempts).collect::<Vec<_>>());
    let errors = StringArray::from(failures.iter().map(|m| m.last_error.as_deref()).collect::<Vec<_>>());
    let failed_at = StringArray::from(
        failures
            .iter()
            .map(|m| Some(m.updated_at.to_rfc3339()))
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(employee_ids),
            Arc::new(periods),
            Arc::new(text_hashes),
            Arc::new(attempts),
            Arc::new(errors),
            Arc::new(failed_at),
        ],
    )
    .context("building enrichment_failures record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path, rows: usize) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
        rows,
    })
}

/// Markdown digest of the most recent `runs` run reports.
pub fn report_markdown(runs: usize, workspace_root: Option<PathBuf>) -> Result<String> {
    let root = workspace_root.unwrap_or_else(|| PathBuf::from("."));
    let reports_root = root.join("reports");
    let mut dirs = std::fs::read_dir(&reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .filter(|entry| entry.path().join("run_summary.json").exists())
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();
    let dirs = dirs.into_iter().take(runs.max(1)).collect::<Vec<_>>();

    let mut lines = vec!["# Pulse Run Report".to_string(), String::new()];
    for dir in dirs {
        let run_id = dir.file_name().to_string_lossy().to_string();
        let summary_path = dir.path().join("run_summary.json");
        let summary: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&summary_path)
                .with_context(|| format!("reading {}", summary_path.display()))?,
        )
        .with_context(|| format!("parsing {}", summary_path.display()))?;
        let count = |field: &str| summary.get(field).and_then(|v| v.as_u64()).unwrap_or(0);
        let enrichment = |field: &str| {
            summary
                .get("enrichment")
                .and_then(|e| e.get(field))
                .and_then(|v| v.as_u64())
                .unwrap_or(0)
        };
        let manifest_path = dir.path().join("snapshots").join("manifest.json");

        lines.push(format!("## Run `{run_id}`"));
        lines.push(format!(
            "- records: {} inserted, {} updated, {} skipped, {} rejected",
            count("inserted"),
            count("updated"),
            count("skipped"),
            count("rejected")
        ));
        lines.push(format!(
            "- enrichment: {} enriched, {} failed, {} scorer calls",
            enrichment("enriched"),
            enrichment("failed"),
            enrichment("scorer_calls")
        ));
        if let Some(error) = summary.get("fatal_error").and_then(|v| v.as_str()) {
            lines.push(format!("- fatal: {error}"));
        }
        if summary.get("cancelled").and_then(|v| v.as_bool()).unwrap_or(false) {
            lines.push("- cancelled before the batch finished".to_string());
        }
        lines.push(format!("- summary: `{}`", summary_path.display()));
        if manifest_path.exists() {
            lines.push(format!("- parquet manifest: `{}`", manifest_path.display()));
        }
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}
