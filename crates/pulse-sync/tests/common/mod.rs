#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pulse_adapters::LocalFileSource;
use pulse_core::SentimentLabel;
use pulse_enrich::{ScoreError, ScoreOutput, Scorer};
use pulse_storage::MemoryStore;
use pulse_sync::{PipelineConfig, SyncPipeline};
use tempfile::TempDir;

pub const HEADER: &str = "employee_id;response_date;score;department;comment";

/// Deterministic scorer: replies by normalized text, optionally slow or failing.
#[derive(Default)]
pub struct ScriptedScorer {
    calls: Mutex<Vec<String>>,
    replies: HashMap<String, (SentimentLabel, f64)>,
    transient_failures: AtomicUsize,
    always_fail: bool,
    delay: Duration,
}

impl ScriptedScorer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(mut self, text: &str, label: SentimentLabel, confidence: f64) -> Self {
        self.replies.insert(text.to_string(), (label, confidence));
        self
    }

    pub fn failing_first(self, failures: usize) -> Self {
        self.transient_failures.store(failures, Ordering::SeqCst);
        self
    }

    pub fn always_failing(mut self) -> Self {
        self.always_fail = true;
        self
    }

    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, text: &str) -> usize {
        self.calls().iter().filter(|t| t.as_str() == text).count()
    }
}

#[async_trait]
impl Scorer for ScriptedScorer {
    fn model_version(&self) -> &str {
        "scripted-v1"
    }

    async fn score(&self, text: &str) -> Result<ScoreOutput, ScoreError> {
        self.calls.lock().unwrap().push(text.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.always_fail {
            return Err(ScoreError::Transient("scorer timed out".into()));
        }
        if self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ScoreError::Transient("connection reset".into()));
        }
        let (label, confidence) = self
            .replies
            .get(text)
            .copied()
            .unwrap_or((SentimentLabel::Positive, 0.9));
        Ok(ScoreOutput {
            label,
            confidence,
            rating: None,
        })
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub store: Arc<MemoryStore>,
    pub scorer: Arc<ScriptedScorer>,
}

impl Harness {
    pub fn new(scorer: ScriptedScorer) -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            store: Arc::new(MemoryStore::new()),
            scorer: Arc::new(scorer),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn batch_path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn config(&self) -> PipelineConfig {
        PipelineConfig {
            local_batch: self.batch_path("batch.csv"),
            archive_dir: self.dir.path().join("archive"),
            workspace_root: self.dir.path().to_path_buf(),
            workers: 3,
            max_retries: 3,
            backoff_base_ms: 1,
            backoff_max_ms: 5,
            lease_secs: 60,
            ..PipelineConfig::default()
        }
    }

    pub fn pipeline(&self) -> SyncPipeline {
        self.pipeline_with(self.config(), "batch.csv")
    }

    pub fn pipeline_with(&self, config: PipelineConfig, batch: &str) -> SyncPipeline {
        SyncPipeline::new(
            config,
            self.store.clone(),
            self.scorer.clone(),
            Arc::new(LocalFileSource::new("survey", self.batch_path(batch))),
        )
    }

    /// Rows are (employee_id, response_date, score, comment).
    pub fn write_batch(&self, name: &str, rows: &[(&str, &str, u8, &str)]) {
        std::fs::write(self.batch_path(name), csv(rows)).unwrap();
    }
}

pub fn csv(rows: &[(&str, &str, u8, &str)]) -> String {
    let mut out = String::from(HEADER);
    out.push('\n');
    for (employee, date, score, comment) in rows {
        out.push_str(&format!("{employee};{date};{score};Engineering;{comment}\n"));
    }
    out
}
