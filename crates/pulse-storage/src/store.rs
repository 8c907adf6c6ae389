//! The transactional store seam. Every mutating method is one transaction: a record,
//! its fingerprint and its enrichment marker move together or not at all.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use pulse_core::{
    EnrichmentState, EnrichmentTask, NaturalKey, RecordFingerprint, RecordView, SentimentResult,
    SurveyRecord, TaskMarker, TextHash, UpsertAction,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Lost a race on the natural-key uniqueness constraint; retry the record.
    #[error("conflicting concurrent write: {0}")]
    Conflict(String),
    /// The store cannot be reached; the run must stop at this transaction boundary.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// Persisted state violates an invariant (e.g. a text hash with no result and no marker).
    #[error("integrity violation: {0}")]
    Integrity(String),
    #[error("store error: {0}")]
    Other(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// What the upsert transaction decided about enrichment for the written record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EnrichmentNeed {
    /// Text unchanged, or no text left to score.
    None,
    /// A fresh result for the new text hash already exists and was reused.
    Cached { text_hash: TextHash },
    /// A pending marker was written; the task must be scheduled.
    Scheduled { task: EnrichmentTask },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpsertOutcome {
    pub key: NaturalKey,
    pub action: UpsertAction,
    pub text_changed: bool,
    pub enrichment: EnrichmentNeed,
}

impl UpsertOutcome {
    pub fn skipped(key: NaturalKey) -> Self {
        Self {
            key,
            action: UpsertAction::Skip,
            text_changed: false,
            enrichment: EnrichmentNeed::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The caller now holds the marker until `lease_expires_at`.
    Claimed { comment: String, attempts: u32 },
    /// Some other task already produced a result for this text; marker cleared.
    AlreadyScored,
    /// The record's text changed (or the marker vanished) since enqueue.
    Superseded,
    /// Another holder owns a live lease on this marker.
    HeldElsewhere,
    /// The marker is terminally failed.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardReason {
    NotHolder,
    Superseded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompleteOutcome {
    Committed,
    /// A result for the same text was committed first; ours was dropped.
    Reused,
    Discarded(DiscardReason),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewQuery {
    pub state: Option<EnrichmentState>,
    pub department: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

impl ViewQuery {
    pub fn all() -> Self {
        Self {
            limit: usize::MAX,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ViewPage {
    pub items: Vec<RecordView>,
    pub total: usize,
}

#[async_trait]
pub trait SurveyStore: Send + Sync {
    /// Persisted fingerprint for a key, read outside any write transaction.
    async fn fingerprint(&self, key: &NaturalKey) -> StoreResult<Option<RecordFingerprint>>;

    /// Insert, update or skip a record against its persisted fingerprint. When the text
    /// hash changes the marker is reconciled in the same transaction: cleared when a
    /// result for the new hash exists, otherwise reset to pending for the new hash.
    async fn upsert_record(
        &self,
        record: &SurveyRecord,
        fingerprint: &RecordFingerprint,
    ) -> StoreResult<UpsertOutcome>;

    /// Markers that may be (re)enqueued: pending, or in flight with a lapsed lease.
    async fn claimable_tasks(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<EnrichmentTask>>;

    async fn claim_task(
        &self,
        task: &EnrichmentTask,
        holder: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<ClaimOutcome>;

    /// Commit a result and clear the marker together, provided `holder` still owns the
    /// marker and the record's text hash still equals the task's.
    async fn complete_task(
        &self,
        task: &EnrichmentTask,
        holder: &str,
        result: &SentimentResult,
    ) -> StoreResult<CompleteOutcome>;

    /// Mark the marker failed. Returns `false` when `holder` no longer owns it.
    async fn fail_task(
        &self,
        task: &EnrichmentTask,
        holder: &str,
        attempts: u32,
        error: &str,
    ) -> StoreResult<bool>;

    async fn record_view(&self, key: &NaturalKey) -> StoreResult<Option<RecordView>>;

    async fn list_views(&self, query: &ViewQuery) -> StoreResult<ViewPage>;

    async fn state_counts(&self) -> StoreResult<BTreeMap<EnrichmentState, u64>>;

    async fn failed_tasks(&self, limit: usize) -> StoreResult<Vec<TaskMarker>>;
}

/// Assemble a read view, refusing states the invariants forbid.
pub(crate) fn assemble_view(
    record: SurveyRecord,
    fingerprint: RecordFingerprint,
    result: Option<SentimentResult>,
    marker: Option<&TaskMarker>,
    updated_at: DateTime<Utc>,
) -> StoreResult<RecordView> {
    let state = EnrichmentState::derive(fingerprint.text_hash.as_ref(), result.as_ref(), marker)
        .ok_or_else(|| {
            StoreError::Integrity(format!(
                "record {} has text hash with neither result nor marker",
                record.key
            ))
        })?;
    let failure = match state {
        EnrichmentState::EnrichmentFailed => marker.and_then(|m| m.last_error.clone()),
        _ => None,
    };
    let sentiment = match state {
        EnrichmentState::Enriched => result,
        _ => None,
    };
    Ok(RecordView {
        record,
        fingerprint,
        state,
        sentiment,
        failure,
        updated_at,
    })
}
