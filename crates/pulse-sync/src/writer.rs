use std::sync::Arc;

use pulse_core::{RecordFingerprint, SurveyRecord};
use pulse_storage::{StoreError, SurveyStore, UpsertOutcome};
use tracing::warn;

/// Applies insert/update/skip per record, one store transaction each. A lost race on
/// the natural key is retried; the retry sees the winner's fingerprint and usually
/// collapses to a skip.
pub struct UpsertWriter {
    store: Arc<dyn SurveyStore>,
    conflict_retries: usize,
}

impl UpsertWriter {
    pub fn new(store: Arc<dyn SurveyStore>) -> Self {
        Self {
            store,
            conflict_retries: 3,
        }
    }

    pub fn with_conflict_retries(mut self, retries: usize) -> Self {
        self.conflict_retries = retries;
        self
    }

    pub async fn write(&self, record: &SurveyRecord) -> Result<UpsertOutcome, StoreError> {
        let fingerprint = RecordFingerprint::compute(record);
        let mut attempt = 0usize;
        loop {
            match self.store.upsert_record(record, &fingerprint).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) if err.is_retryable() && attempt < self.conflict_retries => {
                    warn!(key = %record.key, attempt, error = %err, "upsert lost a race; retrying record");
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::{DateTime, Duration, NaiveDate, Utc};
    use pulse_core::{
        EnrichmentState, EnrichmentTask, NaturalKey, RecordView, SentimentResult, SurveyPeriod,
        TaskMarker, UpsertAction,
    };
    use pulse_storage::{
        ClaimOutcome, CompleteOutcome, MemoryStore, StoreResult, ViewPage, ViewQuery,
    };

    use super::*;

    /// Fails the first `conflicts` upserts with a uniqueness conflict, then delegates.
    struct RacingStore {
        inner: MemoryStore,
        conflicts: AtomicUsize,
    }

    #[async_trait]
    impl SurveyStore for RacingStore {
        async fn fingerprint(&self, key: &NaturalKey) -> StoreResult<Option<RecordFingerprint>> {
            self.inner.fingerprint(key).await
        }

        async fn upsert_record(
            &self,
            record: &SurveyRecord,
            fingerprint: &RecordFingerprint,
        ) -> StoreResult<UpsertOutcome> {
            if self
                .conflicts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                // The competing writer lands first.
                self.inner.upsert_record(record, fingerprint).await?;
                return Err(StoreError::Conflict("duplicate key value".into()));
            }
            self.inner.upsert_record(record, fingerprint).await
        }

        async fn claimable_tasks(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<EnrichmentTask>> {
            self.inner.claimable_tasks(now, limit).await
        }

        async fn claim_task(
            &self,
            task: &EnrichmentTask,
            holder: &str,
            lease: Duration,
            now: DateTime<Utc>,
        ) -> StoreResult<ClaimOutcome> {
            self.inner.claim_task(task, holder, lease, now).await
        }

        async fn complete_task(
            &self,
            task: &EnrichmentTask,
            holder: &str,
            result: &SentimentResult,
        ) -> StoreResult<CompleteOutcome> {
            self.inner.complete_task(task, holder, result).await
        }

        async fn fail_task(&self, task: &EnrichmentTask, holder: &str, attempts: u32, error: &str) -> StoreResult<bool> {
            self.inner.fail_task(task, holder, attempts, error).await
        }

        async fn record_view(&self, key: &NaturalKey) -> StoreResult<Option<RecordView>> {
            self.inner.record_view(key).await
        }

        async fn list_views(&self, query: &ViewQuery) -> StoreResult<ViewPage> {
            self.inner.list_views(query).await
        }

        async fn state_counts(&self) -> StoreResult<BTreeMap<EnrichmentState, u64>> {
            self.inner.state_counts().await
        }

        async fn failed_tasks(&self, limit: usize) -> StoreResult<Vec<TaskMarker>> {
            self.inner.failed_tasks(limit).await
        }
    }

    fn record() -> SurveyRecord {
        let date = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        SurveyRecord {
            key: NaturalKey::new("e1@corp.example", SurveyPeriod::from_date(date).unwrap()),
            name: None,
            corporate_email: None,
            department: None,
            role: None,
            function: None,
            location: None,
            tenure: None,
            tenure_rank: 0,
            phone: None,
            gender: None,
            generation: None,
            org_levels: BTreeMap::new(),
            response_date: date,
            score: 8,
            dimensions: BTreeMap::new(),
            dimension_comments: BTreeMap::new(),
            comment: Some("great team".into()),
        }
    }

    #[tokio::test]
    async fn lost_race_is_retried_and_becomes_a_skip() {
        let store = Arc::new(RacingStore {
            inner: MemoryStore::new(),
            conflicts: AtomicUsize::new(1),
        });
        let writer = UpsertWriter::new(store.clone());
        let outcome = writer.write(&record()).await.unwrap();
        assert_eq!(outcome.action, UpsertAction::Skip);
        assert_eq!(store.inner.write_count(), 1);
    }

    #[tokio::test]
    async fn persistent_conflicts_surface_after_retries() {
        let store = Arc::new(RacingStore {
            inner: MemoryStore::new(),
            conflicts: AtomicUsize::new(10),
        });
        let writer = UpsertWriter::new(store).with_conflict_retries(2);
        let err = writer.write(&record()).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn unavailable_store_is_not_retried() {
        let store = Arc::new(MemoryStore::new());
        store.set_offline(true);
        let err = UpsertWriter::new(store).write(&record()).await.unwrap_err();
        assert!(err.is_fatal());
    }
}
