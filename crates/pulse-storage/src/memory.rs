//! In-process `SurveyStore`. One mutex guards all tables, so each method body is a
//! serializable transaction.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use pulse_core::{
    decide_upsert, EnrichmentState, EnrichmentTask, NaturalKey, RecordFingerprint, RecordView,
    SentimentResult, SurveyRecord, TaskMarker, TaskStatus, TextHash, UpsertAction,
};
use tokio::sync::Mutex;

use crate::store::{
    assemble_view, ClaimOutcome, CompleteOutcome, DiscardReason, EnrichmentNeed, StoreError,
    StoreResult, SurveyStore, UpsertOutcome, ViewPage, ViewQuery,
};

#[derive(Debug, Clone)]
struct StoredRecord {
    record: SurveyRecord,
    fingerprint: RecordFingerprint,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Tables {
    records: BTreeMap<NaturalKey, StoredRecord>,
    results: HashMap<TextHash, SentimentResult>,
    markers: BTreeMap<NaturalKey, TaskMarker>,
}

impl Tables {
    fn view(&self, stored: &StoredRecord) -> StoreResult<RecordView> {
        let result = stored
            .fingerprint
            .text_hash
            .as_ref()
            .and_then(|h| self.results.get(h))
            .cloned();
        assemble_view(
            stored.record.clone(),
            stored.fingerprint.clone(),
            result,
            self.markers.get(&stored.record.key),
            stored.updated_at,
        )
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    writes: AtomicU64,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed transactions that mutated state.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Simulate losing connectivity; every call fails with `Unavailable` while set.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub async fn marker(&self, key: &NaturalKey) -> Option<TaskMarker> {
        self.tables.lock().await.markers.get(key).cloned()
    }

    pub async fn result_count(&self) -> usize {
        self.tables.lock().await.results.len()
    }

    fn ensure_online(&self) -> StoreResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store is offline".into()))
        } else {
            Ok(())
        }
    }

    fn committed(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl SurveyStore for MemoryStore {
    async fn fingerprint(&self, key: &NaturalKey) -> StoreResult<Option<RecordFingerprint>> {
        self.ensure_online()?;
        let tables = self.tables.lock().await;
        Ok(tables.records.get(key).map(|r| r.fingerprint.clone()))
    }

    async fn upsert_record(
        &self,
        record: &SurveyRecord,
        fingerprint: &RecordFingerprint,
    ) -> StoreResult<UpsertOutcome> {
        self.ensure_online()?;
        let mut tables = self.tables.lock().await;
        let key = record.key.clone();
        let decision = decide_upsert(tables.records.get(&key).map(|r| &r.fingerprint), fingerprint);
        if decision.action == UpsertAction::Skip {
            return Ok(UpsertOutcome::skipped(key));
        }

        let now = Utc::now();
        tables.records.insert(
            key.clone(),
            StoredRecord {
                record: record.clone(),
                fingerprint: fingerprint.clone(),
                updated_at: now,
            },
        );

        let enrichment = match (&fingerprint.text_hash, decision.text_changed) {
            (_, false) => EnrichmentNeed::None,
            (None, true) => {
                tables.markers.remove(&key);
                EnrichmentNeed::None
            }
            (Some(hash), true) if tables.results.contains_key(hash) => {
                tables.markers.remove(&key);
                EnrichmentNeed::Cached {
                    text_hash: hash.clone(),
                }
            }
            (Some(hash), true) => {
                let marker = TaskMarker::pending(key.clone(), hash.clone(), now);
                let task = marker.to_task();
                tables.markers.insert(key.clone(), marker);
                EnrichmentNeed::Scheduled { task }
            }
        };
        self.committed();

        Ok(UpsertOutcome {
            key,
            action: decision.action,
            text_changed: decision.text_changed,
            enrichment,
        })
    }

    async fn claimable_tasks(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<EnrichmentTask>> {
        self.ensure_online()?;
        let tables = self.tables.lock().await;
        let mut markers: Vec<_> = tables.markers.values().filter(|m| m.is_claimable(now)).collect();
        markers.sort_by_key(|m| m.updated_at);
        Ok(markers.into_iter().take(limit).map(TaskMarker::to_task).collect())
    }

    async fn claim_task(
        &self,
        task: &EnrichmentTask,
        holder: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<ClaimOutcome> {
        self.ensure_online()?;
        let mut tables = self.tables.lock().await;
        let Some(marker) = tables.markers.get(&task.key) else {
            return Ok(ClaimOutcome::Superseded);
        };
        if marker.text_hash != task.text_hash {
            return Ok(ClaimOutcome::Superseded);
        }
        if marker.status == TaskStatus::Failed {
            return Ok(ClaimOutcome::Failed);
        }
        if !marker.is_claimable(now) && marker.holder.as_deref() != Some(holder) {
            return Ok(ClaimOutcome::HeldElsewhere);
        }
        if tables.results.contains_key(&task.text_hash) {
            tables.markers.remove(&task.key);
            self.committed();
            return Ok(ClaimOutcome::AlreadyScored);
        }
        let comment = tables
            .records
            .get(&task.key)
            .filter(|r| r.fingerprint.text_hash.as_ref() == Some(&task.text_hash))
            .and_then(|r| r.record.comment.clone());
        let Some(comment) = comment else {
            return Ok(ClaimOutcome::Superseded);
        };

        let Some(marker) = tables.markers.get_mut(&task.key) else {
            return Ok(ClaimOutcome::Superseded);
        };
        marker.status = TaskStatus::InFlight;
        marker.holder = Some(holder.to_string());
        marker.lease_expires_at = Some(now + lease);
        marker.updated_at = now;
        let attempts = marker.attempts;
        self.committed();
        Ok(ClaimOutcome::Claimed { comment, attempts })
    }

    async fn complete_task(
        &self,
        task: &EnrichmentTask,
        holder: &str,
        result: &SentimentResult,
    ) -> StoreResult<CompleteOutcome> {
        self.ensure_online()?;
        let mut tables = self.tables.lock().await;
        let current_hash = tables
            .records
            .get(&task.key)
            .and_then(|r| r.fingerprint.text_hash.clone());
        if current_hash.as_ref() != Some(&task.text_hash) {
            return Ok(CompleteOutcome::Discarded(DiscardReason::Superseded));
        }
        let holds = tables.markers.get(&task.key).is_some_and(|m| {
            m.text_hash == task.text_hash
                && m.status == TaskStatus::InFlight
                && m.holder.as_deref() == Some(holder)
        });
        if !holds {
            return Ok(CompleteOutcome::Discarded(DiscardReason::NotHolder));
        }

        tables.markers.remove(&task.key);
        let outcome = if tables.results.contains_key(&task.text_hash) {
            CompleteOutcome::Reused
        } else {
            tables.results.insert(task.text_hash.clone(), result.clone());
            CompleteOutcome::Committed
        };
        self.committed();
        Ok(outcome)
    }

    async fn fail_task(
        &self,
        task: &EnrichmentTask,
        holder: &str,
        attempts: u32,
        error: &str,
    ) -> StoreResult<bool> {
        self.ensure_online()?;
        let mut tables = self.tables.lock().await;
        let Some(marker) = tables.markers.get_mut(&task.key) else {
            return Ok(false);
        };
        if marker.text_hash != task.text_hash || marker.holder.as_deref() != Some(holder) {
            return Ok(false);
        }
        marker.status = TaskStatus::Failed;
        marker.attempts = attempts;
        marker.holder = None;
        marker.lease_expires_at = None;
        marker.last_error = Some(error.to_string());
        marker.updated_at = Utc::now();
        self.committed();
        Ok(true)
    }

    async fn record_view(&self, key: &NaturalKey) -> StoreResult<Option<RecordView>> {
        self.ensure_online()?;
        let tables = self.tables.lock().await;
        tables.records.get(key).map(|r| tables.view(r)).transpose()
    }

    async fn list_views(&self, query: &ViewQuery) -> StoreResult<ViewPage> {
        self.ensure_online()?;
        let tables = self.tables.lock().await;
        let mut matching = Vec::new();
        for stored in tables.records.values() {
            if let Some(department) = &query.department {
                if stored.record.department.as_deref() != Some(department.as_str()) {
                    continue;
                }
            }
            let view = tables.view(stored)?;
            if query.state.is_some_and(|s| s != view.state) {
                continue;
            }
            matching.push(view);
        }
        let total = matching.len();
        let items = matching.into_iter().skip(query.offset).take(query.limit).collect();
        Ok(ViewPage { items, total })
    }

    async fn state_counts(&self) -> StoreResult<BTreeMap<EnrichmentState, u64>> {
        self.ensure_online()?;
        let tables = self.tables.lock().await;
        let mut counts: BTreeMap<EnrichmentState, u64> =
            EnrichmentState::ALL.into_iter().map(|s| (s, 0)).collect();
        for stored in tables.records.values() {
            *counts.entry(tables.view(stored)?.state).or_default() += 1;
        }
        Ok(counts)
    }

    async fn failed_tasks(&self, limit: usize) -> StoreResult<Vec<TaskMarker>> {
        self.ensure_online()?;
        let tables = self.tables.lock().await;
        Ok(tables
            .markers
            .values()
            .filter(|m| m.status == TaskStatus::Failed)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use pulse_core::{SentimentLabel, SurveyPeriod};

    use super::*;

    fn record(employee: &str, score: u8, comment: Option<&str>) -> SurveyRecord {
        let date = NaiveDate::from_ymd_opt(2026, 1, 10).unwrap();
        SurveyRecord {
            key: NaturalKey::new(employee, SurveyPeriod::from_date(date).unwrap()),
            name: None,
            corporate_email: None,
            department: Some("Engineering".into()),
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
            score,
            dimensions: BTreeMap::new(),
            dimension_comments: BTreeMap::new(),
            comment: comment.map(str::to_string),
        }
    }

    fn result_for(hash: &TextHash) -> SentimentResult {
        SentimentResult {
            text_hash: hash.clone(),
            label: SentimentLabel::Positive,
            confidence: 0.9,
            rating: None,
            model_version: "test-model".into(),
            computed_at: Utc::now(),
        }
    }

    async fn upsert(store: &MemoryStore, record: &SurveyRecord) -> UpsertOutcome {
        store
            .upsert_record(record, &RecordFingerprint::compute(record))
            .await
            .expect("upsert")
    }

    fn scheduled(outcome: &UpsertOutcome) -> EnrichmentTask {
        match &outcome.enrichment {
            EnrichmentNeed::Scheduled { task } => task.clone(),
            other => panic!("expected scheduled task, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn replaying_identical_record_writes_nothing() {
        let store = MemoryStore::new();
        let r = record("e1@corp.example", 8, Some("great team"));
        assert_eq!(upsert(&store, &r).await.action, UpsertAction::Insert);
        let writes = store.write_count();
        let again = upsert(&store, &r).await;
        assert_eq!(again.action, UpsertAction::Skip);
        assert_eq!(again.enrichment, EnrichmentNeed::None);
        assert_eq!(store.write_count(), writes);
    }

    #[tokio::test]
    async fn text_change_replaces_marker_and_score_change_keeps_it() {
        let store = MemoryStore::new();
        let first = upsert(&store, &record("e1@corp.example", 8, Some("great team"))).await;
        let task = scheduled(&first);

        let score_only = upsert(&store, &record("e1@corp.example", 6, Some("great team"))).await;
        assert_eq!(score_only.action, UpsertAction::Update);
        assert_eq!(score_only.enrichment, EnrichmentNeed::None);
        assert_eq!(store.marker(&task.key).await.unwrap().text_hash, task.text_hash);

        let changed = upsert(&store, &record("e1@corp.example", 6, Some("pay is low"))).await;
        let new_task = scheduled(&changed);
        assert_ne!(new_task.text_hash, task.text_hash);
        assert_eq!(store.marker(&task.key).await.unwrap().text_hash, new_task.text_hash);
    }

    #[tokio::test]
    async fn claim_then_complete_commits_result_and_clears_marker() {
        let store = MemoryStore::new();
        let task = scheduled(&upsert(&store, &record("e1@corp.example", 8, Some("great team"))).await);
        let now = Utc::now();

        let claim = store.claim_task(&task, "w1", Duration::seconds(60), now).await.unwrap();
        assert_eq!(
            claim,
            ClaimOutcome::Claimed {
                comment: "great team".into(),
                attempts: 0
            }
        );
        assert_eq!(
            store.claim_task(&task, "w2", Duration::seconds(60), now).await.unwrap(),
            ClaimOutcome::HeldElsewhere
        );
        let view = store.record_view(&task.key).await.unwrap().unwrap();
        assert_eq!(view.state, EnrichmentState::PendingEnrichment);

        let outcome = store
            .complete_task(&task, "w1", &result_for(&task.text_hash))
            .await
            .unwrap();
        assert_eq!(outcome, CompleteOutcome::Committed);
        assert!(store.marker(&task.key).await.is_none());
        let view = store.record_view(&task.key).await.unwrap().unwrap();
        assert_eq!(view.state, EnrichmentState::Enriched);
        assert_eq!(view.sentiment.unwrap().label, SentimentLabel::Positive);
    }

    #[tokio::test]
    async fn stale_result_is_discarded_after_text_changes() {
        let store = MemoryStore::new();
        let task = scheduled(&upsert(&store, &record("e1@corp.example", 8, Some("great team"))).await);
        store
            .claim_task(&task, "w1", Duration::seconds(60), Utc::now())
            .await
            .unwrap();
        upsert(&store, &record("e1@corp.example", 8, Some("pay is low"))).await;

        let outcome = store
            .complete_task(&task, "w1", &result_for(&task.text_hash))
            .await
            .unwrap();
        assert_eq!(outcome, CompleteOutcome::Discarded(DiscardReason::Superseded));
        assert_eq!(store.result_count().await, 0);
        let view = store.record_view(&task.key).await.unwrap().unwrap();
        assert_eq!(view.state, EnrichmentState::PendingEnrichment);
    }

    #[tokio::test]
    async fn reverting_to_scored_text_reuses_cached_result() {
        let store = MemoryStore::new();
        let task = scheduled(&upsert(&store, &record("e1@corp.example", 8, Some("great team"))).await);
        store
            .claim_task(&task, "w1", Duration::seconds(60), Utc::now())
            .await
            .unwrap();
        store
            .complete_task(&task, "w1", &result_for(&task.text_hash))
            .await
            .unwrap();

        scheduled(&upsert(&store, &record("e1@corp.example", 8, Some("pay is low"))).await);
        let reverted = upsert(&store, &record("e1@corp.example", 8, Some("Great team"))).await;
        assert_eq!(
            reverted.enrichment,
            EnrichmentNeed::Cached {
                text_hash: task.text_hash.clone()
            }
        );
        assert!(store.marker(&task.key).await.is_none());
        let view = store.record_view(&task.key).await.unwrap().unwrap();
        assert_eq!(view.state, EnrichmentState::Enriched);
    }

    #[tokio::test]
    async fn failed_marker_is_terminal_until_text_changes() {
        let store = MemoryStore::new();
        let task = scheduled(&upsert(&store, &record("e1@corp.example", 8, Some("great team"))).await);
        let now = Utc::now();
        store.claim_task(&task, "w1", Duration::seconds(60), now).await.unwrap();
        assert!(store.fail_task(&task, "w1", 4, "scorer exploded").await.unwrap());

        assert!(store.claimable_tasks(now, 10).await.unwrap().is_empty());
        assert_eq!(
            store.claim_task(&task, "w2", Duration::seconds(60), now).await.unwrap(),
            ClaimOutcome::Failed
        );
        let view = store.record_view(&task.key).await.unwrap().unwrap();
        assert_eq!(view.state, EnrichmentState::EnrichmentFailed);
        assert_eq!(view.failure.as_deref(), Some("scorer exploded"));

        let changed = upsert(&store, &record("e1@corp.example", 8, Some("better now"))).await;
        scheduled(&changed);
        let view = store.record_view(&task.key).await.unwrap().unwrap();
        assert_eq!(view.state, EnrichmentState::PendingEnrichment);
    }

    #[tokio::test]
    async fn lapsed_lease_makes_marker_claimable_again() {
        let store = MemoryStore::new();
        let task = scheduled(&upsert(&store, &record("e1@corp.example", 8, Some("great team"))).await);
        let now = Utc::now();
        store.claim_task(&task, "w1", Duration::seconds(30), now).await.unwrap();
        assert!(store.claimable_tasks(now, 10).await.unwrap().is_empty());

        let later = now + Duration::seconds(31);
        assert_eq!(store.claimable_tasks(later, 10).await.unwrap(), vec![task.clone()]);
        assert!(matches!(
            store.claim_task(&task, "w2", Duration::seconds(30), later).await.unwrap(),
            ClaimOutcome::Claimed { .. }
        ));
        assert_eq!(
            store.complete_task(&task, "w1", &result_for(&task.text_hash)).await.unwrap(),
            CompleteOutcome::Discarded(DiscardReason::NotHolder)
        );
    }

    #[tokio::test]
    async fn list_views_filters_by_state_and_counts() {
        let store = MemoryStore::new();
        upsert(&store, &record("a@corp.example", 8, Some("great team"))).await;
        upsert(&store, &record("b@corp.example", 5, None)).await;

        let pending = store
            .list_views(&ViewQuery {
                state: Some(EnrichmentState::PendingEnrichment),
                limit: 10,
                ..ViewQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(pending.total, 1);
        assert_eq!(pending.items[0].record.key.employee_id, "a@corp.example");

        let counts = store.state_counts().await.unwrap();
        assert_eq!(counts[&EnrichmentState::PendingEnrichment], 1);
        assert_eq!(counts[&EnrichmentState::NoText], 1);
        assert_eq!(counts[&EnrichmentState::Enriched], 0);
    }

    #[tokio::test]
    async fn offline_store_reports_fatal_unavailability() {
        let store = MemoryStore::new();
        store.set_offline(true);
        let err = store
            .upsert_record(
                &record("a@corp.example", 8, None),
                &RecordFingerprint::compute(&record("a@corp.example", 8, None)),
            )
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(store.write_count(), 0);
    }
}
