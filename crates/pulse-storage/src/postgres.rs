//! Postgres-backed `SurveyStore`.
//!
//! Lock order inside every write transaction is the `survey_records` row first, then
//! the `enrichment_tasks` row for the same key. Reads are single statements, so each
//! view comes from one snapshot.

use std::collections::BTreeMap;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use pulse_core::{
    decide_upsert, EnrichmentState, EnrichmentTask, FullHash, NaturalKey, RecordFingerprint,
    RecordView, SentimentLabel, SentimentResult, SurveyPeriod, SurveyRecord, TaskMarker, TaskStatus,
    TextHash, UpsertAction,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::debug;

use crate::store::{
    assemble_view, ClaimOutcome, CompleteOutcome, DiscardReason, EnrichmentNeed, StoreError,
    StoreResult, SurveyStore, UpsertOutcome, ViewPage, ViewQuery,
};

const VIEW_CTE: &str = r#"
    WITH views AS (
        SELECT r.employee_id,
               r.period,
               r.department,
               r.data_json,
               r.full_hash,
               r.text_hash,
               r.updated_at,
               s.label,
               s.confidence,
               s.rating,
               s.model_version,
               s.computed_at,
               m.text_hash AS marker_hash,
               m.status AS marker_status,
               m.attempts AS marker_attempts,
               m.holder AS marker_holder,
               m.lease_expires_at AS marker_lease_expires_at,
               m.last_error AS marker_last_error,
               m.updated_at AS marker_updated_at,
               CASE
                   WHEN r.text_hash IS NULL THEN 'no_text'
                   WHEN s.text_hash IS NOT NULL THEN 'enriched'
                   WHEN m.text_hash = r.text_hash AND m.status = 'failed' THEN 'enrichment_failed'
                   WHEN m.text_hash = r.text_hash THEN 'pending_enrichment'
                   ELSE 'inconsistent'
               END AS state
          FROM survey_records r
          LEFT JOIN sentiment_results s ON s.text_hash = r.text_hash
          LEFT JOIN enrichment_tasks m ON m.employee_id = r.employee_id AND m.period = r.period
    )
"#;

#[derive(Debug, Clone)]
pub struct PgSurveyStore {
    pool: PgPool,
}

impl PgSurveyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running migrations")?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn map_sqlx(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db)
            if matches!(db.code().as_deref(), Some("23505") | Some("40001") | Some("40P01")) =>
        {
            StoreError::Conflict(db.message().to_string())
        }
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed => StoreError::Unavailable(err.to_string()),
        _ => StoreError::Other(err.to_string()),
    }
}

fn integrity(what: impl std::fmt::Display) -> StoreError {
    StoreError::Integrity(what.to_string())
}

fn period_of(row: &PgRow) -> StoreResult<SurveyPeriod> {
    let raw: String = row.try_get("period").map_err(map_sqlx)?;
    raw.parse().map_err(integrity)
}

fn key_of(row: &PgRow) -> StoreResult<NaturalKey> {
    let employee_id: String = row.try_get("employee_id").map_err(map_sqlx)?;
    Ok(NaturalKey::new(employee_id, period_of(row)?))
}

fn fingerprint_of(row: &PgRow) -> StoreResult<RecordFingerprint> {
    let full_hash: String = row.try_get("full_hash").map_err(map_sqlx)?;
    let text_hash: Option<String> = row.try_get("text_hash").map_err(map_sqlx)?;
    Ok(RecordFingerprint {
        full_hash: FullHash::from_hex(full_hash),
        text_hash: text_hash.map(TextHash::from_hex),
    })
}

fn record_of(row: &PgRow) -> StoreResult<SurveyRecord> {
    let data: serde_json::Value = row.try_get("data_json").map_err(map_sqlx)?;
    serde_json::from_value(data).map_err(|err| integrity(format!("undecodable record payload: {err}")))
}

fn count_of(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

/// Decode marker columns, optionally prefixed (the view query aliases them `marker_*`).
fn marker_of(row: &PgRow, key: &NaturalKey, prefix: &str) -> StoreResult<Option<TaskMarker>> {
    let hash_column = if prefix.is_empty() { "text_hash".to_string() } else { format!("{prefix}hash") };
    let hash: Option<String> = row.try_get(hash_column.as_str()).map_err(map_sqlx)?;
    let Some(hash) = hash else {
        return Ok(None);
    };
    let col = |name: &str| format!("{prefix}{name}");
    let status: String = row.try_get(col("status").as_str()).map_err(map_sqlx)?;
    let attempts: i32 = row.try_get(col("attempts").as_str()).map_err(map_sqlx)?;
    Ok(Some(TaskMarker {
        key: key.clone(),
        text_hash: TextHash::from_hex(hash),
        status: status.parse().map_err(integrity)?,
        attempts: count_of(attempts),
        holder: row.try_get(col("holder").as_str()).map_err(map_sqlx)?,
        lease_expires_at: row.try_get(col("lease_expires_at").as_str()).map_err(map_sqlx)?,
        last_error: row.try_get(col("last_error").as_str()).map_err(map_sqlx)?,
        updated_at: row.try_get(col("updated_at").as_str()).map_err(map_sqlx)?,
    }))
}

fn result_of(row: &PgRow, text_hash: Option<&TextHash>) -> StoreResult<Option<SentimentResult>> {
    let label: Option<String> = row.try_get("label").map_err(map_sqlx)?;
    let (Some(label), Some(text_hash)) = (label, text_hash) else {
        return Ok(None);
    };
    let rating: Option<i16> = row.try_get("rating").map_err(map_sqlx)?;
    Ok(Some(SentimentResult {
        text_hash: text_hash.clone(),
        label: label.parse::<SentimentLabel>().map_err(integrity)?,
        confidence: row.try_get("confidence").map_err(map_sqlx)?,
        rating: rating.and_then(|r| u8::try_from(r).ok()),
        model_version: row.try_get("model_version").map_err(map_sqlx)?,
        computed_at: row.try_get("computed_at").map_err(map_sqlx)?,
    }))
}

fn view_of(row: &PgRow) -> StoreResult<RecordView> {
    let key = key_of(row)?;
    let fingerprint = fingerprint_of(row)?;
    let result = result_of(row, fingerprint.text_hash.as_ref())?;
    let marker = marker_of(row, &key, "marker_")?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at").map_err(map_sqlx)?;
    assemble_view(record_of(row)?, fingerprint, result, marker.as_ref(), updated_at)
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

async fn lock_record(
    tx: &mut Transaction<'_, Postgres>,
    key: &NaturalKey,
) -> StoreResult<Option<PgRow>> {
    sqlx::query(
        r#"
        SELECT employee_id, period, data_json, full_hash, text_hash
          FROM survey_records
         WHERE employee_id = $1 AND period = $2
           FOR UPDATE
        "#,
    )
    .bind(&key.employee_id)
    .bind(key.period.to_string())
    .fetch_optional(&mut **tx)
    .await
    .map_err(map_sqlx)
}

async fn lock_marker(
    tx: &mut Transaction<'_, Postgres>,
    key: &NaturalKey,
) -> StoreResult<Option<TaskMarker>> {
    let row = sqlx::query(
        r#"
        SELECT text_hash, status, attempts, holder, lease_expires_at, last_error, updated_at
          FROM enrichment_tasks
         WHERE employee_id = $1 AND period = $2
           FOR UPDATE
        "#,
    )
    .bind(&key.employee_id)
    .bind(key.period.to_string())
    .fetch_optional(&mut **tx)
    .await
    .map_err(map_sqlx)?;
    match row {
        Some(row) => marker_of(&row, key, ""),
        None => Ok(None),
    }
}

async fn delete_marker(tx: &mut Transaction<'_, Postgres>, key: &NaturalKey) -> StoreResult<()> {
    sqlx::query("DELETE FROM enrichment_tasks WHERE employee_id = $1 AND period = $2")
        .bind(&key.employee_id)
        .bind(key.period.to_string())
        .execute(&mut **tx)
        .await
        .map_err(map_sqlx)?;
    Ok(())
}

async fn result_exists(tx: &mut Transaction<'_, Postgres>, hash: &TextHash) -> StoreResult<bool> {
    let row = sqlx::query("SELECT 1 AS present FROM sentiment_results WHERE text_hash = $1")
        .bind(hash.as_str())
        .fetch_optional(&mut **tx)
        .await
        .map_err(map_sqlx)?;
    Ok(row.is_some())
}

#[async_trait]
impl SurveyStore for PgSurveyStore {
    async fn fingerprint(&self, key: &NaturalKey) -> StoreResult<Option<RecordFingerprint>> {
        let row = sqlx::query(
            "SELECT full_hash, text_hash FROM survey_records WHERE employee_id = $1 AND period = $2",
        )
        .bind(&key.employee_id)
        .bind(key.period.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        row.as_ref().map(fingerprint_of).transpose()
    }

    async fn upsert_record(
        &self,
        record: &SurveyRecord,
        fingerprint: &RecordFingerprint,
    ) -> StoreResult<UpsertOutcome> {
        let key = record.key.clone();
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        let previous = lock_record(&mut tx, &key)
            .await?
            .as_ref()
            .map(fingerprint_of)
            .transpose()?;
        let decision = decide_upsert(previous.as_ref(), fingerprint);
        if decision.action == UpsertAction::Skip {
            tx.rollback().await.map_err(map_sqlx)?;
            return Ok(UpsertOutcome::skipped(key));
        }

        let data = serde_json::to_value(record)
            .map_err(|err| StoreError::Other(format!("encoding record {key}: {err}")))?;
        let now = Utc::now();
        let statement = match decision.action {
            UpsertAction::Insert => {
                r#"
                INSERT INTO survey_records
                    (employee_id, period, data_json, department, full_hash, text_hash, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
                "#
            }
            _ => {
                r#"
                UPDATE survey_records
                   SET data_json = $3,
                       department = $4,
                       full_hash = $5,
                       text_hash = $6,
                       updated_at = $7
                 WHERE employee_id = $1 AND period = $2
                "#
            }
        };
        sqlx::query(statement)
            .bind(&key.employee_id)
            .bind(key.period.to_string())
            .bind(data)
            .bind(record.department.as_deref())
            .bind(fingerprint.full_hash.as_str())
            .bind(fingerprint.text_hash.as_ref().map(TextHash::as_str))
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;

        let enrichment = match (&fingerprint.text_hash, decision.text_changed) {
            (_, false) => EnrichmentNeed::None,
            (None, true) => {
                delete_marker(&mut tx, &key).await?;
                EnrichmentNeed::None
            }
            (Some(hash), true) => {
                if result_exists(&mut tx, hash).await? {
                    delete_marker(&mut tx, &key).await?;
                    EnrichmentNeed::Cached {
                        text_hash: hash.clone(),
                    }
                } else {
                    sqlx::query(
                        r#"
                        INSERT INTO enrichment_tasks
                            (employee_id, period, text_hash, status, attempts, holder, lease_expires_at, last_error, updated_at)
                        VALUES ($1, $2, $3, 'pending', 0, NULL, NULL, NULL, $4)
                        ON CONFLICT (employee_id, period) DO UPDATE
                           SET text_hash = EXCLUDED.text_hash,
                               status = 'pending',
                               attempts = 0,
                               holder = NULL,
                               lease_expires_at = NULL,
                               last_error = NULL,
                               updated_at = EXCLUDED.updated_at
                        "#,
                    )
                    .bind(&key.employee_id)
                    .bind(key.period.to_string())
                    .bind(hash.as_str())
                    .bind(now)
                    .execute(&mut *tx)
                    .await
                    .map_err(map_sqlx)?;
                    EnrichmentNeed::Scheduled {
                        task: EnrichmentTask::new(key.clone(), hash.clone()),
                    }
                }
            }
        };

        tx.commit().await.map_err(map_sqlx)?;
        debug!(%key, action = ?decision.action, text_changed = decision.text_changed, "record upserted");
        Ok(UpsertOutcome {
            key,
            action: decision.action,
            text_changed: decision.text_changed,
            enrichment,
        })
    }

    async fn claimable_tasks(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<EnrichmentTask>> {
        let rows = sqlx::query(
            r#"
            SELECT employee_id, period, text_hash, attempts
              FROM enrichment_tasks
             WHERE status = 'pending'
                OR (status = 'in_flight' AND (lease_expires_at IS NULL OR lease_expires_at <= $1))
             ORDER BY updated_at
             LIMIT $2
            "#,
        )
        .bind(now)
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        rows.iter()
            .map(|row| {
                let hash: String = row.try_get("text_hash").map_err(map_sqlx)?;
                let attempts: i32 = row.try_get("attempts").map_err(map_sqlx)?;
                Ok(EnrichmentTask {
                    key: key_of(row)?,
                    text_hash: TextHash::from_hex(hash),
                    attempts: count_of(attempts),
                })
            })
            .collect()
    }

    async fn claim_task(
        &self,
        task: &EnrichmentTask,
        holder: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<ClaimOutcome> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        let record_row = lock_record(&mut tx, &task.key).await?;
        let Some(marker) = lock_marker(&mut tx, &task.key).await? else {
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
        if result_exists(&mut tx, &task.text_hash).await? {
            delete_marker(&mut tx, &task.key).await?;
            tx.commit().await.map_err(map_sqlx)?;
            return Ok(ClaimOutcome::AlreadyScored);
        }

        let Some(record_row) = record_row else {
            return Ok(ClaimOutcome::Superseded);
        };
        if fingerprint_of(&record_row)?.text_hash.as_ref() != Some(&task.text_hash) {
            return Ok(ClaimOutcome::Superseded);
        }
        let Some(comment) = record_of(&record_row)?.comment else {
            return Ok(ClaimOutcome::Superseded);
        };

        sqlx::query(
            r#"
            UPDATE enrichment_tasks
               SET status = 'in_flight',
                   holder = $3,
                   lease_expires_at = $4,
                   updated_at = $5
             WHERE employee_id = $1 AND period = $2
            "#,
        )
        .bind(&task.key.employee_id)
        .bind(task.key.period.to_string())
        .bind(holder)
        .bind(now + lease)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;
        tx.commit().await.map_err(map_sqlx)?;

        Ok(ClaimOutcome::Claimed {
            comment,
            attempts: marker.attempts,
        })
    }

    async fn complete_task(
        &self,
        task: &EnrichmentTask,
        holder: &str,
        result: &SentimentResult,
    ) -> StoreResult<CompleteOutcome> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        let current_hash = match lock_record(&mut tx, &task.key).await? {
            Some(row) => fingerprint_of(&row)?.text_hash,
            None => None,
        };
        if current_hash.as_ref() != Some(&task.text_hash) {
            return Ok(CompleteOutcome::Discarded(DiscardReason::Superseded));
        }
        let holds = lock_marker(&mut tx, &task.key).await?.is_some_and(|m| {
            m.text_hash == task.text_hash
                && m.status == TaskStatus::InFlight
                && m.holder.as_deref() == Some(holder)
        });
        if !holds {
            return Ok(CompleteOutcome::Discarded(DiscardReason::NotHolder));
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO sentiment_results (text_hash, label, confidence, rating, model_version, computed_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (text_hash) DO NOTHING
            "#,
        )
        .bind(task.text_hash.as_str())
        .bind(result.label.as_str())
        .bind(result.confidence)
        .bind(result.rating.map(i16::from))
        .bind(&result.model_version)
        .bind(result.computed_at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?
        .rows_affected();
        delete_marker(&mut tx, &task.key).await?;
        tx.commit().await.map_err(map_sqlx)?;

        Ok(if inserted == 0 {
            CompleteOutcome::Reused
        } else {
            CompleteOutcome::Committed
        })
    }

    async fn fail_task(
        &self,
        task: &EnrichmentTask,
        holder: &str,
        attempts: u32,
        error: &str,
    ) -> StoreResult<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE enrichment_tasks
               SET status = 'failed',
                   attempts = $5,
                   holder = NULL,
                   lease_expires_at = NULL,
                   last_error = $6,
                   updated_at = NOW()
             WHERE employee_id = $1 AND period = $2 AND text_hash = $3 AND holder = $4
            "#,
        )
        .bind(&task.key.employee_id)
        .bind(task.key.period.to_string())
        .bind(task.text_hash.as_str())
        .bind(holder)
        .bind(i32::try_from(attempts).unwrap_or(i32::MAX))
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?
        .rows_affected();
        Ok(updated > 0)
    }

    async fn record_view(&self, key: &NaturalKey) -> StoreResult<Option<RecordView>> {
        let sql = format!("{VIEW_CTE} SELECT * FROM views WHERE employee_id = $1 AND period = $2");
        let row = sqlx::query(&sql)
            .bind(&key.employee_id)
            .bind(key.period.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(view_of).transpose()
    }

    async fn list_views(&self, query: &ViewQuery) -> StoreResult<ViewPage> {
        let sql = format!(
            r#"{VIEW_CTE}
            SELECT *, COUNT(*) OVER () AS total
              FROM views
             WHERE ($1::text IS NULL OR state = $1)
               AND ($2::text IS NULL OR department = $2)
             ORDER BY employee_id, period
             LIMIT $3 OFFSET $4
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(query.state.map(|s| s.as_str()))
            .bind(query.department.as_deref())
            .bind(sql_limit(query.limit))
            .bind(sql_limit(query.offset))
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;

        let total = match rows.first() {
            Some(row) => row.try_get::<i64, _>("total").map_err(map_sqlx)?,
            None => 0,
        };
        let items = rows.iter().map(view_of).collect::<StoreResult<Vec<_>>>()?;
        Ok(ViewPage {
            items,
            total: usize::try_from(total).unwrap_or(0),
        })
    }

    async fn state_counts(&self) -> StoreResult<BTreeMap<EnrichmentState, u64>> {
        let sql = format!("{VIEW_CTE} SELECT state, COUNT(*) AS n FROM views GROUP BY state");
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;

        let mut counts: BTreeMap<EnrichmentState, u64> =
            EnrichmentState::ALL.into_iter().map(|s| (s, 0)).collect();
        for row in rows {
            let state: String = row.try_get("state").map_err(map_sqlx)?;
            let n: i64 = row.try_get("n").map_err(map_sqlx)?;
            let state: EnrichmentState = state
                .parse()
                .map_err(|_| integrity(format!("{n} records have a text hash with neither result nor marker")))?;
            counts.insert(state, u64::try_from(n).unwrap_or(0));
        }
        Ok(counts)
    }

    async fn failed_tasks(&self, limit: usize) -> StoreResult<Vec<TaskMarker>> {
        let rows = sqlx::query(
            r#"
            SELECT employee_id, period, text_hash, status, attempts, holder, lease_expires_at, last_error, updated_at
              FROM enrichment_tasks
             WHERE status = 'failed'
             ORDER BY updated_at DESC
             LIMIT $1
            "#,
        )
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let key = key_of(row)?;
            if let Some(marker) = marker_of(row, &key, "")? {
                out.push(marker);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sql_limit_saturates_unbounded_queries() {
        assert_eq!(sql_limit(25), 25);
        assert_eq!(sql_limit(usize::MAX), i64::MAX);
    }

    #[test]
    fn view_state_labels_match_domain_states() {
        for state in EnrichmentState::ALL {
            assert!(VIEW_CTE.contains(&format!("'{}'", state.as_str())), "missing {state}");
        }
        assert!("inconsistent".parse::<EnrichmentState>().is_err());
    }

    #[test]
    fn pool_failures_are_fatal_and_other_errors_are_not() {
        assert!(map_sqlx(sqlx::Error::PoolTimedOut).is_fatal());
        assert!(map_sqlx(sqlx::Error::PoolClosed).is_fatal());
        let decode = map_sqlx(sqlx::Error::RowNotFound);
        assert!(!decode.is_fatal());
        assert!(!decode.is_retryable());
    }
}
