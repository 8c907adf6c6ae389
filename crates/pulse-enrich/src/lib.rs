//! Enrichment stage: task scheduling with explicit in-flight tracking, and a worker
//! pool that scores comments and commits results through the store.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pulse_core::{normalize_comment_text, EnrichmentTask, NaturalKey, SentimentResult, TextHash};
use pulse_storage::{
    BackoffPolicy, ClaimOutcome, CompleteOutcome, DiscardReason, EnrichmentNeed, RetryDisposition,
    StoreError, SurveyStore, UpsertOutcome,
};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod registry;
pub mod scorer;

pub use registry::{InFlightRegistry, LeaseToken};
pub use scorer::{
    check_confidence, parse_score_body, HttpScorer, HttpScorerConfig, ScoreError, ScoreOutput, Scorer,
};

pub const CRATE_NAME: &str = "pulse-enrich";

const QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub task: EnrichmentTask,
    pub token: LeaseToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleDecision {
    Enqueued,
    /// The pair already has a live in-flight entry; nothing was queued.
    AlreadyInFlight,
    /// A result for the new text already existed and was reused.
    Reused,
    NotNeeded,
    /// The worker pool stopped taking tasks; the persisted marker stays pending.
    Deferred,
}

/// Turns upsert outcomes into queued tasks. Dropping the scheduler closes the queue.
#[derive(Debug, Clone)]
pub struct EnrichmentScheduler {
    registry: Arc<InFlightRegistry>,
    queue: mpsc::Sender<QueuedTask>,
}

impl EnrichmentScheduler {
    pub async fn schedule(&self, outcome: &UpsertOutcome) -> ScheduleDecision {
        match &outcome.enrichment {
            EnrichmentNeed::None => ScheduleDecision::NotNeeded,
            EnrichmentNeed::Cached { text_hash } => {
                debug!(key = %outcome.key, text_hash = text_hash.short(), "reusing cached sentiment");
                ScheduleDecision::Reused
            }
            EnrichmentNeed::Scheduled { task } => self.enqueue(task.clone()).await,
        }
    }

    pub async fn enqueue(&self, task: EnrichmentTask) -> ScheduleDecision {
        let Some(token) = self.registry.try_acquire(&task.key, &task.text_hash).await else {
            debug!(key = %task.key, text_hash = task.text_hash.short(), "task already in flight");
            return ScheduleDecision::AlreadyInFlight;
        };
        let (key, text_hash) = (task.key.clone(), task.text_hash.clone());
        if self.queue.send(QueuedTask { task, token }).await.is_err() {
            // Workers are gone; the persisted marker will be recovered by a later run.
            warn!(%key, "enrichment queue closed; task left pending");
            self.registry.release(&key, &text_hash, token).await;
            return ScheduleDecision::Deferred;
        }
        ScheduleDecision::Enqueued
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NotRegistryHolder,
    HeldElsewhere,
    Superseded,
    AlreadyFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    Enriched { attempts: u32 },
    /// Another holder produced the result first; nothing of ours was committed.
    Reused,
    Failed { attempts: u32, error: String },
    Skipped { reason: SkipReason },
    Discarded { reason: DiscardReason },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedTask {
    pub key: NaturalKey,
    pub text_hash: TextHash,
    pub attempts: u32,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EnrichmentStats {
    pub enriched: usize,
    pub reused: usize,
    pub failed: usize,
    pub skipped: usize,
    pub discarded: usize,
    pub scorer_calls: usize,
    pub store_errors: usize,
    pub failures: Vec<FailedTask>,
}

impl EnrichmentStats {
    fn record(&mut self, task: &EnrichmentTask, outcome: &TaskOutcome) {
        match outcome {
            TaskOutcome::Enriched { .. } => self.enriched += 1,
            TaskOutcome::Reused => self.reused += 1,
            TaskOutcome::Failed { attempts, error } => {
                self.failed += 1;
                self.failures.push(FailedTask {
                    key: task.key.clone(),
                    text_hash: task.text_hash.clone(),
                    attempts: *attempts,
                    error: error.clone(),
                });
            }
            TaskOutcome::Skipped { .. } => self.skipped += 1,
            TaskOutcome::Discarded { .. } => self.discarded += 1,
        }
    }

    pub fn merge(&mut self, other: EnrichmentStats) {
        self.enriched += other.enriched;
        self.reused += other.reused;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.discarded += other.discarded;
        self.scorer_calls += other.scorer_calls;
        self.store_errors += other.store_errors;
        self.failures.extend(other.failures);
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub workers: usize,
    pub backoff: BackoffPolicy,
    /// Store-side lease on a claimed marker.
    pub lease: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            backoff: BackoffPolicy::default(),
            lease: Duration::from_secs(300),
        }
    }
}

pub struct EnrichmentWorker {
    id: String,
    store: Arc<dyn SurveyStore>,
    scorer: Arc<dyn Scorer>,
    registry: Arc<InFlightRegistry>,
    backoff: BackoffPolicy,
    lease: chrono::Duration,
}

impl EnrichmentWorker {
    pub fn new(
        id: impl Into<String>,
        store: Arc<dyn SurveyStore>,
        scorer: Arc<dyn Scorer>,
        registry: Arc<InFlightRegistry>,
        config: &WorkerConfig,
    ) -> Self {
        Self {
            id: id.into(),
            store,
            scorer,
            registry,
            backoff: config.backoff,
            lease: chrono::Duration::from_std(config.lease).unwrap_or_else(|_| chrono::Duration::minutes(5)),
        }
    }

    /// Process one task end to end, releasing the registry entry on every path.
    pub async fn process(&self, queued: QueuedTask, stats: &mut EnrichmentStats) -> Result<TaskOutcome, StoreError> {
        let QueuedTask { task, token } = queued;
        let span = info_span!("enrichment_task", key = %task.key, text_hash = task.text_hash.short(), worker = %self.id);
        let outcome = self.run(&task, token, stats).instrument(span).await;
        self.registry.release(&task.key, &task.text_hash, token).await;
        match &outcome {
            Ok(result) => stats.record(&task, result),
            Err(_) => stats.store_errors += 1,
        }
        outcome
    }

    async fn run(
        &self,
        task: &EnrichmentTask,
        token: LeaseToken,
        stats: &mut EnrichmentStats,
    ) -> Result<TaskOutcome, StoreError> {
        if !self.registry.is_holder(&task.key, &task.text_hash, token).await {
            return Ok(TaskOutcome::Skipped {
                reason: SkipReason::NotRegistryHolder,
            });
        }
        // Keys sharing a text queue up here; whoever follows the first scorer claims
        // `AlreadyScored` instead of calling the scorer again.
        let _text_guard = self.registry.lock_text(&task.text_hash).await;
        let holder = format!("{}#{}", self.id, token.get());
        let (comment, prior_attempts) = match self
            .store
            .claim_task(task, &holder, self.lease, Utc::now())
            .await?
        {
            ClaimOutcome::Claimed { comment, attempts } => (comment, attempts),
            ClaimOutcome::AlreadyScored => return Ok(TaskOutcome::Reused),
            ClaimOutcome::Superseded => {
                return Ok(TaskOutcome::Skipped {
                    reason: SkipReason::Superseded,
                })
            }
            ClaimOutcome::HeldElsewhere => {
                return Ok(TaskOutcome::Skipped {
                    reason: SkipReason::HeldElsewhere,
                })
            }
            ClaimOutcome::Failed => {
                return Ok(TaskOutcome::Skipped {
                    reason: SkipReason::AlreadyFailed,
                })
            }
        };

        let Some(text) = normalize_comment_text(&comment) else {
            let error = "claimed comment is blank".to_string();
            self.store.fail_task(task, &holder, prior_attempts, &error).await?;
            return Ok(TaskOutcome::Failed {
                attempts: prior_attempts,
                error,
            });
        };

        let mut attempt = 0usize;
        let scored = loop {
            stats.scorer_calls += 1;
            match self.scorer.score(&text).await {
                Ok(output) => break Ok(output),
                Err(err)
                    if err.disposition() == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries =>
                {
                    warn!(attempt, error = %err, "scorer call failed; retrying");
                    tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
                Err(err) => break Err(err),
            }
        };
        let attempts = prior_attempts.saturating_add(attempt as u32 + 1);

        match scored {
            Ok(output) => {
                let result = SentimentResult {
                    text_hash: task.text_hash.clone(),
                    label: output.label,
                    confidence: output.confidence,
                    rating: output.rating,
                    model_version: self.scorer.model_version().to_string(),
                    computed_at: Utc::now(),
                };
                Ok(match self.store.complete_task(task, &holder, &result).await? {
                    CompleteOutcome::Committed => {
                        info!(label = %result.label, confidence = result.confidence, attempts, "sentiment committed");
                        TaskOutcome::Enriched { attempts }
                    }
                    CompleteOutcome::Reused => TaskOutcome::Reused,
                    CompleteOutcome::Discarded(reason) => {
                        info!(?reason, "discarding stale sentiment result");
                        TaskOutcome::Discarded { reason }
                    }
                })
            }
            Err(err) => {
                let message = err.to_string();
                error!(attempts, error = %message, "enrichment failed");
                if self.store.fail_task(task, &holder, attempts, &message).await? {
                    Ok(TaskOutcome::Failed {
                        attempts,
                        error: message,
                    })
                } else {
                    Ok(TaskOutcome::Discarded {
                        reason: DiscardReason::NotHolder,
                    })
                }
            }
        }
    }
}

/// A fixed set of workers draining one queue. Workers exit once the scheduler side
/// is dropped and the queue is empty, or when cancelled (after finishing the task in hand).
/// A worker that loses the store cancels the pool token, stopping its siblings too.
pub struct WorkerPool {
    handles: Vec<JoinHandle<EnrichmentStats>>,
    receiver: Arc<Mutex<mpsc::Receiver<QueuedTask>>>,
    registry: Arc<InFlightRegistry>,
}

impl WorkerPool {
    pub fn spawn(
        store: Arc<dyn SurveyStore>,
        scorer: Arc<dyn Scorer>,
        registry: Arc<InFlightRegistry>,
        config: &WorkerConfig,
        cancel: CancellationToken,
    ) -> (EnrichmentScheduler, WorkerPool) {
        let (sender, receiver) = mpsc::channel(QUEUE_CAPACITY);
        let receiver = Arc::new(Mutex::new(receiver));
        let pool_id = Uuid::new_v4().simple().to_string();

        let handles = (0..config.workers.max(1))
            .map(|idx| {
                let worker = EnrichmentWorker::new(
                    format!("{}-{idx}", &pool_id[..8]),
                    store.clone(),
                    scorer.clone(),
                    registry.clone(),
                    config,
                );
                let receiver = receiver.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let mut stats = EnrichmentStats::default();
                    loop {
                        let next = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => None,
                            next = async { receiver.lock().await.recv().await } => next,
                        };
                        let Some(queued) = next else {
                            break;
                        };
                        if let Err(err) = worker.process(queued, &mut stats).await {
                            error!(worker = %worker.id, error = %err, "store error during enrichment; marker left for recovery");
                            if err.is_fatal() {
                                cancel.cancel();
                                break;
                            }
                        }
                    }
                    // Senders see a closed queue instead of blocking on a full one.
                    receiver.lock().await.close();
                    stats
                })
            })
            .collect();

        let scheduler = EnrichmentScheduler {
            registry: registry.clone(),
            queue: sender,
        };
        (
            scheduler,
            WorkerPool {
                handles,
                receiver,
                registry,
            },
        )
    }

    /// Wait for every worker and release registry entries of tasks nobody picked up.
    pub async fn join(self) -> EnrichmentStats {
        let mut stats = EnrichmentStats::default();
        for handle in self.handles {
            match handle.await {
                Ok(worker_stats) => stats.merge(worker_stats),
                Err(err) => error!(error = %err, "enrichment worker panicked"),
            }
        }
        let mut receiver = self.receiver.lock().await;
        receiver.close();
        let mut abandoned = 0usize;
        while let Ok(queued) = receiver.try_recv() {
            self.registry
                .release(&queued.task.key, &queued.task.text_hash, queued.token)
                .await;
            abandoned += 1;
        }
        if abandoned > 0 {
            info!(abandoned, "left undrained tasks pending for the next run");
        }
        stats
    }
}
