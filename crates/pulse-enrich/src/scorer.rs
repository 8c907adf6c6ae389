//! The sentiment scorer boundary.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use pulse_core::SentimentLabel;
use pulse_storage::{
    classify_reqwest_error, classify_status, RetryDisposition, SimpleTokenBucket, TokenBucketConfig,
};
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub struct ScoreOutput {
    pub label: SentimentLabel,
    pub confidence: f64,
    /// Star rating when the model reports one.
    pub rating: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScoreError {
    #[error("transient scorer failure: {0}")]
    Transient(String),
    #[error("permanent scorer failure: {0}")]
    Permanent(String),
}

impl ScoreError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Transient(_) => RetryDisposition::Retryable,
            Self::Permanent(_) => RetryDisposition::NonRetryable,
        }
    }
}

#[async_trait]
pub trait Scorer: Send + Sync {
    fn model_version(&self) -> &str;

    async fn score(&self, text: &str) -> Result<ScoreOutput, ScoreError>;
}

pub fn check_confidence(confidence: f64) -> Result<f64, ScoreError> {
    if confidence.is_finite() && (0.0..=1.0).contains(&confidence) {
        Ok(confidence)
    } else {
        Err(ScoreError::Permanent(format!("confidence {confidence} outside [0, 1]")))
    }
}

/// Decode a classifier response. Accepts a bare `{label, score|confidence}` object or
/// the nested list shapes text-classification servers commonly return.
pub fn parse_score_body(body: &Value) -> Result<ScoreOutput, ScoreError> {
    let candidate = match body {
        Value::Array(items) => items.first().map(|first| match first {
            Value::Array(inner) => inner.first().unwrap_or(first),
            other => other,
        }),
        other => Some(other),
    };
    let Some(Value::Object(obj)) = candidate else {
        return Err(ScoreError::Permanent(format!("unexpected scorer body: {body}")));
    };
    let raw_label = obj
        .get("label")
        .and_then(Value::as_str)
        .ok_or_else(|| ScoreError::Permanent("scorer body has no label".into()))?;
    let (label, rating) = SentimentLabel::from_model_label(raw_label)
        .ok_or_else(|| ScoreError::Permanent(format!("unknown sentiment label `{raw_label}`")))?;
    let confidence = obj
        .get("confidence")
        .or_else(|| obj.get("score"))
        .and_then(Value::as_f64)
        .ok_or_else(|| ScoreError::Permanent("scorer body has no confidence".into()))?;
    Ok(ScoreOutput {
        label,
        confidence: check_confidence(confidence)?,
        rating,
    })
}

#[derive(Debug, Clone)]
pub struct HttpScorerConfig {
    pub url: String,
    pub model_version: String,
    pub timeout: Duration,
    pub rate_limit: Option<TokenBucketConfig>,
}

/// Scores text by POSTing `{"text": ...}` to a classifier endpoint.
#[derive(Debug)]
pub struct HttpScorer {
    client: reqwest::Client,
    url: String,
    model_version: String,
    bucket: Option<SimpleTokenBucket>,
}

impl HttpScorer {
    pub fn new(config: HttpScorerConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building scorer client")?;
        Ok(Self {
            client,
            url: config.url,
            model_version: config.model_version,
            bucket: config.rate_limit.map(SimpleTokenBucket::new),
        })
    }
}

#[async_trait]
impl Scorer for HttpScorer {
    fn model_version(&self) -> &str {
        &self.model_version
    }

    async fn score(&self, text: &str) -> Result<ScoreOutput, ScoreError> {
        if let Some(bucket) = &self.bucket {
            bucket.take().await;
        }
        let response = self
            .client
            .post(&self.url)
            .json(&json!({ "text": text }))
            .send()
            .await
            .map_err(|err| match classify_reqwest_error(&err) {
                RetryDisposition::Retryable => ScoreError::Transient(err.to_string()),
                RetryDisposition::NonRetryable => ScoreError::Permanent(err.to_string()),
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = format!("scorer returned http {}", status.as_u16());
            return Err(match classify_status(status) {
                RetryDisposition::Retryable => ScoreError::Transient(message),
                RetryDisposition::NonRetryable => ScoreError::Permanent(message),
            });
        }
        let body: Value = response.json().await.map_err(|err| {
            if err.is_timeout() {
                ScoreError::Transient(err.to_string())
            } else {
                ScoreError::Permanent(format!("undecodable scorer body: {err}"))
            }
        })?;
        parse_score_body(&body)
    }
}
