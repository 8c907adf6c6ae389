//! Core survey domain model, fingerprints and enrichment state for pulse.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod fingerprint;

pub use fingerprint::{
    decide_upsert, normalize_comment_text, FullHash, RecordFingerprint, TextHash, UpsertAction,
    UpsertDecision,
};

pub const CRATE_NAME: &str = "pulse-core";

/// One untyped row from an input batch, keyed by the header it appeared under.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawRow {
    /// 1-based data row number inside the batch (header excluded).
    pub row_number: usize,
    pub fields: BTreeMap<String, String>,
}

impl RawRow {
    pub fn new(row_number: usize, fields: BTreeMap<String, String>) -> Self {
        Self { row_number, fields }
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.fields.get(column).map(String::as_str)
    }
}

/// Calendar month a survey response belongs to, rendered as `YYYY-MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SurveyPeriod {
    year: i32,
    month: u32,
}

impl SurveyPeriod {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        if (1..=12).contains(&month) && (1900..=9999).contains(&year) {
            Some(Self { year, month })
        } else {
            None
        }
    }

    /// Period of a response date; `None` when the year is outside the supported range.
    pub fn from_date(date: NaiveDate) -> Option<Self> {
        Self::new(date.year(), date.month())
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }
}

impl fmt::Display for SurveyPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for SurveyPeriod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (year, month) = trimmed
            .split_once('-')
            .ok_or_else(|| format!("survey period `{trimmed}` is not YYYY-MM"))?;
        if year.len() != 4 || month.len() != 2 {
            return Err(format!("survey period `{trimmed}` is not YYYY-MM"));
        }
        let year: i32 = year
            .parse()
            .map_err(|_| format!("survey period `{trimmed}` has a non-numeric year"))?;
        let month: u32 = month
            .parse()
            .map_err(|_| format!("survey period `{trimmed}` has a non-numeric month"))?;
        Self::new(year, month).ok_or_else(|| format!("survey period `{trimmed}` is out of range"))
    }
}

impl TryFrom<String> for SurveyPeriod {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SurveyPeriod> for String {
    fn from(value: SurveyPeriod) -> Self {
        value.to_string()
    }
}

/// Natural key of a survey record: one live record per employee per period.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NaturalKey {
    pub employee_id: String,
    pub period: SurveyPeriod,
}

impl NaturalKey {
    pub fn new(employee_id: impl Into<String>, period: SurveyPeriod) -> Self {
        Self {
            employee_id: employee_id.into().trim().to_lowercase(),
            period,
        }
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.employee_id, self.period)
    }
}

/// Canonical, validated survey record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurveyRecord {
    pub key: NaturalKey,
    pub name: Option<String>,
    pub corporate_email: Option<String>,
    pub department: Option<String>,
    pub role: Option<String>,
    #[serde(default)]
    pub function: Option<String>,
    pub location: Option<String>,
    pub tenure: Option<String>,
    pub tenure_rank: u8,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub generation: Option<String>,
    /// Organization hierarchy keyed by level name (`company`, `directorate`, `management`,
    /// `coordination`, `area`).
    #[serde(default)]
    pub org_levels: BTreeMap<String, String>,
    pub response_date: NaiveDate,
    /// eNPS score, 0..=10.
    pub score: u8,
    /// Likert dimensions (1..=5) keyed by canonical dimension name.
    pub dimensions: BTreeMap<String, u8>,
    /// Free-text remarks on individual dimensions, keyed like `dimensions`.
    #[serde(default)]
    pub dimension_comments: BTreeMap<String, String>,
    /// The eNPS comment; the text that gets sentiment-scored.
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SentimentLabel {
    Negative,
    Neutral,
    Positive,
}

impl SentimentLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Negative => "negative",
            Self::Neutral => "neutral",
            Self::Positive => "positive",
        }
    }

    /// Map a star rating (1..=5) onto the three-way label.
    pub fn from_stars(stars: u8) -> Self {
        if stars >= 4 {
            Self::Positive
        } else if stars <= 2 {
            Self::Negative
        } else {
            Self::Neutral
        }
    }

    /// Parse a classifier label. Accepts plain class names (`POSITIVE`, `neg`),
    /// index labels (`LABEL_0`..`LABEL_2`) and star labels (`4 stars`, `1 star`).
    /// Star labels also yield the rating.
    pub fn from_model_label(raw: &str) -> Option<(Self, Option<u8>)> {
        let label = raw.trim().to_ascii_lowercase();
        if let Some(stars) = label
            .strip_suffix(" stars")
            .or_else(|| label.strip_suffix(" star"))
        {
            let stars: u8 = stars.trim().parse().ok()?;
            if !(1..=5).contains(&stars) {
                return None;
            }
            return Some((Self::from_stars(stars), Some(stars)));
        }
        let parsed = match label.as_str() {
            "negative" | "neg" | "label_0" => Self::Negative,
            "neutral" | "neu" | "label_1" => Self::Neutral,
            "positive" | "pos" | "label_2" => Self::Positive,
            _ => return None,
        };
        Some((parsed, None))
    }
}

impl fmt::Display for SentimentLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SentimentLabel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_model_label(s)
            .map(|(label, _)| label)
            .ok_or_else(|| format!("unknown sentiment label `{s}`"))
    }
}

/// Sentiment computed for one normalized comment text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentimentResult {
    pub text_hash: TextHash,
    pub label: SentimentLabel,
    pub confidence: f64,
    pub rating: Option<u8>,
    pub model_version: String,
    pub computed_at: DateTime<Utc>,
}

/// Work item for the enrichment stage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnrichmentTask {
    pub key: NaturalKey,
    pub text_hash: TextHash,
    pub attempts: u32,
}

impl EnrichmentTask {
    pub fn new(key: NaturalKey, text_hash: TextHash) -> Self {
        Self {
            key,
            text_hash,
            attempts: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InFlight,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_flight" => Ok(Self::InFlight),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown task status `{other}`")),
        }
    }
}

/// Persisted enrichment marker; at most one per natural key, tracking the
/// text hash that still needs a sentiment result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMarker {
    pub key: NaturalKey,
    pub text_hash: TextHash,
    pub status: TaskStatus,
    pub attempts: u32,
    pub holder: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl TaskMarker {
    pub fn pending(key: NaturalKey, text_hash: TextHash, now: DateTime<Utc>) -> Self {
        Self {
            key,
            text_hash,
            status: TaskStatus::Pending,
            attempts: 0,
            holder: None,
            lease_expires_at: None,
            last_error: None,
            updated_at: now,
        }
    }

    /// Pending markers and in-flight markers whose lease lapsed can be (re)claimed.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            TaskStatus::Pending => true,
            TaskStatus::InFlight => self.lease_expires_at.map(|at| at <= now).unwrap_or(true),
            TaskStatus::Failed => false,
        }
    }

    pub fn to_task(&self) -> EnrichmentTask {
        EnrichmentTask {
            key: self.key.clone(),
            text_hash: self.text_hash.clone(),
            attempts: self.attempts,
        }
    }
}

/// Externally visible enrichment state of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentState {
    NoText,
    PendingEnrichment,
    Enriched,
    EnrichmentFailed,
}

impl EnrichmentState {
    pub const ALL: [EnrichmentState; 4] = [
        Self::NoText,
        Self::PendingEnrichment,
        Self::Enriched,
        Self::EnrichmentFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoText => "no_text",
            Self::PendingEnrichment => "pending_enrichment",
            Self::Enriched => "enriched",
            Self::EnrichmentFailed => "enrichment_failed",
        }
    }

    /// Derive the state from the record's current text hash, the cached result for
    /// that hash and the record's task marker. `None` means the three disagree,
    /// which the store must never allow to become visible.
    pub fn derive(
        text_hash: Option<&TextHash>,
        result: Option<&SentimentResult>,
        marker: Option<&TaskMarker>,
    ) -> Option<Self> {
        let Some(text_hash) = text_hash else {
            return Some(Self::NoText);
        };
        if result.is_some_and(|r| &r.text_hash == text_hash) {
            return Some(Self::Enriched);
        }
        match marker {
            Some(m) if &m.text_hash == text_hash => Some(match m.status {
                TaskStatus::Failed => Self::EnrichmentFailed,
                TaskStatus::Pending | TaskStatus::InFlight => Self::PendingEnrichment,
            }),
            _ => None,
        }
    }
}

impl fmt::Display for EnrichmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnrichmentState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown enrichment state `{s}`"))
    }
}

/// Read model handed to dashboards and the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordView {
    pub record: SurveyRecord,
    pub fingerprint: RecordFingerprint,
    pub state: EnrichmentState,
    pub sentiment: Option<SentimentResult>,
    pub failure: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Row-local rejection raised by the normalizer.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("row {row} (key {}): field `{field}` {reason}", .key.as_deref().unwrap_or("<unknown>"))]
pub struct ValidationError {
    pub row: usize,
    pub key: Option<String>,
    pub field: String,
    pub reason: String,
}
