//! Deterministic change-detection digests over survey records.
//!
//! Both digests are SHA-256 over a canonical serialization: a domain tag, then each
//! field as `name 0x1F tag [len ':' bytes] 0x1E` in a fixed order. Absent values use a
//! different tag than empty ones and every value is length-prefixed, so no two
//! distinct field sequences serialize to the same bytes.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::SurveyRecord;

const FULL_DOMAIN: &[u8] = b"pulse.full.v1";
const TEXT_DOMAIN: &[u8] = b"pulse.text.v1";

macro_rules! digest_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap a previously persisted lowercase hex digest.
            pub fn from_hex(hex: impl Into<String>) -> Self {
                Self(hex.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn short(&self) -> &str {
                &self.0[..self.0.len().min(12)]
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

digest_newtype!(
    /// Digest over every comparison-relevant field of a record.
    FullHash
);
digest_newtype!(
    /// Digest over the normalized comment text only.
    TextHash
);

struct CanonicalWriter {
    hasher: Sha256,
}

impl CanonicalWriter {
    fn new(domain: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(domain);
        hasher.update([0x1d]);
        Self { hasher }
    }

    fn field(&mut self, name: &str, value: Option<&str>) -> &mut Self {
        self.hasher.update(name.as_bytes());
        self.hasher.update([0x1f]);
        match value {
            None => self.hasher.update([0x00]),
            Some(v) => {
                self.hasher.update([0x01]);
                self.hasher.update(v.len().to_string().as_bytes());
                self.hasher.update(b":");
                self.hasher.update(v.as_bytes());
            }
        }
        self.hasher.update([0x1e]);
        self
    }

    fn map<'a>(&mut self, name: &str, entries: impl ExactSizeIterator<Item = (&'a str, String)>) -> &mut Self {
        self.field(name, Some(&entries.len().to_string()));
        for (key, value) in entries {
            self.field(key, Some(&value));
        }
        self
    }

    fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

/// Comments shorter than this (".", "ok", "-") are placeholders, not text to score.
pub const MIN_COMMENT_CHARS: usize = 3;

/// Collapse inner whitespace, trim and case-fold a comment. Blank or placeholder text
/// yields `None`.
pub fn normalize_comment_text(text: &str) -> Option<String> {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() < MIN_COMMENT_CHARS {
        None
    } else {
        Some(collapsed.to_lowercase())
    }
}

impl TextHash {
    /// Hash a comment after normalization; absent or blank comments have no text hash.
    pub fn compute(comment: Option<&str>) -> Option<Self> {
        let normalized = normalize_comment_text(comment?)?;
        let mut writer = CanonicalWriter::new(TEXT_DOMAIN);
        writer.field("comment", Some(&normalized));
        Some(Self(writer.finish()))
    }
}

impl FullHash {
    pub fn compute(record: &SurveyRecord) -> Self {
        let mut writer = CanonicalWriter::new(FULL_DOMAIN);
        let response_date = record.response_date.format("%Y-%m-%d").to_string();
        let score = record.score.to_string();
        let tenure_rank = record.tenure_rank.to_string();
        let period = record.key.period.to_string();
        writer
            .field("employee_id", Some(&record.key.employee_id))
            .field("period", Some(&period))
            .field("name", record.name.as_deref())
            .field("corporate_email", record.corporate_email.as_deref())
            .field("department", record.department.as_deref())
            .field("role", record.role.as_deref())
            .field("function", record.function.as_deref())
            .field("location", record.location.as_deref())
            .field("tenure", record.tenure.as_deref())
            .field("tenure_rank", Some(&tenure_rank))
            .field("phone", record.phone.as_deref())
            .field("gender", record.gender.as_deref())
            .field("generation", record.generation.as_deref())
            .field("response_date", Some(&response_date))
            .field("score", Some(&score));
        // BTreeMap iteration is sorted, so map order is stable. Each map is prefixed
        // with its length so entries cannot migrate between maps unnoticed.
        writer.map("org_levels", record.org_levels.iter().map(|(k, v)| (k.as_str(), v.clone())));
        writer.map("dimensions", record.dimensions.iter().map(|(k, v)| (k.as_str(), v.to_string())));
        writer.map(
            "dimension_comments",
            record.dimension_comments.iter().map(|(k, v)| (k.as_str(), v.clone())),
        );
        writer.field("comment", record.comment.as_deref());
        Self(writer.finish())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordFingerprint {
    pub full_hash: FullHash,
    pub text_hash: Option<TextHash>,
}

impl RecordFingerprint {
    pub fn compute(record: &SurveyRecord) -> Self {
        Self {
            full_hash: FullHash::compute(record),
            text_hash: TextHash::compute(record.comment.as_deref()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpsertAction {
    Insert,
    Update,
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertDecision {
    pub action: UpsertAction,
    pub text_changed: bool,
}

/// Compare the persisted fingerprint (if any) with a freshly computed one.
pub fn decide_upsert(previous: Option<&RecordFingerprint>, next: &RecordFingerprint) -> UpsertDecision {
    match previous {
        None => UpsertDecision {
            action: UpsertAction::Insert,
            text_changed: next.text_hash.is_some(),
        },
        Some(prev) if prev.full_hash == next.full_hash => UpsertDecision {
            action: UpsertAction::Skip,
            text_changed: false,
        },
        Some(prev) => UpsertDecision {
            action: UpsertAction::Update,
            text_changed: prev.text_hash != next.text_hash,
        },
    }
}
