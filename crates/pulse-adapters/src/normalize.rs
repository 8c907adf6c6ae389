//! RawRow -> SurveyRecord coercion and validation.

use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;
use pulse_core::{NaturalKey, RawRow, SurveyPeriod, SurveyRecord, ValidationError};
use serde::Serialize;

use crate::columns::{self, ColumnMapping, DIMENSIONS, DIMENSION_COMMENTS, ORG_LEVELS};

const DATE_FORMATS: [&str; 4] = ["%d/%m/%Y", "%Y-%m-%d", "%d-%m-%Y", "%d.%m.%Y"];

/// Outcome of normalizing one row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Normalized {
    Valid(SurveyRecord),
    Rejected(ValidationError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NormalizedBatch {
    pub records: Vec<SurveyRecord>,
    pub rejections: Vec<ValidationError>,
}

/// Empty, whitespace-only and `-` placeholders are absent values.
pub fn clean_value(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "-" {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(trimmed, fmt).ok())
}

pub fn is_email_shaped(value: &str) -> bool {
    let Some((local, domain)) = value.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && !value.chars().any(char::is_whitespace)
        && domain
            .split_once('.')
            .is_some_and(|(host, tld)| !host.is_empty() && !tld.is_empty() && !tld.ends_with('.'))
}

/// Ordinal for tenure buckets: 1 (<1y) .. 4 (>5y), 0 when unrecognized.
pub fn tenure_rank(tenure: Option<&str>) -> u8 {
    let Some(tenure) = tenure else {
        return 0;
    };
    let t = tenure.trim().to_lowercase();
    if t.contains("menos de 1") || t.contains("less than 1") || t.starts_with("<1") || t.starts_with("< 1") {
        1
    } else if t.contains("entre 1 e 2") || t.contains("1-2") || t.contains("1 to 2") {
        2
    } else if t.contains("entre 2 e 5") || t.contains("2-5") || t.contains("2 to 5") {
        3
    } else if t.contains("mais de 5") || t.contains("more than 5") || t.starts_with(">5") || t.starts_with("> 5") {
        4
    } else {
        0
    }
}

#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    mapping: ColumnMapping,
}

struct RowContext<'a> {
    row: usize,
    key: Option<String>,
    values: HashMap<&'static str, &'a str>,
}

impl RowContext<'_> {
    fn reject(&self, field: &str, reason: impl Into<String>) -> ValidationError {
        ValidationError {
            row: self.row,
            key: self.key.clone(),
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    fn optional(&self, field: &str) -> Option<String> {
        self.values.get(field).and_then(|v| clean_value(v))
    }

    fn required(&self, field: &str) -> Result<String, ValidationError> {
        self.optional(field).ok_or_else(|| self.reject(field, "is required"))
    }

    fn bounded(&self, field: &str, raw: &str, min: u8, max: u8) -> Result<u8, ValidationError> {
        let value: i64 = raw
            .parse()
            .map_err(|_| self.reject(field, format!("is not an integer: `{raw}`")))?;
        u8::try_from(value)
            .ok()
            .filter(|v| (min..=max).contains(v))
            .ok_or_else(|| self.reject(field, format!("must be within {min}..={max}, got {value}")))
    }
}

impl Normalizer {
    pub fn new(mapping: ColumnMapping) -> Self {
        Self { mapping }
    }

    pub fn normalize(&self, row: &RawRow) -> Normalized {
        match self.try_normalize(row) {
            Ok(record) => Normalized::Valid(record),
            Err(err) => Normalized::Rejected(err),
        }
    }

    pub fn normalize_batch(&self, rows: &[RawRow]) -> NormalizedBatch {
        let mut batch = NormalizedBatch::default();
        for row in rows {
            match self.normalize(row) {
                Normalized::Valid(record) => batch.records.push(record),
                Normalized::Rejected(err) => {
                    tracing::warn!(row = err.row, field = %err.field, reason = %err.reason, "row rejected");
                    batch.rejections.push(err);
                }
            }
        }
        batch
    }

    fn try_normalize(&self, row: &RawRow) -> Result<SurveyRecord, ValidationError> {
        let mut ctx = RowContext {
            row: row.row_number,
            key: None,
            values: HashMap::new(),
        };
        for (header, value) in &row.fields {
            if let Some(canonical) = self.mapping.canonical_for(header) {
                // First non-empty value wins when two headers alias the same field.
                let slot = ctx.values.entry(canonical).or_insert(value.as_str());
                if clean_value(*slot).is_none() {
                    *slot = value.as_str();
                }
            }
        }

        let employee_id = ctx.required(columns::EMPLOYEE_ID)?.to_lowercase();
        ctx.key = Some(employee_id.clone());
        if !is_email_shaped(&employee_id) {
            return Err(ctx.reject(columns::EMPLOYEE_ID, format!("is not a valid email: `{employee_id}`")));
        }

        let raw_date = ctx.required(columns::RESPONSE_DATE)?;
        let response_date = parse_date(&raw_date).ok_or_else(|| {
            ctx.reject(
                columns::RESPONSE_DATE,
                format!("has unrecognized date `{raw_date}` (expected DD/MM/YYYY or YYYY-MM-DD)"),
            )
        })?;
        let response_period = SurveyPeriod::from_date(response_date).ok_or_else(|| {
            ctx.reject(
                columns::RESPONSE_DATE,
                format!("`{raw_date}` is outside the supported years 1900..=9999"),
            )
        })?;
        let period = match ctx.optional(columns::SURVEY_PERIOD) {
            Some(raw) => raw
                .parse::<SurveyPeriod>()
                .map_err(|reason| ctx.reject(columns::SURVEY_PERIOD, reason))?,
            None => response_period,
        };
        let key = NaturalKey::new(employee_id, period);
        ctx.key = Some(key.to_string());

        let raw_score = ctx.required(columns::SCORE)?;
        let score = ctx.bounded(columns::SCORE, &raw_score, 0, 10)?;

        let mut dimensions = BTreeMap::new();
        for dimension in DIMENSIONS {
            if let Some(raw) = ctx.optional(dimension) {
                dimensions.insert(dimension.to_string(), ctx.bounded(dimension, &raw, 1, 5)?);
            }
        }

        let corporate_email = ctx.optional(columns::CORPORATE_EMAIL).map(|e| e.to_lowercase());
        if let Some(email) = &corporate_email {
            if !is_email_shaped(email) {
                return Err(ctx.reject(columns::CORPORATE_EMAIL, format!("is not a valid email: `{email}`")));
            }
        }

        let org_levels = ORG_LEVELS
            .iter()
            .filter_map(|(column, level)| ctx.optional(column).map(|v| (level.to_string(), v)))
            .collect();
        let dimension_comments = DIMENSION_COMMENTS
            .iter()
            .filter_map(|(column, dimension)| ctx.optional(column).map(|v| (dimension.to_string(), v)))
            .collect();

        let tenure = ctx.optional(columns::TENURE);
        Ok(SurveyRecord {
            key,
            name: ctx.optional(columns::NAME),
            corporate_email,
            department: ctx.optional(columns::DEPARTMENT),
            role: ctx.optional(columns::ROLE),
            function: ctx.optional(columns::FUNCTION),
            location: ctx.optional(columns::LOCATION),
            tenure_rank: tenure_rank(tenure.as_deref()),
            tenure,
            phone: ctx.optional(columns::PHONE),
            gender: ctx.optional(columns::GENDER),
            generation: ctx.optional(columns::GENERATION),
            org_levels,
            response_date,
            score,
            dimensions,
            dimension_comments,
            comment: ctx.optional(columns::COMMENT),
        })
    }
}
