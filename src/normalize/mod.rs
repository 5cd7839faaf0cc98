//! Canonical review schema and the per-platform mappings onto it.
//!
//! Normalizers never fail a batch: a record that is not an object or carries
//! no review id is dropped with a warning.

pub mod amazon;
pub mod shopify;

use crate::models::Platform;
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalReview {
    pub review_id: String,
    pub reviewer_id: String,
    pub display_name: String,
    pub rating: f64,
    pub title: String,
    pub body: String,
    pub verified_purchase: bool,
    pub helpful_votes: u64,
    pub language: String,
    /// RFC 3339 when the source date parses, otherwise the source text.
    pub review_date: String,
    pub platform: Platform,
    pub source_item_id: String,
    pub marketplace_id: String,
    pub source_page_token: String,
}

impl CanonicalReview {
    pub fn parsed_date(&self) -> Option<DateTime<Utc>> {
        parse_date(&self.review_date)
    }
}

/// Provenance attached to every review of one raw page.
#[derive(Debug, Clone, Copy)]
pub struct NormalizeContext<'a> {
    pub platform: Platform,
    pub item_id: &'a str,
    pub marketplace_id: &'a str,
    pub page_token: &'a str,
}

pub type Normalizer = fn(&Value, &NormalizeContext<'_>) -> Option<CanonicalReview>;

pub fn normalize_page(
    normalizer: Normalizer,
    records: &[Value],
    context: &NormalizeContext<'_>,
) -> Vec<CanonicalReview> {
    records
        .iter()
        .enumerate()
        .filter_map(|(index, record)| {
            let review = normalizer(record, context);
            if review.is_none() {
                warn!(
                    target = "reviews.normalize",
                    platform = %context.platform,
                    item_id = %context.item_id,
                    page = %context.page_token,
                    index,
                    "dropped review record that could not be parsed"
                );
            }
            review
        })
        .collect()
}

pub(crate) fn first_string(record: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match record.get(*key)? {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    })
}

pub(crate) fn first_f64(record: &Map<String, Value>, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|key| match record.get(*key)? {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    })
}

pub(crate) fn first_u64(record: &Map<String, Value>, keys: &[&str]) -> Option<u64> {
    keys.iter().find_map(|key| match record.get(*key)? {
        Value::Number(number) => number
            .as_u64()
            .or_else(|| number.as_f64().filter(|n| *n >= 0.0).map(|n| n as u64)),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    })
}

pub(crate) fn first_bool(record: &Map<String, Value>, keys: &[&str]) -> Option<bool> {
    keys.iter().find_map(|key| match record.get(*key)? {
        Value::Bool(flag) => Some(*flag),
        Value::String(text) => match text.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Some(true),
            "false" | "no" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    })
}

pub(crate) fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Parseable dates become RFC 3339 in UTC; anything else is kept verbatim.
pub(crate) fn normalize_date(raw: Option<String>) -> String {
    match raw {
        Some(raw) => parse_date(&raw)
            .map(|date| date.to_rfc3339_opts(SecondsFormat::Secs, true))
            .unwrap_or(raw),
        None => String::new(),
    }
}
