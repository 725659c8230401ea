//! Core domain model and change-detection fingerprint for the MFDS tracker.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "mfds-core";

/// Joins the canonical signature fields. Never expected inside scraped text.
pub const SIGNATURE_SEPARATOR: char = '\u{1f}';

/// One product as extracted from its detail page.
///
/// Every scalar is the raw extracted text; a label missing from the page is
/// an empty string, never an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DrugDetail {
    pub item_seq: String,
    pub product_name: String,
    pub company_name: String,
    pub cmo_names: String,
    pub rx_otc: String,
    pub review_type: String,
    pub approval_date: String,
    pub efficacy_text: String,
    pub source_url: String,
    /// Sorted and deduplicated; see [`normalize_ingredients`].
    pub ingredients: Vec<String>,
}

impl DrugDetail {
    /// Fingerprint over every descriptive field plus the ingredient set.
    pub fn content_hash(&self) -> String {
        content_hash(self)
    }

    pub fn approval_date_parsed(&self) -> Option<NaiveDate> {
        parse_approval_date(&self.approval_date)
    }
}

/// Persisted product row, including lifecycle timestamps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredProduct {
    pub item_seq: String,
    pub product_name: String,
    pub company_name: String,
    pub cmo_names: String,
    pub rx_otc: String,
    pub review_type: String,
    pub approval_date: Option<NaiveDate>,
    pub efficacy_text: String,
    pub source_url: String,
    pub content_hash: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

/// What a single reconcile call did to the stored row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Inserted,
    Updated,
    Unchanged,
}

/// Sorted, deduplicated, empty-free ingredient names. Names are compared
/// exactly as extracted.
pub fn normalize_ingredients<I, S>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    names
        .into_iter()
        .map(Into::into)
        .filter(|name| !name.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Canonical string the fingerprint is computed over.
pub fn canonical_signature(detail: &DrugDetail) -> String {
    let ingredients = normalize_ingredients(detail.ingredients.iter().cloned()).join(",");
    let fields = [
        detail.item_seq.as_str(),
        detail.product_name.as_str(),
        detail.company_name.as_str(),
        detail.cmo_names.as_str(),
        detail.rx_otc.as_str(),
        detail.review_type.as_str(),
        detail.approval_date.as_str(),
        detail.efficacy_text.as_str(),
        ingredients.as_str(),
    ];
    let mut out = String::new();
    for (idx, field) in fields.iter().enumerate() {
        if idx > 0 {
            out.push(SIGNATURE_SEPARATOR);
        }
        out.push_str(field);
    }
    out
}

/// Hex-encoded SHA-256 of [`canonical_signature`].
pub fn content_hash(detail: &DrugDetail) -> String {
    sha256_hex(canonical_signature(detail).as_bytes())
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

const APPROVAL_DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y.%m.%d", "%Y/%m/%d", "%Y%m%d"];

/// Parses the portal's approval-date text. Returns `None` for empty or
/// unrecognised input.
pub fn parse_approval_date(raw: &str) -> Option<NaiveDate> {
    let text = raw.trim().trim_end_matches('.').trim();
    if text.is_empty() {
        return None;
    }
    APPROVAL_DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(text, fmt).ok())
}
