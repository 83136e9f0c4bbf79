//! Core domain model and identity-key derivation for ILS.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "ils-core";

/// Monetary loss as stated by the upstream changelog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Loss {
    pub amount: f64,
    pub currency: String,
}

/// A single synchronized incident, the unit of `incidents.json`.
///
/// Structured fields are best-effort: an entry the parser could not fully
/// decompose still becomes a record, with `raw_text` carrying the original
/// lines for later manual correction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentRecord {
    /// Stable dedup key, unique within the database. See [`derive_identity_key`].
    pub identity_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attack_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loss: Option<Loss>,
    /// Upstream repo-relative PoC path when the entry references one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<String>,
    /// Original unparsed line(s); never empty.
    pub raw_text: String,
    /// Upstream commit at which this record was first observed.
    pub source_commit: String,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Lowercase, map non-alphanumerics to spaces, collapse runs.
pub fn normalize_key_fragment(input: &str) -> String {
    input
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Derive the dedup key for an incident.
///
/// `"{date}:{title-slug}"` when both immutable fields are present, otherwise
/// a truncated hash of the raw text. Every entry always gets a key and the
/// derivation is pure: same inputs, same key, across runs.
pub fn derive_identity_key(
    date: Option<NaiveDate>,
    title: Option<&str>,
    raw_text: &str,
) -> String {
    if let (Some(date), Some(title)) = (date, title) {
        let slug = normalize_key_fragment(title).replace(' ', "-");
        if !slug.is_empty() {
            return format!("{}:{}", date.format("%Y-%m-%d"), slug);
        }
    }
    format!("raw:{}", &sha256_hex(raw_text.as_bytes())[..16])
}
