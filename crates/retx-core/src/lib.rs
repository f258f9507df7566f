//! Core domain model and provenance types for the transaction pipeline.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const CRATE_NAME: &str = "retx-core";

/// Provenance tag for a canonical row: which boundary produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    BulkFile,
    ExternalFeed,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::BulkFile => "bulk_file",
            SourceKind::ExternalFeed => "external_feed",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "bulk_file" => Some(SourceKind::BulkFile),
            "external_feed" => Some(SourceKind::ExternalFeed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaleCategory {
    NewSale,
    SubSale,
    Resale,
}

impl SaleCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaleCategory::NewSale => "new_sale",
            SaleCategory::SubSale => "sub_sale",
            SaleCategory::Resale => "resale",
        }
    }

    /// Accepts the feed's numeric type-of-sale codes as well as the bulk
    /// file's text labels.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "new sale" | "new_sale" => Some(SaleCategory::NewSale),
            "2" | "sub sale" | "sub-sale" | "sub_sale" => Some(SaleCategory::SubSale),
            "3" | "resale" => Some(SaleCategory::Resale),
            _ => None,
        }
    }
}

/// Unmapped input fields preserved verbatim for schema-drift tolerance.
pub type RawExtras = BTreeMap<String, JsonValue>;

/// The normalized, source-independent representation of one transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalTransaction {
    pub project: String,
    pub transaction_month: NaiveDate,
    pub price: i64,
    pub area_sqm: f64,
    pub price_per_sqm: f64,
    pub district: String,
    pub bedroom_class: i16,
    pub property_type: String,
    pub sale_category: SaleCategory,
    pub tenure: String,
    pub lease_start_year: Option<i32>,
    pub remaining_lease_years: Option<i32>,
    pub floor_range: String,
    pub unit_count: i32,
    pub is_outlier: bool,
    pub source: SourceKind,
    pub row_hash: String,
    #[serde(default)]
    pub raw_extras: RawExtras,
}

/// Collapse formatting noise so differently-formatted inputs describing the
/// same transaction agree.
pub fn normalize_project(input: &str) -> String {
    input
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

pub fn normalize_floor_range(input: &str) -> String {
    input
        .to_ascii_uppercase()
        .split_whitespace()
        .collect::<String>()
        .replace("TO", "-")
}

/// Deterministic fingerprint over the identity field subset. Two records
/// with identical hash are the same real-world transaction regardless of
/// source; the second insert must be a no-op.
pub fn row_hash(
    project: &str,
    transaction_month: NaiveDate,
    price: i64,
    area_sqm: f64,
    floor_range: &str,
) -> String {
    let canonical = format!(
        "{}|{}|{}|{:.1}|{}",
        normalize_project(project),
        transaction_month.format("%Y-%m"),
        price,
        area_sqm,
        normalize_floor_range(floor_range),
    );
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Partial,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

/// One ingestion attempt. Created when the orchestrator starts, mutated as
/// stages complete, finalized (never deleted) when the run ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    pub run_id: Uuid,
    pub source: SourceKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub cutoff_date: Option<NaiveDate>,
    pub rows_fetched: i64,
    pub rows_promoted: i64,
    pub rows_rejected: i64,
    pub status: RunStatus,
    pub failure_cause: Option<String>,
}

impl SyncRun {
    pub fn begin(source: SourceKind, cutoff_date: Option<NaiveDate>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            source,
            started_at: Utc::now(),
            finished_at: None,
            cutoff_date,
            rows_fetched: 0,
            rows_promoted: 0,
            rows_rejected: 0,
            status: RunStatus::Running,
            failure_cause: None,
        }
    }
}

/// Immutable audit artifact produced by the shadow comparator. Consumed by
/// an operator gate before cutover, never auto-applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonReport {
    pub run_id: Uuid,
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    pub bulk_rows: i64,
    pub feed_rows: i64,
    pub row_count_delta_pct: f64,
    pub bulk_median_psm: Option<f64>,
    pub feed_median_psm: Option<f64>,
    pub median_delta_pct: Option<f64>,
    pub hash_coverage: f64,
    pub passed: bool,
    pub created_at: DateTime<Utc>,
}

/// Gates whether external-feed promotion reaches the production-visible
/// window or stays on the comparison-only staging path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Disabled,
    Shadow,
    Production,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Disabled => "disabled",
            SyncMode::Shadow => "shadow",
            SyncMode::Production => "production",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn march_2024() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 1).expect("valid date")
    }

    #[test]
    fn row_hash_ignores_whitespace_and_casing() {
        let a = row_hash("The Sail", march_2024(), 1_500_000, 800.0, "01-05");
        let b = row_hash("  the   SAIL ", march_2024(), 1_500_000, 800.0, "01 TO 05");
        assert_eq!(a, b);
    }

    #[test]
    fn row_hash_distinguishes_price() {
        let a = row_hash("The Sail", march_2024(), 1_500_000, 800.0, "01-05");
        let b = row_hash("The Sail", march_2024(), 1_500_001, 800.0, "01-05");
        assert_ne!(a, b);
    }

    #[test]
    fn row_hash_distinguishes_month() {
        let april = NaiveDate::from_ymd_opt(2024, 4, 1).expect("valid date");
        let a = row_hash("The Sail", march_2024(), 1_500_000, 800.0, "01-05");
        let b = row_hash("The Sail", april, 1_500_000, 800.0, "01-05");
        assert_ne!(a, b);
    }

    #[test]
    fn sale_category_accepts_both_source_vocabularies() {
        assert_eq!(SaleCategory::parse("1"), Some(SaleCategory::NewSale));
        assert_eq!(SaleCategory::parse("Sub Sale"), Some(SaleCategory::SubSale));
        assert_eq!(SaleCategory::parse(" Resale "), Some(SaleCategory::Resale));
        assert_eq!(SaleCategory::parse("auction"), None);
    }

    #[test]
    fn floor_range_normalization_variants_agree() {
        assert_eq!(normalize_floor_range("01 to 05"), "01-05");
        assert_eq!(normalize_floor_range("01-05"), "01-05");
        assert_eq!(normalize_floor_range(" B1 TO B5 "), "B1-B5");
    }

    #[test]
    fn run_begins_running_and_not_terminal() {
        let run = SyncRun::begin(SourceKind::ExternalFeed, None);
        assert_eq!(run.status, RunStatus::Running);
        assert!(!run.status.is_terminal());
        assert!(run.finished_at.is_none());
    }
}
