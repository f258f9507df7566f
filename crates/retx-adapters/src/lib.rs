//! Source boundaries + canonical mapping for both ingestion paths.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate};
use retx_core::{row_hash, CanonicalTransaction, RawExtras, SaleCategory, SourceKind};
use retx_storage::{FetchError, HttpFetcher};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "retx-adapters";

/// One raw transaction as delivered by a source: arbitrary keys, values
/// still in source formatting.
pub type RawRecord = BTreeMap<String, JsonValue>;

#[derive(Debug, Error, PartialEq)]
pub enum MappingError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` has invalid value `{value}`")]
    InvalidValue { field: &'static str, value: String },
    #[error("field `{field}` has unparseable date `{value}`")]
    InvalidDate { field: &'static str, value: String },
    #[error("field `area` must be positive, got {0}")]
    NonPositiveArea(f64),
}

impl MappingError {
    /// The offending field, for per-record failure reporting.
    pub fn field(&self) -> &'static str {
        match self {
            MappingError::MissingField(field) => field,
            MappingError::InvalidValue { field, .. } => field,
            MappingError::InvalidDate { field, .. } => field,
            MappingError::NonPositiveArea(_) => "area",
        }
    }
}

/// Deterministic inputs for derived fields. `as_of` stands in for "today"
/// so lease arithmetic does not drift between runs of the same test.
#[derive(Debug, Clone, Copy)]
pub struct MapperContext {
    pub as_of: NaiveDate,
}

impl MapperContext {
    pub fn new(as_of: NaiveDate) -> Self {
        Self { as_of }
    }
}

/// Static rename table for the bulk-file column headers.
const BULK_FIELD_MAP: &[(&str, &str)] = &[
    ("Project Name", "project"),
    ("Transacted Price ($)", "price"),
    ("Area (SQM)", "area"),
    ("Sale Date", "date"),
    ("Postal District", "district"),
    ("Property Type", "property_type"),
    ("Type of Sale", "sale_category"),
    ("Tenure", "tenure"),
    ("Floor Level", "floor_range"),
    ("Number of Units", "unit_count"),
];

/// Static rename table for the external feed's JSON keys.
const FEED_FIELD_MAP: &[(&str, &str)] = &[
    ("project", "project"),
    ("price", "price"),
    ("area", "area"),
    ("contractDate", "date"),
    ("district", "district"),
    ("propertyType", "property_type"),
    ("typeOfSale", "sale_category"),
    ("tenure", "tenure"),
    ("floorRange", "floor_range"),
    ("noOfUnits", "unit_count"),
];

fn field_map(source: SourceKind) -> &'static [(&'static str, &'static str)] {
    match source {
        SourceKind::BulkFile => BULK_FIELD_MAP,
        SourceKind::ExternalFeed => FEED_FIELD_MAP,
    }
}

fn value_as_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_i64(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
        JsonValue::String(s) => {
            let cleaned: String = s
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '-' || *c == '.')
                .collect();
            cleaned
                .parse::<i64>()
                .ok()
                .or_else(|| cleaned.parse::<f64>().ok().map(|f| f.round() as i64))
        }
        _ => None,
    }
}

fn parse_f64(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => {
            let cleaned: String = s
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '-' || *c == '.')
                .collect();
            cleaned.parse::<f64>().ok()
        }
        _ => None,
    }
}

fn month_from_abbrev(abbrev: &str) -> Option<u32> {
    let month = match abbrev.to_ascii_lowercase().as_str() {
        "jan" => 1,
        "feb" => 2,
        "mar" => 3,
        "apr" => 4,
        "may" => 5,
        "jun" => 6,
        "jul" => 7,
        "aug" => 8,
        "sep" => 9,
        "oct" => 10,
        "nov" => 11,
        "dec" => 12,
        _ => return None,
    };
    Some(month)
}

// Two-digit years pivot at 70: the bulk history reaches back into the
// 1990s, the feed never predates 2000.
fn expand_two_digit_year(yy: i32) -> i32 {
    if yy >= 70 {
        1900 + yy
    } else {
        2000 + yy
    }
}

/// Bulk files carry either `YYYY-MM` or `Mon-YY` sale dates.
pub fn parse_bulk_month(raw: &str) -> Option<NaiveDate> {
    let (left, right) = raw.trim().split_once('-')?;
    if left.len() == 4 && left.chars().all(|c| c.is_ascii_digit()) {
        let year: i32 = left.parse().ok()?;
        let month: u32 = right.trim().parse().ok()?;
        return NaiveDate::from_ymd_opt(year, month, 1);
    }
    let month = month_from_abbrev(left.trim())?;
    let yy: i32 = right.trim().parse().ok()?;
    NaiveDate::from_ymd_opt(expand_two_digit_year(yy), month, 1)
}

/// The feed's native contract date is `MMYY`.
pub fn parse_feed_month(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim();
    if s.len() != 4 || !s.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let month: u32 = s[..2].parse().ok()?;
    let yy: i32 = s[2..].parse().ok()?;
    NaiveDate::from_ymd_opt(expand_two_digit_year(yy), month, 1)
}

fn parse_month(raw: &str, source: SourceKind) -> Option<NaiveDate> {
    match source {
        SourceKind::BulkFile => parse_bulk_month(raw),
        // Tolerate an already-normalized month in the feed path as well;
        // revision exports have been seen in both shapes.
        SourceKind::ExternalFeed => parse_feed_month(raw).or_else(|| parse_bulk_month(raw)),
    }
}

fn bedroom_rule_change() -> NaiveDate {
    NaiveDate::from_ymd_opt(2013, 1, 1).expect("valid rule change date")
}

/// Three-tier bedroom classification. Boundaries shrank at the 2013 rule
/// change for primary-market sales; resale units use the looser third tier
/// regardless of date.
pub fn classify_bedrooms(area_sqm: f64, category: SaleCategory, month: NaiveDate) -> i16 {
    let bands: [f64; 4] = match (category, month < bedroom_rule_change()) {
        (SaleCategory::Resale, _) => [55.0, 80.0, 110.0, 140.0],
        (_, true) => [50.0, 70.0, 100.0, 130.0],
        (_, false) => [45.0, 65.0, 95.0, 125.0],
    };
    bands
        .iter()
        .position(|bound| area_sqm < *bound)
        .map(|idx| idx as i16 + 1)
        .unwrap_or(5)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LeaseTerms {
    pub start_year: Option<i32>,
    pub remaining_years: Option<i32>,
}

fn extract_integers(text: &str) -> Vec<i64> {
    let mut out = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            current.push(ch);
            continue;
        }
        if !current.is_empty() {
            if let Ok(v) = current.parse::<i64>() {
                out.push(v);
            }
            current.clear();
        }
    }
    if !current.is_empty() {
        if let Ok(v) = current.parse::<i64>() {
            out.push(v);
        }
    }
    out
}

/// Derive lease arithmetic from a free-text tenure string, e.g.
/// `"99 yrs lease commencing from 1995"`. Freehold and unparseable strings
/// yield no derived values; the raw text is kept either way.
pub fn parse_tenure(tenure: &str, as_of_year: i32) -> LeaseTerms {
    let lower = tenure.to_ascii_lowercase();
    if lower.contains("freehold") {
        return LeaseTerms::default();
    }
    let numbers = extract_integers(&lower);
    let term = numbers.first().copied();
    let start = numbers
        .iter()
        .copied()
        .find(|n| (1500..=9999).contains(n) && Some(*n) != term);
    match (term, start) {
        (Some(term), Some(start)) => LeaseTerms {
            start_year: Some(start as i32),
            remaining_years: Some(term as i32 + start as i32 - as_of_year),
        },
        _ => LeaseTerms::default(),
    }
}

/// Convert one raw record into the canonical row shape. Pure; errors are
/// per-record and name the offending field so the caller can count and
/// continue.
pub fn map_record(
    raw: &RawRecord,
    source: SourceKind,
    ctx: &MapperContext,
) -> Result<CanonicalTransaction, MappingError> {
    let map = field_map(source);
    let mut named: BTreeMap<&'static str, &JsonValue> = BTreeMap::new();
    let mut raw_extras = RawExtras::new();

    for (key, value) in raw {
        match map.iter().find(|entry| entry.0 == key.as_str()) {
            Some(entry) => {
                named.insert(entry.1, value);
            }
            // Forward compatibility: anything the mapping table does not
            // know survives verbatim.
            None => {
                raw_extras.insert(key.clone(), value.clone());
            }
        }
    }

    let project = named
        .get("project")
        .copied()
        .and_then(value_as_string)
        .ok_or(MappingError::MissingField("project"))?;

    let price_value = *named
        .get("price")
        .ok_or(MappingError::MissingField("price"))?;
    let price = parse_i64(price_value).ok_or_else(|| MappingError::InvalidValue {
        field: "price",
        value: price_value.to_string(),
    })?;

    let area_value = *named
        .get("area")
        .ok_or(MappingError::MissingField("area"))?;
    let area_sqm = parse_f64(area_value).ok_or_else(|| MappingError::InvalidValue {
        field: "area",
        value: area_value.to_string(),
    })?;
    if area_sqm <= 0.0 {
        return Err(MappingError::NonPositiveArea(area_sqm));
    }

    let date_value = named
        .get("date")
        .copied()
        .and_then(value_as_string)
        .ok_or(MappingError::MissingField("date"))?;
    let transaction_month =
        parse_month(&date_value, source).ok_or_else(|| MappingError::InvalidDate {
            field: "date",
            value: date_value.clone(),
        })?;

    let sale_value = named
        .get("sale_category")
        .copied()
        .and_then(value_as_string)
        .ok_or(MappingError::MissingField("sale_category"))?;
    let sale_category = SaleCategory::parse(&sale_value).ok_or_else(|| MappingError::InvalidValue {
        field: "sale_category",
        value: sale_value.clone(),
    })?;

    let district = named
        .get("district")
        .copied()
        .and_then(value_as_string)
        .ok_or(MappingError::MissingField("district"))?;

    let property_type = named
        .get("property_type")
        .copied()
        .and_then(value_as_string)
        .ok_or(MappingError::MissingField("property_type"))?;

    let tenure = named
        .get("tenure")
        .copied()
        .and_then(value_as_string)
        .unwrap_or_default();
    let lease = parse_tenure(&tenure, ctx.as_of.year());

    let floor_range = named
        .get("floor_range")
        .copied()
        .and_then(value_as_string)
        .unwrap_or_else(|| "-".to_string());

    let unit_count = named
        .get("unit_count")
        .copied()
        .and_then(parse_i64)
        .unwrap_or(1) as i32;

    // Derived fields are computed, never copied.
    let price_per_sqm = price as f64 / area_sqm;
    let bedroom_class = classify_bedrooms(area_sqm, sale_category, transaction_month);

    // The hash goes last, over already-normalized values, so differently
    // formatted inputs describing the same transaction still collide.
    let row_hash = row_hash(&project, transaction_month, price, area_sqm, &floor_range);

    Ok(CanonicalTransaction {
        project,
        transaction_month,
        price,
        area_sqm,
        price_per_sqm,
        district,
        bedroom_class,
        property_type,
        sale_category,
        tenure,
        lease_start_year: lease.start_year,
        remaining_lease_years: lease.remaining_years,
        floor_range,
        unit_count,
        is_outlier: false,
        source,
        row_hash,
        raw_extras,
    })
}

/// Read the historical bulk file: one CSV row per transaction, headers per
/// the documented column mapping. Append-only source; never re-synced.
pub fn read_bulk_file(path: impl AsRef<Path>) -> Result<Vec<RawRecord>> {
    let path = path.as_ref();
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("opening bulk file {}", path.display()))?;

    let headers = reader
        .headers()
        .with_context(|| format!("reading headers of {}", path.display()))?
        .clone();

    let mut records = Vec::new();
    for (idx, row) in reader.records().enumerate() {
        let row = row.with_context(|| format!("reading row {} of {}", idx + 2, path.display()))?;
        let mut record = RawRecord::new();
        for (header, cell) in headers.iter().zip(row.iter()) {
            record.insert(
                header.to_string(),
                JsonValue::String(cell.to_string()),
            );
        }
        records.push(record);
    }
    debug!(rows = records.len(), path = %path.display(), "bulk file read");
    Ok(records)
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("token request rejected: {0}")]
    Token(String),
    #[error("malformed feed payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("feed returned status `{0}`")]
    Status(String),
}

#[derive(Debug, Deserialize)]
struct TokenEnvelope {
    #[serde(rename = "Status")]
    status: String,
    #[serde(rename = "Result", default)]
    result: Option<String>,
    #[serde(rename = "Message", default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BatchEnvelope {
    #[serde(rename = "Status")]
    status: String,
    #[serde(rename = "Result", default)]
    result: Vec<JsonValue>,
}

/// Flatten the feed's nested project→transactions payload into one raw
/// record per transaction, copying project-level scalars into each.
pub fn flatten_feed_payload(projects: &[JsonValue]) -> Vec<RawRecord> {
    let mut records = Vec::new();
    for project in projects {
        let Some(obj) = project.as_object() else {
            continue;
        };
        let scalars: Vec<(&String, &JsonValue)> = obj
            .iter()
            .filter(|(key, value)| key.as_str() != "transaction" && !value.is_array())
            .collect();
        let Some(transactions) = obj.get("transaction").and_then(|v| v.as_array()) else {
            continue;
        };
        for tx in transactions {
            let Some(tx_obj) = tx.as_object() else {
                continue;
            };
            let mut record = RawRecord::new();
            for (key, value) in &scalars {
                record.insert((*key).clone(), (*value).clone());
            }
            // Transaction-level fields win on key collisions.
            for (key, value) in tx_obj {
                record.insert(key.clone(), value.clone());
            }
            records.push(record);
        }
    }
    records
}

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub base_url: String,
    pub access_key: String,
    pub service: String,
    /// Tokens live ~23 hours upstream; refresh proactively well before
    /// that, never reactively on a 401.
    pub token_max_age: Duration,
}

impl FeedConfig {
    pub fn new(base_url: impl Into<String>, access_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            access_key: access_key.into(),
            service: "PMI_Resi_Transaction".to_string(),
            token_max_age: Duration::from_secs(20 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone)]
struct TokenState {
    token: String,
    obtained_at: Instant,
}

/// Token-authenticated client for the external feed. Batch selection is by
/// district-group partition; the orchestrator iterates all four per run.
pub struct FeedClient {
    fetcher: HttpFetcher,
    config: FeedConfig,
    token: Mutex<Option<TokenState>>,
}

pub const DISTRICT_GROUPS: [u8; 4] = [1, 2, 3, 4];

impl FeedClient {
    pub fn new(fetcher: HttpFetcher, config: FeedConfig) -> Self {
        Self {
            fetcher,
            config,
            token: Mutex::new(None),
        }
    }

    /// Returns a token no older than the configured max age, fetching a
    /// fresh one when needed.
    pub async fn ensure_token(&self, run_id: Uuid) -> Result<String, FeedError> {
        let mut guard = self.token.lock().await;
        if let Some(state) = guard.as_ref() {
            if state.obtained_at.elapsed() < self.config.token_max_age {
                return Ok(state.token.clone());
            }
        }

        let url = format!("{}/insertNewToken/v1", self.config.base_url);
        let headers = [("AccessKey", self.config.access_key.clone())];
        let response = self
            .fetcher
            .get_with_headers(run_id, "token", &url, &headers)
            .await?;
        let envelope: TokenEnvelope = serde_json::from_slice(&response.body)?;
        if !envelope.status.eq_ignore_ascii_case("success") {
            return Err(FeedError::Token(
                envelope.message.unwrap_or(envelope.status),
            ));
        }
        let token = envelope
            .result
            .ok_or_else(|| FeedError::Token("token missing from response".to_string()))?;
        info!(%run_id, "feed token refreshed");
        *guard = Some(TokenState {
            token: token.clone(),
            obtained_at: Instant::now(),
        });
        Ok(token)
    }

    /// Pull one district-group partition. Returns the flattened raw
    /// records plus the raw body for archiving.
    pub async fn fetch_partition(
        &self,
        run_id: Uuid,
        group: u8,
    ) -> Result<(Vec<RawRecord>, Vec<u8>), FeedError> {
        let token = self.ensure_token(run_id).await?;
        let url = format!(
            "{}/invokeUraDS/v1?service={}&batch={}",
            self.config.base_url, self.config.service, group
        );
        let headers = [
            ("AccessKey", self.config.access_key.clone()),
            ("Token", token),
        ];
        let label = format!("district-group-{group}");
        let response = self
            .fetcher
            .get_with_headers(run_id, &label, &url, &headers)
            .await?;
        let envelope: BatchEnvelope = serde_json::from_slice(&response.body)?;
        if !envelope.status.eq_ignore_ascii_case("success") {
            return Err(FeedError::Status(envelope.status));
        }
        let records = flatten_feed_payload(&envelope.result);
        debug!(%run_id, group, rows = records.len(), "partition fetched");
        Ok((records, response.body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> MapperContext {
        MapperContext::new(NaiveDate::from_ymd_opt(2026, 6, 1).expect("valid date"))
    }

    fn bulk_record() -> RawRecord {
        let mut raw = RawRecord::new();
        raw.insert("Project Name".into(), json!("The Sail"));
        raw.insert("Transacted Price ($)".into(), json!("1,500,000"));
        raw.insert("Area (SQM)".into(), json!("800"));
        raw.insert("Sale Date".into(), json!("2024-03"));
        raw.insert("Postal District".into(), json!("01"));
        raw.insert("Property Type".into(), json!("Apartment"));
        raw.insert("Type of Sale".into(), json!("Resale"));
        raw.insert("Tenure".into(), json!("99 yrs lease commencing from 1995"));
        raw.insert("Floor Level".into(), json!("01-05"));
        raw.insert("Number of Units".into(), json!("1"));
        raw
    }

    fn feed_record() -> RawRecord {
        let mut raw = RawRecord::new();
        raw.insert("project".into(), json!("The  Sail "));
        raw.insert("price".into(), json!("1500000"));
        raw.insert("area".into(), json!(800.0));
        raw.insert("contractDate".into(), json!("0324"));
        raw.insert("district".into(), json!("01"));
        raw.insert("propertyType".into(), json!("Apartment"));
        raw.insert("typeOfSale".into(), json!("3"));
        raw.insert("tenure".into(), json!("99 yrs lease commencing from 1995"));
        raw.insert("floorRange".into(), json!("01 TO 05"));
        raw.insert("noOfUnits".into(), json!("1"));
        raw
    }

    #[test]
    fn bulk_record_maps_with_derived_fields() {
        let rec = map_record(&bulk_record(), SourceKind::BulkFile, &ctx()).expect("maps");
        assert_eq!(rec.price, 1_500_000);
        assert_eq!(rec.transaction_month.year(), 2024);
        assert_eq!(rec.transaction_month.month(), 3);
        assert!((rec.price_per_sqm - 1875.0).abs() < f64::EPSILON);
        assert_eq!(rec.lease_start_year, Some(1995));
        assert_eq!(rec.remaining_lease_years, Some(99 + 1995 - 2026));
        assert_eq!(rec.sale_category, SaleCategory::Resale);
        assert!(!rec.is_outlier);
    }

    #[test]
    fn both_sources_collide_on_the_same_hash() {
        let bulk = map_record(&bulk_record(), SourceKind::BulkFile, &ctx()).expect("bulk maps");
        let feed = map_record(&feed_record(), SourceKind::ExternalFeed, &ctx()).expect("feed maps");
        assert_eq!(bulk.row_hash, feed.row_hash);
        assert_ne!(bulk.source, feed.source);
    }

    #[test]
    fn zero_area_fails_with_named_field() {
        let mut raw = bulk_record();
        raw.insert("Area (SQM)".into(), json!("0"));
        let err = map_record(&raw, SourceKind::BulkFile, &ctx()).expect_err("rejects");
        assert_eq!(err, MappingError::NonPositiveArea(0.0));
        assert_eq!(err.field(), "area");
    }

    #[test]
    fn missing_project_is_a_mapping_error() {
        let mut raw = bulk_record();
        raw.remove("Project Name");
        let err = map_record(&raw, SourceKind::BulkFile, &ctx()).expect_err("rejects");
        assert_eq!(err, MappingError::MissingField("project"));
    }

    #[test]
    fn unknown_fields_survive_in_raw_extras() {
        let mut raw = feed_record();
        raw.insert("nettPrice".into(), json!("1480000"));
        let rec = map_record(&raw, SourceKind::ExternalFeed, &ctx()).expect("maps");
        assert_eq!(rec.raw_extras.get("nettPrice"), Some(&json!("1480000")));
        assert!(rec.raw_extras.get("price").is_none());
    }

    #[test]
    fn month_parsing_accepts_both_bulk_layouts() {
        assert_eq!(
            parse_bulk_month("Mar-24"),
            NaiveDate::from_ymd_opt(2024, 3, 1)
        );
        assert_eq!(
            parse_bulk_month("2024-03"),
            NaiveDate::from_ymd_opt(2024, 3, 1)
        );
        assert_eq!(
            parse_bulk_month("Sep-98"),
            NaiveDate::from_ymd_opt(1998, 9, 1)
        );
        assert_eq!(parse_bulk_month("garbage"), None);
    }

    #[test]
    fn feed_month_is_mmyy() {
        assert_eq!(
            parse_feed_month("0324"),
            NaiveDate::from_ymd_opt(2024, 3, 1)
        );
        assert_eq!(parse_feed_month("1399"), None);
        assert_eq!(parse_feed_month("032024"), None);
    }

    #[test]
    fn bedroom_tiers_shift_at_the_rule_change() {
        let before = NaiveDate::from_ymd_opt(2012, 6, 1).expect("valid date");
        let after = NaiveDate::from_ymd_opt(2014, 6, 1).expect("valid date");
        // 48 sqm: one-bedder under the old boundaries, two-bedder after.
        assert_eq!(classify_bedrooms(48.0, SaleCategory::NewSale, before), 1);
        assert_eq!(classify_bedrooms(48.0, SaleCategory::NewSale, after), 2);
        // Resale tier is looser and date-independent.
        assert_eq!(classify_bedrooms(48.0, SaleCategory::Resale, before), 1);
        assert_eq!(classify_bedrooms(48.0, SaleCategory::Resale, after), 1);
        assert_eq!(classify_bedrooms(300.0, SaleCategory::NewSale, after), 5);
    }

    #[test]
    fn tenure_parsing_handles_the_common_shapes() {
        let lease = parse_tenure("99 yrs lease commencing from 1995", 2026);
        assert_eq!(lease.start_year, Some(1995));
        assert_eq!(lease.remaining_years, Some(68));

        let long = parse_tenure("999 yrs lease commencing from 1885", 2026);
        assert_eq!(long.start_year, Some(1885));
        assert_eq!(long.remaining_years, Some(858));

        assert_eq!(parse_tenure("Freehold", 2026), LeaseTerms::default());
        assert_eq!(parse_tenure("", 2026), LeaseTerms::default());
    }

    #[test]
    fn feed_payload_flattens_project_scalars_into_transactions() {
        let payload = vec![json!({
            "project": "THE SAIL",
            "street": "MARINA BOULEVARD",
            "marketSegment": "CCR",
            "transaction": [
                {"price": "1500000", "area": "800", "contractDate": "0324"},
                {"price": "2100000", "area": "95", "contractDate": "0424"}
            ]
        })];
        let records = flatten_feed_payload(&payload);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get("project"), Some(&json!("THE SAIL")));
        assert_eq!(records[0].get("street"), Some(&json!("MARINA BOULEVARD")));
        assert_eq!(records[1].get("price"), Some(&json!("2100000")));
        assert!(records[0].get("transaction").is_none());
    }

    #[test]
    fn bulk_file_round_trips_headers_into_raw_records() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("transactions.csv");
        std::fs::write(
            &path,
            "Project Name,Transacted Price ($),Area (SQM),Sale Date,Postal District,Property Type,Type of Sale,Tenure,Floor Level,Number of Units\n\
             The Sail,1500000,800,2024-03,01,Apartment,Resale,99 yrs lease commencing from 1995,01-05,1\n",
        )
        .expect("write csv");

        let records = read_bulk_file(&path).expect("read");
        assert_eq!(records.len(), 1);
        let rec = map_record(&records[0], SourceKind::BulkFile, &ctx()).expect("maps");
        assert_eq!(rec.project, "The Sail");
        assert_eq!(rec.unit_count, 1);
    }
}
