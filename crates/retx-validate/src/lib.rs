//! Structural validity checks and non-destructive outlier classification.

use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate};
use retx_core::CanonicalTransaction;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "retx-validate";

const MIN_PLAUSIBLE_YEAR: i32 = 1960;
const MAX_PLAUSIBLE_YEAR: i32 = 2100;

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("field `price` must be positive, got {0}")]
    NonPositivePrice(i64),
    #[error("field `area` must be positive, got {0}")]
    NonPositiveArea(f64),
    #[error("field `project` is empty")]
    EmptyProject,
    #[error("field `date` is outside the plausible range: {0}")]
    ImplausibleDate(NaiveDate),
}

impl ValidationError {
    pub fn field(&self) -> &'static str {
        match self {
            ValidationError::NonPositivePrice(_) => "price",
            ValidationError::NonPositiveArea(_) => "area",
            ValidationError::EmptyProject => "project",
            ValidationError::ImplausibleDate(_) => "date",
        }
    }
}

/// Structural validity: required fields present and in range. Failing rows
/// are excluded entirely, never stored.
pub fn check_structural(rec: &CanonicalTransaction) -> Result<(), ValidationError> {
    if rec.project.trim().is_empty() {
        return Err(ValidationError::EmptyProject);
    }
    if rec.price <= 0 {
        return Err(ValidationError::NonPositivePrice(rec.price));
    }
    if rec.area_sqm <= 0.0 {
        return Err(ValidationError::NonPositiveArea(rec.area_sqm));
    }
    let year = rec.transaction_month.year();
    if !(MIN_PLAUSIBLE_YEAR..=MAX_PLAUSIBLE_YEAR).contains(&year) {
        return Err(ValidationError::ImplausibleDate(rec.transaction_month));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct OutlierConfig {
    /// Collective/en-bloc sale signature: floor areas above this are
    /// flagged regardless of price.
    pub large_area_threshold: f64,
    /// Fence multiplier for the IQR rule. Deliberately wide so legitimate
    /// luxury transactions stay unflagged.
    pub iqr_multiplier: f64,
    /// Groups smaller than this are exempt from the IQR rule; quartiles
    /// over a handful of rows are noise.
    pub min_group_size: usize,
}

impl Default for OutlierConfig {
    fn default() -> Self {
        Self {
            large_area_threshold: 2000.0,
            iqr_multiplier: 3.0,
            min_group_size: 8,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutlierStats {
    pub area_flagged: usize,
    pub price_flagged: usize,
    pub rows_flagged: usize,
}

/// Linear-interpolation quartiles over an ascending slice.
fn quartiles(sorted: &[f64]) -> (f64, f64) {
    debug_assert!(!sorted.is_empty());
    let at = |q: f64| -> f64 {
        let pos = q * (sorted.len() - 1) as f64;
        let lower = pos.floor() as usize;
        let frac = pos - lower as f64;
        if lower + 1 < sorted.len() {
            sorted[lower] + frac * (sorted[lower + 1] - sorted[lower])
        } else {
            sorted[lower]
        }
    };
    (at(0.25), at(0.75))
}

/// Classifies rows as outliers without ever rejecting or deleting them.
/// Both rules are evaluated for every row; either can set the flag.
/// Status is recomputable as the distribution shifts, so destruction here
/// would be irreversible and wrong.
pub struct OutlierEngine {
    config: OutlierConfig,
}

impl OutlierEngine {
    pub fn new(config: OutlierConfig) -> Self {
        Self { config }
    }

    pub fn classify(&self, records: &mut [CanonicalTransaction]) -> OutlierStats {
        let mut stats = OutlierStats::default();

        // Rule 1: area signature.
        for rec in records.iter_mut() {
            if rec.area_sqm > self.config.large_area_threshold {
                rec.is_outlier = true;
                stats.area_flagged += 1;
            }
        }

        // Rule 2: price distribution per (property type, year) group.
        let mut groups: BTreeMap<(String, i32), Vec<usize>> = BTreeMap::new();
        for (idx, rec) in records.iter().enumerate() {
            groups
                .entry((rec.property_type.clone(), rec.transaction_month.year()))
                .or_default()
                .push(idx);
        }

        for ((property_type, year), members) in groups {
            if members.len() < self.config.min_group_size {
                continue;
            }
            let mut prices: Vec<f64> = members.iter().map(|i| records[*i].price as f64).collect();
            prices.sort_by(|a, b| a.partial_cmp(b).expect("prices are finite"));
            let (q1, q3) = quartiles(&prices);
            let iqr = q3 - q1;
            let low = q1 - self.config.iqr_multiplier * iqr;
            let high = q3 + self.config.iqr_multiplier * iqr;

            let mut flagged_here = 0usize;
            for idx in members {
                let price = records[idx].price as f64;
                if price < low || price > high {
                    records[idx].is_outlier = true;
                    stats.price_flagged += 1;
                    flagged_here += 1;
                }
            }
            if flagged_here > 0 {
                debug!(
                    %property_type,
                    year, flagged = flagged_here, "price outliers flagged"
                );
            }
        }

        stats.rows_flagged = records.iter().filter(|r| r.is_outlier).count();
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use retx_core::{row_hash, RawExtras, SaleCategory, SourceKind};

    fn month(year: i32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, 6, 1).expect("valid date")
    }

    fn mk(project: &str, price: i64, area_sqm: f64, year: i32) -> CanonicalTransaction {
        CanonicalTransaction {
            project: project.to_string(),
            transaction_month: month(year),
            price,
            area_sqm,
            price_per_sqm: if area_sqm > 0.0 {
                price as f64 / area_sqm
            } else {
                0.0
            },
            district: "10".to_string(),
            bedroom_class: 3,
            property_type: "Condominium".to_string(),
            sale_category: SaleCategory::Resale,
            tenure: "Freehold".to_string(),
            lease_start_year: None,
            remaining_lease_years: None,
            floor_range: "06-10".to_string(),
            unit_count: 1,
            is_outlier: false,
            source: SourceKind::ExternalFeed,
            row_hash: row_hash(project, month(year), price, area_sqm, "06-10"),
            raw_extras: RawExtras::new(),
        }
    }

    #[test]
    fn structural_rules_name_the_offending_field() {
        let ok = mk("Marina Crest", 1_200_000, 90.0, 2024);
        assert!(check_structural(&ok).is_ok());

        let err = check_structural(&mk("Marina Crest", 0, 90.0, 2024)).expect_err("price");
        assert_eq!(err.field(), "price");

        let err = check_structural(&mk("Marina Crest", 1_200_000, -5.0, 2024)).expect_err("area");
        assert_eq!(err.field(), "area");

        let err = check_structural(&mk("  ", 1_200_000, 90.0, 2024)).expect_err("project");
        assert_eq!(err.field(), "project");

        let err = check_structural(&mk("Marina Crest", 1_200_000, 90.0, 1900)).expect_err("date");
        assert_eq!(err.field(), "date");
    }

    #[test]
    fn batch_of_fifty_rejects_exactly_the_invalid_three() {
        let mut batch: Vec<CanonicalTransaction> = (0..47)
            .map(|i| mk("Marina Crest", 1_000_000 + i, 90.0, 2024))
            .collect();
        batch.push(mk("Marina Crest", 0, 90.0, 2024));
        batch.push(mk("Marina Crest", -10, 90.0, 2024));
        batch.push(mk("", 1_000_000, 90.0, 2024));

        let mut valid = 0usize;
        let mut rejected = Vec::new();
        for rec in &batch {
            match check_structural(rec) {
                Ok(()) => valid += 1,
                Err(err) => rejected.push(err.field()),
            }
        }
        assert_eq!(valid, 47);
        assert_eq!(rejected.len(), 3);
        assert!(rejected.contains(&"price"));
        assert!(rejected.contains(&"project"));
    }

    #[test]
    fn en_bloc_area_is_flagged_but_retained() {
        let engine = OutlierEngine::new(OutlierConfig::default());
        let mut records = vec![
            mk("Marina Crest", 1_000_000, 90.0, 2024),
            mk("En Bloc Estate", 300_000_000, 15_000.0, 2024),
        ];
        let stats = engine.classify(&mut records);
        assert_eq!(stats.area_flagged, 1);
        assert_eq!(records.len(), 2);
        assert!(records[1].is_outlier);
        assert!(!records[0].is_outlier);
    }

    #[test]
    fn extreme_price_is_flagged_within_its_group() {
        let engine = OutlierEngine::new(OutlierConfig::default());
        let mut records: Vec<CanonicalTransaction> = (0..11)
            .map(|i| mk("Marina Crest", 1_000_000 + i * 20_000, 90.0, 2024))
            .collect();
        records.push(mk("Marina Crest", 95_000_000, 90.0, 2024));

        let stats = engine.classify(&mut records);
        assert_eq!(stats.price_flagged, 1);
        assert!(records.last().expect("non-empty").is_outlier);
        // A pricey-but-plausible row inside the wide fences stays clean.
        assert!(!records[10].is_outlier);
    }

    #[test]
    fn small_groups_are_exempt_from_the_price_rule() {
        let engine = OutlierEngine::new(OutlierConfig::default());
        let mut records = vec![
            mk("Boutique Lane", 500_000, 80.0, 2024),
            mk("Boutique Lane", 520_000, 80.0, 2024),
            mk("Boutique Lane", 40_000_000, 80.0, 2024),
        ];
        let stats = engine.classify(&mut records);
        assert_eq!(stats.price_flagged, 0);
        assert_eq!(stats.rows_flagged, 0);
    }

    #[test]
    fn quartile_interpolation_matches_hand_math() {
        let values = [1.0, 2.0, 3.0, 4.0];
        let (q1, q3) = quartiles(&values);
        assert!((q1 - 1.75).abs() < 1e-9);
        assert!((q3 - 3.25).abs() < 1e-9);

        let single = [5.0];
        assert_eq!(quartiles(&single), (5.0, 5.0));
    }
}
