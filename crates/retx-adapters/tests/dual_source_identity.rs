//! End-to-end mapping checks across the two source boundaries.

use chrono::NaiveDate;
use retx_adapters::{flatten_feed_payload, map_record, read_bulk_file, MapperContext};
use retx_core::SourceKind;
use serde_json::json;

fn ctx() -> MapperContext {
    MapperContext::new(NaiveDate::from_ymd_opt(2026, 6, 1).expect("valid date"))
}

const BULK_CSV: &str = "\
Project Name,Transacted Price ($),Area (SQM),Sale Date,Postal District,Property Type,Type of Sale,Tenure,Floor Level,Number of Units
The Sail,1500000,800,2024-03,01,Apartment,Resale,99 yrs lease commencing from 1995,01-05,1
Marina Crest,2100000,95,2024-04,01,Condominium,New Sale,Freehold,06-10,1
";

#[test]
fn feed_revision_of_a_bulk_row_is_the_same_transaction() {
    let dir = tempfile::tempdir().expect("tempdir");
    let csv_path = dir.path().join("bulk.csv");
    std::fs::write(&csv_path, BULK_CSV).expect("write csv");

    let bulk_raws = read_bulk_file(&csv_path).expect("read bulk file");
    assert_eq!(bulk_raws.len(), 2);
    let bulk_rows: Vec<_> = bulk_raws
        .iter()
        .map(|raw| map_record(raw, SourceKind::BulkFile, &ctx()).expect("bulk maps"))
        .collect();

    // The feed later reports the first transaction in its native format:
    // MMYY contract date, shouty project casing, extra whitespace.
    let payload = vec![json!({
        "project": "THE  SAIL",
        "street": "MARINA BOULEVARD",
        "marketSegment": "CCR",
        "transaction": [{
            "price": "1500000",
            "area": "800",
            "contractDate": "0324",
            "district": "01",
            "propertyType": "Apartment",
            "typeOfSale": "3",
            "tenure": "99 yrs lease commencing from 1995",
            "floorRange": "01 TO 05",
            "noOfUnits": "1"
        }]
    })];
    let feed_raws = flatten_feed_payload(&payload);
    assert_eq!(feed_raws.len(), 1);
    let feed_row =
        map_record(&feed_raws[0], SourceKind::ExternalFeed, &ctx()).expect("feed maps");

    assert_eq!(feed_row.row_hash, bulk_rows[0].row_hash);
    assert_ne!(feed_row.row_hash, bulk_rows[1].row_hash);
    assert_eq!(feed_row.source, SourceKind::ExternalFeed);
    assert_eq!(bulk_rows[0].source, SourceKind::BulkFile);

    // Project-level feed fields the mapper does not know survive as extras.
    assert_eq!(
        feed_row.raw_extras.get("marketSegment"),
        Some(&json!("CCR"))
    );
}
