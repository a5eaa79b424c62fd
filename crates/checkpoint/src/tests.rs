//! Unit tests for the checkpoint crate.

use chrono::{DateTime, TimeZone, Utc};
use doc_store::{MemoryConnector, MemoryStore};
use std::sync::Arc;
use tempfile::TempDir;

use crate::{CoverageBook, CoverageRecord, CoverageTag};

fn day(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
}

// ============================================================================
// CoverageTag Tests
// ============================================================================

#[test]
fn test_tag_joined_strips_punctuation() {
    let tag = CoverageTag::identity("Finance.BalanceSheet", "000001.SZ");
    assert_eq!(tag.joined(), "Finance.BalanceSheet.000001SZ");
    assert_eq!(
        tag.segments(),
        &["Finance".to_string(), "BalanceSheet".to_string(), "000001.SZ".to_string()]
    );
    assert_eq!(
        CoverageTag::resource("Market.Daily-Adj").joined(),
        "Market.DailyAdj"
    );
    assert_eq!(CoverageTag::resource("X").with("id1").to_string(), "X.id1");
}

#[test]
fn test_tag_for_request() {
    assert_eq!(
        CoverageTag::for_request("X", None),
        CoverageTag::resource("X")
    );
    assert_eq!(
        CoverageTag::for_request("X", Some("id1")).segments(),
        &["X".to_string(), "id1".to_string()]
    );
}

// ============================================================================
// CoverageRecord Tests
// ============================================================================

#[test]
fn test_advance_is_monotonic() {
    let mut record = CoverageRecord::new("X.id1");
    assert!(record.advance(Some(day(2021, 3, 1)), Some(day(2021, 6, 30)), None));
    assert!(record.has_window());

    // A narrower window changes nothing
    assert!(!record.advance(Some(day(2021, 4, 1)), Some(day(2021, 5, 1)), None));

    assert!(record.advance(Some(day(2021, 1, 1)), Some(day(2021, 2, 1)), None));
    assert_eq!(record.since, Some(day(2021, 1, 1)));
    assert_eq!(record.until, Some(day(2021, 6, 30)));

    record.advance(None, None, Some(day(2022, 1, 2)));
    record.advance(None, None, Some(day(2022, 1, 1)));
    assert_eq!(record.last_synced_at, Some(day(2022, 1, 2)));
}

#[test]
fn test_record_fields_skip_unknown_bounds() {
    let mut record = CoverageRecord::new("X");
    record.advance(None, Some(day(2021, 1, 1)), None);
    let fields = record.to_fields();
    assert_eq!(fields.len(), 1);
    assert_eq!(
        CoverageRecord::from_fields("X".to_string(), &fields),
        record
    );
}

// ============================================================================
// CoverageBook Tests
// ============================================================================

#[tokio::test]
async fn test_book_advance_and_get() {
    let book = CoverageBook::new(Arc::new(MemoryConnector::default()));
    let tag = CoverageTag::identity("X", "id1");
    assert!(book.get(&tag).await.unwrap().is_none());

    book.advance(&tag, Some(day(2021, 1, 1)), Some(day(2021, 1, 10)), Some(day(2021, 1, 11)))
        .await
        .unwrap();
    book.advance(&tag, Some(day(2021, 1, 5)), Some(day(2021, 2, 1)), Some(day(2021, 2, 2)))
        .await
        .unwrap();

    let record = book.get(&tag).await.unwrap().unwrap();
    assert_eq!(record.tag, "X.id1");
    assert_eq!(record.since, Some(day(2021, 1, 1)));
    assert_eq!(record.until, Some(day(2021, 2, 1)));
    assert_eq!(record.last_synced_at, Some(day(2021, 2, 2)));
    assert_eq!(book.all().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_book_reset() {
    let book = CoverageBook::new(Arc::new(MemoryConnector::default()));
    let resource = CoverageTag::resource("X");
    for tag in [
        resource.clone(),
        CoverageTag::identity("X", "id1"),
        CoverageTag::identity("X", "id2"),
        CoverageTag::resource("XY"),
    ] {
        book.advance(&tag, None, Some(day(2021, 1, 1)), None)
            .await
            .unwrap();
    }

    assert!(book.reset(&CoverageTag::identity("X", "id1")).await.unwrap());
    assert!(!book.reset(&CoverageTag::identity("X", "id1")).await.unwrap());

    assert_eq!(book.reset_tree(&resource, &[]).await.unwrap(), 2);
    let remaining: Vec<String> = book.all().await.unwrap().into_iter().map(|r| r.tag).collect();
    assert_eq!(remaining, vec!["XY".to_string()]);
}

#[tokio::test]
async fn test_reset_tree_spares_nested_resources() {
    let book = CoverageBook::new(Arc::new(MemoryConnector::default()));
    let sheet = CoverageTag::resource("Finance.BalanceSheet");
    let quarterly = CoverageTag::resource("Finance.BalanceSheet.Quarterly");
    for tag in [
        sheet.clone(),
        CoverageTag::identity("Finance.BalanceSheet", "000001.SZ"),
        quarterly.clone(),
        CoverageTag::identity("Finance.BalanceSheet.Quarterly", "000001.SZ"),
        CoverageTag::resource("Finance.Income"),
    ] {
        book.advance(&tag, None, Some(day(2021, 1, 1)), None)
            .await
            .unwrap();
    }

    assert_eq!(
        book.reset_tree(&sheet, std::slice::from_ref(&quarterly)).await.unwrap(),
        2
    );
    let mut remaining: Vec<String> =
        book.all().await.unwrap().into_iter().map(|r| r.tag).collect();
    remaining.sort();
    assert_eq!(
        remaining,
        vec![
            "Finance.BalanceSheet.Quarterly".to_string(),
            "Finance.BalanceSheet.Quarterly.000001SZ".to_string(),
            "Finance.Income".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_book_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let tag = CoverageTag::identity("Finance.BalanceSheet", "A");
    {
        let store = Arc::new(MemoryStore::open(dir.path()).unwrap());
        let book = CoverageBook::new(Arc::new(MemoryConnector::new(store)));
        book.advance(&tag, Some(day(2020, 1, 1)), Some(day(2020, 12, 31)), None)
            .await
            .unwrap();
    }

    let store = Arc::new(MemoryStore::open(dir.path()).unwrap());
    let book = CoverageBook::new(Arc::new(MemoryConnector::new(store)));
    let record = book.get(&tag).await.unwrap().unwrap();
    assert_eq!(record.until, Some(day(2020, 12, 31)));
}
