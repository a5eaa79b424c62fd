//! Integration tests for coverage storage in SurrealDB.
//!
//! These tests run against the embedded `mem://` engine so they need no
//! external service.

use checkpoint::{CoverageBook, CoverageTag};
use chrono::{TimeZone, Utc};
use doc_store::{SurrealConnector, SurrealOpts};
use std::sync::Arc;

fn connector(database: &str) -> Arc<SurrealConnector> {
    Arc::new(SurrealConnector::new(SurrealOpts {
        database: database.to_string(),
        ..SurrealOpts::default()
    }))
}

#[tokio::test]
async fn test_coverage_roundtrip() -> anyhow::Result<()> {
    let book = CoverageBook::new(connector("coverage_roundtrip"));
    let tag = CoverageTag::identity("Finance.BalanceSheet", "000001.SZ");

    let since = Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap();
    let until = Utc.with_ymd_and_hms(2021, 6, 30, 0, 0, 0).unwrap();
    book.advance(&tag, Some(since), Some(until), Some(Utc::now()))
        .await?;

    let loaded = book.get(&tag).await?;
    assert!(loaded.is_some(), "Coverage should be found after storing");

    let loaded = loaded.unwrap();
    assert_eq!(loaded.tag, "Finance.BalanceSheet.000001SZ");
    assert_eq!(loaded.since, Some(since));
    assert_eq!(loaded.until, Some(until));

    // Cleanup
    assert!(book.reset(&tag).await?);
    assert!(book.get(&tag).await?.is_none());

    Ok(())
}

#[tokio::test]
async fn test_coverage_not_found() -> anyhow::Result<()> {
    let book = CoverageBook::new(connector("coverage_not_found"));
    let loaded = book.get(&CoverageTag::resource("Nonexistent")).await?;
    assert!(loaded.is_none(), "Coverage should not be found");
    Ok(())
}
