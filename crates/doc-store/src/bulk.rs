//! Buffered batch writes.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use sync_core::Record;
use tracing::{debug, warn};

use crate::backend::{WriteOp, WriteSummary};
use crate::error::Result;
use crate::filter::Filter;
use crate::table::PhysicalTable;

/// Accumulates upserts for one table and writes them in batches.
///
/// Each merge gets its own writer, so concurrent merges into the same table
/// never share a buffer. Rows still buffered must be written with
/// [`BulkWriter::flush`]; dropping a writer with pending rows discards them.
pub struct BulkWriter<'a> {
    table: &'a PhysicalTable,
    batch_size: usize,
    pending: Vec<(String, WriteOp)>,
    summary: WriteSummary,
}

impl<'a> BulkWriter<'a> {
    pub(crate) fn new(table: &'a PhysicalTable, batch_size: usize) -> Self {
        Self {
            table,
            batch_size: batch_size.max(1),
            pending: Vec::new(),
            summary: WriteSummary::default(),
        }
    }

    /// Buffer one row, flushing when the batch is full.
    pub async fn push(
        &mut self,
        identity: Option<&str>,
        time: Option<DateTime<Utc>>,
        record: Record,
    ) -> Result<()> {
        let prepared = self
            .table
            .prepare_write(identity, time, record, &Filter::new())?;
        self.pending.push(prepared);
        if self.pending.len() >= self.batch_size {
            self.flush().await?;
        }
        Ok(())
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Totals written by this writer so far.
    pub fn summary(&self) -> WriteSummary {
        self.summary
    }

    /// Write every buffered row and return the running totals.
    pub async fn flush(&mut self) -> Result<WriteSummary> {
        if self.pending.is_empty() {
            return Ok(self.summary);
        }

        let mut by_collection: BTreeMap<String, Vec<WriteOp>> = BTreeMap::new();
        for (collection, op) in self.pending.drain(..) {
            by_collection.entry(collection).or_default().push(op);
        }

        for (collection, ops) in by_collection {
            let count = ops.len();
            let written = self.table.write(&collection, ops).await?;
            debug!(
                "Flushed {count} rows to '{collection}' ({} inserted, {} updated)",
                written.inserted, written.updated
            );
            self.summary.inserted += written.inserted;
            self.summary.updated += written.updated;
        }
        Ok(self.summary)
    }
}

impl Drop for BulkWriter<'_> {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            warn!(
                "Bulk writer for '{}' dropped with {} unflushed rows",
                self.table.name(),
                self.pending.len()
            );
        }
    }
}
