//! Table Synchronizer: full replace and differential insert over a
//! [`Destination`], one batch at a time.

use std::collections::HashSet;
use std::sync::Arc;

use tpsync_core::{FailedBatch, TargetRecord};
use tpsync_storage::{Destination, DestinationError};
use tracing::{debug, info, warn};

pub const MAX_BATCH_SIZE: usize = 1000;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Rows in batches that were accepted.
    pub inserted: usize,
    /// Records left out because their key already exists.
    pub skipped_existing: usize,
    pub batches: usize,
    pub failed_batches: Vec<FailedBatch>,
}

impl WriteOutcome {
    pub fn is_complete(&self) -> bool {
        self.failed_batches.is_empty()
    }
}

pub struct TableSynchronizer {
    destination: Arc<dyn Destination>,
    batch_size: usize,
}

impl TableSynchronizer {
    /// `batch_size` is clamped to `1..=MAX_BATCH_SIZE`.
    pub fn new(destination: Arc<dyn Destination>, batch_size: usize) -> Self {
        Self {
            destination,
            batch_size: batch_size.clamp(1, MAX_BATCH_SIZE),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Delete every row, then insert `records` batch by batch.
    ///
    /// A failed delete is returned as an error and nothing is inserted. A
    /// failed batch is recorded and the remaining batches are still written;
    /// batches already committed stay committed.
    pub async fn full_replace(
        &self,
        table: &str,
        filter_column: &str,
        records: &[TargetRecord],
    ) -> Result<WriteOutcome, DestinationError> {
        self.destination.delete_all(table, filter_column).await?;
        debug!(table, "cleared table");
        Ok(self.insert_batches(table, records).await)
    }

    /// Insert only records whose key is not yet in the table. Duplicate keys
    /// within `records` keep the first occurrence.
    pub async fn differential_insert(
        &self,
        table: &str,
        key_columns: &[String],
        records: &[TargetRecord],
    ) -> Result<WriteOutcome, DestinationError> {
        let mut seen = self.destination.existing_keys(table, key_columns).await?;
        let existing = seen.len();

        let fresh = records
            .iter()
            .filter(|r| seen.insert(r.key_for(key_columns)))
            .cloned()
            .collect::<Vec<_>>();
        let skipped_existing = records.len() - fresh.len();
        debug!(table, existing, skipped_existing, "computed differential insert");

        let mut outcome = self.insert_batches(table, &fresh).await;
        outcome.skipped_existing = skipped_existing;
        Ok(outcome)
    }

    async fn insert_batches(&self, table: &str, records: &[TargetRecord]) -> WriteOutcome {
        let mut outcome = WriteOutcome::default();
        for (batch_index, batch) in records.chunks(self.batch_size).enumerate() {
            outcome.batches += 1;
            match self.destination.insert_batch(table, batch).await {
                Ok(()) => outcome.inserted += batch.len(),
                Err(err) => {
                    warn!(table, batch_index, rows = batch.len(), %err, "insert batch failed; skipping");
                    outcome.failed_batches.push(FailedBatch {
                        batch_index,
                        rows: batch.len(),
                        error: err.to_string(),
                    });
                }
            }
        }
        info!(
            table,
            inserted = outcome.inserted,
            failed_batches = outcome.failed_batches.len(),
            "wrote table"
        );
        outcome
    }
}
