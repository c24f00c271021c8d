//! In-memory [`Destination`] for tests of the write path.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tpsync_core::TargetRecord;

use crate::destination::{Destination, DestinationError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Tables kept as record lists. Insert calls are numbered per table from
/// zero; the ones registered with [`MemoryDestination::fail_insert`] are
/// rejected.
#[derive(Debug, Default)]
pub struct MemoryDestination {
    tables: Mutex<BTreeMap<String, Vec<TargetRecord>>>,
    fail_inserts: Mutex<HashSet<(String, usize)>>,
    fail_deletes: Mutex<HashSet<String>>,
    insert_calls: Mutex<BTreeMap<String, usize>>,
}

impl MemoryDestination {
    pub fn rows(&self, table: &str) -> Vec<TargetRecord> {
        lock(&self.tables).get(table).cloned().unwrap_or_default()
    }

    pub fn tables(&self) -> BTreeMap<String, Vec<TargetRecord>> {
        lock(&self.tables).clone()
    }

    pub fn seed(&self, table: &str, rows: Vec<TargetRecord>) {
        lock(&self.tables).insert(table.to_string(), rows);
    }

    pub fn fail_insert(&self, table: &str, call: usize) {
        lock(&self.fail_inserts).insert((table.to_string(), call));
    }

    pub fn fail_delete(&self, table: &str) {
        lock(&self.fail_deletes).insert(table.to_string());
    }

    pub fn insert_calls(&self, table: &str) -> usize {
        lock(&self.insert_calls).get(table).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Destination for MemoryDestination {
    async fn delete_all(&self, table: &str, _filter_column: &str) -> Result<(), DestinationError> {
        if lock(&self.fail_deletes).contains(table) {
            return Err(DestinationError::Response(format!(
                "permission denied for table {table}"
            )));
        }
        lock(&self.tables).remove(table);
        Ok(())
    }

    async fn insert_batch(
        &self,
        table: &str,
        records: &[TargetRecord],
    ) -> Result<(), DestinationError> {
        let call = {
            let mut calls = lock(&self.insert_calls);
            let n = calls.entry(table.to_string()).or_default();
            *n += 1;
            *n - 1
        };
        if lock(&self.fail_inserts).contains(&(table.to_string(), call)) {
            return Err(DestinationError::Response(format!(
                "duplicate key value violates unique constraint (batch {call})"
            )));
        }
        lock(&self.tables)
            .entry(table.to_string())
            .or_default()
            .extend(records.iter().cloned());
        Ok(())
    }

    async fn existing_keys(
        &self,
        table: &str,
        key_columns: &[String],
    ) -> Result<HashSet<String>, DestinationError> {
        Ok(self
            .rows(table)
            .iter()
            .map(|r| r.key_for(key_columns))
            .collect())
    }
}
