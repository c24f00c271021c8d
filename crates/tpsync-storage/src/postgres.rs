//! Direct Postgres destination over sqlx.

use std::collections::{BTreeSet, HashSet};

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tpsync_core::{TargetRecord, KEY_DELIMITER};

use crate::destination::{validate_identifier, Destination, DestinationError};

fn quote_ident(name: &str) -> Result<String, DestinationError> {
    Ok(format!("\"{}\"", validate_identifier(name)?))
}

/// Column list for an insert: union of every record's columns, sorted.
fn insert_columns(records: &[TargetRecord]) -> Result<Vec<String>, DestinationError> {
    records
        .iter()
        .flat_map(|r| r.columns())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(quote_ident)
        .collect()
}

pub fn insert_sql(table: &str, records: &[TargetRecord]) -> Result<String, DestinationError> {
    let table = quote_ident(table)?;
    let columns = insert_columns(records)?.join(", ");
    Ok(format!(
        "INSERT INTO {table} ({columns}) SELECT {columns} FROM json_populate_recordset(NULL::{table}, $1::json)"
    ))
}

pub fn existing_keys_sql(table: &str, key_columns: &[String]) -> Result<String, DestinationError> {
    let table = quote_ident(table)?;
    let parts = key_columns
        .iter()
        .map(|c| Ok(format!("btrim(coalesce({}::text, ''))", quote_ident(c)?)))
        .collect::<Result<Vec<_>, DestinationError>>()?;
    Ok(format!(
        "SELECT concat_ws('{KEY_DELIMITER}', {}) FROM {table}",
        parts.join(", ")
    ))
}

#[derive(Debug, Clone)]
pub struct PgDestination {
    pool: PgPool,
}

impl PgDestination {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, DestinationError> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl Destination for PgDestination {
    async fn delete_all(&self, table: &str, _filter_column: &str) -> Result<(), DestinationError> {
        let sql = format!("DELETE FROM {} WHERE true", quote_ident(table)?);
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    async fn insert_batch(
        &self,
        table: &str,
        records: &[TargetRecord],
    ) -> Result<(), DestinationError> {
        if records.is_empty() {
            return Ok(());
        }
        let sql = insert_sql(table, records)?;
        let payload = JsonValue::Array(records.iter().cloned().map(TargetRecord::into_value).collect());
        sqlx::query(&sql).bind(payload).execute(&self.pool).await?;
        Ok(())
    }

    async fn existing_keys(
        &self,
        table: &str,
        key_columns: &[String],
    ) -> Result<HashSet<String>, DestinationError> {
        let sql = existing_keys_sql(table, key_columns)?;
        let keys: Vec<String> = sqlx::query_scalar(&sql).fetch_all(&self.pool).await?;
        Ok(keys.into_iter().collect())
    }
}
