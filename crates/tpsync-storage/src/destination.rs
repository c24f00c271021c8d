//! Destination tables: the write seam plus the Supabase PostgREST backend.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tpsync_core::TargetRecord;

use crate::{FetchError, HttpFetcher};

const POSTGREST_PAGE_SIZE: usize = 1000;

#[derive(Debug, Error)]
pub enum DestinationError {
    #[error("invalid identifier {0:?}")]
    InvalidIdentifier(String),
    #[error("destination request failed: {0}")]
    Http(#[from] FetchError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("unexpected destination response: {0}")]
    Response(String),
}

/// Table operations the synchronizer needs from a relational store.
#[async_trait]
pub trait Destination: Send + Sync {
    /// Remove every row of `table`. `filter_column` names a non-null column
    /// for backends that refuse unfiltered deletes.
    async fn delete_all(&self, table: &str, filter_column: &str) -> Result<(), DestinationError>;

    async fn insert_batch(
        &self,
        table: &str,
        records: &[TargetRecord],
    ) -> Result<(), DestinationError>;

    /// Composite keys (see [`tpsync_core::composite_key`]) of existing rows.
    async fn existing_keys(
        &self,
        table: &str,
        key_columns: &[String],
    ) -> Result<HashSet<String>, DestinationError>;
}

/// Plain SQL identifier: ASCII letter or `_` first, then alphanumerics or `_`.
pub fn validate_identifier(name: &str) -> Result<&str, DestinationError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            name.len() <= 63 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(name)
    } else {
        Err(DestinationError::InvalidIdentifier(name.to_string()))
    }
}

/// Supabase REST (`/rest/v1`) authenticated with the service key.
#[derive(Debug, Clone)]
pub struct PostgrestDestination {
    rest_url: String,
    service_key: String,
    http: Arc<HttpFetcher>,
}

impl PostgrestDestination {
    pub fn new(supabase_url: &str, service_key: impl Into<String>, http: Arc<HttpFetcher>) -> Self {
        Self {
            rest_url: format!("{}/rest/v1", supabase_url.trim_end_matches('/')),
            service_key: service_key.into(),
            http,
        }
    }

    pub fn table_url(&self, table: &str) -> Result<String, DestinationError> {
        Ok(format!("{}/{}", self.rest_url, validate_identifier(table)?))
    }

    fn authed(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("apikey", &self.service_key)
            .bearer_auth(&self.service_key)
    }
}

#[async_trait]
impl Destination for PostgrestDestination {
    async fn delete_all(&self, table: &str, filter_column: &str) -> Result<(), DestinationError> {
        let url = self.table_url(table)?;
        let column = validate_identifier(filter_column)?;
        let request = self
            .authed(self.http.client().delete(&url))
            .query(&[(column, "not.is.null")])
            .header("Prefer", "return=minimal");
        self.http.send(request).await?;
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
        let url = self.table_url(table)?;
        let request = self
            .authed(self.http.client().post(&url))
            .header("Prefer", "return=minimal")
            .json(records);
        self.http.send(request).await?;
        Ok(())
    }

    async fn existing_keys(
        &self,
        table: &str,
        key_columns: &[String],
    ) -> Result<HashSet<String>, DestinationError> {
        let url = self.table_url(table)?;
        for column in key_columns {
            validate_identifier(column)?;
        }

        let mut keys = HashSet::new();
        let mut offset = 0usize;
        loop {
            let request = self
                .authed(self.http.client().get(&url))
                .query(&key_page_query(key_columns, offset));
            let resp = self.http.send(request).await?;
            let rows: Vec<TargetRecord> = serde_json::from_str(&resp.body)
                .map_err(|e| DestinationError::Response(format!("{url}: {e}")))?;
            let fetched = rows.len();
            keys.extend(rows.iter().map(|row| row.key_for(key_columns)));
            if fetched < POSTGREST_PAGE_SIZE {
                break;
            }
            offset += fetched;
        }
        Ok(keys)
    }
}

/// Pages are ordered by the key columns so `offset` walks a stable sequence.
fn key_page_query(key_columns: &[String], offset: usize) -> [(&'static str, String); 4] {
    let columns = key_columns.join(",");
    [
        ("select", columns.clone()),
        ("order", columns),
        ("limit", POSTGREST_PAGE_SIZE.to_string()),
        ("offset", offset.to_string()),
    ]
}
