//! Metabase session/query API and plain JSON feeds.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tpsync_core::SourceFormat;

use crate::{FetchError, HttpFetcher};

pub const SESSION_HEADER: &str = "X-Metabase-Session";

/// Authenticated BI query engine.
#[async_trait]
pub trait BiApi: Send + Sync {
    /// Exchange username/password for a session token.
    async fn login(&self, username: &str, password: &str) -> Result<String, FetchError>;

    /// Run a saved question and return the raw export body.
    async fn query(
        &self,
        token: &str,
        question_id: u64,
        format: SourceFormat,
    ) -> Result<String, FetchError>;
}

/// Unauthenticated GET of a JSON document.
#[async_trait]
pub trait FeedApi: Send + Sync {
    async fn get(&self, url: &str) -> Result<String, FetchError>;
}

#[derive(Debug, Serialize)]
struct SessionRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    id: String,
}

#[derive(Debug, Clone)]
pub struct MetabaseClient {
    base_url: String,
    http: Arc<HttpFetcher>,
}

impl MetabaseClient {
    pub fn new(base_url: impl Into<String>, http: Arc<HttpFetcher>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { base_url, http }
    }

    pub fn session_url(&self) -> String {
        format!("{}/api/session", self.base_url)
    }

    pub fn query_url(&self, question_id: u64, format: SourceFormat) -> String {
        format!(
            "{}/api/card/{}/query/{}",
            self.base_url,
            question_id,
            format.as_str()
        )
    }
}

#[async_trait]
impl BiApi for MetabaseClient {
    async fn login(&self, username: &str, password: &str) -> Result<String, FetchError> {
        let url = self.session_url();
        let request = self
            .http
            .client()
            .post(&url)
            .json(&SessionRequest { username, password });
        let resp = self.http.send(request).await?;
        let session: SessionResponse =
            serde_json::from_str(&resp.body).map_err(|e| FetchError::Malformed {
                url: url.clone(),
                reason: format!("session response is not {{\"id\": ...}}: {e}"),
            })?;
        if session.id.trim().is_empty() {
            return Err(FetchError::Malformed {
                url,
                reason: "session response carried an empty id".to_string(),
            });
        }
        Ok(session.id)
    }

    async fn query(
        &self,
        token: &str,
        question_id: u64,
        format: SourceFormat,
    ) -> Result<String, FetchError> {
        let url = self.query_url(question_id, format);
        let request = self.http.client().post(&url).header(SESSION_HEADER, token);
        Ok(self.http.send(request).await?.body)
    }
}

#[derive(Debug, Clone)]
pub struct HttpFeedClient {
    http: Arc<HttpFetcher>,
}

impl HttpFeedClient {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl FeedApi for HttpFeedClient {
    async fn get(&self, url: &str) -> Result<String, FetchError> {
        let request = self.http.client().get(url);
        Ok(self.http.send(request).await?.body)
    }
}
