//! Raw source retrieval: BI questions (CSV/JSON) and public JSON feeds.

use std::sync::Arc;

use serde_json::Value as JsonValue;
use thiserror::Error;
use tpsync_core::{SourceFormat, SourceSpec};
use tracing::warn;

use crate::credentials::{CredentialError, CredentialManager};
use crate::metabase::{BiApi, FeedApi};
use crate::FetchError;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Authentication(#[from] CredentialError),
    #[error("BI session rejected again after re-authenticating (question {question_id})")]
    SessionRejected { question_id: u64 },
    #[error("source unavailable: {0}")]
    Unavailable(#[source] FetchError),
    #[error("malformed source data from {origin}: {reason}")]
    Malformed { origin: String, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SourcePayload {
    Csv(String),
    Json(Vec<JsonValue>),
}

/// Body must be a JSON array; anything else is malformed.
pub fn parse_json_array(origin: &str, body: &str) -> Result<Vec<JsonValue>, SourceError> {
    let value: JsonValue = serde_json::from_str(body).map_err(|e| SourceError::Malformed {
        origin: origin.to_string(),
        reason: format!("invalid JSON: {e}"),
    })?;
    match value {
        JsonValue::Array(items) => Ok(items),
        other => Err(SourceError::Malformed {
            origin: origin.to_string(),
            reason: format!("expected a JSON array, got {}", json_kind(&other)),
        }),
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

pub struct SourceFetcher {
    bi: Arc<dyn BiApi>,
    feed: Arc<dyn FeedApi>,
    credentials: Arc<CredentialManager>,
}

impl SourceFetcher {
    pub fn new(
        bi: Arc<dyn BiApi>,
        feed: Arc<dyn FeedApi>,
        credentials: Arc<CredentialManager>,
    ) -> Self {
        Self {
            bi,
            feed,
            credentials,
        }
    }

    pub fn credentials(&self) -> &Arc<CredentialManager> {
        &self.credentials
    }

    pub async fn fetch(&self, spec: &SourceSpec) -> Result<SourcePayload, SourceError> {
        match spec {
            SourceSpec::BiQuestion {
                question_id,
                format: SourceFormat::Csv,
            } => Ok(SourcePayload::Csv(self.fetch_csv(*question_id).await?)),
            SourceSpec::BiQuestion {
                question_id,
                format: SourceFormat::Json,
            } => Ok(SourcePayload::Json(
                self.fetch_question_json(*question_id).await?,
            )),
            SourceSpec::Feed { url } => Ok(SourcePayload::Json(self.fetch_json(url).await?)),
        }
    }

    pub async fn fetch_csv(&self, question_id: u64) -> Result<String, SourceError> {
        self.query_with_refresh(question_id, SourceFormat::Csv).await
    }

    pub async fn fetch_question_json(
        &self,
        question_id: u64,
    ) -> Result<Vec<JsonValue>, SourceError> {
        let body = self
            .query_with_refresh(question_id, SourceFormat::Json)
            .await?;
        parse_json_array(&format!("question {question_id}"), &body)
    }

    pub async fn fetch_json(&self, url: &str) -> Result<Vec<JsonValue>, SourceError> {
        let body = self.feed.get(url).await.map_err(SourceError::Unavailable)?;
        parse_json_array(url, &body)
    }

    /// One transparent re-authentication on 401; a second 401 is fatal.
    async fn query_with_refresh(
        &self,
        question_id: u64,
        format: SourceFormat,
    ) -> Result<String, SourceError> {
        let token = self.credentials.get_valid_token().await?;
        match self.bi.query(&token, question_id, format).await {
            Ok(body) => Ok(body),
            Err(err) if err.is_unauthorized() => {
                warn!(question_id, "BI session rejected; re-authenticating once");
                self.credentials.invalidate().await;
                let token = self.credentials.get_valid_token().await?;
                match self.bi.query(&token, question_id, format).await {
                    Ok(body) => Ok(body),
                    Err(err) if err.is_unauthorized() => {
                        Err(SourceError::SessionRejected { question_id })
                    }
                    Err(err) => Err(SourceError::Unavailable(err)),
                }
            }
            Err(err) => Err(SourceError::Unavailable(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{BiCredentials, CredentialStore};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tpsync_core::SessionCredential;

    #[derive(Default)]
    struct MemoryStore {
        saved: Mutex<Option<SessionCredential>>,
    }

    #[async_trait]
    impl CredentialStore for MemoryStore {
        async fn load(&self) -> Result<Option<SessionCredential>, CredentialError> {
            Ok(self.saved.lock().unwrap().clone())
        }

        async fn save(&self, credential: &SessionCredential) -> Result<(), CredentialError> {
            *self.saved.lock().unwrap() = Some(credential.clone());
            Ok(())
        }
    }

    /// Rejects every query made with a token in `rejected`.
    struct ScriptedBi {
        logins: AtomicUsize,
        queries: AtomicUsize,
        rejected: Vec<String>,
        body: String,
    }

    impl ScriptedBi {
        fn new(rejected: &[&str], body: &str) -> Self {
            Self {
                logins: AtomicUsize::new(0),
                queries: AtomicUsize::new(0),
                rejected: rejected.iter().map(|s| s.to_string()).collect(),
                body: body.to_string(),
            }
        }
    }

    #[async_trait]
    impl BiApi for ScriptedBi {
        async fn login(&self, _username: &str, _password: &str) -> Result<String, FetchError> {
            let n = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("token-{n}"))
        }

        async fn query(
            &self,
            token: &str,
            question_id: u64,
            format: SourceFormat,
        ) -> Result<String, FetchError> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            if self.rejected.iter().any(|t| t == token) {
                return Err(FetchError::Unauthorized {
                    url: format!("https://bi.test/api/card/{question_id}/query/{}", format.as_str()),
                });
            }
            Ok(self.body.clone())
        }
    }

    struct StaticFeed(&'static str);

    #[async_trait]
    impl FeedApi for StaticFeed {
        async fn get(&self, _url: &str) -> Result<String, FetchError> {
            Ok(self.0.to_string())
        }
    }

    fn fetcher(bi: Arc<ScriptedBi>, store: Arc<MemoryStore>, feed: &'static str) -> SourceFetcher {
        let credentials = Arc::new(CredentialManager::new(
            bi.clone(),
            BiCredentials {
                username: "u".into(),
                password: "p".into(),
            },
            store,
        ));
        SourceFetcher::new(bi, Arc::new(StaticFeed(feed)), credentials)
    }

    fn cached(token: &str) -> Arc<MemoryStore> {
        Arc::new(MemoryStore {
            saved: Mutex::new(Some(SessionCredential {
                token: token.into(),
                expires_at: chrono::Utc::now() + chrono::Duration::days(1),
            })),
        })
    }

    #[tokio::test]
    async fn stale_cached_token_is_refreshed_once_and_retried() {
        let bi = Arc::new(ScriptedBi::new(&["revoked"], "a,b\n1,2\n"));
        let fetcher = fetcher(bi.clone(), cached("revoked"), "[]");

        let body = fetcher.fetch_csv(12).await.expect("retry succeeds");

        assert_eq!(body, "a,b\n1,2\n");
        assert_eq!(bi.logins.load(Ordering::SeqCst), 1);
        assert_eq!(bi.queries.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn second_rejection_after_refresh_is_fatal() {
        let bi = Arc::new(ScriptedBi::new(&["revoked", "token-1"], ""));
        let fetcher = fetcher(bi.clone(), cached("revoked"), "[]");

        let err = fetcher.fetch_csv(12).await.unwrap_err();

        assert!(matches!(err, SourceError::SessionRejected { question_id: 12 }));
        assert_eq!(bi.logins.load(Ordering::SeqCst), 1);
        assert_eq!(bi.queries.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn feed_must_be_a_json_array() {
        let bi = Arc::new(ScriptedBi::new(&[], ""));
        let fetcher = fetcher(bi, Arc::new(MemoryStore::default()), "{\"data\": []}");
        let err = fetcher
            .fetch_json("https://feeds.test/materials.json")
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Malformed { .. }));
    }

    #[tokio::test]
    async fn question_json_is_decoded() {
        let bi = Arc::new(ScriptedBi::new(&[], "[{\"teacher_name\": \"Ani\"}]"));
        let fetcher = fetcher(bi, Arc::new(MemoryStore::default()), "[]");
        let payload = fetcher
            .fetch(&SourceSpec::BiQuestion {
                question_id: 3,
                format: SourceFormat::Json,
            })
            .await
            .unwrap();
        match payload {
            SourcePayload::Json(items) => assert_eq!(items.len(), 1),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn non_json_body_is_malformed() {
        let err = parse_json_array("feed", "<html>").unwrap_err();
        assert!(matches!(err, SourceError::Malformed { .. }));
    }
}
