//! HTTP plumbing, BI credentials, source fetching and destination writes.

use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub mod credentials;
pub mod destination;
#[cfg(any(test, feature = "test-support"))]
pub mod memory;
pub mod metabase;
pub mod postgres;
pub mod source;

pub use credentials::{
    BiCredentials, CredentialError, CredentialManager, CredentialStore, EnvFileStore,
    DEFAULT_TOKEN_VALIDITY_DAYS,
};
pub use destination::{validate_identifier, Destination, DestinationError, PostgrestDestination};
pub use metabase::{BiApi, FeedApi, HttpFeedClient, MetabaseClient};
pub use postgres::PgDestination;
pub use source::{parse_json_array, SourceError, SourceFetcher, SourcePayload};

pub const CRATE_NAME: &str = "tpsync-storage";

/// Longest response body excerpt kept in errors and logs.
const ERROR_BODY_LIMIT: usize = 512;

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: Some("tpsync/0.1".to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("unauthorized (401) for {url}")]
    Unauthorized { url: String },
    #[error("http status {status} for {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
    #[error("unexpected response from {url}: {reason}")]
    Malformed { url: String, reason: String },
}

impl FetchError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, FetchError::Unauthorized { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Unauthorized { .. } => Some(StatusCode::UNAUTHORIZED.as_u16()),
            FetchError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout {
                url: url.to_string(),
            }
        } else {
            FetchError::Request {
                url: url.to_string(),
                source: err,
            }
        }
    }
}

/// Map a non-success status to its error; 401 is kept distinct so the
/// credential layer can refresh and retry.
pub fn status_error(status: StatusCode, url: &str, body: &str) -> FetchError {
    if status == StatusCode::UNAUTHORIZED {
        FetchError::Unauthorized {
            url: url.to_string(),
        }
    } else {
        FetchError::HttpStatus {
            status: status.as_u16(),
            url: url.to_string(),
            body: truncate_body(body),
        }
    }
}

fn truncate_body(body: &str) -> String {
    let trimmed = body.trim();
    match trimmed.char_indices().nth(ERROR_BODY_LIMIT) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Send a request and read the body as text. Any non-2xx status is an
    /// error carrying the status and a body excerpt.
    pub async fn send(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<FetchedResponse, FetchError> {
        let request = request
            .build()
            .map_err(|err| FetchError::from_reqwest("<unbuilt request>", err))?;
        let method = request.method().clone();
        let url = request.url().to_string();
        let span = info_span!("http_request", %method, url = %url);

        async {
            let resp = self
                .client
                .execute(request)
                .await
                .map_err(|err| FetchError::from_reqwest(&url, err))?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            let body = resp
                .text()
                .await
                .map_err(|err| FetchError::from_reqwest(&final_url, err))?;
            debug!(status = status.as_u16(), bytes = body.len(), "response received");

            if status.is_success() {
                Ok(FetchedResponse {
                    status,
                    final_url,
                    body,
                })
            } else {
                Err(status_error(status, &final_url, &body))
            }
        }
        .instrument(span)
        .await
    }
}
