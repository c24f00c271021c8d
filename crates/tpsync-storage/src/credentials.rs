//! BI session token lifecycle: cache, refresh, persistence.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tpsync_core::SessionCredential;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::metabase::BiApi;
use crate::FetchError;

pub const TOKEN_KEY: &str = "TOKEN";
pub const TOKEN_EXPIRY_KEY: &str = "TOKEN_EXPIRY";

/// Kept below the BI server's own session lifetime.
pub const DEFAULT_TOKEN_VALIDITY_DAYS: i64 = 13;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("BI authentication failed: {0}")]
    Authentication(#[source] FetchError),
    #[error("BI login unavailable: {0}")]
    LoginUnavailable(#[source] FetchError),
    #[error("credential store {path}: {message}")]
    Store { path: String, message: String },
}

impl CredentialError {
    /// The BI refused the username/password, as opposed to being unreachable.
    pub fn is_rejection(&self) -> bool {
        matches!(self, CredentialError::Authentication(_))
    }
}

/// 401, 400 and 403 from the session endpoint mean the credentials were refused.
fn login_error(err: FetchError) -> CredentialError {
    match err.status() {
        Some(400 | 401 | 403) => CredentialError::Authentication(err),
        _ => CredentialError::LoginUnavailable(err),
    }
}

#[derive(Clone)]
pub struct BiCredentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for BiCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BiCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Durable home of the cached session token.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self) -> Result<Option<SessionCredential>, CredentialError>;
    async fn save(&self, credential: &SessionCredential) -> Result<(), CredentialError>;
}

/// `KEY=VALUE` env file holding `TOKEN` and `TOKEN_EXPIRY` (RFC 3339).
///
/// Other lines of the file are preserved on save. The file is replaced via a
/// temp file and rename so readers never see a half-written token.
#[derive(Debug, Clone)]
pub struct EnvFileStore {
    path: PathBuf,
    reload_env: bool,
}

impl EnvFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            reload_env: false,
        }
    }

    /// Re-export the file into the process environment after every save.
    pub fn with_env_reload(mut self, reload_env: bool) -> Self {
        self.reload_env = reload_env;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn store_error(&self, message: impl Into<String>) -> CredentialError {
        CredentialError::Store {
            path: self.path.display().to_string(),
            message: message.into(),
        }
    }
}

/// Key of an assignment line, for the line-preserving rewrite.
fn assignment_key(line: &str) -> Option<&str> {
    let line = line.trim_start();
    if line.starts_with('#') {
        return None;
    }
    let line = line.strip_prefix("export ").unwrap_or(line);
    line.split_once('=').map(|(key, _)| key.trim())
}

/// Replace (or append) the token lines, leaving every other line intact.
pub fn render_env_file(existing: &str, credential: &SessionCredential) -> String {
    let token_line = format!("{TOKEN_KEY}={}", credential.token);
    let expiry_line = format!("{TOKEN_EXPIRY_KEY}={}", credential.expires_at.to_rfc3339());
    let mut wrote_token = false;
    let mut wrote_expiry = false;

    let mut lines = Vec::new();
    for line in existing.lines() {
        match assignment_key(line) {
            Some(TOKEN_KEY) => {
                if !wrote_token {
                    lines.push(token_line.clone());
                    wrote_token = true;
                }
            }
            Some(TOKEN_EXPIRY_KEY) => {
                if !wrote_expiry {
                    lines.push(expiry_line.clone());
                    wrote_expiry = true;
                }
            }
            _ => lines.push(line.to_string()),
        }
    }
    if !wrote_token {
        lines.push(token_line);
    }
    if !wrote_expiry {
        lines.push(expiry_line);
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Read the persisted token with the same parser that reloads the process env.
pub fn parse_env_credential(text: &str) -> Option<SessionCredential> {
    let mut token = None;
    let mut expiry = None;
    for entry in dotenvy::from_read_iter(text.as_bytes()) {
        match entry {
            Ok((key, value)) if key == TOKEN_KEY => token = Some(value),
            Ok((key, value)) if key == TOKEN_EXPIRY_KEY => expiry = Some(value),
            Ok(_) => {}
            Err(err) => debug!(%err, "skipping unparseable env line"),
        }
    }
    let token = token.filter(|t| !t.is_empty())?;
    let expires_at = match DateTime::parse_from_rfc3339(expiry.as_deref()?) {
        Ok(ts) => ts.with_timezone(&Utc),
        Err(err) => {
            warn!(%err, "ignoring persisted token with unparseable expiry");
            return None;
        }
    };
    Some(SessionCredential { token, expires_at })
}

#[async_trait]
impl CredentialStore for EnvFileStore {
    async fn load(&self) -> Result<Option<SessionCredential>, CredentialError> {
        match fs::read_to_string(&self.path).await {
            Ok(text) => Ok(parse_env_credential(&text)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(self.store_error(format!("reading: {err}"))),
        }
    }

    async fn save(&self, credential: &SessionCredential) -> Result<(), CredentialError> {
        let existing = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(err) => return Err(self.store_error(format!("reading: {err}"))),
        };
        let rendered = render_env_file(&existing, credential);

        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let temp_path = parent.join(format!(".{}.env.tmp", Uuid::new_v4()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|e| self.store_error(format!("opening temp file: {e}")))?;
        file.write_all(rendered.as_bytes())
            .await
            .map_err(|e| self.store_error(format!("writing temp file: {e}")))?;
        file.flush()
            .await
            .map_err(|e| self.store_error(format!("flushing temp file: {e}")))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(self.store_error(format!("replacing file: {err}")));
        }

        if self.reload_env {
            if let Err(err) = dotenvy::from_path_override(&self.path) {
                warn!(%err, path = %self.path.display(), "reloading environment failed");
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
enum CacheState {
    Unloaded,
    Empty,
    Cached(SessionCredential),
}

/// Sole owner of the BI session token.
///
/// The cache lock is held across a refresh, so concurrent callers wait for
/// one login instead of racing their own.
pub struct CredentialManager {
    api: Arc<dyn BiApi>,
    credentials: BiCredentials,
    store: Arc<dyn CredentialStore>,
    validity: Duration,
    cache: Mutex<CacheState>,
}

impl CredentialManager {
    pub fn new(
        api: Arc<dyn BiApi>,
        credentials: BiCredentials,
        store: Arc<dyn CredentialStore>,
    ) -> Self {
        Self {
            api,
            credentials,
            store,
            validity: Duration::days(DEFAULT_TOKEN_VALIDITY_DAYS),
            cache: Mutex::new(CacheState::Unloaded),
        }
    }

    pub fn with_validity(mut self, validity: Duration) -> Self {
        self.validity = validity;
        self
    }

    /// Cached token while it is unexpired, otherwise a fresh login.
    pub async fn get_valid_token(&self) -> Result<String, CredentialError> {
        let mut cache = self.cache.lock().await;

        if matches!(*cache, CacheState::Unloaded) {
            *cache = match self.store.load().await {
                Ok(Some(credential)) => CacheState::Cached(credential),
                Ok(None) => CacheState::Empty,
                Err(err) => {
                    warn!(%err, "could not load persisted BI token");
                    CacheState::Empty
                }
            };
        }

        let now = Utc::now();
        if let CacheState::Cached(credential) = &*cache {
            if credential.is_valid_at(now) {
                return Ok(credential.token.clone());
            }
            debug!(expired_at = %credential.expires_at, "cached BI token expired");
        }

        let token = self
            .api
            .login(&self.credentials.username, &self.credentials.password)
            .await
            .map_err(login_error)?;
        let credential = SessionCredential {
            token: token.clone(),
            expires_at: now + self.validity,
        };
        if let Err(err) = self.store.save(&credential).await {
            warn!(%err, "BI token refreshed but not persisted");
        }
        info!(expires_at = %credential.expires_at, "refreshed BI session token");
        *cache = CacheState::Cached(credential);
        Ok(token)
    }

    /// Drop the cached token; the next [`Self::get_valid_token`] logs in again.
    pub async fn invalidate(&self) {
        let mut cache = self.cache.lock().await;
        *cache = CacheState::Empty;
    }

    pub async fn cached(&self) -> Option<SessionCredential> {
        match &*self.cache.lock().await {
            CacheState::Cached(credential) => Some(credential.clone()),
            _ => None,
        }
    }
}
