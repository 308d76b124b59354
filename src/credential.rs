use std::path::PathBuf;
use std::sync::RwLock;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

/// Scheme prefix the marketplace expects on its authorization header.
pub const TOKEN_SCHEME: &str = "tma ";

/// Failure to obtain or refresh a token. Never fatal; retried on cadence.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no credential available: {0}")]
    Unavailable(String),

    #[error("credential source is stale ({age_secs}s old, max {max_secs}s)")]
    Stale { age_secs: u64, max_secs: u64 },

    #[error("credential I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Validity as last observed against the upstream API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    /// Not yet exercised.
    Unknown,
    Valid,
    /// Rejected upstream; flagged for priority refresh.
    Expired,
}

/// A bearer token plus issuance metadata.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub token: String,
    pub acquired_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub status: CredentialStatus,
}

impl Credential {
    pub fn new(token: impl Into<String>, acquired_at: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            acquired_at,
            expires_at: None,
            status: CredentialStatus::Unknown,
        }
    }

    /// Short non-reversible tag safe for logs.
    pub fn fingerprint(&self) -> String {
        let tail: String = self
            .token
            .chars()
            .rev()
            .take(6)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        format!("…{tail} ({} chars)", self.token.len())
    }

    /// Age-based staleness, honoring any expiry hint.
    pub fn is_due(&self, now: DateTime<Utc>, refresh_interval: Duration) -> bool {
        if self.status == CredentialStatus::Expired {
            return true;
        }
        if self.expires_at.is_some_and(|exp| exp <= now) {
            return true;
        }
        let age = (now - self.acquired_at).to_std().unwrap_or_default();
        age >= refresh_interval
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("token", &self.fingerprint())
            .field("acquired_at", &self.acquired_at)
            .field("expires_at", &self.expires_at)
            .field("status", &self.status)
            .finish()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("no credential installed")]
pub struct NoCredential;

/// Holds the current credential. One writer, many readers; every read sees
/// either the old or the new credential in full.
#[derive(Debug, Default)]
pub struct CredentialHolder {
    inner: RwLock<Option<Credential>>,
}

impl CredentialHolder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credential(credential: Credential) -> Self {
        Self {
            inner: RwLock::new(Some(credential)),
        }
    }

    /// Snapshot of the current credential, even if it has been invalidated.
    pub fn get(&self) -> Result<Credential, NoCredential> {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        guard.clone().ok_or(NoCredential)
    }

    pub fn set(&self, credential: Credential) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        *guard = Some(credential);
    }

    /// Mark the current credential as rejected upstream.
    pub fn invalidate(&self) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(cred) = guard.as_mut() {
            cred.status = CredentialStatus::Expired;
        }
    }

    /// Record that the upstream accepted the current credential.
    pub fn mark_valid(&self) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(cred) = guard.as_mut() {
            if cred.status == CredentialStatus::Unknown {
                cred.status = CredentialStatus::Valid;
            }
        }
    }

    pub fn needs_refresh(&self, now: DateTime<Utc>, refresh_interval: Duration) -> bool {
        match self.get() {
            Ok(cred) => cred.is_due(now, refresh_interval),
            Err(NoCredential) => true,
        }
    }
}

/// External source of fresh tokens (browser capture, file drop, env var).
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn acquire(&self) -> Result<String, CredentialError>;
}

/// Ensure the token carries the `tma ` scheme.
pub fn normalize_token(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.starts_with(TOKEN_SCHEME) {
        Some(trimmed.to_string())
    } else {
        Some(format!("{TOKEN_SCHEME}{trimmed}"))
    }
}

/// Reads the token the browser-capture tool drops into a file.
pub struct TokenFileProvider {
    path: PathBuf,
    max_age: Option<Duration>,
}

impl TokenFileProvider {
    pub fn new(path: impl Into<PathBuf>, max_age: Option<Duration>) -> Self {
        Self {
            path: path.into(),
            max_age,
        }
    }
}

#[async_trait]
impl CredentialProvider for TokenFileProvider {
    async fn acquire(&self) -> Result<String, CredentialError> {
        let meta = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CredentialError::Unavailable(format!(
                    "{} does not exist; run the browser capture to produce it",
                    self.path.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(max_age) = self.max_age {
            let age = meta
                .modified()
                .ok()
                .and_then(|m| SystemTime::now().duration_since(m).ok())
                .unwrap_or_default();
            if age > max_age {
                return Err(CredentialError::Stale {
                    age_secs: age.as_secs(),
                    max_secs: max_age.as_secs(),
                });
            }
        }

        let contents = tokio::fs::read_to_string(&self.path).await?;
        normalize_token(&contents).ok_or_else(|| {
            CredentialError::Unavailable(format!("{} is empty", self.path.display()))
        })
    }
}

/// A fixed token, e.g. from `PORTALS_TOKEN`.
pub struct StaticProvider {
    token: String,
}

impl StaticProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticProvider {
    async fn acquire(&self) -> Result<String, CredentialError> {
        normalize_token(&self.token)
            .ok_or_else(|| CredentialError::Unavailable("static token is empty".into()))
    }
}

/// Drives one rotation: acquire, then install.
///
/// A failed acquisition leaves the current credential and its status alone;
/// marking a rejected credential is the caller's job.
pub struct CredentialRefresher<'a> {
    pub holder: &'a CredentialHolder,
    pub provider: &'a dyn CredentialProvider,
}

impl CredentialRefresher<'_> {
    pub async fn refresh(&self, reason: &str) -> Result<Credential, CredentialError> {
        info!("Refreshing credential ({reason})");
        let token = match self.provider.acquire().await {
            Ok(token) => token,
            Err(e) => {
                warn!(kind = "CredentialError", "Credential refresh failed: {e}");
                return Err(e);
            }
        };
        let credential = Credential::new(token, Utc::now());
        info!("Installed credential {}", credential.fingerprint());
        self.holder.set(credential.clone());
        Ok(credential)
    }
}
