use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, RETRY_AFTER};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::credential::Credential;
use crate::retry::{Classify, ErrorClass};
use crate::types::{ActionsResponse, Cursor, Sale, SalesPage};

const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko)";

/// Outcome of a failed page fetch, already classified for the retry controller.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("credential rejected (HTTP {status})")]
    AuthExpired { status: u16 },

    #[error("no credential installed")]
    NoCredential,

    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("server error (HTTP {status})")]
    ServerError { status: u16 },

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("invalid response body: {0}")]
    InvalidResponse(String),

    #[error("request rejected (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },
}

impl Classify for FetchError {
    fn class(&self) -> ErrorClass {
        match self {
            FetchError::AuthExpired { .. } | FetchError::NoCredential => ErrorClass::AuthExpired,
            FetchError::RateLimited { retry_after } => ErrorClass::RateLimited(*retry_after),
            FetchError::ServerError { .. }
            | FetchError::NetworkError(_)
            | FetchError::InvalidResponse(_) => ErrorClass::Transient,
            FetchError::Rejected { .. } => ErrorClass::Fatal,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            FetchError::AuthExpired { .. } | FetchError::NoCredential => "AuthExpired",
            FetchError::Rejected { .. } => "FetchRejected",
            _ => "TransientNetworkError",
        }
    }
}

/// Source of sale pages. The HTTP client is the production implementation.
#[async_trait]
pub trait SaleFeed: Send + Sync {
    async fn fetch_page(
        &self,
        cursor: Cursor,
        credential: &Credential,
    ) -> Result<SalesPage, FetchError>;
}

/// Authenticated client for the marketplace actions endpoint.
pub struct FeedClient {
    http: reqwest::Client,
    api_url: Url,
    page_size: u32,
}

impl FeedClient {
    pub fn new(api_url: &str, page_size: u32, timeout: Duration) -> Result<Self> {
        let api_url = Url::parse(api_url).with_context(|| format!("invalid feed URL {api_url}"))?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            api_url,
            page_size: page_size.max(1),
        })
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }
}

#[async_trait]
impl SaleFeed for FeedClient {
    async fn fetch_page(
        &self,
        cursor: Cursor,
        credential: &Credential,
    ) -> Result<SalesPage, FetchError> {
        let resp = self
            .http
            .get(self.api_url.clone())
            .query(&[
                ("offset", cursor.offset().to_string()),
                ("limit", self.page_size.to_string()),
                ("action_types", "buy".to_string()),
            ])
            .header(AUTHORIZATION, credential.token.as_str())
            .header(ACCEPT, "application/json, text/plain, */*")
            .send()
            .await
            .map_err(|e| FetchError::NetworkError(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(resp.headers());
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, retry_after, &body));
        }

        let body = resp
            .text()
            .await
            .map_err(|e| FetchError::NetworkError(e.to_string()))?;
        let page = parse_page(&body, cursor, self.page_size)?;
        debug!(
            "Fetched page at offset {} ({} entries, {} sales)",
            cursor.offset(),
            page.entries,
            page.sales.len()
        );
        Ok(page)
    }
}

/// Map a non-success HTTP status onto the fetch taxonomy.
pub fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> FetchError {
    match status.as_u16() {
        401 | 403 => FetchError::AuthExpired {
            status: status.as_u16(),
        },
        429 => FetchError::RateLimited { retry_after },
        500..=599 => FetchError::ServerError {
            status: status.as_u16(),
        },
        other => FetchError::Rejected {
            status: other,
            body: body.chars().take(200).collect(),
        },
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Decode a response body into a page.
///
/// Non-purchase actions are dropped but still count toward the page length,
/// which decides whether another page exists.
pub fn parse_page(body: &str, cursor: Cursor, page_size: u32) -> Result<SalesPage, FetchError> {
    let resp: ActionsResponse =
        serde_json::from_str(body).map_err(|e| FetchError::InvalidResponse(e.to_string()))?;
    let entries = resp.actions.len();

    let mut sales = Vec::with_capacity(entries);
    for raw in resp.actions {
        if !raw.is_purchase() {
            continue;
        }
        let id = raw.sale_id();
        match Sale::try_from(raw) {
            Ok(sale) => sales.push(sale),
            Err(e) => warn!("Skipping sale {id} with unreadable timestamp: {e}"),
        }
    }

    Ok(SalesPage {
        sales,
        entries,
        has_more: entries >= page_size as usize,
        next: cursor.advance(entries),
    })
}
