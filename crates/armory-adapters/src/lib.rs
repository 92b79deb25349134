//! Listing adapters: page sources, row extraction and pagination for the armory.

mod extract;
mod walker;

use std::path::PathBuf;

use armory_storage::{FetchError, HttpFetcher};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub use extract::{
    parse_st_max, ParsedPage, RejectedRow, RowExtractor, RowField, RowLayout, RowRejection,
    StrategySpec, ValueSource, ARMORY_ROW_LAYOUT, PAGER_SELECTOR, ROW_SELECTOR,
};
pub use walker::{PageStep, PaginationWalker, WalkError, WalkPhase};

pub const CRATE_NAME: &str = "armory-adapters";

pub const DEFAULT_LISTING_URL: &str = "https://ezwow.org/index.php?app=isengard&module=core&tab=armory&section=characters&realm=1&sort%5Bkey%5D=playtime&sort%5Border%5D=desc&st=";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedPage {
    pub url: String,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("invalid selector {0}")]
    Selector(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// Something that can return the listing page at a given offset.
#[async_trait]
pub trait PageSource: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch_listing(&self, st: u32) -> Result<FetchedPage, AdapterError>;
}

/// Opaque session cookie. File-backed credentials are re-read on every request so an
/// external process can rotate them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    None,
    Inline(String),
    File(PathBuf),
}

impl Credential {
    pub async fn load(&self) -> Option<String> {
        let raw = match self {
            Self::None => return None,
            Self::Inline(value) => value.clone(),
            Self::File(path) => match tokio::fs::read_to_string(path).await {
                Ok(value) => value,
                Err(err) => {
                    warn!(path = %path.display(), %err, "cookie file unreadable; fetching without cookie");
                    return None;
                }
            },
        };
        let trimmed = raw.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }
}

/// Live armory listing over HTTP.
#[derive(Debug, Clone)]
pub struct HttpPageSource {
    http: HttpFetcher,
    listing_url: String,
    credential: Credential,
}

impl HttpPageSource {
    /// `listing_url` must end where the offset value goes (`...&st=`).
    pub fn new(http: HttpFetcher, listing_url: impl Into<String>, credential: Credential) -> Self {
        Self {
            http,
            listing_url: listing_url.into(),
            credential,
        }
    }

    pub fn page_url(&self, st: u32) -> String {
        format!("{}{}", self.listing_url, st)
    }
}

#[async_trait]
impl PageSource for HttpPageSource {
    fn source_id(&self) -> &str {
        "armory-characters"
    }

    async fn fetch_listing(&self, st: u32) -> Result<FetchedPage, AdapterError> {
        let url = self.page_url(st);
        let cookie = self.credential.load().await;
        let fetched_at = Utc::now();
        let resp = self.http.fetch_bytes(&url, cookie.as_deref()).await?;
        Ok(FetchedPage {
            url: resp.final_url.clone(),
            body: resp.text(),
            fetched_at,
        })
    }
}
