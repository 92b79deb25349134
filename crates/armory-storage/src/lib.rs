//! Character persistence, archive storage and HTTP fetch utilities for the armory.

mod memory;
mod postgres;
mod store;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use reqwest::header::COOKIE;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub use memory::MemoryCharacterStore;
pub use postgres::PgCharacterStore;
pub use store::{dedupe_by_identity, CharacterStore, StoreError, UpsertSummary};

pub const CRATE_NAME: &str = "armory-storage";

#[derive(Debug, Clone)]
pub struct StoredArchive {
    pub content_hash: String,
    pub path: PathBuf,
    pub byte_size: usize,
}

/// Directory holding published archives. Writes replace the previous file only on success.
#[derive(Debug, Clone)]
pub struct ArchiveStore {
    root: PathBuf,
}

impl ArchiveStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn archive_path(&self, file_name: &str) -> PathBuf {
        self.root.join(file_name)
    }

    /// Publish bytes under `file_name` via a temp file in the same directory and a rename.
    pub async fn replace_atomically(
        &self,
        file_name: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArchive> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating archive directory {}", self.root.display()))?;

        let path = self.archive_path(file_name);
        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let write_result = async {
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)
                .await
                .with_context(|| format!("opening temp archive file {}", temp_path.display()))?;
            file.write_all(bytes)
                .await
                .with_context(|| format!("writing temp archive file {}", temp_path.display()))?;
            file.sync_all()
                .await
                .with_context(|| format!("syncing temp archive file {}", temp_path.display()))?;
            anyhow::Ok(())
        }
        .await;

        if let Err(err) = write_result {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err);
        }

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp archive {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }

        Ok(StoredArchive {
            content_hash: Self::sha256_hex(bytes),
            path,
            byte_size: bytes.len(),
        })
    }

    /// Bytes of the currently published archive, `None` before the first publish.
    pub async fn read_published(&self, file_name: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let path = self.archive_path(file_name);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("reading archive {}", path.display())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Single-request GET client. Failures are returned as-is; pacing belongs to the caller.
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

    pub async fn fetch_bytes(
        &self,
        url: &str,
        cookie: Option<&str>,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        async {
            let mut request = self.client.get(url);
            if let Some(cookie) = cookie.filter(|c| !c.is_empty()) {
                request = request.header(COOKIE, cookie);
            }

            let resp = request.send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            debug!(%status, "response received");

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.bytes().await?.to_vec();
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}
