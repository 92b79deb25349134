use std::path::PathBuf;
use std::sync::Arc;

use armory_storage::{ArchiveStore, CharacterStore, StoreError};
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, info_span, Instrument};

use crate::addon::{package_zip, render_addon, Manifest};
use crate::chunk::chunk_by_login;

#[derive(Debug, Error)]
pub enum CompactionError {
    #[error("reading characters: {0}")]
    Store(#[from] StoreError),
    #[error("rendering addon descriptors: {0}")]
    Render(#[from] askama::Error),
    #[error("building archive: {0}")]
    Package(#[from] zip::result::ZipError),
    #[error("publishing archive: {0:#}")]
    Publish(anyhow::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct CompactionSummary {
    pub manifest: Manifest,
    pub archive_path: PathBuf,
    pub byte_size: usize,
    pub content_hash: String,
}

/// Rebuilds the addon archive from the current store contents.
///
/// Any failure leaves the previously published archive in place.
#[derive(Clone)]
pub struct CompactionDriver {
    store: Arc<dyn CharacterStore>,
    archives: ArchiveStore,
    addon_name: String,
    chunk_size: usize,
}

impl CompactionDriver {
    pub fn new(
        store: Arc<dyn CharacterStore>,
        archives: ArchiveStore,
        addon_name: impl Into<String>,
        chunk_size: usize,
    ) -> Self {
        Self {
            store,
            archives,
            addon_name: addon_name.into(),
            chunk_size,
        }
    }

    pub fn addon_name(&self) -> &str {
        &self.addon_name
    }

    pub fn archives(&self) -> &ArchiveStore {
        &self.archives
    }

    pub fn archive_file_name(&self) -> String {
        archive_file_name(&self.addon_name)
    }

    pub async fn run_once(&self) -> Result<CompactionSummary, CompactionError> {
        self.run_for_date(Utc::now().date_naive()).await
    }

    pub async fn run_for_date(
        &self,
        generated_on: NaiveDate,
    ) -> Result<CompactionSummary, CompactionError> {
        let span = info_span!("compaction", addon = %self.addon_name);
        async {
            let records = self.store.read_all_sorted_by_login().await?;
            let segments = chunk_by_login(&records, self.chunk_size);
            drop(records);

            let manifest = Manifest {
                segment_count: segments.len(),
                generated_on,
                account_count: self.store.count_distinct_logins().await?,
                character_count: self.store.count_all().await?,
            };

            let files = render_addon(&self.addon_name, &segments, &manifest)?;
            let bytes = package_zip(&self.addon_name, &files)?;
            let stored = self
                .archives
                .replace_atomically(&self.archive_file_name(), &bytes)
                .await
                .map_err(CompactionError::Publish)?;

            info!(
                segments = manifest.segment_count,
                accounts = manifest.account_count,
                characters = manifest.character_count,
                bytes = stored.byte_size,
                path = %stored.path.display(),
                "addon archive published"
            );
            Ok(CompactionSummary {
                manifest,
                archive_path: stored.path,
                byte_size: stored.byte_size,
                content_hash: stored.content_hash,
            })
        }
        .instrument(span)
        .await
    }
}

pub fn archive_file_name(addon_name: &str) -> String {
    format!("{addon_name}.zip")
}
