use std::collections::HashMap;

use armory_core::{Character, CodeCount};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

/// Outcome of one batch upsert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertSummary {
    pub matched: u64,
    pub modified: u64,
    pub inserted: u64,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("invalid stored row: {0}")]
    InvalidRow(String),
}

/// Document store for scraped characters, keyed by [`armory_core::CharacterIdentity`].
///
/// Records whose `expire_at` has passed are invisible to every read and are removed by
/// [`CharacterStore::purge_expired`]. Refreshing an identity always moves its expiry
/// strictly forward.
#[async_trait]
pub trait CharacterStore: Send + Sync {
    /// Empty input is a no-op returning a zero summary.
    async fn upsert_by_identity(&self, records: &[Character]) -> Result<UpsertSummary, StoreError>;

    /// Every live record, contiguous by login (byte order), then by identity.
    async fn read_all_sorted_by_login(&self) -> Result<Vec<Character>, StoreError>;

    async fn count_distinct_logins(&self) -> Result<u64, StoreError>;

    async fn count_all(&self) -> Result<u64, StoreError>;

    /// Counts per race code, descending.
    async fn count_by_race(&self) -> Result<Vec<CodeCount>, StoreError>;

    /// Counts per class code, descending.
    async fn count_by_class(&self) -> Result<Vec<CodeCount>, StoreError>;

    /// All characters on the account owning `name`; `None` when no character has that name.
    async fn characters_sharing_login(
        &self,
        name: &str,
    ) -> Result<Option<Vec<Character>>, StoreError>;

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Collapses repeated identities in one batch, keeping the last occurrence in its
/// original position. A single statement cannot touch the same row twice.
pub fn dedupe_by_identity(records: &[Character]) -> Vec<&Character> {
    let mut last_index = HashMap::with_capacity(records.len());
    for (idx, record) in records.iter().enumerate() {
        last_index.insert(record.identity(), idx);
    }
    records
        .iter()
        .enumerate()
        .filter(|(idx, record)| last_index.get(&record.identity()) == Some(idx))
        .map(|(_, record)| record)
        .collect()
}
