use std::collections::{BTreeMap, HashMap, HashSet};

use armory_core::{sort_code_counts, Character, CodeCount};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;

use crate::store::{dedupe_by_identity, CharacterStore, StoreError, UpsertSummary};

/// In-process store with the same observable semantics as the Postgres store.
#[derive(Debug, Default)]
pub struct MemoryCharacterStore {
    rows: RwLock<HashMap<String, Character>>,
}

impl MemoryCharacterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Identity keys present, including expired rows not yet purged.
    pub async fn raw_len(&self) -> usize {
        self.rows.read().await.len()
    }

    async fn live(&self) -> Vec<Character> {
        let now = Utc::now();
        self.rows
            .read()
            .await
            .values()
            .filter(|c| c.expire_at > now)
            .cloned()
            .collect()
    }

    async fn count_by(&self, code: impl Fn(&Character) -> u8) -> Vec<CodeCount> {
        let mut counts = BTreeMap::<u8, u64>::new();
        for c in self.live().await {
            *counts.entry(code(&c)).or_default() += 1;
        }
        let mut rows = counts
            .into_iter()
            .map(|(id, count)| CodeCount { id, count })
            .collect::<Vec<_>>();
        sort_code_counts(&mut rows);
        rows
    }
}

#[async_trait]
impl CharacterStore for MemoryCharacterStore {
    async fn upsert_by_identity(&self, records: &[Character]) -> Result<UpsertSummary, StoreError> {
        let mut summary = UpsertSummary::default();
        if records.is_empty() {
            return Ok(summary);
        }

        let mut rows = self.rows.write().await;
        for record in dedupe_by_identity(records) {
            // Matches the BIGINT id column of the Postgres store.
            if i64::try_from(record.id).is_err() {
                continue;
            }
            let key = record.identity().storage_key();
            match rows.get_mut(&key) {
                Some(existing) => {
                    let floor = existing.expire_at + Duration::microseconds(1);
                    *existing = record.clone();
                    existing.expire_at = record.expire_at.max(floor);
                    summary.matched += 1;
                    summary.modified += 1;
                }
                None => {
                    rows.insert(key, record.clone());
                    summary.inserted += 1;
                }
            }
        }
        Ok(summary)
    }

    async fn read_all_sorted_by_login(&self) -> Result<Vec<Character>, StoreError> {
        let mut keyed = self
            .live()
            .await
            .into_iter()
            .map(|c| (c.identity().storage_key(), c))
            .collect::<Vec<_>>();
        keyed.sort_by(|(ka, a), (kb, b)| a.login.cmp(&b.login).then_with(|| ka.cmp(kb)));
        Ok(keyed.into_iter().map(|(_, c)| c).collect())
    }

    async fn count_distinct_logins(&self) -> Result<u64, StoreError> {
        let live = self.live().await;
        let logins = live.iter().map(|c| c.login.as_str()).collect::<HashSet<_>>();
        Ok(logins.len() as u64)
    }

    async fn count_all(&self) -> Result<u64, StoreError> {
        Ok(self.live().await.len() as u64)
    }

    async fn count_by_race(&self) -> Result<Vec<CodeCount>, StoreError> {
        Ok(self.count_by(|c| c.race).await)
    }

    async fn count_by_class(&self) -> Result<Vec<CodeCount>, StoreError> {
        Ok(self.count_by(|c| c.class).await)
    }

    async fn characters_sharing_login(
        &self,
        name: &str,
    ) -> Result<Option<Vec<Character>>, StoreError> {
        let live = self.live().await;
        let Some(login) = live.iter().find(|c| c.name == name).map(|c| c.login.clone()) else {
            return Ok(None);
        };
        let mut shared = live
            .into_iter()
            .filter(|c| c.login == login)
            .collect::<Vec<_>>();
        shared.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Some(shared))
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut rows = self.rows.write().await;
        let before = rows.len();
        rows.retain(|_, c| c.expire_at > now);
        Ok((before - rows.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn character(id: u64, name: &str, login: &str, race: u8, class: u8) -> Character {
        Character {
            id,
            name: name.into(),
            login: login.into(),
            class,
            race,
            guild: String::new(),
            lvl: 80,
            kills: 0,
            gs: 0,
            ap: 0,
            expire_at: Utc::now() + Duration::hours(20),
        }
    }

    #[tokio::test]
    async fn empty_upsert_is_a_noop() {
        let store = MemoryCharacterStore::new();
        let summary = store.upsert_by_identity(&[]).await.unwrap();
        assert_eq!(summary, UpsertSummary::default());
        assert_eq!(store.count_all().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn upsert_reports_inserted_then_matched() {
        let store = MemoryCharacterStore::new();
        let batch = vec![character(1, "Thrall", "orc", 1, 6), character(2, "Jaina", "mage", 0, 2)];

        let first = store.upsert_by_identity(&batch).await.unwrap();
        assert_eq!(first.inserted, 2);
        assert_eq!(first.matched, 0);

        let second = store.upsert_by_identity(&batch[..1]).await.unwrap();
        assert_eq!(
            second,
            UpsertSummary {
                matched: 1,
                modified: 1,
                inserted: 0
            }
        );
        assert_eq!(store.count_all().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn refresh_moves_expiry_strictly_forward() {
        let store = MemoryCharacterStore::new();
        let record = character(7, "Uther", "paladin", 0, 3);

        store.upsert_by_identity(std::slice::from_ref(&record)).await.unwrap();
        let first = store.read_all_sorted_by_login().await.unwrap()[0].expire_at;

        // Same payload, same expiry timestamp: the stored expiry must still advance.
        store.upsert_by_identity(std::slice::from_ref(&record)).await.unwrap();
        let second = store.read_all_sorted_by_login().await.unwrap()[0].expire_at;
        assert!(second > first);
    }

    #[tokio::test]
    async fn out_of_range_ids_are_not_stored() {
        let store = MemoryCharacterStore::new();
        let summary = store
            .upsert_by_identity(&[
                character(9_300_000_000_000_000_000, "Garrosh", "warsong", 1, 0),
                character(4, "Grom", "warsong", 1, 0),
            ])
            .await
            .unwrap();
        assert_eq!(summary.inserted, 1);
        let rows = store.read_all_sorted_by_login().await.unwrap();
        assert_eq!(rows.iter().map(|c| c.id).collect::<Vec<_>>(), vec![4]);
    }

    #[tokio::test]
    async fn name_is_identity_when_id_is_missing() {
        let store = MemoryCharacterStore::new();
        let mut a = character(0, "Nameless", "acc", 0, 0);
        store.upsert_by_identity(std::slice::from_ref(&a)).await.unwrap();
        a.lvl = 70;
        let summary = store.upsert_by_identity(std::slice::from_ref(&a)).await.unwrap();
        assert_eq!(summary.matched, 1);
        assert_eq!(store.count_all().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn reads_are_sorted_by_login_and_hide_expired_rows() {
        let store = MemoryCharacterStore::new();
        let mut stale = character(9, "Ghost", "aaa", 0, 0);
        stale.expire_at = Utc::now() - Duration::hours(1);
        store
            .upsert_by_identity(&[
                character(3, "C", "zed", 0, 0),
                character(1, "A", "bob", 0, 0),
                character(2, "B", "zed", 0, 0),
                stale,
            ])
            .await
            .unwrap();

        let rows = store.read_all_sorted_by_login().await.unwrap();
        assert_eq!(
            rows.iter().map(|c| (c.login.as_str(), c.id)).collect::<Vec<_>>(),
            vec![("bob", 1), ("zed", 2), ("zed", 3)]
        );
        assert_eq!(store.count_distinct_logins().await.unwrap(), 2);

        assert_eq!(store.raw_len().await, 4);
        assert_eq!(store.purge_expired(Utc::now()).await.unwrap(), 1);
        assert_eq!(store.raw_len().await, 3);
    }

    #[tokio::test]
    async fn grouped_counts_and_login_lookup() {
        let store = MemoryCharacterStore::new();
        store
            .upsert_by_identity(&[
                character(1, "Aa", "one", 2, 5),
                character(2, "Bb", "one", 2, 1),
                character(3, "Cc", "two", 4, 5),
            ])
            .await
            .unwrap();

        assert_eq!(
            store.count_by_race().await.unwrap(),
            vec![CodeCount { id: 2, count: 2 }, CodeCount { id: 4, count: 1 }]
        );
        assert_eq!(store.count_by_class().await.unwrap()[0], CodeCount { id: 5, count: 2 });

        let shared = store.characters_sharing_login("Bb").await.unwrap().unwrap();
        assert_eq!(shared.iter().map(|c| c.id).collect::<Vec<_>>(), vec![1, 2]);
        assert!(store.characters_sharing_login("Nobody").await.unwrap().is_none());
    }
}
