use armory_core::{Character, CodeCount};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::{info, warn};

use crate::store::{dedupe_by_identity, CharacterStore, StoreError, UpsertSummary};

const CHARACTER_COLUMNS: &str =
    "id, name, login, class, race, guild, lvl, kills, gs, ap, expire_at";

/// Postgres-backed store. Expiry is enforced at read time and by `purge_expired`.
#[derive(Debug, Clone)]
pub struct PgCharacterStore {
    pool: PgPool,
}

impl PgCharacterStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("character schema is up to date");
        Ok(())
    }

    async fn count_grouped(&self, column: &str) -> Result<Vec<CodeCount>, StoreError> {
        let sql = format!(
            r#"
            SELECT {column} AS code, COUNT(*) AS count
              FROM characters
             WHERE expire_at > NOW()
             GROUP BY {column}
             ORDER BY count DESC, code ASC
            "#
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let code: i16 = row.try_get("code")?;
            let count: i64 = row.try_get("count")?;
            out.push(CodeCount {
                id: narrow(code, "code")?,
                count: narrow(count, "count")?,
            });
        }
        Ok(out)
    }
}

fn narrow<S, T>(value: S, column: &str) -> Result<T, StoreError>
where
    S: Copy + std::fmt::Display,
    T: TryFrom<S>,
{
    T::try_from(value)
        .map_err(|_| StoreError::InvalidRow(format!("{column}={value} out of range")))
}

/// The `id` column is BIGINT; larger ids cannot be stored faithfully.
fn storable_id(id: u64) -> Option<i64> {
    i64::try_from(id).ok()
}

/// Decodes every row, logging and skipping any that no longer fit the model so one bad
/// row cannot fail a whole read.
fn decode_rows(rows: &[PgRow]) -> Vec<Character> {
    rows.iter()
        .filter_map(|row| match character_from_row(row) {
            Ok(character) => Some(character),
            Err(err) => {
                warn!(%err, "skipping undecodable character row");
                None
            }
        })
        .collect()
}

fn character_from_row(row: &PgRow) -> Result<Character, StoreError> {
    Ok(Character {
        id: narrow(row.try_get::<i64, _>("id")?, "id")?,
        name: row.try_get("name")?,
        login: row.try_get("login")?,
        class: narrow(row.try_get::<i16, _>("class")?, "class")?,
        race: narrow(row.try_get::<i16, _>("race")?, "race")?,
        guild: row.try_get("guild")?,
        lvl: narrow(row.try_get::<i64, _>("lvl")?, "lvl")?,
        kills: narrow(row.try_get::<i64, _>("kills")?, "kills")?,
        gs: narrow(row.try_get::<i64, _>("gs")?, "gs")?,
        ap: narrow(row.try_get::<i64, _>("ap")?, "ap")?,
        expire_at: row.try_get("expire_at")?,
    })
}

#[async_trait]
impl CharacterStore for PgCharacterStore {
    async fn upsert_by_identity(&self, records: &[Character]) -> Result<UpsertSummary, StoreError> {
        if records.is_empty() {
            return Ok(UpsertSummary::default());
        }
        let batch = dedupe_by_identity(records)
            .into_iter()
            .filter(|c| {
                let fits = storable_id(c.id).is_some();
                if !fits {
                    warn!(id = c.id, name = %c.name, "dropping character with out-of-range id");
                }
                fits
            })
            .collect::<Vec<_>>();
        if batch.is_empty() {
            return Ok(UpsertSummary::default());
        }

        let identities: Vec<String> = batch.iter().map(|c| c.identity().storage_key()).collect();
        let ids: Vec<i64> = batch.iter().filter_map(|c| storable_id(c.id)).collect();
        let names: Vec<String> = batch.iter().map(|c| c.name.clone()).collect();
        let logins: Vec<String> = batch.iter().map(|c| c.login.clone()).collect();
        let classes: Vec<i16> = batch.iter().map(|c| i16::from(c.class)).collect();
        let races: Vec<i16> = batch.iter().map(|c| i16::from(c.race)).collect();
        let guilds: Vec<String> = batch.iter().map(|c| c.guild.clone()).collect();
        let lvls: Vec<i64> = batch.iter().map(|c| i64::from(c.lvl)).collect();
        let kills: Vec<i64> = batch.iter().map(|c| i64::from(c.kills)).collect();
        let gear: Vec<i64> = batch.iter().map(|c| i64::from(c.gs)).collect();
        let aps: Vec<i64> = batch.iter().map(|c| i64::from(c.ap)).collect();
        let expiries: Vec<DateTime<Utc>> = batch.iter().map(|c| c.expire_at).collect();

        let rows = sqlx::query(
            r#"
            WITH input AS (
                SELECT UNNEST($1::text[])         AS identity,
                       UNNEST($2::int8[])         AS id,
                       UNNEST($3::text[])         AS name,
                       UNNEST($4::text[])         AS login,
                       UNNEST($5::int2[])         AS class,
                       UNNEST($6::int2[])         AS race,
                       UNNEST($7::text[])         AS guild,
                       UNNEST($8::int8[])         AS lvl,
                       UNNEST($9::int8[])         AS kills,
                       UNNEST($10::int8[])        AS gs,
                       UNNEST($11::int8[])        AS ap,
                       UNNEST($12::timestamptz[]) AS expire_at
            )
            INSERT INTO characters AS c
                   (identity, id, name, login, class, race, guild, lvl, kills, gs, ap, expire_at)
            SELECT identity, id, name, login, class, race, guild, lvl, kills, gs, ap, expire_at
              FROM input
            ON CONFLICT (identity) DO UPDATE
            SET id = EXCLUDED.id,
                name = EXCLUDED.name,
                login = EXCLUDED.login,
                class = EXCLUDED.class,
                race = EXCLUDED.race,
                guild = EXCLUDED.guild,
                lvl = EXCLUDED.lvl,
                kills = EXCLUDED.kills,
                gs = EXCLUDED.gs,
                ap = EXCLUDED.ap,
                expire_at = GREATEST(EXCLUDED.expire_at, c.expire_at + INTERVAL '1 microsecond'),
                updated_at = NOW()
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(&identities)
        .bind(&ids)
        .bind(&names)
        .bind(&logins)
        .bind(&classes)
        .bind(&races)
        .bind(&guilds)
        .bind(&lvls)
        .bind(&kills)
        .bind(&gear)
        .bind(&aps)
        .bind(&expiries)
        .fetch_all(&self.pool)
        .await?;

        let mut summary = UpsertSummary::default();
        for row in rows {
            if row.try_get::<bool, _>("inserted")? {
                summary.inserted += 1;
            } else {
                summary.matched += 1;
                summary.modified += 1;
            }
        }
        Ok(summary)
    }

    async fn read_all_sorted_by_login(&self) -> Result<Vec<Character>, StoreError> {
        let sql = format!(
            r#"
            SELECT {CHARACTER_COLUMNS}
              FROM characters
             WHERE expire_at > NOW()
             ORDER BY login COLLATE "C", identity COLLATE "C"
            "#
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        Ok(decode_rows(&rows))
    }

    async fn count_distinct_logins(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(DISTINCT login) FROM characters WHERE expire_at > NOW()",
        )
        .fetch_one(&self.pool)
        .await?;
        narrow(count, "count")
    }

    async fn count_all(&self) -> Result<u64, StoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM characters WHERE expire_at > NOW()")
                .fetch_one(&self.pool)
                .await?;
        narrow(count, "count")
    }

    async fn count_by_race(&self) -> Result<Vec<CodeCount>, StoreError> {
        self.count_grouped("race").await
    }

    async fn count_by_class(&self) -> Result<Vec<CodeCount>, StoreError> {
        self.count_grouped("class").await
    }

    async fn characters_sharing_login(
        &self,
        name: &str,
    ) -> Result<Option<Vec<Character>>, StoreError> {
        let login: Option<String> = sqlx::query_scalar(
            "SELECT login FROM characters WHERE name = $1 AND expire_at > NOW() LIMIT 1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        let Some(login) = login else {
            return Ok(None);
        };

        let sql = format!(
            r#"
            SELECT {CHARACTER_COLUMNS}
              FROM characters
             WHERE login = $1
               AND expire_at > NOW()
             ORDER BY name COLLATE "C"
            "#
        );
        let rows = sqlx::query(&sql).bind(&login).fetch_all(&self.pool).await?;
        Ok(Some(decode_rows(&rows)))
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM characters WHERE expire_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_beyond_bigint_are_not_storable() {
        assert_eq!(storable_id(0), Some(0));
        assert_eq!(storable_id(i64::MAX as u64), Some(i64::MAX));
        assert_eq!(storable_id(9_300_000_000_000_000_000), None);
        assert_eq!(storable_id(u64::MAX), None);
    }

    #[test]
    fn narrowing_rejects_negative_stored_values() {
        assert!(matches!(
            narrow::<i64, u64>(-1, "id"),
            Err(StoreError::InvalidRow(msg)) if msg == "id=-1 out of range"
        ));
        assert_eq!(narrow::<i64, u64>(42, "id").unwrap(), 42);
    }
}
