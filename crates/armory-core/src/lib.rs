//! Core domain model for the armory scraper: characters, identities and icon code tables.

use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "armory-core";

/// Offset stride of the remote listing; one page holds this many rows.
pub const PAGE_STRIDE: u32 = 20;

pub const DEFAULT_RETENTION_HOURS: u32 = 20;

/// One scraped game character.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Character {
    pub id: u64,
    pub name: String,
    pub login: String,
    pub class: u8,
    pub race: u8,
    pub guild: String,
    pub lvl: u32,
    pub kills: u32,
    pub gs: u32,
    pub ap: u32,
    #[serde(rename = "expireAt")]
    pub expire_at: DateTime<Utc>,
}

impl Character {
    /// Numeric id when the detail link carried one, the display name otherwise.
    pub fn identity(&self) -> CharacterIdentity {
        if self.id != 0 {
            CharacterIdentity::Id(self.id)
        } else {
            CharacterIdentity::Name(self.name.clone())
        }
    }
}

/// Key a character is upserted under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CharacterIdentity {
    Id(u64),
    Name(String),
}

impl CharacterIdentity {
    /// Stable textual key; the prefix keeps numeric and name keys from colliding.
    pub fn storage_key(&self) -> String {
        match self {
            Self::Id(id) => format!("id:{id}"),
            Self::Name(name) => format!("name:{name}"),
        }
    }
}

impl fmt::Display for CharacterIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_key())
    }
}

/// Time-to-live applied to every scraped record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionWindow(Duration);

impl RetentionWindow {
    /// Zero hours falls back to the default window so expiries stay in the future.
    pub fn hours(hours: u32) -> Self {
        let hours = if hours == 0 { DEFAULT_RETENTION_HOURS } else { hours };
        Self(Duration::hours(i64::from(hours)))
    }

    pub fn duration(&self) -> Duration {
        self.0
    }

    pub fn expiry_for(&self, scraped_at: DateTime<Utc>) -> DateTime<Utc> {
        scraped_at + self.0
    }
}

impl Default for RetentionWindow {
    fn default() -> Self {
        Self::hours(DEFAULT_RETENTION_HOURS)
    }
}

/// Aggregate row for grouped counts (race or class code).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeCount {
    pub id: u8,
    pub count: u64,
}

/// Orders grouped counts descending by count, ties by code.
pub fn sort_code_counts(rows: &mut [CodeCount]) {
    rows.sort_by(|a, b| b.count.cmp(&a.count).then(a.id.cmp(&b.id)));
}

/// Icon filename → small integer code. Unknown filenames resolve to 0.
#[derive(Debug, Clone)]
pub struct IconCodeTable {
    kind: &'static str,
    codes: HashMap<&'static str, u8>,
}

impl IconCodeTable {
    pub fn from_pairs(kind: &'static str, pairs: &[(&'static str, u8)]) -> Self {
        Self {
            kind,
            codes: pairs.iter().copied().collect(),
        }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    /// Resolves an `img` `src` (path or URL) by its basename.
    pub fn resolve(&self, src: &str) -> u8 {
        self.lookup(icon_basename(src)).unwrap_or(0)
    }

    pub fn lookup(&self, file_name: &str) -> Option<u8> {
        self.codes.get(file_name).copied()
    }
}

fn icon_basename(src: &str) -> &str {
    let path = src.split(['?', '#']).next().unwrap_or_default();
    path.trim_end_matches('/').rsplit('/').next().unwrap_or_default()
}

const CLASS_ICONS: &[(&str, u8)] = &[
    ("3.png", 0),
    ("9.png", 1),
    ("5.png", 2),
    ("2.png", 3),
    ("8.png", 4),
    ("4.png", 5),
    ("11.png", 6),
    ("7.png", 7),
    ("1.png", 8),
    ("6.png", 9),
];

// Race icons come in two gender variants (`-0`, `-1`) sharing one code.
const RACE_ICONS: &[(&str, u8)] = &[
    ("1-0.png", 0),
    ("1-1.png", 0),
    ("3-0.png", 1),
    ("3-1.png", 1),
    ("4-0.png", 2),
    ("4-1.png", 2),
    ("7-0.png", 3),
    ("7-1.png", 3),
    ("11-0.png", 4),
    ("11-1.png", 4),
    ("2-0.png", 5),
    ("2-1.png", 5),
    ("5-0.png", 6),
    ("5-1.png", 6),
    ("6-0.png", 7),
    ("6-1.png", 7),
    ("8-0.png", 8),
    ("8-1.png", 8),
    ("10-0.png", 9),
    ("10-1.png", 9),
];

#[derive(Debug, Clone)]
pub struct IconTables {
    pub class: IconCodeTable,
    pub race: IconCodeTable,
}

static STANDARD_ICON_TABLES: LazyLock<IconTables> = LazyLock::new(|| IconTables {
    class: IconCodeTable::from_pairs("class", CLASS_ICONS),
    race: IconCodeTable::from_pairs("race", RACE_ICONS),
});

impl IconTables {
    /// The armory's class/race icon tables, built once per process.
    pub fn standard() -> &'static IconTables {
        &STANDARD_ICON_TABLES
    }
}

/// Removes every Unicode whitespace character.
pub fn strip_whitespace(text: &str) -> String {
    text.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Base-10 stat parse over whitespace-stripped text; anything unparseable is 0.
pub fn parse_stat(text: &str) -> u32 {
    strip_whitespace(text).parse().unwrap_or(0)
}
