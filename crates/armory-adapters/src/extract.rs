//! Row extraction for the armory character listing.
//!
//! The listing has shipped two row layouts over time. Each record field is described by an
//! ordered list of [`StrategySpec`]s; the first one yielding a non-empty value wins, and a
//! field with no hit degrades to its empty/zero value. Only a row without any table cell is
//! rejected outright.

use std::collections::HashMap;

use armory_core::{parse_stat, Character, IconTables, RetentionWindow, PAGE_STRIDE};
use chrono::{DateTime, Utc};
use scraper::{ElementRef, Html, Selector};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::AdapterError;

pub const ROW_SELECTOR: &str = "table.ipb_table > tbody > tr.character";
pub const PAGER_SELECTOR: &str = "ul.pages > li.page";

// Detail links are usually relative; any absolute base works for query extraction.
const LINK_BASE: &str = "https://armory.invalid/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RowField {
    IdLink,
    Name,
    Login,
    ClassIcon,
    RaceIcon,
    Guild,
    Level,
    Kills,
    GearScore,
    ArenaPoints,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    /// All descendant text.
    Text,
    /// Direct child text nodes only.
    OwnText,
    /// Descendant text of every match of the selector, concatenated. Ignores `nth`.
    JoinedText,
    Attr(&'static str),
}

#[derive(Debug, Clone, Copy)]
pub struct StrategySpec {
    pub selector: &'static str,
    /// Which match of `selector` inside the row to read.
    pub nth: usize,
    pub source: ValueSource,
}

const fn text(selector: &'static str) -> StrategySpec {
    StrategySpec {
        selector,
        nth: 0,
        source: ValueSource::Text,
    }
}

const fn nth_text(selector: &'static str, nth: usize) -> StrategySpec {
    StrategySpec {
        selector,
        nth,
        source: ValueSource::Text,
    }
}

const fn joined_text(selector: &'static str) -> StrategySpec {
    StrategySpec {
        selector,
        nth: 0,
        source: ValueSource::JoinedText,
    }
}

const fn attr(selector: &'static str, name: &'static str) -> StrategySpec {
    StrategySpec {
        selector,
        nth: 0,
        source: ValueSource::Attr(name),
    }
}

pub type RowLayout = &'static [(RowField, &'static [StrategySpec])];

/// Current layout first, older layout second, per field.
pub const ARMORY_ROW_LAYOUT: RowLayout = &[
    (
        RowField::IdLink,
        &[
            attr("td > span.character-name > span > a", "href"),
            attr("td > a", "href"),
        ],
    ),
    (
        RowField::Name,
        &[
            text("td > span.character-name > span > a"),
            joined_text("td:first-of-type a"),
        ],
    ),
    (
        RowField::Login,
        &[
            text("td > span.member > a > span"),
            StrategySpec {
                selector: "span.member",
                nth: 0,
                source: ValueSource::OwnText,
            },
        ],
    ),
    (
        RowField::ClassIcon,
        &[attr("td > span.character-icons > img.character-class", "src")],
    ),
    (
        RowField::RaceIcon,
        &[attr("td > span.character-icons > img.character-race", "src")],
    ),
    (
        RowField::Guild,
        &[text("td > span.character-name > span.desc > span > a")],
    ),
    (RowField::Level, &[nth_text("td.short", 0)]),
    (RowField::Kills, &[nth_text("td.short", 1)]),
    (RowField::GearScore, &[text("td.short > span.gearscore > span")]),
    (RowField::ArenaPoints, &[nth_text("td.short", 4)]),
];

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum RowRejection {
    #[error("row has no table cells")]
    NoCells,
}

#[derive(Debug)]
struct CompiledStrategy {
    selector: Selector,
    nth: usize,
    source: ValueSource,
}

impl CompiledStrategy {
    fn read(&self, row: ElementRef<'_>) -> Option<String> {
        if self.source == ValueSource::JoinedText {
            let joined = row
                .select(&self.selector)
                .flat_map(|element| element.text())
                .collect::<String>();
            return text_or_none(joined);
        }
        let element = row.select(&self.selector).nth(self.nth)?;
        let raw = match self.source {
            ValueSource::Text => element.text().collect::<String>(),
            ValueSource::OwnText => element
                .children()
                .filter_map(|node| node.value().as_text().map(|t| &**t))
                .collect::<String>(),
            ValueSource::Attr(name) => element.value().attr(name)?.to_string(),
            ValueSource::JoinedText => return None,
        };
        text_or_none(raw)
    }
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector)
        .map_err(|e| AdapterError::Selector(format!("{selector}: {e}")))
}

/// Turns listing rows into [`Character`] records.
#[derive(Debug)]
pub struct RowExtractor {
    strategies: HashMap<RowField, Vec<CompiledStrategy>>,
    cell: Selector,
    tables: &'static IconTables,
    retention: RetentionWindow,
    link_base: Url,
}

impl RowExtractor {
    pub fn standard(retention: RetentionWindow) -> Result<Self, AdapterError> {
        Self::with_layout(ARMORY_ROW_LAYOUT, IconTables::standard(), retention)
    }

    pub fn with_layout(
        layout: RowLayout,
        tables: &'static IconTables,
        retention: RetentionWindow,
    ) -> Result<Self, AdapterError> {
        let mut strategies = HashMap::new();
        for (field, specs) in layout {
            let compiled = specs
                .iter()
                .map(|spec| {
                    Ok(CompiledStrategy {
                        selector: parse_selector(spec.selector)?,
                        nth: spec.nth,
                        source: spec.source,
                    })
                })
                .collect::<Result<Vec<_>, AdapterError>>()?;
            strategies.insert(*field, compiled);
        }
        let link_base =
            Url::parse(LINK_BASE).map_err(|e| AdapterError::Message(e.to_string()))?;
        Ok(Self {
            strategies,
            cell: parse_selector("td")?,
            tables,
            retention,
            link_base,
        })
    }

    fn first_hit(&self, row: ElementRef<'_>, field: RowField) -> Option<String> {
        self.strategies
            .get(&field)?
            .iter()
            .find_map(|strategy| strategy.read(row))
    }

    fn string_field(&self, row: ElementRef<'_>, field: RowField) -> String {
        self.first_hit(row, field).unwrap_or_default()
    }

    fn stat_field(&self, row: ElementRef<'_>, field: RowField) -> u32 {
        self.first_hit(row, field)
            .map(|raw| parse_stat(&raw))
            .unwrap_or(0)
    }

    /// First strategy whose link carries a positive `character` id that fits a signed
    /// 64-bit column. Anything else falls back to name identity.
    fn character_id(&self, row: ElementRef<'_>) -> u64 {
        let Some(strategies) = self.strategies.get(&RowField::IdLink) else {
            return 0;
        };
        strategies
            .iter()
            .filter_map(|strategy| strategy.read(row))
            .find_map(|href| self.id_from_href(&href))
            .unwrap_or(0)
    }

    fn id_from_href(&self, href: &str) -> Option<u64> {
        let url = self.link_base.join(href).ok()?;
        let (_, value) = url.query_pairs().find(|(key, _)| key == "character")?;
        let id = value.trim().parse::<i64>().ok().filter(|id| *id > 0)?;
        u64::try_from(id).ok()
    }

    pub fn extract(
        &self,
        row: ElementRef<'_>,
        scraped_at: DateTime<Utc>,
    ) -> Result<Character, RowRejection> {
        if row.select(&self.cell).next().is_none() {
            return Err(RowRejection::NoCells);
        }

        let class_src = self.string_field(row, RowField::ClassIcon);
        let race_src = self.string_field(row, RowField::RaceIcon);

        Ok(Character {
            id: self.character_id(row),
            name: self.string_field(row, RowField::Name),
            login: self.string_field(row, RowField::Login),
            class: self.tables.class.resolve(&class_src),
            race: self.tables.race.resolve(&race_src),
            guild: self.string_field(row, RowField::Guild),
            lvl: self.stat_field(row, RowField::Level),
            kills: self.stat_field(row, RowField::Kills),
            gs: self.stat_field(row, RowField::GearScore),
            ap: self.stat_field(row, RowField::ArenaPoints),
            expire_at: self.retention.expiry_for(scraped_at),
        })
    }

    /// Extracts every listing row of a page and reads its pager.
    pub fn parse_page(
        &self,
        html: &str,
        scraped_at: DateTime<Utc>,
    ) -> Result<ParsedPage, AdapterError> {
        let document = Html::parse_document(html);
        let rows = parse_selector(ROW_SELECTOR)?;

        let mut page = ParsedPage {
            st_max: parse_st_max(&document)?,
            ..ParsedPage::default()
        };
        for (index, row) in document.select(&rows).enumerate() {
            page.row_count += 1;
            match self.extract(row, scraped_at) {
                Ok(character) => page.characters.push(character),
                Err(reason) => {
                    debug!(row = index, %reason, "dropping listing row");
                    page.rejected.push(RejectedRow { index, reason });
                }
            }
        }
        Ok(page)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectedRow {
    pub index: usize,
    pub reason: RowRejection,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedPage {
    pub characters: Vec<Character>,
    pub rejected: Vec<RejectedRow>,
    pub row_count: usize,
    pub st_max: u32,
}

/// Highest listing offset advertised by the pager; 0 when the page has no pager.
pub fn parse_st_max(document: &Html) -> Result<u32, AdapterError> {
    let pages = parse_selector(PAGER_SELECTOR)?;
    let link = parse_selector("a")?;

    let Some(last) = document.select(&pages).last() else {
        return Ok(0);
    };
    let label = if last.value().classes().any(|c| c == "active") {
        last.text().collect::<String>()
    } else {
        last.select(&link)
            .next()
            .map(|a| a.text().collect::<String>())
            .unwrap_or_default()
    };
    Ok(parse_stat(&label).saturating_mul(PAGE_STRIDE))
}
