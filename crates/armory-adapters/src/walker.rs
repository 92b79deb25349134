use armory_core::{Character, PAGE_STRIDE};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::extract::RowExtractor;
use crate::{AdapterError, PageSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WalkPhase {
    /// Next fetch is offset 0; its pager determines `st_max`.
    Discovering,
    Walking,
}

#[derive(Debug, Clone)]
pub struct PageStep {
    pub st: u32,
    pub st_max: u32,
    pub characters: Vec<Character>,
    pub dropped_rows: usize,
    /// The page at `st_max` was processed and the walker wrapped back to offset 0.
    pub completed: bool,
}

#[derive(Debug, Error)]
pub enum WalkError {
    #[error("fetching listing page st={st}: {source}")]
    Fetch {
        st: u32,
        #[source]
        source: AdapterError,
    },
    #[error("parsing listing page st={st}: {source}")]
    Parse {
        st: u32,
        #[source]
        source: AdapterError,
    },
}

/// Walks listing offsets `0, 20, 40, ... st_max`, one page per [`PaginationWalker::step`].
///
/// Any fetch or parse failure resets the walk so the next step starts a fresh traversal
/// from offset 0. Nothing is retried here.
pub struct PaginationWalker<S> {
    source: S,
    extractor: RowExtractor,
    st: u32,
    st_max: u32,
    phase: WalkPhase,
}

impl<S: PageSource> PaginationWalker<S> {
    pub fn new(source: S, extractor: RowExtractor) -> Self {
        Self {
            source,
            extractor,
            st: 0,
            st_max: 0,
            phase: WalkPhase::Discovering,
        }
    }

    pub fn offset(&self) -> u32 {
        self.st
    }

    pub fn st_max(&self) -> u32 {
        self.st_max
    }

    pub fn phase(&self) -> WalkPhase {
        self.phase
    }

    pub fn reset(&mut self) {
        self.st = 0;
        self.phase = WalkPhase::Discovering;
    }

    pub async fn step(&mut self) -> Result<PageStep, WalkError> {
        let st = self.st;
        let page = match self.source.fetch_listing(st).await {
            Ok(page) => page,
            Err(source) => {
                self.reset();
                return Err(WalkError::Fetch { st, source });
            }
        };

        let parsed = match self.extractor.parse_page(&page.body, page.fetched_at) {
            Ok(parsed) => parsed,
            Err(source) => {
                self.reset();
                return Err(WalkError::Parse { st, source });
            }
        };

        // Every page carries the pager; the latest one is authoritative.
        self.st_max = parsed.st_max;
        if self.phase == WalkPhase::Discovering {
            info!(st_max = self.st_max, source = self.source.source_id(), "discovered listing size");
        }
        if !parsed.rejected.is_empty() {
            warn!(
                st,
                dropped = parsed.rejected.len(),
                first_reason = %parsed.rejected[0].reason,
                "dropped malformed listing rows"
            );
        }
        if parsed.row_count == 0 {
            warn!(st, url = %page.url, "listing page had no character rows");
        }

        let completed = st >= self.st_max;
        if completed {
            self.reset();
        } else {
            self.st = st + PAGE_STRIDE;
            self.phase = WalkPhase::Walking;
        }

        Ok(PageStep {
            st,
            st_max: self.st_max,
            dropped_rows: parsed.rejected.len(),
            characters: parsed.characters,
            completed,
        })
    }

    /// Runs a complete traversal from offset 0 and returns every extracted record.
    pub async fn walk_all(&mut self) -> Result<Vec<Character>, WalkError> {
        self.reset();
        let mut characters = Vec::new();
        loop {
            let step = self.step().await?;
            characters.extend(step.characters);
            if step.completed {
                return Ok(characters);
            }
        }
    }
}
