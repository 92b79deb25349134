use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use armory_adapters::{PageSource, PaginationWalker, WalkError};
use armory_storage::{CharacterStore, StoreError, UpsertSummary};
use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::compaction::{CompactionDriver, CompactionError, CompactionSummary};

#[derive(Debug, Error)]
pub enum TickError {
    #[error(transparent)]
    Walk(#[from] WalkError),
    #[error("store write failed at st={st}: {source}")]
    Store {
        st: u32,
        #[source]
        source: StoreError,
    },
    #[error(transparent)]
    Compaction(#[from] CompactionError),
}

#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    pub st: u32,
    pub st_max: u32,
    pub upsert: UpsertSummary,
    pub dropped_rows: usize,
    pub completed: bool,
    /// Expired rows removed at traversal completion.
    pub purged: u64,
    pub compaction: Option<CompactionSummary>,
}

/// One scrape pipeline: walker step, upsert and, at traversal completion, purge plus
/// compaction.
pub struct ScrapeCycle<S> {
    walker: PaginationWalker<S>,
    store: Arc<dyn CharacterStore>,
    compaction: CompactionDriver,
}

impl<S: PageSource> ScrapeCycle<S> {
    pub fn new(
        walker: PaginationWalker<S>,
        store: Arc<dyn CharacterStore>,
        compaction: CompactionDriver,
    ) -> Self {
        Self {
            walker,
            store,
            compaction,
        }
    }

    pub fn walker(&self) -> &PaginationWalker<S> {
        &self.walker
    }

    pub async fn tick(&mut self) -> Result<TickReport, TickError> {
        let step = self.walker.step().await?;
        info!("page {} of {}", step.st, step.st_max);

        let upsert = match self.store.upsert_by_identity(&step.characters).await {
            Ok(summary) => summary,
            Err(source) => {
                // The page is lost; start the next traversal from the beginning.
                self.walker.reset();
                return Err(TickError::Store { st: step.st, source });
            }
        };

        let mut report = TickReport {
            st: step.st,
            st_max: step.st_max,
            upsert,
            dropped_rows: step.dropped_rows,
            completed: step.completed,
            purged: 0,
            compaction: None,
        };
        if !step.completed {
            return Ok(report);
        }

        report.purged = self
            .store
            .purge_expired(Utc::now())
            .await
            .map_err(|source| TickError::Store { st: step.st, source })?;
        if report.purged > 0 {
            info!(purged = report.purged, "expired characters removed");
        }
        report.compaction = Some(self.compaction.run_once().await?);
        Ok(report)
    }

    /// Ticks back to back from offset 0 until one traversal completes.
    pub async fn run_traversal(&mut self) -> Result<Vec<TickReport>, TickError> {
        self.walker.reset();
        let mut reports = Vec::new();
        loop {
            let report = self.tick().await?;
            let completed = report.completed;
            reports.push(report);
            if completed {
                return Ok(reports);
            }
        }
    }
}

/// Runs one tick per `every` until `shutdown` resolves. A tick already in progress
/// finishes before the loop exits. Returns the number of ticks run.
pub async fn run_scheduler<S, F>(cycle: &mut ScrapeCycle<S>, every: Duration, shutdown: F) -> u64
where
    S: PageSource,
    F: Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    let mut ticks = 0u64;
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!(ticks, "scheduler stopping");
                return ticks;
            }
            _ = ticker.tick() => {
                ticks += 1;
                match cycle.tick().await {
                    Ok(report) if report.completed => {
                        info!(upserted = report.upsert.inserted + report.upsert.matched, "traversal complete");
                    }
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "scrape tick failed"),
                }
            }
        }
    }
}

/// Resolves on ctrl-c, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(%err, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(%err, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use armory_adapters::{AdapterError, FetchedPage, RowExtractor};
    use armory_core::{Character, CodeCount, RetentionWindow};
    use armory_storage::{ArchiveStore, MemoryCharacterStore};
    use async_trait::async_trait;
    use chrono::DateTime;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::tempdir;

    struct Pages(HashMap<u32, String>);

    #[async_trait]
    impl PageSource for Pages {
        fn source_id(&self) -> &str {
            "pages"
        }

        async fn fetch_listing(&self, st: u32) -> Result<FetchedPage, AdapterError> {
            let body = self
                .0
                .get(&st)
                .cloned()
                .ok_or_else(|| AdapterError::Message(format!("no page at {st}")))?;
            Ok(FetchedPage {
                url: format!("pages://{st}"),
                body,
                fetched_at: Utc::now(),
            })
        }
    }

    fn page(rows: &[(u64, &str, &str)], last_page: u32) -> String {
        let rows = rows
            .iter()
            .map(|(id, name, login)| {
                format!(
                    r#"<tr class="character"><td><a href="?character={id}">{name}</a></td>
                       <td><span class="member">{login}</span></td></tr>"#
                )
            })
            .collect::<String>();
        format!(
            r#"<table class="ipb_table"><tbody>{rows}</tbody></table>
               <ul class="pages"><li class="page"><a>{last_page}</a></li></ul>"#
        )
    }

    fn two_page_listing() -> Pages {
        Pages(HashMap::from([
            (0, page(&[(1, "Arthas", "lich"), (2, "Sylvanas", "banshee")], 1)),
            (20, page(&[(3, "Kelthuzad", "lich")], 1)),
        ]))
    }

    /// Memory store whose upserts can be switched to fail.
    #[derive(Default)]
    struct SwitchableStore {
        inner: MemoryCharacterStore,
        fail_writes: AtomicBool,
    }

    #[async_trait]
    impl CharacterStore for SwitchableStore {
        async fn upsert_by_identity(&self, records: &[Character]) -> Result<UpsertSummary, StoreError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(StoreError::InvalidRow("connection reset".into()));
            }
            self.inner.upsert_by_identity(records).await
        }
        async fn read_all_sorted_by_login(&self) -> Result<Vec<Character>, StoreError> {
            self.inner.read_all_sorted_by_login().await
        }
        async fn count_distinct_logins(&self) -> Result<u64, StoreError> {
            self.inner.count_distinct_logins().await
        }
        async fn count_all(&self) -> Result<u64, StoreError> {
            self.inner.count_all().await
        }
        async fn count_by_race(&self) -> Result<Vec<CodeCount>, StoreError> {
            self.inner.count_by_race().await
        }
        async fn count_by_class(&self) -> Result<Vec<CodeCount>, StoreError> {
            self.inner.count_by_class().await
        }
        async fn characters_sharing_login(
            &self,
            name: &str,
        ) -> Result<Option<Vec<Character>>, StoreError> {
            self.inner.characters_sharing_login(name).await
        }
        async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
            self.inner.purge_expired(now).await
        }
    }

    fn cycle(
        pages: Pages,
        store: Arc<dyn CharacterStore>,
        out: &std::path::Path,
    ) -> ScrapeCycle<Pages> {
        let walker = PaginationWalker::new(
            pages,
            RowExtractor::standard(RetentionWindow::default()).unwrap(),
        );
        let driver = CompactionDriver::new(store.clone(), ArchiveStore::new(out), "IsengardArmory", 10_000);
        ScrapeCycle::new(walker, store, driver)
    }

    #[tokio::test]
    async fn compaction_runs_only_when_traversal_completes() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryCharacterStore::new());
        let mut cycle = cycle(two_page_listing(), store.clone(), dir.path());
        let archive = dir.path().join("IsengardArmory.zip");

        let first = cycle.tick().await.unwrap();
        assert_eq!((first.st, first.st_max, first.completed), (0, 20, false));
        assert_eq!(first.upsert.inserted, 2);
        assert!(first.compaction.is_none());
        assert!(!archive.exists());

        let second = cycle.tick().await.unwrap();
        assert!(second.completed);
        let compaction = second.compaction.unwrap();
        assert_eq!(compaction.manifest.character_count, 3);
        assert_eq!(compaction.manifest.account_count, 2);
        assert!(archive.exists());
        assert_eq!(cycle.walker().offset(), 0);
    }

    #[tokio::test]
    async fn store_failure_resets_the_walk() {
        let dir = tempdir().unwrap();
        let store = Arc::new(SwitchableStore::default());
        let mut cycle = cycle(two_page_listing(), store.clone(), dir.path());

        store.fail_writes.store(true, Ordering::SeqCst);
        let err = cycle.tick().await.unwrap_err();
        assert!(matches!(err, TickError::Store { st: 0, .. }));
        assert_eq!(cycle.walker().offset(), 0);

        store.fail_writes.store(false, Ordering::SeqCst);
        let report = cycle.tick().await.unwrap();
        assert_eq!(report.st, 0);
    }

    #[tokio::test]
    async fn fetch_failure_surfaces_and_restarts() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryCharacterStore::new());
        let pages = Pages(HashMap::from([(0, page(&[(1, "Arthas", "lich")], 3))]));
        let mut cycle = cycle(pages, store, dir.path());

        cycle.tick().await.unwrap();
        let err = cycle.tick().await.unwrap_err();
        assert!(matches!(err, TickError::Walk(WalkError::Fetch { st: 20, .. })));
        assert_eq!(cycle.walker().offset(), 0);
    }

    #[tokio::test]
    async fn traversal_purges_expired_rows() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryCharacterStore::new());
        let mut stale = Character {
            id: 99,
            name: "Ghost".into(),
            login: "gone".into(),
            class: 0,
            race: 0,
            guild: String::new(),
            lvl: 1,
            kills: 0,
            gs: 0,
            ap: 0,
            expire_at: Utc::now(),
        };
        stale.expire_at -= chrono::Duration::hours(1);
        store.upsert_by_identity(&[stale]).await.unwrap();

        let mut cycle = cycle(two_page_listing(), store.clone(), dir.path());
        let reports = cycle.run_traversal().await.unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[1].purged, 1);
        assert_eq!(store.raw_len().await, 3);
    }

    #[tokio::test]
    async fn scheduler_ticks_until_shutdown() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryCharacterStore::new());
        let mut cycle = cycle(two_page_listing(), store.clone(), dir.path());

        let ticks = run_scheduler(
            &mut cycle,
            Duration::from_millis(5),
            tokio::time::sleep(Duration::from_millis(200)),
        )
        .await;
        assert!(ticks >= 2);
        assert_eq!(store.count_all().await.unwrap(), 3);
        assert!(dir.path().join("IsengardArmory.zip").exists());
    }
}
