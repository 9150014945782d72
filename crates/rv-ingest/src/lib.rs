//! Background coordinator.
//!
//! Owns the write side of the history store: the first-run backfill, live
//! visit upserts, and the messages that tell page contexts to re-highlight.
//! Listener entry points (`on_*`) never return errors; failures are logged
//! and the triggering event is dropped.

mod history;

pub use history::HistoryItem;
pub use history::HistoryQuery;
pub use history::HistorySearch;
pub use history::RecordedHistory;

use rv_core::Clock;
use rv_core::DAY_MILLIS;
use rv_core::RevisitError;
use rv_core::RevisitResult;
use rv_core::SystemClock;
use rv_history::DEFAULT_MAX_RECORDS;
use rv_history::HistorySnapshot;
use rv_history::HistoryStore;
use rv_history::VisitRecord;
use rv_ipc::ExtensionMessage;
use rv_ipc::PreloadedEngine;
use rv_ipc::ScriptInjector;
use rv_ipc::TabInfo;
use rv_ipc::TabMessenger;
use rv_storage::ExtensionStorage;
use std::sync::Arc;
use tracing::debug;
use tracing::info;
use tracing::warn;

pub const DEFAULT_WINDOW_MILLIS: i64 = 7 * DAY_MILLIS;
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Tab URLs the engine can never run in.
const RESTRICTED_URL_PREFIXES: [&str; 2] = ["chrome://", "file://"];

/// Backfill pagination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackfillConfig {
    pub window_millis: i64,
    pub page_size: usize,
    /// Collection stops once this many raw entries are accumulated.
    pub max_accumulated: usize,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            window_millis: DEFAULT_WINDOW_MILLIS,
            page_size: DEFAULT_PAGE_SIZE,
            max_accumulated: DEFAULT_MAX_RECORDS,
        }
    }
}

impl BackfillConfig {
    pub fn validate(&self) -> RevisitResult<()> {
        if self.window_millis <= 0 {
            return Err(RevisitError::new(
                "ingest.config_invalid",
                "backfill window must be positive",
            ));
        }
        if self.page_size == 0 || self.max_accumulated == 0 {
            return Err(RevisitError::new(
                "ingest.config_invalid",
                "backfill page size and accumulation cap must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Summary of one backfill run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillReport {
    /// Raw entries returned by the history provider.
    pub fetched: usize,
    /// Entries that normalized into records.
    pub accepted: usize,
    /// Records in the saved snapshot.
    pub stored: usize,
    /// Serialized size of the saved snapshot.
    pub bytes: usize,
}

pub struct Background {
    storage: ExtensionStorage,
    store: HistoryStore,
    config: BackfillConfig,
    history: Arc<dyn HistoryQuery>,
    tabs: Arc<dyn TabMessenger>,
    injector: Arc<dyn ScriptInjector>,
    clock: Arc<dyn Clock>,
}

impl Background {
    pub fn new(
        storage: ExtensionStorage,
        history: Arc<dyn HistoryQuery>,
        tabs: Arc<dyn TabMessenger>,
    ) -> Self {
        Self {
            storage,
            store: HistoryStore::default(),
            config: BackfillConfig::default(),
            history,
            tabs,
            injector: Arc::new(PreloadedEngine),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_store(mut self, store: HistoryStore) -> Self {
        self.store = store;
        self
    }

    pub fn with_backfill_config(mut self, config: BackfillConfig) -> RevisitResult<Self> {
        config.validate()?;
        self.config = config;
        Ok(self)
    }

    pub fn with_injector(mut self, injector: Arc<dyn ScriptInjector>) -> Self {
        self.injector = injector;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn storage(&self) -> &ExtensionStorage {
        &self.storage
    }

    /// Install/update hook. Backfills once per profile, guarded by the
    /// persisted `initialized` flag.
    pub fn on_installed(&self) -> Option<BackfillReport> {
        match self.install() {
            Ok(report) => report,
            Err(error) => {
                warn!(%error, "install hook failed");
                None
            }
        }
    }

    /// Runs the backfill unless already initialized. The flag is only set
    /// after a successful backfill.
    pub fn install(&self) -> RevisitResult<Option<BackfillReport>> {
        if self.storage.is_initialized()? {
            debug!("history already initialized; skipping backfill");
            return Ok(None);
        }

        let report = self.backfill()?;
        self.storage.mark_initialized()?;
        Ok(Some(report))
    }

    /// Walks history backward window by window, newest first.
    ///
    /// Stops at the first empty window, at the first failed query, or once
    /// the accumulation cap is reached.
    pub fn collect_history(&self) -> Vec<HistoryItem> {
        let mut collected: Vec<HistoryItem> = Vec::new();
        let mut end_time = self.clock.now_millis();

        loop {
            let query = HistorySearch {
                text: String::new(),
                start_time: end_time.saturating_sub(self.config.window_millis),
                end_time,
                max_results: self.config.page_size,
            };

            let page = match self.history.search(&query) {
                Ok(page) => page,
                Err(error) => {
                    warn!(%error, end_time, "history query failed; ending backfill collection");
                    break;
                }
            };

            let Some(oldest) = page.last() else {
                break;
            };
            end_time = oldest.last_visit_time.saturating_sub(1);

            debug!(
                returned = page.len(),
                start_time = query.start_time,
                end_time = query.end_time,
                "history window"
            );
            collected.extend(page);
            if collected.len() >= self.config.max_accumulated {
                break;
            }
        }

        collected
    }

    /// Collects history and merges it into the stored snapshot.
    pub fn backfill(&self) -> RevisitResult<BackfillReport> {
        let items = self.collect_history();
        let fetched = items.len();

        let mut records: Vec<VisitRecord> = items
            .iter()
            .filter_map(|item| match VisitRecord::from_visit(&item.url, item.last_visit_time) {
                Ok(record) => Some(record),
                Err(error) => {
                    debug!(url = %item.url, %error, "dropping history entry");
                    None
                }
            })
            .collect();
        records.reverse();
        let accepted = records.len();

        let existing = self.storage.history_or_empty()?;
        let snapshot = self
            .store
            .upsert_many(existing, records, self.clock.now_millis())?;
        self.storage.save_history(&snapshot)?;

        let report = BackfillReport {
            fetched,
            accepted,
            stored: snapshot.len(),
            bytes: snapshot.serialized_len()?,
        };
        info!(
            fetched = report.fetched,
            accepted = report.accepted,
            stored = report.stored,
            bytes = report.bytes,
            "history backfill complete"
        );
        Ok(report)
    }

    /// Live visit listener. At most once: a failed upsert is dropped.
    pub fn on_visited(&self, url: &str, last_visit_time: i64) -> Option<HistorySnapshot> {
        match self.record_visit(url, last_visit_time) {
            Ok(snapshot) => {
                self.notify_active_tab();
                Some(snapshot)
            }
            Err(error) if error.is_family("url") => {
                debug!(url, %error, "dropping visit with malformed url");
                None
            }
            Err(error) => {
                warn!(url, %error, "dropping visit");
                None
            }
        }
    }

    /// Upserts one visit into the stored snapshot and saves it.
    pub fn record_visit(&self, url: &str, last_visit_time: i64) -> RevisitResult<HistorySnapshot> {
        let record = VisitRecord::from_visit(url, last_visit_time)?;
        let existing = self.storage.history_or_empty()?;
        let snapshot = self.store.upsert_one(existing, record);
        self.storage.save_history(&snapshot)?;
        Ok(snapshot)
    }

    /// Asks the active tab's engine to recompute, if the tab can run it.
    pub fn notify_active_tab(&self) -> bool {
        match self.try_notify_active_tab() {
            Ok(notified) => notified,
            Err(error) => {
                warn!(%error, "could not notify active tab");
                false
            }
        }
    }

    fn try_notify_active_tab(&self) -> RevisitResult<bool> {
        let Some(tab) = self.tabs.active_tab()? else {
            return Ok(false);
        };
        if !is_scriptable(&tab) {
            debug!(tab = tab.id, url = ?tab.url, "active tab is not scriptable");
            return Ok(false);
        }

        self.injector.ensure_injected(tab.id)?;
        self.tabs
            .send_to_tab(tab.id, &ExtensionMessage::UpdateHighlight)?;
        Ok(true)
    }

    /// Runtime message listener.
    pub fn on_message(&self, message: ExtensionMessage) {
        match message {
            ExtensionMessage::UpdateSettings => {
                self.broadcast_update();
            }
            ExtensionMessage::ReloadHistory => match self.backfill() {
                Ok(_) => {
                    if let Err(error) = self.tabs.send_runtime(&ExtensionMessage::ReloadDone) {
                        warn!(%error, "could not acknowledge history reload");
                    }
                }
                Err(error) => warn!(%error, "history reload failed"),
            },
            ExtensionMessage::UpdateHighlight | ExtensionMessage::ReloadDone => {
                debug!(action = message.action(), "ignoring message");
            }
        }
    }

    /// Sends `updateHighlight` to every open tab. Returns how many received it.
    pub fn broadcast_update(&self) -> usize {
        let tabs = match self.tabs.query_tabs() {
            Ok(tabs) => tabs,
            Err(error) => {
                warn!(%error, "could not list tabs");
                return 0;
            }
        };

        let mut delivered = 0_usize;
        for tab in tabs {
            match self
                .tabs
                .send_to_tab(tab.id, &ExtensionMessage::UpdateHighlight)
            {
                Ok(()) => delivered += 1,
                Err(error) => debug!(tab = tab.id, %error, "tab did not take update"),
            }
        }
        delivered
    }
}

fn is_scriptable(tab: &TabInfo) -> bool {
    tab.url.as_deref().is_some_and(|url| {
        !RESTRICTED_URL_PREFIXES
            .iter()
            .any(|prefix| url.starts_with(prefix))
    })
}
