//! Subcommand handlers. Each one plays the part of a browser event against
//! file-backed extension storage.

use crate::cli::CliOptions;
use crate::cli::Command;
use rv_core::Clock;
use rv_core::RevisitError;
use rv_core::RevisitResult;
use rv_core::SystemClock;
use rv_dom::Document;
use rv_highlight::PageContext;
use rv_html::HtmlParser;
use rv_ingest::Background;
use rv_ingest::BackfillReport;
use rv_ingest::RecordedHistory;
use rv_ipc::ChannelConfig;
use rv_ipc::ChannelTabMessenger;
use rv_ipc::ContextRole;
use rv_ipc::ExtensionMessage;
use rv_ipc::LocalEndpoint;
use rv_ipc::TabInfo;
use rv_ipc::local_channel_pair;
use rv_settings::HighlightSettings;
use rv_settings::parse_blacklist;
use rv_storage::ExtensionStorage;
use rv_storage::FileStorage;
use rv_storage::StorageConfig;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use tracing::info;

const PAGE_TAB_ID: u64 = 1;
const FRAME_INTERVAL: Duration = Duration::from_millis(16);

pub fn run(options: &CliOptions) -> RevisitResult<()> {
    let storage = open_storage(&options.storage_root())?;

    match &options.command {
        Command::Install { history } => match install(&storage, history)? {
            Some(report) => print_report(&report),
            None => println!("already initialized; nothing to do"),
        },
        Command::Reload { history } => {
            reload(&storage, history)?;
            println!("history reloaded");
        }
        Command::Visit { url, time } => {
            let time = time.unwrap_or_else(|| SystemClock.now_millis());
            let stored = visit(&storage, url, time)?;
            println!("stored {stored} records");
        }
        Command::Settings {
            enabled,
            color,
            aggressive,
            blacklist,
        } => {
            let changes = SettingsChanges {
                enabled: *enabled,
                color: color.clone(),
                aggressive: *aggressive,
                blacklist: blacklist.clone(),
            };
            let settings = update_settings(&storage, changes)?;
            println!("enabled:    {}", settings.highlight_enabled);
            println!("color:      {}", settings.highlight_color);
            println!("aggressive: {}", settings.overdrive_enabled);
            println!("blacklist:  {}", settings.blacklist_display());
        }
        Command::Highlight { page, url, visits } => {
            let markup = read_file(page)?;
            for href in highlight(&storage, &markup, url, visits)? {
                println!("{href}");
            }
        }
        Command::Stats => {
            let stats = stats(&storage)?;
            println!("initialized: {}", stats.initialized);
            println!("records:     {}", stats.records);
            println!("bytes:       {}", stats.bytes);
        }
    }

    Ok(())
}

fn open_storage(root: &Path) -> RevisitResult<ExtensionStorage> {
    fs::create_dir_all(root).map_err(|error| {
        RevisitError::new(
            "app.storage_root_unavailable",
            format!("failed to create storage root `{}`: {error}", root.display()),
        )
    })?;

    let area =
        FileStorage::new(StorageConfig::default()).with_persistent_root(root.to_path_buf());
    Ok(ExtensionStorage::new(Arc::new(area)))
}

fn read_file(path: &Path) -> RevisitResult<String> {
    fs::read_to_string(path).map_err(|error| {
        RevisitError::new(
            "app.read_failed",
            format!("failed to read `{}`: {error}", path.display()),
        )
    })
}

fn background_with(
    storage: &ExtensionStorage,
    history: RecordedHistory,
    tabs: Arc<ChannelTabMessenger>,
) -> Background {
    Background::new(storage.clone(), Arc::new(history), tabs)
}

fn install(storage: &ExtensionStorage, history: &Path) -> RevisitResult<Option<BackfillReport>> {
    let history = RecordedHistory::from_json(&read_file(history)?)?;
    background_with(storage, history, Arc::new(ChannelTabMessenger::new())).install()
}

fn reload(storage: &ExtensionStorage, history: &Path) -> RevisitResult<()> {
    let history = RecordedHistory::from_json(&read_file(history)?)?;
    let tabs = Arc::new(ChannelTabMessenger::new());
    background_with(storage, history, tabs.clone())
        .on_message(ExtensionMessage::ReloadHistory);

    if tabs.drain_runtime()?.contains(&ExtensionMessage::ReloadDone) {
        Ok(())
    } else {
        Err(RevisitError::new(
            "app.reload_failed",
            "history reload did not complete; see log for details",
        ))
    }
}

fn visit(storage: &ExtensionStorage, url: &str, time: i64) -> RevisitResult<usize> {
    let background = background_with(
        storage,
        RecordedHistory::default(),
        Arc::new(ChannelTabMessenger::new()),
    );
    let snapshot = background.record_visit(url, time)?;
    background.notify_active_tab();
    Ok(snapshot.len())
}

#[derive(Debug, Clone, Default)]
struct SettingsChanges {
    enabled: Option<bool>,
    color: Option<String>,
    aggressive: Option<bool>,
    blacklist: Option<String>,
}

fn update_settings(
    storage: &ExtensionStorage,
    changes: SettingsChanges,
) -> RevisitResult<HighlightSettings> {
    let mut settings = storage.settings()?;
    let before = settings.clone();

    if let Some(enabled) = changes.enabled {
        settings.highlight_enabled = enabled;
    }
    if let Some(color) = changes.color {
        settings.highlight_color = color;
    }
    if let Some(aggressive) = changes.aggressive {
        settings.overdrive_enabled = aggressive;
    }
    if let Some(blacklist) = changes.blacklist {
        settings.blacklist = parse_blacklist(&blacklist);
    }

    if settings != before {
        storage.save_settings(&settings)?;
        background_with(
            storage,
            RecordedHistory::default(),
            Arc::new(ChannelTabMessenger::new()),
        )
        .on_message(ExtensionMessage::UpdateSettings);
        info!("settings saved");
    }

    Ok(settings)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StoreStats {
    initialized: bool,
    records: usize,
    bytes: usize,
}

fn stats(storage: &ExtensionStorage) -> RevisitResult<StoreStats> {
    let snapshot = storage.history_or_empty()?;
    Ok(StoreStats {
        initialized: storage.is_initialized()?,
        records: snapshot.len(),
        bytes: snapshot.serialized_len()?,
    })
}

/// Opens the page in its own context, replays `visits` as live visits, and
/// returns the `href` of every highlighted link in document order.
fn highlight(
    storage: &ExtensionStorage,
    markup: &str,
    page_url: &str,
    visits: &[String],
) -> RevisitResult<Vec<String>> {
    let document = HtmlParser.parse(page_url, markup)?;

    let (background_end, page_end) = local_channel_pair(
        ChannelConfig::hardened(ContextRole::Background)?,
        ChannelConfig::hardened(ContextRole::Page)?,
    )?;
    let tabs = Arc::new(ChannelTabMessenger::new());
    tabs.attach(
        TabInfo {
            id: PAGE_TAB_ID,
            url: Some(page_url.to_owned()),
            active: true,
        },
        background_end,
    )?;

    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    let page_storage = storage.clone();
    let page_thread = thread::Builder::new()
        .name("page".to_owned())
        .spawn(move || run_page(document, page_storage, page_end, stop_rx))
        .map_err(|error| {
            RevisitError::new(
                "app.page_spawn_failed",
                format!("failed to start page context: {error}"),
            )
        })?;

    let background = background_with(storage, RecordedHistory::default(), tabs.clone());
    let clock = SystemClock;
    for url in visits {
        if background.on_visited(url, clock.now_millis()).is_none() {
            info!(url = %url, "visit was not recorded");
        }
    }

    // A closed stop channel also ends the page loop.
    let _ = stop_tx.send(());
    let links = page_thread.join().map_err(|_| {
        RevisitError::new("app.page_thread_panicked", "page context thread panicked")
    })??;
    tabs.detach(PAGE_TAB_ID)?;

    info!(highlighted = links.len(), "page session finished");
    Ok(links)
}

/// Page-context event loop: drain messages, run the frame, repeat until
/// told to stop. A final drain and frame pick up anything sent before stop.
fn run_page(
    document: Document,
    storage: ExtensionStorage,
    endpoint: LocalEndpoint,
    stop: mpsc::Receiver<()>,
) -> RevisitResult<Vec<String>> {
    let mut page = PageContext::load(document, storage);

    loop {
        page.drain_messages(&endpoint)?;
        page.on_animation_frame();
        match stop.recv_timeout(FRAME_INTERVAL) {
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
    page.drain_messages(&endpoint)?;
    page.on_animation_frame();

    let document = page.document();
    Ok(page
        .highlighted_links()
        .into_iter()
        .filter_map(|id| document.element(id)?.attribute("href").map(str::to_owned))
        .collect())
}

fn print_report(report: &BackfillReport) {
    println!("fetched:  {}", report.fetched);
    println!("accepted: {}", report.accepted);
    println!("stored:   {}", report.stored);
    println!("bytes:    {}", report.bytes);
}

#[cfg(test)]
mod tests {
    use super::SettingsChanges;
    use super::highlight;
    use super::install;
    use super::open_storage;
    use super::reload;
    use super::stats;
    use super::update_settings;
    use super::visit;
    use rv_core::Clock;
    use rv_core::DAY_MILLIS;
    use rv_core::SystemClock;
    use rv_storage::ExtensionStorage;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    const PAGE: &str = "<html><body>\
        <a href='/read?id=1'>one</a>\
        <a href='/read?id=2'>two</a>\
        <a href='https://elsewhere.org/read?id=1'>other</a>\
        </body></html>";

    fn workspace() -> (TempDir, ExtensionStorage) {
        let dir = TempDir::new().unwrap_or_else(|_| unreachable!());
        let storage = open_storage(&dir.path().join("store")).unwrap_or_else(|_| unreachable!());
        (dir, storage)
    }

    fn history_file(dir: &TempDir, urls: &[&str]) -> PathBuf {
        let now = SystemClock.now_millis();
        let entries: Vec<String> = urls
            .iter()
            .enumerate()
            .map(|(idx, url)| {
                format!(
                    r#"{{"url":"{url}","lastVisitTime":{}}}"#,
                    now - DAY_MILLIS - idx as i64
                )
            })
            .collect();
        let path = dir.path().join("history.json");
        assert!(fs::write(&path, format!("[{}]", entries.join(","))).is_ok());
        path
    }

    #[test]
    fn install_then_stats_survive_reopen() {
        let (dir, storage) = workspace();
        let file = history_file(&dir, &["https://example.com/a", "https://example.com/b"]);

        let report = install(&storage, &file).unwrap_or_else(|_| unreachable!());
        assert_eq!(report.map(|report| report.stored), Some(2));
        assert_eq!(install(&storage, &file), Ok(None));

        let reopened = open_storage(&dir.path().join("store")).unwrap_or_else(|_| unreachable!());
        let stats = stats(&reopened).unwrap_or_else(|_| unreachable!());
        assert!(stats.initialized);
        assert_eq!(stats.records, 2);
        assert!(stats.bytes > 2);
    }

    #[test]
    fn reload_merges_without_initialized_guard() {
        let (dir, storage) = workspace();
        let file = history_file(&dir, &["https://example.com/a"]);
        assert!(install(&storage, &file).is_ok());

        let file = history_file(&dir, &["https://example.com/a", "https://example.com/c"]);
        assert!(reload(&storage, &file).is_ok());
        assert_eq!(stats(&storage).map(|stats| stats.records), Ok(2));
    }

    #[test]
    fn visit_rejects_unparseable_url() {
        let (_dir, storage) = workspace();
        assert_eq!(visit(&storage, "https://example.com/x", 1), Ok(1));
        assert_eq!(
            visit(&storage, "no scheme", 2).map_err(|error| error.code),
            Err("url.invalid")
        );
    }

    #[test]
    fn settings_round_trip_through_storage() {
        let (_dir, storage) = workspace();
        let changes = SettingsChanges {
            color: Some("teal".to_owned()),
            blacklist: Some(" News,mail ,".to_owned()),
            ..SettingsChanges::default()
        };

        let saved = update_settings(&storage, changes).unwrap_or_else(|_| unreachable!());
        assert_eq!(saved.highlight_color, "teal");
        assert_eq!(saved.blacklist_display(), "mail, news");
        assert_eq!(storage.settings(), Ok(saved));
    }

    #[test]
    fn highlight_session_picks_up_live_visits() {
        let (_dir, storage) = workspace();
        let now = SystemClock.now_millis();
        assert!(visit(&storage, "https://example.com/read?id=1", now).is_ok());

        let links = highlight(
            &storage,
            PAGE,
            "https://www.example.com/feed",
            &["https://example.com/read?id=2".to_owned()],
        )
        .unwrap_or_else(|error| panic!("{error}"));

        assert_eq!(links, vec!["/read?id=1".to_owned(), "/read?id=2".to_owned()]);
    }

    #[test]
    fn blacklisted_page_highlights_nothing() {
        let (_dir, storage) = workspace();
        let now = SystemClock.now_millis();
        assert!(visit(&storage, "https://example.com/read?id=1", now).is_ok());
        let changes = SettingsChanges {
            blacklist: Some("example".to_owned()),
            ..SettingsChanges::default()
        };
        assert!(update_settings(&storage, changes).is_ok());

        let links = highlight(&storage, PAGE, "https://example.com/", &[])
            .unwrap_or_else(|error| panic!("{error}"));
        assert!(links.is_empty());
    }
}
