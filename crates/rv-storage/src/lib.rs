//! Extension-local key-value storage.
//!
//! Values are JSON text under a small fixed set of top-level keys. Every key
//! may be absent (first run); typed readers fall back to empty or default
//! values instead of failing.

use rv_core::RevisitError;
use rv_core::RevisitResult;
use rv_history::HistorySnapshot;
use rv_settings::HighlightSettings;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use tracing::debug;

pub const KEY_INITIALIZED: &str = "initialized";
pub const KEY_URL_DATA: &str = "urlData";
pub const KEY_HIGHLIGHT_ENABLED: &str = "highlightEnabled";
pub const KEY_HIGHLIGHT_COLOR: &str = "highlightColor";
pub const KEY_OVERDRIVE_ENABLED: &str = "overdriveEnabled";
pub const KEY_BLACKLIST: &str = "blacklist";

const STORE_FILE_NAME: &str = "local.kv";

/// Raw storage backend. Values are opaque JSON strings.
pub trait StorageArea: Send + Sync {
    fn get(&self, key: &str) -> RevisitResult<Option<String>>;

    /// Reads several keys at once. Values come back in `keys` order.
    fn get_many(&self, keys: &[&str]) -> RevisitResult<Vec<Option<String>>> {
        keys.iter().map(|key| self.get(key)).collect()
    }

    /// Writes all entries together.
    fn set_many(&self, entries: &[(&str, String)]) -> RevisitResult<()>;

    fn remove(&self, key: &str) -> RevisitResult<()>;
}

/// Process-local storage, used by tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> RevisitResult<MutexGuard<'_, BTreeMap<String, String>>> {
        self.entries.lock().map_err(|_| {
            RevisitError::new("storage.lock_poisoned", "memory storage lock poisoned")
        })
    }
}

impl StorageArea for MemoryStorage {
    fn get(&self, key: &str) -> RevisitResult<Option<String>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn get_many(&self, keys: &[&str]) -> RevisitResult<Vec<Option<String>>> {
        let map = self.lock()?;
        Ok(keys.iter().map(|key| map.get(*key).cloned()).collect())
    }

    fn set_many(&self, entries: &[(&str, String)]) -> RevisitResult<()> {
        let mut map = self.lock()?;
        for (key, value) in entries {
            map.insert((*key).to_owned(), value.clone());
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> RevisitResult<()> {
        self.lock()?.remove(key);
        Ok(())
    }
}

/// Durable storage configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageConfig {
    pub ephemeral_mode: bool,
}

/// File-backed storage: one line per key, hex-encoded key and value.
#[derive(Debug)]
pub struct FileStorage {
    pub config: StorageConfig,
    persistent_root: Option<PathBuf>,
    write_lock: Mutex<()>,
}

impl FileStorage {
    pub fn new(config: StorageConfig) -> Self {
        Self {
            config,
            persistent_root: None,
            write_lock: Mutex::new(()),
        }
    }

    pub fn with_persistent_root(mut self, root: PathBuf) -> Self {
        self.persistent_root = Some(root);
        self
    }

    fn store_path(&self) -> RevisitResult<PathBuf> {
        if self.config.ephemeral_mode {
            return Err(RevisitError::new(
                "storage.persistence_disabled",
                "persistent storage is disabled in ephemeral mode",
            ));
        }

        let root = self.persistent_root.as_ref().ok_or_else(|| {
            RevisitError::new(
                "storage.persistence_unconfigured",
                "persistent storage root is not configured",
            )
        })?;

        Ok(root.join(STORE_FILE_NAME))
    }

    fn update<F>(&self, apply: F) -> RevisitResult<()>
    where
        F: FnOnce(&mut BTreeMap<String, String>),
    {
        let _guard = self.write_lock.lock().map_err(|_| {
            RevisitError::new("storage.lock_poisoned", "file storage lock poisoned")
        })?;
        let path = self.store_path()?;
        let mut map = read_store_map(&path)?;
        apply(&mut map);
        write_store_map(&path, &map)
    }
}

impl StorageArea for FileStorage {
    fn get(&self, key: &str) -> RevisitResult<Option<String>> {
        let path = self.store_path()?;
        let map = read_store_map(&path)?;
        Ok(map.get(key).cloned())
    }

    fn get_many(&self, keys: &[&str]) -> RevisitResult<Vec<Option<String>>> {
        let map = read_store_map(&self.store_path()?)?;
        Ok(keys.iter().map(|key| map.get(*key).cloned()).collect())
    }

    fn set_many(&self, entries: &[(&str, String)]) -> RevisitResult<()> {
        self.update(|map| {
            for (key, value) in entries {
                map.insert((*key).to_owned(), value.clone());
            }
        })
    }

    fn remove(&self, key: &str) -> RevisitResult<()> {
        self.update(|map| {
            map.remove(key);
        })
    }
}

/// Everything a highlight pass reads, loaded in one storage round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageState {
    pub settings: HighlightSettings,
    pub history: Option<HistorySnapshot>,
}

/// Typed view over the extension's fixed key set.
#[derive(Clone)]
pub struct ExtensionStorage {
    area: Arc<dyn StorageArea>,
}

impl ExtensionStorage {
    pub fn new(area: Arc<dyn StorageArea>) -> Self {
        Self { area }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStorage::new()))
    }

    pub fn area(&self) -> &Arc<dyn StorageArea> {
        &self.area
    }

    pub fn is_initialized(&self) -> RevisitResult<bool> {
        Ok(self.get_json::<bool>(KEY_INITIALIZED)?.unwrap_or(false))
    }

    pub fn mark_initialized(&self) -> RevisitResult<()> {
        self.set_json(KEY_INITIALIZED, &true)
    }

    /// Stored snapshot, or `None` before anything was ever saved.
    pub fn history(&self) -> RevisitResult<Option<HistorySnapshot>> {
        self.get_json(KEY_URL_DATA)
    }

    pub fn history_or_empty(&self) -> RevisitResult<HistorySnapshot> {
        Ok(self.history()?.unwrap_or_default())
    }

    pub fn save_history(&self, snapshot: &HistorySnapshot) -> RevisitResult<()> {
        let encoded = encode_json(KEY_URL_DATA, snapshot)?;
        debug!(
            records = snapshot.len(),
            bytes = encoded.len(),
            "persisting history snapshot"
        );
        self.area.set_many(&[(KEY_URL_DATA, encoded)])
    }

    /// Settings with defaults for every absent key.
    pub fn settings(&self) -> RevisitResult<HighlightSettings> {
        let [enabled, color, overdrive, blacklist] = self.read_keys([
            KEY_HIGHLIGHT_ENABLED,
            KEY_HIGHLIGHT_COLOR,
            KEY_OVERDRIVE_ENABLED,
            KEY_BLACKLIST,
        ])?;
        settings_from_values(enabled, color, overdrive, blacklist)
    }

    /// Settings and history in a single read of the backing area.
    pub fn page_state(&self) -> RevisitResult<PageState> {
        let [enabled, color, overdrive, blacklist, history] = self.read_keys([
            KEY_HIGHLIGHT_ENABLED,
            KEY_HIGHLIGHT_COLOR,
            KEY_OVERDRIVE_ENABLED,
            KEY_BLACKLIST,
            KEY_URL_DATA,
        ])?;
        Ok(PageState {
            settings: settings_from_values(enabled, color, overdrive, blacklist)?,
            history: decode_json(KEY_URL_DATA, history)?,
        })
    }

    pub fn save_settings(&self, settings: &HighlightSettings) -> RevisitResult<()> {
        let entries = [
            (
                KEY_HIGHLIGHT_ENABLED,
                encode_json(KEY_HIGHLIGHT_ENABLED, &settings.highlight_enabled)?,
            ),
            (
                KEY_HIGHLIGHT_COLOR,
                encode_json(KEY_HIGHLIGHT_COLOR, &settings.highlight_color)?,
            ),
            (
                KEY_OVERDRIVE_ENABLED,
                encode_json(KEY_OVERDRIVE_ENABLED, &settings.overdrive_enabled)?,
            ),
            (
                KEY_BLACKLIST,
                encode_json(KEY_BLACKLIST, &settings.blacklist)?,
            ),
        ];
        self.area.set_many(&entries)
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> RevisitResult<Option<T>> {
        decode_json(key, self.area.get(key)?)
    }

    pub fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> RevisitResult<()> {
        let encoded = encode_json(key, value)?;
        self.area.set_many(&[(key, encoded)])
    }

    fn read_keys<const N: usize>(&self, keys: [&str; N]) -> RevisitResult<[Option<String>; N]> {
        let values = self.area.get_many(&keys)?;
        let returned = values.len();
        values.try_into().map_err(|_| {
            RevisitError::new(
                "storage.read_failed",
                format!("storage returned {returned} values for {N} keys"),
            )
        })
    }
}

fn settings_from_values(
    enabled: Option<String>,
    color: Option<String>,
    overdrive: Option<String>,
    blacklist: Option<String>,
) -> RevisitResult<HighlightSettings> {
    let defaults = HighlightSettings::default();
    Ok(HighlightSettings {
        highlight_enabled: decode_json(KEY_HIGHLIGHT_ENABLED, enabled)?
            .unwrap_or(defaults.highlight_enabled),
        highlight_color: decode_json(KEY_HIGHLIGHT_COLOR, color)?
            .unwrap_or(defaults.highlight_color),
        overdrive_enabled: decode_json(KEY_OVERDRIVE_ENABLED, overdrive)?
            .unwrap_or(defaults.overdrive_enabled),
        blacklist: decode_json::<BTreeSet<String>>(KEY_BLACKLIST, blacklist)?
            .unwrap_or(defaults.blacklist),
    })
}

fn decode_json<T: DeserializeOwned>(key: &str, raw: Option<String>) -> RevisitResult<Option<T>> {
    let Some(raw) = raw else {
        return Ok(None);
    };

    serde_json::from_str(&raw).map(Some).map_err(|error| {
        RevisitError::new(
            "storage.value_invalid",
            format!("stored value for `{key}` is not valid: {error}"),
        )
    })
}

fn encode_json<T: Serialize + ?Sized>(key: &str, value: &T) -> RevisitResult<String> {
    serde_json::to_string(value).map_err(|error| {
        RevisitError::new(
            "storage.value_encode_failed",
            format!("failed to encode value for `{key}`: {error}"),
        )
    })
}

fn read_store_map(path: &Path) -> RevisitResult<BTreeMap<String, String>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }

    let content = fs::read_to_string(path).map_err(|error| {
        RevisitError::new(
            "storage.read_failed",
            format!("failed to read store file `{}`: {error}", path.display()),
        )
    })?;

    let mut map = BTreeMap::new();
    for (index, line) in content.lines().enumerate() {
        if line.is_empty() {
            continue;
        }

        let (key_hex, value_hex) = line.split_once('\t').ok_or_else(|| {
            RevisitError::new(
                "storage.format_invalid",
                format!(
                    "invalid record format at `{}` line {}",
                    path.display(),
                    index + 1
                ),
            )
        })?;

        let key = decode_hex_string(key_hex)?;
        let value = decode_hex_string(value_hex)?;
        map.insert(key, value);
    }

    Ok(map)
}

fn write_store_map(path: &Path, map: &BTreeMap<String, String>) -> RevisitResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|error| {
            RevisitError::new(
                "storage.dir_create_failed",
                format!(
                    "failed to create storage directory `{}`: {error}",
                    parent.display()
                ),
            )
        })?;
    }

    let mut encoded = String::new();
    for (key, value) in map {
        encoded.push_str(&encode_hex_string(key));
        encoded.push('\t');
        encoded.push_str(&encode_hex_string(value));
        encoded.push('\n');
    }

    // Readers only ever observe a complete store file.
    let staging = path.with_extension("kv.tmp");
    fs::write(&staging, encoded).map_err(|error| {
        RevisitError::new(
            "storage.write_failed",
            format!("failed to write store file `{}`: {error}", staging.display()),
        )
    })?;
    fs::rename(&staging, path).map_err(|error| {
        RevisitError::new(
            "storage.write_failed",
            format!(
                "failed to move `{}` into place: {error}",
                staging.display()
            ),
        )
    })
}

fn encode_hex_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len().saturating_mul(2));
    for byte in value.as_bytes() {
        out.push(hex_char(byte >> 4));
        out.push(hex_char(byte & 0x0f));
    }
    out
}

fn decode_hex_string(value: &str) -> RevisitResult<String> {
    let digits = value.as_bytes();
    if digits.len() % 2 != 0 {
        return Err(RevisitError::new(
            "storage.hex_invalid",
            "hex field length must be even",
        ));
    }

    let mut bytes = Vec::with_capacity(digits.len() / 2);
    for pair in digits.chunks_exact(2) {
        let high = decode_hex_nibble(pair[0])?;
        let low = decode_hex_nibble(pair[1])?;
        bytes.push((high << 4) | low);
    }

    String::from_utf8(bytes).map_err(|error| {
        RevisitError::new(
            "storage.utf8_invalid",
            format!("store field is not valid UTF-8: {error}"),
        )
    })
}

fn hex_char(value: u8) -> char {
    match value {
        0..=9 => (b'0' + value) as char,
        10..=15 => (b'a' + (value - 10)) as char,
        _ => '0',
    }
}

fn decode_hex_nibble(digit: u8) -> RevisitResult<u8> {
    match digit {
        b'0'..=b'9' => Ok(digit - b'0'),
        b'a'..=b'f' => Ok(digit - b'a' + 10),
        b'A'..=b'F' => Ok(digit - b'A' + 10),
        _ => Err(RevisitError::new(
            "storage.hex_invalid",
            format!("invalid hex character `{}`", char::from(digit)),
        )),
    }
}
