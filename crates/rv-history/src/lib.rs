//! Bounded, deduplicated store of visit records.
//!
//! The store holds at most one record per `domain:path?query` key. Bulk saves
//! prune by age and by serialized size; live upserts prune by record count.
//! The two caps are independent and are never folded into one.

use indexmap::IndexMap;
use indexmap::map::Entry;
use rv_core::DAY_MILLIS;
use rv_core::RevisitError;
use rv_core::RevisitResult;
use rv_url::UrlKey;
use serde::Deserialize;
use serde::Serialize;
use std::io;
use tracing::debug;

pub const DEFAULT_MAX_RECORDS: usize = 3_000_000;
pub const DEFAULT_MAX_BYTES: usize = 5 * 1024 * 1024;
/// Six 30-day months.
pub const DEFAULT_MAX_AGE_MILLIS: i64 = 6 * 30 * DAY_MILLIS;

/// One normalized browsing-history entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitRecord {
    pub domain: String,
    pub path: String,
    pub query: String,
    pub last_visit_time: i64,
    pub url: String,
}

impl VisitRecord {
    /// Normalizes `url` into a record. Rejected URLs surface as `url.*` errors.
    pub fn from_visit(url: &str, last_visit_time: i64) -> RevisitResult<Self> {
        let (domain, path, query) = UrlKey::parse(url)?.into_parts();
        Ok(Self {
            domain,
            path,
            query,
            last_visit_time,
            url: url.to_owned(),
        })
    }

    pub fn key(&self) -> String {
        rv_url::key_for(&self.domain, &self.path, &self.query)
    }

    pub fn scoped_key(&self) -> String {
        rv_url::scoped_key_for(&self.path, &self.query)
    }
}

/// Ordered store contents. Position approximates insertion recency;
/// `last_visit_time` is the authoritative recency.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HistorySnapshot {
    records: Vec<VisitRecord>,
}

impl HistorySnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: Vec<VisitRecord>) -> Self {
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[VisitRecord] {
        &self.records
    }

    pub fn iter(&self) -> impl Iterator<Item = &VisitRecord> {
        self.records.iter()
    }

    pub fn into_records(self) -> Vec<VisitRecord> {
        self.records
    }

    pub fn find(&self, key: &str) -> Option<&VisitRecord> {
        self.records.iter().find(|record| record.key() == key)
    }

    /// Length in bytes of the JSON array this snapshot persists as.
    pub fn serialized_len(&self) -> RevisitResult<usize> {
        serialized_len_of(&self.records)
    }
}

/// Caps enforced by [`HistoryStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreLimits {
    pub max_records: usize,
    pub max_bytes: usize,
    pub max_age_millis: i64,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            max_records: DEFAULT_MAX_RECORDS,
            max_bytes: DEFAULT_MAX_BYTES,
            max_age_millis: DEFAULT_MAX_AGE_MILLIS,
        }
    }
}

impl StoreLimits {
    pub fn validate(&self) -> RevisitResult<()> {
        if self.max_records == 0 {
            return Err(RevisitError::new(
                "history.limits_invalid",
                "max_records must be greater than zero",
            ));
        }

        if self.max_bytes < EMPTY_ARRAY_BYTES {
            return Err(RevisitError::new(
                "history.limits_invalid",
                format!("max_bytes must be at least {EMPTY_ARRAY_BYTES}"),
            ));
        }

        if self.max_age_millis <= 0 {
            return Err(RevisitError::new(
                "history.limits_invalid",
                "max_age_millis must be greater than zero",
            ));
        }

        Ok(())
    }

    /// Records at or before this instant are too old to keep.
    pub fn age_horizon(&self, now_millis: i64) -> i64 {
        now_millis.saturating_sub(self.max_age_millis)
    }
}

/// Applies the dedup and eviction rules to snapshots.
#[derive(Debug, Clone, Default)]
pub struct HistoryStore {
    limits: StoreLimits,
}

impl HistoryStore {
    pub fn new(limits: StoreLimits) -> RevisitResult<Self> {
        limits.validate()?;
        Ok(Self { limits })
    }

    pub fn limits(&self) -> &StoreLimits {
        &self.limits
    }

    /// Merges `incoming` into `existing` for a bulk save.
    ///
    /// Records at or past the age horizon are dropped from both sides. Feed
    /// `incoming` oldest first: a replaced key keeps its original position, a
    /// new key is appended, and size eviction removes from the front.
    pub fn upsert_many<I>(
        &self,
        existing: HistorySnapshot,
        incoming: I,
        now_millis: i64,
    ) -> RevisitResult<HistorySnapshot>
    where
        I: IntoIterator<Item = VisitRecord>,
    {
        let horizon = self.limits.age_horizon(now_millis);
        let before = existing.len();

        let mut merged = KeyedRecords::with_capacity(before);
        for record in existing.into_records() {
            if record.last_visit_time > horizon {
                merged.upsert(record);
            }
        }
        let retained = merged.len();

        let mut expired = 0_usize;
        for record in incoming {
            if record.last_visit_time > horizon {
                merged.upsert(record);
            } else {
                expired += 1;
            }
        }

        let mut records = merged.into_records();
        let evicted = evict_to_byte_budget(&mut records, self.limits.max_bytes)?;

        debug!(
            before,
            retained,
            expired,
            evicted,
            after = records.len(),
            "bulk history save"
        );

        Ok(HistorySnapshot::from_records(records))
    }

    /// Applies one live visit, then evicts the oldest-inserted keys while the
    /// record count is over the cap. No size or age pruning happens here.
    pub fn upsert_one(&self, existing: HistorySnapshot, record: VisitRecord) -> HistorySnapshot {
        let mut merged = KeyedRecords::with_capacity(existing.len().saturating_add(1));
        for stored in existing.into_records() {
            merged.upsert(stored);
        }
        merged.upsert(record);

        let mut records = merged.into_records();
        let overflow = records.len().saturating_sub(self.limits.max_records);
        if overflow > 0 {
            records.drain(..overflow);
            debug!(overflow, "evicted oldest history keys over record cap");
        }

        HistorySnapshot::from_records(records)
    }
}

const EMPTY_ARRAY_BYTES: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpsertOutcome {
    Inserted,
    Replaced,
    KeptNewer,
}

/// Insertion-ordered key → record map.
struct KeyedRecords {
    entries: IndexMap<String, VisitRecord>,
}

impl KeyedRecords {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: IndexMap::with_capacity(capacity),
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    /// Keeps the newer of two records sharing a key; ties go to `record`.
    fn upsert(&mut self, record: VisitRecord) -> UpsertOutcome {
        match self.entries.entry(record.key()) {
            Entry::Vacant(slot) => {
                slot.insert(record);
                UpsertOutcome::Inserted
            }
            Entry::Occupied(mut slot) => {
                if record.last_visit_time >= slot.get().last_visit_time {
                    slot.insert(record);
                    UpsertOutcome::Replaced
                } else {
                    UpsertOutcome::KeptNewer
                }
            }
        }
    }

    fn into_records(self) -> Vec<VisitRecord> {
        self.entries.into_values().collect()
    }
}

/// Drops records from the front until the JSON array fits in `max_bytes`.
/// Returns the number of records dropped.
fn evict_to_byte_budget(
    records: &mut Vec<VisitRecord>,
    max_bytes: usize,
) -> RevisitResult<usize> {
    let sizes = records
        .iter()
        .map(serialized_len_of)
        .collect::<RevisitResult<Vec<usize>>>()?;

    let mut payload: usize = sizes.iter().sum();
    let mut remaining = sizes.len();
    let mut evict = 0_usize;
    while remaining > 0 && json_array_len(payload, remaining) > max_bytes {
        payload -= sizes[evict];
        remaining -= 1;
        evict += 1;
    }

    records.drain(..evict);
    Ok(evict)
}

/// `[a,b,c]`: brackets, elements, and one comma between each pair.
fn json_array_len(payload: usize, count: usize) -> usize {
    EMPTY_ARRAY_BYTES + payload + count.saturating_sub(1)
}

fn serialized_len_of<T: Serialize + ?Sized>(value: &T) -> RevisitResult<usize> {
    let mut counter = ByteCounter(0);
    serde_json::to_writer(&mut counter, value).map_err(|error| {
        RevisitError::new(
            "history.serialize_failed",
            format!("failed to measure history record: {error}"),
        )
    })?;
    Ok(counter.0)
}

struct ByteCounter(usize);

impl io::Write for ByteCounter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0 += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
