//! Shared primitives used across Revisit crates.

use core::fmt;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

/// Milliseconds in one day, the unit every retention window is expressed in.
pub const DAY_MILLIS: i64 = 24 * 60 * 60 * 1000;

/// Result alias used across the workspace.
pub type RevisitResult<T> = Result<T, RevisitError>;

/// Error carried across every crate boundary.
///
/// `code` is a stable dotted identifier (`url.invalid`, `storage.read_failed`)
/// that callers and tests match on; `message` is for humans and logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisitError {
    pub code: &'static str,
    pub message: String,
}

impl RevisitError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// True when the error belongs to the given dotted family, e.g. `"url"`.
    pub fn is_family(&self, family: &str) -> bool {
        self.code
            .strip_prefix(family)
            .is_some_and(|rest| rest.starts_with('.'))
    }
}

impl fmt::Display for RevisitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for RevisitError {}

/// Source of "now" for retention horizons and live visit timestamps.
pub trait Clock: Send + Sync {
    /// Current time as epoch milliseconds.
    fn now_millis(&self) -> i64;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
            .unwrap_or_default()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now_millis: i64) -> Self {
        Self {
            now: AtomicI64::new(now_millis),
        }
    }

    pub fn set(&self, now_millis: i64) {
        self.now.store(now_millis, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: i64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}
