//! Browsing-history query collaborator.

use rv_core::RevisitError;
use rv_core::RevisitResult;
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;

/// One URL as reported by the history provider, with its latest visit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryItem {
    pub url: String,
    /// Epoch milliseconds. Providers may report fractional milliseconds;
    /// they are truncated.
    #[serde(deserialize_with = "visit_time_millis")]
    pub last_visit_time: i64,
}

impl HistoryItem {
    pub fn new(url: impl Into<String>, last_visit_time: i64) -> Self {
        Self {
            url: url.into(),
            last_visit_time,
        }
    }
}

/// Bounded query over `[start_time, end_time]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistorySearch {
    pub text: String,
    pub start_time: i64,
    pub end_time: i64,
    pub max_results: usize,
}

/// Source of historical visits. Results come newest first.
pub trait HistoryQuery: Send + Sync {
    fn search(&self, query: &HistorySearch) -> RevisitResult<Vec<HistoryItem>>;
}

/// History provider backed by a fixed list, as exported to a JSON file.
#[derive(Debug, Clone, Default)]
pub struct RecordedHistory {
    items: Vec<HistoryItem>,
}

impl RecordedHistory {
    pub fn new(mut items: Vec<HistoryItem>) -> Self {
        items.sort_by(|left, right| right.last_visit_time.cmp(&left.last_visit_time));
        Self { items }
    }

    /// Parses a JSON array of `{ "url", "lastVisitTime" }` objects.
    pub fn from_json(input: &str) -> RevisitResult<Self> {
        let items: Vec<HistoryItem> = serde_json::from_str(input).map_err(|error| {
            RevisitError::new(
                "ingest.history_invalid",
                format!("history export is not a list of visits: {error}"),
            )
        })?;
        Ok(Self::new(items))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl HistoryQuery for RecordedHistory {
    fn search(&self, query: &HistorySearch) -> RevisitResult<Vec<HistoryItem>> {
        Ok(self
            .items
            .iter()
            .filter(|item| {
                (query.start_time..=query.end_time).contains(&item.last_visit_time)
                    && item.url.contains(query.text.as_str())
            })
            .take(query.max_results)
            .cloned()
            .collect())
    }
}

fn visit_time_millis<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawTime {
        Whole(i64),
        Fractional(f64),
    }

    match RawTime::deserialize(deserializer)? {
        RawTime::Whole(millis) => Ok(millis),
        RawTime::Fractional(millis) if millis.is_finite() => Ok(millis.trunc() as i64),
        RawTime::Fractional(_) => Err(serde::de::Error::custom("visit time is not finite")),
    }
}

#[cfg(test)]
mod tests {
    use super::HistoryItem;
    use super::HistoryQuery;
    use super::HistorySearch;
    use super::RecordedHistory;

    fn search(start_time: i64, end_time: i64, max_results: usize) -> HistorySearch {
        HistorySearch {
            text: String::new(),
            start_time,
            end_time,
            max_results,
        }
    }

    #[test]
    fn parses_export_with_fractional_times() {
        let history = RecordedHistory::from_json(
            r#"[{"url":"https://a.com/","lastVisitTime":1700000000123.75},
                {"url":"https://b.com/","lastVisitTime":1700000000000}]"#,
        )
        .unwrap_or_else(|_| unreachable!());

        let all = history
            .search(&search(0, i64::MAX, 10))
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(
            all,
            vec![
                HistoryItem::new("https://a.com/", 1_700_000_000_123),
                HistoryItem::new("https://b.com/", 1_700_000_000_000),
            ]
        );
    }

    #[test]
    fn rejects_malformed_export() {
        let error = RecordedHistory::from_json("{\"url\":1}").err();
        assert_eq!(error.map(|error| error.code), Some("ingest.history_invalid"));
    }

    #[test]
    fn search_is_bounded_and_newest_first() {
        let history = RecordedHistory::new(vec![
            HistoryItem::new("https://a.com/1", 10),
            HistoryItem::new("https://a.com/3", 30),
            HistoryItem::new("https://a.com/2", 20),
            HistoryItem::new("https://a.com/4", 40),
        ]);

        let page = history
            .search(&search(10, 30, 2))
            .unwrap_or_else(|_| unreachable!());
        let times: Vec<i64> = page.iter().map(|item| item.last_visit_time).collect();
        assert_eq!(times, vec![30, 20]);
    }
}
