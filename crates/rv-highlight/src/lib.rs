//! Decides which links on a page get visited styling.
//!
//! Matching is scoped to the page's own domain label: the lookup index holds
//! `path?query` keys from every stored record, and a link only matches when
//! its own domain label equals the page's.

mod page;
mod scheduler;

pub use page::PageContext;
pub use scheduler::RecomputeScheduler;
pub use scheduler::Trigger;

use rv_core::RevisitResult;
use rv_dom::Document;
use rv_dom::NodeId;
use rv_dom::StylePriority;
use rv_history::HistorySnapshot;
use rv_settings::HighlightSettings;
use rv_url::UrlKey;
use std::collections::HashSet;

/// Custom property carrying the configured color on the document root.
pub const HIGHLIGHT_COLOR_PROPERTY: &str = "--highlight-color";
const FONT_WEIGHT_PROPERTY: &str = "font-weight";
const COLOR_PROPERTY: &str = "color";
const HIGHLIGHT_FONT_WEIGHT: &str = "bold";

/// `path?query` keys of stored visits.
#[derive(Debug, Clone, Default)]
pub struct VisitIndex {
    keys: HashSet<String>,
}

impl VisitIndex {
    pub fn from_snapshot(snapshot: &HistorySnapshot) -> Self {
        Self {
            keys: snapshot.iter().map(|record| record.scoped_key()).collect(),
        }
    }

    pub fn contains(&self, scoped_key: &str) -> bool {
        self.keys.contains(scoped_key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Why a link is or is not highlighted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkDecision {
    /// The rendering environment already reports the link as visited.
    NativeVisited,
    /// Same-domain link whose `path?query` is in the visit index.
    HistoryMatch,
    Leave,
}

impl LinkDecision {
    pub fn applies(self) -> bool {
        !matches!(self, Self::Leave)
    }
}

/// Why a pass did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    NoHistory,
    Blacklisted,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HighlightReport {
    pub scanned: usize,
    pub highlighted: Vec<NodeId>,
    /// Inline declarations whose value or priority actually changed.
    pub style_changes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    Skipped(SkipReason),
    Applied(HighlightReport),
}

/// One highlight pass over every link in `doc`.
///
/// Links are only ever styled, never unstyled, and re-running a pass with
/// unchanged inputs changes nothing.
pub fn compute_highlights(
    doc: &mut Document,
    store: Option<&HistorySnapshot>,
    settings: &HighlightSettings,
    page_domain: &str,
) -> RevisitResult<PassOutcome> {
    if !settings.highlight_enabled {
        return Ok(PassOutcome::Skipped(SkipReason::Disabled));
    }

    let Some(store) = store else {
        return Ok(PassOutcome::Skipped(SkipReason::NoHistory));
    };

    if settings.is_blacklisted(page_domain) {
        return Ok(PassOutcome::Skipped(SkipReason::Blacklisted));
    }

    let mut report = HighlightReport::default();
    if doc.set_style_property(
        doc.root(),
        HIGHLIGHT_COLOR_PROPERTY,
        &settings.highlight_color,
        StylePriority::Normal,
    )? {
        report.style_changes += 1;
    }

    let index = VisitIndex::from_snapshot(store);
    for link in doc.links() {
        report.scanned += 1;
        if !decide_link(doc, link, &index, page_domain).applies() {
            continue;
        }

        report.style_changes += apply_highlight(
            doc,
            link,
            &settings.highlight_color,
            settings.overdrive_enabled,
        )?;
        report.highlighted.push(link);
    }

    Ok(PassOutcome::Applied(report))
}

pub fn decide_link(
    doc: &Document,
    link: NodeId,
    index: &VisitIndex,
    page_domain: &str,
) -> LinkDecision {
    let Some(element) = doc.element(link) else {
        return LinkDecision::Leave;
    };

    if element.is_visited() {
        return LinkDecision::NativeVisited;
    }

    let Some(href) = element.attribute("href") else {
        return LinkDecision::Leave;
    };

    let matched = rv_url::resolve_href(doc.url(), href)
        .and_then(|absolute| UrlKey::parse_web(&absolute))
        .is_ok_and(|key| {
            key.domain() == page_domain && index.contains(&key.scoped_key())
        });

    if matched {
        LinkDecision::HistoryMatch
    } else {
        LinkDecision::Leave
    }
}

/// Styles `id` and every descendant. Returns the number of declarations
/// that changed.
pub fn apply_highlight(
    doc: &mut Document,
    id: NodeId,
    color: &str,
    overdrive: bool,
) -> RevisitResult<usize> {
    let priority = StylePriority::from_important(overdrive);
    let mut changes = 0_usize;

    for target in std::iter::once(id).chain(doc.descendants(id)) {
        for (name, value) in [
            (FONT_WEIGHT_PROPERTY, HIGHLIGHT_FONT_WEIGHT),
            (COLOR_PROPERTY, color),
        ] {
            if doc.set_style_property(target, name, value, priority)? {
                changes += 1;
            }
        }
    }

    Ok(changes)
}

#[cfg(test)]
mod tests {
    use super::LinkDecision;
    use super::PassOutcome;
    use super::SkipReason;
    use super::VisitIndex;
    use super::apply_highlight;
    use super::compute_highlights;
    use super::decide_link;
    use rv_dom::Document;
    use rv_dom::StylePriority;
    use rv_history::HistorySnapshot;
    use rv_history::VisitRecord;
    use rv_html::HtmlParser;
    use rv_settings::HighlightSettings;
    use rv_settings::parse_blacklist;

    const PAGE: &str = "https://example.com/home";

    fn page(markup: &str) -> Document {
        HtmlParser
            .parse(PAGE, markup)
            .unwrap_or_else(|_| unreachable!())
    }

    fn store(urls: &[&str]) -> HistorySnapshot {
        HistorySnapshot::from_records(
            urls.iter()
                .map(|url| {
                    VisitRecord::from_visit(url, 1).unwrap_or_else(|_| unreachable!())
                })
                .collect(),
        )
    }

    fn applied(outcome: PassOutcome) -> super::HighlightReport {
        match outcome {
            PassOutcome::Applied(report) => report,
            PassOutcome::Skipped(reason) => panic!("pass skipped: {reason:?}"),
        }
    }

    fn color_of(doc: &Document, id: usize) -> Option<String> {
        doc.element(id)
            .and_then(|el| el.style().value("color").map(str::to_owned))
    }

    #[test]
    fn highlights_same_domain_link_found_in_history() {
        let mut doc = page("<a href='https://example.com/a?x=1'>a</a><a href='/b'>b</a>");
        let history = store(&["https://www.example.com/a?x=1"]);

        let outcome =
            compute_highlights(&mut doc, Some(&history), &HighlightSettings::default(), "example");
        let report = applied(outcome.unwrap_or_else(|_| unreachable!()));

        let links = doc.links();
        assert_eq!(report.scanned, 2);
        assert_eq!(report.highlighted, vec![links[0]]);
        assert_eq!(color_of(&doc, links[0]).as_deref(), Some("#ff0000"));
        assert_eq!(color_of(&doc, links[1]), None);
    }

    #[test]
    fn blacklisted_page_is_left_alone() {
        let mut doc = page("<a href='https://example.com/a?x=1'>a</a>");
        let history = store(&["https://example.com/a?x=1"]);
        let settings = HighlightSettings {
            blacklist: parse_blacklist("example"),
            ..HighlightSettings::default()
        };

        let outcome = compute_highlights(&mut doc, Some(&history), &settings, "example");
        assert_eq!(outcome, Ok(PassOutcome::Skipped(SkipReason::Blacklisted)));
        assert_eq!(color_of(&doc, doc.links()[0]), None);
    }

    #[test]
    fn disabled_or_missing_history_skips_the_pass() {
        let mut doc = page("<a href='/a'>a</a>");
        let disabled = HighlightSettings {
            highlight_enabled: false,
            ..HighlightSettings::default()
        };
        let history = store(&["https://example.com/a"]);

        assert_eq!(
            compute_highlights(&mut doc, Some(&history), &disabled, "example"),
            Ok(PassOutcome::Skipped(SkipReason::Disabled))
        );
        assert_eq!(
            compute_highlights(&mut doc, None, &HighlightSettings::default(), "example"),
            Ok(PassOutcome::Skipped(SkipReason::NoHistory))
        );
    }

    #[test]
    fn natively_visited_links_always_highlight() {
        let mut doc = page("<a href='https://elsewhere.org/x'>x</a>");
        let link = doc.links()[0];
        assert!(doc.set_visited(link, true).is_ok());

        let index = VisitIndex::default();
        assert_eq!(
            decide_link(&doc, link, &index, "example"),
            LinkDecision::NativeVisited
        );

        let empty = store(&[]);
        let outcome =
            compute_highlights(&mut doc, Some(&empty), &HighlightSettings::default(), "example");
        let report = applied(outcome.unwrap_or_else(|_| unreachable!()));
        assert_eq!(report.highlighted, vec![link]);
    }

    #[test]
    fn matching_requires_domain_path_and_query() {
        let doc = page(
            "<a href='https://other.org/a?x=1'>other</a>\
             <a href='/a?x=2'>query</a>\
             <a href='mailto:me@example.com'>mail</a>\
             <a>no href</a>\
             <a href='https://shop.example.com/a?x=1'>sub</a>",
        );
        let index = VisitIndex::from_snapshot(&store(&["https://example.com/a?x=1"]));
        let decisions: Vec<LinkDecision> = doc
            .links()
            .into_iter()
            .map(|link| decide_link(&doc, link, &index, "example"))
            .collect();

        assert_eq!(
            decisions,
            vec![
                LinkDecision::Leave,
                LinkDecision::Leave,
                LinkDecision::Leave,
                LinkDecision::Leave,
                LinkDecision::HistoryMatch,
            ]
        );
    }

    #[test]
    fn self_links_resolve_to_the_page_url() {
        let doc = HtmlParser
            .parse(
                "https://example.com/a?x=1",
                "<a href=''>self</a><a href='#top'>top</a>",
            )
            .unwrap_or_else(|_| unreachable!());
        let index = VisitIndex::from_snapshot(&store(&["https://example.com/a?x=1"]));

        let decisions: Vec<LinkDecision> = doc
            .links()
            .into_iter()
            .map(|link| decide_link(&doc, link, &index, "example"))
            .collect();
        assert_eq!(
            decisions,
            vec![LinkDecision::HistoryMatch, LinkDecision::HistoryMatch]
        );
    }

    #[test]
    fn overdrive_styles_descendants_with_important_priority() {
        let mut doc = page("<a href='/a'><span><b>deep</b></span></a>");
        let link = doc.links()[0];

        let changes = apply_highlight(&mut doc, link, "teal", true);
        assert_eq!(changes, Ok(6));

        for id in std::iter::once(link).chain(doc.descendants(link)) {
            let style = doc.element(id).map(|el| el.style().clone()).unwrap_or_default();
            assert_eq!(style.value("font-weight"), Some("bold"));
            assert_eq!(
                style.get("color").map(|value| value.priority),
                Some(StylePriority::Important)
            );
        }
    }

    #[test]
    fn second_pass_changes_nothing() {
        let mut doc = page("<a href='/a'><i>a</i></a><a href='/b'>b</a>");
        let history = store(&["https://example.com/a", "https://example.com/b"]);
        let settings = HighlightSettings::default();

        let first = compute_highlights(&mut doc, Some(&history), &settings, "example");
        let first = applied(first.unwrap_or_else(|_| unreachable!()));
        assert_eq!(first.style_changes, 1 + 4 + 2);

        let snapshot = doc.clone();
        let second = compute_highlights(&mut doc, Some(&history), &settings, "example");
        let second = applied(second.unwrap_or_else(|_| unreachable!()));
        assert_eq!(second.style_changes, 0);
        assert_eq!(second.highlighted, first.highlighted);
        assert_eq!(doc, snapshot);
    }

    #[test]
    fn root_carries_highlight_color_property() {
        let mut doc = page("<a href='/a'>a</a>");
        let settings = HighlightSettings {
            highlight_color: "blue".to_owned(),
            ..HighlightSettings::default()
        };
        assert!(compute_highlights(&mut doc, Some(&store(&[])), &settings, "example").is_ok());
        assert_eq!(
            doc.element(doc.root())
                .and_then(|root| root.style().value(super::HIGHLIGHT_COLOR_PROPERTY)),
            Some("blue")
        );
    }
}
