//! User-facing highlight settings.

use std::collections::BTreeSet;

pub const DEFAULT_HIGHLIGHT_COLOR: &str = "#ff0000";

/// Settings record shared by the settings surface and every page context.
///
/// Read-modify-write, last writer wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HighlightSettings {
    pub highlight_enabled: bool,
    pub highlight_color: String,
    /// Styles are applied with `!important` priority when set.
    pub overdrive_enabled: bool,
    /// Domain labels (as produced by the URL normalizer) never highlighted.
    pub blacklist: BTreeSet<String>,
}

impl Default for HighlightSettings {
    fn default() -> Self {
        Self {
            highlight_enabled: true,
            highlight_color: DEFAULT_HIGHLIGHT_COLOR.to_owned(),
            overdrive_enabled: false,
            blacklist: BTreeSet::new(),
        }
    }
}

impl HighlightSettings {
    /// Returns true if pages on this domain label must be left alone.
    pub fn is_blacklisted(&self, domain: &str) -> bool {
        let normalized = domain.trim().to_ascii_lowercase();
        if normalized.is_empty() {
            return false;
        }

        self.blacklist.contains(&normalized)
    }

    pub fn blacklist_display(&self) -> String {
        self.blacklist
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Parses the comma-separated blacklist input of the settings surface.
pub fn parse_blacklist(input: &str) -> BTreeSet<String> {
    input
        .split(',')
        .map(|item| item.trim().to_ascii_lowercase())
        .filter(|item| !item.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::HighlightSettings;
    use super::parse_blacklist;

    #[test]
    fn defaults_match_settings_surface() {
        let settings = HighlightSettings::default();
        assert!(settings.highlight_enabled);
        assert_eq!(settings.highlight_color, "#ff0000");
        assert!(!settings.overdrive_enabled);
        assert!(settings.blacklist.is_empty());
    }

    #[test]
    fn parses_blacklist_and_skips_blank_items() {
        let parsed = parse_blacklist(" example, Google ,, ");
        assert_eq!(
            parsed.into_iter().collect::<Vec<_>>(),
            vec!["example".to_owned(), "google".to_owned()]
        );
        assert!(parse_blacklist("").is_empty());
    }

    #[test]
    fn blacklist_matches_domain_labels() {
        let settings = HighlightSettings {
            blacklist: parse_blacklist("example"),
            ..HighlightSettings::default()
        };
        assert!(settings.is_blacklisted("example"));
        assert!(settings.is_blacklisted("Example"));
        assert!(!settings.is_blacklisted("google"));
        assert!(!settings.is_blacklisted(""));
        assert_eq!(settings.blacklist_display(), "example");
    }
}
