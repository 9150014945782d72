//! URL normalization into history lookup keys.
//!
//! A URL is reduced to a `(domain, path, query)` triple. The domain is the
//! second-to-last hostname label (`mail.google.com` → `google`), which is a
//! cheap stand-in for the registrable domain and deliberately not a public
//! suffix lookup: `example.co.uk` labels as `co`.

use rv_core::RevisitError;
use rv_core::RevisitResult;
use url::Url;
use url::form_urlencoded;

/// Schemes accepted for links found on a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn from_scheme_name(value: &str) -> Option<Self> {
        match value {
            "http" => Some(Self::Http),
            "https" => Some(Self::Https),
            _ => None,
        }
    }
}

/// Normalized identity of a visited or linked URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UrlKey {
    domain: String,
    path: String,
    query: String,
}

impl UrlKey {
    /// Normalizes any URL the parser accepts. Used for history entries, which
    /// may carry non-web schemes.
    pub fn parse(input: &str) -> RevisitResult<Self> {
        let parsed = parse_absolute(input)?;
        Ok(Self::from_url(&parsed))
    }

    /// Normalizes a link target, accepting only `http` and `https`.
    pub fn parse_web(input: &str) -> RevisitResult<Self> {
        let parsed = parse_absolute(input)?;
        if Scheme::from_scheme_name(parsed.scheme()).is_none() {
            return Err(RevisitError::new(
                "url.scheme_unsupported",
                format!("unsupported scheme `{}` in `{input}`", parsed.scheme()),
            ));
        }

        Ok(Self::from_url(&parsed))
    }

    fn from_url(parsed: &Url) -> Self {
        let host = parsed.host_str().unwrap_or_default();
        Self {
            domain: domain_label(host).to_owned(),
            path: parsed.path().to_owned(),
            query: canonical_query(parsed),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    /// Background dedup key, `domain:path?query`.
    pub fn key(&self) -> String {
        key_for(&self.domain, &self.path, &self.query)
    }

    /// Page-side lookup key, `path?query`; the domain is implied by the page.
    pub fn scoped_key(&self) -> String {
        scoped_key_for(&self.path, &self.query)
    }

    pub fn into_parts(self) -> (String, String, String) {
        (self.domain, self.path, self.query)
    }
}

pub fn key_for(domain: &str, path: &str, query: &str) -> String {
    format!("{domain}:{path}?{query}")
}

pub fn scoped_key_for(path: &str, query: &str) -> String {
    format!("{path}?{query}")
}

/// Second-to-last label of `host`, or `host` itself when it has one label.
pub fn domain_label(host: &str) -> &str {
    let mut labels = host.rsplit('.');
    match (labels.next(), labels.next()) {
        (Some(_), Some(second)) => second,
        _ => host,
    }
}

/// Domain label of the page at `page_url`.
pub fn page_domain(page_url: &str) -> RevisitResult<String> {
    let parsed = parse_absolute(page_url)?;
    Ok(domain_label(parsed.host_str().unwrap_or_default()).to_owned())
}

/// Resolves an `href` attribute against the page it appears on. An empty
/// `href` points at the page itself.
pub fn resolve_href(page_url: &str, href: &str) -> RevisitResult<String> {
    let base = parse_absolute(page_url)?;
    let href = href.trim();
    base.join(href).map(String::from).map_err(|error| {
        RevisitError::new(
            "url.href_invalid",
            format!("failed to resolve `{href}` against `{page_url}`: {error}"),
        )
    })
}

fn parse_absolute(input: &str) -> RevisitResult<Url> {
    Url::parse(input).map_err(|error| {
        RevisitError::new(
            "url.invalid",
            format!("failed to parse URL `{input}`: {error}"),
        )
    })
}

/// Query string re-serialized as `application/x-www-form-urlencoded` pairs.
fn canonical_query(parsed: &Url) -> String {
    if parsed.query().is_none_or(str::is_empty) {
        return String::new();
    }

    form_urlencoded::Serializer::new(String::new())
        .extend_pairs(parsed.query_pairs())
        .finish()
}
