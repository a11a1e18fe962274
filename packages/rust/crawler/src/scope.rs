//! Link scoping: URL normalization, the SSRF guard, and frontier admission.

use std::net::IpAddr;

use regex::Regex;
use url::Url;

use topicdigest_shared::CrawlConfig;

use crate::links::Link;

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Normalize a URL for deduplication.
///
/// Strips the fragment and a trailing slash on non-root paths. Scheme and
/// host are already lowercased by [`Url`].
pub fn normalize_url(url: &Url) -> String {
    let mut normalized = url.clone();
    normalized.set_fragment(None);
    let mut s = normalized.to_string();
    if s.ends_with('/') && normalized.path() != "/" {
        s.pop();
    }
    s
}

/// [`normalize_url`] for a string; `None` when it does not parse.
pub fn normalize_str(raw: &str) -> Option<String> {
    Url::parse(raw).ok().map(|u| normalize_url(&u))
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Check if a URL targets a potentially dangerous resource.
pub fn is_ssrf_target(url: &Url) -> bool {
    match url.scheme() {
        "http" | "https" => {}
        _ => return true,
    }

    match url.host() {
        Some(url::Host::Ipv4(v4)) => is_private_ip(&IpAddr::V4(v4)),
        Some(url::Host::Ipv6(v6)) => is_private_ip(&IpAddr::V6(v6)),
        Some(url::Host::Domain(host)) => {
            host == "localhost" || host.ends_with(".local") || host.ends_with(".internal")
        }
        None => true,
    }
}

/// Check if an IP is in a private/reserved range.
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                // 100.64.0.0/10 (Carrier-grade NAT)
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64)
                // 192.0.0.0/24
                || (v4.octets()[0] == 192 && v4.octets()[1] == 0 && v4.octets()[2] == 0)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique local
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                // fe80::/10 link local
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

// ---------------------------------------------------------------------------
// Link policy
// ---------------------------------------------------------------------------

/// Lowercase words of at least three characters from a topic string.
pub fn topic_keywords(topic: &str) -> Vec<String> {
    let mut words: Vec<String> = topic
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 3)
        .map(str::to_lowercase)
        .collect();
    words.sort();
    words.dedup();
    words
}

/// Decides which outbound links of a fetched page may join the frontier.
#[derive(Debug, Clone)]
pub struct LinkPolicy {
    keywords: Vec<String>,
    include_patterns: Vec<Regex>,
    exclude_patterns: Vec<Regex>,
    max_links_per_page: usize,
}

impl LinkPolicy {
    pub fn new(topic: &str, config: &CrawlConfig) -> Self {
        Self {
            keywords: topic_keywords(topic),
            include_patterns: config
                .include_patterns
                .iter()
                .filter_map(|p| glob_to_regex(p))
                .collect(),
            exclude_patterns: config
                .exclude_patterns
                .iter()
                .filter_map(|p| glob_to_regex(p))
                .collect(),
            max_links_per_page: config.max_links_per_page,
        }
    }

    /// Whether a single link passes scheme, SSRF, pattern, and relevance checks.
    pub fn admits(&self, link: &Link) -> bool {
        let url = &link.url;
        if is_ssrf_target(url) {
            return false;
        }

        let path = url.path();
        if self.exclude_patterns.iter().any(|p| p.is_match(path)) {
            return false;
        }
        if !self.include_patterns.is_empty()
            && !self.include_patterns.iter().any(|p| p.is_match(path))
        {
            return false;
        }

        self.is_relevant(link)
    }

    /// Filter a page's links down to at most `max_links_per_page` normalized URLs.
    pub fn select(&self, links: &[Link]) -> Vec<String> {
        links
            .iter()
            .filter(|link| self.admits(link))
            .map(|link| normalize_url(&link.url))
            .take(self.max_links_per_page)
            .collect()
    }

    fn is_relevant(&self, link: &Link) -> bool {
        if self.keywords.is_empty() {
            return true;
        }
        let url = link.url.as_str().to_lowercase();
        let anchor = link.anchor.to_lowercase();
        self.keywords
            .iter()
            .any(|k| url.contains(k.as_str()) || anchor.contains(k.as_str()))
    }
}

/// Convert a glob-like pattern to a regex.
fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let escaped = regex::escape(pattern)
        .replace(r"\*\*", ".*")
        .replace(r"\*", "[^/]*")
        .replace(r"\?", ".");
    Regex::new(&format!("^{escaped}$")).ok()
}
