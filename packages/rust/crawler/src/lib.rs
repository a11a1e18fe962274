//! Page fetching, link extraction, and link scoping.
//!
//! This crate provides:
//! - [`HttpFetcher`]: `reqwest` page fetcher with an SSRF guard
//! - [`FeedReader`]: RSS/Atom entries as dated seed hits
//! - [`HttpWebSource`]: the production [`WebSource`](topicdigest_shared::WebSource),
//!   pairing topic search and feeds with page fetching
//! - [`extract_links`]: outbound links with their anchor text
//! - [`LinkPolicy`]: decides which outbound links extend the frontier
//! - [`normalize_url`]: the dedup key for visited-set checks

mod feed;
mod fetch;
mod links;
mod scope;
mod source;

pub use feed::FeedReader;
pub use fetch::HttpFetcher;
pub use links::{Link, extract_links};
pub use scope::{LinkPolicy, is_ssrf_target, normalize_str, normalize_url, topic_keywords};
pub use source::HttpWebSource;
