//! Post-conversion cleanup passes that turn article Markdown into model input.
//!
//! Each pass is a function `&str -> String` applied in sequence. Unlike a
//! publishing pipeline, link targets and images are dropped: the model only
//! needs the words.

use std::sync::LazyLock;

use regex::Regex;

/// Lines shorter than this with no sentence punctuation are treated as chrome.
const MIN_BARE_LINE_CHARS: usize = 25;

/// Run every cleanup pass on raw Markdown text.
pub(crate) fn run_pipeline(md: &str) -> String {
    let mut result = md.to_string();

    result = strip_images(&result);
    result = unlink(&result);
    result = strip_leftover_html(&result);
    result = drop_chrome_lines(&result);
    result = normalize_whitespace(&result);
    result = clean_blank_lines(&result);

    result.trim().to_string()
}

/// Remove `![alt](src)` images entirely.
fn strip_images(md: &str) -> String {
    static IMG_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"!\[[^\]]*\]\([^)]*\)").expect("valid regex"));

    IMG_RE.replace_all(md, "").to_string()
}

/// Replace `[text](url)` with `text`.
fn unlink(md: &str) -> String {
    static LINK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\[([^\]]*)\]\([^)]*\)").expect("valid regex"));

    LINK_RE.replace_all(md, "$1").to_string()
}

/// Strip any HTML tag htmd passed through, keeping inner text.
fn strip_leftover_html(md: &str) -> String {
    static TAG_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"</?[a-zA-Z][^>]*>").expect("valid regex"));

    TAG_RE.replace_all(md, "").to_string()
}

/// Drop short bare lines ("Share", "Advertisement", "Read more") that are
/// not headings or list items.
fn drop_chrome_lines(md: &str) -> String {
    md.lines()
        .filter(|line| {
            let t = line.trim();
            t.is_empty()
                || t.starts_with('#')
                || t.starts_with("- ")
                || t.starts_with("* ")
                || t.starts_with('|')
                || t.chars().count() >= MIN_BARE_LINE_CHARS
                || t.ends_with(['.', '!', '?', ':'])
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Trim trailing whitespace on every line.
fn normalize_whitespace(md: &str) -> String {
    md.lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Collapse runs of blank lines into a single blank line.
fn clean_blank_lines(md: &str) -> String {
    static MULTI_BLANK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid regex"));

    MULTI_BLANK_RE.replace_all(md, "\n\n").to_string()
}
