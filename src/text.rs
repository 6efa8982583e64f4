//! Text helpers shared by the refiner, the learning engine and the gate.

use std::sync::LazyLock;

use regex::Regex;

/// Any HTML tag.
pub static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").expect("valid regex"));

/// Tags that end a block of text: these read as whitespace once stripped.
static BLOCK_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^</?(?:p|div|br|hr|h[1-6]|li|ul|ol|blockquote|pre|table|tr|td|th|section|article|header|footer)\b",
    )
    .expect("valid regex")
});

/// Horizontal whitespace before punctuation.
pub static SPACE_BEFORE_PUNCT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t]+[,.!?;:]").expect("valid regex"));

/// Punctuation directly followed by a letter.
pub static MISSING_SPACE_AFTER_PUNCT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[,.!?;:][A-Za-z]").expect("valid regex"));

/// An inline `style` attribute inside a tag.
pub static STYLE_ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\sstyle\s*=\s*(?:"[^"]*"|'[^']*'|[^\s>]+)"#).expect("valid regex")
});

/// A word token, allowing inner apostrophes and hyphens.
pub static WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z]+(?:['’-][A-Za-z]+)*").expect("valid regex"));

static HORIZONTAL_WS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t]{2,}|\t").expect("valid regex"));

static ANY_WS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Remove tags. Block tags become a space; inline tags vanish so
/// `<b>Thanks</b>,` reads as `Thanks,`.
pub fn strip_tags(text: &str) -> String {
    TAG.replace_all(text, |caps: &regex::Captures| {
        if BLOCK_TAG.is_match(&caps[0]) { " " } else { "" }
    })
    .into_owned()
}

/// Collapse runs of spaces and tabs into a single space.
pub fn collapse_horizontal(text: &str) -> String {
    HORIZONTAL_WS.replace_all(text, " ").into_owned()
}

/// Tag-stripped text with all whitespace collapsed and trimmed.
pub fn plain(text: &str) -> String {
    ANY_WS.replace_all(&strip_tags(text), " ").trim().to_string()
}

/// Style attributes present in the text's tags.
pub fn style_attributes(text: &str) -> Vec<String> {
    TAG.find_iter(text)
        .flat_map(|tag| STYLE_ATTR.find_iter(tag.as_str()))
        .map(|m| m.as_str().trim().to_string())
        .collect()
}
