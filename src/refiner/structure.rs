use std::sync::LazyLock;

use regex::Regex;

use crate::text::plain;

pub const DEFAULT_GREETING: &str = "Dear Friend,";

/// How far into the text a greeting may appear.
const GREETING_WINDOW: usize = 100;

static GREETING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:dear|hi|hello|hey|greetings|salutations|to)\b").expect("valid regex")
});

static BLOCK_MARKUP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<(?:p|div|blockquote|ul|ol|h[1-6])\b").expect("valid regex")
});

static BLANK_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n[ \t]*\n\s*").expect("valid regex"));

pub fn has_greeting(text: &str) -> bool {
    let head: String = plain(text).chars().take(GREETING_WINDOW).collect();
    GREETING.is_match(&head)
}

/// Wrap blank-line separated paragraphs in `<p>`. Text that already carries
/// block markup is returned as is.
pub fn wrap_paragraphs(text: &str) -> String {
    if BLOCK_MARKUP.is_match(text) {
        return text.to_string();
    }
    BLANK_LINE
        .split(text.trim())
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| format!("<p>{p}</p>"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Ensure the letter opens with a greeting, then wrap paragraphs.
pub fn apply_structure(text: &str) -> String {
    if has_greeting(text) {
        wrap_paragraphs(text)
    } else if BLOCK_MARKUP.is_match(text) {
        format!("<p>{DEFAULT_GREETING}</p>\n{text}")
    } else {
        wrap_paragraphs(&format!("{DEFAULT_GREETING}\n\n{text}"))
    }
}
