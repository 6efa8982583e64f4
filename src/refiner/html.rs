use std::sync::LazyLock;

use regex::Regex;

use crate::text::{STYLE_ATTR, TAG};

static FONT_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)</?font\b[^>]*>").expect("valid regex"));

static EMPTY_INLINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)<span\b[^>]*>\s*</span>|<em\b[^>]*>\s*</em>|<strong\b[^>]*>\s*</strong>|<b\b[^>]*>\s*</b>|<i\b[^>]*>\s*</i>|<u\b[^>]*>\s*</u>",
    )
    .expect("valid regex")
});

/// Strip inline styles, deprecated `<font>` tags and empty inline containers.
pub fn clean_html(text: &str) -> String {
    let unstyled = TAG.replace_all(text, |caps: &regex::Captures| {
        STYLE_ATTR.replace_all(&caps[0], "").into_owned()
    });
    let mut out = FONT_TAG.replace_all(&unstyled, "").into_owned();

    // Removing one empty container can empty its parent.
    loop {
        let next = EMPTY_INLINE.replace_all(&out, "").into_owned();
        if next == out {
            return out;
        }
        out = next;
    }
}
