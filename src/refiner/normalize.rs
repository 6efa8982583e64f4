//! Spacing and capitalization fixes, applied outside tags only.

use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::learning::{PatternKind, PatternSet};
use crate::text::{MISSING_SPACE_AFTER_PUNCT, SPACE_BEFORE_PUNCT, TAG, collapse_horizontal};

static BLOCK_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^</?(?:p|div|br|li|ul|ol|blockquote|h[1-6])\b").expect("valid regex")
});

static NON_WS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\S+").expect("valid regex"));

static INITIALISM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\W*(?:[A-Za-z]\.){2,}").expect("valid regex"));

static DOMAIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\W*[a-z0-9-]+(?:\.[a-z0-9-]+)*\.(?:com|org|net|edu|gov|io|co|uk|us|info|me)\b")
        .expect("valid regex")
});

/// Tokens whose punctuation is part of the token.
fn is_protected(token: &str) -> bool {
    token.contains("://")
        || token.contains('@')
        || token.to_ascii_lowercase().starts_with("www.")
        || INITIALISM.is_match(token)
        || DOMAIN.is_match(token)
}

fn fix_spacing(segment: &str, patterns: &PatternSet) -> String {
    let collapsed = collapse_horizontal(segment);

    let tightened = SPACE_BEFORE_PUNCT.replace_all(&collapsed, |caps: &Captures| {
        let matched = &caps[0];
        if patterns.contains(PatternKind::IgnorePunctSpaceBeforePunct, matched) {
            matched.to_string()
        } else {
            matched.trim_start().to_string()
        }
    });

    let mut out = String::with_capacity(tightened.len() + 8);
    let mut last = 0;
    for token in NON_WS.find_iter(&tightened) {
        out.push_str(&tightened[last..token.start()]);
        if is_protected(token.as_str()) {
            out.push_str(token.as_str());
        } else {
            let spaced = MISSING_SPACE_AFTER_PUNCT.replace_all(token.as_str(), |caps: &Captures| {
                let matched = &caps[0];
                if patterns.contains(PatternKind::IgnorePunctMissingSpaceAfterPunct, matched) {
                    matched.to_string()
                } else {
                    let (punct, letter) = matched.split_at(1);
                    format!("{punct} {letter}")
                }
            });
            out.push_str(&spaced);
        }
        last = token.end();
    }
    out.push_str(&tightened[last..]);
    out
}

/// Tracks sentence boundaries across text segments.
struct SentenceCase<'p> {
    patterns: &'p PatternSet,
    at_start: bool,
    terminated: bool,
    newlines: u8,
}

impl<'p> SentenceCase<'p> {
    fn new(patterns: &'p PatternSet) -> Self {
        Self {
            patterns,
            at_start: true,
            terminated: false,
            newlines: 0,
        }
    }

    fn block_boundary(&mut self) {
        self.at_start = true;
        self.terminated = false;
        self.newlines = 0;
    }

    fn capitalize(&self, word: &str) -> String {
        // Proper nouns first: every learned proper noun is also learned as
        // an ignore_cap value, which would otherwise shadow its casing.
        if let Some(canonical) = self.patterns.lookup(PatternKind::ProperNoun, word) {
            return canonical.to_string();
        }
        if self.patterns.lookup(PatternKind::IgnoreCap, word).is_some() {
            return word.to_string();
        }
        let mut chars = word.chars();
        match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect(),
            None => String::new(),
        }
    }

    fn apply(&mut self, segment: &str) -> String {
        let mut out = String::with_capacity(segment.len());
        let mut chars = segment.char_indices().peekable();

        while let Some((i, c)) = chars.next() {
            if c.is_alphabetic() {
                let end = segment[i..]
                    .find(|ch: char| !(ch.is_alphanumeric() || matches!(ch, '\'' | '’' | '-')))
                    .map_or(segment.len(), |n| i + n);
                let word = &segment[i..end];
                if self.at_start {
                    out.push_str(&self.capitalize(word));
                } else {
                    out.push_str(word);
                }
                self.at_start = false;
                self.terminated = false;
                self.newlines = 0;
                while chars.next_if(|&(j, _)| j < end).is_some() {}
                continue;
            }

            out.push(c);
            match c {
                '.' | '!' | '?' => {
                    self.terminated = true;
                    self.newlines = 0;
                }
                '\n' => {
                    self.newlines = self.newlines.saturating_add(1);
                    if self.terminated || self.newlines >= 2 {
                        self.at_start = true;
                    }
                }
                c if c.is_whitespace() => {
                    if self.terminated {
                        self.at_start = true;
                    }
                }
                // Openers do not end a sentence start.
                '"' | '\'' | '“' | '‘' | '”' | '’' | '(' | '[' => {}
                _ => {
                    self.at_start = false;
                    self.terminated = false;
                    self.newlines = 0;
                }
            }
        }
        out
    }
}

/// Normalize spacing and sentence capitalization. Tags pass through verbatim.
pub fn normalize(text: &str, patterns: &PatternSet) -> String {
    let mut out = String::with_capacity(text.len());
    let mut case = SentenceCase::new(patterns);
    let mut last = 0;

    for tag in TAG.find_iter(text) {
        out.push_str(&case.apply(&fix_spacing(&text[last..tag.start()], patterns)));
        if BLOCK_TAG.is_match(tag.as_str()) {
            case.block_boundary();
        }
        out.push_str(tag.as_str());
        last = tag.end();
    }
    out.push_str(&case.apply(&fix_spacing(&text[last..], patterns)));
    out
}
