//! Whole-text context analysis and sentence segmentation.

use super::rules::{Category, RuleBook};
use super::types::ContextSummary;

/// Derive the context signals that adjust flag weights and the threshold.
pub fn analyze_context(rules: &RuleBook, text: &str) -> ContextSummary {
    let positive_count = rules.count(Category::Positive, text);
    let negative_count = rules.count(Category::Negative, text);

    ContextSummary {
        positive_count,
        negative_count,
        is_first_person: rules.is_match(Category::FirstPersonPronoun, text)
            && rules.is_match(Category::SecondPersonPronoun, text),
        is_supportive: positive_count > negative_count,
        is_past_tense: rules.is_match(Category::PastTense, text),
        has_future_references: rules.is_match(Category::FutureReference, text),
    }
}

/// Split on sentence-ending punctuation followed by whitespace and a capital letter.
///
/// The terminator stays with its sentence; empty segments are dropped.
pub fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        if !matches!(c, '.' | '!' | '?') {
            continue;
        }
        // Swallow the rest of a terminator run like "?!" or "...".
        while let Some(&(_, next)) = chars.peek() {
            if matches!(next, '.' | '!' | '?') {
                chars.next();
            } else {
                break;
            }
        }
        let end = chars.peek().map(|&(i, _)| i).unwrap_or(text.len());

        let rest = &text[end..];
        let trimmed = rest.trim_start();
        let had_space = trimmed.len() < rest.len();
        if had_space && trimmed.chars().next().is_some_and(char::is_uppercase) {
            push_trimmed(&mut sentences, &text[start..end]);
            start = end;
        }
    }
    push_trimmed(&mut sentences, &text[start..]);
    sentences
}

fn push_trimmed<'t>(out: &mut Vec<&'t str>, segment: &'t str) {
    let segment = segment.trim();
    if !segment.is_empty() {
        out.push(segment);
    }
}
