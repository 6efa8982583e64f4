use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::LearningError;
use crate::store::LearnedPattern;

/// Category of learned exception to a refinement rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    /// Sentence-initial word the refiner must not capitalize.
    IgnoreCap,
    /// Word with a canonical casing.
    ProperNoun,
    IgnorePunctSpaceBeforePunct,
    IgnorePunctMissingSpaceAfterPunct,
    /// Inline styling humans keep, which disables HTML cleanup.
    AllowHtmlStyle,
}

impl PatternKind {
    pub const ALL: [PatternKind; 5] = [
        Self::IgnoreCap,
        Self::ProperNoun,
        Self::IgnorePunctSpaceBeforePunct,
        Self::IgnorePunctMissingSpaceAfterPunct,
        Self::AllowHtmlStyle,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IgnoreCap => "ignore_cap",
            Self::ProperNoun => "proper_noun",
            Self::IgnorePunctSpaceBeforePunct => "ignore_punct_space_before_punct",
            Self::IgnorePunctMissingSpaceAfterPunct => "ignore_punct_missing_space_after_punct",
            Self::AllowHtmlStyle => "allow_html_style",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }
}

impl fmt::Display for PatternKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PatternKind {
    type Err = LearningError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| LearningError::UnknownPatternType(s.to_string()))
    }
}

/// Samples below which the observed rate is blended toward 0.5.
const SMOOTHING_SAMPLES: i64 = 3;

/// Smoothed success rate of a pattern.
pub fn confidence(success: i64, failure: i64) -> f64 {
    let n = success + failure;
    if n <= 0 {
        return 0.5;
    }
    let rate = success as f64 / n as f64;
    if n < SMOOTHING_SAMPLES {
        (rate * n as f64 + 0.5 * (SMOOTHING_SAMPLES - n) as f64) / SMOOTHING_SAMPLES as f64
    } else {
        rate
    }
}

/// A pattern with its diagnostic confidence.
#[derive(Debug, Clone, Serialize)]
pub struct PatternStats {
    #[serde(flatten)]
    pub pattern: LearnedPattern,
    pub confidence: f64,
}

impl From<LearnedPattern> for PatternStats {
    fn from(pattern: LearnedPattern) -> Self {
        let confidence = confidence(pattern.success_count, pattern.failure_count);
        Self {
            pattern,
            confidence,
        }
    }
}

/// Heuristic for a human token that carries deliberate casing: an internal
/// capital in a mixed-case word, or a leading capital followed by lowercase.
pub fn looks_like_proper_noun(token: &str) -> bool {
    let mut chars = token.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    let rest: Vec<char> = chars.filter(|c| c.is_alphabetic()).collect();
    if rest.is_empty() {
        return false;
    }
    let has_lower = first.is_lowercase() || rest.iter().any(|c| c.is_lowercase());
    let internal_capital = rest.iter().any(|c| c.is_uppercase());
    let leading_capital = first.is_uppercase() && rest.iter().all(|c| c.is_lowercase());
    (internal_capital && has_lower) || leading_capital
}
