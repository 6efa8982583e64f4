use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A named safety concern raised by the scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Flag {
    Spam,
    MaliciousCode,
    DisallowedLink,
    EncouragementOfHarm,
    AbusiveLanguage,
    ImminentDanger,
}

impl Flag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Spam => "spam",
            Self::MaliciousCode => "malicious_code",
            Self::DisallowedLink => "disallowed_link",
            Self::EncouragementOfHarm => "encouragement_of_harm",
            Self::AbusiveLanguage => "abusive_language",
            Self::ImminentDanger => "imminent_danger",
        }
    }

    /// Severity contributed by one occurrence of the flag before discounts.
    pub fn base_weight(&self) -> i32 {
        match self {
            Self::Spam | Self::MaliciousCode | Self::DisallowedLink => 100,
            Self::EncouragementOfHarm => 50,
            Self::AbusiveLanguage => 30,
            Self::ImminentDanger => 20,
        }
    }

    /// Instant-block flags never receive a context discount.
    pub fn is_instant_block(&self) -> bool {
        matches!(self, Self::Spam | Self::MaliciousCode | Self::DisallowedLink)
    }

    /// Flags whose weight depends on supportive or first-person context.
    pub fn is_context_sensitive(&self) -> bool {
        matches!(self, Self::EncouragementOfHarm | Self::AbusiveLanguage)
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whole-text signals derived before per-sentence analysis.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextSummary {
    pub positive_count: usize,
    pub negative_count: usize,
    /// Both first- and second-person pronouns are present.
    pub is_first_person: bool,
    pub is_supportive: bool,
    pub is_past_tense: bool,
    pub has_future_references: bool,
}

impl ContextSummary {
    pub fn describe(&self) -> String {
        let yes_no = |b: bool| if b { "yes" } else { "no" };
        format!(
            "positive: {}, negative: {}, supportive: {}, first-person: {}, past-tense: {}, future: {}",
            self.positive_count,
            self.negative_count,
            yes_no(self.is_supportive),
            yes_no(self.is_first_person),
            yes_no(self.is_past_tense),
            yes_no(self.has_future_references),
        )
    }
}

/// Outcome of scanning one text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanResult {
    pub pass: bool,
    pub flags: BTreeSet<Flag>,
    pub score: i32,
    pub threshold_used: i32,
    /// Ordered diagnostic notes, including non-scoring observations.
    pub details: Vec<String>,
    pub context_summary: String,
    pub context: ContextSummary,
}

impl ScanResult {
    pub fn has_flag(&self, flag: Flag) -> bool {
        self.flags.contains(&flag)
    }

    pub fn flag_names(&self) -> Vec<&'static str> {
        self.flags.iter().map(Flag::as_str).collect()
    }
}
