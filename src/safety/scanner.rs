//! The multi-phase safety scanner and its scoring rules.

use std::collections::BTreeSet;

use regex::Match;

use super::context::{analyze_context, split_sentences};
use super::rules::{Category, RuleBook, STANDARD_RULES};
use super::types::{ContextSummary, Flag, ScanResult};
use crate::config::ScannerConfig;

/// Maximum gap, in bytes, between a first-person pronoun and a concerning
/// verb for a sentence to count as self-directed.
const FIRST_PERSON_WINDOW: usize = 15;

const BASE_THRESHOLD: i32 = 40;
const MIN_THRESHOLD: i32 = 20;

/// Pure text scanner. Holds only its rule table and link blocklist.
#[derive(Debug, Clone)]
pub struct SafetyScanner {
    rules: &'static RuleBook,
    blocked_domains: Vec<String>,
}

impl SafetyScanner {
    pub fn new(config: &ScannerConfig) -> Self {
        Self::with_rules(&STANDARD_RULES, config)
    }

    pub fn with_rules(rules: &'static RuleBook, config: &ScannerConfig) -> Self {
        Self {
            rules,
            blocked_domains: config
                .blocked_domains
                .iter()
                .map(|d| d.to_ascii_lowercase())
                .collect(),
        }
    }

    /// Scan one text. Deterministic and side-effect free.
    pub fn scan(&self, text: &str) -> ScanResult {
        let context = analyze_context(self.rules, text);
        let mut flags = BTreeSet::new();
        let mut details = Vec::new();

        let sentences = split_sentences(text);
        for (idx, sentence) in sentences.iter().enumerate() {
            let n = idx + 1;
            if self.is_first_person_framed(sentence) {
                if self.rules.is_match(Category::ConcerningVerb, sentence) {
                    details.push(format!(
                        "Sentence {n}: first-person reflection noted, not scored"
                    ));
                }
                continue;
            }

            if let Some((rule, m)) = self.rules.first_match(Category::Encouragement, sentence) {
                let pair = match sentences.get(idx + 1) {
                    Some(next) => format!("{sentence} {next}"),
                    None => sentence.to_string(),
                };
                if self.rules.is_match(Category::Protective, &pair) {
                    details.push(format!(
                        "Sentence {n}: '{}' suppressed by protective language",
                        m.as_str()
                    ));
                } else {
                    flags.insert(Flag::EncouragementOfHarm);
                    details.push(format!(
                        "Sentence {n}: encouragement of harm ({}): '{}'",
                        rule.name,
                        m.as_str()
                    ));
                }
            }

            if let Some((rule, m)) = self.rules.first_match(Category::Dehumanizing, sentence) {
                flags.insert(Flag::AbusiveLanguage);
                details.push(format!(
                    "Sentence {n}: dehumanizing language ({}): '{}'",
                    rule.name,
                    m.as_str()
                ));
            }

            if let Some((rule, m)) = self.rules.first_match(Category::Abusive, sentence) {
                flags.insert(Flag::AbusiveLanguage);
                details.push(format!(
                    "Sentence {n}: abusive language ({}): '{}'",
                    rule.name,
                    m.as_str()
                ));
            }
        }

        self.check_instant_blocks(text, &mut flags, &mut details);
        self.check_imminent_danger(text, &mut flags, &mut details);

        let score = severity(&flags, &context);
        let threshold_used = decision_threshold(&context);

        ScanResult {
            pass: score < threshold_used,
            flags,
            score,
            threshold_used,
            details,
            context_summary: context.describe(),
            context,
        }
    }

    /// A pronoun close to a concerning verb, or a sentence opening with one.
    fn is_first_person_framed(&self, sentence: &str) -> bool {
        if self.rules.is_match(Category::FirstPersonOpener, sentence) {
            return true;
        }
        let pronouns = self.rules.find_all(Category::FirstPersonPronoun, sentence);
        if pronouns.is_empty() {
            return false;
        }
        let verbs = self.rules.find_all(Category::ConcerningVerb, sentence);
        pronouns
            .iter()
            .any(|p| verbs.iter().any(|v| gap(p, v) <= FIRST_PERSON_WINDOW))
    }

    fn check_instant_blocks(
        &self,
        text: &str,
        flags: &mut BTreeSet<Flag>,
        details: &mut Vec<String>,
    ) {
        if let Some((rule, m)) = self.rules.first_match(Category::Spam, text) {
            flags.insert(Flag::Spam);
            details.push(format!("Spam ({}): '{}'", rule.name, m.as_str()));
        }
        if let Some((rule, m)) = self.rules.first_match(Category::MaliciousCode, text) {
            flags.insert(Flag::MaliciousCode);
            details.push(format!("Malicious code ({}): '{}'", rule.name, m.as_str()));
        }
        for host in self.rules.captures(Category::LinkHost, text) {
            if self.is_blocked_host(host) {
                flags.insert(Flag::DisallowedLink);
                details.push(format!("Disallowed link domain: {}", host.to_ascii_lowercase()));
                break;
            }
        }
    }

    fn is_blocked_host(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.blocked_domains
            .iter()
            .any(|d| host == *d || host.ends_with(&format!(".{d}")))
    }

    fn check_imminent_danger(
        &self,
        text: &str,
        flags: &mut BTreeSet<Flag>,
        details: &mut Vec<String>,
    ) {
        let Some((method_rule, method)) = self.rules.first_match(Category::Method, text) else {
            return;
        };
        match self.rules.first_match(Category::Timing, text) {
            Some((_, timing)) => {
                flags.insert(Flag::ImminentDanger);
                details.push(format!(
                    "Imminent danger: method '{}' with timing '{}'",
                    method.as_str(),
                    timing.as_str()
                ));
            }
            None => details.push(format!(
                "Method reference ({}) without immediate timing, not flagged",
                method_rule.name
            )),
        }
    }
}

/// Byte distance between two non-overlapping matches (0 when they touch or overlap).
fn gap(a: &Match<'_>, b: &Match<'_>) -> usize {
    if b.start() >= a.end() {
        b.start() - a.end()
    } else {
        a.start().saturating_sub(b.end())
    }
}

/// Weight of one flag after the context discount.
pub fn flag_weight(flag: Flag, context: &ContextSummary) -> i32 {
    let base = flag.base_weight();
    if !flag.is_context_sensitive() {
        return base;
    }
    if context.is_supportive {
        ((base as f64 * 0.5).round() as i32).max(10)
    } else if context.is_first_person {
        ((base as f64 * 0.3).round() as i32).max(5)
    } else {
        base
    }
}

/// Total severity of a flag set under a context, floored at zero.
pub fn severity(flags: &BTreeSet<Flag>, context: &ContextSummary) -> i32 {
    let mut total: i32 = flags.iter().map(|f| flag_weight(*f, context)).sum();
    if context.is_supportive {
        total -= 25;
    }
    if context.is_first_person {
        total -= 15;
    }
    total.max(0)
}

/// Pass/fail threshold adjusted for context.
pub fn decision_threshold(context: &ContextSummary) -> i32 {
    let mut threshold = BASE_THRESHOLD;
    if context.is_supportive {
        threshold += 10;
    }
    if context.is_first_person {
        threshold += 15;
    }
    if context.negative_count > 2 && !context.is_first_person {
        threshold -= 5;
    }
    threshold.max(MIN_THRESHOLD)
}
