//! Data-driven scanner rule tables.
//!
//! Every heuristic the scanner applies is a `(name, category, regex)` row.
//! The scanner only asks "does category X match here" and never names a
//! concrete pattern, so tables can be swapped or tested in isolation.

use std::sync::LazyLock;

use regex::{Match, Regex};

/// What a rule detects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Positive,
    Negative,
    PastTense,
    FutureReference,
    FirstPersonPronoun,
    SecondPersonPronoun,
    /// A sentence that opens with a first-person pronoun.
    FirstPersonOpener,
    ConcerningVerb,
    Encouragement,
    Protective,
    Dehumanizing,
    Abusive,
    Spam,
    MaliciousCode,
    /// Candidate link hosts; capture group 1 is the host.
    LinkHost,
    Method,
    Timing,
}

/// A compiled pattern with its category.
#[derive(Debug)]
pub struct Rule {
    pub name: &'static str,
    pub category: Category,
    pub regex: Regex,
}

impl Rule {
    pub fn new(name: &'static str, category: Category, regex: Regex) -> Self {
        Self {
            name,
            category,
            regex,
        }
    }
}

/// An ordered collection of rules.
#[derive(Debug, Default)]
pub struct RuleBook {
    rules: Vec<Rule>,
}

impl RuleBook {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    pub fn in_category(&self, category: Category) -> impl Iterator<Item = &Rule> {
        self.rules.iter().filter(move |r| r.category == category)
    }

    pub fn is_match(&self, category: Category, text: &str) -> bool {
        self.in_category(category).any(|r| r.regex.is_match(text))
    }

    /// First rule in table order that matches, with its leftmost match.
    pub fn first_match<'t>(&self, category: Category, text: &'t str) -> Option<(&Rule, Match<'t>)> {
        self.in_category(category)
            .find_map(|r| r.regex.find(text).map(|m| (r, m)))
    }

    /// Total number of non-overlapping matches across the category.
    pub fn count(&self, category: Category, text: &str) -> usize {
        self.in_category(category)
            .map(|r| r.regex.find_iter(text).count())
            .sum()
    }

    pub fn find_all<'t>(&self, category: Category, text: &'t str) -> Vec<Match<'t>> {
        self.in_category(category)
            .flat_map(|r| r.regex.find_iter(text))
            .collect()
    }

    /// Capture group 1 of every match in the category.
    pub fn captures<'t>(&self, category: Category, text: &'t str) -> Vec<&'t str> {
        self.in_category(category)
            .flat_map(|r| r.regex.captures_iter(text))
            .filter_map(|c| c.get(1).map(|m| m.as_str()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn rule(name: &'static str, category: Category, pattern: &str) -> Rule {
    Rule::new(
        name,
        category,
        Regex::new(pattern).expect("Invalid scanner rule pattern"),
    )
}

/// The production rule set.
pub static STANDARD_RULES: LazyLock<RuleBook> = LazyLock::new(|| {
    use Category::*;
    RuleBook::new(vec![
        // ── Context: positive language ──────────────────────────────
        rule("you_matter", Positive, r"(?i)\byou\s+(?:really\s+)?matter\b"),
        rule("here_for_you", Positive, r"(?i)\bhere\s+for\s+you\b"),
        rule("please_stay", Positive, r"(?i)\bplease\s+stay\b"),
        rule("not_alone", Positive, r"(?i)\byou(?:'re|\s+are)\s+not\s+alone\b"),
        rule("care_about_you", Positive, r"(?i)\b(?:care|cares)\s+about\s+you\b"),
        rule("gets_better", Positive, r"(?i)\bit\s+(?:gets|will\s+get)\s+better\b"),
        rule("you_are_loved", Positive, r"(?i)\byou(?:'re|\s+are)\s+(?:so\s+)?(?:loved|enough|worth\s+it|important)\b"),
        rule("proud_of_you", Positive, r"(?i)\b(?:proud\s+of|believe\s+in)\s+you\b"),
        rule("you_can_do_this", Positive, r"(?i)\byou\s+can\s+(?:do\s+this|get\s+through\s+this)\b"),
        rule("stay_strong", Positive, r"(?i)\b(?:stay\s+strong|sending\s+(?:love|hugs)|keep\s+going)\b"),
        rule("hope", Positive, r"(?i)\bhope\b"),
        // ── Context: negative language ──────────────────────────────
        rule("worthless", Negative, r"(?i)\b(?:worthless|hopeless|useless|pathetic|disgusting)\b"),
        rule("hate", Negative, r"(?i)\bhate\b"),
        rule("kill", Negative, r"(?i)\bkill\w*"),
        rule("death", Negative, r"(?i)\b(?:die|dead|death)\b"),
        rule("nobody_cares", Negative, r"(?i)\b(?:no\s*one|nobody)\s+(?:cares|loves\s+you|will\s+miss|would\s+miss)\b"),
        rule("give_up", Negative, r"(?i)\b(?:give\s+up|end\s+it|a\s+burden)\b"),
        // ── Context: tense ──────────────────────────────────────────
        rule("past_markers", PastTense, r"(?i)\b(?:used\s+to|was|were|had|felt|back\s+then|years\s+ago|last\s+(?:year|month|week))\b"),
        rule("future_markers", FutureReference, r"(?i)\b(?:will|tomorrow|someday|one\s+day|next\s+(?:week|month|year)|future|going\s+to)\b"),
        // ── Context: pronouns and framing ───────────────────────────
        rule("first_person", FirstPersonPronoun, r"(?i)\b(?:i|me|my|mine|myself|i'm|i've|i'll|i'd)\b"),
        rule("second_person", SecondPersonPronoun, r"(?i)\b(?:you|your|yours|yourself|you're|you've|you'll)\b"),
        rule("first_person_opener", FirstPersonOpener, r"(?i)^\W*(?:i|me|my|myself|i'm|i've|i'll|i'd)\b"),
        rule("concerning_verb", ConcerningVerb, r"(?i)\b(?:hurt|harm|kill|cut|hate|end|die|disappear|suffer|struggle|cry|feel|felt|want\s+to\s+die|give\s+up)\w*"),
        // ── Encouragement of harm ───────────────────────────────────
        rule("kill_yourself", Encouragement, r"(?i)\b(?:kill|hurt|harm|cut)\s+yourself\b"),
        rule("kys", Encouragement, r"(?i)\bkys\b"),
        rule("nobody_will_miss_you", Encouragement, r"(?i)\b(?:no\s*one|nobody)\s+(?:will|would)\s+(?:miss|care\s+about|notice)\s+you\b"),
        rule("better_without_you", Encouragement, r"(?i)\b(?:the\s+world|everyone|we)\s+(?:would\s+be|is|are)\s+better\s+(?:off\s+)?without\s+you\b"),
        rule("you_should_die", Encouragement, r"(?i)\byou\s+should\s+(?:just\s+)?(?:die|end\s+it|disappear)\b"),
        rule("end_your_life", Encouragement, r"(?i)\b(?:end|take)\s+your\s+(?:own\s+)?life\b"),
        // ── Protective language (suppresses encouragement) ──────────
        rule("negated_harm", Protective, r"(?i)\b(?:don'?t|do\s+not|never|please\s+don'?t)\s+(?:hurt|harm|kill|give\s+up)\b"),
        rule("reach_out", Protective, r"(?i)\b(?:reach\s+out|talk\s+to\s+someone|get\s+help|ask\s+for\s+help)\b"),
        rule("hotline", Protective, r"(?i)\b(?:hotline|helpline|crisis\s+line|988|samaritans)\b"),
        rule("is_a_lie", Protective, r"(?i)\b(?:that'?s|that\s+is|it'?s)\s+(?:a\s+lie|not\s+true)\b"),
        // ── Dehumanizing language ───────────────────────────────────
        rule("you_are_worthless", Dehumanizing, r"(?i)\byou(?:'re|\s+are)\s+(?:just\s+)?(?:worthless|nothing|garbage|trash|subhuman|vermin|a\s+waste\s+of\s+(?:space|air|oxygen))\b"),
        rule("not_human", Dehumanizing, r"(?i)\b(?:you(?:'re|\s+are)|people\s+like\s+you\s+are)\s+not\s+(?:even\s+)?(?:human|a\s+person)\b"),
        // ── Abusive language ────────────────────────────────────────
        rule("insult", Abusive, r"(?i)\b(?:idiot|stupid|moron|loser|pathetic|freak|ugly|disgusting)\b"),
        rule("hostility", Abusive, r"(?i)\b(?:shut\s+up|hate\s+you|screw\s+you|go\s+to\s+hell)\b"),
        rule("profanity_at", Abusive, r"(?i)\bf+u+c+k+\s+(?:you|off)\b"),
        // ── Instant block ───────────────────────────────────────────
        rule("spam_offer", Spam, r"(?i)\b(?:buy\s+now|click\s+here|free\s+money|act\s+now|limited\s+time\s+offer|crypto\s+giveaway|work\s+from\s+home\s+and\s+earn)\b"),
        rule("spam_products", Spam, r"(?i)\b(?:casino|viagra|cialis|payday\s+loan)\b"),
        rule("script_tag", MaliciousCode, r"(?i)<\s*(?:script|iframe|object|embed)\b"),
        rule("js_url", MaliciousCode, r"(?i)javascript\s*:"),
        rule("event_handler", MaliciousCode, r"(?i)\bon(?:load|error|click|mouseover|focus)\s*="),
        rule("eval_call", MaliciousCode, r"(?i)\b(?:eval\s*\(|document\.cookie)"),
        rule("link_host", LinkHost, r"(?i)(?:https?://)?(?:www\.)?((?:[a-z0-9-]+\.)+[a-z]{2,})\b"),
        // ── Imminent danger ─────────────────────────────────────────
        rule("jump", Method, r"(?i)\bjump(?:ing)?\s+(?:off|from)\s+(?:a|the)\s+(?:bridge|building|roof|cliff|tower)\b"),
        rule("overdose", Method, r"(?i)\b(?:overdos\w*|take\s+(?:all\s+)?(?:the|your|my)\s+pills)\b"),
        rule("hanging", Method, r"(?i)\bhang(?:ing)?\s+(?:yourself|myself)\b"),
        rule("wrists", Method, r"(?i)\bslit\s+(?:your|my)\s+wrists?\b"),
        rule("firearm", Method, r"(?i)\b(?:gun|shoot\s+(?:yourself|myself))\b"),
        rule("timing", Timing, r"(?i)\b(?:tonight|today|right\s+now|this\s+(?:evening|weekend|morning|afternoon)|tomorrow|in\s+an\s+hour)\b"),
    ])
});
