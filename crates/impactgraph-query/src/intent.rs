//! Query intent classification over a fixed keyword table.

use std::collections::BTreeMap;
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryIntent {
    CodeChange,
    Implementation,
    Debugging,
    Question,
    ImpactAnalysis,
}

impl QueryIntent {
    /// Tie-break order, strongest first.
    pub const PRECEDENCE: [QueryIntent; 5] = [
        QueryIntent::ImpactAnalysis,
        QueryIntent::Debugging,
        QueryIntent::CodeChange,
        QueryIntent::Implementation,
        QueryIntent::Question,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            QueryIntent::CodeChange => "code_change",
            QueryIntent::Implementation => "implementation",
            QueryIntent::Debugging => "debugging",
            QueryIntent::Question => "question",
            QueryIntent::ImpactAnalysis => "impact_analysis",
        }
    }

    /// One-line instruction placed at the top of the core layer.
    pub fn preamble(self) -> &'static str {
        match self {
            QueryIntent::CodeChange => {
                "Intent code_change: modify existing code; keep dependents and tests consistent."
            }
            QueryIntent::Implementation => {
                "Intent implementation: add new behaviour next to the related code and configuration."
            }
            QueryIntent::Debugging => {
                "Intent debugging: locate the failing path; related tests and issues follow."
            }
            QueryIntent::Question => {
                "Intent question: answer from the listed entities and documentation."
            }
            QueryIntent::ImpactAnalysis => {
                "Intent impact_analysis: list what depends on the seeds and how it would break."
            }
        }
    }
}

impl fmt::Display for QueryIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

struct Rule {
    intent: QueryIntent,
    weight: u32,
    pattern: Regex,
}

const RULE_TABLE: [(QueryIntent, u32, &str); 5] = [
    (
        QueryIntent::ImpactAnalysis,
        3,
        r"(?i)\b(impact(s|ed)?|affect(s|ed)?|break(s|ing)?|blast radius|ripple|downstream|dependents?|safe to (change|remove|rename|delete))\b",
    ),
    (
        QueryIntent::Debugging,
        3,
        r"(?i)\b(bug|error|exception|crash(es|ed)?|fail(s|ed|ing|ure)?|stack ?trace|debug(ging)?|broken|not working|regression|panic(s|ked)?|npe|fix)\b",
    ),
    (
        QueryIntent::CodeChange,
        2,
        r"(?i)\b(refactor(ing)?|rename|change|modify|update|replace|remove|delete|move|migrate|extract)\b",
    ),
    (
        QueryIntent::Implementation,
        2,
        r"(?i)\b(implement(ation)?|add|create|build|write|introduce|support for|integrate|scaffold)\b",
    ),
    (
        QueryIntent::Question,
        1,
        r"(?i)\b(what|why|how|where|which|who|explain|describe|overview)\b|\?",
    ),
];

static RULES: Lazy<Vec<Rule>> = Lazy::new(|| {
    RULE_TABLE
        .iter()
        .filter_map(|(intent, weight, pattern)| {
            Regex::new(pattern).ok().map(|pattern| Rule {
                intent: *intent,
                weight: *weight,
                pattern,
            })
        })
        .collect()
});

/// Weighted keyword score per intent.
pub fn intent_scores(query: &str) -> BTreeMap<QueryIntent, u32> {
    let mut scores: BTreeMap<QueryIntent, u32> = BTreeMap::new();
    for rule in RULES.iter() {
        let hits = rule.pattern.find_iter(query).count() as u32;
        if hits > 0 {
            *scores.entry(rule.intent).or_default() += hits * rule.weight;
        }
    }
    scores
}

/// Highest-scoring intent; ties follow [`QueryIntent::PRECEDENCE`], and a
/// query matching nothing is a question.
pub fn classify_intent(query: &str) -> QueryIntent {
    let scores = intent_scores(query);
    let best = scores.values().copied().max().unwrap_or(0);
    if best == 0 {
        return QueryIntent::Question;
    }
    QueryIntent::PRECEDENCE
        .into_iter()
        .find(|intent| scores.get(intent) == Some(&best))
        .unwrap_or(QueryIntent::Question)
}
