use std::collections::BTreeSet;
use std::fmt;

use impactgraph_core::EntityKind;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::intent::QueryIntent;

/// Knowledge domains a bundle can draw from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Code,
    Configuration,
    Documentation,
    Testing,
    Tracking,
}

impl Domain {
    pub const ALL: [Domain; 5] = [
        Domain::Code,
        Domain::Configuration,
        Domain::Documentation,
        Domain::Testing,
        Domain::Tracking,
    ];

    pub fn of_kind(kind: EntityKind) -> Domain {
        match kind {
            EntityKind::Class
            | EntityKind::Interface
            | EntityKind::Method
            | EntityKind::Function
            | EntityKind::Field
            | EntityKind::Module
            | EntityKind::Endpoint => Domain::Code,
            EntityKind::ConfigKey => Domain::Configuration,
            EntityKind::Document | EntityKind::Section => Domain::Documentation,
            EntityKind::TestCase | EntityKind::TestFixture => Domain::Testing,
            EntityKind::Issue | EntityKind::Milestone | EntityKind::Project => Domain::Tracking,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Domain::Code => "code",
            Domain::Configuration => "configuration",
            Domain::Documentation => "documentation",
            Domain::Testing => "testing",
            Domain::Tracking => "tracking",
        }
    }

    /// Domains every query of `intent` consults.
    pub fn for_intent(intent: QueryIntent) -> &'static [Domain] {
        match intent {
            QueryIntent::CodeChange => &[Domain::Code, Domain::Testing],
            QueryIntent::Implementation => &[Domain::Code, Domain::Configuration],
            QueryIntent::Debugging => &[Domain::Code, Domain::Testing, Domain::Tracking],
            QueryIntent::Question => &[Domain::Code, Domain::Documentation],
            QueryIntent::ImpactAnalysis => &[
                Domain::Code,
                Domain::Configuration,
                Domain::Documentation,
                Domain::Testing,
            ],
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

const HINT_TABLE: [(Domain, &str); 5] = [
    (
        Domain::Code,
        r"(?i)\b(class|method|function|code|api|endpoint|module|interface)\b",
    ),
    (
        Domain::Configuration,
        r"(?i)\b(config(uration)?|settings?|propert(y|ies)|ya?ml|env(ironment)?|toml|flag)\b",
    ),
    (
        Domain::Documentation,
        r"(?i)\b(docs?|documentation|readme|guide|wiki|manual)\b",
    ),
    (
        Domain::Testing,
        r"(?i)\b(tests?|testing|spec|fixtures?|coverage|assert(ion)?s?)\b",
    ),
    (
        Domain::Tracking,
        r"(?i)\b(issues?|tickets?|milestones?|projects?|board|backlog|pull requests?)\b",
    ),
];

static HINTS: Lazy<Vec<(Domain, Regex)>> = Lazy::new(|| {
    HINT_TABLE
        .iter()
        .filter_map(|(domain, pattern)| Regex::new(pattern).ok().map(|re| (*domain, re)))
        .collect()
});

/// Domains for a query: the intent's table entry, keyword hints in the
/// query text and the domains of the focal entities.
pub fn match_domains(
    intent: QueryIntent,
    query: &str,
    focal_kinds: impl IntoIterator<Item = EntityKind>,
) -> BTreeSet<Domain> {
    let mut domains: BTreeSet<Domain> = Domain::for_intent(intent).iter().copied().collect();
    domains.extend(
        HINTS
            .iter()
            .filter(|(_, re)| re.is_match(query))
            .map(|(domain, _)| *domain),
    );
    domains.extend(focal_kinds.into_iter().map(Domain::of_kind));
    domains
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_hint_compiles() {
        assert_eq!(HINTS.len(), HINT_TABLE.len());
    }

    #[test]
    fn every_kind_has_a_domain() {
        for kind in EntityKind::ALL {
            let domain = Domain::of_kind(kind);
            assert!(Domain::ALL.contains(&domain));
        }
    }

    #[test]
    fn hints_and_focal_kinds_extend_the_intent_domains() {
        let domains = match_domains(
            QueryIntent::Question,
            "where is the readme for the yaml settings",
            [EntityKind::Issue],
        );
        assert_eq!(
            domains,
            BTreeSet::from([
                Domain::Code,
                Domain::Configuration,
                Domain::Documentation,
                Domain::Tracking,
            ])
        );
    }
}
