//! Cross-artifact identity resolution.
//!
//! Raw names coming from extractors are folded into canonical keys through a
//! chain of naming-convention transforms chosen by the entity's
//! [`NamingScope`]. `findUserById`, `find_user_by_id` and `UserService#findUserById()`
//! end up as the same key in the code scope; `database.url`, `DATABASE_URL` and
//! `${database-url}` as the same key in the config scope.
//!
//! Everything here is a pure function of the input and the registry value.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::{EntityKind, EntityRef, NamingScope};

/// Normalized identity: entity kind plus folded name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CanonicalKey {
    pub kind: EntityKind,
    pub key: String,
}

impl CanonicalKey {
    pub fn new(kind: EntityKind, key: impl Into<String>) -> Self {
        Self {
            kind,
            key: key.into(),
        }
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.key)
    }
}

/// Scope-qualified alias key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AliasKey {
    pub scope: NamingScope,
    pub key: String,
}

impl AliasKey {
    pub fn new(scope: NamingScope, key: impl Into<String>) -> Self {
        Self {
            scope,
            key: key.into(),
        }
    }
}

/// One naming-convention transform step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "transform", rename_all = "snake_case")]
pub enum NamingTransform {
    Trim,
    Lowercase,
    CollapseWhitespace,
    /// `save(User u)` -> `save`, `List<String>` -> `List`
    StripCallArguments,
    /// `${db.url:default}` -> `db.url`
    StripPlaceholder,
    StripPrefixes { prefixes: Vec<String> },
    /// Rewrites every separator to `into` (segment boundaries).
    UnifySeparators { separators: Vec<String>, into: char },
    /// Splits each `segment_separator`-delimited segment into lowercase words
    /// (camel/Pascal/snake/kebab boundaries) joined by `join`.
    FoldWords {
        segment_separator: Option<char>,
        join: char,
    },
}

impl NamingTransform {
    pub fn apply(&self, input: &str) -> String {
        match self {
            NamingTransform::Trim => input.trim().to_string(),
            NamingTransform::Lowercase => input.to_lowercase(),
            NamingTransform::CollapseWhitespace => {
                input.split_whitespace().collect::<Vec<_>>().join(" ")
            }
            NamingTransform::StripCallArguments => strip_call_arguments(input),
            NamingTransform::StripPlaceholder => strip_placeholder(input),
            NamingTransform::StripPrefixes { prefixes } => {
                let mut out = input;
                let mut changed = true;
                while changed {
                    changed = false;
                    for prefix in prefixes {
                        if let Some(rest) = out.strip_prefix(prefix.as_str()) {
                            out = rest;
                            changed = true;
                        }
                    }
                }
                out.to_string()
            }
            NamingTransform::UnifySeparators { separators, into } => {
                let mut out = input.to_string();
                for sep in separators {
                    out = out.replace(sep.as_str(), &into.to_string());
                }
                out
            }
            NamingTransform::FoldWords {
                segment_separator,
                join,
            } => match segment_separator {
                Some(sep) => input
                    .split(*sep)
                    .map(|segment| split_words(segment).join(&join.to_string()))
                    .filter(|segment| !segment.is_empty())
                    .collect::<Vec<_>>()
                    .join(&sep.to_string()),
                None => split_words(input).join(&join.to_string()),
            },
        }
    }
}

/// How aliases are derived from a raw name in one scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AliasStrategy {
    None,
    /// Last segment of a qualified name (`UserService.findUserById` -> `find_user_by_id`).
    LastSegment,
    /// File name without directories (`docs/setup.md` -> `setup.md`).
    FileName,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeRules {
    pub transforms: Vec<NamingTransform>,
    pub alias: AliasStrategy,
}

/// Pluggable transform registry: one transform chain per naming scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformRegistry {
    scopes: BTreeMap<NamingScope, ScopeRules>,
}

impl Default for TransformRegistry {
    fn default() -> Self {
        let mut scopes = BTreeMap::new();
        scopes.insert(
            NamingScope::Code,
            ScopeRules {
                transforms: vec![
                    NamingTransform::Trim,
                    NamingTransform::StripCallArguments,
                    NamingTransform::StripPrefixes {
                        prefixes: vec![
                            "self.".into(),
                            "this.".into(),
                            "crate::".into(),
                            "@".into(),
                        ],
                    },
                    NamingTransform::UnifySeparators {
                        separators: vec!["::".into(), "#".into(), "->".into(), "/".into()],
                        into: '.',
                    },
                    NamingTransform::FoldWords {
                        segment_separator: Some('.'),
                        join: '_',
                    },
                ],
                alias: AliasStrategy::LastSegment,
            },
        );
        scopes.insert(
            NamingScope::Config,
            ScopeRules {
                transforms: vec![
                    NamingTransform::Trim,
                    NamingTransform::StripPlaceholder,
                    NamingTransform::FoldWords {
                        segment_separator: None,
                        join: '.',
                    },
                ],
                alias: AliasStrategy::None,
            },
        );
        scopes.insert(
            NamingScope::Prose,
            ScopeRules {
                transforms: vec![
                    NamingTransform::Trim,
                    NamingTransform::UnifySeparators {
                        separators: vec!["\\".into()],
                        into: '/',
                    },
                    NamingTransform::StripPrefixes {
                        prefixes: vec!["./".into()],
                    },
                    NamingTransform::CollapseWhitespace,
                    NamingTransform::Lowercase,
                ],
                alias: AliasStrategy::FileName,
            },
        );
        scopes.insert(
            NamingScope::Tracker,
            ScopeRules {
                transforms: vec![
                    NamingTransform::Trim,
                    NamingTransform::CollapseWhitespace,
                    NamingTransform::Lowercase,
                ],
                alias: AliasStrategy::None,
            },
        );
        Self { scopes }
    }
}

impl TransformRegistry {
    pub fn empty() -> Self {
        Self {
            scopes: BTreeMap::new(),
        }
    }

    /// Replaces the transform chain of one scope.
    pub fn with_scope(mut self, scope: NamingScope, rules: ScopeRules) -> Self {
        self.scopes.insert(scope, rules);
        self
    }

    pub fn rules(&self, scope: NamingScope) -> Option<&ScopeRules> {
        self.scopes.get(&scope)
    }

    /// Folds a raw name through the chain of the given scope.
    pub fn normalize(&self, scope: NamingScope, raw: &str) -> String {
        match self.scopes.get(&scope) {
            Some(rules) => rules
                .transforms
                .iter()
                .fold(raw.to_string(), |acc, t| t.apply(&acc)),
            None => raw.trim().to_string(),
        }
    }

    pub fn canonical_key(&self, entity: &EntityRef) -> CanonicalKey {
        CanonicalKey::new(entity.kind, self.normalize(entity.kind.scope(), &entity.name))
    }

    /// Alias keys derived from a raw name. The first one is the canonical key
    /// itself, qualified by scope.
    pub fn alias_keys(&self, entity: &EntityRef) -> Vec<AliasKey> {
        let scope = entity.kind.scope();
        let canonical = self.normalize(scope, &entity.name);
        let strategy = self
            .scopes
            .get(&scope)
            .map(|r| r.alias)
            .unwrap_or(AliasStrategy::None);
        let derived = match strategy {
            AliasStrategy::None => None,
            AliasStrategy::LastSegment => canonical.rsplit('.').next().map(str::to_string),
            AliasStrategy::FileName => canonical.rsplit('/').next().map(str::to_string),
        };
        let mut aliases = vec![AliasKey::new(scope, canonical.clone())];
        if let Some(alias) = derived {
            if !alias.is_empty() && alias != canonical {
                aliases.push(AliasKey::new(scope, alias));
            }
        }
        aliases
    }

    /// Keys a free-text term could resolve to in every scope.
    pub fn probe_keys(&self, term: &str) -> Vec<AliasKey> {
        let mut keys: Vec<AliasKey> = NamingScope::ALL
            .into_iter()
            .map(|scope| AliasKey::new(scope, self.normalize(scope, term)))
            .filter(|k| !k.key.is_empty())
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }
}

fn strip_call_arguments(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut depth_paren = 0usize;
    let mut depth_angle = 0usize;
    for c in input.chars() {
        match c {
            '(' => depth_paren += 1,
            ')' => depth_paren = depth_paren.saturating_sub(1),
            '<' => depth_angle += 1,
            '>' if depth_angle > 0 => depth_angle -= 1,
            _ if depth_paren == 0 && depth_angle == 0 => out.push(c),
            _ => {}
        }
    }
    out
}

fn strip_placeholder(input: &str) -> String {
    let trimmed = input.trim();
    match trimmed
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
    {
        Some(inner) => inner.split(':').next().unwrap_or(inner).to_string(),
        None => trimmed.to_string(),
    }
}

/// Splits an identifier into lowercase words on case, digit-to-letter and
/// punctuation boundaries. Acronyms stay together (`HTTPServer` -> `http`, `server`).
pub fn split_words(input: &str) -> Vec<String> {
    let chars: Vec<char> = input.chars().collect();
    let mut words = Vec::new();
    let mut current = String::new();

    for (i, &c) in chars.iter().enumerate() {
        if !c.is_alphanumeric() {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            continue;
        }
        if c.is_uppercase() && !current.is_empty() {
            let prev = chars[i - 1];
            let next_is_lower = chars.get(i + 1).map(|n| n.is_lowercase()).unwrap_or(false);
            if prev.is_lowercase() || prev.is_ascii_digit() || (prev.is_uppercase() && next_is_lower)
            {
                words.push(std::mem::take(&mut current));
            }
        }
        current.extend(c.to_lowercase());
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}
