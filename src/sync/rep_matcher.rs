//! Maps the free-text rep name typed into a CRM field onto a known rep.
//!
//! Rules are tried in a fixed order and the first one that fires wins; within
//! a rule, the first rep in list order wins. Callers skip the contact on
//! [`RepMatch::NoMatch`] rather than guessing.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;

use crate::leads::storage::RepRecord;

static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchRule {
    Alias,
    Exact,
    HyphenPrefix,
    FirstName,
    Substring,
}

impl fmt::Display for MatchRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MatchRule::Alias => "alias",
            MatchRule::Exact => "exact",
            MatchRule::HyphenPrefix => "hyphen-prefix",
            MatchRule::FirstName => "first-name",
            MatchRule::Substring => "substring",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepMatch {
    Matched { rep: RepRecord, rule: MatchRule },
    NoMatch,
}

impl RepMatch {
    pub fn rep(&self) -> Option<&RepRecord> {
        match self {
            RepMatch::Matched { rep, .. } => Some(rep),
            RepMatch::NoMatch => None,
        }
    }
}

type Rule = fn(&RepMatcher, &str) -> Option<usize>;

const RULES: [(MatchRule, Rule); 5] = [
    (MatchRule::Alias, alias_rule),
    (MatchRule::Exact, exact_rule),
    (MatchRule::HyphenPrefix, hyphen_prefix_rule),
    (MatchRule::FirstName, first_name_rule),
    (MatchRule::Substring, substring_rule),
];

pub struct RepMatcher {
    reps: Vec<RepRecord>,
    names: Vec<String>,
    aliases: BTreeMap<String, String>,
}

impl RepMatcher {
    pub fn new<I, K, V>(reps: Vec<RepRecord>, aliases: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let names = reps.iter().map(|r| normalize(&r.name)).collect();
        let aliases = aliases
            .into_iter()
            .map(|(k, v)| (normalize(k.as_ref()), normalize(v.as_ref())))
            .filter(|(k, v)| !k.is_empty() && !v.is_empty())
            .collect();
        Self {
            reps,
            names,
            aliases,
        }
    }

    pub fn reps(&self) -> &[RepRecord] {
        &self.reps
    }

    pub fn resolve(&self, raw: &str) -> RepMatch {
        let input = normalize(raw);
        if input.is_empty() {
            return RepMatch::NoMatch;
        }

        RULES
            .iter()
            .find_map(|(rule, apply)| {
                apply(self, &input).map(|idx| RepMatch::Matched {
                    rep: self.reps[idx].clone(),
                    rule: *rule,
                })
            })
            .unwrap_or(RepMatch::NoMatch)
    }

    fn position(&self, pred: impl Fn(&str) -> bool) -> Option<usize> {
        self.names.iter().position(|name| !name.is_empty() && pred(name))
    }
}

fn normalize(value: &str) -> String {
    WHITESPACE_RE
        .replace_all(value.trim(), " ")
        .to_lowercase()
}

fn first_word(name: &str) -> &str {
    name.split(' ').next().unwrap_or(name)
}

fn alias_rule(m: &RepMatcher, input: &str) -> Option<usize> {
    let target = m.aliases.get(input)?;
    let found = m.position(|name| name == target);
    if found.is_none() {
        log::warn!("Alias {:?} points at unknown rep {:?}", input, target);
    }
    found
}

fn exact_rule(m: &RepMatcher, input: &str) -> Option<usize> {
    m.position(|name| name == input)
}

/// "Name - Language" style entries: match on the text before the first hyphen.
fn hyphen_prefix_rule(m: &RepMatcher, input: &str) -> Option<usize> {
    let (prefix, _) = input.split_once('-')?;
    let prefix = prefix.trim();
    if prefix.is_empty() {
        return None;
    }
    m.position(|name| name == prefix || first_word(name) == prefix)
}

fn first_name_rule(m: &RepMatcher, input: &str) -> Option<usize> {
    if input.contains(' ') {
        return None;
    }
    m.position(|name| first_word(name) == input)
}

fn substring_rule(m: &RepMatcher, input: &str) -> Option<usize> {
    m.position(|name| name.contains(input) || input.contains(name))
}
