// First-match scan over the compiled rule set.
//
// The registry order is the sole ranking signal: the scan walks it front
// to back and the first rule whose pattern matches wins. Rules the access
// guard denies are invisible, not merely blocked later, so a lower-ranked
// visible rule can fire instead.

use crate::access::AccessGuard;
use crate::context::CallerContext;
use crate::registry::RuleSet;
use crate::rule::{Locale, Rule};
use std::sync::Arc;

/// A successful match: the rule, its ordered capture groups, and the
/// locale the pattern was resolved under.
#[derive(Debug, Clone)]
pub struct MatchResult {
    pub rule: Arc<Rule>,
    pub captures: Vec<String>,
    pub locale: Locale,
}

/// Scans rule sets in order and returns the first match.
#[derive(Debug, Clone)]
pub struct MatchEngine {
    guard: AccessGuard,
    default_locale: Locale,
}

impl MatchEngine {
    pub fn new(guard: AccessGuard, default_locale: Locale) -> Self {
        MatchEngine {
            guard,
            default_locale,
        }
    }

    pub fn guard(&self) -> &AccessGuard {
        &self.guard
    }

    /// Finds the first rule matching `text` for this caller and locale.
    ///
    /// Per rule: disabled rules and rules the guard denies are skipped;
    /// the pattern is resolved for the requested locale (a plain pattern
    /// is locale-independent, a locale map prefers the exact locale, then
    /// the default, else the rule is skipped for this request); matching
    /// is case-insensitive and Unicode-aware. First match wins and the
    /// scan stops.
    pub fn find_match(
        &self,
        rules: &RuleSet,
        text: &str,
        locale: &Locale,
        caller: &CallerContext,
    ) -> Option<MatchResult> {
        for rule in rules.iter() {
            if !rule.enabled {
                continue;
            }
            if !self.guard.permits(rule.access_level, caller) {
                continue;
            }

            let (pattern, used_locale) = match rule.pattern.resolve(locale, &self.default_locale) {
                Some(resolved) => resolved,
                None => continue,
            };

            if let Some(captures) = pattern.captures(text) {
                return Some(MatchResult {
                    rule: Arc::clone(rule),
                    captures,
                    locale: used_locale,
                });
            }
        }
        None
    }

    /// The rules in `rules` this caller is allowed to see, in scan order.
    ///
    /// The same guard decides visibility here and in `find_match`, so the
    /// two paths never diverge.
    pub fn visible_rules(&self, rules: &RuleSet, caller: &CallerContext) -> Vec<Arc<Rule>> {
        rules
            .iter()
            .filter(|rule| rule.enabled && self.guard.permits(rule.access_level, caller))
            .map(Arc::clone)
            .collect()
    }
}
