// Compiler/normalizer: raw heterogeneous rule definitions in, canonical
// compiled rules out.
//
// Sources hand over loosely-shaped entries (single pattern or per-locale
// map, responses as string/list/locale-map, bare or qualified callback
// names). Normalization squeezes them into the canonical Rule record and
// drops whatever cannot be used. Per-entry problems are never fatal: the
// entry is skipped, logged, and compilation continues.

use crate::dispatch::CallbackRegistry;
use crate::error::EngineError;
use crate::rule::{
    AccessLevel, CallbackRef, CompiledPattern, Locale, ResponseSet, Rule, RuleId, RuleOrigin,
    RulePattern, RuleStats, Severity,
};
use log::{debug, warn};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Upper bound on the compiled size of a single pattern. Oversized
/// patterns fail compilation instead of exhausting memory.
const PATTERN_SIZE_LIMIT: usize = 1 << 20;

// ============================================================================
// RAW ENTRY SHAPES
// ============================================================================

/// Pattern as a source declares it: one regex, or one per locale.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawPattern {
    Single(String),
    PerLocale(HashMap<String, String>),
}

/// Responses as a source declares them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawResponses {
    Single(String),
    List(Vec<String>),
    PerLocale(HashMap<String, RawResponseList>),
}

/// One locale's responses inside a per-locale map.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawResponseList {
    Single(String),
    List(Vec<String>),
}

/// A rule definition exactly as a source produced it.
///
/// Every field is optional; normalization fills defaults and decides
/// whether the entry is usable at all.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawRuleEntry {
    pub id: Option<String>,
    pub pattern: Option<RawPattern>,
    pub responses: Option<RawResponses>,
    pub callback: Option<String>,
    pub severity: Option<String>,
    pub priority: Option<i32>,
    pub enabled: Option<bool>,
    pub stop_processing: Option<bool>,
    pub access_level: Option<String>,
    pub description: Option<String>,
    pub group: Option<String>,
}

impl RawRuleEntry {
    /// Identity used in logs and skip records.
    pub fn label(&self, position: usize) -> String {
        self.id
            .clone()
            .or_else(|| self.description.clone())
            .unwrap_or_else(|| format!("entry #{}", position))
    }
}

// ============================================================================
// SKIP RECORDS
// ============================================================================

/// Why an entry was excluded from the compiled set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// No usable pattern was declared.
    MissingPattern,
    /// No locale branch compiled to a valid regex.
    InvalidPattern(String),
    /// The entry is disabled.
    Disabled,
    /// After normalization the entry has neither responses nor callback.
    NoAction,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::MissingPattern => write!(f, "no usable pattern"),
            SkipReason::InvalidPattern(e) => write!(f, "pattern failed to compile: {}", e),
            SkipReason::Disabled => write!(f, "disabled"),
            SkipReason::NoAction => write!(f, "neither responses nor callback"),
        }
    }
}

/// One dropped entry, with enough identity for operators.
#[derive(Debug, Clone)]
pub struct SkippedEntry {
    pub source: String,
    pub entry: String,
    pub reason: SkipReason,
}

impl SkippedEntry {
    /// The taxonomy category this skip belongs to, for operator logs.
    pub fn to_error(&self) -> EngineError {
        match &self.reason {
            SkipReason::InvalidPattern(reason) => EngineError::PatternCompile {
                rule: self.entry.clone(),
                reason: reason.clone(),
            },
            reason => EngineError::MalformedEntry {
                source_name: self.source.clone(),
                entry: self.entry.clone(),
                reason: reason.to_string(),
            },
        }
    }
}

/// Result of compiling one source's entries.
#[derive(Debug, Default)]
pub struct CompileOutcome {
    pub rules: Vec<Arc<Rule>>,
    pub skipped: Vec<SkippedEntry>,
}

// ============================================================================
// PATTERN COMPILATION
// ============================================================================

/// Strips `/body/flags` delimiters some sources carry around their
/// patterns. Flags are dropped: every pattern is compiled
/// case-insensitive and Unicode-aware anyway.
fn strip_delimiters(raw: &str) -> &str {
    if raw.starts_with('/') {
        if let Some(end) = raw.rfind('/') {
            if end > 0 {
                let flags = &raw[end + 1..];
                if flags.chars().all(|c| matches!(c, 'i' | 'u' | 'm' | 's' | 'x')) {
                    return &raw[1..end];
                }
            }
        }
    }
    raw
}

/// Compiles one pattern string, case-insensitive and Unicode-aware.
pub fn compile_pattern(raw: &str) -> Result<CompiledPattern, regex::Error> {
    let regex: Regex = RegexBuilder::new(strip_delimiters(raw))
        .case_insensitive(true)
        .size_limit(PATTERN_SIZE_LIMIT)
        .build()?;
    Ok(CompiledPattern::new(regex, raw))
}

/// Normalizes the raw pattern shape into compiled locale branches.
///
/// A per-locale branch that fails to compile is dropped on its own; the
/// whole entry fails only when no branch survives.
fn normalize_pattern(source: &str, label: &str, raw: &RawPattern) -> Result<RulePattern, SkipReason> {
    match raw {
        RawPattern::Single(text) => match compile_pattern(text) {
            Ok(pattern) => Ok(RulePattern::Simple(pattern)),
            Err(e) => Err(SkipReason::InvalidPattern(e.to_string())),
        },
        RawPattern::PerLocale(map) => {
            let mut compiled = HashMap::new();
            let mut last_error = String::new();
            for (tag, text) in map {
                match compile_pattern(text) {
                    Ok(pattern) => {
                        compiled.insert(Locale::new(tag.as_str()), pattern);
                    }
                    Err(e) => {
                        debug!(
                            "source '{}': dropping '{}' locale branch of '{}': {}",
                            source, tag, label, e
                        );
                        last_error = e.to_string();
                    }
                }
            }
            if compiled.is_empty() {
                Err(SkipReason::InvalidPattern(if last_error.is_empty() {
                    "empty locale map".to_string()
                } else {
                    last_error
                }))
            } else {
                Ok(RulePattern::Localized(compiled))
            }
        }
    }
}

/// Normalizes the raw response shape: absent becomes empty, a single
/// string becomes a singleton list, a locale map passes through.
fn normalize_responses(raw: Option<&RawResponses>) -> ResponseSet {
    match raw {
        None => ResponseSet::empty(),
        Some(RawResponses::Single(text)) => ResponseSet::Simple(vec![text.clone()]),
        Some(RawResponses::List(list)) => ResponseSet::Simple(list.clone()),
        Some(RawResponses::PerLocale(map)) => {
            let normalized = map
                .iter()
                .map(|(tag, list)| {
                    let list = match list {
                        RawResponseList::Single(text) => vec![text.clone()],
                        RawResponseList::List(list) => list.clone(),
                    };
                    (Locale::new(tag.as_str()), list)
                })
                .collect();
            ResponseSet::Localized(normalized)
        }
    }
}

/// Resolves a declared callback name to an invocable reference, or to "no
/// callback" when nothing in the registry answers to it.
fn normalize_callback(
    source: &str,
    label: &str,
    raw: Option<&String>,
    callbacks: &CallbackRegistry,
) -> Option<CallbackRef> {
    let name = raw.map(|n| n.trim()).filter(|n| !n.is_empty())?;
    let qualified = CallbackRef::qualify(source, name);
    if callbacks.contains(&qualified) {
        Some(qualified)
    } else {
        warn!(
            "source '{}': callback '{}' on '{}' is not registered, treating as no callback",
            source, qualified, label
        );
        None
    }
}

// ============================================================================
// COMPILATION
// ============================================================================

/// Compiles one source's raw entries into canonical rules.
///
/// `precedence` is the source's position in the merge order; it becomes
/// part of every rule's origin so the ordering tie-break stays
/// contractual. Skipped entries are returned alongside the rules and
/// logged; compilation itself never fails.
pub fn compile(
    source: &str,
    precedence: usize,
    entries: Vec<RawRuleEntry>,
    callbacks: &CallbackRegistry,
) -> CompileOutcome {
    let mut outcome = CompileOutcome::default();

    for (position, entry) in entries.into_iter().enumerate() {
        let label = entry.label(position);

        let skip = |reason: SkipReason, outcome: &mut CompileOutcome| {
            debug!("source '{}': skipping '{}': {}", source, label, reason);
            outcome.skipped.push(SkippedEntry {
                source: source.to_string(),
                entry: label.clone(),
                reason,
            });
        };

        // (1) No usable pattern means no rule.
        let raw_pattern = match entry.pattern.as_ref() {
            Some(p) => p,
            None => {
                skip(SkipReason::MissingPattern, &mut outcome);
                continue;
            }
        };
        let pattern = match normalize_pattern(source, &label, raw_pattern) {
            Ok(p) => p,
            Err(reason) => {
                skip(reason, &mut outcome);
                continue;
            }
        };

        // (2) Responses, (3) callback, (4) defaults.
        let responses = normalize_responses(entry.responses.as_ref());
        let callback = normalize_callback(source, &label, entry.callback.as_ref(), callbacks);
        let severity = entry
            .severity
            .as_deref()
            .map(Severity::parse)
            .unwrap_or_default();
        let access_level = entry
            .access_level
            .as_deref()
            .map(AccessLevel::parse)
            .unwrap_or_default();
        let enabled = entry.enabled.unwrap_or(true);

        // (5) Disabled entries and action-less entries are dropped.
        if !enabled {
            skip(SkipReason::Disabled, &mut outcome);
            continue;
        }
        if callback.is_none() && responses.is_empty() {
            skip(SkipReason::NoAction, &mut outcome);
            continue;
        }

        let rule = Rule {
            id: entry.id.map(RuleId::new).unwrap_or_else(RuleId::generate),
            pattern,
            responses,
            callback,
            severity,
            priority: entry.priority.unwrap_or(0),
            enabled,
            stop_processing: entry.stop_processing.unwrap_or(false),
            access_level,
            description: entry.description,
            group: entry.group,
            origin: RuleOrigin {
                source: source.to_string(),
                precedence,
                position,
            },
            stats: RuleStats::new(),
        };
        outcome.rules.push(Arc::new(rule));
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(value: serde_json::Value) -> RawRuleEntry {
        serde_json::from_value(value).unwrap()
    }

    fn empty_callbacks() -> CallbackRegistry {
        CallbackRegistry::new()
    }

    #[test]
    fn test_raw_entry_accepts_heterogeneous_shapes() {
        let single = entry(json!({"pattern": "^hi$", "responses": "hello"}));
        assert!(matches!(single.pattern, Some(RawPattern::Single(_))));
        assert!(matches!(single.responses, Some(RawResponses::Single(_))));

        let localized = entry(json!({
            "pattern": {"en": "^hello$", "pl": "^cześć$"},
            "responses": {"en": ["hi", "hey"], "pl": "cześć"}
        }));
        assert!(matches!(localized.pattern, Some(RawPattern::PerLocale(_))));
        assert!(matches!(localized.responses, Some(RawResponses::PerLocale(_))));
    }

    #[test]
    fn test_missing_pattern_is_skipped_silently() {
        let outcome = compile(
            "mod",
            0,
            vec![entry(json!({"responses": "hello"}))],
            &empty_callbacks(),
        );
        assert!(outcome.rules.is_empty());
        assert_eq!(outcome.skipped.len(), 1);
        assert_eq!(outcome.skipped[0].reason, SkipReason::MissingPattern);
    }

    #[test]
    fn test_invalid_regex_is_skipped_not_fatal() {
        let outcome = compile(
            "mod",
            0,
            vec![
                entry(json!({"pattern": "([unclosed", "responses": "x"})),
                entry(json!({"pattern": "^ok$", "responses": "y"})),
            ],
            &empty_callbacks(),
        );
        assert_eq!(outcome.rules.len(), 1);
        assert_eq!(outcome.skipped.len(), 1);
        assert!(matches!(
            outcome.skipped[0].reason,
            SkipReason::InvalidPattern(_)
        ));
    }

    #[test]
    fn test_action_less_entry_is_dropped() {
        let outcome = compile(
            "mod",
            0,
            vec![entry(json!({"pattern": "^hi$"}))],
            &empty_callbacks(),
        );
        assert!(outcome.rules.is_empty());
        assert_eq!(outcome.skipped[0].reason, SkipReason::NoAction);
    }

    #[test]
    fn test_disabled_entry_is_dropped() {
        let outcome = compile(
            "mod",
            0,
            vec![entry(
                json!({"pattern": "^hi$", "responses": "x", "enabled": false}),
            )],
            &empty_callbacks(),
        );
        assert!(outcome.rules.is_empty());
        assert_eq!(outcome.skipped[0].reason, SkipReason::Disabled);
    }

    #[test]
    fn test_defaults_applied() {
        let outcome = compile(
            "mod",
            0,
            vec![entry(json!({"pattern": "^hi$", "responses": "x"}))],
            &empty_callbacks(),
        );
        let rule = &outcome.rules[0];
        assert_eq!(rule.severity, Severity::Low);
        assert_eq!(rule.priority, 0);
        assert!(rule.enabled);
        assert!(!rule.stop_processing);
        assert_eq!(rule.access_level, AccessLevel::Public);
    }

    #[test]
    fn test_unresolvable_callback_becomes_none() {
        let callbacks = CallbackRegistry::new();
        callbacks.register("mod::known", |_caps, _ctx| {
            Ok(crate::dispatch::CallbackReply::Empty)
        });

        let outcome = compile(
            "mod",
            0,
            vec![
                entry(json!({"pattern": "^a$", "callback": "known"})),
                entry(json!({"pattern": "^b$", "callback": "unknown", "responses": "fine"})),
                entry(json!({"pattern": "^c$", "callback": "unknown"})),
            ],
            &callbacks,
        );

        // Bare name resolved against the declaring source.
        assert_eq!(outcome.rules[0].callback.as_ref().unwrap().as_str(), "mod::known");
        // Unresolvable callback degrades to "no callback"; responses keep it alive.
        assert!(outcome.rules[1].callback.is_none());
        // Without responses the entry has no action left.
        assert_eq!(outcome.skipped.len(), 1);
        assert_eq!(outcome.skipped[0].reason, SkipReason::NoAction);
    }

    #[test]
    fn test_qualified_callback_passes_through() {
        let callbacks = CallbackRegistry::new();
        callbacks.register("geo::lookup", |_caps, _ctx| {
            Ok(crate::dispatch::CallbackReply::Empty)
        });

        let outcome = compile(
            "mod",
            0,
            vec![entry(json!({"pattern": "^a$", "callback": "geo::lookup"}))],
            &callbacks,
        );
        assert_eq!(
            outcome.rules[0].callback.as_ref().unwrap().as_str(),
            "geo::lookup"
        );
    }

    #[test]
    fn test_single_response_becomes_singleton_list() {
        let outcome = compile(
            "mod",
            0,
            vec![entry(json!({"pattern": "^hi$", "responses": "hello"}))],
            &empty_callbacks(),
        );
        let resolved = outcome.rules[0]
            .responses
            .resolve(&Locale::default_locale(), &Locale::default_locale())
            .unwrap();
        assert_eq!(resolved, ["hello".to_string()]);
    }

    #[test]
    fn test_delimited_pattern_form_is_accepted() {
        assert_eq!(strip_delimiters("/^hi$/i"), "^hi$");
        assert_eq!(strip_delimiters("/^cześć$/iu"), "^cześć$");
        assert_eq!(strip_delimiters("^plain$"), "^plain$");
        assert_eq!(strip_delimiters("/"), "/");

        let outcome = compile(
            "mod",
            0,
            vec![entry(json!({"pattern": "/^hi$/i", "responses": "x"}))],
            &empty_callbacks(),
        );
        let (pattern, _) = outcome.rules[0]
            .pattern
            .resolve(&Locale::default_locale(), &Locale::default_locale())
            .unwrap();
        assert!(pattern.regex().is_match("HI"));
    }

    #[test]
    fn test_bad_locale_branch_dropped_individually() {
        let outcome = compile(
            "mod",
            0,
            vec![entry(json!({
                "pattern": {"en": "^hello$", "pl": "([broken"},
                "responses": "x"
            }))],
            &empty_callbacks(),
        );
        assert_eq!(outcome.rules.len(), 1);
        assert_eq!(outcome.rules[0].pattern.branch_count(), 1);
    }

    #[test]
    fn test_case_insensitive_unicode_matching() {
        let pattern = compile_pattern("^cześć$").unwrap();
        assert!(pattern.regex().is_match("CZEŚĆ"));
    }
}
