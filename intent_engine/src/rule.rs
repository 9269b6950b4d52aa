// Core rule model for the conversational dispatcher.
//
// This module defines the canonical Rule record every source compiles into,
// plus the small value types it is built from: identity, severity banding,
// access levels, locales, and the tagged pattern/response variants.
//
// A Rule is immutable once compiled into the active set; only its
// observability counters mutate, and those are atomics.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Current wall-clock time as epoch milliseconds.
pub fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

// ============================================================================
// IDENTITY
// ============================================================================

/// Unique identifier for a rule.
///
/// Sources may supply their own ids (the persisted store uses arbitrary
/// text keys); entries without one get a generated UUID v4.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleId(String);

impl RuleId {
    /// Creates a RuleId from a source-supplied string.
    pub fn new(id: impl Into<String>) -> Self {
        RuleId(id.into())
    }

    /// Generates a fresh random id for entries that carry none.
    pub fn generate() -> Self {
        RuleId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for RuleId {
    fn from(s: String) -> Self {
        RuleId(s)
    }
}

impl From<&str> for RuleId {
    fn from(s: &str) -> Self {
        RuleId(s.to_string())
    }
}

impl std::fmt::Display for RuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// SEVERITY & ACCESS LEVEL
// ============================================================================

/// Coarse priority band, the primary sort key ahead of the priority integer.
///
/// Unknown severity labels parse to `Unranked` (weight 0); they are never
/// an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    /// Label the engine does not recognise; sorts below everything else.
    Unranked,
}

impl Severity {
    /// Parses a severity label. Unknown labels map to `Unranked`.
    pub fn parse(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "critical" => Severity::Critical,
            "high" => Severity::High,
            "medium" => Severity::Medium,
            "low" => Severity::Low,
            _ => Severity::Unranked,
        }
    }

    /// Numeric weight used for ordering.
    pub fn weight(&self) -> u32 {
        match self {
            Severity::Critical => 100,
            Severity::High => 75,
            Severity::Medium => 50,
            Severity::Low => 25,
            Severity::Unranked => 0,
        }
    }
}

impl Default for Severity {
    fn default() -> Self {
        Severity::Low
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Critical => write!(f, "critical"),
            Severity::High => write!(f, "high"),
            Severity::Medium => write!(f, "medium"),
            Severity::Low => write!(f, "low"),
            Severity::Unranked => write!(f, "unranked"),
        }
    }
}

/// Minimum caller privilege a rule requires to be visible at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    /// Visible to every caller.
    Public,
    /// Visible only to non-anonymous callers.
    Authenticated,
    /// Visible only to callers holding the administrative capability.
    SuperAdmin,
}

impl AccessLevel {
    /// Parses an access-level label. Unknown labels fall back to `Public`.
    pub fn parse(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "authenticated" => AccessLevel::Authenticated,
            "super_admin" | "superadmin" => AccessLevel::SuperAdmin,
            _ => AccessLevel::Public,
        }
    }
}

impl Default for AccessLevel {
    fn default() -> Self {
        AccessLevel::Public
    }
}

impl std::fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessLevel::Public => write!(f, "public"),
            AccessLevel::Authenticated => write!(f, "authenticated"),
            AccessLevel::SuperAdmin => write!(f, "super_admin"),
        }
    }
}

// ============================================================================
// LOCALE
// ============================================================================

/// Lowercased locale tag ("en", "pl", ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Locale(String);

impl Locale {
    pub fn new(tag: impl Into<String>) -> Self {
        Locale(tag.into().trim().to_ascii_lowercase())
    }

    /// The default locale patterns and responses fall back to.
    pub fn default_locale() -> Self {
        Locale("en".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Locale {
    fn default() -> Self {
        Locale::default_locale()
    }
}

impl From<&str> for Locale {
    fn from(tag: &str) -> Self {
        Locale::new(tag)
    }
}

impl std::fmt::Display for Locale {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// PATTERNS
// ============================================================================

/// A compiled regex together with the raw text it came from.
///
/// Compilation happens once, at rule-compile time, case-insensitive and
/// Unicode-aware, with a size limit so a pathological pattern cannot blow
/// up compilation. The regex engine itself is linear-time, which bounds
/// match cost against short inputs.
#[derive(Debug, Clone)]
pub struct CompiledPattern {
    regex: Regex,
    raw: String,
}

impl CompiledPattern {
    pub fn new(regex: Regex, raw: impl Into<String>) -> Self {
        CompiledPattern {
            regex,
            raw: raw.into(),
        }
    }

    pub fn regex(&self) -> &Regex {
        &self.regex
    }

    /// The pattern text as the source wrote it (delimiters included).
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Runs the pattern and extracts ordered capture groups.
    ///
    /// Non-participating groups yield empty strings so positional
    /// substitution stays stable.
    pub fn captures(&self, text: &str) -> Option<Vec<String>> {
        let caps = self.regex.captures(text)?;
        Some(
            caps.iter()
                .skip(1)
                .map(|m| m.map(|m| m.as_str().to_string()).unwrap_or_default())
                .collect(),
        )
    }
}

/// Pattern shape of a rule: one regex for every locale, or one per locale.
#[derive(Debug, Clone)]
pub enum RulePattern {
    /// Locale-independent pattern.
    Simple(CompiledPattern),
    /// Per-locale patterns; resolution prefers the exact locale, then the
    /// default locale, else the rule is skipped for the request.
    Localized(HashMap<Locale, CompiledPattern>),
}

impl RulePattern {
    /// Resolves the pattern to try for a request locale.
    ///
    /// Returns the pattern and the locale it was resolved under (the
    /// requested locale for `Simple` patterns).
    pub fn resolve(&self, locale: &Locale, default: &Locale) -> Option<(&CompiledPattern, Locale)> {
        match self {
            RulePattern::Simple(pattern) => Some((pattern, locale.clone())),
            RulePattern::Localized(map) => {
                if let Some(pattern) = map.get(locale) {
                    Some((pattern, locale.clone()))
                } else {
                    map.get(default).map(|pattern| (pattern, default.clone()))
                }
            }
        }
    }

    /// Number of compiled locale branches.
    pub fn branch_count(&self) -> usize {
        match self {
            RulePattern::Simple(_) => 1,
            RulePattern::Localized(map) => map.len(),
        }
    }
}

// ============================================================================
// RESPONSES
// ============================================================================

/// Response templates of a rule: one list for every locale, or one per
/// locale.
#[derive(Debug, Clone)]
pub enum ResponseSet {
    Simple(Vec<String>),
    Localized(HashMap<Locale, Vec<String>>),
}

impl ResponseSet {
    /// An empty response set (rule answers through its callback only).
    pub fn empty() -> Self {
        ResponseSet::Simple(Vec::new())
    }

    /// Resolves the template list for a locale: exact locale first, then
    /// the default locale. Empty lists resolve to `None`.
    pub fn resolve(&self, locale: &Locale, default: &Locale) -> Option<&[String]> {
        let list = match self {
            ResponseSet::Simple(list) => Some(list),
            ResponseSet::Localized(map) => map.get(locale).or_else(|| map.get(default)),
        };
        list.filter(|l| !l.is_empty()).map(|l| l.as_slice())
    }

    /// True if no locale has any template.
    pub fn is_empty(&self) -> bool {
        match self {
            ResponseSet::Simple(list) => list.is_empty(),
            ResponseSet::Localized(map) => map.values().all(|l| l.is_empty()),
        }
    }
}

// ============================================================================
// CALLBACK REFERENCE & ORIGIN
// ============================================================================

/// Fully-qualified callback key, `"<source>::<action>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallbackRef(String);

impl CallbackRef {
    /// Separator between the source name and the action name.
    pub const SEPARATOR: &'static str = "::";

    /// Qualifies a bare action name against its declaring source.
    /// Names already containing the separator pass through unchanged.
    pub fn qualify(source: &str, name: &str) -> Self {
        if name.contains(Self::SEPARATOR) {
            CallbackRef(name.to_string())
        } else {
            CallbackRef(format!("{}{}{}", source, Self::SEPARATOR, name))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CallbackRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a rule came from, for the contractual ordering tie-break.
///
/// `precedence` is the position of the declaring source in the merge order;
/// `position` is the entry's original index within that source. Together
/// they make sorting deterministic and idempotent for equal
/// (severity, priority) keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleOrigin {
    /// Name of the declaring source ("store", module name, ...).
    pub source: String,
    /// Source position in the merge order.
    pub precedence: usize,
    /// Entry position within the source.
    pub position: usize,
}

// ============================================================================
// OBSERVABILITY COUNTERS
// ============================================================================

/// Per-rule hit counters, updated lock-free on the dispatch path.
#[derive(Debug, Default)]
pub struct RuleStats {
    hit_count: AtomicU64,
    last_used_at_ms: AtomicU64,
}

impl RuleStats {
    pub fn new() -> Self {
        RuleStats::default()
    }

    /// Records a dispatch of this rule.
    pub fn record_hit(&self) {
        self.hit_count.fetch_add(1, Ordering::Relaxed);
        self.last_used_at_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn hit_count(&self) -> u64 {
        self.hit_count.load(Ordering::Relaxed)
    }

    /// Timestamp of the most recent dispatch, if any.
    pub fn last_used_at(&self) -> Option<DateTime<Utc>> {
        match self.last_used_at_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => DateTime::from_timestamp_millis(ms as i64),
        }
    }
}

// ============================================================================
// RULE
// ============================================================================

/// Canonical compiled rule: pattern + action + metadata describing one
/// recognisable user intent.
///
/// Invariants established by the compiler:
/// - the pattern has at least one compiled locale branch;
/// - at least one of responses/callback is present;
/// - disabled entries never reach a compiled set.
#[derive(Debug)]
pub struct Rule {
    pub id: RuleId,
    pub pattern: RulePattern,
    pub responses: ResponseSet,
    pub callback: Option<CallbackRef>,
    pub severity: Severity,
    pub priority: i32,
    pub enabled: bool,
    /// Reserved for a future chaining behaviour; a matched rule always
    /// halts the scan today.
    pub stop_processing: bool,
    pub access_level: AccessLevel,
    /// Informational only; never affects matching.
    pub description: Option<String>,
    /// Informational grouping label.
    pub group: Option<String>,
    pub origin: RuleOrigin,
    pub stats: RuleStats,
}

impl Rule {
    /// Sort key: severity weight descending, priority descending, then the
    /// contractual merge-order tie-break.
    pub fn sort_key(&self) -> (std::cmp::Reverse<u32>, std::cmp::Reverse<i32>, usize, usize) {
        (
            std::cmp::Reverse(self.severity.weight()),
            std::cmp::Reverse(self.priority),
            self.origin.precedence,
            self.origin.position,
        )
    }

    /// True if the rule can answer at all.
    pub fn has_action(&self) -> bool {
        self.callback.is_some() || !self.responses.is_empty()
    }
}
