// Dispatch of matched rules: callback invocation or templated responses.
//
// The dispatch boundary is where partial failure is absorbed. A callback
// that errors, or returns nothing, degrades to the generic fallback reply;
// the caller of the engine always gets text back and never sees an error.

use crate::context::CallerContext;
use crate::error::CallbackError;
use crate::match_engine::MatchResult;
use crate::rule::{CallbackRef, Locale};
use log::{error, warn};
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Placeholder in response templates replaced with the first capture group.
const CAPTURE_TOKEN: &str = "%1";

// ============================================================================
// CALLBACK REGISTRY
// ============================================================================

/// What a bound action may hand back to the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum CallbackReply {
    /// Final reply text.
    Text(String),
    /// Reply text plus an opaque payload forwarded verbatim to the caller
    /// (a map marker, for instance).
    Structured { answer: String, payload: Value },
    /// No reply; the fallback is used.
    Empty,
}

/// Calling convention for bound actions:
/// ordered capture groups plus the caller context in, a tagged reply out.
pub type CallbackFn =
    dyn Fn(&[String], &CallerContext) -> Result<CallbackReply, CallbackError> + Send + Sync;

/// Lookup table of fully-qualified callback name to function, populated at
/// registration time.
#[derive(Default)]
pub struct CallbackRegistry {
    entries: RwLock<HashMap<String, Arc<CallbackFn>>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        CallbackRegistry::default()
    }

    /// Registers a callback under its fully-qualified name. A later
    /// registration under the same name replaces the earlier one.
    pub fn register<F>(&self, name: impl Into<String>, callback: F)
    where
        F: Fn(&[String], &CallerContext) -> Result<CallbackReply, CallbackError>
            + Send
            + Sync
            + 'static,
    {
        self.entries.write().insert(name.into(), Arc::new(callback));
    }

    pub fn contains(&self, reference: &CallbackRef) -> bool {
        self.entries.read().contains_key(reference.as_str())
    }

    pub fn get(&self, reference: &CallbackRef) -> Option<Arc<CallbackFn>> {
        self.entries.read().get(reference.as_str()).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl std::fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("len", &self.len())
            .finish()
    }
}

// ============================================================================
// PERSONA & REPLY
// ============================================================================

/// Persona-name substitution applied to every outgoing text.
#[derive(Debug, Clone)]
pub struct PersonaConfig {
    /// Name substituted into outgoing text.
    pub name: String,
    /// Token the templates use for the persona name.
    pub token: String,
}

impl PersonaConfig {
    pub fn new(name: impl Into<String>) -> Self {
        PersonaConfig {
            name: name.into(),
            ..PersonaConfig::default()
        }
    }

    /// Applies the substitution to a final text.
    pub fn apply(&self, text: &str) -> String {
        text.replace(&self.token, &self.name)
    }
}

impl Default for PersonaConfig {
    fn default() -> Self {
        PersonaConfig {
            name: "Iris".to_string(),
            token: "%botname%".to_string(),
        }
    }
}

/// Final dispatched reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub answer: String,
    /// Opaque callback payload, forwarded verbatim.
    pub payload: Option<Value>,
}

/// How a reply was produced, for telemetry and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplySource {
    /// A bound action produced the text.
    Callback,
    /// A response template was selected.
    Template,
    /// The generic fallback was substituted (no usable action, or the
    /// callback failed).
    Fallback,
}

/// A reply together with its provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatched {
    pub reply: Reply,
    pub source: ReplySource,
}

// ============================================================================
// DISPATCHER
// ============================================================================

/// Executes the action of a matched rule and produces the final reply.
pub struct Dispatcher {
    callbacks: Arc<CallbackRegistry>,
    persona: PersonaConfig,
    fallback_reply: String,
    default_locale: Locale,
}

impl Dispatcher {
    /// The fallback text used when none is configured.
    pub const DEFAULT_FALLBACK: &'static str = "Sorry, I did not understand that.";

    pub fn new(
        callbacks: Arc<CallbackRegistry>,
        persona: PersonaConfig,
        fallback_reply: impl Into<String>,
        default_locale: Locale,
    ) -> Self {
        Dispatcher {
            callbacks,
            persona,
            fallback_reply: fallback_reply.into(),
            default_locale,
        }
    }

    pub fn callbacks(&self) -> &Arc<CallbackRegistry> {
        &self.callbacks
    }

    /// The generic fallback reply, persona applied.
    pub fn fallback(&self) -> Dispatched {
        Dispatched {
            reply: Reply {
                answer: self.persona.apply(&self.fallback_reply),
                payload: None,
            },
            source: ReplySource::Fallback,
        }
    }

    /// Produces the reply for a matched rule.
    ///
    /// Callback rules invoke the bound action; failures and empty returns
    /// degrade to the fallback. Template rules pick uniformly at random
    /// among the configured templates for the resolved locale and
    /// substitute the capture placeholder. The persona substitution is
    /// applied to the final text either way, and the rule's hit counters
    /// are bumped.
    pub fn respond(&self, matched: &MatchResult, caller: &CallerContext) -> Dispatched {
        matched.rule.stats.record_hit();

        if let Some(reference) = matched.rule.callback.as_ref() {
            return self.respond_via_callback(reference, matched, caller);
        }
        self.respond_via_template(matched)
    }

    fn respond_via_callback(
        &self,
        reference: &CallbackRef,
        matched: &MatchResult,
        caller: &CallerContext,
    ) -> Dispatched {
        let callback = match self.callbacks.get(reference) {
            Some(cb) => cb,
            None => {
                // Compilation verified resolvability; a miss here means the
                // registry changed underneath the compiled set.
                warn!(
                    "callback '{}' for rule '{}' vanished from the registry",
                    reference, matched.rule.id
                );
                return self.respond_via_template(matched);
            }
        };

        match (*callback)(&matched.captures, caller) {
            Ok(CallbackReply::Text(answer)) => Dispatched {
                reply: Reply {
                    answer: self.persona.apply(&answer),
                    payload: None,
                },
                source: ReplySource::Callback,
            },
            Ok(CallbackReply::Structured { answer, payload }) => Dispatched {
                reply: Reply {
                    answer: self.persona.apply(&answer),
                    payload: Some(payload),
                },
                source: ReplySource::Callback,
            },
            Ok(CallbackReply::Empty) => self.fallback(),
            Err(e) => {
                error!(
                    "callback '{}' for rule '{}' failed: {}",
                    reference, matched.rule.id, e
                );
                self.fallback()
            }
        }
    }

    fn respond_via_template(&self, matched: &MatchResult) -> Dispatched {
        let templates = match matched
            .rule
            .responses
            .resolve(&matched.locale, &self.default_locale)
        {
            Some(templates) => templates,
            None => return self.fallback(),
        };

        let template = match templates.choose(&mut rand::thread_rng()) {
            Some(t) => t,
            None => return self.fallback(),
        };

        let substituted = match matched.captures.first() {
            Some(capture) if template.contains(CAPTURE_TOKEN) => {
                template.replace(CAPTURE_TOKEN, capture)
            }
            _ => template.clone(),
        };

        Dispatched {
            reply: Reply {
                answer: self.persona.apply(&substituted),
                payload: None,
            },
            source: ReplySource::Template,
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("callbacks", &self.callbacks.len())
            .field("persona", &self.persona.name)
            .field("default_locale", &self.default_locale)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::{compile, RawRuleEntry};
    use crate::match_engine::MatchResult;
    use crate::rule::Rule;
    use serde_json::json;

    fn compile_one(value: serde_json::Value, callbacks: &CallbackRegistry) -> Arc<Rule> {
        let entry: RawRuleEntry = serde_json::from_value(value).unwrap();
        let outcome = compile("mod", 0, vec![entry], callbacks);
        outcome.rules.into_iter().next().unwrap()
    }

    fn matched(rule: Arc<Rule>, captures: Vec<String>) -> MatchResult {
        MatchResult {
            rule,
            captures,
            locale: Locale::default_locale(),
        }
    }

    fn dispatcher(callbacks: Arc<CallbackRegistry>) -> Dispatcher {
        Dispatcher::new(
            callbacks,
            PersonaConfig::default(),
            Dispatcher::DEFAULT_FALLBACK,
            Locale::default_locale(),
        )
    }

    #[test]
    fn test_template_reply_stays_in_configured_set() {
        let callbacks = Arc::new(CallbackRegistry::new());
        let rule = compile_one(
            json!({"pattern": "^hi$", "responses": ["a", "b"]}),
            &callbacks,
        );
        let d = dispatcher(callbacks);

        for _ in 0..50 {
            let out = d.respond(&matched(Arc::clone(&rule), Vec::new()), &CallerContext::anonymous());
            assert_eq!(out.source, ReplySource::Template);
            assert!(out.reply.answer == "a" || out.reply.answer == "b");
        }
    }

    #[test]
    fn test_capture_substitution_leaves_no_token() {
        let callbacks = Arc::new(CallbackRegistry::new());
        let rule = compile_one(
            json!({"pattern": "^weather in (.+)$", "responses": "Weather for %1, coming up"}),
            &callbacks,
        );
        let d = dispatcher(callbacks);

        let out = d.respond(
            &matched(Arc::clone(&rule), vec!["Warsaw".to_string()]),
            &CallerContext::anonymous(),
        );
        assert!(out.reply.answer.contains("Warsaw"));
        assert!(!out.reply.answer.contains("%1"));
    }

    #[test]
    fn test_callback_text_and_structured_replies() {
        let callbacks = Arc::new(CallbackRegistry::new());
        callbacks.register("mod::text", |_caps, _ctx| {
            Ok(CallbackReply::Text("from callback".to_string()))
        });
        callbacks.register("mod::structured", |caps, _ctx| {
            Ok(CallbackReply::Structured {
                answer: format!("found {}", caps[0]),
                payload: json!({"lat": 52.23, "lon": 21.01}),
            })
        });

        let text_rule = compile_one(json!({"pattern": "^a$", "callback": "text"}), &callbacks);
        let structured_rule =
            compile_one(json!({"pattern": "^(b)$", "callback": "structured"}), &callbacks);
        let d = dispatcher(callbacks);

        let out = d.respond(&matched(text_rule, Vec::new()), &CallerContext::anonymous());
        assert_eq!(out.source, ReplySource::Callback);
        assert_eq!(out.reply.answer, "from callback");
        assert!(out.reply.payload.is_none());

        let out = d.respond(
            &matched(structured_rule, vec!["b".to_string()]),
            &CallerContext::anonymous(),
        );
        assert_eq!(out.reply.answer, "found b");
        assert_eq!(out.reply.payload, Some(json!({"lat": 52.23, "lon": 21.01})));
    }

    #[test]
    fn test_failing_callback_degrades_to_fallback() {
        let callbacks = Arc::new(CallbackRegistry::new());
        callbacks.register("mod::boom", |_caps, _ctx| {
            Err(CallbackError::new("upstream service down"))
        });
        let rule = compile_one(json!({"pattern": "^a$", "callback": "boom"}), &callbacks);
        let d = dispatcher(callbacks);

        let out = d.respond(&matched(rule, Vec::new()), &CallerContext::anonymous());
        assert_eq!(out.source, ReplySource::Fallback);
        assert_eq!(out.reply.answer, Dispatcher::DEFAULT_FALLBACK);
    }

    #[test]
    fn test_empty_callback_reply_uses_fallback() {
        let callbacks = Arc::new(CallbackRegistry::new());
        callbacks.register("mod::silent", |_caps, _ctx| Ok(CallbackReply::Empty));
        let rule = compile_one(json!({"pattern": "^a$", "callback": "silent"}), &callbacks);
        let d = dispatcher(callbacks);

        let out = d.respond(&matched(rule, Vec::new()), &CallerContext::anonymous());
        assert_eq!(out.source, ReplySource::Fallback);
    }

    #[test]
    fn test_persona_substitution_in_templates_and_fallback() {
        let callbacks = Arc::new(CallbackRegistry::new());
        let rule = compile_one(
            json!({"pattern": "^who$", "responses": "I am %botname%"}),
            &callbacks,
        );
        let d = Dispatcher::new(
            Arc::new(CallbackRegistry::new()),
            PersonaConfig::new("Vega"),
            "Ask %botname% something else",
            Locale::default_locale(),
        );

        let out = d.respond(&matched(rule, Vec::new()), &CallerContext::anonymous());
        assert_eq!(out.reply.answer, "I am Vega");
        assert_eq!(d.fallback().reply.answer, "Ask Vega something else");
    }

    #[test]
    fn test_hit_counter_incremented_on_dispatch() {
        let callbacks = Arc::new(CallbackRegistry::new());
        let rule = compile_one(json!({"pattern": "^hi$", "responses": "x"}), &callbacks);
        let d = dispatcher(callbacks);

        assert_eq!(rule.stats.hit_count(), 0);
        d.respond(&matched(Arc::clone(&rule), Vec::new()), &CallerContext::anonymous());
        assert_eq!(rule.stats.hit_count(), 1);
    }
}
