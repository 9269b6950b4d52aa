//! # Dispatch Service
//!
//! Ties the engine pieces into the request path:
//! receive text -> ensure the registry is warm -> scan for the first
//! visible match -> dispatch (callback or template) -> substitute and
//! apply the persona -> return the reply.
//!
//! The service never returns "no answer": absence of a match, and any
//! action failure, produce the configured fallback reply. The only error
//! a caller can see is a request-contract violation caught before the
//! engine runs.

use crate::api_types::{DispatchRequest, DispatchResponse, RequestError};
use crate::telemetry::{DispatchTelemetry, TelemetrySnapshot};
use intent_engine::{
    AccessGuard, CallerContext, Dispatcher, Locale, MatchEngine, PersonaConfig, ReplySource, Rule,
    RuleRegistry,
};
use log::debug;
use std::sync::Arc;

// ================================================================================================
// CONFIGURATION
// ================================================================================================

/// Service-level configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Generic fallback reply used when nothing matches or an action
    /// fails.
    pub fallback_reply: String,
    /// Persona-name substitution applied to every outgoing text.
    pub persona: PersonaConfig,
    /// Locale patterns and responses fall back to.
    pub default_locale: Locale,
    /// Upper bound on request content, in characters.
    pub max_content_chars: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            fallback_reply: Dispatcher::DEFAULT_FALLBACK.to_string(),
            persona: PersonaConfig::default(),
            default_locale: Locale::default_locale(),
            max_content_chars: 255,
        }
    }
}

// ================================================================================================
// DISPATCH SERVICE
// ================================================================================================

/// The conversational dispatcher: one instance serves many concurrent
/// request handlers; all shared state sits behind the registry's atomic
/// publish and the telemetry counters.
pub struct DispatchService {
    registry: Arc<RuleRegistry>,
    engine: MatchEngine,
    dispatcher: Dispatcher,
    telemetry: Arc<DispatchTelemetry>,
    config: ServiceConfig,
}

impl DispatchService {
    pub fn new(registry: Arc<RuleRegistry>, config: ServiceConfig) -> Self {
        let engine = MatchEngine::new(AccessGuard::new(), config.default_locale.clone());
        let dispatcher = Dispatcher::new(
            Arc::clone(registry.callbacks()),
            config.persona.clone(),
            config.fallback_reply.clone(),
            config.default_locale.clone(),
        );

        DispatchService {
            registry,
            engine,
            dispatcher,
            telemetry: Arc::new(DispatchTelemetry::new()),
            config,
        }
    }

    pub fn registry(&self) -> &Arc<RuleRegistry> {
        &self.registry
    }

    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.telemetry.snapshot()
    }

    /// Handles one request end to end.
    ///
    /// The `Err` branch covers request-contract violations only; once the
    /// engine runs, a reply is guaranteed.
    pub fn handle(
        &self,
        request: &DispatchRequest,
        caller: &CallerContext,
    ) -> Result<DispatchResponse, RequestError> {
        request.validate(self.config.max_content_chars)?;
        self.telemetry.record_request();

        // Thread the requested timezone into the caller context so
        // callbacks can read it.
        let caller = match request.timezone.as_deref() {
            Some(tz) => caller.clone().with_timezone(tz),
            None => caller.clone(),
        };

        let rules = self.registry.snapshot();
        let content = request.content.trim();

        let dispatched = match self.engine.find_match(&rules, content, &caller.locale, &caller) {
            Some(matched) => {
                self.telemetry.record_match();
                debug!(
                    "matched rule '{}' from '{}' for caller {:?}",
                    matched.rule.id,
                    matched.rule.origin.source,
                    caller.identity.as_deref().unwrap_or("<anonymous>")
                );
                let dispatched = self.dispatcher.respond(&matched, &caller);
                if dispatched.source == ReplySource::Fallback {
                    self.telemetry.record_degraded();
                }
                dispatched
            }
            None => self.dispatcher.fallback(),
        };

        if dispatched.source == ReplySource::Fallback {
            self.telemetry.record_fallback();
        }

        Ok(DispatchResponse {
            question: request.content.clone(),
            answer: dispatched.reply.answer,
            payload: dispatched.reply.payload,
        })
    }

    /// Lists the rules this caller is allowed to see, in scan order.
    ///
    /// Visibility comes from the same guard the match scan uses, so the
    /// two paths cannot diverge.
    pub fn available_rules(&self, caller: &CallerContext) -> Vec<Arc<Rule>> {
        let rules = self.registry.snapshot();
        self.engine.visible_rules(&rules, caller)
    }
}

impl std::fmt::Debug for DispatchService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchService")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish()
    }
}
