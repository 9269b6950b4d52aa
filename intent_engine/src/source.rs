// Rule sources: the capability contract and the module set.
//
// A rule source produces raw rule definitions plus a modification marker
// the registry uses for cache invalidation. Code-declared rule modules are
// registered explicitly at start-up through the builder below; the
// persisted store adapter lives in the service crate and implements the
// same contract.

use crate::compile::RawRuleEntry;
use crate::dispatch::{CallbackRegistry, CallbackReply};
use crate::error::{CallbackError, EngineError};
use crate::rule::CallbackRef;
use log::warn;
use std::sync::Arc;

// ============================================================================
// CAPABILITY CONTRACT
// ============================================================================

/// Capability contract a rule-providing source implements.
///
/// `patterns()` is the expensive call (may hit the file system or a
/// database) and runs only on cache miss; `mtime()` must stay cheap, it is
/// probed to detect staleness.
pub trait RuleSource: Send + Sync {
    /// Stable name, used for callback qualification and logging.
    fn name(&self) -> &str;

    /// Raw rule entries in declaration order.
    fn patterns(&self) -> Result<Vec<RawRuleEntry>, EngineError>;

    /// Modification marker; a greater value than last seen invalidates
    /// the compiled rule set.
    fn mtime(&self) -> Result<u64, EngineError>;
}

/// A code-declared rule provider registered with the module set.
///
/// Same contract as `RuleSource`, plus the callback table the module
/// brings along. Callbacks are installed under `"<module>::<name>"` keys
/// when the module is registered.
pub trait RuleModule: Send + Sync {
    fn name(&self) -> &str;

    fn patterns(&self) -> Result<Vec<RawRuleEntry>, EngineError>;

    fn mtime(&self) -> Result<u64, EngineError>;

    /// Bound actions this module provides, keyed by bare name.
    fn callbacks(&self) -> Vec<(String, Arc<crate::dispatch::CallbackFn>)> {
        Vec::new()
    }
}

// ============================================================================
// STATIC MODULE
// ============================================================================

/// The simplest provider: a fixed entry list with a fixed marker.
///
/// This is the canonical way to embed code-declared rules, and what tests
/// use to stand in for heavier providers.
pub struct StaticModule {
    name: String,
    entries: Vec<RawRuleEntry>,
    mtime: u64,
    callbacks: Vec<(String, Arc<crate::dispatch::CallbackFn>)>,
}

impl StaticModule {
    pub fn new(name: impl Into<String>, entries: Vec<RawRuleEntry>, mtime: u64) -> Self {
        StaticModule {
            name: name.into(),
            entries,
            mtime,
            callbacks: Vec::new(),
        }
    }

    /// Attaches a bound action under a bare name.
    pub fn with_callback<F>(mut self, name: impl Into<String>, callback: F) -> Self
    where
        F: Fn(&[String], &crate::context::CallerContext) -> Result<CallbackReply, CallbackError>
            + Send
            + Sync
            + 'static,
    {
        let callback: Arc<crate::dispatch::CallbackFn> = Arc::new(callback);
        self.callbacks.push((name.into(), callback));
        self
    }
}

impl RuleModule for StaticModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn patterns(&self) -> Result<Vec<RawRuleEntry>, EngineError> {
        Ok(self.entries.clone())
    }

    fn mtime(&self) -> Result<u64, EngineError> {
        Ok(self.mtime)
    }

    fn callbacks(&self) -> Vec<(String, Arc<crate::dispatch::CallbackFn>)> {
        self.callbacks.clone()
    }
}

// ============================================================================
// MODULE SET
// ============================================================================

/// Explicit registration list of rule modules, acting as one source.
///
/// Aggregation semantics: entries concatenate in registration order, the
/// modification marker is the max across modules, and a module that fails
/// during discovery is logged and skipped without aborting the others.
pub struct ModuleSet {
    name: String,
    modules: Vec<Arc<dyn RuleModule>>,
}

impl ModuleSet {
    /// Starts a builder that installs module callbacks into `callbacks`
    /// as modules are registered.
    pub fn builder(callbacks: Arc<CallbackRegistry>) -> ModuleSetBuilder {
        ModuleSetBuilder {
            name: "modules".to_string(),
            modules: Vec::new(),
            callbacks,
        }
    }

    pub fn module_count(&self) -> usize {
        self.modules.len()
    }
}

impl RuleSource for ModuleSet {
    fn name(&self) -> &str {
        &self.name
    }

    fn patterns(&self) -> Result<Vec<RawRuleEntry>, EngineError> {
        let mut entries = Vec::new();
        for module in &self.modules {
            match module.patterns() {
                Ok(mut batch) => entries.append(&mut batch),
                Err(e) => {
                    warn!("module '{}' failed during discovery, skipping: {}", module.name(), e);
                }
            }
        }
        Ok(entries)
    }

    fn mtime(&self) -> Result<u64, EngineError> {
        let mut generation = 0;
        for module in &self.modules {
            match module.mtime() {
                Ok(mtime) => generation = generation.max(mtime),
                Err(e) => {
                    warn!("module '{}' has no readable marker, skipping: {}", module.name(), e);
                }
            }
        }
        Ok(generation)
    }
}

impl std::fmt::Debug for ModuleSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleSet")
            .field("name", &self.name)
            .field("modules", &self.modules.len())
            .finish()
    }
}

/// Builder for `ModuleSet`; registering a module also installs its
/// callback table under qualified names.
pub struct ModuleSetBuilder {
    name: String,
    modules: Vec<Arc<dyn RuleModule>>,
    callbacks: Arc<CallbackRegistry>,
}

impl ModuleSetBuilder {
    /// Overrides the source name (default "modules").
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Registers a module and installs its callbacks.
    pub fn register(self, module: impl RuleModule + 'static) -> Self {
        self.register_arc(Arc::new(module))
    }

    /// Registers an already-shared module and installs its callbacks.
    pub fn register_arc(mut self, module: Arc<dyn RuleModule>) -> Self {
        for (bare_name, callback) in module.callbacks() {
            let qualified = CallbackRef::qualify(module.name(), &bare_name);
            self.callbacks.register(
                qualified.as_str().to_string(),
                move |caps: &[String], ctx: &crate::context::CallerContext| (*callback)(caps, ctx),
            );
        }
        self.modules.push(module);
        self
    }

    pub fn build(self) -> ModuleSet {
        ModuleSet {
            name: self.name,
            modules: self.modules,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(value: serde_json::Value) -> RawRuleEntry {
        serde_json::from_value(value).unwrap()
    }

    /// Module whose discovery always fails.
    struct BrokenModule;

    impl RuleModule for BrokenModule {
        fn name(&self) -> &str {
            "broken"
        }

        fn patterns(&self) -> Result<Vec<RawRuleEntry>, EngineError> {
            Err(EngineError::SourceUnavailable {
                source_name: "broken".to_string(),
                reason: "load failed".to_string(),
            })
        }

        fn mtime(&self) -> Result<u64, EngineError> {
            Err(EngineError::SourceUnavailable {
                source_name: "broken".to_string(),
                reason: "stat failed".to_string(),
            })
        }
    }

    #[test]
    fn test_module_set_aggregates_in_registration_order() {
        let callbacks = Arc::new(CallbackRegistry::new());
        let set = ModuleSet::builder(Arc::clone(&callbacks))
            .register(StaticModule::new(
                "greetings",
                vec![entry(json!({"id": "g1", "pattern": "^hi$", "responses": "x"}))],
                10,
            ))
            .register(StaticModule::new(
                "weather",
                vec![entry(json!({"id": "w1", "pattern": "^rain$", "responses": "y"}))],
                20,
            ))
            .build();

        let entries = set.patterns().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id.as_deref(), Some("g1"));
        assert_eq!(entries[1].id.as_deref(), Some("w1"));
        assert_eq!(set.mtime().unwrap(), 20);
    }

    #[test]
    fn test_broken_module_does_not_abort_discovery() {
        let callbacks = Arc::new(CallbackRegistry::new());
        let set = ModuleSet::builder(Arc::clone(&callbacks))
            .register(BrokenModule)
            .register(StaticModule::new(
                "ok",
                vec![entry(json!({"pattern": "^a$", "responses": "x"}))],
                7,
            ))
            .build();

        let entries = set.patterns().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(set.mtime().unwrap(), 7);
    }

    #[test]
    fn test_registration_installs_qualified_callbacks() {
        let callbacks = Arc::new(CallbackRegistry::new());
        let _set = ModuleSet::builder(Arc::clone(&callbacks))
            .register(
                StaticModule::new("weather", Vec::new(), 1).with_callback(
                    "current",
                    |_caps, _ctx| Ok(CallbackReply::Text("sunny".to_string())),
                ),
            )
            .build();

        assert!(callbacks.contains(&CallbackRef::qualify("weather", "current")));
        assert_eq!(callbacks.len(), 1);
    }
}
