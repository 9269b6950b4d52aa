// Rule-based conversational dispatch engine.
//
// Given free-text user input, the engine determines which matching rule
// applies, executes the bound action, and returns a reply. Rule
// definitions come from heterogeneous sources (code-declared modules, a
// persisted store) and are compiled into one canonical ordered rule set,
// cached and invalidated by a modification marker.
//
// Control flow: sources -> compiler -> registry (cached) -> match engine
// (filtered by the access guard) -> dispatcher -> reply.
//
// Ranking is fully deterministic from static rule metadata: severity band
// first, priority integer second, merge order as the contractual
// tie-break. "First match wins", never "best match".

pub mod access;
pub mod compile;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod match_engine;
pub mod registry;
pub mod rule;
pub mod source;

pub use access::AccessGuard;

pub use compile::{
    compile, compile_pattern, CompileOutcome, RawPattern, RawResponseList, RawResponses,
    RawRuleEntry, SkipReason, SkippedEntry,
};

pub use context::CallerContext;

pub use dispatch::{
    CallbackFn, CallbackRegistry, CallbackReply, Dispatched, Dispatcher, PersonaConfig, Reply,
    ReplySource,
};

pub use error::{CallbackError, EngineError};

pub use match_engine::{MatchEngine, MatchResult};

pub use registry::{RuleRegistry, RuleSet};

pub use rule::{
    now_ms, AccessLevel, CallbackRef, CompiledPattern, Locale, ResponseSet, Rule, RuleId,
    RuleOrigin, RulePattern, RuleStats, Severity,
};

pub use source::{ModuleSet, ModuleSetBuilder, RuleModule, RuleSource, StaticModule};
