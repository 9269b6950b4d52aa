// Rule registry: owns the canonical ordered rule list and its cache.
//
// The registry is read by many concurrent request handlers and recompiled
// occasionally. Readers only ever pay an atomic pointer read: the compiled
// list is published behind an Arc and replaced wholesale, never mutated in
// place. Recompilation is serialized through a dedicated mutex so that
// concurrent staleness detections collapse into a single compile.
//
// States:
// - COLD: nothing loaded yet; the first access builds the list.
// - WARM(g): a list compiled at generation g is published. It is replaced
//   only when a source reports a greater generation.
//
// Staleness probing reads only the sources' modification markers (cheap);
// the expensive discovery call runs on cache miss alone.

use crate::compile::compile;
use crate::dispatch::CallbackRegistry;
use crate::rule::Rule;
use crate::source::RuleSource;
use log::{error, info, warn};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// ============================================================================
// RULE SET
// ============================================================================

/// The canonical ordered rule list, built once per cache generation.
///
/// Ordering: severity weight descending, then priority descending; ties
/// keep merge order (source precedence, then original position within the
/// source). The tie-break is part of the sort key, so sorting is
/// deterministic and idempotent.
#[derive(Debug)]
pub struct RuleSet {
    rules: Vec<Arc<Rule>>,
    generation: u64,
}

impl RuleSet {
    /// An empty set at generation 0, the cold-start "no match" state.
    pub fn empty() -> Self {
        RuleSet {
            rules: Vec::new(),
            generation: 0,
        }
    }

    /// Sorts merged rules into canonical order and stamps the generation.
    pub fn ordered(mut rules: Vec<Arc<Rule>>, generation: u64) -> Self {
        rules.sort_by_key(|rule| rule.sort_key());
        RuleSet { rules, generation }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Arc<Rule>> {
        self.rules.iter()
    }

    pub fn rules(&self) -> &[Arc<Rule>] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Cache state of the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegistryState {
    /// Nothing loaded yet.
    Cold,
    /// A list compiled at this generation is published.
    Warm { generation: u64 },
}

// ============================================================================
// REGISTRY
// ============================================================================

/// Owns the compiled rule list, its cache state, and the rebuild path.
pub struct RuleRegistry {
    /// Sources in merge precedence order.
    sources: Vec<Arc<dyn RuleSource>>,
    /// Callback registry compilation resolves bound actions against.
    callbacks: Arc<CallbackRegistry>,
    /// The published list; replaced atomically, never mutated.
    published: RwLock<Arc<RuleSet>>,
    state: RwLock<RegistryState>,
    /// Serializes rebuilds; losers of the race reuse the winner's list.
    rebuild_gate: Mutex<()>,
    /// Number of full compiles performed (observability and tests).
    compile_invocations: AtomicU64,
}

impl RuleRegistry {
    pub fn new(sources: Vec<Arc<dyn RuleSource>>, callbacks: Arc<CallbackRegistry>) -> Self {
        RuleRegistry {
            sources,
            callbacks,
            published: RwLock::new(Arc::new(RuleSet::empty())),
            state: RwLock::new(RegistryState::Cold),
            rebuild_gate: Mutex::new(()),
            compile_invocations: AtomicU64::new(0),
        }
    }

    pub fn callbacks(&self) -> &Arc<CallbackRegistry> {
        &self.callbacks
    }

    /// Number of full compiles performed so far.
    pub fn compile_invocations(&self) -> u64 {
        self.compile_invocations.load(Ordering::Relaxed)
    }

    /// The published list, refreshed first if a source reports a newer
    /// generation. This is the per-request entry point.
    pub fn snapshot(&self) -> Arc<RuleSet> {
        let probed = self.probe_generation();

        if let RegistryState::Warm { generation } = *self.state.read() {
            if probed <= generation {
                return self.published();
            }
        }

        // Stale or cold: exactly one caller rebuilds, the rest wait here
        // and then reuse the fresh list.
        let _gate = self.rebuild_gate.lock();
        if let RegistryState::Warm { generation } = *self.state.read() {
            if probed <= generation {
                return self.published();
            }
        }
        self.rebuild(probed)
    }

    /// Forces a staleness check and rebuild if needed. Used by the
    /// off-path refresh scheduler; equivalent to `snapshot` otherwise.
    pub fn refresh(&self) -> Arc<RuleSet> {
        self.snapshot()
    }

    /// Drops the compiled list and returns to COLD. The next access
    /// rebuilds from scratch.
    pub fn teardown(&self) {
        let _gate = self.rebuild_gate.lock();
        *self.published.write() = Arc::new(RuleSet::empty());
        *self.state.write() = RegistryState::Cold;
        info!("rule registry torn down, next access recompiles");
    }

    /// The currently published list without any staleness check.
    pub fn published(&self) -> Arc<RuleSet> {
        Arc::clone(&self.published.read())
    }

    /// Max modification marker across sources. A source whose marker is
    /// unreadable is skipped; it cannot advance the generation.
    fn probe_generation(&self) -> u64 {
        let mut generation = 0;
        for source in &self.sources {
            match source.mtime() {
                Ok(mtime) => generation = generation.max(mtime),
                Err(e) => {
                    warn!("source '{}' marker unreadable: {}", source.name(), e);
                }
            }
        }
        generation
    }

    /// Reads and compiles all sources, merges, sorts, publishes.
    ///
    /// Must be called with the rebuild gate held. On an unreadable source
    /// the last good WARM list is retained (availability over freshness);
    /// only the very first load degrades the failing source to empty so
    /// the engine can fail open to "no match".
    fn rebuild(&self, target_generation: u64) -> Arc<RuleSet> {
        let was_warm = matches!(*self.state.read(), RegistryState::Warm { .. });
        self.compile_invocations.fetch_add(1, Ordering::Relaxed);

        let mut merged: Vec<Arc<Rule>> = Vec::new();
        let mut skipped_total = 0;

        for (precedence, source) in self.sources.iter().enumerate() {
            match source.patterns() {
                Ok(entries) => {
                    let outcome = compile(source.name(), precedence, entries, &self.callbacks);
                    for skipped in &outcome.skipped {
                        warn!("dropped rule entry: {}", skipped.to_error());
                    }
                    skipped_total += outcome.skipped.len();
                    merged.extend(outcome.rules);
                }
                Err(e) if was_warm => {
                    // Keep serving the last good list; the unchanged state
                    // means the next probe retries the rebuild.
                    error!(
                        "source '{}' unreadable during refresh, retaining last good rule set: {}",
                        source.name(),
                        e
                    );
                    return self.published();
                }
                Err(e) => {
                    error!(
                        "source '{}' unreadable on first load, degrading to empty: {}",
                        source.name(),
                        e
                    );
                }
            }
        }

        let rule_set = Arc::new(RuleSet::ordered(merged, target_generation));
        info!(
            "compiled rule set: {} rules ({} skipped) at generation {}",
            rule_set.len(),
            skipped_total,
            target_generation
        );

        *self.published.write() = Arc::clone(&rule_set);
        *self.state.write() = RegistryState::Warm {
            generation: target_generation,
        };
        rule_set
    }
}

impl std::fmt::Debug for RuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleRegistry")
            .field("sources", &self.sources.len())
            .field("state", &*self.state.read())
            .field("rules", &self.published.read().len())
            .finish()
    }
}
