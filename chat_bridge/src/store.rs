//! # Persisted Rule Store
//!
//! SQLite-backed rule source. Rows carry the same schema as
//! module-provided entries (pattern, responses, callback, severity,
//! priority, enabled, access level, description, group, stop_processing)
//! plus store bookkeeping irrelevant to matching: a soft-delete flag and
//! the hit counters written back after dispatch.
//!
//! The store participates in cache invalidation through `updated_at`:
//! every mutation bumps it past the previous maximum, so the registry sees
//! a strictly increasing modification marker. Recording hits does NOT bump
//! it; observability writes must not recompile the rule set.

use intent_engine::{now_ms, EngineError, RawPattern, RawResponses, RawRuleEntry, RuleSource};
use log::warn;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

// ================================================================================================
// CONFIGURATION & SCHEMA
// ================================================================================================

/// Configuration for the persisted rule store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path to the SQLite database file.
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./var/data/rules.db"),
        }
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS rules (
    id              TEXT PRIMARY KEY,
    pattern_json    TEXT NOT NULL,
    responses_json  TEXT,
    callback        TEXT,
    severity        TEXT NOT NULL DEFAULT 'low',
    priority        INTEGER NOT NULL DEFAULT 0,
    enabled         INTEGER NOT NULL DEFAULT 1,
    stop_processing INTEGER NOT NULL DEFAULT 0,
    access_level    TEXT NOT NULL DEFAULT 'public',
    description     TEXT,
    grp             TEXT,
    deleted         INTEGER NOT NULL DEFAULT 0,
    hit_count       INTEGER NOT NULL DEFAULT 0,
    last_used_at    INTEGER,
    updated_at      INTEGER NOT NULL
);
";

/// Store-level errors. These never reach the end user; the registry maps
/// them to `SourceUnavailable` and keeps the last good rule set.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open rule store at {path}: {source}")]
    Open {
        path: String,
        source: rusqlite::Error,
    },

    #[error("rule store query failed: {0}")]
    Query(#[from] rusqlite::Error),

    #[error("failed to encode rule entry '{id}': {source}")]
    Encode {
        id: String,
        source: serde_json::Error,
    },

    #[error("storage directory unavailable: {0}")]
    Io(#[from] std::io::Error),
}

// ================================================================================================
// RULE STORE
// ================================================================================================

/// SQLite-backed rule source with soft delete and hit bookkeeping.
pub struct RuleStore {
    name: String,
    db: Arc<Mutex<Connection>>,
}

impl RuleStore {
    /// The source name rules from the store are qualified under.
    pub const SOURCE_NAME: &'static str = "store";

    /// Opens (and if needed creates) the store at the configured path.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&config.path).map_err(|e| StoreError::Open {
            path: config.path.display().to_string(),
            source: e,
        })?;
        Self::from_connection(conn)
    }

    /// An in-memory store, used by tests and throwaway setups.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|e| StoreError::Open {
            path: ":memory:".to_string(),
            source: e,
        })?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(RuleStore {
            name: Self::SOURCE_NAME.to_string(),
            db: Arc::new(Mutex::new(conn)),
        })
    }

    /// Next modification marker: strictly greater than anything stored,
    /// so every mutation invalidates the compiled rule set exactly once.
    fn next_marker(conn: &Connection) -> Result<u64, StoreError> {
        let current: i64 =
            conn.query_row("SELECT COALESCE(MAX(updated_at), 0) FROM rules", [], |row| {
                row.get(0)
            })?;
        Ok((now_ms()).max(current as u64 + 1))
    }

    // ============================================================================================
    // CRUD
    // ============================================================================================

    /// Inserts or replaces a rule row. Soft-deleted rows are revived.
    pub fn upsert(&self, id: &str, entry: &RawRuleEntry) -> Result<(), StoreError> {
        let pattern_json =
            serde_json::to_string(&entry.pattern).map_err(|e| StoreError::Encode {
                id: id.to_string(),
                source: e,
            })?;
        let responses_json =
            serde_json::to_string(&entry.responses).map_err(|e| StoreError::Encode {
                id: id.to_string(),
                source: e,
            })?;

        let conn = self.db.lock();
        let marker = Self::next_marker(&conn)?;
        conn.execute(
            "INSERT OR REPLACE INTO rules
                 (id, pattern_json, responses_json, callback, severity, priority,
                  enabled, stop_processing, access_level, description, grp,
                  deleted, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 0, ?12)",
            params![
                id,
                pattern_json,
                responses_json,
                entry.callback,
                entry.severity.clone().unwrap_or_else(|| "low".to_string()),
                entry.priority.unwrap_or(0),
                entry.enabled.unwrap_or(true) as i64,
                entry.stop_processing.unwrap_or(false) as i64,
                entry
                    .access_level
                    .clone()
                    .unwrap_or_else(|| "public".to_string()),
                entry.description,
                entry.group,
                marker as i64,
            ],
        )?;
        Ok(())
    }

    /// Marks a rule deleted without dropping its row (bookkeeping
    /// survives). Returns true if the rule existed.
    pub fn soft_delete(&self, id: &str) -> Result<bool, StoreError> {
        let conn = self.db.lock();
        let marker = Self::next_marker(&conn)?;
        let changed = conn.execute(
            "UPDATE rules SET deleted = 1, updated_at = ?1 WHERE id = ?2 AND deleted = 0",
            params![marker as i64, id],
        )?;
        Ok(changed > 0)
    }

    /// Writes the observability counters back for a dispatched rule.
    /// Deliberately leaves `updated_at` alone.
    pub fn record_hit(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.db.lock();
        conn.execute(
            "UPDATE rules SET hit_count = hit_count + 1, last_used_at = ?1 WHERE id = ?2",
            params![now_ms() as i64, id],
        )?;
        Ok(())
    }

    /// Hit bookkeeping for one rule: (hit_count, last_used_at).
    pub fn hit_stats(&self, id: &str) -> Result<Option<(u64, Option<u64>)>, StoreError> {
        let conn = self.db.lock();
        let row = conn
            .query_row(
                "SELECT hit_count, last_used_at FROM rules WHERE id = ?1",
                params![id],
                |row| {
                    let hits: i64 = row.get(0)?;
                    let last: Option<i64> = row.get(1)?;
                    Ok((hits as u64, last.map(|v| v as u64)))
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Number of live (non-soft-deleted) rules.
    pub fn live_count(&self) -> Result<usize, StoreError> {
        let conn = self.db.lock();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM rules WHERE deleted = 0", [], |row| {
                row.get(0)
            })?;
        Ok(count as usize)
    }

    /// Reads live rows into raw entries, in insertion order. A row whose
    /// JSON columns fail to parse is logged and skipped.
    fn load_entries(&self) -> Result<Vec<RawRuleEntry>, StoreError> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT id, pattern_json, responses_json, callback, severity, priority,
                    enabled, stop_processing, access_level, description, grp
             FROM rules WHERE deleted = 0 ORDER BY rowid",
        )?;

        let rows: Vec<RawRow> = stmt
            .query_map([], |row| {
                Ok(RawRow {
                    id: row.get(0)?,
                    pattern_json: row.get(1)?,
                    responses_json: row.get(2)?,
                    callback: row.get(3)?,
                    severity: row.get(4)?,
                    priority: row.get(5)?,
                    enabled: row.get::<_, i64>(6)? != 0,
                    stop_processing: row.get::<_, i64>(7)? != 0,
                    access_level: row.get(8)?,
                    description: row.get(9)?,
                    group: row.get(10)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            match row.into_entry() {
                Ok(entry) => entries.push(entry),
                Err((id, e)) => {
                    warn!("store row '{}' has malformed JSON, skipping: {}", id, e);
                }
            }
        }
        Ok(entries)
    }
}

impl std::fmt::Debug for RuleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleStore").field("name", &self.name).finish()
    }
}

/// One row as read from SQLite, before JSON decoding.
struct RawRow {
    id: String,
    pattern_json: String,
    responses_json: Option<String>,
    callback: Option<String>,
    severity: String,
    priority: i32,
    enabled: bool,
    stop_processing: bool,
    access_level: String,
    description: Option<String>,
    group: Option<String>,
}

impl RawRow {
    fn into_entry(self) -> Result<RawRuleEntry, (String, serde_json::Error)> {
        let pattern: Option<RawPattern> =
            serde_json::from_str(&self.pattern_json).map_err(|e| (self.id.clone(), e))?;
        let responses: Option<RawResponses> = match self.responses_json.as_deref() {
            None => None,
            Some(json) => serde_json::from_str(json).map_err(|e| (self.id.clone(), e))?,
        };

        Ok(RawRuleEntry {
            id: Some(self.id),
            pattern,
            responses,
            callback: self.callback,
            severity: Some(self.severity),
            priority: Some(self.priority),
            enabled: Some(self.enabled),
            stop_processing: Some(self.stop_processing),
            access_level: Some(self.access_level),
            description: self.description,
            group: self.group,
        })
    }
}

// ================================================================================================
// RULE SOURCE CONTRACT
// ================================================================================================

impl RuleSource for RuleStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn patterns(&self) -> Result<Vec<RawRuleEntry>, EngineError> {
        self.load_entries().map_err(|e| EngineError::SourceUnavailable {
            source_name: self.name.clone(),
            reason: e.to_string(),
        })
    }

    fn mtime(&self) -> Result<u64, EngineError> {
        let conn = self.db.lock();
        conn.query_row(
            "SELECT COALESCE(MAX(updated_at), 0) FROM rules",
            [],
            |row| row.get::<_, i64>(0),
        )
        .map(|v| v as u64)
        .map_err(|e| EngineError::SourceUnavailable {
            source_name: self.name.clone(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(value: serde_json::Value) -> RawRuleEntry {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_upsert_and_load_roundtrip() {
        let store = RuleStore::in_memory().unwrap();
        store
            .upsert(
                "greet",
                &entry(json!({
                    "pattern": {"en": "^hello$", "pl": "^cześć$"},
                    "responses": {"en": ["hi"], "pl": ["no cześć"]},
                    "severity": "high",
                    "priority": 7,
                    "access_level": "authenticated"
                })),
            )
            .unwrap();

        let entries = store.patterns().unwrap();
        assert_eq!(entries.len(), 1);
        let loaded = &entries[0];
        assert_eq!(loaded.id.as_deref(), Some("greet"));
        assert!(matches!(loaded.pattern, Some(RawPattern::PerLocale(_))));
        assert_eq!(loaded.severity.as_deref(), Some("high"));
        assert_eq!(loaded.priority, Some(7));
        assert_eq!(loaded.access_level.as_deref(), Some("authenticated"));
    }

    #[test]
    fn test_marker_strictly_increases_on_mutation() {
        let store = RuleStore::in_memory().unwrap();
        assert_eq!(store.mtime().unwrap(), 0);

        store
            .upsert("a", &entry(json!({"pattern": "^a$", "responses": "x"})))
            .unwrap();
        let first = store.mtime().unwrap();
        assert!(first > 0);

        store
            .upsert("b", &entry(json!({"pattern": "^b$", "responses": "y"})))
            .unwrap();
        let second = store.mtime().unwrap();
        assert!(second > first);

        // Soft delete bumps the marker too, even though the row count drops.
        assert!(store.soft_delete("a").unwrap());
        assert!(store.mtime().unwrap() > second);
    }

    #[test]
    fn test_soft_deleted_rows_are_invisible_but_kept() {
        let store = RuleStore::in_memory().unwrap();
        store
            .upsert("a", &entry(json!({"pattern": "^a$", "responses": "x"})))
            .unwrap();
        store.record_hit("a").unwrap();

        assert!(store.soft_delete("a").unwrap());
        assert!(!store.soft_delete("a").unwrap());
        assert_eq!(store.live_count().unwrap(), 0);
        assert!(store.patterns().unwrap().is_empty());

        // Bookkeeping survives the soft delete.
        let stats = store.hit_stats("a").unwrap().unwrap();
        assert_eq!(stats.0, 1);
    }

    #[test]
    fn test_record_hit_does_not_invalidate_cache() {
        let store = RuleStore::in_memory().unwrap();
        store
            .upsert("a", &entry(json!({"pattern": "^a$", "responses": "x"})))
            .unwrap();
        let marker = store.mtime().unwrap();

        store.record_hit("a").unwrap();
        store.record_hit("a").unwrap();
        assert_eq!(store.mtime().unwrap(), marker);

        let stats = store.hit_stats("a").unwrap().unwrap();
        assert_eq!(stats.0, 2);
        assert!(stats.1.is_some());
    }

    #[test]
    fn test_malformed_row_is_skipped_not_fatal() {
        let store = RuleStore::in_memory().unwrap();
        store
            .upsert("good", &entry(json!({"pattern": "^a$", "responses": "x"})))
            .unwrap();

        {
            let conn = store.db.lock();
            conn.execute(
                "INSERT INTO rules (id, pattern_json, updated_at) VALUES ('bad', '{not json', 1)",
                [],
            )
            .unwrap();
        }

        let entries = store.patterns().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id.as_deref(), Some("good"));
    }

    #[test]
    fn test_open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("rules.db");
        let store = RuleStore::open(StoreConfig { path: path.clone() }).unwrap();

        store
            .upsert("a", &entry(json!({"pattern": "^a$", "responses": "x"})))
            .unwrap();
        assert!(path.exists());
    }
}
