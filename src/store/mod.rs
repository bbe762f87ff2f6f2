//! Canonical store over SQLite
//!
//! Single source of truth for sessions, messages, tags, and the FTS5
//! search index. Adapters hand in transient records; everything durable
//! goes through the transactional methods here. The search index is
//! mirrored inside the same transaction as every message write.

mod schema;
pub mod query;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

use crate::adapter::SessionRecord;

pub use schema::SCHEMA;

/// Store conditions callers need to distinguish from plain I/O errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("schema migration failed, store left unmigrated: {0}")]
    MigrationFailed(String),

    #[error("store-backed features are disabled for this run")]
    Disabled,
}

/// Result of an upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// Fingerprint matched the stored one; nothing was written
    Unchanged,
}

pub struct CanonicalStore {
    conn: Mutex<Connection>,
    /// Set when legacy-layout migration failed; every operation is
    /// rejected rather than touching an unmigrated table
    disabled: bool,
}

impl CanonicalStore {
    pub fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;

        // Legacy detection runs before schema init: CREATE IF NOT EXISTS
        // would leave an old-shape sessions table in place silently.
        let legacy = has_legacy_layout(&conn)?;

        let mut store = Self {
            conn: Mutex::new(conn),
            disabled: false,
        };

        if legacy {
            if let Err(e) = store.migrate_legacy() {
                tracing::warn!(target: "chatvault::db", error = %e, "migration failed, disabling store-backed features");
                store.disabled = true;
                return Ok(store);
            }
            store.init_schema()?;
            // Migration wrote messages before the index table existed
            store.rebuild_search_index()?;
        } else {
            store.init_schema()?;
        }

        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn().execute_batch(SCHEMA)?;
        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("store mutex poisoned")
    }

    /// Locked connection for the query engine; rejects a disabled store
    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.ensure_enabled()?;
        Ok(self.conn())
    }

    fn ensure_enabled(&self) -> Result<()> {
        if self.disabled {
            return Err(StoreError::Disabled.into());
        }
        Ok(())
    }

    /// Whether the store accepted its on-disk layout
    pub fn is_enabled(&self) -> bool {
        !self.disabled
    }

    // ============================================
    // MIGRATION
    // ============================================

    /// Migrate the legacy layout where messages lived inline in a JSON
    /// `content` column on sessions. Builds the new tables, copies every
    /// mappable row, explodes inlined messages, and swaps tables, all in
    /// one transaction. The old table is never touched until the new one
    /// is fully populated.
    fn migrate_legacy(&mut self) -> Result<()> {
        tracing::info!(target: "chatvault::db", "legacy inlined-content layout detected, migrating");

        let mut guard = self.conn();
        let tx = guard.transaction()?;

        tx.execute_batch(
            r#"
            CREATE TABLE sessions_new (
                id TEXT PRIMARY KEY,
                source TEXT NOT NULL,
                title TEXT,
                project TEXT,
                description TEXT,
                environment TEXT,
                message_count INTEGER NOT NULL DEFAULT 0,
                created_at DATETIME,
                updated_at DATETIME,
                source_path TEXT NOT NULL,
                fingerprint TEXT,
                source_mtime DATETIME
            );

            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY,
                session_id TEXT NOT NULL,
                external_id TEXT,
                role TEXT NOT NULL CHECK (role IN ('user', 'assistant', 'system')),
                content TEXT NOT NULL,
                timestamp DATETIME,
                seq INTEGER NOT NULL,
                FOREIGN KEY(session_id) REFERENCES sessions_new(id) ON DELETE CASCADE
            );
            "#,
        )
        .map_err(|e| StoreError::MigrationFailed(e.to_string()))?;

        let legacy_rows: Vec<LegacyRow> = {
            let mut stmt = tx
                .prepare(
                    "SELECT id, source, title, created_at, updated_at, source_path, content
                     FROM sessions",
                )
                .map_err(|e| StoreError::MigrationFailed(e.to_string()))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(LegacyRow {
                        id: row.get(0)?,
                        source: row.get(1)?,
                        title: row.get(2)?,
                        created_at: row.get(3)?,
                        updated_at: row.get(4)?,
                        source_path: row.get(5)?,
                        content: row.get(6)?,
                    })
                })
                .map_err(|e| StoreError::MigrationFailed(e.to_string()))?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| StoreError::MigrationFailed(e.to_string()))?
        };

        for row in &legacy_rows {
            let messages = parse_inlined_messages(row.content.as_deref());

            tx.execute(
                "INSERT INTO sessions_new
                   (id, source, title, message_count, created_at, updated_at, source_path)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
                params![
                    row.id,
                    row.source.as_deref().unwrap_or("editor"),
                    row.title,
                    messages.len() as i64,
                    row.created_at,
                    row.updated_at,
                    row.source_path.as_deref().unwrap_or(""),
                ],
            )
            .map_err(|e| StoreError::MigrationFailed(e.to_string()))?;

            for (seq, msg) in messages.iter().enumerate() {
                tx.execute(
                    "INSERT INTO messages (session_id, role, content, timestamp, seq)
                     VALUES (?, ?, ?, ?, ?)",
                    params![row.id, msg.0, msg.1, msg.2, seq as i64],
                )
                .map_err(|e| StoreError::MigrationFailed(e.to_string()))?;
            }
        }

        tx.execute_batch(
            "DROP TABLE sessions;
             ALTER TABLE sessions_new RENAME TO sessions;",
        )
        .map_err(|e| StoreError::MigrationFailed(e.to_string()))?;

        tx.commit()
            .map_err(|e| StoreError::MigrationFailed(e.to_string()))?;

        tracing::info!(target: "chatvault::db", sessions = legacy_rows.len(), "migration complete");
        Ok(())
    }

    // ============================================
    // SESSIONS
    // ============================================

    /// Last recorded fingerprint for a session, if it exists
    pub fn fingerprint_of(&self, session_id: &str) -> Result<Option<String>> {
        self.ensure_enabled()?;
        let fp: Option<Option<String>> = self
            .conn()
            .query_row(
                "SELECT fingerprint FROM sessions WHERE id = ?",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(fp.flatten())
    }

    /// Replace-or-insert a session and everything hanging off it, in one
    /// transaction. A matching fingerprint is a no-op: nothing is
    /// rewritten and updated_at keeps its old value.
    pub fn upsert_session(&self, record: &SessionRecord, fingerprint: &str) -> Result<UpsertOutcome> {
        self.ensure_enabled()?;
        let mut guard = self.conn();
        let tx = guard.transaction()?;

        let existing: Option<Option<String>> = tx
            .query_row(
                "SELECT fingerprint FROM sessions WHERE id = ?",
                params![record.id],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(ref stored) = existing {
            if stored.as_deref() == Some(fingerprint) {
                return Ok(UpsertOutcome::Unchanged);
            }
        }

        let now = Utc::now();
        let source_mtime = std::fs::metadata(&record.source_path)
            .ok()
            .and_then(|m| m.modified().ok())
            .map(|t| chrono::DateTime::<Utc>::from(t).to_rfc3339());

        tx.execute(
            r#"INSERT INTO sessions
                 (id, source, title, project, description, environment, message_count,
                  created_at, updated_at, source_path, fingerprint, source_mtime)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                   title = excluded.title,
                   project = excluded.project,
                   description = excluded.description,
                   environment = excluded.environment,
                   message_count = excluded.message_count,
                   updated_at = excluded.updated_at,
                   source_path = excluded.source_path,
                   fingerprint = excluded.fingerprint,
                   source_mtime = excluded.source_mtime"#,
            params![
                record.id,
                record.source,
                record.title,
                record.project,
                record.description,
                record.environment.as_ref().map(|v| v.to_string()),
                record.messages.len() as i64,
                record.created_at.unwrap_or(now).to_rfc3339(),
                record.updated_at.unwrap_or(now).to_rfc3339(),
                record.source_path.to_string_lossy().to_string(),
                fingerprint,
                source_mtime,
            ],
        )?;

        // Tags: dedup, then full replacement of the previous set
        tx.execute(
            "DELETE FROM session_tags WHERE session_id = ?",
            params![record.id],
        )?;
        let tag_set: BTreeSet<String> = record
            .tags
            .iter()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        for tag in &tag_set {
            tx.execute("INSERT OR IGNORE INTO tags (name) VALUES (?)", params![tag])?;
            tx.execute(
                "INSERT INTO session_tags (session_id, tag_id)
                 SELECT ?, id FROM tags WHERE name = ?",
                params![record.id, tag],
            )?;
        }

        // Messages: delete-then-reinsert, mirroring the search index
        tx.execute(
            "DELETE FROM search_index WHERE session_id = ?",
            params![record.id],
        )?;
        tx.execute(
            "DELETE FROM messages WHERE session_id = ?",
            params![record.id],
        )?;

        for (seq, msg) in record.messages.iter().enumerate() {
            let msg_id: i64 = tx.query_row(
                r#"INSERT INTO messages (session_id, external_id, role, content, timestamp, seq)
                   VALUES (?, ?, ?, ?, ?, ?)
                   RETURNING id"#,
                params![
                    record.id,
                    msg.external_id,
                    msg.role.as_str(),
                    msg.content,
                    msg.timestamp.map(|t| t.to_rfc3339()),
                    seq as i64,
                ],
                |row| row.get(0),
            )?;

            tx.execute(
                "INSERT INTO search_index (title, content, session_id, message_id)
                 VALUES (?, ?, ?, ?)",
                params![record.title.as_deref().unwrap_or(""), msg.content, record.id, msg_id],
            )?;
        }

        tx.commit()?;

        Ok(if existing.is_some() {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Inserted
        })
    }

    /// Delete a session and cascade to messages, tag links, and index
    /// rows. Returns false when no such session existed.
    pub fn delete_session(&self, session_id: &str) -> Result<bool> {
        self.ensure_enabled()?;
        let mut guard = self.conn();
        let tx = guard.transaction()?;

        // FTS table carries no foreign key, so the cascade is manual
        tx.execute(
            "DELETE FROM search_index WHERE session_id = ?",
            params![session_id],
        )?;
        let deleted = tx.execute("DELETE FROM sessions WHERE id = ?", params![session_id])?;

        tx.commit()?;
        Ok(deleted > 0)
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<SessionRow>> {
        self.ensure_enabled()?;
        let row = self
            .conn()
            .query_row(
                "SELECT id, source, title, project, description, environment,
                        message_count, created_at, updated_at, source_path
                 FROM sessions WHERE id = ?",
                params![session_id],
                map_session_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn get_messages(&self, session_id: &str) -> Result<Vec<MessageRow>> {
        self.ensure_enabled()?;
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, external_id, role, content, timestamp, seq
             FROM messages
             WHERE session_id = ?
             ORDER BY timestamp, seq",
        )?;

        let rows = stmt.query_map(params![session_id], |row| {
            Ok(MessageRow {
                id: row.get(0)?,
                external_id: row.get(1)?,
                role: row.get(2)?,
                content: row.get(3)?,
                timestamp: row.get(4)?,
                seq: row.get(5)?,
            })
        })?;

        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn tags_of(&self, session_id: &str) -> Result<Vec<String>> {
        self.ensure_enabled()?;
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT t.name FROM tags t
             JOIN session_tags st ON st.tag_id = t.id
             WHERE st.session_id = ?
             ORDER BY t.name",
        )?;
        let rows = stmt.query_map(params![session_id], |row| row.get(0))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    // ============================================
    // SEARCH INDEX
    // ============================================

    /// Drop and repopulate the search index from the message table.
    /// The index is derived state; this is always safe.
    pub fn rebuild_search_index(&self) -> Result<usize> {
        self.ensure_enabled()?;
        let mut guard = self.conn();
        let tx = guard.transaction()?;

        tx.execute("DELETE FROM search_index", [])?;
        let rows = tx.execute(
            "INSERT INTO search_index (title, content, session_id, message_id)
             SELECT COALESCE(s.title, ''), m.content, m.session_id, m.id
             FROM messages m
             JOIN sessions s ON s.id = m.session_id",
            [],
        )?;

        tx.commit()?;
        tracing::info!(target: "chatvault::db", rows, "search index rebuilt");
        Ok(rows)
    }

    // ============================================
    // RETENTION
    // ============================================

    /// Prune the oldest sessions beyond `max_sessions` (0 = unlimited).
    /// Returns how many were removed.
    pub fn prune_sessions(&self, max_sessions: u64) -> Result<usize> {
        self.ensure_enabled()?;
        if max_sessions == 0 {
            return Ok(0);
        }

        let victims: Vec<String> = {
            let conn = self.conn();
            let mut stmt = conn.prepare(
                "SELECT id FROM sessions
                 ORDER BY updated_at DESC
                 LIMIT -1 OFFSET ?",
            )?;
            let rows = stmt.query_map(params![max_sessions as i64], |row| row.get(0))?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        for id in &victims {
            self.delete_session(id)?;
        }

        if !victims.is_empty() {
            tracing::info!(target: "chatvault::db", pruned = victims.len(), "retention pruning");
        }
        Ok(victims.len())
    }
}

fn map_session_row(row: &rusqlite::Row) -> rusqlite::Result<SessionRow> {
    Ok(SessionRow {
        id: row.get(0)?,
        source: row.get(1)?,
        title: row.get(2)?,
        project: row.get(3)?,
        description: row.get(4)?,
        environment: row.get(5)?,
        message_count: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
        source_path: row.get(9)?,
    })
}

/// True when the sessions table still carries the legacy inlined
/// `content` column
fn has_legacy_layout(conn: &Connection) -> Result<bool> {
    let exists: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = 'sessions'",
        [],
        |row| row.get(0),
    )?;
    if !exists {
        return Ok(false);
    }

    let mut stmt = conn.prepare("PRAGMA table_info(sessions)")?;
    let columns = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for column in columns {
        if column? == "content" {
            return Ok(true);
        }
    }
    Ok(false)
}

struct LegacyRow {
    id: String,
    source: Option<String>,
    title: Option<String>,
    created_at: Option<String>,
    updated_at: Option<String>,
    source_path: Option<String>,
    content: Option<String>,
}

/// Explode a legacy inlined-content JSON array into (role, content,
/// timestamp) triples; unmappable entries are dropped, not failed
fn parse_inlined_messages(content: Option<&str>) -> Vec<(String, String, Option<String>)> {
    let Some(raw) = content else {
        return vec![];
    };
    let Ok(value) = serde_json::from_str::<serde_json::Value>(raw) else {
        return vec![];
    };
    let Some(items) = value.as_array() else {
        return vec![];
    };

    items
        .iter()
        .filter_map(|item| {
            let role = item.get("role").and_then(|v| v.as_str())?;
            let role = crate::adapter::Role::parse(role)?;
            let text = item.get("content").and_then(|v| v.as_str())?;
            let ts = item
                .get("timestamp")
                .and_then(|v| v.as_str())
                .map(String::from);
            Some((role.as_str().to_string(), text.to_string(), ts))
        })
        .collect()
}

// ============================================
// ROW TYPES
// ============================================

#[derive(Debug, Clone, Serialize)]
pub struct SessionRow {
    pub id: String,
    pub source: String,
    pub title: Option<String>,
    pub project: Option<String>,
    pub description: Option<String>,
    pub environment: Option<String>,
    pub message_count: i64,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub source_path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageRow {
    pub id: i64,
    pub external_id: Option<String>,
    pub role: String,
    pub content: String,
    pub timestamp: Option<String>,
    pub seq: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{MessageRecord, Role};
    use std::path::PathBuf;

    fn open_store(dir: &tempfile::TempDir) -> CanonicalStore {
        CanonicalStore::open(&dir.path().join("test.db")).unwrap()
    }

    fn sample_record(id: &str, tags: &[&str], roles: &[Role]) -> SessionRecord {
        SessionRecord {
            id: id.to_string(),
            source: "editor".to_string(),
            title: Some("Fix the tests".to_string()),
            project: Some("demo".to_string()),
            description: None,
            environment: None,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            created_at: None,
            updated_at: None,
            source_path: PathBuf::from("/tmp/unit"),
            messages: roles
                .iter()
                .enumerate()
                .map(|(i, role)| MessageRecord {
                    external_id: None,
                    role: *role,
                    content: format!("message number {i}"),
                    timestamp: None,
                })
                .collect(),
        }
    }

    fn count(store: &CanonicalStore, sql: &str) -> i64 {
        store.conn().query_row(sql, [], |row| row.get(0)).unwrap()
    }

    #[test]
    fn test_upsert_then_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let record = sample_record(
            "editor:s1",
            &["rust"],
            &[Role::User, Role::Assistant, Role::User, Role::User, Role::Assistant],
        );
        let outcome = store.upsert_session(&record, "fp1").unwrap();
        assert_eq!(outcome, UpsertOutcome::Inserted);

        let session = store.get_session("editor:s1").unwrap().unwrap();
        assert_eq!(session.message_count, 5);

        let messages = store.get_messages("editor:s1").unwrap();
        assert_eq!(messages.len(), 5);
        assert_eq!(messages.iter().filter(|m| m.role == "user").count(), 3);
        assert_eq!(messages.iter().filter(|m| m.role == "assistant").count(), 2);
    }

    #[test]
    fn test_unchanged_fingerprint_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let record = sample_record("editor:s1", &[], &[Role::User]);
        store.upsert_session(&record, "fp1").unwrap();
        let before = store.get_session("editor:s1").unwrap().unwrap();

        let outcome = store.upsert_session(&record, "fp1").unwrap();
        assert_eq!(outcome, UpsertOutcome::Unchanged);

        let after = store.get_session("editor:s1").unwrap().unwrap();
        assert_eq!(before.updated_at, after.updated_at);
        assert_eq!(count(&store, "SELECT COUNT(*) FROM messages"), 1);
    }

    #[test]
    fn test_changed_fingerprint_replaces_messages() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let record = sample_record("editor:s1", &[], &[Role::User, Role::Assistant]);
        store.upsert_session(&record, "fp1").unwrap();

        let smaller = sample_record("editor:s1", &[], &[Role::User]);
        let outcome = store.upsert_session(&smaller, "fp2").unwrap();
        assert_eq!(outcome, UpsertOutcome::Updated);

        assert_eq!(count(&store, "SELECT COUNT(*) FROM messages"), 1);
        assert_eq!(count(&store, "SELECT COUNT(*) FROM search_index"), 1);
    }

    #[test]
    fn test_tag_set_fully_replaced_on_reupsert() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let record = sample_record("editor:s1", &["Rust", "rust ", "cli"], &[Role::User]);
        store.upsert_session(&record, "fp1").unwrap();
        assert_eq!(store.tags_of("editor:s1").unwrap(), vec!["cli", "rust"]);

        let retagged = sample_record("editor:s1", &["web"], &[Role::User]);
        store.upsert_session(&retagged, "fp2").unwrap();
        assert_eq!(store.tags_of("editor:s1").unwrap(), vec!["web"]);
    }

    #[test]
    fn test_delete_cascades_completely() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let record = sample_record(
            "editor:s1",
            &["a", "b"],
            &[Role::User; 10],
        );
        store.upsert_session(&record, "fp1").unwrap();

        assert!(store.delete_session("editor:s1").unwrap());
        assert!(store.get_session("editor:s1").unwrap().is_none());
        assert_eq!(count(&store, "SELECT COUNT(*) FROM messages"), 0);
        assert_eq!(count(&store, "SELECT COUNT(*) FROM session_tags"), 0);
        assert_eq!(count(&store, "SELECT COUNT(*) FROM search_index"), 0);

        // Deleting again reports not-found
        assert!(!store.delete_session("editor:s1").unwrap());
    }

    #[test]
    fn test_rebuild_search_index_matches_messages() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        store
            .upsert_session(&sample_record("editor:s1", &[], &[Role::User, Role::Assistant]), "fp1")
            .unwrap();
        store
            .upsert_session(&sample_record("tasks:t1", &[], &[Role::User]), "fp2")
            .unwrap();

        let rows = store.rebuild_search_index().unwrap();
        assert_eq!(rows, 3);
        assert_eq!(count(&store, "SELECT COUNT(*) FROM search_index"), 3);
    }

    #[test]
    fn test_prune_keeps_most_recent() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        for i in 0..5 {
            let mut record = sample_record(&format!("editor:s{i}"), &[], &[Role::User]);
            record.updated_at =
                Some(chrono::Utc::now() - chrono::Duration::days(5 - i as i64));
            store.upsert_session(&record, &format!("fp{i}")).unwrap();
        }

        let pruned = store.prune_sessions(2).unwrap();
        assert_eq!(pruned, 3);
        assert!(store.get_session("editor:s4").unwrap().is_some());
        assert!(store.get_session("editor:s3").unwrap().is_some());
        assert!(store.get_session("editor:s0").unwrap().is_none());
    }

    #[test]
    fn test_legacy_layout_migration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("legacy.db");

        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                r#"CREATE TABLE sessions (
                       id TEXT PRIMARY KEY,
                       source TEXT,
                       title TEXT,
                       created_at DATETIME,
                       updated_at DATETIME,
                       source_path TEXT,
                       content TEXT
                   );"#,
            )
            .unwrap();
            conn.execute(
                "INSERT INTO sessions VALUES (?, ?, ?, ?, ?, ?, ?)",
                params![
                    "editor:old1",
                    "editor",
                    "Old session",
                    "2024-01-01T00:00:00Z",
                    "2024-01-02T00:00:00Z",
                    "/tmp/old1.json",
                    r#"[{"role":"user","content":"hello"},{"role":"assistant","content":"hi"},{"role":"tool","content":"dropped"}]"#,
                ],
            )
            .unwrap();
        }

        let store = CanonicalStore::open(&path).unwrap();
        assert!(store.is_enabled());

        let session = store.get_session("editor:old1").unwrap().unwrap();
        assert_eq!(session.message_count, 2);
        assert_eq!(session.title.as_deref(), Some("Old session"));

        let messages = store.get_messages("editor:old1").unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[1].role, "assistant");

        // Fingerprint is cleared by migration, so the next scan refreshes
        assert!(store.fingerprint_of("editor:old1").unwrap().is_none());
    }

    #[test]
    fn test_message_ordering_by_timestamp_then_seq() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let base = chrono::Utc::now();
        let mut record = sample_record("editor:s1", &[], &[]);
        record.messages = vec![
            MessageRecord {
                external_id: None,
                role: Role::Assistant,
                content: "second by time".into(),
                timestamp: Some(base + chrono::Duration::seconds(10)),
            },
            MessageRecord {
                external_id: None,
                role: Role::User,
                content: "first by time".into(),
                timestamp: Some(base),
            },
            MessageRecord {
                external_id: None,
                role: Role::User,
                content: "tie broken by insertion".into(),
                timestamp: Some(base),
            },
        ];
        store.upsert_session(&record, "fp1").unwrap();

        let messages = store.get_messages("editor:s1").unwrap();
        assert_eq!(messages[0].content, "first by time");
        assert_eq!(messages[1].content, "tie broken by insertion");
        assert_eq!(messages[2].content, "second by time");
    }
}
