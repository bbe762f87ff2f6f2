//! SQLite schema definition
//!
//! One physical store file: sessions, messages, tags, session_tags, plus
//! the FTS5 search_index kept in lockstep with messages by the store code.
//! The index is derived state; rebuild_search_index() can always
//! repopulate it from messages + sessions.

pub const SCHEMA: &str = r#"
-- ============================================
-- SESSIONS
-- ============================================

CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,                   -- '{source}:{external id}'
    source TEXT NOT NULL,                  -- adapter name: 'editor', 'tasks', 'uploads'
    title TEXT,
    project TEXT,
    description TEXT,
    environment TEXT,                      -- JSON: environment snapshot from the origin
    message_count INTEGER NOT NULL DEFAULT 0,
    created_at DATETIME,
    updated_at DATETIME,
    source_path TEXT NOT NULL,             -- file/dir the session came from
    fingerprint TEXT,                      -- content hash of the backing unit
    source_mtime DATETIME                  -- last observed mtime of the backing unit
);

-- ============================================
-- MESSAGES
-- ============================================

CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY,
    session_id TEXT NOT NULL,
    external_id TEXT,                      -- original ID from the source, if any
    role TEXT NOT NULL CHECK (role IN ('user', 'assistant', 'system')),
    content TEXT NOT NULL,
    timestamp DATETIME,
    seq INTEGER NOT NULL,                  -- insertion order, breaks timestamp ties
    FOREIGN KEY(session_id) REFERENCES sessions(id) ON DELETE CASCADE
);

-- ============================================
-- TAGS
-- ============================================

CREATE TABLE IF NOT EXISTS tags (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS session_tags (
    session_id TEXT NOT NULL,
    tag_id INTEGER NOT NULL,
    PRIMARY KEY (session_id, tag_id),
    FOREIGN KEY(session_id) REFERENCES sessions(id) ON DELETE CASCADE,
    FOREIGN KEY(tag_id) REFERENCES tags(id) ON DELETE CASCADE
);

-- ============================================
-- SEARCH INDEX
-- ============================================

-- Derived projection of message content + session title, written in the
-- same transaction as every message change
CREATE VIRTUAL TABLE IF NOT EXISTS search_index USING fts5(
    title,
    content,
    session_id UNINDEXED,
    message_id UNINDEXED,
    tokenize = 'porter'
);

-- ============================================
-- INDEXES
-- ============================================

CREATE INDEX IF NOT EXISTS idx_sessions_updated ON sessions(updated_at DESC);
CREATE INDEX IF NOT EXISTS idx_sessions_source ON sessions(source);
CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id);
CREATE INDEX IF NOT EXISTS idx_messages_role ON messages(role);
CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp);
CREATE INDEX IF NOT EXISTS idx_session_tags_tag ON session_tags(tag_id);
"#;
