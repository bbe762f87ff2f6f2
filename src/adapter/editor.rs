//! Editor workspace-storage adapter
//!
//! Reads chat history the editor keeps per workspace under its storage
//! root. Three layouts coexist across editor versions and must all be
//! tolerated, often in the same storage root:
//!   - chat_sessions.json: one file per workspace holding every session
//!   - tabs/<tab_id>.json: one file per chat tab (older builds)
//!   - sessions/<id>.json: legacy one-document-per-session directory
//!
//! Also provides the sampling-based usage estimate: a bounded number of
//! workspaces is parsed and the totals are extrapolated by the sampling
//! factor. That path never writes to the store.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::PathBuf;

use super::{
    derive_title, fingerprint_file, MessageRecord, Role, SessionRecord, SourceAdapter, UnitRef,
};

/// Workspaces parsed per usage estimate
pub const DEFAULT_SAMPLE_LIMIT: usize = 20;

pub struct EditorStoreAdapter {
    base_path: PathBuf,
}

/// Extrapolated counts from a bounded workspace sample.
/// `approximate` is always true: this is documented estimation, not
/// accounting.
#[derive(Debug, Clone, Serialize)]
pub struct UsageEstimate {
    pub total_workspaces: usize,
    pub sampled_workspaces: usize,
    pub estimated_sessions: u64,
    pub estimated_messages: u64,
    pub approximate: bool,
}

// Older per-tab layout
#[derive(Debug, Deserialize)]
struct TabFile {
    #[serde(rename = "tabId")]
    tab_id: Option<String>,
    title: Option<String>,
    #[serde(default)]
    bubbles: Vec<Bubble>,
}

#[derive(Debug, Deserialize)]
struct Bubble {
    #[serde(rename = "type")]
    bubble_type: String,
    text: Option<String>,
    timestamp: Option<i64>,
}

impl EditorStoreAdapter {
    pub fn new(custom_path: Option<PathBuf>) -> Self {
        let base_path = custom_path.unwrap_or_else(|| {
            let home = dirs::home_dir().unwrap_or_default();
            home.join(".config/Editor/User/workspaceStorage")
        });
        Self { base_path }
    }

    fn workspace_dirs(&self) -> Result<Vec<PathBuf>> {
        if !self.base_path.exists() {
            return Err(anyhow!(
                "workspace storage root not found: {}",
                self.base_path.display()
            ));
        }

        let mut dirs: Vec<PathBuf> = std::fs::read_dir(&self.base_path)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        dirs.sort();
        Ok(dirs)
    }

    fn workspace_units(&self, workspace: &PathBuf) -> Vec<UnitRef> {
        let ws_name = workspace
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();

        let combined = workspace.join("chat_sessions.json");
        if combined.is_file() {
            // One unit per session inside the combined file; a file that
            // fails to parse yields a single failing unit so the error
            // surfaces in the scan summary
            return match session_ids_in_combined(&combined) {
                Ok(ids) => ids
                    .into_iter()
                    .map(|sid| UnitRef {
                        id: format!("{ws_name}/{sid}"),
                        path: combined.clone(),
                    })
                    .collect(),
                Err(_) => vec![UnitRef {
                    id: ws_name,
                    path: combined,
                }],
            };
        }

        for (subdir, ext) in [("tabs", "json"), ("sessions", "json")] {
            let dir = workspace.join(subdir);
            if dir.is_dir() {
                let mut units: Vec<UnitRef> = std::fs::read_dir(&dir)
                    .into_iter()
                    .flatten()
                    .filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| p.extension().map(|e| e == ext).unwrap_or(false))
                    .map(|p| {
                        let stem = p
                            .file_stem()
                            .and_then(|s| s.to_str())
                            .unwrap_or("unknown")
                            .to_string();
                        UnitRef {
                            id: format!("{ws_name}/{stem}"),
                            path: p,
                        }
                    })
                    .collect();
                units.sort_by(|a, b| a.id.cmp(&b.id));
                return units;
            }
        }

        vec![]
    }

    /// Stats-only sampling over workspaces: parse at most
    /// `sample_limit`, scale counts by total/sampled
    pub fn estimate_usage(&self, sample_limit: usize) -> Result<UsageEstimate> {
        let workspaces = self.workspace_dirs()?;
        let total = workspaces.len();
        let sample: Vec<_> = workspaces.into_iter().take(sample_limit.max(1)).collect();

        let mut sessions = 0u64;
        let mut messages = 0u64;
        for workspace in &sample {
            for unit in self.workspace_units(workspace) {
                let Ok(record) = self.parse_unit(&unit) else {
                    continue;
                };
                sessions += 1;
                messages += record.messages.len() as u64;
            }
        }

        let factor = if sample.is_empty() {
            0.0
        } else {
            total as f64 / sample.len() as f64
        };

        Ok(UsageEstimate {
            total_workspaces: total,
            sampled_workspaces: sample.len(),
            estimated_sessions: (sessions as f64 * factor).round() as u64,
            estimated_messages: (messages as f64 * factor).round() as u64,
            approximate: true,
        })
    }

    fn parse_combined_session(&self, unit: &UnitRef, session_id: &str) -> Result<SessionRecord> {
        let content = std::fs::read_to_string(&unit.path)
            .with_context(|| format!("reading {}", unit.path.display()))?;
        let json: Value = serde_json::from_str(&content).context("invalid session file")?;

        let session = json
            .get("sessions")
            .and_then(|s| s.as_array())
            .into_iter()
            .flatten()
            .find(|s| s.get("id").and_then(|v| v.as_str()) == Some(session_id))
            .ok_or_else(|| anyhow!("session {session_id} not present in file"))?;

        self.record_from_value(unit, session)
    }

    fn record_from_value(&self, unit: &UnitRef, session: &Value) -> Result<SessionRecord> {
        let mut messages = vec![];
        for item in session
            .get("messages")
            .and_then(|m| m.as_array())
            .into_iter()
            .flatten()
        {
            let Some(role) = item
                .get("role")
                .and_then(|v| v.as_str())
                .and_then(Role::parse)
            else {
                continue;
            };
            let content = item
                .get("content")
                .or_else(|| item.get("text"))
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            if content.is_empty() {
                continue;
            }
            messages.push(MessageRecord {
                external_id: item.get("id").and_then(|v| v.as_str()).map(String::from),
                role,
                content,
                timestamp: parse_timestamp(item.get("timestamp")),
            });
        }

        let title = session
            .get("title")
            .and_then(|v| v.as_str())
            .filter(|t| !t.trim().is_empty())
            .map(String::from)
            .or_else(|| first_user_title(&messages));

        let tags = session
            .get("tags")
            .and_then(|t| t.as_array())
            .into_iter()
            .flatten()
            .filter_map(|t| t.as_str())
            .map(String::from)
            .collect();

        Ok(SessionRecord {
            id: format!("{}:{}", self.name(), unit.id),
            source: self.name().to_string(),
            title,
            project: session
                .get("project")
                .and_then(|v| v.as_str())
                .map(String::from),
            description: session
                .get("description")
                .and_then(|v| v.as_str())
                .map(String::from),
            environment: session.get("environment").cloned(),
            tags,
            created_at: parse_timestamp(session.get("createdAt")),
            updated_at: parse_timestamp(session.get("updatedAt")),
            source_path: unit.path.clone(),
            messages,
        })
    }

    fn parse_tab_file(&self, unit: &UnitRef) -> Result<SessionRecord> {
        let content = std::fs::read_to_string(&unit.path)
            .with_context(|| format!("reading {}", unit.path.display()))?;
        let tab: TabFile = serde_json::from_str(&content).context("invalid tab file")?;

        let messages: Vec<MessageRecord> = tab
            .bubbles
            .iter()
            .filter_map(|bubble| {
                let role = Role::parse(&bubble.bubble_type)?;
                let text = bubble.text.as_deref()?.trim();
                if text.is_empty() {
                    return None;
                }
                Some(MessageRecord {
                    external_id: None,
                    role,
                    content: text.to_string(),
                    timestamp: bubble
                        .timestamp
                        .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
                })
            })
            .collect();

        let title = tab
            .title
            .filter(|t| !t.trim().is_empty())
            .or_else(|| first_user_title(&messages));

        let _ = tab.tab_id; // the unit id already carries it

        Ok(SessionRecord {
            id: format!("{}:{}", self.name(), unit.id),
            source: self.name().to_string(),
            title,
            project: None,
            description: None,
            environment: None,
            tags: vec![],
            created_at: messages.iter().filter_map(|m| m.timestamp).min(),
            updated_at: messages.iter().filter_map(|m| m.timestamp).max(),
            source_path: unit.path.clone(),
            messages,
        })
    }
}

impl SourceAdapter for EditorStoreAdapter {
    fn name(&self) -> &'static str {
        "editor"
    }

    fn description(&self) -> &'static str {
        "Editor workspace storage chat sessions"
    }

    fn is_available(&self) -> bool {
        self.base_path.exists()
    }

    fn discover(&self) -> Result<Vec<UnitRef>> {
        let mut units = vec![];
        for workspace in self.workspace_dirs()? {
            units.extend(self.workspace_units(&workspace));
        }
        Ok(units)
    }

    fn fingerprint(&self, unit: &UnitRef) -> Result<String> {
        if unit.path.file_name().and_then(|n| n.to_str()) == Some("chat_sessions.json") {
            // Per-session fingerprint inside the combined file, so one
            // edited session doesn't force re-ingesting its siblings
            let (_, session_id) = split_unit_id(&unit.id)?;
            let content = std::fs::read_to_string(&unit.path)?;
            let json: Value = serde_json::from_str(&content).context("invalid session file")?;
            let session = json
                .get("sessions")
                .and_then(|s| s.as_array())
                .into_iter()
                .flatten()
                .find(|s| s.get("id").and_then(|v| v.as_str()) == Some(session_id))
                .ok_or_else(|| anyhow!("session {session_id} not present in file"))?;

            let mut hasher = Sha256::new();
            hasher.update(session.to_string().as_bytes());
            Ok(hex::encode(hasher.finalize()))
        } else {
            fingerprint_file(&unit.path)
        }
    }

    fn parse_unit(&self, unit: &UnitRef) -> Result<SessionRecord> {
        if unit.path.file_name().and_then(|n| n.to_str()) == Some("chat_sessions.json") {
            let (_, session_id) = split_unit_id(&unit.id)?;
            return self.parse_combined_session(unit, session_id);
        }

        if unit
            .path
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            == Some("tabs")
        {
            return self.parse_tab_file(unit);
        }

        // Legacy one-document-per-session layout
        let content = std::fs::read_to_string(&unit.path)
            .with_context(|| format!("reading {}", unit.path.display()))?;
        let json: Value = serde_json::from_str(&content).context("invalid legacy session file")?;
        self.record_from_value(unit, &json)
    }
}

fn split_unit_id(unit_id: &str) -> Result<(&str, &str)> {
    unit_id
        .split_once('/')
        .ok_or_else(|| anyhow!("malformed unit id: {unit_id}"))
}

fn session_ids_in_combined(path: &PathBuf) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)?;
    let json: Value = serde_json::from_str(&content)?;
    Ok(json
        .get("sessions")
        .and_then(|s| s.as_array())
        .into_iter()
        .flatten()
        .filter_map(|s| s.get("id").and_then(|v| v.as_str()))
        .map(String::from)
        .collect())
}

fn first_user_title(messages: &[MessageRecord]) -> Option<String> {
    messages
        .iter()
        .find(|m| m.role == Role::User)
        .map(|m| derive_title(&m.content))
        .filter(|t| !t.is_empty())
}

/// Timestamps arrive as epoch milliseconds in newer layouts and RFC3339
/// strings in older ones
fn parse_timestamp(value: Option<&Value>) -> Option<DateTime<Utc>> {
    match value? {
        Value::Number(n) => Utc.timestamp_millis_opt(n.as_i64()?).single(),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    use crate::adapter::{NullObserver, ScanOptions};
    use crate::store::CanonicalStore;

    fn write_combined(root: &std::path::Path, workspace: &str, body: &str) {
        let dir = root.join(workspace);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("chat_sessions.json"), body).unwrap();
    }

    const COMBINED: &str = r#"{
        "version": 2,
        "sessions": [
            {
                "id": "s1",
                "title": "Login bug",
                "createdAt": 1716000000000,
                "updatedAt": 1716000500000,
                "tags": ["auth"],
                "messages": [
                    {"id": "m1", "role": "user", "content": "the login page 500s", "timestamp": 1716000000000},
                    {"id": "m2", "role": "assistant", "content": "checking the handler", "timestamp": 1716000100000}
                ]
            },
            {
                "id": "s2",
                "messages": [
                    {"role": "user", "content": "can you add pagination to the list view"}
                ]
            }
        ]
    }"#;

    #[test]
    fn test_discover_combined_layout() {
        let dir = tempfile::tempdir().unwrap();
        write_combined(dir.path(), "ws1", COMBINED);

        let adapter = EditorStoreAdapter::new(Some(dir.path().to_path_buf()));
        let units = adapter.discover().unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].id, "ws1/s1");
    }

    #[test]
    fn test_parse_combined_session() {
        let dir = tempfile::tempdir().unwrap();
        write_combined(dir.path(), "ws1", COMBINED);

        let adapter = EditorStoreAdapter::new(Some(dir.path().to_path_buf()));
        let units = adapter.discover().unwrap();

        let record = adapter.parse_unit(&units[0]).unwrap();
        assert_eq!(record.id, "editor:ws1/s1");
        assert_eq!(record.title.as_deref(), Some("Login bug"));
        assert_eq!(record.tags, vec!["auth"]);
        assert_eq!(record.messages.len(), 2);
        assert!(record.created_at.is_some());

        // Untitled session falls back to the heuristic
        let record = adapter.parse_unit(&units[1]).unwrap();
        assert_eq!(record.title.as_deref(), Some("Add pagination to the list view"));
    }

    #[test]
    fn test_parse_tab_layout() {
        let dir = tempfile::tempdir().unwrap();
        let tabs = dir.path().join("ws1/tabs");
        std::fs::create_dir_all(&tabs).unwrap();
        std::fs::write(
            tabs.join("tab-9.json"),
            r#"{"tabId": "tab-9", "bubbles": [
                {"type": "user", "text": "rename the module", "timestamp": 1716000000000},
                {"type": "ai", "text": "done"},
                {"type": "system_notice", "text": "ignored"}
            ]}"#,
        )
        .unwrap();

        let adapter = EditorStoreAdapter::new(Some(dir.path().to_path_buf()));
        let units = adapter.discover().unwrap();
        assert_eq!(units.len(), 1);

        let record = adapter.parse_unit(&units[0]).unwrap();
        assert_eq!(record.id, "editor:ws1/tab-9");
        assert_eq!(record.messages.len(), 2);
        assert_eq!(record.messages[1].role, Role::Assistant);
        assert_eq!(record.title.as_deref(), Some("Rename the module"));
    }

    #[test]
    fn test_scan_recovers_per_unit_errors() {
        let dir = tempfile::tempdir().unwrap();
        write_combined(dir.path(), "ws-good", COMBINED);
        write_combined(dir.path(), "ws-bad", "{ not json");

        let db = tempfile::tempdir().unwrap();
        let store = CanonicalStore::open(&db.path().join("t.db")).unwrap();
        let adapter = EditorStoreAdapter::new(Some(dir.path().to_path_buf()));

        let summary = adapter
            .scan(&store, &ScanOptions::default(), &AtomicBool::new(false), &NullObserver)
            .unwrap();
        assert_eq!(summary.success, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.errors.len(), 1);
        assert_eq!(summary.messages_imported, 3);
        assert_eq!(summary.total_processed(), 3);
    }

    #[test]
    fn test_rescan_identical_content_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        write_combined(dir.path(), "ws1", COMBINED);

        let db = tempfile::tempdir().unwrap();
        let store = CanonicalStore::open(&db.path().join("t.db")).unwrap();
        let adapter = EditorStoreAdapter::new(Some(dir.path().to_path_buf()));
        let stop = AtomicBool::new(false);

        let first = adapter
            .scan(&store, &ScanOptions::default(), &stop, &NullObserver)
            .unwrap();
        assert_eq!(first.success, 2);
        let before = store.get_session("editor:ws1/s1").unwrap().unwrap();

        let second = adapter
            .scan(&store, &ScanOptions::default(), &stop, &NullObserver)
            .unwrap();
        assert_eq!(second.success, 0);
        assert_eq!(second.skipped, 2);
        assert_eq!(second.messages_imported, 0);

        let after = store.get_session("editor:ws1/s1").unwrap().unwrap();
        assert_eq!(before.updated_at, after.updated_at);
    }

    #[test]
    fn test_missing_root_is_fatal() {
        let adapter = EditorStoreAdapter::new(Some(PathBuf::from("/nonexistent/chatvault-root")));
        assert!(!adapter.is_available());
        assert!(adapter.discover().is_err());
    }

    #[test]
    fn test_estimate_usage_extrapolates() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..4 {
            write_combined(dir.path(), &format!("ws{i}"), COMBINED);
        }

        let adapter = EditorStoreAdapter::new(Some(dir.path().to_path_buf()));
        let estimate = adapter.estimate_usage(2).unwrap();
        assert_eq!(estimate.total_workspaces, 4);
        assert_eq!(estimate.sampled_workspaces, 2);
        // 2 sessions with 3 messages per sampled workspace, scaled x2
        assert_eq!(estimate.estimated_sessions, 8);
        assert_eq!(estimate.estimated_messages, 12);
        assert!(estimate.approximate);
    }
}
