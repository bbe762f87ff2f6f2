//! Companion-extension task log adapter
//!
//! The companion extension keeps one directory per task. Two layouts
//! exist in the wild:
//!   - conversation.json: a single combined transcript (newer builds)
//!   - api_history.json + ui_messages.json: split files where the API
//!     transcript carries the content and the UI log fills in
//!     timestamps the API file lacks (older builds)

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;

use super::{
    derive_title, fingerprint_dir, MessageRecord, Role, SessionRecord, SourceAdapter, UnitRef,
};

pub struct TaskLogAdapter {
    base_path: PathBuf,
}

// Combined layout
#[derive(Debug, Deserialize)]
struct ConversationFile {
    #[serde(rename = "taskId")]
    task_id: Option<String>,
    title: Option<String>,
    workspace: Option<String>,
    environment: Option<Value>,
    created: Option<i64>,
    updated: Option<i64>,
    #[serde(default)]
    messages: Vec<ConversationMessage>,
}

#[derive(Debug, Deserialize)]
struct ConversationMessage {
    role: String,
    content: Value,
    #[serde(rename = "ts")]
    timestamp: Option<i64>,
}

// Split layout, UI side
#[derive(Debug, Deserialize)]
struct UiMessage {
    #[serde(rename = "ts")]
    timestamp: Option<i64>,
}

impl TaskLogAdapter {
    pub fn new(custom_path: Option<PathBuf>) -> Self {
        let base_path = custom_path.unwrap_or_else(|| {
            let home = dirs::home_dir().unwrap_or_default();
            home.join(".config/Editor/User/globalStorage/companion.tasks/tasks")
        });
        Self { base_path }
    }

    fn parse_combined(&self, unit: &UnitRef, path: &PathBuf) -> Result<SessionRecord> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let file: ConversationFile =
            serde_json::from_str(&content).context("invalid conversation file")?;

        let messages: Vec<MessageRecord> = file
            .messages
            .iter()
            .filter_map(|msg| {
                let role = Role::parse(&msg.role)?;
                let text = flatten_content(&msg.content)?;
                Some(MessageRecord {
                    external_id: None,
                    role,
                    content: text,
                    timestamp: msg.timestamp.and_then(ms_to_datetime),
                })
            })
            .collect();

        let _ = file.task_id; // the unit id is the directory name

        Ok(SessionRecord {
            id: format!("{}:{}", self.name(), unit.id),
            source: self.name().to_string(),
            title: file
                .title
                .filter(|t| !t.trim().is_empty())
                .or_else(|| first_user_title(&messages)),
            project: file.workspace,
            description: None,
            environment: file.environment,
            tags: vec![],
            created_at: file.created.and_then(ms_to_datetime),
            updated_at: file.updated.and_then(ms_to_datetime),
            source_path: unit.path.clone(),
            messages,
        })
    }

    fn parse_split(&self, unit: &UnitRef) -> Result<SessionRecord> {
        let api_path = unit.path.join("api_history.json");
        let content = std::fs::read_to_string(&api_path)
            .with_context(|| format!("reading {}", api_path.display()))?;
        let entries: Vec<ConversationMessage> =
            serde_json::from_str(&content).context("invalid api history file")?;

        // The UI log is optional; it only contributes timestamps
        let ui_timestamps: Vec<Option<i64>> = std::fs::read_to_string(unit.path.join("ui_messages.json"))
            .ok()
            .and_then(|c| serde_json::from_str::<Vec<UiMessage>>(&c).ok())
            .map(|msgs| msgs.into_iter().map(|m| m.timestamp).collect())
            .unwrap_or_default();

        let messages: Vec<MessageRecord> = entries
            .iter()
            .enumerate()
            .filter_map(|(i, msg)| {
                let role = Role::parse(&msg.role)?;
                let text = flatten_content(&msg.content)?;
                let timestamp = msg
                    .timestamp
                    .or_else(|| ui_timestamps.get(i).copied().flatten())
                    .and_then(ms_to_datetime);
                Some(MessageRecord {
                    external_id: None,
                    role,
                    content: text,
                    timestamp,
                })
            })
            .collect();

        Ok(SessionRecord {
            id: format!("{}:{}", self.name(), unit.id),
            source: self.name().to_string(),
            title: first_user_title(&messages),
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

impl SourceAdapter for TaskLogAdapter {
    fn name(&self) -> &'static str {
        "tasks"
    }

    fn description(&self) -> &'static str {
        "Companion extension per-task conversation logs"
    }

    fn is_available(&self) -> bool {
        self.base_path.exists()
    }

    fn discover(&self) -> Result<Vec<UnitRef>> {
        if !self.base_path.exists() {
            return Err(anyhow!(
                "task storage root not found: {}",
                self.base_path.display()
            ));
        }

        let mut units: Vec<UnitRef> = std::fs::read_dir(&self.base_path)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .map(|p| {
                let id = p
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("unknown")
                    .to_string();
                UnitRef { id, path: p }
            })
            .collect();
        units.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(units)
    }

    fn fingerprint(&self, unit: &UnitRef) -> Result<String> {
        fingerprint_dir(&unit.path)
    }

    fn parse_unit(&self, unit: &UnitRef) -> Result<SessionRecord> {
        let combined = unit.path.join("conversation.json");
        if combined.is_file() {
            return self.parse_combined(unit, &combined);
        }

        if unit.path.join("api_history.json").is_file() {
            return self.parse_split(unit);
        }

        bail!("task directory has no recognizable transcript layout");
    }
}

/// API content is either a plain string or an array of typed blocks;
/// only text blocks survive
fn flatten_content(content: &Value) -> Option<String> {
    match content {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Array(blocks) => {
            let text: Vec<&str> = blocks
                .iter()
                .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
                .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                .collect();
            if text.is_empty() {
                None
            } else {
                Some(text.join("\n"))
            }
        }
        _ => None,
    }
}

fn first_user_title(messages: &[MessageRecord]) -> Option<String> {
    messages
        .iter()
        .find(|m| m.role == Role::User)
        .map(|m| derive_title(&m.content))
        .filter(|t| !t.is_empty())
}

fn ms_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    use crate::adapter::{NullObserver, ScanOptions};
    use crate::store::CanonicalStore;

    fn task_dir(root: &std::path::Path, id: &str) -> PathBuf {
        let dir = root.join(id);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_parse_combined_layout() {
        let root = tempfile::tempdir().unwrap();
        let dir = task_dir(root.path(), "task-1");
        std::fs::write(
            dir.join("conversation.json"),
            r#"{
                "taskId": "task-1",
                "workspace": "/home/dev/project",
                "created": 1716000000000,
                "updated": 1716000900000,
                "messages": [
                    {"role": "user", "content": "please migrate the config to yaml", "ts": 1716000000000},
                    {"role": "assistant", "content": [{"type": "text", "text": "on it"}], "ts": 1716000100000}
                ]
            }"#,
        )
        .unwrap();

        let adapter = TaskLogAdapter::new(Some(root.path().to_path_buf()));
        let units = adapter.discover().unwrap();
        assert_eq!(units.len(), 1);

        let record = adapter.parse_unit(&units[0]).unwrap();
        assert_eq!(record.id, "tasks:task-1");
        assert_eq!(record.project.as_deref(), Some("/home/dev/project"));
        assert_eq!(record.messages.len(), 2);
        assert_eq!(record.messages[1].content, "on it");
        assert_eq!(record.title.as_deref(), Some("Migrate the config to yaml"));
    }

    #[test]
    fn test_parse_split_layout_merges_ui_timestamps() {
        let root = tempfile::tempdir().unwrap();
        let dir = task_dir(root.path(), "task-2");
        std::fs::write(
            dir.join("api_history.json"),
            r#"[
                {"role": "user", "content": "add a health endpoint"},
                {"role": "assistant", "content": [{"type": "text", "text": "added /healthz"}, {"type": "tool_use", "name": "edit"}]}
            ]"#,
        )
        .unwrap();
        std::fs::write(
            dir.join("ui_messages.json"),
            r#"[{"ts": 1716000000000}, {"ts": 1716000200000}]"#,
        )
        .unwrap();

        let adapter = TaskLogAdapter::new(Some(root.path().to_path_buf()));
        let units = adapter.discover().unwrap();
        let record = adapter.parse_unit(&units[0]).unwrap();

        assert_eq!(record.messages.len(), 2);
        assert!(record.messages[0].timestamp.is_some());
        assert_eq!(record.messages[1].content, "added /healthz");
        assert!(record.created_at <= record.updated_at);
    }

    #[test]
    fn test_unrecognized_layout_fails_per_unit_only() {
        let root = tempfile::tempdir().unwrap();
        task_dir(root.path(), "task-empty");
        let dir = task_dir(root.path(), "task-ok");
        std::fs::write(
            dir.join("conversation.json"),
            r#"{"messages": [{"role": "user", "content": "hello there"}]}"#,
        )
        .unwrap();

        let db = tempfile::tempdir().unwrap();
        let store = CanonicalStore::open(&db.path().join("t.db")).unwrap();
        let adapter = TaskLogAdapter::new(Some(root.path().to_path_buf()));

        let summary = adapter
            .scan(&store, &ScanOptions::default(), &AtomicBool::new(false), &NullObserver)
            .unwrap();
        assert_eq!(summary.success, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.errors[0].unit, "task-empty");
    }

    #[test]
    fn test_skip_indexed_short_circuits() {
        let root = tempfile::tempdir().unwrap();
        let dir = task_dir(root.path(), "task-1");
        std::fs::write(
            dir.join("conversation.json"),
            r#"{"messages": [{"role": "user", "content": "first pass"}]}"#,
        )
        .unwrap();

        let db = tempfile::tempdir().unwrap();
        let store = CanonicalStore::open(&db.path().join("t.db")).unwrap();
        let adapter = TaskLogAdapter::new(Some(root.path().to_path_buf()));
        let stop = AtomicBool::new(false);

        adapter
            .scan(&store, &ScanOptions::default(), &stop, &NullObserver)
            .unwrap();

        // Content changes, but skip_indexed trusts the recorded fingerprint
        std::fs::write(
            dir.join("conversation.json"),
            r#"{"messages": [{"role": "user", "content": "second pass"}]}"#,
        )
        .unwrap();

        let summary = adapter
            .scan(&store, &ScanOptions { skip_indexed: true }, &stop, &NullObserver)
            .unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.success, 0);

        let messages = store.get_messages("tasks:task-1").unwrap();
        assert_eq!(messages[0].content, "first pass");
    }
}
