//! User-supplied export file adapter
//!
//! Ingests transcript files users drop into the uploads directory.
//! Two export shapes are accepted:
//!   - single session: {"session": {...}, "messages": [...]}
//!   - bundle: {"sessions": [{... "messages": [...]}, ...]}
//!
//! Bundles expand to one unit per contained session. Fingerprints are
//! file-level: editing a bundle re-ingests its sessions, which the
//! store's delete-and-reinsert upsert absorbs.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::{
    derive_title, fingerprint_file, MessageRecord, Role, SessionRecord, SourceAdapter, UnitRef,
};

pub struct UploadAdapter {
    base_path: PathBuf,
}

impl UploadAdapter {
    pub fn new(custom_path: Option<PathBuf>) -> Self {
        let base_path = custom_path.unwrap_or_else(|| {
            let home = dirs::home_dir().unwrap_or_default();
            home.join(".local/share/chatvault/uploads")
        });
        Self { base_path }
    }

    fn export_files(&self) -> Result<Vec<PathBuf>> {
        if !self.base_path.exists() {
            return Err(anyhow!(
                "uploads root not found: {}",
                self.base_path.display()
            ));
        }

        let mut files: Vec<PathBuf> = WalkDir::new(&self.base_path)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
            .collect();
        files.sort();
        Ok(files)
    }

    fn build_record(&self, unit: &UnitRef, session: &Value, messages: &Value) -> Result<SessionRecord> {
        let records: Vec<MessageRecord> = messages
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|item| {
                let role = item
                    .get("role")
                    .and_then(|v| v.as_str())
                    .and_then(Role::parse)?;
                let content = item.get("content").and_then(|v| v.as_str())?.to_string();
                if content.trim().is_empty() {
                    return None;
                }
                Some(MessageRecord {
                    external_id: item.get("id").and_then(|v| v.as_str()).map(String::from),
                    role,
                    content,
                    timestamp: parse_rfc3339(item.get("timestamp")),
                })
            })
            .collect();

        let title = session
            .get("title")
            .and_then(|v| v.as_str())
            .filter(|t| !t.trim().is_empty())
            .map(String::from)
            .or_else(|| {
                records
                    .iter()
                    .find(|m| m.role == Role::User)
                    .map(|m| derive_title(&m.content))
                    .filter(|t| !t.is_empty())
            });

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
            tags: session
                .get("tags")
                .and_then(|t| t.as_array())
                .into_iter()
                .flatten()
                .filter_map(|t| t.as_str())
                .map(String::from)
                .collect(),
            created_at: parse_rfc3339(session.get("createdAt")),
            updated_at: parse_rfc3339(session.get("updatedAt")),
            source_path: unit.path.clone(),
            messages: records,
        })
    }
}

impl SourceAdapter for UploadAdapter {
    fn name(&self) -> &'static str {
        "uploads"
    }

    fn description(&self) -> &'static str {
        "User-supplied transcript export files"
    }

    fn is_available(&self) -> bool {
        self.base_path.exists()
    }

    fn discover(&self) -> Result<Vec<UnitRef>> {
        let mut units = vec![];
        for file in self.export_files()? {
            let stem = file_stem(&file);
            match read_json(&file) {
                Ok(json) => {
                    if let Some(sessions) = json.get("sessions").and_then(|s| s.as_array()) {
                        for (i, session) in sessions.iter().enumerate() {
                            let sid = session
                                .get("id")
                                .and_then(|v| v.as_str())
                                .map(String::from)
                                .unwrap_or_else(|| i.to_string());
                            units.push(UnitRef {
                                id: format!("{stem}/{sid}"),
                                path: file.clone(),
                            });
                        }
                    } else {
                        units.push(UnitRef {
                            id: stem,
                            path: file,
                        });
                    }
                }
                // Surface the parse failure as a failing unit instead of
                // hiding the file from the summary
                Err(_) => units.push(UnitRef {
                    id: stem,
                    path: file,
                }),
            }
        }
        Ok(units)
    }

    fn fingerprint(&self, unit: &UnitRef) -> Result<String> {
        fingerprint_file(&unit.path)
    }

    fn parse_unit(&self, unit: &UnitRef) -> Result<SessionRecord> {
        let json = read_json(&unit.path)?;

        if let Some((_, sid)) = unit.id.split_once('/') {
            let sessions = json
                .get("sessions")
                .and_then(|s| s.as_array())
                .ok_or_else(|| anyhow!("bundle has no sessions array"))?;
            let session = sessions
                .iter()
                .enumerate()
                .find(|(i, s)| {
                    s.get("id").and_then(|v| v.as_str()) == Some(sid) || i.to_string() == sid
                })
                .map(|(_, s)| s)
                .ok_or_else(|| anyhow!("session {sid} not present in bundle"))?;
            let messages = session.get("messages").cloned().unwrap_or(Value::Null);
            return self.build_record(unit, session, &messages);
        }

        let session = json
            .get("session")
            .ok_or_else(|| anyhow!("export file has no session object"))?;
        let messages = json.get("messages").cloned().unwrap_or(Value::Null);
        self.build_record(unit, session, &messages)
    }
}

fn read_json(path: &Path) -> Result<Value> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&content).context("invalid export file")
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("unknown")
        .to_string()
}

fn parse_rfc3339(value: Option<&Value>) -> Option<DateTime<Utc>> {
    value?
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}
