//! Source adapter trait and registry
//!
//! Each adapter translates one external origin's on-disk layout into
//! canonical session/message records. Adapters only produce transient
//! values; the store decides what actually gets persisted.
//!
//! Adapter status:
//! - editor: workspace-storage chat files (three historical layouts)
//! - tasks: companion-extension per-task directories (two layouts)
//! - uploads: user-supplied export files

mod editor;
mod tasks;
mod upload;

pub use editor::{EditorStoreAdapter, UsageEstimate, DEFAULT_SAMPLE_LIMIT};
pub use tasks::TaskLogAdapter;
pub use upload::UploadAdapter;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::store::{CanonicalStore, UpsertOutcome};
use crate::Config;

/// Reference to one scannable unit (a file or directory holding one session)
#[derive(Debug, Clone)]
pub struct UnitRef {
    pub id: String,
    pub path: PathBuf,
}

/// Message role, the only values the store accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    /// Map a source-specific role string; non-conversation entries
    /// (tool results, telemetry) return None and are dropped.
    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "user" | "human" => Some(Role::User),
            "assistant" | "ai" | "bot" => Some(Role::Assistant),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

/// Canonical message value produced by adapters
#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub external_id: Option<String>,
    pub role: Role,
    pub content: String,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Canonical session value produced by adapters
#[derive(Debug, Clone)]
pub struct SessionRecord {
    /// Globally unique: "{source}:{unit id}"
    pub id: String,
    pub source: String,
    pub title: Option<String>,
    pub project: Option<String>,
    pub description: Option<String>,
    /// Free-form environment snapshot, stored as JSON
    pub environment: Option<serde_json::Value>,
    pub tags: Vec<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub source_path: PathBuf,
    pub messages: Vec<MessageRecord>,
}

/// One recovered per-unit failure
#[derive(Debug, Clone, Serialize)]
pub struct UnitError {
    pub unit: String,
    pub error: String,
}

/// Structured scan result returned to the caller
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanSummary {
    pub source: String,
    pub sessions_found: usize,
    pub messages_imported: usize,
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errors: Vec<UnitError>,
}

impl ScanSummary {
    pub fn total_processed(&self) -> usize {
        self.success + self.failed + self.skipped
    }
}

/// Per-scan options resolved from config by the service
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// Skip units whose path already has any recorded fingerprint,
    /// without re-reading content
    pub skip_indexed: bool,
}

/// Progress events published during a scan, decoupled from any transport
pub trait ScanObserver: Send + Sync {
    fn scan_started(&self, _source: &str, _units: usize) {}
    fn unit_done(&self, _source: &str, _unit: &str, _outcome: UnitOutcome) {}
    fn scan_completed(&self, _source: &str, _summary: &ScanSummary) {}
}

/// Observer that discards everything
pub struct NullObserver;

impl ScanObserver for NullObserver {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOutcome {
    Imported,
    Unchanged,
    Skipped,
    Failed,
}

/// Source adapter trait
pub trait SourceAdapter: Send + Sync {
    /// Stable source name, also the session id prefix ("editor", "tasks", ...)
    fn name(&self) -> &'static str;

    /// Human-readable description
    fn description(&self) -> &'static str;

    /// Whether the configured root exists at all
    fn is_available(&self) -> bool;

    /// Enumerate candidate units under the root.
    /// A missing root is fatal for the scan and returns Err.
    fn discover(&self) -> Result<Vec<UnitRef>>;

    /// Stable fingerprint for a unit's current content
    fn fingerprint(&self, unit: &UnitRef) -> Result<String>;

    /// Parse one unit into a canonical session. Zero-message units are
    /// valid; malformed units return Err and are recovered by the loop.
    fn parse_unit(&self, unit: &UnitRef) -> Result<SessionRecord>;

    /// Walk every unit, upsert changed ones, and report a structured
    /// summary. One bad unit never aborts the scan; the stop flag is
    /// honored between units, never mid-parse.
    fn scan(
        &self,
        store: &CanonicalStore,
        options: &ScanOptions,
        stop: &AtomicBool,
        observer: &dyn ScanObserver,
    ) -> Result<ScanSummary> {
        let units = self.discover()?;
        let mut summary = ScanSummary {
            source: self.name().to_string(),
            sessions_found: units.len(),
            ..Default::default()
        };
        observer.scan_started(self.name(), units.len());

        for unit in &units {
            if stop.load(Ordering::Relaxed) {
                tracing::info!(target: "chatvault::scan", source = self.name(), "stop requested, scan interrupted");
                break;
            }

            let session_id = format!("{}:{}", self.name(), unit.id);

            if options.skip_indexed && store.fingerprint_of(&session_id)?.is_some() {
                summary.skipped += 1;
                observer.unit_done(self.name(), &unit.id, UnitOutcome::Skipped);
                continue;
            }

            let outcome = self.ingest_unit(store, unit, &session_id);
            match outcome {
                Ok(UnitIngest::Imported(messages)) => {
                    summary.success += 1;
                    summary.messages_imported += messages;
                    observer.unit_done(self.name(), &unit.id, UnitOutcome::Imported);
                }
                Ok(UnitIngest::Unchanged) => {
                    summary.skipped += 1;
                    observer.unit_done(self.name(), &unit.id, UnitOutcome::Unchanged);
                }
                Err(e) => {
                    tracing::warn!(target: "chatvault::scan", source = self.name(), unit = %unit.id, error = %e, "unit failed");
                    summary.failed += 1;
                    summary.errors.push(UnitError {
                        unit: unit.id.clone(),
                        error: format!("{e:#}"),
                    });
                    observer.unit_done(self.name(), &unit.id, UnitOutcome::Failed);
                }
            }
        }

        observer.scan_completed(self.name(), &summary);
        Ok(summary)
    }

    /// Fingerprint-gated ingest of a single unit
    fn ingest_unit(
        &self,
        store: &CanonicalStore,
        unit: &UnitRef,
        session_id: &str,
    ) -> Result<UnitIngest> {
        let fingerprint = self
            .fingerprint(unit)
            .with_context(|| format!("fingerprinting {}", unit.path.display()))?;

        if store.fingerprint_of(session_id)?.as_deref() == Some(fingerprint.as_str()) {
            return Ok(UnitIngest::Unchanged);
        }

        let record = self.parse_unit(unit)?;
        debug_assert_eq!(record.id, session_id);
        let imported = record.messages.len();
        match store.upsert_session(&record, &fingerprint)? {
            UpsertOutcome::Unchanged => Ok(UnitIngest::Unchanged),
            _ => Ok(UnitIngest::Imported(imported)),
        }
    }
}

/// Outcome of ingesting one unit
pub enum UnitIngest {
    Imported(usize),
    Unchanged,
}

/// Registry of configured adapters
pub struct AdapterRegistry {
    adapters: Vec<Box<dyn SourceAdapter>>,
}

impl AdapterRegistry {
    pub fn new(config: &Config) -> Self {
        let mut registry = Self { adapters: vec![] };

        if config.is_source_enabled("editor") {
            registry.register(Box::new(EditorStoreAdapter::new(
                config.source_root("editor"),
            )));
        }

        if config.is_source_enabled("tasks") {
            registry.register(Box::new(TaskLogAdapter::new(config.source_root("tasks"))));
        }

        if config.is_source_enabled("uploads") {
            registry.register(Box::new(UploadAdapter::new(config.source_root("uploads"))));
        }

        registry
    }

    pub fn register(&mut self, adapter: Box<dyn SourceAdapter>) {
        self.adapters.push(adapter);
    }

    pub fn available_adapters(&self) -> Vec<&dyn SourceAdapter> {
        self.adapters
            .iter()
            .filter(|a| a.is_available())
            .map(|a| a.as_ref())
            .collect()
    }

    pub fn all_adapters(&self) -> Vec<&dyn SourceAdapter> {
        self.adapters.iter().map(|a| a.as_ref()).collect()
    }

    pub fn get_adapter(&self, name: &str) -> Option<&dyn SourceAdapter> {
        self.adapters
            .iter()
            .find(|a| a.name() == name)
            .map(|a| a.as_ref())
    }
}

// ============================================
// FINGERPRINTS
// ============================================

/// Content hash of a single file
pub fn fingerprint_file(path: &Path) -> Result<String> {
    let content = std::fs::read(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&content);
    Ok(hex::encode(hasher.finalize()))
}

/// Content hash of a directory unit: every regular file, in name order,
/// so the fingerprint is stable across filesystem iteration order
pub fn fingerprint_dir(path: &Path) -> Result<String> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(path)
        .with_context(|| format!("reading {}", path.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    files.sort();

    let mut hasher = Sha256::new();
    for file in &files {
        if let Some(name) = file.file_name().and_then(|n| n.to_str()) {
            hasher.update(name.as_bytes());
        }
        hasher.update(std::fs::read(file)?);
    }
    Ok(hex::encode(hasher.finalize()))
}

// ============================================
// TITLE HEURISTICS
// ============================================

/// Character budget for derived titles
const TITLE_BUDGET: usize = 60;

/// Request prefixes stripped before titling ("can you fix the tests"
/// becomes "Fix the tests")
const REQUEST_PREFIXES: &[&str] = &[
    "please ",
    "hi, ",
    "hey, ",
    "hello, ",
    "can you ",
    "could you ",
    "would you ",
    "help me ",
    "i want to ",
    "i need to ",
    "i need you to ",
    "i'd like to ",
    "i would like to ",
    "let's ",
];

/// Derive a short human-readable title from the first user message.
/// Pattern matching first, hard truncation as the fallback.
pub fn derive_title(text: &str) -> String {
    let first_line = text
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("");

    let mut rest = first_line;
    loop {
        let lower = rest.to_lowercase();
        let Some(prefix) = REQUEST_PREFIXES.iter().find(|p| lower.starts_with(**p)) else {
            break;
        };
        rest = rest[prefix.len()..].trim_start();
    }

    // Cut at the first sentence boundary inside the budget
    let cut = rest
        .char_indices()
        .find(|(i, c)| matches!(c, '.' | '?' | '!') && *i > 0 && *i <= TITLE_BUDGET)
        .map(|(i, _)| i);

    let title = match cut {
        Some(i) => &rest[..i],
        None => rest,
    };

    let truncated = truncate_chars(title, TITLE_BUDGET);
    capitalize(truncated.trim())
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", cut.trim_end())
    }
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(c) => c.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_title_strips_request_prefixes() {
        assert_eq!(derive_title("can you fix the login bug"), "Fix the login bug");
        assert_eq!(
            derive_title("Please help me refactor the parser"),
            "Refactor the parser"
        );
        assert_eq!(derive_title("hi, i want to add dark mode"), "Add dark mode");
    }

    #[test]
    fn test_derive_title_cuts_at_sentence_boundary() {
        assert_eq!(
            derive_title("Fix the tests. They started failing after the merge."),
            "Fix the tests"
        );
    }

    #[test]
    fn test_derive_title_truncates_long_input() {
        let long = "explain ".repeat(30);
        let title = derive_title(&long);
        assert!(title.chars().count() <= TITLE_BUDGET);
        assert!(title.ends_with("..."));
    }

    #[test]
    fn test_derive_title_uses_first_nonempty_line() {
        assert_eq!(derive_title("\n\n  add a retry loop\nmore detail"), "Add a retry loop");
    }

    #[test]
    fn test_role_parse() {
        assert_eq!(Role::parse("user"), Some(Role::User));
        assert_eq!(Role::parse("human"), Some(Role::User));
        assert_eq!(Role::parse("assistant"), Some(Role::Assistant));
        assert_eq!(Role::parse("tool"), None);
    }

    #[test]
    fn test_fingerprint_dir_is_order_stable() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.json"), "{}").unwrap();
        std::fs::write(dir.path().join("a.json"), "[]").unwrap();
        let fp1 = fingerprint_dir(dir.path()).unwrap();
        let fp2 = fingerprint_dir(dir.path()).unwrap();
        assert_eq!(fp1, fp2);

        std::fs::write(dir.path().join("a.json"), "[1]").unwrap();
        assert_ne!(fingerprint_dir(dir.path()).unwrap(), fp1);
    }
}
