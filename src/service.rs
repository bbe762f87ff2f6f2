//! History service facade
//!
//! The single entry point the CLI talks to. Owns the store and the
//! adapter registry (both injected, never global), serializes mutating
//! work with per-adapter reentrancy guards, publishes scan events to an
//! observer, and applies retention after successful scans. Only plain
//! serializable records cross this boundary.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::adapter::{AdapterRegistry, NullObserver, ScanObserver, ScanOptions, ScanSummary};
use crate::store::query::{MessageHit, Page, QueryFilter, SessionHit, StatsReport};
use crate::store::{CanonicalStore, MessageRow, SessionRow};
use crate::Config;

/// Cadence of the watch loop's stop-flag checks
const WATCH_TICK: Duration = Duration::from_secs(1);

/// A full session aggregate for the show/export surfaces
#[derive(Debug, Clone, Serialize)]
pub struct SessionDetail {
    pub session: SessionRow,
    pub tags: Vec<String>,
    pub messages: Vec<MessageRow>,
}

pub struct HistoryService {
    store: CanonicalStore,
    registry: AdapterRegistry,
    guards: HashMap<String, AtomicBool>,
    stop: Arc<AtomicBool>,
    observer: Box<dyn ScanObserver>,
    options: HashMap<String, ScanOptions>,
    intervals: HashMap<String, Duration>,
    max_sessions: u64,
}

impl HistoryService {
    pub fn new(store: CanonicalStore, registry: AdapterRegistry, config: &Config) -> Self {
        let mut guards = HashMap::new();
        let mut options = HashMap::new();
        let mut intervals = HashMap::new();
        for adapter in registry.all_adapters() {
            let name = adapter.name().to_string();
            guards.insert(name.clone(), AtomicBool::new(false));
            options.insert(
                name.clone(),
                ScanOptions {
                    skip_indexed: config.skip_indexed(&name),
                },
            );
            if let Some(interval) = config.auto_scan_interval(&name) {
                intervals.insert(name, interval);
            }
        }

        Self {
            store,
            registry,
            guards,
            stop: Arc::new(AtomicBool::new(false)),
            observer: Box::new(NullObserver),
            options,
            intervals,
            max_sessions: config.retention.max_sessions,
        }
    }

    pub fn with_observer(mut self, observer: Box<dyn ScanObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Shared stop flag; setting it interrupts scans between units and
    /// ends the watch loop
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    pub fn store(&self) -> &CanonicalStore {
        &self.store
    }

    // ============================================
    // SCANNING
    // ============================================

    /// Acquire the reentrancy guard for one adapter. A scan already in
    /// progress is a rejected operation, never a queued one.
    fn begin_scan(&self, source: &str) -> Result<ScanToken<'_>> {
        let guard = self
            .guards
            .get(source)
            .ok_or_else(|| anyhow!("unknown source: {source}"))?;
        if guard
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(anyhow!("scan already in progress for {source}"));
        }
        Ok(ScanToken(guard))
    }

    /// Scan one source and apply retention on success
    pub fn scan_source(&self, source: &str) -> Result<ScanSummary> {
        let _token = self.begin_scan(source)?;
        let adapter = self
            .registry
            .get_adapter(source)
            .ok_or_else(|| anyhow!("unknown source: {source}"))?;

        let options = self.options.get(source).cloned().unwrap_or_default();
        let summary = adapter.scan(&self.store, &options, &self.stop, self.observer.as_ref())?;

        tracing::info!(
            target: "chatvault::scan",
            source,
            success = summary.success,
            failed = summary.failed,
            skipped = summary.skipped,
            messages = summary.messages_imported,
            "scan finished"
        );

        self.store.prune_sessions(self.max_sessions)?;
        Ok(summary)
    }

    /// Scan every available source. A fatal error in one adapter (a
    /// missing root, typically) is reported next to the others'
    /// summaries instead of aborting them.
    pub fn scan_all(&self) -> Vec<(String, Result<ScanSummary>)> {
        self.registry
            .available_adapters()
            .iter()
            .map(|adapter| {
                let name = adapter.name().to_string();
                let result = self.scan_source(&name);
                (name, result)
            })
            .collect()
    }

    /// Fixed-interval auto-scan loop. Each source keeps its own timer;
    /// overlapping ticks are suppressed by the scan guard. Blocks until
    /// the stop flag is raised.
    pub fn watch(&self) -> Result<()> {
        if self.intervals.is_empty() {
            return Err(anyhow!("no source has auto_scan_interval_secs configured"));
        }

        let mut next_run: HashMap<String, Instant> = self
            .intervals
            .keys()
            .map(|name| (name.clone(), Instant::now()))
            .collect();

        tracing::info!(target: "chatvault::watch", sources = self.intervals.len(), "watch loop started");

        while !self.stop.load(Ordering::Relaxed) {
            for (name, interval) in &self.intervals {
                let due = next_run.get(name).map(|t| *t <= Instant::now()).unwrap_or(true);
                if !due {
                    continue;
                }
                next_run.insert(name.clone(), Instant::now() + *interval);

                match self.scan_source(name) {
                    Ok(summary) => {
                        tracing::debug!(target: "chatvault::watch", source = %name, imported = summary.messages_imported, "tick complete");
                    }
                    Err(e) => {
                        tracing::warn!(target: "chatvault::watch", source = %name, error = %e, "tick failed");
                    }
                }
            }
            std::thread::sleep(WATCH_TICK);
        }

        tracing::info!(target: "chatvault::watch", "watch loop stopped");
        Ok(())
    }

    // ============================================
    // READS
    // ============================================

    pub fn list_sessions(&self, filter: &QueryFilter) -> Result<Page<SessionHit>> {
        self.store.query_sessions(filter)
    }

    pub fn search_messages(&self, filter: &QueryFilter) -> Result<Page<MessageHit>> {
        self.store.search_messages(filter)
    }

    pub fn get_session(&self, id: &str) -> Result<Option<SessionDetail>> {
        let Some(session) = self.store.get_session(id)? else {
            return Ok(None);
        };
        Ok(Some(SessionDetail {
            tags: self.store.tags_of(id)?,
            messages: self.store.get_messages(id)?,
            session,
        }))
    }

    pub fn delete_session(&self, id: &str) -> Result<bool> {
        self.store.delete_session(id)
    }

    pub fn stats(&self) -> Result<StatsReport> {
        self.store.stats()
    }
}

/// Releases the per-adapter guard when the scan ends, however it ends
struct ScanToken<'a>(&'a AtomicBool);

impl Drop for ScanToken<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::UnitOutcome;
    use std::sync::Mutex;

    fn service_with_uploads(uploads: &std::path::Path, db: &std::path::Path) -> HistoryService {
        let mut config = Config::default();
        config.sources.insert(
            "uploads".to_string(),
            crate::config::SourceConfig {
                enabled: true,
                root_path: Some(uploads.to_string_lossy().to_string()),
                auto_scan_interval_secs: 0,
                skip_indexed: false,
            },
        );
        // Only the uploads source; the other roots don't exist in tests
        config
            .sources
            .insert("editor".to_string(), disabled_source());
        config.sources.insert("tasks".to_string(), disabled_source());

        let store = CanonicalStore::open(&db.join("t.db")).unwrap();
        let registry = AdapterRegistry::new(&config);
        HistoryService::new(store, registry, &config)
    }

    fn disabled_source() -> crate::config::SourceConfig {
        crate::config::SourceConfig {
            enabled: false,
            root_path: None,
            auto_scan_interval_secs: 0,
            skip_indexed: false,
        }
    }

    fn write_export(dir: &std::path::Path, name: &str, title: &str) {
        std::fs::write(
            dir.join(name),
            format!(
                r#"{{"session": {{"title": "{title}"}}, "messages": [{{"role": "user", "content": "body of {title}"}}]}}"#
            ),
        )
        .unwrap();
    }

    #[test]
    fn test_scan_guard_rejects_concurrent_scan() {
        let uploads = tempfile::tempdir().unwrap();
        let db = tempfile::tempdir().unwrap();
        let service = service_with_uploads(uploads.path(), db.path());

        let token = service.begin_scan("uploads").unwrap();
        let err = service.scan_source("uploads").unwrap_err();
        assert!(err.to_string().contains("already in progress"));

        drop(token);
        assert!(service.scan_source("uploads").is_ok());
    }

    #[test]
    fn test_scan_then_query_roundtrip() {
        let uploads = tempfile::tempdir().unwrap();
        let db = tempfile::tempdir().unwrap();
        write_export(uploads.path(), "one.json", "Fix the flaky test");
        let service = service_with_uploads(uploads.path(), db.path());

        let summary = service.scan_source("uploads").unwrap();
        assert_eq!(summary.success, 1);

        let page = service.list_sessions(&QueryFilter::default()).unwrap();
        assert_eq!(page.total, 1);

        let detail = service.get_session("uploads:one").unwrap().unwrap();
        assert_eq!(detail.messages.len(), 1);

        assert!(service.delete_session("uploads:one").unwrap());
        assert!(service.get_session("uploads:one").unwrap().is_none());
        assert_eq!(service.stats().unwrap().total_sessions, 0);
    }

    #[test]
    fn test_retention_applied_after_scan() {
        let uploads = tempfile::tempdir().unwrap();
        let db = tempfile::tempdir().unwrap();
        for i in 0..5 {
            write_export(uploads.path(), &format!("e{i}.json"), &format!("session {i}"));
        }

        let mut service = service_with_uploads(uploads.path(), db.path());
        service.max_sessions = 3;

        service.scan_source("uploads").unwrap();
        let page = service.list_sessions(&QueryFilter::default()).unwrap();
        assert_eq!(page.total, 3);
    }

    #[test]
    fn test_observer_receives_events() {
        struct Recorder(Mutex<Vec<String>>);
        impl ScanObserver for Recorder {
            fn scan_started(&self, source: &str, units: usize) {
                self.0.lock().unwrap().push(format!("start {source} {units}"));
            }
            fn unit_done(&self, _source: &str, unit: &str, outcome: UnitOutcome) {
                self.0
                    .lock()
                    .unwrap()
                    .push(format!("unit {unit} {outcome:?}"));
            }
            fn scan_completed(&self, source: &str, summary: &ScanSummary) {
                self.0
                    .lock()
                    .unwrap()
                    .push(format!("done {source} {}", summary.success));
            }
        }

        let uploads = tempfile::tempdir().unwrap();
        let db = tempfile::tempdir().unwrap();
        write_export(uploads.path(), "one.json", "hello");

        let events = Arc::new(Recorder(Mutex::new(vec![])));
        let service = service_with_uploads(uploads.path(), db.path());
        let observed = Arc::clone(&events);

        struct Forward(Arc<Recorder>);
        impl ScanObserver for Forward {
            fn scan_started(&self, s: &str, u: usize) {
                self.0.scan_started(s, u)
            }
            fn unit_done(&self, s: &str, u: &str, o: UnitOutcome) {
                self.0.unit_done(s, u, o)
            }
            fn scan_completed(&self, s: &str, sum: &ScanSummary) {
                self.0.scan_completed(s, sum)
            }
        }

        let service = service.with_observer(Box::new(Forward(observed)));
        service.scan_source("uploads").unwrap();

        let log = events.0.lock().unwrap();
        assert_eq!(log[0], "start uploads 1");
        assert_eq!(log[1], "unit one Imported");
        assert_eq!(log[2], "done uploads 1");
    }

    #[test]
    fn test_stop_flag_interrupts_between_units() {
        let uploads = tempfile::tempdir().unwrap();
        let db = tempfile::tempdir().unwrap();
        for i in 0..3 {
            write_export(uploads.path(), &format!("e{i}.json"), &format!("s{i}"));
        }

        let service = service_with_uploads(uploads.path(), db.path());
        service.stop_flag().store(true, Ordering::SeqCst);

        let summary = service.scan_source("uploads").unwrap();
        // Stop was raised before the first unit; discovery still ran
        assert_eq!(summary.sessions_found, 3);
        assert_eq!(summary.total_processed(), 0);
    }

    #[test]
    fn test_unknown_source_rejected() {
        let uploads = tempfile::tempdir().unwrap();
        let db = tempfile::tempdir().unwrap();
        let service = service_with_uploads(uploads.path(), db.path());
        assert!(service.scan_source("nope").is_err());
    }
}
