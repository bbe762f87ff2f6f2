//! Query and filter engine
//!
//! Composes the optional filters into conjunctive SQL predicates and
//! answers list/search/stats requests. Two deliberate relevance models:
//! keyword queries rank by per-session match count from the search
//! index, keyword-less listings order by most-recently-updated. Totals
//! come from a separate COUNT under the identical predicate set, never
//! from over-fetching.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use serde::Serialize;
use std::time::Instant;

use super::{map_session_row, CanonicalStore, SessionRow};
use crate::adapter::Role;

/// Sentinel for the elapsed-time diagnostic when a query soft-fails
pub const ELAPSED_FAILED: f64 = f64::INFINITY;

/// Trailing window for the per-day session counts
pub const STATS_WINDOW_DAYS: i64 = 7;

const TOP_TAG_LIMIT: usize = 10;

/// Optional filters; absent fields impose no constraint, present ones
/// are ANDed together
#[derive(Debug, Clone)]
pub struct QueryFilter {
    pub keyword: Option<String>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    pub sources: Vec<String>,
    pub tags: Vec<String>,
    pub roles: Vec<Role>,
    pub min_messages: Option<i64>,
    pub page: usize,
    pub page_size: usize,
}

impl Default for QueryFilter {
    fn default() -> Self {
        Self {
            keyword: None,
            date_from: None,
            date_to: None,
            sources: vec![],
            tags: vec![],
            roles: vec![],
            min_messages: None,
            page: 1,
            page_size: 20,
        }
    }
}

impl QueryFilter {
    fn offset(&self) -> usize {
        self.page.saturating_sub(1) * self.page_size
    }
}

/// One page of results
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: usize,
    pub page_size: usize,
    pub has_more: bool,
    /// Query time in milliseconds; infinity marks a soft failure
    pub elapsed_ms: f64,
}

impl<T> Page<T> {
    fn new(items: Vec<T>, total: u64, filter: &QueryFilter, started: Instant) -> Self {
        Self {
            items,
            total,
            page: filter.page.max(1),
            page_size: filter.page_size,
            has_more: has_more(filter.offset(), filter.page_size, total),
            elapsed_ms: started.elapsed().as_secs_f64() * 1000.0,
        }
    }

    fn soft_failure(filter: &QueryFilter) -> Self {
        Self {
            items: vec![],
            total: 0,
            page: filter.page.max(1),
            page_size: filter.page_size,
            has_more: false,
            elapsed_ms: ELAPSED_FAILED,
        }
    }
}

/// Exact page-end arithmetic; never computed by fetching an extra row
pub fn has_more(offset: usize, page_size: usize, total: u64) -> bool {
    ((offset + page_size) as u64) < total
}

/// A session list entry with its tag set and, for keyword queries, the
/// per-session match count
#[derive(Debug, Clone, Serialize)]
pub struct SessionHit {
    #[serde(flatten)]
    pub session: SessionRow,
    pub tags: Vec<String>,
    pub matches: Option<i64>,
}

/// A message-level search hit joined back to its session
#[derive(Debug, Clone, Serialize)]
pub struct MessageHit {
    pub session_id: String,
    pub session_title: Option<String>,
    pub message_id: i64,
    pub role: String,
    pub content: String,
    pub timestamp: Option<String>,
}

/// Aggregate statistics, computed from the structured tables only
#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    pub total_sessions: u64,
    pub total_messages: u64,
    pub sessions_by_source: Vec<SourceCount>,
    pub top_tags: Vec<TagCount>,
    pub sessions_per_day: Vec<DayCount>,
    pub window_days: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceCount {
    pub source: String,
    pub sessions: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TagCount {
    pub name: String,
    pub sessions: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DayCount {
    pub date: String,
    pub sessions: u64,
}

/// Conjunctive predicate assembly shared by every query path
struct Predicates {
    clauses: Vec<String>,
    params: Vec<Value>,
}

impl Predicates {
    fn build(filter: &QueryFilter, message_level_roles: bool) -> Self {
        let mut clauses = vec![];
        let mut params: Vec<Value> = vec![];

        if let Some(from) = filter.date_from {
            clauses.push("s.updated_at >= ?".to_string());
            params.push(Value::Text(from.to_rfc3339()));
        }
        if let Some(to) = filter.date_to {
            clauses.push("s.updated_at <= ?".to_string());
            params.push(Value::Text(to.to_rfc3339()));
        }
        if !filter.sources.is_empty() {
            clauses.push(format!("s.source IN ({})", placeholders(filter.sources.len())));
            params.extend(filter.sources.iter().map(|s| Value::Text(s.clone())));
        }
        if let Some(min) = filter.min_messages {
            clauses.push("s.message_count >= ?".to_string());
            params.push(Value::Integer(min));
        }
        if !filter.tags.is_empty() {
            // Intersection: the session must carry every listed tag
            clauses.push(format!(
                "s.id IN (SELECT st.session_id FROM session_tags st
                          JOIN tags t ON t.id = st.tag_id
                          WHERE t.name IN ({})
                          GROUP BY st.session_id
                          HAVING COUNT(DISTINCT t.name) = ?)",
                placeholders(filter.tags.len())
            ));
            params.extend(
                filter
                    .tags
                    .iter()
                    .map(|t| Value::Text(t.trim().to_lowercase())),
            );
            params.push(Value::Integer(filter.tags.len() as i64));
        }
        if !filter.roles.is_empty() {
            let ph = placeholders(filter.roles.len());
            if message_level_roles {
                clauses.push(format!("m.role IN ({ph})"));
            } else {
                clauses.push(format!(
                    "s.id IN (SELECT session_id FROM messages WHERE role IN ({ph}))"
                ));
            }
            params.extend(
                filter
                    .roles
                    .iter()
                    .map(|r| Value::Text(r.as_str().to_string())),
            );
        }

        Self { clauses, params }
    }

    fn where_sql(&self, extra: Option<&str>) -> String {
        let mut clauses: Vec<&str> = self.clauses.iter().map(String::as_str).collect();
        if let Some(extra) = extra {
            clauses.insert(0, extra);
        }
        if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        }
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

impl CanonicalStore {
    /// List or keyword-search sessions, paginated
    pub fn query_sessions(&self, filter: &QueryFilter) -> Result<Page<SessionHit>> {
        let started = Instant::now();
        let conn = self.lock()?;

        let result = match filter.keyword.as_deref().map(str::trim) {
            Some(keyword) if !keyword.is_empty() => {
                keyword_session_query(&conn, filter, keyword, started)
            }
            _ => recency_session_query(&conn, filter, started),
        };

        match result {
            Ok(page) => Ok(page),
            Err(e) if is_fts_error(&e) => {
                tracing::warn!(target: "chatvault::query", error = %e, "unparseable search expression, returning empty page");
                Ok(Page::soft_failure(filter))
            }
            Err(e) => Err(e),
        }
    }

    /// Keyword search over individual messages, paginated. An empty
    /// keyword is a well-formed empty result, not an error.
    pub fn search_messages(&self, filter: &QueryFilter) -> Result<Page<MessageHit>> {
        let started = Instant::now();
        let keyword = match filter.keyword.as_deref().map(str::trim) {
            Some(k) if !k.is_empty() => k.to_string(),
            _ => return Ok(Page::new(vec![], 0, filter, started)),
        };
        let conn = self.lock()?;

        match message_hit_query(&conn, filter, &keyword, started) {
            Ok(page) => Ok(page),
            Err(e) if is_fts_error(&e) => {
                tracing::warn!(target: "chatvault::query", error = %e, "unparseable search expression, returning empty page");
                Ok(Page::soft_failure(filter))
            }
            Err(e) => Err(e),
        }
    }

    /// Aggregate statistics over the structured tables
    pub fn stats(&self) -> Result<StatsReport> {
        let conn = self.lock()?;

        let total_sessions: u64 =
            conn.query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))?;
        let total_messages: u64 =
            conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;

        let sessions_by_source = {
            let mut stmt = conn.prepare(
                "SELECT source, COUNT(*) FROM sessions GROUP BY source ORDER BY COUNT(*) DESC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(SourceCount {
                    source: row.get(0)?,
                    sessions: row.get(1)?,
                })
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let top_tags = {
            let mut stmt = conn.prepare(
                "SELECT t.name, COUNT(st.session_id) AS c
                 FROM tags t
                 JOIN session_tags st ON st.tag_id = t.id
                 GROUP BY t.id
                 ORDER BY c DESC, t.name
                 LIMIT ?",
            )?;
            let rows = stmt.query_map([TOP_TAG_LIMIT as i64], |row| {
                Ok(TagCount {
                    name: row.get(0)?,
                    sessions: row.get(1)?,
                })
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let sessions_per_day = per_day_counts(&conn)?;

        Ok(StatsReport {
            total_sessions,
            total_messages,
            sessions_by_source,
            top_tags,
            sessions_per_day,
            window_days: STATS_WINDOW_DAYS,
        })
    }
}

fn recency_session_query(
    conn: &Connection,
    filter: &QueryFilter,
    started: Instant,
) -> Result<Page<SessionHit>> {
    let preds = Predicates::build(filter, false);
    let where_sql = preds.where_sql(None);

    let total: u64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM sessions s{where_sql}"),
        params_from_iter(preds.params.iter()),
        |row| row.get(0),
    )?;

    let sql = format!(
        "SELECT s.id, s.source, s.title, s.project, s.description, s.environment,
                s.message_count, s.created_at, s.updated_at, s.source_path
         FROM sessions s{where_sql}
         ORDER BY s.updated_at DESC, s.id
         LIMIT ? OFFSET ?"
    );
    let mut params = preds.params.clone();
    params.push(Value::Integer(filter.page_size as i64));
    params.push(Value::Integer(filter.offset() as i64));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(params.iter()), map_session_row)?;
    let sessions = rows.collect::<Result<Vec<_>, _>>()?;

    let items = attach_tags(conn, sessions, None)?;
    Ok(Page::new(items, total, filter, started))
}

fn keyword_session_query(
    conn: &Connection,
    filter: &QueryFilter,
    keyword: &str,
    started: Instant,
) -> Result<Page<SessionHit>> {
    let preds = Predicates::build(filter, false);
    let where_sql = preds.where_sql(None);

    const MATCH_JOIN: &str = "JOIN (SELECT session_id, COUNT(*) AS match_count
               FROM search_index
               WHERE search_index MATCH ?
               GROUP BY session_id) f ON f.session_id = s.id";

    let mut count_params = vec![Value::Text(keyword.to_string())];
    count_params.extend(preds.params.iter().cloned());
    let total: u64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM sessions s {MATCH_JOIN}{where_sql}"),
        params_from_iter(count_params.iter()),
        |row| row.get(0),
    )?;

    let sql = format!(
        "SELECT s.id, s.source, s.title, s.project, s.description, s.environment,
                s.message_count, s.created_at, s.updated_at, s.source_path, f.match_count
         FROM sessions s {MATCH_JOIN}{where_sql}
         ORDER BY f.match_count DESC, s.updated_at DESC, s.id
         LIMIT ? OFFSET ?"
    );
    let mut params = count_params;
    params.push(Value::Integer(filter.page_size as i64));
    params.push(Value::Integer(filter.offset() as i64));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(params.iter()), |row| {
        let session = map_session_row(row)?;
        let matches: i64 = row.get(10)?;
        Ok((session, matches))
    })?;
    let sessions = rows.collect::<Result<Vec<_>, _>>()?;

    let matches: Vec<i64> = sessions.iter().map(|(_, m)| *m).collect();
    let items = attach_tags(
        conn,
        sessions.into_iter().map(|(s, _)| s).collect(),
        Some(matches),
    )?;
    Ok(Page::new(items, total, filter, started))
}

fn message_hit_query(
    conn: &Connection,
    filter: &QueryFilter,
    keyword: &str,
    started: Instant,
) -> Result<Page<MessageHit>> {
    let preds = Predicates::build(filter, true);
    let where_sql = preds.where_sql(Some("search_index MATCH ?"));

    const FROM: &str = "FROM search_index
         JOIN messages m ON m.id = search_index.message_id
         JOIN sessions s ON s.id = m.session_id
         JOIN (SELECT session_id, COUNT(*) AS match_count
               FROM search_index
               WHERE search_index MATCH ?
               GROUP BY session_id) f ON f.session_id = s.id";

    // MATCH appears twice: once for the per-session ranking counts,
    // once as the row predicate
    let mut count_params = vec![
        Value::Text(keyword.to_string()),
        Value::Text(keyword.to_string()),
    ];
    count_params.extend(preds.params.iter().cloned());

    let total: u64 = conn.query_row(
        &format!("SELECT COUNT(*) {FROM}{where_sql}"),
        params_from_iter(count_params.iter()),
        |row| row.get(0),
    )?;

    let sql = format!(
        "SELECT m.session_id, s.title, m.id, m.role, m.content, m.timestamp
         {FROM}{where_sql}
         ORDER BY f.match_count DESC, s.updated_at DESC, m.timestamp, m.seq
         LIMIT ? OFFSET ?"
    );
    let mut params = count_params;
    params.push(Value::Integer(filter.page_size as i64));
    params.push(Value::Integer(filter.offset() as i64));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(params.iter()), |row| {
        Ok(MessageHit {
            session_id: row.get(0)?,
            session_title: row.get(1)?,
            message_id: row.get(2)?,
            role: row.get(3)?,
            content: row.get(4)?,
            timestamp: row.get(5)?,
        })
    })?;
    let items = rows.collect::<Result<Vec<_>, _>>()?;

    Ok(Page::new(items, total, filter, started))
}

fn attach_tags(
    conn: &Connection,
    sessions: Vec<SessionRow>,
    matches: Option<Vec<i64>>,
) -> Result<Vec<SessionHit>> {
    let mut stmt = conn.prepare(
        "SELECT t.name FROM tags t
         JOIN session_tags st ON st.tag_id = t.id
         WHERE st.session_id = ?
         ORDER BY t.name",
    )?;

    sessions
        .into_iter()
        .enumerate()
        .map(|(i, session)| {
            let tags = stmt
                .query_map([&session.id], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(SessionHit {
                session,
                tags,
                matches: matches.as_ref().map(|m| m[i]),
            })
        })
        .collect()
}

/// Per-day session counts over the trailing window, zero-filled so
/// every day appears
fn per_day_counts(conn: &Connection) -> Result<Vec<DayCount>> {
    let window_start = (Utc::now() - Duration::days(STATS_WINDOW_DAYS - 1))
        .date_naive()
        .to_string();

    let mut stmt = conn.prepare(
        "SELECT date(updated_at), COUNT(*)
         FROM sessions
         WHERE date(updated_at) >= ?
         GROUP BY date(updated_at)",
    )?;
    let counted: std::collections::HashMap<String, u64> = stmt
        .query_map([&window_start], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
        })?
        .collect::<Result<_, _>>()?;

    let today = Utc::now().date_naive();
    let mut days = vec![];
    for offset in (0..STATS_WINDOW_DAYS).rev() {
        let date = (today - Duration::days(offset)).to_string();
        let sessions = counted.get(&date).copied().unwrap_or(0);
        days.push(DayCount { date, sessions });
    }
    Ok(days)
}

/// FTS5 surface errors as generic SQLite failures; treat anything
/// raised by a MATCH statement's parse as a malformed keyword
fn is_fts_error(e: &anyhow::Error) -> bool {
    match e.downcast_ref::<rusqlite::Error>() {
        Some(rusqlite::Error::SqliteFailure(_, Some(msg))) => {
            msg.contains("fts5") || msg.contains("syntax error") || msg.contains("unknown special query")
        }
        _ => false,
    }
}
