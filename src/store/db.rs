use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{RecordSink, StoreError};
use crate::record::{LogRecord, now_millis};

/// Durable request-log table on an embedded SQLite database. One writer at a
/// time; WAL journaling keeps concurrent readers cheap.
pub struct LogStore {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS requests (
    id TEXT PRIMARY KEY,
    created_at INTEGER NOT NULL,
    upstream TEXT NOT NULL DEFAULT '',
    target_url TEXT NOT NULL DEFAULT '',
    method TEXT NOT NULL DEFAULT '',
    path TEXT NOT NULL DEFAULT '',
    query TEXT NOT NULL DEFAULT '',
    request_headers TEXT NOT NULL DEFAULT '{}',
    request_body TEXT NOT NULL DEFAULT '',
    request_body_ref TEXT,
    request_body_size INTEGER NOT NULL DEFAULT 0,
    status_code INTEGER NOT NULL DEFAULT 0,
    response_headers TEXT NOT NULL DEFAULT '{}',
    streaming INTEGER NOT NULL DEFAULT 0,
    response_body TEXT NOT NULL DEFAULT '',
    response_body_ref TEXT,
    response_body_size INTEGER NOT NULL DEFAULT 0,
    latency_ms INTEGER NOT NULL DEFAULT 0,
    error TEXT NOT NULL DEFAULT '',
    truncated INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_requests_created_at ON requests(created_at DESC);
CREATE INDEX IF NOT EXISTS idx_requests_upstream ON requests(upstream);
CREATE INDEX IF NOT EXISTS idx_requests_status_code ON requests(status_code);
CREATE INDEX IF NOT EXISTS idx_requests_method ON requests(method);
";

/// Conjunctive list predicate. Unset fields do not constrain.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListFilter {
    pub upstream: Option<String>,
    pub method: Option<String>,
    pub status_code: Option<u16>,
    /// Case-sensitive substring match on the path.
    pub path_contains: Option<String>,
    pub from: Option<i64>,
    pub to: Option<i64>,
    pub has_error: Option<bool>,
    pub streaming: Option<bool>,
    #[serde(default)]
    pub offset: u64,
    /// Clamped to [1, 1000]; 0 selects the default of 50.
    #[serde(default)]
    pub limit: u64,
}

impl ListFilter {
    fn effective_limit(&self) -> u64 {
        if self.limit == 0 { 50 } else { self.limit.clamp(1, 1000) }
    }

    fn where_clause(&self) -> (String, Vec<Value>) {
        let mut clauses = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        if let Some(upstream) = &self.upstream {
            clauses.push("upstream = ?");
            values.push(Value::Text(upstream.clone()));
        }
        if let Some(method) = &self.method {
            clauses.push("method = ?");
            values.push(Value::Text(method.clone()));
        }
        if let Some(status) = self.status_code {
            clauses.push("status_code = ?");
            values.push(Value::Integer(status as i64));
        }
        if let Some(fragment) = &self.path_contains {
            clauses.push("path LIKE ?");
            values.push(Value::Text(format!("%{fragment}%")));
        }
        if let Some(from) = self.from {
            clauses.push("created_at >= ?");
            values.push(Value::Integer(from));
        }
        if let Some(to) = self.to {
            clauses.push("created_at <= ?");
            values.push(Value::Integer(to));
        }
        match self.has_error {
            Some(true) => clauses.push("error != ''"),
            Some(false) => clauses.push("error = ''"),
            None => {}
        }
        if let Some(streaming) = self.streaming {
            clauses.push(if streaming { "streaming = 1" } else { "streaming = 0" });
        }
        let sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        (sql, values)
    }
}

/// List projection: everything a log table view needs, no headers, no bodies.
#[derive(Debug, Clone, Serialize)]
pub struct RecordSummary {
    pub id: String,
    pub created_at: i64,
    pub upstream: String,
    pub method: String,
    pub path: String,
    pub status_code: u16,
    pub streaming: bool,
    pub request_body_size: u64,
    pub response_body_size: u64,
    pub latency_ms: u64,
    pub error: String,
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LogStats {
    pub total: u64,
    /// 2xx and 3xx responses.
    pub success: u64,
    /// Rows with a recorded error or a status of 400 and up.
    pub errors: u64,
    pub streaming: u64,
    pub avg_latency_ms: f64,
    pub by_upstream: HashMap<String, u64>,
    pub by_status: HashMap<u16, u64>,
}

fn headers_to_json(headers: &HashMap<String, String>) -> String {
    serde_json::to_string(headers).unwrap_or_else(|_| "{}".to_string())
}

fn headers_from_json(text: &str) -> HashMap<String, String> {
    serde_json::from_str(text).unwrap_or_default()
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<LogRecord> {
    Ok(LogRecord {
        id: row.get("id")?,
        created_at: row.get("created_at")?,
        upstream: row.get("upstream")?,
        target_url: row.get("target_url")?,
        method: row.get("method")?,
        path: row.get("path")?,
        query: row.get("query")?,
        request_headers: headers_from_json(&row.get::<_, String>("request_headers")?),
        request_body: row.get("request_body")?,
        request_body_ref: row.get("request_body_ref")?,
        request_body_size: row.get::<_, i64>("request_body_size")? as u64,
        status_code: row.get::<_, i64>("status_code")? as u16,
        response_headers: headers_from_json(&row.get::<_, String>("response_headers")?),
        streaming: row.get::<_, i64>("streaming")? != 0,
        response_body: row.get("response_body")?,
        response_body_ref: row.get("response_body_ref")?,
        response_body_size: row.get::<_, i64>("response_body_size")? as u64,
        latency_ms: row.get::<_, i64>("latency_ms")? as u64,
        error: row.get("error")?,
        truncated: row.get::<_, i64>("truncated")? != 0,
        tag: row.get("tag")?,
    })
}

impl LogStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        // SQLite LIKE is ASCII case-insensitive by default; the path filter
        // is a case-sensitive substring match.
        conn.pragma_update(None, "case_sensitive_like", true)?;
        conn.busy_timeout(Duration::from_millis(5000))?;
        conn.execute_batch(SCHEMA)?;
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Backward-compatible column additions: probe the live column list and
    /// add what is missing.
    fn migrate(conn: &Connection) -> Result<(), StoreError> {
        let mut stmt = conn.prepare("PRAGMA table_info(requests)")?;
        let columns: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<rusqlite::Result<_>>()?;
        if !columns.iter().any(|c| c == "tag") {
            conn.execute("ALTER TABLE requests ADD COLUMN tag TEXT", [])?;
        }
        Ok(())
    }

    pub fn save_record(&self, record: &LogRecord) -> Result<(), StoreError> {
        let created_at = if record.created_at == 0 { now_millis() } else { record.created_at };
        let conn = self.conn.lock().expect("db lock poisoned");
        conn.execute(
            "INSERT OR REPLACE INTO requests (
                id, created_at, upstream, target_url, method, path, query,
                request_headers, request_body, request_body_ref, request_body_size,
                status_code, response_headers, streaming, response_body,
                response_body_ref, response_body_size, latency_ms, error, truncated, tag
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)",
            params![
                record.id,
                created_at,
                record.upstream,
                record.target_url,
                record.method,
                record.path,
                record.query,
                headers_to_json(&record.request_headers),
                record.request_body,
                record.request_body_ref,
                record.request_body_size as i64,
                record.status_code as i64,
                headers_to_json(&record.response_headers),
                record.streaming as i64,
                record.response_body,
                record.response_body_ref,
                record.response_body_size as i64,
                record.latency_ms as i64,
                record.error,
                record.truncated as i64,
                record.tag,
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<LogRecord>, StoreError> {
        let conn = self.conn.lock().expect("db lock poisoned");
        let record = conn
            .query_row("SELECT * FROM requests WHERE id = ?1", params![id], |row| {
                record_from_row(row)
            })
            .optional()?;
        Ok(record)
    }

    /// Filtered page of summaries plus the total row count under the same
    /// predicate.
    pub fn list(&self, filter: &ListFilter) -> Result<(Vec<RecordSummary>, u64), StoreError> {
        let (where_sql, values) = filter.where_clause();
        let conn = self.conn.lock().expect("db lock poisoned");

        let total: u64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM requests{where_sql}"),
            params_from_iter(values.iter()),
            |row| row.get::<_, i64>(0).map(|n| n as u64),
        )?;

        let sql = format!(
            "SELECT id, created_at, upstream, method, path, status_code, streaming,
                    request_body_size, response_body_size, latency_ms, error, truncated, tag
             FROM requests{where_sql}
             ORDER BY created_at DESC
             LIMIT ? OFFSET ?"
        );
        let mut all = values;
        all.push(Value::Integer(filter.effective_limit() as i64));
        all.push(Value::Integer(filter.offset as i64));

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(all.iter()), |row| {
            Ok(RecordSummary {
                id: row.get(0)?,
                created_at: row.get(1)?,
                upstream: row.get(2)?,
                method: row.get(3)?,
                path: row.get(4)?,
                status_code: row.get::<_, i64>(5)? as u16,
                streaming: row.get::<_, i64>(6)? != 0,
                request_body_size: row.get::<_, i64>(7)? as u64,
                response_body_size: row.get::<_, i64>(8)? as u64,
                latency_ms: row.get::<_, i64>(9)? as u64,
                error: row.get(10)?,
                truncated: row.get::<_, i64>(11)? != 0,
                tag: row.get(12)?,
            })
        })?;
        let summaries = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok((summaries, total))
    }

    pub fn delete_before(&self, cutoff_ms: i64) -> Result<usize, StoreError> {
        let conn = self.conn.lock().expect("db lock poisoned");
        let n = conn.execute("DELETE FROM requests WHERE created_at < ?1", params![cutoff_ms])?;
        Ok(n)
    }

    pub fn stats(&self, since_ms: Option<i64>) -> Result<LogStats, StoreError> {
        let since = since_ms.unwrap_or(0);
        let conn = self.conn.lock().expect("db lock poisoned");

        let mut stats = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(status_code BETWEEN 200 AND 399), 0),
                    COALESCE(SUM(error != '' OR status_code >= 400), 0),
                    COALESCE(SUM(streaming), 0),
                    COALESCE(AVG(latency_ms), 0.0)
             FROM requests WHERE created_at >= ?1",
            params![since],
            |row| {
                Ok(LogStats {
                    total: row.get::<_, i64>(0)? as u64,
                    success: row.get::<_, i64>(1)? as u64,
                    errors: row.get::<_, i64>(2)? as u64,
                    streaming: row.get::<_, i64>(3)? as u64,
                    avg_latency_ms: row.get(4)?,
                    ..Default::default()
                })
            },
        )?;

        {
            let mut stmt = conn.prepare(
                "SELECT upstream, COUNT(*) FROM requests WHERE created_at >= ?1 GROUP BY upstream",
            )?;
            let rows = stmt.query_map(params![since], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?;
            for row in rows {
                let (upstream, count) = row?;
                stats.by_upstream.insert(upstream, count);
            }
        }

        {
            let mut stmt = conn.prepare(
                "SELECT status_code, COUNT(*) FROM requests WHERE created_at >= ?1 GROUP BY status_code",
            )?;
            let rows = stmt.query_map(params![since], |row| {
                Ok((row.get::<_, i64>(0)? as u16, row.get::<_, i64>(1)? as u64))
            })?;
            for row in rows {
                let (status, count) = row?;
                stats.by_status.insert(status, count);
            }
        }

        Ok(stats)
    }

    /// Distinct non-empty blob refs across both body-ref columns. Feeds GC.
    pub fn list_blob_refs(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock().expect("db lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT DISTINCT request_body_ref FROM requests
             WHERE request_body_ref IS NOT NULL AND request_body_ref != ''
             UNION
             SELECT DISTINCT response_body_ref FROM requests
             WHERE response_body_ref IS NOT NULL AND response_body_ref != ''",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

impl RecordSink for LogStore {
    fn save(&self, record: &LogRecord) -> Result<(), StoreError> {
        self.save_record(record)
    }

    fn close(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("db lock poisoned");
        let checkpoint: rusqlite::Result<i64> =
            conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| row.get(0));
        if let Err(err) = checkpoint {
            warn!("wal checkpoint on close failed: {err}");
        }
        Ok(())
    }
}
