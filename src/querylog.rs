//! Query log and admin settings database
//!
//! Every accepted search is recorded in a local SQLite database, purely for
//! observation: the search pipeline never reads it back. The same database
//! carries typed admin settings with seeded defaults.

use crate::types::{Error, Result};
use rusqlite::{Connection, params};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

/// One accepted search, as written to `query_logs`.
#[derive(Debug, Clone, Default)]
pub struct QueryLogEntry {
    pub user_id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub chat_id: i64,
    pub chat_type: String,
    pub query: String,
    pub search_type: Option<String>,
    pub search_user: Option<String>,
    pub search_mode: Option<String>,
    pub results_count: i64,
    pub page_number: u32,
    pub processing_time_ms: u64,
}

/// Typed admin setting value.
#[derive(Debug, Clone, PartialEq)]
pub enum SettingValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Json(serde_json::Value),
    Str(String),
}

impl SettingValue {
    fn type_tag(&self) -> &'static str {
        match self {
            SettingValue::Bool(_) => "bool",
            SettingValue::Int(_) => "int",
            SettingValue::Float(_) => "float",
            SettingValue::Json(_) => "json",
            SettingValue::Str(_) => "str",
        }
    }

    fn encode(&self) -> String {
        match self {
            SettingValue::Bool(b) => b.to_string(),
            SettingValue::Int(i) => i.to_string(),
            SettingValue::Float(f) => f.to_string(),
            SettingValue::Json(v) => v.to_string(),
            SettingValue::Str(s) => s.clone(),
        }
    }

    fn decode(raw: &str, type_tag: &str) -> Result<SettingValue> {
        let value = match type_tag {
            "bool" => SettingValue::Bool(matches!(raw, "true" | "1" | "yes" | "on")),
            "int" => SettingValue::Int(
                raw.parse()
                    .map_err(|_| Error::Config(format!("bad int setting: {}", raw)))?,
            ),
            "float" => SettingValue::Float(
                raw.parse()
                    .map_err(|_| Error::Config(format!("bad float setting: {}", raw)))?,
            ),
            "json" => SettingValue::Json(serde_json::from_str(raw)?),
            _ => SettingValue::Str(raw.to_string()),
        };
        Ok(value)
    }
}

/// SQLite-backed query log + admin settings store.
pub struct QueryLogDb {
    conn: Mutex<Connection>,
}

impl QueryLogDb {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_tables()?;
        info!(?path, "query log database opened");
        Ok(db)
    }

    fn init_tables(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS query_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp REAL NOT NULL,
                user_id INTEGER NOT NULL,
                username TEXT,
                first_name TEXT,
                chat_id INTEGER NOT NULL,
                chat_type TEXT NOT NULL,
                query TEXT NOT NULL,
                search_type TEXT,
                search_user TEXT,
                search_mode TEXT,
                results_count INTEGER,
                page_number INTEGER DEFAULT 1,
                processing_time_ms INTEGER,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP
            );
            CREATE INDEX IF NOT EXISTS idx_query_logs_timestamp
                ON query_logs(timestamp DESC);
            CREATE INDEX IF NOT EXISTS idx_query_logs_user_id
                ON query_logs(user_id);
            CREATE INDEX IF NOT EXISTS idx_query_logs_chat_id
                ON query_logs(chat_id);
            CREATE TABLE IF NOT EXISTS admin_settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                value_type TEXT NOT NULL,
                description TEXT,
                updated_at REAL NOT NULL,
                updated_by INTEGER NOT NULL
            );",
        )?;

        let now = chrono::Utc::now().timestamp() as f64;
        let defaults: [(&str, SettingValue, &str); 4] = [
            (
                "enable_query_logging",
                SettingValue::Bool(true),
                "Enable query logging",
            ),
            (
                "log_retention_days",
                SettingValue::Int(30),
                "Days to keep query logs",
            ),
            (
                "max_log_entries",
                SettingValue::Int(100_000),
                "Maximum log entries to keep",
            ),
            (
                "auto_cleanup_enabled",
                SettingValue::Bool(true),
                "Enable automatic log cleanup",
            ),
        ];
        for (key, value, description) in defaults {
            conn.execute(
                "INSERT OR IGNORE INTO admin_settings
                 (key, value, value_type, description, updated_at, updated_by)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0)",
                params![key, value.encode(), value.type_tag(), description, now],
            )?;
        }
        Ok(())
    }

    /// Record one accepted search. Returns the row id, or -1 when logging is
    /// disabled via settings.
    pub fn log_query(&self, entry: &QueryLogEntry) -> Result<i64> {
        if !self.get_bool("enable_query_logging", true) {
            return Ok(-1);
        }

        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let timestamp = chrono::Utc::now().timestamp() as f64;
        conn.execute(
            "INSERT INTO query_logs (
                timestamp, user_id, username, first_name, chat_id, chat_type,
                query, search_type, search_user, search_mode,
                results_count, page_number, processing_time_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                timestamp,
                entry.user_id,
                entry.username,
                entry.first_name,
                entry.chat_id,
                entry.chat_type,
                entry.query,
                entry.search_type,
                entry.search_user,
                entry.search_mode,
                entry.results_count,
                entry.page_number,
                entry.processing_time_ms as i64,
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!(id, user_id = entry.user_id, query = %entry.query, "query logged");
        Ok(id)
    }

    /// Most recent log rows, optionally filtered by user.
    pub fn recent_queries(&self, limit: usize, user_id: Option<i64>) -> Result<Vec<QueryLogEntry>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut rows = Vec::new();

        let mut collect = |stmt: &mut rusqlite::Statement<'_>,
                           params: &[&dyn rusqlite::ToSql]|
         -> Result<()> {
            let mapped = stmt.query_map(params, |row| {
                Ok(QueryLogEntry {
                    user_id: row.get("user_id")?,
                    username: row.get("username")?,
                    first_name: row.get("first_name")?,
                    chat_id: row.get("chat_id")?,
                    chat_type: row.get("chat_type")?,
                    query: row.get("query")?,
                    search_type: row.get("search_type")?,
                    search_user: row.get("search_user")?,
                    search_mode: row.get("search_mode")?,
                    results_count: row.get("results_count")?,
                    page_number: row.get::<_, i64>("page_number")? as u32,
                    processing_time_ms: row.get::<_, i64>("processing_time_ms")? as u64,
                })
            })?;
            for entry in mapped {
                rows.push(entry?);
            }
            Ok(())
        };

        match user_id {
            Some(uid) => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM query_logs WHERE user_id = ?1
                     ORDER BY timestamp DESC LIMIT ?2",
                )?;
                collect(&mut stmt, &[&uid, &(limit as i64)])?;
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM query_logs ORDER BY timestamp DESC LIMIT ?1",
                )?;
                collect(&mut stmt, &[&(limit as i64)])?;
            }
        }
        Ok(rows)
    }

    /// Delete rows older than the configured retention window. Returns the
    /// deleted count.
    pub fn cleanup_old_logs(&self) -> Result<usize> {
        let retention_days = match self.get_setting("log_retention_days")? {
            Some(SettingValue::Int(days)) => days,
            _ => 30,
        };
        let cutoff = chrono::Utc::now().timestamp() as f64 - (retention_days as f64) * 86_400.0;

        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let deleted = conn.execute("DELETE FROM query_logs WHERE timestamp < ?1", params![cutoff])?;
        if deleted > 0 {
            info!(deleted, retention_days, "cleaned up old query logs");
        }
        Ok(deleted)
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<SettingValue>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt =
            conn.prepare("SELECT value, value_type FROM admin_settings WHERE key = ?1")?;
        let mut rows = stmt.query(params![key])?;
        match rows.next()? {
            Some(row) => {
                let raw: String = row.get(0)?;
                let type_tag: String = row.get(1)?;
                Ok(Some(SettingValue::decode(&raw, &type_tag)?))
            }
            None => Ok(None),
        }
    }

    pub fn set_setting(
        &self,
        key: &str,
        value: SettingValue,
        description: Option<&str>,
        updated_by: i64,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let now = chrono::Utc::now().timestamp() as f64;
        conn.execute(
            "INSERT INTO admin_settings (key, value, value_type, description, updated_at, updated_by)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                value_type = excluded.value_type,
                description = COALESCE(excluded.description, admin_settings.description),
                updated_at = excluded.updated_at,
                updated_by = excluded.updated_by",
            params![
                key,
                value.encode(),
                value.type_tag(),
                description,
                now,
                updated_by
            ],
        )?;
        Ok(())
    }

    fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get_setting(key) {
            Ok(Some(SettingValue::Bool(b))) => b,
            _ => default,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(user_id: i64, query: &str) -> QueryLogEntry {
        QueryLogEntry {
            user_id,
            username: Some("alice".into()),
            first_name: Some("Alice".into()),
            chat_id: -1001,
            chat_type: "SUPERGROUP".into(),
            query: query.into(),
            search_type: Some("GROUP".into()),
            search_user: None,
            search_mode: None,
            results_count: 5,
            page_number: 1,
            processing_time_ms: 42,
        }
    }

    #[test]
    fn test_log_and_read_back() {
        let dir = TempDir::new().unwrap();
        let db = QueryLogDb::open(&dir.path().join("logs.db")).unwrap();

        let id = db.log_query(&entry(7, "alpha")).unwrap();
        assert!(id > 0);
        db.log_query(&entry(8, "bravo")).unwrap();

        let all = db.recent_queries(10, None).unwrap();
        assert_eq!(all.len(), 2);

        let for_seven = db.recent_queries(10, Some(7)).unwrap();
        assert_eq!(for_seven.len(), 1);
        assert_eq!(for_seven[0].query, "alpha");
        assert_eq!(for_seven[0].processing_time_ms, 42);
    }

    #[test]
    fn test_default_settings_seeded() {
        let dir = TempDir::new().unwrap();
        let db = QueryLogDb::open(&dir.path().join("logs.db")).unwrap();

        assert_eq!(
            db.get_setting("enable_query_logging").unwrap(),
            Some(SettingValue::Bool(true))
        );
        assert_eq!(
            db.get_setting("log_retention_days").unwrap(),
            Some(SettingValue::Int(30))
        );
        assert!(db.get_setting("nonexistent").unwrap().is_none());
    }

    #[test]
    fn test_disabling_logging_skips_rows() {
        let dir = TempDir::new().unwrap();
        let db = QueryLogDb::open(&dir.path().join("logs.db")).unwrap();

        db.set_setting("enable_query_logging", SettingValue::Bool(false), None, 100)
            .unwrap();
        assert_eq!(db.log_query(&entry(7, "alpha")).unwrap(), -1);
        assert!(db.recent_queries(10, None).unwrap().is_empty());
    }

    #[test]
    fn test_setting_types_round_trip() {
        let dir = TempDir::new().unwrap();
        let db = QueryLogDb::open(&dir.path().join("logs.db")).unwrap();

        db.set_setting("ratio", SettingValue::Float(0.5), Some("a ratio"), 100)
            .unwrap();
        assert_eq!(
            db.get_setting("ratio").unwrap(),
            Some(SettingValue::Float(0.5))
        );

        let json = serde_json::json!({"a": [1, 2]});
        db.set_setting("shape", SettingValue::Json(json.clone()), None, 100)
            .unwrap();
        assert_eq!(
            db.get_setting("shape").unwrap(),
            Some(SettingValue::Json(json))
        );

        db.set_setting("label", SettingValue::Str("hi".into()), None, 100)
            .unwrap();
        assert_eq!(
            db.get_setting("label").unwrap(),
            Some(SettingValue::Str("hi".into()))
        );
    }

    #[test]
    fn test_cleanup_honors_retention() {
        let dir = TempDir::new().unwrap();
        let db = QueryLogDb::open(&dir.path().join("logs.db")).unwrap();

        db.log_query(&entry(7, "old")).unwrap();
        // Backdate the row beyond the retention window.
        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "UPDATE query_logs SET timestamp = timestamp - 90 * 86400",
                [],
            )
            .unwrap();
        }
        db.log_query(&entry(7, "fresh")).unwrap();

        let deleted = db.cleanup_old_logs().unwrap();
        assert_eq!(deleted, 1);
        let remaining = db.recent_queries(10, None).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].query, "fresh");
    }
}
