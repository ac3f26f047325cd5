use anyhow::Result;
use chrono::Utc;
use opspilot_core::{HistoryEntry, runtime_dir};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const MIGRATIONS: &[(i64, &str)] = &[
    (
        1,
        "CREATE TABLE IF NOT EXISTS sessions (
            session_id TEXT PRIMARY KEY,
            prompt TEXT NOT NULL,
            answer TEXT,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS turns (
            id INTEGER PRIMARY KEY,
            session_id TEXT NOT NULL,
            seq INTEGER NOT NULL,
            tool_name TEXT NOT NULL,
            entry_json TEXT NOT NULL,
            recorded_at TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_turns_session_seq ON turns(session_id, seq);",
    ),
    (
        2,
        "CREATE TABLE IF NOT EXISTS anps_submissions (
            id INTEGER PRIMARY KEY,
            session_id TEXT NOT NULL,
            operation_id TEXT NOT NULL,
            score INTEGER NOT NULL,
            error_flag INTEGER NOT NULL,
            payload_json TEXT NOT NULL,
            ok INTEGER NOT NULL,
            submitted_at TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_anps_session ON anps_submissions(session_id);",
    ),
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: Uuid,
    pub prompt: String,
    pub answer: Option<String>,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnpsSubmissionRecord {
    pub session_id: Uuid,
    pub operation_id: String,
    pub score: i64,
    pub error_flag: bool,
    pub payload_json: String,
    pub ok: bool,
    pub submitted_at: String,
}

pub struct Store {
    db_path: PathBuf,
}

impl Store {
    pub fn new(workspace: &Path) -> Result<Self> {
        let dir = runtime_dir(workspace);
        fs::create_dir_all(&dir)?;
        let store = Self {
            db_path: dir.join("opspilot.db"),
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn db(&self) -> Result<Connection> {
        Ok(Connection::open(&self.db_path)?)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.db()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
             );",
        )?;
        let current: i64 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )?;
        for (version, sql) in MIGRATIONS {
            if *version > current {
                conn.execute_batch(sql)?;
                conn.execute(
                    "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                    params![version, Utc::now().to_rfc3339()],
                )?;
            }
        }
        Ok(())
    }

    pub fn upsert_session(&self, record: &SessionRecord) -> Result<()> {
        let conn = self.db()?;
        conn.execute(
            "INSERT INTO sessions (session_id, prompt, answer, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(session_id) DO UPDATE SET
                 prompt = excluded.prompt,
                 answer = excluded.answer,
                 status = excluded.status,
                 updated_at = excluded.updated_at",
            params![
                record.session_id.to_string(),
                record.prompt,
                record.answer,
                record.status,
                record.created_at,
                record.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn load_session(&self, session_id: Uuid) -> Result<Option<SessionRecord>> {
        let conn = self.db()?;
        let mut stmt = conn.prepare(
            "SELECT session_id, prompt, answer, status, created_at, updated_at
             FROM sessions WHERE session_id = ?1",
        )?;
        let mut rows = stmt.query(params![session_id.to_string()])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        let id: String = row.get(0)?;
        Ok(Some(SessionRecord {
            session_id: Uuid::parse_str(&id)?,
            prompt: row.get(1)?,
            answer: row.get(2)?,
            status: row.get(3)?,
            created_at: row.get(4)?,
            updated_at: row.get(5)?,
        }))
    }

    /// Overwrite the stored history for a session with the current turn
    /// history. The running history array is the only state the core needs
    /// to read back.
    pub fn replace_history(&self, session_id: Uuid, history: &[HistoryEntry]) -> Result<()> {
        let mut conn = self.db()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM turns WHERE session_id = ?1",
            params![session_id.to_string()],
        )?;
        for (seq, entry) in history.iter().enumerate() {
            tx.execute(
                "INSERT INTO turns (session_id, seq, tool_name, entry_json, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    session_id.to_string(),
                    seq as i64,
                    entry.tool_name,
                    serde_json::to_string(entry)?,
                    Utc::now().to_rfc3339(),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load_history(&self, session_id: Uuid) -> Result<Vec<HistoryEntry>> {
        let conn = self.db()?;
        let mut stmt = conn.prepare(
            "SELECT entry_json FROM turns WHERE session_id = ?1 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![session_id.to_string()], |row| {
            row.get::<_, String>(0)
        })?;
        let mut entries = Vec::new();
        for raw in rows {
            entries.push(serde_json::from_str(&raw?)?);
        }
        Ok(entries)
    }

    pub fn insert_anps_submission(&self, record: &AnpsSubmissionRecord) -> Result<()> {
        let conn = self.db()?;
        conn.execute(
            "INSERT INTO anps_submissions
                 (session_id, operation_id, score, error_flag, payload_json, ok, submitted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.session_id.to_string(),
                record.operation_id,
                record.score,
                record.error_flag as i64,
                record.payload_json,
                record.ok as i64,
                record.submitted_at,
            ],
        )?;
        Ok(())
    }

    pub fn list_anps_submissions(&self, session_id: Uuid) -> Result<Vec<AnpsSubmissionRecord>> {
        let conn = self.db()?;
        let mut stmt = conn.prepare(
            "SELECT session_id, operation_id, score, error_flag, payload_json, ok, submitted_at
             FROM anps_submissions WHERE session_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![session_id.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;
        let mut records = Vec::new();
        for row in rows {
            let (id, operation_id, score, error_flag, payload_json, ok, submitted_at) = row?;
            records.push(AnpsSubmissionRecord {
                session_id: Uuid::parse_str(&id)?,
                operation_id,
                score,
                error_flag: error_flag != 0,
                payload_json,
                ok: ok != 0,
                submitted_at,
            });
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opspilot_core::{EntryKind, ToolEnvelope};
    use serde_json::json;

    fn sample_entry(tool: &str) -> HistoryEntry {
        HistoryEntry {
            kind: EntryKind::Call,
            tool_name: tool.to_string(),
            tool_args: json!({"operation_id": "list_products"}),
            tool_result: ToolEnvelope::from_text(r#"{"status":200}"#),
            meta: None,
        }
    }

    #[test]
    fn session_and_history_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::new(dir.path()).expect("store");
        let session_id = Uuid::now_v7();

        store
            .upsert_session(&SessionRecord {
                session_id,
                prompt: "count the products".to_string(),
                answer: None,
                status: "running".to_string(),
                created_at: Utc::now().to_rfc3339(),
                updated_at: Utc::now().to_rfc3339(),
            })
            .expect("upsert");

        store
            .replace_history(session_id, &[sample_entry("api.execute")])
            .expect("history");
        let history = store.load_history(session_id).expect("load history");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].tool_name, "api.execute");

        let loaded = store
            .load_session(session_id)
            .expect("load")
            .expect("present");
        assert_eq!(loaded.status, "running");
    }

    #[test]
    fn anps_submissions_are_listed_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::new(dir.path()).expect("store");
        let session_id = Uuid::now_v7();

        for (op, score) in [("create_product", 9), ("update_price_list", 6)] {
            store
                .insert_anps_submission(&AnpsSubmissionRecord {
                    session_id,
                    operation_id: op.to_string(),
                    score,
                    error_flag: false,
                    payload_json: "{}".to_string(),
                    ok: true,
                    submitted_at: Utc::now().to_rfc3339(),
                })
                .expect("insert");
        }

        let listed = store.list_anps_submissions(session_id).expect("list");
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].operation_id, "create_product");
        assert_eq!(listed[1].score, 6);
    }
}
