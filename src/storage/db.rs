//! SQLite persistence: the audit log (prompts, outputs, alerts) and the
//! durable halves of the registries (workspaces, sessions, provider
//! endpoints). Audit writes are best-effort; a failed append never blocks
//! request delivery.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::errors::GatewayError;
use crate::providers::ProviderEndpoint;
use crate::session::Session;
use crate::workspaces::Workspace;

#[derive(Debug, Clone, Serialize)]
pub struct PromptRecord {
    pub id: String,
    pub workspace_id: String,
    pub timestamp: DateTime<Utc>,
    pub provider: String,
    pub request: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutputRecord {
    pub id: String,
    pub prompt_id: String,
    pub timestamp: DateTime<Utc>,
    pub output: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertRecord {
    pub id: String,
    pub prompt_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_snippet: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_string: Option<String>,
    pub trigger_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_category: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl AlertRecord {
    /// At least one of `code_snippet` and `trigger_string` must be present.
    pub fn new(
        prompt_id: &str,
        trigger_type: &str,
        code_snippet: Option<String>,
        trigger_string: Option<String>,
        trigger_category: Option<String>,
    ) -> Option<Self> {
        if code_snippet.is_none() && trigger_string.is_none() {
            return None;
        }
        Some(AlertRecord {
            id: Uuid::new_v4().to_string(),
            prompt_id: prompt_id.to_string(),
            code_snippet,
            trigger_string,
            trigger_type: trigger_type.to_string(),
            trigger_category,
            timestamp: Utc::now(),
        })
    }
}

pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    pub fn open(path: &Path) -> Result<Self, GatewayError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| GatewayError::Config(format!("create {}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path)
            .map_err(|e| GatewayError::Config(format!("open {}: {e}", path.display())))?;
        let db = Db {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self, GatewayError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| GatewayError::Config(format!("open in-memory db: {e}")))?;
        let db = Db {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<(), GatewayError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS prompts (
                id TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                provider TEXT NOT NULL,
                request TEXT NOT NULL,
                type TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS outputs (
                id TEXT PRIMARY KEY,
                prompt_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                output TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS alerts (
                id TEXT PRIMARY KEY,
                prompt_id TEXT NOT NULL,
                code_snippet TEXT,
                trigger_string TEXT,
                trigger_type TEXT NOT NULL,
                trigger_category TEXT,
                timestamp TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS workspaces (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                body TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                active_workspace_id TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS provider_endpoints (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                body TEXT NOT NULL
            );",
        )
        .map_err(|e| GatewayError::Config(format!("migrate: {e}")))?;
        Ok(())
    }

    pub fn record_prompt(&self, record: &PromptRecord) -> Result<(), GatewayError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO prompts (id, workspace_id, timestamp, provider, request, type)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.id,
                record.workspace_id,
                record.timestamp.to_rfc3339(),
                record.provider,
                record.request,
                record.kind,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn record_output(&self, record: &OutputRecord) -> Result<(), GatewayError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO outputs (id, prompt_id, timestamp, output) VALUES (?1, ?2, ?3, ?4)",
            params![
                record.id,
                record.prompt_id,
                record.timestamp.to_rfc3339(),
                record.output,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn record_alert(&self, record: &AlertRecord) -> Result<(), GatewayError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO alerts (id, prompt_id, code_snippet, trigger_string, trigger_type,
                                 trigger_category, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.id,
                record.prompt_id,
                record.code_snippet,
                record.trigger_string,
                record.trigger_type,
                record.trigger_category,
                record.timestamp.to_rfc3339(),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn list_prompts(&self, limit: usize) -> Result<Vec<PromptRecord>, GatewayError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT id, workspace_id, timestamp, provider, request, type
                 FROM prompts ORDER BY timestamp DESC LIMIT ?1",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok(PromptRecord {
                    id: row.get(0)?,
                    workspace_id: row.get(1)?,
                    timestamp: parse_ts(row.get::<_, String>(2)?),
                    provider: row.get(3)?,
                    request: row.get(4)?,
                    kind: row.get(5)?,
                })
            })
            .map_err(db_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
    }

    pub fn list_alerts(&self, limit: usize) -> Result<Vec<AlertRecord>, GatewayError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT id, prompt_id, code_snippet, trigger_string, trigger_type,
                        trigger_category, timestamp
                 FROM alerts ORDER BY timestamp DESC LIMIT ?1",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok(AlertRecord {
                    id: row.get(0)?,
                    prompt_id: row.get(1)?,
                    code_snippet: row.get(2)?,
                    trigger_string: row.get(3)?,
                    trigger_type: row.get(4)?,
                    trigger_category: row.get(5)?,
                    timestamp: parse_ts(row.get::<_, String>(6)?),
                })
            })
            .map_err(db_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
    }

    pub fn save_workspace(&self, workspace: &Workspace) -> Result<(), GatewayError> {
        let body = serde_json::to_string(workspace)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO workspaces (id, name, body) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET body = excluded.body",
            params![workspace.id, workspace.name, body],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn delete_workspace(&self, name: &str) -> Result<(), GatewayError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM workspaces WHERE name = ?1", params![name])
            .map_err(db_err)?;
        Ok(())
    }

    pub fn load_workspaces(&self) -> Result<Vec<Workspace>, GatewayError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT body FROM workspaces")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(db_err)?;
        let mut out = Vec::new();
        for body in rows {
            let body = body.map_err(db_err)?;
            match serde_json::from_str(&body) {
                Ok(ws) => out.push(ws),
                Err(e) => tracing::warn!("skipping unreadable workspace row: {e}"),
            }
        }
        Ok(out)
    }

    pub fn save_session(&self, session: &Session) -> Result<(), GatewayError> {
        let conn = self.conn.lock().unwrap();
        // Exactly one session row is current.
        conn.execute("DELETE FROM sessions", [])
            .map_err(db_err)?;
        conn.execute(
            "INSERT INTO sessions (id, active_workspace_id, updated_at) VALUES (?1, ?2, ?3)",
            params![
                session.id,
                session.active_workspace_id,
                session.updated_at.to_rfc3339(),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn load_session(&self) -> Result<Option<(String, String)>, GatewayError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, active_workspace_id FROM sessions LIMIT 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(db_err)
    }

    pub fn save_endpoint(&self, endpoint: &ProviderEndpoint) -> Result<(), GatewayError> {
        let body = serde_json::to_string(endpoint)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO provider_endpoints (id, name, body) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET body = excluded.body",
            params![endpoint.id, endpoint.name, body],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn delete_endpoint(&self, id: &str) -> Result<(), GatewayError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM provider_endpoints WHERE id = ?1", params![id])
            .map_err(db_err)?;
        Ok(())
    }

    pub fn load_endpoints(&self) -> Result<Vec<ProviderEndpoint>, GatewayError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT body FROM provider_endpoints")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(db_err)?;
        let mut out = Vec::new();
        for body in rows {
            let body = body.map_err(db_err)?;
            match serde_json::from_str(&body) {
                Ok(ep) => out.push(ep),
                Err(e) => tracing::warn!("skipping unreadable endpoint row: {e}"),
            }
        }
        Ok(out)
    }
}

fn db_err(e: rusqlite::Error) -> GatewayError {
    GatewayError::Internal(format!("db: {e}"))
}

fn parse_ts(raw: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderKind;

    fn prompt(id: &str) -> PromptRecord {
        PromptRecord {
            id: id.to_string(),
            workspace_id: "default".into(),
            timestamp: Utc::now(),
            provider: "ollama".into(),
            request: "{}".into(),
            kind: "chat".into(),
        }
    }

    #[test]
    fn prompt_and_output_round_trip() {
        let db = Db::open_in_memory().unwrap();
        db.record_prompt(&prompt("p1")).unwrap();
        db.record_output(&OutputRecord {
            id: "o1".into(),
            prompt_id: "p1".into(),
            timestamp: Utc::now(),
            output: "{}".into(),
        })
        .unwrap();

        let prompts = db.list_prompts(10).unwrap();
        assert_eq!(prompts.len(), 1);
        assert_eq!(prompts[0].provider, "ollama");
    }

    #[test]
    fn alert_requires_snippet_or_trigger() {
        assert!(AlertRecord::new("p1", "secret", None, None, None).is_none());
        let alert =
            AlertRecord::new("p1", "secret", None, Some("github_token".into()), None).unwrap();
        let db = Db::open_in_memory().unwrap();
        db.record_alert(&alert).unwrap();
        assert_eq!(db.list_alerts(10).unwrap().len(), 1);
    }

    #[test]
    fn workspace_persistence_round_trips() {
        let db = Db::open_in_memory().unwrap();
        let registry = crate::workspaces::WorkspaceRegistry::new();
        let ws = registry.create("w1").unwrap();
        db.save_workspace(&ws).unwrap();

        let loaded = db.load_workspaces().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "w1");
    }

    #[test]
    fn single_session_row() {
        let db = Db::open_in_memory().unwrap();
        let registry = crate::session::SessionRegistry::new("default");
        db.save_session(&registry.current()).unwrap();
        db.save_session(&registry.activate_workspace("w1")).unwrap();

        let (_, active) = db.load_session().unwrap().unwrap();
        assert_eq!(active, "w1");
    }

    #[test]
    fn endpoint_persistence_round_trips() {
        let db = Db::open_in_memory().unwrap();
        let ep = ProviderEndpoint::named("local", ProviderKind::Ollama, "http://localhost:11434");
        db.save_endpoint(&ep).unwrap();
        let loaded = db.load_endpoints().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].kind, ProviderKind::Ollama);
    }
}
