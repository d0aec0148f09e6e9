//! Durable command history

use rusqlite::params;

use crate::tools::{InvocationOutcome, ToolInvocation};
use crate::{Error, Result};

use super::DbPool;

/// A persisted invocation row
#[derive(Debug, Clone)]
pub struct StoredInvocation {
    pub id: String,
    pub tool: String,
    pub caller_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub ok: bool,
    pub error_kind: Option<String>,
}

/// Writes completed tool invocations to the history table
#[derive(Clone)]
pub struct HistoryStore {
    pool: DbPool,
}

impl HistoryStore {
    /// Create a store over the pool
    #[must_use]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Append one completed invocation
    ///
    /// # Errors
    ///
    /// Returns error if the write fails
    pub fn append(&self, invocation: &ToolInvocation) -> Result<()> {
        let (ok, error_kind, payload) = match &invocation.outcome {
            InvocationOutcome::Ok { result } => (true, None, serde_json::to_string(result)?),
            InvocationOutcome::Error {
                error_kind,
                message,
                ..
            } => (false, Some(error_kind.as_str()), message.clone()),
        };

        let conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;
        conn.execute(
            r"
            INSERT OR REPLACE INTO tool_history
                (id, tool, args, caller_id, started_at, finished_at, ok, error_kind, payload)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ",
            params![
                invocation.id.to_string(),
                invocation.tool,
                serde_json::to_string(&invocation.args)?,
                invocation.caller_id,
                invocation.started_at.to_rfc3339(),
                invocation.finished_at.to_rfc3339(),
                ok,
                error_kind,
                payload,
            ],
        )?;
        Ok(())
    }

    /// Most recent invocations, newest first
    ///
    /// # Errors
    ///
    /// Returns error if the read fails
    pub fn recent(&self, limit: usize) -> Result<Vec<StoredInvocation>> {
        let conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;
        let mut stmt = conn.prepare(
            "SELECT id, tool, caller_id, started_at, finished_at, ok, error_kind
             FROM tool_history ORDER BY started_at DESC LIMIT ?1",
        )?;

        let rows = stmt.query_map(params![limit], |row| {
            Ok(StoredInvocation {
                id: row.get(0)?,
                tool: row.get(1)?,
                caller_id: row.get(2)?,
                started_at: row.get(3)?,
                finished_at: row.get(4)?,
                ok: row.get(5)?,
                error_kind: row.get(6)?,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory;
    use crate::error::ErrorKind;
    use serde_json::json;
    use uuid::Uuid;

    fn invocation(tool: &str, ok: bool) -> ToolInvocation {
        let now = chrono::Utc::now();
        ToolInvocation {
            id: Uuid::new_v4(),
            tool: tool.to_string(),
            args: json!({"a": 1}),
            caller_id: "indigo".to_string(),
            started_at: now,
            finished_at: now,
            outcome: if ok {
                InvocationOutcome::Ok {
                    result: json!({"fine": true}),
                }
            } else {
                InvocationOutcome::Error {
                    error_kind: ErrorKind::NotConnected,
                    message: "not connected".to_string(),
                    retryable: false,
                }
            },
        }
    }

    #[test]
    fn append_and_read_back() {
        let store = HistoryStore::new(init_memory().unwrap());
        store.append(&invocation("jack_status", true)).unwrap();
        store.append(&invocation("disconnect_jack_ports", false)).unwrap();

        let rows = store.recent(10).unwrap();
        assert_eq!(rows.len(), 2);

        let failed = rows.iter().find(|r| !r.ok).unwrap();
        assert_eq!(failed.tool, "disconnect_jack_ports");
        assert_eq!(failed.error_kind.as_deref(), Some("not_connected"));
        assert_eq!(failed.caller_id, "indigo");
    }

    #[test]
    fn limit_is_honored() {
        let store = HistoryStore::new(init_memory().unwrap());
        for _ in 0..5 {
            store.append(&invocation("jack_status", true)).unwrap();
        }
        assert_eq!(store.recent(3).unwrap().len(), 3);
    }
}
