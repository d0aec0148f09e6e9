//! Node registry mirror

use std::collections::{BTreeMap, BTreeSet};

use rusqlite::params;

use crate::discovery::{NodeDescriptor, NodeRole, NodeStatus};
use crate::{Error, Result};

use super::DbPool;

/// Persists node descriptors so the peer list survives restarts
#[derive(Clone)]
pub struct NodeStore {
    pool: DbPool,
}

impl NodeStore {
    /// Create a store over the pool
    #[must_use]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Insert or update a node
    ///
    /// # Errors
    ///
    /// Returns error if the write fails
    pub fn upsert(&self, node: &NodeDescriptor) -> Result<()> {
        let conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;
        conn.execute(
            r"
            INSERT INTO nodes (id, name, host, control_port, roles, tags, status, last_seen_ms, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, datetime('now'))
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                host = excluded.host,
                control_port = excluded.control_port,
                roles = excluded.roles,
                tags = excluded.tags,
                status = excluded.status,
                last_seen_ms = excluded.last_seen_ms,
                updated_at = datetime('now')
            ",
            params![
                node.id,
                node.name,
                node.host,
                node.control_port,
                serde_json::to_string(&node.roles)?,
                serde_json::to_string(&node.tags)?,
                status_str(node.status),
                i64::try_from(node.last_seen_ms).unwrap_or(i64::MAX),
            ],
        )?;
        Ok(())
    }

    /// Load every stored node
    ///
    /// # Errors
    ///
    /// Returns error if the read fails
    pub fn load_all(&self) -> Result<Vec<NodeDescriptor>> {
        let conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;
        let mut stmt = conn.prepare(
            "SELECT id, name, host, control_port, roles, tags, status, last_seen_ms
             FROM nodes ORDER BY id",
        )?;

        let rows = stmt.query_map([], |row| {
            let roles_json: String = row.get(4)?;
            let tags_json: String = row.get(5)?;
            let status: String = row.get(6)?;
            let last_seen: i64 = row.get(7)?;
            Ok(NodeDescriptor {
                id: row.get(0)?,
                name: row.get(1)?,
                host: row.get(2)?,
                control_port: row.get(3)?,
                roles: serde_json::from_str::<BTreeSet<NodeRole>>(&roles_json)
                    .unwrap_or_default(),
                tags: serde_json::from_str::<BTreeMap<String, String>>(&tags_json)
                    .unwrap_or_default(),
                status: parse_status(&status),
                last_seen_ms: u64::try_from(last_seen).unwrap_or(0),
            })
        })?;

        let mut nodes = Vec::new();
        for node in rows {
            nodes.push(node?);
        }
        Ok(nodes)
    }

    /// Remove a node by id
    ///
    /// # Errors
    ///
    /// Returns error if the write fails
    pub fn remove(&self, node_id: &str) -> Result<bool> {
        let conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;
        let changed = conn.execute("DELETE FROM nodes WHERE id = ?1", params![node_id])?;
        Ok(changed > 0)
    }
}

const fn status_str(status: NodeStatus) -> &'static str {
    match status {
        NodeStatus::Online => "online",
        NodeStatus::Degraded => "degraded",
        NodeStatus::Offline => "offline",
    }
}

fn parse_status(s: &str) -> NodeStatus {
    match s {
        "online" => NodeStatus::Online,
        "degraded" => NodeStatus::Degraded,
        _ => NodeStatus::Offline,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory;

    fn node(id: &str) -> NodeDescriptor {
        NodeDescriptor {
            id: id.to_string(),
            name: format!("Node {id}"),
            host: "192.168.32.7".to_string(),
            control_port: 8070,
            roles: BTreeSet::from([NodeRole::AudioHub]),
            tags: BTreeMap::from([("room".to_string(), "a".to_string())]),
            status: NodeStatus::Online,
            last_seen_ms: 12_345,
        }
    }

    #[test]
    fn upsert_and_load_round_trip() {
        let store = NodeStore::new(init_memory().unwrap());
        store.upsert(&node("indigo")).unwrap();
        store.upsert(&node("karate")).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, "indigo");
        assert!(loaded[0].roles.contains(&NodeRole::AudioHub));
        assert_eq!(loaded[0].tags.get("room").unwrap(), "a");
        assert_eq!(loaded[0].last_seen_ms, 12_345);
    }

    #[test]
    fn upsert_updates_in_place() {
        let store = NodeStore::new(init_memory().unwrap());
        store.upsert(&node("indigo")).unwrap();

        let mut updated = node("indigo");
        updated.host = "192.168.32.99".to_string();
        updated.status = NodeStatus::Offline;
        store.upsert(&updated).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].host, "192.168.32.99");
        assert_eq!(loaded[0].status, NodeStatus::Offline);
    }

    #[test]
    fn remove_deletes_the_row() {
        let store = NodeStore::new(init_memory().unwrap());
        store.upsert(&node("indigo")).unwrap();
        assert!(store.remove("indigo").unwrap());
        assert!(!store.remove("indigo").unwrap());
        assert!(store.load_all().unwrap().is_empty());
    }
}
