//! Store gateway: a thin transactional wrapper over PostgreSQL/PostGIS.
//!
//! Owns the single connection, exposes batched multi-statement
//! execution, SQL/JSON literal escaping, and file-sourced DDL
//! execution. Does not migrate schema itself — callers invoke
//! `initialize()`/`create_indexes()` explicitly.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use postgres::{Client, NoTls, Row};

use crate::error::{Error, Result};
use crate::model::{Action, Member, MemberType, Meta, Relation, Way};

/// The write-path seam every batch-submitting component (the tasker,
/// the changeset writer) depends on instead of the concrete `Store`,
/// so their batching/threshold/flush logic can be unit-tested against
/// an in-memory fake without a live PostgreSQL instance.
pub trait SqlSink: Sync {
    fn query(&self, sql: &str) -> Result<()>;
}

/// The read-path seam the osmChange applier depends on for discovering
/// indirectly-affected ways/relations and loading node positions, so
/// its wave-propagation logic can be unit-tested against an in-memory
/// fake the same way the write path is. Returns domain values rather
/// than raw `postgres::Row`s, which a fake cannot construct outside
/// this crate.
pub trait StoreReader: SqlSink {
    fn ways_referencing_nodes(&self, node_ids: &[i64]) -> Result<Vec<i64>>;
    fn relations_referencing_ways(&self, way_ids: &[i64]) -> Result<Vec<i64>>;
    fn node_locations(&self, node_ids: &[i64]) -> Result<HashMap<i64, (f64, f64)>>;
    fn fetch_ways(&self, ids: &[i64]) -> Result<Vec<Way>>;
    fn fetch_relations(&self, ids: &[i64]) -> Result<Vec<Relation>>;
}

pub struct Store {
    client: Mutex<Client>,
}

impl SqlSink for Store {
    fn query(&self, sql: &str) -> Result<()> {
        Store::query(self, sql)
    }
}

impl Store {
    pub fn connect(database_url: &str) -> Result<Self> {
        let client = Client::connect(database_url, NoTls)?;
        Ok(Store {
            client: Mutex::new(client),
        })
    }

    /// Execute one or more semicolon-separated statements atomically
    /// from the caller's perspective. Workers share one `Store`; the
    /// mutex serialises concurrent submissions onto the single
    /// underlying connection.
    pub fn query(&self, sql: &str) -> Result<()> {
        if sql.trim().is_empty() {
            return Ok(());
        }
        let mut client = self.client.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        client.batch_execute(sql)?;
        Ok(())
    }

    /// Parameterised statement execution returning rows, for readers
    /// that need structured results rather than raw SQL text (e.g. the
    /// geometry propagator's `way_refs`/`rel_refs` lookups).
    pub fn query_rows(&self, sql: &str, params: &[&(dyn postgres::types::ToSql + Sync)]) -> Result<Vec<Row>> {
        let mut client = self.client.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(client.query(sql, params)?)
    }

    pub fn execute_ddl_file(&self, path: &Path) -> Result<()> {
        let sql = std::fs::read_to_string(path)?;
        self.query(&sql)
    }

    pub fn initialize(&self, ddl_dir: &Path) -> Result<()> {
        self.execute_ddl_file(&ddl_dir.join("tables.sql"))
    }

    pub fn create_indexes(&self, ddl_dir: &Path) -> Result<()> {
        self.execute_ddl_file(&ddl_dir.join("indexes.sql"))
    }
}

impl StoreReader for Store {
    fn ways_referencing_nodes(&self, node_ids: &[i64]) -> Result<Vec<i64>> {
        let rows = self.query_rows("SELECT DISTINCT way_id FROM way_refs WHERE node_id = ANY($1)", &[&node_ids])?;
        Ok(rows.iter().map(|r| r.get::<_, i64>(0)).collect())
    }

    fn relations_referencing_ways(&self, way_ids: &[i64]) -> Result<Vec<i64>> {
        let rows = self.query_rows("SELECT DISTINCT rel_id FROM rel_refs WHERE way_id = ANY($1)", &[&way_ids])?;
        Ok(rows.iter().map(|r| r.get::<_, i64>(0)).collect())
    }

    fn node_locations(&self, node_ids: &[i64]) -> Result<HashMap<i64, (f64, f64)>> {
        let rows = self.query_rows("SELECT osm_id, ST_X(geom), ST_Y(geom) FROM nodes WHERE osm_id = ANY($1)", &[&node_ids])?;
        Ok(rows.iter().map(|row| (row.get(0), (row.get(1), row.get(2)))).collect())
    }

    fn fetch_ways(&self, ids: &[i64]) -> Result<Vec<Way>> {
        let rows = self.query_rows(
            "SELECT osm_id, refs, tags, version, \"user\", uid, changeset FROM ways_line WHERE osm_id = ANY($1) \
             UNION ALL \
             SELECT osm_id, refs, tags, version, \"user\", uid, changeset FROM ways_poly WHERE osm_id = ANY($1)",
            &[&ids],
        )?;
        Ok(rows
            .iter()
            .map(|row| {
                let tags_json: serde_json::Value = row.get(2);
                Way {
                    meta: Meta {
                        osm_id: row.get(0),
                        version: u64::try_from(row.get::<_, i64>(3)).unwrap_or(0),
                        timestamp: None,
                        uid: row.get(5),
                        user: row.get(4),
                        changeset: row.get(6),
                        tags: tags_from_json(&tags_json),
                        action: Action::ModifyGeom,
                        priority: false,
                    },
                    refs: row.get::<_, Vec<i64>>(1),
                    linestring: None,
                    polygon: None,
                }
            })
            .collect())
    }

    fn fetch_relations(&self, ids: &[i64]) -> Result<Vec<Relation>> {
        let rows = self.query_rows(
            "SELECT osm_id, refs, tags, version, \"user\", uid, changeset FROM relations WHERE osm_id = ANY($1)",
            &[&ids],
        )?;
        Ok(rows
            .iter()
            .map(|row| {
                let tags_json: serde_json::Value = row.get(2);
                let members_json: serde_json::Value = row.get(1);
                Relation {
                    meta: Meta {
                        osm_id: row.get(0),
                        version: u64::try_from(row.get::<_, i64>(3)).unwrap_or(0),
                        timestamp: None,
                        uid: row.get(5),
                        user: row.get(4),
                        changeset: row.get(6),
                        tags: tags_from_json(&tags_json),
                        action: Action::ModifyGeom,
                        priority: false,
                    },
                    members: members_from_json(&members_json),
                    multipolygon: None,
                    multilinestring: None,
                }
            })
            .collect())
    }
}

fn tags_from_json(value: &serde_json::Value) -> crate::model::Tags {
    value
        .as_object()
        .map(|obj| obj.iter().filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string()))).collect())
        .unwrap_or_default()
}

fn members_from_json(value: &serde_json::Value) -> Vec<Member> {
    value
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|m| {
                    let obj = m.as_object()?;
                    let member_ref = obj.get("ref")?.as_i64()?;
                    let member_type = match obj.get("type")?.as_str()? {
                        "node" => MemberType::Node,
                        "way" => MemberType::Way,
                        "relation" => MemberType::Relation,
                        _ => return None,
                    };
                    let role = obj.get("role")?.as_str()?.to_string();
                    Some(Member { member_ref, member_type, role })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Escape a string for inclusion in a single-quoted SQL literal.
#[must_use]
pub fn escape_sql(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "''")
}

/// Escape a JSON-encoded string for embedding inside a SQL literal:
/// backslashes and quotes are double-escaped (once for JSON, once for
/// the surrounding SQL string).
#[must_use]
pub fn escape_json_for_sql(s: &str) -> String {
    escape_sql(&s.replace('\\', "\\\\").replace('"', "\\\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_sql_doubles_quotes() {
        assert_eq!(escape_sql("O'Brien"), "O''Brien");
    }

    #[test]
    fn escape_sql_doubles_backslashes() {
        assert_eq!(escape_sql("a\\b"), "a\\\\b");
    }

    #[test]
    fn escape_json_for_sql_handles_embedded_quotes() {
        let json = r#"{"k":"a\"b"}"#;
        let escaped = escape_json_for_sql(json);
        assert!(escaped.contains("\\\\\""));
    }
}
