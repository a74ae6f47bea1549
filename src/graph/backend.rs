/*
 * Podcast Seeder CLI - Rust Edition
 * Copyright (c) 2024 Podcast Seeder Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

use async_trait::async_trait;
use chrono::Utc;
use lazy_static::lazy_static;
use parking_lot::RwLock;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{PipelineError, Result};

pub type Row = Map<String, Value>;

#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub id: String,
    pub label: String,
    pub properties: Row,
}

#[derive(Debug, Clone)]
pub struct RelationshipRecord {
    pub source_id: String,
    pub target_id: String,
    pub rel_type: String,
    pub properties: Row,
}

/// Contract with the graph database collaborator: logical databases addressed
/// by name, node/edge upserts, and a minimal parameterized match statement.
/// The production deployment points this at a real graph server; the
/// in-memory implementation below backs tests and local runs.
#[async_trait]
pub trait GraphBackend: Send + Sync {
    async fn ensure_database(&self, database: &str) -> Result<()>;

    /// Upsert keyed on `(label, key properties)`: an existing match has its
    /// properties merged and `updated_at` refreshed, otherwise a node is
    /// created. Returns the node id.
    async fn upsert_node(
        &self,
        database: &str,
        label: &str,
        key: &[(&str, Value)],
        properties: Row,
    ) -> Result<String>;

    async fn update_node(&self, database: &str, node_id: &str, properties: Row) -> Result<()>;

    async fn delete_node(&self, database: &str, node_id: &str) -> Result<()>;

    async fn get_node(&self, database: &str, node_id: &str) -> Result<Option<NodeRecord>>;

    /// Upsert keyed on `(source_id, target_id, rel_type)`.
    async fn upsert_relationship(
        &self,
        database: &str,
        source_id: &str,
        target_id: &str,
        rel_type: &str,
        properties: Row,
    ) -> Result<()>;

    async fn find_nodes(
        &self,
        database: &str,
        label: Option<&str>,
        filters: &Row,
    ) -> Result<Vec<NodeRecord>>;

    async fn count_nodes(&self, database: &str, label: Option<&str>) -> Result<usize>;

    async fn relationships(&self, database: &str) -> Result<Vec<RelationshipRecord>>;

    /// Idempotent index creation.
    async fn create_index(&self, database: &str, label: &str, property: &str) -> Result<()>;

    /// Execute a match statement (`MATCH (n:Label {prop: $param}) RETURN n`)
    /// with parameter binding. Rows come back as `{"n": {...}}` objects.
    async fn execute(&self, database: &str, statement: &str, parameters: &Row) -> Result<Vec<Row>>;
}

lazy_static! {
    static ref MATCH_RE: Regex =
        Regex::new(r"MATCH\s*\(\s*n\s*:\s*([A-Za-z_][A-Za-z0-9_]*)\s*(\{[^}]*\})?\s*\)").unwrap();
    static ref PROP_RE: Regex =
        Regex::new(r#"([A-Za-z_][A-Za-z0-9_]*)\s*:\s*(\$[A-Za-z_][A-Za-z0-9_]*|'[^']*'|"[^"]*")"#)
            .unwrap();
}

#[derive(Default)]
struct Database {
    nodes: HashMap<String, NodeRecord>,
    relationships: Vec<RelationshipRecord>,
    indexes: Vec<(String, String)>,
}

/// In-memory graph backend: adjacency and property maps per logical database.
/// Deterministic and session-free, which is all the core needs; the network
/// graph server satisfies the same trait in deployment.
#[derive(Default)]
pub struct InMemoryGraph {
    databases: RwLock<HashMap<String, Database>>,
}

impl InMemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GraphBackend for InMemoryGraph {
    async fn ensure_database(&self, database: &str) -> Result<()> {
        self.databases.write().entry(database.to_string()).or_default();
        Ok(())
    }

    async fn upsert_node(
        &self,
        database: &str,
        label: &str,
        key: &[(&str, Value)],
        mut properties: Row,
    ) -> Result<String> {
        let mut databases = self.databases.write();
        let db = databases.entry(database.to_string()).or_default();

        let existing_id = db
            .nodes
            .values()
            .find(|node| {
                node.label == label
                    && key
                        .iter()
                        .all(|(k, v)| node.properties.get(*k) == Some(v))
            })
            .map(|node| node.id.clone());

        let now = Value::String(Utc::now().to_rfc3339());
        match existing_id.and_then(|id| db.nodes.get_mut(&id).map(|n| (id, n))) {
            Some((id, node)) => {
                for (k, v) in properties {
                    if k != "created_at" {
                        node.properties.insert(k, v);
                    }
                }
                node.properties.insert("updated_at".to_string(), now);
                Ok(id)
            }
            None => {
                let id = Uuid::new_v4().to_string();
                for (k, v) in key {
                    properties.entry(k.to_string()).or_insert(v.clone());
                }
                properties.insert("created_at".to_string(), now.clone());
                properties.insert("updated_at".to_string(), now);
                db.nodes.insert(
                    id.clone(),
                    NodeRecord {
                        id: id.clone(),
                        label: label.to_string(),
                        properties,
                    },
                );
                Ok(id)
            }
        }
    }

    async fn update_node(&self, database: &str, node_id: &str, properties: Row) -> Result<()> {
        let mut databases = self.databases.write();
        let db = databases
            .get_mut(database)
            .ok_or_else(|| PipelineError::Storage(format!("unknown database '{}'", database)))?;
        let node = db
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| PipelineError::Storage(format!("unknown node '{}'", node_id)))?;
        for (k, v) in properties {
            node.properties.insert(k, v);
        }
        node.properties
            .insert("updated_at".to_string(), Value::String(Utc::now().to_rfc3339()));
        Ok(())
    }

    async fn delete_node(&self, database: &str, node_id: &str) -> Result<()> {
        let mut databases = self.databases.write();
        if let Some(db) = databases.get_mut(database) {
            db.nodes.remove(node_id);
            db.relationships
                .retain(|r| r.source_id != node_id && r.target_id != node_id);
        }
        Ok(())
    }

    async fn get_node(&self, database: &str, node_id: &str) -> Result<Option<NodeRecord>> {
        Ok(self
            .databases
            .read()
            .get(database)
            .and_then(|db| db.nodes.get(node_id))
            .cloned())
    }

    async fn upsert_relationship(
        &self,
        database: &str,
        source_id: &str,
        target_id: &str,
        rel_type: &str,
        properties: Row,
    ) -> Result<()> {
        let mut databases = self.databases.write();
        let db = databases.entry(database.to_string()).or_default();

        if let Some(existing) = db.relationships.iter_mut().find(|r| {
            r.source_id == source_id && r.target_id == target_id && r.rel_type == rel_type
        }) {
            for (k, v) in properties {
                existing.properties.insert(k, v);
            }
            existing
                .properties
                .insert("updated_at".to_string(), Value::String(Utc::now().to_rfc3339()));
            return Ok(());
        }

        let mut properties = properties;
        properties.insert("created_at".to_string(), Value::String(Utc::now().to_rfc3339()));
        db.relationships.push(RelationshipRecord {
            source_id: source_id.to_string(),
            target_id: target_id.to_string(),
            rel_type: rel_type.to_string(),
            properties,
        });
        Ok(())
    }

    async fn find_nodes(
        &self,
        database: &str,
        label: Option<&str>,
        filters: &Row,
    ) -> Result<Vec<NodeRecord>> {
        let databases = self.databases.read();
        let db = match databases.get(database) {
            Some(db) => db,
            None => return Ok(Vec::new()),
        };

        let mut matches: Vec<NodeRecord> = db
            .nodes
            .values()
            .filter(|node| {
                label.map(|l| node.label == l).unwrap_or(true)
                    && filters
                        .iter()
                        .all(|(k, v)| node.properties.get(k) == Some(v))
            })
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(matches)
    }

    async fn count_nodes(&self, database: &str, label: Option<&str>) -> Result<usize> {
        let databases = self.databases.read();
        Ok(databases
            .get(database)
            .map(|db| {
                db.nodes
                    .values()
                    .filter(|n| label.map(|l| n.label == l).unwrap_or(true))
                    .count()
            })
            .unwrap_or(0))
    }

    async fn relationships(&self, database: &str) -> Result<Vec<RelationshipRecord>> {
        Ok(self
            .databases
            .read()
            .get(database)
            .map(|db| db.relationships.clone())
            .unwrap_or_default())
    }

    async fn create_index(&self, database: &str, label: &str, property: &str) -> Result<()> {
        let mut databases = self.databases.write();
        let db = databases.entry(database.to_string()).or_default();
        let entry = (label.to_string(), property.to_string());
        if !db.indexes.contains(&entry) {
            db.indexes.push(entry);
        }
        Ok(())
    }

    async fn execute(&self, database: &str, statement: &str, parameters: &Row) -> Result<Vec<Row>> {
        let caps = MATCH_RE.captures(statement).ok_or_else(|| {
            PipelineError::Storage(format!("unsupported statement: '{}'", statement))
        })?;
        let label = caps.get(1).unwrap().as_str();

        let mut filters = Row::new();
        if let Some(props) = caps.get(2) {
            for prop in PROP_RE.captures_iter(props.as_str()) {
                let key = prop.get(1).unwrap().as_str().to_string();
                let raw = prop.get(2).unwrap().as_str();
                let value = if let Some(param) = raw.strip_prefix('$') {
                    parameters.get(param).cloned().ok_or_else(|| {
                        PipelineError::Storage(format!("missing parameter '{}'", param))
                    })?
                } else {
                    Value::String(raw.trim_matches(['\'', '"']).to_string())
                };
                filters.insert(key, value);
            }
        }

        let nodes = self.find_nodes(database, Some(label), &filters).await?;
        Ok(nodes
            .into_iter()
            .map(|node| {
                let mut inner = node.properties;
                inner.insert("_id".to_string(), Value::String(node.id));
                inner.insert("_label".to_string(), Value::String(node.label));
                let mut row = Row::new();
                row.insert("n".to_string(), Value::Object(inner));
                row
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[tokio::test]
    async fn upsert_is_idempotent_on_key() {
        let graph = InMemoryGraph::new();
        let key = [("name", json!("acme")), ("episode_id", json!("ep1"))];

        let id1 = graph
            .upsert_node("db1", "Entity", &key, row(&[("surface", json!("Acme Inc."))]))
            .await
            .unwrap();
        let id2 = graph
            .upsert_node("db1", "Entity", &key, row(&[("surface", json!("ACME"))]))
            .await
            .unwrap();

        assert_eq!(id1, id2);
        assert_eq!(graph.count_nodes("db1", Some("Entity")).await.unwrap(), 1);

        let node = graph.get_node("db1", &id1).await.unwrap().unwrap();
        assert_eq!(node.properties["surface"], json!("ACME"));
        assert!(node.properties.contains_key("created_at"));
    }

    #[tokio::test]
    async fn databases_are_isolated() {
        let graph = InMemoryGraph::new();
        graph
            .upsert_node("db_a", "Entity", &[("name", json!("only-in-a"))], Row::new())
            .await
            .unwrap();

        assert_eq!(graph.count_nodes("db_a", None).await.unwrap(), 1);
        assert_eq!(graph.count_nodes("db_b", None).await.unwrap(), 0);
        let found = graph
            .find_nodes("db_b", Some("Entity"), &Row::new())
            .await
            .unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn relationship_upsert_deduplicates() {
        let graph = InMemoryGraph::new();
        let a = graph.upsert_node("db", "Entity", &[("name", json!("a"))], Row::new()).await.unwrap();
        let b = graph.upsert_node("db", "Entity", &[("name", json!("b"))], Row::new()).await.unwrap();

        graph.upsert_relationship("db", &a, &b, "RELATES_TO", Row::new()).await.unwrap();
        graph.upsert_relationship("db", &a, &b, "RELATES_TO", Row::new()).await.unwrap();
        graph.upsert_relationship("db", &a, &b, "USES", Row::new()).await.unwrap();

        assert_eq!(graph.relationships("db").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn delete_removes_dangling_edges() {
        let graph = InMemoryGraph::new();
        let a = graph.upsert_node("db", "Entity", &[("name", json!("a"))], Row::new()).await.unwrap();
        let b = graph.upsert_node("db", "Entity", &[("name", json!("b"))], Row::new()).await.unwrap();
        graph.upsert_relationship("db", &a, &b, "RELATES_TO", Row::new()).await.unwrap();

        graph.delete_node("db", &a).await.unwrap();
        assert!(graph.get_node("db", &a).await.unwrap().is_none());
        assert!(graph.relationships("db").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn execute_matches_label_and_parameters() {
        let graph = InMemoryGraph::new();
        graph
            .upsert_node("db", "Entity", &[("name", json!("acme"))], row(&[("kind", json!("org"))]))
            .await
            .unwrap();
        graph
            .upsert_node("db", "Entity", &[("name", json!("widget"))], Row::new())
            .await
            .unwrap();

        let rows = graph
            .execute(
                "db",
                "MATCH (n:Entity {name: $name}) RETURN n",
                &row(&[("name", json!("acme"))]),
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["n"]["kind"], json!("org"));

        let all = graph
            .execute("db", "MATCH (n:Entity) RETURN n", &Row::new())
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
    }
}
