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
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;

use crate::error::Result;
use crate::graph::backend::{GraphBackend, NodeRecord, Row};
use crate::graph::{GraphStore, PodcastRouter};
use crate::text::normalize_entity_name;
use crate::types::{AuditRecord, Episode, ExtractionResult, PodcastConfig, Segment};

/// Indexes created per database on first use.
const FIXED_INDEXES: &[(&str, &str)] = &[
    ("Podcast", "id"),
    ("Episode", "id"),
    ("Episode", "podcast_id"),
    ("Segment", "episode_id"),
    ("Entity", "normalized_name"),
    ("Entity", "episode_id"),
    ("Quote", "episode_id"),
    ("Insight", "episode_id"),
    ("Audit", "episode_id"),
];

/// Graph store with pre-defined node labels and relationship types.
pub struct FixedGraphStore {
    backend: Arc<dyn GraphBackend>,
    router: Arc<PodcastRouter>,
    schema_ready: Mutex<HashSet<String>>,
}

impl FixedGraphStore {
    pub fn new(backend: Arc<dyn GraphBackend>, router: Arc<PodcastRouter>) -> Self {
        Self {
            backend,
            router,
            schema_ready: Mutex::new(HashSet::new()),
        }
    }

    async fn ensure_schema(&self, database: &str) -> Result<()> {
        if self.schema_ready.lock().contains(database) {
            return Ok(());
        }
        self.backend.ensure_database(database).await?;
        for (label, property) in FIXED_INDEXES {
            self.backend.create_index(database, label, property).await?;
        }
        self.schema_ready.lock().insert(database.to_string());
        tracing::info!("Fixed schema ready on database '{}'", database);
        Ok(())
    }

    async fn database(&self, podcast_id: &str) -> Result<String> {
        let database = self.router.database_for(podcast_id)?;
        self.ensure_schema(&database).await?;
        Ok(database)
    }

    /// Resolve an entity node by its dedup key within an episode.
    async fn find_entity(
        &self,
        database: &str,
        podcast_id: &str,
        episode_id: &str,
        name: &str,
    ) -> Result<Option<NodeRecord>> {
        let mut filters = Row::new();
        filters.insert("podcast_id".into(), json!(podcast_id));
        filters.insert("episode_id".into(), json!(episode_id));
        filters.insert("normalized_name".into(), json!(normalize_entity_name(name)));
        let mut nodes = self.backend.find_nodes(database, Some("Entity"), &filters).await?;
        Ok(nodes.pop())
    }
}

#[async_trait]
impl GraphStore for FixedGraphStore {
    async fn setup_schema(&self, podcast_id: &str) -> Result<()> {
        let database = self.router.database_for(podcast_id)?;
        self.ensure_schema(&database).await
    }

    async fn create_node(&self, podcast_id: &str, node_type: &str, properties: Row) -> Result<String> {
        let database = self.database(podcast_id).await?;
        // Keyless create: synthesize a key from identifying properties when
        // present, otherwise from the full property set.
        let key_value = properties
            .get("id")
            .or_else(|| properties.get("name"))
            .cloned()
            .unwrap_or_else(|| Value::String(serde_json::to_string(&properties).unwrap_or_default()));
        self.backend
            .upsert_node(&database, node_type, &[("_key", key_value)], properties)
            .await
    }

    async fn create_relationship(
        &self,
        podcast_id: &str,
        source_id: &str,
        target_id: &str,
        rel_type: &str,
        properties: Option<Row>,
    ) -> Result<()> {
        let database = self.database(podcast_id).await?;
        self.backend
            .upsert_relationship(&database, source_id, target_id, rel_type, properties.unwrap_or_default())
            .await
    }

    async fn update_node(&self, podcast_id: &str, node_id: &str, properties: Row) -> Result<()> {
        let database = self.database(podcast_id).await?;
        self.backend.update_node(&database, node_id, properties).await
    }

    async fn delete_node(&self, podcast_id: &str, node_id: &str) -> Result<()> {
        let database = self.database(podcast_id).await?;
        self.backend.delete_node(&database, node_id).await
    }

    async fn get_node(&self, podcast_id: &str, node_id: &str) -> Result<Option<NodeRecord>> {
        let database = self.database(podcast_id).await?;
        self.backend.get_node(&database, node_id).await
    }

    async fn query(&self, podcast_id: &str, statement: &str, parameters: &Row) -> Result<Vec<Row>> {
        let database = self.database(podcast_id).await?;
        self.backend.execute(&database, statement, parameters).await
    }

    async fn store_podcast(&self, podcast: &PodcastConfig) -> Result<String> {
        let database = self.database(&podcast.id).await?;
        let mut props = Row::new();
        props.insert("id".into(), json!(podcast.id));
        props.insert("name".into(), json!(podcast.name));
        self.backend
            .upsert_node(&database, "Podcast", &[("id", json!(podcast.id))], props)
            .await
    }

    async fn store_episode(&self, episode: &Episode) -> Result<String> {
        let database = self.database(&episode.podcast_id).await?;

        let podcast_node = self
            .backend
            .upsert_node(
                &database,
                "Podcast",
                &[("id", json!(episode.podcast_id))],
                Row::new(),
            )
            .await?;

        let mut props = Row::new();
        props.insert("id".into(), json!(episode.id));
        props.insert("podcast_id".into(), json!(episode.podcast_id));
        props.insert("title".into(), json!(episode.title));
        props.insert("description".into(), json!(episode.description));
        props.insert("audio_url".into(), json!(episode.audio_url));
        if let Some(published) = episode.published_at {
            props.insert("published_at".into(), json!(published.to_rfc3339()));
        }

        let episode_node = self
            .backend
            .upsert_node(&database, "Episode", &[("id", json!(episode.id))], props)
            .await?;
        self.backend
            .upsert_relationship(&database, &podcast_node, &episode_node, "HAS_EPISODE", Row::new())
            .await?;
        Ok(episode_node)
    }

    async fn store_segments(&self, episode: &Episode, segments: &[Segment]) -> Result<Vec<String>> {
        let database = self.database(&episode.podcast_id).await?;
        let episode_node = self
            .backend
            .upsert_node(&database, "Episode", &[("id", json!(episode.id))], Row::new())
            .await?;

        let mut ids = Vec::with_capacity(segments.len());
        for segment in segments {
            let mut props = Row::new();
            props.insert("episode_id".into(), json!(episode.id));
            props.insert("segment_index".into(), json!(segment.id));
            props.insert("start_time".into(), json!(segment.start_time));
            props.insert("end_time".into(), json!(segment.end_time));
            props.insert("text".into(), json!(segment.text));
            if let Some(speaker) = &segment.speaker {
                props.insert("speaker".into(), json!(speaker));
            }

            let segment_node = self
                .backend
                .upsert_node(
                    &database,
                    "Segment",
                    &[("episode_id", json!(episode.id)), ("segment_index", json!(segment.id))],
                    props,
                )
                .await?;
            self.backend
                .upsert_relationship(&database, &episode_node, &segment_node, "HAS_SEGMENT", Row::new())
                .await?;
            ids.push(segment_node);
        }
        Ok(ids)
    }

    async fn store_extraction(&self, episode: &Episode, extraction: &ExtractionResult) -> Result<()> {
        let database = self.database(&episode.podcast_id).await?;
        let episode_node = self
            .backend
            .upsert_node(&database, "Episode", &[("id", json!(episode.id))], Row::new())
            .await?;

        for entity in &extraction.entities {
            let normalized = normalize_entity_name(&entity.name);
            let mut props = Row::new();
            props.insert("name".into(), json!(entity.name));
            props.insert("normalized_name".into(), json!(normalized));
            props.insert("podcast_id".into(), json!(episode.podcast_id));
            props.insert("episode_id".into(), json!(episode.id));
            props.insert("entity_type".into(), json!(entity.entity_type));
            props.insert("confidence".into(), json!(entity.confidence));
            props.insert("importance".into(), json!(entity.importance));
            if let Some(description) = &entity.description {
                props.insert("description".into(), json!(description));
            }
            for (k, v) in &entity.properties {
                props.entry(k.clone()).or_insert(v.clone());
            }

            // Same episode + normalized name + type is always the same node.
            let entity_node = self
                .backend
                .upsert_node(
                    &database,
                    "Entity",
                    &[
                        ("podcast_id", json!(episode.podcast_id)),
                        ("episode_id", json!(episode.id)),
                        ("normalized_name", json!(normalized)),
                        ("entity_type", json!(entity.entity_type)),
                    ],
                    props,
                )
                .await?;
            self.backend
                .upsert_relationship(&database, &episode_node, &entity_node, "MENTIONS", Row::new())
                .await?;
        }

        for rel in &extraction.relationships {
            let source = self
                .find_entity(&database, &episode.podcast_id, &episode.id, &rel.source_name)
                .await?;
            let target = self
                .find_entity(&database, &episode.podcast_id, &episode.id, &rel.target_name)
                .await?;
            match (source, target) {
                (Some(source), Some(target)) => {
                    let mut props = Row::new();
                    props.insert("confidence".into(), json!(rel.confidence));
                    for (k, v) in &rel.properties {
                        props.entry(k.clone()).or_insert(v.clone());
                    }
                    self.backend
                        .upsert_relationship(&database, &source.id, &target.id, &rel.rel_type, props)
                        .await?;
                }
                _ => {
                    tracing::debug!(
                        "Skipping relationship {} -[{}]-> {}: entity not stored",
                        rel.source_name,
                        rel.rel_type,
                        rel.target_name
                    );
                }
            }
        }

        for quote in &extraction.quotes {
            let mut props = Row::new();
            props.insert("text".into(), json!(quote.text));
            props.insert("speaker".into(), json!(quote.speaker));
            props.insert("timestamp".into(), json!(quote.timestamp));
            props.insert("context".into(), json!(quote.context));
            props.insert("confidence".into(), json!(quote.confidence));
            props.insert("episode_id".into(), json!(episode.id));

            let quote_node = self
                .backend
                .upsert_node(
                    &database,
                    "Quote",
                    &[("episode_id", json!(episode.id)), ("text", json!(quote.text))],
                    props,
                )
                .await?;
            self.backend
                .upsert_relationship(&database, &episode_node, &quote_node, "HAS_QUOTE", Row::new())
                .await?;
        }

        for insight in &extraction.insights {
            let mut props = Row::new();
            props.insert("title".into(), json!(insight.title));
            props.insert("description".into(), json!(insight.description));
            props.insert("category".into(), json!(insight.category));
            props.insert("confidence".into(), json!(insight.confidence));
            props.insert("episode_id".into(), json!(episode.id));

            let insight_node = self
                .backend
                .upsert_node(
                    &database,
                    "Insight",
                    &[
                        ("episode_id", json!(episode.id)),
                        ("title", json!(insight.title.to_lowercase())),
                    ],
                    props,
                )
                .await?;
            self.backend
                .upsert_relationship(&database, &episode_node, &insight_node, "HAS_INSIGHT", Row::new())
                .await?;
        }

        Ok(())
    }

    async fn store_audits(&self, podcast_id: &str, audits: &[AuditRecord]) -> Result<()> {
        let database = self.database(podcast_id).await?;
        for audit in audits {
            let mut props = Row::new();
            props.insert("episode_id".into(), json!(audit.episode_id));
            props.insert("old_label".into(), json!(audit.old_label));
            props.insert("new_label".into(), json!(audit.new_label));
            props.insert("timestamp".into(), json!(audit.timestamp.to_rfc3339()));
            props.insert("source".into(), json!(audit.source.to_string()));

            self.backend
                .upsert_node(
                    &database,
                    "Audit",
                    &[
                        ("episode_id", json!(audit.episode_id)),
                        ("old_label", json!(audit.old_label)),
                        ("new_label", json!(audit.new_label)),
                    ],
                    props,
                )
                .await?;
        }
        Ok(())
    }
}
