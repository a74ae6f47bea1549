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
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{PipelineError, Result};
use crate::graph::backend::{NodeRecord, Row};
use crate::graph::fixed::FixedGraphStore;
use crate::graph::schemaless::SchemalessGraphStore;
use crate::graph::translator::{QueryTranslator, ResultStandardizer};
use crate::graph::GraphStore;
use crate::types::{AuditRecord, Episode, ExtractionMode, ExtractionResult, PodcastConfig, Segment};

/// Composes the fixed and schemaless stores behind one interface. In dual
/// (migration) mode every write goes to both schemas, per statement; an
/// inconsistency is logged, never rolled back.
pub struct CompatibleGraphStore {
    schema_mode: ExtractionMode,
    migration_mode: bool,
    prefer_schemaless: bool,
    fixed: Arc<FixedGraphStore>,
    schemaless: Arc<SchemalessGraphStore>,
    translator: QueryTranslator,
    standardizer: ResultStandardizer,
    dual_write_mismatches: AtomicU64,
}

impl CompatibleGraphStore {
    pub fn new(
        schema_mode: ExtractionMode,
        migration_mode: bool,
        fixed: Arc<FixedGraphStore>,
        schemaless: Arc<SchemalessGraphStore>,
    ) -> Self {
        Self {
            schema_mode,
            migration_mode: migration_mode || schema_mode == ExtractionMode::Dual,
            prefer_schemaless: false,
            fixed,
            schemaless,
            translator: QueryTranslator::new(),
            standardizer: ResultStandardizer::new(),
            dual_write_mismatches: AtomicU64::new(0),
        }
    }

    pub fn prefer_schemaless(mut self, prefer: bool) -> Self {
        self.prefer_schemaless = prefer;
        self
    }

    pub fn dual_write_mismatches(&self) -> u64 {
        self.dual_write_mismatches.load(Ordering::SeqCst)
    }

    fn dual_write(&self) -> bool {
        self.migration_mode && self.schema_mode != ExtractionMode::Fixed
            || self.schema_mode == ExtractionMode::Dual
    }

    fn write_store(&self) -> &dyn GraphStore {
        match self.schema_mode {
            ExtractionMode::Fixed => self.fixed.as_ref(),
            ExtractionMode::Schemaless => self.schemaless.as_ref(),
            ExtractionMode::Dual => {
                if self.prefer_schemaless {
                    self.schemaless.as_ref()
                } else {
                    self.fixed.as_ref()
                }
            }
        }
    }

    fn query_store(&self) -> &dyn GraphStore {
        match self.schema_mode {
            ExtractionMode::Schemaless => self.schemaless.as_ref(),
            ExtractionMode::Fixed => self.fixed.as_ref(),
            ExtractionMode::Dual => {
                if self.prefer_schemaless {
                    self.schemaless.as_ref()
                } else {
                    self.fixed.as_ref()
                }
            }
        }
    }

    fn uses_schemaless_query(&self) -> bool {
        matches!(self.schema_mode, ExtractionMode::Schemaless)
            || (self.schema_mode == ExtractionMode::Dual && self.prefer_schemaless)
    }

    fn record_mismatch(&self, context: &str, fixed_id: &str, schemaless_id: &str) {
        if fixed_id != schemaless_id {
            self.dual_write_mismatches.fetch_add(1, Ordering::SeqCst);
            tracing::debug!(
                "Dual-write ID mismatch ({}): fixed={} schemaless={}",
                context,
                fixed_id,
                schemaless_id
            );
        }
    }
}

#[async_trait]
impl GraphStore for CompatibleGraphStore {
    async fn setup_schema(&self, podcast_id: &str) -> Result<()> {
        match self.schema_mode {
            ExtractionMode::Fixed => self.fixed.setup_schema(podcast_id).await,
            ExtractionMode::Schemaless => self.schemaless.setup_schema(podcast_id).await,
            ExtractionMode::Dual => {
                self.fixed.setup_schema(podcast_id).await?;
                self.schemaless.setup_schema(podcast_id).await
            }
        }
    }

    async fn create_node(&self, podcast_id: &str, node_type: &str, properties: Row) -> Result<String> {
        if self.dual_write() {
            let fixed_id = self.fixed.create_node(podcast_id, node_type, properties.clone()).await?;
            let schemaless_id = self.schemaless.create_node(podcast_id, node_type, properties).await?;
            self.record_mismatch("create_node", &fixed_id, &schemaless_id);
            return Ok(fixed_id);
        }
        self.write_store().create_node(podcast_id, node_type, properties).await
    }

    async fn create_relationship(
        &self,
        podcast_id: &str,
        source_id: &str,
        target_id: &str,
        rel_type: &str,
        properties: Option<Row>,
    ) -> Result<()> {
        if self.dual_write() {
            self.fixed
                .create_relationship(podcast_id, source_id, target_id, rel_type, properties.clone())
                .await?;
            // Best-effort second write: per-statement, not per-transaction.
            if let Err(e) = self
                .schemaless
                .create_relationship(podcast_id, source_id, target_id, rel_type, properties)
                .await
            {
                tracing::warn!("Schemaless half of dual write failed: {}", e);
            }
            return Ok(());
        }
        self.write_store()
            .create_relationship(podcast_id, source_id, target_id, rel_type, properties)
            .await
    }

    async fn update_node(&self, podcast_id: &str, node_id: &str, properties: Row) -> Result<()> {
        if self.dual_write() {
            self.fixed.update_node(podcast_id, node_id, properties.clone()).await?;
            if let Err(e) = self.schemaless.update_node(podcast_id, node_id, properties).await {
                tracing::warn!("Schemaless half of dual update failed: {}", e);
            }
            return Ok(());
        }
        self.write_store().update_node(podcast_id, node_id, properties).await
    }

    async fn delete_node(&self, podcast_id: &str, node_id: &str) -> Result<()> {
        if self.dual_write() {
            self.fixed.delete_node(podcast_id, node_id).await?;
            if let Err(e) = self.schemaless.delete_node(podcast_id, node_id).await {
                tracing::warn!("Schemaless half of dual delete failed: {}", e);
            }
            return Ok(());
        }
        self.write_store().delete_node(podcast_id, node_id).await
    }

    async fn get_node(&self, podcast_id: &str, node_id: &str) -> Result<Option<NodeRecord>> {
        self.query_store().get_node(podcast_id, node_id).await
    }

    async fn query(&self, podcast_id: &str, statement: &str, parameters: &Row) -> Result<Vec<Row>> {
        if self.uses_schemaless_query() {
            let translated;
            let effective = if self.translator.is_fixed_schema_query(statement) {
                translated = self.translator.translate_fixed_to_schemaless(statement);
                tracing::debug!("Translated query: {} -> {}", statement, translated);
                translated.as_str()
            } else {
                statement
            };

            let rows = self.schemaless.query(podcast_id, effective, parameters).await?;
            // Only rows that came through the schemaless store are eligible
            // for standardization; hand-written fixed queries never get here.
            if self.standardizer.needs_standardization(&rows) {
                return Ok(self.standardizer.standardize_rows(rows));
            }
            return Ok(rows);
        }

        self.query_store().query(podcast_id, statement, parameters).await
    }

    async fn store_podcast(&self, podcast: &PodcastConfig) -> Result<String> {
        if self.dual_write() {
            let fixed_id = self.fixed.store_podcast(podcast).await?;
            let schemaless_id = self.schemaless.store_podcast(podcast).await?;
            self.record_mismatch("store_podcast", &fixed_id, &schemaless_id);
            return Ok(fixed_id);
        }
        self.write_store().store_podcast(podcast).await
    }

    async fn store_episode(&self, episode: &Episode) -> Result<String> {
        if self.dual_write() {
            let fixed_id = self.fixed.store_episode(episode).await?;
            let schemaless_id = self.schemaless.store_episode(episode).await?;
            self.record_mismatch("store_episode", &fixed_id, &schemaless_id);
            return Ok(fixed_id);
        }
        self.write_store().store_episode(episode).await
    }

    async fn store_segments(&self, episode: &Episode, segments: &[Segment]) -> Result<Vec<String>> {
        if self.dual_write() {
            let ids = self.fixed.store_segments(episode, segments).await?;
            if let Err(e) = self.schemaless.store_segments(episode, segments).await {
                tracing::warn!("Schemaless half of segment dual write failed: {}", e);
            }
            return Ok(ids);
        }
        self.write_store().store_segments(episode, segments).await
    }

    async fn store_extraction(&self, episode: &Episode, extraction: &ExtractionResult) -> Result<()> {
        if self.dual_write() {
            self.fixed.store_extraction(episode, extraction).await?;
            if let Err(e) = self.schemaless.store_extraction(episode, extraction).await {
                tracing::warn!("Schemaless half of extraction dual write failed: {}", e);
            }
            return Ok(());
        }
        self.write_store().store_extraction(episode, extraction).await
    }

    async fn store_audits(&self, podcast_id: &str, audits: &[AuditRecord]) -> Result<()> {
        if self.dual_write() {
            self.fixed.store_audits(podcast_id, audits).await?;
            if let Err(e) = self.schemaless.store_audits(podcast_id, audits).await {
                tracing::warn!("Schemaless half of audit dual write failed: {}", e);
            }
            return Ok(());
        }
        self.write_store().store_audits(podcast_id, audits).await
    }
}

impl CompatibleGraphStore {
    /// Current migration posture, for status reporting.
    pub fn migration_status(&self) -> Row {
        let mut status = Row::new();
        status.insert("mode".into(), serde_json::json!(self.schema_mode.to_string()));
        status.insert("migration_mode".into(), serde_json::json!(self.migration_mode));
        status.insert(
            "dual_write_mismatches".into(),
            serde_json::json!(self.dual_write_mismatches()),
        );
        status
    }

    /// Validate both halves after a dual-write run: per-entity-name node
    /// counts must agree between the schemas.
    pub async fn verify_dual_write(&self, episode: &Episode) -> Result<bool> {
        if !self.dual_write() {
            return Err(PipelineError::Invariant(
                "verify_dual_write called outside migration mode".to_string(),
            ));
        }

        let mut params = Row::new();
        params.insert("episode_id".into(), serde_json::json!(episode.id));

        let fixed_rows = self
            .fixed
            .query(
                &episode.podcast_id,
                "MATCH (n:Entity {episode_id: $episode_id}) RETURN n",
                &params,
            )
            .await?;
        let schemaless_rows = self
            .schemaless
            .query(
                &episode.podcast_id,
                "MATCH (n:Node {_type: 'Entity', episode_id: $episode_id}) RETURN n",
                &params,
            )
            .await?;

        let consistent = fixed_rows.len() == schemaless_rows.len();
        if !consistent {
            tracing::warn!(
                "Dual-write divergence for episode {}: fixed={} schemaless={}",
                episode.id,
                fixed_rows.len(),
                schemaless_rows.len()
            );
        }
        Ok(consistent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::backend::InMemoryGraph;
    use crate::graph::{build_store, PodcastRouter};
    use crate::types::{DatabaseTarget, Entity};
    use serde_json::json;
    use std::collections::HashMap;

    fn setup(mode: ExtractionMode, migration: bool) -> (Arc<CompatibleGraphStore>, Arc<InMemoryGraph>) {
        let backend = Arc::new(InMemoryGraph::new());
        let mut map = HashMap::new();
        map.insert("pod".to_string(), "db_pod".to_string());
        let router = Arc::new(PodcastRouter::new(map, true));
        let store = build_store(backend.clone(), router, mode, migration);
        (store, backend)
    }

    fn episode() -> Episode {
        Episode {
            id: "ep1".into(),
            podcast_id: "pod".into(),
            title: "T".into(),
            description: String::new(),
            published_at: None,
            audio_url: "http://x/1.mp3".into(),
            duration_secs: None,
            guid: None,
            youtube_url: None,
            author: None,
        }
    }

    fn extraction() -> ExtractionResult {
        ExtractionResult {
            entities: vec![Entity {
                name: "Acme Corp".into(),
                entity_type: "Organization".into(),
                description: None,
                confidence: 0.9,
                importance: 5.0,
                properties: Default::default(),
                segment_id: Some(0),
            }],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn dual_mode_writes_both_schemas() {
        let (store, backend) = setup(ExtractionMode::Dual, true);
        store.store_episode(&episode()).await.unwrap();
        store.store_extraction(&episode(), &extraction()).await.unwrap();

        use crate::graph::backend::GraphBackend;
        let fixed_count = backend.count_nodes("db_pod", Some("Entity")).await.unwrap();
        assert_eq!(fixed_count, 1);

        let mut filters = Row::new();
        filters.insert("_type".into(), json!("Entity"));
        let schemaless = backend
            .find_nodes("db_pod", Some("Node"), &filters)
            .await
            .unwrap();
        assert_eq!(schemaless.len(), 1);

        assert!(store.verify_dual_write(&episode()).await.unwrap());
    }

    #[tokio::test]
    async fn dual_mode_delete_removes_both_halves() {
        use crate::graph::backend::GraphBackend;

        let (store, backend) = setup(ExtractionMode::Dual, true);
        let mut props = Row::new();
        props.insert("name".into(), json!("ghost"));
        let fixed_id = store.create_node("pod", "Entity", props).await.unwrap();

        // The schemaless twin has its own id; both halves must exist first.
        let mut filters = Row::new();
        filters.insert("_type".into(), json!("Entity"));
        let twins = backend.find_nodes("db_pod", Some("Node"), &filters).await.unwrap();
        assert_eq!(twins.len(), 1);
        assert_eq!(backend.count_nodes("db_pod", Some("Entity")).await.unwrap(), 1);

        store.delete_node("pod", &fixed_id).await.unwrap();
        assert!(backend.get_node("db_pod", &fixed_id).await.unwrap().is_none());

        store.delete_node("pod", &twins[0].id).await.unwrap();
        assert_eq!(backend.count_nodes("db_pod", Some("Entity")).await.unwrap(), 0);
        assert_eq!(backend.count_nodes("db_pod", Some("Node")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn fixed_mode_writes_single_schema() {
        let (store, backend) = setup(ExtractionMode::Fixed, false);
        store.store_extraction(&episode(), &extraction()).await.unwrap();

        use crate::graph::backend::GraphBackend;
        assert_eq!(backend.count_nodes("db_pod", Some("Entity")).await.unwrap(), 1);
        assert_eq!(backend.count_nodes("db_pod", Some("Node")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn rerun_is_idempotent() {
        let (store, backend) = setup(ExtractionMode::Fixed, false);
        store.store_episode(&episode()).await.unwrap();
        store.store_extraction(&episode(), &extraction()).await.unwrap();

        use crate::graph::backend::GraphBackend;
        let first = backend.count_nodes("db_pod", None).await.unwrap();
        let first_rels = backend.relationships("db_pod").await.unwrap().len();

        store.store_episode(&episode()).await.unwrap();
        store.store_extraction(&episode(), &extraction()).await.unwrap();

        assert_eq!(backend.count_nodes("db_pod", None).await.unwrap(), first);
        assert_eq!(backend.relationships("db_pod").await.unwrap().len(), first_rels);
    }

    #[tokio::test]
    async fn schemaless_query_translates_and_standardizes() {
        let (store, _backend) = setup(ExtractionMode::Schemaless, false);
        store.store_extraction(&episode(), &extraction()).await.unwrap();

        let rows = store
            .query("pod", "MATCH (n:Entity) RETURN n", &Row::new())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        // Standardized: _label surfaced, _type removed.
        assert_eq!(rows[0]["n"]["_label"], json!("Entity"));
        assert!(rows[0]["n"].get("_type").is_none());
    }

    #[tokio::test]
    async fn isolation_rejects_unknown_podcast() {
        let (store, _backend) = setup(ExtractionMode::Fixed, false);
        let mut ep = episode();
        ep.podcast_id = "not_registered".into();
        assert!(store.store_episode(&ep).await.is_err());
    }

    #[tokio::test]
    async fn audits_are_idempotent_nodes() {
        use crate::types::{AuditRecord, MappingSource};
        let (store, backend) = setup(ExtractionMode::Fixed, false);
        let audit = AuditRecord {
            episode_id: "ep1".into(),
            old_label: "SPEAKER_1".into(),
            new_label: "Jane".into(),
            timestamp: chrono::Utc::now(),
            source: MappingSource::Llm,
        };

        store.store_audits("pod", &[audit.clone()]).await.unwrap();
        store.store_audits("pod", &[audit]).await.unwrap();

        use crate::graph::backend::GraphBackend;
        assert_eq!(backend.count_nodes("db_pod", Some("Audit")).await.unwrap(), 1);
    }

    #[test]
    fn database_target_is_used_in_router_map() {
        let podcast = PodcastConfig {
            id: "x".into(),
            name: "X".into(),
            enabled: true,
            feed_url: None,
            database: DatabaseTarget {
                uri: "bolt://h".into(),
                database_name: "db_x".into(),
            },
        };
        let router = PodcastRouter::from_podcasts(std::slice::from_ref(&podcast), true);
        assert_eq!(router.database_for("x").unwrap(), "db_x");
    }
}
