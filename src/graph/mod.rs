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

pub mod backend;
pub mod compatible;
pub mod fixed;
pub mod schemaless;
pub mod translator;

pub use backend::{GraphBackend, InMemoryGraph, NodeRecord, Row};
pub use compatible::CompatibleGraphStore;
pub use fixed::FixedGraphStore;
pub use schemaless::SchemalessGraphStore;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{PipelineError, Result};
use crate::types::{AuditRecord, Episode, ExtractionResult, PodcastConfig, Segment};

/// Database used when a podcast has no registry entry and isolation is off.
const SHARED_DATABASE: &str = "podcast_knowledge";

/// One logical storage API regardless of schema mode. All high-level
/// operations are keyed by podcast so the router can pin the database.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Idempotent per-database index/constraint creation.
    async fn setup_schema(&self, podcast_id: &str) -> Result<()>;

    async fn create_node(&self, podcast_id: &str, node_type: &str, properties: Row) -> Result<String>;

    async fn create_relationship(
        &self,
        podcast_id: &str,
        source_id: &str,
        target_id: &str,
        rel_type: &str,
        properties: Option<Row>,
    ) -> Result<()>;

    async fn update_node(&self, podcast_id: &str, node_id: &str, properties: Row) -> Result<()>;

    async fn delete_node(&self, podcast_id: &str, node_id: &str) -> Result<()>;

    async fn get_node(&self, podcast_id: &str, node_id: &str) -> Result<Option<NodeRecord>>;

    async fn query(&self, podcast_id: &str, statement: &str, parameters: &Row) -> Result<Vec<Row>>;

    async fn store_podcast(&self, podcast: &PodcastConfig) -> Result<String>;

    async fn store_episode(&self, episode: &Episode) -> Result<String>;

    async fn store_segments(&self, episode: &Episode, segments: &[Segment]) -> Result<Vec<String>>;

    async fn store_extraction(&self, episode: &Episode, extraction: &ExtractionResult) -> Result<()>;

    async fn store_audits(&self, podcast_id: &str, audits: &[AuditRecord]) -> Result<()>;
}

/// Maps `podcast_id -> database_id` and carries the ambient podcast context
/// set by the orchestrator. Refuses to resolve when isolation is required and
/// no context is available.
pub struct PodcastRouter {
    databases: HashMap<String, String>,
    isolation_required: bool,
    context: Mutex<Option<String>>,
}

impl PodcastRouter {
    pub fn new(databases: HashMap<String, String>, isolation_required: bool) -> Self {
        Self {
            databases,
            isolation_required,
            context: Mutex::new(None),
        }
    }

    pub fn from_podcasts(podcasts: &[PodcastConfig], isolation_required: bool) -> Self {
        Self::new(
            podcasts
                .iter()
                .map(|p| (p.id.clone(), p.database.database_name.clone()))
                .collect(),
            isolation_required,
        )
    }

    /// Set (or clear) the ambient podcast context. Switching context is a map
    /// lookup only; connections are shared across databases.
    pub fn set_context(&self, podcast_id: Option<&str>) -> Result<()> {
        if let Some(id) = podcast_id {
            if self.isolation_required && !self.databases.contains_key(id) {
                return Err(PipelineError::Config(format!(
                    "podcast '{}' has no configured database",
                    id
                )));
            }
        }
        *self.context.lock() = podcast_id.map(|s| s.to_string());
        Ok(())
    }

    pub fn current_context(&self) -> Option<String> {
        self.context.lock().clone()
    }

    /// Resolve the database for an operation. An explicit podcast id wins;
    /// otherwise the ambient context is consulted.
    pub fn database_for(&self, podcast_id: &str) -> Result<String> {
        let effective = if podcast_id.is_empty() {
            self.current_context().ok_or_else(|| {
                PipelineError::Config(
                    "no podcast context set and none supplied for storage operation".to_string(),
                )
            })?
        } else {
            podcast_id.to_string()
        };

        match self.databases.get(&effective) {
            Some(database) => Ok(database.clone()),
            None if !self.isolation_required => Ok(SHARED_DATABASE.to_string()),
            None => Err(PipelineError::Config(format!(
                "podcast '{}' is not routed to any database and isolation is required",
                effective
            ))),
        }
    }
}

/// Build the storage stack for the configured schema mode: the compatible
/// store composes fixed and schemaless implementations over one backend.
pub fn build_store(
    backend: Arc<dyn GraphBackend>,
    router: Arc<PodcastRouter>,
    mode: crate::types::ExtractionMode,
    migration_mode: bool,
) -> Arc<CompatibleGraphStore> {
    let fixed = Arc::new(FixedGraphStore::new(backend.clone(), router.clone()));
    let schemaless = Arc::new(SchemalessGraphStore::new(backend, router));
    Arc::new(CompatibleGraphStore::new(mode, migration_mode, fixed, schemaless))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DatabaseTarget;

    fn podcast(id: &str, db: &str) -> PodcastConfig {
        PodcastConfig {
            id: id.into(),
            name: id.into(),
            enabled: true,
            feed_url: None,
            database: DatabaseTarget {
                uri: "bolt://localhost".into(),
                database_name: db.into(),
            },
        }
    }

    #[test]
    fn routes_by_explicit_podcast_id() {
        let router = PodcastRouter::from_podcasts(&[podcast("a", "db_a"), podcast("b", "db_b")], true);
        assert_eq!(router.database_for("a").unwrap(), "db_a");
        assert_eq!(router.database_for("b").unwrap(), "db_b");
    }

    #[test]
    fn refuses_without_context_when_isolated() {
        let router = PodcastRouter::from_podcasts(&[podcast("a", "db_a")], true);
        assert!(router.database_for("").is_err());
        assert!(router.database_for("unknown").is_err());

        router.set_context(Some("a")).unwrap();
        assert_eq!(router.database_for("").unwrap(), "db_a");

        router.set_context(None).unwrap();
        assert!(router.database_for("").is_err());
    }

    #[test]
    fn unrouted_podcast_shares_default_database_without_isolation() {
        let router = PodcastRouter::from_podcasts(&[podcast("a", "db_a")], false);
        assert_eq!(router.database_for("anything").unwrap(), SHARED_DATABASE);
    }

    #[test]
    fn context_rejects_unknown_podcast_when_isolated() {
        let router = PodcastRouter::from_podcasts(&[podcast("a", "db_a")], true);
        assert!(router.set_context(Some("missing")).is_err());
    }
}
