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

pub mod prompts;
pub mod validation;

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ExtractionSettings;
use crate::error::Result;
use crate::llm::{CacheManager, CompletionRequest, LlmProvider};
use crate::types::{Entity, ExtractionMode, ExtractionResult, Insight, Quote, Relationship, Segment};
use prompts::PromptBuilder;
use validation::{DataValidator, ValidationStats};

/// Locate the JSON array in an LLM response: the substring between the first
/// `[` and the last `]`. Returns `None` when no bracket pair exists.
pub fn extract_json_array(response: &str) -> Option<&str> {
    let start = response.find('[')?;
    let end = response.rfind(']')?;
    (end > start).then(|| &response[start..=end])
}

/// Prompted extraction of entities, relationships, quotes, and insights from
/// transcript segments, with fixed / schemaless / dual operating modes.
pub struct KnowledgeExtractor {
    provider: Arc<dyn LlmProvider>,
    cache: Arc<CacheManager>,
    settings: ExtractionSettings,
    model: String,
    validator: DataValidator,
    discovered_types: Mutex<BTreeSet<String>>,
    stats: Mutex<ValidationStats>,
}

impl KnowledgeExtractor {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        cache: Arc<CacheManager>,
        settings: ExtractionSettings,
        model: String,
    ) -> Self {
        let validator = DataValidator {
            max_entities_per_segment: settings.max_entities_per_segment,
            min_insight_length: settings.min_insight_length,
            min_quote_length: settings.min_quote_length,
        };
        Self {
            provider,
            cache,
            settings,
            model,
            validator,
            discovered_types: Mutex::new(BTreeSet::new()),
            stats: Mutex::new(ValidationStats::default()),
        }
    }

    pub fn mode(&self) -> ExtractionMode {
        self.settings.mode
    }

    /// Entity types observed so far in schemaless extraction.
    pub fn discovered_types(&self) -> Vec<String> {
        self.discovered_types.lock().iter().cloned().collect()
    }

    pub fn validation_stats(&self) -> ValidationStats {
        self.stats.lock().clone()
    }

    pub fn cache_stats(&self) -> crate::llm::CacheStats {
        self.cache.stats()
    }

    fn builders(&self) -> Vec<PromptBuilder> {
        match self.settings.mode {
            ExtractionMode::Fixed => vec![PromptBuilder::new(false)],
            ExtractionMode::Schemaless => vec![PromptBuilder::new(true)],
            // Dual mode runs both prompt sets on the same input.
            ExtractionMode::Dual => vec![PromptBuilder::new(false), PromptBuilder::new(true)],
        }
    }

    async fn complete(&self, prompt: String, cached_content: Option<String>) -> Result<String> {
        let mut request = CompletionRequest::new(prompt, self.model.clone());
        request.cached_content = cached_content;
        let response = self.provider.complete(request).await?;
        Ok(response.text)
    }

    fn record_discovered(&self, entities: &[Entity]) {
        if self.settings.mode == ExtractionMode::Fixed {
            return;
        }
        let mut set = self.discovered_types.lock();
        for entity in entities {
            set.insert(entity.entity_type.clone());
        }
    }

    /// Extract entities from a text block. Parse failures log and return an
    /// empty list; only transport-level errors surface to the caller.
    pub async fn extract_entities(
        &self,
        text: &str,
        context: &str,
        cached_content: Option<String>,
    ) -> Result<Vec<Entity>> {
        let mut all = Vec::new();
        for builder in self.builders() {
            let prompt = builder.entity_prompt(text, context);
            let response = self.complete(prompt, cached_content.clone()).await?;
            all.extend(parse_array::<Entity>(&response, "entity"));
        }

        let validated = self.validator.validate_entities(all, &mut self.stats.lock());
        self.record_discovered(&validated);
        Ok(validated)
    }

    pub async fn extract_relationships(
        &self,
        text: &str,
        entities: &[Entity],
        context: &str,
        cached_content: Option<String>,
    ) -> Result<Vec<Relationship>> {
        if entities.len() < 2 {
            return Ok(Vec::new());
        }

        let mut all = Vec::new();
        for builder in self.builders() {
            let prompt = builder.relationship_prompt(text, entities, context);
            let response = self.complete(prompt, cached_content.clone()).await?;
            all.extend(parse_array::<Relationship>(&response, "relationship"));
        }

        Ok(self.validator.validate_relationships(all, &mut self.stats.lock()))
    }

    pub async fn extract_quotes(
        &self,
        segments: &[Segment],
        cached_content: Option<String>,
    ) -> Result<Vec<Quote>> {
        let text = combined_text(segments);
        let builder = PromptBuilder::new(self.settings.mode != ExtractionMode::Fixed);
        let response = self.complete(builder.quote_prompt(&text), cached_content).await?;
        let mut quotes = parse_array::<Quote>(&response, "quote");
        // Quotes the model did not score get a pattern-based estimate.
        for quote in &mut quotes {
            if quote.confidence == 0.0 {
                quote.confidence = crate::text::quotability_score(&quote.text);
            }
        }
        Ok(self.validator.validate_quotes(quotes, &mut self.stats.lock()))
    }

    pub async fn extract_insights(
        &self,
        text: &str,
        entity_context: &str,
        cached_content: Option<String>,
    ) -> Result<Vec<Insight>> {
        let builder = PromptBuilder::new(self.settings.mode != ExtractionMode::Fixed);
        let response = self
            .complete(builder.insight_prompt(text, entity_context), cached_content)
            .await?;
        let insights = parse_array::<Insight>(&response, "insight");
        Ok(self.validator.validate_insights(insights, &mut self.stats.lock()))
    }

    /// Run the full extraction over an episode's segments in batches, using
    /// the provider-side transcript cache when the episode is large enough.
    pub async fn extract_episode(
        &self,
        episode_id: &str,
        segments: &[Segment],
        full_transcript: &str,
    ) -> Result<ExtractionResult> {
        let cached_content = self.prepare_cache(episode_id, full_transcript).await;
        let mut result = ExtractionResult::default();

        for batch in segments.chunks(self.settings.batch_size.max(1)) {
            let batch_result = self
                .extract_batch(batch, cached_content.clone())
                .await?;
            result.merge(batch_result);
        }

        result.discovered_types = self.discovered_types();
        Ok(result)
    }

    /// Extraction for one batch of contiguous segments.
    pub async fn extract_batch(
        &self,
        segments: &[Segment],
        cached_content: Option<String>,
    ) -> Result<ExtractionResult> {
        let text = combined_text(segments);
        let first_segment_id = segments.first().map(|s| s.id);

        let mut entities = self
            .extract_entities(&text, "", cached_content.clone())
            .await?;
        for entity in &mut entities {
            if entity.segment_id.is_none() {
                entity.segment_id = first_segment_id;
            }
        }

        let entity_context = PromptBuilder::entity_context(&entities);
        let mut relationships = self
            .extract_relationships(&text, &entities, &entity_context, cached_content.clone())
            .await?;
        for rel in &mut relationships {
            if rel.segment_id.is_none() {
                rel.segment_id = first_segment_id;
            }
        }

        // Entity-based extraction found nothing but multiple entities share
        // the segment: emit low-confidence co-occurrence pairs instead.
        if relationships.is_empty() && entities.len() > 1 {
            relationships = co_occurrence_relationships(&entities);
        }

        let quotes = self.extract_quotes(segments, cached_content.clone()).await?;
        let insights = self
            .extract_insights(&text, &entity_context, cached_content)
            .await?;

        Ok(ExtractionResult {
            entities,
            relationships,
            quotes,
            insights,
            discovered_types: Vec::new(),
        })
    }

    /// Get or create the provider-side cache entry for this episode's
    /// transcript. Failures degrade to uncached prompts.
    pub async fn prepare_cache(&self, episode_id: &str, transcript: &str) -> Option<String> {
        if !self.provider.supports_caching() || !self.cache.should_cache(transcript) {
            return None;
        }
        if transcript.len() < self.settings.min_transcript_size_for_cache {
            return None;
        }

        if let Some(name) = self.cache.get_cache(episode_id) {
            return Some(name);
        }

        match self
            .provider
            .create_cached_content(
                transcript,
                episode_id,
                "You are analyzing a podcast transcript for knowledge extraction.",
                Duration::from_secs(self.settings.cache_ttl_secs),
            )
            .await
        {
            Ok(name) => {
                self.cache.register_episode_cache(
                    episode_id,
                    name.clone(),
                    transcript.len(),
                    Duration::from_secs(self.settings.cache_ttl_secs),
                );
                tracing::info!("Created transcript cache for episode {}", episode_id);
                Some(name)
            }
            Err(e) => {
                tracing::warn!("Failed to cache episode {}: {}", episode_id, e);
                None
            }
        }
    }
}

fn combined_text(segments: &[Segment]) -> String {
    segments
        .iter()
        .map(|s| {
            let speaker = s.speaker.as_deref().unwrap_or("");
            if speaker.is_empty() {
                format!("[Time: {:.1}-{:.1}]\n{}", s.start_time, s.end_time, s.text)
            } else {
                format!(
                    "[Time: {:.1}-{:.1}] {}\n{}",
                    s.start_time, s.end_time, speaker, s.text
                )
            }
        })
        .collect::<Vec<_>>()
        .join("\n\n---SEGMENT---\n\n")
}

fn parse_array<T: serde::de::DeserializeOwned>(response: &str, kind: &str) -> Vec<T> {
    let json_str = match extract_json_array(response) {
        Some(s) => s,
        None => {
            tracing::warn!("No JSON array found in {} response", kind);
            return Vec::new();
        }
    };

    match serde_json::from_str::<Vec<serde_json::Value>>(json_str) {
        Ok(values) => values
            .into_iter()
            .filter_map(|v| match serde_json::from_value::<T>(v) {
                Ok(item) => Some(item),
                Err(e) => {
                    tracing::debug!("Skipping malformed {} record: {}", kind, e);
                    None
                }
            })
            .collect(),
        Err(e) => {
            tracing::warn!("Failed to parse {} JSON: {}", kind, e);
            Vec::new()
        }
    }
}

/// Low-confidence co-occurrence relationship between every pair of entities
/// that share a segment.
fn co_occurrence_relationships(entities: &[Entity]) -> Vec<Relationship> {
    let mut relationships = Vec::new();
    for (i, a) in entities.iter().enumerate() {
        for b in entities.iter().skip(i + 1) {
            if a.segment_id == b.segment_id {
                relationships.push(Relationship {
                    source_name: a.name.clone(),
                    target_name: b.name.clone(),
                    rel_type: "co-occurrence".to_string(),
                    confidence: 0.6,
                    properties: Default::default(),
                    segment_id: a.segment_id,
                });
            }
        }
    }
    relationships
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlm;

    fn segment(id: usize, speaker: &str, text: &str) -> Segment {
        Segment {
            id,
            start_time: id as f64 * 10.0,
            end_time: id as f64 * 10.0 + 8.0,
            speaker: Some(speaker.to_string()),
            text: text.to_string(),
        }
    }

    fn extractor(mode: ExtractionMode) -> KnowledgeExtractor {
        let settings = ExtractionSettings {
            mode,
            ..Default::default()
        };
        KnowledgeExtractor::new(
            Arc::new(MockLlm::new()),
            Arc::new(CacheManager::new(5000)),
            settings,
            "test-model".to_string(),
        )
    }

    #[test]
    fn json_array_location() {
        assert_eq!(
            extract_json_array("Here you go:\n[{\"a\": 1}]\nthanks"),
            Some("[{\"a\": 1}]")
        );
        assert_eq!(extract_json_array("no json here"), None);
        assert_eq!(extract_json_array("] backwards ["), None);
    }

    #[test]
    fn malformed_response_yields_empty_list() {
        let parsed: Vec<Entity> = parse_array("utter nonsense", "entity");
        assert!(parsed.is_empty());

        let partially_valid: Vec<Entity> = parse_array(
            r#"[{"name": "Good Entity", "type": "Person"}, {"nonsense": true}]"#,
            "entity",
        );
        assert_eq!(partially_valid.len(), 1);
    }

    #[tokio::test]
    async fn extracts_entities_via_provider() {
        let extractor = extractor(ExtractionMode::Fixed);
        let entities = extractor
            .extract_entities(
                "Elon Musk discussed Tesla Motors with Jane Goodall.",
                "",
                None,
            )
            .await
            .unwrap();
        assert!(!entities.is_empty());
        assert!(entities.iter().all(|e| e.confidence <= 1.0));
    }

    #[tokio::test]
    async fn co_occurrence_fallback_fires_when_no_relationships() {
        let extractor = extractor(ExtractionMode::Fixed);
        let segments = vec![segment(
            0,
            "SPEAKER_1",
            "Marie Curie worked with Pierre Curie on radioactivity research in Paris France.",
        )];
        let result = extractor.extract_batch(&segments, None).await.unwrap();

        assert!(result.entities.len() > 1);
        assert!(!result.relationships.is_empty());
        assert!(result
            .relationships
            .iter()
            .all(|r| r.rel_type == "co-occurrence" && (r.confidence - 0.6).abs() < 1e-9));
    }

    #[tokio::test]
    async fn schemaless_mode_records_discovered_types() {
        let extractor = extractor(ExtractionMode::Schemaless);
        extractor
            .extract_entities("Ada Lovelace wrote about the Analytical Engine.", "", None)
            .await
            .unwrap();
        assert!(!extractor.discovered_types().is_empty());
    }

    #[tokio::test]
    async fn fixed_mode_does_not_record_types() {
        let extractor = extractor(ExtractionMode::Fixed);
        extractor
            .extract_entities("Ada Lovelace wrote about the Analytical Engine.", "", None)
            .await
            .unwrap();
        assert!(extractor.discovered_types().is_empty());
    }

    #[tokio::test]
    async fn episode_extraction_batches_and_merges() {
        let extractor = extractor(ExtractionMode::Fixed);
        let segments: Vec<Segment> = (0..3)
            .map(|i| {
                segment(
                    i,
                    "SPEAKER_1",
                    "Grace Hopper built compilers at Harvard University long ago.",
                )
            })
            .collect();

        let transcript = combined_text(&segments);
        let result = extractor
            .extract_episode("ep1", &segments, &transcript)
            .await
            .unwrap();
        assert!(!result.entities.is_empty());
    }

    #[test]
    fn co_occurrence_respects_segment_boundaries() {
        let make = |name: &str, seg: usize| Entity {
            name: name.to_string(),
            entity_type: "Person".into(),
            description: None,
            confidence: 0.9,
            importance: 5.0,
            properties: Default::default(),
            segment_id: Some(seg),
        };
        let rels = co_occurrence_relationships(&[make("A", 0), make("B", 0), make("C", 1)]);
        assert_eq!(rels.len(), 1);
        assert_eq!(rels[0].source_name, "A");
        assert_eq!(rels[0].target_name, "B");
    }
}
