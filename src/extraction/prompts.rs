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

use crate::types::{Entity, FIXED_ENTITY_TYPES, FIXED_RELATIONSHIP_TYPES};

/// Prompt templates for knowledge extraction. The fixed variants enumerate
/// the schema's types; the schemaless variants leave types open.
pub struct PromptBuilder {
    schemaless: bool,
}

impl PromptBuilder {
    pub fn new(schemaless: bool) -> Self {
        Self { schemaless }
    }

    pub fn entity_prompt(&self, text: &str, context: &str) -> String {
        let type_instruction = if self.schemaless {
            "Use whatever type best describes each entity (free-form strings are fine)."
                .to_string()
        } else {
            format!(
                "Only use these entity types: {}.",
                FIXED_ENTITY_TYPES.join(", ")
            )
        };

        format!(
            r#"Extract the named entities from this podcast transcript excerpt.

{context}

{type_instruction}

For each entity provide:
- "name": the entity's name exactly as spoken
- "type": the entity type
- "description": one short sentence (optional)
- "confidence": 0.0-1.0
- "importance": 0-10 for how central the entity is to the discussion

Return ONLY a JSON array, no prose:
[{{"name": "...", "type": "...", "description": "...", "confidence": 0.9, "importance": 7}}]

Text:
{text}"#,
            context = context,
            type_instruction = type_instruction,
            text = text
        )
    }

    pub fn relationship_prompt(&self, text: &str, entities: &[Entity], context: &str) -> String {
        let entity_list = entities
            .iter()
            .map(|e| format!("- {} ({})", e.name, e.entity_type))
            .collect::<Vec<_>>()
            .join("\n");

        let type_instruction = if self.schemaless {
            "Relationship types are free-form short verb phrases.".to_string()
        } else {
            format!(
                "Only use these relationship types: {}.",
                FIXED_RELATIONSHIP_TYPES.join(", ")
            )
        };

        format!(
            r#"Extract relationships between the entities found in this transcript excerpt.

{context}

Known entities:
{entity_list}

{type_instruction}

Return ONLY a JSON array:
[{{"source_name": "...", "target_name": "...", "type": "...", "confidence": 0.8}}]

Text:
{text}"#,
            context = context,
            entity_list = entity_list,
            type_instruction = type_instruction,
            text = text
        )
    }

    pub fn quote_prompt(&self, text: &str) -> String {
        format!(
            r#"Extract notable quotes from this podcast transcript excerpt: memorable,
self-contained statements worth citing verbatim.

For each quote provide:
- "text": the exact words
- "speaker": who said it (empty string if unknown)
- "timestamp": seconds from the [Time: ...] markers when determinable
- "context": one sentence of surrounding context
- "confidence": 0.0-1.0

Return ONLY a JSON array:
[{{"text": "...", "speaker": "...", "timestamp": 12.5, "context": "...", "confidence": 0.8}}]

Text:
{text}"#,
            text = text
        )
    }

    pub fn insight_prompt(&self, text: &str, entity_context: &str) -> String {
        format!(
            r#"Extract key insights from this podcast transcript excerpt: conclusions,
lessons, or observations a reader should take away.

{entity_context}

For each insight provide:
- "title": a short headline
- "description": at least a full sentence explaining the insight
- "category": one of observation, recommendation, prediction, lesson, fact, opinion
- "confidence": 0.0-1.0

Return ONLY a JSON array:
[{{"title": "...", "description": "...", "category": "observation", "confidence": 0.7}}]

Text:
{text}"#,
            entity_context = entity_context,
            text = text
        )
    }

    /// Context header listing already-known entities, bounded to avoid bloat.
    pub fn entity_context(entities: &[Entity]) -> String {
        if entities.is_empty() {
            return String::new();
        }
        let mut parts = vec!["Known entities in this segment:".to_string()];
        for entity in entities.iter().take(10) {
            parts.push(format!("- {} ({})", entity.name, entity.entity_type));
        }
        parts.join("\n")
    }
}
