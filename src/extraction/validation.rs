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

use std::collections::HashMap;

use crate::text::normalize_entity_name;
use crate::types::{Entity, Insight, Quote, Relationship, INSIGHT_CATEGORIES};

/// Clamp a 0-100 score into its documented range.
pub fn clamp_score(value: f64) -> f64 {
    value.clamp(0.0, 100.0)
}

/// Clamp a ratio/confidence into [0, 1].
pub fn clamp_ratio(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Clamp an importance value into [0, 10].
pub fn clamp_importance(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 10.0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ValidationStats {
    pub entities_dropped: usize,
    pub entities_merged: usize,
    pub entities_truncated: usize,
    pub insights_dropped: usize,
    pub quotes_dropped: usize,
    pub relationships_dropped: usize,
}

/// Validation applied to every extraction result before it is returned.
pub struct DataValidator {
    pub max_entities_per_segment: usize,
    pub min_insight_length: usize,
    pub min_quote_length: usize,
}

impl Default for DataValidator {
    fn default() -> Self {
        Self {
            max_entities_per_segment: 50,
            min_insight_length: 20,
            min_quote_length: 10,
        }
    }
}

impl DataValidator {
    /// Drop invalid entities, merge duplicates by `(normalized_name, type)`
    /// keeping max confidence, and keep the top N by importance on overflow.
    pub fn validate_entities(&self, entities: Vec<Entity>, stats: &mut ValidationStats) -> Vec<Entity> {
        let mut by_key: HashMap<(String, String), Entity> = HashMap::new();
        let mut order: Vec<(String, String)> = Vec::new();

        for mut entity in entities {
            entity.name = entity.name.trim().to_string();
            if entity.name.len() < 2 || entity.entity_type.trim().is_empty() {
                stats.entities_dropped += 1;
                continue;
            }

            entity.confidence = clamp_ratio(entity.confidence);
            entity.importance = clamp_importance(entity.importance);

            let key = (
                normalize_entity_name(&entity.name),
                entity.entity_type.trim().to_lowercase(),
            );

            match by_key.get_mut(&key) {
                Some(existing) => {
                    stats.entities_merged += 1;
                    existing.confidence = existing.confidence.max(entity.confidence);
                    existing.importance = existing.importance.max(entity.importance);
                    if existing.description.is_none() {
                        existing.description = entity.description;
                    }
                    for (k, v) in entity.properties {
                        existing.properties.entry(k).or_insert(v);
                    }
                }
                None => {
                    order.push(key.clone());
                    by_key.insert(key, entity);
                }
            }
        }

        let mut validated: Vec<Entity> = order.into_iter().filter_map(|k| by_key.remove(&k)).collect();

        if validated.len() > self.max_entities_per_segment {
            stats.entities_truncated += validated.len() - self.max_entities_per_segment;
            validated.sort_by(|a, b| {
                b.importance
                    .partial_cmp(&a.importance)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            validated.truncate(self.max_entities_per_segment);
        }

        validated
    }

    pub fn validate_relationships(
        &self,
        relationships: Vec<Relationship>,
        stats: &mut ValidationStats,
    ) -> Vec<Relationship> {
        let mut seen: Vec<(String, String, String)> = Vec::new();
        let mut validated = Vec::new();

        for mut rel in relationships {
            rel.source_name = rel.source_name.trim().to_string();
            rel.target_name = rel.target_name.trim().to_string();
            if rel.source_name.is_empty() || rel.target_name.is_empty() || rel.rel_type.trim().is_empty() {
                stats.relationships_dropped += 1;
                continue;
            }

            rel.confidence = clamp_ratio(rel.confidence);

            let key = (
                normalize_entity_name(&rel.source_name),
                normalize_entity_name(&rel.target_name),
                rel.rel_type.trim().to_lowercase(),
            );
            if seen.contains(&key) {
                stats.relationships_dropped += 1;
                continue;
            }
            seen.push(key);
            validated.push(rel);
        }

        validated
    }

    /// Enforce minimum description length, dedupe titles case-insensitively,
    /// and normalize categories to the known set.
    pub fn validate_insights(&self, insights: Vec<Insight>, stats: &mut ValidationStats) -> Vec<Insight> {
        let mut seen_titles: Vec<String> = Vec::new();
        let mut validated = Vec::new();

        for mut insight in insights {
            insight.title = insight.title.trim().to_string();
            insight.description = insight.description.trim().to_string();

            if insight.title.is_empty() || insight.description.len() < self.min_insight_length {
                stats.insights_dropped += 1;
                continue;
            }

            let title_key = insight.title.to_lowercase();
            if seen_titles.contains(&title_key) {
                stats.insights_dropped += 1;
                continue;
            }
            seen_titles.push(title_key);

            let category = insight.category.trim().to_lowercase();
            insight.category = if INSIGHT_CATEGORIES.contains(&category.as_str()) {
                category
            } else {
                "observation".to_string()
            };
            insight.confidence = clamp_ratio(insight.confidence);

            validated.push(insight);
        }

        validated
    }

    pub fn validate_quotes(&self, quotes: Vec<Quote>, stats: &mut ValidationStats) -> Vec<Quote> {
        let mut seen: Vec<String> = Vec::new();
        let mut validated = Vec::new();

        for mut quote in quotes {
            quote.text = quote.text.trim().to_string();
            if quote.text.len() < self.min_quote_length {
                stats.quotes_dropped += 1;
                continue;
            }

            let key = quote.text.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ");
            if seen.contains(&key) {
                stats.quotes_dropped += 1;
                continue;
            }
            seen.push(key);

            quote.confidence = clamp_ratio(quote.confidence);
            if quote.timestamp < 0.0 {
                quote.timestamp = 0.0;
            }
            validated.push(quote);
        }

        validated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(name: &str, etype: &str, confidence: f64, importance: f64) -> Entity {
        Entity {
            name: name.to_string(),
            entity_type: etype.to_string(),
            description: None,
            confidence,
            importance,
            properties: Default::default(),
            segment_id: None,
        }
    }

    #[test]
    fn drops_short_names_and_missing_types() {
        let validator = DataValidator::default();
        let mut stats = ValidationStats::default();
        let validated = validator.validate_entities(
            vec![
                entity("X", "Person", 0.9, 5.0),
                entity("Valid Name", "", 0.9, 5.0),
                entity("Kept", "Concept", 0.9, 5.0),
            ],
            &mut stats,
        );
        assert_eq!(validated.len(), 1);
        assert_eq!(validated[0].name, "Kept");
        assert_eq!(stats.entities_dropped, 2);
    }

    #[test]
    fn merges_duplicates_keeping_max_confidence() {
        let validator = DataValidator::default();
        let mut stats = ValidationStats::default();
        let validated = validator.validate_entities(
            vec![
                entity("Acme Inc.", "Organization", 0.6, 3.0),
                entity("acme", "organization", 0.9, 2.0),
            ],
            &mut stats,
        );
        assert_eq!(validated.len(), 1);
        assert_eq!(validated[0].confidence, 0.9);
        assert_eq!(validated[0].importance, 3.0);
        // Original surface form is preserved on the kept record.
        assert_eq!(validated[0].name, "Acme Inc.");
        assert_eq!(stats.entities_merged, 1);
    }

    #[test]
    fn overflow_keeps_top_by_importance() {
        let validator = DataValidator {
            max_entities_per_segment: 2,
            ..Default::default()
        };
        let mut stats = ValidationStats::default();
        let validated = validator.validate_entities(
            vec![
                entity("Low", "Concept", 0.9, 1.0),
                entity("High", "Concept", 0.9, 9.0),
                entity("Mid", "Concept", 0.9, 5.0),
            ],
            &mut stats,
        );
        assert_eq!(validated.len(), 2);
        assert_eq!(validated[0].name, "High");
        assert_eq!(validated[1].name, "Mid");
        assert_eq!(stats.entities_truncated, 1);
    }

    #[test]
    fn confidence_and_importance_are_clamped() {
        let validator = DataValidator::default();
        let mut stats = ValidationStats::default();
        let validated =
            validator.validate_entities(vec![entity("Name", "Concept", 2.5, 99.0)], &mut stats);
        assert_eq!(validated[0].confidence, 1.0);
        assert_eq!(validated[0].importance, 10.0);
    }

    #[test]
    fn insight_category_normalizes_to_known_set() {
        let validator = DataValidator::default();
        let mut stats = ValidationStats::default();
        let validated = validator.validate_insights(
            vec![
                Insight {
                    title: "A".into(),
                    description: "A sufficiently long description here.".into(),
                    category: "Prediction".into(),
                    confidence: 0.5,
                },
                Insight {
                    title: "B".into(),
                    description: "Another sufficiently long description.".into(),
                    category: "wild-guess".into(),
                    confidence: 0.5,
                },
                Insight {
                    title: "C".into(),
                    description: "too short".into(),
                    category: "fact".into(),
                    confidence: 0.5,
                },
            ],
            &mut stats,
        );
        assert_eq!(validated.len(), 2);
        assert_eq!(validated[0].category, "prediction");
        assert_eq!(validated[1].category, "observation");
        assert_eq!(stats.insights_dropped, 1);
    }

    #[test]
    fn duplicate_insight_titles_dedupe_case_insensitively() {
        let validator = DataValidator::default();
        let mut stats = ValidationStats::default();
        let insight = |title: &str| Insight {
            title: title.into(),
            description: "A sufficiently long description here.".into(),
            category: "fact".into(),
            confidence: 0.5,
        };
        let validated =
            validator.validate_insights(vec![insight("The Point"), insight("the point")], &mut stats);
        assert_eq!(validated.len(), 1);
    }

    #[test]
    fn quotes_dedupe_by_normalized_text() {
        let validator = DataValidator::default();
        let mut stats = ValidationStats::default();
        let quote = |text: &str| Quote {
            text: text.into(),
            speaker: String::new(),
            timestamp: 0.0,
            context: String::new(),
            confidence: 0.5,
        };
        let validated = validator.validate_quotes(
            vec![
                quote("The future is distributed"),
                quote("the future   is distributed"),
                quote("short"),
            ],
            &mut stats,
        );
        assert_eq!(validated.len(), 1);
        assert_eq!(stats.quotes_dropped, 2);
    }

    #[test]
    fn clamps() {
        assert_eq!(clamp_score(150.0), 100.0);
        assert_eq!(clamp_score(-1.0), 0.0);
        assert_eq!(clamp_ratio(f64::NAN), 0.0);
        assert_eq!(clamp_importance(11.0), 10.0);
    }
}
