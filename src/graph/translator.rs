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

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

use crate::graph::backend::Row;
use crate::graph::schemaless::SCHEMALESS_LABEL;

/// Fixed-schema node labels that the translator rewrites.
pub const FIXED_LABELS: &[&str] = &[
    "Entity", "Quote", "Segment", "Episode", "Podcast", "Insight", "Topic", "Speaker", "Audit",
];

lazy_static! {
    static ref LABEL_RE: Regex = Regex::new(
        r"\(\s*([A-Za-z_][A-Za-z0-9_]*)\s*:\s*(Entity|Quote|Segment|Episode|Podcast|Insight|Topic|Speaker|Audit)\b\s*(\{[^}]*\})?\s*\)"
    )
    .unwrap();
    static ref BARE_LABEL_RE: Regex = Regex::new(
        r":\s*(Entity|Quote|Segment|Episode|Podcast|Insight|Topic|Speaker|Audit)\b"
    )
    .unwrap();
}

/// Rewrites fixed-schema statements into schemaless form: node labels become
/// the generic label with a `_type` property filter.
pub struct QueryTranslator;

impl QueryTranslator {
    pub fn new() -> Self {
        Self
    }

    /// True when the statement references any fixed-schema label.
    pub fn is_fixed_schema_query(&self, statement: &str) -> bool {
        BARE_LABEL_RE.is_match(statement)
    }

    /// `MATCH (n:Entity {name: $name})` ->
    /// `MATCH (n:Node {_type: 'Entity', name: $name})`.
    pub fn translate_fixed_to_schemaless(&self, statement: &str) -> String {
        LABEL_RE
            .replace_all(statement, |caps: &regex::Captures<'_>| {
                let var = caps.get(1).unwrap().as_str();
                let label = caps.get(2).unwrap().as_str();
                match caps.get(3) {
                    Some(props) => {
                        let inner = props.as_str().trim_start_matches('{').trim_end_matches('}');
                        let inner = inner.trim();
                        if inner.is_empty() {
                            format!("({}:{} {{_type: '{}'}})", var, SCHEMALESS_LABEL, label)
                        } else {
                            format!(
                                "({}:{} {{_type: '{}', {}}})",
                                var, SCHEMALESS_LABEL, label, inner
                            )
                        }
                    }
                    None => format!("({}:{} {{_type: '{}'}})", var, SCHEMALESS_LABEL, label),
                }
            })
            .to_string()
    }
}

impl Default for QueryTranslator {
    fn default() -> Self {
        Self::new()
    }
}

/// Normalizes schemaless rows so callers observe the same shapes the fixed
/// schema produces: `_type` is surfaced as the label and removed from the
/// property map.
pub struct ResultStandardizer;

impl ResultStandardizer {
    pub fn new() -> Self {
        Self
    }

    /// A row needs standardization when its node object carries `_type`.
    pub fn needs_standardization(&self, rows: &[Row]) -> bool {
        rows.first()
            .map(|row| match row.get("n") {
                Some(Value::Object(node)) => node.contains_key("_type"),
                _ => row.contains_key("_type"),
            })
            .unwrap_or(false)
    }

    pub fn standardize_rows(&self, rows: Vec<Row>) -> Vec<Row> {
        rows.into_iter().map(|row| self.standardize_row(row)).collect()
    }

    fn standardize_row(&self, mut row: Row) -> Row {
        if let Some(Value::Object(node)) = row.get_mut("n") {
            if let Some(Value::String(label)) = node.remove("_type") {
                node.insert("_label".to_string(), Value::String(label));
            }
        } else if let Some(Value::String(label)) = row.remove("_type") {
            row.insert("_label".to_string(), Value::String(label));
        }
        row
    }
}

impl Default for ResultStandardizer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn detects_fixed_schema_statements() {
        let translator = QueryTranslator::new();
        assert!(translator.is_fixed_schema_query("MATCH (n:Entity) RETURN n"));
        assert!(translator.is_fixed_schema_query("MATCH (e:Episode {id: $id}) RETURN e"));
        assert!(!translator.is_fixed_schema_query("MATCH (n:Node {_type: 'Entity'}) RETURN n"));
    }

    #[test]
    fn translates_bare_label() {
        let translator = QueryTranslator::new();
        assert_eq!(
            translator.translate_fixed_to_schemaless("MATCH (n:Entity) RETURN n"),
            "MATCH (n:Node {_type: 'Entity'}) RETURN n"
        );
    }

    #[test]
    fn translates_label_with_properties() {
        let translator = QueryTranslator::new();
        assert_eq!(
            translator.translate_fixed_to_schemaless("MATCH (n:Entity {name: $name}) RETURN n"),
            "MATCH (n:Node {_type: 'Entity', name: $name}) RETURN n"
        );
    }

    #[test]
    fn standardizer_detects_and_rewrites_type_rows() {
        let standardizer = ResultStandardizer::new();
        let mut node = serde_json::Map::new();
        node.insert("_type".to_string(), json!("Entity"));
        node.insert("name".to_string(), json!("acme"));
        let mut row = Row::new();
        row.insert("n".to_string(), Value::Object(node));

        assert!(standardizer.needs_standardization(std::slice::from_ref(&row)));
        let standardized = standardizer.standardize_rows(vec![row]);
        assert_eq!(standardized[0]["n"]["_label"], json!("Entity"));
        assert!(standardized[0]["n"].get("_type").is_none());
    }

    #[test]
    fn fixed_rows_pass_untouched() {
        let standardizer = ResultStandardizer::new();
        let mut node = serde_json::Map::new();
        node.insert("name".to_string(), json!("acme"));
        let mut row = Row::new();
        row.insert("n".to_string(), Value::Object(node));

        assert!(!standardizer.needs_standardization(std::slice::from_ref(&row)));
    }
}
