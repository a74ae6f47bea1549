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
use unicode_normalization::UnicodeNormalization;

lazy_static! {
    static ref URL_RE: Regex = Regex::new(
        r"https?://(?:www\.)?[-a-zA-Z0-9@:%._\+~#=]{1,256}\.[a-zA-Z0-9()]{1,6}\b(?:[-a-zA-Z0-9()@:%_\+.~#?&/=]*)"
    )
    .unwrap();
    static ref WHITESPACE_RE: Regex = Regex::new(r"\s+").unwrap();
    static ref NON_NAME_RE: Regex = Regex::new(r"[^\w\s'-]").unwrap();
    static ref SENTENCE_SPLIT_RE: Regex = Regex::new(r"(?:[.!?])\s+").unwrap();
    // Phrases that make a sentence worth quoting.
    static ref QUOTABLE_RES: Vec<Regex> = vec![
        Regex::new(r"(?i)\b(?:the key|the secret|the most important|the main)\b").unwrap(),
        Regex::new(r"(?i)\b(?:always|never|every|all|none|nothing|everything)\b").unwrap(),
        Regex::new(r"(?i)\b(?:success|failure|mistake|lesson|achievement)\b").unwrap(),
        Regex::new(r"(?i)\b(?:believe|think|know|realize|understand|feel)\b").unwrap(),
        Regex::new(r"(?i)\b(?:if you|when you|you should|you must|you need to|you can)\b").unwrap(),
        Regex::new(r"(?i)\b(?:changed my|transformed|revolutionized|disrupted)\b").unwrap(),
        Regex::new(r#""[^"]{10,200}""#).unwrap(),
        Regex::new(r"(?i)\b(?:what I learned|the insight|I realized|it turns out)\b").unwrap(),
    ];
}

/// Corporate suffixes stripped from normalized entity names so "Acme" and
/// "Acme Inc." dedupe to the same key.
const CORPORATE_SUFFIXES: &[&str] = &[
    "inc",
    "incorporated",
    "corp",
    "corporation",
    "ltd",
    "limited",
    "llc",
    "co",
    "company",
];

/// Normalize an entity name for use as a deduplication key. The stored node
/// keeps the original surface form; only comparisons use this.
pub fn normalize_entity_name(name: &str) -> String {
    if name.is_empty() {
        return String::new();
    }

    let lowered = name.to_lowercase();

    // Strip combining marks after NFD decomposition to drop accents.
    let stripped: String = lowered
        .nfd()
        .filter(|c| !unicode_normalization::char::is_combining_mark(*c))
        .collect();

    let cleaned = NON_NAME_RE.replace_all(&stripped, "");
    let collapsed = WHITESPACE_RE.replace_all(cleaned.trim(), " ").to_string();

    let mut words: Vec<&str> = collapsed.split(' ').filter(|w| !w.is_empty()).collect();
    while let Some(last) = words.last() {
        let bare = last.trim_end_matches('.');
        if words.len() > 1 && CORPORATE_SUFFIXES.contains(&bare) {
            words.pop();
        } else {
            break;
        }
    }

    words.join(" ")
}

/// Similarity between two names in [0, 1]. Exact normalized match is 1.0,
/// containment scores at least 0.8, otherwise a character-level ratio.
pub fn name_similarity(name1: &str, name2: &str) -> f64 {
    if name1.is_empty() || name2.is_empty() {
        return 0.0;
    }

    let norm1 = normalize_entity_name(name1);
    let norm2 = normalize_entity_name(name2);

    if norm1 == norm2 {
        return 1.0;
    }

    let mut score = sequence_ratio(&norm1, &norm2);

    if norm1.contains(&norm2) || norm2.contains(&norm1) {
        score = score.max(0.8);
    }

    let words1: std::collections::HashSet<&str> = norm1.split(' ').collect();
    let words2: std::collections::HashSet<&str> = norm2.split(' ').collect();
    let shared = words1.intersection(&words2).count();
    if shared > 0 {
        let word_score = shared as f64 / words1.len().max(words2.len()) as f64;
        score = score.max(word_score * 0.9);
    }

    score
}

/// Character-level similarity ratio: 2 * LCS / (len1 + len2).
fn sequence_ratio(a: &str, b: &str) -> f64 {
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();
    if a_chars.is_empty() || b_chars.is_empty() {
        return 0.0;
    }

    let mut prev = vec![0usize; b_chars.len() + 1];
    let mut curr = vec![0usize; b_chars.len() + 1];
    for i in 1..=a_chars.len() {
        for j in 1..=b_chars.len() {
            curr[j] = if a_chars[i - 1] == b_chars[j - 1] {
                prev[j - 1] + 1
            } else {
                prev[j].max(curr[j - 1])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    let lcs = prev[b_chars.len()];
    2.0 * lcs as f64 / (a_chars.len() + b_chars.len()) as f64
}

/// Split text into sentences, filtering fragments of 2 chars or less.
pub fn split_into_sentences(text: &str) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }

    SENTENCE_SPLIT_RE
        .split(text)
        .map(|s| s.trim().trim_end_matches(['.', '!', '?']).trim().to_string())
        .filter(|s| s.len() > 2)
        .collect()
}

pub fn extract_urls(text: &str) -> Vec<String> {
    URL_RE.find_iter(text).map(|m| m.as_str().to_string()).collect()
}

/// Truncate to `max_length`, preserving word boundaries where possible.
pub fn truncate_text(text: &str, max_length: usize, suffix: &str) -> String {
    if text.chars().count() <= max_length {
        return text.to_string();
    }

    let budget = max_length.saturating_sub(suffix.chars().count());
    let hard_cut: String = text.chars().take(budget).collect();
    match hard_cut.rfind(' ') {
        Some(idx) => format!("{}{}", &hard_cut[..idx], suffix),
        None => format!("{}{}", hard_cut, suffix),
    }
}

/// Quotability score in [0, 1]: how many quotable patterns the text hits,
/// where 30% of the pattern set already counts as highly quotable.
pub fn quotability_score(text: &str) -> f64 {
    if text.is_empty() {
        return 0.0;
    }

    let matches = QUOTABLE_RES.iter().filter(|re| re.is_match(text)).count();
    let max_possible = QUOTABLE_RES.len() as f64;
    (matches as f64 / (max_possible * 0.3).max(1.0)).min(1.0)
}

/// Wrap text to a width, preserving word boundaries. Used for NOTE blocks.
pub fn wrap_text(text: &str, width: usize) -> Vec<String> {
    if text.len() <= width {
        return vec![text.to_string()];
    }

    let mut lines = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut current_len = 0usize;

    for word in text.split_whitespace() {
        if current_len + word.len() + current.len() > width && !current.is_empty() {
            lines.push(current.join(" "));
            current_len = word.len();
            current = vec![word];
        } else {
            current_len += word.len();
            current.push(word);
        }
    }

    if !current.is_empty() {
        lines.push(current.join(" "));
    }

    lines
}
