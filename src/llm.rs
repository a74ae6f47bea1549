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
use lazy_static::lazy_static;
use parking_lot::Mutex;
use regex::Regex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{PipelineError, Result};
use crate::key_rotation::KeyRotationManager;
use crate::retry::{CircuitBreaker, RateLimiter};

lazy_static! {
    static ref PROPER_NOUN_RE: Regex =
        Regex::new(r"\b[A-Z][a-z]+(?:\s+[A-Z][a-z]+)*\b").unwrap();
    static ref QUOTED_RE: Regex = Regex::new(r#""([^"]{10,200})""#).unwrap();
    static ref LABELS_LINE_RE: Regex = Regex::new(r"(?m)^Speaker Labels Found:\s*(.+)$").unwrap();
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub prompt: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Name of a provider-side cached content entry to reference instead of
    /// resending the transcript.
    pub cached_content: Option<String>,
    pub system_instruction: Option<String>,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: model.into(),
            max_tokens: 4096,
            temperature: 0.2,
            cached_content: None,
            system_instruction: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CompletionResponse {
    pub text: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl CompletionResponse {
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Contract with the LLM collaborator. The Gemini client is the default
/// implementation; the mock is chosen by configuration for tests and dry runs.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    fn supports_caching(&self) -> bool {
        false
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse>;

    async fn create_cached_content(
        &self,
        _content: &str,
        _episode_id: &str,
        _system_instruction: &str,
        _ttl: Duration,
    ) -> Result<String> {
        Err(PipelineError::Config(format!(
            "provider '{}' does not support cached content",
            self.name()
        )))
    }

    async fn delete_cached_content(&self, _cache_name: &str) -> Result<()> {
        Ok(())
    }
}

/// Rough token estimate used for quota-aware key selection.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64 / 4).max(1)
}

/// Gemini client: one HTTP call per completion, pulling a fresh key from the
/// rotation manager and rotating on rate-limit/quota errors until the manager
/// reports every key exhausted.
pub struct GeminiClient {
    client: reqwest::Client,
    key_manager: Arc<KeyRotationManager>,
    base_url: String,
    /// Shared bucket governing call pacing across all workers.
    limiter: RateLimiter,
    /// Trips on consecutive transport failures, not on rate limits.
    breaker: CircuitBreaker,
}

impl GeminiClient {
    pub fn new(key_manager: Arc<KeyRotationManager>) -> Self {
        Self::with_base_url(key_manager, "https://generativelanguage.googleapis.com".to_string())
    }

    /// Base URL override, used by the HTTP mock in tests.
    pub fn with_base_url(key_manager: Arc<KeyRotationManager>, base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            key_manager,
            base_url,
            limiter: RateLimiter::new(2.0, 4),
            breaker: CircuitBreaker::new("gemini", 5, Duration::from_secs(60)),
        }
    }

    async fn complete_with_key(
        &self,
        request: &CompletionRequest,
        api_key: &str,
    ) -> Result<CompletionResponse> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.base_url, request.model, api_key
        );

        let mut body = json!({
            "contents": [{ "parts": [{ "text": request.prompt }] }],
            "generationConfig": {
                "maxOutputTokens": request.max_tokens,
                "temperature": request.temperature,
            }
        });
        if let Some(cache_name) = &request.cached_content {
            body["cachedContent"] = json!(cache_name);
        }
        if let Some(instruction) = &request.system_instruction {
            body["systemInstruction"] = json!({ "parts": [{ "text": instruction }] });
        }

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::Transient(format!("gemini request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_else(|_| "unknown error".to_string());
            return Err(classify_http_error(status.as_u16(), &text));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| PipelineError::MalformedResponse(format!("gemini response: {}", e)))?;

        let text = payload
            .get("candidates")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("content"))
            .and_then(|c| c.get("parts"))
            .and_then(|p| p.get(0))
            .and_then(|p| p.get("text"))
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .to_string();

        let prompt_tokens = payload
            .pointer("/usageMetadata/promptTokenCount")
            .and_then(|v| v.as_u64())
            .unwrap_or_else(|| estimate_tokens(&request.prompt));
        let completion_tokens = payload
            .pointer("/usageMetadata/candidatesTokenCount")
            .and_then(|v| v.as_u64())
            .unwrap_or_else(|| estimate_tokens(&text));

        Ok(CompletionResponse {
            text,
            prompt_tokens,
            completion_tokens,
        })
    }
}

/// Map an HTTP failure onto the error taxonomy using status and body text.
pub fn classify_http_error(status: u16, body: &str) -> PipelineError {
    let lowered = body.to_lowercase();
    if lowered.contains("quota") || lowered.contains("resource_exhausted") {
        return PipelineError::QuotaExceeded(truncate_error(body));
    }
    match status {
        429 => PipelineError::RateLimited(truncate_error(body)),
        500..=599 => PipelineError::Transient(format!("server error {}: {}", status, truncate_error(body))),
        _ => PipelineError::Transient(format!("http {}: {}", status, truncate_error(body))),
    }
}

fn truncate_error(body: &str) -> String {
    let mut text: String = body.chars().take(300).collect();
    if body.len() > 300 {
        text.push_str("...");
    }
    text
}

#[async_trait]
impl LlmProvider for GeminiClient {
    fn name(&self) -> &str {
        "gemini"
    }

    fn supports_caching(&self) -> bool {
        true
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        self.breaker.check()?;
        let tokens_needed = estimate_tokens(&request.prompt);
        let mut last_err: Option<PipelineError> = None;

        // One pass over the key ring; the manager itself reports exhaustion.
        for _ in 0..self.key_manager.key_count() {
            let (api_key, key_index) = self
                .key_manager
                .get_available_key_for_quota(&request.model, tokens_needed)?;

            let waited = self.limiter.acquire(1).await;
            if waited > Duration::from_millis(100) {
                tracing::debug!("Rate limited, waited {:.2}s", waited.as_secs_f64());
            }

            match self.complete_with_key(&request, &api_key).await {
                Ok(response) => {
                    self.breaker.on_success();
                    self.key_manager.mark_key_success(key_index)?;
                    self.key_manager
                        .update_key_usage(key_index, response.total_tokens(), &request.model)?;
                    return Ok(response);
                }
                Err(err @ (PipelineError::RateLimited(_) | PipelineError::QuotaExceeded(_))) => {
                    self.key_manager.mark_key_failure(key_index, &err.to_string())?;
                    tracing::warn!("Key {} hit a limit, rotating: {}", key_index, err);
                    last_err = Some(err);
                }
                Err(err) => {
                    self.breaker.on_failure();
                    self.key_manager.mark_key_failure(key_index, &err.to_string())?;
                    return Err(err);
                }
            }
        }

        Err(last_err.unwrap_or(PipelineError::NoKeyAvailable {
            model: request.model.clone(),
        }))
    }

    async fn create_cached_content(
        &self,
        content: &str,
        episode_id: &str,
        system_instruction: &str,
        ttl: Duration,
    ) -> Result<String> {
        let model = "gemini-2.0-flash";
        let (api_key, key_index) = self
            .key_manager
            .get_available_key_for_quota(model, estimate_tokens(content))?;

        let url = format!("{}/v1beta/cachedContents?key={}", self.base_url, api_key);
        let body = json!({
            "model": format!("models/{}", model),
            "displayName": episode_id,
            "contents": [{ "role": "user", "parts": [{ "text": content }] }],
            "systemInstruction": { "parts": [{ "text": system_instruction }] },
            "ttl": format!("{}s", ttl.as_secs()),
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::Transient(format!("cache create failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let err = classify_http_error(status.as_u16(), &text);
            self.key_manager.mark_key_failure(key_index, &err.to_string())?;
            return Err(err);
        }

        self.key_manager.mark_key_success(key_index)?;
        let payload: Value = response
            .json()
            .await
            .map_err(|e| PipelineError::MalformedResponse(format!("cache response: {}", e)))?;
        payload
            .get("name")
            .and_then(|n| n.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| PipelineError::MalformedResponse("cache response missing name".into()))
    }

    async fn delete_cached_content(&self, cache_name: &str) -> Result<()> {
        let (api_key, _) = self.key_manager.get_next_key("gemini-2.0-flash")?;
        let url = format!("{}/v1beta/{}?key={}", self.base_url, cache_name, api_key);
        let _ = self.client.delete(&url).send().await;
        Ok(())
    }
}

/// Deterministic mock provider: fabricates plausible structured responses
/// from the prompt itself. Canned responses can be injected per marker.
pub struct MockLlm {
    canned: Mutex<HashMap<String, String>>,
    call_count: AtomicU64,
    fail_with: Mutex<Option<String>>,
}

impl Default for MockLlm {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLlm {
    pub fn new() -> Self {
        Self {
            canned: Mutex::new(HashMap::new()),
            call_count: AtomicU64::new(0),
            fail_with: Mutex::new(None),
        }
    }

    /// Respond with `response` whenever the prompt contains `marker`.
    pub fn with_canned(self, marker: impl Into<String>, response: impl Into<String>) -> Self {
        self.canned.lock().insert(marker.into(), response.into());
        self
    }

    /// Make every call fail with the given error text (for rotation tests).
    pub fn fail_with(&self, error_text: impl Into<String>) {
        *self.fail_with.lock() = Some(error_text.into());
    }

    pub fn clear_failure(&self) {
        *self.fail_with.lock() = None;
    }

    pub fn calls(&self) -> u64 {
        self.call_count.load(Ordering::SeqCst)
    }

    fn fabricate(&self, prompt: &str) -> String {
        // Only fabricate from the text under analysis, not the instructions.
        let subject = prompt.rsplit_once("Text:").map(|(_, t)| t).unwrap_or(prompt);

        if prompt.contains("Extract the named entities") {
            let mut seen = Vec::new();
            for m in PROPER_NOUN_RE.find_iter(subject) {
                let name = m.as_str().to_string();
                if name.len() >= 4 && !seen.contains(&name) {
                    seen.push(name);
                }
                if seen.len() >= 5 {
                    break;
                }
            }
            let entities: Vec<Value> = seen
                .iter()
                .map(|name| {
                    json!({
                        "name": name,
                        "type": if name.contains(' ') { "Person" } else { "Concept" },
                        "confidence": 0.9,
                        "importance": 5
                    })
                })
                .collect();
            serde_json::to_string(&entities).unwrap()
        } else if prompt.contains("Extract relationships") {
            "[]".to_string()
        } else if prompt.contains("Extract notable quotes") {
            let quotes: Vec<Value> = QUOTED_RE
                .captures_iter(subject)
                .take(3)
                .map(|c| {
                    json!({
                        "text": c.get(1).unwrap().as_str(),
                        "speaker": "",
                        "context": "",
                        "confidence": 0.8
                    })
                })
                .collect();
            serde_json::to_string(&quotes).unwrap()
        } else if prompt.contains("Extract key insights") {
            serde_json::to_string(&json!([{
                "title": "Recurring discussion theme",
                "description": "The conversation repeatedly returns to one central topic across speakers.",
                "category": "observation",
                "confidence": 0.7
            }]))
            .unwrap()
        } else if prompt.contains("identify the speakers") {
            let names = ["Alex Rivera (Host)", "Jordan Lee (Guest)", "Sam Carter (Co-host)"];
            let mut mapping = serde_json::Map::new();
            if let Some(caps) = LABELS_LINE_RE.captures(prompt) {
                for (i, label) in caps[1].split(',').map(|s| s.trim()).enumerate() {
                    if !label.is_empty() {
                        mapping.insert(
                            label.to_string(),
                            json!(names[i % names.len()]),
                        );
                    }
                }
            }
            serde_json::to_string(&Value::Object(mapping)).unwrap()
        } else {
            "[]".to_string()
        }
    }
}

#[async_trait]
impl LlmProvider for MockLlm {
    fn name(&self) -> &str {
        "mock"
    }

    fn supports_caching(&self) -> bool {
        true
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        self.call_count.fetch_add(1, Ordering::SeqCst);

        if let Some(error_text) = self.fail_with.lock().clone() {
            return Err(classify_http_error(429, &error_text));
        }

        let canned = {
            let canned = self.canned.lock();
            canned
                .iter()
                .find(|(marker, _)| request.prompt.contains(marker.as_str()))
                .map(|(_, response)| response.clone())
        };

        let text = canned.unwrap_or_else(|| self.fabricate(&request.prompt));
        Ok(CompletionResponse {
            prompt_tokens: estimate_tokens(&request.prompt),
            completion_tokens: estimate_tokens(&text),
            text,
        })
    }

    async fn create_cached_content(
        &self,
        _content: &str,
        episode_id: &str,
        _system_instruction: &str,
        _ttl: Duration,
    ) -> Result<String> {
        Ok(format!("cachedContents/mock-{}", episode_id))
    }
}

struct CacheEntry {
    cache_name: String,
    created: Instant,
    ttl: Duration,
    content_bytes: usize,
}

#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub attempts: u64,
    pub bytes_cached: usize,
}

/// Episode-scoped prompt-cache registry with TTL expiry. Expired entries are
/// dropped on lookup so the next request transparently recreates the cache.
pub struct CacheManager {
    entries: Mutex<HashMap<String, CacheEntry>>,
    hits: AtomicU64,
    attempts: AtomicU64,
    min_content_size: usize,
}

impl CacheManager {
    pub fn new(min_content_size: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            attempts: AtomicU64::new(0),
            min_content_size,
        }
    }

    pub fn should_cache(&self, content: &str) -> bool {
        content.len() >= self.min_content_size
    }

    pub fn register_episode_cache(
        &self,
        episode_id: &str,
        cache_name: String,
        content_bytes: usize,
        ttl: Duration,
    ) {
        self.entries.lock().insert(
            episode_id.to_string(),
            CacheEntry {
                cache_name,
                created: Instant::now(),
                ttl,
                content_bytes,
            },
        );
    }

    /// Look up a live cache entry for the episode. Records hit/attempt
    /// counters and evicts the entry when its TTL has lapsed.
    pub fn get_cache(&self, episode_id: &str) -> Option<String> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let mut entries = self.entries.lock();
        match entries.get(episode_id) {
            Some(entry) if entry.created.elapsed() < entry.ttl => {
                self.hits.fetch_add(1, Ordering::SeqCst);
                Some(entry.cache_name.clone())
            }
            Some(_) => {
                tracing::debug!("Cache for episode {} expired", episode_id);
                entries.remove(episode_id);
                None
            }
            None => None,
        }
    }

    pub fn remove(&self, episode_id: &str) -> Option<String> {
        self.entries.lock().remove(episode_id).map(|e| e.cache_name)
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.lock();
        CacheStats {
            entries: entries.len(),
            hits: self.hits.load(Ordering::SeqCst),
            attempts: self.attempts.load(Ordering::SeqCst),
            bytes_cached: entries.values().map(|e| e.content_bytes).sum(),
        }
    }
}
