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

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::path::PathBuf;

use crate::config::RateLimitTable;
use crate::error::{PipelineError, Result};

/// Error-text fragments that indicate a daily/total quota limit.
const QUOTA_PATTERNS: &[&str] = &[
    "quota",
    "resource has been exhausted",
    "resource_exhausted",
    "exceeded your current quota",
];

/// Error-text fragments that indicate a per-minute rate limit.
const RATE_LIMIT_PATTERNS: &[&str] = &["rate limit", "429", "too many requests"];

/// Consecutive unclassified failures before a key is parked in `Error`.
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    Available,
    RateLimited,
    QuotaExceeded,
    Error,
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyStatus::Available => write!(f, "available"),
            KeyStatus::RateLimited => write!(f, "rate_limited"),
            KeyStatus::QuotaExceeded => write!(f, "quota_exceeded"),
            KeyStatus::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ModelUsage {
    pub requests: u32,
    pub tokens: u64,
}

/// Per-key counters and status. Serialized verbatim into the key-state file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyState {
    pub index: usize,
    pub key_name: String,
    pub status: KeyStatus,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
    #[serde(default)]
    pub requests_today: u32,
    #[serde(default)]
    pub tokens_today: u64,
    #[serde(default)]
    pub requests_this_minute: u32,
    pub last_minute_reset: DateTime<Utc>,
    pub last_daily_reset: DateTime<Utc>,
    #[serde(default)]
    pub model_usage: HashMap<String, ModelUsage>,
}

impl ApiKeyState {
    pub fn new(index: usize, key_name: String) -> Self {
        let now = Utc::now();
        Self {
            index,
            key_name,
            status: KeyStatus::Available,
            consecutive_failures: 0,
            error_message: None,
            last_used: None,
            requests_today: 0,
            tokens_today: 0,
            requests_this_minute: 0,
            last_minute_reset: now,
            last_daily_reset: now,
            model_usage: HashMap::new(),
        }
    }

    pub fn is_usable(&self) -> bool {
        self.status == KeyStatus::Available
    }

    pub fn mark_success(&mut self) {
        self.status = KeyStatus::Available;
        self.consecutive_failures = 0;
        self.error_message = None;
        self.last_used = Some(Utc::now());
    }

    pub fn mark_failure(&mut self, error_text: &str) {
        self.consecutive_failures += 1;
        self.error_message = Some(error_text.to_string());
        self.last_used = Some(Utc::now());

        let lowered = error_text.to_lowercase();
        if QUOTA_PATTERNS.iter().any(|p| lowered.contains(p)) {
            self.status = KeyStatus::QuotaExceeded;
        } else if RATE_LIMIT_PATTERNS.iter().any(|p| lowered.contains(p)) {
            self.status = KeyStatus::RateLimited;
        } else if self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
            self.status = KeyStatus::Error;
        }
    }

    /// Roll the minute window when more than 60s have passed.
    fn reset_minute_if_elapsed(&mut self, now: DateTime<Utc>) {
        if (now - self.last_minute_reset).num_seconds() > 60 {
            self.requests_this_minute = 0;
            self.last_minute_reset = now;
        }
    }

    /// Roll daily counters when the wall-clock day has advanced. Also clears
    /// rate-limit and quota parking so keys get a fresh chance each day.
    fn reset_daily_if_new_day(&mut self, now: DateTime<Utc>) {
        if now.date_naive() > self.last_daily_reset.date_naive() {
            self.requests_today = 0;
            self.tokens_today = 0;
            self.requests_this_minute = 0;
            self.model_usage.clear();
            self.last_daily_reset = now;
            self.last_minute_reset = now;
            if matches!(self.status, KeyStatus::RateLimited | KeyStatus::QuotaExceeded) {
                self.status = KeyStatus::Available;
                self.consecutive_failures = 0;
                self.error_message = None;
            }
        }
    }
}

/// On-disk key-state document, atomically replaced on every transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct KeyStateFile {
    current_index: usize,
    last_reset: String,
    key_states: Vec<ApiKeyState>,
}

struct ManagerState {
    current_index: usize,
    states: Vec<ApiKeyState>,
}

/// Quota-aware round-robin selection across the configured API keys. The
/// state table is guarded by a single mutex; every public operation takes it
/// for a short critical section and persists on mutation.
pub struct KeyRotationManager {
    keys: Vec<String>,
    state: Mutex<ManagerState>,
    state_path: PathBuf,
    rate_limits: RateLimitTable,
}

impl KeyRotationManager {
    pub fn new(keys: Vec<String>, state_path: PathBuf, rate_limits: RateLimitTable) -> Result<Self> {
        if keys.is_empty() {
            return Err(PipelineError::Config("key rotation requires at least one API key".into()));
        }

        let mut states: Vec<ApiKeyState> = keys
            .iter()
            .enumerate()
            .map(|(i, key)| ApiKeyState::new(i, mask_key(i, key)))
            .collect();
        let mut current_index = 0;

        if state_path.exists() {
            match Self::load_state_file(&state_path) {
                Ok(file) if file.key_states.len() == keys.len() => {
                    states = file.key_states;
                    current_index = file.current_index.min(keys.len() - 1);
                    tracing::info!(
                        "Loaded key state for {} keys (last reset {})",
                        states.len(),
                        file.last_reset
                    );
                }
                Ok(file) => {
                    tracing::warn!(
                        "Key state file has {} keys but {} are configured, starting fresh",
                        file.key_states.len(),
                        keys.len()
                    );
                }
                Err(e) => {
                    tracing::warn!("Failed to load key state, starting fresh: {}", e);
                }
            }
        }

        // Run the daily reset before the first selection when the persisted
        // state predates today.
        let now = Utc::now();
        for state in &mut states {
            state.reset_daily_if_new_day(now);
        }

        let manager = Self {
            keys,
            state: Mutex::new(ManagerState { current_index, states }),
            state_path,
            rate_limits,
        };
        manager.persist(&manager.state.lock())?;
        Ok(manager)
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    /// Select the next usable key for `model` in round-robin order. Returns
    /// `NoKeyAvailable` without blocking when every key is ineligible.
    pub fn get_next_key(&self, model: &str) -> Result<(String, usize)> {
        self.select_key(model, None)
    }

    /// Like `get_next_key`, but also requires daily token headroom for a call
    /// expected to consume `tokens_needed` tokens.
    pub fn get_available_key_for_quota(&self, model: &str, tokens_needed: u64) -> Result<(String, usize)> {
        self.select_key(model, Some(tokens_needed))
    }

    fn select_key(&self, model: &str, tokens_needed: Option<u64>) -> Result<(String, usize)> {
        let limits = self.rate_limits.limits_for(model);
        let now = Utc::now();
        let mut guard = self.state.lock();
        let key_count = self.keys.len();
        let start = guard.current_index;

        for offset in 0..key_count {
            let idx = (start + offset) % key_count;
            let state = &mut guard.states[idx];
            state.reset_daily_if_new_day(now);
            state.reset_minute_if_elapsed(now);

            if !state.is_usable() {
                continue;
            }
            if limits.rpm > 0 && state.requests_this_minute >= limits.rpm {
                continue;
            }
            if limits.rpd > 0 && state.requests_today >= limits.rpd {
                continue;
            }
            if let Some(needed) = tokens_needed {
                if limits.tpd > 0 && state.tokens_today + needed > limits.tpd {
                    continue;
                }
            }

            guard.current_index = (idx + 1) % key_count;
            self.persist(&guard)?;
            return Ok((self.keys[idx].clone(), idx));
        }

        tracing::warn!("No API key available for model '{}'", model);
        Err(PipelineError::NoKeyAvailable { model: model.to_string() })
    }

    pub fn mark_key_success(&self, index: usize) -> Result<()> {
        let mut guard = self.state.lock();
        let state = guard
            .states
            .get_mut(index)
            .ok_or_else(|| PipelineError::Invariant(format!("key index {} out of range", index)))?;
        state.mark_success();
        self.persist(&guard)
    }

    pub fn mark_key_failure(&self, index: usize, error_text: &str) -> Result<()> {
        let mut guard = self.state.lock();
        let state = guard
            .states
            .get_mut(index)
            .ok_or_else(|| PipelineError::Invariant(format!("key index {} out of range", index)))?;
        state.mark_failure(error_text);
        tracing::warn!(
            "Key {} marked {} after failure: {}",
            state.key_name,
            state.status,
            error_text
        );
        self.persist(&guard)
    }

    /// Record usage after a completed call: minute, day, and per-model counters.
    pub fn update_key_usage(&self, index: usize, tokens_used: u64, model: &str) -> Result<()> {
        let now = Utc::now();
        let mut guard = self.state.lock();
        let state = guard
            .states
            .get_mut(index)
            .ok_or_else(|| PipelineError::Invariant(format!("key index {} out of range", index)))?;

        state.reset_daily_if_new_day(now);
        state.reset_minute_if_elapsed(now);
        state.requests_this_minute += 1;
        state.requests_today += 1;
        state.tokens_today += tokens_used;

        let usage = state.model_usage.entry(model.to_string()).or_default();
        usage.requests += 1;
        usage.tokens += tokens_used;

        self.persist(&guard)
    }

    /// Snapshot of all key states for status reporting.
    pub fn snapshot(&self) -> Vec<ApiKeyState> {
        self.state.lock().states.clone()
    }

    /// Write the state file atomically: temp file in the same directory,
    /// fsync, rename over the final path.
    fn persist(&self, guard: &ManagerState) -> Result<()> {
        let file = KeyStateFile {
            current_index: guard.current_index,
            last_reset: Utc::now().format("%Y-%m-%d").to_string(),
            key_states: guard.states.clone(),
        };

        let raw = serde_json::to_vec_pretty(&file)?;
        let tmp_path = self.state_path.with_extension("json.tmp");

        if let Some(parent) = self.state_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut tmp = std::fs::File::create(&tmp_path)?;
        tmp.write_all(&raw)?;
        tmp.sync_all()?;
        drop(tmp);

        std::fs::rename(&tmp_path, &self.state_path)?;
        Ok(())
    }

    fn load_state_file(path: &PathBuf) -> Result<KeyStateFile> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Masked display name: "key_1 (abcd...)". Never log a full key.
pub fn mask_key(index: usize, key: &str) -> String {
    let prefix: String = key.chars().take(4).collect();
    format!("key_{} ({}...)", index + 1, prefix)
}
