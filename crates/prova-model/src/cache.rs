// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Content-addressed cache for generate calls.
//!
//! The fingerprint covers everything that determines a generation: model
//! identifier, the full message sequence, the canonical tool schemas, tool
//! choice, generate config, the epoch (when `per_epoch` is set) and any
//! scope labels.  Values are serialised [`ModelOutput`]s stored on disk and
//! fronted by a small in-memory LRU.
//!
//! Aliased model identifiers (e.g. a provider-side `latest` tag) invalidate
//! lazily: the fingerprint uses the identifier as given, so a re-pointed
//! alias keeps serving old entries until they expire.  Prefer versioned
//! model names when exact reproducibility matters.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::types::{ChatMessage, GenerateConfig, ModelOutput, ToolChoice, ToolInfo};

const MEMORY_ENTRIES: usize = 256;

/// What gets cached and for how long.
#[derive(Debug, Clone)]
pub struct CachePolicy {
    /// Entry lifetime.  `None` = never expires.
    pub expiry: Option<Duration>,
    /// Include the epoch in the fingerprint so each epoch generates fresh.
    pub per_epoch: bool,
    /// Free-form labels included in the fingerprint and recorded on each
    /// entry for selective invalidation.
    pub scopes: BTreeMap<String, String>,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            // One week: long enough to span a re-run, short enough that
            // stale provider behaviour ages out.
            expiry: Some(Duration::from_secs(7 * 24 * 3600)),
            per_epoch: false,
            scopes: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheRecord {
    created: DateTime<Utc>,
    expires: Option<DateTime<Utc>>,
    scopes: BTreeMap<String, String>,
    model: String,
    output: ModelOutput,
}

impl CacheRecord {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires, Some(e) if now > e)
    }
}

pub struct GenerateCache {
    dir: PathBuf,
    policy: CachePolicy,
    mem: Mutex<LruCache<String, CacheRecord>>,
}

impl GenerateCache {
    pub fn new(dir: impl Into<PathBuf>, policy: CachePolicy) -> Self {
        Self {
            dir: dir.into(),
            policy,
            mem: Mutex::new(LruCache::new(NonZeroUsize::new(MEMORY_ENTRIES).unwrap())),
        }
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    /// Stable fingerprint of one generate call.
    ///
    /// Message text is preserved verbatim (whitespace included); media parts
    /// are replaced by a digest of their payload so multi-megabyte images
    /// hash quickly and identically regardless of transport encoding.
    pub fn fingerprint(
        &self,
        model: &str,
        input: &[ChatMessage],
        tools: &[ToolInfo],
        tool_choice: &ToolChoice,
        config: &GenerateConfig,
        epoch: Option<usize>,
    ) -> String {
        let mut messages = serde_json::to_value(input).unwrap_or_default();
        digest_media_parts(&mut messages);
        let tools: Vec<serde_json::Value> = tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters.to_json_schema(),
                })
            })
            .collect();
        // serde_json maps are BTree-backed, so serialisation order is
        // canonical for identical structures.
        let key = serde_json::json!({
            "model": model,
            "messages": messages,
            "tools": tools,
            "tool_choice": tool_choice,
            "config": config,
            "epoch": if self.policy.per_epoch { epoch } else { None },
            "scopes": self.policy.scopes,
        });
        hex_digest(key.to_string().as_bytes())
    }

    pub fn get(&self, fingerprint: &str) -> Option<ModelOutput> {
        let now = Utc::now();
        if let Some(rec) = self.mem.lock().unwrap().get(fingerprint) {
            if !rec.is_expired(now) {
                return Some(rec.output.clone());
            }
        }
        let path = self.entry_path(fingerprint);
        let text = std::fs::read_to_string(&path).ok()?;
        let rec: CacheRecord = match serde_json::from_str(&text) {
            Ok(r) => r,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "dropping unreadable cache entry");
                let _ = std::fs::remove_file(&path);
                return None;
            }
        };
        if rec.is_expired(now) {
            debug!(fingerprint, "cache entry expired");
            let _ = std::fs::remove_file(&path);
            return None;
        }
        let output = rec.output.clone();
        self.mem.lock().unwrap().put(fingerprint.to_string(), rec);
        Some(output)
    }

    pub fn put(&self, fingerprint: &str, model: &str, output: &ModelOutput) {
        let created = Utc::now();
        let expires = self
            .policy
            .expiry
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| created + d);
        let rec = CacheRecord {
            created,
            expires,
            scopes: self.policy.scopes.clone(),
            model: model.to_string(),
            output: output.clone(),
        };
        let path = self.entry_path(fingerprint);
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!(error = %e, "cannot create cache directory; entry not persisted");
                return;
            }
        }
        // Write-then-rename so a crash mid-write never leaves a torn entry.
        let tmp = path.with_extension("tmp");
        match serde_json::to_string(&rec) {
            Ok(json) => {
                if std::fs::write(&tmp, json).is_ok() {
                    let _ = std::fs::rename(&tmp, &path);
                }
            }
            Err(e) => warn!(error = %e, "cannot serialise cache entry"),
        }
        self.mem.lock().unwrap().put(fingerprint.to_string(), rec);
    }

    /// Remove every persisted entry whose scope labels contain `key=value`.
    /// Returns the number of entries removed.
    pub fn invalidate_scope(&self, key: &str, value: &str) -> usize {
        self.mem.lock().unwrap().clear();
        let mut removed = 0;
        let Ok(shards) = std::fs::read_dir(&self.dir) else {
            return 0;
        };
        for shard in shards.flatten() {
            let Ok(entries) = std::fs::read_dir(shard.path()) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                let Ok(text) = std::fs::read_to_string(&path) else {
                    continue;
                };
                let Ok(rec) = serde_json::from_str::<CacheRecord>(&text) else {
                    continue;
                };
                if rec.scopes.get(key).map(String::as_str) == Some(value)
                    && std::fs::remove_file(&path).is_ok()
                {
                    removed += 1;
                }
            }
        }
        removed
    }

    fn entry_path(&self, fingerprint: &str) -> PathBuf {
        // Two-char shard directory keeps any single directory small.
        let shard = &fingerprint[..2.min(fingerprint.len())];
        self.dir.join(shard).join(format!("{fingerprint}.json"))
    }
}

fn hex_digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Replace media payloads in a serialised message tree with their digests.
fn digest_media_parts(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Array(items) => {
            for item in items {
                digest_media_parts(item);
            }
        }
        serde_json::Value::Object(map) => {
            for field in ["image", "audio", "video"] {
                if let Some(serde_json::Value::String(payload)) = map.get(field) {
                    let digest = hex_digest(payload.as_bytes());
                    map.insert(field.to_string(), serde_json::Value::String(digest));
                }
            }
            for (_, v) in map.iter_mut() {
                digest_media_parts(v);
            }
        }
        _ => {}
    }
}

/// Build a cache from config, or `None` when caching is not configured.
pub fn cache_from_config(cfg: &prova_config::CacheConfig) -> Option<GenerateCache> {
    let expiry_raw = cfg.expiry.as_deref()?;
    let expiry = if expiry_raw.eq_ignore_ascii_case("never") {
        None
    } else {
        match humantime::parse_duration(expiry_raw) {
            Ok(d) => Some(d),
            Err(e) => {
                warn!(value = %expiry_raw, error = %e, "invalid cache expiry; caching disabled");
                return None;
            }
        }
    };
    let policy = CachePolicy { expiry, ..CachePolicy::default() };
    Some(GenerateCache::new(cfg.resolved_dir(), policy))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
