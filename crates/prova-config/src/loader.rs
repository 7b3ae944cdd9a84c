// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::Config;

/// Ordered list of config file locations searched from lowest to highest priority.
/// Later files override earlier ones.
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // 1. System-wide default
    paths.push(PathBuf::from("/etc/prova/config.yaml"));
    paths.push(PathBuf::from("/etc/prova/config.yml"));

    // 2. XDG / home
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/prova/config.yaml"));
        paths.push(home.join(".config/prova/config.yml"));
    }
    if let Some(cfg) = dirs::config_dir() {
        paths.push(cfg.join("prova/config.yaml"));
        paths.push(cfg.join("prova/config.yml"));
    }

    // 3. Workspace-local
    paths.push(PathBuf::from(".prova/config.yaml"));
    paths.push(PathBuf::from(".prova/config.yml"));
    paths.push(PathBuf::from(".prova.yaml"));
    paths.push(PathBuf::from(".prova.yml"));
    paths.push(PathBuf::from("prova.yaml"));
    paths.push(PathBuf::from("prova.yml"));

    paths
}

/// Load configuration by merging all discovered YAML files, then applying
/// `PROVA_*` environment overrides.  The `extra` argument may provide an
/// explicit path (e.g. `--config` CLI flag).
pub fn load(extra: Option<&Path>) -> anyhow::Result<Config> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in config_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let layer: serde_yaml::Value = serde_yaml::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            merge_yaml(&mut merged, layer);
        }
    }

    if let Some(p) = extra {
        debug!(path = %p.display(), "loading explicit config");
        let text =
            std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
        let layer: serde_yaml::Value =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", p.display()))?;
        merge_yaml(&mut merged, layer);
    }

    // Deserialize the merged YAML value into Config, falling back to defaults
    // when the merged value is empty (no config files found).
    let mut config: Config = if matches!(merged, serde_yaml::Value::Mapping(ref m) if m.is_empty())
    {
        Config::default()
    } else {
        serde_yaml::from_value(merged).unwrap_or_default()
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Environment variables recognised by the engine.  Each overrides the
/// corresponding config field when set; invalid values are ignored with a
/// warning so a stray variable never prevents startup.
pub fn apply_env_overrides(config: &mut Config) {
    if let Some(v) = env_parse::<usize>("PROVA_MAX_CONNECTIONS") {
        config.model.max_connections = Some(v);
    }
    if let Some(v) = env_parse::<usize>("PROVA_MAX_SAMPLES") {
        config.eval.max_samples = Some(v);
    }
    if let Some(v) = env_parse::<usize>("PROVA_MAX_SANDBOXES") {
        config.eval.max_sandboxes = Some(v);
    }
    if let Some(v) = env_parse::<usize>("PROVA_MAX_SUBPROCESSES") {
        config.eval.max_subprocesses = Some(v);
    }
    if let Ok(v) = std::env::var("PROVA_LOG_DIR") {
        if !v.is_empty() {
            config.log.dir = Some(v);
        }
    }
    if let Ok(v) = std::env::var("PROVA_LOG_LEVEL") {
        if !v.is_empty() {
            config.log.level = Some(v);
        }
    }
    if let Ok(v) = std::env::var("PROVA_LOG_LEVEL_TRANSCRIPT") {
        if !v.is_empty() {
            config.log.transcript_level = Some(v);
        }
    }
    if let Ok(v) = std::env::var("PROVA_CACHE_DIR") {
        if !v.is_empty() {
            config.cache.dir = Some(v);
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}

/// Deep-merge `src` into `dst`; src wins on scalar conflicts.
fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(d), serde_yaml::Value::Mapping(s)) => {
            for (k, v) in s {
                let entry = d
                    .entry(k)
                    .or_insert(serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
                merge_yaml(entry, v);
            }
        }
        (dst, src) => *dst = src,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
