// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::SandboxError;

/// Declaration of a sandbox a task (or a single sample) wants provisioned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxSpec {
    /// Name used by per-sample references and default selection.
    #[serde(default = "default_name")]
    pub name: String,
    /// Provider id, e.g. `"local"` or `"docker"`.
    pub provider: String,
    /// Provider-specific configuration: an image reference for `docker`,
    /// ignored by `local`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
    /// Marks this spec as the task default when none is named `default`.
    #[serde(default)]
    pub default: bool,
}

fn default_name() -> String {
    "default".into()
}

impl SandboxSpec {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            name: default_name(),
            provider: provider.into(),
            config: None,
            default: false,
        }
    }

    pub fn with_config(mut self, config: impl Into<String>) -> Self {
        self.config = Some(config.into());
        self
    }
}

/// Pick the sandbox a sample gets when it does not name one explicitly:
/// a spec named `default` wins, else one flagged default, else the first
/// declared.
pub fn select_default(specs: &[SandboxSpec]) -> Option<&SandboxSpec> {
    specs
        .iter()
        .find(|s| s.name == "default")
        .or_else(|| specs.iter().find(|s| s.default))
        .or_else(|| specs.first())
}

/// Content of one sample file staged into the sandbox before any solver runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FileSource {
    /// Inline UTF-8 text.
    Text(String),
    /// Inline binary, base64-encoded.
    Bytes { base64: String },
    /// External reference resolved from the host filesystem at staging time.
    Path { path: String },
}

impl FileSource {
    pub async fn resolve(&self) -> Result<Vec<u8>, SandboxError> {
        match self {
            Self::Text(t) => Ok(t.as_bytes().to_vec()),
            Self::Bytes { base64: b64 } => base64::engine::general_purpose::STANDARD
                .decode(b64)
                .map_err(|e| SandboxError::Other(format!("invalid base64 file content: {e}"))),
            Self::Path { path } => Ok(tokio::fs::read(path).await?),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn named(name: &str, default: bool) -> SandboxSpec {
        SandboxSpec {
            name: name.into(),
            provider: "local".into(),
            config: None,
            default,
        }
    }

    #[test]
    fn spec_named_default_wins() {
        let specs = vec![named("net", true), named("default", false)];
        assert_eq!(select_default(&specs).unwrap().name, "default");
    }

    #[test]
    fn flagged_default_wins_when_none_named_default() {
        let specs = vec![named("a", false), named("b", true)];
        assert_eq!(select_default(&specs).unwrap().name, "b");
    }

    #[test]
    fn first_declared_wins_as_last_resort() {
        let specs = vec![named("x", false), named("y", false)];
        assert_eq!(select_default(&specs).unwrap().name, "x");
    }

    #[test]
    fn no_specs_means_no_default() {
        assert!(select_default(&[]).is_none());
    }

    #[tokio::test]
    async fn text_source_resolves_to_utf8_bytes() {
        let src = FileSource::Text("hello".into());
        assert_eq!(src.resolve().await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn bytes_source_decodes_base64() {
        let src = FileSource::Bytes { base64: "aGk=".into() };
        assert_eq!(src.resolve().await.unwrap(), b"hi");
    }

    #[tokio::test]
    async fn invalid_base64_is_an_error() {
        let src = FileSource::Bytes { base64: "!!not-base64!!".into() };
        assert!(src.resolve().await.is_err());
    }

    #[tokio::test]
    async fn path_source_reads_host_file() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("data.txt");
        std::fs::write(&p, b"from disk").unwrap();
        let src = FileSource::Path { path: p.to_string_lossy().into_owned() };
        assert_eq!(src.resolve().await.unwrap(), b"from disk");
    }

    #[test]
    fn spec_serialisation_round_trips() {
        let spec = SandboxSpec::new("docker").with_config("debian:bookworm-slim");
        let json = serde_json::to_string(&spec).unwrap();
        let back: SandboxSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
    }
}
