// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Sandbox pool: the single place environments are acquired and released.
//!
//! The pool owns container concurrency (`max_sandboxes`) through a counting
//! semaphore, so samples that need a sandbox queue here without holding a
//! model connection.  Acquisition is slot → provision → stage files → run
//! setup; a failure at any step releases the slot.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::{
    error::SandboxError,
    provider::{ExecParams, SandboxEnvironment, SandboxRegistry},
    spec::{FileSource, SandboxSpec},
};

const SETUP_TIMEOUT: Duration = Duration::from_secs(300);

pub struct SandboxPool {
    registry: Arc<SandboxRegistry>,
    slots: Option<Arc<Semaphore>>,
    preserve: bool,
}

/// A held sandbox: the environment plus the concurrency slot backing it.
/// Call [`SandboxLease::release`] when the sample finishes; dropping the
/// lease without releasing frees the slot but skips teardown.
pub struct SandboxLease {
    pub env: Arc<dyn SandboxEnvironment>,
    _permit: Option<OwnedSemaphorePermit>,
    preserve: bool,
}

impl SandboxLease {
    pub async fn release(self) {
        if self.preserve {
            if let Some(conn) = self.env.connection().await {
                debug!(connect = %conn.command, "sandbox preserved for inspection");
            }
            return;
        }
        if let Err(e) = self.env.teardown().await {
            warn!(error = %e, "sandbox teardown failed");
        }
    }
}

impl SandboxPool {
    pub fn new(
        registry: Arc<SandboxRegistry>,
        max_sandboxes: Option<usize>,
        preserve: bool,
    ) -> Self {
        Self {
            registry,
            slots: max_sandboxes.map(|n| Arc::new(Semaphore::new(n.max(1)))),
            preserve,
        }
    }

    /// Acquire an environment for one sample.
    ///
    /// Returns the lease plus the time spent queueing for a slot, which the
    /// caller reports to the limit tracker as non-working time.
    pub async fn acquire(
        &self,
        spec: &SandboxSpec,
        label: &str,
        files: &BTreeMap<String, FileSource>,
        setup: Option<&str>,
    ) -> Result<(SandboxLease, Duration), SandboxError> {
        let queue_start = Instant::now();
        let permit = match &self.slots {
            Some(sem) => Some(
                Arc::clone(sem)
                    .acquire_owned()
                    .await
                    .map_err(|_| SandboxError::Other("sandbox pool closed".into()))?,
            ),
            None => None,
        };
        let waited = queue_start.elapsed();

        let provider = self.registry.get(&spec.provider)?;
        let env = provider.provision(spec, label).await?;

        // Stage sample files and run setup before any solver sees the
        // environment; failures tear the environment down so the slot and
        // container never leak.
        if let Err(e) = stage(&env, files, setup).await {
            let _ = env.teardown().await;
            return Err(e);
        }

        Ok((SandboxLease { env, _permit: permit, preserve: self.preserve }, waited))
    }
}

async fn stage(
    env: &Arc<dyn SandboxEnvironment>,
    files: &BTreeMap<String, FileSource>,
    setup: Option<&str>,
) -> Result<(), SandboxError> {
    for (path, source) in files {
        let bytes = source.resolve().await?;
        env.write_file(path, &bytes).await?;
    }
    if let Some(script) = setup {
        let result = env
            .exec(ExecParams::shell(script).with_timeout(SETUP_TIMEOUT))
            .await
            .map_err(|e| SandboxError::Setup(e.to_string()))?;
        if !result.success {
            return Err(SandboxError::Setup(format!(
                "setup script exited {}: {}",
                result.exit_code,
                result.stderr.trim()
            )));
        }
    }
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(max: Option<usize>) -> SandboxPool {
        SandboxPool::new(Arc::new(SandboxRegistry::with_builtins()), max, false)
    }

    fn local_spec() -> SandboxSpec {
        SandboxSpec::new("local")
    }

    #[tokio::test]
    async fn acquire_stages_files_before_returning() {
        let p = pool(None);
        let mut files = BTreeMap::new();
        files.insert("input/data.txt".to_string(), FileSource::Text("staged".into()));
        let (lease, _) = p.acquire(&local_spec(), "t", &files, None).await.unwrap();
        assert_eq!(lease.env.read_file("input/data.txt").await.unwrap(), b"staged");
        lease.release().await;
    }

    #[tokio::test]
    async fn setup_script_runs_in_the_environment() {
        let p = pool(None);
        let (lease, _) = p
            .acquire(
                &local_spec(),
                "t",
                &BTreeMap::new(),
                Some("echo ready > marker.txt"),
            )
            .await
            .unwrap();
        assert_eq!(
            String::from_utf8(lease.env.read_file("marker.txt").await.unwrap()).unwrap().trim(),
            "ready"
        );
        lease.release().await;
    }

    #[tokio::test]
    async fn failing_setup_is_a_setup_error() {
        let p = pool(None);
        let err = p
            .acquire(&local_spec(), "t", &BTreeMap::new(), Some("echo broken >&2; exit 4"))
            .await
            .unwrap_err();
        match err {
            SandboxError::Setup(msg) => {
                assert!(msg.contains('4') || msg.contains("broken"), "msg: {msg}")
            }
            other => panic!("expected Setup error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_provider_fails_acquisition() {
        let p = pool(None);
        let err = p
            .acquire(&SandboxSpec::new("k8s"), "t", &BTreeMap::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::UnknownProvider(_)));
    }

    #[tokio::test]
    async fn slot_limit_serialises_acquisitions() {
        let p = Arc::new(pool(Some(1)));
        let (first, first_wait) = p
            .acquire(&local_spec(), "a", &BTreeMap::new(), None)
            .await
            .unwrap();
        assert!(first_wait < Duration::from_millis(50));

        // Second acquisition must block until the first lease is released.
        let p2 = Arc::clone(&p);
        let second = tokio::spawn(async move {
            p2.acquire(&local_spec(), "b", &BTreeMap::new(), None).await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!second.is_finished(), "second acquire should be queued");

        first.release().await;
        let (second_lease, second_wait) = second.await.unwrap().unwrap();
        assert!(second_wait >= Duration::from_millis(50), "waited {second_wait:?}");
        second_lease.release().await;
    }
}
