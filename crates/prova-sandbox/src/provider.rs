// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::{error::SandboxError, spec::SandboxSpec};

/// Per-stream cap on captured exec output.
pub const EXEC_OUTPUT_LIMIT: u64 = 10 * 1024 * 1024;
/// Cap on `read_file` results.
pub const READ_FILE_LIMIT: u64 = 100 * 1024 * 1024;
/// Grace between SIGTERM and SIGKILL when stopping a process group.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

/// Parameters for one command execution inside a sandbox.
#[derive(Debug, Clone, Default)]
pub struct ExecParams {
    /// Argv; `cmd[0]` is the program.
    pub cmd: Vec<String>,
    /// Text piped to stdin.
    pub input: Option<String>,
    /// Working directory, relative to the sandbox root when relative.
    pub cwd: Option<String>,
    pub env: BTreeMap<String, String>,
    /// User to run as (providers that support it).
    pub user: Option<String>,
    pub timeout: Option<Duration>,
    /// Opt-in: retry the command when it times out.  Only idempotent
    /// commands should set this.
    pub timeout_retry: bool,
}

impl ExecParams {
    pub fn command<I, S>(cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { cmd: cmd.into_iter().map(Into::into).collect(), ..Self::default() }
    }

    pub fn shell(script: impl Into<String>) -> Self {
        Self::command(["sh", "-c", &script.into()])
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub success: bool,
}

/// Incremental status of a long-running sandbox process.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ProcessStatus {
    /// Stdout produced since the previous poll.
    pub stdout: String,
    /// Stderr produced since the previous poll.
    pub stderr: String,
    /// Exit code once the process has finished.
    pub exit: Option<i32>,
    pub running: bool,
}

/// Connection recipe for interactive debugging of a live environment.
#[derive(Debug, Clone)]
pub struct SandboxConnection {
    /// Command a human can run to enter the environment.
    pub command: String,
}

/// One isolated execution environment bound to a single sample.
#[async_trait]
pub trait SandboxEnvironment: Send + Sync {
    /// Provider id this environment came from.
    fn provider(&self) -> &str;

    async fn exec(&self, params: ExecParams) -> Result<ExecResult, SandboxError>;

    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), SandboxError>;

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, SandboxError>;

    /// Interactive connection recipe, when the provider has one.
    async fn connection(&self) -> Option<SandboxConnection> {
        None
    }

    /// Start a long-running process as a group leader.  Returns its pid.
    async fn start_process(&self, cmd: Vec<String>) -> Result<u32, SandboxError>;

    /// Drain new output and report liveness/exit for a started process.
    async fn poll_process(&self, pid: u32) -> Result<ProcessStatus, SandboxError>;

    /// SIGTERM the process group, wait up to `grace`, then SIGKILL.
    async fn kill_process(&self, pid: u32, grace: Duration) -> Result<(), SandboxError>;

    /// Destroy the environment and everything in it.
    async fn teardown(&self) -> Result<(), SandboxError>;
}

/// Provisions environments for one kind of isolation (`local`, `docker`, …).
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Create a fresh environment for the given spec.  `label` is a
    /// human-readable tag (task/sample) used in container names and logs.
    async fn provision(
        &self,
        spec: &SandboxSpec,
        label: &str,
    ) -> Result<Arc<dyn SandboxEnvironment>, SandboxError>;
}

/// Explicit provider table handed to the pool at configuration time.
pub struct SandboxRegistry {
    providers: HashMap<String, Arc<dyn SandboxProvider>>,
}

impl SandboxRegistry {
    pub fn new() -> Self {
        Self { providers: HashMap::new() }
    }

    /// Registry pre-loaded with the built-in `local` and `docker` providers.
    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        reg.register(Arc::new(crate::local::LocalSandboxProvider::new()));
        reg.register(Arc::new(crate::docker::DockerSandboxProvider::new()));
        reg
    }

    pub fn register(&mut self, provider: Arc<dyn SandboxProvider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn SandboxProvider>, SandboxError> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| SandboxError::UnknownProvider(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort_unstable();
        names
    }
}

impl Default for SandboxRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Retry wrapper for exec timeouts.
///
/// At most two retries, each with a timeout clamped below 60 s, and only
/// when the caller opted in via [`ExecParams::timeout_retry`].
pub async fn exec_with_retry(
    env: &dyn SandboxEnvironment,
    params: ExecParams,
) -> Result<ExecResult, SandboxError> {
    const MAX_RETRIES: u32 = 2;
    const RETRY_TIMEOUT_CAP: Duration = Duration::from_secs(59);

    let mut attempt = 0;
    loop {
        let mut p = params.clone();
        if attempt > 0 {
            p.timeout = Some(p.timeout.unwrap_or(RETRY_TIMEOUT_CAP).min(RETRY_TIMEOUT_CAP));
        }
        match env.exec(p).await {
            Err(SandboxError::Timeout(t)) if params.timeout_retry && attempt < MAX_RETRIES => {
                attempt += 1;
                tracing::debug!(attempt, timeout = ?t, "exec timed out; retrying");
            }
            other => return other,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
