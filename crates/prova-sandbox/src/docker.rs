// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Docker sandbox: one container per sample, driven through the docker CLI.
//!
//! The container runs `sleep infinity` as pid 1 and every operation goes
//! through `docker exec` / `docker cp`, so the provider needs nothing beyond
//! a working docker client on the host.  Long-running processes are started
//! as `setsid` group leaders with their output teed to files under `/tmp`,
//! which `poll` tails by byte offset.

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::{
    error::SandboxError,
    local::{decode_utf8, read_capped},
    provider::{
        ExecParams, ExecResult, ProcessStatus, SandboxConnection, SandboxEnvironment,
        SandboxProvider, EXEC_OUTPUT_LIMIT, READ_FILE_LIMIT,
    },
    spec::SandboxSpec,
};

const DEFAULT_IMAGE: &str = "debian:bookworm-slim";

pub struct DockerSandboxProvider;

impl DockerSandboxProvider {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DockerSandboxProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SandboxProvider for DockerSandboxProvider {
    fn name(&self) -> &str {
        "docker"
    }

    async fn provision(
        &self,
        spec: &SandboxSpec,
        label: &str,
    ) -> Result<Arc<dyn SandboxEnvironment>, SandboxError> {
        let image = spec.config.as_deref().unwrap_or(DEFAULT_IMAGE);
        let name = container_name(label);
        let result = run_host(
            &[
                "run", "-d", "--name", &name, image, "sleep", "infinity",
            ],
            None,
            Some(Duration::from_secs(120)),
        )
        .await?;
        if !result.success {
            return Err(SandboxError::Setup(format!(
                "docker run failed for image {image}: {}",
                result.stderr.trim()
            )));
        }
        debug!(container = %name, image, "provisioned docker sandbox");
        Ok(Arc::new(DockerSandbox {
            name,
            processes: Mutex::new(HashMap::new()),
        }))
    }
}

struct DockerProc {
    out_path: String,
    err_path: String,
    code_path: String,
    out_off: u64,
    err_off: u64,
    exit: Option<i32>,
}

pub struct DockerSandbox {
    name: String,
    processes: Mutex<HashMap<u32, DockerProc>>,
}

impl DockerSandbox {
    async fn exec_in_container(
        &self,
        script: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecResult, SandboxError> {
        run_host(
            &["exec", &self.name, "sh", "-c", script],
            None,
            timeout.or(Some(Duration::from_secs(30))),
        )
        .await
    }
}

#[async_trait]
impl SandboxEnvironment for DockerSandbox {
    fn provider(&self) -> &str {
        "docker"
    }

    async fn exec(&self, params: ExecParams) -> Result<ExecResult, SandboxError> {
        if params.cmd.is_empty() {
            return Err(SandboxError::Other("empty command".into()));
        }
        let mut args: Vec<String> = vec!["exec".into()];
        if params.input.is_some() {
            args.push("-i".into());
        }
        if let Some(cwd) = &params.cwd {
            args.push("-w".into());
            args.push(cwd.clone());
        }
        if let Some(user) = &params.user {
            args.push("-u".into());
            args.push(user.clone());
        }
        for (k, v) in &params.env {
            args.push("-e".into());
            args.push(format!("{k}={v}"));
        }
        args.push(self.name.clone());
        args.extend(params.cmd.iter().cloned());

        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        run_host(&refs, params.input.as_deref(), params.timeout).await
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), SandboxError> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            let parent = parent.to_string_lossy();
            if !parent.is_empty() && parent != "/" {
                let r = self
                    .exec_in_container(&format!("mkdir -p {}", shell_quote(&parent)), None)
                    .await?;
                if !r.success {
                    return Err(SandboxError::Other(format!(
                        "mkdir failed: {}",
                        r.stderr.trim()
                    )));
                }
            }
        }
        let tmp = tempfile::NamedTempFile::new()?;
        std::fs::write(tmp.path(), contents)?;
        let src = tmp.path().to_string_lossy().into_owned();
        let dest = format!("{}:{}", self.name, path);
        let r = run_host(&["cp", &src, &dest], None, Some(Duration::from_secs(60))).await?;
        if !r.success {
            return Err(SandboxError::Other(format!(
                "docker cp into container failed: {}",
                r.stderr.trim()
            )));
        }
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, SandboxError> {
        let tmp = tempfile::tempdir()?;
        let local = tmp.path().join("out");
        let src = format!("{}:{}", self.name, path);
        let r = run_host(
            &["cp", &src, &local.to_string_lossy()],
            None,
            Some(Duration::from_secs(120)),
        )
        .await?;
        if !r.success {
            return Err(SandboxError::Other(format!(
                "docker cp out of container failed: {}",
                r.stderr.trim()
            )));
        }
        let meta = std::fs::metadata(&local)?;
        if meta.len() > READ_FILE_LIMIT {
            return Err(SandboxError::OutputLimit { stream: "file", limit: READ_FILE_LIMIT });
        }
        Ok(std::fs::read(&local)?)
    }

    async fn connection(&self) -> Option<SandboxConnection> {
        Some(SandboxConnection {
            command: format!("docker exec -it {} bash", self.name),
        })
    }

    async fn start_process(&self, cmd: Vec<String>) -> Result<u32, SandboxError> {
        if cmd.is_empty() {
            return Err(SandboxError::Other("empty command".into()));
        }
        let token = uuid::Uuid::new_v4().simple().to_string();
        let out_path = format!("/tmp/prova-{token}.out");
        let err_path = format!("/tmp/prova-{token}.err");
        let code_path = format!("/tmp/prova-{token}.code");
        let quoted: Vec<String> = cmd.iter().map(|a| shell_quote(a)).collect();
        // The setsid leader writes its exit code to a file on completion,
        // which is the only way to learn it for a detached process.
        let script = format!(
            "setsid sh -c '{}; echo $? > {code_path}' > {out_path} 2> {err_path} < /dev/null & echo $!",
            quoted.join(" ").replace('\'', "'\\''"),
        );
        let r = self.exec_in_container(&script, None).await?;
        if !r.success {
            return Err(SandboxError::Other(format!(
                "failed to start process: {}",
                r.stderr.trim()
            )));
        }
        let pid: u32 = r
            .stdout
            .trim()
            .parse()
            .map_err(|_| SandboxError::Other(format!("unexpected pid output: {}", r.stdout)))?;
        self.processes.lock().unwrap().insert(
            pid,
            DockerProc { out_path, err_path, code_path, out_off: 0, err_off: 0, exit: None },
        );
        Ok(pid)
    }

    async fn poll_process(&self, pid: u32) -> Result<ProcessStatus, SandboxError> {
        let (out_path, err_path, code_path, out_off, err_off, known_exit) = {
            let map = self.processes.lock().unwrap();
            let p = map.get(&pid).ok_or(SandboxError::NoSuchProcess(pid))?;
            (
                p.out_path.clone(),
                p.err_path.clone(),
                p.code_path.clone(),
                p.out_off,
                p.err_off,
                p.exit,
            )
        };

        let exit = match known_exit {
            Some(code) => Some(code),
            None => {
                let r = self
                    .exec_in_container(&format!("cat {code_path} 2>/dev/null || true"), None)
                    .await?;
                r.stdout.trim().parse::<i32>().ok()
            }
        };
        let stdout = self.tail_from(&out_path, out_off).await?;
        let stderr = self.tail_from(&err_path, err_off).await?;

        let mut map = self.processes.lock().unwrap();
        let p = map.get_mut(&pid).ok_or(SandboxError::NoSuchProcess(pid))?;
        p.out_off += stdout.len() as u64;
        p.err_off += stderr.len() as u64;
        p.exit = exit;
        Ok(ProcessStatus { stdout, stderr, exit, running: exit.is_none() })
    }

    async fn kill_process(&self, pid: u32, grace: Duration) -> Result<(), SandboxError> {
        {
            let map = self.processes.lock().unwrap();
            if !map.contains_key(&pid) {
                return Err(SandboxError::NoSuchProcess(pid));
            }
        }
        let _ = self
            .exec_in_container(&format!("kill -TERM -{pid} 2>/dev/null || true"), None)
            .await;
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let alive = self
                .exec_in_container(&format!("kill -0 -{pid} 2>/dev/null"), None)
                .await
                .map(|r| r.success)
                .unwrap_or(false);
            if !alive || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let _ = self
            .exec_in_container(&format!("kill -KILL -{pid} 2>/dev/null || true"), None)
            .await;
        Ok(())
    }

    async fn teardown(&self) -> Result<(), SandboxError> {
        let r = run_host(&["rm", "-f", &self.name], None, Some(Duration::from_secs(60))).await?;
        if !r.success {
            warn!(container = %self.name, stderr = %r.stderr.trim(), "docker rm failed");
        }
        Ok(())
    }
}

impl DockerSandbox {
    async fn tail_from(&self, path: &str, offset: u64) -> Result<String, SandboxError> {
        // tail -c +N is 1-based.
        let r = self
            .exec_in_container(
                &format!("tail -c +{} {path} 2>/dev/null || true", offset + 1),
                None,
            )
            .await?;
        Ok(r.stdout)
    }
}

fn container_name(label: &str) -> String {
    let sanitized: String = label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("prova-{}-{}", sanitized, &suffix[..8])
}

/// Single-quote an argument for `sh -c`.
fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:".contains(c))
    {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', "'\\''"))
}

/// Run a `docker …` command on the host with the standard output caps.
async fn run_host(
    args: &[&str],
    input: Option<&str>,
    timeout: Option<Duration>,
) -> Result<ExecResult, SandboxError> {
    let mut cmd = Command::new("docker");
    cmd.args(args)
        .stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn()?;
    if let Some(text) = input {
        if let Some(mut stdin) = child.stdin.take() {
            let bytes = text.as_bytes().to_vec();
            let _ = stdin.write_all(&bytes).await;
        }
    }
    let stdout_pipe = child.stdout.take().expect("stdout piped");
    let stderr_pipe = child.stderr.take().expect("stderr piped");
    let work = async move {
        let (out, err, status) = tokio::join!(
            read_capped(stdout_pipe, EXEC_OUTPUT_LIMIT),
            read_capped(stderr_pipe, EXEC_OUTPUT_LIMIT),
            child.wait(),
        );
        Ok::<_, std::io::Error>((out?, err?, status?))
    };
    let ((stdout, out_over), (stderr, err_over), status) = match timeout {
        Some(t) => match tokio::time::timeout(t, work).await {
            Ok(r) => r?,
            Err(_) => return Err(SandboxError::Timeout(t)),
        },
        None => work.await?,
    };
    if out_over {
        return Err(SandboxError::OutputLimit { stream: "stdout", limit: EXEC_OUTPUT_LIMIT });
    }
    if err_over {
        return Err(SandboxError::OutputLimit { stream: "stderr", limit: EXEC_OUTPUT_LIMIT });
    }
    let exit_code = status.code().unwrap_or(-1);
    Ok(ExecResult {
        stdout: decode_utf8(stdout, "stdout")?,
        stderr: decode_utf8(stderr, "stderr")?,
        exit_code,
        success: exit_code == 0,
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
//
// Live docker tests need a daemon; only the pure helpers are covered here.

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_names_are_sanitized_and_unique() {
        let a = container_name("task/sample 1");
        let b = container_name("task/sample 1");
        assert!(a.starts_with("prova-task-sample-1-"));
        assert_ne!(a, b);
    }

    #[test]
    fn shell_quote_passes_safe_args_through() {
        assert_eq!(shell_quote("ls"), "ls");
        assert_eq!(shell_quote("/usr/bin/env"), "/usr/bin/env");
        assert_eq!(shell_quote("a=b"), "a=b");
    }

    #[test]
    fn shell_quote_wraps_and_escapes_unsafe_args() {
        assert_eq!(shell_quote("hello world"), "'hello world'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(shell_quote(""), "''");
    }
}
