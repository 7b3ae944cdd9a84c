// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Local sandbox: a tempdir-rooted environment on the host machine.
//!
//! Isolation here is *filesystem scoping*, not a security boundary — the
//! provider exists for fast tests and trusted tasks.  Every spawned process
//! becomes a session/group leader via `setsid()`, so timeouts and
//! cancellation can signal the whole process *group* and no grandchild
//! survives a kill.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::{
    error::SandboxError,
    provider::{
        ExecParams, ExecResult, ProcessStatus, SandboxConnection, SandboxEnvironment,
        SandboxProvider, EXEC_OUTPUT_LIMIT, READ_FILE_LIMIT,
    },
    spec::SandboxSpec,
};

pub struct LocalSandboxProvider {
    /// Shared cap on concurrently running exec subprocesses across all
    /// environments from this provider (the `max_subprocesses` knob).
    exec_slots: Option<Arc<tokio::sync::Semaphore>>,
}

impl LocalSandboxProvider {
    pub fn new() -> Self {
        Self { exec_slots: None }
    }

    pub fn with_exec_limit(max_subprocesses: usize) -> Self {
        Self {
            exec_slots: Some(Arc::new(tokio::sync::Semaphore::new(
                max_subprocesses.max(1),
            ))),
        }
    }
}

impl Default for LocalSandboxProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SandboxProvider for LocalSandboxProvider {
    fn name(&self) -> &str {
        "local"
    }

    async fn provision(
        &self,
        _spec: &SandboxSpec,
        label: &str,
    ) -> Result<Arc<dyn SandboxEnvironment>, SandboxError> {
        let root = tempfile::Builder::new()
            .prefix(&format!("prova-{label}-"))
            .tempdir()
            .map_err(SandboxError::Io)?;
        debug!(root = %root.path().display(), "provisioned local sandbox");
        Ok(Arc::new(LocalSandbox {
            root,
            processes: Mutex::new(HashMap::new()),
            exec_slots: self.exec_slots.clone(),
        }))
    }
}

struct ProcessEntry {
    child: Child,
    stdout_buf: Arc<Mutex<Vec<u8>>>,
    stderr_buf: Arc<Mutex<Vec<u8>>>,
    stdout_pos: usize,
    stderr_pos: usize,
    exit: Option<i32>,
}

pub struct LocalSandbox {
    root: tempfile::TempDir,
    processes: Mutex<HashMap<u32, ProcessEntry>>,
    exec_slots: Option<Arc<tokio::sync::Semaphore>>,
}

impl LocalSandbox {
    pub fn root(&self) -> &Path {
        self.root.path()
    }

    /// Map a sandbox path onto the host, treating absolute paths as rooted at
    /// the sandbox root and rejecting `..` escapes.
    fn resolve(&self, path: &str) -> Result<PathBuf, SandboxError> {
        let p = Path::new(path);
        let joined = if p.is_absolute() {
            let stripped: PathBuf = p
                .components()
                .filter(|c| matches!(c, Component::Normal(_)))
                .collect();
            self.root.path().join(stripped)
        } else {
            if p.components().any(|c| matches!(c, Component::ParentDir)) {
                return Err(SandboxError::Permission(format!(
                    "path escapes the sandbox: {path}"
                )));
            }
            self.root.path().join(p)
        };
        Ok(joined)
    }
}

#[async_trait]
impl SandboxEnvironment for LocalSandbox {
    fn provider(&self) -> &str {
        "local"
    }

    async fn exec(&self, params: ExecParams) -> Result<ExecResult, SandboxError> {
        if params.cmd.is_empty() {
            return Err(SandboxError::Other("empty command".into()));
        }
        if params.user.is_some() {
            // Switching users needs real privilege separation; the local
            // provider has none.
            warn!("local sandbox ignores the `user` exec parameter");
        }
        // Subprocess-slot waits are queue time; callers that track working
        // time measure around exec() as a whole.
        let _slot = match &self.exec_slots {
            Some(sem) => Some(
                Arc::clone(sem)
                    .acquire_owned()
                    .await
                    .map_err(|_| SandboxError::Other("subprocess pool closed".into()))?,
            ),
            None => None,
        };
        let cwd = match &params.cwd {
            Some(c) => {
                let dir = self.resolve(c)?;
                tokio::fs::create_dir_all(&dir).await?;
                dir
            }
            None => self.root.path().to_path_buf(),
        };

        let mut cmd = Command::new(&params.cmd[0]);
        cmd.args(&params.cmd[1..])
            .current_dir(cwd)
            .envs(&params.env)
            .stdin(if params.input.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        set_group_leader(&mut cmd);

        let mut child = cmd.spawn()?;
        let pid = child.id();
        // If this future is dropped mid-flight (cooperative cancellation),
        // the guard signals the whole process group so no grandchild
        // outlives the sample.
        let mut group_guard = GroupGuard::new(pid);

        if let Some(input) = &params.input {
            if let Some(mut stdin) = child.stdin.take() {
                let bytes = input.clone().into_bytes();
                // Writing may fail when the process exits without reading —
                // that is the process's business, not an engine error.
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

        let ((stdout, out_over), (stderr, err_over), status) = match params.timeout {
            Some(t) => match tokio::time::timeout(t, work).await {
                Ok(r) => {
                    group_guard.disarm();
                    r?
                }
                Err(_) => {
                    // The dropped future's kill_on_drop reaps the direct
                    // child; the group signal catches its descendants.
                    group_guard.disarm();
                    if let Some(pid) = pid {
                        signal_group(pid, libc::SIGTERM);
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        signal_group(pid, libc::SIGKILL);
                    }
                    return Err(SandboxError::Timeout(t));
                }
            },
            None => {
                let r = work.await;
                group_guard.disarm();
                r?
            }
        };

        if out_over {
            return Err(SandboxError::OutputLimit { stream: "stdout", limit: EXEC_OUTPUT_LIMIT });
        }
        if err_over {
            return Err(SandboxError::OutputLimit { stream: "stderr", limit: EXEC_OUTPUT_LIMIT });
        }

        let stdout = decode_utf8(stdout, "stdout")?;
        let stderr = decode_utf8(stderr, "stderr")?;
        let exit_code = status.code().unwrap_or(-1);
        Ok(ExecResult { stdout, stderr, exit_code, success: exit_code == 0 })
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), SandboxError> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(target, contents).await?;
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, SandboxError> {
        let target = self.resolve(path)?;
        let meta = tokio::fs::metadata(&target).await?;
        if meta.len() > READ_FILE_LIMIT {
            return Err(SandboxError::OutputLimit { stream: "file", limit: READ_FILE_LIMIT });
        }
        Ok(tokio::fs::read(target).await?)
    }

    async fn connection(&self) -> Option<SandboxConnection> {
        Some(SandboxConnection {
            command: format!("cd {}", self.root.path().display()),
        })
    }

    async fn start_process(&self, cmd: Vec<String>) -> Result<u32, SandboxError> {
        if cmd.is_empty() {
            return Err(SandboxError::Other("empty command".into()));
        }
        let mut command = Command::new(&cmd[0]);
        command
            .args(&cmd[1..])
            .current_dir(self.root.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        set_group_leader(&mut command);

        let mut child = command.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| SandboxError::Other("process exited before pid was known".into()))?;

        let stdout_buf = Arc::new(Mutex::new(Vec::new()));
        let stderr_buf = Arc::new(Mutex::new(Vec::new()));
        if let Some(pipe) = child.stdout.take() {
            tokio::spawn(pump(pipe, Arc::clone(&stdout_buf)));
        }
        if let Some(pipe) = child.stderr.take() {
            tokio::spawn(pump(pipe, Arc::clone(&stderr_buf)));
        }

        self.processes.lock().unwrap().insert(
            pid,
            ProcessEntry {
                child,
                stdout_buf,
                stderr_buf,
                stdout_pos: 0,
                stderr_pos: 0,
                exit: None,
            },
        );
        debug!(pid, "started sandbox process group");
        Ok(pid)
    }

    async fn poll_process(&self, pid: u32) -> Result<ProcessStatus, SandboxError> {
        let mut map = self.processes.lock().unwrap();
        let entry = map.get_mut(&pid).ok_or(SandboxError::NoSuchProcess(pid))?;
        if entry.exit.is_none() {
            if let Some(status) = entry.child.try_wait()? {
                entry.exit = Some(status.code().unwrap_or(-1));
            }
        }
        let stdout = drain(&entry.stdout_buf, &mut entry.stdout_pos);
        let stderr = drain(&entry.stderr_buf, &mut entry.stderr_pos);
        Ok(ProcessStatus {
            stdout,
            stderr,
            exit: entry.exit,
            running: entry.exit.is_none(),
        })
    }

    async fn kill_process(&self, pid: u32, grace: Duration) -> Result<(), SandboxError> {
        {
            let map = self.processes.lock().unwrap();
            if !map.contains_key(&pid) {
                return Err(SandboxError::NoSuchProcess(pid));
            }
        }
        signal_group(pid, libc::SIGTERM);

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let exited = {
                let mut map = self.processes.lock().unwrap();
                let entry = map.get_mut(&pid).ok_or(SandboxError::NoSuchProcess(pid))?;
                if entry.exit.is_none() {
                    if let Some(status) = entry.child.try_wait()? {
                        entry.exit = Some(status.code().unwrap_or(-1));
                    }
                }
                entry.exit.is_some()
            };
            if exited || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        // Always SIGKILL the group at the end: the leader may have exited
        // while a grandchild lingers in the same group.
        signal_group(pid, libc::SIGKILL);

        // Reap the leader so no zombie is left behind.
        let mut map = self.processes.lock().unwrap();
        if let Some(entry) = map.get_mut(&pid) {
            if entry.exit.is_none() {
                if let Ok(Some(status)) = entry.child.try_wait() {
                    entry.exit = Some(status.code().unwrap_or(-1));
                }
            }
        }
        Ok(())
    }

    async fn teardown(&self) -> Result<(), SandboxError> {
        let pids: Vec<u32> = self.processes.lock().unwrap().keys().copied().collect();
        for pid in pids {
            let _ = self.kill_process(pid, Duration::from_millis(200)).await;
        }
        // The tempdir also cleans itself on drop; removing eagerly makes
        // teardown observable to callers that hold other references.
        let _ = tokio::fs::remove_dir_all(self.root.path()).await;
        Ok(())
    }
}

/// Kills the process group if an exec future is dropped before completion
/// (cooperative cancellation unwinding through a suspension point).
///
/// SIGTERM is sent synchronously; SIGKILL follows after the grace period
/// from a detached task when a runtime is available, immediately otherwise.
struct GroupGuard {
    pid: Option<u32>,
    armed: bool,
}

impl GroupGuard {
    fn new(pid: Option<u32>) -> Self {
        Self { pid, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Some(pid) = self.pid else { return };
        signal_group(pid, libc::SIGTERM);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(crate::provider::DEFAULT_KILL_GRACE).await;
                    signal_group(pid, libc::SIGKILL);
                });
            }
            Err(_) => signal_group(pid, libc::SIGKILL),
        }
    }
}

/// Make the spawned process a session (and thus process-group) leader so a
/// signal to `-pid` reaches every descendant.
fn set_group_leader(cmd: &mut Command) {
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }
}

/// Send `signal` to the process group `pid` leads.  ESRCH (group already
/// gone) is fine.
fn signal_group(pid: u32, signal: i32) {
    #[cfg(unix)]
    unsafe {
        libc::kill(-(pid as i32), signal);
    }
}

/// True while any member of the group is alive.
pub fn process_group_alive(pid: u32) -> bool {
    #[cfg(unix)]
    unsafe {
        libc::kill(-(pid as i32), 0) == 0
    }
    #[cfg(not(unix))]
    false
}

/// Read up to `cap` bytes; report whether the stream exceeded the cap.  The
/// remainder is drained to /dev/null so the producer never blocks on a full
/// pipe.
pub(crate) async fn read_capped<R>(mut r: R, cap: u64) -> std::io::Result<(Vec<u8>, bool)>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    (&mut r).take(cap + 1).read_to_end(&mut buf).await?;
    let over = buf.len() as u64 > cap;
    if over {
        buf.truncate(cap as usize);
        tokio::io::copy(&mut r, &mut tokio::io::sink()).await?;
    }
    Ok((buf, over))
}

pub(crate) fn decode_utf8(bytes: Vec<u8>, stream: &str) -> Result<String, SandboxError> {
    String::from_utf8(bytes)
        .map_err(|e| SandboxError::UnicodeDecode(format!("{stream}: {e}")))
}

async fn pump<R>(mut pipe: R, buf: Arc<Mutex<Vec<u8>>>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut chunk = [0u8; 8192];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buf.lock().unwrap().extend_from_slice(&chunk[..n]),
        }
    }
}

fn drain(buf: &Arc<Mutex<Vec<u8>>>, pos: &mut usize) -> String {
    let data = buf.lock().unwrap();
    let new = &data[*pos..];
    *pos = data.len();
    String::from_utf8_lossy(new).into_owned()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    async fn sandbox() -> Arc<dyn SandboxEnvironment> {
        LocalSandboxProvider::new()
            .provision(&SandboxSpec::new("local"), "test")
            .await
            .unwrap()
    }

    // ── exec ──────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn exec_captures_stdout_and_exit_code() {
        let sb = sandbox().await;
        let r = sb.exec(ExecParams::shell("echo hello")).await.unwrap();
        assert_eq!(r.stdout.trim(), "hello");
        assert_eq!(r.exit_code, 0);
        assert!(r.success);
    }

    #[tokio::test]
    async fn exec_captures_stderr_separately() {
        let sb = sandbox().await;
        let r = sb.exec(ExecParams::shell("echo oops >&2")).await.unwrap();
        assert!(r.stdout.is_empty());
        assert_eq!(r.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn exec_nonzero_exit_is_not_success() {
        let sb = sandbox().await;
        let r = sb.exec(ExecParams::shell("exit 3")).await.unwrap();
        assert_eq!(r.exit_code, 3);
        assert!(!r.success);
    }

    #[tokio::test]
    async fn exec_pipes_stdin_to_the_command() {
        let sb = sandbox().await;
        let r = sb
            .exec(ExecParams::command(["cat"]).with_input("fed via stdin"))
            .await
            .unwrap();
        assert_eq!(r.stdout, "fed via stdin");
    }

    #[tokio::test]
    async fn exec_env_vars_are_visible() {
        let sb = sandbox().await;
        let mut p = ExecParams::shell("printf '%s' \"$PROVA_TEST_VAR\"");
        p.env.insert("PROVA_TEST_VAR".into(), "42".into());
        let r = sb.exec(p).await.unwrap();
        assert_eq!(r.stdout, "42");
    }

    #[tokio::test]
    async fn exec_timeout_raises_and_kills_the_group() {
        let sb = sandbox().await;
        let started = std::time::Instant::now();
        let err = sb
            .exec(ExecParams::shell("sleep 30").with_timeout(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn exec_invalid_utf8_is_a_decode_error() {
        let sb = sandbox().await;
        let err = sb
            .exec(ExecParams::shell("printf '\\377'"))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::UnicodeDecode(_)), "got {err:?}");
    }

    // ── files ─────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let sb = sandbox().await;
        sb.write_file("data/answer.txt", b"42").await.unwrap();
        assert_eq!(sb.read_file("data/answer.txt").await.unwrap(), b"42");
    }

    #[tokio::test]
    async fn absolute_paths_are_rooted_in_the_sandbox() {
        let sb = sandbox().await;
        sb.write_file("/etc/motd", b"sandboxed").await.unwrap();
        assert_eq!(sb.read_file("/etc/motd").await.unwrap(), b"sandboxed");
        // The real /etc/motd must be untouched (it may not even exist).
        assert_ne!(
            std::fs::read("/etc/motd").unwrap_or_default(),
            b"sandboxed".to_vec()
        );
    }

    #[tokio::test]
    async fn parent_dir_escape_is_denied() {
        let sb = sandbox().await;
        let err = sb.write_file("../escape.txt", b"x").await.unwrap_err();
        assert!(matches!(err, SandboxError::Permission(_)));
    }

    #[tokio::test]
    async fn two_sandboxes_do_not_share_files() {
        let a = sandbox().await;
        let b = sandbox().await;
        a.write_file("shared.txt", b"from a").await.unwrap();
        assert!(b.read_file("shared.txt").await.is_err());
    }

    // ── long-running processes ────────────────────────────────────────────────

    #[tokio::test]
    async fn process_output_arrives_incrementally() {
        let sb = sandbox().await;
        let pid = sb
            .start_process(vec!["sh".into(), "-c".into(), "echo first; sleep 30".into()])
            .await
            .unwrap();
        let mut seen = String::new();
        for _ in 0..50 {
            let st = sb.poll_process(pid).await.unwrap();
            seen.push_str(&st.stdout);
            if seen.contains("first") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(seen.contains("first"));
        sb.kill_process(pid, Duration::from_millis(100)).await.unwrap();
    }

    #[tokio::test]
    async fn kill_terminates_children_and_grandchildren() {
        let sb = sandbox().await;
        // The sh leader spawns a backgrounded grandchild, then waits.
        let pid = sb
            .start_process(vec![
                "sh".into(),
                "-c".into(),
                "sleep 9999 & sleep 9999".into(),
            ])
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(process_group_alive(pid), "group should be running before kill");

        sb.kill_process(pid, Duration::from_millis(300)).await.unwrap();
        // Give the kernel a moment to deliver SIGKILL to the group.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(
            !process_group_alive(pid),
            "no member of the process group may survive the kill"
        );
    }

    #[tokio::test]
    async fn poll_reports_exit_code_after_completion() {
        let sb = sandbox().await;
        let pid = sb
            .start_process(vec!["sh".into(), "-c".into(), "exit 7".into()])
            .await
            .unwrap();
        let mut exit = None;
        for _ in 0..100 {
            let st = sb.poll_process(pid).await.unwrap();
            if let Some(code) = st.exit {
                exit = Some(code);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(exit, Some(7));
    }

    #[tokio::test]
    async fn poll_unknown_pid_is_an_error() {
        let sb = sandbox().await;
        assert!(matches!(
            sb.poll_process(999_999).await,
            Err(SandboxError::NoSuchProcess(_))
        ));
    }
}
