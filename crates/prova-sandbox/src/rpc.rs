// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Newline-delimited JSON-RPC 2.0 channel for driving long-running sandbox
//! processes remotely.
//!
//! Three methods: `process/start` returns the pid of a new group leader,
//! `process/poll` drains incremental output and reports exit, and
//! `process/kill` SIGTERMs the group, waits out a grace period, then
//! SIGKILLs.  The same [`ProcessStatus`] shapes are used in-process by the
//! local provider; this module is the wire form a remote sandbox daemon
//! speaks over its stdio.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::debug;

use crate::{error::SandboxError, provider::{ProcessStatus, SandboxEnvironment}};

pub const METHOD_START: &str = "process/start";
pub const METHOD_POLL: &str = "process/poll";
pub const METHOD_KILL: &str = "process/kill";

/// Grace between SIGTERM and SIGKILL when the kill request does not set one.
pub const DEFAULT_GRACE_SECS: f64 = 5.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorBody>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorBody {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartParams {
    pub cmd: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartResult {
    pub pid: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollParams {
    pub pid: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillParams {
    pub pid: u32,
    #[serde(default)]
    pub grace_secs: Option<f64>,
}

/// Client half: issues requests over any byte stream (typically the stdio of
/// a remote daemon).
pub struct RpcChannel<R, W> {
    reader: BufReader<R>,
    writer: W,
    next_id: u64,
}

impl<R, W> RpcChannel<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader: BufReader::new(reader), writer, next_id: 1 }
    }

    async fn call(
        &mut self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, SandboxError> {
        let id = self.next_id;
        self.next_id += 1;
        let request = RpcRequest {
            jsonrpc: "2.0".into(),
            id,
            method: method.to_string(),
            params,
        };
        let mut line = serde_json::to_string(&request)
            .map_err(|e| SandboxError::Other(format!("encode rpc request: {e}")))?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;

        let mut reply = String::new();
        let n = self.reader.read_line(&mut reply).await?;
        if n == 0 {
            return Err(SandboxError::Other("rpc channel closed".into()));
        }
        let response: RpcResponse = serde_json::from_str(reply.trim())
            .map_err(|e| SandboxError::Other(format!("decode rpc response: {e}")))?;
        if response.id != id {
            return Err(SandboxError::Other(format!(
                "rpc response id mismatch: sent {id}, got {}",
                response.id
            )));
        }
        if let Some(err) = response.error {
            return Err(SandboxError::Other(format!(
                "rpc error {}: {}",
                err.code, err.message
            )));
        }
        response
            .result
            .ok_or_else(|| SandboxError::Other("rpc response missing result".into()))
    }

    pub async fn start(&mut self, cmd: Vec<String>) -> Result<u32, SandboxError> {
        let result = self
            .call(METHOD_START, json!(StartParams { cmd }))
            .await?;
        let start: StartResult = serde_json::from_value(result)
            .map_err(|e| SandboxError::Other(format!("decode start result: {e}")))?;
        Ok(start.pid)
    }

    pub async fn poll(&mut self, pid: u32) -> Result<ProcessStatus, SandboxError> {
        let result = self.call(METHOD_POLL, json!(PollParams { pid })).await?;
        serde_json::from_value(result)
            .map_err(|e| SandboxError::Other(format!("decode poll result: {e}")))
    }

    pub async fn kill(&mut self, pid: u32, grace: Duration) -> Result<(), SandboxError> {
        self.call(
            METHOD_KILL,
            json!(KillParams { pid, grace_secs: Some(grace.as_secs_f64()) }),
        )
        .await?;
        Ok(())
    }
}

/// Server half: dispatches requests from the stream onto an environment until
/// the peer closes the connection.
pub async fn serve(
    env: &dyn SandboxEnvironment,
    reader: impl AsyncRead + Unpin,
    mut writer: impl AsyncWrite + Unpin,
) -> Result<(), SandboxError> {
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<RpcRequest>(&line) {
            Ok(request) => {
                debug!(method = %request.method, id = request.id, "rpc request");
                dispatch(env, request).await
            }
            Err(e) => RpcResponse {
                jsonrpc: "2.0".into(),
                id: 0,
                result: None,
                error: Some(RpcErrorBody {
                    code: -32700,
                    message: format!("parse error: {e}"),
                }),
            },
        };
        let mut out = serde_json::to_string(&response)
            .map_err(|e| SandboxError::Other(format!("encode rpc response: {e}")))?;
        out.push('\n');
        writer.write_all(out.as_bytes()).await?;
        writer.flush().await?;
    }
    Ok(())
}

async fn dispatch(env: &dyn SandboxEnvironment, request: RpcRequest) -> RpcResponse {
    let id = request.id;
    let result: Result<serde_json::Value, SandboxError> = match request.method.as_str() {
        METHOD_START => match serde_json::from_value::<StartParams>(request.params) {
            Ok(p) => env
                .start_process(p.cmd)
                .await
                .map(|pid| json!(StartResult { pid })),
            Err(e) => Err(SandboxError::Other(format!("invalid params: {e}"))),
        },
        METHOD_POLL => match serde_json::from_value::<PollParams>(request.params) {
            Ok(p) => env.poll_process(p.pid).await.map(|s| json!(s)),
            Err(e) => Err(SandboxError::Other(format!("invalid params: {e}"))),
        },
        METHOD_KILL => match serde_json::from_value::<KillParams>(request.params) {
            Ok(p) => {
                let grace =
                    Duration::from_secs_f64(p.grace_secs.unwrap_or(DEFAULT_GRACE_SECS));
                env.kill_process(p.pid, grace).await.map(|()| json!({}))
            }
            Err(e) => Err(SandboxError::Other(format!("invalid params: {e}"))),
        },
        other => Err(SandboxError::Other(format!("unknown method: {other}"))),
    };
    match result {
        Ok(value) => RpcResponse { jsonrpc: "2.0".into(), id, result: Some(value), error: None },
        Err(e) => RpcResponse {
            jsonrpc: "2.0".into(),
            id,
            result: None,
            error: Some(RpcErrorBody { code: -32000, message: e.to_string() }),
        },
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::local::{process_group_alive, LocalSandboxProvider};
    use crate::provider::SandboxProvider;
    use crate::spec::SandboxSpec;

    /// Run a client closure against a served LocalSandbox over an in-memory
    /// duplex pipe.
    async fn with_channel<F, Fut>(f: F)
    where
        F: FnOnce(RpcChannel<tokio::io::ReadHalf<tokio::io::DuplexStream>,
                  tokio::io::WriteHalf<tokio::io::DuplexStream>>) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let env = LocalSandboxProvider::new()
            .provision(&SandboxSpec::new("local"), "rpc")
            .await
            .unwrap();
        let (client_side, server_side) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server_side);
        let env_for_server = Arc::clone(&env);
        let server = tokio::spawn(async move {
            let _ = serve(env_for_server.as_ref(), server_read, server_write).await;
        });
        let (client_read, client_write) = tokio::io::split(client_side);
        f(RpcChannel::new(client_read, client_write)).await;
        server.abort();
        let _ = env.teardown().await;
    }

    #[tokio::test]
    async fn start_poll_kill_round_trip() {
        with_channel(|mut chan| async move {
            let pid = chan
                .start(vec!["sh".into(), "-c".into(), "echo up; sleep 30".into()])
                .await
                .unwrap();
            let mut seen = String::new();
            for _ in 0..50 {
                let st = chan.poll(pid).await.unwrap();
                seen.push_str(&st.stdout);
                if seen.contains("up") {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            assert!(seen.contains("up"));

            chan.kill(pid, Duration::from_millis(200)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
            assert!(!process_group_alive(pid));
        })
        .await;
    }

    #[tokio::test]
    async fn unknown_method_returns_rpc_error() {
        with_channel(|mut chan| async move {
            let err = chan.call("process/pause", json!({})).await.unwrap_err();
            assert!(err.to_string().contains("unknown method"));
        })
        .await;
    }

    #[tokio::test]
    async fn poll_for_missing_pid_is_an_error() {
        with_channel(|mut chan| async move {
            let err = chan.poll(424242).await.unwrap_err();
            assert!(err.to_string().contains("no such process"));
        })
        .await;
    }

    #[test]
    fn request_wire_form_is_jsonrpc_2() {
        let req = RpcRequest {
            jsonrpc: "2.0".into(),
            id: 7,
            method: METHOD_START.into(),
            params: json!({"cmd": ["sleep", "1"]}),
        };
        let wire = serde_json::to_value(&req).unwrap();
        assert_eq!(wire["jsonrpc"], "2.0");
        assert_eq!(wire["method"], "process/start");
        assert_eq!(wire["params"]["cmd"][0], "sleep");
    }
}
