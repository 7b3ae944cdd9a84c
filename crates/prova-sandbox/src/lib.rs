// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod rpc;
mod docker;
mod error;
mod local;
mod pool;
mod provider;
mod spec;

pub use docker::DockerSandboxProvider;
pub use error::SandboxError;
pub use local::{process_group_alive, LocalSandbox, LocalSandboxProvider};
pub use pool::{SandboxLease, SandboxPool};
pub use provider::{
    exec_with_retry, ExecParams, ExecResult, ProcessStatus, SandboxConnection,
    SandboxEnvironment, SandboxProvider, SandboxRegistry, DEFAULT_KILL_GRACE,
    EXEC_OUTPUT_LIMIT, READ_FILE_LIMIT,
};
pub use spec::{select_default, FileSource, SandboxSpec};
