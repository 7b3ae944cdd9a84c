// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod cache;
pub mod gateway;
mod error;
mod mock;
mod provider;
mod registry;
mod types;

pub use cache::{cache_from_config, CachePolicy, GenerateCache};
pub use error::ModelError;
pub use gateway::{ConnectionPool, GatewayOptions, GatewayReply, ModelGateway};
pub use mock::{tool_call_output, MockModel, RecordedRequest, ScriptedModel};
pub use provider::{qualified_name, ModelApi};
pub use registry::{ModelFactory, ModelRegistry};
pub use types::*;
