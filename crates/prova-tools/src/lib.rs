// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod builtin;
mod approval;
mod error;
mod registry;
mod tool;

pub use approval::{ApprovalChain, ApprovalDecision, Approver, AutoApprover, PatternApprover};
pub use error::{ToolError, ToolErrorKind};
pub use registry::ToolRegistry;
pub use tool::{tool_info, truncate_output, validate_arguments, Tool, TOOL_OUTPUT_LIMIT};
