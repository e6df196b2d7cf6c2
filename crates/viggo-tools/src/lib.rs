// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod builtin;
pub mod dispatch;
pub mod lanes;
pub mod policy;
pub mod registry;
pub mod select;
pub mod store;
pub mod tool;

pub use dispatch::{CheckpointHook, McpRouter, ToolDispatcher, MCP_PREFIX};
pub use lanes::{EnqueueOptions, LaneError, LaneQueue, DEFAULT_TIMEOUT};
pub use policy::{ApprovalPolicy, ToolPolicy};
pub use registry::{ToolDescriptor, ToolRegistry};
pub use select::{Selection, ToolSelector, ALWAYS_INCLUDE};
pub use store::ResultStore;
pub use tool::{
    OutputCategory, Tool, ToolCall, ToolEventStream, ToolOutput, ToolStreamEvent,
};

pub use builtin::read_file::ReadFileTool;
pub use builtin::restore_context::RestoreContextTool;
pub use builtin::shell::ShellTool;
pub use builtin::write_file::WriteFileTool;
