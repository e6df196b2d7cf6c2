// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use crate::tool::{OutputCategory, Tool};

/// Immutable description of a registered tool, as exposed to the selector
/// and to provider drivers.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
    pub category: String,
    pub keywords: Vec<String>,
    pub priority: i32,
    pub read_only: bool,
    pub streaming: bool,
}

/// Central registry holding all available tools.
///
/// The registry is immutable after construction: build it fully (via
/// [`register`](Self::register)) before sharing it, then wrap in `Arc`.
/// No interior mutability exists, so lookups on the hot path take no lock.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Produce descriptors for ALL registered tools, sorted by name.
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        let mut out: Vec<ToolDescriptor> = self
            .tools
            .values()
            .map(|t| ToolDescriptor {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
                category: t.category().to_string(),
                keywords: t.keywords().iter().map(|k| k.to_string()).collect(),
                priority: t.priority(),
                read_only: t.read_only(),
                streaming: t.streaming(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// True when the named tool may run in parallel with others in its lane.
    pub fn is_read_only(&self, name: &str) -> bool {
        self.tools.get(name).map(|t| t.read_only()).unwrap_or(false)
    }

    /// True when the named tool streams its output.
    pub fn is_streaming(&self, name: &str) -> bool {
        self.tools.get(name).map(|t| t.streaming()).unwrap_or(false)
    }

    pub fn output_category(&self, name: &str) -> OutputCategory {
        self.tools
            .get(name)
            .map(|t| t.output_category())
            .unwrap_or_default()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
