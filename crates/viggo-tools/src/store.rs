// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Durable tool-result store.
//!
//! Untruncated tool outputs are persisted as `<tool_call_id>.txt` under a
//! data directory.  Each key is write-once; the `restore_context` tool
//! reads entries back to rehydrate compressed history.

use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

pub struct ResultStore {
    dir: PathBuf,
}

impl ResultStore {
    /// Open (and create if needed) a store rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating result store at {}", dir.display()))?;
        Ok(Self { dir })
    }

    /// Store under the workspace's data directory.
    pub fn in_workspace(workspace_root: &Path) -> anyhow::Result<Self> {
        Self::new(workspace_root.join(".viggo").join("tool-results"))
    }

    fn path_for(&self, tool_call_id: &str) -> PathBuf {
        self.dir.join(format!("{}.txt", sanitize_key(tool_call_id)))
    }

    /// Persist `content` under `tool_call_id`.
    ///
    /// Write-once: if the key already exists the original content wins and
    /// `Ok(false)` is returned.  Call ids are unique per provider response,
    /// so a second write is always a replay.
    pub fn write(&self, tool_call_id: &str, content: &str) -> anyhow::Result<bool> {
        let path = self.path_for(tool_call_id);
        if path.exists() {
            debug!(tool_call_id, "result already stored; keeping original");
            return Ok(false);
        }
        std::fs::write(&path, content)
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(true)
    }

    pub fn contains(&self, tool_call_id: &str) -> bool {
        self.path_for(tool_call_id).exists()
    }

    pub fn read(&self, tool_call_id: &str) -> anyhow::Result<String> {
        let path = self.path_for(tool_call_id);
        std::fs::read_to_string(&path)
            .with_context(|| format!("no stored result for {tool_call_id}"))
    }
}

/// Keep ids filesystem-safe without losing uniqueness for well-formed ids
/// (providers use `[A-Za-z0-9_-]`).
fn sanitize_key(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
