// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Per-lane serialization of tool executions.
//!
//! A lane (typically one session) serializes mutating jobs while letting
//! read-only jobs overlap.  Different lanes never contend.  The queue
//! protects logical resources — two edits to the same workspace must not
//! interleave — without giving up read parallelism.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{oneshot, RwLock, Semaphore};
use tracing::warn;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, thiserror::Error)]
pub enum LaneError {
    #[error("tool execution timed out after {0:?}")]
    Timeout(Duration),
    #[error("tool execution task was dropped before completing")]
    Canceled,
}

/// Options for one enqueue.
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    /// Read-only jobs may overlap; mutating jobs take the serial slot.
    pub parallel: bool,
    /// Descriptor category, recorded for diagnostics.
    pub category: String,
    /// Overall deadline, measured from enqueue.  `None` uses the default.
    pub timeout: Option<Duration>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            parallel: false,
            category: String::new(),
            timeout: None,
        }
    }
}

struct LaneState {
    /// Readers are parallel jobs, the writer is the serial slot.  The lock
    /// is write-preferring, so a queued mutating job blocks new read-only
    /// jobs from starting.
    rw: RwLock<()>,
    /// Bounds concurrently running read-only jobs.
    readonly_slots: Semaphore,
}

/// Process-lifetime scheduler; share via `Arc`.
pub struct LaneQueue {
    lanes: Mutex<HashMap<String, Arc<LaneState>>>,
    max_parallel_readonly: usize,
    default_timeout: Duration,
}

impl LaneQueue {
    pub fn new(max_parallel_readonly: usize, default_timeout: Duration) -> Self {
        Self {
            lanes: Mutex::new(HashMap::new()),
            max_parallel_readonly: max_parallel_readonly.max(1),
            default_timeout,
        }
    }

    fn lane(&self, id: &str) -> Arc<LaneState> {
        let mut lanes = self.lanes.lock().unwrap();
        lanes
            .entry(id.to_string())
            .or_insert_with(|| {
                Arc::new(LaneState {
                    rw: RwLock::new(()),
                    readonly_slots: Semaphore::new(self.max_parallel_readonly),
                })
            })
            .clone()
    }

    /// Run `job` in `lane` under the queue's scheduling rules.
    ///
    /// The timeout covers queueing plus execution.  When it fires the
    /// caller gets [`LaneError::Timeout`] while the job keeps running
    /// detached (still holding its lane slot, so ordering is preserved);
    /// its eventual result is discarded.
    pub async fn enqueue<T, F>(
        &self,
        lane: &str,
        opts: EnqueueOptions,
        job: F,
    ) -> Result<T, LaneError>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        let state = self.lane(lane);
        let timeout = opts.timeout.unwrap_or(self.default_timeout);
        let parallel = opts.parallel;
        let (tx, rx) = oneshot::channel::<T>();

        tokio::spawn(async move {
            let result = if parallel {
                // Permit first, then the read lock: writers never touch the
                // semaphore, so the ordering cannot deadlock.  The semaphore
                // is never closed; `ok()` keeps the permit alive if held.
                let _permit = state.readonly_slots.acquire().await.ok();
                let _read = state.rw.read().await;
                job.await
            } else {
                let _write = state.rw.write().await;
                job.await
            };
            // The receiver may be gone after a timeout; that is fine.
            let _ = tx.send(result);
        });

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(_)) => Err(LaneError::Canceled),
            Err(_) => {
                warn!(lane, category = %opts.category, ?timeout, "tool execution timed out");
                Err(LaneError::Timeout(timeout))
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
