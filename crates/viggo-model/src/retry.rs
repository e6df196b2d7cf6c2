// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Exponential backoff for outbound HTTP calls.
//!
//! Network errors and 5xx responses are retried (3 tries, 250 ms base,
//! ×2 factor, jitter).  4xx responses surface immediately — retrying a
//! request the server already rejected as malformed only wastes quota.

use std::future::Future;
use std::hash::{BuildHasher, Hasher};
use std::time::Duration;

use tracing::warn;

pub const MAX_TRIES: u32 = 3;
pub const BASE_DELAY_MS: u64 = 250;

/// Error classification for the retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transience {
    /// Network failure or 5xx — worth retrying.
    Retryable,
    /// 4xx or protocol error — retrying cannot help.
    Fatal,
}

/// Classify an HTTP status code.
pub fn classify_status(status: u16) -> Transience {
    if status >= 500 {
        Transience::Retryable
    } else {
        Transience::Fatal
    }
}

/// Delay before attempt `attempt` (0-based), with jitter.
///
/// Jitter is drawn from the std hasher's per-process random seed: no extra
/// dependency, and tests can still assert the bounds.
pub fn backoff_delay(attempt: u32) -> Duration {
    let base = BASE_DELAY_MS * 2u64.pow(attempt);
    let mut hasher = std::collections::hash_map::RandomState::new().build_hasher();
    hasher.write_u64(base);
    let jitter = hasher.finish() % (base / 2 + 1);
    Duration::from_millis(base + jitter)
}

/// Run `op` with exponential backoff.  `op` returns `Ok(T)` on success or
/// `Err((Transience, error))`; only `Retryable` errors are retried, and only
/// up to [`MAX_TRIES`] total attempts.
pub async fn with_backoff<T, F, Fut>(label: &str, mut op: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, (Transience, anyhow::Error)>>,
{
    let mut last_err: Option<anyhow::Error> = None;
    for attempt in 0..MAX_TRIES {
        match op().await {
            Ok(v) => return Ok(v),
            Err((Transience::Fatal, e)) => return Err(e),
            Err((Transience::Retryable, e)) => {
                warn!(attempt, error = %e, "{label}: transient failure, backing off");
                last_err = Some(e);
                if attempt + 1 < MAX_TRIES {
                    tokio::time::sleep(backoff_delay(attempt)).await;
                }
            }
        }
    }
    Err(last_err.expect("at least one attempt was made"))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
