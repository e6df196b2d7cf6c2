// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! macOS Seatbelt profile generation.
//!
//! Profiles are deny-by-default with explicit allows per policy path; the
//! profile is written to a temp file and handed to `sandbox-exec -f`.

use std::path::Path;

use viggo_config::SandboxConfig;

/// Render a Seatbelt profile for `config`.
pub fn build_profile(config: &SandboxConfig) -> String {
    let mut p = String::new();
    p.push_str("(version 1)\n");
    p.push_str("(deny default)\n");
    // Minimal process bootstrap.
    p.push_str("(allow process-exec)\n");
    p.push_str("(allow sysctl-read)\n");
    p.push_str("(allow mach-lookup)\n");

    if config.allow_subprocess {
        p.push_str("(allow process-fork)\n");
    } else {
        p.push_str("(deny process-fork)\n");
    }

    if config.allow_network {
        p.push_str("(allow network*)\n");
    } else {
        p.push_str("(deny network*)\n");
    }

    // Devices every shell pipeline touches.
    p.push_str("(allow file-read* file-write* (literal \"/dev/null\"))\n");
    p.push_str("(allow file-read* (literal \"/dev/random\") (literal \"/dev/urandom\"))\n");
    // Temp space is always writable.
    push_rw(&mut p, Path::new("/tmp"));

    for path in &config.read_only_paths {
        push_ro(&mut p, path);
    }
    for path in &config.read_write_paths {
        push_rw(&mut p, path);
    }
    if let Some(wd) = &config.work_dir {
        push_rw(&mut p, wd);
    }
    p
}

fn push_ro(profile: &mut String, path: &Path) {
    profile.push_str(&format!(
        "(allow file-read* (subpath \"{}\"))\n",
        escape(path)
    ));
}

fn push_rw(profile: &mut String, path: &Path) {
    profile.push_str(&format!(
        "(allow file-read* file-write* (subpath \"{}\"))\n",
        escape(path)
    ));
}

fn escape(path: &Path) -> String {
    path.to_string_lossy().replace('"', "\\\"")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
