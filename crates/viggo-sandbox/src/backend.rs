// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Sandbox backend detection.

use std::path::Path;

/// A concrete isolation mechanism, in order of preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Linux: seccomp-filtered + namespace-isolated subprocess.
    Landlock,
    /// Linux: namespace isolation via the `bwrap` wrapper binary.
    Bubblewrap,
    /// macOS: Seatbelt profile via `sandbox-exec`.
    Seatbelt,
    /// Containerized execution (docker/podman).
    Container,
    /// No isolation available.
    None,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Landlock => "landlock",
            Backend::Bubblewrap => "bubblewrap",
            Backend::Seatbelt => "seatbelt",
            Backend::Container => "container",
            Backend::None => "none",
        }
    }

    pub fn from_name(name: &str) -> Option<Backend> {
        match name {
            "landlock" => Some(Backend::Landlock),
            "bubblewrap" => Some(Backend::Bubblewrap),
            "seatbelt" => Some(Backend::Seatbelt),
            "container" => Some(Backend::Container),
            "none" => Some(Backend::None),
            _ => None,
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pick the strongest available backend for this host.
///
/// Preference order: Landlock (seccomp + namespaces) > Bubblewrap >
/// Seatbelt > Container > None.  An explicit `override_name` short-circuits
/// detection.
pub fn detect(override_name: Option<&str>) -> Backend {
    if let Some(name) = override_name {
        if let Some(b) = Backend::from_name(name) {
            return b;
        }
        tracing::warn!(backend = name, "unknown sandbox backend override; auto-detecting");
    }

    if cfg!(target_os = "linux") {
        if unprivileged_userns_available() {
            return Backend::Landlock;
        }
        if binary_on_path("bwrap") {
            return Backend::Bubblewrap;
        }
    }
    if cfg!(target_os = "macos") && Path::new("/usr/bin/sandbox-exec").exists() {
        return Backend::Seatbelt;
    }
    if binary_on_path("docker") || binary_on_path("podman") {
        return Backend::Container;
    }
    Backend::None
}

/// Unprivileged user namespaces are the prerequisite for the Landlock
/// backend's namespace setup.
fn unprivileged_userns_available() -> bool {
    match std::fs::read_to_string("/proc/sys/kernel/unprivileged_userns_clone") {
        Ok(v) => v.trim() == "1",
        // The knob is Debian-specific; absence means namespaces are not
        // gated and the max_user_namespaces sysctl decides.
        Err(_) => std::fs::read_to_string("/proc/sys/user/max_user_namespaces")
            .map(|v| v.trim().parse::<u64>().map(|n| n > 0).unwrap_or(false))
            .unwrap_or(false),
    }
}

fn binary_on_path(name: &str) -> bool {
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| dir.join(name).is_file())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_names_round_trip() {
        for b in [
            Backend::Landlock,
            Backend::Bubblewrap,
            Backend::Seatbelt,
            Backend::Container,
            Backend::None,
        ] {
            assert_eq!(Backend::from_name(b.as_str()), Some(b));
        }
    }

    #[test]
    fn unknown_name_is_none() {
        assert_eq!(Backend::from_name("chroot"), None);
    }

    #[test]
    fn override_wins_over_detection() {
        assert_eq!(detect(Some("none")), Backend::None);
        assert_eq!(detect(Some("container")), Backend::Container);
    }

    #[test]
    fn bad_override_falls_back_to_detection() {
        // Whatever detection yields, it must be deterministic per host.
        assert_eq!(detect(Some("bogus")), detect(None));
    }
}
