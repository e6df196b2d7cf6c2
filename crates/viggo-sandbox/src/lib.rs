// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Subprocess isolation for tool execution.
//!
//! The sandbox wraps every shell/tool subprocess in the strongest isolation
//! mechanism the host offers: seccomp-filtered namespaces on Linux, a
//! Seatbelt profile on macOS, a container as a portable fallback, or — when
//! the policy allows it — nothing at all.

pub mod backend;
pub mod seccomp;
pub mod seatbelt;

use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tracing::{debug, warn};

use viggo_config::SandboxConfig;

pub use backend::Backend;

const DEFAULT_CONTAINER_IMAGE: &str = "debian:stable-slim";

/// Error kinds callers match on.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("no sandbox backend available and unsandboxed execution is disabled")]
    Unavailable,
    #[error("path {0} escapes the workspace and outside-workspace writes are disabled")]
    OutsideWorkspace(PathBuf),
    #[error("failed to spawn subprocess: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Outcome of one subprocess execution.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub timed_out: bool,
    pub backend: Backend,
    pub sandboxed: bool,
}

/// Execution counters for status display.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SandboxStats {
    pub commands_run: u64,
    pub commands_sandboxed: u64,
    pub commands_bypassed: u64,
}

/// Process-lifetime sandbox.  Internally synchronized; share via `Arc`.
pub struct Sandbox {
    config: SandboxConfig,
    backend: Backend,
    workspace_root: PathBuf,
    stats: Mutex<SandboxStats>,
}

impl Sandbox {
    pub fn new(config: SandboxConfig, workspace_root: PathBuf) -> Self {
        let backend = backend::detect(config.backend.as_deref());
        debug!(backend = %backend, "sandbox backend selected");
        Self {
            config,
            backend,
            workspace_root,
            stats: Mutex::new(SandboxStats::default()),
        }
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn stats(&self) -> SandboxStats {
        *self.stats.lock().unwrap()
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Execute `argv` under the selected backend.
    pub async fn exec(&self, argv: &[String]) -> Result<ExecResult, SandboxError> {
        if argv.is_empty() {
            return Err(SandboxError::Spawn(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty argv",
            )));
        }
        self.run(argv).await
    }

    /// Execute a shell command line via the platform shell.
    pub async fn exec_shell(&self, command: &str) -> Result<ExecResult, SandboxError> {
        let argv: Vec<String> = if cfg!(windows) {
            vec!["cmd".into(), "/c".into(), command.into()]
        } else {
            vec!["sh".into(), "-c".into(), command.into()]
        };
        self.run(&argv).await
    }

    /// Prepare a ready-to-spawn [`Command`] for `argv`, with the backend
    /// wrapping, environment, and process setup applied.
    ///
    /// Used internally by [`exec`](Self::exec); also public so streaming
    /// tools can own the child's stdout while keeping the same isolation.
    /// Stats are recorded here, once per prepared command.
    pub fn prepare(&self, argv: &[String]) -> Result<(Command, Backend, bool), SandboxError> {
        let bypass = self.is_excluded(&argv_binary(argv));
        let (backend, sandboxed) = if bypass {
            (Backend::None, false)
        } else {
            match self.backend {
                Backend::None if !self.config.allow_unsandboxed => {
                    return Err(SandboxError::Unavailable);
                }
                Backend::None => {
                    warn!("no sandbox backend available; running unsandboxed");
                    (Backend::None, false)
                }
                b => (b, true),
            }
        };

        let (program, args) = self.wrapped_invocation(argv, backend);
        let mut cmd = Command::new(&program);
        cmd.args(&args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        // When the timeout fires and the future is dropped, tokio delivers
        // SIGKILL to the child before releasing the handle.
        cmd.kill_on_drop(true);
        if sandboxed {
            cmd.env("HOME", "/tmp");
            cmd.env("PATH", "/usr/local/bin:/usr/bin:/bin");
        }
        if backend != Backend::Container {
            if let Some(wd) = &self.config.work_dir {
                cmd.current_dir(wd);
            }
        }

        #[cfg(unix)]
        {
            let limits = self.config.limits.clone();
            let filter_bytes = if sandboxed && backend == Backend::Landlock {
                Some(seccomp::serialize_filter(&seccomp::build_filter()))
            } else {
                None
            };
            unsafe {
                cmd.pre_exec(move || {
                    // New session: the child has no controlling terminal, so
                    // it cannot corrupt the caller's TTY state.
                    libc::setsid();
                    apply_rlimits(&limits);
                    if let Some(bytes) = &filter_bytes {
                        // The isolation wrapper reads the BPF program from
                        // fd 9 and installs it before exec'ing the payload.
                        install_filter_fd(bytes)?;
                    }
                    Ok(())
                });
            }
        }

        {
            let mut stats = self.stats.lock().unwrap();
            stats.commands_run += 1;
            if bypass {
                stats.commands_bypassed += 1;
            } else if sandboxed {
                stats.commands_sandboxed += 1;
            }
        }

        Ok((cmd, backend, sandboxed))
    }

    /// The sandbox's own execution timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }

    async fn run(&self, argv: &[String]) -> Result<ExecResult, SandboxError> {
        let (mut cmd, backend, sandboxed) = self.prepare(argv)?;

        let started = Instant::now();
        let result = tokio::time::timeout(self.timeout(), cmd.output()).await;

        match result {
            Ok(Ok(output)) => Ok(ExecResult {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                duration: started.elapsed(),
                timed_out: false,
                backend,
                sandboxed,
            }),
            Ok(Err(e)) => Err(SandboxError::Spawn(e)),
            Err(_) => Ok(ExecResult {
                exit_code: -1,
                stdout: String::new(),
                stderr: format!("timed out after {}s", self.config.timeout_secs),
                duration: started.elapsed(),
                timed_out: true,
                backend,
                sandboxed,
            }),
        }
    }

    /// The concrete (program, args) invocation for `argv` under `backend`.
    ///
    /// Exposed at crate level so the wrapping logic is testable without
    /// spawning anything.
    pub(crate) fn wrapped_invocation(
        &self,
        argv: &[String],
        backend: Backend,
    ) -> (String, Vec<String>) {
        match backend {
            Backend::None => (argv[0].clone(), argv[1..].to_vec()),
            Backend::Seatbelt => self.seatbelt_invocation(argv),
            Backend::Landlock => {
                // Namespace wrapper; the seccomp program arrives on fd 9
                // via pre_exec.
                let mut args = vec![
                    "--map-root-user".to_string(),
                    "--pid".to_string(),
                    "--fork".to_string(),
                    "--uts".to_string(),
                    "--cgroup".to_string(),
                ];
                if !self.config.allow_network {
                    args.push("--net".to_string());
                }
                args.push("--".to_string());
                args.extend(argv.iter().cloned());
                ("unshare".to_string(), args)
            }
            Backend::Bubblewrap => {
                let mut args = vec![
                    "--die-with-parent".to_string(),
                    "--unshare-user".to_string(),
                    "--unshare-pid".to_string(),
                    "--unshare-uts".to_string(),
                    "--unshare-cgroup".to_string(),
                ];
                if !self.config.allow_network {
                    args.push("--unshare-net".to_string());
                }
                for p in &self.config.read_only_paths {
                    let s = p.to_string_lossy().into_owned();
                    args.extend(["--ro-bind".to_string(), s.clone(), s]);
                }
                for p in &self.config.read_write_paths {
                    let s = p.to_string_lossy().into_owned();
                    args.extend(["--bind".to_string(), s.clone(), s]);
                }
                if let Some(wd) = &self.config.work_dir {
                    let s = wd.to_string_lossy().into_owned();
                    args.extend(["--bind".to_string(), s.clone(), s.clone()]);
                    args.extend(["--chdir".to_string(), s]);
                }
                args.extend(["--setenv".to_string(), "HOME".to_string(), "/tmp".to_string()]);
                args.extend([
                    "--setenv".to_string(),
                    "PATH".to_string(),
                    "/usr/local/bin:/usr/bin:/bin".to_string(),
                ]);
                args.push("--".to_string());
                args.extend(argv.iter().cloned());
                ("bwrap".to_string(), args)
            }
            Backend::Container => {
                let mut args = vec!["run".to_string(), "--rm".to_string()];
                if !self.config.allow_network {
                    args.extend(["--network".to_string(), "none".to_string()]);
                }
                for p in &self.config.read_only_paths {
                    let s = p.to_string_lossy().into_owned();
                    args.extend(["-v".to_string(), format!("{s}:{s}:ro")]);
                }
                for p in &self.config.read_write_paths {
                    let s = p.to_string_lossy().into_owned();
                    args.extend(["-v".to_string(), format!("{s}:{s}")]);
                }
                if let Some(wd) = &self.config.work_dir {
                    let s = wd.to_string_lossy().into_owned();
                    args.extend(["-v".to_string(), format!("{s}:{s}")]);
                    args.extend(["-w".to_string(), s]);
                }
                args.push(DEFAULT_CONTAINER_IMAGE.to_string());
                args.extend(argv.iter().cloned());
                ("docker".to_string(), args)
            }
        }
    }

    fn seatbelt_invocation(&self, argv: &[String]) -> (String, Vec<String>) {
        // The profile file must outlive the subprocess; it is written to a
        // stable per-run location and removed after exec (see run()).  Here
        // we only render the argv shape.
        let profile = seatbelt::build_profile(&self.config);
        let file = write_profile(&profile);
        let mut args = vec!["-f".to_string(), file];
        args.extend(argv.iter().cloned());
        ("sandbox-exec".to_string(), args)
    }

    fn is_excluded(&self, binary: &str) -> bool {
        self.config
            .excluded_commands
            .iter()
            .any(|c| c == binary)
    }

    /// Resolve and validate a path a file-writing tool wants to touch.
    ///
    /// Relative paths resolve against the workspace root.  The normalized
    /// path must stay inside the workspace unless the policy allows
    /// outside-workspace writes.
    pub fn resolve_write_path(&self, path: &Path) -> Result<PathBuf, SandboxError> {
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace_root.join(path)
        };
        let normalized = normalize(&absolute);
        if !self.config.allow_outside_workspace
            && !normalized.starts_with(&self.workspace_root)
        {
            return Err(SandboxError::OutsideWorkspace(normalized));
        }
        Ok(normalized)
    }
}

/// Persist a Seatbelt profile to a temp file and return its path.
///
/// The file is cleaned up by the OS temp reaper; `sandbox-exec` only needs
/// it at launch time.
fn write_profile(profile: &str) -> String {
    match tempfile::Builder::new()
        .prefix("viggo-sb-")
        .suffix(".sb")
        .tempfile()
    {
        Ok(file) => {
            let _ = std::fs::write(file.path(), profile);
            match file.keep() {
                Ok((_, path)) => path.to_string_lossy().into_owned(),
                Err(_) => "/dev/null".to_string(),
            }
        }
        Err(_) => "/dev/null".to_string(),
    }
}

fn argv_binary(argv: &[String]) -> String {
    argv.first()
        .map(|p| {
            Path::new(p)
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_else(|| p.clone())
        })
        .unwrap_or_default()
}

/// Lexical normalization: resolves `.` and `..` without touching the
/// filesystem, so paths that do not exist yet can still be validated.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(target_os = "linux")]
fn apply_rlimits(limits: &viggo_config::ResourceLimits) {
    unsafe {
        if limits.max_memory > 0 {
            set_rlimit(libc::RLIMIT_AS, limits.max_memory);
        }
        if limits.max_cpu_time > 0 {
            set_rlimit(libc::RLIMIT_CPU, limits.max_cpu_time);
        }
        if limits.max_processes > 0 {
            set_rlimit(libc::RLIMIT_NPROC, limits.max_processes);
        }
        if limits.max_file_size > 0 {
            set_rlimit(libc::RLIMIT_FSIZE, limits.max_file_size);
        }
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
fn apply_rlimits(_limits: &viggo_config::ResourceLimits) {
    // Seatbelt carries the containment on macOS; rlimits are Linux-only.
}

#[cfg(target_os = "linux")]
unsafe fn set_rlimit(resource: libc::__rlimit_resource_t, value: u64) {
    let lim = libc::rlimit {
        rlim_cur: value,
        rlim_max: value,
    };
    libc::setrlimit(resource, &lim);
}

/// Create a pipe carrying `bytes` and dup its read end onto fd 9 for the
/// isolation wrapper.  Runs between fork and exec; async-signal-safe calls
/// only.
#[cfg(unix)]
fn install_filter_fd(bytes: &[u8]) -> std::io::Result<()> {
    unsafe {
        let mut fds = [0i32; 2];
        if libc::pipe(fds.as_mut_ptr()) != 0 {
            return Err(std::io::Error::last_os_error());
        }
        let written = libc::write(fds[1], bytes.as_ptr().cast(), bytes.len());
        if written < 0 {
            return Err(std::io::Error::last_os_error());
        }
        libc::close(fds[1]);
        if libc::dup2(fds[0], 9) < 0 {
            return Err(std::io::Error::last_os_error());
        }
        if fds[0] != 9 {
            libc::close(fds[0]);
        }
    }
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
