//! Isolated execution environments.
//!
//! An [`Environment`] owns at most one backing container and mediates every
//! interaction with it. The container itself is provided by a [`Backend`]:
//! the namespace/chroot sandbox on Linux, or an in-memory mock.

pub mod mock;
#[cfg(target_os = "linux")]
pub mod native;

use crate::error::SandboxError;
use crate::policy::{CommandPolicy, REJECTION_MESSAGE};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Default working directory inside every container.
pub const WORKSPACE_DIR: &str = "/workspace";

/// Container name prefix; the session id is appended.
pub const CONTAINER_PREFIX: &str = "cli-quest-";

/// Resource ceilings applied to a container and to each command in it.
#[derive(Debug, Clone)]
pub struct ResourceLimits {
    pub memory_bytes: u64,
    /// Percentage of one CPU core.
    pub cpu_percent: u32,
    pub pids_max: u64,
    pub network_disabled: bool,
    /// Wall-clock limit for a single command.
    pub exec_timeout: Duration,
    pub max_output_bytes: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_bytes: 128 * 1024 * 1024,
            cpu_percent: 50,
            pids_max: 64,
            network_disabled: true,
            exec_timeout: Duration::from_secs(30),
            max_output_bytes: 1024 * 1024,
        }
    }
}

/// Settings shared by every environment created by one server.
#[derive(Debug, Clone)]
pub struct EnvironmentConfig {
    pub workdir: String,
    pub shell: String,
    pub limits: ResourceLimits,
    pub stop_timeout: Duration,
    /// Run once after allocation. Failures are logged, never fatal.
    pub bootstrap_commands: Vec<String>,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            workdir: WORKSPACE_DIR.to_string(),
            shell: "/bin/bash".to_string(),
            limits: ResourceLimits::default(),
            stop_timeout: Duration::from_secs(5),
            bootstrap_commands: default_bootstrap_commands(),
        }
    }
}

pub fn default_bootstrap_commands() -> Vec<String> {
    vec![
        "mkdir -p /workspace/challenges".to_string(),
        "echo 'Welcome to CLI Quest!' > /workspace/README.txt".to_string(),
        "echo 'Use ls to see available files and directories.' >> /workspace/README.txt".to_string(),
    ]
}

/// What a backend needs to allocate a container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub workdir: String,
    pub shell: String,
    pub limits: ResourceLimits,
}

/// Opaque reference to a live container, keyed by name inside its backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub name: String,
}

/// Combined stdout/stderr and exit status of one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub output: String,
    pub exit_code: i32,
}

/// A container runtime. All calls block and are expected to run on the
/// blocking thread pool.
pub trait Backend: Send + Sync + 'static {
    fn kind(&self) -> &'static str;

    fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle, SandboxError>;

    /// Run `command` through the container's shell inside its workdir.
    fn exec(&self, container: &ContainerHandle, command: &str) -> Result<ExecOutput, SandboxError>;

    fn resize(&self, container: &ContainerHandle, cols: u16, rows: u16) -> Result<(), SandboxError>;

    /// Write `content` to `path`, relative to the workdir, replacing any
    /// existing file.
    fn write_file(
        &self,
        container: &ContainerHandle,
        path: &Path,
        content: &[u8],
    ) -> Result<(), SandboxError>;

    /// Stop gracefully within `timeout`. On error the container is still
    /// known to the backend and may be killed.
    fn stop(&self, container: &ContainerHandle, timeout: Duration) -> Result<(), SandboxError>;

    /// Forced termination. The backend forgets the container even on error.
    fn kill(&self, container: &ContainerHandle) -> Result<(), SandboxError>;
}

/// Append the exit-code marker for failed commands.
pub fn format_output(result: ExecOutput) -> String {
    let mut text = result.output;
    if result.exit_code != 0 {
        text.push_str(&format!("\n[Exit code: {}]", result.exit_code));
    }
    text
}

/// Validate a provisioned file name and make it relative to the workdir.
/// A leading `/` is treated as the workdir itself; `..` is rejected.
pub fn workspace_relative(name: &str) -> Result<PathBuf, SandboxError> {
    let trimmed = name.trim_start_matches('/');
    let path = Path::new(trimmed);
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if trimmed.is_empty() || escapes {
        return Err(SandboxError::InvalidPath(name.to_string()));
    }
    Ok(path.to_path_buf())
}

/// One session's isolated execution environment.
pub struct Environment {
    name: String,
    config: Arc<EnvironmentConfig>,
    policy: Arc<CommandPolicy>,
    backend: Arc<dyn Backend>,
    container: Mutex<Option<ContainerHandle>>,
}

impl Environment {
    pub fn new(
        session_id: &str,
        config: Arc<EnvironmentConfig>,
        policy: Arc<CommandPolicy>,
        backend: Arc<dyn Backend>,
    ) -> Self {
        Self {
            name: format!("{}{}", CONTAINER_PREFIX, session_id),
            config,
            policy,
            backend,
            container: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn workdir(&self) -> &str {
        &self.config.workdir
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.config.limits
    }

    pub fn is_initialized(&self) -> bool {
        self.slot().is_some()
    }

    fn slot(&self) -> MutexGuard<'_, Option<ContainerHandle>> {
        self.container.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current(&self) -> Option<ContainerHandle> {
        self.slot().clone()
    }

    /// Allocate the backing container, replacing any previous one.
    pub fn initialize(&self) -> Result<(), SandboxError> {
        self.cleanup();

        let spec = ContainerSpec {
            name: self.name.clone(),
            workdir: self.config.workdir.clone(),
            shell: self.config.shell.clone(),
            limits: self.config.limits.clone(),
        };
        let handle = self.backend.create(&spec).map_err(|e| match e {
            SandboxError::FatalInit(_) => e,
            other => SandboxError::FatalInit(other.to_string()),
        })?;
        *self.slot() = Some(handle.clone());

        for command in &self.config.bootstrap_commands {
            match self.backend.exec(&handle, command) {
                Ok(out) if out.exit_code == 0 => {}
                Ok(out) => warn!(
                    container = %self.name,
                    command = %command,
                    exit_code = out.exit_code,
                    output = %out.output.trim_end(),
                    "Setup command failed"
                ),
                Err(e) => warn!(container = %self.name, command = %command, error = %e, "Error running setup command"),
            }
        }

        info!(container = %self.name, backend = self.backend.kind(), "Sandbox container initialized");
        Ok(())
    }

    /// Run one command. Only a missing container is an error: blocked
    /// commands and runtime failures come back as text.
    pub fn execute(&self, command: &str) -> Result<String, SandboxError> {
        let handle = self.current().ok_or(SandboxError::NotInitialized)?;

        if let Some(pattern) = self.policy.matched_pattern(command) {
            warn!(container = %self.name, command = %command, pattern = %pattern, "Blocked command");
            return Ok(REJECTION_MESSAGE.to_string());
        }

        debug!(container = %self.name, command = %command, "Executing command");
        match self.backend.exec(&handle, command) {
            Ok(result) => Ok(format_output(result)),
            Err(e) => {
                error!(container = %self.name, error = %e, "Command execution error");
                Ok(format!("Error executing command: {}", e))
            }
        }
    }

    pub fn resize(&self, cols: u16, rows: u16) {
        let Some(handle) = self.current() else {
            debug!(container = %self.name, "Resize ignored, no container");
            return;
        };
        if let Err(e) = self.backend.resize(&handle, cols, rows) {
            warn!(container = %self.name, cols, rows, error = %e, "Failed to resize terminal");
        }
    }

    /// Write seed files into the workdir. Each file is independent.
    pub fn provision_files(&self, files: &BTreeMap<String, String>) -> Result<(), SandboxError> {
        let handle = self.current().ok_or(SandboxError::NotInitialized)?;

        for (name, content) in files {
            let written = workspace_relative(name)
                .and_then(|path| self.backend.write_file(&handle, &path, content.as_bytes()));
            match written {
                Ok(()) => debug!(container = %self.name, file = %name, "Provisioned file"),
                Err(e) => error!(container = %self.name, file = %name, error = %e, "Failed to create challenge file"),
            }
        }
        Ok(())
    }

    /// Stop the container, escalating to a forced kill. Leaves no container
    /// behind in any case and is a no-op when there is none.
    pub fn cleanup(&self) {
        let Some(handle) = self.slot().take() else {
            return;
        };

        match self.backend.stop(&handle, self.config.stop_timeout) {
            Ok(()) => info!(container = %self.name, "Sandbox container stopped"),
            Err(e) => {
                error!(container = %self.name, error = %e, "Error stopping container");
                if let Err(kill_error) = self.backend.kill(&handle) {
                    error!(container = %self.name, error = %kill_error, "Error killing container");
                }
            }
        }
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("name", &self.name)
            .field("backend", &self.backend.kind())
            .field("container", &self.current())
            .finish()
    }
}

/// Builds environments that share one backend, policy and config.
#[derive(Clone)]
pub struct EnvironmentFactory {
    pub config: Arc<EnvironmentConfig>,
    pub policy: Arc<CommandPolicy>,
    pub backend: Arc<dyn Backend>,
}

impl EnvironmentFactory {
    pub fn new(config: EnvironmentConfig, policy: CommandPolicy, backend: Arc<dyn Backend>) -> Self {
        Self {
            config: Arc::new(config),
            policy: Arc::new(policy),
            backend,
        }
    }

    pub fn environment(&self, session_id: &str) -> Environment {
        Environment::new(
            session_id,
            self.config.clone(),
            self.policy.clone(),
            self.backend.clone(),
        )
    }
}
