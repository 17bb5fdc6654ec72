//! Command-line and environment configuration.

use crate::policy::CommandPolicy;
use crate::registry::RegistrySettings;
use crate::sandbox::mock::MockBackend;
use crate::sandbox::{default_bootstrap_commands, Backend, EnvironmentConfig, ResourceLimits, WORKSPACE_DIR};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "cli-quest")]
#[command(about = "Sandboxed terminal sessions for CLI Quest challenges")]
#[command(version)]
pub struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "CLI_QUEST_LOG_JSON")]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the HTTP and terminal server
    Serve(ServeArgs),
    /// Run one command in a fresh sandbox and print its output
    Run(RunArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    #[arg(long, env = "CLI_QUEST_HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// Port to listen on
    #[arg(long, env = "CLI_QUEST_PORT", default_value = "8000")]
    pub port: u16,

    /// Seconds a disconnected session waits for a reconnect (0 = terminate at once)
    #[arg(long, env = "CLI_QUEST_GRACE_SECS", default_value = "30")]
    pub grace_secs: u64,

    /// Seconds without a connection or command before a session is reaped
    #[arg(long, env = "CLI_QUEST_IDLE_TTL_SECS", default_value = "1800")]
    pub idle_ttl_secs: u64,

    /// Commands queued per session before submitters wait
    #[arg(long, env = "CLI_QUEST_QUEUE_DEPTH", default_value = "32")]
    pub queue_depth: usize,

    /// JSON challenge catalog; the built-in catalog is used when absent
    #[arg(long, env = "CLI_QUEST_CHALLENGES")]
    pub challenges: Option<PathBuf>,

    /// Origins allowed by CORS
    #[arg(
        long = "allowed-origin",
        env = "CLI_QUEST_ALLOWED_ORIGINS",
        value_delimiter = ',',
        default_values = ["http://localhost:5173", "http://localhost:5174", "http://localhost:4173"]
    )]
    pub allowed_origins: Vec<String>,

    #[command(flatten)]
    pub sandbox: SandboxArgs,
}

impl ServeArgs {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn registry_settings(&self) -> RegistrySettings {
        RegistrySettings {
            grace_period: Duration::from_secs(self.grace_secs),
            idle_ttl: Duration::from_secs(self.idle_ttl_secs),
            queue_depth: self.queue_depth,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub sandbox: SandboxArgs,

    /// Command to run
    #[arg(last = true, required = true)]
    pub command: Vec<String>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Linux namespaces, chroot and cgroups. Requires root.
    Native,
    /// In-memory emulation for development and tests.
    Mock,
}

#[derive(Args, Debug, Clone)]
pub struct SandboxArgs {
    #[arg(long, value_enum, env = "CLI_QUEST_BACKEND", default_value = "native")]
    pub backend: BackendKind,

    /// Where native container roots are created
    #[arg(long, env = "CLI_QUEST_SANDBOX_DIR", default_value = "/tmp/cli-quest")]
    pub sandbox_dir: PathBuf,

    #[arg(long, env = "CLI_QUEST_SHELL", default_value = "/bin/bash")]
    pub shell: String,

    /// Memory limit in MiB
    #[arg(long, env = "CLI_QUEST_MEMORY_MB", default_value = "128")]
    pub memory_mb: u64,

    /// CPU quota as a percentage of one core
    #[arg(long, env = "CLI_QUEST_CPU_PERCENT", default_value = "50")]
    pub cpu_percent: u32,

    #[arg(long, env = "CLI_QUEST_PIDS_MAX", default_value = "64")]
    pub pids_max: u64,

    /// Wall-clock limit per command in seconds
    #[arg(long, env = "CLI_QUEST_EXEC_TIMEOUT_SECS", default_value = "30")]
    pub exec_timeout_secs: u64,

    /// Seconds to wait for a graceful stop before killing
    #[arg(long, env = "CLI_QUEST_STOP_TIMEOUT_SECS", default_value = "5")]
    pub stop_timeout_secs: u64,

    /// Output bytes kept per command
    #[arg(long, env = "CLI_QUEST_MAX_OUTPUT_BYTES", default_value = "1048576")]
    pub max_output_bytes: usize,

    /// Extra denylist substrings
    #[arg(long = "deny", env = "CLI_QUEST_DENY", value_delimiter = ',')]
    pub deny: Vec<String>,
}

impl SandboxArgs {
    pub fn environment_config(&self) -> EnvironmentConfig {
        EnvironmentConfig {
            workdir: WORKSPACE_DIR.to_string(),
            shell: self.shell.clone(),
            limits: ResourceLimits {
                memory_bytes: self.memory_mb * 1024 * 1024,
                cpu_percent: self.cpu_percent,
                pids_max: self.pids_max,
                network_disabled: true,
                exec_timeout: Duration::from_secs(self.exec_timeout_secs),
                max_output_bytes: self.max_output_bytes,
            },
            stop_timeout: Duration::from_secs(self.stop_timeout_secs),
            bootstrap_commands: default_bootstrap_commands(),
        }
    }

    pub fn policy(&self) -> CommandPolicy {
        CommandPolicy::with_extra_patterns(&self.deny)
    }

    pub fn backend(&self) -> anyhow::Result<Arc<dyn Backend>> {
        match self.backend {
            BackendKind::Mock => Ok(Arc::new(MockBackend::new())),
            BackendKind::Native => native_backend(&self.sandbox_dir),
        }
    }
}

#[cfg(target_os = "linux")]
fn native_backend(base_dir: &std::path::Path) -> anyhow::Result<Arc<dyn Backend>> {
    if !nix::unistd::geteuid().is_root() {
        anyhow::bail!("the native backend must run as root (namespaces, mounts and cgroups need CAP_SYS_ADMIN)");
    }
    std::fs::create_dir_all(base_dir)
        .map_err(|e| anyhow::anyhow!("creating sandbox dir {}: {}", base_dir.display(), e))?;
    Ok(Arc::new(crate::sandbox::native::NativeBackend::new(base_dir)))
}

#[cfg(not(target_os = "linux"))]
fn native_backend(_base_dir: &std::path::Path) -> anyhow::Result<Arc<dyn Backend>> {
    anyhow::bail!("the native backend only works on Linux; use --backend mock")
}
