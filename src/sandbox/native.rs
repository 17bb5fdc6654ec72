//! Namespace and chroot backed containers.
//!
//! A container is a tmpfs root with the host's system directories bind
//! mounted read-only, an entry shell running as PID 1 of its own namespaces,
//! and an optional cgroup carrying the resource ceilings (v2 when mounted,
//! otherwise the v1 cpu controller). Every command runs as a fresh chrooted
//! child in new PID, mount and network namespaces that shares the
//! container's root filesystem. Children give up root before `execve`: all
//! capabilities are dropped and they run as `nobody` with `no_new_privs` set.

use super::{Backend, ContainerHandle, ContainerSpec, ExecOutput, ResourceLimits};
use crate::error::SandboxError;
use dashmap::DashMap;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sched::{clone, CloneFlags};
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{chdir, chroot, execve, pipe2, setgroups, setresgid, setresuid, Gid, Pid, Uid};
use std::collections::HashSet;
use std::ffi::{CStr, CString};
use std::fs::{self, File};
use std::io::{self, ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::fs::{chown, fchown, OpenOptionsExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const STACK_SIZE: usize = 1024 * 1024;
const POLL_INTERVAL: Duration = Duration::from_millis(10);
const CGROUP_MOUNT: &str = "/sys/fs/cgroup";
const CPU_PERIOD_US: u64 = 100_000;
const FSIZE_LIMIT_BYTES: u64 = 16 * 1024 * 1024;
const NOFILE_LIMIT: u64 = 256;
const TIMEOUT_EXIT_CODE: i32 = 124;
const ROOT_TMPFS_OPTIONS: &str = "size=64M,mode=755";
const BIND_DIRS: [&str; 5] = ["/bin", "/lib", "/lib64", "/usr", "/etc"];
const DEVICES: [&str; 4] = ["null", "zero", "urandom", "random"];
const PATH_ENV: &str = "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
/// Unprivileged identity for everything run inside a container.
pub const NOBODY_UID: u32 = 65534;
pub const NOBODY_GID: u32 = 65534;
/// Highest capability number tried when emptying the bounding set.
const LAST_CAP: libc::c_ulong = 63;

/// Cgroups a container's processes join.
#[derive(Debug, Clone, Default)]
struct Cgroups {
    /// v2 group with memory, cpu and pids limits.
    unified: Option<PathBuf>,
    /// v1 cpu controller group, only when v2 is not mounted.
    cpu_v1: Option<PathBuf>,
}

impl Cgroups {
    fn paths(&self) -> impl Iterator<Item = &Path> {
        self.unified.iter().chain(self.cpu_v1.iter()).map(PathBuf::as_path)
    }

    fn caps_memory(&self) -> bool {
        self.unified.is_some()
    }
}

/// Commands currently running in a container.
#[derive(Debug, Default)]
struct Running {
    pids: HashSet<Pid>,
    /// Set once the container is being torn down. No new command may start.
    closed: bool,
}

type RunningSet = Arc<Mutex<Running>>;

fn lock(running: &Mutex<Running>) -> MutexGuard<'_, Running> {
    running.lock().unwrap_or_else(PoisonError::into_inner)
}

/// SIGKILL every running command and refuse new ones. A tracked pid is
/// only reaped with this lock held, so it cannot have been recycled.
fn kill_running(running: &Mutex<Running>) {
    let mut guard = lock(running);
    guard.closed = true;
    for pid in &guard.pids {
        // each command is the init of its own PID namespace, so its
        // descendants go with it
        let _ = kill(*pid, Signal::SIGKILL);
    }
}

#[derive(Debug)]
struct NativeContainer {
    root: PathBuf,
    workdir: String,
    shell: String,
    limits: ResourceLimits,
    init_pid: Pid,
    /// Write end of the entry shell's stdin. Dropping it ends the shell.
    stdin: Option<OwnedFd>,
    cgroups: Cgroups,
    terminal: (u16, u16),
    running: RunningSet,
}

/// Snapshot taken so no map entry is held while a command runs.
struct ExecContext {
    root: PathBuf,
    workdir: String,
    shell: String,
    limits: ResourceLimits,
    cgroups: Cgroups,
    terminal: (u16, u16),
    running: RunningSet,
}

impl NativeContainer {
    fn exec_context(&self) -> ExecContext {
        ExecContext {
            root: self.root.clone(),
            workdir: self.workdir.clone(),
            shell: self.shell.clone(),
            limits: self.limits.clone(),
            cgroups: self.cgroups.clone(),
            terminal: self.terminal,
            running: self.running.clone(),
        }
    }

    fn workspace(&self) -> PathBuf {
        self.root.join(self.workdir.trim_start_matches('/'))
    }
}

/// Requires root (mounts, namespaces and cgroups).
#[derive(Debug)]
pub struct NativeBackend {
    base_dir: PathBuf,
    cgroup_base: PathBuf,
    containers: DashMap<String, NativeContainer>,
}

impl NativeBackend {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            cgroup_base: Path::new(CGROUP_MOUNT).join("cli-quest"),
            containers: DashMap::new(),
        }
    }

    fn context(&self, container: &ContainerHandle) -> Result<ExecContext, SandboxError> {
        self.containers
            .get(&container.name)
            .map(|c| c.exec_context())
            .ok_or(SandboxError::NotInitialized)
    }

    fn create_cgroups(&self, name: &str, limits: &ResourceLimits) -> Cgroups {
        let mount = Path::new(CGROUP_MOUNT);
        if mount.join("cgroup.controllers").exists() {
            return match self.try_create_cgroup(name, limits) {
                Ok(path) => Cgroups {
                    unified: Some(path),
                    cpu_v1: None,
                },
                Err(e) => {
                    warn!(container = %name, error = %e, "Failed to create cgroup, falling back to rlimits");
                    let _ = fs::remove_dir(self.cgroup_base.join(name));
                    Cgroups::default()
                }
            };
        }

        let cpu_root = mount.join("cpu");
        if !cpu_root.join("cpu.cfs_quota_us").exists() {
            warn!(container = %name, "No usable cgroup hierarchy, falling back to rlimits");
            return Cgroups::default();
        }
        warn!(container = %name, "cgroup v2 unavailable, limiting CPU through cgroup v1");
        let path = cpu_root.join("cli-quest").join(name);
        match try_create_cpu_v1(&path, limits) {
            Ok(()) => Cgroups {
                unified: None,
                cpu_v1: Some(path),
            },
            Err(e) => {
                warn!(container = %name, error = %e, "Failed to create cpu cgroup, CPU is unlimited");
                let _ = fs::remove_dir(&path);
                Cgroups::default()
            }
        }
    }

    fn try_create_cgroup(&self, name: &str, limits: &ResourceLimits) -> std::io::Result<PathBuf> {
        fs::create_dir_all(&self.cgroup_base)?;
        if let Err(e) = fs::write(self.cgroup_base.join("cgroup.subtree_control"), "+memory +cpu +pids") {
            debug!(error = %e, "Could not enable cgroup controllers");
        }

        let path = self.cgroup_base.join(name);
        fs::create_dir_all(&path)?;
        fs::write(path.join("memory.max"), limits.memory_bytes.to_string())?;
        let _ = fs::write(path.join("memory.swap.max"), "0");
        fs::write(path.join("cpu.max"), format!("{} {}", cpu_quota_us(limits), CPU_PERIOD_US))?;
        fs::write(path.join("pids.max"), limits.pids_max.to_string())?;
        Ok(path)
    }
}

fn cpu_quota_us(limits: &ResourceLimits) -> u64 {
    (limits.cpu_percent as u64 * CPU_PERIOD_US / 100).max(1000)
}

fn try_create_cpu_v1(path: &Path, limits: &ResourceLimits) -> io::Result<()> {
    fs::create_dir_all(path)?;
    fs::write(path.join("cpu.cfs_period_us"), CPU_PERIOD_US.to_string())?;
    fs::write(path.join("cpu.cfs_quota_us"), cpu_quota_us(limits).to_string())
}

/// Kill whatever is left of a container and remove its resources.
fn destroy(container: NativeContainer) -> Result<(), String> {
    kill_running(&container.running);

    let mut problems = Vec::new();
    match kill(container.init_pid, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => problems.push(format!("kill: {}", e)),
    }
    match waitpid(container.init_pid, None) {
        Ok(_) | Err(Errno::ECHILD) => {}
        Err(e) => problems.push(format!("waitpid: {}", e)),
    }
    if let Err(e) = teardown(&container.root, &container.cgroups) {
        problems.push(e);
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(problems.join("; "))
    }
}

impl Backend for NativeBackend {
    fn kind(&self) -> &'static str {
        "native"
    }

    fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle, SandboxError> {
        if let Some((_, stale)) = self.containers.remove(&spec.name) {
            warn!(container = %spec.name, "Removing stale container with the same name");
            if let Err(e) = destroy(stale) {
                warn!(container = %spec.name, error = %e, "Stale container cleanup incomplete");
            }
        }

        let root = self.base_dir.join(&spec.name);
        setup_sandbox_dir(&root, &spec.workdir).map_err(SandboxError::FatalInit)?;
        let cgroups = self.create_cgroups(&spec.name, &spec.limits);
        let shell = resolve_shell(&root, &spec.shell);

        let spawned = spawn_entry_shell(&root, &spec.workdir, &shell, &spec.limits, &cgroups);
        let (init_pid, stdin) = match spawned {
            Ok(spawned) => spawned,
            Err(e) => {
                if let Err(teardown_error) = teardown(&root, &cgroups) {
                    warn!(container = %spec.name, error = %teardown_error, "Teardown after failed start");
                }
                return Err(SandboxError::FatalInit(e));
            }
        };

        info!(
            container = %spec.name,
            pid = %init_pid,
            cgroup_v2 = cgroups.unified.is_some(),
            cpu_v1 = cgroups.cpu_v1.is_some(),
            "Container started"
        );
        self.containers.insert(
            spec.name.clone(),
            NativeContainer {
                root,
                workdir: spec.workdir.clone(),
                shell,
                limits: spec.limits.clone(),
                init_pid,
                stdin: Some(stdin),
                cgroups,
                terminal: (80, 24),
                running: RunningSet::default(),
            },
        );
        Ok(ContainerHandle {
            name: spec.name.clone(),
        })
    }

    fn exec(&self, container: &ContainerHandle, command: &str) -> Result<ExecOutput, SandboxError> {
        let ctx = self.context(container)?;
        run_command(&ctx, command)
    }

    fn resize(&self, container: &ContainerHandle, cols: u16, rows: u16) -> Result<(), SandboxError> {
        let mut entry = self
            .containers
            .get_mut(&container.name)
            .ok_or(SandboxError::NotInitialized)?;
        entry.terminal = (cols, rows);
        Ok(())
    }

    fn write_file(
        &self,
        container: &ContainerHandle,
        path: &Path,
        content: &[u8],
    ) -> Result<(), SandboxError> {
        let workspace = self
            .containers
            .get(&container.name)
            .map(|c| c.workspace())
            .ok_or(SandboxError::NotInitialized)?;
        write_workspace_file(&workspace, path, content, Some((NOBODY_UID, NOBODY_GID)))?;
        Ok(())
    }

    fn stop(&self, container: &ContainerHandle, timeout: Duration) -> Result<(), SandboxError> {
        let (pid, stdin, running) = match self.containers.get_mut(&container.name) {
            Some(mut entry) => (entry.init_pid, entry.stdin.take(), entry.running.clone()),
            None => return Ok(()),
        };

        // a running command would otherwise outlive its container
        kill_running(&running);

        // EOF on stdin ends the entry shell. SIGTERM is ignored by a PID 1
        // without a handler, so it only helps when the shell installed one.
        drop(stdin);
        let _ = kill(pid, Signal::SIGTERM);

        match poll_exit(pid, timeout) {
            Ok(Some(_)) | Err(Errno::ECHILD) => {
                if let Some((_, c)) = self.containers.remove(&container.name) {
                    teardown(&c.root, &c.cgroups).map_err(SandboxError::Stop)?;
                }
                Ok(())
            }
            Ok(None) => Err(SandboxError::Stop(format!(
                "{} did not exit within {:?}",
                container.name, timeout
            ))),
            Err(e) => Err(SandboxError::Stop(format!("waitpid: {}", e))),
        }
    }

    fn kill(&self, container: &ContainerHandle) -> Result<(), SandboxError> {
        match self.containers.remove(&container.name) {
            Some((_, c)) => destroy(c).map_err(SandboxError::Kill),
            None => Ok(()),
        }
    }
}

/// Write `content` to `relative` under `workspace` without following any
/// symlink along the way. A link in place of a directory or of the file
/// itself is replaced. Created entries are handed to `owner` when given.
fn write_workspace_file(
    workspace: &Path,
    relative: &Path,
    content: &[u8],
    owner: Option<(u32, u32)>,
) -> io::Result<()> {
    let mut components: Vec<&std::ffi::OsStr> = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => components.push(part),
            _ => {
                return Err(io::Error::new(
                    ErrorKind::InvalidInput,
                    format!("{} is not a plain relative path", relative.display()),
                ))
            }
        }
    }
    let Some((file_name, dirs)) = components.split_last() else {
        return Err(io::Error::new(ErrorKind::InvalidInput, "empty path"));
    };

    let mut current = workspace.to_path_buf();
    for dir in dirs {
        current.push(dir);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.is_dir() => continue,
            Ok(meta) if meta.file_type().is_symlink() => fs::remove_file(&current)?,
            Ok(_) => {
                return Err(io::Error::new(
                    ErrorKind::AlreadyExists,
                    format!("{} is not a directory", current.display()),
                ))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        fs::create_dir(&current)?;
        fs::set_permissions(&current, fs::Permissions::from_mode(0o755))?;
        if let Some((uid, gid)) = owner {
            chown(&current, Some(uid), Some(gid))?;
        }
    }

    current.push(file_name);
    if fs::symlink_metadata(&current).is_ok_and(|m| m.file_type().is_symlink()) {
        fs::remove_file(&current)?;
    }
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o644)
        .custom_flags(libc::O_NOFOLLOW)
        .open(&current)?;
    file.write_all(content)?;
    file.set_permissions(fs::Permissions::from_mode(0o644))?;
    if let Some((uid, gid)) = owner {
        fchown(&file, Some(uid), Some(gid))?;
    }
    Ok(())
}

fn resolve_shell(root: &Path, shell: &str) -> String {
    if root.join(shell.trim_start_matches('/')).exists() {
        shell.to_string()
    } else {
        "/bin/sh".to_string()
    }
}

fn setup_sandbox_dir(sandbox_root: &Path, workdir: &str) -> Result<(), String> {
    // Clean up if exists
    if sandbox_root.exists() {
        teardown(sandbox_root, &Cgroups::default())?;
    }

    fs::create_dir_all(sandbox_root).map_err(|e| format!("mkdir: {}", e))?;

    mount(
        Some("tmpfs"),
        sandbox_root,
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        Some(ROOT_TMPFS_OPTIONS),
    )
    .map_err(|e| format!("mount tmpfs: {}", e))?;

    for dir in &BIND_DIRS {
        let target = sandbox_root.join(&dir[1..]);
        if Path::new(dir).exists() {
            fs::create_dir_all(&target).map_err(|e| format!("mkdir {}: {}", dir, e))?;
            mount(
                Some(*dir),
                &target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REC,
                None::<&str>,
            )
            .map_err(|e| format!("bind mount {}: {}", dir, e))?;
            mount(
                None::<&str>,
                &target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY | MsFlags::MS_REC,
                None::<&str>,
            )
            .map_err(|e| format!("remount ro {}: {}", dir, e))?;
        }
    }

    let tmp_dir = sandbox_root.join("tmp");
    fs::create_dir_all(&tmp_dir).map_err(|e| format!("mkdir tmp: {}", e))?;
    fs::set_permissions(&tmp_dir, fs::Permissions::from_mode(0o1777))
        .map_err(|e| format!("chmod tmp: {}", e))?;

    let dev_dir = sandbox_root.join("dev");
    fs::create_dir_all(&dev_dir).map_err(|e| format!("mkdir dev: {}", e))?;
    for dev in &DEVICES {
        let host_dev = format!("/dev/{}", dev);
        let sandbox_dev = dev_dir.join(dev);
        if Path::new(&host_dev).exists() {
            fs::write(&sandbox_dev, "").map_err(|e| format!("touch {}: {}", dev, e))?;
            mount(
                Some(host_dev.as_str()),
                &sandbox_dev,
                None::<&str>,
                MsFlags::MS_BIND,
                None::<&str>,
            )
            .map_err(|e| format!("bind mount {}: {}", dev, e))?;
        }
    }

    // mounted per process, inside its own PID namespace
    fs::create_dir_all(sandbox_root.join("proc")).map_err(|e| format!("mkdir proc: {}", e))?;

    let workspace = sandbox_root.join(workdir.trim_start_matches('/'));
    fs::create_dir_all(&workspace).map_err(|e| format!("mkdir workspace: {}", e))?;
    fs::set_permissions(&workspace, fs::Permissions::from_mode(0o755))
        .map_err(|e| format!("chmod workspace: {}", e))?;
    chown(&workspace, Some(NOBODY_UID), Some(NOBODY_GID))
        .map_err(|e| format!("chown workspace: {}", e))?;

    Ok(())
}

/// Unmount and remove a container root and its cgroups. Reports the first
/// hard failure but always attempts every step.
fn teardown(sandbox_root: &Path, cgroups: &Cgroups) -> Result<(), String> {
    let mut result = Ok(());

    if let Some(cgroup) = &cgroups.unified {
        // cgroup.kill exists from Linux 5.14; older kernels rely on the
        // namespace init having died already
        let _ = fs::write(cgroup.join("cgroup.kill"), "1");
    }

    for dev in &DEVICES {
        let dev_path = sandbox_root.join("dev").join(dev);
        if dev_path.exists() {
            let _ = umount2(&dev_path, MntFlags::MNT_DETACH);
        }
    }
    for dir in BIND_DIRS.iter().rev() {
        let path = sandbox_root.join(&dir[1..]);
        if path.exists() {
            let _ = umount2(&path, MntFlags::MNT_DETACH);
        }
    }

    if sandbox_root.exists() {
        match umount2(sandbox_root, MntFlags::MNT_DETACH) {
            Ok(()) => {
                let _ = fs::remove_dir_all(sandbox_root);
            }
            Err(Errno::EINVAL) => {
                // not a mount point; only remove the directory itself so a
                // stale bind mount can never be recursed into
                let _ = fs::remove_dir(sandbox_root);
            }
            Err(e) => result = Err(format!("umount {}: {}", sandbox_root.display(), e)),
        }
    }

    for cgroup in cgroups.paths() {
        let mut attempts = 0;
        while cgroup.exists() {
            match fs::remove_dir(cgroup) {
                Ok(()) => break,
                Err(_) if attempts < 20 => {
                    attempts += 1;
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(e) => {
                    if result.is_ok() {
                        result = Err(format!("remove cgroup {}: {}", cgroup.display(), e));
                    }
                    break;
                }
            }
        }
    }

    result
}

/// Everything a cloned child needs, built before `clone` so the child does
/// not allocate.
struct ChildPlan {
    root: CString,
    workdir: CString,
    proc_dir: CString,
    cgroup_procs: Vec<CString>,
    program: CString,
    args: Vec<CString>,
    env: Vec<CString>,
    rlimits: Vec<(Resource, u64)>,
}

fn cstring(value: impl Into<Vec<u8>>, what: &str) -> Result<CString, String> {
    CString::new(value).map_err(|_| format!("{} contains a NUL byte", what))
}

fn path_cstring(path: &Path, what: &str) -> Result<CString, String> {
    cstring(path.as_os_str().as_encoded_bytes().to_vec(), what)
}

impl ChildPlan {
    fn new(
        root: &Path,
        workdir: &str,
        limits: &ResourceLimits,
        cgroups: &Cgroups,
        argv: &[&str],
        terminal: (u16, u16),
    ) -> Result<Self, String> {
        let mut rlimits = vec![
            (Resource::RLIMIT_CPU, limits.exec_timeout.as_secs().max(1)),
            (Resource::RLIMIT_FSIZE, FSIZE_LIMIT_BYTES),
            (Resource::RLIMIT_NOFILE, NOFILE_LIMIT),
            (Resource::RLIMIT_CORE, 0),
        ];
        if !cgroups.caps_memory() {
            rlimits.push((Resource::RLIMIT_AS, limits.memory_bytes));
        }

        let env = [
            PATH_ENV.to_string(),
            format!("HOME={}", workdir),
            "TERM=xterm-256color".to_string(),
            format!("COLUMNS={}", terminal.0),
            format!("LINES={}", terminal.1),
        ]
        .into_iter()
        .map(|kv| cstring(kv, "environment"))
        .collect::<Result<Vec<_>, _>>()?;

        let args = argv
            .iter()
            .map(|a| cstring(*a, "command"))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            root: path_cstring(root, "root")?,
            workdir: cstring(workdir, "workdir")?,
            proc_dir: path_cstring(&root.join("proc"), "proc dir")?,
            cgroup_procs: cgroups
                .paths()
                .map(|c| path_cstring(&c.join("cgroup.procs"), "cgroup"))
                .collect::<Result<Vec<_>, _>>()?,
            program: cstring(argv[0], "program")?,
            args,
            env,
            rlimits,
        })
    }
}

fn child_fail(msg: &CStr, errno: Errno) -> isize {
    let prefix = b"sandbox: ";
    unsafe {
        libc::write(2, prefix.as_ptr().cast(), prefix.len());
        libc::write(2, msg.as_ptr().cast(), msg.to_bytes().len());
        libc::write(2, b": ".as_ptr().cast(), 2);
        let desc = libc::strerror(errno as i32);
        libc::write(2, desc.cast(), libc::strlen(desc));
        libc::write(2, b"\n".as_ptr().cast(), 1);
    }
    126
}

/// Body of a cloned child. Runs in fresh namespaces until `execve`.
fn run_child(plan: &ChildPlan, stdin: RawFd, stdout: RawFd) -> isize {
    for procs in &plan.cgroup_procs {
        unsafe {
            let fd = libc::open(procs.as_ptr(), libc::O_WRONLY);
            if fd >= 0 {
                libc::write(fd, b"0".as_ptr().cast(), 1);
                libc::close(fd);
            }
        }
    }

    unsafe {
        libc::dup2(stdin, 0);
        libc::dup2(stdout, 1);
        libc::dup2(stdout, 2);
    }

    // keep our mounts from propagating back to the host
    if let Err(e) = mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    ) {
        return child_fail(c"make mounts private", e);
    }
    // a missing /proc degrades tools like ps, nothing more
    let _ = mount(
        Some("proc"),
        plan.proc_dir.as_c_str(),
        Some("proc"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        None::<&str>,
    );

    if let Err(e) = chroot(plan.root.as_c_str()) {
        return child_fail(c"chroot", e);
    }
    if let Err(e) = chdir(plan.workdir.as_c_str()) {
        return child_fail(c"chdir", e);
    }
    for (resource, limit) in &plan.rlimits {
        if let Err(e) = setrlimit(*resource, *limit, *limit) {
            return child_fail(c"setrlimit", e);
        }
    }
    if let Err(e) = drop_privileges() {
        return child_fail(c"drop privileges", e);
    }

    match execve(&plan.program, &plan.args, &plan.env) {
        Ok(never) => match never {},
        Err(e) => {
            child_fail(c"exec", e);
            127
        }
    }
}

/// Give up root for good: empty the bounding and ambient capability sets,
/// switch to `nobody` with no supplementary groups (gid before uid), then
/// forbid regaining privileges through setuid binaries.
fn drop_privileges() -> Result<(), Errno> {
    for cap in 0..=LAST_CAP {
        // EINVAL marks a capability this kernel does not know
        let rc = unsafe { libc::prctl(libc::PR_CAPBSET_DROP, cap, 0, 0, 0) };
        if rc != 0 && Errno::last() != Errno::EINVAL {
            return Err(Errno::last());
        }
    }
    // ambient capabilities need Linux 4.3, the uid switch clears them anyway
    unsafe {
        libc::prctl(libc::PR_CAP_AMBIENT, libc::PR_CAP_AMBIENT_CLEAR_ALL, 0, 0, 0);
    }

    setgroups(&[])?;
    let gid = Gid::from_raw(NOBODY_GID);
    setresgid(gid, gid, gid)?;
    let uid = Uid::from_raw(NOBODY_UID);
    // leaving uid 0 clears the permitted and effective sets
    setresuid(uid, uid, uid)?;

    if unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) } != 0 {
        return Err(Errno::last());
    }
    Ok(())
}

fn spawn(plan: &ChildPlan, stdin: RawFd, stdout: RawFd, flags: CloneFlags) -> Result<Pid, String> {
    let mut stack = vec![0u8; STACK_SIZE];
    let child_fn = Box::new(|| run_child(plan, stdin, stdout));
    unsafe { clone(child_fn, &mut stack, flags, Some(Signal::SIGCHLD as i32)) }
        .map_err(|e| format!("clone: {}", e))
}

fn namespace_flags(limits: &ResourceLimits) -> CloneFlags {
    let mut flags = CloneFlags::CLONE_NEWPID | CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWIPC;
    if limits.network_disabled {
        flags |= CloneFlags::CLONE_NEWNET;
    }
    flags
}

fn spawn_entry_shell(
    root: &Path,
    workdir: &str,
    shell: &str,
    limits: &ResourceLimits,
    cgroups: &Cgroups,
) -> Result<(Pid, OwnedFd), String> {
    let plan = ChildPlan::new(root, workdir, limits, cgroups, &[shell], (80, 24))?;
    let (stdin_read, stdin_write) = pipe2(OFlag::O_CLOEXEC).map_err(|e| format!("pipe: {}", e))?;
    let dev_null = File::options()
        .write(true)
        .open("/dev/null")
        .map_err(|e| format!("open /dev/null: {}", e))?;

    let flags = namespace_flags(limits) | CloneFlags::CLONE_NEWUTS;
    let pid = spawn(&plan, stdin_read.as_raw_fd(), dev_null.as_raw_fd(), flags)?;
    Ok((pid, stdin_write))
}

fn run_command(ctx: &ExecContext, command: &str) -> Result<ExecOutput, SandboxError> {
    let argv = [ctx.shell.as_str(), "-c", command];
    let plan = ChildPlan::new(
        &ctx.root,
        &ctx.workdir,
        &ctx.limits,
        &ctx.cgroups,
        &argv,
        ctx.terminal,
    )
    .map_err(SandboxError::Runtime)?;

    let (out_read, out_write) = pipe2(OFlag::O_CLOEXEC).map_err(|e| SandboxError::Runtime(format!("pipe: {}", e)))?;
    let dev_null = File::open("/dev/null")?;

    let pid = {
        let mut running = lock(&ctx.running);
        if running.closed {
            return Err(SandboxError::NotInitialized);
        }
        let pid = spawn(
            &plan,
            dev_null.as_raw_fd(),
            out_write.as_raw_fd(),
            namespace_flags(&ctx.limits),
        )
        .map_err(SandboxError::Runtime)?;
        running.pids.insert(pid);
        pid
    };
    debug!(pid = %pid, command = %command, "Command spawned");

    drop(out_write);
    let cap = ctx.limits.max_output_bytes;
    let reader = std::thread::spawn(move || read_capped(File::from(out_read), cap));

    let (exit_code, timed_out) = match poll_tracked(&ctx.running, pid, ctx.limits.exec_timeout) {
        Ok(Some(status)) => (exit_code(status), false),
        Ok(None) => {
            // killing the namespace init takes every descendant with it
            kill_and_reap(&ctx.running, pid);
            (TIMEOUT_EXIT_CODE, true)
        }
        Err(e) => {
            kill_and_reap(&ctx.running, pid);
            return Err(SandboxError::Runtime(format!("waitpid: {}", e)));
        }
    };

    let (bytes, truncated) = reader
        .join()
        .map_err(|_| SandboxError::Runtime("output reader panicked".to_string()))?;
    let mut output = String::from_utf8_lossy(&bytes).into_owned();
    if truncated {
        output.push_str(&format!("\n[output truncated at {} bytes]", cap));
    }
    if timed_out {
        output.push_str(&format!(
            "\n[Command timed out after {}s]",
            ctx.limits.exec_timeout.as_secs()
        ));
    }

    Ok(ExecOutput { output, exit_code })
}

/// [`poll_exit`] for a tracked command. Each reap happens under the lock and
/// untracks the pid in the same step.
fn poll_tracked(
    running: &Mutex<Running>,
    pid: Pid,
    timeout: Duration,
) -> Result<Option<WaitStatus>, Errno> {
    let deadline = Instant::now() + timeout;
    loop {
        {
            let mut guard = lock(running);
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {}
                Ok(status) => {
                    guard.pids.remove(&pid);
                    return Ok(Some(status));
                }
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    guard.pids.remove(&pid);
                    return Err(e);
                }
            }
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

fn kill_and_reap(running: &Mutex<Running>, pid: Pid) {
    let mut guard = lock(running);
    if guard.pids.remove(&pid) {
        let _ = kill(pid, Signal::SIGKILL);
        let _ = waitpid(pid, None);
    }
}

/// Wait for `pid` until `timeout`. `None` means it is still running.
fn poll_exit(pid: Pid, timeout: Duration) -> Result<Option<WaitStatus>, Errno> {
    let deadline = Instant::now() + timeout;
    loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                if Instant::now() >= deadline {
                    return Ok(None);
                }
                std::thread::sleep(POLL_INTERVAL);
            }
            Ok(status) => return Ok(Some(status)),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
}

fn exit_code(status: WaitStatus) -> i32 {
    match status {
        WaitStatus::Exited(_, code) => code,
        WaitStatus::Signaled(_, signal, _) => 128 + signal as i32,
        _ => 1,
    }
}

/// Read to EOF keeping at most `cap` bytes. Draining continues past the cap
/// so the writer never blocks on a full pipe.
fn read_capped(mut reader: impl Read, cap: usize) -> (Vec<u8>, bool) {
    let mut kept = Vec::new();
    let mut truncated = false;
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                let room = cap.saturating_sub(kept.len());
                if n > room {
                    truncated = true;
                }
                kept.extend_from_slice(&buf[..n.min(room)]);
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    (kept, truncated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_capped_truncates_but_drains() {
        let data = vec![b'x'; 20_000];
        let (kept, truncated) = read_capped(&data[..], 100);
        assert_eq!(kept.len(), 100);
        assert!(truncated);

        let (kept, truncated) = read_capped(&b"hello"[..], 100);
        assert_eq!(kept, b"hello");
        assert!(!truncated);
    }

    #[test]
    fn exit_codes_follow_shell_conventions() {
        let pid = Pid::from_raw(1);
        assert_eq!(exit_code(WaitStatus::Exited(pid, 3)), 3);
        assert_eq!(exit_code(WaitStatus::Signaled(pid, Signal::SIGKILL, false)), 137);
    }

    #[test]
    fn plan_rejects_nul_bytes() {
        let limits = ResourceLimits::default();
        let plan = ChildPlan::new(
            Path::new("/tmp/root"),
            "/workspace",
            &limits,
            &Cgroups::default(),
            &["/bin/sh", "-c", "echo \0oops"],
            (80, 24),
        );
        assert!(plan.is_err());
    }

    #[test]
    fn rlimit_as_only_without_memory_cgroup() {
        let limits = ResourceLimits::default();
        let argv = ["/bin/sh"];
        let none = Cgroups::default();
        let without = ChildPlan::new(Path::new("/r"), "/workspace", &limits, &none, &argv, (80, 24)).unwrap();
        assert!(without.rlimits.iter().any(|(r, _)| *r == Resource::RLIMIT_AS));
        assert!(without.cgroup_procs.is_empty());

        let unified = Cgroups {
            unified: Some(PathBuf::from("/sys/fs/cgroup/cli-quest/x")),
            cpu_v1: None,
        };
        let with = ChildPlan::new(Path::new("/r"), "/workspace", &limits, &unified, &argv, (80, 24)).unwrap();
        assert!(!with.rlimits.iter().any(|(r, _)| *r == Resource::RLIMIT_AS));
        assert_eq!(with.cgroup_procs, vec![c"/sys/fs/cgroup/cli-quest/x/cgroup.procs".to_owned()]);
    }

    #[test]
    fn cpu_only_v1_cgroup_keeps_address_space_limit() {
        let limits = ResourceLimits::default();
        let cpu_v1 = Cgroups {
            unified: None,
            cpu_v1: Some(PathBuf::from("/sys/fs/cgroup/cpu/cli-quest/x")),
        };
        let plan = ChildPlan::new(Path::new("/r"), "/workspace", &limits, &cpu_v1, &["/bin/sh"], (80, 24)).unwrap();
        assert!(plan.rlimits.iter().any(|(r, _)| *r == Resource::RLIMIT_AS));
        assert_eq!(plan.cgroup_procs, vec![c"/sys/fs/cgroup/cpu/cli-quest/x/cgroup.procs".to_owned()]);
    }

    #[test]
    fn closed_running_set_rejects_new_commands() {
        let running = RunningSet::default();
        kill_running(&running);
        let ctx = ExecContext {
            root: PathBuf::from("/nonexistent-root"),
            workdir: "/workspace".into(),
            shell: "/bin/sh".into(),
            limits: ResourceLimits::default(),
            cgroups: Cgroups::default(),
            terminal: (80, 24),
            running,
        };
        assert!(matches!(run_command(&ctx, "true"), Err(SandboxError::NotInitialized)));
    }

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("cli-quest-{}-{}", tag, uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn workspace_writes_never_follow_symlinks() {
        let base = scratch_dir("write");
        let workspace = base.join("workspace");
        let outside = base.join("outside");
        fs::create_dir_all(&workspace).unwrap();
        fs::create_dir_all(&outside).unwrap();

        // a planted directory link and a planted file link
        std::os::unix::fs::symlink(&outside, workspace.join("challenges")).unwrap();
        std::os::unix::fs::symlink(outside.join("victim"), workspace.join("notes.txt")).unwrap();

        write_workspace_file(&workspace, Path::new("challenges/flag.txt"), b"flag", None).unwrap();
        write_workspace_file(&workspace, Path::new("notes.txt"), b"notes", None).unwrap();

        assert!(fs::read_dir(&outside).unwrap().next().is_none());
        let dir = fs::symlink_metadata(workspace.join("challenges")).unwrap();
        assert!(dir.is_dir());
        assert_eq!(fs::read(workspace.join("challenges/flag.txt")).unwrap(), b"flag");
        let file = fs::symlink_metadata(workspace.join("notes.txt")).unwrap();
        assert!(file.is_file());
        assert_eq!(file.permissions().mode() & 0o777, 0o644);

        fs::remove_dir_all(&base).unwrap();
    }

    #[test]
    fn workspace_writes_reject_escaping_paths() {
        let base = scratch_dir("escape");
        for bad in ["../x", "/etc/passwd", ""] {
            assert!(write_workspace_file(&base, Path::new(bad), b"x", None).is_err(), "{bad:?}");
        }
        fs::remove_dir_all(&base).unwrap();
    }

    #[test]
    fn shell_falls_back_to_sh() {
        assert_eq!(resolve_shell(Path::new("/nonexistent-root"), "/bin/bash"), "/bin/sh");
    }
}
