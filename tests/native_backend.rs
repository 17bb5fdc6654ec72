//! Native backend tests. They need root and a kernel that allows mounts and
//! namespaces, and skip themselves otherwise.

#![cfg(target_os = "linux")]

use cli_quest::sandbox::native::{NativeBackend, NOBODY_UID};
use cli_quest::sandbox::{Backend, ContainerHandle, ContainerSpec, ResourceLimits};
use cli_quest::SandboxError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Fixture {
    backend: Arc<NativeBackend>,
    handle: ContainerHandle,
    base: PathBuf,
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let _ = self.backend.kill(&self.handle);
        let _ = std::fs::remove_dir_all(&self.base);
    }
}

fn spec(name: &str, limits: ResourceLimits) -> ContainerSpec {
    ContainerSpec {
        name: name.to_string(),
        workdir: "/workspace".into(),
        shell: "/bin/sh".into(),
        limits,
    }
}

fn start(limits: ResourceLimits) -> Option<Fixture> {
    if !nix::unistd::geteuid().is_root() {
        eprintln!("Skipping: native sandbox needs root");
        return None;
    }
    let id = uuid::Uuid::new_v4().simple().to_string();
    let base = std::env::temp_dir().join(format!("cli-quest-native-{}", id));
    let backend = Arc::new(NativeBackend::new(&base));
    match backend.create(&spec(&format!("cli-quest-{}", id), limits)) {
        Ok(handle) => Some(Fixture { backend, handle, base }),
        Err(e) => {
            eprintln!("Skipping: cannot create a native container here: {}", e);
            let _ = std::fs::remove_dir_all(&base);
            None
        }
    }
}

fn run(f: &Fixture, command: &str) -> (String, i32) {
    let out = f.backend.exec(&f.handle, command).unwrap();
    (out.output, out.exit_code)
}

#[test]
fn commands_run_as_nobody_inside_the_root() {
    let Some(f) = start(ResourceLimits::default()) else {
        return;
    };

    let (uid, code) = run(&f, "id -u");
    assert_eq!(code, 0, "{uid}");
    assert_eq!(uid.trim(), NOBODY_UID.to_string());

    let (pwd, _) = run(&f, "pwd");
    assert_eq!(pwd.trim(), "/workspace");

    let (_, code) = run(&f, "cat /etc/shadow");
    assert_ne!(code, 0, "nobody must not read /etc/shadow");

    let (_, code) = run(&f, "touch /usr/cli-quest-write-test");
    assert_ne!(code, 0, "system directories are read-only");
}

#[test]
fn privileges_cannot_be_regained() {
    let Some(f) = start(ResourceLimits::default()) else {
        return;
    };

    let (status, code) = run(&f, "cat /proc/self/status");
    assert_eq!(code, 0, "{status}");
    let field = |name: &str| {
        status
            .lines()
            .find_map(|l| l.strip_prefix(name))
            .map(|v| v.trim().to_string())
            .unwrap_or_default()
    };
    assert_eq!(field("NoNewPrivs:"), "1");
    assert_eq!(field("CapEff:"), "0000000000000000");
    assert_eq!(field("CapPrm:"), "0000000000000000");
    assert_eq!(field("CapBnd:"), "0000000000000000");
    assert!(field("Groups:").is_empty());
}

#[test]
fn workspace_is_writable_and_seed_files_belong_to_nobody() {
    let Some(f) = start(ResourceLimits::default()) else {
        return;
    };

    f.backend
        .write_file(&f.handle, Path::new("secret.txt"), b"The flag is: X")
        .unwrap();
    assert_eq!(run(&f, "cat secret.txt"), ("The flag is: X".to_string(), 0));
    assert_eq!(run(&f, "stat -c %u secret.txt").0.trim(), NOBODY_UID.to_string());

    let (out, code) = run(&f, "echo hi > notes.txt && cat notes.txt");
    assert_eq!(code, 0, "{out}");
    assert_eq!(out.trim(), "hi");
}

#[test]
fn seeding_does_not_follow_a_planted_symlink() {
    let Some(f) = start(ResourceLimits::default()) else {
        return;
    };

    let marker = format!("cli-quest-{}.txt", uuid::Uuid::new_v4().simple());
    let (out, code) = run(&f, "ln -s /tmp challenges");
    assert_eq!(code, 0, "{out}");

    f.backend
        .write_file(&f.handle, &Path::new("challenges").join(&marker), b"seeded")
        .unwrap();

    assert!(!Path::new("/tmp").join(&marker).exists(), "write escaped the workspace");
    let (out, code) = run(&f, &format!("cat challenges/{}", marker));
    assert_eq!((out.as_str(), code), ("seeded", 0));
}

#[test]
fn slow_commands_time_out() {
    let limits = ResourceLimits {
        exec_timeout: Duration::from_secs(1),
        ..ResourceLimits::default()
    };
    let Some(f) = start(limits) else {
        return;
    };

    let started = Instant::now();
    let (out, code) = run(&f, "sleep 20");
    assert_eq!(code, 124);
    assert!(out.contains("timed out"), "{out}");
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[test]
fn stop_kills_a_running_command() {
    let Some(f) = start(ResourceLimits::default()) else {
        return;
    };

    let backend = f.backend.clone();
    let handle = f.handle.clone();
    let started = Instant::now();
    let running = std::thread::spawn(move || backend.exec(&handle, "sleep 25"));
    std::thread::sleep(Duration::from_millis(500));

    f.backend.stop(&f.handle, Duration::from_secs(5)).unwrap();
    let out = running.join().unwrap().unwrap();
    assert_eq!(out.exit_code, 137);
    assert!(started.elapsed() < Duration::from_secs(15));

    assert!(matches!(f.backend.exec(&f.handle, "true"), Err(SandboxError::NotInitialized)));
    assert!(!f.base.join(&f.handle.name).exists());
}

#[test]
fn create_replaces_a_live_container_with_the_same_name() {
    let Some(f) = start(ResourceLimits::default()) else {
        return;
    };

    run(&f, "echo old > old.txt");
    let again = f
        .backend
        .create(&spec(&f.handle.name, ResourceLimits::default()))
        .unwrap();
    assert_eq!(again.name, f.handle.name);

    let (out, code) = run(&f, "ls -A");
    assert_eq!(code, 0, "{out}");
    assert!(!out.contains("old.txt"), "{out}");
}
