//! In-memory backend for development and tests.
//!
//! Nothing is executed on the host. A handful of read-only commands are
//! emulated against a per-container file map; everything else reports
//! "command not found" the way bash does.

use super::{Backend, ContainerHandle, ContainerSpec, ExecOutput};
use crate::error::SandboxError;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug)]
struct MockContainer {
    workdir: String,
    files: BTreeMap<String, String>,
    terminal: (u16, u16),
}

#[derive(Debug, Default)]
pub struct MockBackend {
    containers: DashMap<String, MockContainer>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of containers currently alive.
    pub fn live_containers(&self) -> usize {
        self.containers.len()
    }

    pub fn is_live(&self, name: &str) -> bool {
        self.containers.contains_key(name)
    }

    pub fn terminal_size(&self, name: &str) -> Option<(u16, u16)> {
        self.containers.get(name).map(|c| c.terminal)
    }

    pub fn file(&self, name: &str, path: &str) -> Option<String> {
        self.containers
            .get(name)
            .and_then(|c| c.files.get(path).cloned())
    }
}

fn not_initialized() -> SandboxError {
    SandboxError::NotInitialized
}

impl Backend for MockBackend {
    fn kind(&self) -> &'static str {
        "mock"
    }

    fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle, SandboxError> {
        if self.containers.remove(&spec.name).is_some() {
            warn!(container = %spec.name, "Removing stale container with the same name");
        }
        self.containers.insert(
            spec.name.clone(),
            MockContainer {
                workdir: spec.workdir.clone(),
                files: BTreeMap::new(),
                terminal: (80, 24),
            },
        );
        debug!(container = %spec.name, "Mock container created");
        Ok(ContainerHandle {
            name: spec.name.clone(),
        })
    }

    fn exec(&self, container: &ContainerHandle, command: &str) -> Result<ExecOutput, SandboxError> {
        let mut entry = self
            .containers
            .get_mut(&container.name)
            .ok_or_else(not_initialized)?;
        Ok(emulate(&mut entry, command.trim()))
    }

    fn resize(&self, container: &ContainerHandle, cols: u16, rows: u16) -> Result<(), SandboxError> {
        let mut entry = self
            .containers
            .get_mut(&container.name)
            .ok_or_else(not_initialized)?;
        entry.terminal = (cols, rows);
        Ok(())
    }

    fn write_file(
        &self,
        container: &ContainerHandle,
        path: &Path,
        content: &[u8],
    ) -> Result<(), SandboxError> {
        let mut entry = self
            .containers
            .get_mut(&container.name)
            .ok_or_else(not_initialized)?;
        let key = path.to_string_lossy().into_owned();
        entry
            .files
            .insert(key, String::from_utf8_lossy(content).into_owned());
        Ok(())
    }

    fn stop(&self, container: &ContainerHandle, _timeout: Duration) -> Result<(), SandboxError> {
        self.containers.remove(&container.name);
        Ok(())
    }

    fn kill(&self, container: &ContainerHandle) -> Result<(), SandboxError> {
        self.containers.remove(&container.name);
        Ok(())
    }
}

fn ok(output: impl Into<String>) -> ExecOutput {
    ExecOutput {
        output: output.into(),
        exit_code: 0,
    }
}

fn emulate(container: &mut MockContainer, command: &str) -> ExecOutput {
    // `cmd > file` and `cmd >> file`
    if let Some((lhs, target, append)) = split_redirect(command) {
        let produced = emulate(container, lhs);
        if produced.exit_code != 0 {
            return produced;
        }
        let key = relative_key(&container.workdir, target);
        let mut text = produced.output;
        text.push('\n');
        let file = container.files.entry(key).or_default();
        if append {
            file.push_str(&text);
        } else {
            *file = text;
        }
        return ok("");
    }

    let words: Vec<&str> = command.split_whitespace().collect();
    let Some((&program, args)) = words.split_first() else {
        return ok("");
    };

    match program {
        "pwd" => ok(container.workdir.clone()),
        "whoami" => ok("user"),
        "echo" => ok(unquote(command["echo".len()..].trim())),
        "mkdir" | "clear" | "true" => ok(""),
        "ls" => list(container, args),
        "cat" => cat(container, args),
        _ => ExecOutput {
            output: format!("bash: {}: command not found", program),
            exit_code: 127,
        },
    }
}

/// First `>` or `>>` outside single or double quotes.
fn split_redirect(command: &str) -> Option<(&str, &str, bool)> {
    let mut quote = None;
    for (idx, ch) in command.char_indices() {
        match (quote, ch) {
            (Some(open), c) if c == open => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(ch),
            (None, '>') => {
                let append = command[idx + 1..].starts_with('>');
                let target = &command[idx + if append { 2 } else { 1 }..];
                return Some((command[..idx].trim(), target.trim(), append));
            }
            (None, _) => {}
        }
    }
    None
}

fn unquote(text: &str) -> String {
    let quoted = text.len() >= 2
        && ((text.starts_with('\'') && text.ends_with('\''))
            || (text.starts_with('"') && text.ends_with('"')));
    if quoted {
        text[1..text.len() - 1].to_string()
    } else {
        text.to_string()
    }
}

fn relative_key(workdir: &str, path: &str) -> String {
    let prefix = format!("{}/", workdir.trim_end_matches('/'));
    path.strip_prefix(&prefix)
        .or_else(|| path.strip_prefix("./"))
        .unwrap_or(path)
        .to_string()
}

/// Top-level names: files at the root plus the first component of nested paths.
fn top_level(container: &MockContainer) -> Vec<(String, Option<usize>)> {
    let mut entries: BTreeMap<String, Option<usize>> = BTreeMap::new();
    for (path, content) in &container.files {
        match path.split_once('/') {
            Some((dir, _)) => {
                entries.insert(dir.to_string(), None);
            }
            None => {
                entries.insert(path.clone(), Some(content.len()));
            }
        }
    }
    entries.into_iter().collect()
}

fn list(container: &MockContainer, args: &[&str]) -> ExecOutput {
    let flags: String = args
        .iter()
        .filter_map(|a| a.strip_prefix('-'))
        .collect();
    let show_all = flags.contains('a');
    let long = flags.contains('l');

    let entries: Vec<_> = top_level(container)
        .into_iter()
        .filter(|(name, _)| show_all || !name.starts_with('.'))
        .collect();

    if !long {
        let names: Vec<_> = entries.into_iter().map(|(name, _)| name).collect();
        return ok(names.join("  "));
    }

    let mut lines = vec![format!("total {}", entries.len() * 4)];
    if show_all {
        lines.push("drwxr-xr-x 2 user user 4096 Jan  1 00:00 .".to_string());
        lines.push("drwxr-xr-x 3 user user 4096 Jan  1 00:00 ..".to_string());
    }
    for (name, size) in entries {
        lines.push(match size {
            Some(size) => format!("-rw-r--r-- 1 user user {:>5} Jan  1 00:00 {}", size, name),
            None => format!("drwxr-xr-x 2 user user  4096 Jan  1 00:00 {}", name),
        });
    }
    ok(lines.join("\n"))
}

fn cat(container: &MockContainer, args: &[&str]) -> ExecOutput {
    let mut output = String::new();
    let mut exit_code = 0;
    for arg in args.iter().filter(|a| !a.starts_with('-')) {
        let key = relative_key(&container.workdir, arg);
        match container.files.get(&key) {
            Some(content) => output.push_str(content),
            None => {
                if !output.is_empty() && !output.ends_with('\n') {
                    output.push('\n');
                }
                output.push_str(&format!("cat: {}: No such file or directory", arg));
                exit_code = 1;
            }
        }
    }
    ExecOutput { output, exit_code }
}
