//! Command denylist applied before anything reaches a sandbox.
//!
//! Matching is plain substring containment on the lower-cased, trimmed
//! command. There is no shell parsing: a pattern anywhere in the text blocks
//! the whole command, false positives included.

/// Text returned in place of output for a blocked command.
pub const REJECTION_MESSAGE: &str = "Error: Command not allowed for security reasons";

/// Built-in patterns, checked in order.
pub const DEFAULT_PATTERNS: &[&str] = &[
    // destructive filesystem operations
    "rm -rf /",
    "dd if=/dev/zero",
    "mkfs",
    "fdisk",
    "mount",
    "umount",
    "chmod 777 /",
    "chown root",
    "> /dev/",
    // fork bomb
    ":(){ :|:& };:",
    // privilege escalation and account management
    "sudo",
    "su ",
    "passwd",
    "useradd",
    "userdel",
    // outbound network
    "curl http",
    "wget http",
    "nc -l",
    "netcat -l",
];

/// Ordered denylist of lower-case substrings.
#[derive(Debug, Clone)]
pub struct CommandPolicy {
    patterns: Vec<String>,
}

impl CommandPolicy {
    /// Policy with the built-in patterns only.
    pub fn new() -> Self {
        Self::with_extra_patterns(std::iter::empty::<String>())
    }

    /// Built-in patterns followed by `extra`. Empty patterns are dropped since
    /// they would match every command.
    pub fn with_extra_patterns<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = DEFAULT_PATTERNS
            .iter()
            .map(|p| p.to_string())
            .chain(extra.into_iter().map(|p| p.as_ref().to_lowercase()))
            .filter(|p| !p.is_empty())
            .collect();
        Self { patterns }
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// First pattern contained in `command`, if any.
    pub fn matched_pattern(&self, command: &str) -> Option<&str> {
        let normalized = command.trim().to_lowercase();
        self.patterns
            .iter()
            .find(|p| normalized.contains(p.as_str()))
            .map(String::as_str)
    }

    pub fn is_blocked(&self, command: &str) -> bool {
        self.matched_pattern(command).is_some()
    }
}

impl Default for CommandPolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_each_default_pattern() {
        let policy = CommandPolicy::new();
        for pattern in DEFAULT_PATTERNS {
            let command = format!("x {pattern} y");
            assert!(policy.is_blocked(&command), "{command:?} should be blocked");
        }
    }

    #[test]
    fn trimmed_bare_su_is_not_blocked() {
        let policy = CommandPolicy::new();
        assert!(!policy.is_blocked("su "));
        assert!(policy.is_blocked("su -"));
    }

    #[test]
    fn matching_is_case_insensitive() {
        let policy = CommandPolicy::new();
        assert!(policy.is_blocked("SUDO ls"));
        assert!(policy.is_blocked("  Rm -Rf /  "));
        assert!(policy.is_blocked("echo hi && MKFS.ext4 /dev/sda"));
    }

    #[test]
    fn substring_anywhere_blocks() {
        let policy = CommandPolicy::new();
        assert_eq!(policy.matched_pattern("ls; sudo anything"), Some("sudo"));
        // conservative: harmless text containing a pattern is still blocked
        assert!(policy.is_blocked("cat mountains.txt"));
        assert!(policy.is_blocked("echo passwd"));
    }

    #[test]
    fn allows_ordinary_commands() {
        let policy = CommandPolicy::new();
        for cmd in ["ls", "ls -la", "cat secret.txt", "pwd", "echo hi > out.txt", "grep -r flag ."] {
            assert!(!policy.is_blocked(cmd), "{cmd:?} should be allowed");
        }
    }

    #[test]
    fn su_pattern_needs_trailing_space() {
        let policy = CommandPolicy::new();
        assert!(policy.is_blocked("su root"));
        assert!(!policy.is_blocked("sum.txt"));
    }

    #[test]
    fn extra_patterns_extend_the_list() {
        let policy = CommandPolicy::with_extra_patterns(["Shutdown", ""]);
        assert!(policy.is_blocked("shutdown -h now"));
        assert_eq!(policy.patterns().len(), DEFAULT_PATTERNS.len() + 1);
        assert_eq!(policy.patterns().last().map(String::as_str), Some("shutdown"));
    }
}
