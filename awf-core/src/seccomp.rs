//! Syscall policy attached to the agent container.
//!
//! The profile is written in the container runtime's JSON format and is
//! deny-by-default: anything not listed in an allow rule fails with `EPERM`.
//! A handful of syscalls that expand kernel attack surface are additionally
//! listed in explicit deny rules, each carrying a comment that records why it
//! is blocked.
//!
//! [`SeccompProfile::validate`] does not mutate anything. It exists to catch
//! policy regressions: a deleted `comment`, a flipped `defaultAction`, a missing
//! `errnoRet`, or an escape-relevant syscall that quietly moved back into the
//! allow list.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::Path;

use awf_config::SchemaError;
use serde::{Deserialize, Serialize};

/// Built-in profile shipped with the binary.
pub const BUILTIN_PROFILE_JSON: &str = include_str!("../resources/seccomp-profile.json");

/// Architectures every profile must cover.
pub const REQUIRED_ARCHITECTURES: &[&str] =
    &["SCMP_ARCH_X86_64", "SCMP_ARCH_X86", "SCMP_ARCH_AARCH64"];

/// Allow-list floor consistent with ordinary process, network and file I/O.
pub const MIN_ALLOWED_SYSCALLS: usize = 200;

/// Deny-rule comments must be longer than this many characters.
pub const MIN_DENY_COMMENT_LEN: usize = 10;

/// Syscalls that must stay explicitly denied.
pub const ESCAPE_SYSCALLS: &[&str] = &[
    // process inspection
    "ptrace",
    "process_vm_readv",
    "process_vm_writev",
    // kernel execution
    "kexec_load",
    "kexec_file_load",
    "reboot",
    // kernel modules
    "init_module",
    "finit_module",
    "delete_module",
    // mounts
    "mount",
    "umount",
    "umount2",
    "pivot_root",
    // namespaces
    "unshare",
    "setns",
    // BPF / perf
    "bpf",
    "perf_event_open",
    // keyring
    "add_key",
    "request_key",
    "keyctl",
    // raw I/O
    "ioperm",
    "iopl",
    "chroot",
];

/// Syscalls the agent cannot operate without.
pub const REQUIRED_ALLOWED_SYSCALLS: &[&str] = &[
    // file I/O
    "read", "write", "open", "openat", "close", "lseek", "fstat", "stat", "pread64", "pwrite64",
    // networking
    "socket", "connect", "bind", "listen", "accept", "accept4", "sendto", "recvfrom",
    "setsockopt", "getsockopt",
    // process management
    "clone", "fork", "vfork", "execve", "exit", "exit_group", "wait4", "getpid",
    // signals
    "rt_sigaction", "rt_sigprocmask", "rt_sigreturn", "kill",
    // polling
    "poll", "select", "epoll_create1", "epoll_ctl", "epoll_wait",
    // directories
    "getdents64", "mkdir", "rmdir", "chdir", "getcwd",
    // time
    "clock_gettime", "gettimeofday", "nanosleep",
    "ioctl",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SeccompAction {
    #[serde(rename = "SCMP_ACT_ALLOW")]
    Allow,
    #[serde(rename = "SCMP_ACT_ERRNO")]
    Errno,
}

impl fmt::Display for SeccompAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allow => f.write_str("SCMP_ACT_ALLOW"),
            Self::Errno => f.write_str("SCMP_ACT_ERRNO"),
        }
    }
}

/// One syscall rule. Argument filters are not supported and are rejected
/// at parse time rather than ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SeccompRule {
    pub names: Vec<String>,
    pub action: SeccompAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errno_ret: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SeccompProfile {
    pub default_action: SeccompAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_errno_ret: Option<u32>,
    pub architectures: Vec<String>,
    pub syscalls: Vec<SeccompRule>,
}

impl SeccompProfile {
    /// Parse the built-in profile.
    pub fn builtin() -> Result<Self, SchemaError> {
        Self::from_json(BUILTIN_PROFILE_JSON)
    }

    pub fn from_json(source: &str) -> Result<Self, SchemaError> {
        serde_json::from_str(source)
            .map_err(|err| SchemaError::Malformed(format!("invalid seccomp profile: {err}")))
    }

    pub fn load_file(path: impl AsRef<Path>) -> Result<Self, SchemaError> {
        let path = path.as_ref();
        let source = fs::read_to_string(path).map_err(|source| SchemaError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&source).map_err(|err| err.in_file(path))
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    fn names_with_action(&self, action: SeccompAction) -> BTreeSet<&str> {
        self.syscalls
            .iter()
            .filter(|rule| rule.action == action)
            .flat_map(|rule| rule.names.iter().map(String::as_str))
            .collect()
    }

    pub fn allowed_syscalls(&self) -> BTreeSet<&str> {
        self.names_with_action(SeccompAction::Allow)
    }

    pub fn denied_syscalls(&self) -> BTreeSet<&str> {
        self.names_with_action(SeccompAction::Errno)
    }

    /// Check every policy invariant and collect all violations.
    pub fn validate(&self) -> ValidationReport {
        let mut violations = Vec::new();

        if self.default_action != SeccompAction::Errno {
            violations.push(SeccompViolation::DefaultNotDeny(self.default_action));
        }
        if !self.default_errno_ret.is_some_and(|ret| ret > 0) {
            violations.push(SeccompViolation::MissingDefaultErrno);
        }

        for arch in REQUIRED_ARCHITECTURES {
            if !self.architectures.iter().any(|a| a == arch) {
                violations.push(SeccompViolation::MissingArchitecture((*arch).to_string()));
            }
        }

        for (index, rule) in self.syscalls.iter().enumerate() {
            if rule.names.is_empty() {
                violations.push(SeccompViolation::EmptyRule { index });
            }
            if rule.action != SeccompAction::Errno {
                continue;
            }
            if !rule.errno_ret.is_some_and(|ret| ret > 0) {
                violations.push(SeccompViolation::DenyWithoutErrno { index });
            }
            let comment_len = rule.comment.as_deref().map_or(0, |c| c.trim().chars().count());
            if comment_len <= MIN_DENY_COMMENT_LEN {
                violations.push(SeccompViolation::DenyWithoutComment { index });
            }
        }

        let allowed = self.allowed_syscalls();
        let denied = self.denied_syscalls();

        for name in allowed.intersection(&denied) {
            violations.push(SeccompViolation::Conflicting((*name).to_string()));
        }
        for name in ESCAPE_SYSCALLS {
            if !denied.contains(name) {
                violations.push(SeccompViolation::EscapeNotDenied((*name).to_string()));
            }
        }
        for name in REQUIRED_ALLOWED_SYSCALLS {
            if !allowed.contains(name) {
                violations.push(SeccompViolation::RequiredNotAllowed((*name).to_string()));
            }
        }
        if allowed.len() <= denied.len() {
            violations.push(SeccompViolation::AllowNotLargerThanDeny {
                allowed: allowed.len(),
                denied: denied.len(),
            });
        }
        if allowed.len() <= MIN_ALLOWED_SYSCALLS {
            violations.push(SeccompViolation::AllowListTooSmall {
                allowed: allowed.len(),
                floor: MIN_ALLOWED_SYSCALLS,
            });
        }

        ValidationReport {
            allowed: allowed.len(),
            denied: denied.len(),
            violations,
        }
    }
}

/// A single broken invariant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SeccompViolation {
    #[error("defaultAction must be SCMP_ACT_ERRNO, found {0}")]
    DefaultNotDeny(SeccompAction),
    #[error("defaultErrnoRet must be set to a nonzero errno")]
    MissingDefaultErrno,
    #[error("required architecture {0} is missing")]
    MissingArchitecture(String),
    #[error("rule {index} lists no syscalls")]
    EmptyRule { index: usize },
    #[error("deny rule {index} must set a nonzero errnoRet")]
    DenyWithoutErrno { index: usize },
    #[error("deny rule {index} must document why it blocks its syscalls")]
    DenyWithoutComment { index: usize },
    #[error("syscall {0} is both allowed and denied")]
    Conflicting(String),
    #[error("escape-relevant syscall {0} is not explicitly denied")]
    EscapeNotDenied(String),
    #[error("required syscall {0} is not allowed")]
    RequiredNotAllowed(String),
    #[error("allow list ({allowed}) must be larger than deny list ({denied})")]
    AllowNotLargerThanDeny { allowed: usize, denied: usize },
    #[error("allow list has {allowed} syscalls, expected more than {floor}")]
    AllowListTooSmall { allowed: usize, floor: usize },
}

/// Outcome of [`SeccompProfile::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub allowed: usize,
    pub denied: usize,
    pub violations: Vec<SeccompViolation>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn into_result(self) -> Result<(), SeccompValidationError> {
        if self.violations.is_empty() {
            Ok(())
        } else {
            Err(SeccompValidationError {
                violations: self.violations,
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}", render_violations(.violations))]
pub struct SeccompValidationError {
    pub violations: Vec<SeccompViolation>,
}

fn render_violations(violations: &[SeccompViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_valid() -> SeccompProfile {
        let mut allowed: Vec<String> = REQUIRED_ALLOWED_SYSCALLS
            .iter()
            .map(|s| (*s).to_string())
            .collect();
        allowed.extend((0..MIN_ALLOWED_SYSCALLS).map(|i| format!("filler_{i}")));
        SeccompProfile {
            default_action: SeccompAction::Errno,
            default_errno_ret: Some(1),
            architectures: REQUIRED_ARCHITECTURES.iter().map(|s| (*s).to_string()).collect(),
            syscalls: vec![
                SeccompRule {
                    names: allowed,
                    action: SeccompAction::Allow,
                    errno_ret: None,
                    comment: None,
                },
                SeccompRule {
                    names: ESCAPE_SYSCALLS.iter().map(|s| (*s).to_string()).collect(),
                    action: SeccompAction::Errno,
                    errno_ret: Some(1),
                    comment: Some("blocks sandbox escape primitives".to_string()),
                },
            ],
        }
    }

    #[test]
    fn test_minimal_profile_is_valid() {
        let report = minimal_valid().validate();
        assert!(report.is_valid(), "{:?}", report.violations);
    }

    #[test]
    fn test_flipped_default_action_detected() {
        let mut profile = minimal_valid();
        profile.default_action = SeccompAction::Allow;
        let report = profile.validate();
        assert!(report
            .violations
            .contains(&SeccompViolation::DefaultNotDeny(SeccompAction::Allow)));
    }

    #[test]
    fn test_removed_comment_detected() {
        let mut profile = minimal_valid();
        if let Some(rule) = profile.syscalls.get_mut(1) {
            rule.comment = Some("too short".to_string());
        }
        let report = profile.validate();
        assert!(report
            .violations
            .contains(&SeccompViolation::DenyWithoutComment { index: 1 }));
    }

    #[test]
    fn test_missing_errno_detected() {
        let mut profile = minimal_valid();
        if let Some(rule) = profile.syscalls.get_mut(1) {
            rule.errno_ret = None;
        }
        assert!(profile
            .validate()
            .violations
            .contains(&SeccompViolation::DenyWithoutErrno { index: 1 }));
    }

    #[test]
    fn test_repermitted_escape_syscall_detected() {
        let mut profile = minimal_valid();
        if let Some(rule) = profile.syscalls.get_mut(1) {
            rule.names.retain(|name| name != "ptrace");
        }
        if let Some(rule) = profile.syscalls.get_mut(0) {
            rule.names.push("ptrace".to_string());
        }
        let violations = profile.validate().violations;
        assert!(violations.contains(&SeccompViolation::EscapeNotDenied("ptrace".to_string())));
    }

    #[test]
    fn test_conflicting_rule_detected() {
        let mut profile = minimal_valid();
        if let Some(rule) = profile.syscalls.get_mut(0) {
            rule.names.push("bpf".to_string());
        }
        assert!(profile
            .validate()
            .violations
            .contains(&SeccompViolation::Conflicting("bpf".to_string())));
    }

    #[test]
    fn test_argument_filters_rejected_at_parse() {
        let err = SeccompProfile::from_json(
            r#"{"defaultAction":"SCMP_ACT_ERRNO","architectures":[],"syscalls":[
                {"names":["socket"],"action":"SCMP_ACT_ALLOW","args":[{"index":0}]}]}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("invalid seccomp profile"));
    }

    #[test]
    fn test_validation_error_lists_every_violation() {
        let mut profile = minimal_valid();
        profile.default_errno_ret = None;
        profile.architectures.clear();
        let err = profile.validate().into_result().unwrap_err();
        assert_eq!(err.violations.len(), 1 + REQUIRED_ARCHITECTURES.len());
        assert!(err.to_string().contains("defaultErrnoRet"));
    }
}
