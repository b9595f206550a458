use std::collections::BTreeSet;

use awf_core::seccomp::{
    ESCAPE_SYSCALLS, REQUIRED_ALLOWED_SYSCALLS, REQUIRED_ARCHITECTURES, SeccompAction,
    SeccompProfile,
};

fn builtin() -> SeccompProfile {
    SeccompProfile::builtin().unwrap()
}

#[test]
fn builtin_profile_is_deny_by_default() {
    let profile = builtin();
    assert_eq!(profile.default_action, SeccompAction::Errno);
    assert_eq!(profile.default_errno_ret, Some(1));
}

#[test]
fn builtin_profile_covers_required_architectures() {
    let profile = builtin();
    for arch in REQUIRED_ARCHITECTURES {
        assert!(
            profile.architectures.iter().any(|a| a == arch),
            "missing architecture {arch}"
        );
    }
}

#[test]
fn allow_list_dominates_deny_list() {
    let profile = builtin();
    let allowed = profile.allowed_syscalls().len();
    let denied = profile.denied_syscalls().len();
    assert!(allowed > denied, "{allowed} allowed vs {denied} denied");
    assert!(allowed > 200, "only {allowed} syscalls allowed");
}

#[test]
fn every_deny_rule_documents_itself() {
    for rule in builtin()
        .syscalls
        .iter()
        .filter(|rule| rule.action == SeccompAction::Errno)
    {
        assert!(rule.errno_ret.is_some(), "{:?} has no errnoRet", rule.names);
        let comment = rule.comment.as_deref().unwrap_or_default();
        assert!(comment.len() > 10, "{:?} has comment {comment:?}", rule.names);
    }
}

#[test]
fn escape_syscalls_are_denied() {
    let profile = builtin();
    let denied = profile.denied_syscalls();
    for name in [
        "ptrace",
        "process_vm_readv",
        "process_vm_writev",
        "kexec_load",
        "kexec_file_load",
        "reboot",
        "init_module",
        "finit_module",
        "delete_module",
        "mount",
        "umount",
        "umount2",
        "pivot_root",
        "unshare",
        "setns",
        "bpf",
        "perf_event_open",
        "add_key",
        "request_key",
        "keyctl",
        "ioperm",
        "iopl",
        "chroot",
    ] {
        assert!(denied.contains(name), "{name} is not denied");
        assert!(ESCAPE_SYSCALLS.contains(&name));
    }
}

#[test]
fn operational_syscalls_are_allowed() {
    let profile = builtin();
    let allowed = profile.allowed_syscalls();
    for name in REQUIRED_ALLOWED_SYSCALLS {
        assert!(allowed.contains(name), "{name} is not allowed");
    }
}

#[test]
fn no_syscall_is_both_allowed_and_denied() {
    let profile = builtin();
    let allowed = profile.allowed_syscalls();
    let denied = profile.denied_syscalls();
    let overlap: BTreeSet<_> = allowed.intersection(&denied).collect();
    assert!(overlap.is_empty(), "conflicting syscalls: {overlap:?}");
}

#[test]
fn builtin_profile_validates_cleanly() {
    let report = builtin().validate();
    assert!(report.is_valid(), "{:?}", report.violations);
}

#[test]
fn regressions_are_detected() {
    let mut profile = builtin();
    if let Some(rule) = profile
        .syscalls
        .iter_mut()
        .find(|rule| rule.action == SeccompAction::Errno)
    {
        rule.comment = None;
        rule.errno_ret = None;
    }
    profile.default_action = SeccompAction::Allow;

    let err = profile.validate().into_result().unwrap_err();
    let message = err.to_string();
    assert!(message.contains("defaultAction must be SCMP_ACT_ERRNO"));
    assert!(message.contains("must set a nonzero errnoRet"));
    assert!(message.contains("must document why"));
}
