//! End-to-end CLI tests (spec.md §8). Anything that actually attaches via
//! ptrace needs `CAP_SYS_PTRACE`/a permissive `yama.ptrace_scope` and is
//! marked `#[ignore]`; argument-validation paths that never reach
//! `PTRACE_TRACEME` run unconditionally.

use assert_cmd::Command;
use predicates::str::contains;

fn bin() -> Command {
    Command::cargo_bin("memcheck").unwrap()
}

#[test]
fn requires_a_command() {
    bin().assert().failure();
}

#[test]
fn rejects_nonexistent_program() {
    bin()
        .arg("/no/such/binary-xyz")
        .assert()
        .failure();
}

#[test]
fn prints_usage_on_help() {
    bin()
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("memcheck"));
}

/// spec.md §8 scenario 1: a trivially-exiting program with no uninitialized
/// reads runs to completion with the tracee's real exit code.
#[test]
#[ignore]
fn true_exits_zero_under_instrumentation() {
    bin().arg("/bin/true").assert().success();
}

#[test]
#[ignore]
fn false_propagates_nonzero_exit() {
    bin().arg("/bin/false").assert().failure().code(1);
}

#[test]
#[ignore]
fn echo_runs_with_arguments() {
    bin()
        .args(["/bin/echo", "-n", "hello"])
        .assert()
        .success();
}

/// The `-g` flag leaves a fatal error diagnosed rather than silently
/// swallowed; with a target that doesn't exist this should fail before
/// ever attaching, `-g` or not.
#[test]
fn gdb_flag_does_not_mask_early_failure() {
    bin()
        .args(["-g", "/no/such/binary-xyz"])
        .assert()
        .failure();
}

#[test]
#[ignore]
fn map_file_is_only_populated_on_sigint() {
    let dir = tempfile::tempdir().unwrap();
    let map_file = dir.path().join("maps.txt");
    bin()
        .args(["--map-file", map_file.to_str().unwrap(), "/bin/true"])
        .assert()
        .success();
    assert!(!map_file.exists());
}
