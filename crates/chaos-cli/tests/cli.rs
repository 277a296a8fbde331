//! Exit-code and usage contract for the chaos CLI.
//!
//! None of these run a real scenario; preflight rejects the fake node
//! binary before any namespace is touched, so they need no privileges.

use assert_cmd::Command;
use predicates::prelude::*;

fn chaos_cli() -> Command {
    Command::cargo_bin("chaos-cli").expect("binary builds")
}

#[test]
fn help_exits_zero_with_usage() {
    chaos_cli()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("scenario"));
}

#[test]
fn missing_subcommand_is_a_usage_error() {
    chaos_cli().assert().code(2);
}

#[test]
fn unknown_shape_is_a_usage_error() {
    chaos_cli()
        .args(["scenario", "ring", "tcp", "1", "10"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("unknown topology"));
}

#[test]
fn unknown_transport_is_a_usage_error() {
    chaos_cli()
        .args(["scenario", "pair", "udp", "1", "10"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("unknown transport"));
}

#[test]
fn non_numeric_seed_is_a_usage_error() {
    chaos_cli()
        .args(["scenario", "pair", "tcp", "not-a-seed", "10"])
        .assert()
        .code(2);
}

#[test]
fn unresolvable_node_binary_fails_preflight() {
    chaos_cli()
        .args(["scenario", "pair", "tcp", "1", "5"])
        .env("CHAOS_NODE_BIN", "/nonexistent/gossip-node")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("node binary"));
}

#[test]
fn cleanup_rejects_unknown_shapes() {
    chaos_cli()
        .args(["cleanup", "ring"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("unknown topology"));
}

#[test]
fn help_lists_cleanup() {
    chaos_cli()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("cleanup"));
}

#[test]
fn missing_duration_is_a_usage_error() {
    chaos_cli()
        .args(["scenario", "pair", "tcp", "1"])
        .assert()
        .code(2);
}
