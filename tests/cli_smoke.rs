//! Behavioural smoke tests for the CLI entrypoint.
//!
//! None of these reach the cloud: each invocation fails during argument or
//! workspace validation, before credentials are loaded.

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::TempDir;

#[test]
fn cli_without_arguments_prints_usage() {
    let mut cmd = cargo_bin_cmd!("adept-openstack");
    cmd.assert()
        .code(2)
        .stdout("")
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn create_requires_a_workspace() {
    let mut cmd = cargo_bin_cmd!("adept-openstack");
    cmd.env_remove("WORKSPACE")
        .args(["discover-create", "web1", "/tmp/id.pub"])
        .assert()
        .code(2)
        .stdout("");
}

#[test]
fn create_requires_a_public_key() {
    let mut cmd = cargo_bin_cmd!("adept-openstack");
    cmd.env("WORKSPACE", "/tmp")
        .args(["exclusive-create", "web1"])
        .assert()
        .code(2)
        .stdout("");
}

#[test]
fn missing_workspace_directory_is_a_usage_error() {
    let dir = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let missing = dir.path().join("absent");

    let mut cmd = cargo_bin_cmd!("adept-openstack");
    cmd.env("WORKSPACE", &missing)
        .env_remove("RUST_LOG")
        .args(["destroy", "web1"])
        .assert()
        .code(2)
        .stdout("")
        .stderr(predicate::str::contains("is not an existing directory"));
}

#[test]
fn zero_timeout_is_a_usage_error() {
    let dir = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));

    let mut cmd = cargo_bin_cmd!("adept-openstack");
    cmd.env("WORKSPACE", dir.path())
        .env_remove("RUST_LOG")
        .args(["destroy", "--timeout", "0", "web1"])
        .assert()
        .code(2)
        .stdout("")
        .stderr(predicate::str::contains("timeout must be positive"));
}
