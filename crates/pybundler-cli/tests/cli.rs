//! End-to-end tests of the `pybundler` binary.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::tempdir;

fn pybundler(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_pybundler"))
        .args(args)
        .current_dir(dir)
        .env_remove("PYBUNDLER_INTERPRETER")
        .env_remove("PYBUNDLER_LAUNCHER")
        .env_remove("PYBUNDLER_DIST_DIR")
        .output()
        .unwrap()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn test_help_lists_commands() {
    let dir = tempdir().unwrap();
    let output = pybundler(dir.path(), &["--help"]);
    assert!(output.status.success());
    let text = String::from_utf8_lossy(&output.stdout);
    for command in ["build", "graph", "audit"] {
        assert!(text.contains(command), "{text}");
    }
}

#[test]
fn test_version() {
    let dir = tempdir().unwrap();
    let output = pybundler(dir.path(), &["--version"]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_no_configuration_found() {
    let dir = tempdir().unwrap();
    let output = pybundler(dir.path(), &["build"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("No pybundler.toml"));
}

#[test]
fn test_invalid_configuration_exits_with_2() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("pybundler.toml"), "app = [\"a.py\"]\nplugin = [\"b.py\"]\n").unwrap();
    let output = pybundler(dir.path(), &["build"]);
    assert_eq!(output.status.code(), Some(2));
    assert!(stderr(&output).contains("mutually exclusive"), "{}", stderr(&output));

    fs::write(dir.path().join("pybundler.toml"), "app = [\"a.py\"]\nbogus_key = 1\n").unwrap();
    let output = pybundler(dir.path(), &["build"]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn test_missing_script_is_reported_before_probing() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("pybundler.toml"), "app = [\"nope.py\"]\n").unwrap();
    let output = pybundler(
        dir.path(),
        &["build", "--interpreter", "/nonexistent/python3"],
    );
    assert_eq!(output.status.code(), Some(2));
    assert!(stderr(&output).contains("Script not found"), "{}", stderr(&output));
    assert!(!dir.path().join("dist").exists());
}

#[test]
fn test_pyproject_section_is_required() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("pyproject.toml"), "[project]\nname = \"x\"\n").unwrap();
    let output = pybundler(dir.path(), &["graph"]);
    assert_eq!(output.status.code(), Some(2));
    assert!(stderr(&output).contains("tool.pybundler"), "{}", stderr(&output));
}

#[test]
fn test_alias_and_semi_standalone_conflict() {
    let dir = tempdir().unwrap();
    let output = pybundler(dir.path(), &["build", "--alias", "--semi-standalone"]);
    assert!(!output.status.success());
}

#[test]
fn test_audit_requires_a_bundle() {
    let dir = tempdir().unwrap();
    let output = pybundler(dir.path(), &["audit", "Missing.app"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("Info.plist"));
}
