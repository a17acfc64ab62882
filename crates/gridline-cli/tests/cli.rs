//! End-to-end checks of the `gridline` binary.

use std::path::Path;
use std::process::{Command, Output};

const CONFIG: &str = r#"
package: ibis
axes:
  - name: os
    values: [linux, windows]
  - name: runtime
    values: ["3.10"]
  - name: backend
    values: [sqlite, postgres]
backends:
  - name: sqlite
  - name: postgres
    required_services: [postgres]
exclude:
  - backend: postgres
    os: windows
services:
  postgres:
    port: 5432
commands:
  install: "true"
  test: "true"
  import: "true"
"#;

fn gridline(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_gridline"))
        .current_dir(dir)
        .env_remove("GRIDLINE_CONFIG")
        .env("RUST_LOG", "warn")
        .args(args)
        .output()
        .expect("gridline binary runs")
}

fn workspace() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("gridline.yaml"), CONFIG).unwrap();
    dir
}

#[test]
fn test_validate_discovers_config() {
    let dir = workspace();
    let output = gridline(dir.path(), &["validate"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Jobs: 3 of 4 candidates"), "{}", stdout);
}

#[test]
fn test_resolve_json_lists_surviving_combinations() {
    let dir = workspace();
    let output = gridline(dir.path(), &["resolve", "--json"]);
    assert!(output.status.success());

    let combinations: Vec<serde_json::Value> = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(combinations.len(), 3);
    assert!(combinations.iter().all(|c| c["tag"]["platform"] == "linux" || c["tag"]["backend"] == "sqlite"));
}

#[test]
fn test_unknown_backend_fails_fast() {
    let dir = workspace();
    let output = gridline(dir.path(), &["resolve", "--backend", "oracle"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("oracle"));
}

#[test]
fn test_invalid_exclusion_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("gridline.yaml"),
        CONFIG.replace("os: windows", "os: macos"),
    )
    .unwrap();
    let output = gridline(dir.path(), &["validate"]);
    assert!(!output.status.success());
}

#[test]
fn test_schema_needs_no_config() {
    let dir = tempfile::tempdir().unwrap();
    let output = gridline(dir.path(), &["schema"]);
    assert!(output.status.success());
    let schema: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert!(schema["properties"]["axes"].is_object());
}

#[test]
fn test_build_writes_manifest() {
    let dir = workspace();
    let output = gridline(dir.path(), &["build", "--backend", "sqlite", "--out", "dist"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let stdout = String::from_utf8_lossy(&output.stdout);
    let manifest = stdout.lines().last().unwrap();
    assert!(manifest.ends_with("artifact.json"));
    assert!(dir.path().join(manifest).is_file());
}
