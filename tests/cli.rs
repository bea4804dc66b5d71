//! End-to-end tests for the scifi-readers binary.

use assert_cmd::Command;
use predicates::prelude::*;

fn cmd() -> Command {
    Command::cargo_bin("scifi-readers").unwrap()
}

fn gsf_file(dir: &tempfile::TempDir) -> std::path::PathBuf {
    let mut out = b"Gwyddion Simple Field 1.0\n".to_vec();
    out.extend_from_slice(b"XRes = 2\nYRes = 2\nTitle = Topography\nZUnits = m\n");
    let pad = 4 - out.len() % 4;
    out.extend(std::iter::repeat(0u8).take(pad));
    for v in [0.0f32, 1.0, 2.0, 3.0] {
        out.extend_from_slice(&v.to_le_bytes());
    }
    let path = dir.path().join("topo.gsf");
    std::fs::write(&path, out).unwrap();
    path
}

#[test]
fn readers_lists_every_registered_reader() {
    cmd()
        .arg("readers")
        .assert()
        .success()
        .stdout(predicate::str::contains("Registered readers (12 total):"))
        .stdout(predicate::str::contains("gwyddion"))
        .stdout(predicate::str::contains("nanonis-dat"));
}

#[test]
fn readers_json_is_parseable() {
    let assert = cmd().arg("readers").arg("--json").assert().success();
    let parsed: serde_json::Value = serde_json::from_slice(&assert.get_output().stdout).unwrap();
    let entries = parsed.as_array().unwrap();
    assert_eq!(entries.len(), 12);
    assert!(entries.iter().all(|e| e["name"].is_string()));
}

#[test]
fn info_reports_the_extracted_dataset() {
    let dir = tempfile::tempdir().unwrap();
    let path = gsf_file(&dir);
    cmd()
        .arg("info")
        .arg("--input")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("Datasets: 1"))
        .stdout(predicate::str::contains("Topography"))
        .stdout(predicate::str::contains("Source: GwyddionReader"));
}

#[test]
fn info_json_is_parseable() {
    let dir = tempfile::tempdir().unwrap();
    let path = gsf_file(&dir);
    let assert = cmd()
        .arg("info")
        .arg("--input")
        .arg(&path)
        .arg("--json")
        .assert()
        .success();
    let parsed: serde_json::Value = serde_json::from_slice(&assert.get_output().stdout).unwrap();
    assert_eq!(parsed["count"], 1);
    assert_eq!(parsed["datasets"][0]["title"], "Topography");
}

#[test]
fn info_on_a_missing_file_fails() {
    cmd()
        .arg("info")
        .arg("--input")
        .arg("no_such_file.gsf")
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn unknown_forced_reader_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = gsf_file(&dir);
    cmd()
        .arg("info")
        .arg("--input")
        .arg(&path)
        .arg("--reader")
        .arg("bogus")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown reader"));
}

#[test]
fn metadata_prints_the_file_header_fields() {
    let dir = tempfile::tempdir().unwrap();
    let path = gsf_file(&dir);
    cmd()
        .arg("metadata")
        .arg("--input")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("XRes: 2"))
        .stdout(predicate::str::contains("Title: Topography"));
}
