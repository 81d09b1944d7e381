//! Integration tests for the `wisp` binary: file running and exit codes.

use assert_cmd::Command;
use predicates::str::contains;
use std::io::Write;
use tempfile::NamedTempFile;

fn script_file(source: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "{source}").unwrap();
    file
}

#[test]
fn running_a_valid_script_exits_zero_and_prints_output() {
    let file = script_file("print 1 + 2;");
    Command::cargo_bin("wisp")
        .unwrap()
        .arg(file.path())
        .assert()
        .success()
        .stdout(contains("3"));
}

#[test]
fn compile_error_exits_65() {
    let file = script_file("var x = ;");
    Command::cargo_bin("wisp")
        .unwrap()
        .arg(file.path())
        .assert()
        .code(65);
}

#[test]
fn runtime_error_exits_70() {
    let file = script_file("print 1 + nil;");
    Command::cargo_bin("wisp")
        .unwrap()
        .arg(file.path())
        .assert()
        .code(70);
}

#[test]
fn missing_file_exits_74() {
    Command::cargo_bin("wisp")
        .unwrap()
        .arg("/nonexistent/path/to/a/script.wisp")
        .assert()
        .code(74);
}
