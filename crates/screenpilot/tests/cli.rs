use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn test_help_lists_subcommands() {
    Command::cargo_bin("screenpilot")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("context"));
}

#[test]
fn test_unknown_subcommand_fails() {
    Command::cargo_bin("screenpilot")
        .unwrap()
        .arg("teleport")
        .assert()
        .failure();
}

#[test]
fn test_status_without_daemon_exits_transport_code() {
    Command::cargo_bin("screenpilot")
        .unwrap()
        .env("SCREENPILOT_API_PORT", "1")
        .arg("status")
        .assert()
        .code(74)
        .stderr(predicate::str::contains("not reachable").or(predicate::str::contains("Error")));
}
