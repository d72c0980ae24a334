use assert_cmd::Command;
use predicates::str::contains;

fn outpost(dir: &tempfile::TempDir) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("outpost"));
    cmd.env("OUTPOST_DIR", dir.path()).env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_cli_help() {
    let dir = tempfile::tempdir().unwrap();
    outpost(&dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("Outpost"))
        .stdout(contains("user-helper"));
}

#[test]
fn test_cli_version() {
    let dir = tempfile::tempdir().unwrap();
    outpost(&dir).arg("--version").assert().success();
}

#[test]
fn test_service_answers_stdin_commands() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("config.toml"), "[helper]\nenabled = false\n").unwrap();

    outpost(&dir)
        .args(["service", "--once", "--attended"])
        .write_stdin("{\"id\":\"c1\",\"type\":\"no_such_command\"}\n")
        .assert()
        .success()
        .stdout(contains("\"commandId\":\"c1\""))
        .stdout(contains("unknown command type: no_such_command"));
}

#[test]
fn test_user_helper_without_service_fails() {
    let dir = tempfile::tempdir().unwrap();
    outpost(&dir)
        .args(["user-helper", "--socket"])
        .arg(dir.path().join("missing.sock"))
        .assert()
        .failure()
        .stderr(contains("Error:"));
}
