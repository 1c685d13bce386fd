//! Integration tests for core CLI contract behavior.

use {predicates::prelude::*, std::fs, tempfile::tempdir};

fn cli_cmd() -> assert_cmd::Command {
    assert_cmd::Command::cargo_bin("stm32-uart-prog").expect("binary builds")
}

#[test]
fn help_exits_zero_and_writes_stdout_only() {
    let mut cmd = cli_cmd();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("stm32-uart-prog"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn version_exits_zero() {
    let mut cmd = cli_cmd();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("stm32-uart-prog"));
}

#[test]
fn missing_required_arguments_exit_2() {
    let mut cmd = cli_cmd();
    cmd.assert().failure().code(2);

    let mut cmd = cli_cmd();
    cmd.args(["--hexfile", "fw.hex"]).assert().failure().code(2);
}

#[test]
fn invalid_target_spec_exits_2() {
    let dir = tempdir().expect("tempdir");
    let hex = dir.path().join("fw.hex");
    // Two data bytes at 0x08000000 plus EOF, with valid record checksums.
    fs::write(
        &hex,
        ":020000040800F2\n:02000000AAAAAA\n:00000001FF\n",
    )
    .expect("write hex");

    let mut cmd = cli_cmd();
    cmd.args(["--hexfile"])
        .arg(&hex)
        .args(["--targets", "5-3", "--non-interactive", "--port", "/dev/null"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("reversed"));
}

#[test]
fn malformed_hexfile_exits_2() {
    let dir = tempdir().expect("tempdir");
    let hex = dir.path().join("bad.hex");
    fs::write(&hex, ":NOTHEX\n").expect("write hex");

    let mut cmd = cli_cmd();
    cmd.args(["--hexfile"])
        .arg(&hex)
        .args(["--targets", "1", "--non-interactive", "--port", "/dev/null"])
        .assert()
        .failure()
        .code(2);
}

#[test]
fn hex_data_outside_flash_window_exits_2() {
    let dir = tempdir().expect("tempdir");
    let hex = dir.path().join("ram.hex");
    // Data at 0x20000000 (RAM, not flash).
    fs::write(
        &hex,
        ":020000042000DA\n:02000000AAAAAA\n:00000001FF\n",
    )
    .expect("write hex");

    let mut cmd = cli_cmd();
    cmd.args(["--hexfile"])
        .arg(&hex)
        .args(["--targets", "1", "--non-interactive", "--port", "/dev/null"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("outside flash"));
}

#[test]
fn missing_hexfile_path_exits_2() {
    let mut cmd = cli_cmd();
    cmd.args([
        "--hexfile",
        "/definitely/not/here.hex",
        "--targets",
        "1",
        "--non-interactive",
    ])
    .assert()
    .failure()
    .code(2);
}

#[test]
fn go_and_no_go_conflict_exits_2() {
    let mut cmd = cli_cmd();
    cmd.args([
        "--hexfile", "fw.hex", "--targets", "1", "--go", "--no-go",
    ])
    .assert()
    .failure()
    .code(2);
}

#[test]
fn unusable_port_exits_3() {
    let dir = tempdir().expect("tempdir");
    let hex = dir.path().join("fw.hex");
    fs::write(
        &hex,
        ":020000040800F2\n:02000000AAAAAA\n:00000001FF\n",
    )
    .expect("write hex");

    let mut cmd = cli_cmd();
    cmd.args(["--hexfile"])
        .arg(&hex)
        .args([
            "--targets",
            "1",
            "--non-interactive",
            "--quiet",
            "--port",
            "/dev/nonexistent-serial-port",
        ])
        .assert()
        .failure()
        .code(3);
}

#[test]
fn list_ports_runs_without_programming_arguments() {
    let mut cmd = cli_cmd();
    // May legitimately find zero ports in CI; only the exit code and the
    // absence of a usage error are contractual.
    let output = cmd.args(["--list-ports"]).output().expect("command runs");
    assert_ne!(output.status.code(), Some(2));
}

#[test]
fn list_ports_json_is_valid_json() {
    let mut cmd = cli_cmd();
    let output = cmd
        .args(["--list-ports", "--json"])
        .output()
        .expect("command runs");

    if output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let parsed: serde_json::Value =
            serde_json::from_str(&stdout).expect("stdout is JSON");
        assert!(parsed.is_array());
    }
}
