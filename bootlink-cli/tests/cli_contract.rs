//! Integration tests for core CLI contract behavior.

use {predicates::prelude::*, std::fs, tempfile::tempdir};

fn cli_cmd() -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("bootlink");
    cmd.env_remove("BOOTLINK_PORT").env_remove("BOOTLINK_BAUD");
    cmd
}

/// Command isolated from any global config file on the machine.
fn isolated_cmd(home: &std::path::Path) -> assert_cmd::Command {
    let mut cmd = cli_cmd();
    cmd.current_dir(home)
        .env("HOME", home)
        .env("XDG_CONFIG_HOME", home.join(".config"));
    cmd
}

#[test]
fn help_exits_zero_and_writes_stdout_only() {
    let mut cmd = cli_cmd();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("bootlink"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn version_exits_zero_and_writes_stdout_only() {
    let mut cmd = cli_cmd();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("bootlink"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn receive_help_lists_transfer_options() {
    let mut cmd = cli_cmd();
    cmd.args(["receive", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--mode"))
        .stdout(predicate::str::contains("--block-timeout"));
}

#[test]
fn list_ports_json_returns_valid_json() {
    let mut cmd = cli_cmd();
    let output = cmd
        .args(["list-ports", "--json"])
        .output()
        .expect("command should execute");

    // Without port enumeration support the command may fail, but stdout
    // must never carry anything other than JSON.
    let stdout = String::from_utf8_lossy(&output.stdout);
    if output.status.success() {
        let parsed: serde_json::Value =
            serde_json::from_str(&stdout).expect("stdout should be valid JSON");
        assert!(parsed.is_array(), "should be a JSON array");
    } else {
        assert!(stdout.is_empty());
    }
}

// ============================================================================
// Exit Code Tests
// ============================================================================

/// Exit code 2: usage error (unknown command, invalid arguments)
#[test]
fn exit_code_two_for_usage_error_unknown_command() {
    let mut cmd = cli_cmd();
    cmd.arg("unknown-command-xyz")
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("unrecognized").or(predicate::str::contains("unknown")));
}

#[test]
fn exit_code_two_for_missing_output_path() {
    let mut cmd = cli_cmd();
    cmd.arg("receive").assert().failure().code(2);
}

#[test]
fn exit_code_two_for_invalid_mode() {
    let mut cmd = cli_cmd();
    cmd.args(["receive", "out.bin", "--mode", "sha1"])
        .assert()
        .failure()
        .code(2);
}

/// Exit code 3: no port configured anywhere
#[test]
fn exit_code_three_without_port() {
    let dir = tempdir().expect("tempdir should be created");

    let mut cmd = isolated_cmd(dir.path());
    cmd.args(["receive", "image.bin"])
        .assert()
        .failure()
        .code(3)
        .stderr(predicate::str::contains("--port"));

    assert!(!dir.path().join("image.bin").exists());
}

#[test]
fn invalid_config_file_only_warns() {
    let dir = tempdir().expect("tempdir should be created");
    fs::write(dir.path().join("bootlink.toml"), "invalid toml [[[")
        .expect("write invalid config");

    let mut cmd = isolated_cmd(dir.path());
    let output = cmd
        .args(["receive", "image.bin"])
        .output()
        .expect("command should execute");

    // The broken file is skipped, so the run proceeds to the missing-port error
    assert_eq!(output.status.code(), Some(3));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("TOML"), "should warn about invalid TOML");
}

#[test]
fn exit_code_one_when_output_exists() {
    let dir = tempdir().expect("tempdir should be created");
    let output = dir.path().join("image.bin");
    fs::write(&output, b"keep me").expect("write existing output");

    let mut cmd = isolated_cmd(dir.path());
    cmd.args(["-p", "INVALID_PORT_NAME_XYZ", "receive"])
        .arg(&output)
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("--force"));

    assert_eq!(fs::read(&output).expect("read output"), b"keep me");
}

#[test]
fn receive_on_missing_port_fails_without_creating_output() {
    let dir = tempdir().expect("tempdir should be created");
    let output = dir.path().join("image.bin");

    let mut cmd = isolated_cmd(dir.path());
    cmd.args(["--port", "INVALID_PORT_NAME_XYZ", "receive"])
        .arg(&output)
        .assert()
        .failure()
        .code(1)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("INVALID_PORT_NAME_XYZ"));

    assert!(!output.exists());
}

#[test]
fn port_from_config_file_is_used() {
    let dir = tempdir().expect("tempdir should be created");
    fs::write(
        dir.path().join("bootlink.toml"),
        "[connection]\nserial = \"CONFIGURED_PORT_XYZ\"\n",
    )
    .expect("write config");

    let mut cmd = isolated_cmd(dir.path());
    cmd.args(["receive", "image.bin"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("CONFIGURED_PORT_XYZ"));
}

#[test]
fn exit_code_three_for_unsupported_line_settings() {
    let dir = tempdir().expect("tempdir should be created");
    fs::write(
        dir.path().join("bootlink.toml"),
        "[connection]\nserial = \"CONFIGURED_PORT_XYZ\"\ndata_bits = 9\n",
    )
    .expect("write config");

    let mut cmd = isolated_cmd(dir.path());
    cmd.args(["receive", "image.bin"])
        .assert()
        .failure()
        .code(3)
        .stderr(predicate::str::contains("data bits"));

    assert!(!dir.path().join("image.bin").exists());
}

#[test]
fn unknown_flag_suggests_similar() {
    let mut cmd = cli_cmd();
    cmd.arg("list-ports")
        .arg("--jason")
        .assert()
        .failure()
        .stderr(predicate::str::contains("json").or(predicate::str::contains("did you mean")));
}
