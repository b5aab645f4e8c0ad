//! CLI contract for `supervisor detect` and `supervisor init`.

use std::fs;
use std::process::Command;

fn supervisor() -> Command {
    Command::new(env!("CARGO_BIN_EXE_supervisor"))
}

#[test]
fn detect_prints_entry_as_json() {
    let temp = tempfile::tempdir().expect("tempdir");
    let work = temp.path().join("work");
    fs::create_dir_all(work.join("src")).expect("mkdir");
    fs::write(work.join("src/bot.py"), "print('hi')\n").expect("write");
    fs::write(work.join("app.py"), "print('hi')\n").expect("write");

    let output = supervisor()
        .arg("--config")
        .arg(temp.path().join("missing.toml"))
        .arg("detect")
        .arg(&work)
        .output()
        .expect("run supervisor");

    assert_eq!(output.status.code(), Some(0));
    let result: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(result["entry"], "app.py");
    assert_eq!(result["runtime"], "python");
}

#[test]
fn detect_without_entry_lists_nothing_and_exits_2() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(temp.path().join("README.md"), "docs").expect("write");

    let output = supervisor()
        .arg("--config")
        .arg(temp.path().join("missing.toml"))
        .arg("detect")
        .arg(temp.path())
        .output()
        .expect("run supervisor");

    assert_eq!(output.status.code(), Some(2));
    assert!(output.stdout.is_empty());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("no runnable entry point"), "{stderr}");
}

#[test]
fn init_then_invalid_config_exits_1() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = temp.path().join("supervisor.toml");

    let status = supervisor()
        .arg("--config")
        .arg(&config)
        .arg("init")
        .status()
        .expect("run init");
    assert_eq!(status.code(), Some(0));
    assert!(config.is_file());

    let again = supervisor()
        .arg("--config")
        .arg(&config)
        .arg("init")
        .status()
        .expect("run init again");
    assert_eq!(again.code(), Some(1));

    fs::write(&config, "[launch]\nstartle_primary_ms = 0\n").expect("write");
    let output = supervisor()
        .arg("--config")
        .arg(&config)
        .arg("detect")
        .arg(temp.path())
        .output()
        .expect("run detect");
    assert_eq!(output.status.code(), Some(1));
}
