use std::fs;
use std::path::Path;
use std::process::{Command, Output};

fn write_units(root: &Path) {
    fs::create_dir_all(root.join("auth")).expect("mkdir");
    fs::write(root.join("double.rhai"), "|x| x * 2").expect("script");
    fs::write(
        root.join("greeting.rhai"),
        r#"karate.set("who", "qa"); "hello " + karate.env"#,
    )
    .expect("script");
    fs::write(root.join("auth/token.feature"), "Feature: token").expect("feature");
    fs::write(root.join("sb.toml"), "env = \"dev\"\n").expect("config");
}

fn sb_cli(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_sb-cli"))
        .args(args)
        .env("RUST_LOG", "off")
        .output()
        .expect("cli should execute")
}

fn stdout_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn run_prints_the_unit_value() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_units(dir.path());
    let root = dir.path().display().to_string();

    let output = sb_cli(&["run", "--root", &root, "--unit", "double.rhai", "--arg", "21"]);
    assert!(
        output.status.success(),
        "stdout:\n{}\nstderr:\n{}",
        stdout_of(&output),
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = stdout_of(&output);
    assert!(stdout.contains("RESULT:OK"));
    assert!(stdout.contains("VALUE_JSON:42"));
}

#[test]
fn run_reads_env_from_config_and_flag() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_units(dir.path());
    let root = dir.path().display().to_string();

    let from_file = sb_cli(&["run", "--root", &root, "--unit", "greeting.rhai"]);
    assert!(stdout_of(&from_file).contains("VALUE_JSON:\"hello dev\""));

    let from_flag = sb_cli(&["run", "--root", &root, "--unit", "greeting.rhai", "--env", "qa"]);
    assert!(stdout_of(&from_flag).contains("VALUE_JSON:\"hello qa\""));
}

#[test]
fn run_reports_missing_units() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_units(dir.path());
    let root = dir.path().display().to_string();

    let output = sb_cli(&["run", "--root", &root, "--unit", "missing.rhai"]);
    assert_eq!(output.status.code(), Some(1));
    let stdout = stdout_of(&output);
    assert!(stdout.contains("RESULT:ERROR"));
    assert!(stdout.contains("ERROR_CODE:BRIDGE_UNIT_NOT_FOUND"));
    assert!(stdout.contains("ERROR_MSG_JSON:\"unit not found: missing.rhai\""));
}

#[test]
fn units_lists_callable_files() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_units(dir.path());
    let root = dir.path().display().to_string();

    let output = sb_cli(&["units", "--root", &root]);
    assert!(output.status.success());
    let stdout = stdout_of(&output);
    let units = stdout
        .lines()
        .filter_map(|line| line.strip_prefix("UNIT:"))
        .collect::<Vec<_>>();
    assert_eq!(units, vec!["auth/token.feature", "double.rhai", "greeting.rhai"]);
    assert!(stdout.contains("COUNT:3"));
}
