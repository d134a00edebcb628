use std::process::{Command, Output};

fn ffibridge(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_ffibridge"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to run ffibridge")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn test_dist_prints_six_fractional_digits() {
    let output = ffibridge(&["dist"]);
    assert!(output.status.success());
    assert_eq!(stdout(&output), "1.414214\n");
}

#[test]
fn test_dist_with_flags() {
    let output = ffibridge(&["dist", "--x1", "0", "--y1", "0", "--x2", "-3", "--y2", "4", "--precision", "1"]);
    assert!(output.status.success());
    assert_eq!(stdout(&output), "5.0\n");
}

#[test]
fn test_ownership_reports_value() {
    let output = ffibridge(&["ownership"]);
    assert!(output.status.success());
    assert_eq!(stdout(&output), "got 2\n");

    let output = ffibridge(&["ownership", "--origin", "rust", "--value", "7"]);
    assert_eq!(stdout(&output), "got 7\n");
}

#[test]
fn test_simulated_double_free_is_rejected() {
    let output = ffibridge(&["ownership", "--simulate-double-free"]);
    assert!(output.status.success());

    assert_eq!(
        stdout(&output),
        "got 2\nrelease 1: ok (0)\nrelease 2: cell was already released (-1)\n"
    );
}

#[test]
fn test_c_abi_take_reports_value() {
    let output = ffibridge(&["ownership", "--origin", "rust", "--value", "7", "--simulate-double-free"]);
    assert!(output.status.success());

    let out = stdout(&output);
    assert!(out.starts_with("got 7\nrelease 1: ok (0)\n"));
    assert_eq!(out.matches("got ").count(), 1);
}

#[test]
fn test_simulated_mismatch_is_rejected_then_released() {
    let output = ffibridge(&["ownership", "--simulate-mismatch"]);
    assert!(output.status.success());

    let out = stdout(&output);
    assert!(out.starts_with("rejected: cell allocated by the C heap cannot be released by a Rust destructor"));
    assert!(out.ends_with("got 2\n"));
}

#[test]
fn test_header_and_manifest_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let header = dir.path().join("ffibridge.h");
    let manifest = dir.path().join("manifest.json");
    let header_arg = header.to_str().unwrap();
    let manifest_arg = manifest.to_str().unwrap();

    assert!(ffibridge(&["header", "--output", header_arg]).status.success());
    assert!(std::fs::read_to_string(&header).unwrap().contains("struct point {"));

    let output = ffibridge(&["manifest", "--output", manifest_arg, "--header", header_arg]);
    assert!(output.status.success());

    let output = ffibridge(&["manifest", "--validate", manifest_arg]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("boundary contract matches this build"));
}

#[test]
fn test_config_file_overrides_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("ffibridge.json");
    std::fs::write(&config, r#"{ "points": [{ "x": 0, "y": 0 }, { "x": 6, "y": 8 }], "precision": 0 }"#).unwrap();

    let output = ffibridge(&["--config", config.to_str().unwrap(), "dist"]);
    assert!(output.status.success());
    assert_eq!(stdout(&output), "10\n");
}

#[test]
fn test_bad_config_fails_with_context() {
    let output = ffibridge(&["--config", "/nonexistent/ffibridge.json", "dist"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Failed to read config"));
}
