//! Exit-code contract of the crawlserver binary.

use std::process::Command;

fn crawlserver() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_crawlserver"));
    command
        .env_remove("CS_PATH_TO_WASM")
        .env_remove("CS_SERVER_PORT")
        .env_remove("CS_CHILD_PROCESSES")
        .env_remove("CS_DEBUG")
        .env_remove("CS_GLOBAL_BIND");
    command
}

#[test]
fn test_exit_10_without_wasm_path() {
    let output = crawlserver().arg("-p").arg("4100").output().unwrap();
    assert_eq!(output.status.code(), Some(10));
}

#[test]
fn test_exit_20_when_wasm_file_is_absent() {
    let output = crawlserver()
        .arg("/nonexistent/application.wasm")
        .arg("-p")
        .arg("4100")
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(20));
}

#[test]
fn test_exit_1_without_port() {
    let path = std::env::temp_dir().join("crawlserver-cli-test.wasm");
    std::fs::write(&path, b"\0asm\x01\0\0\0").unwrap();

    let output = crawlserver().arg(&path).output().unwrap();
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn test_env_variables_stand_in_for_flags() {
    // Path from the environment, still no port anywhere: exit 1 proves the
    // env path was accepted (exit 10 would mean it was not seen).
    let path = std::env::temp_dir().join("crawlserver-cli-env-test.wasm");
    std::fs::write(&path, b"\0asm\x01\0\0\0").unwrap();

    let output = crawlserver()
        .env("CS_PATH_TO_WASM", &path)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
}
