use std::net::{TcpListener, TcpStream};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::tempdir;

fn bin() -> String {
    env!("CARGO_BIN_EXE_stepcache").to_string()
}

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn wait_for(addr: &str) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while TcpStream::connect(addr).is_err() {
        assert!(Instant::now() < deadline, "server at {addr} never came up");
        thread::sleep(Duration::from_millis(50));
    }
}

#[test]
fn cli_config_works() {
    let out = Command::new(bin()).arg("config").output().unwrap();
    assert!(out.status.success());
    let text = String::from_utf8_lossy(&out.stderr);
    assert!(text.contains("PROTOCOL_VERSION="), "{text}");
}

#[test]
fn cli_rejects_bad_sizes() {
    let st = Command::new(bin())
        .args(["serve", "--table-cap", "lots"])
        .stderr(Stdio::null())
        .status()
        .unwrap();
    assert!(!st.success());
}

#[test]
fn cli_maintain_needs_root() {
    let st = Command::new(bin())
        .arg("maintain")
        .stderr(Stdio::null())
        .status()
        .unwrap();
    assert!(!st.success());
}

#[test]
fn cli_maintain_creates_database() {
    let dir = tempdir().unwrap();
    let out = Command::new(bin())
        .args(["--json", "maintain", "--root"])
        .arg(dir.path())
        .output()
        .unwrap();
    assert!(out.status.success());
    let report: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(report["ran"], true);
    assert_eq!(report["deletedEntries"], 0);
    assert!(dir.path().join("cachedb").is_file());
}

#[test]
fn cli_serve_command_and_shutdown() {
    let dir = tempdir().unwrap();
    let addr = format!("127.0.0.1:{}", free_port());
    let mut server = Command::new(bin())
        .args(["-q", "serve", "--listen", &addr, "--root"])
        .arg(dir.path())
        .spawn()
        .unwrap();
    wait_for(&addr);

    let out = Command::new(bin())
        .args(["command", "--addr", &addr, "status"])
        .output()
        .unwrap();
    assert!(out.status.success());
    assert!(String::from_utf8_lossy(&out.stdout).contains("Buckets: 0"));

    let out = Command::new(bin())
        .args(["command", "--addr", &addr, "validate"])
        .output()
        .unwrap();
    assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "Validation OK");

    let st = Command::new(bin())
        .args(["shutdown", "--addr", &addr, "--reason", "cli test"])
        .status()
        .unwrap();
    assert!(st.success());

    let status = server.wait().unwrap();
    assert!(status.success());
    assert!(dir.path().join("cachedb").is_file());
}

#[test]
fn cli_command_without_server_fails() {
    let addr = format!("127.0.0.1:{}", free_port());
    let st = Command::new(bin())
        .args(["command", "--addr", &addr, "status"])
        .stderr(Stdio::null())
        .status()
        .unwrap();
    assert!(!st.success());
}
