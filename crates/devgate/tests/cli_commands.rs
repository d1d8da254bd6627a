#![cfg(feature = "cli")]

use std::io::{BufRead, BufReader};
use std::process::{Child, Command, Output, Stdio};

use serde_json::Value;

fn devgate(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_devgate"))
        .args(["--log-level", "off"])
        .args(args)
        .output()
        .expect("devgate should run")
}

fn stdout_json(output: &Output) -> Value {
    let text = String::from_utf8_lossy(&output.stdout);
    serde_json::from_str(text.trim()).expect("stdout should be one JSON document")
}

struct Serve {
    child: Child,
    lines: std::io::Lines<BufReader<std::process::ChildStdout>>,
}

impl Serve {
    fn start(extra: &[&str]) -> (Self, Value) {
        let mut child = Command::new(env!("CARGO_BIN_EXE_devgate"))
            .args(["--log-level", "off", "--format", "json", "serve"])
            .args(["--udp", "127.0.0.1:0", "--run-for", "20s"])
            .args(extra)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("serve should start");
        let stdout = child.stdout.take().expect("stdout is piped");
        let mut serve = Self {
            child,
            lines: BufReader::new(stdout).lines(),
        };
        let listening = serve.next_event();
        assert_eq!(listening["event"], "listening");
        (serve, listening)
    }

    fn next_event(&mut self) -> Value {
        let line = self
            .lines
            .next()
            .expect("serve should print an event")
            .expect("stdout should be readable");
        serde_json::from_str(&line).expect("event should be JSON")
    }
}

impl Drop for Serve {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

#[test]
fn version_prints_package_version() {
    let output = devgate(&["version"]);
    assert!(output.status.success());
    let text = String::from_utf8_lossy(&output.stdout);
    assert!(text.starts_with("devgate "));
}

#[test]
fn build_output_decodes_back() {
    let built = devgate(&[
        "--format",
        "pretty",
        "build",
        "realtime-ack",
        "--device",
        "AABBCCDD",
        "--seq",
        "42",
    ]);
    assert!(built.status.success());
    let hex = String::from_utf8_lossy(&built.stdout).trim().to_string();
    assert!(hex.starts_with("55AA000C"));

    let decoded = devgate(&["--format", "json", "decode", &hex]);
    assert!(decoded.status.success());
    let json = stdout_json(&decoded);
    assert_eq!(json["device_id"], "AABBCCDD");
    assert_eq!(json["command_name"], "realtime-ack");
    assert_eq!(json["fields"][0]["value"], "42");
}

#[test]
fn decode_rejects_bad_checksum_with_data_invalid() {
    let output = devgate(&["decode", "55AA000C", "AABBCCDD", "04", "0000002A", "00"]);
    assert_eq!(output.status.code(), Some(60));
    assert!(String::from_utf8_lossy(&output.stderr).contains("checksum"));
}

#[test]
fn build_rejects_out_of_range_switch_index() {
    let output = devgate(&[
        "build",
        "switch-state",
        "--device",
        "01020304",
        "--index",
        "16",
        "--state",
        "on",
    ]);
    assert_eq!(output.status.code(), Some(60));
}

#[test]
fn serve_acknowledges_register_sent_by_send() {
    let (mut serve, listening) = Serve::start(&[]);
    let udp = listening["udp"].as_str().expect("udp address").to_string();

    let built = devgate(&[
        "--format", "pretty", "build", "register", "--device", "AABBCCDD", "--seq", "7",
        "--device-type", "sensor",
    ]);
    let hex = String::from_utf8_lossy(&built.stdout).trim().to_string();

    let reply = devgate(&[
        "--format",
        "json",
        "send",
        &udp,
        &hex,
        "--bind",
        "127.0.0.1:0",
        "--wait",
        "--wait-timeout",
        "3s",
    ]);
    assert!(reply.status.success(), "send failed: {reply:?}");
    let json = stdout_json(&reply);
    assert_eq!(json["command_name"], "register-ack");
    assert_eq!(json["device_id"], "AABBCCDD");

    let added = serve.next_event();
    assert_eq!(added["event"], "session_added");
    assert_eq!(added["device"], "AABBCCDD");
}

#[test]
fn send_refuses_invalid_frame_without_force() {
    let output = devgate(&["send", "127.0.0.1:9", "0102"]);
    assert_eq!(output.status.code(), Some(60));
}

#[test]
fn send_wait_times_out_with_124() {
    let silent = std::net::UdpSocket::bind("127.0.0.1:0").expect("bind silent peer");
    let addr = silent.local_addr().expect("local addr").to_string();
    let output = devgate(&[
        "send",
        &addr,
        "0102",
        "--force",
        "--bind",
        "127.0.0.1:0",
        "--wait",
        "--wait-timeout",
        "200ms",
    ]);
    assert_eq!(output.status.code(), Some(124));
}

#[test]
fn serve_rejects_invalid_config_with_usage() {
    let dir = std::env::temp_dir().join(format!("devgate-cli-{}", std::process::id()));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    let path = dir.join("gateway.json");
    std::fs::write(&path, r#"{ "min_datagram_len": 4096, "max_read_len": 512 }"#)
        .expect("config should be writable");

    let output = devgate(&[
        "serve",
        "--config",
        path.to_str().expect("utf-8 path"),
        "--udp",
        "127.0.0.1:0",
    ]);
    assert_eq!(output.status.code(), Some(64));
    let _ = std::fs::remove_dir_all(&dir);
}
