use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_conductd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn conductd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> &str {
    value
        .pointer("/error/code")
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

#[test]
fn setup_sections_roundtrip_and_reject_bad_patches() {
    let workspace = temp_dir("conductd-setup");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let dispatch = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "setup.get",
        json!({ "section": "dispatch" }),
    );
    assert_eq!(dispatch["maxAttempts"].as_i64(), Some(3));
    assert!(dispatch["outboxDir"].is_null());

    let letters = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "setup.get",
        json!({ "section": "letters" }),
    );
    assert_eq!(letters["signatory"], "Kepala Sekolah");
    assert!(letters["defaultTemplate"]
        .as_str()
        .unwrap_or("")
        .contains("{{student_name}}"));

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "setup.update",
        json!({
            "section": "letters",
            "patch": { "schoolName": "  SMK Harapan  ", "signatory": "Wakasek Kesiswaan" }
        }),
    );
    assert_eq!(updated["section"]["schoolName"], "SMK Harapan");

    let reread = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "setup.get",
        json!({ "section": "letters" }),
    );
    assert_eq!(reread["signatory"], "Wakasek Kesiswaan");
    assert_eq!(reread["defaultTemplate"], letters["defaultTemplate"]);

    let cases = vec![
        json!({ "section": "dispatch", "patch": { "maxAttempts": 0 } }),
        json!({ "section": "dispatch", "patch": { "maxAttempts": 11 } }),
        json!({ "section": "dispatch", "patch": { "maxAttempts": "3" } }),
        json!({ "section": "dispatch", "patch": { "retryDelay": 5 } }),
        json!({ "section": "letters", "patch": { "defaultTemplate": "   " } }),
        json!({ "section": "printer", "patch": {} }),
        json!({ "section": "letters", "patch": "schoolName" }),
    ];
    for (i, params) in cases.into_iter().enumerate() {
        let resp = request(&mut stdin, &mut reader, &format!("bad-{}", i), "setup.update", params.clone());
        assert_eq!(error_code(&resp), "bad_params", "expected rejection for {}", params);
    }

    // Rejected patches leave stored values alone.
    let after = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "setup.get",
        json!({ "section": "dispatch" }),
    );
    assert_eq!(after["maxAttempts"].as_i64(), Some(3));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
