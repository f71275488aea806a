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
fn workspace_bundle_export_and_import_roundtrip() {
    let src_ws = temp_dir("conductd-backup-src");
    let dst_ws = temp_dir("conductd-backup-dst");
    let out_dir = temp_dir("conductd-backup-out");
    let bundle = out_dir.join("workspace.zip");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": src_ws.to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.create",
        json!({ "nisn": "0090000001", "name": "Dewi", "className": "X-2", "cohort": "2025" }),
    );

    let exported = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "backup.exportWorkspace",
        json!({ "outPath": bundle.to_string_lossy() }),
    );
    assert_eq!(exported["bundleFormat"], "conductd-workspace-v1");
    assert_eq!(exported["entryCount"].as_u64(), Some(2));
    let sha = exported["dbSha256"].as_str().expect("sha").to_string();
    assert_eq!(sha.len(), 64);

    let f = std::fs::File::open(&bundle).expect("open bundle");
    let mut archive = zip::ZipArchive::new(f).expect("zip archive");
    let mut manifest = String::new();
    std::io::Read::read_to_string(
        &mut archive.by_name("manifest.json").expect("manifest entry"),
        &mut manifest,
    )
    .expect("read manifest");
    assert!(manifest.contains(&sha));
    archive
        .by_name("db/conductd.sqlite3")
        .expect("database entry");

    let imported = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "backup.importWorkspace",
        json!({ "inPath": bundle.to_string_lossy(), "workspacePath": dst_ws.to_string_lossy() }),
    );
    assert_eq!(imported["dbSha256"].as_str(), Some(sha.as_str()));

    // The sidecar now serves the imported workspace.
    let health = request_ok(&mut stdin, &mut reader, "5", "health", json!({}));
    let dst_str = dst_ws.to_string_lossy().to_string();
    assert_eq!(health["workspacePath"].as_str(), Some(dst_str.as_str()));
    let students = request_ok(&mut stdin, &mut reader, "6", "students.list", json!({}));
    assert_eq!(students["students"][0]["name"], "Dewi");

    let missing = request(
        &mut stdin,
        &mut reader,
        "7",
        "backup.importWorkspace",
        json!({ "inPath": out_dir.join("nope.zip").to_string_lossy() }),
    );
    assert_eq!(error_code(&missing), "not_found");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(src_ws);
    let _ = std::fs::remove_dir_all(dst_ws);
    let _ = std::fs::remove_dir_all(out_dir);
}

#[test]
fn tampered_bundle_is_rejected() {
    let src_ws = temp_dir("conductd-backup-tamper-src");
    let dst_ws = temp_dir("conductd-backup-tamper-dst");
    let bundle = src_ws.join("tampered.zip");

    {
        let f = std::fs::File::create(&bundle).expect("create bundle");
        let mut zip = zip::ZipWriter::new(f);
        let opts = zip::write::FileOptions::default();
        zip.start_file("manifest.json", opts).expect("manifest");
        zip.write_all(
            json!({ "format": "conductd-workspace-v1", "dbSha256": "00" })
                .to_string()
                .as_bytes(),
        )
        .expect("write manifest");
        zip.start_file("db/conductd.sqlite3", opts).expect("db entry");
        zip.write_all(b"not really sqlite").expect("write db");
        zip.finish().expect("finish zip");
    }

    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let resp = request(
        &mut stdin,
        &mut reader,
        "1",
        "backup.importWorkspace",
        json!({ "inPath": bundle.to_string_lossy(), "workspacePath": dst_ws.to_string_lossy() }),
    );
    assert_eq!(error_code(&resp), "io_failed");
    assert!(resp["error"]["message"]
        .as_str()
        .unwrap_or("")
        .contains("checksum"));
    assert!(!dst_ws.join("conductd.sqlite3").exists());

    // A rejected import into the open workspace leaves it usable.
    let open_ws = temp_dir("conductd-backup-tamper-open");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": open_ws.to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({ "nisn": "0090000002", "name": "Sari", "className": "XI-1", "cohort": "2024" }),
    );
    let resp = request(
        &mut stdin,
        &mut reader,
        "4",
        "backup.importWorkspace",
        json!({ "inPath": bundle.to_string_lossy() }),
    );
    assert_eq!(error_code(&resp), "io_failed");
    let students = request_ok(&mut stdin, &mut reader, "5", "students.list", json!({}));
    assert_eq!(students["students"][0]["name"], "Sari");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(src_ws);
    let _ = std::fs::remove_dir_all(dst_ws);
    let _ = std::fs::remove_dir_all(open_ws);
}
