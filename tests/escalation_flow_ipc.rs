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

/// Workspace with an active 2025/2026 year and the SP1..SP3 ladder.
fn seed_workspace(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &PathBuf,
) -> String {
    let _ = request_ok(
        stdin,
        reader,
        "seed-ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let year = request_ok(
        stdin,
        reader,
        "seed-year",
        "academicYears.create",
        json!({ "label": "2025/2026", "startDate": "2025-07-14", "endDate": "2026-06-30" }),
    );
    let year_id = year["id"].as_str().expect("year id").to_string();
    let _ = request_ok(
        stdin,
        reader,
        "seed-activate",
        "academicYears.activate",
        json!({ "academicYearId": year_id }),
    );
    for (i, (kind, level, threshold)) in [("SP1", 1, 25), ("SP2", 2, 50), ("SP3", 3, 75)]
        .into_iter()
        .enumerate()
    {
        let _ = request_ok(
            stdin,
            reader,
            &format!("seed-rule-{}", i),
            "rules.create",
            json!({ "letterKind": kind, "level": level, "threshold": threshold }),
        );
    }
    year_id
}

#[test]
fn crossing_threshold_issues_one_letter_per_rule() {
    let workspace = temp_dir("conductd-escalation-flow");
    let csv_out = workspace.join("summary.csv");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let year_id = seed_workspace(&mut stdin, &mut reader, &workspace);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "setup.update",
        json!({ "section": "letters", "patch": { "schoolName": "SMA Negeri 1 Contoh" } }),
    );
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.create",
        json!({ "nisn": "0061112223", "name": "Budi Santoso", "className": "XI-2", "cohort": "2024" }),
    );
    let student_id = student["studentId"].as_str().expect("student id").to_string();
    let skipping = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "catalog.create",
        json!({ "kind": "violation", "name": "Bolos", "category": "Kehadiran", "points": 15 }),
    );
    let skipping_id = skipping["id"].as_str().expect("item id").to_string();
    let award = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "catalog.create",
        json!({ "kind": "achievement", "name": "Juara Lomba", "category": "Prestasi", "points": 10 }),
    );
    let award_id = award["id"].as_str().expect("item id").to_string();

    let submit = |stdin: &mut ChildStdin,
                  reader: &mut BufReader<ChildStdout>,
                  id: &str,
                  item_id: &str,
                  date: &str| {
        request_ok(
            stdin,
            reader,
            id,
            "reports.submit",
            json!({
                "studentId": student_id,
                "itemId": item_id,
                "occurredOn": date,
                "reporter": "Bu Sari"
            }),
        )
    };

    let first = submit(&mut stdin, &mut reader, "5", &skipping_id, "2025-08-04");
    assert_eq!(first["previousTotal"].as_i64(), Some(0));
    assert_eq!(first["total"].as_i64(), Some(-15));
    assert_eq!(first["lettersIssued"].as_array().map(|a| a.len()), Some(0));

    let second = submit(&mut stdin, &mut reader, "6", &skipping_id, "2025-08-11");
    assert_eq!(second["total"].as_i64(), Some(-30));
    let issued = second["lettersIssued"].as_array().expect("letters");
    assert_eq!(issued.len(), 1);
    assert_eq!(issued[0]["letterKind"], "SP1");
    assert_eq!(issued[0]["status"], "pending");
    let body = issued[0]["body"].as_str().expect("body");
    assert!(body.contains("Budi Santoso"));
    assert!(body.contains("SMA Negeri 1 Contoh"));
    assert!(body.contains("2025/2026"));

    // Achievement lifts the student back under SP1, a new violation crosses
    // it again but SP1 is not issued twice in the same year.
    let third = submit(&mut stdin, &mut reader, "7", &award_id, "2025-08-12");
    assert_eq!(third["total"].as_i64(), Some(-20));
    let fourth = submit(&mut stdin, &mut reader, "8", &skipping_id, "2025-08-13");
    assert_eq!(fourth["total"].as_i64(), Some(-35));
    assert_eq!(fourth["lettersIssued"].as_array().map(|a| a.len()), Some(0));

    // One large adjustment crosses SP2 and SP3 together.
    let adjusted = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "reports.adjust",
        json!({
            "studentId": student_id,
            "delta": -45,
            "reason": "Perkelahian",
            "reporter": "Pak Joko",
            "occurredOn": "2025-08-20"
        }),
    );
    assert_eq!(adjusted["total"].as_i64(), Some(-80));
    let kinds: Vec<&str> = adjusted["lettersIssued"]
        .as_array()
        .expect("letters")
        .iter()
        .filter_map(|l| l["letterKind"].as_str())
        .collect();
    assert_eq!(kinds, vec!["SP2", "SP3"]);

    let detail = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "students.detail",
        json!({ "studentId": student_id, "academicYearId": year_id }),
    );
    assert_eq!(detail["totals"]["total"].as_i64(), Some(-80));
    assert_eq!(detail["ledger"].as_array().map(|a| a.len()), Some(5));
    assert_eq!(detail["letters"].as_array().map(|a| a.len()), Some(3));

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "exports.pointSummary",
        json!({ "outPath": csv_out.to_string_lossy() }),
    );
    let rows = summary["rows"].as_array().expect("rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["violationPoints"].as_i64(), Some(45));
    assert_eq!(rows[0]["achievementPoints"].as_i64(), Some(10));
    assert_eq!(rows[0]["adjustmentPoints"].as_i64(), Some(-45));
    assert_eq!(rows[0]["lettersIssued"].as_i64(), Some(3));

    let mut csv_reader = csv::Reader::from_path(&csv_out).expect("open csv");
    let headers = csv_reader.headers().expect("headers").clone();
    assert_eq!(&headers[0], "nisn");
    let records: Vec<csv::StringRecord> = csv_reader
        .records()
        .collect::<Result<_, _>>()
        .expect("records");
    assert_eq!(records.len(), 1);
    assert_eq!(&records[0][0], "0061112223");
    assert_eq!(&records[0][7], "-80");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn voiding_a_report_reverses_points_and_keeps_letters() {
    let workspace = temp_dir("conductd-void-flow");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = seed_workspace(&mut stdin, &mut reader, &workspace);

    let student = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "students.create",
        json!({ "nisn": "0069998887", "name": "Siti Aminah", "className": "X-3", "cohort": "2025" }),
    );
    let student_id = student["studentId"].as_str().expect("student id").to_string();

    let filed = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "reports.submit",
        json!({
            "studentId": student_id,
            "kind": "violation",
            "points": 30,
            "itemName": "Merokok",
            "occurredOn": "2025-09-02",
            "reporter": "Pak Joko"
        }),
    );
    let report_id = filed["reportId"].as_str().expect("report id").to_string();
    assert_eq!(filed["lettersIssued"].as_array().map(|a| a.len()), Some(1));

    let voided = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "reports.void",
        json!({ "reportId": report_id, "reason": "Salah siswa" }),
    );
    assert_eq!(voided["previousTotal"].as_i64(), Some(-30));
    assert_eq!(voided["total"].as_i64(), Some(0));

    let again = request(
        &mut stdin,
        &mut reader,
        "4",
        "reports.void",
        json!({ "reportId": report_id, "reason": "Salah siswa" }),
    );
    assert_eq!(error_code(&again), "already_void");

    let visible = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "reports.list",
        json!({ "studentId": student_id }),
    );
    assert_eq!(visible["reports"].as_array().map(|a| a.len()), Some(0));
    let all = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "reports.list",
        json!({ "studentId": student_id, "includeVoided": true }),
    );
    assert_eq!(all["reports"][0]["voided"], true);

    let letters = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "letters.history",
        json!({ "studentId": student_id }),
    );
    assert_eq!(letters["letters"].as_array().map(|a| a.len()), Some(1));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn report_outside_any_academic_year_is_rejected() {
    let workspace = temp_dir("conductd-no-year");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = seed_workspace(&mut stdin, &mut reader, &workspace);

    let student = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "students.create",
        json!({ "nisn": "0060000001", "name": "Rina", "className": "X-1", "cohort": "2025" }),
    );
    let resp = request(
        &mut stdin,
        &mut reader,
        "2",
        "reports.submit",
        json!({
            "studentId": student["studentId"],
            "kind": "violation",
            "points": 5,
            "itemName": "Terlambat",
            "occurredOn": "2024-01-10",
            "reporter": "Bu Sari"
        }),
    );
    assert_eq!(error_code(&resp), "no_academic_year");

    let zero = request(
        &mut stdin,
        &mut reader,
        "3",
        "reports.adjust",
        json!({
            "studentId": student["studentId"],
            "delta": 0,
            "reason": "x",
            "reporter": "Bu Sari",
            "occurredOn": "2025-09-01"
        }),
    );
    assert_eq!(error_code(&zero), "bad_params");

    let bad_ladder = request(
        &mut stdin,
        &mut reader,
        "4",
        "rules.create",
        json!({ "letterKind": "SP4", "level": 4, "threshold": 60 }),
    );
    assert_eq!(error_code(&bad_ladder), "bad_params");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
