use crate::error::{map_unique, EngineError};
use crate::ipc::helpers::{
    get_optional_bool, get_optional_str, get_required_str, to_json, with_conn, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::{ledger, letters, reports, years};
use rusqlite::{Connection, OptionalExtension};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

fn student_json(conn: &Connection, student_id: &str) -> Result<Value, HandlerErr> {
    conn.query_row(
        "SELECT id, nisn, name, class_name, cohort, active, updated_at FROM students WHERE id = ?",
        [student_id],
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "nisn": r.get::<_, String>(1)?,
                "name": r.get::<_, String>(2)?,
                "className": r.get::<_, String>(3)?,
                "cohort": r.get::<_, String>(4)?,
                "active": r.get::<_, i64>(5)? != 0,
                "updatedAt": r.get::<_, Option<String>>(6)?,
            }))
        },
    )
    .optional()?
    .ok_or_else(|| EngineError::not_found("student", student_id).into())
}

fn non_empty(params: &Value, key: &str) -> Result<String, HandlerErr> {
    let v = get_required_str(params, key)?.trim().to_string();
    if v.is_empty() {
        return Err(HandlerErr::bad_params(format!("{} must not be empty", key)));
    }
    Ok(v)
}

fn students_list(conn: &mut Connection, params: &Value) -> Result<Value, HandlerErr> {
    let class_name = get_optional_str(params, "className")?;
    let include_inactive = get_optional_bool(params, "includeInactive")?.unwrap_or(false);

    let mut stmt = conn.prepare(
        "SELECT id, nisn, name, class_name, cohort, active
         FROM students
         WHERE (? IS NULL OR class_name = ?) AND (? = 1 OR active = 1)
         ORDER BY class_name, name",
    )?;
    let rows = stmt
        .query_map(
            rusqlite::params![class_name, class_name, include_inactive as i64],
            |r| {
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "nisn": r.get::<_, String>(1)?,
                    "name": r.get::<_, String>(2)?,
                    "className": r.get::<_, String>(3)?,
                    "cohort": r.get::<_, String>(4)?,
                    "active": r.get::<_, i64>(5)? != 0,
                }))
            },
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "students": rows }))
}

fn students_create(conn: &mut Connection, params: &Value) -> Result<Value, HandlerErr> {
    let nisn = non_empty(params, "nisn")?;
    let name = non_empty(params, "name")?;
    let class_name = non_empty(params, "className")?;
    let cohort = non_empty(params, "cohort")?;

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, nisn, name, class_name, cohort, active, updated_at)
         VALUES(?, ?, ?, ?, ?, 1, datetime('now'))",
        (&id, &nisn, &name, &class_name, &cohort),
    )
    .map_err(|e| map_unique(e, "student with this nisn"))?;
    Ok(json!({ "studentId": id }))
}

fn students_update(conn: &mut Connection, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let current = student_json(conn, &student_id)?;

    let pick = |key: &str| -> Result<String, HandlerErr> {
        match get_optional_str(params, key)? {
            Some(v) if v.trim().is_empty() => {
                Err(HandlerErr::bad_params(format!("{} must not be empty", key)))
            }
            Some(v) => Ok(v.trim().to_string()),
            None => Ok(current[key].as_str().unwrap_or_default().to_string()),
        }
    };
    let name = pick("name")?;
    let class_name = pick("className")?;
    let cohort = pick("cohort")?;
    let active = get_optional_bool(params, "active")?
        .unwrap_or_else(|| current["active"].as_bool().unwrap_or(true));

    conn.execute(
        "UPDATE students
         SET name = ?, class_name = ?, cohort = ?, active = ?, updated_at = datetime('now')
         WHERE id = ?",
        rusqlite::params![name, class_name, cohort, active as i64, student_id],
    )?;
    student_json(conn, &student_id)
}

/// Everything the student detail page shows for one academic year.
fn students_detail(conn: &mut Connection, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let student = student_json(conn, &student_id)?;
    let year_id = get_optional_str(params, "academicYearId")?;
    let year = years::resolve(conn, year_id.as_deref())?;

    let entries = ledger::entries_for(conn, &student_id, &year.id)?;
    let totals = ledger::fold_totals(&entries)?;
    let reports = reports::list(
        conn,
        &reports::ReportFilter {
            student_id: Some(student_id.clone()),
            academic_year_id: Some(year.id.clone()),
            kind: None,
            include_voided: true,
        },
    )?;
    let letters = letters::list(
        conn,
        &letters::LetterFilter {
            student_id: Some(student_id.clone()),
            academic_year_id: Some(year.id.clone()),
            status: None,
        },
    )?;

    Ok(json!({
        "student": student,
        "academicYear": to_json(&year)?,
        "totals": to_json(&totals)?,
        "ledger": to_json(&entries)?,
        "reports": to_json(&reports)?,
        "letters": to_json(&letters)?,
    }))
}

#[derive(Debug, Deserialize)]
struct StudentCsvRow {
    nisn: String,
    name: String,
    class_name: String,
    cohort: String,
}

/// Upserts students from a CSV roster keyed on NISN.
fn students_import_csv(conn: &mut Connection, params: &Value) -> Result<Value, HandlerErr> {
    let csv_path = get_required_str(params, "csvPath")?;
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(&csv_path)
        .map_err(|e| HandlerErr {
            code: "io_failed",
            message: format!("failed to open {}: {}", csv_path, e),
            details: None,
        })?;

    let tx = conn.unchecked_transaction()?;
    let mut inserted = 0usize;
    let mut updated = 0usize;
    for (line, result) in reader.deserialize::<StudentCsvRow>().enumerate() {
        let row = result.map_err(|e| HandlerErr {
            code: "bad_csv",
            message: e.to_string(),
            details: Some(json!({ "row": line + 1 })),
        })?;
        if row.nisn.is_empty() || row.name.is_empty() || row.class_name.is_empty() {
            return Err(HandlerErr {
                code: "bad_csv",
                message: "nisn, name and class_name are required".to_string(),
                details: Some(json!({ "row": line + 1 })),
            });
        }
        let existing: Option<String> = tx
            .query_row("SELECT id FROM students WHERE nisn = ?", [&row.nisn], |r| {
                r.get(0)
            })
            .optional()?;
        match existing {
            Some(id) => {
                tx.execute(
                    "UPDATE students SET name = ?, class_name = ?, cohort = ?, updated_at = datetime('now')
                     WHERE id = ?",
                    (&row.name, &row.class_name, &row.cohort, &id),
                )?;
                updated += 1;
            }
            None => {
                tx.execute(
                    "INSERT INTO students(id, nisn, name, class_name, cohort, active, updated_at)
                     VALUES(?, ?, ?, ?, ?, 1, datetime('now'))",
                    (
                        Uuid::new_v4().to_string(),
                        &row.nisn,
                        &row.name,
                        &row.class_name,
                        &row.cohort,
                    ),
                )?;
                inserted += 1;
            }
        }
    }
    tx.commit()?;
    tracing::info!(inserted, updated, path = %csv_path, "student roster imported");
    Ok(json!({ "inserted": inserted, "updated": updated }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(with_conn(state, req, students_list)),
        "students.create" => Some(with_conn(state, req, students_create)),
        "students.update" => Some(with_conn(state, req, students_update)),
        "students.detail" => Some(with_conn(state, req, students_detail)),
        "students.importCsv" => Some(with_conn(state, req, students_import_csv)),
        _ => None,
    }
}
