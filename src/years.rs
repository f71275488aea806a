use crate::error::{EngineError, EngineResult};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AcademicYear {
    pub id: String,
    pub label: String,
    pub start_date: String,
    pub end_date: String,
    pub is_active: bool,
}

#[derive(Debug, Clone)]
pub struct ClassPromotion {
    pub from_class: String,
    pub to_class: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionSummary {
    pub academic_year_id: String,
    pub promoted_students: usize,
    pub graduated_students: usize,
}

pub fn parse_date(raw: &str) -> EngineResult<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| EngineError::invalid(format!("invalid date (expected YYYY-MM-DD): {}", raw)))
}

fn year_from_row(r: &Row<'_>) -> rusqlite::Result<AcademicYear> {
    Ok(AcademicYear {
        id: r.get(0)?,
        label: r.get(1)?,
        start_date: r.get(2)?,
        end_date: r.get(3)?,
        is_active: r.get::<_, i64>(4)? != 0,
    })
}

pub fn list(conn: &Connection) -> EngineResult<Vec<AcademicYear>> {
    let mut stmt = conn.prepare(
        "SELECT id, label, start_date, end_date, is_active
         FROM academic_years
         ORDER BY start_date",
    )?;
    let rows = stmt
        .query_map([], year_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get(conn: &Connection, id: &str) -> EngineResult<AcademicYear> {
    conn.query_row(
        "SELECT id, label, start_date, end_date, is_active FROM academic_years WHERE id = ?",
        [id],
        year_from_row,
    )
    .optional()?
    .ok_or_else(|| EngineError::not_found("academic year", id))
}

pub fn active(conn: &Connection) -> EngineResult<Option<AcademicYear>> {
    Ok(conn
        .query_row(
            "SELECT id, label, start_date, end_date, is_active
             FROM academic_years WHERE is_active = 1",
            [],
            year_from_row,
        )
        .optional()?)
}

/// The year whose date range contains `date`. Ranges never overlap.
pub fn covering(conn: &Connection, date: NaiveDate) -> EngineResult<AcademicYear> {
    let d = date.to_string();
    conn.query_row(
        "SELECT id, label, start_date, end_date, is_active
         FROM academic_years
         WHERE start_date <= ? AND end_date >= ?",
        [&d, &d],
        year_from_row,
    )
    .optional()?
    .ok_or(EngineError::NoAcademicYear(date))
}

/// Resolves an explicit year id, falling back to the active year.
pub fn resolve(conn: &Connection, explicit: Option<&str>) -> EngineResult<AcademicYear> {
    match explicit {
        Some(id) => get(conn, id),
        None => active(conn)?
            .ok_or_else(|| EngineError::invalid("no active academic year; pass academicYearId")),
    }
}

pub fn create(
    conn: &Connection,
    label: &str,
    start: NaiveDate,
    end: NaiveDate,
) -> EngineResult<AcademicYear> {
    let label = label.trim();
    if label.is_empty() {
        return Err(EngineError::invalid("label must not be empty"));
    }
    if end < start {
        return Err(EngineError::invalid("endDate must not be before startDate"));
    }
    let overlapping: Option<String> = conn
        .query_row(
            "SELECT label FROM academic_years WHERE start_date <= ? AND end_date >= ?",
            [end.to_string(), start.to_string()],
            |r| r.get(0),
        )
        .optional()?;
    if let Some(other) = overlapping {
        return Err(EngineError::invalid(format!(
            "date range overlaps academic year {}",
            other
        )));
    }

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO academic_years(id, label, start_date, end_date, is_active)
         VALUES(?, ?, ?, ?, 0)",
        (&id, label, start.to_string(), end.to_string()),
    )
    .map_err(|e| crate::error::map_unique(e, "academic year label"))?;
    get(conn, &id)
}

pub fn activate(conn: &Connection, id: &str) -> EngineResult<AcademicYear> {
    let tx = conn.unchecked_transaction()?;
    let year = set_active(&tx, id)?;
    tx.commit()?;
    Ok(year)
}

/// Caller owns the transaction.
fn set_active(conn: &Connection, id: &str) -> EngineResult<AcademicYear> {
    get(conn, id)?;
    conn.execute("UPDATE academic_years SET is_active = 0 WHERE is_active = 1", [])?;
    conn.execute("UPDATE academic_years SET is_active = 1 WHERE id = ?", [id])?;
    get(conn, id)
}

/// Moves the school into a new academic year: activates it, renames
/// classes per the promotion map and deactivates graduating students.
/// Runs in one transaction so a half-applied promotion is never visible.
pub fn transition(
    conn: &mut Connection,
    to_year_id: &str,
    promotions: &[ClassPromotion],
    graduate_classes: &[String],
) -> EngineResult<TransitionSummary> {
    let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
    set_active(&tx, to_year_id)?;

    let mut graduated_students = 0usize;
    for class in graduate_classes {
        graduated_students += tx.execute(
            "UPDATE students SET active = 0, updated_at = datetime('now')
             WHERE class_name = ? AND active = 1",
            [class],
        )?;
    }

    // Collect ids up front so chained promotions (X -> XI, XI -> XII)
    // move each student once.
    let mut moves: Vec<(String, String)> = Vec::new();
    for p in promotions {
        if p.from_class.trim().is_empty() || p.to_class.trim().is_empty() {
            return Err(EngineError::invalid("promotion classes must not be empty"));
        }
        let mut stmt = tx.prepare("SELECT id FROM students WHERE class_name = ? AND active = 1")?;
        let ids = stmt
            .query_map([&p.from_class], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        moves.extend(ids.into_iter().map(|id| (id, p.to_class.clone())));
    }
    for (student_id, to_class) in &moves {
        tx.execute(
            "UPDATE students SET class_name = ?, updated_at = datetime('now') WHERE id = ?",
            (to_class, student_id),
        )?;
    }

    tx.commit()?;
    tracing::info!(
        academic_year_id = to_year_id,
        promoted = moves.len(),
        graduated = graduated_students,
        "academic year transition applied"
    );
    Ok(TransitionSummary {
        academic_year_id: to_year_id.to_string(),
        promoted_students: moves.len(),
        graduated_students,
    })
}
