//! Conduct reports: the only writers of the point ledger.
//!
//! Every writer takes the database write lock first (IMMEDIATE transaction)
//! and then performs report insert, ledger append and threshold evaluation
//! before committing. Two submissions for the same student can therefore
//! never both read the same previous total.

use crate::error::{EngineError, EngineResult};
use crate::escalation::{self, Evaluation};
use crate::ledger::{self, EntryKind, NewEntry};
use crate::letters::WarningLetter;
use crate::years;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub id: String,
    pub student_id: String,
    pub academic_year_id: String,
    pub kind: EntryKind,
    pub item_id: Option<String>,
    pub item_name: String,
    pub category: Option<String>,
    pub points: i64,
    pub occurred_on: String,
    pub reporter: String,
    pub note: Option<String>,
    pub voided: bool,
    pub void_reason: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub enum ReportSource {
    Catalog {
        item_id: String,
    },
    Manual {
        kind: EntryKind,
        points: i64,
        item_name: String,
        category: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct SubmitReport {
    pub student_id: String,
    pub source: ReportSource,
    pub occurred_on: Option<NaiveDate>,
    pub reporter: String,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Outcome {
    pub report_id: String,
    pub entry_id: String,
    pub previous_total: i64,
    pub total: i64,
    pub letters_issued: Vec<WarningLetter>,
}

impl Outcome {
    fn new(report_id: String, eval: Evaluation) -> Self {
        Self {
            report_id,
            entry_id: eval.entry.id,
            previous_total: eval.previous_total,
            total: eval.total,
            letters_issued: eval.letters_issued,
        }
    }
}

const REPORT_COLUMNS: &str = "id, student_id, academic_year_id, kind, item_id, item_name,
    category, points, occurred_on, reporter, note, voided, void_reason, created_at";

fn report_from_row(r: &Row<'_>) -> rusqlite::Result<Report> {
    let kind: String = r.get(3)?;
    Ok(Report {
        id: r.get(0)?,
        student_id: r.get(1)?,
        academic_year_id: r.get(2)?,
        kind: EntryKind::parse(&kind).unwrap_or(EntryKind::Adjustment),
        item_id: r.get(4)?,
        item_name: r.get(5)?,
        category: r.get(6)?,
        points: r.get(7)?,
        occurred_on: r.get(8)?,
        reporter: r.get(9)?,
        note: r.get(10)?,
        voided: r.get::<_, i64>(11)? != 0,
        void_reason: r.get(12)?,
        created_at: r.get(13)?,
    })
}

pub fn get(conn: &Connection, id: &str) -> EngineResult<Report> {
    let sql = format!("SELECT {} FROM reports WHERE id = ?", REPORT_COLUMNS);
    conn.query_row(&sql, [id], report_from_row)
        .optional()?
        .ok_or_else(|| EngineError::not_found("report", id))
}

fn require_active_student(conn: &Connection, student_id: &str) -> EngineResult<()> {
    let active: Option<i64> = conn
        .query_row("SELECT active FROM students WHERE id = ?", [student_id], |r| {
            r.get(0)
        })
        .optional()?;
    match active {
        None => Err(EngineError::not_found("student", student_id)),
        Some(0) => Err(EngineError::invalid("student is inactive")),
        Some(_) => Ok(()),
    }
}

struct ResolvedItem {
    kind: EntryKind,
    item_id: Option<String>,
    item_name: String,
    category: Option<String>,
    magnitude: i64,
}

fn resolve_source(conn: &Connection, source: ReportSource) -> EngineResult<ResolvedItem> {
    match source {
        ReportSource::Catalog { item_id } => {
            let row: Option<(String, String, String, i64, i64)> = conn
                .query_row(
                    "SELECT kind, name, category, points, archived FROM catalog_items WHERE id = ?",
                    [&item_id],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
                )
                .optional()?;
            let Some((kind, name, category, points, archived)) = row else {
                return Err(EngineError::not_found("catalog item", item_id));
            };
            if archived != 0 {
                return Err(EngineError::invalid("catalog item is archived"));
            }
            let kind = EntryKind::parse(&kind)
                .ok_or_else(|| EngineError::invalid(format!("catalog item has unknown kind {}", kind)))?;
            Ok(ResolvedItem {
                kind,
                item_id: Some(item_id),
                item_name: name,
                category: Some(category),
                magnitude: points,
            })
        }
        ReportSource::Manual {
            kind,
            points,
            item_name,
            category,
        } => {
            if kind == EntryKind::Adjustment {
                return Err(EngineError::invalid("use reports.adjust for adjustments"));
            }
            if !(1..=ledger::MAX_ENTRY_POINTS).contains(&points) {
                return Err(EngineError::invalid(format!(
                    "points must be in 1..={}",
                    ledger::MAX_ENTRY_POINTS
                )));
            }
            if item_name.trim().is_empty() {
                return Err(EngineError::invalid("itemName must not be empty"));
            }
            Ok(ResolvedItem {
                kind,
                item_id: None,
                item_name: item_name.trim().to_string(),
                category,
                magnitude: points,
            })
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn insert_report(
    conn: &Connection,
    student_id: &str,
    academic_year_id: &str,
    item: &ResolvedItem,
    points: i64,
    occurred_on: NaiveDate,
    reporter: &str,
    note: Option<&str>,
    now: DateTime<Utc>,
) -> EngineResult<String> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO reports(
            id, student_id, academic_year_id, kind, item_id, item_name, category,
            points, occurred_on, reporter, note, voided, created_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?)",
        rusqlite::params![
            id,
            student_id,
            academic_year_id,
            item.kind.as_str(),
            item.item_id,
            item.item_name,
            item.category,
            points,
            occurred_on.to_string(),
            reporter,
            note,
            ledger::now_rfc3339(now),
        ],
    )?;
    Ok(id)
}

fn require_reporter(reporter: &str) -> EngineResult<()> {
    if reporter.trim().is_empty() {
        return Err(EngineError::invalid("reporter must not be empty"));
    }
    Ok(())
}

pub fn submit(conn: &mut Connection, input: SubmitReport, now: DateTime<Utc>) -> EngineResult<Outcome> {
    require_reporter(&input.reporter)?;
    let occurred_on = input.occurred_on.unwrap_or_else(|| now.date_naive());

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    require_active_student(&tx, &input.student_id)?;
    let year = years::covering(&tx, occurred_on)?;
    let item = resolve_source(&tx, input.source)?;
    let delta = item.kind.signed(item.magnitude);

    let report_id = insert_report(
        &tx,
        &input.student_id,
        &year.id,
        &item,
        delta,
        occurred_on,
        input.reporter.trim(),
        input.note.as_deref(),
        now,
    )?;
    let eval = escalation::append_and_evaluate(
        &tx,
        &NewEntry {
            student_id: input.student_id.clone(),
            academic_year_id: year.id.clone(),
            source_report_id: Some(report_id.clone()),
            reverses_entry_id: None,
            kind: item.kind,
            delta,
            occurred_on,
            note: input.note.clone(),
        },
        now,
    )?;
    tx.commit()?;
    Ok(Outcome::new(report_id, eval))
}

/// Manual correction of a student's balance, recorded as its own report.
pub fn adjust(
    conn: &mut Connection,
    student_id: &str,
    delta: i64,
    reason: &str,
    reporter: &str,
    occurred_on: Option<NaiveDate>,
    now: DateTime<Utc>,
) -> EngineResult<Outcome> {
    require_reporter(reporter)?;
    if delta == 0 {
        return Err(EngineError::invalid("delta must not be 0"));
    }
    if !(-ledger::MAX_ENTRY_POINTS..=ledger::MAX_ENTRY_POINTS).contains(&delta) {
        return Err(EngineError::invalid(format!(
            "delta must be within -{0}..={0}",
            ledger::MAX_ENTRY_POINTS
        )));
    }
    if reason.trim().is_empty() {
        return Err(EngineError::invalid("reason must not be empty"));
    }
    let occurred_on = occurred_on.unwrap_or_else(|| now.date_naive());

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    require_active_student(&tx, student_id)?;
    let year = years::covering(&tx, occurred_on)?;
    let item = ResolvedItem {
        kind: EntryKind::Adjustment,
        item_id: None,
        item_name: "manual adjustment".to_string(),
        category: None,
        magnitude: delta,
    };
    let report_id = insert_report(
        &tx,
        student_id,
        &year.id,
        &item,
        delta,
        occurred_on,
        reporter.trim(),
        Some(reason.trim()),
        now,
    )?;
    let eval = escalation::append_and_evaluate(
        &tx,
        &NewEntry {
            student_id: student_id.to_string(),
            academic_year_id: year.id.clone(),
            source_report_id: Some(report_id.clone()),
            reverses_entry_id: None,
            kind: EntryKind::Adjustment,
            delta,
            occurred_on,
            note: Some(reason.trim().to_string()),
        },
        now,
    )?;
    tx.commit()?;
    Ok(Outcome::new(report_id, eval))
}

/// Cancels a report by appending the opposite entry. Letters already issued
/// stay issued.
pub fn void(conn: &mut Connection, report_id: &str, reason: &str, now: DateTime<Utc>) -> EngineResult<Outcome> {
    if reason.trim().is_empty() {
        return Err(EngineError::invalid("reason must not be empty"));
    }
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let report = get(&tx, report_id)?;
    if report.voided {
        return Err(EngineError::AlreadyVoid(report_id.to_string()));
    }
    let original = ledger::entry_for_report(&tx, report_id)?;
    let occurred_on = years::parse_date(&original.occurred_on)?;
    let delta = original
        .delta
        .checked_neg()
        .ok_or_else(|| EngineError::invalid("entry cannot be reversed"))?;

    tx.execute(
        "UPDATE reports SET voided = 1, void_reason = ? WHERE id = ?",
        (reason.trim(), report_id),
    )?;
    let eval = escalation::append_and_evaluate(
        &tx,
        &NewEntry {
            student_id: original.student_id.clone(),
            academic_year_id: original.academic_year_id.clone(),
            source_report_id: Some(report_id.to_string()),
            reverses_entry_id: Some(original.id.clone()),
            kind: original.kind,
            delta,
            occurred_on,
            note: Some(reason.trim().to_string()),
        },
        now,
    )?;
    tx.commit()?;
    Ok(Outcome::new(report_id.to_string(), eval))
}

#[derive(Debug, Clone, Default)]
pub struct ReportFilter {
    pub student_id: Option<String>,
    pub academic_year_id: Option<String>,
    pub kind: Option<EntryKind>,
    pub include_voided: bool,
}

pub fn list(conn: &Connection, filter: &ReportFilter) -> EngineResult<Vec<Report>> {
    let mut sql = format!("SELECT {} FROM reports WHERE 1 = 1", REPORT_COLUMNS);
    let mut binds: Vec<String> = Vec::new();
    if let Some(v) = &filter.student_id {
        sql.push_str(" AND student_id = ?");
        binds.push(v.clone());
    }
    if let Some(v) = &filter.academic_year_id {
        sql.push_str(" AND academic_year_id = ?");
        binds.push(v.clone());
    }
    if let Some(k) = filter.kind {
        sql.push_str(" AND kind = ?");
        binds.push(k.as_str().to_string());
    }
    if !filter.include_voided {
        sql.push_str(" AND voided = 0");
    }
    sql.push_str(" ORDER BY occurred_on DESC, created_at DESC");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(binds.iter()), report_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
