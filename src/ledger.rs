//! Append-only point ledger.
//!
//! Every point change a student receives is one row in `ledger_entries`.
//! Totals are always folded from the rows of one academic year; there is
//! no stored running total to drift out of sync.

use crate::error::{EngineError, EngineResult};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::{Connection, Row};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Violation,
    Achievement,
    Adjustment,
}

impl EntryKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "violation" => Some(Self::Violation),
            "achievement" => Some(Self::Achievement),
            "adjustment" => Some(Self::Adjustment),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Violation => "violation",
            Self::Achievement => "achievement",
            Self::Adjustment => "adjustment",
        }
    }

    /// Applies the sign convention: violations subtract, achievements add,
    /// adjustments keep whatever sign the caller gave.
    pub fn signed(self, magnitude: i64) -> i64 {
        match self {
            Self::Violation => -magnitude.saturating_abs(),
            Self::Achievement => magnitude.saturating_abs(),
            Self::Adjustment => magnitude,
        }
    }
}

/// Largest magnitude a single entry may carry.
pub const MAX_ENTRY_POINTS: i64 = 1000;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub id: String,
    pub seq: i64,
    pub student_id: String,
    pub academic_year_id: String,
    pub source_report_id: Option<String>,
    pub reverses_entry_id: Option<String>,
    pub kind: EntryKind,
    pub delta: i64,
    pub occurred_on: String,
    pub recorded_at: String,
    pub note: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewEntry {
    pub student_id: String,
    pub academic_year_id: String,
    pub source_report_id: Option<String>,
    pub reverses_entry_id: Option<String>,
    pub kind: EntryKind,
    pub delta: i64,
    pub occurred_on: NaiveDate,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PointTotals {
    /// Magnitude of violation points still standing (reversals deducted).
    pub violation_points: i64,
    pub achievement_points: i64,
    pub adjustment_points: i64,
    pub total: i64,
}

impl PointTotals {
    pub fn deficit(&self) -> i64 {
        self.total.saturating_neg()
    }
}

/// Folds entries into per-kind buckets and the signed total. Fails instead
/// of wrapping when a sum leaves the i64 range.
pub fn fold_totals<'a, I>(entries: I) -> EngineResult<PointTotals>
where
    I: IntoIterator<Item = &'a LedgerEntry>,
{
    let overflow = || EngineError::invalid("point total out of range");
    entries
        .into_iter()
        .try_fold(PointTotals::default(), |mut acc, e| -> EngineResult<PointTotals> {
            match e.kind {
                EntryKind::Violation => {
                    acc.violation_points =
                        acc.violation_points.checked_sub(e.delta).ok_or_else(overflow)?
                }
                EntryKind::Achievement => {
                    acc.achievement_points =
                        acc.achievement_points.checked_add(e.delta).ok_or_else(overflow)?
                }
                EntryKind::Adjustment => {
                    acc.adjustment_points =
                        acc.adjustment_points.checked_add(e.delta).ok_or_else(overflow)?
                }
            }
            acc.total = acc.total.checked_add(e.delta).ok_or_else(overflow)?;
            Ok(acc)
        })
}

pub fn now_rfc3339(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Secs, true)
}

const ENTRY_COLUMNS: &str = "seq, id, student_id, academic_year_id, source_report_id,
    reverses_entry_id, kind, delta, occurred_on, recorded_at, note";

fn entry_from_row(r: &Row<'_>) -> rusqlite::Result<LedgerEntry> {
    let kind: String = r.get(6)?;
    Ok(LedgerEntry {
        seq: r.get(0)?,
        id: r.get(1)?,
        student_id: r.get(2)?,
        academic_year_id: r.get(3)?,
        source_report_id: r.get(4)?,
        reverses_entry_id: r.get(5)?,
        kind: EntryKind::parse(&kind).unwrap_or(EntryKind::Adjustment),
        delta: r.get(7)?,
        occurred_on: r.get(8)?,
        recorded_at: r.get(9)?,
        note: r.get(10)?,
    })
}

pub fn append(conn: &Connection, entry: &NewEntry, now: DateTime<Utc>) -> EngineResult<LedgerEntry> {
    if entry.delta == 0 {
        return Err(EngineError::invalid("ledger entries must change the total"));
    }
    if !(-MAX_ENTRY_POINTS..=MAX_ENTRY_POINTS).contains(&entry.delta) {
        return Err(EngineError::invalid(format!(
            "a single entry may move at most {} points",
            MAX_ENTRY_POINTS
        )));
    }
    let id = Uuid::new_v4().to_string();
    let recorded_at = now_rfc3339(now);
    conn.execute(
        "INSERT INTO ledger_entries(
            id, student_id, academic_year_id, source_report_id, reverses_entry_id,
            kind, delta, occurred_on, recorded_at, note
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            id,
            entry.student_id,
            entry.academic_year_id,
            entry.source_report_id,
            entry.reverses_entry_id,
            entry.kind.as_str(),
            entry.delta,
            entry.occurred_on.to_string(),
            recorded_at,
            entry.note,
        ],
    )?;
    Ok(LedgerEntry {
        id,
        seq: conn.last_insert_rowid(),
        student_id: entry.student_id.clone(),
        academic_year_id: entry.academic_year_id.clone(),
        source_report_id: entry.source_report_id.clone(),
        reverses_entry_id: entry.reverses_entry_id.clone(),
        kind: entry.kind,
        delta: entry.delta,
        occurred_on: entry.occurred_on.to_string(),
        recorded_at,
        note: entry.note.clone(),
    })
}

pub fn entries_for(
    conn: &Connection,
    student_id: &str,
    academic_year_id: &str,
) -> EngineResult<Vec<LedgerEntry>> {
    let sql = format!(
        "SELECT {} FROM ledger_entries
         WHERE student_id = ? AND academic_year_id = ?
         ORDER BY seq",
        ENTRY_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([student_id, academic_year_id], entry_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn entry_for_report(conn: &Connection, report_id: &str) -> EngineResult<LedgerEntry> {
    let sql = format!(
        "SELECT {} FROM ledger_entries
         WHERE source_report_id = ? AND reverses_entry_id IS NULL
         ORDER BY seq LIMIT 1",
        ENTRY_COLUMNS
    );
    conn.query_row(&sql, [report_id], entry_from_row)
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => EngineError::not_found("ledger entry", report_id),
            other => other.into(),
        })
}

/// Running total for one student in one academic year.
pub fn year_totals(
    conn: &Connection,
    student_id: &str,
    academic_year_id: &str,
) -> EngineResult<PointTotals> {
    let entries = entries_for(conn, student_id, academic_year_id)?;
    fold_totals(&entries)
}
