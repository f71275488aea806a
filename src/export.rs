use crate::error::EngineResult;
use crate::ledger::{fold_totals, EntryKind, LedgerEntry};
use anyhow::Context;
use rusqlite::Connection;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PointSummaryRow {
    pub student_id: String,
    pub nisn: String,
    pub name: String,
    pub class_name: String,
    pub cohort: String,
    pub violation_points: i64,
    pub achievement_points: i64,
    pub adjustment_points: i64,
    pub total: i64,
    pub letters_issued: i64,
}

/// One row per student for the academic year: every active student plus
/// inactive ones that still have entries in that year.
pub fn point_summary(
    conn: &Connection,
    academic_year_id: &str,
    class_name: Option<&str>,
) -> EngineResult<Vec<PointSummaryRow>> {
    let mut by_student: HashMap<String, Vec<LedgerEntry>> = HashMap::new();
    {
        let mut stmt = conn.prepare(
            "SELECT student_id, kind, delta FROM ledger_entries
             WHERE academic_year_id = ? ORDER BY seq",
        )?;
        let rows = stmt.query_map([academic_year_id], |r| {
            let kind: String = r.get(1)?;
            Ok(LedgerEntry {
                id: String::new(),
                seq: 0,
                student_id: r.get(0)?,
                academic_year_id: academic_year_id.to_string(),
                source_report_id: None,
                reverses_entry_id: None,
                kind: EntryKind::parse(&kind).unwrap_or(EntryKind::Adjustment),
                delta: r.get(2)?,
                occurred_on: String::new(),
                recorded_at: String::new(),
                note: None,
            })
        })?;
        for row in rows {
            let e = row?;
            by_student.entry(e.student_id.clone()).or_default().push(e);
        }
    }

    let mut letter_counts: HashMap<String, i64> = HashMap::new();
    {
        let mut stmt = conn.prepare(
            "SELECT student_id, COUNT(*) FROM warning_letters
             WHERE academic_year_id = ? GROUP BY student_id",
        )?;
        let rows = stmt.query_map([academic_year_id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (sid, n) = row?;
            letter_counts.insert(sid, n);
        }
    }

    let mut stmt = conn.prepare(
        "SELECT id, nisn, name, class_name, cohort, active FROM students
         WHERE (? IS NULL OR class_name = ?)",
    )?;
    let students = stmt
        .query_map([class_name, class_name], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, i64>(5)? != 0,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut out = Vec::new();
    for (id, nisn, name, class_name, cohort, active) in students {
        let entries = by_student.get(&id);
        if !active && entries.is_none() {
            continue;
        }
        let totals = match entries {
            Some(e) => fold_totals(e)?,
            None => Default::default(),
        };
        out.push(PointSummaryRow {
            letters_issued: letter_counts.get(&id).copied().unwrap_or(0),
            student_id: id,
            nisn,
            name,
            class_name,
            cohort,
            violation_points: totals.violation_points,
            achievement_points: totals.achievement_points,
            adjustment_points: totals.adjustment_points,
            total: totals.total,
        });
    }
    out.sort_by(|a, b| a.total.cmp(&b.total).then_with(|| a.name.cmp(&b.name)));
    Ok(out)
}

pub fn write_csv(rows: &[PointSummaryRow], out_path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = out_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create directory {}", parent.to_string_lossy())
            })?;
        }
    }
    let mut writer = csv::Writer::from_path(out_path)
        .with_context(|| format!("failed to create {}", out_path.to_string_lossy()))?;
    writer.write_record([
        "nisn",
        "name",
        "class_name",
        "cohort",
        "violation_points",
        "achievement_points",
        "adjustment_points",
        "total",
        "letters_issued",
    ])?;
    for r in rows {
        writer.write_record([
            r.nisn.clone(),
            r.name.clone(),
            r.class_name.clone(),
            r.cohort.clone(),
            r.violation_points.to_string(),
            r.achievement_points.to_string(),
            r.adjustment_points.to_string(),
            r.total.to_string(),
            r.letters_issued.to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}
