use crate::ipc::helpers::{
    get_optional_bool, get_optional_date, get_optional_i64, get_optional_str, get_required_i64,
    get_required_str, to_json, with_conn, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::ledger::EntryKind;
use crate::reports::{self, ReportFilter, ReportSource, SubmitReport};
use chrono::Utc;
use rusqlite::Connection;
use serde_json::{json, Value};

fn parse_source(params: &Value) -> Result<ReportSource, HandlerErr> {
    if let Some(item_id) = get_optional_str(params, "itemId")? {
        return Ok(ReportSource::Catalog { item_id });
    }
    let kind = match get_required_str(params, "kind")?.as_str() {
        "violation" => EntryKind::Violation,
        "achievement" => EntryKind::Achievement,
        _ => {
            return Err(HandlerErr::bad_params(
                "kind must be one of: violation, achievement",
            ))
        }
    };
    Ok(ReportSource::Manual {
        kind,
        points: get_required_i64(params, "points")?,
        item_name: get_required_str(params, "itemName")?,
        category: get_optional_str(params, "category")?,
    })
}

fn reports_submit(conn: &mut Connection, params: &Value) -> Result<Value, HandlerErr> {
    let input = SubmitReport {
        student_id: get_required_str(params, "studentId")?,
        source: parse_source(params)?,
        occurred_on: get_optional_date(params, "occurredOn")?,
        reporter: get_required_str(params, "reporter")?,
        note: get_optional_str(params, "note")?,
    };
    let outcome = reports::submit(conn, input, Utc::now())?;
    to_json(&outcome)
}

fn reports_adjust(conn: &mut Connection, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let delta = get_required_i64(params, "delta")?;
    let reason = get_required_str(params, "reason")?;
    let reporter = get_required_str(params, "reporter")?;
    let occurred_on = get_optional_date(params, "occurredOn")?;
    let outcome = reports::adjust(
        conn,
        &student_id,
        delta,
        &reason,
        &reporter,
        occurred_on,
        Utc::now(),
    )?;
    to_json(&outcome)
}

fn reports_void(conn: &mut Connection, params: &Value) -> Result<Value, HandlerErr> {
    let report_id = get_required_str(params, "reportId")?;
    let reason = get_required_str(params, "reason")?;
    let outcome = reports::void(conn, &report_id, &reason, Utc::now())?;
    to_json(&outcome)
}

fn reports_list(conn: &mut Connection, params: &Value) -> Result<Value, HandlerErr> {
    let kind = match get_optional_str(params, "kind")? {
        Some(k) => Some(
            EntryKind::parse(&k)
                .ok_or_else(|| HandlerErr::bad_params(format!("unknown kind: {}", k)))?,
        ),
        None => None,
    };
    let filter = ReportFilter {
        student_id: get_optional_str(params, "studentId")?,
        academic_year_id: get_optional_str(params, "academicYearId")?,
        kind,
        include_voided: get_optional_bool(params, "includeVoided")?.unwrap_or(false),
    };
    let mut rows = reports::list(conn, &filter)?;
    if let Some(limit) = get_optional_i64(params, "limit")? {
        rows.truncate(limit.max(0) as usize);
    }
    Ok(json!({ "reports": to_json(&rows)? }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.submit" => Some(with_conn(state, req, reports_submit)),
        "reports.adjust" => Some(with_conn(state, req, reports_adjust)),
        "reports.void" => Some(with_conn(state, req, reports_void)),
        "reports.list" => Some(with_conn(state, req, reports_list)),
        _ => None,
    }
}
