use crate::export;
use crate::ipc::helpers::{get_optional_str, to_json, with_conn, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::years;
use rusqlite::Connection;
use serde_json::{json, Value};
use std::path::PathBuf;

fn exports_point_summary(conn: &mut Connection, params: &Value) -> Result<Value, HandlerErr> {
    let year_id = get_optional_str(params, "academicYearId")?;
    let class_name = get_optional_str(params, "className")?;
    let out_path = get_optional_str(params, "outPath")?;

    let year = years::resolve(conn, year_id.as_deref())?;
    let rows = export::point_summary(conn, &year.id, class_name.as_deref())?;

    if let Some(p) = out_path.as_deref() {
        let path = PathBuf::from(p);
        export::write_csv(&rows, &path).map_err(|e| HandlerErr {
            code: "export_failed",
            message: format!("{:#}", e),
            details: Some(json!({ "outPath": p })),
        })?;
        tracing::info!(rows = rows.len(), path = %p, "point summary exported");
    }

    Ok(json!({
        "academicYear": to_json(&year)?,
        "rows": to_json(&rows)?,
        "outPath": out_path,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "exports.pointSummary" => Some(with_conn(state, req, exports_point_summary)),
        _ => None,
    }
}
