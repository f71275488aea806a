use crate::ipc::helpers::{get_required_str, get_string_list, to_json, with_conn, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::years::{self, ClassPromotion};
use rusqlite::Connection;
use serde_json::{json, Value};

fn years_list(conn: &mut Connection, _params: &Value) -> Result<Value, HandlerErr> {
    let list = years::list(conn)?;
    Ok(json!({ "academicYears": to_json(&list)? }))
}

fn years_create(conn: &mut Connection, params: &Value) -> Result<Value, HandlerErr> {
    let label = get_required_str(params, "label")?;
    let start = years::parse_date(&get_required_str(params, "startDate")?)?;
    let end = years::parse_date(&get_required_str(params, "endDate")?)?;
    let year = years::create(conn, &label, start, end)?;
    to_json(&year)
}

fn years_activate(conn: &mut Connection, params: &Value) -> Result<Value, HandlerErr> {
    let id = get_required_str(params, "academicYearId")?;
    let year = years::activate(conn, &id)?;
    to_json(&year)
}

fn parse_promotions(params: &Value) -> Result<Vec<ClassPromotion>, HandlerErr> {
    let Some(raw) = params.get("promotions") else {
        return Ok(Vec::new());
    };
    let Some(items) = raw.as_array() else {
        return Err(HandlerErr::bad_params("promotions must be an array"));
    };
    items
        .iter()
        .enumerate()
        .map(|(i, p)| {
            let from_class = get_required_str(p, "fromClass")
                .map_err(|_| HandlerErr::bad_params(format!("promotions[{}].fromClass missing", i)))?;
            let to_class = get_required_str(p, "toClass")
                .map_err(|_| HandlerErr::bad_params(format!("promotions[{}].toClass missing", i)))?;
            Ok(ClassPromotion {
                from_class,
                to_class,
            })
        })
        .collect()
}

fn years_transition(conn: &mut Connection, params: &Value) -> Result<Value, HandlerErr> {
    let to_year = get_required_str(params, "toAcademicYearId")?;
    let promotions = parse_promotions(params)?;
    let graduate = get_string_list(params, "graduateClasses")?;
    let summary = years::transition(conn, &to_year, &promotions, &graduate)?;
    to_json(&summary)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "academicYears.list" => Some(with_conn(state, req, years_list)),
        "academicYears.create" => Some(with_conn(state, req, years_create)),
        "academicYears.activate" => Some(with_conn(state, req, years_activate)),
        "academicYears.transition" => Some(with_conn(state, req, years_transition)),
        _ => None,
    }
}
