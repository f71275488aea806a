use crate::error::{map_unique, EngineError};
use crate::ipc::helpers::{
    get_optional_bool, get_optional_i64, get_optional_str, get_required_i64, get_required_str,
    with_conn, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::ledger::{EntryKind, MAX_ENTRY_POINTS};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

fn parse_item_kind(raw: &str) -> Result<EntryKind, HandlerErr> {
    match EntryKind::parse(raw) {
        Some(k @ (EntryKind::Violation | EntryKind::Achievement)) => Ok(k),
        _ => Err(HandlerErr::bad_params(
            "kind must be one of: violation, achievement",
        )),
    }
}

fn item_json(conn: &Connection, item_id: &str) -> Result<Value, HandlerErr> {
    conn.query_row(
        "SELECT id, kind, name, category, points, archived FROM catalog_items WHERE id = ?",
        [item_id],
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "kind": r.get::<_, String>(1)?,
                "name": r.get::<_, String>(2)?,
                "category": r.get::<_, String>(3)?,
                "points": r.get::<_, i64>(4)?,
                "archived": r.get::<_, i64>(5)? != 0,
            }))
        },
    )
    .optional()?
    .ok_or_else(|| EngineError::not_found("catalog item", item_id).into())
}

fn catalog_list(conn: &mut Connection, params: &Value) -> Result<Value, HandlerErr> {
    let kind = match get_optional_str(params, "kind")? {
        Some(k) => Some(parse_item_kind(&k)?.as_str()),
        None => None,
    };
    let include_archived = get_optional_bool(params, "includeArchived")?.unwrap_or(false);

    let mut stmt = conn.prepare(
        "SELECT id, kind, name, category, points, archived
         FROM catalog_items
         WHERE (? IS NULL OR kind = ?) AND (? = 1 OR archived = 0)
         ORDER BY kind, category, name",
    )?;
    let items = stmt
        .query_map(rusqlite::params![kind, kind, include_archived as i64], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "kind": r.get::<_, String>(1)?,
                "name": r.get::<_, String>(2)?,
                "category": r.get::<_, String>(3)?,
                "points": r.get::<_, i64>(4)?,
                "archived": r.get::<_, i64>(5)? != 0,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "items": items }))
}

fn validate_points(points: i64) -> Result<i64, HandlerErr> {
    if !(1..=MAX_ENTRY_POINTS).contains(&points) {
        return Err(HandlerErr::bad_params(format!(
            "points must be in 1..={}",
            MAX_ENTRY_POINTS
        )));
    }
    Ok(points)
}

fn catalog_create(conn: &mut Connection, params: &Value) -> Result<Value, HandlerErr> {
    let kind = parse_item_kind(&get_required_str(params, "kind")?)?;
    let name = get_required_str(params, "name")?.trim().to_string();
    if name.is_empty() {
        return Err(HandlerErr::bad_params("name must not be empty"));
    }
    let category = get_optional_str(params, "category")?
        .map(|s| s.trim().to_string())
        .unwrap_or_default();
    let points = validate_points(get_required_i64(params, "points")?)?;

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO catalog_items(id, kind, name, category, points, archived)
         VALUES(?, ?, ?, ?, ?, 0)",
        (&id, kind.as_str(), &name, &category, points),
    )
    .map_err(|e| map_unique(e, "catalog item with this name"))?;
    item_json(conn, &id)
}

fn catalog_update(conn: &mut Connection, params: &Value) -> Result<Value, HandlerErr> {
    let item_id = get_required_str(params, "itemId")?;
    let current = item_json(conn, &item_id)?;

    let name = match get_optional_str(params, "name")? {
        Some(v) if v.trim().is_empty() => {
            return Err(HandlerErr::bad_params("name must not be empty"))
        }
        Some(v) => v.trim().to_string(),
        None => current["name"].as_str().unwrap_or_default().to_string(),
    };
    let category = match get_optional_str(params, "category")? {
        Some(v) => v.trim().to_string(),
        None => current["category"].as_str().unwrap_or_default().to_string(),
    };
    let points = match get_optional_i64(params, "points")? {
        Some(p) => validate_points(p)?,
        None => current["points"].as_i64().unwrap_or(1),
    };
    let archived = get_optional_bool(params, "archived")?
        .unwrap_or_else(|| current["archived"].as_bool().unwrap_or(false));

    // Existing reports keep the name and points they were filed with.
    conn.execute(
        "UPDATE catalog_items SET name = ?, category = ?, points = ?, archived = ? WHERE id = ?",
        rusqlite::params![name, category, points, archived as i64, item_id],
    )
    .map_err(|e| map_unique(e, "catalog item with this name"))?;
    item_json(conn, &item_id)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "catalog.list" => Some(with_conn(state, req, catalog_list)),
        "catalog.create" => Some(with_conn(state, req, catalog_create)),
        "catalog.update" => Some(with_conn(state, req, catalog_update)),
        _ => None,
    }
}
