use crate::escalation::{self, RulePatch};
use crate::ipc::helpers::{
    get_optional_bool, get_optional_i64, get_optional_str, get_required_i64, get_required_str,
    to_json, with_conn, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::{json, Value};

fn rules_list(conn: &mut Connection, _params: &Value) -> Result<Value, HandlerErr> {
    let rules = escalation::list_rules(conn)?;
    Ok(json!({ "rules": to_json(&rules)? }))
}

fn rules_create(conn: &mut Connection, params: &Value) -> Result<Value, HandlerErr> {
    let letter_kind = get_required_str(params, "letterKind")?;
    let level = get_required_i64(params, "level")?;
    let threshold = get_required_i64(params, "threshold")?;
    let template = get_optional_str(params, "template")?.unwrap_or_default();
    let rule = escalation::create_rule(conn, &letter_kind, level, threshold, &template)?;
    to_json(&rule)
}

fn rules_update(conn: &mut Connection, params: &Value) -> Result<Value, HandlerErr> {
    let rule_id = get_required_str(params, "ruleId")?;
    let patch = RulePatch {
        letter_kind: get_optional_str(params, "letterKind")?,
        level: get_optional_i64(params, "level")?,
        threshold: get_optional_i64(params, "threshold")?,
        template: get_optional_str(params, "template")?,
        active: get_optional_bool(params, "active")?,
    };
    let rule = escalation::update_rule(conn, &rule_id, patch)?;
    to_json(&rule)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "rules.list" => Some(with_conn(state, req, rules_list)),
        "rules.create" => Some(with_conn(state, req, rules_create)),
        "rules.update" => Some(with_conn(state, req, rules_update)),
        _ => None,
    }
}
