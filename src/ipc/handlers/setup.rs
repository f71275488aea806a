use crate::config::{self, DispatchConfig, LetterConfig};
use crate::db;
use crate::ipc::helpers::{get_required_str, to_json, with_conn, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::{json, Map, Value};

#[derive(Clone, Copy)]
enum SetupSection {
    Dispatch,
    Letters,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "dispatch" => Some(Self::Dispatch),
            "letters" => Some(Self::Letters),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Dispatch => config::DISPATCH_KEY,
            Self::Letters => config::LETTERS_KEY,
        }
    }
}

fn current_section(conn: &Connection, section: SetupSection) -> Result<Value, HandlerErr> {
    match section {
        SetupSection::Dispatch => to_json(&config::dispatch_config(conn)?),
        SetupSection::Letters => to_json(&config::letter_config(conn)?),
    }
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    if s.len() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

fn parse_nullable_string_max(v: &Value, key: &str, max_len: usize) -> Result<Value, String> {
    if v.is_null() {
        return Ok(Value::Null);
    }
    let s = parse_string_max(v, key, max_len)?;
    let s = s.trim();
    if s.is_empty() {
        return Ok(Value::Null);
    }
    Ok(Value::String(s.to_string()))
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = current
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())?;
    for (k, v) in patch {
        match section {
            SetupSection::Dispatch => match k.as_str() {
                "maxAttempts" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 10)?));
                }
                "outboxDir" => {
                    obj.insert(k.clone(), parse_nullable_string_max(v, k, 1024)?);
                }
                _ => return Err(format!("unknown dispatch field: {}", k)),
            },
            SetupSection::Letters => match k.as_str() {
                "schoolName" | "signatory" => {
                    obj.insert(
                        k.clone(),
                        Value::String(parse_string_max(v, k, 200)?.trim().to_string()),
                    );
                }
                "defaultTemplate" => {
                    let t = parse_string_max(v, k, 20_000)?;
                    if t.trim().is_empty() {
                        return Err("defaultTemplate must not be empty".into());
                    }
                    obj.insert(k.clone(), Value::String(t));
                }
                _ => return Err(format!("unknown letters field: {}", k)),
            },
        }
    }
    Ok(())
}

fn parse_section(params: &Value) -> Result<SetupSection, HandlerErr> {
    let raw = get_required_str(params, "section")?;
    SetupSection::parse(&raw)
        .ok_or_else(|| HandlerErr::bad_params("section must be one of: dispatch, letters"))
}

fn setup_get(conn: &mut Connection, params: &Value) -> Result<Value, HandlerErr> {
    let section = parse_section(params)?;
    current_section(conn, section)
}

fn setup_update(conn: &mut Connection, params: &Value) -> Result<Value, HandlerErr> {
    let section = parse_section(params)?;
    let Some(patch) = params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("patch must be an object"));
    };

    let mut current = current_section(conn, section)?;
    merge_section_patch(section, &mut current, patch).map_err(HandlerErr::bad_params)?;

    // Round-trip through the typed config so stored values always load back.
    let stored = match section {
        SetupSection::Dispatch => to_json(
            &serde_json::from_value::<DispatchConfig>(current)
                .map_err(|e| HandlerErr::bad_params(e.to_string()))?,
        )?,
        SetupSection::Letters => to_json(
            &serde_json::from_value::<LetterConfig>(current)
                .map_err(|e| HandlerErr::bad_params(e.to_string()))?,
        )?,
    };
    db::settings_set_json(conn, section.key(), &stored)?;
    Ok(json!({ "ok": true, "section": stored }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(with_conn(state, req, setup_get)),
        "setup.update" => Some(with_conn(state, req, setup_update)),
        _ => None,
    }
}
