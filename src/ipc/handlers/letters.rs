use crate::config;
use crate::dispatch::{self, OutboxTransport};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    get_optional_bool, get_optional_str, get_required_str, to_json, with_conn, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::letters::{self, DispatchEvent, DispatchStatus, LetterFilter};
use chrono::Utc;
use rusqlite::Connection;
use serde_json::{json, Value};

fn max_attempts(conn: &Connection) -> Result<u32, HandlerErr> {
    Ok(config::dispatch_config(conn)?.max_attempts)
}

fn letters_history(conn: &mut Connection, params: &Value) -> Result<Value, HandlerErr> {
    let status = match get_optional_str(params, "status")? {
        Some(s) => Some(
            DispatchStatus::parse(&s)
                .ok_or_else(|| HandlerErr::bad_params(format!("unknown status: {}", s)))?,
        ),
        None => None,
    };
    let filter = LetterFilter {
        student_id: get_optional_str(params, "studentId")?,
        academic_year_id: get_optional_str(params, "academicYearId")?,
        status,
    };
    let rows = letters::list(conn, &filter)?;
    Ok(json!({ "letters": to_json(&rows)? }))
}

fn letters_get(conn: &mut Connection, params: &Value) -> Result<Value, HandlerErr> {
    let letter_id = get_required_str(params, "letterId")?;
    let letter = letters::get(conn, &letter_id)?;
    let attempts = letters::attempts(conn, &letter_id)?;
    let max = max_attempts(conn)?;
    Ok(json!({
        "letter": to_json(&letter)?,
        "attempts": to_json(&attempts)?,
        "exhausted": letter.state().is_exhausted(max),
    }))
}

/// Outcome reported by a sender outside this process (mail gateway, print
/// station).
fn letters_record_delivery(conn: &mut Connection, params: &Value) -> Result<Value, HandlerErr> {
    let letter_id = get_required_str(params, "letterId")?;
    let delivered = get_optional_bool(params, "delivered")?
        .ok_or_else(|| HandlerErr::bad_params("missing delivered"))?;
    let (event, detail) = if delivered {
        (DispatchEvent::Delivered, get_optional_str(params, "receipt")?)
    } else {
        let error = get_optional_str(params, "error")?
            .unwrap_or_else(|| "delivery failed".to_string());
        (DispatchEvent::DeliveryFailed, Some(error))
    };
    let max = max_attempts(conn)?;
    let letter = letters::apply_event(conn, &letter_id, event, detail.as_deref(), max, Utc::now())?;
    Ok(json!({
        "letter": to_json(&letter)?,
        "exhausted": letter.state().is_exhausted(max),
    }))
}

fn letters_operator_queue(conn: &mut Connection, _params: &Value) -> Result<Value, HandlerErr> {
    let max = max_attempts(conn)?;
    let rows = letters::operator_queue(conn, max)?;
    Ok(json!({ "letters": to_json(&rows)?, "maxAttempts": max }))
}

fn letters_requeue(conn: &mut Connection, params: &Value) -> Result<Value, HandlerErr> {
    let letter_id = get_required_str(params, "letterId")?;
    let max = max_attempts(conn)?;
    let letter = letters::apply_event(conn, &letter_id, DispatchEvent::Requeue, None, max, Utc::now())?;
    to_json(&letter)
}

fn letters_mark_sent(conn: &mut Connection, params: &Value) -> Result<Value, HandlerErr> {
    let letter_id = get_required_str(params, "letterId")?;
    let note = get_optional_str(params, "note")?;
    let max = max_attempts(conn)?;
    let letter = letters::apply_event(
        conn,
        &letter_id,
        DispatchEvent::ManualSend,
        note.as_deref(),
        max,
        Utc::now(),
    )?;
    to_json(&letter)
}

fn handle_letters_dispatch(state: &mut AppState, req: &Request) -> serde_json::Value {
    let (Some(conn), Some(workspace)) = (state.db.as_ref(), state.workspace.as_ref()) else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let result = (|| -> Result<Value, HandlerErr> {
        let cfg = config::dispatch_config(conn)?;
        let mut transport = OutboxTransport::for_workspace(workspace, &cfg);
        let summary = dispatch::run(conn, &mut transport, cfg.max_attempts)?;
        tracing::info!(
            attempted = summary.attempted,
            sent = summary.sent,
            failed = summary.failed,
            skipped = summary.skipped,
            "dispatch run finished"
        );
        to_json(&summary)
    })();
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "letters.history" => Some(with_conn(state, req, letters_history)),
        "letters.get" => Some(with_conn(state, req, letters_get)),
        "letters.dispatch" => Some(handle_letters_dispatch(state, req)),
        "letters.recordDelivery" => Some(with_conn(state, req, letters_record_delivery)),
        "letters.operatorQueue" => Some(with_conn(state, req, letters_operator_queue)),
        "letters.requeue" => Some(with_conn(state, req, letters_requeue)),
        "letters.markSent" => Some(with_conn(state, req, letters_mark_sent)),
        _ => None,
    }
}
