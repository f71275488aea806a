//! Warning letters: generation-time rendering and the dispatch state machine.

use crate::backup::sha256_hex;
use crate::config;
use crate::error::{EngineError, EngineResult};
use crate::escalation::EscalationRule;
use crate::ledger::{now_rfc3339, LedgerEntry};
use crate::years;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Student data frozen into a letter when it is generated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentSnapshot {
    pub id: String,
    pub nisn: String,
    pub name: String,
    pub class_name: String,
    pub cohort: String,
}

pub fn student_snapshot(conn: &Connection, student_id: &str) -> EngineResult<StudentSnapshot> {
    conn.query_row(
        "SELECT id, nisn, name, class_name, cohort FROM students WHERE id = ?",
        [student_id],
        |r| {
            Ok(StudentSnapshot {
                id: r.get(0)?,
                nisn: r.get(1)?,
                name: r.get(2)?,
                class_name: r.get(3)?,
                cohort: r.get(4)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| EngineError::not_found("student", student_id))
}

pub struct LetterContext<'a> {
    pub student: &'a StudentSnapshot,
    pub total: i64,
    pub threshold: i64,
    pub letter_kind: &'a str,
    pub level: i64,
    pub academic_year: &'a str,
    pub issued_at: DateTime<Utc>,
    pub school_name: &'a str,
    pub signatory: &'a str,
}

impl LetterContext<'_> {
    fn lookup(&self, key: &str) -> Option<String> {
        let v = match key {
            "student_name" => self.student.name.clone(),
            "nisn" => self.student.nisn.clone(),
            "class_name" => self.student.class_name.clone(),
            "cohort" => self.student.cohort.clone(),
            "total_points" => self.total.to_string(),
            "deficit" => (-self.total).max(0).to_string(),
            "threshold" => self.threshold.to_string(),
            "letter_kind" => self.letter_kind.to_string(),
            "level" => self.level.to_string(),
            "academic_year" => self.academic_year.to_string(),
            "issued_on" => self.issued_at.date_naive().to_string(),
            "school_name" => self.school_name.to_string(),
            "signatory" => self.signatory.to_string(),
            _ => return None,
        };
        Some(v)
    }
}

/// Substitutes `{{placeholder}}` tokens. Unknown or unterminated tokens
/// are copied through unchanged.
pub fn render(template: &str, ctx: &LetterContext<'_>) -> String {
    let mut out = String::with_capacity(template.len() + 64);
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };
        let token = &after[..end];
        match ctx.lookup(token.trim()) {
            Some(v) => out.push_str(&v),
            None => {
                out.push_str("{{");
                out.push_str(token);
                out.push_str("}}");
            }
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    Pending,
    Sent,
    Failed,
}

impl DispatchStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "sent" => Some(Self::Sent),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchEvent {
    Delivered,
    DeliveryFailed,
    /// Operator puts an exhausted or failed letter back in the queue.
    Requeue,
    /// Operator confirms the letter was handed over outside the transport.
    ManualSend,
}

impl DispatchEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::DeliveryFailed => "delivery_failed",
            Self::Requeue => "requeue",
            Self::ManualSend => "manual_send",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchState {
    pub status: DispatchStatus,
    pub attempts: u32,
}

impl DispatchState {
    pub fn is_exhausted(&self, max_attempts: u32) -> bool {
        self.status == DispatchStatus::Failed && self.attempts >= max_attempts
    }

    pub fn is_due(&self, max_attempts: u32) -> bool {
        match self.status {
            DispatchStatus::Pending => true,
            DispatchStatus::Failed => self.attempts < max_attempts,
            DispatchStatus::Sent => false,
        }
    }

    pub fn next(self, event: DispatchEvent, max_attempts: u32) -> EngineResult<DispatchState> {
        use DispatchEvent::*;
        use DispatchStatus::*;

        let invalid = || EngineError::InvalidTransition {
            status: if self.is_exhausted(max_attempts) {
                "exhausted"
            } else {
                self.status.as_str()
            },
            event: event.as_str(),
        };

        match (self.status, event) {
            (Sent, _) => Err(invalid()),
            (Pending, Delivered) => Ok(DispatchState {
                status: Sent,
                attempts: self.attempts + 1,
            }),
            (Pending, DeliveryFailed) => Ok(DispatchState {
                status: Failed,
                attempts: self.attempts + 1,
            }),
            (Failed, Delivered) if !self.is_exhausted(max_attempts) => Ok(DispatchState {
                status: Sent,
                attempts: self.attempts + 1,
            }),
            (Failed, DeliveryFailed) if !self.is_exhausted(max_attempts) => Ok(DispatchState {
                status: Failed,
                attempts: self.attempts + 1,
            }),
            (Failed, Requeue) => Ok(DispatchState {
                status: Pending,
                attempts: 0,
            }),
            (Pending | Failed, ManualSend) => Ok(DispatchState {
                status: Sent,
                attempts: self.attempts,
            }),
            _ => Err(invalid()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WarningLetter {
    pub id: String,
    pub student_id: String,
    pub academic_year_id: String,
    pub rule_id: String,
    pub letter_kind: String,
    pub level: i64,
    pub threshold: i64,
    pub total_at_issue: i64,
    pub trigger_entry_id: String,
    pub body: String,
    pub content_digest: String,
    pub snapshot: StudentSnapshot,
    pub issued_at: String,
    pub status: DispatchStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub sent_at: Option<String>,
    pub receipt: Option<String>,
}

impl WarningLetter {
    pub fn state(&self) -> DispatchState {
        DispatchState {
            status: self.status,
            attempts: self.attempts,
        }
    }
}

const LETTER_COLUMNS: &str = "id, student_id, academic_year_id, rule_id, letter_kind, level,
    threshold, total_at_issue, trigger_entry_id, body, content_digest, snapshot_json,
    issued_at, status, attempts, last_error, sent_at, receipt";

fn letter_from_row(r: &Row<'_>) -> rusqlite::Result<WarningLetter> {
    let snapshot_json: String = r.get(11)?;
    let snapshot: StudentSnapshot = serde_json::from_str(&snapshot_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(11, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let status: String = r.get(13)?;
    let status = DispatchStatus::parse(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            13,
            rusqlite::types::Type::Text,
            format!("unknown letter status {}", status).into(),
        )
    })?;
    Ok(WarningLetter {
        id: r.get(0)?,
        student_id: r.get(1)?,
        academic_year_id: r.get(2)?,
        rule_id: r.get(3)?,
        letter_kind: r.get(4)?,
        level: r.get(5)?,
        threshold: r.get(6)?,
        total_at_issue: r.get(7)?,
        trigger_entry_id: r.get(8)?,
        body: r.get(9)?,
        content_digest: r.get(10)?,
        snapshot,
        issued_at: r.get(12)?,
        status,
        attempts: r.get::<_, i64>(14)?.max(0) as u32,
        last_error: r.get(15)?,
        sent_at: r.get(16)?,
        receipt: r.get(17)?,
    })
}

/// Renders and stores a new pending letter. Called from escalation inside
/// the append transaction.
pub fn issue(
    conn: &Connection,
    trigger: &LedgerEntry,
    rule: &EscalationRule,
    total: i64,
    now: DateTime<Utc>,
) -> EngineResult<WarningLetter> {
    let student = student_snapshot(conn, &trigger.student_id)?;
    let year = years::get(conn, &trigger.academic_year_id)?;
    let cfg = config::letter_config(conn)?;
    let template = if rule.template.trim().is_empty() {
        cfg.default_template.as_str()
    } else {
        rule.template.as_str()
    };

    let body = render(
        template,
        &LetterContext {
            student: &student,
            total,
            threshold: rule.threshold,
            letter_kind: &rule.letter_kind,
            level: rule.level,
            academic_year: &year.label,
            issued_at: now,
            school_name: &cfg.school_name,
            signatory: &cfg.signatory,
        },
    );

    let id = Uuid::new_v4().to_string();
    let digest = sha256_hex(body.as_bytes());
    let snapshot_json = serde_json::to_string(&student).map_err(anyhow::Error::from)?;
    conn.execute(
        "INSERT INTO warning_letters(
            id, student_id, academic_year_id, rule_id, letter_kind, level, threshold,
            total_at_issue, trigger_entry_id, body, content_digest, snapshot_json,
            issued_at, status, attempts
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', 0)",
        rusqlite::params![
            id,
            trigger.student_id,
            trigger.academic_year_id,
            rule.id,
            rule.letter_kind,
            rule.level,
            rule.threshold,
            total,
            trigger.id,
            body,
            digest,
            snapshot_json,
            now_rfc3339(now),
        ],
    )
    .map_err(|e| crate::error::map_unique(e, "warning letter for this student and year"))?;
    get(conn, &id)
}

pub fn get(conn: &Connection, id: &str) -> EngineResult<WarningLetter> {
    let sql = format!("SELECT {} FROM warning_letters WHERE id = ?", LETTER_COLUMNS);
    conn.query_row(&sql, [id], letter_from_row)
        .optional()?
        .ok_or_else(|| EngineError::not_found("warning letter", id))
}

#[derive(Debug, Clone, Default)]
pub struct LetterFilter {
    pub student_id: Option<String>,
    pub academic_year_id: Option<String>,
    pub status: Option<DispatchStatus>,
}

pub fn list(conn: &Connection, filter: &LetterFilter) -> EngineResult<Vec<WarningLetter>> {
    let mut sql = format!("SELECT {} FROM warning_letters WHERE 1 = 1", LETTER_COLUMNS);
    let mut binds: Vec<String> = Vec::new();
    if let Some(v) = &filter.student_id {
        sql.push_str(" AND student_id = ?");
        binds.push(v.clone());
    }
    if let Some(v) = &filter.academic_year_id {
        sql.push_str(" AND academic_year_id = ?");
        binds.push(v.clone());
    }
    if let Some(v) = filter.status {
        sql.push_str(" AND status = ?");
        binds.push(v.as_str().to_string());
    }
    sql.push_str(" ORDER BY issued_at, level");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(binds.iter()), letter_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Letters the dispatcher should try now, oldest first.
pub fn due(conn: &Connection, max_attempts: u32) -> EngineResult<Vec<WarningLetter>> {
    let sql = format!(
        "SELECT {} FROM warning_letters
         WHERE status <> 'sent'
         ORDER BY issued_at, level",
        LETTER_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], letter_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows
        .into_iter()
        .filter(|l| l.state().is_due(max_attempts))
        .collect())
}

/// How long a dispatcher may hold a letter before another one can take it.
const CLAIM_LEASE_SECS: i64 = 300;

/// Re-reads `letter_id` under the write lock and reserves it for one
/// delivery attempt. Returns `None` when the letter is no longer due or
/// another dispatcher holds an unexpired claim on it.
pub fn claim_due(
    conn: &Connection,
    letter_id: &str,
    max_attempts: u32,
    now: DateTime<Utc>,
) -> EngineResult<Option<WarningLetter>> {
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let letter = get(&tx, letter_id)?;
    if !letter.state().is_due(max_attempts) {
        return Ok(None);
    }
    let stamp = now_rfc3339(now);
    let until = now_rfc3339(now + chrono::Duration::seconds(CLAIM_LEASE_SECS));
    let claimed = tx.execute(
        "UPDATE warning_letters SET claimed_until = ?
         WHERE id = ? AND status <> 'sent'
           AND (claimed_until IS NULL OR claimed_until <= ?)",
        (&until, letter_id, &stamp),
    )?;
    if claimed == 0 {
        return Ok(None);
    }
    tx.commit()?;
    Ok(Some(letter))
}

/// Failed letters that used up their retries and need a person.
pub fn operator_queue(conn: &Connection, max_attempts: u32) -> EngineResult<Vec<WarningLetter>> {
    let sql = format!(
        "SELECT {} FROM warning_letters
         WHERE status = 'failed' AND attempts >= ?
         ORDER BY issued_at, level",
        LETTER_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([max_attempts as i64], letter_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LetterAttempt {
    pub attempted_at: String,
    pub event: String,
    pub status_after: String,
    pub detail: Option<String>,
}

pub fn attempts(conn: &Connection, letter_id: &str) -> EngineResult<Vec<LetterAttempt>> {
    let mut stmt = conn.prepare(
        "SELECT attempted_at, event, status_after, detail
         FROM letter_attempts WHERE letter_id = ? ORDER BY id",
    )?;
    let rows = stmt
        .query_map([letter_id], |r| {
            Ok(LetterAttempt {
                attempted_at: r.get(0)?,
                event: r.get(1)?,
                status_after: r.get(2)?,
                detail: r.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Applies one state-machine event and appends it to the attempt history.
/// `detail` is the error text for failures and the receipt or operator
/// note otherwise.
pub fn apply_event(
    conn: &Connection,
    letter_id: &str,
    event: DispatchEvent,
    detail: Option<&str>,
    max_attempts: u32,
    now: DateTime<Utc>,
) -> EngineResult<WarningLetter> {
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let letter = get(&tx, letter_id)?;
    let next = letter.state().next(event, max_attempts)?;
    let stamp = now_rfc3339(now);

    match event {
        DispatchEvent::Delivered | DispatchEvent::ManualSend => {
            tx.execute(
                "UPDATE warning_letters
                 SET status = ?, attempts = ?, sent_at = ?, receipt = ?, last_error = NULL,
                     claimed_until = NULL
                 WHERE id = ?",
                rusqlite::params![
                    next.status.as_str(),
                    next.attempts as i64,
                    stamp,
                    detail,
                    letter_id
                ],
            )?;
        }
        DispatchEvent::DeliveryFailed => {
            tx.execute(
                "UPDATE warning_letters
                 SET status = ?, attempts = ?, last_error = ?, claimed_until = NULL
                 WHERE id = ?",
                rusqlite::params![
                    next.status.as_str(),
                    next.attempts as i64,
                    detail,
                    letter_id
                ],
            )?;
        }
        DispatchEvent::Requeue => {
            tx.execute(
                "UPDATE warning_letters
                 SET status = ?, attempts = ?, claimed_until = NULL
                 WHERE id = ?",
                rusqlite::params![next.status.as_str(), next.attempts as i64, letter_id],
            )?;
        }
    }

    tx.execute(
        "INSERT INTO letter_attempts(letter_id, attempted_at, event, status_after, detail)
         VALUES(?, ?, ?, ?, ?)",
        rusqlite::params![letter_id, stamp, event.as_str(), next.status.as_str(), detail],
    )?;
    tx.commit()?;

    if next.is_exhausted(max_attempts) {
        tracing::warn!(
            letter_id,
            attempts = next.attempts,
            "letter delivery exhausted; moved to operator queue"
        );
    }
    get(conn, letter_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn snapshot() -> StudentSnapshot {
        StudentSnapshot {
            id: "stu-1".into(),
            nisn: "0051234567".into(),
            name: "Budi Santoso".into(),
            class_name: "XI IPA 2".into(),
            cohort: "2023".into(),
        }
    }

    fn ctx(student: &StudentSnapshot) -> LetterContext<'_> {
        LetterContext {
            student,
            total: -55,
            threshold: 50,
            letter_kind: "SP2",
            level: 2,
            academic_year: "2025/2026",
            issued_at: Utc.with_ymd_and_hms(2025, 10, 3, 8, 30, 0).unwrap(),
            school_name: "SMA Negeri 1",
            signatory: "Kepala Sekolah",
        }
    }

    #[test]
    fn render_substitutes_known_placeholders() {
        let s = snapshot();
        let out = render(
            "{{letter_kind}} untuk {{ student_name }} ({{nisn}}), {{class_name}}: {{deficit}}/{{threshold}} pada {{issued_on}}",
            &ctx(&s),
        );
        assert_eq!(
            out,
            "SP2 untuk Budi Santoso (0051234567), XI IPA 2: 55/50 pada 2025-10-03"
        );
    }

    #[test]
    fn render_keeps_unknown_and_unterminated_tokens() {
        let s = snapshot();
        assert_eq!(render("a {{nope}} b", &ctx(&s)), "a {{nope}} b");
        assert_eq!(render("tail {{nisn", &ctx(&s)), "tail {{nisn");
    }

    #[test]
    fn render_is_deterministic() {
        let s = snapshot();
        let a = render(config::DEFAULT_LETTER_TEMPLATE, &ctx(&s));
        let b = render(config::DEFAULT_LETTER_TEMPLATE, &ctx(&s));
        assert_eq!(a, b);
        assert_eq!(sha256_hex(a.as_bytes()), sha256_hex(b.as_bytes()));
        assert_eq!(sha256_hex(a.as_bytes()).len(), 64);
    }

    #[test]
    fn pending_letter_moves_to_sent_or_failed() {
        let pending = DispatchState {
            status: DispatchStatus::Pending,
            attempts: 0,
        };
        let sent = pending.next(DispatchEvent::Delivered, 3).expect("deliver");
        assert_eq!(sent.status, DispatchStatus::Sent);
        assert_eq!(sent.attempts, 1);
        let failed = pending.next(DispatchEvent::DeliveryFailed, 3).expect("fail");
        assert_eq!(failed.status, DispatchStatus::Failed);
        assert_eq!(failed.attempts, 1);
    }

    #[test]
    fn failed_letter_retries_until_exhausted() {
        let mut s = DispatchState {
            status: DispatchStatus::Pending,
            attempts: 0,
        };
        for _ in 0..3 {
            assert!(s.is_due(3));
            s = s.next(DispatchEvent::DeliveryFailed, 3).expect("fail");
        }
        assert!(s.is_exhausted(3));
        assert!(!s.is_due(3));
        let e = s.next(DispatchEvent::DeliveryFailed, 3).unwrap_err();
        assert_eq!(e.code(), "invalid_transition");
        assert!(s.next(DispatchEvent::Delivered, 3).is_err());

        let requeued = s.next(DispatchEvent::Requeue, 3).expect("requeue");
        assert_eq!(requeued.status, DispatchStatus::Pending);
        assert_eq!(requeued.attempts, 0);

        let manual = s.next(DispatchEvent::ManualSend, 3).expect("manual");
        assert_eq!(manual.status, DispatchStatus::Sent);
    }

    #[test]
    fn sent_is_terminal() {
        let sent = DispatchState {
            status: DispatchStatus::Sent,
            attempts: 1,
        };
        for ev in [
            DispatchEvent::Delivered,
            DispatchEvent::DeliveryFailed,
            DispatchEvent::Requeue,
            DispatchEvent::ManualSend,
        ] {
            assert!(sent.next(ev, 3).is_err());
        }
    }

    #[test]
    fn pending_cannot_be_requeued() {
        let pending = DispatchState {
            status: DispatchStatus::Pending,
            attempts: 0,
        };
        assert!(pending.next(DispatchEvent::Requeue, 3).is_err());
    }
}
