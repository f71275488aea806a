//! Threshold escalation: turns ledger appends into warning letters.
//!
//! Rules are measured against the student's deficit (the negated running
//! total for the academic year). A rule fires on the append that moves the
//! deficit from below its threshold to at-or-above it, and at most once per
//! student, academic year and letter kind.

use crate::error::{EngineError, EngineResult};
use crate::ledger::{self, LedgerEntry, NewEntry};
use crate::letters::{self, WarningLetter};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationRule {
    pub id: String,
    pub letter_kind: String,
    pub level: i64,
    pub threshold: i64,
    pub template: String,
    pub active: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<EscalationRule>,
}

impl RuleSet {
    /// Keeps active rules only, ordered by level.
    pub fn new(rules: Vec<EscalationRule>) -> Self {
        let mut rules: Vec<EscalationRule> = rules.into_iter().filter(|r| r.active).collect();
        rules.sort_by_key(|r| (r.level, r.threshold));
        Self { rules }
    }

    /// Rules whose threshold lies in `(previous_deficit, current_deficit]`.
    pub fn crossed(&self, previous_deficit: i64, current_deficit: i64) -> Vec<&EscalationRule> {
        self.rules
            .iter()
            .filter(|r| previous_deficit < r.threshold && r.threshold <= current_deficit)
            .collect()
    }
}

/// Checks that a proposed rule table is a proper escalation ladder.
pub fn validate_rules(rules: &[EscalationRule]) -> EngineResult<()> {
    let mut active: Vec<&EscalationRule> = rules.iter().filter(|r| r.active).collect();
    for r in &active {
        if r.letter_kind.trim().is_empty() {
            return Err(EngineError::invalid("letterKind must not be empty"));
        }
        if r.level < 1 {
            return Err(EngineError::invalid("level must be >= 1"));
        }
        if r.threshold < 1 {
            return Err(EngineError::invalid("threshold must be >= 1"));
        }
    }
    active.sort_by_key(|r| r.level);
    for pair in active.windows(2) {
        let (lo, hi) = (pair[0], pair[1]);
        if lo.level == hi.level {
            return Err(EngineError::invalid(format!(
                "{} and {} share level {}",
                lo.letter_kind, hi.letter_kind, lo.level
            )));
        }
        if hi.threshold <= lo.threshold {
            return Err(EngineError::invalid(format!(
                "{} (level {}) must have a higher threshold than {} (level {})",
                hi.letter_kind, hi.level, lo.letter_kind, lo.level
            )));
        }
    }
    Ok(())
}

fn rule_from_row(r: &Row<'_>) -> rusqlite::Result<EscalationRule> {
    Ok(EscalationRule {
        id: r.get(0)?,
        letter_kind: r.get(1)?,
        level: r.get(2)?,
        threshold: r.get(3)?,
        template: r.get(4)?,
        active: r.get::<_, i64>(5)? != 0,
    })
}

pub fn list_rules(conn: &Connection) -> EngineResult<Vec<EscalationRule>> {
    let mut stmt = conn.prepare(
        "SELECT id, letter_kind, level, threshold, template, active
         FROM escalation_rules
         ORDER BY level, letter_kind",
    )?;
    let rows = stmt
        .query_map([], rule_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_rule(conn: &Connection, id: &str) -> EngineResult<EscalationRule> {
    conn.query_row(
        "SELECT id, letter_kind, level, threshold, template, active
         FROM escalation_rules WHERE id = ?",
        [id],
        rule_from_row,
    )
    .optional()?
    .ok_or_else(|| EngineError::not_found("escalation rule", id))
}

pub fn load_rule_set(conn: &Connection) -> EngineResult<RuleSet> {
    Ok(RuleSet::new(list_rules(conn)?))
}

#[derive(Debug, Clone, Default)]
pub struct RulePatch {
    pub letter_kind: Option<String>,
    pub level: Option<i64>,
    pub threshold: Option<i64>,
    pub template: Option<String>,
    pub active: Option<bool>,
}

pub fn create_rule(
    conn: &Connection,
    letter_kind: &str,
    level: i64,
    threshold: i64,
    template: &str,
) -> EngineResult<EscalationRule> {
    let rule = EscalationRule {
        id: Uuid::new_v4().to_string(),
        letter_kind: letter_kind.trim().to_string(),
        level,
        threshold,
        template: template.to_string(),
        active: true,
    };
    let mut proposed = list_rules(conn)?;
    proposed.push(rule.clone());
    validate_rules(&proposed)?;

    conn.execute(
        "INSERT INTO escalation_rules(id, letter_kind, level, threshold, template, active)
         VALUES(?, ?, ?, ?, ?, 1)",
        (&rule.id, &rule.letter_kind, rule.level, rule.threshold, &rule.template),
    )
    .map_err(|e| crate::error::map_unique(e, "letter kind"))?;
    Ok(rule)
}

pub fn update_rule(conn: &Connection, id: &str, patch: RulePatch) -> EngineResult<EscalationRule> {
    let mut rule = get_rule(conn, id)?;
    if let Some(v) = patch.letter_kind {
        rule.letter_kind = v.trim().to_string();
    }
    if let Some(v) = patch.level {
        rule.level = v;
    }
    if let Some(v) = patch.threshold {
        rule.threshold = v;
    }
    if let Some(v) = patch.template {
        rule.template = v;
    }
    if let Some(v) = patch.active {
        rule.active = v;
    }

    let mut proposed: Vec<EscalationRule> = list_rules(conn)?
        .into_iter()
        .filter(|r| r.id != rule.id)
        .collect();
    proposed.push(rule.clone());
    validate_rules(&proposed)?;

    conn.execute(
        "UPDATE escalation_rules
         SET letter_kind = ?, level = ?, threshold = ?, template = ?, active = ?
         WHERE id = ?",
        rusqlite::params![
            rule.letter_kind,
            rule.level,
            rule.threshold,
            rule.template,
            rule.active as i64,
            rule.id
        ],
    )
    .map_err(|e| crate::error::map_unique(e, "letter kind"))?;
    Ok(rule)
}

fn already_issued(
    conn: &Connection,
    student_id: &str,
    academic_year_id: &str,
    letter_kind: &str,
) -> EngineResult<bool> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM warning_letters
             WHERE student_id = ? AND academic_year_id = ? AND letter_kind = ?",
            [student_id, academic_year_id, letter_kind],
            |r| r.get::<_, i64>(0),
        )
        .optional()?
        .is_some())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation {
    pub entry: LedgerEntry,
    pub previous_total: i64,
    pub total: i64,
    pub letters_issued: Vec<WarningLetter>,
}

/// Appends one ledger entry and issues every letter the append crosses.
///
/// Must run inside a write transaction (IMMEDIATE) so the previous total
/// read here cannot go stale before the append lands.
pub fn append_and_evaluate(
    conn: &Connection,
    entry: &NewEntry,
    now: DateTime<Utc>,
) -> EngineResult<Evaluation> {
    let previous = ledger::year_totals(conn, &entry.student_id, &entry.academic_year_id)?;
    let appended = ledger::append(conn, entry, now)?;
    let current = ledger::year_totals(conn, &entry.student_id, &entry.academic_year_id)?;

    let rules = load_rule_set(conn)?;
    let mut issued = Vec::new();
    for rule in rules.crossed(previous.deficit(), current.deficit()) {
        if already_issued(conn, &entry.student_id, &entry.academic_year_id, &rule.letter_kind)? {
            tracing::debug!(
                student_id = %entry.student_id,
                letter_kind = %rule.letter_kind,
                "threshold re-crossed; letter already issued this year"
            );
            continue;
        }
        let letter = letters::issue(conn, &appended, rule, current.total, now)?;
        tracing::info!(
            student_id = %entry.student_id,
            letter_id = %letter.id,
            letter_kind = %letter.letter_kind,
            total = current.total,
            "warning letter issued"
        );
        issued.push(letter);
    }

    Ok(Evaluation {
        entry: appended,
        previous_total: previous.total,
        total: current.total,
        letters_issued: issued,
    })
}
