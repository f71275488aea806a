use crate::config::DispatchConfig;
use crate::error::{EngineError, EngineResult};
use crate::letters::{self, DispatchEvent, WarningLetter};
use anyhow::Context;
use chrono::Utc;
use rusqlite::Connection;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Delivers one rendered letter. Returns a receipt describing where it went.
pub trait LetterTransport {
    fn deliver(&mut self, letter: &WarningLetter) -> anyhow::Result<String>;
}

/// Writes each letter as a text file into a directory that a print or mail
/// job picks up.
pub struct OutboxTransport {
    dir: PathBuf,
}

impl OutboxTransport {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn for_workspace(workspace: &Path, cfg: &DispatchConfig) -> Self {
        match cfg.outbox_dir.as_deref().filter(|s| !s.trim().is_empty()) {
            Some(dir) => Self::new(dir),
            None => Self::new(workspace.join("outbox")),
        }
    }

    fn file_name(letter: &WarningLetter) -> String {
        let clean = |s: &str| -> String {
            s.chars()
                .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
                .collect()
        };
        format!(
            "{}-{}-{}.txt",
            clean(&letter.letter_kind),
            clean(&letter.snapshot.nisn),
            letter.id
        )
    }
}

impl LetterTransport for OutboxTransport {
    fn deliver(&mut self, letter: &WarningLetter) -> anyhow::Result<String> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create outbox {}", self.dir.to_string_lossy()))?;
        let path = self.dir.join(Self::file_name(letter));
        let tmp = path.with_extension("txt.partial");
        std::fs::write(&tmp, letter.body.as_bytes())
            .with_context(|| format!("failed to write {}", tmp.to_string_lossy()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("failed to move letter into {}", path.to_string_lossy()))?;
        Ok(path.to_string_lossy().to_string())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchSummary {
    pub attempted: usize,
    pub sent: usize,
    pub failed: usize,
    /// Letters that reached the retry limit during this run.
    pub exhausted: usize,
    /// Letters another dispatcher claimed or settled first.
    pub skipped: usize,
}

/// Records the outcome of one delivery. A letter that another dispatcher
/// already moved to a state that rejects `event` counts as skipped.
fn record(
    conn: &Connection,
    letter: &WarningLetter,
    event: DispatchEvent,
    detail: &str,
    max_attempts: u32,
) -> EngineResult<Option<WarningLetter>> {
    match letters::apply_event(conn, &letter.id, event, Some(detail), max_attempts, Utc::now()) {
        Ok(updated) => Ok(Some(updated)),
        Err(e @ EngineError::InvalidTransition { .. }) => {
            tracing::warn!(letter_id = %letter.id, error = %e, "letter settled elsewhere; skipping");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// One pass over every due letter. Each letter is claimed under the write
/// lock before delivery. Delivery failures are recorded on the letter, not
/// returned as errors.
pub fn run(
    conn: &Connection,
    transport: &mut dyn LetterTransport,
    max_attempts: u32,
) -> EngineResult<DispatchSummary> {
    let mut summary = DispatchSummary::default();
    for candidate in letters::due(conn, max_attempts)? {
        let Some(letter) = letters::claim_due(conn, &candidate.id, max_attempts, Utc::now())? else {
            tracing::debug!(letter_id = %candidate.id, "letter no longer due; skipping");
            summary.skipped += 1;
            continue;
        };
        summary.attempted += 1;
        match transport.deliver(&letter) {
            Ok(receipt) => {
                match record(conn, &letter, DispatchEvent::Delivered, &receipt, max_attempts)? {
                    Some(_) => summary.sent += 1,
                    None => summary.skipped += 1,
                }
            }
            Err(e) => {
                let message = format!("{:#}", e);
                tracing::warn!(letter_id = %letter.id, error = %message, "letter delivery failed");
                let Some(updated) =
                    record(conn, &letter, DispatchEvent::DeliveryFailed, &message, max_attempts)?
                else {
                    summary.skipped += 1;
                    continue;
                };
                summary.failed += 1;
                if updated.state().is_exhausted(max_attempts) {
                    summary.exhausted += 1;
                }
            }
        }
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::escalation;
    use crate::ledger::EntryKind;
    use crate::letters::DispatchStatus;
    use crate::reports::{self, ReportSource, SubmitReport};
    use crate::years;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(prefix: &str) -> PathBuf {
        let p = std::env::temp_dir().join(format!(
            "{}-{}",
            prefix,
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        std::fs::create_dir_all(&p).expect("create temp dir");
        p
    }

    /// Workspace with two students who each hold one pending SP1 letter.
    fn workspace_with_two_letters(prefix: &str) -> PathBuf {
        let ws = temp_dir(prefix);
        let mut conn = db::open_db(&ws).expect("open");
        let year = years::create(
            &conn,
            "2025/2026",
            years::parse_date("2025-07-14").expect("start"),
            years::parse_date("2026-06-30").expect("end"),
        )
        .expect("year");
        years::activate(&conn, &year.id).expect("activate");
        escalation::create_rule(&conn, "SP1", 1, 25, "").expect("rule");
        for (id, nisn, name) in [("s-1", "0091", "Rina Wati"), ("s-2", "0092", "Budi Santoso")] {
            conn.execute(
                "INSERT INTO students(id, nisn, name, class_name, cohort) VALUES(?, ?, ?, 'X-2', '2025')",
                (id, nisn, name),
            )
            .expect("student");
            reports::submit(
                &mut conn,
                SubmitReport {
                    student_id: id.to_string(),
                    source: ReportSource::Manual {
                        kind: EntryKind::Violation,
                        points: 30,
                        item_name: "Bolos".into(),
                        category: None,
                    },
                    occurred_on: Some(years::parse_date("2025-09-01").expect("date")),
                    reporter: "Pak Guru".into(),
                    note: None,
                },
                Utc::now(),
            )
            .expect("submit");
        }
        ws
    }

    /// Settles the first letter it is handed through a second connection
    /// before reporting success, as a second sidecar would.
    struct RacingTransport {
        other: Connection,
        calls: Vec<String>,
    }

    impl LetterTransport for RacingTransport {
        fn deliver(&mut self, letter: &WarningLetter) -> anyhow::Result<String> {
            if self.calls.is_empty() {
                letters::apply_event(
                    &self.other,
                    &letter.id,
                    DispatchEvent::Delivered,
                    Some("other sidecar"),
                    3,
                    Utc::now(),
                )?;
            }
            self.calls.push(letter.id.clone());
            Ok(format!("receipt-{}", self.calls.len()))
        }
    }

    #[test]
    fn letter_settled_by_another_connection_does_not_stop_the_pass() {
        let ws = workspace_with_two_letters("conductd-dispatch-race");
        let conn = db::open_db(&ws).expect("open");
        let mut transport = RacingTransport {
            other: db::open_db(&ws).expect("open second"),
            calls: Vec::new(),
        };

        let summary = run(&conn, &mut transport, 3).expect("run");
        assert_eq!(transport.calls.len(), 2);
        assert_eq!(summary.attempted, 2);
        assert_eq!(summary.sent, 1);
        assert_eq!(summary.skipped, 1);

        let first = letters::get(&conn, &transport.calls[0]).expect("first");
        assert_eq!(first.status, DispatchStatus::Sent);
        assert_eq!(first.receipt.as_deref(), Some("other sidecar"));
        let second = letters::get(&conn, &transport.calls[1]).expect("second");
        assert_eq!(second.status, DispatchStatus::Sent);
        assert!(letters::due(&conn, 3).expect("due").is_empty());
    }

    #[test]
    fn claimed_letter_is_left_to_its_holder() {
        let ws = workspace_with_two_letters("conductd-dispatch-claim");
        let conn = db::open_db(&ws).expect("open");
        let other = db::open_db(&ws).expect("open second");
        let due = letters::due(&conn, 3).expect("due");
        assert_eq!(due.len(), 2);
        assert!(letters::claim_due(&other, &due[0].id, 3, Utc::now())
            .expect("claim")
            .is_some());

        let mut outbox = OutboxTransport::new(ws.join("outbox"));
        let summary = run(&conn, &mut outbox, 3).expect("run");
        assert_eq!(summary.attempted, 1);
        assert_eq!(summary.sent, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(
            letters::get(&conn, &due[0].id).expect("held").status,
            DispatchStatus::Pending
        );
        assert_eq!(
            letters::get(&conn, &due[1].id).expect("sent").status,
            DispatchStatus::Sent
        );
    }
}
