use chrono::NaiveDate;
use thiserror::Error;

/// Failures raised by the ledger, escalation and dispatch code.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("{0}")]
    Invalid(String),

    #[error("no academic year covers {0}")]
    NoAcademicYear(NaiveDate),

    #[error("cannot apply {event} to a {status} letter")]
    InvalidTransition {
        status: &'static str,
        event: &'static str,
    },

    #[error("report {0} is already void")]
    AlreadyVoid(String),

    #[error("{0}")]
    Duplicate(String),

    #[error(transparent)]
    Db(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }

    /// Stable code used in the IPC error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::Invalid(_) => "bad_params",
            Self::NoAcademicYear(_) => "no_academic_year",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::AlreadyVoid(_) => "already_void",
            Self::Duplicate(_) => "duplicate",
            Self::Db(_) => "db_failed",
            Self::Io(_) => "io_failed",
            Self::Other(_) => "internal",
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Maps SQLite UNIQUE violations to `Duplicate` so callers can report them cleanly.
pub fn map_unique(e: rusqlite::Error, what: &str) -> EngineError {
    match &e {
        rusqlite::Error::SqliteFailure(f, _)
            if f.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
        {
            EngineError::Duplicate(format!("{} already exists", what))
        }
        _ => EngineError::Db(e),
    }
}
