//! Typed error hierarchy for the lesson compiler.
//!
//! Two top-level enums cover the two failure domains:
//! - `CompileError`: run-level failures surfaced to callers
//! - `GenerationError`: generative-text failures, recovered at the stage boundary

use thiserror::Error;

/// Errors from the generative-text service.
///
/// Every variant is stage-fatal but run-non-fatal: the orchestrator converts
/// it into `failed(<message>)` for the stage that issued the call.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GenerationError {
    #[error("timeout")]
    Timeout,

    #[error("malformed output: {0}")]
    MalformedOutput(String),

    #[error("generator unavailable: {0}")]
    Unavailable(String),
}

/// Errors from compilation, retry and persistence.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("Objective {objective_id} not found")]
    ObjectiveNotFound { objective_id: String },

    #[error("Lesson {lesson_id} not found")]
    LessonNotFound { lesson_id: i64 },

    #[error("Version {version} of lesson {lesson_id} not found")]
    VersionNotFound { lesson_id: i64, version: i64 },

    #[error("Stage {stage} cannot be retried while {status}")]
    StageNotRetryable { stage: String, status: String },

    #[error("Version write for lesson {lesson_id} still conflicting after {attempts} attempts")]
    PersistenceConflict { lesson_id: i64, attempts: u32 },

    #[error("Persistence error: {0}")]
    Persistence(#[source] anyhow::Error),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CompileError {
    /// Stable machine-readable reason carried by terminal `error` events.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::ObjectiveNotFound { .. } => "ObjectiveNotFound",
            Self::LessonNotFound { .. } => "LessonNotFound",
            Self::VersionNotFound { .. } => "VersionNotFound",
            Self::StageNotRetryable { .. } => "StageNotRetryable",
            Self::PersistenceConflict { .. } => "PersistenceConflict",
            Self::Persistence(_) => "PersistenceFailure",
            Self::ServiceUnavailable(_) => "ServiceUnavailable",
            Self::Other(_) => "Internal",
        }
    }
}
