use serde::Serialize;
use thiserror::Error;

use crate::models::attempt::AttemptStatus;

pub type CoreResult<T> = Result<T, CoreError>;

/// Errors surfaced by the attempt, grading and assignment services.
///
/// Everything except `Internal` is an expected condition the request layer
/// translates into a user-facing response.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("cannot start attempt: {0}")]
    NotEligible(Ineligibility),

    #[error(transparent)]
    Conflict(#[from] Conflict),

    #[error("validation failed: {}", format_fields(.0))]
    Validation(Vec<FieldError>),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Reason a student may not start a new attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Ineligibility {
    NotActive,
    Expired,
    MaxAttemptsReached,
    AttemptInProgress,
}

impl Ineligibility {
    pub fn reason(&self) -> &'static str {
        match self {
            Ineligibility::NotActive => "not active",
            Ineligibility::Expired => "expired",
            Ineligibility::MaxAttemptsReached => "maximum attempts reached",
            Ineligibility::AttemptInProgress => "attempt already in progress",
        }
    }
}

impl std::fmt::Display for Ineligibility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.reason())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Conflict {
    #[error("question {question_id} is already assigned to assessment {assessment_id}")]
    DuplicateQuestion {
        assessment_id: String,
        question_id: String,
    },

    #[error("student {student_id} already has an attempt in progress")]
    AttemptAlreadyActive { student_id: String },

    #[error("assessment {assessment_id} is locked by {attempts} recorded attempt(s)")]
    AssessmentLocked { assessment_id: String, attempts: u64 },

    #[error("attempt {attempt_id} is already finalized")]
    AlreadyFinalized { attempt_id: String },

    #[error("attempt {attempt_id} is already submitted (status: {status})")]
    AttemptNotInProgress {
        attempt_id: String,
        status: AttemptStatus,
    },

    #[error("cannot move assessment from {from} to {to}")]
    InvalidStatusTransition { from: String, to: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

fn format_fields(fields: &[FieldError]) -> String {
    fields
        .iter()
        .map(|f| format!("{}: {}", f.field, f.message))
        .collect::<Vec<_>>()
        .join("; ")
}

impl CoreError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        CoreError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        CoreError::Validation(vec![FieldError::new(field, message)])
    }

    /// Stable machine-readable code for the request layer.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::NotFound { .. } => "not_found",
            CoreError::NotEligible(Ineligibility::NotActive) => "not_active",
            CoreError::NotEligible(Ineligibility::Expired) => "expired",
            CoreError::NotEligible(Ineligibility::MaxAttemptsReached) => "limit_exceeded",
            CoreError::NotEligible(Ineligibility::AttemptInProgress) => "attempt_in_progress",
            CoreError::Conflict(Conflict::AttemptNotInProgress { .. }) => "already_submitted",
            CoreError::Conflict(Conflict::AlreadyFinalized { .. }) => "already_finalized",
            CoreError::Conflict(Conflict::AssessmentLocked { .. }) => "locked",
            CoreError::Conflict(_) => "conflict",
            CoreError::Validation(_) => "validation",
            CoreError::Forbidden(_) => "forbidden",
            CoreError::Internal(_) => "internal",
        }
    }
}

impl From<validator::ValidationErrors> for CoreError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let mut fields: Vec<FieldError> = errors
            .field_errors()
            .into_iter()
            .flat_map(|(field, errs)| {
                errs.iter().map(move |e| {
                    let message = e
                        .message
                        .as_ref()
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| e.code.to_string());
                    FieldError::new(field.to_string(), message)
                })
            })
            .collect();
        fields.sort_by(|a, b| a.field.cmp(&b.field));
        CoreError::Validation(fields)
    }
}

impl From<mongodb::error::Error> for CoreError {
    fn from(err: mongodb::error::Error) -> Self {
        CoreError::Internal(anyhow::Error::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use validator::Validate;

    #[derive(Validate)]
    struct Sample {
        #[validate(range(min = 1, message = "must be positive"))]
        minutes: i64,
    }

    #[test]
    fn ineligibility_reasons_are_specific() {
        assert_eq!(Ineligibility::NotActive.to_string(), "not active");
        assert_eq!(Ineligibility::Expired.to_string(), "expired");
        assert_eq!(
            Ineligibility::MaxAttemptsReached.to_string(),
            "maximum attempts reached"
        );
        assert_eq!(
            Ineligibility::AttemptInProgress.to_string(),
            "attempt already in progress"
        );
    }

    #[test]
    fn validation_errors_keep_field_names() {
        let err: CoreError = Sample { minutes: 0 }.validate().unwrap_err().into();
        match err {
            CoreError::Validation(fields) => {
                assert_eq!(fields.len(), 1);
                assert_eq!(fields[0].field, "minutes");
                assert_eq!(fields[0].message, "must be positive");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn kinds_distinguish_typed_failures() {
        assert_eq!(CoreError::not_found("attempt", "a1").kind(), "not_found");
        assert_eq!(
            CoreError::NotEligible(Ineligibility::MaxAttemptsReached).kind(),
            "limit_exceeded"
        );
        let submitted = CoreError::from(Conflict::AttemptNotInProgress {
            attempt_id: "a1".into(),
            status: AttemptStatus::Completed,
        });
        assert_eq!(submitted.kind(), "already_submitted");
    }
}
