use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::utils::time::{rfc3339_millis, rfc3339_millis_option};

/// Answer to one question within one attempt; unique per (attempt, question).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentAnswer {
    #[serde(rename = "_id")]
    pub id: String,
    pub attempt_id: String,
    pub question_id: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub is_correct: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    /// `None` with `graded_at` set means an automatic grade.
    #[serde(default)]
    pub graded_by: Option<String>,
    /// `None` means the answer awaits grading.
    #[serde(default, with = "rfc3339_millis_option")]
    pub graded_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_flagged: bool,
    #[serde(default)]
    pub time_spent_seconds: i64,
    #[serde(with = "rfc3339_millis")]
    pub answered_at: DateTime<Utc>,
}

impl StudentAnswer {
    pub fn is_graded(&self) -> bool {
        self.graded_at.is_some()
    }

    pub fn is_auto_graded(&self) -> bool {
        self.graded_at.is_some() && self.graded_by.is_none()
    }

    /// Whether applying `grade` would leave the stored result unchanged.
    pub fn has_same_grade(&self, grade: &GradeStamp) -> bool {
        self.is_graded()
            && self.score == Some(grade.score)
            && self.is_correct == grade.is_correct
            && self.feedback == grade.feedback
            && self.graded_by == grade.graded_by
    }

    pub fn apply_grade(&mut self, grade: &GradeStamp) {
        self.score = Some(grade.score);
        self.is_correct = grade.is_correct;
        self.feedback = grade.feedback.clone();
        self.graded_by = grade.graded_by.clone();
        self.graded_at = Some(grade.graded_at);
    }
}

/// Fully resolved grade as written to storage.
#[derive(Debug, Clone, PartialEq)]
pub struct GradeStamp {
    pub score: f64,
    pub is_correct: Option<bool>,
    pub feedback: Option<String>,
    pub graded_by: Option<String>,
    pub graded_at: DateTime<Utc>,
}

impl GradeStamp {
    /// An empty grader id marks an automatic grade.
    pub fn new(
        score: f64,
        is_correct: Option<bool>,
        feedback: Option<String>,
        grader_id: &str,
        graded_at: DateTime<Utc>,
    ) -> Self {
        let graded_by = if grader_id.is_empty() {
            None
        } else {
            Some(grader_id.to_string())
        };
        Self {
            score,
            is_correct,
            feedback,
            graded_by,
            graded_at,
        }
    }
}

/// Answer write coming from the student while the attempt is in progress.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SubmitAnswerRequest {
    #[validate(length(min = 1, message = "Question id is required"))]
    pub question_id: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    #[validate(range(min = 0, message = "Time spent cannot be negative"))]
    pub time_spent_seconds: i64,
    #[serde(default)]
    pub flagged: bool,
}

/// Values upserted for one (attempt, question).
#[derive(Debug, Clone, PartialEq)]
pub struct AnswerDraft {
    pub attempt_id: String,
    pub question_id: String,
    pub payload: serde_json::Value,
    pub time_spent_seconds: i64,
    pub is_flagged: bool,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct GradeAnswerRequest {
    #[validate(
        range(min = 0.0, message = "Score cannot be negative"),
        custom(function = validate_finite_score)
    )]
    pub score: f64,
    pub is_correct: Option<bool>,
    #[validate(length(max = 4000, message = "Feedback is too long"))]
    pub feedback: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct BulkGradeItem {
    #[validate(length(min = 1, message = "Answer id is required"))]
    pub answer_id: String,
    #[validate(
        range(min = 0.0, message = "Score cannot be negative"),
        custom(function = validate_finite_score)
    )]
    pub score: f64,
    pub is_correct: Option<bool>,
    #[validate(length(max = 4000, message = "Feedback is too long"))]
    pub feedback: Option<String>,
}

/// `range` lets NaN through, since every comparison with it is false.
fn validate_finite_score(score: f64) -> Result<(), validator::ValidationError> {
    if !score.is_finite() {
        let mut err = validator::ValidationError::new("non_finite_score");
        err.message = Some("Score must be a finite number".into());
        return Err(err);
    }
    Ok(())
}
