use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use validator::Validate;

use crate::utils::time::{rfc3339_millis, rfc3339_millis_option};

/// Assessment stored in MongoDB "assessments" collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assessment {
    #[serde(rename = "_id")]
    pub id: String,
    pub creator_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub duration_minutes: i64,
    /// 0 means unlimited.
    pub max_attempts: u32,
    /// Percentage (0-100) required to pass.
    pub passing_score: f64,
    #[serde(default, with = "rfc3339_millis_option")]
    pub due_date: Option<DateTime<Utc>>,
    pub status: AssessmentStatus,
    #[serde(with = "rfc3339_millis")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "rfc3339_millis")]
    pub updated_at: DateTime<Utc>,
}

impl Assessment {
    pub fn is_past_due(&self, now: DateTime<Utc>) -> bool {
        self.due_date.is_some_and(|due| now > due)
    }

    pub fn duration_seconds(&self) -> i64 {
        self.duration_minutes * 60
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssessmentStatus {
    Draft,
    Active,
    Expired,
    Archived,
}

impl AssessmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssessmentStatus::Draft => "draft",
            AssessmentStatus::Active => "active",
            AssessmentStatus::Expired => "expired",
            AssessmentStatus::Archived => "archived",
        }
    }

    /// Allowed lifecycle moves. Archiving is always possible; nothing leaves `Archived`.
    pub fn can_transition_to(&self, next: AssessmentStatus) -> bool {
        use AssessmentStatus as S;
        match (self, next) {
            (S::Archived, _) => false,
            (_, S::Archived) => true,
            (S::Draft, S::Active) => true,
            (S::Active, S::Expired) => true,
            (S::Expired, S::Active) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for AssessmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Join row placing a bank question on an assessment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssessmentQuestion {
    #[serde(rename = "_id")]
    pub id: String,
    pub assessment_id: String,
    pub question_id: String,
    /// Dense 1..N position within the assessment.
    pub order: i32,
    /// Overrides the question's intrinsic points when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub points: Option<i32>,
    #[serde(default)]
    pub required: bool,
    #[serde(with = "rfc3339_millis")]
    pub added_at: DateTime<Utc>,
}

impl AssessmentQuestion {
    pub fn effective_points(&self, question: &Question) -> i32 {
        self.points.unwrap_or(question.points)
    }
}

/// Read-only view of a question owned by the question bank.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    #[serde(rename = "_id")]
    pub id: String,
    pub title: String,
    pub question_type: QuestionType,
    pub points: i32,
    /// Correct-answer definition for objective types.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correct_answer: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    SingleChoice,
    MultipleChoice,
    TrueFalse,
    ShortAnswer,
    Essay,
    FileUpload,
}

impl QuestionType {
    pub fn is_objective(&self) -> bool {
        matches!(
            self,
            QuestionType::SingleChoice
                | QuestionType::MultipleChoice
                | QuestionType::TrueFalse
                | QuestionType::ShortAnswer
        )
    }
}

/// Assessment together with its ordered question rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssessmentDetails {
    pub assessment: Assessment,
    pub questions: Vec<AssessmentQuestion>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateAssessmentRequest {
    #[validate(length(
        min = 1,
        max = 200,
        message = "Title must be between 1 and 200 characters"
    ))]
    pub title: String,

    #[validate(length(max = 2000, message = "Description is too long"))]
    pub description: Option<String>,

    #[validate(range(min = 1, max = 1440, message = "Duration must be 1-1440 minutes"))]
    pub duration_minutes: i64,

    #[serde(default)]
    pub max_attempts: u32,

    #[validate(range(min = 0.0, max = 100.0, message = "Passing score must be 0-100"))]
    pub passing_score: f64,

    pub due_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct UpdateAssessmentRequest {
    #[validate(length(
        min = 1,
        max = 200,
        message = "Title must be between 1 and 200 characters"
    ))]
    pub title: Option<String>,

    #[validate(length(max = 2000, message = "Description is too long"))]
    pub description: Option<String>,

    #[validate(range(min = 1, max = 1440, message = "Duration must be 1-1440 minutes"))]
    pub duration_minutes: Option<i64>,

    pub max_attempts: Option<u32>,

    #[validate(range(min = 0.0, max = 100.0, message = "Passing score must be 0-100"))]
    pub passing_score: Option<f64>,

    /// Absent leaves the due date alone; `null` clears it.
    #[serde(default, deserialize_with = "present")]
    pub due_date: Option<Option<DateTime<Utc>>>,
}

/// Marks a field as present, so an explicit `null` becomes `Some(None)`.
fn present<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    T::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct AddQuestionRequest {
    #[validate(length(min = 1, message = "Question id is required"))]
    pub question_id: String,

    /// 0 appends after the last question.
    #[serde(default)]
    #[validate(range(min = 0, message = "Order cannot be negative"))]
    pub order: i32,

    #[validate(range(min = 0, max = 100, message = "Points must be 0-100"))]
    pub points: Option<i32>,

    #[serde(default)]
    pub required: bool,
}

/// Aggregate attempt figures for one assessment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssessmentStats {
    pub assessment_id: String,
    pub total_attempts: u64,
    pub in_progress: u64,
    pub completed: u64,
    pub timed_out: u64,
    pub abandoned: u64,
    pub finalized: u64,
    pub passed: u64,
    pub average_percentage: Option<f64>,
    pub pass_rate: Option<f64>,
    pub highest_percentage: Option<f64>,
    pub lowest_percentage: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn due_date_null_differs_from_absent() {
        let absent: UpdateAssessmentRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(absent.due_date, None);

        let cleared: UpdateAssessmentRequest =
            serde_json::from_str(r#"{"due_date": null}"#).unwrap();
        assert_eq!(cleared.due_date, Some(None));

        let set: UpdateAssessmentRequest =
            serde_json::from_str(r#"{"due_date": "2026-05-01T12:00:00Z"}"#).unwrap();
        assert!(matches!(set.due_date, Some(Some(_))));
    }

    #[test]
    fn status_transitions() {
        use AssessmentStatus as S;
        assert!(S::Draft.can_transition_to(S::Active));
        assert!(S::Active.can_transition_to(S::Expired));
        assert!(S::Expired.can_transition_to(S::Active));
        assert!(S::Draft.can_transition_to(S::Archived));
        assert!(!S::Archived.can_transition_to(S::Active));
        assert!(!S::Active.can_transition_to(S::Draft));
    }

    #[test]
    fn override_points_take_precedence() {
        let question = Question {
            id: "q1".into(),
            title: "Capital".into(),
            question_type: QuestionType::SingleChoice,
            points: 5,
            correct_answer: None,
        };
        let mut row = AssessmentQuestion {
            id: "r1".into(),
            assessment_id: "a1".into(),
            question_id: "q1".into(),
            order: 1,
            points: None,
            required: true,
            added_at: Utc::now(),
        };
        assert_eq!(row.effective_points(&question), 5);
        row.points = Some(20);
        assert_eq!(row.effective_points(&question), 20);
    }
}
