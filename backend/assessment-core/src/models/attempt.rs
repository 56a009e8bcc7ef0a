use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::utils::time::{rfc3339_millis, rfc3339_millis_option};

/// One student's timed session at an assessment ("assessment_attempts" collection).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssessmentAttempt {
    #[serde(rename = "_id")]
    pub id: String,
    pub assessment_id: String,
    pub student_id: String,
    pub status: AttemptStatus,
    #[serde(with = "rfc3339_millis")]
    pub started_at: DateTime<Utc>,
    #[serde(default, with = "rfc3339_millis_option")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Seconds left as of the last persisted check; only shrinks while in progress
    /// except through an explicit extension.
    pub time_remaining_seconds: i64,
    /// `started_at + duration + extensions`.
    #[serde(with = "rfc3339_millis")]
    pub deadline_at: DateTime<Utc>,
    pub duration_minutes: i64,
    #[serde(default)]
    pub extended_minutes: i64,
    pub current_question_index: u32,
    pub questions_answered: u32,
    /// Snapshot of the assessment's question count at start.
    pub total_questions: u32,
    /// Snapshot of the assessment's total points at start.
    pub total_points: f64,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub percentage: Option<f64>,
    #[serde(default)]
    pub passed: Option<bool>,
    #[serde(default, with = "rfc3339_millis_option")]
    pub finalized_at: Option<DateTime<Utc>>,
    /// Set with the move into a scored status and cleared once auto-grading
    /// and finalization have run for it.
    #[serde(default)]
    pub needs_scoring: bool,
    #[serde(with = "rfc3339_millis")]
    pub updated_at: DateTime<Utc>,
}

impl AssessmentAttempt {
    pub fn is_in_progress(&self) -> bool {
        self.status == AttemptStatus::InProgress
    }

    /// Seconds until the deadline, never negative.
    pub fn seconds_left(&self, now: DateTime<Utc>) -> i64 {
        (self.deadline_at - now).num_seconds().max(0)
    }

    /// True once the stored remainder or the wall-clock deadline is exhausted.
    pub fn is_out_of_time(&self, now: DateTime<Utc>) -> bool {
        self.time_remaining_seconds <= 0 || now >= self.deadline_at
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized_at.is_some()
    }

    pub fn extend(&mut self, minutes: i64, now: DateTime<Utc>) {
        self.extended_minutes += minutes;
        self.deadline_at += Duration::minutes(minutes);
        self.time_remaining_seconds = self.seconds_left(now);
        self.updated_at = now;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    InProgress,
    Completed,
    Abandoned,
    TimedOut,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::InProgress => "in_progress",
            AttemptStatus::Completed => "completed",
            AttemptStatus::Abandoned => "abandoned",
            AttemptStatus::TimedOut => "timed_out",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, AttemptStatus::InProgress)
    }

    /// Terminal states whose answers are scored.
    pub fn is_scored(&self) -> bool {
        matches!(self, AttemptStatus::Completed | AttemptStatus::TimedOut)
    }
}

impl std::fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned by start/resume: the attempt plus its live remaining time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptSession {
    pub attempt: AssessmentAttempt,
    pub time_remaining_seconds: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptProgress {
    pub attempt_id: String,
    pub status: AttemptStatus,
    pub current_question_index: u32,
    pub questions_answered: u32,
    pub total_questions: u32,
    pub percent_complete: f64,
    pub time_remaining_seconds: i64,
}

impl AttemptProgress {
    pub fn of(attempt: &AssessmentAttempt, now: DateTime<Utc>) -> Self {
        let percent_complete = if attempt.total_questions == 0 {
            0.0
        } else {
            round2(attempt.questions_answered as f64 / attempt.total_questions as f64 * 100.0)
        };
        let time_remaining_seconds = if attempt.is_in_progress() {
            attempt.seconds_left(now).min(attempt.time_remaining_seconds.max(0))
        } else {
            0
        };
        Self {
            attempt_id: attempt.id.clone(),
            status: attempt.status,
            current_question_index: attempt.current_question_index,
            questions_answered: attempt.questions_answered,
            total_questions: attempt.total_questions,
            percent_complete,
            time_remaining_seconds,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ExtendTimeRequest {
    #[validate(range(min = 1, max = 1440, message = "Extension must be 1-1440 minutes"))]
    pub minutes: i64,
}

/// Result of one timeout sweep pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub timed_out: Vec<String>,
    /// Attempts whose unfinished scoring was completed on this pass.
    pub rescored: Vec<String>,
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn attempt(now: DateTime<Utc>) -> AssessmentAttempt {
        AssessmentAttempt {
            id: "at1".into(),
            assessment_id: "a1".into(),
            student_id: "s1".into(),
            status: AttemptStatus::InProgress,
            started_at: now,
            completed_at: None,
            time_remaining_seconds: 600,
            deadline_at: now + Duration::minutes(10),
            duration_minutes: 10,
            extended_minutes: 0,
            current_question_index: 0,
            questions_answered: 1,
            total_questions: 3,
            total_points: 100.0,
            score: None,
            percentage: None,
            passed: None,
            finalized_at: None,
            needs_scoring: false,
            updated_at: now,
        }
    }

    #[test]
    fn seconds_left_never_negative() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        let a = attempt(now);
        assert_eq!(a.seconds_left(now + Duration::minutes(4)), 360);
        assert_eq!(a.seconds_left(now + Duration::minutes(30)), 0);
        assert!(a.is_out_of_time(now + Duration::minutes(10)));
        assert!(!a.is_out_of_time(now + Duration::minutes(9)));
    }

    #[test]
    fn extension_moves_deadline() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        let mut a = attempt(now);
        a.extend(5, now + Duration::minutes(8));
        assert_eq!(a.deadline_at, now + Duration::minutes(15));
        assert_eq!(a.time_remaining_seconds, 420);
        assert_eq!(a.extended_minutes, 5);
    }

    #[test]
    fn progress_percent_complete() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        let progress = AttemptProgress::of(&attempt(now), now);
        assert_eq!(progress.percent_complete, 33.33);
        assert_eq!(progress.time_remaining_seconds, 600);
    }

    #[test]
    fn terminal_statuses() {
        assert!(!AttemptStatus::InProgress.is_terminal());
        assert!(AttemptStatus::Abandoned.is_terminal());
        assert!(AttemptStatus::TimedOut.is_scored());
        assert!(!AttemptStatus::Abandoned.is_scored());
    }
}
