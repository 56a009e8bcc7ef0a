use serde::Serialize;
use std::sync::Arc;

use crate::error::{CoreError, CoreResult, Ineligibility};
use crate::models::{Assessment, AssessmentStatus};
use crate::store::Stores;
use crate::utils::time::Clock;

/// Outcome of the pre-flight check for starting an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EligibilityDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<Ineligibility>,
}

impl EligibilityDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: Ineligibility) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
        }
    }

    /// Human readable denial reason, if denied.
    pub fn reason_text(&self) -> Option<&'static str> {
        self.reason.map(|r| r.reason())
    }

    /// Turns a denial into `CoreError::NotEligible`.
    pub fn into_result(self) -> CoreResult<()> {
        match self.reason {
            Some(reason) if !self.allowed => Err(CoreError::NotEligible(reason)),
            _ => Ok(()),
        }
    }
}

/// Decides whether a student may start a new attempt.
///
/// Checks run in a fixed order and stop at the first failure. The result is
/// advisory: two racing starts can both pass, and the storage constraint on
/// in-progress attempts settles the race.
pub struct EligibilityGuard {
    stores: Stores,
    clock: Arc<dyn Clock>,
}

impl EligibilityGuard {
    pub fn new(stores: Stores, clock: Arc<dyn Clock>) -> Self {
        Self { stores, clock }
    }

    pub async fn can_start(
        &self,
        assessment_id: &str,
        student_id: &str,
    ) -> CoreResult<EligibilityDecision> {
        let assessment = self
            .stores
            .assessments
            .find_by_id(assessment_id)
            .await?
            .ok_or_else(|| CoreError::not_found("assessment", assessment_id))?;
        self.check(&assessment, student_id).await
    }

    pub async fn check(
        &self,
        assessment: &Assessment,
        student_id: &str,
    ) -> CoreResult<EligibilityDecision> {
        if assessment.status != AssessmentStatus::Active {
            return Ok(EligibilityDecision::deny(Ineligibility::NotActive));
        }

        if assessment.is_past_due(self.clock.now()) {
            return Ok(EligibilityDecision::deny(Ineligibility::Expired));
        }

        // The running attempt, if any, is reported by the in-progress check.
        if assessment.max_attempts > 0 {
            let used = self
                .stores
                .attempts
                .count_finished_for_student_assessment(&assessment.id, student_id)
                .await?;
            if used >= u64::from(assessment.max_attempts) {
                return Ok(EligibilityDecision::deny(Ineligibility::MaxAttemptsReached));
            }
        }

        let in_progress = self
            .stores
            .attempts
            .count_in_progress_for_student(student_id)
            .await?;
        if in_progress > 0 {
            return Ok(EligibilityDecision::deny(Ineligibility::AttemptInProgress));
        }

        Ok(EligibilityDecision::allow())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AssessmentAttempt, AttemptStatus};
    use crate::store::{AssessmentRepository, AttemptRepository, InMemoryStore};
    use crate::utils::time::ManualClock;
    use chrono::{Duration, TimeZone, Utc};

    fn assessment(status: AssessmentStatus, max_attempts: u32) -> Assessment {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        Assessment {
            id: "a1".into(),
            creator_id: "t1".into(),
            title: "Quiz".into(),
            description: None,
            duration_minutes: 30,
            max_attempts,
            passing_score: 50.0,
            due_date: None,
            status,
            created_at: now,
            updated_at: now,
        }
    }

    fn attempt(id: &str, assessment_id: &str, status: AttemptStatus) -> AssessmentAttempt {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        AssessmentAttempt {
            id: id.into(),
            assessment_id: assessment_id.into(),
            student_id: "s1".into(),
            status,
            started_at: now,
            completed_at: None,
            time_remaining_seconds: 1800,
            deadline_at: now + Duration::minutes(30),
            duration_minutes: 30,
            extended_minutes: 0,
            current_question_index: 0,
            questions_answered: 0,
            total_questions: 0,
            total_points: 0.0,
            score: None,
            percentage: None,
            passed: None,
            finalized_at: None,
            needs_scoring: false,
            updated_at: now,
        }
    }

    fn guard(store: Arc<InMemoryStore>) -> EligibilityGuard {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap());
        EligibilityGuard::new(Stores::from_backend(store), Arc::new(clock))
    }

    #[tokio::test]
    async fn inactive_is_checked_before_everything() {
        let store = Arc::new(InMemoryStore::new());
        let mut a = assessment(AssessmentStatus::Draft, 1);
        a.due_date = Some(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap());
        store.create(&a).await.unwrap();

        let decision = guard(store).can_start("a1", "s1").await.unwrap();
        assert_eq!(decision, EligibilityDecision::deny(Ineligibility::NotActive));
        assert_eq!(decision.reason_text(), Some("not active"));
    }

    #[tokio::test]
    async fn past_due_is_expired() {
        let store = Arc::new(InMemoryStore::new());
        let mut a = assessment(AssessmentStatus::Active, 0);
        a.due_date = Some(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap());
        store.create(&a).await.unwrap();

        let decision = guard(store).can_start("a1", "s1").await.unwrap();
        assert_eq!(decision.reason, Some(Ineligibility::Expired));
    }

    #[tokio::test]
    async fn ceiling_comes_before_in_progress() {
        let store = Arc::new(InMemoryStore::new());
        store
            .create(&assessment(AssessmentStatus::Active, 1))
            .await
            .unwrap();
        store
            .insert(&attempt("at1", "a1", AttemptStatus::TimedOut))
            .await
            .unwrap();
        store
            .insert(&attempt("at2", "other", AttemptStatus::InProgress))
            .await
            .unwrap();

        let decision = guard(store).can_start("a1", "s1").await.unwrap();
        assert_eq!(decision.reason, Some(Ineligibility::MaxAttemptsReached));
    }

    #[tokio::test]
    async fn running_attempt_is_not_counted_against_the_ceiling() {
        let store = Arc::new(InMemoryStore::new());
        store
            .create(&assessment(AssessmentStatus::Active, 1))
            .await
            .unwrap();
        store
            .insert(&attempt("at1", "a1", AttemptStatus::InProgress))
            .await
            .unwrap();

        let decision = guard(store).can_start("a1", "s1").await.unwrap();
        assert_eq!(decision.reason, Some(Ineligibility::AttemptInProgress));
    }

    #[tokio::test]
    async fn in_progress_anywhere_blocks_a_new_start() {
        let store = Arc::new(InMemoryStore::new());
        store
            .create(&assessment(AssessmentStatus::Active, 0))
            .await
            .unwrap();
        store
            .insert(&attempt("at1", "other", AttemptStatus::InProgress))
            .await
            .unwrap();

        let decision = guard(store).can_start("a1", "s1").await.unwrap();
        assert_eq!(decision.reason, Some(Ineligibility::AttemptInProgress));
        assert!(decision.into_result().is_err());
    }

    #[tokio::test]
    async fn unknown_assessment_is_not_found() {
        let store = Arc::new(InMemoryStore::new());
        let err = guard(store).can_start("nope", "s1").await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }
}
