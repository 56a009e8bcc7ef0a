//! Ownership and role checks applied before any service mutation.

use crate::error::{CoreError, CoreResult};
use crate::models::{Assessment, AssessmentAttempt, Caller};

/// Only the student who owns the attempt may work on it.
pub fn ensure_attempt_owner(caller: &Caller, attempt: &AssessmentAttempt) -> CoreResult<()> {
    if caller.user_id == attempt.student_id {
        Ok(())
    } else {
        Err(CoreError::Forbidden(format!(
            "attempt {} belongs to another student",
            attempt.id
        )))
    }
}

/// The owning student and any staff member may read an attempt.
pub fn ensure_attempt_reader(caller: &Caller, attempt: &AssessmentAttempt) -> CoreResult<()> {
    if caller.is_staff() || caller.user_id == attempt.student_id {
        Ok(())
    } else {
        Err(CoreError::Forbidden(format!(
            "no access to attempt {}",
            attempt.id
        )))
    }
}

/// Authoring, grading and time extensions need the creating teacher or an admin.
pub fn ensure_assessment_owner(caller: &Caller, assessment: &Assessment) -> CoreResult<()> {
    if caller.is_admin() || (caller.is_staff() && caller.user_id == assessment.creator_id) {
        Ok(())
    } else {
        Err(CoreError::Forbidden(format!(
            "only the creator or an admin may manage assessment {}",
            assessment.id
        )))
    }
}

pub fn ensure_staff(caller: &Caller) -> CoreResult<()> {
    if caller.is_staff() {
        Ok(())
    } else {
        Err(CoreError::Forbidden(
            "teacher or admin role required".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AssessmentStatus;
    use chrono::Utc;

    fn assessment() -> Assessment {
        Assessment {
            id: "a1".into(),
            creator_id: "t1".into(),
            title: "Quiz".into(),
            description: None,
            duration_minutes: 30,
            max_attempts: 1,
            passing_score: 60.0,
            due_date: None,
            status: AssessmentStatus::Active,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn only_creator_or_admin_manage() {
        let a = assessment();
        assert!(ensure_assessment_owner(&Caller::teacher("t1"), &a).is_ok());
        assert!(ensure_assessment_owner(&Caller::admin("root"), &a).is_ok());
        assert!(ensure_assessment_owner(&Caller::teacher("t2"), &a).is_err());
        assert!(ensure_assessment_owner(&Caller::student("t1"), &a).is_err());
    }

    #[test]
    fn students_are_not_staff() {
        let err = ensure_staff(&Caller::student("s1")).unwrap_err();
        assert_eq!(err.kind(), "forbidden");
    }
}
