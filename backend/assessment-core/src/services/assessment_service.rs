use std::sync::Arc;
use tracing::info;
use uuid::Uuid;
use validator::Validate;

use super::invalidation::{invalidate_assessment, invalidate_deleted_assessment};
use super::policy::{ensure_assessment_owner, ensure_staff};
use crate::cache::{CacheHelper, CacheTtl};
use crate::error::{Conflict, CoreError, CoreResult};
use crate::models::attempt::round2;
use crate::models::{
    Assessment, AssessmentAttempt, AssessmentDetails, AssessmentFilter, AssessmentStats,
    AssessmentStatus, AttemptStatus, Caller, CreateAssessmentRequest, Page,
    UpdateAssessmentRequest,
};
use crate::store::Stores;
use crate::utils::time::Clock;

/// Assessment definitions: CRUD, lifecycle status and attempt statistics.
pub struct AssessmentService {
    stores: Stores,
    cache: Arc<CacheHelper>,
    clock: Arc<dyn Clock>,
}

impl AssessmentService {
    pub fn new(stores: Stores, cache: Arc<CacheHelper>, clock: Arc<dyn Clock>) -> Self {
        Self {
            stores,
            cache,
            clock,
        }
    }

    /// Creates a draft owned by the calling teacher or admin.
    pub async fn create(
        &self,
        caller: &Caller,
        req: CreateAssessmentRequest,
    ) -> CoreResult<Assessment> {
        ensure_staff(caller)?;
        req.validate()?;

        let now = self.clock.now();
        let assessment = Assessment {
            id: Uuid::new_v4().to_string(),
            creator_id: caller.user_id.clone(),
            title: req.title.trim().to_string(),
            description: req.description,
            duration_minutes: req.duration_minutes,
            max_attempts: req.max_attempts,
            passing_score: req.passing_score,
            due_date: req.due_date,
            status: AssessmentStatus::Draft,
            created_at: now,
            updated_at: now,
        };
        self.stores.assessments.create(&assessment).await?;

        invalidate_assessment(&self.cache, &assessment.id, &assessment.creator_id).await;
        info!(
            assessment_id = %assessment.id,
            creator_id = %assessment.creator_id,
            "Assessment created"
        );
        Ok(assessment)
    }

    pub async fn get_by_id(&self, assessment_id: &str) -> CoreResult<Assessment> {
        let key = self.cache.keys().assessment(assessment_id);
        self.cache
            .cache_or_execute(&key, CacheTtl::Assessment, || self.load(assessment_id))
            .await
    }

    /// The assessment with its ordered question rows.
    pub async fn get_details(&self, assessment_id: &str) -> CoreResult<AssessmentDetails> {
        let key = self.cache.keys().assessment_details(assessment_id);
        self.cache
            .cache_or_execute(&key, CacheTtl::Assessment, || async {
                let assessment = self.load(assessment_id).await?;
                let questions = self.stores.assessment_questions.list(assessment_id).await?;
                Ok::<_, CoreError>(AssessmentDetails {
                    assessment,
                    questions,
                })
            })
            .await
    }

    /// Staff list their own assessments; admins may list anyone's.
    pub async fn list_by_creator(
        &self,
        caller: &Caller,
        filter: AssessmentFilter,
    ) -> CoreResult<Page<Assessment>> {
        ensure_staff(caller)?;
        filter.validate()?;
        if !caller.is_admin() && filter.creator_id != caller.user_id {
            return Err(CoreError::Forbidden(
                "teachers may only list their own assessments".to_string(),
            ));
        }

        let key = self.cache.keys().assessment_list(&filter);
        self.cache
            .cache_or_execute(&key, CacheTtl::Assessment, || {
                self.stores.assessments.list(&filter)
            })
            .await
    }

    /// Applies the provided fields.
    ///
    /// Once attempts exist, the duration and the attempt ceiling can only be
    /// raised. A `max_attempts` of 0 means unlimited, so 0 to n is a decrease.
    pub async fn update(
        &self,
        caller: &Caller,
        assessment_id: &str,
        req: UpdateAssessmentRequest,
    ) -> CoreResult<Assessment> {
        req.validate()?;
        let mut assessment = self.load(assessment_id).await?;
        ensure_assessment_owner(caller, &assessment)?;

        let shortens_duration = req
            .duration_minutes
            .is_some_and(|d| d < assessment.duration_minutes);
        let lowers_ceiling = req
            .max_attempts
            .is_some_and(|m| ceiling_is_lower(assessment.max_attempts, m));
        if shortens_duration || lowers_ceiling {
            let attempts = self
                .stores
                .attempts
                .count_for_assessment(assessment_id)
                .await?;
            if attempts > 0 {
                return Err(Conflict::AssessmentLocked {
                    assessment_id: assessment_id.to_string(),
                    attempts,
                }
                .into());
            }
        }

        if let Some(title) = req.title {
            assessment.title = title.trim().to_string();
        }
        if let Some(description) = req.description {
            assessment.description = Some(description);
        }
        if let Some(duration) = req.duration_minutes {
            assessment.duration_minutes = duration;
        }
        if let Some(max_attempts) = req.max_attempts {
            assessment.max_attempts = max_attempts;
        }
        if let Some(passing_score) = req.passing_score {
            assessment.passing_score = passing_score;
        }
        if let Some(due_date) = req.due_date {
            assessment.due_date = due_date;
        }
        assessment.updated_at = self.clock.now();

        self.save(&assessment).await?;
        info!(assessment_id, "Assessment updated");
        Ok(assessment)
    }

    /// Moves the assessment through draft, active, expired and archived.
    /// Activation needs at least one question.
    pub async fn set_status(
        &self,
        caller: &Caller,
        assessment_id: &str,
        next: AssessmentStatus,
    ) -> CoreResult<Assessment> {
        let mut assessment = self.load(assessment_id).await?;
        ensure_assessment_owner(caller, &assessment)?;

        if assessment.status == next {
            return Ok(assessment);
        }
        if !assessment.status.can_transition_to(next) {
            return Err(Conflict::InvalidStatusTransition {
                from: assessment.status.to_string(),
                to: next.to_string(),
            }
            .into());
        }
        if next == AssessmentStatus::Active
            && self.stores.assessment_questions.count(assessment_id).await? == 0
        {
            return Err(CoreError::invalid(
                "status",
                "An assessment needs at least one question to be activated",
            ));
        }

        let from = assessment.status;
        assessment.status = next;
        assessment.updated_at = self.clock.now();
        self.save(&assessment).await?;

        info!(assessment_id, %from, to = %next, "Assessment status changed");
        Ok(assessment)
    }

    /// Deletes the assessment and its question rows. Refused while any attempt
    /// references it.
    pub async fn delete(&self, caller: &Caller, assessment_id: &str) -> CoreResult<()> {
        let assessment = self.load(assessment_id).await?;
        ensure_assessment_owner(caller, &assessment)?;

        let attempts = self
            .stores
            .attempts
            .count_for_assessment(assessment_id)
            .await?;
        if attempts > 0 {
            return Err(Conflict::AssessmentLocked {
                assessment_id: assessment_id.to_string(),
                attempts,
            }
            .into());
        }

        if !self
            .stores
            .assessments
            .delete_with_questions(assessment_id)
            .await?
        {
            return Err(CoreError::not_found("assessment", assessment_id));
        }

        invalidate_deleted_assessment(&self.cache, assessment_id, &assessment.creator_id).await;
        info!(assessment_id, "Assessment deleted");
        Ok(())
    }

    pub async fn get_stats(
        &self,
        caller: &Caller,
        assessment_id: &str,
    ) -> CoreResult<AssessmentStats> {
        let assessment = self.get_by_id(assessment_id).await?;
        ensure_assessment_owner(caller, &assessment)?;

        let key = self.cache.keys().assessment_stats(assessment_id);
        self.cache
            .cache_or_execute(&key, CacheTtl::Stats, || async {
                let attempts = self
                    .stores
                    .attempts
                    .list_for_assessment(assessment_id)
                    .await?;
                Ok::<_, CoreError>(summarize(assessment_id, &attempts))
            })
            .await
    }

    /// Whether any attempt, in any state, references the assessment.
    pub async fn has_attempts(&self, assessment_id: &str) -> CoreResult<bool> {
        let key = self.cache.keys().assessment_has_attempts(assessment_id);
        self.cache
            .cache_or_execute(&key, CacheTtl::Exists, || async {
                let attempts = self
                    .stores
                    .attempts
                    .count_for_assessment(assessment_id)
                    .await?;
                Ok::<_, CoreError>(attempts > 0)
            })
            .await
    }

    async fn save(&self, assessment: &Assessment) -> CoreResult<()> {
        if !self.stores.assessments.update(assessment).await? {
            return Err(CoreError::not_found("assessment", assessment.id.clone()));
        }
        invalidate_assessment(&self.cache, &assessment.id, &assessment.creator_id).await;
        Ok(())
    }

    async fn load(&self, id: &str) -> CoreResult<Assessment> {
        self.stores
            .assessments
            .find_by_id(id)
            .await?
            .ok_or_else(|| CoreError::not_found("assessment", id))
    }
}

fn ceiling_is_lower(current: u32, next: u32) -> bool {
    match (current, next) {
        (_, 0) => false,
        (0, _) => true,
        (current, next) => next < current,
    }
}

fn summarize(assessment_id: &str, attempts: &[AssessmentAttempt]) -> AssessmentStats {
    let mut stats = AssessmentStats {
        assessment_id: assessment_id.to_string(),
        total_attempts: attempts.len() as u64,
        ..AssessmentStats::default()
    };

    let mut percentages = Vec::new();
    for attempt in attempts {
        match attempt.status {
            AttemptStatus::InProgress => stats.in_progress += 1,
            AttemptStatus::Completed => stats.completed += 1,
            AttemptStatus::TimedOut => stats.timed_out += 1,
            AttemptStatus::Abandoned => stats.abandoned += 1,
        }
        if let (Some(_), Some(pct)) = (attempt.finalized_at, attempt.percentage) {
            stats.finalized += 1;
            if attempt.passed == Some(true) {
                stats.passed += 1;
            }
            percentages.push(pct);
        }
    }

    if !percentages.is_empty() {
        let n = percentages.len() as f64;
        stats.average_percentage = Some(round2(percentages.iter().sum::<f64>() / n));
        stats.pass_rate = Some(round2(stats.passed as f64 / n * 100.0));
        stats.highest_percentage = percentages.iter().copied().reduce(f64::max);
        stats.lowest_percentage = percentages.iter().copied().reduce(f64::min);
    }
    stats
}
