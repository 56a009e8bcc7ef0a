use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;
use validator::Validate;

use super::eligibility::{EligibilityDecision, EligibilityGuard};
use super::grading_service::GradingService;
use super::invalidation::invalidate_attempt;
use super::policy::{ensure_assessment_owner, ensure_attempt_owner, ensure_attempt_reader};
use crate::cache::{CacheHelper, CacheTtl};
use crate::config::AttemptSettings;
use crate::error::{Conflict, CoreError, CoreResult};
use crate::metrics::record_transition;
use crate::models::{
    AnswerDraft, Assessment, AssessmentAttempt, AttemptFilter, AttemptProgress, AttemptSession,
    AttemptStatus, Caller, ExtendTimeRequest, Page, StudentAnswer, SubmitAnswerRequest,
    SweepReport,
};
use crate::store::Stores;
use crate::utils::time::Clock;

/// Owns the attempt lifecycle: `InProgress` to one of `Completed`,
/// `Abandoned` or `TimedOut`, with no way back.
///
/// Every transition is a compare-and-set on the stored status, so a sweep
/// racing a submit moves the attempt exactly once.
pub struct AttemptService {
    stores: Stores,
    cache: Arc<CacheHelper>,
    clock: Arc<dyn Clock>,
    guard: EligibilityGuard,
    grading: Arc<GradingService>,
    settings: AttemptSettings,
}

impl AttemptService {
    pub fn new(
        stores: Stores,
        cache: Arc<CacheHelper>,
        clock: Arc<dyn Clock>,
        grading: Arc<GradingService>,
        settings: AttemptSettings,
    ) -> Self {
        Self {
            guard: EligibilityGuard::new(stores.clone(), clock.clone()),
            stores,
            cache,
            clock,
            grading,
            settings,
        }
    }

    pub async fn can_start(
        &self,
        assessment_id: &str,
        student_id: &str,
    ) -> CoreResult<EligibilityDecision> {
        self.guard.can_start(assessment_id, student_id).await
    }

    /// Starts a new attempt for the calling student.
    ///
    /// The question count and total points are snapshotted here; later edits
    /// to the assessment do not reach an attempt already running.
    pub async fn start(&self, caller: &Caller, assessment_id: &str) -> CoreResult<AttemptSession> {
        let assessment = self.load_assessment(assessment_id).await?;
        self.guard
            .check(&assessment, &caller.user_id)
            .await?
            .into_result()?;

        let (total_questions, total_points) = self.snapshot_totals(&assessment.id).await?;
        let now = self.clock.now();
        let attempt = AssessmentAttempt {
            id: Uuid::new_v4().to_string(),
            assessment_id: assessment.id.clone(),
            student_id: caller.user_id.clone(),
            status: AttemptStatus::InProgress,
            started_at: now,
            completed_at: None,
            time_remaining_seconds: assessment.duration_seconds(),
            deadline_at: now + Duration::minutes(assessment.duration_minutes),
            duration_minutes: assessment.duration_minutes,
            extended_minutes: 0,
            current_question_index: 0,
            questions_answered: 0,
            total_questions,
            total_points,
            score: None,
            percentage: None,
            passed: None,
            finalized_at: None,
            needs_scoring: false,
            updated_at: now,
        };

        // The storage constraint catches a concurrent start the guard missed.
        self.stores.attempts.insert(&attempt).await?;

        record_transition(AttemptStatus::InProgress.as_str());
        invalidate_attempt(&self.cache, &attempt).await;
        info!(
            attempt_id = %attempt.id,
            assessment_id = %attempt.assessment_id,
            student_id = %attempt.student_id,
            total_questions,
            "Attempt started"
        );

        Ok(AttemptSession {
            time_remaining_seconds: attempt.time_remaining_seconds,
            attempt,
        })
    }

    /// Returns the running session with its recomputed remaining time. An
    /// attempt found out of time is timed out instead and returned as such.
    pub async fn resume(&self, caller: &Caller, attempt_id: &str) -> CoreResult<AttemptSession> {
        let mut attempt = self.load(attempt_id).await?;
        ensure_attempt_owner(caller, &attempt)?;
        ensure_in_progress(&attempt)?;

        let now = self.clock.now();
        if attempt.is_out_of_time(now) {
            let timed_out = self.expire(attempt, now).await?;
            return Ok(AttemptSession {
                attempt: timed_out,
                time_remaining_seconds: 0,
            });
        }

        let remaining = attempt.seconds_left(now).min(attempt.time_remaining_seconds);
        if remaining < attempt.time_remaining_seconds {
            attempt.time_remaining_seconds = remaining;
            attempt.updated_at = now;
            self.write_in_progress(&attempt).await?;
        }

        Ok(AttemptSession {
            time_remaining_seconds: remaining,
            attempt,
        })
    }

    /// Moves the cursor forward. Lower indexes are ignored so that the
    /// position never goes backwards.
    pub async fn update_progress(
        &self,
        caller: &Caller,
        attempt_id: &str,
        current_question_index: u32,
    ) -> CoreResult<AttemptProgress> {
        let mut attempt = self.load(attempt_id).await?;
        ensure_attempt_owner(caller, &attempt)?;
        let now = self.clock.now();
        self.ensure_live(&attempt, now).await?;

        if current_question_index > attempt.total_questions {
            return Err(CoreError::invalid(
                "current_question_index",
                format!(
                    "Index must be at most {} for this attempt",
                    attempt.total_questions
                ),
            ));
        }

        if current_question_index > attempt.current_question_index {
            attempt.current_question_index = current_question_index;
            attempt.updated_at = now;
            self.write_in_progress(&attempt).await?;
        }
        Ok(AttemptProgress::of(&attempt, now))
    }

    /// Saves the student's answer to one question of the attempt.
    ///
    /// The first answer to a question bumps `questions_answered`; resubmitting
    /// updates the stored answer in place. Past the deadline the attempt is
    /// timed out and the answer rejected.
    pub async fn submit_answer(
        &self,
        caller: &Caller,
        attempt_id: &str,
        req: SubmitAnswerRequest,
    ) -> CoreResult<StudentAnswer> {
        req.validate()?;
        let attempt = self.load(attempt_id).await?;
        ensure_attempt_owner(caller, &attempt)?;
        let now = self.clock.now();
        self.ensure_live(&attempt, now).await?;

        if self
            .stores
            .assessment_questions
            .find(&attempt.assessment_id, &req.question_id)
            .await?
            .is_none()
        {
            return Err(CoreError::not_found("question", req.question_id));
        }

        let (answer, created) = self
            .grading
            .upsert_answer(AnswerDraft {
                attempt_id: attempt.id.clone(),
                question_id: req.question_id,
                payload: req.payload,
                time_spent_seconds: req.time_spent_seconds,
                is_flagged: req.flagged,
            })
            .await?;

        if created && self.stores.attempts.increment_answered(&attempt.id, now).await? {
            invalidate_attempt(&self.cache, &attempt).await;
        }
        Ok(answer)
    }

    /// Adds minutes to a running attempt. Creator or admin only.
    pub async fn extend_time(
        &self,
        caller: &Caller,
        attempt_id: &str,
        req: ExtendTimeRequest,
    ) -> CoreResult<AssessmentAttempt> {
        req.validate()?;
        let mut attempt = self.load(attempt_id).await?;
        let assessment = self.load_assessment(&attempt.assessment_id).await?;
        ensure_assessment_owner(caller, &assessment)?;
        ensure_in_progress(&attempt)?;

        attempt.extend(req.minutes, self.clock.now());
        self.write_in_progress(&attempt).await?;

        info!(
            attempt_id,
            minutes = req.minutes,
            deadline = %attempt.deadline_at,
            by = %caller.user_id,
            "Attempt time extended"
        );
        Ok(attempt)
    }

    /// Completes the attempt, auto-grades objective answers and finalizes the
    /// score if nothing is left for manual grading.
    pub async fn submit(&self, caller: &Caller, attempt_id: &str) -> CoreResult<AssessmentAttempt> {
        let attempt = self.load(attempt_id).await?;
        ensure_attempt_owner(caller, &attempt)?;
        let now = self.clock.now();
        self.ensure_live(&attempt, now).await?;

        let completed = self
            .transition(attempt, AttemptStatus::Completed, now)
            .await?;
        self.score(&completed).await
    }

    /// Gives the attempt up, by its student or by staff. Answers are kept but
    /// never graded.
    pub async fn abandon(&self, caller: &Caller, attempt_id: &str) -> CoreResult<AssessmentAttempt> {
        let attempt = self.load(attempt_id).await?;
        ensure_attempt_reader(caller, &attempt)?;
        self.transition(attempt, AttemptStatus::Abandoned, self.clock.now())
            .await
    }

    /// Times the attempt out now, freezing and grading its answers.
    pub async fn time_out(&self, attempt_id: &str) -> CoreResult<AssessmentAttempt> {
        let attempt = self.load(attempt_id).await?;
        self.expire(attempt, self.clock.now()).await
    }

    /// Re-runs scoring for attempts that reached a scored status but whose
    /// auto-grading or finalization never completed. Returns the ids scored.
    pub async fn rescore_pending(&self) -> CoreResult<Vec<String>> {
        let pending = self
            .stores
            .attempts
            .find_needing_scoring(self.settings.sweep_batch_limit)
            .await?;

        let mut rescored = Vec::new();
        for attempt in pending {
            match self.score(&attempt).await {
                Ok(_) => rescored.push(attempt.id),
                Err(e) => {
                    error!(attempt_id = %attempt.id, error = %e, "Failed to rescore attempt");
                }
            }
        }
        if !rescored.is_empty() {
            info!(rescored = rescored.len(), "Pending attempts rescored");
        }
        Ok(rescored)
    }

    /// Times out every in-progress attempt past its deadline, up to the
    /// configured batch size, then retries any scoring left unfinished.
    /// Attempts another writer moved first are skipped.
    pub async fn sweep_timed_out(&self) -> CoreResult<SweepReport> {
        let now = self.clock.now();
        let due = self
            .stores
            .attempts
            .find_timed_out(now, self.settings.sweep_batch_limit)
            .await?;

        let mut report = SweepReport {
            examined: due.len(),
            ..SweepReport::default()
        };
        for attempt in due {
            let id = attempt.id.clone();
            match self.expire(attempt, now).await {
                Ok(_) => report.timed_out.push(id),
                Err(CoreError::Conflict(Conflict::AttemptNotInProgress { status, .. })) => {
                    info!(attempt_id = %id, %status, "Attempt left progress before sweep");
                }
                Err(e) => {
                    error!(attempt_id = %id, error = %e, "Failed to time out attempt");
                }
            }
        }

        report.rescored = self.rescore_pending().await?;

        if !report.timed_out.is_empty() {
            info!(
                examined = report.examined,
                timed_out = report.timed_out.len(),
                "Timeout sweep finished"
            );
        }
        Ok(report)
    }

    pub async fn get_by_id(&self, caller: &Caller, attempt_id: &str) -> CoreResult<AssessmentAttempt> {
        let key = self.cache.keys().attempt(attempt_id);
        let attempt = self
            .cache
            .cache_or_execute(&key, CacheTtl::Fast, || self.load(attempt_id))
            .await?;
        ensure_attempt_reader(caller, &attempt)?;
        Ok(attempt)
    }

    pub async fn get_progress(&self, caller: &Caller, attempt_id: &str) -> CoreResult<AttemptProgress> {
        let attempt = self.get_by_id(caller, attempt_id).await?;
        Ok(AttemptProgress::of(&attempt, self.clock.now()))
    }

    /// Seconds left, never negative; 0 once the attempt left progress.
    pub async fn get_time_remaining(&self, caller: &Caller, attempt_id: &str) -> CoreResult<i64> {
        Ok(self
            .get_progress(caller, attempt_id)
            .await?
            .time_remaining_seconds)
    }

    /// Lists attempts. Students only ever see their own.
    pub async fn list_attempts(
        &self,
        caller: &Caller,
        mut filter: AttemptFilter,
    ) -> CoreResult<Page<AssessmentAttempt>> {
        filter.validate()?;
        if !caller.is_staff() {
            match &filter.student_id {
                Some(student) if *student != caller.user_id => {
                    return Err(CoreError::Forbidden(
                        "students may only list their own attempts".to_string(),
                    ));
                }
                _ => filter.student_id = Some(caller.user_id.clone()),
            }
        }

        let key = self.cache.keys().attempt_list(&filter);
        self.cache
            .cache_or_execute(&key, CacheTtl::Fast, || self.stores.attempts.list(&filter))
            .await
    }

    async fn snapshot_totals(&self, assessment_id: &str) -> CoreResult<(u32, f64)> {
        let rows = self.stores.assessment_questions.list(assessment_id).await?;
        let ids: Vec<String> = rows.iter().map(|r| r.question_id.clone()).collect();
        let questions: HashMap<String, i32> = self
            .stores
            .questions
            .find_many(&ids)
            .await?
            .into_iter()
            .map(|q| (q.id.clone(), q.points))
            .collect();

        let total_points: i64 = rows
            .iter()
            .map(|row| {
                row.points
                    .or_else(|| questions.get(&row.question_id).copied())
                    .unwrap_or(0) as i64
            })
            .sum();
        Ok((rows.len() as u32, total_points as f64))
    }

    /// Rejects work on an attempt that is no longer running, timing it out
    /// first if its deadline has passed.
    async fn ensure_live(&self, attempt: &AssessmentAttempt, now: DateTime<Utc>) -> CoreResult<()> {
        ensure_in_progress(attempt)?;
        if attempt.is_out_of_time(now) {
            self.expire(attempt.clone(), now).await?;
            return Err(Conflict::AttemptNotInProgress {
                attempt_id: attempt.id.clone(),
                status: AttemptStatus::TimedOut,
            }
            .into());
        }
        Ok(())
    }

    async fn expire(
        &self,
        attempt: AssessmentAttempt,
        now: DateTime<Utc>,
    ) -> CoreResult<AssessmentAttempt> {
        let timed_out = self
            .transition(attempt, AttemptStatus::TimedOut, now)
            .await?;
        self.score(&timed_out).await
    }

    /// Auto-grades the frozen answers, then finalizes when possible. The
    /// `needs_scoring` flag is cleared only after both steps succeed, so a
    /// failure here leaves the attempt for `rescore_pending`.
    async fn score(&self, attempt: &AssessmentAttempt) -> CoreResult<AssessmentAttempt> {
        self.grading.auto_grade_attempt(&attempt.id).await?;
        self.grading.finalize_if_complete(&attempt.id).await?;
        if self
            .stores
            .attempts
            .mark_scored(&attempt.id, self.clock.now())
            .await?
        {
            invalidate_attempt(&self.cache, attempt).await;
        }
        self.load(&attempt.id).await
    }

    async fn transition(
        &self,
        mut attempt: AssessmentAttempt,
        to: AttemptStatus,
        now: DateTime<Utc>,
    ) -> CoreResult<AssessmentAttempt> {
        ensure_in_progress(&attempt)?;

        attempt.status = to;
        attempt.completed_at = Some(now);
        attempt.time_remaining_seconds = if to == AttemptStatus::TimedOut {
            0
        } else {
            attempt
                .seconds_left(now)
                .min(attempt.time_remaining_seconds.max(0))
        };
        attempt.needs_scoring = to.is_scored();
        attempt.updated_at = now;

        if !self
            .stores
            .attempts
            .replace_if_status(&attempt, AttemptStatus::InProgress)
            .await?
        {
            let current = self.load(&attempt.id).await?;
            warn!(
                attempt_id = %attempt.id,
                wanted = %to,
                actual = %current.status,
                "Attempt transition lost a race"
            );
            return Err(Conflict::AttemptNotInProgress {
                attempt_id: current.id,
                status: current.status,
            }
            .into());
        }

        record_transition(to.as_str());
        invalidate_attempt(&self.cache, &attempt).await;
        info!(
            attempt_id = %attempt.id,
            student_id = %attempt.student_id,
            status = %to,
            "Attempt transitioned"
        );
        Ok(attempt)
    }

    async fn write_in_progress(&self, attempt: &AssessmentAttempt) -> CoreResult<()> {
        if !self
            .stores
            .attempts
            .replace_if_status(attempt, AttemptStatus::InProgress)
            .await?
        {
            let current = self.load(&attempt.id).await?;
            return Err(Conflict::AttemptNotInProgress {
                attempt_id: current.id,
                status: current.status,
            }
            .into());
        }
        invalidate_attempt(&self.cache, attempt).await;
        Ok(())
    }

    async fn load(&self, id: &str) -> CoreResult<AssessmentAttempt> {
        self.stores
            .attempts
            .find_by_id(id)
            .await?
            .ok_or_else(|| CoreError::not_found("attempt", id))
    }

    async fn load_assessment(&self, id: &str) -> CoreResult<Assessment> {
        self.stores
            .assessments
            .find_by_id(id)
            .await?
            .ok_or_else(|| CoreError::not_found("assessment", id))
    }
}

fn ensure_in_progress(attempt: &AssessmentAttempt) -> CoreResult<()> {
    if attempt.is_in_progress() {
        Ok(())
    } else {
        Err(Conflict::AttemptNotInProgress {
            attempt_id: attempt.id.clone(),
            status: attempt.status,
        }
        .into())
    }
}
