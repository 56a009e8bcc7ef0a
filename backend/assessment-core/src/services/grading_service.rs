use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info};
use validator::Validate;

use super::auto_grader;
use super::invalidation::{invalidate_answers, invalidate_attempt};
use super::policy::{ensure_assessment_owner, ensure_attempt_reader};
use crate::cache::{CacheHelper, CacheTtl};
use crate::error::{Conflict, CoreError, CoreResult};
use crate::metrics::ANSWERS_GRADED_TOTAL;
use crate::models::attempt::round2;
use crate::models::{
    AnswerDraft, Assessment, AssessmentAttempt, BulkGradeItem, Caller, GradeAnswerRequest,
    GradeStamp, StudentAnswer,
};
use crate::store::Stores;
use crate::utils::time::Clock;

/// Answer upserts, manual and automatic grading, and score finalization.
pub struct GradingService {
    stores: Stores,
    cache: Arc<CacheHelper>,
    clock: Arc<dyn Clock>,
}

impl GradingService {
    pub fn new(stores: Stores, cache: Arc<CacheHelper>, clock: Arc<dyn Clock>) -> Self {
        Self {
            stores,
            cache,
            clock,
        }
    }

    /// Creates or updates the (attempt, question) answer in place.
    ///
    /// Does not look at the attempt's status; callers only reach this while
    /// the attempt is in progress. Returns whether the answer is new.
    pub async fn upsert_answer(&self, draft: AnswerDraft) -> CoreResult<(StudentAnswer, bool)> {
        let attempt_id = draft.attempt_id.clone();
        let (answer, created) = self.stores.answers.upsert(draft, self.clock.now()).await?;
        invalidate_answers(&self.cache, &attempt_id).await;
        debug!(
            attempt_id = %attempt_id,
            question_id = %answer.question_id,
            created,
            "Answer saved"
        );
        Ok((answer, created))
    }

    /// Manually grades one answer as `caller`.
    ///
    /// Re-sending the stored grade is a no-op. Any other change on a
    /// finalized attempt is rejected; use [`GradingService::regrade`].
    pub async fn grade(
        &self,
        caller: &Caller,
        answer_id: &str,
        req: GradeAnswerRequest,
    ) -> CoreResult<StudentAnswer> {
        req.validate()?;
        let answer = self.load_answer(answer_id).await?;
        let attempt = self.load_attempt(&answer.attempt_id).await?;
        let assessment = self.load_assessment(&attempt.assessment_id).await?;
        ensure_assessment_owner(caller, &assessment)?;

        let stamp = GradeStamp::new(
            req.score,
            req.is_correct,
            req.feedback,
            &caller.user_id,
            self.clock.now(),
        );
        if answer.has_same_grade(&stamp) {
            return Ok(answer);
        }
        if attempt.is_finalized() {
            return Err(Conflict::AlreadyFinalized {
                attempt_id: attempt.id,
            }
            .into());
        }
        self.check_score_bound(&assessment, &answer, stamp.score)
            .await?;

        let graded = self.write_grade(&answer.id, &stamp, "manual").await?;
        invalidate_attempt(&self.cache, &attempt).await;
        self.finalize_if_complete(&attempt.id).await?;
        Ok(graded)
    }

    /// Grades a batch in one all-or-nothing write. An empty batch succeeds.
    pub async fn bulk_grade(
        &self,
        caller: &Caller,
        items: Vec<BulkGradeItem>,
    ) -> CoreResult<Vec<StudentAnswer>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        for item in &items {
            item.validate()?;
        }

        let ids: Vec<String> = items.iter().map(|i| i.answer_id.clone()).collect();
        let answers: HashMap<String, StudentAnswer> = self
            .stores
            .answers
            .find_many(&ids)
            .await?
            .into_iter()
            .map(|a| (a.id.clone(), a))
            .collect();
        if let Some(missing) = ids.iter().find(|id| !answers.contains_key(*id)) {
            return Err(CoreError::not_found("answer", missing.clone()));
        }

        let attempt_ids: BTreeSet<String> =
            answers.values().map(|a| a.attempt_id.clone()).collect();
        let mut attempts = Vec::with_capacity(attempt_ids.len());
        let mut assessments: HashMap<String, Assessment> = HashMap::new();
        for attempt_id in &attempt_ids {
            let attempt = self.load_attempt(attempt_id).await?;
            if !assessments.contains_key(&attempt.assessment_id) {
                let assessment = self.load_assessment(&attempt.assessment_id).await?;
                ensure_assessment_owner(caller, &assessment)?;
                assessments.insert(assessment.id.clone(), assessment);
            }
            attempts.push(attempt);
        }

        let now = self.clock.now();
        let mut grades = Vec::with_capacity(items.len());
        for item in items {
            let stamp = GradeStamp::new(
                item.score,
                item.is_correct,
                item.feedback,
                &caller.user_id,
                now,
            );
            if let Some(answer) = answers.get(&item.answer_id) {
                let unchanged = answer.has_same_grade(&stamp);
                let finalized = attempts
                    .iter()
                    .find(|a| a.id == answer.attempt_id)
                    .is_some_and(|a| a.is_finalized());
                if finalized && !unchanged {
                    return Err(Conflict::AlreadyFinalized {
                        attempt_id: answer.attempt_id.clone(),
                    }
                    .into());
                }
                if let Some(attempt) = attempts.iter().find(|a| a.id == answer.attempt_id) {
                    if let Some(assessment) = assessments.get(&attempt.assessment_id) {
                        self.check_score_bound(assessment, answer, stamp.score)
                            .await?;
                    }
                }
            }
            grades.push((item.answer_id, stamp));
        }

        let graded = self.stores.answers.grade_many(&grades).await?;
        ANSWERS_GRADED_TOTAL
            .with_label_values(&["manual"])
            .inc_by(graded.len() as u64);

        // One invalidation per distinct attempt, not per answer.
        for attempt in &attempts {
            invalidate_attempt(&self.cache, attempt).await;
        }
        for attempt in &attempts {
            self.finalize_if_complete(&attempt.id).await?;
        }

        info!(
            answers = graded.len(),
            attempts = attempts.len(),
            grader = %caller.user_id,
            "Bulk grading applied"
        );
        Ok(graded)
    }

    /// Grades one objective answer automatically. Returns `None` when the
    /// answer has to wait for a human.
    pub async fn auto_grade(&self, answer_id: &str) -> CoreResult<Option<StudentAnswer>> {
        let answer = self.load_answer(answer_id).await?;
        let attempt = self.load_attempt(&answer.attempt_id).await?;

        let Some(stamp) = self.auto_stamp(&attempt, &answer).await? else {
            return Ok(None);
        };
        if answer.has_same_grade(&stamp) {
            return Ok(Some(answer));
        }
        if attempt.is_finalized() {
            return Err(Conflict::AlreadyFinalized {
                attempt_id: attempt.id,
            }
            .into());
        }

        let graded = self.write_grade(&answer.id, &stamp, "auto").await?;
        invalidate_attempt(&self.cache, &attempt).await;
        Ok(Some(graded))
    }

    /// Auto-grades every still ungraded objective answer of a terminal
    /// attempt in one batch. Returns how many answers were graded.
    pub async fn auto_grade_attempt(&self, attempt_id: &str) -> CoreResult<usize> {
        let attempt = self.load_attempt(attempt_id).await?;
        let answers = self.stores.answers.find_by_attempt(attempt_id).await?;

        let mut grades = Vec::new();
        for answer in answers.iter().filter(|a| !a.is_graded()) {
            if let Some(stamp) = self.auto_stamp(&attempt, answer).await? {
                grades.push((answer.id.clone(), stamp));
            }
        }
        if grades.is_empty() {
            return Ok(0);
        }

        let graded = self.stores.answers.grade_many(&grades).await?;
        ANSWERS_GRADED_TOTAL
            .with_label_values(&["auto"])
            .inc_by(graded.len() as u64);
        invalidate_attempt(&self.cache, &attempt).await;

        debug!(attempt_id, graded = graded.len(), "Auto-graded attempt");
        Ok(graded.len())
    }

    /// True when every answer of the attempt carries a grade. An attempt
    /// without answers counts as fully graded.
    pub async fn is_fully_graded(&self, attempt_id: &str) -> CoreResult<bool> {
        Ok(self.stores.answers.count_ungraded(attempt_id).await? == 0)
    }

    /// Writes score, percentage and pass flag once a terminal attempt is
    /// fully graded. Returns the finalized attempt, or `None` when grading is
    /// still partial or another writer finalized first.
    pub async fn finalize_if_complete(
        &self,
        attempt_id: &str,
    ) -> CoreResult<Option<AssessmentAttempt>> {
        let attempt = self.load_attempt(attempt_id).await?;
        if !attempt.status.is_scored() || attempt.is_finalized() {
            return Ok(None);
        }

        // Read answers after the grading writes committed; the sum and the
        // completeness check come from the same snapshot.
        let answers = self.stores.answers.find_by_attempt(attempt_id).await?;
        if answers.iter().any(|a| !a.is_graded()) {
            return Ok(None);
        }

        let assessment = self.load_assessment(&attempt.assessment_id).await?;
        let score: f64 = answers.iter().filter_map(|a| a.score).sum();
        let percentage = if attempt.total_points > 0.0 {
            round2(score / attempt.total_points * 100.0)
        } else {
            0.0
        };
        let passed = percentage >= assessment.passing_score;

        let now = self.clock.now();
        if !self
            .stores
            .attempts
            .finalize_score(attempt_id, score, percentage, passed, now)
            .await?
        {
            return Ok(None);
        }

        invalidate_attempt(&self.cache, &attempt).await;
        info!(
            attempt_id,
            score, percentage, passed, "Attempt score finalized"
        );
        self.stores.attempts.find_by_id(attempt_id).await
    }

    /// Changes a grade on a possibly finalized attempt and finalizes again.
    pub async fn regrade(
        &self,
        caller: &Caller,
        answer_id: &str,
        req: GradeAnswerRequest,
    ) -> CoreResult<StudentAnswer> {
        req.validate()?;
        let answer = self.load_answer(answer_id).await?;
        let attempt = self.load_attempt(&answer.attempt_id).await?;
        let assessment = self.load_assessment(&attempt.assessment_id).await?;
        ensure_assessment_owner(caller, &assessment)?;

        let stamp = GradeStamp::new(
            req.score,
            req.is_correct,
            req.feedback,
            &caller.user_id,
            self.clock.now(),
        );
        if answer.has_same_grade(&stamp) {
            return Ok(answer);
        }
        self.check_score_bound(&assessment, &answer, stamp.score)
            .await?;

        if attempt.is_finalized() {
            self.stores
                .attempts
                .reopen_scoring(&attempt.id, self.clock.now())
                .await?;
        }
        let graded = self.write_grade(&answer.id, &stamp, "manual").await?;
        invalidate_attempt(&self.cache, &attempt).await;
        self.finalize_if_complete(&attempt.id).await?;

        info!(
            answer_id,
            attempt_id = %attempt.id,
            grader = %caller.user_id,
            "Answer re-graded"
        );
        Ok(graded)
    }

    /// Answers of the attempt still waiting for a manual grade.
    pub async fn pending_answers(
        &self,
        caller: &Caller,
        attempt_id: &str,
    ) -> CoreResult<Vec<StudentAnswer>> {
        let attempt = self.load_attempt(attempt_id).await?;
        let assessment = self.load_assessment(&attempt.assessment_id).await?;
        ensure_assessment_owner(caller, &assessment)?;

        Ok(self
            .stores
            .answers
            .find_by_attempt(attempt_id)
            .await?
            .into_iter()
            .filter(|a| !a.is_graded())
            .collect())
    }

    /// Every answer of the attempt, cached.
    pub async fn list_answers(
        &self,
        caller: &Caller,
        attempt_id: &str,
    ) -> CoreResult<Vec<StudentAnswer>> {
        let attempt = self.load_attempt(attempt_id).await?;
        ensure_attempt_reader(caller, &attempt)?;

        let key = self.cache.keys().attempt_answers(attempt_id);
        self.cache
            .cache_or_execute(&key, CacheTtl::Fast, || {
                self.stores.answers.find_by_attempt(attempt_id)
            })
            .await
    }

    async fn write_grade(
        &self,
        answer_id: &str,
        stamp: &GradeStamp,
        mode: &str,
    ) -> CoreResult<StudentAnswer> {
        let graded = self
            .stores
            .answers
            .grade(answer_id, stamp)
            .await?
            .ok_or_else(|| CoreError::not_found("answer", answer_id))?;
        ANSWERS_GRADED_TOTAL.with_label_values(&[mode]).inc();
        Ok(graded)
    }

    async fn auto_stamp(
        &self,
        attempt: &AssessmentAttempt,
        answer: &StudentAnswer,
    ) -> CoreResult<Option<GradeStamp>> {
        let Some(question) = self
            .stores
            .questions
            .find_by_id(&answer.question_id)
            .await?
        else {
            return Ok(None);
        };
        let points = self
            .stores
            .assessment_questions
            .find(&attempt.assessment_id, &answer.question_id)
            .await?
            .map(|row| row.effective_points(&question))
            .unwrap_or(question.points);

        Ok(
            auto_grader::evaluate(&question, &answer.payload, points).map(|grade| {
                GradeStamp::new(
                    grade.score,
                    Some(grade.is_correct),
                    None,
                    "",
                    self.clock.now(),
                )
            }),
        )
    }

    /// A manual score may not exceed the question's points on the assessment.
    async fn check_score_bound(
        &self,
        assessment: &Assessment,
        answer: &StudentAnswer,
        score: f64,
    ) -> CoreResult<()> {
        let Some(question) = self
            .stores
            .questions
            .find_by_id(&answer.question_id)
            .await?
        else {
            return Ok(());
        };
        let max = self
            .stores
            .assessment_questions
            .find(&assessment.id, &answer.question_id)
            .await?
            .map(|row| row.effective_points(&question))
            .unwrap_or(question.points);

        if score > f64::from(max) {
            return Err(CoreError::invalid(
                "score",
                format!("Score cannot exceed {max} points"),
            ));
        }
        Ok(())
    }

    async fn load_answer(&self, id: &str) -> CoreResult<StudentAnswer> {
        self.stores
            .answers
            .find_by_id(id)
            .await?
            .ok_or_else(|| CoreError::not_found("answer", id))
    }

    async fn load_attempt(&self, id: &str) -> CoreResult<AssessmentAttempt> {
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
