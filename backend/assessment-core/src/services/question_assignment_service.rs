use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;
use validator::Validate;

use super::invalidation::invalidate_assessment;
use super::policy::ensure_assessment_owner;
use crate::cache::{CacheHelper, CacheTtl};
use crate::error::{Conflict, CoreError, CoreResult};
use crate::models::{AddQuestionRequest, Assessment, AssessmentQuestion, Caller};
use crate::store::Stores;
use crate::utils::time::Clock;

/// Splits 100 points over `n` questions in order: every question gets
/// `100 / n`, and the first `100 % n` get one extra point.
pub fn equal_point_shares(n: usize) -> Vec<i32> {
    if n == 0 {
        return Vec::new();
    }
    let n_points = n as i32;
    let base = 100 / n_points;
    let extra = (100 % n_points) as usize;
    (0..n)
        .map(|i| if i < extra { base + 1 } else { base })
        .collect()
}

/// Places bank questions on assessments and keeps their order dense (1..N).
pub struct QuestionAssignmentService {
    stores: Stores,
    cache: Arc<CacheHelper>,
    clock: Arc<dyn Clock>,
}

impl QuestionAssignmentService {
    pub fn new(stores: Stores, cache: Arc<CacheHelper>, clock: Arc<dyn Clock>) -> Self {
        Self {
            stores,
            cache,
            clock,
        }
    }

    /// Adds one question at `req.order`; 0 or past the end appends.
    pub async fn add_question(
        &self,
        caller: &Caller,
        assessment_id: &str,
        req: AddQuestionRequest,
    ) -> CoreResult<AssessmentQuestion> {
        req.validate()?;
        let assessment = self.load_owned(caller, assessment_id).await?;

        if self.stores.questions.find_by_id(&req.question_id).await?.is_none() {
            return Err(CoreError::not_found("question", req.question_id));
        }
        if self
            .stores
            .assessment_questions
            .find(assessment_id, &req.question_id)
            .await?
            .is_some()
        {
            return Err(Conflict::DuplicateQuestion {
                assessment_id: assessment_id.to_string(),
                question_id: req.question_id,
            }
            .into());
        }

        let row = self
            .stores
            .assessment_questions
            .insert_at(new_row(
                assessment_id,
                &req.question_id,
                req.order,
                req.points,
                req.required,
                self.clock.now(),
            ))
            .await?;

        invalidate_assessment(&self.cache, assessment_id, &assessment.creator_id).await;
        info!(
            assessment_id,
            question_id = %row.question_id,
            order = row.order,
            "Question added to assessment"
        );
        Ok(row)
    }

    /// Removes the listed questions and closes the gaps. Ids not on the
    /// assessment are ignored. Returns how many rows were removed.
    pub async fn remove_questions(
        &self,
        caller: &Caller,
        assessment_id: &str,
        question_ids: &[String],
    ) -> CoreResult<u64> {
        let assessment = self.load_owned(caller, assessment_id).await?;
        if question_ids.is_empty() {
            return Ok(0);
        }

        let removed = self
            .stores
            .assessment_questions
            .remove_and_renumber(assessment_id, question_ids)
            .await?;
        if removed > 0 {
            invalidate_assessment(&self.cache, assessment_id, &assessment.creator_id).await;
            info!(assessment_id, removed, "Questions removed from assessment");
        }
        Ok(removed)
    }

    /// Sets `order = position + 1` for each listed question. Questions not
    /// listed keep their previous order.
    pub async fn reorder(
        &self,
        caller: &Caller,
        assessment_id: &str,
        question_ids: &[String],
    ) -> CoreResult<Vec<AssessmentQuestion>> {
        let assessment = self.load_owned(caller, assessment_id).await?;

        let mut seen = HashSet::new();
        if let Some(dup) = question_ids.iter().find(|id| !seen.insert(id.as_str())) {
            return Err(CoreError::invalid(
                "question_ids",
                format!("Question {} is listed more than once", dup),
            ));
        }

        let assigned: HashSet<String> = self
            .stores
            .assessment_questions
            .list(assessment_id)
            .await?
            .into_iter()
            .map(|row| row.question_id)
            .collect();
        if let Some(missing) = question_ids.iter().find(|id| !assigned.contains(*id)) {
            return Err(CoreError::not_found("question", missing.clone()));
        }

        self.stores
            .assessment_questions
            .apply_order(assessment_id, question_ids)
            .await?;
        invalidate_assessment(&self.cache, assessment_id, &assessment.creator_id).await;

        self.stores.assessment_questions.list(assessment_id).await
    }

    /// Appends the given questions and spreads 100 points evenly over the
    /// whole assessment, existing questions included.
    ///
    /// Refused once any attempt exists, since running or finished attempts
    /// snapshot the points. The store checks this in the same write as the
    /// rebalance. Questions already assigned are skipped.
    pub async fn auto_assign(
        &self,
        caller: &Caller,
        assessment_id: &str,
        question_ids: &[String],
    ) -> CoreResult<Vec<AssessmentQuestion>> {
        let assessment = self.load_owned(caller, assessment_id).await?;

        let mut seen = HashSet::new();
        let requested: Vec<String> = question_ids
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .cloned()
            .collect();

        let known: HashSet<String> = self
            .stores
            .questions
            .find_many(&requested)
            .await?
            .into_iter()
            .map(|q| q.id)
            .collect();
        if let Some(missing) = requested.iter().find(|id| !known.contains(*id)) {
            return Err(CoreError::not_found("question", missing.clone()));
        }

        let assigned: HashSet<String> = self
            .stores
            .assessment_questions
            .list(assessment_id)
            .await?
            .into_iter()
            .map(|row| row.question_id)
            .collect();

        let now = self.clock.now();
        let rows: Vec<AssessmentQuestion> = requested
            .iter()
            .filter(|id| !assigned.contains(*id))
            .map(|id| new_row(assessment_id, id, 0, None, true, now))
            .collect();
        let added = rows.len();

        let all = self
            .stores
            .assessment_questions
            .append_and_rebalance(assessment_id, rows, equal_point_shares)
            .await?;

        invalidate_assessment(&self.cache, assessment_id, &assessment.creator_id).await;
        info!(
            assessment_id,
            added,
            total = all.len(),
            "Questions auto-assigned and points rebalanced"
        );
        Ok(all)
    }

    /// Sum of effective points over the assessment's questions.
    pub async fn get_total_points(&self, assessment_id: &str) -> CoreResult<i64> {
        let key = self.cache.keys().assessment_total_points(assessment_id);
        self.cache
            .cache_or_execute(&key, CacheTtl::Question, || {
                self.compute_total_points(assessment_id)
            })
            .await
    }

    pub async fn list_questions(&self, assessment_id: &str) -> CoreResult<Vec<AssessmentQuestion>> {
        let key = self.cache.keys().assessment_questions(assessment_id);
        self.cache
            .cache_or_execute(&key, CacheTtl::Question, || {
                self.stores.assessment_questions.list(assessment_id)
            })
            .await
    }

    async fn compute_total_points(&self, assessment_id: &str) -> CoreResult<i64> {
        let rows = self.stores.assessment_questions.list(assessment_id).await?;
        let ids: Vec<String> = rows.iter().map(|r| r.question_id.clone()).collect();
        let questions: HashMap<String, _> = self
            .stores
            .questions
            .find_many(&ids)
            .await?
            .into_iter()
            .map(|q| (q.id.clone(), q))
            .collect();

        Ok(rows
            .iter()
            .map(|row| match questions.get(&row.question_id) {
                Some(q) => i64::from(row.effective_points(q)),
                None => i64::from(row.points.unwrap_or(0)),
            })
            .sum())
    }

    async fn load_owned(&self, caller: &Caller, assessment_id: &str) -> CoreResult<Assessment> {
        let assessment = self
            .stores
            .assessments
            .find_by_id(assessment_id)
            .await?
            .ok_or_else(|| CoreError::not_found("assessment", assessment_id))?;
        ensure_assessment_owner(caller, &assessment)?;
        Ok(assessment)
    }
}

fn new_row(
    assessment_id: &str,
    question_id: &str,
    order: i32,
    points: Option<i32>,
    required: bool,
    added_at: DateTime<Utc>,
) -> AssessmentQuestion {
    AssessmentQuestion {
        id: Uuid::new_v4().to_string(),
        assessment_id: assessment_id.to_string(),
        question_id: question_id.to_string(),
        order,
        points,
        required,
        added_at,
    }
}
