use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    AnswerRepository, AssessmentQuestionRepository, AssessmentRepository, AttemptRepository,
    QuestionRepository, ShareFn,
};
use crate::error::{Conflict, CoreError, CoreResult};
use crate::models::{
    AnswerDraft, Assessment, AssessmentAttempt, AssessmentFilter, AssessmentQuestion,
    AssessmentSortField, AttemptFilter, AttemptSortField, AttemptStatus, GradeStamp, Page,
    Question, SortOrder, StudentAnswer,
};

#[derive(Debug, Default)]
struct Tables {
    assessments: BTreeMap<String, Assessment>,
    questions: BTreeMap<String, Question>,
    assessment_questions: Vec<AssessmentQuestion>,
    attempts: BTreeMap<String, AssessmentAttempt>,
    answers: BTreeMap<String, StudentAnswer>,
}

impl Tables {
    fn rows_for(&self, assessment_id: &str) -> Vec<AssessmentQuestion> {
        let mut rows: Vec<AssessmentQuestion> = self
            .assessment_questions
            .iter()
            .filter(|r| r.assessment_id == assessment_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id)));
        rows
    }

    fn max_order(&self, assessment_id: &str) -> i32 {
        self.assessment_questions
            .iter()
            .filter(|r| r.assessment_id == assessment_id)
            .map(|r| r.order)
            .max()
            .unwrap_or(0)
    }

    fn has_pair(&self, assessment_id: &str, question_id: &str) -> bool {
        self.assessment_questions
            .iter()
            .any(|r| r.assessment_id == assessment_id && r.question_id == question_id)
    }
}

/// In-process system of record. One lock guards every table, so each
/// repository call is atomic; uniqueness rules match the MongoDB indexes.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the question bank, which this crate only reads.
    pub async fn insert_question(&self, question: Question) {
        self.tables
            .write()
            .await
            .questions
            .insert(question.id.clone(), question);
    }
}

fn cmp_option<T: PartialOrd>(a: &Option<T>, b: &Option<T>) -> Ordering {
    // Nulls sort first ascending, as in MongoDB.
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
    }
}

fn paginate<T>(items: Vec<T>, skip: u64, page: u32, per_page: u32) -> Page<T> {
    let total = items.len() as u64;
    let items = items
        .into_iter()
        .skip(skip as usize)
        .take(per_page as usize)
        .collect();
    Page {
        items,
        total,
        page,
        per_page,
    }
}

#[async_trait]
impl AssessmentRepository for InMemoryStore {
    async fn create(&self, assessment: &Assessment) -> CoreResult<()> {
        let mut tables = self.tables.write().await;
        if tables.assessments.contains_key(&assessment.id) {
            return Err(anyhow::anyhow!("assessment {} already exists", assessment.id).into());
        }
        tables
            .assessments
            .insert(assessment.id.clone(), assessment.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> CoreResult<Option<Assessment>> {
        Ok(self.tables.read().await.assessments.get(id).cloned())
    }

    async fn update(&self, assessment: &Assessment) -> CoreResult<bool> {
        let mut tables = self.tables.write().await;
        match tables.assessments.get_mut(&assessment.id) {
            Some(stored) => {
                *stored = assessment.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_with_questions(&self, id: &str) -> CoreResult<bool> {
        let mut tables = self.tables.write().await;
        if tables.assessments.remove(id).is_none() {
            return Ok(false);
        }
        tables.assessment_questions.retain(|r| r.assessment_id != id);
        Ok(true)
    }

    async fn list(&self, filter: &AssessmentFilter) -> CoreResult<Page<Assessment>> {
        let tables = self.tables.read().await;
        let mut items: Vec<Assessment> = tables
            .assessments
            .values()
            .filter(|a| a.creator_id == filter.creator_id)
            .filter(|a| filter.status.is_none_or(|s| a.status == s))
            .cloned()
            .collect();

        items.sort_by(|a, b| {
            let ord = match filter.sort_by {
                AssessmentSortField::CreatedAt => a.created_at.cmp(&b.created_at),
                AssessmentSortField::Title => a.title.cmp(&b.title),
                AssessmentSortField::DueDate => cmp_option(&a.due_date, &b.due_date),
            };
            let ord = match filter.sort_order {
                SortOrder::Asc => ord,
                SortOrder::Desc => ord.reverse(),
            };
            ord.then_with(|| a.id.cmp(&b.id))
        });

        Ok(paginate(items, filter.skip(), filter.page, filter.per_page))
    }
}

#[async_trait]
impl QuestionRepository for InMemoryStore {
    async fn find_by_id(&self, id: &str) -> CoreResult<Option<Question>> {
        Ok(self.tables.read().await.questions.get(id).cloned())
    }

    async fn find_many(&self, ids: &[String]) -> CoreResult<Vec<Question>> {
        let tables = self.tables.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| tables.questions.get(id).cloned())
            .collect())
    }
}

#[async_trait]
impl AssessmentQuestionRepository for InMemoryStore {
    async fn list(&self, assessment_id: &str) -> CoreResult<Vec<AssessmentQuestion>> {
        Ok(self.tables.read().await.rows_for(assessment_id))
    }

    async fn find(
        &self,
        assessment_id: &str,
        question_id: &str,
    ) -> CoreResult<Option<AssessmentQuestion>> {
        let tables = self.tables.read().await;
        Ok(tables
            .assessment_questions
            .iter()
            .find(|r| r.assessment_id == assessment_id && r.question_id == question_id)
            .cloned())
    }

    async fn count(&self, assessment_id: &str) -> CoreResult<u64> {
        let tables = self.tables.read().await;
        Ok(tables
            .assessment_questions
            .iter()
            .filter(|r| r.assessment_id == assessment_id)
            .count() as u64)
    }

    async fn insert_at(&self, mut row: AssessmentQuestion) -> CoreResult<AssessmentQuestion> {
        let mut tables = self.tables.write().await;
        if tables.has_pair(&row.assessment_id, &row.question_id) {
            return Err(Conflict::DuplicateQuestion {
                assessment_id: row.assessment_id,
                question_id: row.question_id,
            }
            .into());
        }

        let next = tables.max_order(&row.assessment_id) + 1;
        if row.order <= 0 || row.order > next {
            row.order = next;
        } else {
            for other in tables
                .assessment_questions
                .iter_mut()
                .filter(|r| r.assessment_id == row.assessment_id && r.order >= row.order)
            {
                other.order += 1;
            }
        }

        tables.assessment_questions.push(row.clone());
        Ok(row)
    }

    async fn remove_and_renumber(
        &self,
        assessment_id: &str,
        question_ids: &[String],
    ) -> CoreResult<u64> {
        let mut tables = self.tables.write().await;
        let before = tables.assessment_questions.len();
        tables.assessment_questions.retain(|r| {
            !(r.assessment_id == assessment_id && question_ids.contains(&r.question_id))
        });
        let removed = (before - tables.assessment_questions.len()) as u64;

        let ordered: Vec<String> = tables
            .rows_for(assessment_id)
            .into_iter()
            .map(|r| r.id)
            .collect();
        for row in tables.assessment_questions.iter_mut() {
            if let Some(pos) = ordered.iter().position(|id| *id == row.id) {
                row.order = pos as i32 + 1;
            }
        }
        Ok(removed)
    }

    async fn apply_order(&self, assessment_id: &str, question_ids: &[String]) -> CoreResult<()> {
        let mut tables = self.tables.write().await;
        for row in tables
            .assessment_questions
            .iter_mut()
            .filter(|r| r.assessment_id == assessment_id)
        {
            if let Some(pos) = question_ids.iter().position(|q| *q == row.question_id) {
                row.order = pos as i32 + 1;
            }
        }
        Ok(())
    }

    async fn append_and_rebalance(
        &self,
        assessment_id: &str,
        rows: Vec<AssessmentQuestion>,
        shares: ShareFn,
    ) -> CoreResult<Vec<AssessmentQuestion>> {
        let mut tables = self.tables.write().await;

        let attempts = tables
            .attempts
            .values()
            .filter(|a| a.assessment_id == assessment_id)
            .count() as u64;
        if attempts > 0 {
            return Err(Conflict::AssessmentLocked {
                assessment_id: assessment_id.to_string(),
                attempts,
            }
            .into());
        }

        let mut seen = HashSet::new();
        for row in &rows {
            if tables.has_pair(assessment_id, &row.question_id)
                || !seen.insert(row.question_id.clone())
            {
                return Err(Conflict::DuplicateQuestion {
                    assessment_id: assessment_id.to_string(),
                    question_id: row.question_id.clone(),
                }
                .into());
            }
        }

        let mut next = tables.max_order(assessment_id);
        for mut row in rows {
            next += 1;
            row.order = next;
            tables.assessment_questions.push(row);
        }

        let ordered = tables.rows_for(assessment_id);
        let points = shares(ordered.len());
        for (row, share) in ordered.iter().zip(points) {
            if let Some(stored) = tables
                .assessment_questions
                .iter_mut()
                .find(|r| r.id == row.id)
            {
                stored.points = Some(share);
            }
        }
        Ok(tables.rows_for(assessment_id))
    }
}

fn attempt_sort_key(
    a: &AssessmentAttempt,
    b: &AssessmentAttempt,
    field: AttemptSortField,
) -> Ordering {
    match field {
        AttemptSortField::StartedAt => a.started_at.cmp(&b.started_at),
        AttemptSortField::CompletedAt => cmp_option(&a.completed_at, &b.completed_at),
        AttemptSortField::Score => cmp_option(&a.score, &b.score),
        AttemptSortField::Percentage => cmp_option(&a.percentage, &b.percentage),
    }
}

#[async_trait]
impl AttemptRepository for InMemoryStore {
    async fn insert(&self, attempt: &AssessmentAttempt) -> CoreResult<()> {
        let mut tables = self.tables.write().await;
        if attempt.status == AttemptStatus::InProgress
            && tables
                .attempts
                .values()
                .any(|a| a.student_id == attempt.student_id && a.is_in_progress())
        {
            return Err(Conflict::AttemptAlreadyActive {
                student_id: attempt.student_id.clone(),
            }
            .into());
        }
        tables.attempts.insert(attempt.id.clone(), attempt.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> CoreResult<Option<AssessmentAttempt>> {
        Ok(self.tables.read().await.attempts.get(id).cloned())
    }

    async fn replace_if_status(
        &self,
        attempt: &AssessmentAttempt,
        expected: AttemptStatus,
    ) -> CoreResult<bool> {
        let mut tables = self.tables.write().await;
        match tables.attempts.get_mut(&attempt.id) {
            Some(stored) if stored.status == expected => {
                *stored = attempt.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn increment_answered(&self, id: &str, now: DateTime<Utc>) -> CoreResult<bool> {
        let mut tables = self.tables.write().await;
        match tables.attempts.get_mut(id) {
            Some(a) if a.is_in_progress() && a.questions_answered < a.total_questions => {
                a.questions_answered += 1;
                a.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finalize_score(
        &self,
        id: &str,
        score: f64,
        percentage: f64,
        passed: bool,
        now: DateTime<Utc>,
    ) -> CoreResult<bool> {
        let mut tables = self.tables.write().await;
        match tables.attempts.get_mut(id) {
            Some(a) if a.status.is_scored() && a.finalized_at.is_none() => {
                a.score = Some(score);
                a.percentage = Some(percentage);
                a.passed = Some(passed);
                a.finalized_at = Some(now);
                a.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reopen_scoring(&self, id: &str, now: DateTime<Utc>) -> CoreResult<bool> {
        let mut tables = self.tables.write().await;
        match tables.attempts.get_mut(id) {
            Some(a) if a.finalized_at.is_some() => {
                a.finalized_at = None;
                a.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn count_finished_for_student_assessment(
        &self,
        assessment_id: &str,
        student_id: &str,
    ) -> CoreResult<u64> {
        let tables = self.tables.read().await;
        Ok(tables
            .attempts
            .values()
            .filter(|a| {
                a.assessment_id == assessment_id
                    && a.student_id == student_id
                    && a.status.is_terminal()
            })
            .count() as u64)
    }

    async fn count_in_progress_for_student(&self, student_id: &str) -> CoreResult<u64> {
        let tables = self.tables.read().await;
        Ok(tables
            .attempts
            .values()
            .filter(|a| a.student_id == student_id && a.is_in_progress())
            .count() as u64)
    }

    async fn count_for_assessment(&self, assessment_id: &str) -> CoreResult<u64> {
        let tables = self.tables.read().await;
        Ok(tables
            .attempts
            .values()
            .filter(|a| a.assessment_id == assessment_id)
            .count() as u64)
    }

    async fn find_timed_out(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> CoreResult<Vec<AssessmentAttempt>> {
        let tables = self.tables.read().await;
        let mut due: Vec<AssessmentAttempt> = tables
            .attempts
            .values()
            .filter(|a| a.is_in_progress() && a.is_out_of_time(now))
            .cloned()
            .collect();
        due.sort_by(|a, b| a.deadline_at.cmp(&b.deadline_at));
        due.truncate(limit);
        Ok(due)
    }

    async fn mark_scored(&self, id: &str, now: DateTime<Utc>) -> CoreResult<bool> {
        let mut tables = self.tables.write().await;
        match tables.attempts.get_mut(id) {
            Some(a) if a.needs_scoring => {
                a.needs_scoring = false;
                a.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_needing_scoring(&self, limit: usize) -> CoreResult<Vec<AssessmentAttempt>> {
        let tables = self.tables.read().await;
        let mut pending: Vec<AssessmentAttempt> = tables
            .attempts
            .values()
            .filter(|a| a.needs_scoring && a.status.is_scored())
            .cloned()
            .collect();
        pending.sort_by(|a, b| cmp_option(&a.completed_at, &b.completed_at));
        pending.truncate(limit);
        Ok(pending)
    }

    async fn list(&self, filter: &AttemptFilter) -> CoreResult<Page<AssessmentAttempt>> {
        let tables = self.tables.read().await;
        let mut items: Vec<AssessmentAttempt> = tables
            .attempts
            .values()
            .filter(|a| {
                filter
                    .assessment_id
                    .as_ref()
                    .is_none_or(|id| a.assessment_id == *id)
            })
            .filter(|a| filter.student_id.as_ref().is_none_or(|id| a.student_id == *id))
            .filter(|a| filter.status.is_none_or(|s| a.status == s))
            .cloned()
            .collect();

        items.sort_by(|a, b| {
            let ord = attempt_sort_key(a, b, filter.sort_by);
            let ord = match filter.sort_order {
                SortOrder::Asc => ord,
                SortOrder::Desc => ord.reverse(),
            };
            ord.then_with(|| a.id.cmp(&b.id))
        });

        Ok(paginate(items, filter.skip(), filter.page, filter.per_page))
    }

    async fn list_for_assessment(
        &self,
        assessment_id: &str,
    ) -> CoreResult<Vec<AssessmentAttempt>> {
        let tables = self.tables.read().await;
        Ok(tables
            .attempts
            .values()
            .filter(|a| a.assessment_id == assessment_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AnswerRepository for InMemoryStore {
    async fn upsert(
        &self,
        draft: AnswerDraft,
        now: DateTime<Utc>,
    ) -> CoreResult<(StudentAnswer, bool)> {
        let mut tables = self.tables.write().await;
        if let Some(existing) = tables
            .answers
            .values_mut()
            .find(|a| a.attempt_id == draft.attempt_id && a.question_id == draft.question_id)
        {
            existing.payload = draft.payload;
            // A grade belongs to the payload it was given for.
            existing.score = None;
            existing.is_correct = None;
            existing.feedback = None;
            existing.graded_by = None;
            existing.graded_at = None;
            existing.time_spent_seconds += draft.time_spent_seconds;
            existing.is_flagged = draft.is_flagged;
            existing.answered_at = now;
            return Ok((existing.clone(), false));
        }

        let answer = StudentAnswer {
            id: Uuid::new_v4().to_string(),
            attempt_id: draft.attempt_id,
            question_id: draft.question_id,
            payload: draft.payload,
            score: None,
            is_correct: None,
            feedback: None,
            graded_by: None,
            graded_at: None,
            is_flagged: draft.is_flagged,
            time_spent_seconds: draft.time_spent_seconds,
            answered_at: now,
        };
        tables.answers.insert(answer.id.clone(), answer.clone());
        Ok((answer, true))
    }

    async fn find_by_id(&self, id: &str) -> CoreResult<Option<StudentAnswer>> {
        Ok(self.tables.read().await.answers.get(id).cloned())
    }

    async fn find_many(&self, ids: &[String]) -> CoreResult<Vec<StudentAnswer>> {
        let tables = self.tables.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| tables.answers.get(id).cloned())
            .collect())
    }

    async fn find_by_attempt(&self, attempt_id: &str) -> CoreResult<Vec<StudentAnswer>> {
        let tables = self.tables.read().await;
        let mut answers: Vec<StudentAnswer> = tables
            .answers
            .values()
            .filter(|a| a.attempt_id == attempt_id)
            .cloned()
            .collect();
        answers.sort_by(|a, b| a.answered_at.cmp(&b.answered_at).then_with(|| a.id.cmp(&b.id)));
        Ok(answers)
    }

    async fn grade(&self, id: &str, grade: &GradeStamp) -> CoreResult<Option<StudentAnswer>> {
        let mut tables = self.tables.write().await;
        Ok(tables.answers.get_mut(id).map(|answer| {
            answer.apply_grade(grade);
            answer.clone()
        }))
    }

    async fn grade_many(&self, grades: &[(String, GradeStamp)]) -> CoreResult<Vec<StudentAnswer>> {
        let mut tables = self.tables.write().await;
        if let Some((missing, _)) = grades
            .iter()
            .find(|(id, _)| !tables.answers.contains_key(id))
        {
            return Err(CoreError::not_found("answer", missing.clone()));
        }

        let mut graded = Vec::with_capacity(grades.len());
        for (id, stamp) in grades {
            if let Some(answer) = tables.answers.get_mut(id) {
                answer.apply_grade(stamp);
                graded.push(answer.clone());
            }
        }
        Ok(graded)
    }

    async fn count_ungraded(&self, attempt_id: &str) -> CoreResult<u64> {
        let tables = self.tables.read().await;
        Ok(tables
            .answers
            .values()
            .filter(|a| a.attempt_id == attempt_id && !a.is_graded())
            .count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn attempt(id: &str, student: &str, status: AttemptStatus) -> AssessmentAttempt {
        let now = Utc::now();
        AssessmentAttempt {
            id: id.into(),
            assessment_id: "a1".into(),
            student_id: student.into(),
            status,
            started_at: now,
            completed_at: None,
            time_remaining_seconds: 600,
            deadline_at: now + Duration::minutes(10),
            duration_minutes: 10,
            extended_minutes: 0,
            current_question_index: 0,
            questions_answered: 0,
            total_questions: 2,
            total_points: 10.0,
            score: None,
            percentage: None,
            passed: None,
            finalized_at: None,
            needs_scoring: false,
            updated_at: now,
        }
    }

    fn row(assessment: &str, question: &str, order: i32) -> AssessmentQuestion {
        AssessmentQuestion {
            id: Uuid::new_v4().to_string(),
            assessment_id: assessment.into(),
            question_id: question.into(),
            order,
            points: None,
            required: false,
            added_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn second_in_progress_attempt_conflicts() {
        let store = InMemoryStore::new();
        store
            .insert(&attempt("at1", "s1", AttemptStatus::InProgress))
            .await
            .unwrap();
        let err = store
            .insert(&attempt("at2", "s1", AttemptStatus::InProgress))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::Conflict(Conflict::AttemptAlreadyActive { .. })
        ));

        store
            .insert(&attempt("at3", "s2", AttemptStatus::InProgress))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn insert_at_shifts_later_rows() {
        let store = InMemoryStore::new();
        store.insert_at(row("a1", "q1", 0)).await.unwrap();
        store.insert_at(row("a1", "q2", 0)).await.unwrap();
        store.insert_at(row("a1", "q3", 1)).await.unwrap();

        let order: Vec<(String, i32)> = AssessmentQuestionRepository::list(&store, "a1")
            .await
            .unwrap()
            .into_iter()
            .map(|r| (r.question_id, r.order))
            .collect();
        assert_eq!(
            order,
            vec![("q3".into(), 1), ("q1".into(), 2), ("q2".into(), 3)]
        );

        let dup = store.insert_at(row("a1", "q1", 0)).await.unwrap_err();
        assert_eq!(dup.kind(), "conflict");
    }

    #[tokio::test]
    async fn rebalance_refused_once_an_attempt_exists() {
        fn tens(n: usize) -> Vec<i32> {
            vec![10; n]
        }

        let store = InMemoryStore::new();
        store.insert_at(row("a1", "q1", 0)).await.unwrap();
        store
            .insert(&attempt("at1", "s1", AttemptStatus::InProgress))
            .await
            .unwrap();

        let err = store
            .append_and_rebalance("a1", vec![row("a1", "q2", 0)], tens)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::Conflict(Conflict::AssessmentLocked { attempts: 1, .. })
        ));

        let rows = AssessmentQuestionRepository::list(&store, "a1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].points, None);

        let other = store
            .append_and_rebalance("a2", vec![row("a2", "q2", 0)], tens)
            .await
            .unwrap();
        assert_eq!(other[0].points, Some(10));
    }

    #[tokio::test]
    async fn scoring_flag_is_cleared_once() {
        let store = InMemoryStore::new();
        let mut done = attempt("at1", "s1", AttemptStatus::Completed);
        done.needs_scoring = true;
        store.insert(&done).await.unwrap();
        let mut abandoned = attempt("at2", "s2", AttemptStatus::Abandoned);
        abandoned.needs_scoring = true;
        store.insert(&abandoned).await.unwrap();

        let pending = store.find_needing_scoring(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "at1");

        let now = Utc::now();
        assert!(store.mark_scored("at1", now).await.unwrap());
        assert!(!store.mark_scored("at1", now).await.unwrap());
        assert!(store.find_needing_scoring(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn increment_is_capped_at_total() {
        let store = InMemoryStore::new();
        store
            .insert(&attempt("at1", "s1", AttemptStatus::InProgress))
            .await
            .unwrap();
        let now = Utc::now();
        assert!(store.increment_answered("at1", now).await.unwrap());
        assert!(store.increment_answered("at1", now).await.unwrap());
        assert!(!store.increment_answered("at1", now).await.unwrap());
        let stored = AttemptRepository::find_by_id(&store, "at1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.questions_answered, 2);
    }

    #[tokio::test]
    async fn upsert_accumulates_time_and_reports_creation() {
        let store = InMemoryStore::new();
        let draft = AnswerDraft {
            attempt_id: "at1".into(),
            question_id: "q1".into(),
            payload: json!("A"),
            time_spent_seconds: 10,
            is_flagged: false,
        };
        let (first, created) = store.upsert(draft.clone(), Utc::now()).await.unwrap();
        assert!(created);

        let (second, created) = store
            .upsert(
                AnswerDraft {
                    payload: json!("B"),
                    time_spent_seconds: 5,
                    is_flagged: true,
                    ..draft
                },
                Utc::now(),
            )
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(second.id, first.id);
        assert_eq!(second.payload, json!("B"));
        assert_eq!(second.time_spent_seconds, 15);
        assert!(second.is_flagged);
    }

    #[tokio::test]
    async fn rewriting_a_graded_answer_clears_the_grade() {
        let store = InMemoryStore::new();
        let draft = AnswerDraft {
            attempt_id: "at1".into(),
            question_id: "q1".into(),
            payload: json!("Paris"),
            time_spent_seconds: 10,
            is_flagged: false,
        };
        let (answer, _) = store.upsert(draft.clone(), Utc::now()).await.unwrap();
        store
            .grade(
                &answer.id,
                &GradeStamp::new(10.0, Some(true), Some("right".into()), "t1", Utc::now()),
            )
            .await
            .unwrap();

        let (rewritten, _) = store
            .upsert(
                AnswerDraft {
                    payload: json!("London"),
                    ..draft
                },
                Utc::now(),
            )
            .await
            .unwrap();
        assert!(!rewritten.is_graded());
        assert_eq!(rewritten.score, None);
        assert_eq!(rewritten.feedback, None);
        assert_eq!(store.count_ungraded("at1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn grade_many_is_all_or_nothing() {
        let store = InMemoryStore::new();
        let (answer, _) = store
            .upsert(
                AnswerDraft {
                    attempt_id: "at1".into(),
                    question_id: "q1".into(),
                    payload: json!("A"),
                    time_spent_seconds: 0,
                    is_flagged: false,
                },
                Utc::now(),
            )
            .await
            .unwrap();

        let stamp = GradeStamp::new(1.0, Some(true), None, "t1", Utc::now());
        let err = store
            .grade_many(&[
                (answer.id.clone(), stamp.clone()),
                ("missing".into(), stamp.clone()),
            ])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
        assert_eq!(store.count_ungraded("at1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn finalize_happens_once() {
        let store = InMemoryStore::new();
        store
            .insert(&attempt("at1", "s1", AttemptStatus::Completed))
            .await
            .unwrap();
        let now = Utc::now();
        assert!(store.finalize_score("at1", 5.0, 50.0, true, now).await.unwrap());
        assert!(!store.finalize_score("at1", 6.0, 60.0, true, now).await.unwrap());
        assert!(store.reopen_scoring("at1", now).await.unwrap());
        assert!(store.finalize_score("at1", 6.0, 60.0, true, now).await.unwrap());
    }
}
