//! Repository seams over the system of record.
//!
//! Services only see these traits. `mongo::MongoStore` backs them in
//! production; `memory::InMemoryStore` backs tests and local runs. Both
//! enforce the same uniqueness rules, most importantly at most one
//! `in_progress` attempt per student.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::error::CoreResult;
use crate::models::{
    AnswerDraft, Assessment, AssessmentAttempt, AssessmentFilter, AssessmentQuestion,
    AttemptFilter, AttemptStatus, GradeStamp, Page, Question, StudentAnswer,
};

pub mod memory;
pub mod mongo;

pub use memory::InMemoryStore;
pub use mongo::MongoStore;

/// Computes per-question points for `n` questions, in question order.
pub type ShareFn = fn(usize) -> Vec<i32>;

#[async_trait]
pub trait AssessmentRepository: Send + Sync {
    async fn create(&self, assessment: &Assessment) -> CoreResult<()>;
    async fn find_by_id(&self, id: &str) -> CoreResult<Option<Assessment>>;
    async fn update(&self, assessment: &Assessment) -> CoreResult<bool>;
    /// Removes the assessment and its question rows together.
    async fn delete_with_questions(&self, id: &str) -> CoreResult<bool>;
    async fn list(&self, filter: &AssessmentFilter) -> CoreResult<Page<Assessment>>;
}

/// Read-only view of the external question bank.
#[async_trait]
pub trait QuestionRepository: Send + Sync {
    async fn find_by_id(&self, id: &str) -> CoreResult<Option<Question>>;
    async fn find_many(&self, ids: &[String]) -> CoreResult<Vec<Question>>;
}

#[async_trait]
pub trait AssessmentQuestionRepository: Send + Sync {
    /// Rows ordered by `order`.
    async fn list(&self, assessment_id: &str) -> CoreResult<Vec<AssessmentQuestion>>;
    async fn find(
        &self,
        assessment_id: &str,
        question_id: &str,
    ) -> CoreResult<Option<AssessmentQuestion>>;
    async fn count(&self, assessment_id: &str) -> CoreResult<u64>;
    /// Inserts `row` at `row.order`, shifting rows at or after it down by one.
    /// An order of 0 or past the end appends. Duplicate pairs are a conflict.
    async fn insert_at(&self, row: AssessmentQuestion) -> CoreResult<AssessmentQuestion>;
    /// Deletes matching rows and renumbers the rest to 1..N. Returns rows removed.
    async fn remove_and_renumber(
        &self,
        assessment_id: &str,
        question_ids: &[String],
    ) -> CoreResult<u64>;
    /// Sets `order = index + 1` for each listed question id.
    async fn apply_order(&self, assessment_id: &str, question_ids: &[String]) -> CoreResult<()>;
    /// Appends `rows` after the current last row, then assigns `shares(total)`
    /// to every row in order, as one atomic change. Fails with
    /// `Conflict::AssessmentLocked` when the assessment has any attempt.
    async fn append_and_rebalance(
        &self,
        assessment_id: &str,
        rows: Vec<AssessmentQuestion>,
        shares: ShareFn,
    ) -> CoreResult<Vec<AssessmentQuestion>>;
}

#[async_trait]
pub trait AttemptRepository: Send + Sync {
    /// Fails with `Conflict::AttemptAlreadyActive` if the student already has
    /// an in-progress attempt.
    async fn insert(&self, attempt: &AssessmentAttempt) -> CoreResult<()>;
    async fn find_by_id(&self, id: &str) -> CoreResult<Option<AssessmentAttempt>>;
    /// Replaces the attempt only while its stored status equals `expected`.
    async fn replace_if_status(
        &self,
        attempt: &AssessmentAttempt,
        expected: AttemptStatus,
    ) -> CoreResult<bool>;
    /// Atomically bumps `questions_answered` while in progress and below the total.
    async fn increment_answered(&self, id: &str, now: DateTime<Utc>) -> CoreResult<bool>;
    /// Writes the final score once; false if already finalized or not scorable.
    async fn finalize_score(
        &self,
        id: &str,
        score: f64,
        percentage: f64,
        passed: bool,
        now: DateTime<Utc>,
    ) -> CoreResult<bool>;
    /// Clears finalization so a re-grade can finalize again.
    async fn reopen_scoring(&self, id: &str, now: DateTime<Utc>) -> CoreResult<bool>;
    /// Attempts of the student at the assessment that have left progress.
    async fn count_finished_for_student_assessment(
        &self,
        assessment_id: &str,
        student_id: &str,
    ) -> CoreResult<u64>;
    async fn count_in_progress_for_student(&self, student_id: &str) -> CoreResult<u64>;
    async fn count_for_assessment(&self, assessment_id: &str) -> CoreResult<u64>;
    /// In-progress attempts whose deadline is at or before `now`, or whose
    /// stored remainder is exhausted.
    async fn find_timed_out(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> CoreResult<Vec<AssessmentAttempt>>;
    /// Clears `needs_scoring`; false when it was already clear.
    async fn mark_scored(&self, id: &str, now: DateTime<Utc>) -> CoreResult<bool>;
    /// Scored attempts still flagged `needs_scoring`, oldest completion first.
    async fn find_needing_scoring(&self, limit: usize) -> CoreResult<Vec<AssessmentAttempt>>;
    async fn list(&self, filter: &AttemptFilter) -> CoreResult<Page<AssessmentAttempt>>;
    async fn list_for_assessment(&self, assessment_id: &str)
        -> CoreResult<Vec<AssessmentAttempt>>;
}

#[async_trait]
pub trait AnswerRepository: Send + Sync {
    /// Creates or updates the (attempt, question) answer in place, clearing
    /// any grade on an existing answer.
    /// Returns the stored answer and whether it was newly created.
    async fn upsert(
        &self,
        draft: AnswerDraft,
        now: DateTime<Utc>,
    ) -> CoreResult<(StudentAnswer, bool)>;
    async fn find_by_id(&self, id: &str) -> CoreResult<Option<StudentAnswer>>;
    async fn find_many(&self, ids: &[String]) -> CoreResult<Vec<StudentAnswer>>;
    async fn find_by_attempt(&self, attempt_id: &str) -> CoreResult<Vec<StudentAnswer>>;
    async fn grade(&self, id: &str, grade: &GradeStamp) -> CoreResult<Option<StudentAnswer>>;
    /// Applies every grade or none. Any unknown id fails the whole batch.
    async fn grade_many(&self, grades: &[(String, GradeStamp)]) -> CoreResult<Vec<StudentAnswer>>;
    async fn count_ungraded(&self, attempt_id: &str) -> CoreResult<u64>;
}

/// Repository handles injected into every service.
#[derive(Clone)]
pub struct Stores {
    pub assessments: Arc<dyn AssessmentRepository>,
    pub questions: Arc<dyn QuestionRepository>,
    pub assessment_questions: Arc<dyn AssessmentQuestionRepository>,
    pub attempts: Arc<dyn AttemptRepository>,
    pub answers: Arc<dyn AnswerRepository>,
}

impl Stores {
    /// Uses one backend for every repository.
    pub fn from_backend<S>(backend: Arc<S>) -> Self
    where
        S: AssessmentRepository
            + QuestionRepository
            + AssessmentQuestionRepository
            + AttemptRepository
            + AnswerRepository
            + 'static,
    {
        Self {
            assessments: backend.clone(),
            questions: backend.clone(),
            assessment_questions: backend.clone(),
            attempts: backend.clone(),
            answers: backend,
        }
    }
}
