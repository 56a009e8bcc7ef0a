use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mongodb::{
    bson::{doc, Bson, Document},
    error::{
        ErrorKind, WriteFailure, TRANSIENT_TRANSACTION_ERROR, UNKNOWN_TRANSACTION_COMMIT_RESULT,
    },
    options::{IndexOptions, ReturnDocument},
    Client, ClientSession, Collection, Database, IndexModel,
};
use uuid::Uuid;

use super::{
    AnswerRepository, AssessmentQuestionRepository, AssessmentRepository, AttemptRepository,
    QuestionRepository, ShareFn,
};
use crate::error::{Conflict, CoreError, CoreResult};
use crate::metrics::track_db_operation;
use crate::models::{
    AnswerDraft, Assessment, AssessmentAttempt, AssessmentFilter, AssessmentQuestion,
    AttemptFilter, AttemptStatus, GradeStamp, Page, Question, StudentAnswer,
};
use crate::utils::retry::{retry_async_when, RetryConfig};
use crate::utils::time::to_stored;

const ASSESSMENTS: &str = "assessments";
const QUESTIONS: &str = "questions";
const ASSESSMENT_QUESTIONS: &str = "assessment_questions";
const ATTEMPTS: &str = "assessment_attempts";
const ANSWERS: &str = "student_answers";

const DUPLICATE_KEY: i32 = 11000;

/// MongoDB system of record. Multi-document changes run in transactions,
/// which need a replica set.
#[derive(Clone)]
pub struct MongoStore {
    client: Client,
    db: Database,
}

impl MongoStore {
    pub fn new(client: Client, database: &str) -> Self {
        let db = client.database(database);
        Self { client, db }
    }

    pub async fn connect(uri: &str, database: &str) -> anyhow::Result<Self> {
        tracing::info!("Connecting to MongoDB...");
        let client = Client::with_uri_str(uri)
            .await
            .context("Failed to create MongoDB client")?;

        tokio::time::timeout(
            std::time::Duration::from_secs(10),
            client.database(database).run_command(doc! { "ping": 1 }),
        )
        .await
        .map_err(|_| anyhow::anyhow!("MongoDB ping timeout after 10s"))?
        .context("MongoDB ping failed")?;

        tracing::info!("MongoDB connection established successfully");
        Ok(Self::new(client, database))
    }

    /// Creates the indexes the services rely on, including the unique partial
    /// index that allows one in-progress attempt per student.
    pub async fn ensure_indexes(&self) -> anyhow::Result<()> {
        self.attempts()
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "student_id": 1 })
                    .options(
                        IndexOptions::builder()
                            .name("uniq_in_progress_per_student".to_string())
                            .unique(true)
                            .partial_filter_expression(
                                doc! { "status": AttemptStatus::InProgress.as_str() },
                            )
                            .build(),
                    )
                    .build(),
            )
            .await
            .context("Failed to create in-progress attempt index")?;

        self.attempts()
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "assessment_id": 1, "student_id": 1 })
                    .build(),
            )
            .await
            .context("Failed to create attempt lookup index")?;

        self.attempts()
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "status": 1, "deadline_at": 1 })
                    .build(),
            )
            .await
            .context("Failed to create attempt deadline index")?;

        self.attempts()
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "completed_at": 1 })
                    .options(
                        IndexOptions::builder()
                            .name("pending_scoring".to_string())
                            .partial_filter_expression(doc! { "needs_scoring": true })
                            .build(),
                    )
                    .build(),
            )
            .await
            .context("Failed to create pending scoring index")?;

        self.assessment_questions()
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "assessment_id": 1, "question_id": 1 })
                    .options(IndexOptions::builder().unique(true).build())
                    .build(),
            )
            .await
            .context("Failed to create assessment question index")?;

        self.answers()
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "attempt_id": 1, "question_id": 1 })
                    .options(IndexOptions::builder().unique(true).build())
                    .build(),
            )
            .await
            .context("Failed to create student answer index")?;

        self.assessments()
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "creator_id": 1, "created_at": -1 })
                    .build(),
            )
            .await
            .context("Failed to create assessment creator index")?;

        tracing::info!("MongoDB indexes ensured");
        Ok(())
    }

    fn assessments(&self) -> Collection<Assessment> {
        self.db.collection(ASSESSMENTS)
    }

    fn questions(&self) -> Collection<Question> {
        self.db.collection(QUESTIONS)
    }

    fn assessment_questions(&self) -> Collection<AssessmentQuestion> {
        self.db.collection(ASSESSMENT_QUESTIONS)
    }

    fn attempts(&self) -> Collection<AssessmentAttempt> {
        self.db.collection(ATTEMPTS)
    }

    fn answers(&self) -> Collection<StudentAnswer> {
        self.db.collection(ANSWERS)
    }

    async fn begin(&self) -> CoreResult<ClientSession> {
        let mut session = self
            .client
            .start_session()
            .await
            .context("Failed to start MongoDB session")?;
        session
            .start_transaction()
            .await
            .context("Failed to start transaction")?;
        Ok(session)
    }

    /// Commits on success, aborts on failure.
    async fn finish<T>(&self, mut session: ClientSession, result: CoreResult<T>) -> CoreResult<T> {
        match result {
            Ok(value) => {
                session
                    .commit_transaction()
                    .await
                    .context("Failed to commit transaction")?;
                Ok(value)
            }
            Err(e) => {
                if let Err(abort) = session.abort_transaction().await {
                    tracing::warn!(error = %abort, "Failed to abort transaction");
                }
                Err(e)
            }
        }
    }

    async fn ordered_rows_in(
        &self,
        session: &mut ClientSession,
        assessment_id: &str,
    ) -> CoreResult<Vec<AssessmentQuestion>> {
        let mut cursor = self
            .assessment_questions()
            .find(doc! { "assessment_id": assessment_id })
            .sort(doc! { "order": 1, "_id": 1 })
            .session(&mut *session)
            .await
            .context("Failed to load assessment questions")?;

        let mut rows = Vec::new();
        while let Some(row) = cursor.next(&mut *session).await {
            rows.push(row.context("Failed to decode assessment question")?);
        }
        Ok(rows)
    }

    async fn max_order_in(
        &self,
        session: &mut ClientSession,
        assessment_id: &str,
    ) -> CoreResult<i32> {
        let last = self
            .assessment_questions()
            .find_one(doc! { "assessment_id": assessment_id })
            .sort(doc! { "order": -1 })
            .session(&mut *session)
            .await
            .context("Failed to load last question order")?;
        Ok(last.map(|r| r.order).unwrap_or(0))
    }

    async fn insert_at_once(&self, row: &AssessmentQuestion) -> CoreResult<AssessmentQuestion> {
        let mut session = self.begin().await?;
        let result: CoreResult<_> = async {
            let mut row = row.clone();
            let next = self.max_order_in(&mut session, &row.assessment_id).await? + 1;
            if row.order <= 0 || row.order > next {
                row.order = next;
            } else {
                self.assessment_questions()
                    .update_many(
                        doc! { "assessment_id": &row.assessment_id, "order": { "$gte": row.order } },
                        doc! { "$inc": { "order": 1 } },
                    )
                    .session(&mut session)
                    .await
                    .context("Failed to shift question order")?;
            }

            match self
                .assessment_questions()
                .insert_one(&row)
                .session(&mut session)
                .await
            {
                Ok(_) => Ok(row),
                Err(e) if is_duplicate_key(&e) => Err(Conflict::DuplicateQuestion {
                    assessment_id: row.assessment_id.clone(),
                    question_id: row.question_id.clone(),
                }
                .into()),
                Err(e) => Err(CoreError::from(
                    anyhow::Error::new(e).context("Failed to insert assessment question"),
                )),
            }
        }
        .await;
        self.finish(session, result).await
    }

    async fn remove_and_renumber_once(
        &self,
        assessment_id: &str,
        question_ids: &[String],
    ) -> CoreResult<u64> {
        let mut session = self.begin().await?;
        let result: CoreResult<_> = async {
            let deleted = self
                .assessment_questions()
                .delete_many(doc! {
                    "assessment_id": assessment_id,
                    "question_id": { "$in": question_ids },
                })
                .session(&mut session)
                .await
                .context("Failed to remove assessment questions")?;

            let rows = self.ordered_rows_in(&mut session, assessment_id).await?;
            for (index, row) in rows.iter().enumerate() {
                let order = index as i32 + 1;
                if row.order != order {
                    self.assessment_questions()
                        .update_one(doc! { "_id": &row.id }, doc! { "$set": { "order": order } })
                        .session(&mut session)
                        .await
                        .context("Failed to renumber assessment question")?;
                }
            }
            Ok(deleted.deleted_count)
        }
        .await;
        self.finish(session, result).await
    }

    async fn apply_order_once(
        &self,
        assessment_id: &str,
        question_ids: &[String],
    ) -> CoreResult<()> {
        let mut session = self.begin().await?;
        let result: CoreResult<_> = async {
            for (index, question_id) in question_ids.iter().enumerate() {
                self.assessment_questions()
                    .update_one(
                        doc! { "assessment_id": assessment_id, "question_id": question_id },
                        doc! { "$set": { "order": index as i32 + 1 } },
                    )
                    .session(&mut session)
                    .await
                    .context("Failed to reorder assessment question")?;
            }
            Ok(())
        }
        .await;
        self.finish(session, result).await
    }

    async fn append_and_rebalance_once(
        &self,
        assessment_id: &str,
        rows: &[AssessmentQuestion],
        shares: ShareFn,
    ) -> CoreResult<Vec<AssessmentQuestion>> {
        let mut session = self.begin().await?;
        let result: CoreResult<_> = async {
            let attempts = self
                .attempts()
                .count_documents(doc! { "assessment_id": assessment_id })
                .session(&mut session)
                .await
                .context("Failed to count assessment attempts")?;
            if attempts > 0 {
                return Err(Conflict::AssessmentLocked {
                    assessment_id: assessment_id.to_string(),
                    attempts,
                }
                .into());
            }

            let mut next = self.max_order_in(&mut session, assessment_id).await?;
            let mut fresh = Vec::with_capacity(rows.len());
            for row in rows {
                next += 1;
                fresh.push(AssessmentQuestion {
                    order: next,
                    ..row.clone()
                });
            }

            if !fresh.is_empty() {
                if let Err(e) = self
                    .assessment_questions()
                    .insert_many(&fresh)
                    .session(&mut session)
                    .await
                {
                    if is_duplicate_key(&e) {
                        return Err(Conflict::DuplicateQuestion {
                            assessment_id: assessment_id.to_string(),
                            question_id: fresh
                                .iter()
                                .map(|r| r.question_id.as_str())
                                .collect::<Vec<_>>()
                                .join(","),
                        }
                        .into());
                    }
                    return Err(anyhow::Error::new(e)
                        .context("Failed to insert assessment questions")
                        .into());
                }
            }

            let mut ordered = self.ordered_rows_in(&mut session, assessment_id).await?;
            let points = shares(ordered.len());
            for (row, share) in ordered.iter_mut().zip(points) {
                self.assessment_questions()
                    .update_one(doc! { "_id": &row.id }, doc! { "$set": { "points": share } })
                    .session(&mut session)
                    .await
                    .context("Failed to rebalance question points")?;
                row.points = Some(share);
            }
            Ok(ordered)
        }
        .await;
        self.finish(session, result).await
    }

    async fn grade_many_once(
        &self,
        grades: &[(String, GradeStamp)],
    ) -> CoreResult<Vec<StudentAnswer>> {
        let mut session = self.begin().await?;
        let result: CoreResult<_> = async {
            let mut graded = Vec::with_capacity(grades.len());
            for (id, stamp) in grades {
                let updated = self
                    .answers()
                    .find_one_and_update(doc! { "_id": id }, grade_update(stamp))
                    .return_document(ReturnDocument::After)
                    .session(&mut session)
                    .await
                    .context("Failed to grade answer")?;
                match updated {
                    Some(answer) => graded.push(answer),
                    None => return Err(CoreError::not_found("answer", id.clone())),
                }
            }
            Ok(graded)
        }
        .await;
        self.finish(session, result).await
    }

    async fn delete_with_questions_once(&self, id: &str) -> CoreResult<bool> {
        let mut session = self.begin().await?;
        let result: CoreResult<_> = async {
            let deleted = self
                .assessments()
                .delete_one(doc! { "_id": id })
                .session(&mut session)
                .await
                .context("Failed to delete assessment")?;
            self.assessment_questions()
                .delete_many(doc! { "assessment_id": id })
                .session(&mut session)
                .await
                .context("Failed to delete assessment questions")?;
            Ok(deleted.deleted_count > 0)
        }
        .await;
        self.finish(session, result).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn page<T>(
        &self,
        collection: &Collection<T>,
        name: &'static str,
        filter: Document,
        sort: Document,
        skip: u64,
        page: u32,
        per_page: u32,
    ) -> CoreResult<Page<T>>
    where
        T: serde::de::DeserializeOwned + Send + Sync + Unpin,
    {
        let total = track_db_operation("count", name, async {
            collection.count_documents(filter.clone()).await
        })
        .await
        .with_context(|| format!("Failed to count {name}"))?;

        let items = track_db_operation("find", name, async {
            use futures::TryStreamExt;
            collection
                .find(filter)
                .sort(sort)
                .skip(skip)
                .limit(per_page as i64)
                .await?
                .try_collect::<Vec<T>>()
                .await
        })
        .await
        .with_context(|| format!("Failed to list {name}"))?;

        Ok(Page {
            items,
            total,
            page,
            per_page,
        })
    }
}

/// Retries a whole transaction when the server marks the failure transient.
fn is_transient(err: &CoreError) -> bool {
    match err {
        CoreError::Internal(e) => e
            .downcast_ref::<mongodb::error::Error>()
            .is_some_and(|m| {
                m.contains_label(TRANSIENT_TRANSACTION_ERROR)
                    || m.contains_label(UNKNOWN_TRANSACTION_COMMIT_RESULT)
            }),
        _ => false,
    }
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(we)) => we.code == DUPLICATE_KEY,
        ErrorKind::InsertMany(e) => e
            .write_errors
            .as_ref()
            .is_some_and(|errs| errs.iter().any(|w| w.code == DUPLICATE_KEY)),
        ErrorKind::Command(c) => c.code == DUPLICATE_KEY,
        _ => false,
    }
}

fn grade_update(stamp: &GradeStamp) -> Document {
    doc! {
        "$set": {
            "score": stamp.score,
            "is_correct": stamp.is_correct.map(Bson::Boolean).unwrap_or(Bson::Null),
            "feedback": stamp.feedback.clone().map(Bson::String).unwrap_or(Bson::Null),
            "graded_by": stamp.graded_by.clone().map(Bson::String).unwrap_or(Bson::Null),
            "graded_at": to_stored(stamp.graded_at),
        }
    }
}

#[async_trait]
impl AssessmentRepository for MongoStore {
    async fn create(&self, assessment: &Assessment) -> CoreResult<()> {
        track_db_operation("insert_one", ASSESSMENTS, async {
            self.assessments().insert_one(assessment).await
        })
        .await
        .context("Failed to insert assessment")?;
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> CoreResult<Option<Assessment>> {
        let found = track_db_operation("find_one", ASSESSMENTS, async {
            self.assessments().find_one(doc! { "_id": id }).await
        })
        .await
        .context("Failed to query assessment")?;
        Ok(found)
    }

    async fn update(&self, assessment: &Assessment) -> CoreResult<bool> {
        let result = track_db_operation("replace_one", ASSESSMENTS, async {
            self.assessments()
                .replace_one(doc! { "_id": &assessment.id }, assessment)
                .await
        })
        .await
        .context("Failed to update assessment")?;
        Ok(result.matched_count > 0)
    }

    async fn delete_with_questions(&self, id: &str) -> CoreResult<bool> {
        retry_async_when(
            RetryConfig::transactional(),
            || self.delete_with_questions_once(id),
            is_transient,
        )
        .await
    }

    async fn list(&self, filter: &AssessmentFilter) -> CoreResult<Page<Assessment>> {
        let mut query = doc! { "creator_id": &filter.creator_id };
        if let Some(status) = filter.status {
            query.insert("status", status.as_str());
        }
        let mut sort = Document::new();
        sort.insert(filter.sort_by.column(), filter.sort_order.direction());
        sort.insert("_id", 1);
        self.page(
            &self.assessments(),
            ASSESSMENTS,
            query,
            sort,
            filter.skip(),
            filter.page,
            filter.per_page,
        )
        .await
    }
}

#[async_trait]
impl QuestionRepository for MongoStore {
    async fn find_by_id(&self, id: &str) -> CoreResult<Option<Question>> {
        let found = track_db_operation("find_one", QUESTIONS, async {
            self.questions().find_one(doc! { "_id": id }).await
        })
        .await
        .context("Failed to query question")?;
        Ok(found)
    }

    async fn find_many(&self, ids: &[String]) -> CoreResult<Vec<Question>> {
        use futures::TryStreamExt;
        let found = track_db_operation("find", QUESTIONS, async {
            self.questions()
                .find(doc! { "_id": { "$in": ids } })
                .await?
                .try_collect::<Vec<_>>()
                .await
        })
        .await
        .context("Failed to query questions")?;
        Ok(found)
    }
}

#[async_trait]
impl AssessmentQuestionRepository for MongoStore {
    async fn list(&self, assessment_id: &str) -> CoreResult<Vec<AssessmentQuestion>> {
        use futures::TryStreamExt;
        let rows = track_db_operation("find", ASSESSMENT_QUESTIONS, async {
            self.assessment_questions()
                .find(doc! { "assessment_id": assessment_id })
                .sort(doc! { "order": 1, "_id": 1 })
                .await?
                .try_collect::<Vec<_>>()
                .await
        })
        .await
        .context("Failed to list assessment questions")?;
        Ok(rows)
    }

    async fn find(
        &self,
        assessment_id: &str,
        question_id: &str,
    ) -> CoreResult<Option<AssessmentQuestion>> {
        let found = track_db_operation("find_one", ASSESSMENT_QUESTIONS, async {
            self.assessment_questions()
                .find_one(doc! { "assessment_id": assessment_id, "question_id": question_id })
                .await
        })
        .await
        .context("Failed to query assessment question")?;
        Ok(found)
    }

    async fn count(&self, assessment_id: &str) -> CoreResult<u64> {
        let count = track_db_operation("count", ASSESSMENT_QUESTIONS, async {
            self.assessment_questions()
                .count_documents(doc! { "assessment_id": assessment_id })
                .await
        })
        .await
        .context("Failed to count assessment questions")?;
        Ok(count)
    }

    async fn insert_at(&self, row: AssessmentQuestion) -> CoreResult<AssessmentQuestion> {
        retry_async_when(
            RetryConfig::transactional(),
            || self.insert_at_once(&row),
            is_transient,
        )
        .await
    }

    async fn remove_and_renumber(
        &self,
        assessment_id: &str,
        question_ids: &[String],
    ) -> CoreResult<u64> {
        retry_async_when(
            RetryConfig::transactional(),
            || self.remove_and_renumber_once(assessment_id, question_ids),
            is_transient,
        )
        .await
    }

    async fn apply_order(&self, assessment_id: &str, question_ids: &[String]) -> CoreResult<()> {
        retry_async_when(
            RetryConfig::transactional(),
            || self.apply_order_once(assessment_id, question_ids),
            is_transient,
        )
        .await
    }

    async fn append_and_rebalance(
        &self,
        assessment_id: &str,
        rows: Vec<AssessmentQuestion>,
        shares: ShareFn,
    ) -> CoreResult<Vec<AssessmentQuestion>> {
        retry_async_when(
            RetryConfig::transactional(),
            || self.append_and_rebalance_once(assessment_id, &rows, shares),
            is_transient,
        )
        .await
    }
}

#[async_trait]
impl AttemptRepository for MongoStore {
    async fn insert(&self, attempt: &AssessmentAttempt) -> CoreResult<()> {
        let result = track_db_operation("insert_one", ATTEMPTS, async {
            self.attempts().insert_one(attempt).await
        })
        .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_duplicate_key(&e) => Err(Conflict::AttemptAlreadyActive {
                student_id: attempt.student_id.clone(),
            }
            .into()),
            Err(e) => Err(anyhow::Error::new(e)
                .context("Failed to insert attempt")
                .into()),
        }
    }

    async fn find_by_id(&self, id: &str) -> CoreResult<Option<AssessmentAttempt>> {
        let found = track_db_operation("find_one", ATTEMPTS, async {
            self.attempts().find_one(doc! { "_id": id }).await
        })
        .await
        .context("Failed to query attempt")?;
        Ok(found)
    }

    async fn replace_if_status(
        &self,
        attempt: &AssessmentAttempt,
        expected: AttemptStatus,
    ) -> CoreResult<bool> {
        let result = track_db_operation("replace_one", ATTEMPTS, async {
            self.attempts()
                .replace_one(
                    doc! { "_id": &attempt.id, "status": expected.as_str() },
                    attempt,
                )
                .await
        })
        .await
        .context("Failed to update attempt")?;
        Ok(result.matched_count > 0)
    }

    async fn increment_answered(&self, id: &str, now: DateTime<Utc>) -> CoreResult<bool> {
        let result = track_db_operation("update_one", ATTEMPTS, async {
            self.attempts()
                .update_one(
                    doc! {
                        "_id": id,
                        "status": AttemptStatus::InProgress.as_str(),
                        "$expr": { "$lt": ["$questions_answered", "$total_questions"] },
                    },
                    doc! {
                        "$inc": { "questions_answered": 1 },
                        "$set": { "updated_at": to_stored(now) },
                    },
                )
                .await
        })
        .await
        .context("Failed to record answered question")?;
        Ok(result.modified_count > 0)
    }

    async fn finalize_score(
        &self,
        id: &str,
        score: f64,
        percentage: f64,
        passed: bool,
        now: DateTime<Utc>,
    ) -> CoreResult<bool> {
        let result = track_db_operation("update_one", ATTEMPTS, async {
            self.attempts()
                .update_one(
                    doc! {
                        "_id": id,
                        "finalized_at": Bson::Null,
                        "status": {
                            "$in": [
                                AttemptStatus::Completed.as_str(),
                                AttemptStatus::TimedOut.as_str(),
                            ]
                        },
                    },
                    doc! {
                        "$set": {
                            "score": score,
                            "percentage": percentage,
                            "passed": passed,
                            "finalized_at": to_stored(now),
                            "updated_at": to_stored(now),
                        }
                    },
                )
                .await
        })
        .await
        .context("Failed to finalize attempt score")?;
        Ok(result.modified_count > 0)
    }

    async fn reopen_scoring(&self, id: &str, now: DateTime<Utc>) -> CoreResult<bool> {
        let result = track_db_operation("update_one", ATTEMPTS, async {
            self.attempts()
                .update_one(
                    doc! { "_id": id, "finalized_at": { "$ne": Bson::Null } },
                    doc! { "$set": { "finalized_at": Bson::Null, "updated_at": to_stored(now) } },
                )
                .await
        })
        .await
        .context("Failed to reopen attempt scoring")?;
        Ok(result.modified_count > 0)
    }

    async fn count_finished_for_student_assessment(
        &self,
        assessment_id: &str,
        student_id: &str,
    ) -> CoreResult<u64> {
        let count = track_db_operation("count", ATTEMPTS, async {
            self.attempts()
                .count_documents(doc! {
                    "assessment_id": assessment_id,
                    "student_id": student_id,
                    "status": { "$ne": AttemptStatus::InProgress.as_str() },
                })
                .await
        })
        .await
        .context("Failed to count student attempts")?;
        Ok(count)
    }

    async fn count_in_progress_for_student(&self, student_id: &str) -> CoreResult<u64> {
        let count = track_db_operation("count", ATTEMPTS, async {
            self.attempts()
                .count_documents(doc! {
                    "student_id": student_id,
                    "status": AttemptStatus::InProgress.as_str(),
                })
                .await
        })
        .await
        .context("Failed to count in-progress attempts")?;
        Ok(count)
    }

    async fn count_for_assessment(&self, assessment_id: &str) -> CoreResult<u64> {
        let count = track_db_operation("count", ATTEMPTS, async {
            self.attempts()
                .count_documents(doc! { "assessment_id": assessment_id })
                .await
        })
        .await
        .context("Failed to count assessment attempts")?;
        Ok(count)
    }

    async fn find_timed_out(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> CoreResult<Vec<AssessmentAttempt>> {
        use futures::TryStreamExt;
        // Deadlines are fixed-width RFC 3339 strings, so string order is time order.
        let filter = doc! {
            "status": AttemptStatus::InProgress.as_str(),
            "$or": [
                { "deadline_at": { "$lte": to_stored(now) } },
                { "time_remaining_seconds": { "$lte": 0 } },
            ],
        };
        let due = track_db_operation("find", ATTEMPTS, async {
            self.attempts()
                .find(filter)
                .sort(doc! { "deadline_at": 1 })
                .limit(limit as i64)
                .await?
                .try_collect::<Vec<_>>()
                .await
        })
        .await
        .context("Failed to query timed out attempts")?;
        Ok(due)
    }

    async fn mark_scored(&self, id: &str, now: DateTime<Utc>) -> CoreResult<bool> {
        let result = track_db_operation("update_one", ATTEMPTS, async {
            self.attempts()
                .update_one(
                    doc! { "_id": id, "needs_scoring": true },
                    doc! { "$set": { "needs_scoring": false, "updated_at": to_stored(now) } },
                )
                .await
        })
        .await
        .context("Failed to mark attempt scored")?;
        Ok(result.modified_count > 0)
    }

    async fn find_needing_scoring(&self, limit: usize) -> CoreResult<Vec<AssessmentAttempt>> {
        use futures::TryStreamExt;
        let filter = doc! {
            "needs_scoring": true,
            "status": {
                "$in": [
                    AttemptStatus::Completed.as_str(),
                    AttemptStatus::TimedOut.as_str(),
                ]
            },
        };
        let pending = track_db_operation("find", ATTEMPTS, async {
            self.attempts()
                .find(filter)
                .sort(doc! { "completed_at": 1 })
                .limit(limit as i64)
                .await?
                .try_collect::<Vec<_>>()
                .await
        })
        .await
        .context("Failed to query attempts awaiting scoring")?;
        Ok(pending)
    }

    async fn list(&self, filter: &AttemptFilter) -> CoreResult<Page<AssessmentAttempt>> {
        let mut query = Document::new();
        if let Some(assessment_id) = &filter.assessment_id {
            query.insert("assessment_id", assessment_id);
        }
        if let Some(student_id) = &filter.student_id {
            query.insert("student_id", student_id);
        }
        if let Some(status) = filter.status {
            query.insert("status", status.as_str());
        }
        let mut sort = Document::new();
        sort.insert(filter.sort_by.column(), filter.sort_order.direction());
        sort.insert("_id", 1);
        self.page(
            &self.attempts(),
            ATTEMPTS,
            query,
            sort,
            filter.skip(),
            filter.page,
            filter.per_page,
        )
        .await
    }

    async fn list_for_assessment(
        &self,
        assessment_id: &str,
    ) -> CoreResult<Vec<AssessmentAttempt>> {
        use futures::TryStreamExt;
        let attempts = track_db_operation("find", ATTEMPTS, async {
            self.attempts()
                .find(doc! { "assessment_id": assessment_id })
                .await?
                .try_collect::<Vec<_>>()
                .await
        })
        .await
        .context("Failed to list assessment attempts")?;
        Ok(attempts)
    }
}

#[async_trait]
impl AnswerRepository for MongoStore {
    async fn upsert(
        &self,
        draft: AnswerDraft,
        now: DateTime<Utc>,
    ) -> CoreResult<(StudentAnswer, bool)> {
        let fresh_id = Uuid::new_v4().to_string();
        let filter = doc! { "attempt_id": &draft.attempt_id, "question_id": &draft.question_id };
        let payload = mongodb::bson::to_bson(&draft.payload).context("Failed to encode answer")?;
        // Rewriting the payload drops any grade given for the previous one.
        let update = doc! {
            "$set": {
                "payload": payload,
                "is_flagged": draft.is_flagged,
                "answered_at": to_stored(now),
                "score": Bson::Null,
                "is_correct": Bson::Null,
                "feedback": Bson::Null,
                "graded_by": Bson::Null,
                "graded_at": Bson::Null,
            },
            "$inc": { "time_spent_seconds": draft.time_spent_seconds },
            "$setOnInsert": { "_id": &fresh_id },
        };

        // Two racing first writes can both attempt the insert; the loser
        // retries as an update against the winner's document.
        let stored = retry_async_when(
            RetryConfig::transactional(),
            || {
                let filter = filter.clone();
                let update = update.clone();
                async move {
                    track_db_operation("find_one_and_update", ANSWERS, async {
                        self.answers()
                            .find_one_and_update(filter, update)
                            .upsert(true)
                            .return_document(ReturnDocument::After)
                            .await
                    })
                    .await
                }
            },
            is_duplicate_key,
        )
        .await
        .context("Failed to upsert answer")?
        .ok_or_else(|| anyhow::anyhow!("Upsert returned no document"))?;

        let created = stored.id == fresh_id;
        Ok((stored, created))
    }

    async fn find_by_id(&self, id: &str) -> CoreResult<Option<StudentAnswer>> {
        let found = track_db_operation("find_one", ANSWERS, async {
            self.answers().find_one(doc! { "_id": id }).await
        })
        .await
        .context("Failed to query answer")?;
        Ok(found)
    }

    async fn find_many(&self, ids: &[String]) -> CoreResult<Vec<StudentAnswer>> {
        use futures::TryStreamExt;
        let found = track_db_operation("find", ANSWERS, async {
            self.answers()
                .find(doc! { "_id": { "$in": ids } })
                .await?
                .try_collect::<Vec<_>>()
                .await
        })
        .await
        .context("Failed to query answers")?;
        Ok(found)
    }

    async fn find_by_attempt(&self, attempt_id: &str) -> CoreResult<Vec<StudentAnswer>> {
        use futures::TryStreamExt;
        let found = track_db_operation("find", ANSWERS, async {
            self.answers()
                .find(doc! { "attempt_id": attempt_id })
                .sort(doc! { "answered_at": 1, "_id": 1 })
                .await?
                .try_collect::<Vec<_>>()
                .await
        })
        .await
        .context("Failed to list attempt answers")?;
        Ok(found)
    }

    async fn grade(&self, id: &str, grade: &GradeStamp) -> CoreResult<Option<StudentAnswer>> {
        let updated = track_db_operation("find_one_and_update", ANSWERS, async {
            self.answers()
                .find_one_and_update(doc! { "_id": id }, grade_update(grade))
                .return_document(ReturnDocument::After)
                .await
        })
        .await
        .context("Failed to grade answer")?;
        Ok(updated)
    }

    async fn grade_many(&self, grades: &[(String, GradeStamp)]) -> CoreResult<Vec<StudentAnswer>> {
        retry_async_when(
            RetryConfig::transactional(),
            || self.grade_many_once(grades),
            is_transient,
        )
        .await
    }

    async fn count_ungraded(&self, attempt_id: &str) -> CoreResult<u64> {
        let count = track_db_operation("count", ANSWERS, async {
            self.answers()
                .count_documents(doc! { "attempt_id": attempt_id, "graded_at": Bson::Null })
                .await
        })
        .await
        .context("Failed to count ungraded answers")?;
        Ok(count)
    }
}
