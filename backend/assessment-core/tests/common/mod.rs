#![allow(dead_code)]

use assessment_core::{
    cache::{CacheHelper, CacheStore, MemoryCacheStore},
    config::{AttemptSettings, CacheSettings},
    models::{
        AddQuestionRequest, Assessment, AssessmentStatus, Caller, CreateAssessmentRequest,
        Question, QuestionType,
    },
    store::{InMemoryStore, Stores},
    utils::time::{Clock, ManualClock},
    AssessmentCore,
};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};

pub struct TestCore {
    pub core: AssessmentCore,
    pub store: Arc<InMemoryStore>,
    pub cache_store: Arc<MemoryCacheStore>,
    pub clock: Arc<ManualClock>,
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
}

pub fn teacher() -> Caller {
    Caller::teacher("teacher-1")
}

pub fn student(id: &str) -> Caller {
    Caller::student(id)
}

/// Core over in-process stores with a manual clock and a live in-memory cache.
pub async fn create_test_core() -> TestCore {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();

    let store = Arc::new(InMemoryStore::new());
    let cache_store = Arc::new(MemoryCacheStore::new());
    let clock = Arc::new(ManualClock::new(start_time()));

    let dyn_cache: Arc<dyn CacheStore> = cache_store.clone();
    let cache = Arc::new(CacheHelper::new(Some(dyn_cache), CacheSettings::default()));
    let dyn_clock: Arc<dyn Clock> = clock.clone();

    let core = AssessmentCore::new(
        Stores::from_backend(store.clone()),
        cache,
        dyn_clock,
        AttemptSettings::default(),
    );

    seed_question_bank(&store).await;

    TestCore {
        core,
        store,
        cache_store,
        clock,
    }
}

async fn seed_question_bank(store: &InMemoryStore) {
    let bank: Vec<(&str, QuestionType, i32, Option<Value>)> = vec![
        ("q-capital", QuestionType::SingleChoice, 10, Some(json!("Paris"))),
        ("q-earth-round", QuestionType::TrueFalse, 5, Some(json!(true))),
        ("q-primes", QuestionType::MultipleChoice, 10, Some(json!(["2", "3"]))),
        ("q-water", QuestionType::ShortAnswer, 5, Some(json!(["H2O", "water"]))),
        ("q-essay", QuestionType::Essay, 20, None),
    ];
    for (id, question_type, points, correct_answer) in bank {
        store
            .insert_question(Question {
                id: id.to_string(),
                title: format!("Question {}", id),
                question_type,
                points,
                correct_answer,
            })
            .await;
    }
    for i in 1..=5 {
        store
            .insert_question(Question {
                id: format!("q-extra-{}", i),
                title: format!("Extra {}", i),
                question_type: QuestionType::SingleChoice,
                points: 10,
                correct_answer: Some(json!("A")),
            })
            .await;
    }
}

impl TestCore {
    /// Draft assessment owned by [`teacher`] with the given questions, then activated.
    pub async fn active_assessment(
        &self,
        max_attempts: u32,
        duration_minutes: i64,
        question_ids: &[&str],
    ) -> Assessment {
        let assessment = self.draft_assessment(max_attempts, duration_minutes).await;
        for id in question_ids {
            self.core
                .questions
                .add_question(
                    &teacher(),
                    &assessment.id,
                    AddQuestionRequest {
                        question_id: id.to_string(),
                        order: 0,
                        points: None,
                        required: true,
                    },
                )
                .await
                .expect("add question");
        }
        self.core
            .assessments
            .set_status(&teacher(), &assessment.id, AssessmentStatus::Active)
            .await
            .expect("activate assessment")
    }

    pub async fn draft_assessment(&self, max_attempts: u32, duration_minutes: i64) -> Assessment {
        self.core
            .assessments
            .create(
                &teacher(),
                CreateAssessmentRequest {
                    title: "Unit quiz".to_string(),
                    description: None,
                    duration_minutes,
                    max_attempts,
                    passing_score: 60.0,
                    due_date: None,
                },
            )
            .await
            .expect("create assessment")
    }

    pub fn advance(&self, by: chrono::Duration) {
        self.clock.advance(by);
    }

    /// Waits until the background populator has written `key`.
    pub async fn wait_for_cached(&self, key: &str) {
        for _ in 0..100 {
            if self.cache_store.keys().await.iter().any(|k| k == key) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("cache key {} was never populated", key);
    }
}
