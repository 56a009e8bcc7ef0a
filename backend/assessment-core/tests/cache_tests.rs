use assessment_core::{
    models::{AttemptStatus, SubmitAnswerRequest, UpdateAssessmentRequest},
    store::AssessmentRepository,
};
use serde_json::json;

mod common;

use common::{create_test_core, student, teacher};

#[tokio::test]
async fn test_reads_fall_through_when_cache_is_down() {
    let t = create_test_core().await;
    let a = t.active_assessment(0, 30, &["q-capital"]).await;
    let s = student("s1");
    let attempt = t.core.attempts.start(&s, &a.id).await.unwrap().attempt;

    t.cache_store.set_available(false);

    let fetched = t.core.attempts.get_by_id(&s, &attempt.id).await.unwrap();
    assert_eq!(fetched, attempt);

    let submitted = t.core.attempts.submit(&s, &attempt.id).await.unwrap();
    assert_eq!(submitted.status, AttemptStatus::Completed);

    let fetched = t.core.attempts.get_by_id(&s, &attempt.id).await.unwrap();
    assert_eq!(fetched.status, AttemptStatus::Completed);
    assert_eq!(t.core.questions.get_total_points(&a.id).await.unwrap(), 10);
}

#[tokio::test]
async fn test_transition_is_visible_on_next_read() {
    let t = create_test_core().await;
    let a = t.active_assessment(0, 30, &["q-capital"]).await;
    let s = student("s1");
    let attempt = t.core.attempts.start(&s, &a.id).await.unwrap().attempt;

    let key = t.core.cache.keys().attempt(&attempt.id);
    t.core.attempts.get_by_id(&s, &attempt.id).await.unwrap();
    t.wait_for_cached(&key).await;

    t.core.attempts.submit(&s, &attempt.id).await.unwrap();

    let fetched = t.core.attempts.get_by_id(&s, &attempt.id).await.unwrap();
    assert_eq!(fetched.status, AttemptStatus::Completed);
    assert!(fetched.is_finalized());
}

#[tokio::test]
async fn test_cached_assessment_is_served_until_invalidated() {
    let t = create_test_core().await;
    let a = t.draft_assessment(0, 30).await;

    let key = t.core.cache.keys().assessment(&a.id);
    t.core.assessments.get_by_id(&a.id).await.unwrap();
    t.wait_for_cached(&key).await;

    // A write that bypasses the service leaves the cached copy in place.
    let mut renamed = a.clone();
    renamed.title = "Renamed behind the cache".to_string();
    AssessmentRepository::update(&*t.store, &renamed).await.unwrap();
    assert_eq!(
        t.core.assessments.get_by_id(&a.id).await.unwrap().title,
        "Unit quiz"
    );

    t.core
        .assessments
        .update(
            &teacher(),
            &a.id,
            UpdateAssessmentRequest {
                title: Some("Final quiz".to_string()),
                ..UpdateAssessmentRequest::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(
        t.core.assessments.get_by_id(&a.id).await.unwrap().title,
        "Final quiz"
    );
}

#[tokio::test]
async fn test_stats_refresh_after_submission() {
    let t = create_test_core().await;
    let a = t.active_assessment(0, 30, &["q-capital"]).await;
    let s = student("s1");
    let attempt = t.core.attempts.start(&s, &a.id).await.unwrap().attempt;

    let key = t.core.cache.keys().assessment_stats(&a.id);
    let before = t.core.assessments.get_stats(&teacher(), &a.id).await.unwrap();
    assert_eq!(before.in_progress, 1);
    t.wait_for_cached(&key).await;

    t.core
        .attempts
        .submit_answer(
            &s,
            &attempt.id,
            SubmitAnswerRequest {
                question_id: "q-capital".to_string(),
                payload: json!("Paris"),
                time_spent_seconds: 12,
                flagged: false,
            },
        )
        .await
        .unwrap();
    t.core.attempts.submit(&s, &attempt.id).await.unwrap();

    let after = t.core.assessments.get_stats(&teacher(), &a.id).await.unwrap();
    assert_eq!(after.in_progress, 0);
    assert_eq!(after.completed, 1);
    assert_eq!(after.average_percentage, Some(100.0));
}

#[tokio::test]
async fn test_question_changes_refresh_total_points() {
    let t = create_test_core().await;
    let a = t.active_assessment(0, 30, &["q-capital"]).await;

    let key = t.core.cache.keys().assessment_total_points(&a.id);
    assert_eq!(t.core.questions.get_total_points(&a.id).await.unwrap(), 10);
    t.wait_for_cached(&key).await;

    t.core
        .questions
        .auto_assign(&teacher(), &a.id, &["q-water".to_string()])
        .await
        .unwrap();
    assert_eq!(t.core.questions.get_total_points(&a.id).await.unwrap(), 100);
}

#[tokio::test]
async fn test_has_attempts_flag_flips_on_first_start() {
    let t = create_test_core().await;
    let a = t.active_assessment(0, 30, &["q-capital"]).await;

    let key = t.core.cache.keys().assessment_has_attempts(&a.id);
    assert!(!t.core.assessments.has_attempts(&a.id).await.unwrap());
    t.wait_for_cached(&key).await;

    t.core.attempts.start(&student("s1"), &a.id).await.unwrap();
    assert!(t.core.assessments.has_attempts(&a.id).await.unwrap());
}

#[tokio::test]
async fn test_write_right_after_a_miss_is_not_overwritten() {
    let t = create_test_core().await;
    let a = t.active_assessment(0, 30, &["q-capital"]).await;
    let s = student("s1");
    let attempt = t.core.attempts.start(&s, &a.id).await.unwrap().attempt;

    // The miss queues a population of the in-progress copy; the submit lands
    // before it runs.
    t.core.attempts.get_by_id(&s, &attempt.id).await.unwrap();
    t.core.attempts.submit(&s, &attempt.id).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let fetched = t.core.attempts.get_by_id(&s, &attempt.id).await.unwrap();
    assert_eq!(fetched.status, AttemptStatus::Completed);
    assert!(fetched.is_finalized());
}

#[tokio::test]
async fn test_progress_right_after_a_miss_is_read_back() {
    let t = create_test_core().await;
    let a = t.active_assessment(0, 30, &["q-capital", "q-water"]).await;
    let s = student("s1");
    let attempt = t.core.attempts.start(&s, &a.id).await.unwrap().attempt;

    t.core.attempts.get_by_id(&s, &attempt.id).await.unwrap();
    t.core
        .attempts
        .update_progress(&s, &attempt.id, 2)
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let progress = t.core.attempts.get_progress(&s, &attempt.id).await.unwrap();
    assert_eq!(progress.current_question_index, 2);
}
