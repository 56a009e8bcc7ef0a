use assessment_core::{
    models::{AddQuestionRequest, AssessmentQuestion},
    store::AssessmentQuestionRepository,
    Conflict, CoreError,
};

mod common;

use common::{create_test_core, student, teacher, TestCore};

fn add(question_id: &str, order: i32, points: Option<i32>) -> AddQuestionRequest {
    AddQuestionRequest {
        question_id: question_id.to_string(),
        order,
        points,
        required: true,
    }
}

async fn rows(t: &TestCore, assessment_id: &str) -> Vec<AssessmentQuestion> {
    AssessmentQuestionRepository::list(&*t.store, assessment_id)
        .await
        .unwrap()
}

fn layout(rows: &[AssessmentQuestion]) -> Vec<(String, i32)> {
    rows.iter()
        .map(|r| (r.question_id.clone(), r.order))
        .collect()
}

fn ids(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

#[tokio::test]
async fn test_add_question_appends_or_inserts() {
    let t = create_test_core().await;
    let a = t.draft_assessment(0, 30).await;

    for id in ["q-capital", "q-water"] {
        t.core
            .questions
            .add_question(&teacher(), &a.id, add(id, 0, None))
            .await
            .unwrap();
    }
    let inserted = t
        .core
        .questions
        .add_question(&teacher(), &a.id, add("q-essay", 1, Some(15)))
        .await
        .unwrap();
    assert_eq!(inserted.order, 1);

    assert_eq!(
        layout(&rows(&t, &a.id).await),
        vec![
            ("q-essay".to_string(), 1),
            ("q-capital".to_string(), 2),
            ("q-water".to_string(), 3),
        ]
    );

    // Past the end appends.
    let tail = t
        .core
        .questions
        .add_question(&teacher(), &a.id, add("q-primes", 42, None))
        .await
        .unwrap();
    assert_eq!(tail.order, 4);

    // 15 (override) + 10 + 5 + 10
    assert_eq!(t.core.questions.get_total_points(&a.id).await.unwrap(), 40);
}

#[tokio::test]
async fn test_add_question_rejections() {
    let t = create_test_core().await;
    let a = t.draft_assessment(0, 30).await;
    t.core
        .questions
        .add_question(&teacher(), &a.id, add("q-capital", 0, None))
        .await
        .unwrap();

    let err = t
        .core
        .questions
        .add_question(&teacher(), &a.id, add("q-capital", 0, None))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CoreError::Conflict(Conflict::DuplicateQuestion { .. })
    ));

    let err = t
        .core
        .questions
        .add_question(&teacher(), &a.id, add("q-missing", 0, None))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::NotFound { entity: "question", .. }));

    let err = t
        .core
        .questions
        .add_question(&student("s1"), &a.id, add("q-water", 0, None))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Forbidden(_)));

    assert_eq!(rows(&t, &a.id).await.len(), 1);
}

#[tokio::test]
async fn test_remove_questions_renumbers_densely() {
    let t = create_test_core().await;
    let a = t
        .active_assessment(
            0,
            30,
            &["q-capital", "q-earth-round", "q-primes", "q-water", "q-essay"],
        )
        .await;

    let removed = t
        .core
        .questions
        .remove_questions(&teacher(), &a.id, &ids(&["q-earth-round", "q-water", "q-unknown"]))
        .await
        .unwrap();
    assert_eq!(removed, 2);

    assert_eq!(
        layout(&rows(&t, &a.id).await),
        vec![
            ("q-capital".to_string(), 1),
            ("q-primes".to_string(), 2),
            ("q-essay".to_string(), 3),
        ]
    );

    let none = t
        .core
        .questions
        .remove_questions(&teacher(), &a.id, &[])
        .await
        .unwrap();
    assert_eq!(none, 0);
}

#[tokio::test]
async fn test_reorder_applies_given_sequence() {
    let t = create_test_core().await;
    let a = t
        .active_assessment(0, 30, &["q-capital", "q-water", "q-essay"])
        .await;

    let reordered = t
        .core
        .questions
        .reorder(&teacher(), &a.id, &ids(&["q-essay", "q-capital", "q-water"]))
        .await
        .unwrap();
    assert_eq!(
        layout(&reordered),
        vec![
            ("q-essay".to_string(), 1),
            ("q-capital".to_string(), 2),
            ("q-water".to_string(), 3),
        ]
    );

    let err = t
        .core
        .questions
        .reorder(&teacher(), &a.id, &ids(&["q-essay", "q-essay", "q-water"]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "validation");

    let err = t
        .core
        .questions
        .reorder(&teacher(), &a.id, &ids(&["q-essay", "q-primes"]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "not_found");

    assert_eq!(layout(&rows(&t, &a.id).await), layout(&reordered));
}

#[tokio::test]
async fn test_auto_assign_rebalances_all_questions() {
    let t = create_test_core().await;
    let a = t.draft_assessment(0, 30).await;
    for (id, points) in [("q-capital", 50), ("q-earth-round", 30), ("q-primes", 20)] {
        t.core
            .questions
            .add_question(&teacher(), &a.id, add(id, 0, Some(points)))
            .await
            .unwrap();
    }

    let all = t
        .core
        .questions
        .auto_assign(&teacher(), &a.id, &ids(&["q-extra-1", "q-extra-2"]))
        .await
        .unwrap();

    assert_eq!(all.len(), 5);
    assert_eq!(
        all.iter().map(|r| r.points).collect::<Vec<_>>(),
        vec![Some(20); 5]
    );
    assert_eq!(
        all.iter().map(|r| r.order).collect::<Vec<_>>(),
        vec![1, 2, 3, 4, 5]
    );
    assert_eq!(t.core.questions.get_total_points(&a.id).await.unwrap(), 100);
}

#[tokio::test]
async fn test_auto_assign_skips_assigned_and_spreads_remainder() {
    let t = create_test_core().await;
    let a = t.draft_assessment(0, 30).await;
    t.core
        .questions
        .add_question(&teacher(), &a.id, add("q-capital", 0, None))
        .await
        .unwrap();

    let all = t
        .core
        .questions
        .auto_assign(
            &teacher(),
            &a.id,
            &ids(&["q-capital", "q-extra-1", "q-extra-2", "q-extra-1"]),
        )
        .await
        .unwrap();

    assert_eq!(all.len(), 3);
    assert_eq!(
        all.iter().map(|r| r.points.unwrap()).collect::<Vec<_>>(),
        vec![34, 33, 33]
    );
    assert_eq!(all.iter().filter_map(|r| r.points).sum::<i32>(), 100);
}

#[tokio::test]
async fn test_auto_assign_rejected_once_attempted() {
    let t = create_test_core().await;
    let a = t.active_assessment(0, 30, &["q-capital", "q-water"]).await;
    t.core.attempts.start(&student("s1"), &a.id).await.unwrap();
    let before = rows(&t, &a.id).await;

    let err = t
        .core
        .questions
        .auto_assign(&teacher(), &a.id, &ids(&["q-extra-1"]))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CoreError::Conflict(Conflict::AssessmentLocked { attempts: 1, .. })
    ));

    assert_eq!(rows(&t, &a.id).await, before);
}

#[tokio::test]
async fn test_auto_assign_unknown_question_mutates_nothing() {
    let t = create_test_core().await;
    let a = t.draft_assessment(0, 30).await;
    t.core
        .questions
        .add_question(&teacher(), &a.id, add("q-capital", 0, Some(50)))
        .await
        .unwrap();
    let before = rows(&t, &a.id).await;

    let err = t
        .core
        .questions
        .auto_assign(&teacher(), &a.id, &ids(&["q-extra-1", "q-nowhere"]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "not_found");
    assert_eq!(rows(&t, &a.id).await, before);
}
