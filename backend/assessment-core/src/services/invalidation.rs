//! Cache keys each kind of write must drop.
//!
//! Called right after the store write commits. Failures are swallowed inside
//! `CacheHelper`, so a missed invalidation costs at most one TTL of staleness.

use crate::cache::CacheHelper;
use crate::models::AssessmentAttempt;

/// Attempt state changed: its own entry, the listings it appears in, the
/// assessment's statistics and its "has attempts" flag.
pub async fn invalidate_attempt(cache: &CacheHelper, attempt: &AssessmentAttempt) {
    let keys = cache.keys();
    cache
        .delete(&[
            keys.attempt(&attempt.id),
            keys.attempt_answers(&attempt.id),
            keys.assessment_has_attempts(&attempt.assessment_id),
        ])
        .await;
    cache
        .invalidate_patterns(&[
            keys.student_attempts_pattern(&attempt.student_id),
            keys.assessment_attempts_pattern(&attempt.assessment_id),
            keys.all_attempts_pattern(),
            keys.stats_pattern(&attempt.assessment_id),
        ])
        .await;
}

/// An answer was written; the attempt row itself is untouched.
pub async fn invalidate_answers(cache: &CacheHelper, attempt_id: &str) {
    cache.delete(&[cache.keys().attempt_answers(attempt_id)]).await;
}

/// Assessment fields or its question set changed.
pub async fn invalidate_assessment(cache: &CacheHelper, assessment_id: &str, creator_id: &str) {
    let keys = cache.keys();
    cache
        .delete(&[
            keys.assessment(assessment_id),
            keys.assessment_details(assessment_id),
        ])
        .await;
    cache
        .invalidate_patterns(&[
            keys.assessment_pattern(assessment_id),
            keys.creator_pattern(creator_id),
        ])
        .await;
}

/// The assessment is gone; drop everything derived from it.
pub async fn invalidate_deleted_assessment(
    cache: &CacheHelper,
    assessment_id: &str,
    creator_id: &str,
) {
    invalidate_assessment(cache, assessment_id, creator_id).await;
    let keys = cache.keys();
    cache
        .delete(&[keys.assessment_has_attempts(assessment_id)])
        .await;
    cache
        .invalidate_patterns(&[
            keys.stats_pattern(assessment_id),
            keys.assessment_attempts_pattern(assessment_id),
        ])
        .await;
}
