use std::sync::Arc;

use crate::cache::{CacheHelper, CacheStore, RedisCacheStore};
use crate::config::{AttemptSettings, Config};
use crate::store::{MongoStore, Stores};
use crate::utils::time::{Clock, SystemClock};

pub mod assessment_service;
pub mod attempt_service;
pub mod auto_grader;
pub mod eligibility;
pub mod grading_service;
pub mod invalidation;
pub mod policy;
pub mod question_assignment_service;

pub use assessment_service::AssessmentService;
pub use attempt_service::AttemptService;
pub use eligibility::{EligibilityDecision, EligibilityGuard};
pub use grading_service::GradingService;
pub use question_assignment_service::{equal_point_shares, QuestionAssignmentService};

/// Every service wired to one set of stores, one cache helper and one clock.
///
/// Built once at startup and shared; the request layer picks the service it
/// needs from here.
pub struct AssessmentCore {
    pub assessments: Arc<AssessmentService>,
    pub questions: Arc<QuestionAssignmentService>,
    pub attempts: Arc<AttemptService>,
    pub grading: Arc<GradingService>,
    pub cache: Arc<CacheHelper>,
}

impl AssessmentCore {
    pub fn new(
        stores: Stores,
        cache: Arc<CacheHelper>,
        clock: Arc<dyn Clock>,
        settings: AttemptSettings,
    ) -> Self {
        let grading = Arc::new(GradingService::new(
            stores.clone(),
            cache.clone(),
            clock.clone(),
        ));
        Self {
            assessments: Arc::new(AssessmentService::new(
                stores.clone(),
                cache.clone(),
                clock.clone(),
            )),
            questions: Arc::new(QuestionAssignmentService::new(
                stores.clone(),
                cache.clone(),
                clock.clone(),
            )),
            attempts: Arc::new(AttemptService::new(
                stores,
                cache.clone(),
                clock,
                grading.clone(),
                settings,
            )),
            grading,
            cache,
        }
    }

    /// Connects MongoDB (indexes included) and Redis from `config`.
    ///
    /// MongoDB is required. Redis is not: if it cannot be reached the core
    /// runs without a cache and every read goes to MongoDB.
    pub async fn connect(config: &Config) -> anyhow::Result<Self> {
        tracing::info!("Connecting to MongoDB...");
        let mongo =
            Arc::new(MongoStore::connect(&config.mongo_uri, &config.mongo_database).await?);
        mongo.ensure_indexes().await?;
        tracing::info!(database = %config.mongo_database, "MongoDB ready");

        let cache_store: Option<Arc<dyn CacheStore>> = if config.cache.enabled {
            match RedisCacheStore::connect(&config.redis_uri, config.cache.operation_timeout()).await
            {
                Ok(store) => {
                    tracing::info!(namespace = %config.cache.namespace, "Cache store ready");
                    Some(Arc::new(store))
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Redis unavailable; running without cache");
                    None
                }
            }
        } else {
            tracing::info!("Cache disabled by configuration");
            None
        };

        let cache = Arc::new(CacheHelper::new(cache_store, config.cache.clone()));
        Ok(Self::new(
            Stores::from_backend(mongo),
            cache,
            Arc::new(SystemClock),
            config.attempts.clone(),
        ))
    }
}
