use crate::models::{AssessmentFilter, AttemptFilter};

/// Builds namespaced cache keys and invalidation patterns.
#[derive(Debug, Clone)]
pub struct CacheKeys {
    namespace: String,
}

impl CacheKeys {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    fn key(&self, rest: String) -> String {
        format!("{}:{}", self.namespace, rest)
    }

    pub fn assessment(&self, id: &str) -> String {
        self.key(format!("assessment:id:{id}"))
    }

    pub fn assessment_details(&self, id: &str) -> String {
        self.key(format!("assessment:details:{id}"))
    }

    pub fn assessment_list(&self, filter: &AssessmentFilter) -> String {
        self.key(format!(
            "assessment:creator:{}:{}",
            filter.creator_id,
            filter.cache_suffix()
        ))
    }

    pub fn creator_pattern(&self, creator_id: &str) -> String {
        self.key(format!("assessment:creator:{creator_id}:*"))
    }

    pub fn assessment_questions(&self, id: &str) -> String {
        self.key(format!("assessment:{id}:questions"))
    }

    pub fn assessment_total_points(&self, id: &str) -> String {
        self.key(format!("assessment:{id}:total_points"))
    }

    /// Everything derived from an assessment's question set.
    pub fn assessment_pattern(&self, id: &str) -> String {
        self.key(format!("assessment:{id}:*"))
    }

    pub fn assessment_stats(&self, id: &str) -> String {
        self.key(format!("stats:assessment:{id}:summary"))
    }

    pub fn stats_pattern(&self, assessment_id: &str) -> String {
        self.key(format!("stats:assessment:{assessment_id}:*"))
    }

    pub fn assessment_has_attempts(&self, id: &str) -> String {
        self.key(format!("exists:assessment:{id}:attempts"))
    }

    pub fn attempt(&self, id: &str) -> String {
        self.key(format!("attempt:id:{id}"))
    }

    /// Listing keys live under the student's namespace when the filter names
    /// a student, otherwise under the assessment's.
    pub fn attempt_list(&self, filter: &AttemptFilter) -> String {
        match (&filter.student_id, &filter.assessment_id) {
            (Some(student), _) => self.key(format!(
                "attempt:student:{student}:{}",
                filter.cache_suffix()
            )),
            (None, Some(assessment)) => self.key(format!(
                "attempt:assessment:{assessment}:{}",
                filter.cache_suffix()
            )),
            (None, None) => self.key(format!("attempt:all:{}", filter.cache_suffix())),
        }
    }

    pub fn student_attempts_pattern(&self, student_id: &str) -> String {
        self.key(format!("attempt:student:{student_id}:*"))
    }

    pub fn assessment_attempts_pattern(&self, assessment_id: &str) -> String {
        self.key(format!("attempt:assessment:{assessment_id}:*"))
    }

    pub fn all_attempts_pattern(&self) -> String {
        self.key("attempt:all:*".to_string())
    }

    pub fn attempt_answers(&self, attempt_id: &str) -> String {
        self.key(format!("answer:attempt:{attempt_id}:list"))
    }
}
