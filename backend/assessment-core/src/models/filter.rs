use serde::{Deserialize, Serialize};
use validator::Validate;

use super::assessment::AssessmentStatus;
use super::attempt::AttemptStatus;

pub const DEFAULT_PER_PAGE: u32 = 20;
pub const MAX_PER_PAGE: u32 = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        }
    }

    pub fn direction(&self) -> i32 {
        match self {
            SortOrder::Asc => 1,
            SortOrder::Desc => -1,
        }
    }
}

/// Whitelisted sort columns for attempt listings; nothing else reaches a query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptSortField {
    #[default]
    StartedAt,
    CompletedAt,
    Score,
    Percentage,
}

impl AttemptSortField {
    pub fn column(&self) -> &'static str {
        match self {
            AttemptSortField::StartedAt => "started_at",
            AttemptSortField::CompletedAt => "completed_at",
            AttemptSortField::Score => "score",
            AttemptSortField::Percentage => "percentage",
        }
    }
}

/// Whitelisted sort columns for assessment listings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssessmentSortField {
    #[default]
    CreatedAt,
    Title,
    DueDate,
}

impl AssessmentSortField {
    pub fn column(&self) -> &'static str {
        match self {
            AssessmentSortField::CreatedAt => "created_at",
            AssessmentSortField::Title => "title",
            AssessmentSortField::DueDate => "due_date",
        }
    }
}

fn default_page() -> u32 {
    1
}

fn default_per_page() -> u32 {
    DEFAULT_PER_PAGE
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct AttemptFilter {
    pub assessment_id: Option<String>,
    pub student_id: Option<String>,
    pub status: Option<AttemptStatus>,
    #[serde(default)]
    pub sort_by: AttemptSortField,
    #[serde(default)]
    pub sort_order: SortOrder,
    #[serde(default = "default_page")]
    #[validate(range(min = 1, message = "Page starts at 1"))]
    pub page: u32,
    #[serde(default = "default_per_page")]
    #[validate(range(min = 1, max = 100, message = "Per page must be 1-100"))]
    pub per_page: u32,
}

impl Default for AttemptFilter {
    fn default() -> Self {
        Self {
            assessment_id: None,
            student_id: None,
            status: None,
            sort_by: AttemptSortField::default(),
            sort_order: SortOrder::default(),
            page: default_page(),
            per_page: default_per_page(),
        }
    }
}

impl AttemptFilter {
    pub fn for_student(student_id: &str) -> Self {
        Self {
            student_id: Some(student_id.to_string()),
            ..Self::default()
        }
    }

    pub fn for_assessment(assessment_id: &str) -> Self {
        Self {
            assessment_id: Some(assessment_id.to_string()),
            ..Self::default()
        }
    }

    pub fn skip(&self) -> u64 {
        (self.page.saturating_sub(1) as u64) * self.per_page as u64
    }

    /// Stable suffix identifying this filter inside a cache namespace.
    pub fn cache_suffix(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}:{}:{}",
            self.assessment_id.as_deref().unwrap_or("-"),
            self.student_id.as_deref().unwrap_or("-"),
            self.status.map(|s| s.as_str()).unwrap_or("-"),
            self.sort_by.column(),
            self.sort_order.as_str(),
            self.page,
            self.per_page
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct AssessmentFilter {
    #[validate(length(min = 1, message = "Creator id is required"))]
    pub creator_id: String,
    pub status: Option<AssessmentStatus>,
    #[serde(default)]
    pub sort_by: AssessmentSortField,
    #[serde(default)]
    pub sort_order: SortOrder,
    #[serde(default = "default_page")]
    #[validate(range(min = 1, message = "Page starts at 1"))]
    pub page: u32,
    #[serde(default = "default_per_page")]
    #[validate(range(min = 1, max = 100, message = "Per page must be 1-100"))]
    pub per_page: u32,
}

impl AssessmentFilter {
    pub fn for_creator(creator_id: &str) -> Self {
        Self {
            creator_id: creator_id.to_string(),
            status: None,
            sort_by: AssessmentSortField::default(),
            sort_order: SortOrder::default(),
            page: default_page(),
            per_page: default_per_page(),
        }
    }

    pub fn skip(&self) -> u64 {
        (self.page.saturating_sub(1) as u64) * self.per_page as u64
    }

    pub fn cache_suffix(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            self.status.map(|s| s.as_str()).unwrap_or("-"),
            self.sort_by.column(),
            self.sort_order.as_str(),
            self.page,
            self.per_page
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
}
