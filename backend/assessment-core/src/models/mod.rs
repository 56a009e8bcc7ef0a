pub mod answer;
pub mod assessment;
pub mod attempt;
pub mod caller;
pub mod filter;

pub use answer::{
    AnswerDraft, BulkGradeItem, GradeAnswerRequest, GradeStamp, StudentAnswer,
    SubmitAnswerRequest,
};
pub use assessment::{
    AddQuestionRequest, Assessment, AssessmentDetails, AssessmentQuestion, AssessmentStats,
    AssessmentStatus, CreateAssessmentRequest, Question, QuestionType, UpdateAssessmentRequest,
};
pub use attempt::{
    AssessmentAttempt, AttemptProgress, AttemptSession, AttemptStatus, ExtendTimeRequest,
    SweepReport,
};
pub use caller::{Caller, Role};
pub use filter::{
    AssessmentFilter, AssessmentSortField, AttemptFilter, AttemptSortField, Page, SortOrder,
};
