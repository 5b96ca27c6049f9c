pub mod engine;
pub mod repository;
pub mod validator;

pub use engine::{FeedbackEngine, FeedbackReport, ScopeMetrics, ThresholdRecommendation};
pub use repository::{AccuracyRepository, AccuracyTally, FeedbackRepository, ReviewedOutcome};
pub use validator::{ValidationReport, Validator};
