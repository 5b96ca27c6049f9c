pub mod ensemble;
pub mod estimators;
pub mod registry;
pub mod signals;
pub mod training;

pub use ensemble::{EnsembleOutput, ModelArtifact};
pub use registry::{ModelRegistry, PromotionDecision, PromotionEvent};
pub use signals::{SignalClaim, SignalQueue};
pub use training::{TrainingMode, TrainingOrchestrator, TrainingReport};
