pub mod bounds;
pub mod repository;
pub mod service;

pub use repository::{InsertOutcome, PredictionRepository};
pub use service::{PredictionConfig, PredictionReport, PredictionService};
