pub mod settings;
pub mod snapshot;

pub use settings::*;
pub use snapshot::*;
