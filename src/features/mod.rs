pub mod builder;
pub mod fingerprint;
pub mod indicators;
pub mod params;
pub mod store;

pub use builder::*;
pub use fingerprint::*;
pub use params::*;
pub use store::*;
