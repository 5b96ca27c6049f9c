pub mod bar;
pub mod documents;
pub mod records;

pub use bar::*;
pub use documents::*;
pub use records::*;
