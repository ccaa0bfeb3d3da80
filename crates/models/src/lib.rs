pub mod market;
pub mod symbols;
pub mod topic;
pub mod error;

pub use market::*;
pub use symbols::*;
pub use topic::*;
pub use error::*;
