pub mod error;
pub mod format;
pub mod merge;
pub mod store;
pub mod value;
