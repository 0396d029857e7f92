//! The JSON export format: a streaming writer and a streaming parser.

pub mod export;
pub mod import;

pub use export::{EntryFields, JsonOut};
pub use import::import_json;
