//! Key grouping: from delivered records to one-record-per-key form.

mod bucket;
mod engine;

pub use bucket::{CombinerEntry, CombinerTable, ReducerTable, Unique, ValueSet};
pub use engine::{GroupEngine, GroupStats};
