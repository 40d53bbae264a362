//! Command implementations behind the `nutri-ingest` binary

pub mod fdc;
pub mod ingest;
pub mod merge;
pub mod migrate;
pub mod reindex;
