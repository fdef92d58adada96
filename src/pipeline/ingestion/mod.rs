// Pipeline ingestion: source file selection, column resolution, and parallel reads

pub mod column_resolver;
pub mod coordinator;
pub mod source_reader;

pub use coordinator::{ingest_sources, shutdown_runtime, IngestedSources, IngestionSettings};
pub use source_reader::{SourceSelection, SourceSpec};
