mod pipeline;
mod worker;

pub use pipeline::{IngestSummary, IngestionPipeline, PipelineConfig, RawMeasurement};
