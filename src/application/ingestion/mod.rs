pub mod normalizer;
pub mod pipeline;

pub use normalizer::{NormalizerConfig, SignalNormalizer};
pub use pipeline::{IngestOutcome, IngestionPipeline, TriggerSink};
