pub mod instruments;
pub mod observability;
pub mod persistence;
pub mod repositories;
pub mod sentiment;

pub use instruments::StaticInstrumentRegistry;
pub use repositories::InMemorySnapshotRepository;
pub use sentiment::VaderSentimentScorer;
